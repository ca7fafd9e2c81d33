//! Wire codec for DeviceLink protocol packets.
//!
//! Wire format: newline-delimited JSON, one self-describing object per line:
//!
//! ```text
//! {"id":1716540000000,"type":"kdeconnect.identity","body":{...}}\n
//! ```
//!
//! - `id` — packet creation time in milliseconds since the Unix epoch.
//! - `type` — namespaced type tag, dispatched on by the packet router.
//! - `body` — a JSON object whose schema depends on `type`.
//! - `payloadSize` / `payloadTransferInfo` — optional side-channel metadata
//!   for packets that announce an out-of-band payload transfer.
//!
//! Everything arriving on the discovery socket or a peer connection is
//! untrusted input, so [`decode`] reports a distinguishable error for every
//! malformed shape instead of panicking.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Identity announcement / handshake packet type.
pub const PACKET_TYPE_IDENTITY: &str = "kdeconnect.identity";
/// Pair request / response packet type.
pub const PACKET_TYPE_PAIR: &str = "kdeconnect.pair";

/// Errors that can occur while decoding a wire packet.
#[derive(Debug, Error)]
pub enum PacketError {
    /// The input was empty or all whitespace.
    #[error("empty packet")]
    Empty,

    /// The input was not valid JSON.
    #[error("packet is not valid JSON: {0}")]
    NotJson(#[source] serde_json::Error),

    /// The input was valid JSON but not an object (array, scalar, null).
    #[error("packet is not a JSON object")]
    NotAnObject,

    /// The `id` field is absent or not an integer.
    #[error("packet is missing a numeric `id` field")]
    MissingId,

    /// The `type` field is absent or not a string.
    #[error("packet is missing a string `type` field")]
    MissingType,

    /// The `body` field is absent or not an object.
    #[error("packet is missing an object `body` field")]
    MissingBody,

    /// The packet could not be serialized (body contains non-serializable data).
    #[error("failed to serialize packet: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// A single wire packet.
///
/// The struct mirrors the JSON envelope one-to-one; `serde` renames map the
/// Rust field names onto the camelCase wire names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkPacket {
    /// Creation timestamp in milliseconds since the Unix epoch.
    pub id: i64,
    /// Namespaced type tag, e.g. `"kdeconnect.identity"`.
    #[serde(rename = "type")]
    pub packet_type: String,
    /// Type-specific payload.
    pub body: Map<String, Value>,
    /// Announced size of an out-of-band payload, if any.
    #[serde(rename = "payloadSize", skip_serializing_if = "Option::is_none")]
    pub payload_size: Option<i64>,
    /// Transport details for an out-of-band payload, if any.
    #[serde(
        rename = "payloadTransferInfo",
        skip_serializing_if = "Option::is_none"
    )]
    pub payload_transfer_info: Option<Value>,
}

impl NetworkPacket {
    /// Creates a packet of the given type, stamping `id` with the current time.
    pub fn new(packet_type: &str, body: Map<String, Value>) -> Self {
        Self {
            id: current_timestamp_ms(),
            packet_type: packet_type.to_string(),
            body,
            payload_size: None,
            payload_transfer_info: None,
        }
    }

    /// Returns `true` if this packet carries the given type tag.
    pub fn is_type(&self, packet_type: &str) -> bool {
        self.packet_type == packet_type
    }

    /// Reads a string field out of the body.
    pub fn body_str(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }

    /// Reads an integer field out of the body.
    pub fn body_i64(&self, key: &str) -> Option<i64> {
        self.body.get(key).and_then(Value::as_i64)
    }

    /// Reads a boolean field out of the body.
    pub fn body_bool(&self, key: &str) -> Option<bool> {
        self.body.get(key).and_then(Value::as_bool)
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a packet as one JSON line, including the trailing `\n` delimiter.
///
/// # Errors
///
/// Returns [`PacketError::Serialize`] if the body cannot be serialized.
pub fn encode(packet: &NetworkPacket) -> Result<String, PacketError> {
    let mut line = serde_json::to_string(packet).map_err(PacketError::Serialize)?;
    line.push('\n');
    Ok(line)
}

/// Decodes one packet from a single line of input.
///
/// The caller is responsible for newline framing; `input` must contain
/// exactly one packet (a trailing newline is tolerated).
///
/// # Errors
///
/// Each malformed shape maps to its own [`PacketError`] variant so callers
/// can log precisely what a hostile or broken peer sent.
pub fn decode(input: &str) -> Result<NetworkPacket, PacketError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(PacketError::Empty);
    }

    let value: Value = serde_json::from_str(trimmed).map_err(PacketError::NotJson)?;
    let object = value.as_object().ok_or(PacketError::NotAnObject)?;

    let id = object
        .get("id")
        .and_then(Value::as_i64)
        .ok_or(PacketError::MissingId)?;
    let packet_type = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or(PacketError::MissingType)?
        .to_string();
    let body = object
        .get("body")
        .and_then(Value::as_object)
        .ok_or(PacketError::MissingBody)?
        .clone();

    let payload_size = object.get("payloadSize").and_then(Value::as_i64);
    let payload_transfer_info = object.get("payloadTransferInfo").cloned();

    Ok(NetworkPacket {
        id,
        packet_type,
        body,
        payload_size,
        payload_transfer_info,
    })
}

/// Returns the current time as milliseconds since the Unix epoch.
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body_with(key: &str, value: Value) -> Map<String, Value> {
        let mut body = Map::new();
        body.insert(key.to_string(), value);
        body
    }

    #[test]
    fn test_encode_decode_round_trip_preserves_type_and_body() {
        let packet = NetworkPacket::new(
            PACKET_TYPE_PAIR,
            body_with("pair", Value::Bool(true)),
        );
        let line = encode(&packet).unwrap();
        let decoded = decode(&line).unwrap();
        assert_eq!(decoded.packet_type, PACKET_TYPE_PAIR);
        assert_eq!(decoded.body, packet.body);
        assert_eq!(decoded.id, packet.id);
    }

    #[test]
    fn test_encode_produces_single_newline_terminated_line() {
        let packet = NetworkPacket::new("kdeconnect.ping", Map::new());
        let line = encode(&packet).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn test_new_stamps_current_timestamp() {
        let before = current_timestamp_ms();
        let packet = NetworkPacket::new("kdeconnect.ping", Map::new());
        let after = current_timestamp_ms();
        assert!(packet.id >= before && packet.id <= after);
    }

    #[test]
    fn test_decode_empty_input_fails() {
        assert!(matches!(decode(""), Err(PacketError::Empty)));
        assert!(matches!(decode("   \n"), Err(PacketError::Empty)));
    }

    #[test]
    fn test_decode_non_json_fails() {
        assert!(matches!(decode("not json at all"), Err(PacketError::NotJson(_))));
    }

    #[test]
    fn test_decode_json_array_fails() {
        assert!(matches!(decode("[1,2,3]"), Err(PacketError::NotAnObject)));
    }

    #[test]
    fn test_decode_json_scalar_fails() {
        assert!(matches!(decode("42"), Err(PacketError::NotAnObject)));
        assert!(matches!(decode("\"hello\""), Err(PacketError::NotAnObject)));
    }

    #[test]
    fn test_decode_missing_id_fails() {
        let input = json!({"type": "kdeconnect.ping", "body": {}}).to_string();
        assert!(matches!(decode(&input), Err(PacketError::MissingId)));
    }

    #[test]
    fn test_decode_non_numeric_id_fails() {
        let input = json!({"id": "abc", "type": "kdeconnect.ping", "body": {}}).to_string();
        assert!(matches!(decode(&input), Err(PacketError::MissingId)));
    }

    #[test]
    fn test_decode_missing_type_fails() {
        let input = json!({"id": 1, "body": {}}).to_string();
        assert!(matches!(decode(&input), Err(PacketError::MissingType)));
    }

    #[test]
    fn test_decode_non_string_type_fails() {
        let input = json!({"id": 1, "type": 7, "body": {}}).to_string();
        assert!(matches!(decode(&input), Err(PacketError::MissingType)));
    }

    #[test]
    fn test_decode_missing_body_fails() {
        let input = json!({"id": 1, "type": "kdeconnect.ping"}).to_string();
        assert!(matches!(decode(&input), Err(PacketError::MissingBody)));
    }

    #[test]
    fn test_decode_non_object_body_fails() {
        let input = json!({"id": 1, "type": "kdeconnect.ping", "body": [1]}).to_string();
        assert!(matches!(decode(&input), Err(PacketError::MissingBody)));
    }

    #[test]
    fn test_decode_tolerates_trailing_newline() {
        let input = json!({"id": 1, "type": "kdeconnect.ping", "body": {}}).to_string() + "\n";
        let packet = decode(&input).unwrap();
        assert_eq!(packet.packet_type, "kdeconnect.ping");
    }

    #[test]
    fn test_decode_reads_optional_payload_fields() {
        let input = json!({
            "id": 1,
            "type": "kdeconnect.share.request",
            "body": {"filename": "photo.jpg"},
            "payloadSize": 1024,
            "payloadTransferInfo": {"port": 1739}
        })
        .to_string();
        let packet = decode(&input).unwrap();
        assert_eq!(packet.payload_size, Some(1024));
        assert_eq!(
            packet.payload_transfer_info.as_ref().and_then(|v| v["port"].as_i64()),
            Some(1739)
        );
    }

    #[test]
    fn test_decode_omits_payload_fields_when_absent() {
        let input = json!({"id": 1, "type": "kdeconnect.ping", "body": {}}).to_string();
        let packet = decode(&input).unwrap();
        assert_eq!(packet.payload_size, None);
        assert_eq!(packet.payload_transfer_info, None);
    }

    #[test]
    fn test_encode_skips_absent_payload_fields() {
        let packet = NetworkPacket::new("kdeconnect.ping", Map::new());
        let line = encode(&packet).unwrap();
        assert!(!line.contains("payloadSize"));
        assert!(!line.contains("payloadTransferInfo"));
    }

    #[test]
    fn test_body_accessors() {
        let mut body = Map::new();
        body.insert("name".to_string(), Value::String("phone".to_string()));
        body.insert("port".to_string(), json!(1716));
        body.insert("pair".to_string(), Value::Bool(true));
        let packet = NetworkPacket::new("kdeconnect.test", body);

        assert_eq!(packet.body_str("name"), Some("phone"));
        assert_eq!(packet.body_i64("port"), Some(1716));
        assert_eq!(packet.body_bool("pair"), Some(true));
        assert_eq!(packet.body_str("missing"), None);
        assert_eq!(packet.body_str("port"), None);
    }
}
