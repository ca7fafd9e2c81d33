//! Identity payload: the handshake body declaring who a device is.
//!
//! An identity packet is the first thing either side of the protocol says,
//! both over UDP discovery broadcasts and at the start of every TCP
//! handshake. Because it arrives from an unauthenticated peer, parsing is
//! strict: the device identifier must match `[A-Za-z0-9_-]{32,38}` before
//! anything downstream will touch it.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::protocol::codec::{NetworkPacket, PACKET_TYPE_IDENTITY};

/// Protocol version this implementation speaks.
pub const PROTOCOL_VERSION: i64 = 8;

/// Minimum peer protocol version that re-exchanges identity inside TLS.
///
/// Peers below this threshold only assert identity in plaintext; their
/// identity is never confirmed over the authenticated channel. Legacy
/// compatibility path only.
pub const MIN_VERSION_SECURE_IDENTITY: i64 = 8;

/// Shortest / longest accepted device identifier, in characters.
pub const DEVICE_ID_MIN_LEN: usize = 32;
pub const DEVICE_ID_MAX_LEN: usize = 38;

/// Errors produced while parsing an identity payload.
#[derive(Debug, Error, PartialEq)]
pub enum IdentityError {
    /// The packet's type tag is not the identity type.
    #[error("not an identity packet: {0}")]
    WrongPacketType(String),

    /// The `deviceId` field is absent or not a string.
    #[error("identity is missing a `deviceId` field")]
    MissingDeviceId,

    /// The device identifier does not match `[A-Za-z0-9_-]{32,38}`.
    #[error("invalid device identifier: {0:?}")]
    InvalidDeviceId(String),

    /// The `deviceName` field is absent or not a string.
    #[error("identity is missing a `deviceName` field")]
    MissingDeviceName,

    /// The `deviceType` field is present but not a known class.
    #[error("unknown device type: {0:?}")]
    InvalidDeviceType(String),

    /// The `protocolVersion` field is absent or not an integer.
    #[error("identity is missing a `protocolVersion` field")]
    MissingProtocolVersion,
}

/// Device class advertised in the identity payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Desktop,
    Laptop,
    Phone,
    Tablet,
    Tv,
}

impl DeviceType {
    /// The lowercase wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Laptop => "laptop",
            DeviceType::Phone => "phone",
            DeviceType::Tablet => "tablet",
            DeviceType::Tv => "tv",
        }
    }

    /// Parses the wire representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "desktop" => Some(DeviceType::Desktop),
            "laptop" => Some(DeviceType::Laptop),
            "phone" => Some(DeviceType::Phone),
            "tablet" => Some(DeviceType::Tablet),
            "tv" => Some(DeviceType::Tv),
            _ => None,
        }
    }
}

/// Validates the device identifier shape: `[A-Za-z0-9_-]{32,38}`.
///
/// This rejects the large majority of malformed or hostile peer data before
/// it reaches registries, the trust store, or the filesystem (identifiers
/// become trust-store file names).
pub fn is_valid_device_id(id: &str) -> bool {
    (DEVICE_ID_MIN_LEN..=DEVICE_ID_MAX_LEN).contains(&id.len())
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// A parsed identity payload.
///
/// Ephemeral: constructed per handshake or broadcast, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityInfo {
    pub device_id: String,
    pub device_name: String,
    pub device_type: DeviceType,
    pub protocol_version: i64,
    /// TCP port the device listens on, if it accepts inbound connections.
    pub tcp_port: Option<u16>,
    pub incoming_capabilities: Vec<String>,
    pub outgoing_capabilities: Vec<String>,
}

impl IdentityInfo {
    /// Builds the identity wire packet for this device.
    pub fn to_packet(&self) -> NetworkPacket {
        let mut body = Map::new();
        body.insert("deviceId".into(), Value::String(self.device_id.clone()));
        body.insert("deviceName".into(), Value::String(self.device_name.clone()));
        body.insert(
            "deviceType".into(),
            Value::String(self.device_type.as_str().to_string()),
        );
        body.insert(
            "protocolVersion".into(),
            Value::Number(self.protocol_version.into()),
        );
        if let Some(port) = self.tcp_port {
            body.insert("tcpPort".into(), Value::Number(i64::from(port).into()));
        }
        body.insert(
            "incomingCapabilities".into(),
            Value::Array(
                self.incoming_capabilities
                    .iter()
                    .map(|c| Value::String(c.clone()))
                    .collect(),
            ),
        );
        body.insert(
            "outgoingCapabilities".into(),
            Value::Array(
                self.outgoing_capabilities
                    .iter()
                    .map(|c| Value::String(c.clone()))
                    .collect(),
            ),
        );
        NetworkPacket::new(PACKET_TYPE_IDENTITY, body)
    }

    /// Parses and validates an identity payload out of a wire packet.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError`] for a wrong type tag, a missing or
    /// malformed identifier, or missing required fields. An absent
    /// `deviceType` defaults to `desktop`; a present-but-unknown one is an
    /// error.
    pub fn from_packet(packet: &NetworkPacket) -> Result<Self, IdentityError> {
        if !packet.is_type(PACKET_TYPE_IDENTITY) {
            return Err(IdentityError::WrongPacketType(packet.packet_type.clone()));
        }

        let device_id = packet
            .body_str("deviceId")
            .ok_or(IdentityError::MissingDeviceId)?;
        if !is_valid_device_id(device_id) {
            return Err(IdentityError::InvalidDeviceId(device_id.to_string()));
        }

        let device_name = packet
            .body_str("deviceName")
            .ok_or(IdentityError::MissingDeviceName)?;

        let device_type = match packet.body_str("deviceType") {
            None => DeviceType::Desktop,
            Some(s) => {
                DeviceType::parse(s).ok_or_else(|| IdentityError::InvalidDeviceType(s.to_string()))?
            }
        };

        let protocol_version = packet
            .body_i64("protocolVersion")
            .ok_or(IdentityError::MissingProtocolVersion)?;

        let tcp_port = packet
            .body_i64("tcpPort")
            .and_then(|p| u16::try_from(p).ok());

        Ok(Self {
            device_id: device_id.to_string(),
            device_name: device_name.to_string(),
            device_type,
            protocol_version,
            tcp_port,
            incoming_capabilities: string_list(&packet.body, "incomingCapabilities"),
            outgoing_capabilities: string_list(&packet.body, "outgoingCapabilities"),
        })
    }

    /// Whether this peer re-confirms its identity inside the TLS channel.
    pub fn supports_secure_identity(&self) -> bool {
        self.protocol_version >= MIN_VERSION_SECURE_IDENTITY
    }
}

fn string_list(body: &Map<String, Value>, key: &str) -> Vec<String> {
    body.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
