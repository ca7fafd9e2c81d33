//! Packet router: splits the inbound byte stream into newline-delimited
//! packets and dispatches them to per-type handlers.
//!
//! Each connection gets its own reassembly buffer, keyed by the
//! connection's sequence number rather than the device identifier, so a
//! replacement connection never inherits a retired connection's partial
//! line. A line that fails to decode is logged and dropped; the stream
//! keeps flowing. Packets with no registered handler are logged at debug
//! and dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use devicelink_core::protocol::{codec, NetworkPacket};

use crate::connection::DeviceConnection;

/// Cap on one connection's unterminated reassembly buffer. A peer that
/// streams forever without a newline gets its buffer discarded.
const MAX_BUFFERED_LINE: usize = 1 << 20;

/// Handler invoked for every packet of its registered type.
pub type PacketHandler = Arc<dyn Fn(&NetworkPacket, &Arc<DeviceConnection>) + Send + Sync>;

/// Routes decoded packets to handlers registered per packet type.
pub struct PacketRouter {
    handlers: Mutex<HashMap<String, PacketHandler>>,
    buffers: Mutex<HashMap<u64, Vec<u8>>>,
}

impl Default for PacketRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketRouter {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Registers the handler for a packet type, replacing any previous one.
    pub fn register<F>(&self, packet_type: &str, handler: F)
    where
        F: Fn(&NetworkPacket, &Arc<DeviceConnection>) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers.insert(packet_type.to_string(), Arc::new(handler));
    }

    /// Removes the handler for a packet type.
    pub fn unregister(&self, packet_type: &str) {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers.remove(packet_type);
    }

    /// Feeds raw bytes from one connection. Complete lines are decoded and
    /// dispatched; a trailing partial line is buffered until the next call.
    pub fn ingest(&self, conn: &Arc<DeviceConnection>, bytes: &[u8]) {
        let complete_lines = {
            let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
            let buffer = buffers.entry(conn.sequence()).or_default();
            buffer.extend_from_slice(bytes);

            let mut lines = Vec::new();
            while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = buffer.drain(..=pos).collect();
                line.pop(); // delimiter
                lines.push(line);
            }
            if buffer.len() > MAX_BUFFERED_LINE {
                warn!(
                    "dropping oversized partial line from {} ({} bytes)",
                    conn.device_id(),
                    buffer.len()
                );
                buffer.clear();
            }
            lines
        };

        for line in complete_lines {
            let text = String::from_utf8_lossy(&line);
            if text.trim().is_empty() {
                continue;
            }
            match codec::decode(&text) {
                Ok(packet) => self.dispatch(&packet, conn),
                Err(e) => {
                    warn!("dropping malformed packet from {}: {e}", conn.device_id());
                }
            }
        }
    }

    /// Drops the reassembly buffer for a closed connection.
    pub fn reset(&self, sequence: u64) {
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        buffers.remove(&sequence);
    }

    fn dispatch(&self, packet: &NetworkPacket, conn: &Arc<DeviceConnection>) {
        // Clone the handler out of the lock so a handler registering or
        // unregistering handlers cannot deadlock.
        let handler = {
            let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            handlers.get(&packet.packet_type).cloned()
        };
        match handler {
            Some(handler) => handler(packet, conn),
            None => debug!(
                "no handler for {} from {}",
                packet.packet_type,
                conn.device_id()
            ),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
