//! # devicelink-core
//!
//! Shared library for DeviceLink containing the wire protocol codec, the
//! identity payload, and the connection lifecycle state machine.
//!
//! This crate is used by the daemon and by anything that needs to speak or
//! inspect the phone-link protocol. It has zero dependencies on sockets,
//! TLS, or the filesystem:
//!
//! - **`protocol`** – The line-delimited JSON packet envelope
//!   (`{"id", "type", "body", ...}`), strict decoding of untrusted input,
//!   and the identity payload exchanged during discovery and handshakes.
//!
//! - **`lifecycle`** – The daemon-wide connection state machine with a
//!   static transition table, context patches, bounded transition history,
//!   and ordered synchronous listeners.

pub mod lifecycle;
pub mod protocol;

pub use lifecycle::{
    can_transition, ContextPatch, LifecycleMachine, LinkState, StateContext, TransitionError,
    TransitionRecord,
};
pub use protocol::{
    decode, encode, is_valid_device_id, DeviceType, IdentityError, IdentityInfo, NetworkPacket,
    PacketError, PACKET_TYPE_IDENTITY, PACKET_TYPE_PAIR, PROTOCOL_VERSION,
};
