//! Protocol module containing the wire packet codec and the identity payload.

pub mod codec;
pub mod identity;

pub use codec::{decode, encode, NetworkPacket, PacketError, PACKET_TYPE_IDENTITY, PACKET_TYPE_PAIR};
pub use identity::{
    is_valid_device_id, DeviceType, IdentityError, IdentityInfo, MIN_VERSION_SECURE_IDENTITY,
    PROTOCOL_VERSION,
};
