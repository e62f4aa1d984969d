//! Discovery wire protocol
//!
//! This module defines the discovery messages and their encoding. Every message
//! travels alone in one UDP datagram: a `u32` discriminator followed by the
//! variant's fields in native byte order.

pub mod codec;
pub mod message;

pub use self::codec::{decode_as, deserialize, encode, serialize, MessageCodec};
pub use self::message::{
    HeartbeatRequest, HeartbeatResponse, Message, RegistryRequest, RegistryResponse,
    ServiceAnnouncement, ServiceSignoff, WireMessage,
};

/// Maximum message size in bytes
pub const MAX_MESSAGE_SIZE: usize = 65507; // Maximum UDP payload size
