use std::fmt;

use bytes::{Buf, BytesMut};

use crate::core::{Error, Protocol, Result, ServiceConfig};
use super::codec::{self, string_size, LENGTH_PREFIX_SIZE};

/// Default discriminator of an unassigned message
pub const MESSAGE_TYPE_NOT_ASSIGNED: u32 = 0x0000_0000;
/// Discriminator of [`ServiceAnnouncement`]
pub const SERVICE_ANNOUNCEMENT: u32 = 0x0000_0001;
/// Discriminator of [`ServiceSignoff`]
pub const SERVICE_SIGNOFF: u32 = 0x0000_0002;
/// Discriminator of [`RegistryRequest`]
pub const REGISTRY_REQUEST: u32 = 0x0000_0003;
/// Discriminator of [`RegistryResponse`]
pub const REGISTRY_RESPONSE: u32 = 0x1000_0003;
/// Discriminator of [`HeartbeatRequest`]
pub const HEARTBEAT_REQUEST: u32 = 0x0000_0004;
/// Discriminator of [`HeartbeatResponse`]
pub const HEARTBEAT_RESPONSE: u32 = 0x1000_0004;

const DISCRIMINATOR_SIZE: usize = std::mem::size_of::<u32>();

/// A message variant with a fixed discriminator and a self-describing body
pub trait WireMessage: Sized {
    /// Discriminator written before the body
    const TYPE: u32;

    /// Returns the discriminator of this message
    fn message_type(&self) -> u32 {
        Self::TYPE
    }

    /// Exact encoded size, discriminator included
    fn length(&self) -> usize;

    /// Writes every field after the discriminator
    fn encode_body(&self, dst: &mut BytesMut);

    /// Reads every field after the discriminator
    fn decode_body(src: &mut impl Buf) -> Result<Self>;
}

macro_rules! service_message {
    ($(#[$meta:meta])* $name:ident, $code:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
        pub struct $name {
            /// Listening port of the described service
            pub port: u16,
            /// Messaging style the service offers
            pub protocol: Protocol,
            /// Human readable identifier
            pub name: String,
            /// Connectable host or URI
            pub address: String,
            /// Free text description
            pub brief: String,
        }

        impl $name {
            /// Directory key: `address:port`
            pub fn key(&self) -> String {
                format!("{}:{}", self.address, self.port)
            }
        }

        impl WireMessage for $name {
            const TYPE: u32 = $code;

            fn length(&self) -> usize {
                DISCRIMINATOR_SIZE
                    + std::mem::size_of::<u16>()
                    + 1
                    + string_size(&self.name)
                    + string_size(&self.address)
                    + string_size(&self.brief)
            }

            fn encode_body(&self, dst: &mut BytesMut) {
                codec::put_u16(dst, self.port);
                codec::put_protocol(dst, self.protocol);
                codec::put_string(dst, &self.name);
                codec::put_string(dst, &self.address);
                codec::put_string(dst, &self.brief);
            }

            fn decode_body(src: &mut impl Buf) -> Result<Self> {
                Ok($name {
                    port: codec::get_u16(src)?,
                    protocol: codec::get_protocol(src)?,
                    name: codec::get_string(src)?,
                    address: codec::get_string(src)?,
                    brief: codec::get_string(src)?,
                })
            }
        }

        impl From<&ServiceConfig> for $name {
            fn from(config: &ServiceConfig) -> Self {
                $name {
                    port: config.port,
                    protocol: config.protocol,
                    name: config.name.clone(),
                    address: config.address.clone(),
                    brief: config.brief.clone(),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(
                    f,
                    "{} '{}' {}:{} ({}) {}",
                    stringify!($name),
                    self.name,
                    self.address,
                    self.port,
                    self.protocol,
                    self.brief
                )
            }
        }
    };
}

service_message!(
    /// Declares that a service is present
    ServiceAnnouncement,
    SERVICE_ANNOUNCEMENT
);

service_message!(
    /// Declares that a service is leaving cleanly
    ServiceSignoff,
    SERVICE_SIGNOFF
);

impl From<&ServiceAnnouncement> for ServiceSignoff {
    fn from(announcement: &ServiceAnnouncement) -> Self {
        ServiceSignoff {
            port: announcement.port,
            protocol: announcement.protocol,
            name: announcement.name.clone(),
            address: announcement.address.clone(),
            brief: announcement.brief.clone(),
        }
    }
}

macro_rules! empty_message {
    ($(#[$meta:meta])* $name:ident, $code:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name;

        impl WireMessage for $name {
            const TYPE: u32 = $code;

            fn length(&self) -> usize {
                DISCRIMINATOR_SIZE
            }

            fn encode_body(&self, _dst: &mut BytesMut) {}

            fn decode_body(_src: &mut impl Buf) -> Result<Self> {
                Ok($name)
            }
        }
    };
}

empty_message!(
    /// Asks the registry for a snapshot of its directory
    RegistryRequest,
    REGISTRY_REQUEST
);

empty_message!(
    /// Asks the registry whether it is alive
    HeartbeatRequest,
    HEARTBEAT_REQUEST
);

empty_message!(
    /// Registry answer to a [`HeartbeatRequest`]
    HeartbeatResponse,
    HEARTBEAT_RESPONSE
);

/// Directory snapshot sent in answer to a [`RegistryRequest`]
///
/// Body: a `usize` entry count followed by that many complete
/// [`ServiceAnnouncement`] encodings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegistryResponse {
    pub services: Vec<ServiceAnnouncement>,
}

impl WireMessage for RegistryResponse {
    const TYPE: u32 = REGISTRY_RESPONSE;

    fn length(&self) -> usize {
        DISCRIMINATOR_SIZE
            + LENGTH_PREFIX_SIZE
            + self.services.iter().map(|s| s.length()).sum::<usize>()
    }

    fn encode_body(&self, dst: &mut BytesMut) {
        codec::put_len(dst, self.services.len());
        for service in &self.services {
            codec::put_u32(dst, ServiceAnnouncement::TYPE);
            service.encode_body(dst);
        }
    }

    fn decode_body(src: &mut impl Buf) -> Result<Self> {
        let count = codec::get_len(src)?;
        let smallest = ServiceAnnouncement::default().length();
        if count.saturating_mul(smallest) > src.remaining() {
            return Err(Error::serialization(format!(
                "registry response declares {} entries but only {} bytes follow",
                count,
                src.remaining()
            )));
        }

        let mut services = Vec::with_capacity(count);
        for _ in 0..count {
            services.push(codec::decode_as::<ServiceAnnouncement>(src)?);
        }
        Ok(RegistryResponse { services })
    }
}

/// Every message kind carried on the discovery channels
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ServiceAnnouncement(ServiceAnnouncement),
    ServiceSignoff(ServiceSignoff),
    RegistryRequest(RegistryRequest),
    RegistryResponse(RegistryResponse),
    HeartbeatRequest(HeartbeatRequest),
    HeartbeatResponse(HeartbeatResponse),
}

impl Message {
    /// Discriminator of the wrapped variant
    pub fn message_type(&self) -> u32 {
        match self {
            Message::ServiceAnnouncement(m) => m.message_type(),
            Message::ServiceSignoff(m) => m.message_type(),
            Message::RegistryRequest(m) => m.message_type(),
            Message::RegistryResponse(m) => m.message_type(),
            Message::HeartbeatRequest(m) => m.message_type(),
            Message::HeartbeatResponse(m) => m.message_type(),
        }
    }

    /// Encoded size of the wrapped variant
    pub fn length(&self) -> usize {
        match self {
            Message::ServiceAnnouncement(m) => m.length(),
            Message::ServiceSignoff(m) => m.length(),
            Message::RegistryRequest(m) => m.length(),
            Message::RegistryResponse(m) => m.length(),
            Message::HeartbeatRequest(m) => m.length(),
            Message::HeartbeatResponse(m) => m.length(),
        }
    }

    /// Encodes the wrapped variant
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        match self {
            Message::ServiceAnnouncement(m) => codec::encode(m, dst),
            Message::ServiceSignoff(m) => codec::encode(m, dst),
            Message::RegistryRequest(m) => codec::encode(m, dst),
            Message::RegistryResponse(m) => codec::encode(m, dst),
            Message::HeartbeatRequest(m) => codec::encode(m, dst),
            Message::HeartbeatResponse(m) => codec::encode(m, dst),
        }
    }

    /// Reads the discriminator and decodes the matching variant
    pub fn decode(src: &mut impl Buf) -> Result<Self> {
        let message_type = codec::get_u32(src)?;
        let message = match message_type {
            SERVICE_ANNOUNCEMENT => Message::ServiceAnnouncement(ServiceAnnouncement::decode_body(src)?),
            SERVICE_SIGNOFF => Message::ServiceSignoff(ServiceSignoff::decode_body(src)?),
            REGISTRY_REQUEST => Message::RegistryRequest(RegistryRequest::decode_body(src)?),
            REGISTRY_RESPONSE => Message::RegistryResponse(RegistryResponse::decode_body(src)?),
            HEARTBEAT_REQUEST => Message::HeartbeatRequest(HeartbeatRequest::decode_body(src)?),
            HEARTBEAT_RESPONSE => Message::HeartbeatResponse(HeartbeatResponse::decode_body(src)?),
            other => {
                return Err(Error::serialization(format!("unknown message type {:#010x}", other)))
            }
        };
        Ok(message)
    }
}
