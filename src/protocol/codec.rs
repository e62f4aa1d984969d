use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::{Error, Protocol, Result};
use super::message::{Message, WireMessage};
use super::MAX_MESSAGE_SIZE;

/// Encoded width of a string length prefix (platform `usize`)
pub const LENGTH_PREFIX_SIZE: usize = std::mem::size_of::<usize>();

/// Encoded size of a length-prefixed string
pub fn string_size(value: &str) -> usize {
    LENGTH_PREFIX_SIZE + value.len()
}

fn ensure(src: &impl Buf, needed: usize, what: &str) -> Result<()> {
    if src.remaining() < needed {
        return Err(Error::serialization(format!(
            "datagram exhausted reading {}: need {} bytes, {} left",
            what,
            needed,
            src.remaining()
        )));
    }
    Ok(())
}

/// Writes a u16 in native byte order
pub fn put_u16(dst: &mut BytesMut, value: u16) {
    dst.put_slice(&value.to_ne_bytes());
}

/// Writes a u32 in native byte order
pub fn put_u32(dst: &mut BytesMut, value: u32) {
    dst.put_slice(&value.to_ne_bytes());
}

/// Writes a `usize` length in native byte order and width
pub fn put_len(dst: &mut BytesMut, value: usize) {
    dst.put_slice(&value.to_ne_bytes());
}

/// Writes the protocol style as a single byte
pub fn put_protocol(dst: &mut BytesMut, value: Protocol) {
    dst.put_u8(value.as_byte());
}

/// Writes a length-prefixed string without terminator
pub fn put_string(dst: &mut BytesMut, value: &str) {
    put_len(dst, value.len());
    dst.put_slice(value.as_bytes());
}

/// Reads a native order u16
pub fn get_u16(src: &mut impl Buf) -> Result<u16> {
    let mut raw = [0u8; 2];
    ensure(src, raw.len(), "u16")?;
    src.copy_to_slice(&mut raw);
    Ok(u16::from_ne_bytes(raw))
}

/// Reads a native order u32
pub fn get_u32(src: &mut impl Buf) -> Result<u32> {
    let mut raw = [0u8; 4];
    ensure(src, raw.len(), "u32")?;
    src.copy_to_slice(&mut raw);
    Ok(u32::from_ne_bytes(raw))
}

/// Reads a native width length
pub fn get_len(src: &mut impl Buf) -> Result<usize> {
    let mut raw = [0u8; LENGTH_PREFIX_SIZE];
    ensure(src, raw.len(), "length prefix")?;
    src.copy_to_slice(&mut raw);
    Ok(usize::from_ne_bytes(raw))
}

/// Reads a one byte protocol style
pub fn get_protocol(src: &mut impl Buf) -> Result<Protocol> {
    ensure(src, 1, "protocol")?;
    let byte = src.get_u8();
    Protocol::from_byte(byte)
        .ok_or_else(|| Error::serialization(format!("unknown protocol style {}", byte)))
}

/// Reads a length-prefixed string sized to exactly the declared length
pub fn get_string(src: &mut impl Buf) -> Result<String> {
    let len = get_len(src)?;
    // Checked before allocating so a corrupt prefix cannot request a huge buffer
    ensure(src, len, "string payload")?;
    let mut raw = vec![0u8; len];
    src.copy_to_slice(&mut raw);
    String::from_utf8(raw).map_err(|e| Error::serialization(format!("string is not UTF-8: {}", e)))
}

/// Encodes one message of a known variant, discriminator first
pub fn encode<M: WireMessage>(message: &M, dst: &mut BytesMut) -> Result<()> {
    let length = message.length();
    if length > MAX_MESSAGE_SIZE {
        return Err(Error::serialization(format!(
            "message of {} bytes exceeds the {} byte datagram limit",
            length, MAX_MESSAGE_SIZE
        )));
    }
    dst.reserve(length);
    put_u32(dst, M::TYPE);
    message.encode_body(dst);
    Ok(())
}

/// Decodes one message of a known variant, rejecting other discriminators
pub fn decode_as<M: WireMessage>(src: &mut impl Buf) -> Result<M> {
    let message_type = get_u32(src)?;
    if message_type != M::TYPE {
        return Err(Error::serialization(format!(
            "expected message type {:#010x}, found {:#010x}",
            M::TYPE,
            message_type
        )));
    }
    M::decode_body(src)
}

/// Serializes a message into a standalone buffer
pub fn serialize<M: WireMessage>(message: &M) -> Result<Bytes> {
    let mut dst = BytesMut::with_capacity(message.length());
    encode(message, &mut dst)?;
    Ok(dst.freeze())
}

/// Deserializes a message of a known variant from raw bytes
pub fn deserialize<M: WireMessage>(mut src: &[u8]) -> Result<M> {
    decode_as(&mut src)
}

/// Datagram codec: every non-empty buffer holds exactly one message
#[derive(Clone, Default)]
pub struct MessageCodec;

impl MessageCodec {
    /// Creates a new message codec
    pub fn new() -> Self {
        MessageCodec
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.is_empty() {
            return Ok(None);
        }

        // The datagram boundary is the frame; whatever follows the message is dropped
        let mut datagram = src.split().freeze();
        let message = Message::decode(&mut datagram)?;
        if datagram.has_remaining() {
            tracing::trace!(
                "ignoring {} trailing bytes after {:#010x}",
                datagram.remaining(),
                message.message_type()
            );
        }
        Ok(Some(message))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        item.encode(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{
        HeartbeatRequest, RegistryResponse, ServiceAnnouncement, ServiceSignoff,
    };

    fn announcement() -> ServiceAnnouncement {
        ServiceAnnouncement {
            port: 0xDEAD,
            protocol: Protocol::ReqRep,
            name: "Unit Test Service".to_string(),
            address: "192.168.1.1".to_string(),
            brief: "is this the right thing".to_string(),
        }
    }

    #[test]
    fn test_wire_layout() {
        let message = announcement();
        let bytes = serialize(&message).unwrap();

        assert_eq!(bytes.len(), message.length());
        assert_eq!(&bytes[0..4], &0x0000_0001u32.to_ne_bytes());
        assert_eq!(&bytes[4..6], &0xDEADu16.to_ne_bytes());
        assert_eq!(bytes[6], 1);
        let name_len = &bytes[7..7 + LENGTH_PREFIX_SIZE];
        assert_eq!(name_len, &"Unit Test Service".len().to_ne_bytes());
        let name_start = 7 + LENGTH_PREFIX_SIZE;
        assert_eq!(&bytes[name_start..name_start + 17], b"Unit Test Service");
    }

    #[test]
    fn test_round_trip_edge_values() {
        let long_name = "n".repeat(60_000);
        let cases = vec![
            ServiceAnnouncement::default(),
            ServiceAnnouncement { port: 0, ..announcement() },
            ServiceAnnouncement { port: u16::MAX, protocol: Protocol::PubSub, ..announcement() },
            ServiceAnnouncement { name: long_name, brief: String::new(), ..announcement() },
            ServiceAnnouncement { name: "ünïcødé ✓".to_string(), ..announcement() },
        ];

        for original in cases {
            let bytes = serialize(&original).unwrap();
            let decoded: ServiceAnnouncement = deserialize(&bytes).unwrap();
            assert_eq!(decoded, original);
            assert_eq!(decoded.message_type(), 0x0000_0001);
        }
    }

    #[test]
    fn test_variant_mismatch_rejected() {
        let bytes = serialize(&announcement()).unwrap();
        let err = deserialize::<ServiceSignoff>(&bytes).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_truncated_string_payload() {
        let bytes = serialize(&announcement()).unwrap();
        // Keep the discriminator, port, protocol and the name length, drop the name bytes
        let cut = 4 + 2 + 1 + LENGTH_PREFIX_SIZE;
        let err = deserialize::<ServiceAnnouncement>(&bytes[..cut]).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_every_prefix_is_rejected() {
        let bytes = serialize(&announcement()).unwrap();
        for cut in 0..bytes.len() {
            assert!(deserialize::<ServiceAnnouncement>(&bytes[..cut]).is_err(), "cut at {}", cut);
        }
    }

    #[test]
    fn test_huge_length_prefix_rejected() {
        let mut dst = BytesMut::new();
        put_u32(&mut dst, 0x0000_0001);
        put_u16(&mut dst, 80);
        put_protocol(&mut dst, Protocol::PubSub);
        put_len(&mut dst, usize::MAX);
        let err = deserialize::<ServiceAnnouncement>(&dst).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_unknown_protocol_byte() {
        let mut bytes = BytesMut::from(&serialize(&announcement()).unwrap()[..]);
        bytes[6] = 9;
        assert!(deserialize::<ServiceAnnouncement>(&bytes).is_err());
    }

    #[test]
    fn test_oversized_message_rejected() {
        let message = ServiceAnnouncement {
            brief: "b".repeat(MAX_MESSAGE_SIZE),
            ..announcement()
        };
        assert!(matches!(serialize(&message), Err(Error::Serialization(_))));
    }

    #[test]
    fn test_codec_datagram() {
        let mut codec = MessageCodec::new();
        let mut buffer = BytesMut::new();

        assert!(codec.decode(&mut buffer).unwrap().is_none());

        codec
            .encode(Message::HeartbeatRequest(HeartbeatRequest), &mut buffer)
            .unwrap();
        let decoded = codec.decode(&mut buffer).unwrap();
        assert_eq!(decoded, Some(Message::HeartbeatRequest(HeartbeatRequest)));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_codec_registry_response() {
        let mut codec = MessageCodec::new();
        let mut buffer = BytesMut::new();
        let response = RegistryResponse {
            services: vec![announcement(), ServiceAnnouncement::default()],
        };

        codec
            .encode(Message::RegistryResponse(response.clone()), &mut buffer)
            .unwrap();
        match codec.decode(&mut buffer).unwrap() {
            Some(Message::RegistryResponse(decoded)) => assert_eq!(decoded, response),
            other => panic!("Decoded wrong message type: {:?}", other),
        }
    }
}
