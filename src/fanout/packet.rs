//! Wire packet sent to network clients
//!
//! ```text
//! +------------+-------------------+------------------------+
//! | channel u8 | payload (N bytes) | capture_ts_ms u64 (LE) |
//! +------------+-------------------+------------------------+
//! ```
//!
//! One packet per WebSocket binary message; the payload length is implied
//! by the message length.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::channel::ChannelId;
use crate::error::PacketError;

/// Channel byte plus trailing timestamp
pub const PACKET_OVERHEAD: usize = 1 + 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WirePacket {
    pub channel: ChannelId,
    pub payload: Bytes,
    pub capture_timestamp_ms: u64,
}

impl WirePacket {
    pub fn new(channel: ChannelId, payload: Bytes, capture_timestamp_ms: u64) -> Self {
        Self {
            channel,
            payload,
            capture_timestamp_ms,
        }
    }

    /// Total encoded length
    pub fn encoded_len(&self) -> usize {
        self.payload.len() + PACKET_OVERHEAD
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(self.channel.into());
        buf.put_slice(&self.payload);
        buf.put_u64_le(self.capture_timestamp_ms);
        buf.freeze()
    }

    /// Parse a received packet. The payload shares `data`'s allocation.
    pub fn decode(mut data: Bytes) -> Result<Self, PacketError> {
        if data.len() < PACKET_OVERHEAD {
            return Err(PacketError::TooShort { len: data.len() });
        }

        let id = data.get_u8();
        let channel = ChannelId::from_index(id).ok_or(PacketError::UnknownChannel(id))?;

        let mut trailer = data.split_off(data.len() - 8);
        let capture_timestamp_ms = trailer.get_u64_le();

        Ok(Self {
            channel,
            payload: data,
            capture_timestamp_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let packet = WirePacket::new(ChannelId::Medium, Bytes::from_static(b"\x00\x00\x00\x01\x65"), 0x1122);
        let encoded = packet.encode();

        assert_eq!(encoded.len(), 5 + PACKET_OVERHEAD);
        assert_eq!(encoded[0], 1);
        assert_eq!(&encoded[1..6], b"\x00\x00\x00\x01\x65");
        assert_eq!(&encoded[6..], &0x1122u64.to_le_bytes());

        assert_eq!(WirePacket::decode(encoded).unwrap(), packet);
    }

    #[test]
    fn test_empty_payload() {
        let packet = WirePacket::new(ChannelId::Low, Bytes::new(), 99);
        let encoded = packet.encode();
        assert_eq!(encoded.len(), PACKET_OVERHEAD);

        let decoded = WirePacket::decode(encoded).unwrap();
        assert!(decoded.payload.is_empty());
        assert_eq!(decoded.capture_timestamp_ms, 99);
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(
            WirePacket::decode(Bytes::from_static(&[0u8; 8])),
            Err(PacketError::TooShort { len: 8 })
        );

        let mut bad = vec![7u8];
        bad.extend_from_slice(&[0u8; 8]);
        assert_eq!(
            WirePacket::decode(Bytes::from(bad)),
            Err(PacketError::UnknownChannel(7))
        );
    }
}
