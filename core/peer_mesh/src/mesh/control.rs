//! Control packets exchanged between session peers
//!
//! Every packet travels as one frame. The manager interprets `Address`,
//! `SimultaneousOpenOffer` and `Forward` itself and hands `Message` payloads
//! to the message layer.
//!
//! # Framing
//!
//! ```text
//! ┌─────────────┬─────────────────────────────────┐
//! │ Length (4B) │ Payload (bincode-encoded)       │
//! └─────────────┴─────────────────────────────────┘
//! ```
//!
//! The frame helpers are generic so the node's link layer can reuse them
//! for its own frames.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use super::address::PeerAddress;
use super::peer::PeerId;

// ============================================================================
// Constants
// ============================================================================

/// Maximum frame payload size
pub const MAX_MESSAGE_SIZE: u32 = 65536;

/// Length of the frame header (4 bytes for length)
pub const HEADER_LEN: usize = 4;

// ============================================================================
// Control Packets
// ============================================================================

/// Packet kinds understood by the connection manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlPacket {
    /// A candidate address of `subject`
    Address {
        subject: PeerId,
        address: PeerAddress,
    },

    /// Endpoint of a socket bound for TCP simultaneous open
    SimultaneousOpenOffer {
        originator: PeerId,
        endpoint: SocketAddr,
    },

    /// Relay request addressed to the host
    Forward(ForwardEnvelope),

    /// Opaque payload for the message layer
    Message(Vec<u8>),
}

/// A packet the host should pass on to some of the session peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardEnvelope {
    pub recipients: Recipients,
    /// One complete encoded control frame
    pub payload: Vec<u8>,
}

/// Who a forwarded packet is meant for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recipients {
    /// Every roster peer except the sender
    All,
    /// Exactly these peers
    Only(Vec<PeerId>),
}

impl Recipients {
    pub fn includes(&self, id: PeerId) -> bool {
        match self {
            Recipients::All => true,
            Recipients::Only(ids) => ids.contains(&id),
        }
    }
}

impl ControlPacket {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlPacket::Address { .. } => "address",
            ControlPacket::SimultaneousOpenOffer { .. } => "sim-open offer",
            ControlPacket::Forward(_) => "forward",
            ControlPacket::Message(_) => "message",
        }
    }
}

// ============================================================================
// Frame Encoding/Decoding
// ============================================================================

/// Encode a value with length prefix
///
/// Returns a Vec containing: [4-byte BE length][bincode payload]
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, EncodeError> {
    let payload =
        bincode::serialize(value).map_err(|e| EncodeError::Serialization(e.to_string()))?;

    if payload.len() > MAX_MESSAGE_SIZE as usize {
        return Err(EncodeError::MessageTooLarge(payload.len()));
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);

    Ok(buf)
}

/// Decode one value from a length-prefixed buffer
///
/// Returns the value and the number of bytes consumed
pub fn decode_frame<T: DeserializeOwned>(buf: &[u8]) -> Result<(T, usize), DecodeError> {
    if buf.len() < HEADER_LEN {
        return Err(DecodeError::Incomplete(HEADER_LEN - buf.len()));
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_MESSAGE_SIZE as usize {
        return Err(DecodeError::MessageTooLarge(length));
    }

    let total_len = HEADER_LEN + length;
    if buf.len() < total_len {
        return Err(DecodeError::Incomplete(total_len - buf.len()));
    }

    let value = bincode::deserialize(&buf[HEADER_LEN..total_len])
        .map_err(|e| DecodeError::Deserialization(e.to_string()))?;

    Ok((value, total_len))
}

/// Decode as many complete frames as the buffer holds
///
/// Returns decoded values and the bytes left over. Decoding stops at the
/// first incomplete or malformed frame; callers that need to tell the two
/// apart run `decode_frame` on the remainder.
pub fn decode_frames<T: DeserializeOwned>(mut buf: &[u8]) -> (Vec<T>, Vec<u8>) {
    let mut values = Vec::new();

    while !buf.is_empty() {
        match decode_frame(buf) {
            Ok((value, consumed)) => {
                values.push(value);
                buf = &buf[consumed..];
            }
            Err(_) => break,
        }
    }

    (values, buf.to_vec())
}

/// Encode a control packet as one frame
pub fn encode_packet(packet: &ControlPacket) -> Result<Vec<u8>, EncodeError> {
    encode_frame(packet)
}

/// Decode a buffer holding exactly one control packet frame
pub fn decode_packet(buf: &[u8]) -> Result<ControlPacket, DecodeError> {
    let (packet, consumed) = decode_frame(buf)?;
    if consumed != buf.len() {
        return Err(DecodeError::TrailingBytes(buf.len() - consumed));
    }
    Ok(packet)
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during frame encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Serialization failed
    Serialization(String),
    /// Frame exceeds maximum size
    MessageTooLarge(usize),
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodeError::Serialization(e) => write!(f, "serialization error: {}", e),
            EncodeError::MessageTooLarge(size) => {
                write!(
                    f,
                    "message too large: {} bytes (max {})",
                    size, MAX_MESSAGE_SIZE
                )
            }
        }
    }
}

impl std::error::Error for EncodeError {}

/// Errors that can occur during frame decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough data (need N more bytes)
    Incomplete(usize),
    /// Deserialization failed
    Deserialization(String),
    /// Frame exceeds maximum size
    MessageTooLarge(usize),
    /// Bytes after a single-packet frame
    TrailingBytes(usize),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Incomplete(needed) => {
                write!(f, "incomplete message, need {} more bytes", needed)
            }
            DecodeError::Deserialization(e) => write!(f, "deserialization error: {}", e),
            DecodeError::MessageTooLarge(size) => {
                write!(
                    f,
                    "message too large: {} bytes (max {})",
                    size, MAX_MESSAGE_SIZE
                )
            }
            DecodeError::TrailingBytes(n) => write!(f, "{} trailing bytes after packet", n),
        }
    }
}

impl std::error::Error for DecodeError {}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_address() {
        let packet = ControlPacket::Address {
            subject: 4,
            address: PeerAddress::udp("0.0.0.0:11115".parse().unwrap()),
        };

        let encoded = encode_packet(&packet).unwrap();
        assert_eq!(decode_packet(&encoded).unwrap(), packet);
    }

    #[test]
    fn test_encode_decode_forward() {
        let inner = encode_packet(&ControlPacket::Message(b"hello".to_vec())).unwrap();
        let packet = ControlPacket::Forward(ForwardEnvelope {
            recipients: Recipients::Only(vec![2, 5]),
            payload: inner.clone(),
        });

        let encoded = encode_packet(&packet).unwrap();
        match decode_packet(&encoded).unwrap() {
            ControlPacket::Forward(envelope) => {
                assert_eq!(envelope.recipients, Recipients::Only(vec![2, 5]));
                assert_eq!(
                    decode_packet(&envelope.payload).unwrap(),
                    ControlPacket::Message(b"hello".to_vec())
                );
            }
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn test_scope_id_not_transmitted() {
        let endpoint: SocketAddr = "[fe80::1%4]:11112".parse().unwrap();
        let packet = ControlPacket::SimultaneousOpenOffer {
            originator: 1,
            endpoint,
        };

        let encoded = encode_packet(&packet).unwrap();
        match decode_packet(&encoded).unwrap() {
            ControlPacket::SimultaneousOpenOffer { endpoint: decoded, .. } => {
                assert_eq!(decoded.ip(), endpoint.ip());
                assert_eq!(decoded.port(), 11112);
                assert_eq!(crate::mesh::address::scope_id(&decoded), 0);
            }
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn test_recipients_includes() {
        assert!(Recipients::All.includes(9));
        assert!(Recipients::Only(vec![1, 3]).includes(3));
        assert!(!Recipients::Only(vec![1, 3]).includes(2));
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = encode_packet(&ControlPacket::Message(vec![1, 2, 3])).unwrap();

        assert!(matches!(
            decode_packet(&encoded[..2]),
            Err(DecodeError::Incomplete(_))
        ));
        assert!(matches!(
            decode_packet(&encoded[..encoded.len() - 1]),
            Err(DecodeError::Incomplete(_))
        ));
    }

    #[test]
    fn test_decode_trailing_bytes() {
        let mut encoded = encode_packet(&ControlPacket::Message(vec![7])).unwrap();
        encoded.push(0);
        assert_eq!(decode_packet(&encoded), Err(DecodeError::TrailingBytes(1)));
    }

    #[test]
    fn test_decode_garbage_is_error() {
        // Valid header, bogus enum discriminant
        let buf = [0, 0, 0, 4, 0xff, 0xff, 0xff, 0xff];
        assert!(matches!(
            decode_packet(&buf),
            Err(DecodeError::Deserialization(_))
        ));
    }

    #[test]
    fn test_decode_multiple_with_remainder() {
        let mut buf = encode_packet(&ControlPacket::Message(vec![1])).unwrap();
        buf.extend(encode_packet(&ControlPacket::Message(vec![2])).unwrap());
        buf.extend(&[0x00, 0x00, 0x00, 0x10]);

        let (packets, remaining): (Vec<ControlPacket>, _) = decode_frames(&buf);

        assert_eq!(packets.len(), 2);
        assert_eq!(packets[1], ControlPacket::Message(vec![2]));
        assert_eq!(remaining.len(), 4);
    }

    #[test]
    fn test_message_too_large() {
        let fake_header = (MAX_MESSAGE_SIZE + 1).to_be_bytes();
        assert!(matches!(
            decode_frame::<ControlPacket>(&fake_header),
            Err(DecodeError::MessageTooLarge(_))
        ));

        let huge = ControlPacket::Message(vec![0u8; MAX_MESSAGE_SIZE as usize + 1]);
        assert!(matches!(
            encode_packet(&huge),
            Err(EncodeError::MessageTooLarge(_))
        ));
    }
}
