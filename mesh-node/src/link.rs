//! Link-level frames exchanged on every TCP connection
//!
//! A connection starts with both ends sending `Hello` so each side learns
//! which session participant it is talking to. After that the link carries
//! round-trip pings and `Data` frames holding the manager's control packets.
//! Frames use the same length-prefixed framing as control packets.

use peer_mesh::{decode_frame, decode_frames, encode_frame, DecodeError, EncodeError, PeerId};
use serde::{Deserialize, Serialize};

/// One frame on a peer link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkFrame {
    /// Sender's participant id, first frame in each direction
    Hello { peer: PeerId },
    /// Round-trip ping
    Ping { seq: u32 },
    /// Answer to `Ping` with the same sequence number
    Pong { seq: u32 },
    /// Encoded control packet for the connection manager
    Data(Vec<u8>),
}

impl LinkFrame {
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        encode_frame(self)
    }
}

/// Outcome of draining a receive buffer
#[derive(Debug, PartialEq, Eq)]
pub struct Drained {
    pub frames: Vec<LinkFrame>,
    /// Set if the buffer holds bytes that can never form a valid frame
    pub error: Option<DecodeError>,
}

/// Take all complete frames out of `inbox`, leaving a partial frame behind
pub fn drain_frames(inbox: &mut Vec<u8>) -> Drained {
    let (frames, rest) = decode_frames::<LinkFrame>(inbox);

    let error = match decode_frame::<LinkFrame>(&rest) {
        Err(DecodeError::Incomplete(_)) => None,
        Err(e) => Some(e),
        Ok(_) => None,
    };

    *inbox = rest;
    Drained { frames, error }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_keeps_partial_frame() {
        let mut inbox = LinkFrame::Hello { peer: 7 }.encode().unwrap();
        let ping = LinkFrame::Ping { seq: 3 }.encode().unwrap();
        inbox.extend_from_slice(&ping[..5]);

        let drained = drain_frames(&mut inbox);
        assert_eq!(drained.frames, vec![LinkFrame::Hello { peer: 7 }]);
        assert!(drained.error.is_none());
        assert_eq!(inbox, ping[..5].to_vec());

        inbox.extend_from_slice(&ping[5..]);
        let drained = drain_frames(&mut inbox);
        assert_eq!(drained.frames, vec![LinkFrame::Ping { seq: 3 }]);
        assert!(inbox.is_empty());
    }

    #[test]
    fn test_drain_empty_buffer() {
        let mut inbox = Vec::new();
        let drained = drain_frames(&mut inbox);
        assert!(drained.frames.is_empty());
        assert!(drained.error.is_none());
    }

    #[test]
    fn test_drain_reports_oversized_frame() {
        let mut inbox = vec![0xff, 0xff, 0xff, 0xff, 0, 0];
        let drained = drain_frames(&mut inbox);
        assert!(drained.frames.is_empty());
        assert!(matches!(drained.error, Some(DecodeError::MessageTooLarge(_))));
    }

    #[test]
    fn test_drain_reports_garbage_body() {
        // Variant index 9 does not exist
        let mut inbox = vec![0, 0, 0, 4, 9, 0, 0, 0];
        let drained = drain_frames(&mut inbox);
        assert!(matches!(drained.error, Some(DecodeError::Deserialization(_))));
    }

    #[test]
    fn test_data_frame_wraps_control_packet() {
        let packet = peer_mesh::encode_packet(&peer_mesh::ControlPacket::Message(b"hi".to_vec())).unwrap();
        let mut inbox = LinkFrame::Data(packet.clone()).encode().unwrap();
        let drained = drain_frames(&mut inbox);
        assert_eq!(drained.frames, vec![LinkFrame::Data(packet)]);
    }
}
