//! Binary channel framing.
//!
//! ```text
//! [channel_id:1][protocol_tag:2, big-endian][body:N][footer:1]
//! ```
//!
//! The footer byte closes every frame. Decoding ignores its value; encoding
//! always writes [`FRAME_FOOTER`].

use thiserror::Error;

pub const MIN_FRAME_LEN: usize = 4;
pub const FRAME_FOOTER: u8 = 0x00;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame of {len} bytes is shorter than the {MIN_FRAME_LEN}-byte minimum")]
    TooShort { len: usize },
    #[error("text messages are not part of the channel protocol")]
    TextMessage,
}

/// Header and body of one inbound frame, before routing context is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel_id: u8,
    pub protocol_tag: u16,
    pub body: Vec<u8>,
}

/// A frame handed to the dispatch hook, carrying the owning session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub channel_id: u8,
    pub protocol_tag: u16,
    pub subject: String,
    pub connection_id: String,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn into_dispatch(self, subject: &str, connection_id: &str) -> DecodedFrame {
        DecodedFrame {
            channel_id: self.channel_id,
            protocol_tag: self.protocol_tag,
            subject: subject.to_owned(),
            connection_id: connection_id.to_owned(),
            body: self.body,
        }
    }
}

pub fn decode(raw: &[u8]) -> Result<Frame, FrameError> {
    if raw.len() < MIN_FRAME_LEN {
        return Err(FrameError::TooShort { len: raw.len() });
    }
    let protocol_tag = (u16::from(raw[1]) << 8) | u16::from(raw[2]);
    Ok(Frame {
        channel_id: raw[0],
        protocol_tag,
        body: raw[3..raw.len() - 1].to_vec(),
    })
}

pub fn encode(channel_id: u8, protocol_tag: u16, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + MIN_FRAME_LEN);
    out.push(channel_id);
    out.extend_from_slice(&protocol_tag.to_be_bytes());
    out.extend_from_slice(body);
    out.push(FRAME_FOOTER);
    out
}

#[cfg(test)]
mod tests {
    use super::{decode, encode, FrameError, FRAME_FOOTER};

    #[test]
    fn decodes_reference_frame_and_drops_footer() {
        let frame = decode(&[0x02, 0x00, 0x05, 0xAA, 0xBB, 0xFF]).expect("frame");
        assert_eq!(frame.channel_id, 2);
        assert_eq!(frame.protocol_tag, 0x0005);
        assert_eq!(frame.body, vec![0xAA, 0xBB]);
    }

    #[test]
    fn protocol_tag_combines_both_header_bytes() {
        let frame = decode(&[0x01, 0x12, 0x34, 0x00]).expect("frame");
        assert_eq!(frame.protocol_tag, 0x1234);
        assert!(frame.body.is_empty());

        let frame = decode(&[0x01, 0xFF, 0xFF, 0x00]).expect("frame");
        assert_eq!(frame.protocol_tag, u16::MAX);
    }

    #[test]
    fn rejects_frames_below_minimum_length() {
        for len in 0..4 {
            let raw = vec![0x01; len];
            assert_eq!(decode(&raw), Err(FrameError::TooShort { len }));
        }
    }

    #[test]
    fn channel_ids_cover_full_unsigned_range() {
        for byte in 0..=u8::MAX {
            let frame = decode(&[byte, 0x00, 0x01, 0x00]).expect("frame");
            assert_eq!(frame.channel_id, byte);
        }
        assert_eq!(decode(&[0x80, 0, 0, 0]).expect("frame").channel_id, 128);
    }

    #[test]
    fn decoding_is_deterministic() {
        let raw = [0xC8, 0x01, 0x02, 0x10, 0x20, 0x30, 0x7F];
        assert_eq!(decode(&raw), decode(&raw));
    }

    #[test]
    fn footer_value_is_not_validated() {
        let a = decode(&[0x03, 0x00, 0x09, 0x41, 0x00]).expect("frame");
        let b = decode(&[0x03, 0x00, 0x09, 0x41, 0xEE]).expect("frame");
        assert_eq!(a, b);
    }

    #[test]
    fn encode_writes_big_endian_tag_and_footer() {
        let raw = encode(7, 0x0102, b"hi");
        assert_eq!(raw, vec![7, 0x01, 0x02, b'h', b'i', FRAME_FOOTER]);
        let frame = decode(&raw).expect("frame");
        assert_eq!(frame.body, b"hi".to_vec());
    }

    #[test]
    fn dispatch_context_is_attached() {
        let frame = decode(&[0x04, 0x00, 0x01, 0x99, 0x00]).expect("frame");
        let decoded = frame.into_dispatch("alice", "conn-1");
        assert_eq!(decoded.subject, "alice");
        assert_eq!(decoded.connection_id, "conn-1");
        assert_eq!(decoded.body, vec![0x99]);
    }
}
