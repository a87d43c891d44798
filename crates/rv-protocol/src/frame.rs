//! Frame header encoding/decoding
//!
//! The frame format uses a 4-byte header:
//! - name_length: 1 byte (u8)
//! - body_length: 3 bytes (u24, big-endian, max 16MB)
//!
//! The header is followed by the UTF-8 event name and then the body.

use bytes::{Buf, BufMut, BytesMut};

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 4;

/// Maximum body size (16MB - 1, limited by 24-bit length field)
pub const MAX_BODY_SIZE: usize = 0x00FF_FFFF;

/// Frame header containing the lengths of the name and body sections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Length of the event name in bytes
    pub name_length: u8,
    /// Length of the body in bytes
    pub body_length: u32,
}

impl FrameHeader {
    /// Create a new frame header
    pub fn new(name_length: u8, body_length: u32) -> Self {
        Self {
            name_length,
            body_length,
        }
    }

    /// Total bytes following the header
    pub fn frame_length(&self) -> usize {
        self.name_length as usize + self.body_length as usize
    }

    /// Encode the header into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u8(self.name_length);
        // body_length: 3 bytes big-endian (24-bit)
        dst.put_u8((self.body_length >> 16) as u8);
        dst.put_u16(self.body_length as u16);
    }

    /// Decode a header from a byte buffer
    ///
    /// Returns None if there aren't enough bytes in the buffer.
    pub fn decode(src: &mut BytesMut) -> Option<Self> {
        if src.len() < HEADER_SIZE {
            return None;
        }

        let name_length = src.get_u8();
        let len_high = src.get_u8() as u32;
        let len_low = src.get_u16() as u32;

        Some(Self {
            name_length,
            body_length: (len_high << 16) | len_low,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = FrameHeader::new(17, 12345);

        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);

        let decoded = FrameHeader::decode(&mut buf).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.frame_length(), 17 + 12345);
    }

    #[test]
    fn test_max_body_length() {
        let header = FrameHeader::new(4, MAX_BODY_SIZE as u32);

        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        let decoded = FrameHeader::decode(&mut buf).unwrap();
        assert_eq!(decoded.body_length, MAX_BODY_SIZE as u32);
    }

    #[test]
    fn test_insufficient_bytes() {
        let mut buf = BytesMut::from(&[0u8; 3][..]);
        assert!(FrameHeader::decode(&mut buf).is_none());
        assert_eq!(buf.len(), 3);
    }
}
