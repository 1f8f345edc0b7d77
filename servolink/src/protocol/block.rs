//! Firmware block frames.
//!
//! ## Frame Format
//!
//! ```text
//! +-----+-------+--------+-----+----------+--------+
//! | STX | index | ~index | len |   data   | CRC16  |
//! +-----+-------+--------+-----+----------+--------+
//! |  1  |   2   |   2    |  2  |   len    |   2    |
//! +-----+-------+--------+-----+----------+--------+
//! ```
//!
//! Multi-byte fields are little-endian. CRC16 is CRC-16/XMODEM over `data`.
//! The device answers each frame with `OTA_ACK:index` or `OTA_NAK:index`.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::error::{Error, Result};
use crate::protocol::crc::crc16_xmodem;

/// Start of a block frame.
pub const STX: u8 = 0x02;

/// Bytes before the payload.
pub const HEADER_LEN: usize = 7;

/// Bytes after the payload.
pub const TRAILER_LEN: usize = 2;

/// Default block payload size.
pub const DEFAULT_BLOCK_SIZE: u16 = 512;

/// One firmware block on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockFrame {
    /// Zero-based block index.
    pub index: u16,
    /// Payload bytes.
    pub data: Vec<u8>,
}

impl BlockFrame {
    /// Create a frame for block `index`.
    pub fn new(index: u16, data: &[u8]) -> Self {
        Self {
            index,
            data: data.to_vec(),
        }
    }

    /// Total encoded length.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.data.len() + TRAILER_LEN
    }

    /// Build the wire bytes.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn build(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(self.encoded_len());
        frame.push(STX);
        frame.write_u16::<LittleEndian>(self.index).unwrap();
        frame.write_u16::<LittleEndian>(!self.index).unwrap();
        let len = u16::try_from(self.data.len()).unwrap_or(u16::MAX);
        frame.write_u16::<LittleEndian>(len).unwrap();
        frame.extend_from_slice(&self.data);
        frame
            .write_u16::<LittleEndian>(crc16_xmodem(&self.data))
            .unwrap();
        frame
    }

    /// Total frame length announced by a buffered header, if complete enough.
    pub fn peek_len(buf: &[u8]) -> Option<usize> {
        if buf.len() < HEADER_LEN || buf[0] != STX {
            return None;
        }
        Some(HEADER_LEN + usize::from(LittleEndian::read_u16(&buf[5..7])) + TRAILER_LEN)
    }

    /// Decode a complete frame, checking the index complement and CRC.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let total = Self::peek_len(buf)
            .ok_or_else(|| Error::Protocol("block frame header missing".into()))?;
        if buf.len() < total {
            return Err(Error::Protocol(format!(
                "block frame truncated: {} of {total} bytes",
                buf.len()
            )));
        }

        let index = LittleEndian::read_u16(&buf[1..3]);
        let inverted = LittleEndian::read_u16(&buf[3..5]);
        if index != !inverted {
            return Err(Error::Protocol(format!(
                "block index {index} does not match complement {inverted:#06x}"
            )));
        }

        let data = &buf[HEADER_LEN..total - TRAILER_LEN];
        let crc = LittleEndian::read_u16(&buf[total - TRAILER_LEN..total]);
        let actual = crc16_xmodem(data);
        if crc != actual {
            return Err(Error::Protocol(format!(
                "block {index} CRC mismatch: frame {crc:#06x}, data {actual:#06x}"
            )));
        }

        Ok(Self::new(index, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_layout() {
        let frame = BlockFrame::new(3, &[0xAA, 0xBB, 0xCC]).build();
        assert_eq!(frame.len(), HEADER_LEN + 3 + TRAILER_LEN);
        assert_eq!(frame[0], STX);
        assert_eq!(&frame[1..3], &[0x03, 0x00]);
        assert_eq!(&frame[3..5], &[0xFC, 0xFF]);
        assert_eq!(&frame[5..7], &[0x03, 0x00]);
        assert_eq!(&frame[7..10], &[0xAA, 0xBB, 0xCC]);

        let crc = crc16_xmodem(&[0xAA, 0xBB, 0xCC]);
        assert_eq!(&frame[10..12], &crc.to_le_bytes());
    }

    #[test]
    fn test_parse_rejects_corruption() {
        let mut frame = BlockFrame::new(9, b"firmware").build();
        assert_eq!(BlockFrame::peek_len(&frame), Some(frame.len()));
        assert!(BlockFrame::parse(&frame).is_ok());

        frame[HEADER_LEN] ^= 0xFF;
        assert!(matches!(
            BlockFrame::parse(&frame),
            Err(Error::Protocol(msg)) if msg.contains("CRC")
        ));
    }

    #[test]
    fn test_parse_truncated_and_bad_complement() {
        let frame = BlockFrame::new(1, b"abcd").build();
        assert!(BlockFrame::parse(&frame[..frame.len() - 1]).is_err());
        assert_eq!(BlockFrame::peek_len(&frame[..4]), None);

        let mut bad = frame.clone();
        bad[3] = 0x00;
        assert!(BlockFrame::parse(&bad).is_err());
    }
}
