//! Checksums used on the wire.
//!
//! - CRC-16/XMODEM (poly 0x1021, init 0) protects each firmware block frame.
//! - CRC-32 (IEEE 802.3, reflected, poly 0xEDB88320) covers the whole image
//!   and is what the controller reports back during verification.

const CRC16_POLYNOMIAL: u16 = 0x1021;

const CRC32_POLYNOMIAL: u32 = 0xEDB8_8320;

/// Calculate CRC-16/XMODEM.
pub fn crc16_xmodem(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;

    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ CRC16_POLYNOMIAL;
            } else {
                crc <<= 1;
            }
        }
    }

    crc
}

/// Incremental CRC-32 (IEEE) hasher.
#[derive(Debug, Clone, Copy)]
pub struct Crc32 {
    state: u32,
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

impl Crc32 {
    /// Start a new checksum.
    pub fn new() -> Self {
        Self { state: 0xFFFF_FFFF }
    }

    /// Feed more bytes.
    pub fn update(&mut self, data: &[u8]) {
        let mut crc = self.state;
        for &byte in data {
            crc ^= u32::from(byte);
            for _ in 0..8 {
                let mask = (crc & 1).wrapping_neg();
                crc = (crc >> 1) ^ (CRC32_POLYNOMIAL & mask);
            }
        }
        self.state = crc;
    }

    /// Final checksum value.
    pub fn finish(self) -> u32 {
        !self.state
    }
}

/// Calculate CRC-32 (IEEE) of a whole buffer.
pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_xmodem_check_value() {
        assert_eq!(crc16_xmodem(b"123456789"), 0x31C3);
        assert_eq!(crc16_xmodem(&[]), 0);
    }

    #[test]
    fn test_crc32_check_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(&[]), 0);
    }

    #[test]
    fn test_crc32_incremental_matches_one_shot() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1500).collect();
        let mut hasher = Crc32::new();
        for chunk in data.chunks(512) {
            hasher.update(chunk);
        }
        assert_eq!(hasher.finish(), crc32(&data));
    }
}
