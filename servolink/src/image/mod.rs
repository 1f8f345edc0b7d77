//! Firmware images for over-the-air updates.
//!
//! An image is an immutable byte buffer with its CRC-32, cut into fixed-size
//! blocks for transfer (the last block may be short).
//!
//! ESP32 application images are recognised and their app descriptor is
//! exposed for display:
//!
//! ```text
//! +---------------------+  offset 0
//! | image header (24B)  |  magic 0xE9
//! +---------------------+  offset 24
//! | segment header (8B) |
//! +---------------------+  offset 32
//! | app descriptor      |  magic 0xABCD5432
//! |   +16 version[32]   |
//! |   +48 project[32]   |
//! |  +112 idf_ver[32]   |
//! +---------------------+
//! ```

use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};
use log::debug;

use crate::error::{Error, Result};
use crate::protocol::crc::crc32;

/// Largest accepted image (16 MiB flash).
pub const MAX_IMAGE_SIZE: usize = 16 * 1024 * 1024;

/// First byte of an ESP32 application image.
pub const ESP_IMAGE_MAGIC: u8 = 0xE9;

/// Magic word of the ESP-IDF application descriptor.
pub const ESP_APP_DESC_MAGIC: u32 = 0xABCD_5432;

const APP_DESC_OFFSET: usize = 32;
const APP_DESC_LEN: usize = 144;

/// Application metadata embedded in ESP-IDF images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDescriptor {
    /// Application version string.
    pub version: String,
    /// Project name.
    pub project_name: String,
    /// ESP-IDF version used to build the image.
    pub idf_version: String,
}

impl AppDescriptor {
    /// Read the descriptor at its fixed offset, if present.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < APP_DESC_OFFSET + APP_DESC_LEN || data[0] != ESP_IMAGE_MAGIC {
            return None;
        }
        let desc = &data[APP_DESC_OFFSET..APP_DESC_OFFSET + APP_DESC_LEN];
        let mut cursor = Cursor::new(desc);
        if cursor.read_u32::<LittleEndian>().ok()? != ESP_APP_DESC_MAGIC {
            return None;
        }

        Some(Self {
            version: c_string(&desc[16..48]),
            project_name: c_string(&desc[48..80]),
            idf_version: c_string(&desc[112..144]),
        })
    }
}

fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&c| c == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).to_string()
}

/// A firmware image ready for transfer.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    data: Vec<u8>,
    crc32: u32,
    block_size: u16,
    app: Option<AppDescriptor>,
}

impl FirmwareImage {
    /// Load an image from a file.
    pub fn from_file<P: AsRef<Path>>(path: P, block_size: u16) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading firmware image from: {}", path.display());

        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;

        Self::from_bytes(data, block_size)
    }

    /// Wrap raw bytes.
    pub fn from_bytes(data: Vec<u8>, block_size: u16) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::InvalidImage("image is empty".into()));
        }
        if data.len() > MAX_IMAGE_SIZE {
            return Err(Error::InvalidImage(format!(
                "image is {} bytes, limit is {MAX_IMAGE_SIZE}",
                data.len()
            )));
        }
        if block_size == 0 {
            return Err(Error::InvalidImage("block size must be positive".into()));
        }
        let blocks = data.len().div_ceil(usize::from(block_size));
        if blocks > usize::from(u16::MAX) {
            return Err(Error::InvalidImage(format!(
                "{blocks} blocks of {block_size} bytes exceed the block index range"
            )));
        }

        let crc32 = crc32(&data);
        let app = AppDescriptor::parse(&data);
        debug!(
            "Image: {} bytes, {blocks} blocks, CRC32 {crc32:08X}{}",
            data.len(),
            app.as_ref()
                .map(|a| format!(", {} {}", a.project_name, a.version))
                .unwrap_or_default()
        );

        Ok(Self {
            data,
            crc32,
            block_size,
            app,
        })
    }

    /// Image size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Always false; empty images are rejected on construction.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Raw image bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// CRC-32 of the whole image.
    pub fn crc32(&self) -> u32 {
        self.crc32
    }

    /// Block payload size.
    pub fn block_size(&self) -> u16 {
        self.block_size
    }

    /// Number of blocks.
    pub fn block_count(&self) -> u16 {
        // Bounded on construction.
        u16::try_from(self.data.len().div_ceil(usize::from(self.block_size))).unwrap_or(u16::MAX)
    }

    /// Payload of block `index`.
    pub fn block(&self, index: u16) -> Option<&[u8]> {
        self.data
            .chunks(usize::from(self.block_size))
            .nth(usize::from(index))
    }

    /// All blocks with their indices.
    pub fn blocks(&self) -> impl Iterator<Item = (u16, &[u8])> {
        (0..self.block_count()).zip(self.data.chunks(usize::from(self.block_size)))
    }

    /// ESP-IDF application descriptor, if this is an ESP32 app image.
    pub fn app_descriptor(&self) -> Option<&AppDescriptor> {
        self.app.as_ref()
    }
}
