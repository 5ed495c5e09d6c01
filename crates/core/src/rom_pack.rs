//! Packed ROM images.
//!
//! Firmware builds can carry ROMs inside the image itself; those are served
//! through the cache's direct-map path rather than streamed. On the desktop
//! the same thing is a single file holding a small header and the
//! compressed cartridge bytes.
//!
//! ## File format
//!
//! ```text
//! +------------------+
//! | Magic "CSRP"     |  4 bytes
//! +------------------+
//! | Format version   |  u32 little-endian (currently 1)
//! +------------------+
//! | Header length    |  u32 little-endian
//! +------------------+
//! | Header           |  bincode RomPackHeader
//! +------------------+
//! | Compressed ROM   |  deflate stream
//! +------------------+
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::error::PipelineError;
use crate::memory::MemoryPool;
use crate::rom_cache::RomCache;

/// Magic bytes identifying a packed ROM.
pub const MAGIC: &[u8; 4] = b"CSRP";
/// Current packed ROM format version.
const FORMAT_VERSION: u32 = 1;
const PREAMBLE_LEN: usize = 12;

/// Metadata stored in front of the compressed image.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RomPackHeader {
    /// Short identifier, e.g. the file stem
    pub id: String,
    /// Display name
    pub name: String,
    /// Uncompressed size in bytes
    pub size: u32,
    /// Boot this ROM without showing a picker
    pub autoboot: bool,
}

/// A decoded packed ROM.
pub struct PackedRom {
    pub header: RomPackHeader,
    pub data: Arc<[u8]>,
}

/// Returns true when `bytes` starts with the packed ROM magic.
pub fn is_packed(bytes: &[u8]) -> bool {
    bytes.len() >= MAGIC.len() && &bytes[..MAGIC.len()] == MAGIC
}

/// Encode a ROM image into the packed format.
pub fn pack_rom(id: &str, name: &str, rom: &[u8], autoboot: bool) -> Result<Vec<u8>, PipelineError> {
    let size = u32::try_from(rom.len())
        .map_err(|_| PipelineError::InvalidPack(format!("ROM too large ({} bytes)", rom.len())))?;
    let header = RomPackHeader { id: id.to_string(), name: name.to_string(), size, autoboot };
    let header_bytes = bincode::serialize(&header)
        .map_err(|e| PipelineError::InvalidPack(format!("serialize header: {}", e)))?;

    let compressed = miniz_oxide::deflate::compress_to_vec(rom, 6);

    let mut out = Vec::with_capacity(PREAMBLE_LEN + header_bytes.len() + compressed.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Decode a packed ROM, checking magic, version and the inflated size.
pub fn unpack_rom(bytes: &[u8]) -> Result<PackedRom, PipelineError> {
    if bytes.len() < PREAMBLE_LEN {
        return Err(PipelineError::InvalidPack("file too small".into()));
    }
    if !is_packed(bytes) {
        return Err(PipelineError::InvalidPack("bad magic".into()));
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != FORMAT_VERSION {
        return Err(PipelineError::InvalidPack(format!(
            "unsupported version {} (expected {})",
            version, FORMAT_VERSION
        )));
    }
    let header_len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    let body = &bytes[PREAMBLE_LEN..];
    if header_len > body.len() {
        return Err(PipelineError::InvalidPack("truncated header".into()));
    }
    let header: RomPackHeader = bincode::deserialize(&body[..header_len])
        .map_err(|e| PipelineError::InvalidPack(format!("header: {}", e)))?;

    let data = miniz_oxide::inflate::decompress_to_vec(&body[header_len..])
        .map_err(|e| PipelineError::InvalidPack(format!("decompress: {:?}", e)))?;
    if data.len() != header.size as usize {
        return Err(PipelineError::InvalidPack(format!(
            "size mismatch: header says {}, got {}",
            header.size,
            data.len()
        )));
    }
    Ok(PackedRom { header, data: Arc::from(data) })
}

/// Write a packed ROM to disk.
pub fn write_pack(path: &Path, id: &str, name: &str, rom: &[u8], autoboot: bool) -> Result<(), PipelineError> {
    let bytes = pack_rom(id, name, rom, autoboot)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Read and decode a packed ROM from disk.
pub fn read_pack(path: &Path) -> Result<PackedRom, PipelineError> {
    let bytes = std::fs::read(path)?;
    unpack_rom(&bytes)
}

impl RomCache {
    /// Inflate a packed image and serve it through the direct-map path.
    pub fn open_packed(&mut self, bytes: &[u8], pool: &mut MemoryPool) -> Result<RomPackHeader, PipelineError> {
        let packed = unpack_rom(bytes)?;
        log::info!("Packed ROM '{}' ({})", packed.header.name, packed.header.id);
        self.open_memory(packed.data, pool)?;
        Ok(packed.header)
    }
}
