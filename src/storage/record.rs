//! Checksummed record files (schema, book-keeping)

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, TileError};
use crate::schema::ArraySchema;

/// Current record format version
pub(crate) const VERSION: u16 = 1;

/// Header size: Magic (4) + Version (2) + PayloadLen (8) = 14 bytes
const HEADER_SIZE: usize = 14;

/// Footer size: CRC32 of the payload
const FOOTER_SIZE: usize = 4;

/// Magic bytes of a persisted schema
pub(crate) const SCHEMA_MAGIC: &[u8; 4] = b"TSSC";

pub(crate) const ARRAY_SCHEMA_FILE: &str = "__array_schema.tdb";
pub(crate) const METADATA_SCHEMA_FILE: &str = "__metadata_schema.tdb";

/// Serialize `value` into a record and write it, fsyncing when `durable`
pub(crate) fn write_record<T: Serialize>(
    path: &Path,
    magic: &[u8; 4],
    value: &T,
    durable: bool,
) -> Result<()> {
    let payload = bincode::serialize(value)?;

    let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len() + FOOTER_SIZE);
    bytes.extend_from_slice(magic);
    bytes.extend_from_slice(&VERSION.to_le_bytes());
    bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    bytes.extend_from_slice(&payload);
    bytes.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    file.write_all(&bytes)?;
    if durable {
        file.sync_all()?;
    }
    Ok(())
}

/// Read and verify a record written by [`write_record`]
pub(crate) fn read_record<T: DeserializeOwned>(path: &Path, magic: &[u8; 4]) -> Result<T> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;

    if bytes.len() < HEADER_SIZE + FOOTER_SIZE || &bytes[0..4] != magic {
        return Err(TileError::Corruption(format!(
            "{} is not a valid record (bad magic or truncated)",
            path.display()
        )));
    }

    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != VERSION {
        return Err(TileError::Corruption(format!(
            "{}: unsupported format version {}",
            path.display(),
            version
        )));
    }

    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&bytes[6..14]);
    let len = u64::from_le_bytes(len_bytes) as usize;
    if bytes.len() != HEADER_SIZE + len + FOOTER_SIZE {
        return Err(TileError::Corruption(format!(
            "{}: payload length {} does not match file size {}",
            path.display(),
            len,
            bytes.len()
        )));
    }

    let payload = &bytes[HEADER_SIZE..HEADER_SIZE + len];
    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&bytes[HEADER_SIZE + len..]);
    if crc32fast::hash(payload) != u32::from_le_bytes(crc_bytes) {
        return Err(TileError::Corruption(format!(
            "{}: checksum mismatch",
            path.display()
        )));
    }

    Ok(bincode::deserialize(payload)?)
}

// =============================================================================
// Schema Files
// =============================================================================

/// Name of the schema file for this kind of schema
pub(crate) fn schema_file(schema: &ArraySchema) -> &'static str {
    if schema.is_keyed() {
        METADATA_SCHEMA_FILE
    } else {
        ARRAY_SCHEMA_FILE
    }
}

/// Persist a schema into its object directory
pub(crate) fn save_schema(dir: &Path, schema: &ArraySchema, durable: bool) -> Result<()> {
    fs::create_dir_all(dir)?;
    write_record(&dir.join(schema_file(schema)), SCHEMA_MAGIC, schema, durable)
}

/// Load whichever schema (array or metadata) an object directory holds
pub(crate) fn load_schema(dir: &Path) -> Result<Option<ArraySchema>> {
    for file in [ARRAY_SCHEMA_FILE, METADATA_SCHEMA_FILE] {
        let path = dir.join(file);
        if path.is_file() {
            return read_record(&path, SCHEMA_MAGIC).map(Some);
        }
    }
    Ok(None)
}

/// fsync a directory so a rename inside it is durable
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    File::open(dir)?.sync_all()?;
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}
