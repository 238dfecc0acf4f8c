//! Tile compression kernels

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::{Result, TileError};
use crate::schema::Compressor;

/// zstd level used for every tile
const ZSTD_LEVEL: i32 = 3;

/// Compress one tile
pub(crate) fn compress(compressor: Compressor, data: &[u8]) -> Result<Vec<u8>> {
    match compressor {
        Compressor::None => Ok(data.to_vec()),
        Compressor::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(data)
                .map_err(|e| TileError::Codec(format!("gzip compression failed: {}", e)))?;
            encoder
                .finish()
                .map_err(|e| TileError::Codec(format!("gzip compression failed: {}", e)))
        }
        Compressor::Zstd => zstd::encode_all(data, ZSTD_LEVEL)
            .map_err(|e| TileError::Codec(format!("zstd compression failed: {}", e))),
    }
}

/// Decompress one tile, checking the decoded size
pub(crate) fn decompress(compressor: Compressor, data: &[u8], raw_size: usize) -> Result<Vec<u8>> {
    let out = match compressor {
        Compressor::None => data.to_vec(),
        Compressor::Gzip => {
            let mut out = Vec::with_capacity(raw_size);
            GzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| TileError::Codec(format!("gzip decompression failed: {}", e)))?;
            out
        }
        Compressor::Zstd => zstd::decode_all(data)
            .map_err(|e| TileError::Codec(format!("zstd decompression failed: {}", e)))?,
    };

    if out.len() != raw_size {
        return Err(TileError::Corruption(format!(
            "tile decoded to {} bytes, expected {}",
            out.len(),
            raw_size
        )));
    }
    Ok(out)
}
