//! # Mutation Batch Encoding and Decoding
//!
//! A batch's mutation list is stored as a single blob in the `mutations`
//! table. The batch id, user and local write time live in their own columns,
//! so the blob only holds the ordered mutations.
//!
//! ## Stored Format
//!
//! ```text
//! codec = 0:  JSON([mutation1, mutation2, ...])
//! codec = 1:  Zstd(JSON([mutation1, mutation2, ...]))
//! checksum:   XXH3-64(stored bytes), little-endian
//! ```
//!
//! Payloads below the configured compression threshold are stored raw.
//! The checksum is verified before anything is decompressed or parsed.

use xxhash_rust::xxh3::xxh3_64;

use crate::error::{Error, Result};
use crate::mutation::Mutation;
use crate::types::BatchId;

/// Uncompressed JSON payload.
pub const CODEC_RAW: i64 = 0;

/// Zstd-compressed JSON payload.
pub const CODEC_ZSTD: i64 = 1;

/// Zstd level; batches are small and written on the hot path.
const ZSTD_LEVEL: i32 = 1;

/// A mutation list ready to be written to the batch store.
#[derive(Debug, Clone)]
pub struct EncodedBatch {
    pub codec: i64,
    pub checksum: Vec<u8>,
    pub data: Vec<u8>,
}

// =============================================================================
// Encoding
// =============================================================================

/// Serializes `mutations`, compressing when the JSON is at least
/// `compression_threshold` bytes long.
pub fn encode_mutations(mutations: &[Mutation], compression_threshold: usize) -> Result<EncodedBatch> {
    let json = serde_json::to_vec(mutations)?;

    let (codec, data) = if json.len() >= compression_threshold {
        (CODEC_ZSTD, zstd::encode_all(json.as_slice(), ZSTD_LEVEL)?)
    } else {
        (CODEC_RAW, json)
    };

    Ok(EncodedBatch {
        codec,
        checksum: compute_checksum(&data),
        data,
    })
}

// =============================================================================
// Decoding
// =============================================================================

/// Verifies and decodes a stored mutation list.
///
/// Any failure (checksum, unknown codec, decompression, JSON, empty list) is
/// reported as [`Error::Corruption`] for `batch_id`.
pub fn decode_mutations(
    batch_id: BatchId,
    codec: i64,
    checksum: &[u8],
    data: &[u8],
) -> Result<Vec<Mutation>> {
    let corruption = |reason: String| Error::Corruption { batch_id, reason };

    if compute_checksum(data) != checksum {
        return Err(corruption("checksum mismatch".to_string()));
    }

    let json = match codec {
        CODEC_RAW => data.to_vec(),
        CODEC_ZSTD => zstd::decode_all(data)
            .map_err(|e| corruption(format!("zstd decompression failed: {e}")))?,
        other => return Err(corruption(format!("unknown codec {other}"))),
    };

    let mutations: Vec<Mutation> = serde_json::from_slice(&json)
        .map_err(|e| corruption(format!("invalid mutation payload: {e}")))?;

    if mutations.is_empty() {
        return Err(corruption("stored batch has no mutations".to_string()));
    }
    Ok(mutations)
}

/// XXH3-64 checksum of stored bytes.
pub fn compute_checksum(data: &[u8]) -> Vec<u8> {
    xxh3_64(data).to_le_bytes().to_vec()
}

// =============================================================================
// Tests
// =============================================================================
