use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{CoreError, CoreResult};

/// Gzip-compresses an entity payload for storage. The stored bytes are
/// treated as opaque afterwards: fork copies them verbatim and resolution
/// hands them back without a decompress/recompress cycle.
pub fn compress_payload(payload: &serde_json::Value) -> CoreResult<Vec<u8>> {
    let raw = serde_json::to_vec(payload)
        .map_err(|err| CoreError::integrity(format!("unserializable payload: {err}")))?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&raw)
        .and_then(|_| encoder.finish())
        .map_err(|err| CoreError::integrity(format!("gzip encode failed: {err}")))
}

/// Inverse of [`compress_payload`]. Corrupt bytes surface as `Integrity`.
pub fn decompress_payload(bytes: &[u8]) -> CoreResult<serde_json::Value> {
    let mut decoder = GzDecoder::new(bytes);
    let mut raw = Vec::new();
    decoder
        .read_to_end(&mut raw)
        .map_err(|err| CoreError::integrity(format!("gzip decode failed: {err}")))?;
    serde_json::from_slice(&raw)
        .map_err(|err| CoreError::integrity(format!("stored payload is not valid JSON: {err}")))
}
