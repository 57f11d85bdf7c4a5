//! Test fixtures for generating test data.

use bytes::Bytes;
use sha2::{Digest, Sha256};
use stowage_core::{CompletionFile, CompletionJob, UploadMetadata};

/// PNG file signature.
pub const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

/// Generate deterministic test data based on a seed.
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    for chunk in data.chunks_mut(8) {
        // Simple LCG for deterministic data
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

/// Deterministic bytes that start with a PNG signature.
#[allow(dead_code)]
pub fn png_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = seeded_bytes(seed, len).to_vec();
    let magic = PNG_MAGIC.len().min(len);
    data[..magic].copy_from_slice(&PNG_MAGIC[..magic]);
    Bytes::from(data)
}

/// Compute SHA-256 hash of data as hex string.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub fn sha256_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    result.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Upload metadata for a file in form `contact`, submission `sub-1`.
#[allow(dead_code)]
pub fn upload_metadata(filename: &str, filetype: &str, data: &[u8]) -> UploadMetadata {
    UploadMetadata {
        filename: filename.to_string(),
        filetype: filetype.to_string(),
        form_id: "contact".to_string(),
        submission_id: "sub-1".to_string(),
        field: Some("attachment".to_string()),
        checksum: sha256_hash(data),
    }
}

/// A completion job for an object already staged at `temp_key`.
#[allow(dead_code)]
pub fn completion_job(temp_key: &str, data: &[u8], declared_checksum: &str) -> CompletionJob {
    CompletionJob::new(
        "contact",
        "sub-1",
        Some("attachment".to_string()),
        CompletionFile {
            temp_key: temp_key.to_string(),
            final_name_hint: "photo.png".to_string(),
            declared_checksum: declared_checksum.to_string(),
            size: data.len() as u64,
            content_type: "image/png".to_string(),
        },
    )
}
