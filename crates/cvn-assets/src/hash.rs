// SPDX-License-Identifier: MIT OR Apache-2.0
//! Streaming content hashing.

use blake2::{Blake2s256, Digest};
use std::io::Read;
use std::path::Path;

/// Read buffer size; files are never loaded whole.
const HASH_BUF_SIZE: usize = 64 * 1024;

/// BLAKE2s-256 hex digest of the file at `path`, streamed in fixed buffers.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Blake2s256::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// BLAKE2s-256 hex digest of an in-memory byte slice.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Blake2s256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
