//! Content hashing for manifest identity, duplicate detection, and
//! post-copy verification.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::path::Path;

/// Lowercase-hex BLAKE3 digest of a file's content. Metadata and timestamps
/// never factor in; two files with equal bytes compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix used to stamp quarantine file names.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl From<blake3::Hash> for ContentHash {
    fn from(hash: blake3::Hash) -> Self {
        Self(hash.to_hex().to_string())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChecksumEngine {
    /// Streaming read block size
    block_size: usize,
    /// Files at or above this size are memory-mapped instead of read in blocks
    mmap_threshold: u64,
}

impl Default for ChecksumEngine {
    fn default() -> Self {
        Self {
            block_size: 1024 * 1024,
            mmap_threshold: 16 * 1024 * 1024,
        }
    }
}

impl ChecksumEngine {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(4096),
            ..Self::default()
        }
    }

    /// Hash a file's content without ever holding the whole file in memory.
    ///
    /// Large files go through a memory map; anything else streams in fixed
    /// blocks through the incremental hasher. A file mutated mid-run surfaces
    /// later as a verification failure rather than being guarded here.
    pub fn checksum_file(&self, path: &Path) -> std::io::Result<ContentHash> {
        let file = std::fs::File::open(path)?;
        let metadata = file.metadata()?;
        let mut hasher = blake3::Hasher::new();

        if metadata.len() >= self.mmap_threshold {
            let mmap = unsafe { memmap2::Mmap::map(&file)? };
            hasher.update(&mmap);
        } else {
            let mut reader = file;
            let mut buf = vec![0u8; self.block_size];
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
        }

        Ok(ContentHash::from(hasher.finalize()))
    }

    /// Async wrapper; the hash itself runs on the blocking pool.
    pub async fn checksum_file_async(&self, path: &Path) -> std::io::Result<ContentHash> {
        let engine = *self;
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || engine.checksum_file(&path))
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
    }
}
