//! Content hashing for downloaded assets.
//!
//! Everything here is SHA-256. Files are read in fixed 4 KiB blocks so memory
//! use stays flat no matter how large the weights are.

use std::{
    fmt,
    fs::File,
    io::{self, Read},
    path::Path,
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// Block size used when hashing files from disk.
pub const HASH_BLOCK_SIZE: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("invalid SHA-256 digest: {0:?}")]
    InvalidDigest(String),
}

/// A SHA-256 digest, stored as 64 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(bytes))
    }
}

impl FromStr for Digest {
    type Err = VerifyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let normalized = trimmed
            .strip_prefix("sha256:")
            .unwrap_or(trimmed)
            .to_ascii_lowercase();
        if normalized.len() != 64 || !normalized.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(VerifyError::InvalidDigest(s.to_string()));
        }
        Ok(Self(normalized))
    }
}

impl TryFrom<String> for Digest {
    type Error = VerifyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Incremental hasher fed chunk by chunk while a transfer streams.
#[derive(Default, Clone)]
pub struct StreamHasher(Sha256);

impl StreamHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> Digest {
        Digest::from_bytes(&self.0.finalize())
    }
}

/// Hash any reader in [`HASH_BLOCK_SIZE`] blocks.
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<Digest> {
    let mut hasher = StreamHasher::new();
    let mut buf = [0u8; HASH_BLOCK_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

/// Compute the SHA-256 digest of a file on disk.
#[tracing::instrument(level = "trace")]
pub fn hash_file(path: &Path) -> io::Result<Digest> {
    let file = File::open(path)?;
    hash_reader(file)
}

/// Whether the file at `path` exists and hashes to `expected`.
///
/// Missing or unreadable files never match.
pub fn matches(path: &Path, expected: &Digest) -> bool {
    match hash_file(path) {
        Ok(actual) => &actual == expected,
        Err(e) => {
            tracing::trace!(path = ?path, error = %e, "Could not hash file");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const HELLO_WORLD: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_hash_reader_known_value() {
        let digest = hash_reader(Cursor::new(b"hello world")).unwrap();
        assert_eq!(digest.as_str(), HELLO_WORLD);
    }

    #[test]
    fn test_stream_hasher_matches_file_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        // spans several hash blocks and ends mid-block
        let data: Vec<u8> = (0..(HASH_BLOCK_SIZE * 3 + 17)).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let mut hasher = StreamHasher::new();
        for chunk in data.chunks(1000) {
            hasher.update(chunk);
        }
        assert_eq!(hasher.finalize(), hash_file(&path).unwrap());
    }

    #[test]
    fn test_digest_parsing() {
        let upper = HELLO_WORLD.to_uppercase();
        let parsed: Digest = upper.parse().unwrap();
        assert_eq!(parsed.as_str(), HELLO_WORLD);

        let prefixed: Digest = format!("sha256:{HELLO_WORLD}").parse().unwrap();
        assert_eq!(prefixed, parsed);

        assert!("abc".parse::<Digest>().is_err());
        assert!("z".repeat(64).parse::<Digest>().is_err());
    }

    #[test]
    fn test_matches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, b"hello world").unwrap();

        let good: Digest = HELLO_WORLD.parse().unwrap();
        let bad: Digest = "0".repeat(64).parse().unwrap();
        assert!(matches(&path, &good));
        assert!(!matches(&path, &bad));
        assert!(!matches(&dir.path().join("missing"), &good));
    }

    #[test]
    fn test_digest_serde_roundtrip_rejects_garbage() {
        let json = format!("\"{}\"", HELLO_WORLD);
        let digest: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(serde_json::to_string(&digest).unwrap(), json);
        assert!(serde_json::from_str::<Digest>("\"nope\"").is_err());
    }
}
