//! Streaming checksum engine.
//!
//! One hasher instance feeds bytes as they arrive from the network or from
//! disk and produces a lowercase hex digest at the end. Workers keep one
//! hasher per segment; the orchestrator runs a fresh one over the merged
//! output file. A hasher is consumed by [`StreamingHasher::finalize`] and is
//! deliberately not resettable - create a new instance per stream.

use std::path::Path;
use std::time::Instant;

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::error::{DownloadError, DownloadResult};

/// Buffer size for reading files during checksum calculation (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    /// Parse an algorithm name as it appears in tool arguments.
    pub fn parse(name: &str) -> DownloadResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "sha1" | "sha-1" => Ok(Self::Sha1),
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "sha512" | "sha-512" => Ok(Self::Sha512),
            other => Err(DownloadError::UnsupportedAlgorithm {
                name: other.to_string(),
            }),
        }
    }

    /// Canonical lowercase name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }
}

impl Default for HashAlgorithm {
    fn default() -> Self {
        Self::Sha256
    }
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Incremental hasher over one byte stream.
///
/// Wraps the concrete digest state behind one enum so callers can hold a
/// hasher for any configured algorithm without generics at the seam.
pub struct StreamingHasher {
    state: HasherState,
    bytes: u64,
}

enum HasherState {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
    Sha512(Sha512),
}

impl StreamingHasher {
    /// Create a fresh hasher for the given algorithm.
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let state = match algorithm {
            HashAlgorithm::Md5 => HasherState::Md5(Md5::new()),
            HashAlgorithm::Sha1 => HasherState::Sha1(Sha1::new()),
            HashAlgorithm::Sha256 => HasherState::Sha256(Sha256::new()),
            HashAlgorithm::Sha512 => HasherState::Sha512(Sha512::new()),
        };
        Self { state, bytes: 0 }
    }

    /// Feed a chunk of bytes.
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            HasherState::Md5(h) => h.update(data),
            HasherState::Sha1(h) => h.update(data),
            HasherState::Sha256(h) => h.update(data),
            HasherState::Sha512(h) => h.update(data),
        }
        self.bytes += data.len() as u64;
    }

    /// Total bytes fed so far.
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    /// Consume the hasher and produce the lowercase hex digest.
    pub fn finalize(self) -> String {
        match self.state {
            HasherState::Md5(h) => format!("{:x}", h.finalize()),
            HasherState::Sha1(h) => format!("{:x}", h.finalize()),
            HasherState::Sha256(h) => format!("{:x}", h.finalize()),
            HasherState::Sha512(h) => format!("{:x}", h.finalize()),
        }
    }
}

impl std::fmt::Debug for StreamingHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self.state {
            HasherState::Md5(_) => "md5",
            HasherState::Sha1(_) => "sha1",
            HasherState::Sha256(_) => "sha256",
            HasherState::Sha512(_) => "sha512",
        };
        f.debug_struct("StreamingHasher")
            .field("algorithm", &name)
            .field("bytes", &self.bytes)
            .finish()
    }
}

/// Outcome of verifying a file against an optional expected digest.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationResult {
    /// Digest actually computed over the file.
    pub actual: String,
    /// Expected digest, if one was supplied.
    pub expected: Option<String>,
    /// True when no expectation was given or the digests match.
    pub ok: bool,
    /// Number of bytes hashed.
    pub bytes: u64,
    /// Wall time spent hashing, in milliseconds.
    pub elapsed_ms: u64,
}

/// Compute a file's digest, comparing against `expected` when given.
///
/// Comparison is case-insensitive on the hex text. The file is read in 64KB
/// chunks so large files never occupy memory wholesale.
pub async fn verify_file(
    path: &Path,
    algorithm: HashAlgorithm,
    expected: Option<&str>,
) -> DownloadResult<VerificationResult> {
    let started = Instant::now();
    let mut file = File::open(path)
        .await
        .map_err(|e| DownloadError::from_io(path, e))?;

    let mut hasher = StreamingHasher::new(algorithm);
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let n = file
            .read(&mut buffer)
            .await
            .map_err(|e| DownloadError::from_io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    let bytes = hasher.bytes_hashed();
    let actual = hasher.finalize();
    let ok = match expected {
        Some(want) => actual.eq_ignore_ascii_case(want),
        None => true,
    };

    Ok(VerificationResult {
        actual,
        expected: expected.map(|s| s.to_ascii_lowercase()),
        ok,
        bytes,
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}

/// Verify a set of part files against their recorded segment checksums.
///
/// Returns one result per `(path, expected)` pair, in input order. A missing
/// part file is an error; a missing expectation verifies as `ok`.
pub async fn verify_segments(
    parts: &[(std::path::PathBuf, Option<String>)],
    algorithm: HashAlgorithm,
) -> DownloadResult<Vec<VerificationResult>> {
    let mut results = Vec::with_capacity(parts.len());
    for (path, expected) in parts {
        results.push(verify_file(path, algorithm, expected.as_deref()).await?);
    }
    Ok(results)
}

/// Compare two files by digest.
pub async fn compare_files(a: &Path, b: &Path, algorithm: HashAlgorithm) -> DownloadResult<bool> {
    let left = verify_file(a, algorithm, None).await?;
    let right = verify_file(b, algorithm, None).await?;
    Ok(left.actual == right.actual)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_algorithm() {
        assert_eq!(HashAlgorithm::parse("sha256").unwrap(), HashAlgorithm::Sha256);
        assert_eq!(HashAlgorithm::parse("SHA-1").unwrap(), HashAlgorithm::Sha1);
        assert_eq!(HashAlgorithm::parse("md5").unwrap(), HashAlgorithm::Md5);
        assert_eq!(HashAlgorithm::parse("sha512").unwrap(), HashAlgorithm::Sha512);
    }

    #[test]
    fn test_parse_unknown_algorithm() {
        let err = HashAlgorithm::parse("crc32").unwrap_err();
        assert_eq!(err.code(), "UnsupportedAlgorithm");
    }

    #[test]
    fn test_streaming_hasher_sha256() {
        let mut hasher = StreamingHasher::new(HashAlgorithm::Sha256);
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.bytes_hashed(), 11);
        assert_eq!(
            hasher.finalize(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_streaming_hasher_md5() {
        let mut hasher = StreamingHasher::new(HashAlgorithm::Md5);
        hasher.update(b"hello world");
        assert_eq!(hasher.finalize(), "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn test_streaming_hasher_sha1() {
        let mut hasher = StreamingHasher::new(HashAlgorithm::Sha1);
        hasher.update(b"hello world");
        assert_eq!(hasher.finalize(), "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed");
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let mut incremental = StreamingHasher::new(HashAlgorithm::Sha256);
        for chunk in b"some longer payload split into pieces".chunks(5) {
            incremental.update(chunk);
        }

        let mut oneshot = StreamingHasher::new(HashAlgorithm::Sha256);
        oneshot.update(b"some longer payload split into pieces");

        assert_eq!(incremental.finalize(), oneshot.finalize());
    }

    #[tokio::test]
    async fn test_verify_file_match() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data.bin");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        let result = verify_file(
            &path,
            HashAlgorithm::Sha256,
            Some("B94D27B9934D3E08A52E52D7DA7DABFAC484EFE37A5380EE9088F7ACE2EFCDE9"),
        )
        .await
        .unwrap();

        assert!(result.ok, "comparison should be case-insensitive");
        assert_eq!(result.bytes, 11);
    }

    #[tokio::test]
    async fn test_verify_file_mismatch() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data.bin");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        let result = verify_file(&path, HashAlgorithm::Sha256, Some("deadbeef"))
            .await
            .unwrap();

        assert!(!result.ok);
        assert_ne!(result.actual, "deadbeef");
    }

    #[tokio::test]
    async fn test_verify_empty_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("empty.bin");
        tokio::fs::write(&path, b"").await.unwrap();

        let result = verify_file(&path, HashAlgorithm::Sha256, None).await.unwrap();

        assert_eq!(result.bytes, 0);
        assert_eq!(
            result.actual,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn test_verify_missing_file() {
        let err = verify_file(Path::new("/nonexistent/file.bin"), HashAlgorithm::Sha256, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "FileSystemNotFound");
    }

    #[tokio::test]
    async fn test_compare_files() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a.bin");
        let b = temp.path().join("b.bin");
        let c = temp.path().join("c.bin");
        tokio::fs::write(&a, b"same content").await.unwrap();
        tokio::fs::write(&b, b"same content").await.unwrap();
        tokio::fs::write(&c, b"different").await.unwrap();

        assert!(compare_files(&a, &b, HashAlgorithm::Sha256).await.unwrap());
        assert!(!compare_files(&a, &c, HashAlgorithm::Sha256).await.unwrap());
    }

    #[tokio::test]
    async fn test_verify_segments_in_order() {
        let temp = TempDir::new().unwrap();
        let p0 = temp.path().join("out.part0");
        let p1 = temp.path().join("out.part1");
        tokio::fs::write(&p0, b"first").await.unwrap();
        tokio::fs::write(&p1, b"second").await.unwrap();

        let mut h = StreamingHasher::new(HashAlgorithm::Sha256);
        h.update(b"first");
        let first_digest = h.finalize();

        let parts = vec![(p0, Some(first_digest)), (p1, None)];
        let results = verify_segments(&parts, HashAlgorithm::Sha256).await.unwrap();

        assert_eq!(results.len(), 2);
        assert!(results[0].ok);
        assert!(results[1].ok, "no expectation verifies as ok");
    }

    #[tokio::test]
    async fn test_large_file_spans_buffers() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("large.bin");
        tokio::fs::write(&path, vec![0xABu8; 100_000]).await.unwrap();

        let once = verify_file(&path, HashAlgorithm::Sha512, None).await.unwrap();
        let again = verify_file(&path, HashAlgorithm::Sha512, None).await.unwrap();

        assert_eq!(once.actual, again.actual);
        assert_eq!(once.bytes, 100_000);
    }
}
