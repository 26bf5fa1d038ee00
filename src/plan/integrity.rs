//! Manifest integrity: checks `FileChunk.sha256` against the bytes on disk.
//!
//! Verification is I/O, so it runs as an optional step after the pure
//! validation pass and before any transfer is scheduled.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

use crate::plan::schema::{FileChunk, WeightManifest};
use crate::resource::key::normalize;

const READ_CHUNK: usize = 1 << 20;

#[derive(Error, Debug)]
pub enum IntegrityError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is shorter than the manifest chunk at {offset}+{length}")]
    Truncated { path: PathBuf, offset: u64, length: u64 },

    #[error("hash mismatch for {path} at {offset}+{length}: expected {expected}, got {actual}")]
    HashMismatch {
        path: PathBuf,
        offset: u64,
        length: u64,
        expected: String,
        actual: String,
    },

    #[error("malformed sha256 digest {0:?}")]
    MalformedDigest(String),
}

/// Collaborator that vouches for a manifest's content.
#[async_trait]
pub trait ManifestVerifier: Send + Sync {
    async fn verify(&self, manifest: &WeightManifest) -> Result<(), IntegrityError>;
}

/// Hashes each chunk's byte range with SHA-256.
#[derive(Debug, Clone)]
pub struct FileHashVerifier {
    /// Base directory for relative manifest paths.
    root: Option<PathBuf>,

    /// Chunks hashed concurrently.
    max_concurrent_reads: usize,
}

impl FileHashVerifier {
    pub fn new(max_concurrent_reads: usize) -> Self {
        Self {
            root: None,
            max_concurrent_reads: max_concurrent_reads.max(1),
        }
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Lower-case hex SHA-256 of `data`.
    pub fn compute_hash(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        format!("{:x}", hasher.finalize())
    }

    /// Normalize an expected digest: optional `sha256:` prefix, any case.
    fn expected_digest(raw: &str) -> Result<String, IntegrityError> {
        let digest = raw.trim();
        let digest = digest.strip_prefix("sha256:").unwrap_or(digest);
        if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(IntegrityError::MalformedDigest(raw.to_string()));
        }
        Ok(digest.to_ascii_lowercase())
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(normalize(path));
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }

    async fn verify_chunk(&self, chunk: &FileChunk) -> Result<(), IntegrityError> {
        let expected = Self::expected_digest(&chunk.sha256)?;
        let path = self.resolve(&chunk.path);
        let io_err = |source| IntegrityError::Io {
            path: path.clone(),
            source,
        };

        let mut file = File::open(&path).await.map_err(io_err)?;
        file.seek(SeekFrom::Start(chunk.offset)).await.map_err(io_err)?;

        let mut reader = file.take(chunk.length);
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; READ_CHUNK.min(chunk.length.max(1) as usize)];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf).await.map_err(io_err)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            total += n as u64;
        }

        if total < chunk.length {
            return Err(IntegrityError::Truncated {
                path,
                offset: chunk.offset,
                length: chunk.length,
            });
        }

        let actual = format!("{:x}", hasher.finalize());
        if actual != expected {
            return Err(IntegrityError::HashMismatch {
                path,
                offset: chunk.offset,
                length: chunk.length,
                expected,
                actual,
            });
        }

        debug!(path = %path.display(), offset = chunk.offset, length = chunk.length, "Chunk verified");
        Ok(())
    }
}

#[async_trait]
impl ManifestVerifier for FileHashVerifier {
    async fn verify(&self, manifest: &WeightManifest) -> Result<(), IntegrityError> {
        let checks: Vec<_> = manifest
            .files
            .iter()
            .map(|chunk| self.verify_chunk(chunk))
            .collect();
        stream::iter(checks)
            .buffer_unordered(self.max_concurrent_reads)
            .try_for_each(|()| async { Ok::<(), IntegrityError>(()) })
            .await?;

        debug!(
            model_id = manifest.model_id,
            version = manifest.version,
            files = manifest.files.len(),
            "Manifest verified"
        );
        Ok(())
    }
}
