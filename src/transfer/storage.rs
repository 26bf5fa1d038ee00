//! Storage reads (STORAGE2H) into the buffer arena.
//!
//! Files are addressed by op `src` (bare path or `file://` URI), resolved
//! against an optional root directory. Reads use tokio's async file I/O.

use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

use crate::plan::schema::TransferKind;
use crate::resource::extent::ExtentTable;
use crate::resource::key::normalize;
use crate::transfer::backend::{BackendError, TransferBackend, TransferRequest};
use crate::transfer::memory::MemoryBackend;

/// Reads file ranges and lands them in a [`MemoryBackend`] buffer.
pub struct StorageBackend {
    arena: Arc<MemoryBackend>,

    /// Directory relative paths are resolved against.
    root: Option<PathBuf>,
}

impl StorageBackend {
    pub fn new(arena: Arc<MemoryBackend>) -> Self {
        Self { arena, root: None }
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    fn resolve(&self, id: &str) -> PathBuf {
        resolve_path(self.root.as_deref(), id)
    }

    async fn read_range(&self, path: &Path, offset: u64, length: u64) -> std::io::Result<BytesMut> {
        let mut file = fs::File::open(path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = BytesMut::zeroed(length as usize);
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

pub(crate) fn resolve_path(root: Option<&Path>, id: &str) -> PathBuf {
    let path = Path::new(normalize(id));
    match root {
        Some(root) if path.is_relative() => root.join(path),
        _ => path.to_path_buf(),
    }
}

/// Map an I/O error onto the retry classification.
fn classify(path: &Path, err: std::io::Error) -> BackendError {
    let message = format!("{}: {err}", path.display());
    match err.kind() {
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut => {
            BackendError::Transient(message)
        }
        _ => BackendError::Permanent(message),
    }
}

#[async_trait]
impl TransferBackend for StorageBackend {
    async fn perform(&self, request: &TransferRequest) -> Result<u64, BackendError> {
        if request.kind != TransferKind::Storage2H {
            return Err(BackendError::Permanent(format!(
                "storage backend cannot serve {}",
                request.kind
            )));
        }

        let path = self.resolve(&request.src);
        let data = self
            .read_range(&path, request.src_offset, request.length)
            .await
            .map_err(|err| classify(&path, err))?;

        self.arena.write(&request.dst, request.dst_offset, &data)?;
        self.arena.record(TransferKind::Storage2H, data.len() as u64);

        debug!(
            path = %path.display(),
            offset = request.src_offset,
            bytes = data.len(),
            dst = request.dst,
            "Read file range"
        );
        Ok(data.len() as u64)
    }
}

/// Extents of storage files, taken from their current size on disk.
/// Files that cannot be stat'ed are left out.
pub async fn file_extents<'a>(
    root: Option<&Path>,
    ids: impl IntoIterator<Item = &'a str>,
) -> ExtentTable {
    let mut table = ExtentTable::new();
    for id in ids {
        let path = resolve_path(root, id);
        match fs::metadata(&path).await {
            Ok(meta) => table.insert(id, meta.len()),
            Err(err) => warn!(path = %path.display(), error = %err, "Cannot stat storage file"),
        }
    }
    table
}
