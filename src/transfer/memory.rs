//! In-process buffer arena standing in for host and device memory.
//!
//! Every declared buffer (`gpu://0/kv`, `host://0/staging`, ...) is a plain
//! byte vector. H2D, D2H and P2P are all copies between two of them, which
//! is enough to run real plans end to end without a device.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::debug;

use crate::plan::schema::TransferKind;
use crate::resource::extent::ExtentProvider;
use crate::transfer::backend::{BackendError, TransferBackend, TransferRequest};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("buffer not declared: {0}")]
    UnknownBuffer(String),

    #[error("range {offset}+{length} exceeds buffer {id} of {size} bytes")]
    OutOfRange {
        id: String,
        offset: u64,
        length: u64,
        size: u64,
    },
}

impl From<MemoryError> for BackendError {
    fn from(err: MemoryError) -> Self {
        BackendError::Permanent(err.to_string())
    }
}

#[derive(Debug, Default, Clone)]
pub struct TransferStats {
    pub total_h2d_bytes: u64,
    pub total_d2h_bytes: u64,
    pub total_p2p_bytes: u64,
    pub total_storage_bytes: u64,
    pub total_transfers: u64,
}

impl TransferStats {
    fn record(&mut self, kind: TransferKind, bytes: u64) {
        match kind {
            TransferKind::H2D => self.total_h2d_bytes += bytes,
            TransferKind::D2H => self.total_d2h_bytes += bytes,
            TransferKind::P2P => self.total_p2p_bytes += bytes,
            TransferKind::Storage2H => self.total_storage_bytes += bytes,
        }
        self.total_transfers += 1;
    }
}

/// Host/device buffers addressed by resource id.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    buffers: RwLock<HashMap<String, Vec<u8>>>,

    /// Simulated per-transfer latency.
    latency: Option<Duration>,

    stats: Mutex<TransferStats>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// An arena with the given buffers, zero-filled.
    pub fn with_buffers<'a>(buffers: impl IntoIterator<Item = (&'a str, u64)>) -> Self {
        let backend = Self::new();
        for (id, bytes) in buffers {
            backend.allocate(id, bytes);
        }
        backend
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Declare (or re-declare) a zero-filled buffer.
    pub fn allocate(&self, id: &str, bytes: u64) {
        debug!(buffer = id, bytes, "Allocated buffer");
        self.buffers
            .write()
            .insert(id.to_string(), vec![0u8; bytes as usize]);
    }

    pub fn buffer_len(&self, id: &str) -> Option<u64> {
        self.buffers.read().get(id).map(|b| b.len() as u64)
    }

    /// Copy `data` into a buffer at `offset`.
    pub fn write(&self, id: &str, offset: u64, data: &[u8]) -> Result<(), MemoryError> {
        let mut buffers = self.buffers.write();
        let buffer = buffers
            .get_mut(id)
            .ok_or_else(|| MemoryError::UnknownBuffer(id.to_string()))?;
        let range = checked_range(id, buffer.len(), offset, data.len() as u64)?;
        buffer[range].copy_from_slice(data);
        Ok(())
    }

    /// Copy `length` bytes out of a buffer.
    pub fn read(&self, id: &str, offset: u64, length: u64) -> Result<Vec<u8>, MemoryError> {
        let buffers = self.buffers.read();
        let buffer = buffers
            .get(id)
            .ok_or_else(|| MemoryError::UnknownBuffer(id.to_string()))?;
        let range = checked_range(id, buffer.len(), offset, length)?;
        Ok(buffer[range].to_vec())
    }

    pub fn stats(&self) -> TransferStats {
        self.stats.lock().clone()
    }

    pub(crate) fn record(&self, kind: TransferKind, bytes: u64) {
        self.stats.lock().record(kind, bytes);
    }

    fn copy(&self, request: &TransferRequest) -> Result<u64, MemoryError> {
        if request.src == request.dst {
            let mut buffers = self.buffers.write();
            let buffer = buffers
                .get_mut(&request.src)
                .ok_or_else(|| MemoryError::UnknownBuffer(request.src.clone()))?;
            let src = checked_range(&request.src, buffer.len(), request.src_offset, request.length)?;
            let dst = checked_range(&request.dst, buffer.len(), request.dst_offset, request.length)?;
            buffer.copy_within(src, dst.start);
        } else {
            let data = self.read(&request.src, request.src_offset, request.length)?;
            self.write(&request.dst, request.dst_offset, &data)?;
        }
        Ok(request.length)
    }
}

fn checked_range(
    id: &str,
    size: usize,
    offset: u64,
    length: u64,
) -> Result<std::ops::Range<usize>, MemoryError> {
    let out_of_range = || MemoryError::OutOfRange {
        id: id.to_string(),
        offset,
        length,
        size: size as u64,
    };
    let end = offset.checked_add(length).ok_or_else(out_of_range)?;
    if end > size as u64 {
        return Err(out_of_range());
    }
    Ok(offset as usize..end as usize)
}

impl ExtentProvider for MemoryBackend {
    fn extent(&self, resource_id: &str) -> Option<u64> {
        self.buffer_len(resource_id)
    }
}

#[async_trait]
impl TransferBackend for MemoryBackend {
    async fn perform(&self, request: &TransferRequest) -> Result<u64, BackendError> {
        if request.kind == TransferKind::Storage2H {
            return Err(BackendError::Permanent(
                "memory backend does not read storage".to_string(),
            ));
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let moved = self.copy(request)?;
        self.record(request.kind, moved);

        debug!(
            kind = %request.kind,
            src = request.src,
            dst = request.dst,
            bytes = moved,
            "Buffer copy"
        );
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::schema::TransferOp;

    #[tokio::test]
    async fn test_h2d_copy() {
        let backend = MemoryBackend::with_buffers([("host://0/a", 16), ("gpu://0/b", 16)]);
        backend.write("host://0/a", 0, &[1, 2, 3, 4]).unwrap();

        let op = TransferOp::new(TransferKind::H2D, "host://0/a", "gpu://0/b", 4).with_offsets(0, 8);
        let moved = backend.perform(&TransferRequest::from(&op)).await.unwrap();

        assert_eq!(moved, 4);
        assert_eq!(backend.read("gpu://0/b", 8, 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(backend.stats().total_h2d_bytes, 4);
    }

    #[tokio::test]
    async fn test_copy_within_one_buffer() {
        let backend = MemoryBackend::with_buffers([("gpu://0/kv", 8)]);
        backend.write("gpu://0/kv", 0, &[9, 8]).unwrap();

        let op = TransferOp::new(TransferKind::P2P, "gpu://0/kv", "gpu://0/kv", 2).with_offsets(0, 6);
        backend.perform(&TransferRequest::from(&op)).await.unwrap();
        assert_eq!(backend.read("gpu://0/kv", 6, 2).unwrap(), vec![9, 8]);
    }

    #[tokio::test]
    async fn test_out_of_range_is_permanent() {
        let backend = MemoryBackend::with_buffers([("host://0/a", 4), ("gpu://0/b", 4)]);
        let op = TransferOp::new(TransferKind::H2D, "host://0/a", "gpu://0/b", 8);
        let err = backend.perform(&TransferRequest::from(&op)).await.unwrap_err();
        assert!(!err.is_transient());

        let op = TransferOp::new(TransferKind::H2D, "host://0/a", "gpu://9/x", 1);
        assert!(backend.perform(&TransferRequest::from(&op)).await.is_err());
    }

    #[test]
    fn test_extent_reports_buffer_size() {
        let backend = MemoryBackend::with_buffers([("gpu://0/kv", 4096)]);
        assert_eq!(backend.extent("gpu://0/kv"), Some(4096));
        assert_eq!(backend.extent("gpu://1/kv"), None);
    }
}
