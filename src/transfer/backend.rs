//! The seam between the executor and whatever actually moves bytes.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::plan::schema::{TransferKind, TransferOp};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Worth retrying: a busy channel, an interrupted read.
    #[error("transient backend error: {0}")]
    Transient(String),

    #[error("backend error: {0}")]
    Permanent(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }
}

/// What a backend is asked to do for one op attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub kind: TransferKind,
    pub src: String,
    pub dst: String,
    pub src_offset: u64,
    pub dst_offset: u64,
    pub length: u64,
}

impl From<&TransferOp> for TransferRequest {
    fn from(op: &TransferOp) -> Self {
        Self {
            kind: op.kind,
            src: op.src.clone(),
            dst: op.dst.clone(),
            src_offset: op.src_offset,
            dst_offset: op.dst_offset,
            length: op.length,
        }
    }
}

/// Moves the bytes of one request and returns how many were moved.
#[async_trait]
pub trait TransferBackend: Send + Sync {
    async fn perform(&self, request: &TransferRequest) -> Result<u64, BackendError>;
}

/// Backend per transfer kind.
#[derive(Clone, Default)]
pub struct BackendSet {
    backends: HashMap<TransferKind, Arc<dyn TransferBackend>>,
}

impl BackendSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: TransferKind, backend: Arc<dyn TransferBackend>) -> Self {
        self.backends.insert(kind, backend);
        self
    }

    /// Register one backend for several kinds.
    pub fn with_kinds(
        mut self,
        kinds: impl IntoIterator<Item = TransferKind>,
        backend: Arc<dyn TransferBackend>,
    ) -> Self {
        for kind in kinds {
            self.backends.insert(kind, Arc::clone(&backend));
        }
        self
    }

    pub fn get(&self, kind: TransferKind) -> Option<&Arc<dyn TransferBackend>> {
        self.backends.get(&kind)
    }
}

impl fmt::Debug for BackendSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.backends.keys().collect();
        kinds.sort();
        f.debug_struct("BackendSet").field("kinds", &kinds).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(u64);

    #[async_trait]
    impl TransferBackend for Fixed {
        async fn perform(&self, _request: &TransferRequest) -> Result<u64, BackendError> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn test_backend_lookup() {
        let set = BackendSet::new()
            .with_kinds([TransferKind::H2D, TransferKind::D2H], Arc::new(Fixed(7)));
        assert!(set.get(TransferKind::P2P).is_none());

        let op = TransferOp::new(TransferKind::H2D, "host://0/a", "gpu://0/b", 7);
        let backend = set.get(TransferKind::H2D).unwrap();
        assert_eq!(backend.perform(&TransferRequest::from(&op)).await, Ok(7));
        assert_eq!(format!("{set:?}"), "BackendSet { kinds: [H2D, D2H] }");
    }

    #[test]
    fn test_error_classification() {
        assert!(BackendError::Transient("busy".into()).is_transient());
        assert!(!BackendError::Permanent("gone".into()).is_transient());
    }
}
