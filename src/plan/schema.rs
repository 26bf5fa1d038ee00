//! Plan vocabulary: KV page references, transfer operations, weight
//! manifests and the two plan shapes handed to the engine.
//!
//! Plans are produced upstream and never mutated by the engine. All
//! consistency checks live in [`crate::engine::validator`]; the types here
//! only carry data plus a few range helpers.

use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// The physical channel a transfer runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum TransferKind {
    /// Host buffer to device buffer.
    H2D,
    /// Device buffer to host buffer.
    D2H,
    /// Device to device (NVLink / PCIe peer).
    P2P,
    /// Storage file to host buffer.
    #[default]
    Storage2H,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown transfer kind {0:?}")]
pub struct UnknownTransferKind(pub String);

impl TransferKind {
    pub const ALL: [TransferKind; 4] = [
        TransferKind::H2D,
        TransferKind::D2H,
        TransferKind::P2P,
        TransferKind::Storage2H,
    ];

    /// Wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferKind::H2D => "H2D",
            TransferKind::D2H => "D2H",
            TransferKind::P2P => "P2P",
            TransferKind::Storage2H => "STORAGE2H",
        }
    }

    /// Parse a kind leniently: names are case-insensitive and an empty or
    /// missing value means `STORAGE2H`.
    pub fn parse_lenient(value: Option<&str>) -> Result<Self, UnknownTransferKind> {
        let Some(raw) = value.map(str::trim).filter(|v| !v.is_empty()) else {
            return Ok(TransferKind::Storage2H);
        };
        match raw.to_ascii_uppercase().as_str() {
            "H2D" => Ok(TransferKind::H2D),
            "D2H" => Ok(TransferKind::D2H),
            "P2P" => Ok(TransferKind::P2P),
            "STORAGE2H" => Ok(TransferKind::Storage2H),
            _ => Err(UnknownTransferKind(raw.to_string())),
        }
    }
}

impl FromStr for TransferKind {
    type Err = UnknownTransferKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransferKind::parse_lenient(Some(s))
    }
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for TransferKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TransferKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        TransferKind::parse_lenient(raw.as_deref()).map_err(serde::de::Error::custom)
    }
}

/// One page of a tensor's KV cache.
///
/// Two refs name the same page iff all four fields match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KvPageRef {
    pub tensor: String,
    pub page: u64,
    pub head: u32,
    pub layer: u32,
}

impl KvPageRef {
    pub fn new(tensor: impl Into<String>, page: u64, head: u32, layer: u32) -> Self {
        Self {
            tensor: tensor.into(),
            page,
            head,
            layer,
        }
    }
}

impl fmt::Display for KvPageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[page={} head={} layer={}]",
            self.tensor, self.page, self.head, self.layer
        )
    }
}

/// One unit of data movement.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferOp {
    pub kind: TransferKind,

    /// Source resource: a storage path, device buffer or host buffer URI.
    pub src: String,

    /// Destination resource.
    pub dst: String,

    /// Bytes to move. Must be non-zero.
    pub length: u64,

    pub src_offset: u64,

    pub dst_offset: u64,

    /// Pages this op reads or writes; empty for plain buffer copies.
    pub kv_refs: Vec<KvPageRef>,

    /// Diagnostic text only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl TransferOp {
    pub fn new(
        kind: TransferKind,
        src: impl Into<String>,
        dst: impl Into<String>,
        length: u64,
    ) -> Self {
        Self {
            kind,
            src: src.into(),
            dst: dst.into(),
            length,
            ..Default::default()
        }
    }

    pub fn with_offsets(mut self, src_offset: u64, dst_offset: u64) -> Self {
        self.src_offset = src_offset;
        self.dst_offset = dst_offset;
        self
    }

    pub fn with_kv_refs(mut self, kv_refs: impl IntoIterator<Item = KvPageRef>) -> Self {
        self.kv_refs = kv_refs.into_iter().collect();
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// Byte range read from `src`, or `None` if empty or overflowing.
    pub fn src_range(&self) -> Option<Range<u64>> {
        byte_range(self.src_offset, self.length)
    }

    /// Byte range written to `dst`, or `None` if empty or overflowing.
    pub fn dst_range(&self) -> Option<Range<u64>> {
        byte_range(self.dst_offset, self.length)
    }
}

fn byte_range(offset: u64, length: u64) -> Option<Range<u64>> {
    if length == 0 {
        return None;
    }
    offset.checked_add(length).map(|end| offset..end)
}

/// Whether two half-open byte ranges share at least one byte.
pub fn ranges_overlap(a: &Range<u64>, b: &Range<u64>) -> bool {
    a.start < b.end && b.start < a.end
}

/// A byte range of a weight file with its content hash.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileChunk {
    pub path: String,
    pub offset: u64,
    pub length: u64,
    pub sha256: String,
}

impl FileChunk {
    pub fn new(path: impl Into<String>, offset: u64, length: u64, sha256: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            offset,
            length,
            sha256: sha256.into(),
        }
    }

    /// End offset of the chunk, saturating on overflow.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }
}

/// A named, versioned weight artifact.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightManifest {
    pub model_id: String,
    pub version: String,
    pub files: Vec<FileChunk>,
}

impl WeightManifest {
    pub fn new(
        model_id: impl Into<String>,
        version: impl Into<String>,
        files: impl IntoIterator<Item = FileChunk>,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            version: version.into(),
            files: files.into_iter().collect(),
        }
    }

    /// Total bytes described by the manifest.
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.length).fold(0u64, u64::saturating_add)
    }
}

/// Deadline contract of a swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SwapWindow {
    /// Earliest time the window may be entered (unix ns).
    #[serde(default, alias = "start_ns")]
    pub t_start_ns: u64,

    /// Latest time all ops must complete (unix ns).
    #[serde(default, alias = "deadline_ns")]
    pub t_deadline_ns: u64,
}

impl SwapWindow {
    pub fn new(t_start_ns: u64, t_deadline_ns: u64) -> Self {
        Self {
            t_start_ns,
            t_deadline_ns,
        }
    }

    pub fn duration_ns(&self) -> u64 {
        self.t_deadline_ns.saturating_sub(self.t_start_ns)
    }
}

/// KV cache moves for one planning window.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePlan {
    pub plan_id: String,
    pub ops: Vec<TransferOp>,
    pub prefetch: Vec<KvPageRef>,
    pub evict: Vec<KvPageRef>,
}

impl CachePlan {
    pub fn new(plan_id: impl Into<String>, ops: impl IntoIterator<Item = TransferOp>) -> Self {
        Self {
            plan_id: plan_id.into(),
            ops: ops.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn with_prefetch(mut self, pages: impl IntoIterator<Item = KvPageRef>) -> Self {
        self.prefetch = pages.into_iter().collect();
        self
    }

    pub fn with_evict(mut self, pages: impl IntoIterator<Item = KvPageRef>) -> Self {
        self.evict = pages.into_iter().collect();
        self
    }
}

/// A weight-version swap bounded by a deadline window.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwapPlan {
    pub plan_id: String,

    #[serde(alias = "manifest_from")]
    pub from: WeightManifest,

    #[serde(alias = "manifest_to")]
    pub to: WeightManifest,

    pub ops: Vec<TransferOp>,

    pub window: SwapWindow,
}

impl SwapPlan {
    pub fn new(
        plan_id: impl Into<String>,
        from: WeightManifest,
        to: WeightManifest,
        ops: impl IntoIterator<Item = TransferOp>,
        window: SwapWindow,
    ) -> Self {
        Self {
            plan_id: plan_id.into(),
            from,
            to,
            ops: ops.into_iter().collect(),
            window,
        }
    }
}

/// Either plan shape, as accepted by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    Cache(CachePlan),
    Swap(SwapPlan),
}

impl Plan {
    pub fn plan_id(&self) -> &str {
        match self {
            Plan::Cache(p) => &p.plan_id,
            Plan::Swap(p) => &p.plan_id,
        }
    }

    pub fn ops(&self) -> &[TransferOp] {
        match self {
            Plan::Cache(p) => &p.ops,
            Plan::Swap(p) => &p.ops,
        }
    }

    /// The deadline window, for swap plans.
    pub fn window(&self) -> Option<SwapWindow> {
        match self {
            Plan::Cache(_) => None,
            Plan::Swap(p) => Some(p.window),
        }
    }

    /// Short label used in logs and metrics.
    pub fn kind_label(&self) -> &'static str {
        match self {
            Plan::Cache(_) => "cache",
            Plan::Swap(_) => "swap",
        }
    }

    /// Sum of all op lengths.
    pub fn total_bytes(&self) -> u64 {
        self.ops().iter().map(|op| op.length).fold(0u64, u64::saturating_add)
    }
}

impl From<CachePlan> for Plan {
    fn from(plan: CachePlan) -> Self {
        Plan::Cache(plan)
    }
}

impl From<SwapPlan> for Plan {
    fn from(plan: SwapPlan) -> Self {
        Plan::Swap(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parsing_is_lenient() {
        assert_eq!(TransferKind::parse_lenient(None).unwrap(), TransferKind::Storage2H);
        assert_eq!(TransferKind::parse_lenient(Some("")).unwrap(), TransferKind::Storage2H);
        assert_eq!("h2d".parse::<TransferKind>().unwrap(), TransferKind::H2D);
        assert_eq!("Storage2h".parse::<TransferKind>().unwrap(), TransferKind::Storage2H);
        assert!("DMA".parse::<TransferKind>().is_err());
    }

    #[test]
    fn test_kind_wire_name() {
        let json = serde_json::to_string(&TransferKind::Storage2H).unwrap();
        assert_eq!(json, "\"STORAGE2H\"");
        let kind: TransferKind = serde_json::from_str("\"p2p\"").unwrap();
        assert_eq!(kind, TransferKind::P2P);
    }

    #[test]
    fn test_page_ref_equality() {
        let a = KvPageRef::new("layer0", 5, 0, 0);
        let b = KvPageRef::new("layer0", 5, 0, 0);
        let c = KvPageRef::new("layer0", 5, 1, 0);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_op_ranges() {
        let op = TransferOp::new(TransferKind::H2D, "host://0/a", "gpu://0/b", 4096)
            .with_offsets(1024, 8192);
        assert_eq!(op.src_range(), Some(1024..5120));
        assert_eq!(op.dst_range(), Some(8192..12288));

        let empty = TransferOp::new(TransferKind::H2D, "a", "b", 0);
        assert_eq!(empty.dst_range(), None);

        let overflow = TransferOp::new(TransferKind::H2D, "a", "b", 16).with_offsets(u64::MAX, 0);
        assert_eq!(overflow.src_range(), None);
    }

    #[test]
    fn test_ranges_overlap() {
        assert!(ranges_overlap(&(0..10), &(9..20)));
        assert!(!ranges_overlap(&(0..10), &(10..20)));
        assert!(ranges_overlap(&(5..6), &(0..100)));
    }

    #[test]
    fn test_plan_accessors() {
        let plan: Plan = SwapPlan::new(
            "swap-1",
            WeightManifest::default(),
            WeightManifest::default(),
            vec![TransferOp::new(TransferKind::Storage2H, "a.bin", "host://0/s", 16)],
            SwapWindow::new(10, 20),
        )
        .into();
        assert_eq!(plan.plan_id(), "swap-1");
        assert_eq!(plan.kind_label(), "swap");
        assert_eq!(plan.window().unwrap().duration_ns(), 10);
        assert_eq!(plan.total_bytes(), 16);
    }

    #[test]
    fn test_total_bytes_saturates() {
        let plan: Plan = CachePlan::new(
            "huge",
            vec![
                TransferOp::new(TransferKind::H2D, "host://0/a", "gpu://0/kv", u64::MAX),
                TransferOp::new(TransferKind::H2D, "host://0/b", "gpu://1/kv", 1),
            ],
        )
        .into();
        assert_eq!(plan.total_bytes(), u64::MAX);

        let manifest = WeightManifest::new(
            "m",
            "v1",
            vec![FileChunk::new("a.bin", 0, u64::MAX, ""), FileChunk::new("b.bin", 0, 2, "")],
        );
        assert_eq!(manifest.total_bytes(), u64::MAX);
    }
}
