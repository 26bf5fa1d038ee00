//! Prometheus metrics for one engine instance.
//!
//! Each engine owns its own `prometheus::Registry` so several engines can
//! live in one process (tests do this) without clashing registrations.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

use crate::plan::schema::TransferKind;

/// Engine counters. Cloning shares the underlying metrics.
#[derive(Clone)]
pub struct EngineMetrics {
    registry: Registry,
    plans_submitted: IntCounterVec,
    plans_finished: IntCounterVec,
    ops_finished: IntCounterVec,
    bytes_moved: IntCounterVec,
    op_retries: IntCounter,
    op_duration: HistogramVec,
}

impl EngineMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("kv_plan_exec".to_string()), None)?;

        let plans_submitted = IntCounterVec::new(
            Opts::new("plans_submitted_total", "Plans handed to the coordinator"),
            &["kind"],
        )?;
        let plans_finished = IntCounterVec::new(
            Opts::new("plans_finished_total", "Plans that reached a terminal status"),
            &["kind", "status"],
        )?;
        let ops_finished = IntCounterVec::new(
            Opts::new("ops_finished_total", "Ops that reached an outcome"),
            &["kind", "outcome"],
        )?;
        let bytes_moved = IntCounterVec::new(
            Opts::new("bytes_moved_total", "Bytes moved by successful ops"),
            &["kind"],
        )?;
        let op_retries = IntCounter::new("op_retries_total", "Retries after transient backend errors")?;
        let op_duration = HistogramVec::new(
            HistogramOpts::new("op_duration_seconds", "Wall time per op, all attempts included")
                .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
            &["kind"],
        )?;

        registry.register(Box::new(plans_submitted.clone()))?;
        registry.register(Box::new(plans_finished.clone()))?;
        registry.register(Box::new(ops_finished.clone()))?;
        registry.register(Box::new(bytes_moved.clone()))?;
        registry.register(Box::new(op_retries.clone()))?;
        registry.register(Box::new(op_duration.clone()))?;

        Ok(Self {
            registry,
            plans_submitted,
            plans_finished,
            ops_finished,
            bytes_moved,
            op_retries,
            op_duration,
        })
    }

    pub fn plan_submitted(&self, kind: &str) {
        self.plans_submitted.with_label_values(&[kind]).inc();
    }

    pub fn plan_finished(&self, kind: &str, status: &str) {
        self.plans_finished.with_label_values(&[kind, status]).inc();
    }

    pub fn op_finished(&self, kind: TransferKind, outcome: &str, bytes: u64, seconds: f64) {
        let kind = kind.as_str();
        self.ops_finished.with_label_values(&[kind, outcome]).inc();
        if bytes > 0 {
            self.bytes_moved.with_label_values(&[kind]).inc_by(bytes);
        }
        self.op_duration.with_label_values(&[kind]).observe(seconds);
    }

    pub fn op_retried(&self) {
        self.op_retries.inc();
    }

    pub fn retries(&self) -> u64 {
        self.op_retries.get()
    }

    pub fn bytes_moved(&self, kind: TransferKind) -> u64 {
        self.bytes_moved.with_label_values(&[kind.as_str()]).get()
    }

    /// Text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|err| prometheus::Error::Msg(err.to_string()))
    }
}
