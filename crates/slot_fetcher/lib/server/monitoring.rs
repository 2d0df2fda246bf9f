use crate::build_info;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
use prometheus_client::registry::Registry;
use tokio::sync::OnceCell;

/// Registers immutable build metadata for `/metrics` scraping.
///
/// Encoded as a labeled gauge with value `1` so it stays valid text exposition while
/// carrying stable build labels.
pub fn register_build_info_metric(registry: &mut Registry, prefix: &str) {
    let build_info_metric = Family::<BuildInfoLabels, Gauge>::default();
    build_info_metric
        .get_or_create(&BuildInfoLabels {
            service: "slot_fetcher",
            version: build_info::VERSION,
            commit: build_info::short_commit_hash(),
        })
        .set(1);
    let sub_registry = registry.sub_registry_with_prefix(prefix);
    sub_registry.register(
        "build_info",
        "Build identity labels for this process",
        build_info_metric,
    );
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct BuildInfoLabels {
    service: &'static str,
    version: &'static str,
    commit: &'static str,
}

/// Failure reason label for `slots_failed`.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FailureLabels {
    pub reason: &'static str,
}

#[derive(Clone)]
pub struct FetchMetrics {
    /// Batch requests sent to the RPC provider, retries included.
    pub batch_requests_total: Counter,
    /// Batch requests repeated after a transport failure.
    pub batch_retries_total: Counter,
    /// Slots fetched and accepted downstream.
    ///
    /// Use PromQL `rate()` for slots/sec.
    pub slots_succeeded_total: Counter,
    pub slots_failed_total: Family<FailureLabels, Counter>,
    pub dispatch_failures_total: Counter,
    pub cycles_completed_total: Counter,
    /// Slots requested by the active run.
    pub target_total_slots: Gauge,
    /// Slots resolved (fetched or failed) in the active run.
    pub slots_resolved: Gauge,
    /// Integer percent complete (0-100) for the active run.
    pub progress_percent: Gauge,
}

impl Default for FetchMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl FetchMetrics {
    pub fn new() -> Self {
        Self {
            batch_requests_total: Counter::default(),
            batch_retries_total: Counter::default(),
            slots_succeeded_total: Counter::default(),
            slots_failed_total: Family::default(),
            dispatch_failures_total: Counter::default(),
            cycles_completed_total: Counter::default(),
            target_total_slots: Gauge::default(),
            slots_resolved: Gauge::default(),
            progress_percent: Gauge::default(),
        }
    }

    /// Exposes these metrics through `registry`. Handles are shared, so every registry they
    /// are added to reports the same values.
    pub fn register(&self, registry: &mut Registry, prefix: &str) {
        let sub_registry = registry.sub_registry_with_prefix(prefix);
        sub_registry.register(
            "batch_requests",
            "Total number of getBlock batch requests sent",
            self.batch_requests_total.clone(),
        );
        sub_registry.register(
            "batch_retries",
            "Total number of batch requests retried after a transport failure",
            self.batch_retries_total.clone(),
        );
        sub_registry.register(
            "slots_succeeded",
            "Total number of slots fetched successfully",
            self.slots_succeeded_total.clone(),
        );
        sub_registry.register(
            "slots_failed",
            "Total number of slots that ended in the failure ledger, by reason",
            self.slots_failed_total.clone(),
        );
        sub_registry.register(
            "dispatch_failures",
            "Total number of downstream deliveries that failed",
            self.dispatch_failures_total.clone(),
        );
        sub_registry.register(
            "cycles_completed",
            "Total number of fetch cycles completed",
            self.cycles_completed_total.clone(),
        );
        sub_registry.register(
            "target_total_slots",
            "Number of slots requested by the active run",
            self.target_total_slots.clone(),
        );
        sub_registry.register(
            "slots_resolved",
            "Number of slots resolved in the active run",
            self.slots_resolved.clone(),
        );
        sub_registry.register(
            "progress_percent",
            "Integer percent complete (0-100) for the active run",
            self.progress_percent.clone(),
        );
    }

    pub fn record_failed_slots(&self, reason: &'static str, count: u64) {
        self.slots_failed_total
            .get_or_create(&FailureLabels { reason })
            .inc_by(count);
    }

    pub fn start_run(&self, requested: u64) {
        self.target_total_slots.set(requested as i64);
        self.slots_resolved.set(0);
        self.progress_percent.set(0);
    }

    pub fn record_progress(&self, resolved: u64, percent: u64) {
        self.slots_resolved.set(resolved as i64);
        self.progress_percent.set(percent.min(100) as i64);
    }
}

pub static FETCH_METRICS: OnceCell<FetchMetrics> = OnceCell::const_new();
