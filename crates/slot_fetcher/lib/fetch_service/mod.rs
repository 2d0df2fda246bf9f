pub mod batches;
pub mod dispatcher;
pub mod error;
pub mod filter;
pub mod ledger;
pub mod rate_limiter;
pub mod retry;
pub mod rpc_client;
pub mod stats;
pub mod types;
pub mod worker_pool;

#[cfg(test)]
pub(crate) mod test_support;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::FetchConfig;
use crate::server::monitoring::FETCH_METRICS;

pub use error::Error;

use batches::BatchPlan;
use dispatcher::{BlockSink, DispatchError, DispatchRecord, ResultDispatcher};
use filter::{transaction_count, BlockFilter};
use ledger::FailureLedger;
use rate_limiter::RequestRateLimiter;
use retry::RetryController;
use rpc_client::{BatchRpcClient, HttpBatchRpcClient};
use stats::{StatsCollector, StatsSnapshot};
use types::{Batch, BlockPayload, FailureReason, FetchOutcome, RunMeta, Slot, SlotRange};
use worker_pool::{BatchResult, WorkerPool};

/// Final accounting of one engine run.
#[derive(Debug)]
pub struct RunReport {
    pub meta: RunMeta,
    pub succeeded: u64,
    /// Blocks delivered to the downstream sink.
    pub forwarded: u64,
    /// Fetched blocks the filter left nothing to forward for.
    pub skipped: u64,
    pub ledger: FailureLedger,
    pub cancelled: bool,
    pub elapsed: Duration,
    /// Engine-wide counters at the end of the run.
    pub stats: StatsSnapshot,
}

impl RunReport {
    pub fn failed(&self) -> u64 {
        self.ledger.len()
    }

    /// Every requested slot ended either fetched or in the ledger.
    pub fn is_fully_accounted(&self) -> bool {
        self.succeeded + self.failed() == self.meta.requested
    }
}

#[derive(Debug, Default)]
struct RunProgress {
    succeeded: u64,
    failed: u64,
    forwarded: u64,
    skipped: u64,
    exhausted: u64,
}

impl RunProgress {
    fn resolved(&self) -> u64 {
        self.succeeded + self.failed
    }
}

struct DispatchSettlement {
    /// Fetched slots with their transaction counts before filtering.
    slots: Vec<(Slot, u64)>,
    forwarded: u64,
    skipped: u64,
    result: Result<(), DispatchError>,
}

/// Concurrent, rate-limited `getBlock` fetcher.
///
/// Owns one RPC client, one rate limiter and one stats collector for its whole lifetime.
/// Runs are independent: each gets its own failure ledger.
pub struct FetchEngine<C> {
    config: Arc<FetchConfig>,
    controller: Arc<RetryController<C>>,
    limiter: Arc<RequestRateLimiter>,
    stats: Arc<StatsCollector>,
    sink: Option<Arc<dyn BlockSink>>,
    filter: BlockFilter,
}

impl FetchEngine<HttpBatchRpcClient> {
    /// Builds the HTTP client, and the downstream dispatcher when one is configured.
    pub fn from_config(config: FetchConfig) -> Result<Self, Error> {
        config.validate()?;
        let client = HttpBatchRpcClient::new(&config.rpc_client_settings())?;
        let dispatcher = config
            .dispatch
            .as_ref()
            .map(ResultDispatcher::from_config)
            .transpose()?;

        let engine = Self::new(config, client);
        Ok(match dispatcher {
            Some(dispatcher) => engine.with_sink(Arc::new(dispatcher)),
            None => engine,
        })
    }
}

impl<C> FetchEngine<C>
where
    C: BatchRpcClient + 'static,
{
    pub fn new(config: FetchConfig, client: C) -> Self {
        let stats = Arc::new(StatsCollector::new());
        let limiter = Arc::new(RequestRateLimiter::new(
            config.max_requests_per_second,
            config.burst_capacity,
        ));
        let controller = Arc::new(RetryController::new(
            client,
            limiter.clone(),
            stats.clone(),
            config.retry_policy(),
        ));
        let filter = BlockFilter::new(config.required_account.clone());

        Self {
            config: Arc::new(config),
            controller,
            limiter,
            stats,
            sink: None,
            filter,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn BlockSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    pub fn client(&self) -> &C {
        self.controller.client()
    }

    pub fn stats(&self) -> Arc<StatsCollector> {
        self.stats.clone()
    }

    /// Fetches every slot in `range`, cycle by cycle.
    pub async fn fetch_range(
        &self,
        cancel: &CancellationToken,
        range: SlotRange,
    ) -> Result<RunReport, Error> {
        let plan = BatchPlan::for_range(
            range,
            self.config.max_batch_size,
            self.config.batches_per_cycle,
            self.config.scan_order,
        );
        self.run_plan(cancel, plan, RunMeta::for_range(range)).await
    }

    /// Fetches an explicit slot list, such as a replayed failure ledger. Duplicates are
    /// fetched once.
    pub async fn fetch_slots(
        &self,
        cancel: &CancellationToken,
        mut slots: Vec<Slot>,
    ) -> Result<RunReport, Error> {
        slots.sort_unstable();
        slots.dedup();
        let range = SlotRange::bounding(&slots).unwrap_or(SlotRange { start: 0, end: 0 });
        let meta = RunMeta::for_replay(range, slots.len() as u64);
        let plan = BatchPlan::for_slots(
            slots,
            self.config.max_batch_size,
            self.config.batches_per_cycle,
        );
        self.run_plan(cancel, plan, meta).await
    }

    async fn run_plan(
        &self,
        cancel: &CancellationToken,
        plan: BatchPlan,
        meta: RunMeta,
    ) -> Result<RunReport, Error> {
        let started = Instant::now();
        let ledger = FailureLedger::new();
        let mut progress = RunProgress::default();
        let pool = WorkerPool::new(
            self.controller.clone(),
            self.config.max_concurrent_workers,
            self.config.queue_capacity,
        );

        info!(
            event = "fetch_run_starting",
            run = meta.label,
            range_start = meta.range.start,
            range_end = meta.range.end,
            requested = meta.requested,
            batches = plan.batch_count(),
            cycles = plan.cycle_count(),
            batch_size = self.config.max_batch_size,
            workers = pool.workers(),
            max_rps = self.limiter.max_per_second(),
            burst = self.limiter.burst(),
            "starting fetch run"
        );
        if let Some(metrics) = FETCH_METRICS.get() {
            metrics.start_run(meta.requested);
        }

        for cycle_index in 0..plan.cycle_count() {
            if cancel.is_cancelled() {
                let unscheduled = plan.ranges_from_cycle(cycle_index);
                debug!(
                    event = "unscheduled_slots_cancelled",
                    cycle = cycle_index,
                    ranges = unscheduled.len(),
                    "recording unscheduled slots as cancelled"
                );
                for range in unscheduled {
                    self.settle_failed_range(&ledger, &mut progress, range, FailureReason::Cancelled);
                }
                break;
            }
            let Some(cycle) = plan.cycle(cycle_index) else {
                break;
            };

            let cycle_slots = cycle.slot_count();
            self.run_cycle(&pool, cancel, cycle.batches, &ledger, &mut progress)
                .await;

            let percent = progress.resolved().saturating_mul(100) / meta.requested.max(1);
            if let Some(metrics) = FETCH_METRICS.get() {
                metrics.cycles_completed_total.inc();
                metrics.record_progress(progress.resolved(), percent);
            }
            info!(
                event = "cycle_complete",
                cycle = cycle_index,
                cycles = plan.cycle_count(),
                cycle_slots,
                resolved = progress.resolved(),
                requested = meta.requested,
                progress_percent = percent,
                succeeded = progress.succeeded,
                failed = progress.failed,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "cycle complete"
            );
        }

        let report = RunReport {
            meta,
            succeeded: progress.succeeded,
            forwarded: progress.forwarded,
            skipped: progress.skipped,
            ledger,
            cancelled: cancel.is_cancelled(),
            elapsed: started.elapsed(),
            stats: self.stats.snapshot(),
        };

        info!(
            event = "fetch_run_complete",
            run = report.meta.label,
            requested = report.meta.requested,
            succeeded = report.succeeded,
            failed = report.failed(),
            forwarded = report.forwarded,
            skipped = report.skipped,
            cancelled = report.cancelled,
            elapsed_ms = report.elapsed.as_millis() as u64,
            throughput_per_sec = report.stats.throughput_per_sec(),
            "fetch run complete"
        );

        if !report.cancelled
            && report.meta.requested > 0
            && report.succeeded == 0
            && progress.exhausted == report.meta.requested
        {
            return Err(Error::ProviderUnreachable {
                failed: report.meta.requested,
                report: Box::new(report),
            });
        }
        Ok(report)
    }

    /// Runs one cycle through the pool and settles every slot of it before returning.
    async fn run_cycle(
        &self,
        pool: &WorkerPool<C>,
        cancel: &CancellationToken,
        batches: Vec<Batch>,
        ledger: &FailureLedger,
        progress: &mut RunProgress,
    ) {
        let mut pending: BTreeMap<u64, Vec<Slot>> = batches
            .iter()
            .map(|batch| (batch.index, batch.slots.clone()))
            .collect();
        let run = pool.run(cancel.clone(), batches);
        let mut dispatches = FuturesUnordered::new();
        let mut results_open = true;

        loop {
            tokio::select! {
                next = run.next_result(), if results_open => match next {
                    Some(result) => {
                        pending.remove(&result.batch.index);
                        let fetched = self.settle_batch(result, ledger, progress);
                        if !fetched.is_empty() {
                            dispatches.push(self.dispatch_blocks(fetched));
                        }
                    }
                    None => results_open = false,
                },
                Some(settlement) = dispatches.next(), if !dispatches.is_empty() => {
                    self.settle_dispatch(settlement, ledger, progress);
                }
                else => break,
            }
        }

        if let Err(err) = run.join().await {
            error!(
                event = "worker_task_failed",
                error = %err,
                "worker task ended abnormally"
            );
        }
        for slot in pending.into_values().flatten() {
            self.settle_failure(ledger, progress, slot, FailureReason::WorkerLost);
        }
    }

    /// Records failures of one batch and returns its fetched blocks.
    fn settle_batch(
        &self,
        result: BatchResult,
        ledger: &FailureLedger,
        progress: &mut RunProgress,
    ) -> Vec<(Slot, BlockPayload)> {
        self.stats.record_batch();
        let BatchResult { batch, outcome } = result;
        let mut outcomes = outcome.outcomes;
        if outcomes.len() != batch.len() {
            debug!(
                event = "batch_outcome_mismatch",
                batch_index = batch.index,
                expected = batch.len(),
                received = outcomes.len(),
                "reconciling batch outcomes with requested slots"
            );
        }

        let mut fetched = Vec::with_capacity(batch.len());
        for slot in batch.slots {
            match outcomes
                .remove(&slot)
                .unwrap_or(FetchOutcome::Failed(FailureReason::NoResponse))
            {
                FetchOutcome::Fetched(block) => fetched.push((slot, block)),
                FetchOutcome::Failed(reason) => self.settle_failure(ledger, progress, slot, reason),
            }
        }
        fetched
    }

    async fn dispatch_blocks(&self, fetched: Vec<(Slot, BlockPayload)>) -> DispatchSettlement {
        let mut slots = Vec::with_capacity(fetched.len());
        let Some(sink) = &self.sink else {
            slots.extend(fetched.iter().map(|(slot, block)| (*slot, transaction_count(block))));
            return DispatchSettlement {
                slots,
                forwarded: 0,
                skipped: 0,
                result: Ok(()),
            };
        };

        let mut records = Vec::with_capacity(fetched.len());
        for (slot, block) in fetched {
            slots.push((slot, transaction_count(&block)));
            if let Some(block) = self.filter.apply(block) {
                records.push(DispatchRecord::new(slot, block));
            }
        }
        let forwarded = records.len() as u64;
        let skipped = slots.len() as u64 - forwarded;
        let result = if records.is_empty() {
            Ok(())
        } else {
            sink.deliver(records).await
        };

        DispatchSettlement {
            slots,
            forwarded,
            skipped,
            result,
        }
    }

    fn settle_dispatch(
        &self,
        settlement: DispatchSettlement,
        ledger: &FailureLedger,
        progress: &mut RunProgress,
    ) {
        match settlement.result {
            Ok(()) => {
                progress.forwarded += settlement.forwarded;
                progress.skipped += settlement.skipped;
                for (_, transactions) in &settlement.slots {
                    progress.succeeded += 1;
                    self.stats.record_success(*transactions);
                }
            }
            Err(err) => {
                warn!(
                    event = "dispatch_failed",
                    slots = settlement.slots.len(),
                    first_slot = ?settlement.slots.first().map(|(slot, _)| *slot),
                    error = %err,
                    "downstream delivery failed; marking fetched slots as failed"
                );
                if let Some(metrics) = FETCH_METRICS.get() {
                    metrics.dispatch_failures_total.inc();
                }
                let message = err.to_string();
                for (slot, _) in settlement.slots {
                    self.settle_failure(
                        ledger,
                        progress,
                        slot,
                        FailureReason::DispatchFailed {
                            message: message.clone(),
                        },
                    );
                }
            }
        }
    }

    fn settle_failure(
        &self,
        ledger: &FailureLedger,
        progress: &mut RunProgress,
        slot: Slot,
        reason: FailureReason,
    ) {
        self.settle_failed_range(ledger, progress, SlotRange { start: slot, end: slot }, reason);
    }

    fn settle_failed_range(
        &self,
        ledger: &FailureLedger,
        progress: &mut RunProgress,
        range: SlotRange,
        reason: FailureReason,
    ) {
        let slots = range.slot_count();
        if matches!(reason, FailureReason::ExhaustedRetries { .. }) {
            progress.exhausted += slots;
        }
        progress.failed += slots;
        self.stats.record_failures(&reason, slots);
        ledger.record_range(range, reason);
    }
}
