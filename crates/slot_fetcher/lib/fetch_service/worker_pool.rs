use std::sync::Arc;

use flume::{Receiver, Sender};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::retry::{BatchOutcome, RetryController};
use super::rpc_client::BatchRpcClient;
use super::types::{Batch, FailureReason};

/// One finished batch as emitted by the pool.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult {
    pub batch: Batch,
    pub outcome: BatchOutcome,
}

/// Fixed set of workers pulling batches from a bounded queue.
pub struct WorkerPool<C> {
    controller: Arc<RetryController<C>>,
    workers: usize,
    queue_capacity: usize,
}

impl<C> WorkerPool<C>
where
    C: BatchRpcClient + 'static,
{
    pub fn new(controller: Arc<RetryController<C>>, workers: usize, queue_capacity: usize) -> Self {
        Self {
            controller,
            workers: workers.max(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Starts the workers and a producer feeding them `batches`.
    ///
    /// Every batch yields exactly one [`BatchResult`]. Once `cancel` fires, queued batches are
    /// reported as cancelled without touching the network. The result channel closes after the
    /// last worker exits.
    pub fn run<I>(&self, cancel: CancellationToken, batches: I) -> PoolRun
    where
        I: IntoIterator<Item = Batch> + Send + 'static,
        I::IntoIter: Send,
    {
        let (work_sender, work_receiver) = flume::bounded::<Batch>(self.queue_capacity);
        let (result_sender, result_receiver) = flume::bounded::<BatchResult>(self.queue_capacity);

        let mut workers = Vec::with_capacity(self.workers);
        for worker_idx in 0..self.workers {
            let controller = self.controller.clone();
            let receiver = work_receiver.clone();
            let results = result_sender.clone();
            let cancel = cancel.clone();
            workers.push(tokio::spawn(async move {
                run_worker_loop(worker_idx, controller, cancel, receiver, results).await;
            }));
        }
        drop(work_receiver);
        drop(result_sender);

        let producer = tokio::spawn(enqueue_batches(work_sender, batches));

        PoolRun {
            results: result_receiver,
            producer,
            workers,
        }
    }
}

async fn enqueue_batches<I>(sender: Sender<Batch>, batches: I)
where
    I: IntoIterator<Item = Batch>,
{
    for batch in batches {
        if sender.send_async(batch).await.is_err() {
            debug!(
                event = "batch_queue_closed",
                "all workers exited before the producer finished"
            );
            break;
        }
    }
}

async fn run_worker_loop<C>(
    worker_idx: usize,
    controller: Arc<RetryController<C>>,
    cancel: CancellationToken,
    receiver: Receiver<Batch>,
    results: Sender<BatchResult>,
) where
    C: BatchRpcClient,
{
    while let Ok(batch) = receiver.recv_async().await {
        let outcome = if cancel.is_cancelled() {
            BatchOutcome::uniform_failure(&batch, FailureReason::Cancelled, 0)
        } else {
            controller.execute_with_retry(&cancel, &batch).await
        };

        if results.send_async(BatchResult { batch, outcome }).await.is_err() {
            debug!(
                event = "batch_result_receiver_dropped",
                worker_idx, "result consumer went away; stopping worker"
            );
            break;
        }
    }
}

/// Handle to a running pool: a result stream plus the spawned tasks.
pub struct PoolRun {
    results: Receiver<BatchResult>,
    producer: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

impl PoolRun {
    /// Next finished batch, or `None` once every worker has exited.
    pub async fn next_result(&self) -> Option<BatchResult> {
        self.results.recv_async().await.ok()
    }

    /// Waits for the producer and all workers.
    pub async fn join(self) -> Result<(), JoinError> {
        drop(self.results);
        self.producer.await?;
        for worker in self.workers {
            worker.await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::WorkerPool;
    use crate::fetch_service::batches::split;
    use crate::fetch_service::rate_limiter::RequestRateLimiter;
    use crate::fetch_service::retry::RetryController;
    use crate::fetch_service::stats::StatsCollector;
    use crate::fetch_service::test_support::{fast_policy, ScriptedRpcClient};
    use crate::fetch_service::types::{FailureReason, FetchOutcome, Slot, SlotRange};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn pool(client: Arc<ScriptedRpcClient>, workers: usize) -> WorkerPool<Arc<ScriptedRpcClient>> {
        let controller = RetryController::new(
            client,
            Arc::new(RequestRateLimiter::new(10_000, 10_000)),
            Arc::new(StatsCollector::new()),
            fast_policy(0),
        );
        WorkerPool::new(Arc::new(controller), workers, 2)
    }

    #[tokio::test]
    async fn every_batch_yields_exactly_one_result() {
        let client = Arc::new(ScriptedRpcClient::always_ok().with_latency(Duration::from_millis(5)));
        let pool = pool(client.clone(), 3);
        let batches = split(SlotRange::new(1, 68).expect("valid range"), 5);
        let expected_batches = batches.len();

        let run = pool.run(CancellationToken::new(), batches);
        let mut seen: Vec<Slot> = Vec::new();
        let mut results = 0;
        while let Some(result) = run.next_result().await {
            results += 1;
            assert_eq!(
                result.outcome.outcomes.keys().copied().collect::<Vec<_>>(),
                result.batch.slots
            );
            seen.extend(result.batch.slots);
        }
        run.join().await.expect("pool tasks should not panic");

        seen.sort_unstable();
        assert_eq!(results, expected_batches);
        assert_eq!(seen, (1..=68).collect::<Vec<_>>());
        assert!(client.max_in_flight() <= 3);
    }

    #[tokio::test]
    async fn cancelled_run_reports_every_slot_without_network() {
        let client = Arc::new(ScriptedRpcClient::always_ok());
        let pool = pool(client.clone(), 4);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let run = pool.run(cancel, split(SlotRange::new(10, 29).expect("valid range"), 4));
        let mut cancelled = 0;
        while let Some(result) = run.next_result().await {
            for outcome in result.outcome.outcomes.values() {
                assert_eq!(outcome, &FetchOutcome::Failed(FailureReason::Cancelled));
                cancelled += 1;
            }
        }
        run.join().await.expect("pool tasks should not panic");

        assert_eq!(cancelled, 20);
        assert_eq!(client.total_calls(), 0);
    }

    #[tokio::test]
    async fn mid_run_cancellation_keeps_resolved_outcomes() {
        let client = Arc::new(ScriptedRpcClient::always_ok().with_latency(Duration::from_millis(30)));
        let pool = pool(client, 1);
        let cancel = CancellationToken::new();

        let run = pool.run(
            cancel.clone(),
            split(SlotRange::new(0, 39).expect("valid range"), 10),
        );
        let first = run.next_result().await.expect("first batch result");
        cancel.cancel();

        let mut rest = Vec::new();
        while let Some(result) = run.next_result().await {
            rest.push(result);
        }
        run.join().await.expect("pool tasks should not panic");

        assert!(first.outcome.outcomes.values().all(FetchOutcome::is_fetched));
        assert_eq!(rest.len(), 3);
        let cancelled = rest
            .iter()
            .flat_map(|result| result.outcome.outcomes.values())
            .filter(|outcome| **outcome == FetchOutcome::Failed(FailureReason::Cancelled))
            .count();
        assert!(cancelled >= 10, "at least one pending batch should be cancelled");
    }
}
