use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use super::rate_limiter::RequestRateLimiter;
use super::rpc_client::BatchRpcClient;
use super::stats::StatsCollector;
use super::types::{Batch, FailureReason, FetchOutcome, RetryPolicy, Slot, TransportError};

/// Terminal state returned by [`run_with_retry`].
#[derive(Debug, PartialEq, Eq)]
pub enum RetryError<E> {
    /// The token fired during an attempt or a delay.
    Cancelled { attempts: u32 },
    Failed { error: E, attempts: u32 },
}

/// Runs `op` up to `policy.max_attempts()` times with a fixed delay between attempts.
///
/// Non-retryable errors end the loop immediately. Both the attempt and the delay are raced
/// against `cancel`. `on_retry` runs before each delay with the attempt that just failed.
pub async fn run_with_retry<T, E, F, Fut, R, H>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
    mut is_retryable: R,
    mut on_retry: H,
) -> Result<(T, u32), RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: FnMut(&E) -> bool,
    H: FnMut(u32, &E, Duration),
{
    let max_attempts = policy.max_attempts();
    let mut attempt = 1u32;

    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled { attempts: attempt }),
            result = op(attempt) => result,
        };

        let error = match result {
            Ok(value) => return Ok((value, attempt)),
            Err(error) => error,
        };

        if !is_retryable(&error) || attempt >= max_attempts {
            return Err(RetryError::Failed {
                error,
                attempts: attempt,
            });
        }

        on_retry(attempt, &error, policy.retry_delay);
        if !policy.retry_delay.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled { attempts: attempt }),
                _ = tokio::time::sleep(policy.retry_delay) => {}
            }
        }
        attempt += 1;
    }
}

#[derive(Debug)]
enum AttemptError {
    Cancelled,
    Transport(TransportError),
}

/// Per-slot outcomes for one batch plus how many requests it took.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutcome {
    pub outcomes: BTreeMap<Slot, FetchOutcome>,
    pub attempts: u32,
}

impl BatchOutcome {
    /// Every slot of `batch` failed with the same reason.
    pub fn uniform_failure(batch: &Batch, reason: FailureReason, attempts: u32) -> Self {
        Self {
            outcomes: batch
                .slots
                .iter()
                .map(|slot| (*slot, FetchOutcome::Failed(reason.clone())))
                .collect(),
            attempts,
        }
    }
}

/// Whole-batch retry around a [`BatchRpcClient`], gated by the shared rate limiter.
///
/// Only transport failures are retried. Per-slot provider errors, nulls and missing ids are
/// final on the attempt that produced them.
pub struct RetryController<C> {
    client: C,
    limiter: Arc<RequestRateLimiter>,
    stats: Arc<StatsCollector>,
    policy: RetryPolicy,
}

impl<C: BatchRpcClient> RetryController<C> {
    pub fn new(
        client: C,
        limiter: Arc<RequestRateLimiter>,
        stats: Arc<StatsCollector>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            limiter,
            stats,
            policy,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub async fn execute_with_retry(&self, cancel: &CancellationToken, batch: &Batch) -> BatchOutcome {
        let slots = batch.slots.as_slice();
        let result = run_with_retry(
            &self.policy,
            cancel,
            move |_attempt| async move {
                self.limiter
                    .acquire(cancel)
                    .await
                    .map_err(|_| AttemptError::Cancelled)?;
                self.stats.record_attempt();
                self.client
                    .execute(slots)
                    .await
                    .map_err(AttemptError::Transport)
            },
            |error| matches!(error, AttemptError::Transport(err) if err.is_retryable()),
            |attempt, error, delay| {
                self.stats.record_retry();
                if let AttemptError::Transport(err) = error {
                    warn!(
                        event = "batch_retry_scheduled",
                        batch_index = batch.index,
                        first_slot = ?batch.first_slot(),
                        last_slot = ?batch.last_slot(),
                        attempt,
                        max_attempts = self.policy.max_attempts(),
                        retry_delay_ms = delay.as_millis() as u64,
                        failure_class = err.failure_class,
                        http_status = ?err.status,
                        error = %err,
                        "batch request failed; retrying"
                    );
                }
            },
        )
        .await;

        match result {
            Ok((outcomes, attempts)) => BatchOutcome { outcomes, attempts },
            Err(RetryError::Cancelled { attempts })
            | Err(RetryError::Failed {
                error: AttemptError::Cancelled,
                attempts,
                ..
            }) => BatchOutcome::uniform_failure(batch, FailureReason::Cancelled, attempts),
            Err(RetryError::Failed {
                error: AttemptError::Transport(err),
                attempts,
                ..
            }) => {
                error!(
                    event = "batch_retries_exhausted",
                    batch_index = batch.index,
                    first_slot = ?batch.first_slot(),
                    last_slot = ?batch.last_slot(),
                    attempts,
                    failure_class = err.failure_class,
                    error = %err,
                    "batch failed after all attempts"
                );
                BatchOutcome::uniform_failure(
                    batch,
                    FailureReason::ExhaustedRetries {
                        attempts,
                        last_error: err.message,
                    },
                    attempts,
                )
            }
        }
    }
}
