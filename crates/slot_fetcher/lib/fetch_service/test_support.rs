use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::json;

use super::dispatcher::{BlockSink, DispatchError, DispatchRecord};
use super::rpc_client::envelope::{match_responses, RpcResponse};
use super::rpc_client::BatchRpcClient;
use super::types::{
    BlockPayload, FetchOutcome, RetryPolicy, Slot, TransportError, TransportErrorKind,
};

type Responder =
    dyn Fn(&[Slot], u32) -> Result<BTreeMap<Slot, FetchOutcome>, TransportError> + Send + Sync;

pub(crate) fn fast_policy(retry_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        retry_attempts,
        retry_delay: Duration::ZERO,
    }
}

pub(crate) fn transport_error(message: &str) -> TransportError {
    TransportError::new(TransportErrorKind::Connect, message)
}

pub(crate) fn sample_block(slot: Slot) -> BlockPayload {
    json!({
        "blockHeight": slot.saturating_sub(10),
        "blockTime": 1_700_000_000u64 + slot,
        "blockhash": format!("hash-{slot}"),
        "parentSlot": slot.saturating_sub(1),
        "previousBlockhash": format!("hash-{}", slot.saturating_sub(1)),
        "transactions": [
            { "transaction": { "message": { "accountKeys": ["Vote111111111111111111111111111111111111111"] } } }
        ],
        "rewards": []
    })
}

pub(crate) fn ok_blocks(slots: &[Slot]) -> BTreeMap<Slot, FetchOutcome> {
    slots
        .iter()
        .map(|slot| (*slot, FetchOutcome::Fetched(sample_block(*slot))))
        .collect()
}

/// Batch client driven by a closure of `(slots, call number for this batch)`.
///
/// Call numbers start at 1 and are counted per first slot, so retries of one batch see
/// 1, 2, 3, ...
pub(crate) struct ScriptedRpcClient {
    responder: Box<Responder>,
    latency: Duration,
    calls: Mutex<HashMap<Slot, u32>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedRpcClient {
    pub(crate) fn new<F>(responder: F) -> Self
    where
        F: Fn(&[Slot], u32) -> Result<BTreeMap<Slot, FetchOutcome>, TransportError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            responder: Box::new(responder),
            latency: Duration::ZERO,
            calls: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Scripts raw response envelopes; outcomes go through the real id matching.
    pub(crate) fn with_responses<F>(responder: F) -> Self
    where
        F: Fn(&[Slot], u32) -> Vec<RpcResponse> + Send + Sync + 'static,
    {
        Self::new(move |slots, call| Ok(match_responses(slots, responder(slots, call))))
    }

    pub(crate) fn always_ok() -> Self {
        Self::new(|slots, _| Ok(ok_blocks(slots)))
    }

    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub(crate) fn total_calls(&self) -> u32 {
        self.calls
            .lock()
            .expect("calls mutex poisoned")
            .values()
            .sum()
    }

    pub(crate) fn calls_for(&self, first_slot: Slot) -> u32 {
        *self
            .calls
            .lock()
            .expect("calls mutex poisoned")
            .get(&first_slot)
            .unwrap_or(&0)
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl BatchRpcClient for ScriptedRpcClient {
    fn execute<'a>(
        &'a self,
        slots: &'a [Slot],
    ) -> BoxFuture<'a, Result<BTreeMap<Slot, FetchOutcome>, TransportError>> {
        Box::pin(async move {
            let call = {
                let mut calls = self.calls.lock().expect("calls mutex poisoned");
                let entry = calls.entry(slots.first().copied().unwrap_or_default()).or_insert(0);
                *entry += 1;
                *entry
            };

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            (self.responder)(slots, call)
        })
    }
}

/// Sink that records delivered records and fails deliveries from a scripted queue.
#[derive(Default)]
pub(crate) struct CollectingSink {
    failures: Mutex<VecDeque<bool>>,
    delivered: Mutex<Vec<DispatchRecord>>,
    deliveries: AtomicUsize,
}

impl CollectingSink {
    /// `fail_plan[i]` decides whether delivery `i` fails; later deliveries succeed.
    pub(crate) fn with_failures(fail_plan: Vec<bool>) -> Self {
        Self {
            failures: Mutex::new(fail_plan.into_iter().collect()),
            ..Self::default()
        }
    }

    pub(crate) fn delivered_slots(&self) -> Vec<Slot> {
        let mut slots: Vec<Slot> = self
            .delivered
            .lock()
            .expect("delivered mutex poisoned")
            .iter()
            .filter_map(|record| record.block_num.parse().ok())
            .collect();
        slots.sort_unstable();
        slots
    }

    pub(crate) fn deliveries(&self) -> usize {
        self.deliveries.load(Ordering::SeqCst)
    }
}

impl BlockSink for CollectingSink {
    fn deliver<'a>(&'a self, records: Vec<DispatchRecord>) -> BoxFuture<'a, Result<(), DispatchError>> {
        Box::pin(async move {
            self.deliveries.fetch_add(1, Ordering::SeqCst);
            let fail = self
                .failures
                .lock()
                .expect("failures mutex poisoned")
                .pop_front()
                .unwrap_or(false);
            if fail {
                return Err(DispatchError::Status {
                    endpoint: "mock://parser".to_string(),
                    status: 500,
                });
            }
            self.delivered
                .lock()
                .expect("delivered mutex poisoned")
                .extend(records);
            Ok(())
        })
    }
}
