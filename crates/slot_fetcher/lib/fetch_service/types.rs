use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Block height. Opaque to the engine beyond ordering.
pub type Slot = u64;

/// Decoded `getBlock` result, passed through untouched.
pub type BlockPayload = serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RangeError {
    #[error("start ({start}) must be <= end ({end})")]
    Inverted { start: Slot, end: Slot },
    /// `[0, u64::MAX]` holds one slot more than a `u64` count can express.
    #[error("range [0, {}] is too large to count", Slot::MAX)]
    Unbounded,
}

/// Closed interval `[start, end]` of slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SlotRange {
    pub start: Slot,
    pub end: Slot,
}

impl SlotRange {
    pub fn new(start: Slot, end: Slot) -> Result<Self, RangeError> {
        if start > end {
            return Err(RangeError::Inverted { start, end });
        }
        if start == 0 && end == Slot::MAX {
            return Err(RangeError::Unbounded);
        }
        Ok(Self { start, end })
    }

    /// Number of slots in the range. Saturates for `[0, u64::MAX]`, which `new` rejects.
    pub fn slot_count(&self) -> u64 {
        (self.end - self.start).saturating_add(1)
    }

    pub fn contains(&self, slot: Slot) -> bool {
        self.start <= slot && slot <= self.end
    }

    /// Smallest range covering every slot in `slots`, or `None` when empty.
    pub fn bounding(slots: &[Slot]) -> Option<Self> {
        let start = *slots.iter().min()?;
        let end = *slots.iter().max()?;
        Some(Self { start, end })
    }
}

impl fmt::Display for SlotRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Slots sent together in one multi-request envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Position of the batch within its run plan.
    pub index: u64,
    pub slots: Vec<Slot>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn first_slot(&self) -> Option<Slot> {
        self.slots.first().copied()
    }

    pub fn last_slot(&self) -> Option<Slot> {
        self.slots.last().copied()
    }
}

/// Batches whose results are gathered before the next group is scheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cycle {
    pub index: u64,
    pub batches: Vec<Batch>,
}

impl Cycle {
    pub fn slot_count(&self) -> u64 {
        self.batches.iter().map(|batch| batch.len() as u64).sum()
    }
}

/// Order in which a range is walked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanOrder {
    #[default]
    Ascending,
    /// Newest slot first.
    Descending,
}

impl ScanOrder {
    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Ok(Self::Ascending),
            "desc" | "descending" => Ok(Self::Descending),
            other => Err(format!(
                "unknown scan order `{other}` (expected ascending|descending)"
            )),
        }
    }
}

/// Why a slot ended the run without a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The provider answered this slot with a JSON-RPC `error` object.
    ProviderError { code: i64, message: String },
    /// The provider answered `result: null`; the slot was skipped or pruned.
    NotFound,
    /// The response envelope had no entry for this slot's correlation id.
    NoResponse,
    /// Every attempt for the enclosing batch failed at the transport level.
    ExhaustedRetries { attempts: u32, last_error: String },
    Cancelled,
    /// Fetched, but forwarding downstream failed.
    DispatchFailed { message: String },
    /// The worker handling the batch stopped before reporting.
    WorkerLost,
}

impl FailureReason {
    /// Stable label for metrics and ledger headers.
    pub fn label(&self) -> &'static str {
        match self {
            Self::ProviderError { .. } => "provider_error",
            Self::NotFound => "not_found",
            Self::NoResponse => "no_response",
            Self::ExhaustedRetries { .. } => "exhausted_retries",
            Self::Cancelled => "cancelled",
            Self::DispatchFailed { .. } => "dispatch_failed",
            Self::WorkerLost => "worker_lost",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProviderError { code, message } => {
                write!(f, "RPC error: code={code}, message={message}")
            }
            Self::NotFound => write!(f, "not found"),
            Self::NoResponse => write!(f, "no response found"),
            Self::ExhaustedRetries {
                attempts,
                last_error,
            } => write!(f, "exhausted {attempts} attempts: {last_error}"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::DispatchFailed { message } => write!(f, "dispatch failed: {message}"),
            Self::WorkerLost => write!(f, "worker stopped before reporting"),
        }
    }
}

/// Per-slot result of one batch request.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Fetched(BlockPayload),
    Failed(FailureReason),
}

impl FetchOutcome {
    pub fn is_fetched(&self) -> bool {
        matches!(self, Self::Fetched(_))
    }
}

/// Batch-level transport failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Connect,
    Timeout,
    HttpStatus,
    /// The body was not a JSON-RPC multi-response envelope.
    Envelope,
    Request,
}

pub const FAILURE_CLASS_NETWORK: &str = "network_transient";
pub const FAILURE_CLASS_HTTP_4XX: &str = "http_4xx";
pub const FAILURE_CLASS_HTTP_5XX: &str = "http_5xx";
pub const FAILURE_CLASS_RATE_LIMITED: &str = "rate_limited";
pub const FAILURE_CLASS_DECODE: &str = "decode";

/// Failure of a whole batch request. Every variant is retryable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
    pub status: Option<u16>,
    pub failure_class: &'static str,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        let failure_class = match kind {
            TransportErrorKind::Envelope => FAILURE_CLASS_DECODE,
            _ => FAILURE_CLASS_NETWORK,
        };
        Self {
            kind,
            message: message.into(),
            status: None,
            failure_class,
        }
    }

    pub fn http_status(status: u16, message: impl Into<String>) -> Self {
        let failure_class = match status {
            429 => FAILURE_CLASS_RATE_LIMITED,
            400..=499 => FAILURE_CLASS_HTTP_4XX,
            _ => FAILURE_CLASS_HTTP_5XX,
        };
        Self {
            kind: TransportErrorKind::HttpStatus,
            message: message.into(),
            status: Some(status),
            failure_class,
        }
    }

    pub fn is_retryable(&self) -> bool {
        true
    }
}

/// Fixed-delay whole-batch retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub retry_attempts: u32,
    pub retry_delay: Duration,
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.retry_attempts.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Identity of one engine run, carried into ledger headers and reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunMeta {
    /// Requested range, or the bounding range of a replayed slot list.
    pub range: SlotRange,
    pub requested: u64,
    pub started_at: DateTime<Utc>,
    pub label: &'static str,
}

impl RunMeta {
    pub fn for_range(range: SlotRange) -> Self {
        Self {
            range,
            requested: range.slot_count(),
            started_at: Utc::now(),
            label: "fetch",
        }
    }

    pub fn for_replay(range: SlotRange, requested: u64) -> Self {
        Self {
            range,
            requested,
            started_at: Utc::now(),
            label: "replay",
        }
    }
}
