use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use super::types::{FailureReason, RunMeta, Slot, SlotRange};

const FILE_TITLE: &str = "# failed slots";
const SEPARATOR: &str = "# ==========================================";

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("failure ledger io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: expected a slot number, got `{content}`")]
    Parse {
        path: PathBuf,
        line: usize,
        content: String,
    },
}

impl LedgerError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureEntry {
    pub slot: Slot,
    pub reason: FailureReason,
}

/// Consecutive failed slots sharing one reason, ending at `end` inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FailureSpan {
    end: Slot,
    reason: FailureReason,
}

/// Failed slots of one run, each recorded once.
///
/// Adjacent slots with the same reason collapse into a single span keyed by its first slot, so
/// a cancelled or unreachable run over a huge range costs a handful of entries rather than one
/// per slot. Spans are expanded only when the replay file is written.
#[derive(Debug, Default)]
pub struct FailureLedger {
    spans: Mutex<BTreeMap<Slot, FailureSpan>>,
}

impl FailureLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn spans(&self) -> std::sync::MutexGuard<'_, BTreeMap<Slot, FailureSpan>> {
        self.spans.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records `slot`; a later record for the same slot replaces the reason.
    pub fn record(&self, slot: Slot, reason: FailureReason) {
        self.record_range(SlotRange { start: slot, end: slot }, reason);
    }

    /// Records every slot of `range` with one reason, replacing earlier reasons they had.
    pub fn record_range(&self, range: SlotRange, reason: FailureReason) {
        let mut spans = self.spans();

        let overlapping: Vec<Slot> = spans
            .range(..=range.end)
            .rev()
            .take_while(|(_, span)| span.end >= range.start)
            .map(|(start, _)| *start)
            .collect();
        for start in overlapping {
            let Some(span) = spans.remove(&start) else {
                continue;
            };
            if start < range.start {
                spans.insert(
                    start,
                    FailureSpan {
                        end: range.start - 1,
                        reason: span.reason.clone(),
                    },
                );
            }
            if span.end > range.end {
                spans.insert(range.end + 1, span);
            }
        }

        let mut start = range.start;
        let mut end = range.end;
        let left = spans
            .range(..start)
            .next_back()
            .filter(|(_, span)| span.end.checked_add(1) == Some(start) && span.reason == reason)
            .map(|(left_start, _)| *left_start);
        if let Some(left_start) = left {
            spans.remove(&left_start);
            start = left_start;
        }
        if let Some(next) = end.checked_add(1) {
            if spans.get(&next).is_some_and(|span| span.reason == reason) {
                if let Some(right) = spans.remove(&next) {
                    end = right.end;
                }
            }
        }
        spans.insert(start, FailureSpan { end, reason });
    }

    /// Number of failed slots.
    pub fn len(&self) -> u64 {
        self.spans()
            .iter()
            .map(|(start, span)| span_len(*start, span.end))
            .fold(0, u64::saturating_add)
    }

    pub fn is_empty(&self) -> bool {
        self.spans().is_empty()
    }

    /// Number of stored spans; bounded by the number of reason changes, not by `len`.
    pub fn span_count(&self) -> usize {
        self.spans().len()
    }

    /// Failed ranges with their reason, in ascending slot order.
    pub fn ranges(&self) -> Vec<(SlotRange, FailureReason)> {
        self.spans()
            .iter()
            .map(|(start, span)| {
                (
                    SlotRange {
                        start: *start,
                        end: span.end,
                    },
                    span.reason.clone(),
                )
            })
            .collect()
    }

    /// Every failed slot with its reason, in ascending order. Expands all spans.
    pub fn all(&self) -> Vec<FailureEntry> {
        self.ranges()
            .into_iter()
            .flat_map(|(range, reason)| {
                (range.start..=range.end).map(move |slot| FailureEntry {
                    slot,
                    reason: reason.clone(),
                })
            })
            .collect()
    }

    /// Every failed slot in ascending order. Expands all spans.
    pub fn slots(&self) -> Vec<Slot> {
        self.ranges()
            .into_iter()
            .flat_map(|(range, _)| range.start..=range.end)
            .collect()
    }

    pub fn reason_counts(&self) -> BTreeMap<&'static str, u64> {
        let mut counts = BTreeMap::new();
        for (start, span) in self.spans().iter() {
            *counts.entry(span.reason.label()).or_insert(0) += span_len(*start, span.end);
        }
        counts
    }

    /// Writes the replay file to `path`: a `#` header, then one slot per line.
    pub fn persist(&self, path: &Path, meta: &RunMeta) -> Result<(), LedgerError> {
        let ranges = self.ranges();
        let total = self.len();
        let counts = self.reason_counts();

        let file = File::create(path).map_err(|err| LedgerError::io(path, err))?;
        let mut writer = BufWriter::new(file);
        let mut write = || -> std::io::Result<()> {
            writeln!(writer, "{FILE_TITLE} ({})", meta.label)?;
            writeln!(
                writer,
                "# generated_at: {}",
                chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
            )?;
            writeln!(
                writer,
                "# run_started_at: {}",
                meta.started_at.format("%Y-%m-%d %H:%M:%S UTC")
            )?;
            writeln!(writer, "# range: {} - {}", meta.range.start, meta.range.end)?;
            writeln!(writer, "# requested: {}", meta.requested)?;
            writeln!(writer, "# total_failures: {total}")?;
            let breakdown: Vec<String> = counts
                .iter()
                .map(|(label, count)| format!("{label}={count}"))
                .collect();
            writeln!(writer, "# reasons: {}", breakdown.join(" "))?;
            writeln!(writer, "{SEPARATOR}")?;
            for (range, _) in &ranges {
                for slot in range.start..=range.end {
                    writeln!(writer, "{slot}")?;
                }
            }
            writer.flush()
        };
        write().map_err(|err| LedgerError::io(path, err))?;

        tracing::info!(
            event = "failure_ledger_persisted",
            path = %path.display(),
            failures = total,
            spans = ranges.len(),
            range_start = meta.range.start,
            range_end = meta.range.end,
            "wrote failed slot list"
        );
        Ok(())
    }

    /// Persists under `dir` with [`failure_file_name`] and returns the full path.
    pub fn persist_in_dir(&self, dir: &Path, meta: &RunMeta) -> Result<PathBuf, LedgerError> {
        fs::create_dir_all(dir).map_err(|err| LedgerError::io(dir, err))?;
        let path = dir.join(failure_file_name(meta));
        self.persist(&path, meta)?;
        Ok(path)
    }
}

fn span_len(start: Slot, end: Slot) -> u64 {
    (end - start).saturating_add(1)
}

/// `failed_slots_<start>_<end>_<YYYYmmdd_HHMMSS>.txt`
pub fn failure_file_name(meta: &RunMeta) -> String {
    format!(
        "failed_slots_{}_{}_{}.txt",
        meta.range.start,
        meta.range.end,
        meta.started_at.format("%Y%m%d_%H%M%S")
    )
}

/// Reads the slot list of a persisted ledger, skipping `#` lines and blanks.
///
/// Duplicates are kept in file order; callers dedupe.
pub fn load_failed_slots(path: &Path) -> Result<Vec<Slot>, LedgerError> {
    let file = File::open(path).map_err(|err| LedgerError::io(path, err))?;
    let mut slots = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|err| LedgerError::io(path, err))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let slot = trimmed.parse::<Slot>().map_err(|_| LedgerError::Parse {
            path: path.to_path_buf(),
            line: index + 1,
            content: trimmed.to_string(),
        })?;
        slots.push(slot);
    }
    Ok(slots)
}
