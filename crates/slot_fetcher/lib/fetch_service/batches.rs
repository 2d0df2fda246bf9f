use super::types::{Batch, Cycle, ScanOrder, Slot, SlotRange};

#[derive(Debug, Clone)]
enum SlotSource {
    Range { range: SlotRange, order: ScanOrder },
    List(Vec<Slot>),
}

/// Lazily partitions a slot set into batches and cycles.
///
/// Batch `k` holds plan positions `[k * batch_size, (k + 1) * batch_size)`, so every slot lands
/// in exactly one batch and only the tail batch may be short. Cycle `c` holds batches
/// `[c * batches_per_cycle, (c + 1) * batches_per_cycle)`. Nothing is materialized until a
/// cycle is requested, which keeps memory flat for ranges of hundreds of millions of slots.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    source: SlotSource,
    batch_size: u64,
    batches_per_cycle: u64,
}

impl BatchPlan {
    pub fn for_range(
        range: SlotRange,
        batch_size: usize,
        batches_per_cycle: usize,
        order: ScanOrder,
    ) -> Self {
        Self {
            source: SlotSource::Range { range, order },
            batch_size: batch_size.max(1) as u64,
            batches_per_cycle: batches_per_cycle.max(1) as u64,
        }
    }

    /// Plans an explicit slot list in the given order. Used for ledger replay.
    pub fn for_slots(slots: Vec<Slot>, batch_size: usize, batches_per_cycle: usize) -> Self {
        Self {
            source: SlotSource::List(slots),
            batch_size: batch_size.max(1) as u64,
            batches_per_cycle: batches_per_cycle.max(1) as u64,
        }
    }

    pub fn slot_count(&self) -> u64 {
        match &self.source {
            SlotSource::Range { range, .. } => range.slot_count(),
            SlotSource::List(slots) => slots.len() as u64,
        }
    }

    pub fn batch_count(&self) -> u64 {
        ceil_div(self.slot_count(), self.batch_size)
    }

    pub fn cycle_count(&self) -> u64 {
        ceil_div(self.batch_count(), self.batches_per_cycle)
    }

    fn slot_at(&self, position: u64) -> Slot {
        match &self.source {
            SlotSource::Range {
                range,
                order: ScanOrder::Ascending,
            } => range.start + position,
            SlotSource::Range {
                range,
                order: ScanOrder::Descending,
            } => range.end - position,
            SlotSource::List(slots) => slots[position as usize],
        }
    }

    /// Returns batch `index`, or `None` past the end of the plan.
    pub fn batch(&self, index: u64) -> Option<Batch> {
        let total = self.slot_count();
        let first = index.checked_mul(self.batch_size)?;
        if first >= total {
            return None;
        }
        let last = first.saturating_add(self.batch_size).min(total);
        Some(Batch {
            index,
            slots: (first..last).map(|position| self.slot_at(position)).collect(),
        })
    }

    pub fn batches(&self) -> impl Iterator<Item = Batch> + '_ {
        (0..self.batch_count()).filter_map(move |index| self.batch(index))
    }

    pub fn cycle(&self, index: u64) -> Option<Cycle> {
        let first = index.checked_mul(self.batches_per_cycle)?;
        let end = first
            .saturating_add(self.batches_per_cycle)
            .min(self.batch_count());
        if first >= end {
            return None;
        }
        Some(Cycle {
            index,
            batches: (first..end).filter_map(|batch| self.batch(batch)).collect(),
        })
    }

    pub fn cycles(&self) -> impl Iterator<Item = Cycle> + '_ {
        (0..self.cycle_count()).filter_map(move |index| self.cycle(index))
    }

    /// Contiguous slot ranges of every cycle from `cycle` onward, without building batches.
    ///
    /// A range plan always yields at most one range; a slot list yields its consecutive runs.
    pub fn ranges_from_cycle(&self, cycle: u64) -> Vec<SlotRange> {
        let total = self.slot_count();
        let first = cycle
            .saturating_mul(self.batches_per_cycle)
            .saturating_mul(self.batch_size)
            .min(total);
        if first >= total {
            return Vec::new();
        }
        match &self.source {
            SlotSource::Range {
                range,
                order: ScanOrder::Ascending,
            } => vec![SlotRange {
                start: range.start + first,
                end: range.end,
            }],
            SlotSource::Range {
                range,
                order: ScanOrder::Descending,
            } => vec![SlotRange {
                start: range.start,
                end: range.end - first,
            }],
            SlotSource::List(slots) => {
                let mut runs: Vec<SlotRange> = Vec::new();
                for &slot in &slots[first as usize..] {
                    match runs.last_mut() {
                        Some(run) if run.end.checked_add(1) == Some(slot) => run.end = slot,
                        _ => runs.push(SlotRange {
                            start: slot,
                            end: slot,
                        }),
                    }
                }
                runs
            }
        }
    }
}

fn ceil_div(numerator: u64, denominator: u64) -> u64 {
    if numerator == 0 {
        return 0;
    }
    (numerator - 1) / denominator + 1
}

/// Splits `range` into ascending batches of at most `batch_size` slots.
pub fn split(range: SlotRange, batch_size: usize) -> Vec<Batch> {
    BatchPlan::for_range(range, batch_size, 1, ScanOrder::Ascending)
        .batches()
        .collect()
}

/// Groups batches into cycles of at most `batches_per_cycle` without reordering them.
pub fn group_into_cycles(batches: Vec<Batch>, batches_per_cycle: usize) -> Vec<Cycle> {
    let per_cycle = batches_per_cycle.max(1);
    let mut cycles = Vec::with_capacity(batches.len().div_ceil(per_cycle));
    let mut pending = batches.into_iter().peekable();
    while pending.peek().is_some() {
        cycles.push(Cycle {
            index: cycles.len() as u64,
            batches: pending.by_ref().take(per_cycle).collect(),
        });
    }
    cycles
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: Slot, end: Slot) -> SlotRange {
        SlotRange::new(start, end).expect("valid test range")
    }

    #[test]
    fn splits_ten_slots_into_two_batches_of_five() {
        let batches = split(range(100, 109), 5);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].slots, vec![100, 101, 102, 103, 104]);
        assert_eq!(batches[1].slots, vec![105, 106, 107, 108, 109]);
    }

    #[test]
    fn tail_batch_is_short() {
        let batches = split(range(1, 12), 5);
        let sizes: Vec<usize> = batches.iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![5, 5, 2]);
    }

    #[test]
    fn single_slot_range_yields_one_batch() {
        let batches = split(range(42, 42), 50);
        assert_eq!(batches, vec![Batch { index: 0, slots: vec![42] }]);
    }

    #[test]
    fn every_slot_lands_in_exactly_one_bounded_batch() {
        for batch_size in [1usize, 3, 7, 50, 64] {
            let plan = BatchPlan::for_range(range(1_000, 1_236), batch_size, 4, ScanOrder::Ascending);
            let mut seen = Vec::new();
            for cycle in plan.cycles() {
                assert!(cycle.batches.len() <= 4);
                for batch in cycle.batches {
                    assert!(!batch.is_empty() && batch.len() <= batch_size);
                    seen.extend(batch.slots);
                }
            }
            let expected: Vec<Slot> = (1_000..=1_236).collect();
            assert_eq!(seen, expected, "batch_size={batch_size}");
        }
    }

    #[test]
    fn descending_plan_walks_from_the_end() {
        let plan = BatchPlan::for_range(range(100, 109), 4, 2, ScanOrder::Descending);
        let batches: Vec<Vec<Slot>> = plan.batches().map(|batch| batch.slots).collect();
        assert_eq!(
            batches,
            vec![vec![109, 108, 107, 106], vec![105, 104, 103, 102], vec![101, 100]]
        );
        assert_eq!(plan.cycle_count(), 2);
    }

    #[test]
    fn cycles_preserve_batch_order_and_membership() {
        let batches = split(range(0, 99), 10);
        let cycles = group_into_cycles(batches.clone(), 3);
        assert_eq!(cycles.len(), 4);
        assert_eq!(cycles[3].batches.len(), 1);
        let flattened: Vec<Batch> = cycles.into_iter().flat_map(|cycle| cycle.batches).collect();
        assert_eq!(flattened, batches);
    }

    #[test]
    fn lazy_cycles_match_eager_grouping() {
        let plan = BatchPlan::for_range(range(500, 777), 9, 5, ScanOrder::Ascending);
        let eager = group_into_cycles(split(range(500, 777), 9), 5);
        let lazy: Vec<Cycle> = plan.cycles().collect();
        assert_eq!(lazy, eager);
    }

    #[test]
    fn slot_list_plan_keeps_given_order() {
        let plan = BatchPlan::for_slots(vec![107, 103, 900], 2, 10);
        let batches: Vec<Vec<Slot>> = plan.batches().map(|batch| batch.slots).collect();
        assert_eq!(batches, vec![vec![107, 103], vec![900]]);
    }

    #[test]
    fn huge_range_counts_without_materializing() {
        let plan = BatchPlan::for_range(range(0, 299_999_999), 50, 64, ScanOrder::Ascending);
        assert_eq!(plan.batch_count(), 6_000_000);
        assert_eq!(plan.cycle_count(), 93_750);
        let last = plan.batch(5_999_999).expect("last batch exists");
        assert_eq!(last.last_slot(), Some(299_999_999));
        assert!(plan.batch(6_000_000).is_none());
    }

    #[test]
    fn unscheduled_tail_is_one_range_in_either_order() {
        let ascending = BatchPlan::for_range(range(100, 199), 10, 2, ScanOrder::Ascending);
        assert_eq!(ascending.ranges_from_cycle(0), vec![range(100, 199)]);
        assert_eq!(ascending.ranges_from_cycle(3), vec![range(160, 199)]);
        assert!(ascending.ranges_from_cycle(5).is_empty());

        let descending = BatchPlan::for_range(range(100, 199), 10, 2, ScanOrder::Descending);
        assert_eq!(descending.ranges_from_cycle(3), vec![range(100, 139)]);

        let huge = BatchPlan::for_range(range(0, 299_999_999), 50, 64, ScanOrder::Ascending);
        assert_eq!(huge.ranges_from_cycle(1), vec![range(3_200, 299_999_999)]);
    }

    #[test]
    fn unscheduled_slot_list_collapses_into_runs() {
        let plan = BatchPlan::for_slots(vec![1, 2, 3, 7, 8, 20, 21, 22, 40], 2, 1);
        assert_eq!(
            plan.ranges_from_cycle(1),
            vec![range(3, 3), range(7, 8), range(20, 22), range(40, 40)]
        );
    }
}
