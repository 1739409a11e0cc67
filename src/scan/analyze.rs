//! Statistics sampling scan.
//!
//! Counts live and dead rows against the oldest-xmin horizon and keeps a
//! sample of live rows for statistics. Sampling never waits on running
//! transactions: their rows are counted by what they look like right now.
//!
//! The sample is a reservoir (Algorithm R) over the qualifying rows in
//! physical order: the first `sample_target` rows fill it, after that the
//! k-th row replaces a random slot with probability `target / k`. The random
//! source is seeded from `ScanOptions`, so runs over an unchanged relation
//! with the same seed return the same rows.

use super::{ScanOptions, ScanVisibility};
use crate::mvcc::{classify, RowVersion, TxnContext, VisibilityClass};
use crate::storage::{SlotState, VersionStore};
use eyre::{bail, Result};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleStats {
    pub live_rows: u64,
    pub dead_rows: u64,
    /// Rows that qualified for the sample, kept or not.
    pub sampled: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Sample {
    pub stats: SampleStats,
    pub rows: Vec<RowVersion>,
}

pub struct AnalyzeScan<'a> {
    store: &'a dyn VersionStore,
    ctx: TxnContext,
    options: &'a ScanOptions,
}

impl<'a> AnalyzeScan<'a> {
    pub fn new(store: &'a dyn VersionStore, ctx: TxnContext, options: &'a ScanOptions) -> Self {
        Self { store, ctx, options }
    }

    pub fn run(&self) -> Result<Sample> {
        self.options.validate()?;
        let ScanVisibility::Horizon(oldest_xmin) = *self.options.visibility() else {
            bail!("sampling classifies against the oldest-xmin horizon, not a snapshot");
        };
        let oracle = self.store.oracle();
        let target = self.options.sample_target;
        let mut rng = ChaCha8Rng::seed_from_u64(self.options.seed);
        let mut sample = Sample::default();

        self.store.scan_slots(&mut |pointer, state| {
            let version = match state {
                SlotState::Unused => return Ok(()),
                SlotState::Pruned => {
                    sample.stats.dead_rows += 1;
                    return Ok(());
                }
                SlotState::Occupied(version) => version,
            };

            let class = classify(&version, oldest_xmin, oracle)?;
            trace!(%pointer, ?class, "sampling version");
            let own = class.in_progress_xid().is_some_and(|xid| self.ctx.is_current(xid));
            let keep = match class {
                VisibilityClass::Live => {
                    sample.stats.live_rows += 1;
                    true
                }
                VisibilityClass::Dead | VisibilityClass::RecentlyDead => {
                    sample.stats.dead_rows += 1;
                    false
                }
                VisibilityClass::InsertInProgress { .. } => {
                    if own {
                        sample.stats.live_rows += 1;
                    }
                    own
                }
                VisibilityClass::DeleteInProgress { .. } => {
                    if own {
                        sample.stats.dead_rows += 1;
                    } else {
                        sample.stats.live_rows += 1;
                    }
                    false
                }
            };

            if keep {
                sample.stats.sampled += 1;
                if sample.rows.len() < target {
                    sample.rows.push(version);
                } else {
                    let j = rng.gen_range(0..sample.stats.sampled) as usize;
                    if j < target {
                        sample.rows[j] = version;
                    }
                }
            }
            Ok(())
        })?;

        debug!(relation = self.store.relation_name(), stats = ?sample.stats, "sampled relation");
        Ok(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mvcc::TransactionTable;
    use crate::storage::MemHeap;
    use std::sync::Arc;

    #[test]
    fn counts_follow_classification() {
        let table = Arc::new(TransactionTable::new());
        let heap = MemHeap::new("items", table.clone());

        let t1 = table.begin_txn().unwrap();
        heap.insert(&t1.context(), "live").unwrap();
        let pruned = heap.insert(&t1.context(), "pruned").unwrap();
        let deleting = heap.insert(&t1.context(), "deleting").unwrap();
        t1.commit();

        let t2 = table.begin_txn().unwrap();
        heap.delete(&t2.context(), pruned).unwrap();
        t2.commit();
        heap.vacuum(table.oldest_xmin()).unwrap();

        let writer = table.begin_txn().unwrap();
        heap.insert(&writer.context(), "foreign insert").unwrap();
        heap.delete(&writer.context(), deleting).unwrap();

        let analyzer = table.begin_txn().unwrap();
        heap.insert(&analyzer.context(), "own insert").unwrap();

        let options = ScanOptions::horizon(table.oldest_xmin());
        let sample = AnalyzeScan::new(&heap, analyzer.context(), &options).run().unwrap();

        // live, deleting (foreign delete in progress), own insert
        assert_eq!(sample.stats.live_rows, 3);
        assert_eq!(sample.stats.dead_rows, 1);
        assert_eq!(sample.stats.sampled, 2);
        let payloads: Vec<_> = sample.rows.iter().map(|r| r.payload.clone()).collect();
        assert_eq!(payloads, vec![b"live".to_vec(), b"own insert".to_vec()]);
    }

    fn committed_rows(count: u8) -> (Arc<TransactionTable>, MemHeap) {
        let table = Arc::new(TransactionTable::new());
        let heap = MemHeap::new("items", table.clone());
        let t1 = table.begin_txn().unwrap();
        for i in 0..count {
            heap.insert(&t1.context(), vec![i]).unwrap();
        }
        t1.commit();
        (table, heap)
    }

    fn sampled_payloads(table: &TransactionTable, heap: &MemHeap, options: &ScanOptions) -> Vec<u8> {
        let analyzer = table.begin_txn().unwrap();
        let sample = AnalyzeScan::new(heap, analyzer.context(), options).run().unwrap();
        sample.rows.iter().map(|r| r.payload[0]).collect()
    }

    #[test]
    fn sample_is_capped_at_target() {
        let (table, heap) = committed_rows(10);
        let analyzer = table.begin_txn().unwrap();
        let options = ScanOptions::horizon(table.oldest_xmin()).sample_target(4);
        let sample = AnalyzeScan::new(&heap, analyzer.context(), &options).run().unwrap();
        assert_eq!(sample.stats.live_rows, 10);
        assert_eq!(sample.stats.sampled, 10);
        assert_eq!(sample.rows.len(), 4);
    }

    #[test]
    fn rows_past_the_target_can_be_sampled() {
        let (table, heap) = committed_rows(100);
        let options = ScanOptions::horizon(table.oldest_xmin()).sample_target(5);
        let payloads = sampled_payloads(&table, &heap, &options);
        assert_eq!(payloads.len(), 5);
        assert!(payloads.iter().any(|p| *p >= 5), "sample {:?} only holds the first rows", payloads);

        let mut distinct = payloads.clone();
        distinct.sort_unstable();
        distinct.dedup();
        assert_eq!(distinct.len(), 5);
    }

    #[test]
    fn sample_depends_only_on_the_seed() {
        let (table, heap) = committed_rows(100);
        let seeded = |seed| ScanOptions::horizon(table.oldest_xmin()).sample_target(5).seed(seed);

        let first = sampled_payloads(&table, &heap, &seeded(7));
        assert_eq!(sampled_payloads(&table, &heap, &seeded(7)), first);
        let others: Vec<_> = (8..16).map(|seed| sampled_payloads(&table, &heap, &seeded(seed))).collect();
        assert!(others.iter().any(|other| *other != first));
    }

    #[test]
    fn small_relation_is_sampled_whole() {
        let (table, heap) = committed_rows(3);
        let options = ScanOptions::horizon(table.oldest_xmin()).sample_target(5);
        assert_eq!(sampled_payloads(&table, &heap, &options), vec![0, 1, 2]);
    }

    #[test]
    fn snapshot_mode_is_rejected() {
        let table = Arc::new(TransactionTable::new());
        let heap = MemHeap::new("items", table.clone());
        let txn = table.begin_txn().unwrap();
        let options = ScanOptions::snapshot(txn.snapshot());
        assert!(AnalyzeScan::new(&heap, txn.context(), &options).run().is_err());
    }
}
