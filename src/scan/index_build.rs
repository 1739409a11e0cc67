//! Index build scan.
//!
//! Visits every occupied slot in physical order and hands the versions that
//! need an index entry to a callback together with a `live` flag. In horizon
//! mode the decision comes from `classify`; in snapshot mode a version is
//! indexed, and live, exactly when the snapshot sees it.

use super::{ScanOptions, ScanVisibility};
use crate::lock::{WaitCoordinator, WaitPolicy};
use crate::mvcc::{classify, RowVersion, Snapshot, TxnContext, TxnId, VersionPointer, VisibilityClass};
use crate::storage::{SlotState, VersionStore};
use eyre::{Result, WrapErr};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildStats {
    /// Occupied slots visited.
    pub scanned: u64,
    pub indexed: u64,
    pub live: u64,
    /// Waits on running writers for uniqueness checking.
    pub waits: u64,
    /// Concurrent-writer warnings logged; none for system relations.
    pub warnings: u64,
}

pub struct IndexBuildScan<'a> {
    store: &'a dyn VersionStore,
    ctx: TxnContext,
    options: &'a ScanOptions,
}

impl<'a> IndexBuildScan<'a> {
    pub fn new(store: &'a dyn VersionStore, ctx: TxnContext, options: &'a ScanOptions) -> Self {
        Self { store, ctx, options }
    }

    pub fn run<F>(&self, mut callback: F) -> Result<BuildStats>
    where
        F: FnMut(&RowVersion, bool) -> Result<()>,
    {
        self.options.validate()?;
        let mut stats = BuildStats::default();

        for page in 0..self.store.page_count() {
            for slot in 0..self.store.max_slot(page) {
                let pointer = VersionPointer::new(page, slot);
                let decision = match self.options.visibility() {
                    ScanVisibility::Horizon(oldest_xmin) => self.decide_by_horizon(pointer, *oldest_xmin, &mut stats)?,
                    ScanVisibility::Snapshot(snapshot) => self.decide_by_snapshot(pointer, snapshot, &mut stats)?,
                };
                let Some((version, live)) = decision else { continue };
                if !self.options.matches(&version.payload) {
                    continue;
                }

                callback(&version, live).wrap_err_with(|| format!("indexing row {}", pointer))?;
                stats.indexed += 1;
                if live {
                    stats.live += 1;
                }
            }
        }

        debug!(relation = self.store.relation_name(), ?stats, "index build scan finished");
        Ok(stats)
    }

    fn decide_by_snapshot(
        &self,
        pointer: VersionPointer,
        snapshot: &Snapshot,
        stats: &mut BuildStats,
    ) -> Result<Option<(RowVersion, bool)>> {
        if !matches!(self.store.read_slot(pointer)?, SlotState::Occupied(_)) {
            return Ok(None);
        }
        stats.scanned += 1;
        Ok(self.store.fetch_visible(pointer, snapshot)?.map(|v| (v, true)))
    }

    fn decide_by_horizon(
        &self,
        pointer: VersionPointer,
        oldest_xmin: TxnId,
        stats: &mut BuildStats,
    ) -> Result<Option<(RowVersion, bool)>> {
        let oracle = self.store.oracle();
        let relation = self.store.relation_name();
        let mut counted = false;

        loop {
            let SlotState::Occupied(version) = self.store.read_slot(pointer)? else {
                return Ok(None);
            };
            if !counted {
                stats.scanned += 1;
                counted = true;
            }

            let class = classify(&version, oldest_xmin, oracle)?;
            trace!(%pointer, ?class, "classified version");

            let (include, live) = match class {
                VisibilityClass::Dead => (false, false),
                VisibilityClass::Live => (true, true),
                VisibilityClass::RecentlyDead => (true, false),
                VisibilityClass::InsertInProgress { xid, subxid }
                | VisibilityClass::DeleteInProgress { xid, subxid } => {
                    let inserting = matches!(class, VisibilityClass::InsertInProgress { .. });
                    if !self.options.any_visible && !self.ctx.is_current(xid) {
                        if !self.options.system_relation {
                            if inserting {
                                warn!(relation, xid, "concurrent insert in progress within table \"{}\"", relation);
                            } else {
                                warn!(relation, xid, "concurrent delete in progress within table \"{}\"", relation);
                            }
                            stats.warnings += 1;
                        }
                        if self.options.check_unique {
                            WaitCoordinator::new(oracle, self.ctx.xid())
                                .with_relation(relation)
                                .wait(xid, subxid, WaitPolicy::Block)?;
                            stats.waits += 1;
                            continue;
                        }
                    }
                    (true, inserting)
                }
            };

            return Ok(include.then_some((version, live)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mvcc::TransactionTable;
    use crate::storage::MemHeap;
    use std::sync::Arc;

    fn collect(heap: &MemHeap, ctx: TxnContext, options: &ScanOptions) -> (BuildStats, Vec<(Vec<u8>, bool)>) {
        let mut rows = Vec::new();
        let stats = IndexBuildScan::new(heap, ctx, options)
            .run(|v, live| {
                rows.push((v.payload.clone(), live));
                Ok(())
            })
            .unwrap();
        (stats, rows)
    }

    #[test]
    fn horizon_mode_maps_classes() {
        let table = Arc::new(TransactionTable::new());
        let heap = MemHeap::new("items", table.clone());

        let t1 = table.begin_txn().unwrap();
        heap.insert(&t1.context(), "live").unwrap();
        let doomed = heap.insert(&t1.context(), "recently-dead").unwrap();
        t1.commit();

        let old_reader = table.begin_txn().unwrap();
        let t2 = table.begin_txn().unwrap();
        heap.delete(&t2.context(), doomed).unwrap();
        t2.commit();

        let t3 = table.begin_txn().unwrap();
        heap.insert(&t3.context(), "aborted").unwrap();
        t3.rollback();

        let builder = table.begin_txn().unwrap();
        let options = ScanOptions::horizon(table.oldest_xmin());
        let (stats, rows) = collect(&heap, builder.context(), &options);

        assert_eq!(stats.scanned, 3);
        assert_eq!(stats.indexed, 2);
        assert_eq!(stats.live, 1);
        assert!(rows.contains(&(b"live".to_vec(), true)));
        assert!(rows.contains(&(b"recently-dead".to_vec(), false)));
        drop(old_reader);
    }

    #[test]
    fn own_insert_in_progress_is_live() {
        let table = Arc::new(TransactionTable::new());
        let heap = MemHeap::new("items", table.clone());
        let txn = table.begin_txn().unwrap();
        heap.insert(&txn.context(), "mine").unwrap();

        let options = ScanOptions::horizon(table.oldest_xmin()).check_unique(true);
        let (stats, rows) = collect(&heap, txn.context(), &options);
        assert_eq!(stats.waits, 0);
        assert_eq!(rows, vec![(b"mine".to_vec(), true)]);
    }

    #[test]
    fn any_visible_indexes_in_progress_without_waiting() {
        let table = Arc::new(TransactionTable::new());
        let heap = MemHeap::new("items", table.clone());
        let t1 = table.begin_txn().unwrap();
        let ptr = heap.insert(&t1.context(), "deleting").unwrap();
        t1.commit();

        let writer = table.begin_txn().unwrap();
        heap.insert(&writer.context(), "inserting").unwrap();
        heap.delete(&writer.context(), ptr).unwrap();

        let builder = table.begin_txn().unwrap();
        let options = ScanOptions::horizon(table.oldest_xmin()).any_visible(true);
        let (stats, rows) = collect(&heap, builder.context(), &options);
        assert_eq!(stats.waits, 0);
        assert!(rows.contains(&(b"inserting".to_vec(), true)));
        assert!(rows.contains(&(b"deleting".to_vec(), false)));
    }

    #[test]
    fn snapshot_mode_indexes_visible_versions_only() {
        let table = Arc::new(TransactionTable::new());
        let heap = MemHeap::new("items", table.clone());
        let t1 = table.begin_txn().unwrap();
        let ptr = heap.insert(&t1.context(), "v1").unwrap();
        t1.commit();

        let builder = table.begin_txn().unwrap();
        let snapshot = builder.snapshot();
        let t2 = table.begin_txn().unwrap();
        heap.update(&t2.context(), ptr, "v2").unwrap();
        heap.insert(&t2.context(), "new").unwrap();
        t2.commit();

        let options = ScanOptions::snapshot(snapshot);
        let (stats, rows) = collect(&heap, builder.context(), &options);
        assert_eq!(stats.scanned, 2);
        assert_eq!(rows, vec![(b"v1".to_vec(), true)]);
    }

    #[test]
    fn predicate_limits_partial_index() {
        let table = Arc::new(TransactionTable::new());
        let heap = MemHeap::new("items", table.clone());
        let t1 = table.begin_txn().unwrap();
        heap.insert(&t1.context(), "keep").unwrap();
        heap.insert(&t1.context(), "skip").unwrap();
        t1.commit();

        let builder = table.begin_txn().unwrap();
        let options = ScanOptions::horizon(table.oldest_xmin()).predicate(|p| p == b"keep");
        let (stats, rows) = collect(&heap, builder.context(), &options);
        assert_eq!(stats.scanned, 2);
        assert_eq!(rows, vec![(b"keep".to_vec(), true)]);
    }
}
