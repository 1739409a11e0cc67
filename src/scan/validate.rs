//! Index validation scan.
//!
//! Second phase of a concurrent index build: the index already holds entries
//! for everything the build scan saw. Merging the sorted list of indexed
//! pointers against the heap in physical order finds the versions visible to
//! the validation snapshot that are still missing, and hands them to the
//! insert callback.

use super::{ScanOptions, ScanVisibility};
use crate::mvcc::{RowVersion, VersionPointer};
use crate::storage::{SlotState, VersionStore};
use eyre::{bail, ensure, Result};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidateStats {
    /// Versions visible to the validation snapshot.
    pub heap_tuples: u64,
    pub inserted: u64,
}

pub struct IndexValidateScan<'a> {
    store: &'a dyn VersionStore,
    options: &'a ScanOptions,
}

impl<'a> IndexValidateScan<'a> {
    pub fn new(store: &'a dyn VersionStore, options: &'a ScanOptions) -> Self {
        Self { store, options }
    }

    /// `indexed` must be sorted ascending.
    pub fn run<F>(&self, indexed: &[VersionPointer], mut insert: F) -> Result<ValidateStats>
    where
        F: FnMut(&RowVersion) -> Result<()>,
    {
        self.options.validate()?;
        let ScanVisibility::Snapshot(snapshot) = self.options.visibility() else {
            bail!("index validation needs an MVCC snapshot");
        };
        ensure!(
            indexed.windows(2).all(|w| w[0] <= w[1]),
            "indexed pointers must be sorted"
        );

        let mut stats = ValidateStats::default();
        let mut pending = indexed.iter().peekable();

        self.store.scan_slots(&mut |pointer, state| {
            if !matches!(state, SlotState::Occupied(_)) {
                return Ok(());
            }
            let Some(version) = self.store.fetch_visible(pointer, snapshot)? else {
                return Ok(());
            };
            stats.heap_tuples += 1;

            while pending.next_if(|p| **p < pointer).is_some() {}
            let in_index = pending.next_if_eq(&&pointer).is_some();
            if !in_index && self.options.matches(&version.payload) {
                insert(&version)?;
                stats.inserted += 1;
            }
            Ok(())
        })?;

        debug!(relation = self.store.relation_name(), ?stats, "index validation finished");
        Ok(stats)
    }
}
