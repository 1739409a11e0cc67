//! # Bulk Scan Drivers
//!
//! Maintenance operations walk a relation in physical order and decide, per
//! row version, whether it takes part in the operation. Three drivers share
//! the visibility classifier, a fourth samples under a snapshot:
//!
//! - `IndexBuildScan`: which versions get an index entry and which of those
//!   are live (needed for uniqueness checks).
//! - `IndexValidateScan`: merge of MVCC-visible versions against the entries
//!   an index already has, inserting the missing ones.
//! - `AnalyzeScan`: live/dead row counts and a row sample for statistics.
//! - `TableSampleScan`: block-then-slot sampling of the rows an MVCC snapshot
//!   sees, with pages and slots picked by a `SampleMethod`.
//!
//! ## Index Build Mapping (horizon mode)
//!
//! | Class                    | include | live | note                           |
//! |--------------------------|---------|------|--------------------------------|
//! | Dead                     | no      | no   |                                |
//! | Live                     | yes     | yes  |                                |
//! | RecentlyDead             | yes     | no   |                                |
//! | InsertInProgress (other) | yes     | yes  | unique: wait, then reclassify  |
//! | InsertInProgress (own)   | yes     | yes  |                                |
//! | DeleteInProgress (other) | yes     | no   | unique: wait, then reclassify  |
//! | DeleteInProgress (own)   | yes     | no   |                                |
//!
//! Running writers of other transactions are reported with `tracing::warn!`
//! unless the relation is a system relation. In any-visible mode in-progress
//! classes map straight to include without waiting.
//!
//! ## Sampling Mapping
//!
//! | Class                    | counted as | sampled |
//! |--------------------------|------------|---------|
//! | Live                     | live       | yes     |
//! | Dead / RecentlyDead      | dead       | no      |
//! | InsertInProgress (other) | ignored    | no      |
//! | InsertInProgress (own)   | live       | yes     |
//! | DeleteInProgress (other) | live       | no      |
//! | DeleteInProgress (own)   | dead       | no      |
//!
//! Pruned slots count as dead; unused slots are skipped. Sampling never waits.

pub mod analyze;
pub mod index_build;
pub mod sample;
pub mod validate;

pub use analyze::{AnalyzeScan, Sample, SampleStats};
pub use index_build::{BuildStats, IndexBuildScan};
pub use sample::{BernoulliSample, SampleMethod, SystemSample, TableSampleScan, TableSampleStats};
pub use validate::{IndexValidateScan, ValidateStats};

use crate::config::{DEFAULT_SAMPLE_SEED, DEFAULT_SAMPLE_TARGET};
use crate::mvcc::{Snapshot, TxnId};
use eyre::{ensure, Result};

/// Partial-index predicate over a row's payload.
pub type Predicate = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanVisibility {
    /// Classify against the oldest-xmin horizon.
    Horizon(TxnId),
    /// Take only versions visible to an MVCC snapshot.
    Snapshot(Snapshot),
}

pub struct ScanOptions {
    visibility: ScanVisibility,
    system_relation: bool,
    check_unique: bool,
    any_visible: bool,
    predicate: Option<Predicate>,
    sample_target: usize,
    seed: u64,
}

impl ScanOptions {
    pub fn horizon(oldest_xmin: TxnId) -> Self {
        Self::with_visibility(ScanVisibility::Horizon(oldest_xmin))
    }

    pub fn snapshot(snapshot: Snapshot) -> Self {
        Self::with_visibility(ScanVisibility::Snapshot(snapshot))
    }

    fn with_visibility(visibility: ScanVisibility) -> Self {
        Self {
            visibility,
            system_relation: false,
            check_unique: false,
            any_visible: false,
            predicate: None,
            sample_target: DEFAULT_SAMPLE_TARGET,
            seed: DEFAULT_SAMPLE_SEED,
        }
    }

    pub fn system_relation(mut self, on: bool) -> Self {
        self.system_relation = on;
        self
    }

    pub fn check_unique(mut self, on: bool) -> Self {
        self.check_unique = on;
        self
    }

    pub fn any_visible(mut self, on: bool) -> Self {
        self.any_visible = on;
        self
    }

    pub fn predicate(mut self, predicate: impl Fn(&[u8]) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Box::new(predicate));
        self
    }

    pub fn sample_target(mut self, target: usize) -> Self {
        self.sample_target = target;
        self
    }

    /// Seeds the random source of sampling scans; equal seeds over an
    /// unchanged relation pick the same rows.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn visibility(&self) -> &ScanVisibility {
        &self.visibility
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !(self.any_visible && self.check_unique),
            "uniqueness cannot be checked while indexing any visible version"
        );
        ensure!(self.sample_target > 0, "sample target must be positive");
        Ok(())
    }

    pub(crate) fn matches(&self, payload: &[u8]) -> bool {
        self.predicate.as_ref().map_or(true, |p| p(payload))
    }
}

impl std::fmt::Debug for ScanOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanOptions")
            .field("visibility", &self.visibility)
            .field("system_relation", &self.system_relation)
            .field("check_unique", &self.check_unique)
            .field("any_visible", &self.any_visible)
            .field("predicate", &self.predicate.is_some())
            .field("sample_target", &self.sample_target)
            .field("seed", &self.seed)
            .finish()
    }
}
