//! Block sampling scan.
//!
//! Returns a random subset of the rows visible to an MVCC snapshot, picking
//! pages first and slots within each picked page second. What gets picked
//! is up to a `SampleMethod`:
//!
//! ```text
//! next_block(prev, pages) ──> page ──> next_tuple(page, prev, slots) ──> slot
//!        ^                                  │                            │
//!        │          None: page done         │     occupied + visible?    │
//!        └──────────────────────────────────┘<──── no: ask again ────────┘
//!                                                  yes: hand to callback
//! ```
//!
//! A method that does not choose pages gets every page in physical order.
//! Slots that hold no row and versions the snapshot does not see are passed
//! over without counting against the method.

use super::{ScanOptions, ScanVisibility};
use crate::mvcc::{RowVersion, VersionPointer};
use crate::storage::{SlotState, VersionStore};
use eyre::{bail, ensure, Result, WrapErr};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, trace};

/// Picks pages and slots for a `TableSampleScan`.
pub trait SampleMethod {
    /// Page to visit after `previous`, or `None` to end the scan. Every page
    /// in order by default.
    fn next_block(&mut self, previous: Option<u32>, page_count: u32) -> Option<u32> {
        let next = previous.map_or(0, |p| p + 1);
        (next < page_count).then_some(next)
    }

    /// Slot of `page` to return after `previous`, or `None` when the page is
    /// done. Picks must increase within a page and stay below `max_slot`.
    fn next_tuple(&mut self, page: u32, previous: Option<u16>, max_slot: u16) -> Option<u16>;
}

fn check_fraction(fraction: f64) -> Result<()> {
    ensure!(
        (0.0..=1.0).contains(&fraction),
        "sample fraction {} is outside [0, 1]",
        fraction
    );
    Ok(())
}

/// Visits every page and returns each slot with probability `fraction`.
pub struct BernoulliSample {
    fraction: f64,
    rng: ChaCha8Rng,
}

impl BernoulliSample {
    pub fn new(fraction: f64, seed: u64) -> Result<Self> {
        check_fraction(fraction)?;
        Ok(Self {
            fraction,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }
}

impl SampleMethod for BernoulliSample {
    fn next_tuple(&mut self, _page: u32, previous: Option<u16>, max_slot: u16) -> Option<u16> {
        let start = previous.map_or(0, |s| s + 1);
        (start..max_slot).find(|_| self.rng.gen_bool(self.fraction))
    }
}

/// Picks each page with probability `fraction` and returns all of its slots.
pub struct SystemSample {
    fraction: f64,
    rng: ChaCha8Rng,
}

impl SystemSample {
    pub fn new(fraction: f64, seed: u64) -> Result<Self> {
        check_fraction(fraction)?;
        Ok(Self {
            fraction,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }
}

impl SampleMethod for SystemSample {
    fn next_block(&mut self, previous: Option<u32>, page_count: u32) -> Option<u32> {
        let start = previous.map_or(0, |p| p + 1);
        (start..page_count).find(|_| self.rng.gen_bool(self.fraction))
    }

    fn next_tuple(&mut self, _page: u32, previous: Option<u16>, max_slot: u16) -> Option<u16> {
        let next = previous.map_or(0, |s| s + 1);
        (next < max_slot).then_some(next)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableSampleStats {
    pub pages: u64,
    /// Slots the method picked, visible or not.
    pub examined: u64,
    pub returned: u64,
}

pub struct TableSampleScan<'a> {
    store: &'a dyn VersionStore,
    options: &'a ScanOptions,
}

impl<'a> TableSampleScan<'a> {
    pub fn new(store: &'a dyn VersionStore, options: &'a ScanOptions) -> Self {
        Self { store, options }
    }

    pub fn run<M, F>(&self, method: &mut M, mut callback: F) -> Result<TableSampleStats>
    where
        M: SampleMethod + ?Sized,
        F: FnMut(&RowVersion) -> Result<()>,
    {
        self.options.validate()?;
        let ScanVisibility::Snapshot(snapshot) = self.options.visibility() else {
            bail!("table sampling needs an MVCC snapshot");
        };

        let mut stats = TableSampleStats::default();
        let page_count = self.store.page_count();
        if page_count == 0 {
            return Ok(stats);
        }

        let mut page = None;
        while let Some(next_page) = method.next_block(page, page_count) {
            ensure!(
                next_page < page_count,
                "sample method picked page {} of a relation with {} pages",
                next_page,
                page_count
            );
            page = Some(next_page);
            stats.pages += 1;

            let max_slot = self.store.max_slot(next_page);
            let mut slot = None;
            while let Some(next_slot) = method.next_tuple(next_page, slot, max_slot) {
                ensure!(
                    next_slot < max_slot && slot.map_or(true, |s| next_slot > s),
                    "sample method picked slot {} on page {} out of order",
                    next_slot,
                    next_page
                );
                slot = Some(next_slot);
                stats.examined += 1;

                let pointer = VersionPointer::new(next_page, next_slot);
                if !matches!(self.store.read_slot(pointer)?, SlotState::Occupied(_)) {
                    continue;
                }
                let Some(version) = self.store.fetch_visible(pointer, snapshot)? else {
                    trace!(%pointer, "sampled version is invisible to the snapshot");
                    continue;
                };
                callback(&version).wrap_err_with(|| format!("sampling row {}", pointer))?;
                stats.returned += 1;
            }
        }

        debug!(relation = self.store.relation_name(), ?stats, "table sample scan finished");
        Ok(stats)
    }
}
