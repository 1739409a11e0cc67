//! # rowcc Configuration Module
//!
//! This module centralizes the numeric configuration of the concurrency core.
//! Reserved transaction ids, slot limits and wait timing are read by several
//! modules (classifier, snapshots, transaction table, reference engine), so
//! they live here next to each other with compile-time checks.
//!
//! Per-call knobs are not constants: they are carried by the builders next to
//! their consumers, [`crate::lock::LockRequest`] and [`crate::scan::ScanOptions`].
//!
//! ## Module Organization
//!
//! - [`constants`]: All numeric configuration values with dependency documentation

pub mod constants;
pub use constants::*;
