//! # rowcc Configuration Constants
//!
//! This module centralizes the configuration constants of the concurrency
//! core, grouping interdependent values together and documenting their
//! relationships. Constants that depend on each other are co-located to
//! prevent mismatch bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! INVALID_TXN_ID (0) < FROZEN_TXN_ID (1) < FIRST_NORMAL_TXN_ID (2)
//!       │
//!       └─> TransactionTable starts allocating at FIRST_NORMAL_TXN_ID.
//!           Anything below it is never "running" and never aborted.
//!
//! MAX_SLOTS_PER_PAGE (u16)
//!       │
//!       └─> VersionPointer::MOVED_PARTITIONS uses slot u16::MAX, so a real
//!           slot number can never reach it.
//!
//! WAIT_POLL_INTERVAL
//!       │
//!       └─> Upper bound on how long a blocked waiter sleeps before it
//!           re-checks for cancellation of its own transaction.
//! ```
//!
//! ## Critical Invariants
//!
//! These invariants are enforced by compile-time assertions:
//!
//! 1. `INVALID_TXN_ID < FROZEN_TXN_ID < FIRST_NORMAL_TXN_ID`
//! 2. `MAX_SLOTS_PER_PAGE < u16::MAX` (sentinel slot stays free)
//! 3. `DEFAULT_SAMPLE_TARGET > 0`
//!
//! ## Usage
//!
//! ```ignore
//! use rowcc::config::{FIRST_NORMAL_TXN_ID, WAIT_POLL_INTERVAL};
//! ```

use std::time::Duration;

// ============================================================================
// TRANSACTION IDENTIFIERS
// Reserved values are shared by the classifier, the snapshot rules and the
// transaction table, so they must agree.
// ============================================================================

/// No transaction. An invalid xmax marks the tip of an update chain.
pub const INVALID_TXN_ID: u64 = 0;

/// Always committed and older than every snapshot (bootstrapped data).
pub const FROZEN_TXN_ID: u64 = 1;

/// First id handed out by the transaction table.
pub const FIRST_NORMAL_TXN_ID: u64 = 2;

/// Sub-transaction id meaning "top level".
pub const INVALID_SUB_TXN_ID: u32 = 0;

/// First command id of every transaction.
pub const FIRST_COMMAND_ID: u32 = 0;

/// Command id stored in cmax while a version has not been superseded.
pub const INVALID_COMMAND_ID: u32 = u32::MAX;

const _: () = assert!(
    INVALID_TXN_ID < FROZEN_TXN_ID && FROZEN_TXN_ID < FIRST_NORMAL_TXN_ID,
    "reserved transaction ids must sort below normal ids"
);

// ============================================================================
// PAGE / SLOT LIMITS
// ============================================================================

/// Maximum number of row slots on a single page of the reference engine.
pub const MAX_SLOTS_PER_PAGE: u16 = 256;

/// Slot number reserved for the "moved to another partition" pointer.
pub const MOVED_PARTITIONS_SLOT: u16 = u16::MAX;

const _: () = assert!(
    MAX_SLOTS_PER_PAGE < MOVED_PARTITIONS_SLOT,
    "the moved-partitions sentinel slot must never be a real slot"
);

// ============================================================================
// CONCURRENCY LIMITS
// ============================================================================

/// Maximum number of concurrent transactions tracked by the horizon slots.
pub const MAX_CONCURRENT_TXNS: usize = 64;

/// How long a blocked waiter sleeps between cancellation checks.
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// SCAN CONFIGURATION
// ============================================================================

/// Default number of rows kept by a statistics sampling scan.
pub const DEFAULT_SAMPLE_TARGET: usize = 30_000;

const _: () = assert!(DEFAULT_SAMPLE_TARGET > 0, "sample target must be positive");

/// Seed of the sampling random source when the caller does not pick one.
pub const DEFAULT_SAMPLE_SEED: u64 = 0x5EED_0F_5A4D;
