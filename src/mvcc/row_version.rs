//! # Row Versions and Version Pointers
//!
//! A `RowVersion` is one physical version of a logical row as handed to the
//! concurrency core: the payload plus the bookkeeping a visibility decision
//! needs.
//!
//! ## Version Metadata
//!
//! ```text
//! +-----------------+----------------------------------------------+
//! | pointer         | (page, slot) where this version lives        |
//! | next            | superseded-by link; == pointer at chain tip  |
//! | xmin / subxid   | creating transaction                         |
//! | xmax / subxid   | superseding or locking transaction, 0 = none |
//! | cmin / cmax     | command ids inside the creating / superseding|
//! |                 | transaction                                  |
//! | flags           | bitmask, see `flags`                         |
//! | undo_seq        | position in the slot's history, 0 = insert   |
//! | payload         | row bytes (opaque to the core)               |
//! +-----------------+----------------------------------------------+
//! ```
//!
//! `next == pointer` holds for the newest version, after a delete and after an
//! in-place update. The `IN_PLACE_UPDATED` flag tells the last two apart: an
//! in-place update leaves the row at the same pointer with its older content
//! in the slot's undo history.
//!
//! ## Flags Byte (bitmask)
//!
//! ```text
//! Bit 0: SPECULATIVE       - Insert not yet confirmed (upsert in flight)
//! Bit 1: IN_PLACE_UPDATED  - Content replaced in place; older content in undo
//! Bit 2: MOVED_PARTITIONS  - Row was moved to another partition
//! Bit 3: LOCK_ONLY         - xmax only locks the row, it did not supersede it
//! Bit 4: DELETED           - xmax deleted the row
//! Bits 5-7: Reserved
//! ```
//!
//! ## Version Pointers
//!
//! A `VersionPointer` packs into a u64 as `(page << 16) | slot`. Slot
//! `u16::MAX` is reserved: a pointer with that slot says the row was moved to
//! another partition and its true location is unknown.

use super::transaction::{sub_txn, CommandId, SubTxnId, TxnId};
use crate::config::{INVALID_COMMAND_ID, INVALID_SUB_TXN_ID, INVALID_TXN_ID, MOVED_PARTITIONS_SLOT};
use std::fmt;

pub mod flags {
    pub const SPECULATIVE: u8 = 0b0000_0001;
    pub const IN_PLACE_UPDATED: u8 = 0b0000_0010;
    pub const MOVED_PARTITIONS: u8 = 0b0000_0100;
    pub const LOCK_ONLY: u8 = 0b0000_1000;
    pub const DELETED: u8 = 0b0001_0000;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionPointer {
    pub page: u32,
    pub slot: u16,
}

impl VersionPointer {
    pub const MOVED_PARTITIONS: VersionPointer = VersionPointer {
        page: u32::MAX,
        slot: MOVED_PARTITIONS_SLOT,
    };

    pub fn new(page: u32, slot: u16) -> Self {
        Self { page, slot }
    }

    pub fn encode(self) -> u64 {
        ((self.page as u64) << 16) | (self.slot as u64)
    }

    pub fn decode(ptr: u64) -> Self {
        Self {
            page: (ptr >> 16) as u32,
            slot: (ptr & 0xFFFF) as u16,
        }
    }

    pub fn indicates_moved_partitions(self) -> bool {
        self.slot == MOVED_PARTITIONS_SLOT
    }
}

impl fmt::Display for VersionPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.page, self.slot)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowVersion {
    pub pointer: VersionPointer,
    pub next: VersionPointer,
    pub xmin: TxnId,
    pub xmin_subxid: SubTxnId,
    pub xmax: TxnId,
    pub xmax_subxid: SubTxnId,
    pub cmin: CommandId,
    pub cmax: CommandId,
    pub flags: u8,
    /// Bumped by every in-place update of the slot; identifies this content
    /// within the slot's undo history.
    pub undo_seq: u32,
    pub payload: Vec<u8>,
}

impl RowVersion {
    pub fn new(pointer: VersionPointer, xmin: TxnId, cmin: CommandId, payload: Vec<u8>) -> Self {
        Self {
            pointer,
            next: pointer,
            xmin,
            xmin_subxid: INVALID_SUB_TXN_ID,
            xmax: INVALID_TXN_ID,
            xmax_subxid: INVALID_SUB_TXN_ID,
            cmin,
            cmax: INVALID_COMMAND_ID,
            flags: 0,
            undo_seq: 0,
            payload,
        }
    }

    pub fn with_xmin_subxid(mut self, subxid: Option<SubTxnId>) -> Self {
        self.xmin_subxid = subxid.unwrap_or(INVALID_SUB_TXN_ID);
        self
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    /// Records `xmax` as the superseding (or locking) transaction.
    pub fn set_xmax(&mut self, xmax: TxnId, subxid: Option<SubTxnId>, cmax: CommandId) {
        self.xmax = xmax;
        self.xmax_subxid = subxid.unwrap_or(INVALID_SUB_TXN_ID);
        self.cmax = cmax;
    }

    pub fn clear_xmax(&mut self) {
        self.xmax = INVALID_TXN_ID;
        self.xmax_subxid = INVALID_SUB_TXN_ID;
        self.cmax = INVALID_COMMAND_ID;
        self.flags &= !(flags::LOCK_ONLY | flags::DELETED | flags::MOVED_PARTITIONS);
        self.next = self.pointer;
    }

    pub fn xmin_sub(&self) -> Option<SubTxnId> {
        sub_txn(self.xmin_subxid)
    }

    pub fn xmax_sub(&self) -> Option<SubTxnId> {
        sub_txn(self.xmax_subxid)
    }

    pub fn has_xmax(&self) -> bool {
        self.xmax != INVALID_TXN_ID
    }

    pub fn is_chain_tip(&self) -> bool {
        self.next == self.pointer
    }

    pub fn is_speculative(&self) -> bool {
        self.flags & flags::SPECULATIVE != 0
    }

    pub fn is_in_place_updated(&self) -> bool {
        self.flags & flags::IN_PLACE_UPDATED != 0
    }

    pub fn is_moved_partitions(&self) -> bool {
        self.flags & flags::MOVED_PARTITIONS != 0
    }

    pub fn is_lock_only(&self) -> bool {
        self.flags & flags::LOCK_ONLY != 0
    }

    pub fn is_deleted(&self) -> bool {
        self.flags & flags::DELETED != 0
    }

    /// xmax superseded the row (update or delete), not merely locked it.
    pub fn is_superseded(&self) -> bool {
        self.has_xmax() && !self.is_lock_only()
    }

    pub fn set_flag(&mut self, flag: u8, on: bool) {
        if on {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }
}
