//! # Row Lock Protocol Tests
//!
//! End-to-end checks of `RowLocker::lock` against the in-memory heap:
//! update-chain following, wait policies, self-modification, recycled slots
//! and cross-partition moves.
//!
//! ```sh
//! cargo test --test row_lock
//! ```

use rowcc::lock::{LockMode, LockOutcome, LockRequest, RowLocker, WaitPolicy};
use rowcc::mvcc::{concurrency_error, ConcurrencyError, TransactionTable, VersionPointer};
use rowcc::storage::MemHeap;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn setup() -> (Arc<TransactionTable>, MemHeap) {
    let table = Arc::new(TransactionTable::new());
    let heap = MemHeap::new("accounts", table.clone());
    (table, heap)
}

/// Inserts a row and supersedes it `updates` times through new slots.
fn build_chain(table: &TransactionTable, heap: &MemHeap, updates: usize) -> (VersionPointer, VersionPointer) {
    let t = table.begin_txn().unwrap();
    let original = heap.insert(&t.context(), "v0").unwrap();
    t.commit();

    let mut tip = original;
    for i in 1..=updates {
        let t = table.begin_txn().unwrap();
        tip = heap
            .update_to_new_slot(&t.context(), tip, format!("v{}", i))
            .unwrap();
        t.commit();
    }
    (original, tip)
}

#[test]
fn chain_of_updates_is_followed_to_latest_version() {
    let (table, heap) = setup();
    let updates = 6;
    let (original, tip) = build_chain(&table, &heap, updates);

    let locker = table.begin_txn().unwrap();
    let request = LockRequest::new().snapshot(locker.snapshot()).find_latest(true);
    let before = heap.dirty_fetches();
    let result = RowLocker::new(&heap)
        .lock(original, &request, &locker.context())
        .unwrap();

    assert_eq!(result.outcome, LockOutcome::Acquired);
    assert!(result.detail.traversed);
    let version = result.version.unwrap();
    assert_eq!(version.pointer, tip);
    assert_eq!(version.payload, b"v6");
    assert!(heap.dirty_fetches() - before <= updates as u64 + 1);
}

#[test]
fn chain_ending_in_delete_is_deleted() {
    let (table, heap) = setup();
    let updates = 4;
    let (original, tip) = build_chain(&table, &heap, updates);
    let deleter = table.begin_txn().unwrap();
    heap.delete(&deleter.context(), tip).unwrap();
    let deleter_id = deleter.commit();

    let locker = table.begin_txn().unwrap();
    let request = LockRequest::new().snapshot(locker.snapshot()).find_latest(true);
    let before = heap.dirty_fetches();
    let result = RowLocker::new(&heap)
        .lock(original, &request, &locker.context())
        .unwrap();

    assert_eq!(result.outcome, LockOutcome::Deleted);
    assert_eq!(result.detail.pointer, tip);
    assert_eq!(result.detail.xmax, deleter_id);
    assert!(result.version.is_none());
    assert!(heap.dirty_fetches() - before <= updates as u64 + 2);
}

#[test]
fn skip_on_conflict_does_not_wait() {
    let (table, heap) = setup();
    let (original, _) = build_chain(&table, &heap, 0);

    let holder = table.begin_txn().unwrap();
    heap.update_to_new_slot(&holder.context(), original, "pending")
        .unwrap();

    let locker = table.begin_txn().unwrap();
    let request = LockRequest::new()
        .snapshot(locker.snapshot())
        .policy(WaitPolicy::SkipOnConflict)
        .find_latest(true);
    let start = Instant::now();
    let result = RowLocker::new(&heap)
        .lock(original, &request, &locker.context())
        .unwrap();

    assert_eq!(result.outcome, LockOutcome::WouldBlock);
    assert_eq!(result.detail.xmax, holder.id());
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn error_on_conflict_fails_only_while_holder_runs() {
    let (table, heap) = setup();
    let (row, _) = build_chain(&table, &heap, 0);

    let holder = table.begin_txn().unwrap();
    let held = RowLocker::new(&heap)
        .lock(row, &LockRequest::new().mode(LockMode::Share), &holder.context())
        .unwrap();
    assert!(held.is_acquired());

    let locker = table.begin_txn().unwrap();
    let request = LockRequest::new().policy(WaitPolicy::ErrorOnConflict);
    let err = RowLocker::new(&heap)
        .lock(row, &request, &locker.context())
        .unwrap_err();
    match concurrency_error(&err) {
        Some(ConcurrencyError::LockNotAvailable { relation, xid, .. }) => {
            assert_eq!(relation, "accounts");
            assert_eq!(*xid, holder.id());
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(err.to_string().contains("could not obtain lock on row"));

    holder.commit();
    let result = RowLocker::new(&heap)
        .lock(row, &request, &locker.context())
        .unwrap();
    assert_eq!(result.outcome, LockOutcome::Acquired);
}

#[test]
fn own_insert_is_self_modified_until_later_command() {
    let (table, heap) = setup();
    let mut txn = table.begin_txn().unwrap();
    for _ in 0..5 {
        txn.advance_command();
    }
    assert_eq!(txn.cid(), 5);
    let row = heap.insert(&txn.context(), "mine").unwrap();

    let locker = RowLocker::new(&heap);
    let request = LockRequest::new();

    let early = locker.lock(row, &request, &txn.context().with_cid(3)).unwrap();
    assert_eq!(early.outcome, LockOutcome::SelfModified);
    assert_eq!(early.detail.cmax, Some(5));

    let late = locker.lock(row, &request, &txn.context().with_cid(7)).unwrap();
    assert_eq!(late.outcome, LockOutcome::Acquired);
}

#[test]
fn recycled_slot_is_reported_deleted() {
    let (table, heap) = setup();
    let t1 = table.begin_txn().unwrap();
    let original = heap.insert(&t1.context(), "v1").unwrap();
    t1.commit();

    // begins before the updater so its delete is older than the update
    let deleter = table.begin_txn().unwrap();
    let updater = table.begin_txn().unwrap();
    let moved = heap
        .update_to_new_slot(&updater.context(), original, "v2")
        .unwrap();
    let updater_id = updater.commit();
    heap.delete(&deleter.context(), moved).unwrap();
    deleter.commit();

    let stats = heap.vacuum(updater_id).unwrap();
    assert_eq!(stats.pruned, 1);
    assert_eq!(heap.reclaim_pruned(), 1);

    let stranger = table.begin_txn().unwrap();
    let reused = heap.insert(&stranger.context(), "unrelated").unwrap();
    stranger.commit();
    assert_eq!(reused, moved);

    let locker = table.begin_txn().unwrap();
    let request = LockRequest::new().snapshot(locker.snapshot()).find_latest(true);
    let result = RowLocker::new(&heap)
        .lock(original, &request, &locker.context())
        .unwrap();
    assert_eq!(result.outcome, LockOutcome::Deleted);
    assert!(result.detail.traversed);
}

#[test]
fn older_snapshot_locks_version_written_to_new_slot() {
    let (table, heap) = setup();
    let t1 = table.begin_txn().unwrap();
    let row = heap.insert(&t1.context(), "R").unwrap();
    t1.commit();

    let t2 = table.begin_txn().unwrap();
    let t3 = table.begin_txn().unwrap();
    let snapshot = t3.snapshot();
    let newer = heap.update_to_new_slot(&t2.context(), row, "R'").unwrap();
    t2.commit();

    let request = LockRequest::new().snapshot(snapshot).find_latest(true);
    let result = RowLocker::new(&heap).lock(row, &request, &t3.context()).unwrap();
    assert_eq!(result.outcome, LockOutcome::Acquired);
    assert!(result.detail.traversed);
    let version = result.version.unwrap();
    assert_eq!(version.pointer, newer);
    assert_eq!(version.payload, b"R'");
}

#[test]
fn older_snapshot_locks_version_updated_in_place() {
    let (table, heap) = setup();
    let t1 = table.begin_txn().unwrap();
    let row = heap.insert(&t1.context(), "R").unwrap();
    t1.commit();

    let t2 = table.begin_txn().unwrap();
    let t3 = table.begin_txn().unwrap();
    let snapshot = t3.snapshot();
    heap.update(&t2.context(), row, "R'").unwrap();
    t2.commit();

    let request = LockRequest::new().snapshot(snapshot).find_latest(true);
    let result = RowLocker::new(&heap).lock(row, &request, &t3.context()).unwrap();
    assert_eq!(result.outcome, LockOutcome::Acquired);
    assert!(result.detail.traversed);
    let version = result.version.unwrap();
    assert_eq!(version.pointer, row);
    assert_eq!(version.payload, b"R'");
}

#[test]
fn own_insert_and_delete_is_deleted() {
    let (table, heap) = setup();
    let mut txn = table.begin_txn().unwrap();
    let row = heap.insert(&txn.context(), "short-lived").unwrap();
    txn.advance_command();
    heap.delete(&txn.context(), row).unwrap();
    txn.advance_command();

    let request = LockRequest::new().snapshot(txn.snapshot()).find_latest(true);
    let result = RowLocker::new(&heap).lock(row, &request, &txn.context()).unwrap();
    assert_eq!(result.outcome, LockOutcome::Deleted);
    assert_eq!(result.detail.xmax, txn.id());
}

#[test]
fn row_moved_to_other_partition_is_serialization_failure() {
    let (table, heap) = setup();
    let t1 = table.begin_txn().unwrap();
    let row = heap.insert(&t1.context(), "R").unwrap();
    t1.commit();

    let t2 = table.begin_txn().unwrap();
    heap.move_to_other_partition(&t2.context(), row).unwrap();
    t2.commit();

    let locker = table.begin_txn().unwrap();
    let request = LockRequest::new().snapshot(locker.snapshot()).find_latest(true);
    let err = RowLocker::new(&heap)
        .lock(row, &request, &locker.context())
        .unwrap_err();
    assert!(matches!(
        concurrency_error(&err),
        Some(ConcurrencyError::SerializationFailure { .. })
    ));
}

#[test]
fn aborted_insert_is_invisible() {
    let (table, heap) = setup();
    let t1 = table.begin_txn().unwrap();
    let row = heap.insert(&t1.context(), "gone").unwrap();
    t1.rollback();

    let locker = table.begin_txn().unwrap();
    let result = RowLocker::new(&heap)
        .lock(row, &LockRequest::new().find_latest(true), &locker.context())
        .unwrap();
    assert_eq!(result.outcome, LockOutcome::Invisible);
}
