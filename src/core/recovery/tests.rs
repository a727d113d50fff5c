// src/core/recovery/tests.rs
use super::*;
use crate::core::storage::disk::{page_in_partition, MemoryDiskManager};
use crate::core::storage::MemoryBufferManager;
use crate::core::transaction::Transaction;
use std::path::Path;
use tempfile::NamedTempFile;

struct Harness {
    recovery: Arc<RecoveryManager>,
    buffer: Arc<MemoryBufferManager>,
    disk: Arc<MemoryDiskManager>,
}

fn wire(log: LogManager) -> Harness {
    let factory: TransactionFactory =
        Box::new(|id| -> Arc<dyn TransactionContext> { Arc::new(Transaction::new(id)) });
    let recovery = Arc::new(RecoveryManager::new(log, factory));
    let buffer = Arc::new(MemoryBufferManager::new());
    let disk = Arc::new(MemoryDiskManager::new());
    recovery.set_managers(
        Arc::<MemoryDiskManager>::clone(&disk),
        Arc::<MemoryBufferManager>::clone(&buffer),
    );
    buffer.set_recovery_manager(&recovery);
    Harness { recovery, buffer, disk }
}

/// Fresh database: new log, master record, initial checkpoint.
fn fresh(path: &Path) -> Harness {
    let harness = wire(LogManager::create(path).unwrap());
    harness.recovery.initialize().unwrap();
    harness
}

/// Reopen after a simulated crash: only flushed records survive, and the
/// page cache and disk bookkeeping start cold.
fn reopen(path: &Path) -> Harness {
    wire(LogManager::open(path).unwrap())
}

fn begin(harness: &Harness, id: u64) -> TransactionId {
    let txn_id = TransactionId(id);
    harness.recovery.start_transaction(Arc::new(Transaction::new(txn_id)));
    txn_id
}

/// Logs a page write and applies it to the cached page, the way the page
/// write path does: log first, then mutate, then stamp the page LSN.
fn write_page(
    harness: &Harness,
    txn_id: TransactionId,
    page_id: PageId,
    offset: u16,
    before: &[u8],
    after: &[u8],
) -> Lsn {
    let lsn = harness.recovery.log_page_write(txn_id, page_id, offset, before, after);
    let handle = harness.buffer.fetch_page(page_id).unwrap();
    handle.with_page_mut(|page| {
        page.write(usize::from(offset), after).unwrap();
        page.set_page_lsn(lsn);
    });
    lsn
}

fn page_bytes(harness: &Harness, page_id: PageId, offset: usize, len: usize) -> Vec<u8> {
    let handle = harness.buffer.fetch_page(page_id).unwrap();
    handle.with_page(|page| page.read(offset, len).unwrap().to_vec())
}

fn status_of(harness: &Harness, txn_id: TransactionId) -> Option<TransactionStatus> {
    harness
        .recovery
        .txn_table_snapshot()
        .into_iter()
        .find(|(id, _, _)| *id == txn_id)
        .map(|(_, status, _)| status)
}

// Forward path ///////////////////////////////////////////////////////////

#[test]
fn test_commit_is_durable() {
    let file = NamedTempFile::new().unwrap();
    let h = fresh(file.path());
    let t1 = begin(&h, 1);

    let update_lsn = write_page(&h, t1, PageId(7), 0, &[0x00], &[0x42]);
    let commit_lsn = h.recovery.commit(t1).unwrap();

    match h.recovery.log_manager().fetch(update_lsn).unwrap() {
        LogRecord::UpdatePage { txn_id, page_id, offset, before, after, .. } => {
            assert_eq!(txn_id, t1);
            assert_eq!(page_id, PageId(7));
            assert_eq!(offset, 0);
            assert_eq!(before, vec![0x00]);
            assert_eq!(after, vec![0x42]);
        }
        other => panic!("expected update record, got {other:?}"),
    }
    match h.recovery.log_manager().fetch(commit_lsn).unwrap() {
        LogRecord::CommitTransaction { prev_lsn, .. } => assert_eq!(prev_lsn, update_lsn),
        other => panic!("expected commit record, got {other:?}"),
    }
    assert!(h.recovery.log_manager().flushed_lsn() >= commit_lsn);
    assert_eq!(status_of(&h, t1), Some(TransactionStatus::Committing));

    let end_lsn = h.recovery.end(t1).unwrap();
    match h.recovery.log_manager().fetch(end_lsn).unwrap() {
        LogRecord::EndTransaction { prev_lsn, .. } => assert_eq!(prev_lsn, commit_lsn),
        other => panic!("expected end record, got {other:?}"),
    }
    assert_eq!(status_of(&h, t1), None);
}

#[test]
fn test_abort_then_end_rolls_back_with_clrs() {
    let file = NamedTempFile::new().unwrap();
    let h = fresh(file.path());
    let t1 = begin(&h, 1);
    let p7 = PageId(7);

    let u1 = write_page(&h, t1, p7, 0, &[0x00], &[0x42]);
    let u2 = write_page(&h, t1, p7, 0, &[0x42], &[0x55]);
    let abort_lsn = h.recovery.abort(t1);
    assert_eq!(status_of(&h, t1), Some(TransactionStatus::Aborting));

    let end_lsn = h.recovery.end(t1).unwrap();

    // Two CLRs, newest change undone first.
    let clr1 = h.recovery.log_manager().fetch(abort_lsn + 1).unwrap();
    match &clr1 {
        LogRecord::UndoUpdatePage { prev_lsn, after, undo_next_lsn, .. } => {
            assert_eq!(*prev_lsn, abort_lsn);
            assert_eq!(after, &vec![0x42]);
            assert_eq!(*undo_next_lsn, u1);
        }
        other => panic!("expected first CLR, got {other:?}"),
    }
    let clr2 = h.recovery.log_manager().fetch(abort_lsn + 2).unwrap();
    match &clr2 {
        LogRecord::UndoUpdatePage { prev_lsn, after, undo_next_lsn, .. } => {
            assert_eq!(*prev_lsn, clr1.lsn());
            assert_eq!(after, &vec![0x00]);
            assert_eq!(*undo_next_lsn, NO_LSN);
        }
        other => panic!("expected second CLR, got {other:?}"),
    }
    match h.recovery.log_manager().fetch(end_lsn).unwrap() {
        LogRecord::EndTransaction { prev_lsn, .. } => assert_eq!(prev_lsn, clr2.lsn()),
        other => panic!("expected end record, got {other:?}"),
    }
    assert_eq!(page_bytes(&h, p7, 0, 1), vec![0x00]);
    let _ = u2;
}

#[test]
fn test_rollback_to_savepoint_uses_strict_bound() {
    let file = NamedTempFile::new().unwrap();
    let h = fresh(file.path());
    let t1 = begin(&h, 1);
    let p7 = PageId(7);

    let u1 = write_page(&h, t1, p7, 0, &[0x00], &[0x11]);
    h.recovery.savepoint(t1, "sp");
    let _u2 = write_page(&h, t1, p7, 0, &[0x11], &[0x22]);

    let log_end_before = h.recovery.log_manager().last_lsn().unwrap();
    h.recovery.rollback_to_savepoint(t1, "sp").unwrap();

    // Exactly one CLR: the write at the savepoint LSN itself stays applied.
    let clr = h.recovery.log_manager().fetch(log_end_before + 1).unwrap();
    match clr {
        LogRecord::UndoUpdatePage { after, undo_next_lsn, .. } => {
            assert_eq!(after, vec![0x11]);
            assert_eq!(undo_next_lsn, u1);
        }
        other => panic!("expected CLR, got {other:?}"),
    }
    assert_eq!(h.recovery.log_manager().last_lsn().unwrap(), log_end_before + 1);
    assert_eq!(page_bytes(&h, p7, 0, 1), vec![0x11]);
    // Status unchanged by a partial rollback.
    assert_eq!(status_of(&h, t1), Some(TransactionStatus::Running));

    h.recovery.release_savepoint(t1, "sp");
}

#[test]
fn test_alloc_and_free_flush_immediately() {
    let file = NamedTempFile::new().unwrap();
    let h = fresh(file.path());
    let t1 = begin(&h, 1);
    let part = PartitionId(1);
    let page = page_in_partition(part, 4);

    let part_lsn = h.recovery.log_alloc_part(t1, part).unwrap().unwrap();
    h.disk.alloc_partition(part).unwrap();
    assert!(h.recovery.log_manager().flushed_lsn() >= part_lsn);

    let page_lsn = h.recovery.log_alloc_page(t1, page).unwrap().unwrap();
    h.disk.alloc_page(page).unwrap();
    assert!(h.recovery.log_manager().flushed_lsn() >= page_lsn);
    assert_eq!(h.recovery.pages_touched_by(t1), vec![page]);

    // Rolling back frees the page, then the partition.
    h.recovery.abort(t1);
    h.recovery.end(t1).unwrap();
    assert!(!h.disk.is_page_allocated(page));
}

#[test]
fn test_operations_on_log_partition_are_ignored() {
    let file = NamedTempFile::new().unwrap();
    let h = fresh(file.path());
    let t1 = begin(&h, 1);

    assert_eq!(h.recovery.log_alloc_part(t1, LOG_PARTITION).unwrap(), None);
    assert_eq!(h.recovery.log_free_part(t1, LOG_PARTITION).unwrap(), None);
    // Page 7 lives in partition 0.
    assert_eq!(h.recovery.log_alloc_page(t1, PageId(7)).unwrap(), None);
    assert_eq!(h.recovery.log_free_page(t1, PageId(7)).unwrap(), None);

    // Nothing was logged for the transaction.
    let (_, _, last_lsn) = h
        .recovery
        .txn_table_snapshot()
        .into_iter()
        .find(|(id, _, _)| *id == t1)
        .unwrap();
    assert_eq!(last_lsn, NO_LSN);
}

#[test]
fn test_free_page_leaves_dirty_page_table() {
    let file = NamedTempFile::new().unwrap();
    let h = fresh(file.path());
    let t1 = begin(&h, 1);
    let part = PartitionId(1);
    let page = page_in_partition(part, 4);
    h.recovery.log_alloc_part(t1, part).unwrap();
    h.disk.alloc_partition(part).unwrap();
    h.recovery.log_alloc_page(t1, page).unwrap();
    h.disk.alloc_page(page).unwrap();

    write_page(&h, t1, page, 0, &[0], &[9]);
    assert!(h.recovery.dpt_snapshot().iter().any(|(p, _)| *p == page));

    h.recovery.log_free_page(t1, page).unwrap();
    h.disk.free_page(page).unwrap();
    assert!(!h.recovery.dpt_snapshot().iter().any(|(p, _)| *p == page));
}

#[test]
fn test_dirty_page_keeps_minimum_lsn() {
    let file = NamedTempFile::new().unwrap();
    let h = fresh(file.path());
    h.recovery.dirty_page(PageId(9), 10);
    h.recovery.dirty_page(PageId(9), 5);
    h.recovery.dirty_page(PageId(9), 20);
    assert_eq!(h.recovery.dpt_snapshot(), vec![(PageId(9), 5)]);
}

#[test]
fn test_page_flush_hook_enforces_wal() {
    let file = NamedTempFile::new().unwrap();
    let h = fresh(file.path());
    let t1 = begin(&h, 1);
    let p7 = PageId(7);

    let lsn = write_page(&h, t1, p7, 0, &[0x00], &[0x42]);
    assert!(h.recovery.log_manager().flushed_lsn() < lsn);

    // Writing the dirty page out must flush the log through its LSN first.
    h.buffer.flush_page(p7).unwrap();
    assert!(h.recovery.log_manager().flushed_lsn() >= lsn);
}

#[test]
fn test_disk_io_hook_gated_until_redo_completes() {
    let file = NamedTempFile::new().unwrap();
    let h = fresh(file.path());
    let t1 = begin(&h, 1);
    let p7 = PageId(7);
    write_page(&h, t1, p7, 0, &[0x00], &[0x42]);

    // Before any restart has completed redo, the hook must not drop
    // reconstructed state.
    h.recovery.disk_io_hook(p7);
    assert!(h.recovery.dpt_snapshot().iter().any(|(p, _)| *p == p7));
}

#[test]
fn test_checkpoint_rewrites_master_and_splits_when_full() {
    let file = NamedTempFile::new().unwrap();
    let h = fresh(file.path());

    // More dirty pages than one end-checkpoint record can hold.
    for n in 0..300u64 {
        h.recovery.dirty_page(PageId(1000 + n), 50 + n);
    }
    let begin_lsn = h.recovery.log_manager().last_lsn().unwrap() + 1;
    h.recovery.checkpoint().unwrap();

    match h.recovery.log_manager().fetch(NO_LSN).unwrap() {
        LogRecord::Master { last_checkpoint_lsn, .. } => {
            assert_eq!(last_checkpoint_lsn, begin_lsn);
        }
        other => panic!("expected master record, got {other:?}"),
    }

    let mut end_records = 0;
    let mut carried = 0;
    for record in h.recovery.log_manager().scan_from(begin_lsn) {
        if let LogRecord::EndCheckpoint { dirty_pages, transactions, .. } = record {
            assert!(LogRecord::end_checkpoint_fits(dirty_pages.len(), transactions.len()));
            end_records += 1;
            carried += dirty_pages.len();
        }
    }
    assert!(end_records >= 2, "expected the checkpoint to split, got {end_records} record(s)");
    assert_eq!(carried, 300);
}

// Restart ////////////////////////////////////////////////////////////////

#[test]
fn test_restart_after_clean_shutdown_is_a_no_op() {
    let file = NamedTempFile::new().unwrap();
    {
        let h = fresh(file.path());
        let t1 = begin(&h, 1);
        write_page(&h, t1, PageId(7), 0, &[0], &[1]);
        h.recovery.commit(t1).unwrap();
        h.recovery.end(t1).unwrap();
        h.recovery.close().unwrap();
    }
    let h = reopen(file.path());
    h.recovery.restart().unwrap();
    assert!(h.recovery.txn_table_snapshot().is_empty());
}

#[test]
fn test_restart_finishes_interrupted_rollback() {
    let file = NamedTempFile::new().unwrap();
    let p7 = PageId(7);
    let (u1, clr1_lsn) = {
        let h = fresh(file.path());
        let t1 = begin(&h, 1);
        let u1 = write_page(&h, t1, p7, 0, &[0x00], &[0x42]);
        let u2 = write_page(&h, t1, p7, 0, &[0x42], &[0x55]);
        let abort_lsn = h.recovery.abort(t1);

        // One step of the rollback by hand, then crash: the second update is
        // compensated, the first is not.
        let record = h.recovery.log_manager().fetch(u2).unwrap();
        let clr = record.undo(abort_lsn);
        let clr_lsn = h.recovery.log_manager().append(clr);
        h.recovery
            .log_manager()
            .fetch(clr_lsn)
            .unwrap()
            .redo(&h.recovery, h.disk.as_ref(), h.buffer.as_ref())
            .unwrap();
        h.recovery.flush_to_lsn(clr_lsn).unwrap();
        (u1, clr_lsn)
    };

    let h = reopen(file.path());
    h.recovery.restart().unwrap();

    // The remaining CLR and the end record were emitted during undo.
    let clr2 = h.recovery.log_manager().fetch(clr1_lsn + 1).unwrap();
    match &clr2 {
        LogRecord::UndoUpdatePage { prev_lsn, after, undo_next_lsn, .. } => {
            assert_eq!(*prev_lsn, clr1_lsn);
            assert_eq!(after, &vec![0x00]);
            assert_eq!(*undo_next_lsn, NO_LSN);
        }
        other => panic!("expected CLR for the first update, got {other:?}"),
    }
    match h.recovery.log_manager().fetch(clr1_lsn + 2).unwrap() {
        LogRecord::EndTransaction { prev_lsn, .. } => assert_eq!(prev_lsn, clr2.lsn()),
        other => panic!("expected end record, got {other:?}"),
    }
    assert_eq!(page_bytes(&h, p7, 0, 1), vec![0x00]);
    assert!(h.recovery.txn_table_snapshot().is_empty());
    let _ = u1;
}

#[test]
fn test_analysis_reconstructs_checkpoint_state() {
    let file = NamedTempFile::new().unwrap();
    let p1 = PageId(1);
    let (t1, update_lsn, begin_lsn) = {
        let h = fresh(file.path());
        let t1 = begin(&h, 1);
        let update_lsn = write_page(&h, t1, p1, 0, &[0], &[1]);
        let begin_lsn = h.recovery.log_manager().last_lsn().unwrap() + 1;
        h.recovery.checkpoint().unwrap();
        (t1, update_lsn, begin_lsn)
    };

    let h = reopen(file.path());
    match h.recovery.log_manager().fetch(NO_LSN).unwrap() {
        LogRecord::Master { last_checkpoint_lsn, .. } => {
            assert_eq!(last_checkpoint_lsn, begin_lsn);
        }
        other => panic!("expected master record, got {other:?}"),
    }
    h.recovery.restart_analysis().unwrap();

    assert_eq!(h.recovery.dpt_snapshot(), vec![(p1, update_lsn)]);
    // Analysis ends by flipping the still-running transaction to
    // recovery-aborting behind a fresh abort record.
    let table = h.recovery.txn_table_snapshot();
    assert_eq!(table.len(), 1);
    let (id, status, last_lsn) = table[0];
    assert_eq!(id, t1);
    assert_eq!(status, TransactionStatus::RecoveryAborting);
    match h.recovery.log_manager().fetch(last_lsn).unwrap() {
        LogRecord::AbortTransaction { prev_lsn, .. } => assert_eq!(prev_lsn, update_lsn),
        other => panic!("expected abort record, got {other:?}"),
    }
}

#[test]
fn test_analysis_ends_committing_transactions() {
    let file = NamedTempFile::new().unwrap();
    let (t1, commit_lsn) = {
        let h = fresh(file.path());
        let t1 = begin(&h, 1);
        write_page(&h, t1, PageId(3), 0, &[0], &[7]);
        let commit_lsn = h.recovery.commit(t1).unwrap();
        // Crash before end(): the commit record is durable.
        (t1, commit_lsn)
    };

    let h = reopen(file.path());
    h.recovery.restart_analysis().unwrap();

    assert!(h.recovery.txn_table_snapshot().is_empty());
    let end = h
        .recovery
        .log_manager()
        .scan_from(commit_lsn)
        .find(|record| matches!(record, LogRecord::EndTransaction { .. }))
        .expect("analysis should have ended the committed transaction");
    assert_eq!(end.txn_id(), Some(t1));
    assert_eq!(end.prev_lsn(), Some(commit_lsn));
}

#[test]
fn test_redo_is_idempotent() {
    let file = NamedTempFile::new().unwrap();
    let p5 = PageId(5);
    {
        let h = fresh(file.path());
        let t1 = begin(&h, 1);
        write_page(&h, t1, p5, 0, &[0x00, 0x00], &[0xAA, 0xBB]);
        write_page(&h, t1, p5, 2, &[0x00], &[0xCC]);
        h.recovery.commit(t1).unwrap();
        h.recovery.end(t1).unwrap();
        let last = h.recovery.log_manager().last_lsn().unwrap();
        h.recovery.flush_to_lsn(last).unwrap();
    }

    let h = reopen(file.path());
    h.recovery.restart_analysis().unwrap();
    h.recovery.restart_redo().unwrap();
    let once = page_bytes(&h, p5, 0, 3);
    h.recovery.restart_redo().unwrap();
    let twice = page_bytes(&h, p5, 0, 3);

    assert_eq!(once, vec![0xAA, 0xBB, 0xCC]);
    assert_eq!(once, twice);
}

#[test]
fn test_restart_replays_committed_work_and_undoes_the_rest() {
    let file = NamedTempFile::new().unwrap();
    let p1 = PageId(21);
    let p2 = PageId(22);
    {
        let h = fresh(file.path());
        let committed = begin(&h, 1);
        let in_flight = begin(&h, 2);
        write_page(&h, committed, p1, 0, &[0x00], &[0x11]);
        write_page(&h, in_flight, p2, 0, &[0x00], &[0x99]);
        h.recovery.commit(committed).unwrap();
        h.recovery.end(committed).unwrap();
        // The in-flight transaction's update is durable but uncommitted.
        let last = h.recovery.log_manager().last_lsn().unwrap();
        h.recovery.flush_to_lsn(last).unwrap();
    }

    let h = reopen(file.path());
    h.recovery.restart().unwrap();

    assert_eq!(page_bytes(&h, p1, 0, 1), vec![0x11], "committed work survives");
    assert_eq!(page_bytes(&h, p2, 0, 1), vec![0x00], "uncommitted work is undone");
    assert!(h.recovery.txn_table_snapshot().is_empty());

    // Restart ends with a checkpoint: the master record moved past the one
    // written at initialization.
    match h.recovery.log_manager().fetch(NO_LSN).unwrap() {
        LogRecord::Master { last_checkpoint_lsn, .. } => assert!(last_checkpoint_lsn > 1),
        other => panic!("expected master record, got {other:?}"),
    }
}

#[test]
fn test_disk_io_hook_active_after_restart() {
    let file = NamedTempFile::new().unwrap();
    {
        let h = fresh(file.path());
        let t1 = begin(&h, 1);
        write_page(&h, t1, PageId(8), 0, &[0], &[1]);
        let last = h.recovery.log_manager().last_lsn().unwrap();
        h.recovery.flush_to_lsn(last).unwrap();
    }
    let h = reopen(file.path());
    h.recovery.restart().unwrap();

    let t2 = begin(&h, 2);
    write_page(&h, t2, PageId(8), 0, &[1], &[2]);
    assert!(h.recovery.dpt_snapshot().iter().any(|(p, _)| *p == PageId(8)));
    h.buffer.flush_page(PageId(8)).unwrap();
    assert!(!h.recovery.dpt_snapshot().iter().any(|(p, _)| *p == PageId(8)));
}
