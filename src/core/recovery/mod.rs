//! ARIES-style recovery.
//!
//! The recovery manager owns the write-ahead log and the two in-memory
//! indices reconstructed from it: the transaction table and the dirty page
//! table. Forward operations append log records and keep the indices
//! current; restart replays the log in three passes (analysis, redo, undo)
//! and finishes with a fresh checkpoint.
//!
//! The buffer manager and recovery manager reference each other (the WAL
//! hook runs before any dirty page is written out, while redo fetches pages
//! through the buffer). The cycle is broken with two-phase initialization:
//! construct both, then wire them through `set_managers` and the buffer
//! side's weak back-reference.

pub mod tables;

pub use tables::{DirtyPageTable, TransactionTableEntry};

use crate::core::common::{Lsn, PageId, PartitionId, TransactionId, NO_LSN};
use crate::core::storage::disk::{part_num, LOG_PARTITION};
use crate::core::storage::{BufferManager, DiskSpaceManager, StorageError, EFFECTIVE_PAGE_SIZE};
use crate::core::transaction::{TransactionContext, TransactionFactory, TransactionStatus};
use crate::core::wal::{LogManager, LogRecord, WalError};
use log::{debug, info};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error(transparent)]
    Wal(#[from] WalError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// The recovery manager. All methods take `&self`; the indices live behind
/// their own locks because buffer-manager threads call the flush and disk
/// I/O hooks concurrently with forward logging. Commit, end, and checkpoint
/// additionally serialize on one coarse operation lock.
pub struct RecoveryManager {
    log: LogManager,
    new_transaction: TransactionFactory,
    disk: OnceLock<Arc<dyn DiskSpaceManager>>,
    buffer: OnceLock<Arc<dyn BufferManager>>,
    dirty_page_table: Mutex<DirtyPageTable>,
    transaction_table: Mutex<HashMap<TransactionId, TransactionTableEntry>>,
    redo_complete: AtomicBool,
    op_lock: Mutex<()>,
}

impl RecoveryManager {
    #[must_use]
    pub fn new(log: LogManager, new_transaction: TransactionFactory) -> Self {
        Self {
            log,
            new_transaction,
            disk: OnceLock::new(),
            buffer: OnceLock::new(),
            dirty_page_table: Mutex::new(DirtyPageTable::new()),
            transaction_table: Mutex::new(HashMap::new()),
            redo_complete: AtomicBool::new(false),
            op_lock: Mutex::new(()),
        }
    }

    /// Second phase of construction; see the module docs for why this is not
    /// part of `new`.
    pub fn set_managers(&self, disk: Arc<dyn DiskSpaceManager>, buffer: Arc<dyn BufferManager>) {
        let _ = self.disk.set(disk);
        let _ = self.buffer.set(buffer);
    }

    /// Called once, the first time the database is set up: seeds the master
    /// record and takes the initial checkpoint.
    pub fn initialize(&self) -> Result<(), RecoveryError> {
        self.log.append(LogRecord::Master { lsn: NO_LSN, last_checkpoint_lsn: NO_LSN });
        self.checkpoint()
    }

    #[must_use]
    pub fn log_manager(&self) -> &LogManager {
        &self.log
    }

    // Forward processing /////////////////////////////////////////////////

    /// Registers a newly started transaction in the transaction table.
    pub fn start_transaction(&self, transaction: Arc<dyn TransactionContext>) {
        let txn_id = transaction.txn_id();
        self.transaction_table
            .lock()
            .unwrap()
            .insert(txn_id, TransactionTableEntry::new(transaction));
    }

    /// Appends the commit record and flushes the log through it. After this
    /// returns, the commit is durable.
    pub fn commit(&self, txn_id: TransactionId) -> Result<Lsn, RecoveryError> {
        let _guard = self.op_lock.lock().unwrap();
        let prev_lsn = self.with_entry(txn_id, |entry| entry.last_lsn);
        let lsn = self
            .log
            .append(LogRecord::CommitTransaction { lsn: NO_LSN, txn_id, prev_lsn });
        self.log.flush_to(lsn)?;
        self.with_entry_mut(txn_id, |entry| {
            entry.last_lsn = lsn;
            entry.transaction.set_status(TransactionStatus::Committing);
        });
        Ok(lsn)
    }

    /// Appends the abort record and marks the transaction aborting. The
    /// rollback itself happens in `end`.
    pub fn abort(&self, txn_id: TransactionId) -> Lsn {
        let prev_lsn = self.with_entry(txn_id, |entry| entry.last_lsn);
        let lsn = self
            .log
            .append(LogRecord::AbortTransaction { lsn: NO_LSN, txn_id, prev_lsn });
        self.with_entry_mut(txn_id, |entry| {
            entry.last_lsn = lsn;
            entry.transaction.set_status(TransactionStatus::Aborting);
        });
        lsn
    }

    /// Finishes a transaction: rolls back everything if it was aborting,
    /// drops it from the table, and appends the end record. When no rollback
    /// ran, the end record chains to the pre-existing `last_lsn`; when one
    /// did, it chains to the final compensation record.
    pub fn end(&self, txn_id: TransactionId) -> Result<Lsn, RecoveryError> {
        let _guard = self.op_lock.lock().unwrap();
        let (mut prev_lsn, status) =
            self.with_entry(txn_id, |entry| (entry.last_lsn, entry.transaction.status()));
        if status == TransactionStatus::Aborting {
            prev_lsn = self.rollback_to_lsn(txn_id, NO_LSN)?;
        }
        let entry = self
            .transaction_table
            .lock()
            .unwrap()
            .remove(&txn_id)
            .unwrap_or_else(|| panic!("unknown transaction {txn_id}"));
        entry.transaction.set_status(TransactionStatus::Complete);
        let lsn = self
            .log
            .append(LogRecord::EndTransaction { lsn: NO_LSN, txn_id, prev_lsn });
        Ok(lsn)
    }

    /// Undoes a transaction's records with LSN strictly greater than
    /// `target_lsn`, emitting and replaying one CLR per undoable record.
    /// Returns the LSN of the last record appended (or the starting
    /// `last_lsn` if nothing was undoable), which the caller uses as the
    /// prev-LSN of whatever it appends next.
    fn rollback_to_lsn(&self, txn_id: TransactionId, target_lsn: Lsn) -> Result<Lsn, RecoveryError> {
        let last_lsn = self.with_entry(txn_id, |entry| entry.last_lsn);
        let last = self.log.fetch(last_lsn)?;
        // If the last record is a CLR, start from the next record that has
        // not been undone yet.
        let mut current = last.undo_next_lsn().unwrap_or(last_lsn);
        let mut clr_prev = last_lsn;
        let disk = self.disk();
        let buffer = self.buffer();
        while current > target_lsn {
            let record = self.log.fetch(current)?;
            if record.is_undoable() {
                let clr = record.undo(clr_prev);
                clr_prev = self.log.append(clr);
                self.log.fetch(clr_prev)?.redo(self, disk.as_ref(), buffer.as_ref())?;
            }
            match record.undo_next_lsn().or_else(|| record.prev_lsn()) {
                Some(next) => current = next,
                None => break,
            }
        }
        Ok(clr_prev)
    }

    /// Logs a page write. `before` and `after` must be the same length and
    /// at most half the usable page size (larger writes are split by the
    /// caller so that undo and redo images always fit in one record).
    pub fn log_page_write(
        &self,
        txn_id: TransactionId,
        page_id: PageId,
        offset: u16,
        before: &[u8],
        after: &[u8],
    ) -> Lsn {
        assert_eq!(before.len(), after.len(), "before and after images must match in length");
        assert!(
            before.len() <= EFFECTIVE_PAGE_SIZE / 2,
            "page write of {} bytes exceeds half a page",
            before.len()
        );
        let prev_lsn = self.with_entry(txn_id, |entry| entry.last_lsn);
        let lsn = self.log.append(LogRecord::UpdatePage {
            lsn: NO_LSN,
            txn_id,
            prev_lsn,
            page_id,
            offset,
            before: before.to_vec(),
            after: after.to_vec(),
        });
        self.with_entry_mut(txn_id, |entry| {
            entry.last_lsn = lsn;
            entry.touched_pages.insert(page_id);
        });
        self.dirty_page_table.lock().unwrap().insert_if_absent(page_id, lsn);
        lsn
    }

    /// Logs a page allocation and flushes through it: the allocation hits
    /// disk as soon as this returns, so the record must already be durable.
    /// Returns `None` for pages of the log partition, which are not logged.
    pub fn log_alloc_page(
        &self,
        txn_id: TransactionId,
        page_id: PageId,
    ) -> Result<Option<Lsn>, RecoveryError> {
        if part_num(page_id) == LOG_PARTITION {
            return Ok(None);
        }
        let prev_lsn = self.with_entry(txn_id, |entry| entry.last_lsn);
        let lsn = self
            .log
            .append(LogRecord::AllocPage { lsn: NO_LSN, txn_id, prev_lsn, page_id });
        self.with_entry_mut(txn_id, |entry| {
            entry.last_lsn = lsn;
            entry.touched_pages.insert(page_id);
        });
        self.log.flush_to(lsn)?;
        Ok(Some(lsn))
    }

    /// Logs a page free and flushes through it. The page's on-disk state no
    /// longer needs recovery, so it also leaves the dirty page table.
    pub fn log_free_page(
        &self,
        txn_id: TransactionId,
        page_id: PageId,
    ) -> Result<Option<Lsn>, RecoveryError> {
        if part_num(page_id) == LOG_PARTITION {
            return Ok(None);
        }
        let prev_lsn = self.with_entry(txn_id, |entry| entry.last_lsn);
        let lsn = self
            .log
            .append(LogRecord::FreePage { lsn: NO_LSN, txn_id, prev_lsn, page_id });
        self.with_entry_mut(txn_id, |entry| {
            entry.last_lsn = lsn;
            entry.touched_pages.insert(page_id);
        });
        self.dirty_page_table.lock().unwrap().remove(page_id);
        self.log.flush_to(lsn)?;
        Ok(Some(lsn))
    }

    /// Logs a partition allocation and flushes through it. `None` for the
    /// log partition.
    pub fn log_alloc_part(
        &self,
        txn_id: TransactionId,
        part_id: PartitionId,
    ) -> Result<Option<Lsn>, RecoveryError> {
        if part_id == LOG_PARTITION {
            return Ok(None);
        }
        let prev_lsn = self.with_entry(txn_id, |entry| entry.last_lsn);
        let lsn = self
            .log
            .append(LogRecord::AllocPart { lsn: NO_LSN, txn_id, prev_lsn, part_id });
        self.with_entry_mut(txn_id, |entry| entry.last_lsn = lsn);
        self.log.flush_to(lsn)?;
        Ok(Some(lsn))
    }

    /// Logs a partition free and flushes through it. `None` for the log
    /// partition.
    pub fn log_free_part(
        &self,
        txn_id: TransactionId,
        part_id: PartitionId,
    ) -> Result<Option<Lsn>, RecoveryError> {
        if part_id == LOG_PARTITION {
            return Ok(None);
        }
        let prev_lsn = self.with_entry(txn_id, |entry| entry.last_lsn);
        let lsn = self
            .log
            .append(LogRecord::FreePart { lsn: NO_LSN, txn_id, prev_lsn, part_id });
        self.with_entry_mut(txn_id, |entry| entry.last_lsn = lsn);
        self.log.flush_to(lsn)?;
        Ok(Some(lsn))
    }

    /// Records a savepoint at the transaction's current position. A later
    /// savepoint with the same name replaces it.
    pub fn savepoint(&self, txn_id: TransactionId, name: &str) {
        self.with_entry_mut(txn_id, |entry| entry.set_savepoint(name));
    }

    pub fn release_savepoint(&self, txn_id: TransactionId, name: &str) {
        self.with_entry_mut(txn_id, |entry| entry.delete_savepoint(name));
    }

    /// Undoes everything the transaction logged strictly after the
    /// savepoint, in reverse order, with CLRs. Status is unchanged.
    pub fn rollback_to_savepoint(
        &self,
        txn_id: TransactionId,
        name: &str,
    ) -> Result<(), RecoveryError> {
        let savepoint_lsn = self
            .with_entry(txn_id, |entry| entry.savepoint(name))
            .unwrap_or_else(|| panic!("transaction {txn_id} has no savepoint named {name:?}"));
        self.rollback_to_lsn(txn_id, savepoint_lsn)?;
        Ok(())
    }

    /// Takes a fuzzy checkpoint: a begin record, end records carrying the
    /// dirty page table and transaction table in page-sized slices, a flush
    /// through the last end record, and finally the master record rewrite.
    pub fn checkpoint(&self) -> Result<(), RecoveryError> {
        let _guard = self.op_lock.lock().unwrap();
        let begin_lsn = self.log.append(LogRecord::BeginCheckpoint { lsn: NO_LSN });
        debug!("checkpoint started at LSN {begin_lsn}");

        let dpt_entries = self.dirty_page_table.lock().unwrap().snapshot();
        let txn_entries: Vec<(TransactionId, TransactionStatus, Lsn)> = self
            .transaction_table
            .lock()
            .unwrap()
            .iter()
            .map(|(id, entry)| (*id, entry.transaction.status(), entry.last_lsn))
            .collect();

        let mut chkpt_dpt: HashMap<PageId, Lsn> = HashMap::new();
        let mut chkpt_txns: HashMap<TransactionId, (TransactionStatus, Lsn)> = HashMap::new();
        let mut dpt_iter = dpt_entries.into_iter();
        let mut txn_iter = txn_entries.into_iter();
        loop {
            if !LogRecord::end_checkpoint_fits(chkpt_dpt.len() + 1, chkpt_txns.len())
                || !LogRecord::end_checkpoint_fits(chkpt_dpt.len(), chkpt_txns.len() + 1)
            {
                self.log.append(LogRecord::EndCheckpoint {
                    lsn: NO_LSN,
                    dirty_pages: std::mem::take(&mut chkpt_dpt),
                    transactions: std::mem::take(&mut chkpt_txns),
                });
            }
            if let Some((page_id, rec_lsn)) = dpt_iter.next() {
                chkpt_dpt.insert(page_id, rec_lsn);
            } else if let Some((txn_id, status, last_lsn)) = txn_iter.next() {
                chkpt_txns.insert(txn_id, (status, last_lsn));
            } else {
                break;
            }
        }
        let end_lsn = self.log.append(LogRecord::EndCheckpoint {
            lsn: NO_LSN,
            dirty_pages: chkpt_dpt,
            transactions: chkpt_txns,
        });
        self.log.flush_to(end_lsn)?;
        self.log
            .rewrite_master(LogRecord::Master { lsn: NO_LSN, last_checkpoint_lsn: begin_lsn })?;
        Ok(())
    }

    /// Flushes the log through at least `lsn`.
    pub fn flush_to_lsn(&self, lsn: Lsn) -> Result<(), RecoveryError> {
        self.log.flush_to(lsn)?;
        Ok(())
    }

    /// Write-ahead hook, called before a dirty page is written out: the log
    /// must be durable through the page's LSN first.
    pub fn page_flush_hook(&self, page_lsn: Lsn) -> Result<(), RecoveryError> {
        self.log.flush_to(page_lsn)?;
        Ok(())
    }

    /// Called after a page has been written to disk. The page is clean, so
    /// it leaves the dirty page table. Suppressed until redo has finished,
    /// so a concurrent write-out cannot erase table state that analysis and
    /// redo just rebuilt.
    pub fn disk_io_hook(&self, page_id: PageId) {
        if self.redo_complete.load(Ordering::SeqCst) {
            self.dirty_page_table.lock().unwrap().remove(page_id);
        }
    }

    /// Records that `page_id` was dirtied by the record at `lsn`. Keeps the
    /// minimum on a collision; concurrent loggers can race their insertions
    /// out of order.
    pub fn dirty_page(&self, page_id: PageId, lsn: Lsn) {
        self.dirty_page_table.lock().unwrap().insert_min(page_id, lsn);
    }

    /// Unconditional removal, used when replaying a record that frees the
    /// page: disk is authoritative for it afterwards.
    pub(crate) fn remove_dirty_page(&self, page_id: PageId) {
        self.dirty_page_table.lock().unwrap().remove(page_id);
    }

    /// Takes a final checkpoint and closes the log.
    pub fn close(&self) -> Result<(), RecoveryError> {
        self.checkpoint()?;
        self.log.close()?;
        Ok(())
    }

    // Restart recovery ///////////////////////////////////////////////////

    /// Performs restart recovery. No new transactions may start until this
    /// returns.
    pub fn restart(&self) -> Result<(), RecoveryError> {
        self.restart_analysis()?;
        self.restart_redo()?;
        self.redo_complete.store(true, Ordering::SeqCst);
        self.clean_dpt();
        self.restart_undo()?;
        self.checkpoint()
    }

    /// Analysis pass: scan forward from the last completed checkpoint,
    /// rebuilding the transaction table and dirty page table, then close
    /// out committing transactions and flip running ones to aborting.
    pub(crate) fn restart_analysis(&self) -> Result<(), RecoveryError> {
        let master = self.log.fetch(NO_LSN)?;
        let checkpoint_lsn = match master {
            LogRecord::Master { last_checkpoint_lsn, .. } => last_checkpoint_lsn,
            other => panic!("log does not begin with a master record: {other:?}"),
        };
        info!("analysis scanning from LSN {checkpoint_lsn}");
        let mut ended: HashSet<TransactionId> = HashSet::new();

        for record in self.log.scan_from(checkpoint_lsn) {
            if let Some(txn_id) = record.txn_id() {
                self.ensure_recovery_transaction(txn_id);
                self.with_entry_mut(txn_id, |entry| {
                    if entry.last_lsn < record.lsn() {
                        entry.last_lsn = record.lsn();
                    }
                });
            }

            if let Some(page_id) = record.page_id() {
                match record {
                    LogRecord::UpdatePage { .. } | LogRecord::UndoUpdatePage { .. } => {
                        self.dirty_page_table
                            .lock()
                            .unwrap()
                            .insert_if_absent(page_id, record.lsn());
                    }
                    LogRecord::FreePage { .. } | LogRecord::UndoAllocPage { .. } => {
                        self.dirty_page_table.lock().unwrap().remove(page_id);
                    }
                    _ => {}
                }
            }

            match &record {
                LogRecord::CommitTransaction { txn_id, .. } => {
                    self.with_entry(*txn_id, |entry| {
                        entry.transaction.set_status(TransactionStatus::Committing);
                    });
                }
                LogRecord::AbortTransaction { txn_id, .. } => {
                    self.with_entry(*txn_id, |entry| {
                        entry.transaction.set_status(TransactionStatus::RecoveryAborting);
                    });
                }
                LogRecord::EndTransaction { txn_id, .. } => {
                    let entry = self
                        .transaction_table
                        .lock()
                        .unwrap()
                        .remove(txn_id)
                        .unwrap_or_else(|| panic!("unknown transaction {txn_id}"));
                    entry.transaction.cleanup();
                    entry.transaction.set_status(TransactionStatus::Complete);
                    ended.insert(*txn_id);
                }
                LogRecord::EndCheckpoint { dirty_pages, transactions, .. } => {
                    {
                        let mut dpt = self.dirty_page_table.lock().unwrap();
                        for (page_id, rec_lsn) in dirty_pages {
                            dpt.overwrite(*page_id, *rec_lsn);
                        }
                    }
                    for (txn_id, (status, last_lsn)) in transactions {
                        if ended.contains(txn_id) {
                            continue;
                        }
                        self.ensure_recovery_transaction(*txn_id);
                        self.with_entry_mut(*txn_id, |entry| {
                            if entry.last_lsn < *last_lsn {
                                entry.last_lsn = *last_lsn;
                            }
                            if entry.transaction.status() == TransactionStatus::Running {
                                match status {
                                    TransactionStatus::Aborting => entry
                                        .transaction
                                        .set_status(TransactionStatus::RecoveryAborting),
                                    TransactionStatus::Committing => entry
                                        .transaction
                                        .set_status(TransactionStatus::Committing),
                                    _ => {}
                                }
                            }
                        });
                    }
                }
                _ => {}
            }
        }

        self.finish_analysis_transactions();
        Ok(())
    }

    /// After the scan: committing transactions are cleaned up and ended,
    /// running ones get an abort record and become recovery-aborting.
    fn finish_analysis_transactions(&self) {
        let txn_ids: Vec<TransactionId> =
            self.transaction_table.lock().unwrap().keys().copied().collect();
        for txn_id in txn_ids {
            let (status, last_lsn) =
                self.with_entry(txn_id, |entry| (entry.transaction.status(), entry.last_lsn));
            match status {
                TransactionStatus::Committing => {
                    let entry = self
                        .transaction_table
                        .lock()
                        .unwrap()
                        .remove(&txn_id)
                        .expect("entry vanished during analysis");
                    entry.transaction.cleanup();
                    entry.transaction.set_status(TransactionStatus::Complete);
                    self.log.append(LogRecord::EndTransaction {
                        lsn: NO_LSN,
                        txn_id,
                        prev_lsn: last_lsn,
                    });
                }
                TransactionStatus::Running => {
                    let lsn = self.log.append(LogRecord::AbortTransaction {
                        lsn: NO_LSN,
                        txn_id,
                        prev_lsn: last_lsn,
                    });
                    self.with_entry_mut(txn_id, |entry| {
                        entry.transaction.set_status(TransactionStatus::RecoveryAborting);
                        entry.last_lsn = lsn;
                    });
                }
                _ => {}
            }
        }
    }

    /// Redo pass: repeat history from the earliest recLSN in the dirty page
    /// table. Partition records and page allocations are always replayed;
    /// page modifications only when the page is in the table, the record is
    /// at or past its recLSN, and the page itself has not seen the record
    /// yet. The last guard is what makes redo idempotent.
    pub(crate) fn restart_redo(&self) -> Result<(), RecoveryError> {
        let start = self.dirty_page_table.lock().unwrap().min_rec_lsn();
        let Some(start) = start else {
            info!("redo skipped: no dirty pages");
            return Ok(());
        };
        info!("redo scanning from LSN {start}");
        let disk = self.disk();
        let buffer = self.buffer();
        for record in self.log.scan_from(start) {
            if !record.is_redoable() {
                continue;
            }
            match &record {
                LogRecord::AllocPart { .. }
                | LogRecord::UndoAllocPart { .. }
                | LogRecord::FreePart { .. }
                | LogRecord::UndoFreePart { .. }
                | LogRecord::AllocPage { .. }
                | LogRecord::UndoFreePage { .. } => {
                    record.redo(self, disk.as_ref(), buffer.as_ref())?;
                }
                LogRecord::UpdatePage { .. }
                | LogRecord::UndoUpdatePage { .. }
                | LogRecord::FreePage { .. }
                | LogRecord::UndoAllocPage { .. } => {
                    let page_id = record.page_id().expect("page record without a page");
                    let rec_lsn = self.dirty_page_table.lock().unwrap().rec_lsn(page_id);
                    let Some(rec_lsn) = rec_lsn else { continue };
                    if record.lsn() < rec_lsn {
                        continue;
                    }
                    let handle = buffer.fetch_page(page_id)?;
                    let stale = handle.with_page(|page| page.page_lsn() < record.lsn());
                    if stale {
                        record.redo(self, disk.as_ref(), buffer.as_ref())?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Between redo and undo: drop dirty-page entries for pages the buffer
    /// manager no longer considers dirty. Analysis is deliberately
    /// conservative and redo may have proven entries phantom.
    pub(crate) fn clean_dpt(&self) {
        let mut dirty = HashSet::new();
        self.buffer().iter_page_nums(&mut |page_id, is_dirty| {
            if is_dirty {
                dirty.insert(page_id);
            }
        });
        self.dirty_page_table.lock().unwrap().retain_pages(&dirty);
    }

    /// Undo pass: repeatedly take the largest outstanding LSN across all
    /// recovery-aborting transactions, compensate it if needed, and follow
    /// the chain down. A transaction whose chain reaches the bottom is
    /// cleaned up and ended.
    pub(crate) fn restart_undo(&self) -> Result<(), RecoveryError> {
        let mut heap: BinaryHeap<Lsn> = self
            .transaction_table
            .lock()
            .unwrap()
            .values()
            .filter(|entry| {
                entry.transaction.status() == TransactionStatus::RecoveryAborting
            })
            .map(|entry| entry.last_lsn)
            .collect();
        info!("undo processing {} transactions", heap.len());
        let disk = self.disk();
        let buffer = self.buffer();

        while let Some(lsn) = heap.pop() {
            let record = self.log.fetch(lsn)?;
            let txn_id = record.txn_id().expect("undoing a record with no transaction");

            if record.is_undoable() {
                let prev = self.with_entry(txn_id, |entry| entry.last_lsn);
                let clr = record.undo(prev);
                let clr_lsn = self.log.append(clr);
                self.with_entry_mut(txn_id, |entry| entry.last_lsn = clr_lsn);
                self.log.fetch(clr_lsn)?.redo(self, disk.as_ref(), buffer.as_ref())?;
            }

            let next = record
                .undo_next_lsn()
                .or_else(|| record.prev_lsn())
                .expect("transaction record without a previous LSN");
            if next == NO_LSN {
                let entry = self
                    .transaction_table
                    .lock()
                    .unwrap()
                    .remove(&txn_id)
                    .unwrap_or_else(|| panic!("unknown transaction {txn_id}"));
                entry.transaction.cleanup();
                entry.transaction.set_status(TransactionStatus::Complete);
                self.log.append(LogRecord::EndTransaction {
                    lsn: NO_LSN,
                    txn_id,
                    prev_lsn: entry.last_lsn,
                });
            } else {
                heap.push(next);
            }
        }
        Ok(())
    }

    // Observability //////////////////////////////////////////////////////

    #[must_use]
    pub fn dpt_snapshot(&self) -> Vec<(PageId, Lsn)> {
        self.dirty_page_table.lock().unwrap().snapshot()
    }

    /// Pages written by a live transaction, for collaborators that need to
    /// know a transaction's write footprint (e.g. targeted page flushes).
    #[must_use]
    pub fn pages_touched_by(&self, txn_id: TransactionId) -> Vec<PageId> {
        self.with_entry(txn_id, |entry| entry.touched_pages.iter().copied().collect())
    }

    #[must_use]
    pub fn txn_table_snapshot(&self) -> Vec<(TransactionId, TransactionStatus, Lsn)> {
        self.transaction_table
            .lock()
            .unwrap()
            .iter()
            .map(|(id, entry)| (*id, entry.transaction.status(), entry.last_lsn))
            .collect()
    }

    // Helpers ////////////////////////////////////////////////////////////

    fn ensure_recovery_transaction(&self, txn_id: TransactionId) {
        let mut table = self.transaction_table.lock().unwrap();
        table.entry(txn_id).or_insert_with(|| {
            TransactionTableEntry::new((self.new_transaction)(txn_id))
        });
    }

    fn with_entry<R>(
        &self,
        txn_id: TransactionId,
        f: impl FnOnce(&TransactionTableEntry) -> R,
    ) -> R {
        let table = self.transaction_table.lock().unwrap();
        let entry = table
            .get(&txn_id)
            .unwrap_or_else(|| panic!("unknown transaction {txn_id}"));
        f(entry)
    }

    fn with_entry_mut<R>(
        &self,
        txn_id: TransactionId,
        f: impl FnOnce(&mut TransactionTableEntry) -> R,
    ) -> R {
        let mut table = self.transaction_table.lock().unwrap();
        let entry = table
            .get_mut(&txn_id)
            .unwrap_or_else(|| panic!("unknown transaction {txn_id}"));
        f(entry)
    }

    fn disk(&self) -> Arc<dyn DiskSpaceManager> {
        Arc::clone(self.disk.get().expect("set_managers was not called"))
    }

    fn buffer(&self) -> Arc<dyn BufferManager> {
        Arc::clone(self.buffer.get().expect("set_managers was not called"))
    }
}

impl std::fmt::Debug for RecoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryManager")
            .field("dirty_pages", &self.dirty_page_table.lock().unwrap().len())
            .field(
                "live_transactions",
                &self.transaction_table.lock().unwrap().len(),
            )
            .field("redo_complete", &self.redo_complete.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests;
