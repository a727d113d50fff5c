// src/core/wal/log_record.rs
use crate::core::common::{Lsn, PageId, PartitionId, TransactionId, NO_LSN};
use crate::core::recovery::{RecoveryError, RecoveryManager};
use crate::core::storage::{BufferManager, DiskSpaceManager, StorageError, EFFECTIVE_PAGE_SIZE};
use crate::core::transaction::TransactionStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Encoded size budget for an end-checkpoint record. Entry sizes match the
/// wire encoding: a dirty page entry is a page id plus a recLSN, a
/// transaction entry is an id, a status tag, and a lastLSN.
const END_CHECKPOINT_BASE_SIZE: usize = 32;
const CHECKPOINT_DPT_ENTRY_SIZE: usize = 16;
const CHECKPOINT_TXN_ENTRY_SIZE: usize = 20;

/// One record of the write-ahead log.
///
/// The `lsn` field is stamped by the log manager on append; records are
/// constructed with `NO_LSN` there. Every transaction-owned record chains to
/// the transaction's previous record through `prev_lsn` (`NO_LSN` for the
/// first). Compensation records additionally carry `undo_next_lsn`: the next
/// LSN of the same transaction still in need of undoing.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum LogRecord {
    /// Exactly one, at LSN 0; points at the begin record of the most recent
    /// completed checkpoint.
    Master { lsn: Lsn, last_checkpoint_lsn: Lsn },
    UpdatePage {
        lsn: Lsn,
        txn_id: TransactionId,
        prev_lsn: Lsn,
        page_id: PageId,
        offset: u16,
        before: Vec<u8>,
        after: Vec<u8>,
    },
    UndoUpdatePage {
        lsn: Lsn,
        txn_id: TransactionId,
        prev_lsn: Lsn,
        page_id: PageId,
        offset: u16,
        after: Vec<u8>,
        undo_next_lsn: Lsn,
    },
    AllocPage { lsn: Lsn, txn_id: TransactionId, prev_lsn: Lsn, page_id: PageId },
    UndoAllocPage { lsn: Lsn, txn_id: TransactionId, prev_lsn: Lsn, page_id: PageId, undo_next_lsn: Lsn },
    FreePage { lsn: Lsn, txn_id: TransactionId, prev_lsn: Lsn, page_id: PageId },
    UndoFreePage { lsn: Lsn, txn_id: TransactionId, prev_lsn: Lsn, page_id: PageId, undo_next_lsn: Lsn },
    AllocPart { lsn: Lsn, txn_id: TransactionId, prev_lsn: Lsn, part_id: PartitionId },
    UndoAllocPart { lsn: Lsn, txn_id: TransactionId, prev_lsn: Lsn, part_id: PartitionId, undo_next_lsn: Lsn },
    FreePart { lsn: Lsn, txn_id: TransactionId, prev_lsn: Lsn, part_id: PartitionId },
    UndoFreePart { lsn: Lsn, txn_id: TransactionId, prev_lsn: Lsn, part_id: PartitionId, undo_next_lsn: Lsn },
    CommitTransaction { lsn: Lsn, txn_id: TransactionId, prev_lsn: Lsn },
    AbortTransaction { lsn: Lsn, txn_id: TransactionId, prev_lsn: Lsn },
    EndTransaction { lsn: Lsn, txn_id: TransactionId, prev_lsn: Lsn },
    BeginCheckpoint { lsn: Lsn },
    EndCheckpoint {
        lsn: Lsn,
        dirty_pages: HashMap<PageId, Lsn>,
        transactions: HashMap<TransactionId, (TransactionStatus, Lsn)>,
    },
}

impl LogRecord {
    #[must_use]
    pub fn lsn(&self) -> Lsn {
        match self {
            Self::Master { lsn, .. }
            | Self::UpdatePage { lsn, .. }
            | Self::UndoUpdatePage { lsn, .. }
            | Self::AllocPage { lsn, .. }
            | Self::UndoAllocPage { lsn, .. }
            | Self::FreePage { lsn, .. }
            | Self::UndoFreePage { lsn, .. }
            | Self::AllocPart { lsn, .. }
            | Self::UndoAllocPart { lsn, .. }
            | Self::FreePart { lsn, .. }
            | Self::UndoFreePart { lsn, .. }
            | Self::CommitTransaction { lsn, .. }
            | Self::AbortTransaction { lsn, .. }
            | Self::EndTransaction { lsn, .. }
            | Self::BeginCheckpoint { lsn }
            | Self::EndCheckpoint { lsn, .. } => *lsn,
        }
    }

    pub(crate) fn set_lsn(&mut self, new_lsn: Lsn) {
        match self {
            Self::Master { lsn, .. }
            | Self::UpdatePage { lsn, .. }
            | Self::UndoUpdatePage { lsn, .. }
            | Self::AllocPage { lsn, .. }
            | Self::UndoAllocPage { lsn, .. }
            | Self::FreePage { lsn, .. }
            | Self::UndoFreePage { lsn, .. }
            | Self::AllocPart { lsn, .. }
            | Self::UndoAllocPart { lsn, .. }
            | Self::FreePart { lsn, .. }
            | Self::UndoFreePart { lsn, .. }
            | Self::CommitTransaction { lsn, .. }
            | Self::AbortTransaction { lsn, .. }
            | Self::EndTransaction { lsn, .. }
            | Self::BeginCheckpoint { lsn }
            | Self::EndCheckpoint { lsn, .. } => *lsn = new_lsn,
        }
    }

    #[must_use]
    pub fn txn_id(&self) -> Option<TransactionId> {
        match self {
            Self::UpdatePage { txn_id, .. }
            | Self::UndoUpdatePage { txn_id, .. }
            | Self::AllocPage { txn_id, .. }
            | Self::UndoAllocPage { txn_id, .. }
            | Self::FreePage { txn_id, .. }
            | Self::UndoFreePage { txn_id, .. }
            | Self::AllocPart { txn_id, .. }
            | Self::UndoAllocPart { txn_id, .. }
            | Self::FreePart { txn_id, .. }
            | Self::UndoFreePart { txn_id, .. }
            | Self::CommitTransaction { txn_id, .. }
            | Self::AbortTransaction { txn_id, .. }
            | Self::EndTransaction { txn_id, .. } => Some(*txn_id),
            Self::Master { .. } | Self::BeginCheckpoint { .. } | Self::EndCheckpoint { .. } => None,
        }
    }

    #[must_use]
    pub fn prev_lsn(&self) -> Option<Lsn> {
        match self {
            Self::UpdatePage { prev_lsn, .. }
            | Self::UndoUpdatePage { prev_lsn, .. }
            | Self::AllocPage { prev_lsn, .. }
            | Self::UndoAllocPage { prev_lsn, .. }
            | Self::FreePage { prev_lsn, .. }
            | Self::UndoFreePage { prev_lsn, .. }
            | Self::AllocPart { prev_lsn, .. }
            | Self::UndoAllocPart { prev_lsn, .. }
            | Self::FreePart { prev_lsn, .. }
            | Self::UndoFreePart { prev_lsn, .. }
            | Self::CommitTransaction { prev_lsn, .. }
            | Self::AbortTransaction { prev_lsn, .. }
            | Self::EndTransaction { prev_lsn, .. } => Some(*prev_lsn),
            Self::Master { .. } | Self::BeginCheckpoint { .. } | Self::EndCheckpoint { .. } => None,
        }
    }

    /// For compensation records: the next LSN of the same transaction that
    /// still needs undoing. Lets a restarted rollback skip work that was
    /// already compensated before the crash.
    #[must_use]
    pub fn undo_next_lsn(&self) -> Option<Lsn> {
        match self {
            Self::UndoUpdatePage { undo_next_lsn, .. }
            | Self::UndoAllocPage { undo_next_lsn, .. }
            | Self::UndoFreePage { undo_next_lsn, .. }
            | Self::UndoAllocPart { undo_next_lsn, .. }
            | Self::UndoFreePart { undo_next_lsn, .. } => Some(*undo_next_lsn),
            _ => None,
        }
    }

    #[must_use]
    pub fn page_id(&self) -> Option<PageId> {
        match self {
            Self::UpdatePage { page_id, .. }
            | Self::UndoUpdatePage { page_id, .. }
            | Self::AllocPage { page_id, .. }
            | Self::UndoAllocPage { page_id, .. }
            | Self::FreePage { page_id, .. }
            | Self::UndoFreePage { page_id, .. } => Some(*page_id),
            _ => None,
        }
    }

    #[must_use]
    pub fn partition_id(&self) -> Option<PartitionId> {
        match self {
            Self::AllocPart { part_id, .. }
            | Self::UndoAllocPart { part_id, .. }
            | Self::FreePart { part_id, .. }
            | Self::UndoFreePart { part_id, .. } => Some(*part_id),
            _ => None,
        }
    }

    /// Whether restart redo (or CLR replay) applies this record.
    #[must_use]
    pub fn is_redoable(&self) -> bool {
        matches!(
            self,
            Self::UpdatePage { .. }
                | Self::UndoUpdatePage { .. }
                | Self::AllocPage { .. }
                | Self::UndoAllocPage { .. }
                | Self::FreePage { .. }
                | Self::UndoFreePage { .. }
                | Self::AllocPart { .. }
                | Self::UndoAllocPart { .. }
                | Self::FreePart { .. }
                | Self::UndoFreePart { .. }
        )
    }

    /// Whether rollback can compensate this record. Compensation records
    /// themselves are never undone.
    #[must_use]
    pub fn is_undoable(&self) -> bool {
        matches!(
            self,
            Self::UpdatePage { .. }
                | Self::AllocPage { .. }
                | Self::FreePage { .. }
                | Self::AllocPart { .. }
                | Self::FreePart { .. }
        )
    }

    /// Builds the compensation record for this record. `clr_prev_lsn` becomes
    /// the CLR's `prev_lsn`; the CLR's `undo_next_lsn` is this record's
    /// `prev_lsn`, so the undo chain steps over it. Does not apply the undo;
    /// callers append the CLR and then replay it.
    ///
    /// # Panics
    /// On records that are not undoable; that is a caller bug.
    #[must_use]
    pub fn undo(&self, clr_prev_lsn: Lsn) -> Self {
        match self {
            Self::UpdatePage { txn_id, prev_lsn, page_id, offset, before, .. } => {
                Self::UndoUpdatePage {
                    lsn: NO_LSN,
                    txn_id: *txn_id,
                    prev_lsn: clr_prev_lsn,
                    page_id: *page_id,
                    offset: *offset,
                    after: before.clone(),
                    undo_next_lsn: *prev_lsn,
                }
            }
            Self::AllocPage { txn_id, prev_lsn, page_id, .. } => Self::UndoAllocPage {
                lsn: NO_LSN,
                txn_id: *txn_id,
                prev_lsn: clr_prev_lsn,
                page_id: *page_id,
                undo_next_lsn: *prev_lsn,
            },
            Self::FreePage { txn_id, prev_lsn, page_id, .. } => Self::UndoFreePage {
                lsn: NO_LSN,
                txn_id: *txn_id,
                prev_lsn: clr_prev_lsn,
                page_id: *page_id,
                undo_next_lsn: *prev_lsn,
            },
            Self::AllocPart { txn_id, prev_lsn, part_id, .. } => Self::UndoAllocPart {
                lsn: NO_LSN,
                txn_id: *txn_id,
                prev_lsn: clr_prev_lsn,
                part_id: *part_id,
                undo_next_lsn: *prev_lsn,
            },
            Self::FreePart { txn_id, prev_lsn, part_id, .. } => Self::UndoFreePart {
                lsn: NO_LSN,
                txn_id: *txn_id,
                prev_lsn: clr_prev_lsn,
                part_id: *part_id,
                undo_next_lsn: *prev_lsn,
            },
            other => panic!("undo requested for a record that is not undoable: {other:?}"),
        }
    }

    /// Applies this record's effect to the page store. Page writes stamp the
    /// page LSN with this record's LSN; allocation effects are idempotent so
    /// that replaying history over an already-applied prefix is harmless.
    ///
    /// # Panics
    /// On records that are not redoable; that is a caller bug.
    pub fn redo(
        &self,
        recovery: &RecoveryManager,
        disk: &dyn DiskSpaceManager,
        buffer: &dyn BufferManager,
    ) -> Result<(), RecoveryError> {
        match self {
            Self::UpdatePage { lsn, page_id, offset, after, .. }
            | Self::UndoUpdatePage { lsn, page_id, offset, after, .. } => {
                let handle = buffer.fetch_page(*page_id)?;
                handle.with_page_mut(|page| {
                    page.write(usize::from(*offset), after)?;
                    page.set_page_lsn(*lsn);
                    Ok::<(), StorageError>(())
                })?;
                Ok(())
            }
            Self::AllocPage { page_id, .. } | Self::UndoFreePage { page_id, .. } => {
                match disk.alloc_page(*page_id) {
                    Ok(()) | Err(StorageError::PageAlreadyAllocated(_)) => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            Self::FreePage { page_id, .. } | Self::UndoAllocPage { page_id, .. } => {
                buffer.free_page(*page_id);
                recovery.remove_dirty_page(*page_id);
                match disk.free_page(*page_id) {
                    Ok(()) | Err(StorageError::PageNotAllocated(_)) => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            Self::AllocPart { part_id, .. } | Self::UndoFreePart { part_id, .. } => {
                match disk.alloc_partition(*part_id) {
                    Ok(()) | Err(StorageError::PartitionAlreadyAllocated(_)) => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            Self::FreePart { part_id, .. } | Self::UndoAllocPart { part_id, .. } => {
                match disk.free_partition(*part_id) {
                    Ok(()) | Err(StorageError::PartitionNotAllocated(_)) => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            other => panic!("redo requested for a record that is not redoable: {other:?}"),
        }
    }

    /// Whether an end-checkpoint record with the given entry counts still
    /// fits in one page. The checkpoint writer emits a record and starts a
    /// new one when either kind of entry would overflow this bound.
    #[must_use]
    pub fn end_checkpoint_fits(dpt_entries: usize, txn_entries: usize) -> bool {
        END_CHECKPOINT_BASE_SIZE
            + CHECKPOINT_DPT_ENTRY_SIZE * dpt_entries
            + CHECKPOINT_TXN_ENTRY_SIZE * txn_entries
            <= EFFECTIVE_PAGE_SIZE
    }
}
