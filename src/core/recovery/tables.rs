// src/core/recovery/tables.rs
//
// In-memory indices maintained by the recovery manager: the transaction
// table (one entry per live transaction) and the dirty page table
// (page -> earliest LSN that dirtied it since it was last clean).

use crate::core::common::{Lsn, PageId, NO_LSN};
use crate::core::transaction::TransactionContext;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Per-transaction bookkeeping: the handle itself, the LSN of its most
/// recent log record, named savepoints, and the pages it has written.
pub struct TransactionTableEntry {
    pub transaction: Arc<dyn TransactionContext>,
    pub last_lsn: Lsn,
    savepoints: HashMap<String, Lsn>,
    pub touched_pages: HashSet<PageId>,
}

impl TransactionTableEntry {
    #[must_use]
    pub fn new(transaction: Arc<dyn TransactionContext>) -> Self {
        Self {
            transaction,
            last_lsn: NO_LSN,
            savepoints: HashMap::new(),
            touched_pages: HashSet::new(),
        }
    }

    /// Records the current `last_lsn` under `name`, replacing any previous
    /// savepoint of the same name.
    pub fn set_savepoint(&mut self, name: &str) {
        self.savepoints.insert(name.to_owned(), self.last_lsn);
    }

    #[must_use]
    pub fn savepoint(&self, name: &str) -> Option<Lsn> {
        self.savepoints.get(name).copied()
    }

    pub fn delete_savepoint(&mut self, name: &str) {
        self.savepoints.remove(name);
    }
}

impl std::fmt::Debug for TransactionTableEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionTableEntry")
            .field("txn_id", &self.transaction.txn_id())
            .field("last_lsn", &self.last_lsn)
            .field("savepoints", &self.savepoints)
            .finish()
    }
}

/// The dirty page table. An entry's `rec_lsn` is the earliest LSN that may
/// have dirtied the page since it was last clean, which is exactly where
/// redo must start for that page.
#[derive(Debug, Clone, Default)]
pub struct DirtyPageTable {
    pages: HashMap<PageId, Lsn>,
}

impl DirtyPageTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts only if the page has no entry; an existing `rec_lsn` is
    /// already at least as early.
    pub fn insert_if_absent(&mut self, page_id: PageId, rec_lsn: Lsn) {
        self.pages.entry(page_id).or_insert(rec_lsn);
    }

    /// Inserts, keeping the minimum on a collision. Concurrent loggers can
    /// race their insertions out of LSN order.
    pub fn insert_min(&mut self, page_id: PageId, rec_lsn: Lsn) {
        self.pages
            .entry(page_id)
            .and_modify(|existing| *existing = (*existing).min(rec_lsn))
            .or_insert(rec_lsn);
    }

    /// Unconditional overwrite. Checkpointed `rec_lsn`s are authoritative.
    pub fn overwrite(&mut self, page_id: PageId, rec_lsn: Lsn) {
        self.pages.insert(page_id, rec_lsn);
    }

    pub fn remove(&mut self, page_id: PageId) {
        self.pages.remove(&page_id);
    }

    #[must_use]
    pub fn rec_lsn(&self, page_id: PageId) -> Option<Lsn> {
        self.pages.get(&page_id).copied()
    }

    #[must_use]
    pub fn contains(&self, page_id: PageId) -> bool {
        self.pages.contains_key(&page_id)
    }

    /// Earliest `rec_lsn` across all entries: the redo starting point.
    #[must_use]
    pub fn min_rec_lsn(&self) -> Option<Lsn> {
        self.pages.values().copied().min()
    }

    /// Drops every entry whose page is not in `keep`.
    pub fn retain_pages(&mut self, keep: &HashSet<PageId>) {
        self.pages.retain(|page_id, _| keep.contains(page_id));
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<(PageId, Lsn)> {
        self.pages.iter().map(|(p, l)| (*p, *l)).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}
