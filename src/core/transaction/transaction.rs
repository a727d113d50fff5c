// src/core/transaction/transaction.rs
use crate::core::common::TransactionId;
use crate::core::transaction::{TransactionContext, TransactionStatus};
use std::fmt;
use std::sync::{Condvar, Mutex};

/// Concrete transaction handle.
///
/// Blocking uses a prepared flag under a mutex: `prepare_block` arms it,
/// `block` parks until it is cleared, and `unblock` clears it and wakes the
/// parker. If `unblock` wins the race before the transaction parks, `block`
/// observes the cleared flag and returns immediately.
pub struct Transaction {
    id: TransactionId,
    status: Mutex<TransactionStatus>,
    parked: Mutex<bool>,
    wakeup: Condvar,
}

impl Transaction {
    #[must_use]
    pub fn new(id: TransactionId) -> Self {
        Self {
            id,
            status: Mutex::new(TransactionStatus::Running),
            parked: Mutex::new(false),
            wakeup: Condvar::new(),
        }
    }

    /// Whether the transaction is currently prepared to block or parked.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        *self.parked.lock().unwrap()
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}

impl TransactionContext for Transaction {
    fn txn_id(&self) -> TransactionId {
        self.id
    }

    fn status(&self) -> TransactionStatus {
        *self.status.lock().unwrap()
    }

    fn set_status(&self, status: TransactionStatus) {
        let mut current = self.status.lock().unwrap();
        assert!(
            current.can_transition_to(status),
            "illegal status transition for transaction {}: {} -> {}",
            self.id,
            *current,
            status
        );
        *current = status;
    }

    fn cleanup(&self) {}

    fn prepare_block(&self) {
        *self.parked.lock().unwrap() = true;
    }

    fn block(&self) {
        let mut parked = self.parked.lock().unwrap();
        while *parked {
            parked = self.wakeup.wait(parked).unwrap();
        }
    }

    fn unblock(&self) {
        *self.parked.lock().unwrap() = false;
        self.wakeup.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_status_transitions_enforced() {
        let txn = Transaction::new(TransactionId(1));
        assert_eq!(txn.status(), TransactionStatus::Running);
        txn.set_status(TransactionStatus::Committing);
        txn.set_status(TransactionStatus::Complete);
    }

    #[test]
    #[should_panic(expected = "illegal status transition")]
    fn test_illegal_transition_panics() {
        let txn = Transaction::new(TransactionId(1));
        txn.set_status(TransactionStatus::Committing);
        txn.set_status(TransactionStatus::Aborting);
    }

    #[test]
    fn test_unblock_before_block_skips_park() {
        let txn = Transaction::new(TransactionId(2));
        txn.prepare_block();
        txn.unblock();
        // Must return immediately: the prepared flag was already cleared.
        txn.block();
    }

    #[test]
    fn test_block_until_unblocked() {
        let txn = Arc::new(Transaction::new(TransactionId(3)));
        txn.prepare_block();

        let parker = Arc::clone(&txn);
        let handle = thread::spawn(move || parker.block());

        thread::sleep(Duration::from_millis(30));
        assert!(txn.is_blocked());
        txn.unblock();
        handle.join().unwrap();
        assert!(!txn.is_blocked());
    }
}
