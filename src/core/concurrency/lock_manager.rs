// src/core/concurrency/lock_manager.rs
use crate::core::common::TransactionId;
use crate::core::concurrency::{LockError, LockType, ResourceName};
use crate::core::transaction::TransactionContext;
use log::debug;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// A granted lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub resource: ResourceName,
    pub lock_type: LockType,
    pub txn_id: TransactionId,
}

/// A request that could not be satisfied when it was made. Requests wait in
/// FIFO order per resource; `releasing` names locks to drop as part of
/// granting the request atomically.
struct LockRequest {
    transaction: Arc<dyn TransactionContext>,
    lock: Lock,
    releasing: Vec<ResourceName>,
}

#[derive(Default)]
struct ResourceEntry {
    granted: Vec<Lock>,
    queue: VecDeque<LockRequest>,
}

#[derive(Default)]
struct LockState {
    resources: HashMap<ResourceName, ResourceEntry>,
    /// Per transaction, held locks in acquisition order. Promotions and
    /// same-name replacements update in place and keep that order.
    transaction_locks: HashMap<TransactionId, Vec<Lock>>,
}

impl LockState {
    fn lock_type(&self, txn_id: TransactionId, resource: &ResourceName) -> LockType {
        self.resources
            .get(resource)
            .and_then(|entry| entry.granted.iter().find(|lock| lock.txn_id == txn_id))
            .map_or(LockType::NL, |lock| lock.lock_type)
    }

    /// Whether `lock_type` is compatible with every granted lock on
    /// `resource`, ignoring locks held by `except` (a transaction replacing
    /// its own lock does not conflict with itself).
    fn check_compatible(
        &self,
        resource: &ResourceName,
        lock_type: LockType,
        except: Option<TransactionId>,
    ) -> bool {
        self.resources.get(resource).map_or(true, |entry| {
            entry.granted.iter().all(|held| {
                Some(held.txn_id) == except || LockType::compatible(held.lock_type, lock_type)
            })
        })
    }

    fn queue_is_empty(&self, resource: &ResourceName) -> bool {
        self.resources.get(resource).map_or(true, |entry| entry.queue.is_empty())
    }

    /// Grants `lock`, or updates the transaction's existing lock on the same
    /// resource in place (preserving its position in both indices).
    fn grant_or_update(&mut self, lock: Lock) {
        let entry = self.resources.entry(lock.resource.clone()).or_default();
        if let Some(held) = entry.granted.iter_mut().find(|held| held.txn_id == lock.txn_id) {
            held.lock_type = lock.lock_type;
            if let Some(mine) = self
                .transaction_locks
                .get_mut(&lock.txn_id)
                .and_then(|locks| locks.iter_mut().find(|l| l.resource == lock.resource))
            {
                mine.lock_type = lock.lock_type;
            }
        } else {
            entry.granted.push(lock.clone());
            self.transaction_locks.entry(lock.txn_id).or_default().push(lock);
        }
    }

    fn remove_lock(&mut self, txn_id: TransactionId, resource: &ResourceName) {
        if let Some(entry) = self.resources.get_mut(resource) {
            entry.granted.retain(|lock| lock.txn_id != txn_id);
        }
        if let Some(locks) = self.transaction_locks.get_mut(&txn_id) {
            locks.retain(|lock| &lock.resource != resource);
            if locks.is_empty() {
                self.transaction_locks.remove(&txn_id);
            }
        }
    }

    fn release_and_process(&mut self, txn_id: TransactionId, resource: &ResourceName) {
        self.remove_lock(txn_id, resource);
        self.process_queue(resource);
    }

    fn enqueue(&mut self, request: LockRequest, front: bool) {
        let entry = self.resources.entry(request.lock.resource.clone()).or_default();
        if front {
            entry.queue.push_front(request);
        } else {
            entry.queue.push_back(request);
        }
    }

    /// Grants queued requests from the front until the head is incompatible
    /// with the granted set. Never skips ahead: a stuck head keeps later
    /// compatible requests waiting, which is what prevents starvation.
    fn process_queue(&mut self, resource: &ResourceName) {
        loop {
            let head = match self.resources.get(resource).and_then(|entry| entry.queue.front()) {
                Some(request) => request.lock.clone(),
                None => break,
            };
            if !self.check_compatible(resource, head.lock_type, Some(head.txn_id)) {
                break;
            }
            let request = self
                .resources
                .get_mut(resource)
                .expect("resource entry vanished while processing its queue")
                .queue
                .pop_front()
                .expect("queue head vanished while processing");
            debug!(
                "granting queued {} lock on {} to transaction {}",
                request.lock.lock_type, request.lock.resource, request.lock.txn_id
            );
            self.grant_or_update(request.lock.clone());
            for released in &request.releasing {
                if released != resource
                    && self.lock_type(request.lock.txn_id, released) != LockType::NL
                {
                    self.release_and_process(request.lock.txn_id, released);
                }
            }
            request.transaction.unblock();
        }
    }
}

/// The lock manager. A single monitor covers every lookup-decide-mutate
/// sequence; the actual park of a blocking transaction happens outside it,
/// after `prepare_block` has been called inside it, so a racing unblock is
/// never lost.
pub struct LockManager {
    state: Mutex<LockState>,
}

impl LockManager {
    #[must_use]
    pub fn new() -> Self {
        Self { state: Mutex::new(LockState::default()) }
    }

    /// Acquires `lock_type` on `resource`. Blocks (queued at the back) if
    /// the lock conflicts with the granted set or anyone is already waiting.
    pub fn acquire(
        &self,
        transaction: &Arc<dyn TransactionContext>,
        resource: &ResourceName,
        lock_type: LockType,
    ) -> Result<(), LockError> {
        let txn_id = transaction.txn_id();
        let should_block;
        {
            let mut state = self.state.lock().unwrap();
            if state.lock_type(txn_id, resource) != LockType::NL {
                return Err(LockError::DuplicateLockRequest {
                    txn: txn_id,
                    resource: resource.clone(),
                });
            }
            should_block = !state.check_compatible(resource, lock_type, None)
                || !state.queue_is_empty(resource);
            let lock = Lock { resource: resource.clone(), lock_type, txn_id };
            if should_block {
                debug!("transaction {txn_id} blocking for {lock_type} on {resource}");
                state.enqueue(
                    LockRequest {
                        transaction: Arc::clone(transaction),
                        lock,
                        releasing: Vec::new(),
                    },
                    false,
                );
                transaction.prepare_block();
            } else {
                state.grant_or_update(lock);
            }
        }
        if should_block {
            transaction.block();
        }
        Ok(())
    }

    /// Atomically acquires `lock_type` on `resource` and releases the locks
    /// named in `release`. Holding a lock on `resource` is an error unless
    /// that lock is itself being replaced; every name in `release` must be
    /// held. A replacement keeps the original acquisition position. If the
    /// new lock conflicts with another transaction's, the request waits at
    /// the front of the queue with its releases bundled.
    pub fn acquire_and_release(
        &self,
        transaction: &Arc<dyn TransactionContext>,
        resource: &ResourceName,
        lock_type: LockType,
        release: &[ResourceName],
    ) -> Result<(), LockError> {
        let txn_id = transaction.txn_id();
        let should_block;
        {
            let mut state = self.state.lock().unwrap();
            if state.lock_type(txn_id, resource) != LockType::NL && !release.contains(resource) {
                return Err(LockError::DuplicateLockRequest {
                    txn: txn_id,
                    resource: resource.clone(),
                });
            }
            for name in release {
                if state.lock_type(txn_id, name) == LockType::NL {
                    return Err(LockError::NoLockHeld { txn: txn_id, resource: name.clone() });
                }
            }
            should_block = !state.check_compatible(resource, lock_type, Some(txn_id));
            let lock = Lock { resource: resource.clone(), lock_type, txn_id };
            if should_block {
                debug!(
                    "transaction {txn_id} blocking at queue front for {lock_type} on {resource}"
                );
                state.enqueue(
                    LockRequest {
                        transaction: Arc::clone(transaction),
                        lock,
                        releasing: release.to_vec(),
                    },
                    true,
                );
                transaction.prepare_block();
            } else {
                state.grant_or_update(lock);
                for name in release {
                    // The lock on `resource` was replaced in place, not
                    // released and re-acquired.
                    if name != resource {
                        state.release_and_process(txn_id, name);
                    }
                }
            }
        }
        if should_block {
            transaction.block();
        }
        Ok(())
    }

    /// Promotes the transaction's lock on `resource` to `new_type`, in
    /// place. Valid only if `new_type` strictly substitutes for the held
    /// type. A conflicting promotion waits at the front of the queue.
    pub fn promote(
        &self,
        transaction: &Arc<dyn TransactionContext>,
        resource: &ResourceName,
        new_type: LockType,
    ) -> Result<(), LockError> {
        let txn_id = transaction.txn_id();
        let should_block;
        {
            let mut state = self.state.lock().unwrap();
            let held = state.lock_type(txn_id, resource);
            if held == new_type {
                return Err(LockError::DuplicateLockRequest {
                    txn: txn_id,
                    resource: resource.clone(),
                });
            }
            if held == LockType::NL {
                return Err(LockError::NoLockHeld { txn: txn_id, resource: resource.clone() });
            }
            if !LockType::substitutable(new_type, held) {
                return Err(LockError::InvalidLock {
                    txn: txn_id,
                    resource: resource.clone(),
                    held,
                    requested: new_type,
                });
            }
            should_block = !state.check_compatible(resource, new_type, Some(txn_id));
            let lock = Lock { resource: resource.clone(), lock_type: new_type, txn_id };
            if should_block {
                debug!("transaction {txn_id} blocking to promote {held} -> {new_type} on {resource}");
                state.enqueue(
                    LockRequest {
                        transaction: Arc::clone(transaction),
                        lock,
                        releasing: Vec::new(),
                    },
                    true,
                );
                transaction.prepare_block();
            } else {
                state.grant_or_update(lock);
            }
        }
        if should_block {
            transaction.block();
        }
        Ok(())
    }

    /// Releases the transaction's lock on `resource` and re-evaluates the
    /// resource's wait queue.
    pub fn release(
        &self,
        transaction: &Arc<dyn TransactionContext>,
        resource: &ResourceName,
    ) -> Result<(), LockError> {
        let txn_id = transaction.txn_id();
        let mut state = self.state.lock().unwrap();
        if state.lock_type(txn_id, resource) == LockType::NL {
            return Err(LockError::NoLockHeld { txn: txn_id, resource: resource.clone() });
        }
        state.release_and_process(txn_id, resource);
        Ok(())
    }

    /// The lock `txn_id` holds on `resource`, or `NL`.
    #[must_use]
    pub fn get_lock_type(&self, txn_id: TransactionId, resource: &ResourceName) -> LockType {
        self.state.lock().unwrap().lock_type(txn_id, resource)
    }

    /// Locks granted on `resource`, in acquisition order.
    #[must_use]
    pub fn get_resource_locks(&self, resource: &ResourceName) -> Vec<Lock> {
        self.state
            .lock()
            .unwrap()
            .resources
            .get(resource)
            .map_or_else(Vec::new, |entry| entry.granted.clone())
    }

    /// Locks held by `txn_id`, in acquisition order.
    #[must_use]
    pub fn get_transaction_locks(&self, txn_id: TransactionId) -> Vec<Lock> {
        self.state
            .lock()
            .unwrap()
            .transaction_locks
            .get(&txn_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}
