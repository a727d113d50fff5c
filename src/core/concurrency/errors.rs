// src/core/concurrency/errors.rs
//! Lock manager errors. All checks happen before any bookkeeping changes,
//! so a failed operation leaves the manager untouched.

use crate::core::common::TransactionId;
use crate::core::concurrency::{LockType, ResourceName};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("transaction {txn} already holds a lock on {resource}")]
    DuplicateLockRequest { txn: TransactionId, resource: ResourceName },

    #[error("transaction {txn} holds no lock on {resource}")]
    NoLockHeld { txn: TransactionId, resource: ResourceName },

    #[error("transaction {txn} cannot replace its {held} lock on {resource} with {requested}")]
    InvalidLock {
        txn: TransactionId,
        resource: ResourceName,
        held: LockType,
        requested: LockType,
    },
}
