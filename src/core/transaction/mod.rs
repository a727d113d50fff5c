// src/core/transaction/mod.rs
pub mod transaction;

pub use transaction::Transaction;

use crate::core::common::TransactionId;
use std::fmt;
use std::sync::Arc;

/// Lifecycle of a transaction as the recovery manager tracks it.
///
/// The only legal transitions are `Running` to one of the three closing
/// states, each closing state to `Complete`, and `Complete` on end-record
/// emission from anywhere. `RecoveryAborting` is entered only during
/// restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TransactionStatus {
    Running,
    Committing,
    Aborting,
    RecoveryAborting,
    Complete,
}

impl TransactionStatus {
    /// Whether moving from `self` to `to` is a legal lifecycle step.
    /// Re-asserting the current status is allowed; analysis replays status
    /// records that a checkpoint snapshot may already have applied.
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        if self == to || to == Self::Complete {
            return true;
        }
        matches!(
            (self, to),
            (Self::Running, Self::Committing)
                | (Self::Running, Self::Aborting)
                | (Self::Running, Self::RecoveryAborting)
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Running => "RUNNING",
            Self::Committing => "COMMITTING",
            Self::Aborting => "ABORTING",
            Self::RecoveryAborting => "RECOVERY_ABORTING",
            Self::Complete => "COMPLETE",
        };
        write!(f, "{name}")
    }
}

/// The transaction handle as the core consumes it: identity, status, and
/// the block/unblock protocol used by the lock manager. `prepare_block` is
/// called inside the lock manager's critical section, `block` outside it;
/// an `unblock` that lands between the two must prevent the park.
pub trait TransactionContext: Send + Sync + fmt::Debug {
    fn txn_id(&self) -> TransactionId;
    fn status(&self) -> TransactionStatus;
    fn set_status(&self, status: TransactionStatus);
    fn cleanup(&self);
    fn prepare_block(&self);
    fn block(&self);
    fn unblock(&self);
}

/// Factory used during restart analysis to materialize handles for
/// transactions found only in the log.
pub type TransactionFactory =
    Box<dyn Fn(TransactionId) -> Arc<dyn TransactionContext> + Send + Sync>;
