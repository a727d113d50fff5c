// src/lib.rs
pub mod core;

// Re-export the two subsystem entry points for library consumers.
pub use crate::core::concurrency::{LockError, LockManager, LockType, ResourceName};
pub use crate::core::recovery::RecoveryManager;
