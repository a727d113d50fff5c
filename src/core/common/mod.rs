pub mod types;

pub use types::{Lsn, PageId, PartitionId, TransactionId, NO_LSN};
