pub mod common;
pub mod concurrency;
pub mod config;
pub mod recovery;
pub mod storage;
pub mod transaction;
pub mod wal;

pub use self::config::Config;
