// src/core/wal/log_manager.rs
//
// The log file is a sequence of length-prefixed bincode entries:
// [4-byte length (big-endian)][serialized record]...
// The master record is always the first entry. Its serialized form is
// fixed-size, which is what allows rewriting it in place.

use crate::core::common::{Lsn, NO_LSN};
use crate::core::config::Config;
use crate::core::wal::log_record::LogRecord;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("log codec error: {0}")]
    Codec(String),

    #[error("no log record at LSN {0}")]
    NoSuchRecord(Lsn),

    #[error("log file truncated mid-record")]
    Truncated,
}

/// Append-only log addressed by LSN.
///
/// Records live in memory from the moment they are appended; durability is a
/// separate step. `flush_to` writes the buffered prefix through the given
/// LSN to the file and syncs it, advancing the flushed watermark. Appends
/// assign sequential LSNs starting at 0 (the master record).
#[derive(Debug)]
pub struct LogManager {
    state: Mutex<LogState>,
}

#[derive(Debug)]
struct LogState {
    records: Vec<LogRecord>,
    /// Number of records durable in the file; records[..durable] are on disk.
    durable: usize,
    file: File,
    append_offset: u64,
    sync_on_flush: bool,
}

impl LogManager {
    /// Creates an empty log at `path`, truncating anything already there.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, WalError> {
        Self::create_with(path, true)
    }

    /// Creates an empty log using the configured path and sync policy.
    pub fn with_config(config: &Config) -> Result<Self, WalError> {
        Self::create_with(&config.wal_file_path, config.sync_on_flush)
    }

    fn create_with(path: impl AsRef<Path>, sync_on_flush: bool) -> Result<Self, WalError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        Ok(Self {
            state: Mutex::new(LogState {
                records: Vec::new(),
                durable: 0,
                file,
                append_offset: 0,
                sync_on_flush,
            }),
        })
    }

    /// Opens an existing log and rebuilds the in-memory index from it.
    /// Everything read back is durable by definition.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WalError> {
        let mut file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        let mut records = Vec::new();
        let mut offset = 0u64;
        loop {
            let mut len_bytes = [0u8; 4];
            match file.read_exact(&mut len_bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_be_bytes(len_bytes) as usize;
            let mut payload = vec![0u8; len];
            file.read_exact(&mut payload).map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    WalError::Truncated
                } else {
                    WalError::Io(e)
                }
            })?;
            let record: LogRecord =
                bincode::deserialize(&payload).map_err(|e| WalError::Codec(e.to_string()))?;
            records.push(record);
            offset += 4 + len as u64;
        }
        let durable = records.len();
        log::debug!("opened log with {durable} durable records");
        Ok(Self {
            state: Mutex::new(LogState {
                records,
                durable,
                file,
                append_offset: offset,
                sync_on_flush: true,
            }),
        })
    }

    /// Appends a record, stamping and returning its LSN. The record is not
    /// durable until a flush covers it.
    pub fn append(&self, mut record: LogRecord) -> Lsn {
        let mut state = self.state.lock().unwrap();
        let lsn = state.records.len() as Lsn;
        record.set_lsn(lsn);
        state.records.push(record);
        lsn
    }

    /// Returns a copy of the record at `lsn`.
    pub fn fetch(&self, lsn: Lsn) -> Result<LogRecord, WalError> {
        let state = self.state.lock().unwrap();
        state
            .records
            .get(lsn as usize)
            .cloned()
            .ok_or(WalError::NoSuchRecord(lsn))
    }

    /// Forward-only iterator over records with LSN >= `lsn`, bounded by the
    /// log end at the time of the call.
    pub fn scan_from(&self, lsn: Lsn) -> LogScan {
        let state = self.state.lock().unwrap();
        let tail = match state.records.get(lsn as usize..) {
            Some(tail) => tail.to_vec(),
            None => Vec::new(),
        };
        LogScan { records: tail.into_iter() }
    }

    /// Makes the log durable through at least `lsn` (clamped to the log end).
    pub fn flush_to(&self, lsn: Lsn) -> Result<(), WalError> {
        let mut state = self.state.lock().unwrap();
        if state.records.is_empty() {
            return Ok(());
        }
        let target = (lsn as usize).min(state.records.len() - 1);
        if target < state.durable {
            return Ok(());
        }
        let mut buffer = Vec::new();
        for record in &state.records[state.durable..=target] {
            let payload =
                bincode::serialize(record).map_err(|e| WalError::Codec(e.to_string()))?;
            buffer.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            buffer.extend_from_slice(&payload);
        }
        let offset = state.append_offset;
        state.file.seek(SeekFrom::Start(offset))?;
        state.file.write_all(&buffer)?;
        if state.sync_on_flush {
            state.file.sync_all()?;
        }
        state.append_offset += buffer.len() as u64;
        state.durable = target + 1;
        log::trace!("log flushed through LSN {target}");
        Ok(())
    }

    /// Highest LSN known durable. `NO_LSN` before anything has been flushed.
    pub fn flushed_lsn(&self) -> Lsn {
        let state = self.state.lock().unwrap();
        if state.durable == 0 {
            NO_LSN
        } else {
            (state.durable - 1) as Lsn
        }
    }

    /// Replaces the master record (LSN 0) in memory and, if it has already
    /// been written out, in place in the file. The master's serialized size
    /// never changes, so the in-place rewrite cannot corrupt its neighbor.
    pub fn rewrite_master(&self, record: LogRecord) -> Result<(), WalError> {
        let mut record = record;
        record.set_lsn(NO_LSN);
        assert!(
            matches!(record, LogRecord::Master { .. }),
            "only a master record may be written at LSN 0"
        );
        let mut state = self.state.lock().unwrap();
        assert!(
            matches!(state.records.first(), Some(LogRecord::Master { .. })),
            "log was not initialized with a master record"
        );
        if state.durable > 0 {
            let payload =
                bincode::serialize(&record).map_err(|e| WalError::Codec(e.to_string()))?;
            let mut entry = Vec::with_capacity(4 + payload.len());
            entry.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            entry.extend_from_slice(&payload);
            state.file.seek(SeekFrom::Start(0))?;
            state.file.write_all(&entry)?;
            if state.sync_on_flush {
                state.file.sync_all()?;
            }
        }
        state.records[0] = record;
        Ok(())
    }

    /// Flushes everything appended so far and syncs the file.
    pub fn close(&self) -> Result<(), WalError> {
        let last = {
            let state = self.state.lock().unwrap();
            match state.records.len() {
                0 => return Ok(()),
                n => (n - 1) as Lsn,
            }
        };
        self.flush_to(last)
    }

    /// LSN of the most recently appended record, if any.
    pub fn last_lsn(&self) -> Option<Lsn> {
        let state = self.state.lock().unwrap();
        state.records.len().checked_sub(1).map(|n| n as Lsn)
    }
}

/// Snapshot iterator returned by [`LogManager::scan_from`]. Forward-only and
/// non-restartable.
#[derive(Debug)]
pub struct LogScan {
    records: std::vec::IntoIter<LogRecord>,
}

impl Iterator for LogScan {
    type Item = LogRecord;

    fn next(&mut self) -> Option<LogRecord> {
        self.records.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::common::TransactionId;
    use tempfile::NamedTempFile;

    fn master() -> LogRecord {
        LogRecord::Master { lsn: NO_LSN, last_checkpoint_lsn: NO_LSN }
    }

    fn commit(txn: u64, prev: Lsn) -> LogRecord {
        LogRecord::CommitTransaction { lsn: NO_LSN, txn_id: TransactionId(txn), prev_lsn: prev }
    }

    #[test]
    fn test_append_assigns_sequential_lsns() {
        let file = NamedTempFile::new().unwrap();
        let log = LogManager::create(file.path()).unwrap();
        assert_eq!(log.append(master()), 0);
        assert_eq!(log.append(commit(1, 0)), 1);
        assert_eq!(log.append(commit(2, 0)), 2);
        assert_eq!(log.last_lsn(), Some(2));
        assert_eq!(log.fetch(1).unwrap().txn_id(), Some(TransactionId(1)));
    }

    #[test]
    fn test_flush_advances_watermark() {
        let file = NamedTempFile::new().unwrap();
        let log = LogManager::create(file.path()).unwrap();
        log.append(master());
        let lsn = log.append(commit(1, 0));
        assert_eq!(log.flushed_lsn(), NO_LSN);
        log.flush_to(lsn).unwrap();
        assert_eq!(log.flushed_lsn(), lsn);
        // Flushing an already-durable prefix is a no-op.
        log.flush_to(0).unwrap();
        assert_eq!(log.flushed_lsn(), lsn);
    }

    #[test]
    fn test_open_recovers_flushed_records_only() {
        let file = NamedTempFile::new().unwrap();
        {
            let log = LogManager::create(file.path()).unwrap();
            log.append(master());
            let flushed = log.append(commit(1, 0));
            log.flush_to(flushed).unwrap();
            log.append(commit(2, 0)); // never flushed: lost on crash
        }
        let reopened = LogManager::open(file.path()).unwrap();
        assert_eq!(reopened.last_lsn(), Some(1));
        assert_eq!(reopened.flushed_lsn(), 1);
        assert!(matches!(reopened.fetch(2), Err(WalError::NoSuchRecord(2))));
    }

    #[test]
    fn test_rewrite_master_survives_reopen() {
        let file = NamedTempFile::new().unwrap();
        {
            let log = LogManager::create(file.path()).unwrap();
            log.append(master());
            let lsn = log.append(commit(1, 0));
            log.flush_to(lsn).unwrap();
            log.rewrite_master(LogRecord::Master { lsn: NO_LSN, last_checkpoint_lsn: 1 })
                .unwrap();
        }
        let reopened = LogManager::open(file.path()).unwrap();
        match reopened.fetch(0).unwrap() {
            LogRecord::Master { last_checkpoint_lsn, .. } => assert_eq!(last_checkpoint_lsn, 1),
            other => panic!("expected master record, got {other:?}"),
        }
        // The neighbor entry must be intact after the in-place rewrite.
        assert_eq!(reopened.fetch(1).unwrap().txn_id(), Some(TransactionId(1)));
    }

    #[test]
    fn test_with_config_uses_configured_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.wal");
        let config = Config {
            wal_file_path: path.to_string_lossy().into_owned(),
            sync_on_flush: false,
        };
        let log = LogManager::with_config(&config).unwrap();
        log.append(master());
        log.flush_to(0).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_scan_from_is_bounded_snapshot() {
        let file = NamedTempFile::new().unwrap();
        let log = LogManager::create(file.path()).unwrap();
        log.append(master());
        log.append(commit(1, 0));
        log.append(commit(2, 0));
        let mut scan = log.scan_from(1);
        log.append(commit(3, 0)); // not visible to the open scan
        assert_eq!(scan.next().unwrap().lsn(), 1);
        assert_eq!(scan.next().unwrap().lsn(), 2);
        assert!(scan.next().is_none());
        assert!(log.scan_from(100).next().is_none());
    }
}
