//! Append-Only File
//!
//! Every mutation a node accepts is appended to a log so a restarted
//! process can rebuild its in-memory state. Records are framed as a
//! 4-byte big-endian length followed by a JSON body, written strictly
//! sequentially behind one mutex, so the file order is a total order
//! over the node's mutations.
//!
//! Durability is governed by [`FsyncPolicy`]: `Always` syncs inside
//! every write, `EverySec` leaves syncing to a background flusher with
//! a loss window of at most one second, `No` defers to the OS.
//!
//! A crash can leave a torn record at the tail. Replay detects the
//! short frame and stops there, keeping everything before it.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Upper bound on a single record body. Anything larger is corruption.
const MAX_RECORD_BYTES: u32 = 64 * 1024 * 1024;

/// One logged mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Record {
    Set { key: String, value: String },
    Del { key: String },
}

impl Record {
    pub fn key(&self) -> &str {
        match self {
            Record::Set { key, .. } | Record::Del { key } => key,
        }
    }
}

/// When appended records reach the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// fsync inside every write. A returned write is durable.
    Always,
    /// fsync from a background task once per second.
    EverySec,
    /// Never fsync explicitly; the OS flushes when it pleases.
    No,
}

impl std::str::FromStr for FsyncPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" => Ok(Self::Always),
            "everysec" => Ok(Self::EverySec),
            "no" => Ok(Self::No),
            other => Err(format!("unknown fsync policy {other:?}")),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AofError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(serde_json::Error),

    #[error("corrupt record at byte {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },
}

/// Appends mutation records to the log file.
///
/// One mutex serializes encode + append + fsync, which is what makes
/// the file order a total order across shards.
pub struct AofWriter {
    path: PathBuf,
    file: Mutex<File>,
    policy: FsyncPolicy,
}

impl AofWriter {
    /// Opens (creating if needed) the log at `path` for appending.
    pub fn open(path: impl AsRef<Path>, policy: FsyncPolicy) -> Result<Self, AofError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            file: Mutex::new(file),
            policy,
        })
    }

    pub fn policy(&self) -> FsyncPolicy {
        self.policy
    }

    /// Encodes and appends one record, fsyncing per policy.
    pub fn write(&self, record: &Record) -> Result<(), AofError> {
        let body = serde_json::to_vec(record).map_err(AofError::Encode)?;
        let len = (body.len() as u32).to_be_bytes();

        let mut file = self.file.lock().unwrap();
        file.write_all(&len)?;
        file.write_all(&body)?;

        if self.policy == FsyncPolicy::Always {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Forces buffered records to disk. The EverySec flusher calls
    /// this once per second; shutdown calls it a last time.
    pub fn sync(&self) -> Result<(), AofError> {
        let file = self.file.lock().unwrap();
        file.sync_data()?;
        Ok(())
    }

    /// Reads every complete record from the start of the log.
    ///
    /// A partial frame at EOF is a torn write from a crash: replay
    /// logs it and keeps everything before it. A full frame that does
    /// not decode is real corruption and fails the load.
    pub fn read_all(&self) -> Result<Vec<Record>, AofError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut offset = 0u64;

        loop {
            let mut len_buf = [0u8; 4];
            match read_exact_or_eof(&mut reader, &mut len_buf) {
                ReadOutcome::Full => {}
                ReadOutcome::Eof => break,
                ReadOutcome::Partial => {
                    warn!(offset, "torn record header at AOF tail, discarding");
                    break;
                }
                ReadOutcome::Err(e) => return Err(e.into()),
            }

            let len = u32::from_be_bytes(len_buf);
            if len > MAX_RECORD_BYTES {
                return Err(AofError::Corrupt {
                    offset,
                    reason: format!("record length {len} exceeds limit"),
                });
            }

            let mut body = vec![0u8; len as usize];
            match read_exact_or_eof(&mut reader, &mut body) {
                ReadOutcome::Full => {}
                ReadOutcome::Eof | ReadOutcome::Partial => {
                    warn!(offset, "torn record body at AOF tail, discarding");
                    break;
                }
                ReadOutcome::Err(e) => return Err(e.into()),
            }

            let record =
                serde_json::from_slice(&body).map_err(|e| AofError::Corrupt {
                    offset,
                    reason: e.to_string(),
                })?;
            records.push(record);
            offset += 4 + u64::from(len);
        }

        debug!(count = records.len(), path = %self.path.display(), "AOF loaded");
        Ok(records)
    }
}

enum ReadOutcome {
    Full,
    Eof,
    Partial,
    Err(std::io::Error),
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> ReadOutcome {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return ReadOutcome::Eof,
            Ok(0) => return ReadOutcome::Partial,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return ReadOutcome::Err(e),
        }
    }
    ReadOutcome::Full
}

/// Background flusher for the `EverySec` policy.
///
/// Same shape as the storage sweeper: a task on a fixed interval with
/// a watch-channel shutdown, stopped when the handle drops.
#[derive(Debug)]
pub struct AofFlusher {
    shutdown_tx: watch::Sender<bool>,
}

impl AofFlusher {
    pub fn start(writer: Arc<AofWriter>) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            return;
                        }
                    }
                }
                if let Err(e) = writer.sync() {
                    warn!(error = %e, "periodic AOF fsync failed");
                }
            }
        });

        Self { shutdown_tx }
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for AofFlusher {
    fn drop(&mut self) {
        self.stop();
    }
}
