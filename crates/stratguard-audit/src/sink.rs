//! Durable JSON Lines sink and log verification.
//!
//! The sink owns a background thread that appends one line per event. The
//! logger talks to it through a bounded channel and never waits on disk.

use crate::event::{AuditEvent, LogEntry, SinkGap};
use crate::{AuditError, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

enum SinkMessage {
    Entry(Box<LogEntry>),
    Flush(SyncSender<()>),
}

/// Why a hand-off to the sink failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// The channel is at capacity
    Full,
    /// The writer thread has stopped
    Closed,
}

/// Handle to the background writer.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    tx: Option<SyncSender<SinkMessage>>,
    failed: Arc<AtomicBool>,
    writer: Option<JoinHandle<()>>,
}

impl FileSink {
    /// Opens `path` for appending and starts the writer thread.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Io`] if the file or its parent directory cannot
    /// be created, or the thread cannot be spawned.
    pub fn open(path: impl AsRef<Path>, capacity: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| AuditError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| AuditError::Io {
                path: path.clone(),
                source,
            })?;

        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        let failed = Arc::new(AtomicBool::new(false));
        let writer = std::thread::Builder::new()
            .name("stratguard-audit-writer".to_string())
            .spawn({
                let failed = Arc::clone(&failed);
                let path = path.clone();
                move || write_loop(&rx, file, &path, &failed)
            })
            .map_err(|source| AuditError::Io {
                path: path.clone(),
                source,
            })?;

        tracing::debug!(path = %path.display(), capacity, "audit sink opened");
        Ok(Self {
            path,
            tx: Some(tx),
            failed,
            writer: Some(writer),
        })
    }

    /// Log file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the writer hit an I/O error and stopped.
    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Hands an event or gap record to the writer without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`SendFailure`] if the channel is full or the writer stopped.
    pub fn try_send(&self, entry: impl Into<LogEntry>) -> std::result::Result<(), SendFailure> {
        if self.has_failed() {
            return Err(SendFailure::Closed);
        }
        let tx = self.tx.as_ref().ok_or(SendFailure::Closed)?;
        tx.try_send(SinkMessage::Entry(Box::new(entry.into())))
            .map_err(|err| match err {
                TrySendError::Full(_) => SendFailure::Full,
                TrySendError::Disconnected(_) => SendFailure::Closed,
            })
    }

    /// Hands an entry to the writer, waiting for room in the channel.
    ///
    /// # Errors
    ///
    /// Returns [`SendFailure::Closed`] if the writer stopped.
    pub fn send(&self, entry: impl Into<LogEntry>) -> std::result::Result<(), SendFailure> {
        if self.has_failed() {
            return Err(SendFailure::Closed);
        }
        let tx = self.tx.as_ref().ok_or(SendFailure::Closed)?;
        tx.send(SinkMessage::Entry(Box::new(entry.into())))
            .map_err(|_| SendFailure::Closed)
    }

    /// Waits until every event sent so far is on disk, or `timeout` passes.
    ///
    /// Returns `false` on timeout or if the writer stopped.
    pub fn flush(&self, timeout: Duration) -> bool {
        let Some(tx) = self.tx.as_ref() else {
            return false;
        };
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        if tx.send(SinkMessage::Flush(ack_tx)).is_err() {
            return false;
        }
        ack_rx.recv_timeout(timeout).is_ok()
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        // Closing the channel lets the writer drain and exit.
        self.tx.take();
        if let Some(writer) = self.writer.take()
            && writer.join().is_err()
        {
            tracing::warn!(path = %self.path.display(), "audit writer thread panicked");
        }
    }
}

/// Writes each event as it arrives and pushes the buffer to the file
/// whenever the channel runs empty.
fn write_loop(rx: &Receiver<SinkMessage>, file: File, path: &Path, failed: &AtomicBool) {
    let mut out = BufWriter::new(file);
    while let Ok(message) = rx.recv() {
        if !handle_message(&mut out, message, path, failed) {
            return;
        }
        while let Ok(message) = rx.try_recv() {
            if !handle_message(&mut out, message, path, failed) {
                return;
            }
        }
        if let Err(err) = out.flush() {
            tracing::warn!(path = %path.display(), error = %err, "audit sink flush failed");
            failed.store(true, Ordering::Release);
            return;
        }
    }
    if let Err(err) = out.flush() {
        tracing::warn!(path = %path.display(), error = %err, "audit sink final flush failed");
    }
}

/// Returns `false` once the writer must stop.
fn handle_message(
    out: &mut BufWriter<File>,
    message: SinkMessage,
    path: &Path,
    failed: &AtomicBool,
) -> bool {
    match message {
        SinkMessage::Entry(entry) => {
            let written = serde_json::to_string(&entry)
                .map_err(std::io::Error::other)
                .and_then(|line| writeln!(out, "{line}"));
            if let Err(err) = written {
                tracing::warn!(path = %path.display(), error = %err, "audit sink write failed");
                failed.store(true, Ordering::Release);
                return false;
            }
        }
        SinkMessage::Flush(ack) => {
            if let Err(err) = out.flush().and_then(|()| out.get_ref().sync_data()) {
                tracing::warn!(path = %path.display(), error = %err, "audit sink flush failed");
                failed.store(true, Ordering::Release);
                return false;
            }
            let _ = ack.send(());
        }
    }
    true
}

/// Reads a JSON Lines audit log back into events, skipping gap records.
///
/// # Errors
///
/// Same as [`read_entries`].
pub fn read_log(path: impl AsRef<Path>) -> Result<Vec<AuditEvent>> {
    Ok(read_entries(path)?
        .into_iter()
        .filter_map(|entry| match entry {
            LogEntry::Event(event) => Some(event),
            LogEntry::Gap(_) => None,
        })
        .collect())
}

/// Reads every line of a JSON Lines audit log, gap records included. Blank
/// lines are skipped.
///
/// # Errors
///
/// Returns [`AuditError::Io`] if the file cannot be read and
/// [`AuditError::Parse`] naming the first malformed line.
pub fn read_entries(path: impl AsRef<Path>) -> Result<Vec<LogEntry>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| AuditError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut entries = Vec::new();
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| AuditError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let entry = serde_json::from_str(trimmed).map_err(|err| AuditError::Parse {
            line: i + 1,
            message: err.to_string(),
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

/// Outcome of a hash chain check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    /// Every event links to its predecessor and hashes correctly.
    Valid {
        /// Number of events checked
        events: usize,
        /// Events declared missing by gap records
        dropped: u64,
    },
    /// The chain breaks at `seq`.
    Broken {
        /// Sequence number of the first bad event
        seq: u64,
        /// What did not match
        reason: String,
    },
}

impl VerifyResult {
    /// Whether the chain is intact.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }
}

/// Checks the hash chain over a contiguous run of events.
///
/// The first event's `hash_prev` is trusted as the starting point, so a
/// window taken from the middle of a log verifies as long as it is
/// contiguous.
#[must_use]
pub fn verify_chain(events: &[AuditEvent]) -> VerifyResult {
    let mut chain = ChainCheck::default();
    for event in events {
        if let Err(broken) = chain.event(event) {
            return broken;
        }
    }
    chain.finish()
}

/// Checks the hash chain over the lines of an audit file.
///
/// A gap record stands in for the events it declares: it must start right
/// after the previous event and carry its hash, and the next event must
/// link to the gap's last hash. Anything else missing breaks the chain.
#[must_use]
pub fn verify_log(entries: &[LogEntry]) -> VerifyResult {
    let mut chain = ChainCheck::default();
    for entry in entries {
        let checked = match entry {
            LogEntry::Event(event) => chain.event(event),
            LogEntry::Gap(gap) => chain.gap(gap),
        };
        if let Err(broken) = checked {
            return broken;
        }
    }
    chain.finish()
}

#[derive(Default)]
struct ChainCheck<'a> {
    /// Last sequence number covered and the hash the next event links to
    prev: Option<(u64, &'a str)>,
    events: usize,
    dropped: u64,
}

impl<'a> ChainCheck<'a> {
    fn event(&mut self, event: &'a AuditEvent) -> std::result::Result<(), VerifyResult> {
        if let Some((prev_seq, prev_hash)) = self.prev {
            if event.seq != prev_seq + 1 {
                return Err(VerifyResult::Broken {
                    seq: event.seq,
                    reason: format!("sequence gap after {prev_seq}"),
                });
            }
            if event.hash_prev.as_deref() != Some(prev_hash) {
                return Err(VerifyResult::Broken {
                    seq: event.seq,
                    reason: "hash_prev does not match previous hash".to_string(),
                });
            }
        }
        let recomputed = event.compute_hash();
        if !stratguard_core::hash::constant_time_compare(&recomputed, &event.hash) {
            return Err(VerifyResult::Broken {
                seq: event.seq,
                reason: format!("hash mismatch: recorded {}, recomputed {recomputed}", event.hash),
            });
        }
        self.prev = Some((event.seq, event.hash.as_str()));
        self.events += 1;
        Ok(())
    }

    fn gap(&mut self, gap: &'a SinkGap) -> std::result::Result<(), VerifyResult> {
        if gap.dropped_to < gap.dropped_from {
            return Err(VerifyResult::Broken {
                seq: gap.dropped_from,
                reason: format!(
                    "gap record ends before it starts ({}..{})",
                    gap.dropped_from, gap.dropped_to
                ),
            });
        }
        if let Some((prev_seq, prev_hash)) = self.prev {
            if gap.dropped_from != prev_seq + 1 {
                return Err(VerifyResult::Broken {
                    seq: gap.dropped_from,
                    reason: format!("gap record does not follow {prev_seq}"),
                });
            }
            if gap.hash_prev.as_deref() != Some(prev_hash) {
                return Err(VerifyResult::Broken {
                    seq: gap.dropped_from,
                    reason: "gap record does not link to previous hash".to_string(),
                });
            }
        }
        self.prev = Some((gap.dropped_to, gap.last_hash.as_str()));
        self.dropped += gap.dropped();
        Ok(())
    }

    const fn finish(self) -> VerifyResult {
        VerifyResult::Valid {
            events: self.events,
            dropped: self.dropped,
        }
    }
}
