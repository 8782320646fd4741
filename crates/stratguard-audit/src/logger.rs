//! The append-only audit logger.

use crate::event::{AuditEvent, AuditFilter, SinkGap};
use crate::sink::{FileSink, SendFailure, VerifyResult, verify_chain};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Default ring buffer capacity.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct Chain {
    ring: VecDeque<AuditEvent>,
    next_seq: u64,
    last_hash: Option<String>,
}

/// The file sink and the run of events it has not taken yet.
#[derive(Debug)]
struct ActiveSink {
    file: FileSink,
    gap: Option<SinkGap>,
}

impl ActiveSink {
    const fn new(file: FileSink) -> Self {
        Self { file, gap: None }
    }

    /// Sends any pending gap record, then the event. An event that cannot be
    /// sent joins the gap.
    fn deliver(&mut self, event: &AuditEvent) -> std::result::Result<(), SendFailure> {
        if let Some(gap) = &self.gap {
            if let Err(failure) = self.file.try_send(gap.clone()) {
                self.note_dropped(event);
                return Err(failure);
            }
            self.gap = None;
        }
        let sent = self.file.try_send(event.clone());
        if sent.is_err() {
            self.note_dropped(event);
        }
        sent
    }

    fn note_dropped(&mut self, event: &AuditEvent) {
        match &mut self.gap {
            Some(gap) => gap.extend(event),
            None => self.gap = Some(SinkGap::starting_at(event)),
        }
    }

    fn flush(&mut self, timeout: Duration) -> bool {
        if let Some(gap) = self.gap.take()
            && self.file.send(gap).is_err()
        {
            return false;
        }
        self.file.flush(timeout)
    }
}

impl Drop for ActiveSink {
    fn drop(&mut self) {
        if let Some(gap) = self.gap.take() {
            let _ = self.file.send(gap);
        }
    }
}

#[derive(Debug)]
struct Inner {
    chain: Mutex<Chain>,
    capacity: usize,
    sink: Mutex<Option<ActiveSink>>,
    degraded: AtomicBool,
    lagging: AtomicBool,
    dropped: AtomicU64,
}

/// Append-only audit log with an in-memory ring buffer and an optional
/// durable JSON Lines sink.
///
/// Recording never blocks on I/O and never fails. An event that finds the
/// channel full is counted in [`dropped`](Self::dropped) and later events
/// still go to the file, preceded by a [`SinkGap`] record declaring what
/// is missing so the file still verifies with
/// [`verify_log`](crate::verify_log). If the sink cannot be opened or its writer stops,
/// the logger keeps only the ring buffer and reports
/// [`is_degraded`](Self::is_degraded).
///
/// Cloning is cheap and clones share the same log.
///
/// # Examples
///
/// ```
/// use stratguard_audit::{AuditEvent, AuditEventType, AuditFilter, AuditLogger};
///
/// let logger = AuditLogger::in_memory(16);
/// logger.record(AuditEvent::new(AuditEventType::LoadAttempt, "s-1", "received"));
/// logger.record(AuditEvent::new(AuditEventType::LoadSuccess, "s-1", "compiled"));
///
/// let successes: Vec<_> = logger
///     .query(&AuditFilter::new().event_type(AuditEventType::LoadSuccess))
///     .collect();
/// assert_eq!(successes.len(), 1);
/// assert!(logger.verify().is_valid());
/// ```
#[derive(Debug, Clone)]
pub struct AuditLogger {
    inner: Arc<Inner>,
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::in_memory(DEFAULT_BUFFER_CAPACITY)
    }
}

impl AuditLogger {
    /// Ring-buffer-only logger.
    #[must_use]
    pub fn in_memory(capacity: usize) -> Self {
        Self::build(capacity, None, false)
    }

    /// Logger backed by a JSON Lines file.
    ///
    /// Falls back to ring-buffer-only mode with a warning if the file
    /// cannot be opened.
    #[must_use]
    pub fn with_file(path: impl AsRef<Path>, capacity: usize) -> Self {
        let path = path.as_ref();
        match FileSink::open(path, capacity) {
            Ok(sink) => Self::build(capacity, Some(sink), false),
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "audit sink unavailable, keeping events in memory only"
                );
                Self::build(capacity, None, true)
            }
        }
    }

    fn build(capacity: usize, sink: Option<FileSink>, degraded: bool) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Inner {
                chain: Mutex::new(Chain {
                    ring: VecDeque::with_capacity(capacity.min(DEFAULT_BUFFER_CAPACITY)),
                    next_seq: 0,
                    last_hash: None,
                }),
                capacity,
                sink: Mutex::new(sink.map(ActiveSink::new)),
                degraded: AtomicBool::new(degraded),
                lagging: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Appends one event and returns it as stamped.
    pub fn record(&self, mut event: AuditEvent) -> AuditEvent {
        let mut chain = lock(&self.inner.chain);
        event.seq = chain.next_seq;
        event.hash_prev = chain.last_hash.take();
        event.hash = event.compute_hash();
        chain.next_seq += 1;
        chain.last_hash = Some(event.hash.clone());

        if chain.ring.len() == self.inner.capacity {
            chain.ring.pop_front();
        }
        chain.ring.push_back(event.clone());

        // Sent while the chain lock is held so the file keeps sequence order.
        self.forward(&event);
        drop(chain);

        tracing::debug!(
            seq = event.seq,
            event_type = %event.event_type,
            subject = %event.subject_id,
            outcome = %event.outcome,
            "audit event recorded"
        );
        event
    }

    fn forward(&self, event: &AuditEvent) {
        if self.inner.degraded.load(Ordering::Acquire) {
            return;
        }
        let mut sink = lock(&self.inner.sink);
        let Some(active) = sink.as_mut() else {
            return;
        };
        match active.deliver(event) {
            Ok(()) => {
                if self.inner.lagging.swap(false, Ordering::AcqRel) {
                    tracing::info!(
                        path = %active.file.path().display(),
                        dropped = self.dropped(),
                        "audit sink caught up"
                    );
                }
            }
            // Back-pressure: this event misses the file, later ones retry.
            Err(SendFailure::Full) => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                if !self.inner.lagging.swap(true, Ordering::AcqRel) {
                    tracing::warn!(
                        path = %active.file.path().display(),
                        seq = event.seq,
                        "audit sink is not keeping up, dropping events from the file"
                    );
                }
            }
            Err(SendFailure::Closed) => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                if !self.inner.degraded.swap(true, Ordering::AcqRel) {
                    tracing::warn!(
                        path = %active.file.path().display(),
                        "audit sink stopped, logging degraded to ring buffer only"
                    );
                }
            }
        }
    }

    /// Events in the ring buffer matching `filter`, oldest first.
    pub fn query(&self, filter: &AuditFilter) -> impl Iterator<Item = AuditEvent> + use<> {
        let chain = lock(&self.inner.chain);
        let matched: Vec<AuditEvent> = chain
            .ring
            .iter()
            .filter(|e| filter.matches(e))
            .take(filter.max_results().unwrap_or(usize::MAX))
            .cloned()
            .collect();
        matched.into_iter()
    }

    /// Snapshot of the ring buffer.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        lock(&self.inner.chain).ring.iter().cloned().collect()
    }

    /// Number of events recorded since creation.
    #[must_use]
    pub fn recorded(&self) -> u64 {
        lock(&self.inner.chain).next_seq
    }

    /// Events that reached neither the channel nor the file. Each one is
    /// covered by a gap record in the file.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Whether the durable sink is unavailable for good.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.inner.degraded.load(Ordering::Acquire)
    }

    /// Checks the hash chain over the ring buffer.
    #[must_use]
    pub fn verify(&self) -> VerifyResult {
        let events = self.events();
        verify_chain(&events)
    }

    /// Waits for the writer to persist everything recorded so far.
    ///
    /// Returns `false` when degraded or when the writer does not confirm in
    /// time. A memory-only logger has nothing to flush and returns `true`.
    pub fn flush(&self) -> bool {
        if self.is_degraded() {
            return false;
        }
        let mut sink = lock(&self.inner.sink);
        sink.as_mut()
            .is_none_or(|active| active.flush(FLUSH_TIMEOUT))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AuditEventType, LogEntry};
    use crate::sink::{read_entries, read_log, verify_log};
    use tempfile::TempDir;

    fn attempt(subject: &str) -> AuditEvent {
        AuditEvent::new(AuditEventType::LoadAttempt, subject, "received")
    }

    #[test]
    fn test_sequence_and_chain_links() {
        let logger = AuditLogger::in_memory(8);
        let first = logger.record(attempt("a"));
        let second = logger.record(attempt("b"));
        assert_eq!(first.seq, 0);
        assert_eq!(second.seq, 1);
        assert!(first.hash_prev.is_none());
        assert_eq!(second.hash_prev.as_deref(), Some(first.hash.as_str()));
        assert!(logger.verify().is_valid());
    }

    #[test]
    fn test_ring_buffer_keeps_latest() {
        let logger = AuditLogger::in_memory(3);
        for i in 0..5 {
            logger.record(attempt(&format!("s{i}")));
        }
        let events = logger.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].subject_id, "s2");
        assert_eq!(logger.recorded(), 5);
        assert!(logger.verify().is_valid());
    }

    #[test]
    fn test_file_logger_persists_chain() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");
        let logger = AuditLogger::with_file(&path, 16);
        for i in 0..4 {
            logger.record(attempt(&format!("s{i}")));
        }
        assert!(logger.flush());
        assert!(!logger.is_degraded());

        let on_disk = read_log(&path).unwrap();
        assert_eq!(on_disk, logger.events());
        assert!(verify_chain(&on_disk).is_valid());
    }

    #[test]
    fn test_unavailable_sink_degrades_without_failing() {
        let dir = TempDir::new().unwrap();
        // A directory cannot be opened as the log file.
        let logger = AuditLogger::with_file(dir.path(), 16);
        assert!(logger.is_degraded());
        logger.record(attempt("s"));
        assert_eq!(logger.events().len(), 1);
        assert!(!logger.flush());
    }

    #[test]
    fn test_burst_drops_but_sink_recovers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");
        let logger = AuditLogger::with_file(&path, 4);
        for i in 0..200 {
            logger.record(attempt(&format!("burst{i}")));
        }
        assert!(logger.flush());
        assert!(!logger.is_degraded());

        for i in 0..10 {
            logger.record(attempt(&format!("later{i}")));
            assert!(logger.flush());
        }
        let on_disk = read_log(&path).unwrap();
        let later: Vec<u64> = on_disk
            .iter()
            .filter(|e| e.subject_id.starts_with("later"))
            .map(|e| e.seq)
            .collect();
        assert_eq!(later, (200..210).collect::<Vec<u64>>());
        assert_eq!(logger.recorded(), 210);
        assert_eq!(on_disk.len() as u64 + logger.dropped(), 210);
    }

    #[test]
    fn test_dropped_events_are_declared_in_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");
        let logger = AuditLogger::with_file(&path, 4);
        for i in 0..200 {
            logger.record(attempt(&format!("burst{i}")));
        }
        assert!(logger.flush());

        let entries = read_entries(&path).unwrap();
        let gaps: u64 = entries
            .iter()
            .filter_map(|entry| match entry {
                LogEntry::Gap(gap) => Some(gap.dropped()),
                LogEntry::Event(_) => None,
            })
            .sum();
        assert_eq!(gaps, logger.dropped());
        match verify_log(&entries) {
            VerifyResult::Valid { events, dropped } => {
                assert_eq!(dropped, logger.dropped());
                assert_eq!(events as u64 + dropped, 200);
            }
            VerifyResult::Broken { seq, reason } => panic!("broken at {seq}: {reason}"),
        }
    }

    #[test]
    fn test_pending_gap_written_when_logger_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");
        let dropped = {
            let logger = AuditLogger::with_file(&path, 1);
            for i in 0..50 {
                logger.record(attempt(&format!("s{i}")));
            }
            logger.dropped()
        };
        let entries = read_entries(&path).unwrap();
        match verify_log(&entries) {
            VerifyResult::Valid { events, dropped: declared } => {
                assert_eq!(declared, dropped);
                assert_eq!(events as u64 + declared, 50);
            }
            VerifyResult::Broken { seq, reason } => panic!("broken at {seq}: {reason}"),
        }
    }

    #[test]
    fn test_writer_persists_without_explicit_flush() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");
        let logger = AuditLogger::with_file(&path, 16);
        logger.record(attempt("unflushed"));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let text = std::fs::read_to_string(&path).unwrap();
            if text.contains("unflushed") {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "event never reached the file");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_tampering_detected_in_memory() {
        let logger = AuditLogger::in_memory(8);
        for i in 0..3 {
            logger.record(attempt(&format!("s{i}")));
        }
        let mut events = logger.events();
        events[1].outcome = "forged".to_string();
        match verify_chain(&events) {
            VerifyResult::Broken { seq, reason } => {
                assert_eq!(seq, 1);
                assert!(reason.contains("hash mismatch"));
            }
            VerifyResult::Valid { .. } => panic!("tampering not detected"),
        }

        let mut events = logger.events();
        events.remove(1);
        assert!(!verify_chain(&events).is_valid());
    }

    #[test]
    fn test_clones_share_log() {
        let logger = AuditLogger::default();
        let other = logger.clone();
        other.record(attempt("shared"));
        assert_eq!(logger.events().len(), 1);
    }
}
