//! Audit trail for strategy loading and execution.
//!
//! Every load and execution step is recorded as an [`AuditEvent`]. Events
//! are kept in a bounded in-memory ring buffer for [`AuditLogger::query`]
//! and streamed to a JSON Lines file by a background writer. Each event
//! carries the hash of its predecessor, so edits and deletions in a log file
//! are detectable with [`verify_log`]. Events the writer had to drop under
//! load are declared by a [`SinkGap`] line rather than silently missing.
//!
//! # Examples
//!
//! ```no_run
//! use stratguard_audit::{AuditEvent, AuditEventType, AuditLogger, read_entries, verify_log};
//!
//! let logger = AuditLogger::with_file("/var/log/stratguard/audit.jsonl", 1024);
//! logger.record(AuditEvent::new(AuditEventType::LoadAttempt, "strategy-7", "received"));
//! logger.flush();
//!
//! let entries = read_entries("/var/log/stratguard/audit.jsonl").unwrap();
//! assert!(verify_log(&entries).is_valid());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs, missing_debug_implementations)]

mod event;
mod logger;
mod sink;

pub use event::{AuditEvent, AuditEventType, AuditFilter, LogEntry, SinkGap};
pub use logger::{AuditLogger, DEFAULT_BUFFER_CAPACITY};
pub use sink::{
    FileSink, SendFailure, VerifyResult, read_entries, read_log, verify_chain, verify_log,
};

use std::path::PathBuf;

/// Errors from reading or writing audit files.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// Filesystem failure
    #[error("audit log I/O error at {}: {source}", path.display())]
    Io {
        /// File or directory involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// A log line is not a valid event
    #[error("malformed audit record at line {line}: {message}")]
    Parse {
        /// 1-based line number
        line: usize,
        /// Parser message
        message: String,
    },
}

/// Result alias for audit file operations.
pub type Result<T> = std::result::Result<T, AuditError>;
