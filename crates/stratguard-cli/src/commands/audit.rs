//! `stratguard audit`: query and verify an audit log file.

use crate::formatters::format_output;
use crate::{ExitCode, OutputFormat};
use anyhow::{Context, Result, anyhow};
use chrono::SecondsFormat;
use colored::Colorize;
use serde::Serialize;
use std::path::Path;
use stratguard_audit::{
    AuditEvent, AuditEventType, AuditFilter, LogEntry, VerifyResult, read_entries, verify_log,
};
use tracing::info;

/// Query options.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    /// Event type name, e.g. `security_violation`
    pub event_type: Option<String>,
    /// Strategy or execution id
    pub subject: Option<String>,
    /// Outcome label
    pub outcome: Option<String>,
    /// Most recent N matches
    pub limit: Option<usize>,
    /// Check the hash chain over the whole file
    pub verify: bool,
}

/// Hash chain verdict.
#[derive(Debug, Clone, Serialize)]
pub struct ChainStatus {
    /// Whether the chain is intact
    pub valid: bool,
    /// Events checked
    pub events: usize,
    /// Events the writer dropped under load, declared by gap records
    pub dropped: u64,
    /// First bad sequence number
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broken_at: Option<u64>,
    /// What did not match
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Query result.
#[derive(Debug, Clone, Serialize)]
pub struct AuditView {
    /// Events in the file
    pub total: usize,
    /// Matching events, oldest first
    pub events: Vec<AuditEvent>,
    /// Present when `--verify` was given
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain: Option<ChainStatus>,
}

/// Reads `log` and applies `query`.
pub fn query(log: &Path, query: &AuditQuery) -> Result<AuditView> {
    let entries =
        read_entries(log).with_context(|| format!("failed to read audit log {}", log.display()))?;
    let all: Vec<AuditEvent> = entries.iter().filter_map(LogEntry::as_event).cloned().collect();

    let mut filter = AuditFilter::new();
    if let Some(name) = &query.event_type {
        let event_type: AuditEventType = name.parse().map_err(|e: String| anyhow!(e))?;
        filter = filter.event_type(event_type);
    }
    if let Some(subject) = &query.subject {
        filter = filter.subject(subject.as_str());
    }
    if let Some(outcome) = &query.outcome {
        filter = filter.outcome(outcome.as_str());
    }
    let mut events: Vec<AuditEvent> = filter.apply(all.iter().cloned()).collect();
    if let Some(limit) = query.limit {
        let skip = events.len().saturating_sub(limit);
        events.drain(..skip);
    }

    let chain = query.verify.then(|| match verify_log(&entries) {
        VerifyResult::Valid { events, dropped } => ChainStatus {
            valid: true,
            events,
            dropped,
            broken_at: None,
            reason: None,
        },
        VerifyResult::Broken { seq, reason } => ChainStatus {
            valid: false,
            events: all.len(),
            dropped: 0,
            broken_at: Some(seq),
            reason: Some(reason),
        },
    });
    info!(
        log = %log.display(),
        total = all.len(),
        matched = events.len(),
        "audit log queried"
    );
    Ok(AuditView {
        total: all.len(),
        events,
        chain,
    })
}

/// Prints matching events. Exits with [`ExitCode::INTEGRITY`] when a
/// requested verification fails.
pub fn run(log: &Path, options: &AuditQuery, format: OutputFormat) -> Result<ExitCode> {
    let view = query(log, options)?;
    match format {
        OutputFormat::Json => println!("{}", format_output(&view, format)?),
        OutputFormat::Pretty => print_pretty(&view),
    }
    Ok(match &view.chain {
        Some(chain) if !chain.valid => ExitCode::INTEGRITY,
        _ => ExitCode::SUCCESS,
    })
}

fn print_pretty(view: &AuditView) {
    for event in &view.events {
        let kind = event.event_type.as_str();
        let kind = if event.event_type == AuditEventType::SecurityViolation {
            kind.red().bold()
        } else {
            kind.blue()
        };
        println!(
            "{:>6} {} {:<18} {:<24} {}",
            event.seq,
            event
                .timestamp
                .to_rfc3339_opts(SecondsFormat::Millis, true)
                .dimmed(),
            kind,
            event.subject_id,
            event.outcome.green()
        );
    }
    println!("{} of {} events", view.events.len(), view.total);
    if let Some(chain) = &view.chain {
        if chain.valid {
            println!("{} hash chain intact over {} events", "ok".green().bold(), chain.events);
            if chain.dropped > 0 {
                println!(
                    "{} {} events were dropped by the writer under load and are declared in the log",
                    "note".yellow().bold(),
                    chain.dropped
                );
            }
        } else {
            println!(
                "{} hash chain broken at seq {}: {}",
                "FAIL".red().bold(),
                chain.broken_at.unwrap_or_default(),
                chain.reason.as_deref().unwrap_or_default()
            );
        }
    }
}
