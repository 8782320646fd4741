//! Audit event records and query filters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Kind of audited step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// A `load` call was received
    LoadAttempt,
    /// A load produced an instance
    LoadSuccess,
    /// Compilation, class validation or parameter validation failed
    LoadDenied,
    /// An execution began
    ExecutionStart,
    /// An execution finished, successfully or not
    ExecutionEnd,
    /// The sanitizer or the permission policy rejected the code
    SecurityViolation,
}

impl AuditEventType {
    /// All event types.
    pub const ALL: [Self; 6] = [
        Self::LoadAttempt,
        Self::LoadSuccess,
        Self::LoadDenied,
        Self::ExecutionStart,
        Self::ExecutionEnd,
        Self::SecurityViolation,
    ];

    /// snake_case name as written to the log.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LoadAttempt => "load_attempt",
            Self::LoadSuccess => "load_success",
            Self::LoadDenied => "load_denied",
            Self::ExecutionStart => "execution_start",
            Self::ExecutionEnd => "execution_end",
            Self::SecurityViolation => "security_violation",
        }
    }

    /// Whether the event closes a `load` call.
    #[must_use]
    pub const fn is_load_terminal(self) -> bool {
        matches!(
            self,
            Self::LoadSuccess | Self::LoadDenied | Self::SecurityViolation
        )
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown audit event type '{s}'"))
    }
}

/// One append-only audit record.
///
/// `seq`, `hash_prev` and `hash` are stamped by the
/// [`AuditLogger`](crate::AuditLogger) when the event is recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Time the event was created
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    /// Kind of step
    pub event_type: AuditEventType,
    /// Strategy id or execution id the event is about
    pub subject_id: String,
    /// Short outcome label (`compiled`, `cache_hit`, `timeout`, ...)
    pub outcome: String,
    /// Structured detail, an object
    pub detail: Value,
    /// Position in the logger's sequence
    #[serde(default)]
    pub seq: u64,
    /// Hash of the previous event, `None` for the first
    #[serde(default)]
    pub hash_prev: Option<String>,
    /// Hash of this event
    #[serde(default)]
    pub hash: String,
}

impl AuditEvent {
    /// Creates an unstamped event with an empty detail object.
    #[must_use]
    pub fn new(
        event_type: AuditEventType,
        subject_id: impl Into<String>,
        outcome: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            subject_id: subject_id.into(),
            outcome: outcome.into(),
            detail: Value::Object(Map::new()),
            seq: 0,
            hash_prev: None,
            hash: String::new(),
        }
    }

    /// Adds one detail field.
    #[must_use]
    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        if let Value::Object(map) = &mut self.detail {
            map.insert(key.to_string(), value.into());
        }
        self
    }

    /// Reads one detail field.
    #[must_use]
    pub fn detail_field(&self, key: &str) -> Option<&Value> {
        self.detail.get(key)
    }

    /// Hash over the canonical form of the event with `hash` cleared.
    #[must_use]
    pub fn compute_hash(&self) -> String {
        let mut unsigned = self.clone();
        unsigned.hash = String::new();
        let canonical = serde_json::to_value(&unsigned)
            .map(|v| sort_keys(&v).to_string())
            .unwrap_or_default();
        blake3::hash(canonical.as_bytes()).to_hex().to_string()
    }
}

/// A run of events that reached the ring buffer but not the file.
///
/// Written in place of the missing events once the writer catches up. The
/// bounding hashes let a verifier check that the events on either side of
/// the gap still belong to one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkGap {
    /// Time the gap was written
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    /// First missing sequence number
    pub dropped_from: u64,
    /// Last missing sequence number
    pub dropped_to: u64,
    /// `hash_prev` of the first missing event
    pub hash_prev: Option<String>,
    /// `hash` of the last missing event
    pub last_hash: String,
}

impl SinkGap {
    /// Starts a gap at a stamped event.
    #[must_use]
    pub fn starting_at(event: &AuditEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            dropped_from: event.seq,
            dropped_to: event.seq,
            hash_prev: event.hash_prev.clone(),
            last_hash: event.hash.clone(),
        }
    }

    /// Extends the gap over the next stamped event.
    pub fn extend(&mut self, event: &AuditEvent) {
        self.dropped_to = event.seq;
        self.last_hash.clone_from(&event.hash);
    }

    /// Number of missing events.
    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.dropped_to.saturating_sub(self.dropped_from) + 1
    }
}

/// One line of a JSON Lines audit file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LogEntry {
    /// A recorded event
    Event(AuditEvent),
    /// Events the writer could not take
    Gap(SinkGap),
}

impl LogEntry {
    /// The event, if this line is one.
    #[must_use]
    pub const fn as_event(&self) -> Option<&AuditEvent> {
        match self {
            Self::Event(event) => Some(event),
            Self::Gap(_) => None,
        }
    }
}

impl From<AuditEvent> for LogEntry {
    fn from(event: AuditEvent) -> Self {
        Self::Event(event)
    }
}

impl From<SinkGap> for LogEntry {
    fn from(gap: SinkGap) -> Self {
        Self::Gap(gap)
    }
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for k in keys {
                sorted.insert(k.clone(), sort_keys(&map[k]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

/// Query over recorded events. Empty filter matches everything.
///
/// # Examples
///
/// ```
/// use stratguard_audit::{AuditEvent, AuditEventType, AuditFilter};
///
/// let filter = AuditFilter::new()
///     .event_type(AuditEventType::LoadSuccess)
///     .subject("strategy-1");
/// let event = AuditEvent::new(AuditEventType::LoadSuccess, "strategy-1", "compiled");
/// assert!(filter.matches(&event));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditFilter {
    event_type: Option<AuditEventType>,
    subject_id: Option<String>,
    outcome: Option<String>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    limit: Option<usize>,
}

impl AuditFilter {
    /// Matches all events.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts to one event type.
    #[must_use]
    pub const fn event_type(mut self, event_type: AuditEventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    /// Restricts to one subject.
    #[must_use]
    pub fn subject(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = Some(subject_id.into());
        self
    }

    /// Restricts to one outcome label.
    #[must_use]
    pub fn outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = Some(outcome.into());
        self
    }

    /// Events at or after `ts`.
    #[must_use]
    pub const fn since(mut self, ts: DateTime<Utc>) -> Self {
        self.since = Some(ts);
        self
    }

    /// Events at or before `ts`.
    #[must_use]
    pub const fn until(mut self, ts: DateTime<Utc>) -> Self {
        self.until = Some(ts);
        self
    }

    /// At most `n` events, oldest first.
    #[must_use]
    pub const fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Maximum number of results, if limited.
    #[must_use]
    pub const fn max_results(&self) -> Option<usize> {
        self.limit
    }

    /// Whether `event` satisfies every set criterion.
    #[must_use]
    pub fn matches(&self, event: &AuditEvent) -> bool {
        self.event_type.is_none_or(|t| t == event.event_type)
            && self
                .subject_id
                .as_deref()
                .is_none_or(|s| s == event.subject_id)
            && self.outcome.as_deref().is_none_or(|o| o == event.outcome)
            && self.since.is_none_or(|ts| event.timestamp >= ts)
            && self.until.is_none_or(|ts| event.timestamp <= ts)
    }

    /// Applies the filter to a sequence of events.
    pub fn apply<'a, I>(&'a self, events: I) -> impl Iterator<Item = AuditEvent> + 'a
    where
        I: IntoIterator<Item = AuditEvent>,
        I::IntoIter: 'a,
    {
        events
            .into_iter()
            .filter(|e| self.matches(e))
            .take(self.limit.unwrap_or(usize::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_event_type_round_trip_names() {
        for t in AuditEventType::ALL {
            assert_eq!(t.as_str().parse::<AuditEventType>().unwrap(), t);
        }
        assert!("load".parse::<AuditEventType>().is_err());
    }

    #[test]
    fn test_line_format_field_names() {
        let event = AuditEvent::new(AuditEventType::ExecutionEnd, "exec-1", "timeout")
            .with_detail("elapsed_ms", 1200);
        let json = serde_json::to_value(&event).unwrap();
        for key in [
            "ts",
            "event_type",
            "subject_id",
            "outcome",
            "detail",
            "seq",
            "hash_prev",
            "hash",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert_eq!(json["event_type"], "execution_end");
        assert_eq!(json["detail"]["elapsed_ms"], 1200);
    }

    #[test]
    fn test_hash_ignores_own_hash_field() {
        let mut event = AuditEvent::new(AuditEventType::LoadAttempt, "s", "received");
        let before = event.compute_hash();
        event.hash = "bogus".to_string();
        assert_eq!(event.compute_hash(), before);
        event.outcome = "changed".to_string();
        assert_ne!(event.compute_hash(), before);
    }

    #[test]
    fn test_filter_criteria() {
        let now = Utc::now();
        let event = AuditEvent::new(AuditEventType::LoadDenied, "s-1", "compilation_error");
        assert!(AuditFilter::new().matches(&event));
        assert!(AuditFilter::new().outcome("compilation_error").matches(&event));
        assert!(!AuditFilter::new().subject("s-2").matches(&event));
        assert!(
            !AuditFilter::new()
                .event_type(AuditEventType::LoadSuccess)
                .matches(&event)
        );
        assert!(
            !AuditFilter::new()
                .since(now + Duration::hours(1))
                .matches(&event)
        );
        assert!(
            AuditFilter::new()
                .until(now + Duration::hours(1))
                .matches(&event)
        );
    }

    #[test]
    fn test_filter_limit() {
        let events = (0..5).map(|i| AuditEvent::new(AuditEventType::LoadAttempt, format!("s{i}"), "received"));
        let filter = AuditFilter::new().limit(2);
        let taken: Vec<_> = filter.apply(events).collect();
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].subject_id, "s0");
    }
}
