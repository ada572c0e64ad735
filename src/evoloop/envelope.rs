//! Durable event envelope and quality filtering.
//!
//! Every observable fact in the system — tool calls, state changes, credit
//! updates, checkpoints — is recorded as an [`EventEnvelope`] before it is
//! published to the durable event stream. Envelopes are immutable after
//! publication and carry a `quality` scalar in `[-1.0, +1.0]` that downstream
//! consumers (the embedder pipeline in particular) use to decide whether an
//! event is worth indexing.
//!
//! # Quality spectrum
//!
//! Earlier revisions of the wire format carried a boolean `garbage` flag:
//! `true` meant "embedder, ignore this". The flag is superseded by the
//! `quality` scalar, and the read path migrates old events transparently:
//!
//! ```text
//! {"garbage": true}   →  quality = -0.8   (filtered: quality < -0.5)
//! {"garbage": false}  →  quality = +0.5   (kept:     quality ≥ -0.5)
//! ```
//!
//! Serialization never writes the boolean back out.
//!
//! # Example
//!
//! ```rust
//! use evoloop::envelope::{EventEnvelope, EventMeta, EventType};
//! use serde_json::json;
//!
//! let envelope = EventEnvelope::new(
//!     EventType::ToolCall,
//!     "planner",
//!     json!({"tool": "grep", "args": ["-r", "fixme"]}),
//!     EventMeta::new("evoloop-2026-08-01-001"),
//! );
//!
//! assert!(envelope.validate().is_ok());
//! assert!(envelope.is_embeddable()); // default quality 0.0 ≥ -0.5
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use uuid::Uuid;

/// Quality threshold below which events are filtered from embedding.
pub const EMBED_QUALITY_THRESHOLD: f32 = -0.5;

/// Quality assigned to legacy events that carried `garbage: true`.
pub const LEGACY_IGNORE_QUALITY: f32 = -0.8;

/// Quality assigned to legacy events that carried `garbage: false`.
pub const LEGACY_KEEP_QUALITY: f32 = 0.5;

/// Current envelope schema version, written on every new event.
pub const SCHEMA_VERSION: &str = "2.0";

/// Event type categories carried on the wire as snake_case strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// An agent invoked a tool.
    ToolCall,
    /// A component changed state (started, stopped, degraded).
    StateChange,
    /// A unit of work finished.
    Completion,
    /// Something failed; payload carries the error text.
    Error,
    /// A durable snapshot row was recorded for an agent.
    Checkpoint,
    /// Credit counters moved.
    CreditUpdate,
    /// A pull request was opened, merged, or closed.
    PrLifecycle,
    /// A test run reported its outcome.
    TestResult,
    /// A full metrics snapshot was exported.
    MetricsSnapshot,
}

impl EventType {
    /// Wire-format name of this event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ToolCall => "tool_call",
            EventType::StateChange => "state_change",
            EventType::Completion => "completion",
            EventType::Error => "error",
            EventType::Checkpoint => "checkpoint",
            EventType::CreditUpdate => "credit_update",
            EventType::PrLifecycle => "pr_lifecycle",
            EventType::TestResult => "test_result",
            EventType::MetricsSnapshot => "metrics_snapshot",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event metadata: session scope, accounting, and correlation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventMeta {
    /// Session identifier, `<prefix>-YYYY-MM-DD-NNN`.
    pub session_id: String,

    /// Credits consumed by the operation this event records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credits_used: Option<u64>,

    /// Context hash at the time of the event, `sha256:<64 hex>`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_hash: Option<String>,

    /// Parent event, when this event is a child of another.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<Uuid>,

    /// Correlation id echoed between a request and its reply.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Free-form tags for filtering and grouping.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

impl EventMeta {
    /// Create metadata scoped to the given session.
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Default::default()
        }
    }

    /// Record the credits consumed by this event (builder pattern).
    pub fn with_credits(mut self, credits: u64) -> Self {
        self.credits_used = Some(credits);
        self
    }

    /// Attach a correlation id (builder pattern).
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// Raw wire form used only during deserialization. Accepts both the current
/// `quality` scalar and the legacy `garbage` boolean; [`From`] performs the
/// migration so the in-memory type never sees the boolean.
#[derive(Deserialize)]
struct RawEnvelope {
    id: Uuid,
    #[serde(rename = "type")]
    event_type: EventType,
    timestamp: DateTime<Utc>,
    agent: String,
    payload: serde_json::Value,
    meta: EventMeta,
    quality: Option<f32>,
    garbage: Option<bool>,
    schema_version: Option<String>,
}

impl From<RawEnvelope> for EventEnvelope {
    fn from(raw: RawEnvelope) -> Self {
        let quality = match (raw.quality, raw.garbage) {
            (Some(q), _) => q,
            (None, Some(true)) => LEGACY_IGNORE_QUALITY,
            (None, Some(false)) => LEGACY_KEEP_QUALITY,
            (None, None) => 0.0,
        };
        EventEnvelope {
            id: raw.id,
            event_type: raw.event_type,
            timestamp: raw.timestamp,
            agent: raw.agent,
            payload: raw.payload,
            meta: raw.meta,
            quality,
            schema_version: raw
                .schema_version
                .unwrap_or_else(|| SCHEMA_VERSION.to_string()),
        }
    }
}

/// Standard envelope for durable agent events.
///
/// Field names serialize literally as `id`, `type`, `timestamp`, `agent`,
/// `payload`, `meta`, `quality`, `schema_version`. Timestamps are ISO-8601
/// UTC. Envelopes are created by a runtime or the orchestrator and are
/// immutable once published.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "RawEnvelope")]
pub struct EventEnvelope {
    /// Unique event identifier (UUID v4).
    pub id: Uuid,

    /// Event type category.
    #[serde(rename = "type")]
    pub event_type: EventType,

    /// When the event occurred.
    pub timestamp: DateTime<Utc>,

    /// Lowercase identifier of the emitting agent.
    pub agent: String,

    /// Event-specific data.
    pub payload: serde_json::Value,

    /// Session, accounting, and correlation metadata.
    pub meta: EventMeta,

    /// Event desirability in `[-1.0, +1.0]`. Defaults to `0.0`.
    pub quality: f32,

    /// Schema version, `<major>.<minor>`.
    pub schema_version: String,
}

impl EventEnvelope {
    /// Create a new envelope with a fresh id, the current time, and the
    /// default quality of `0.0`.
    pub fn new(
        event_type: EventType,
        agent: impl Into<String>,
        payload: serde_json::Value,
        meta: EventMeta,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            timestamp: Utc::now(),
            agent: agent.into(),
            payload,
            meta,
            quality: 0.0,
            schema_version: SCHEMA_VERSION.to_string(),
        }
    }

    /// Set the quality scalar (builder pattern). Values are expected in
    /// `[-1.0, +1.0]`; [`validate`](Self::validate) rejects anything else.
    pub fn with_quality(mut self, quality: f32) -> Self {
        self.quality = quality;
        self
    }

    /// Whether downstream embedding should accept this event.
    ///
    /// `quality ≥ -0.5` is eligible; anything below is filtered.
    pub fn is_embeddable(&self) -> bool {
        self.quality >= EMBED_QUALITY_THRESHOLD
    }

    /// Recompute the legacy boolean ignore flag from the quality scalar.
    ///
    /// `true` means a legacy consumer would have skipped this event.
    pub fn legacy_ignore_flag(&self) -> bool {
        self.quality < EMBED_QUALITY_THRESHOLD
    }

    /// Check structural invariants: agent naming, session-id shape, schema
    /// version shape, quality range, and context-hash shape when present.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if !is_valid_agent_name(&self.agent) {
            return Err(EnvelopeError::InvalidAgent(self.agent.clone()));
        }
        if !is_valid_session_id(&self.meta.session_id) {
            return Err(EnvelopeError::InvalidSessionId(
                self.meta.session_id.clone(),
            ));
        }
        if !is_valid_schema_version(&self.schema_version) {
            return Err(EnvelopeError::InvalidSchemaVersion(
                self.schema_version.clone(),
            ));
        }
        if !(-1.0..=1.0).contains(&self.quality) {
            return Err(EnvelopeError::QualityOutOfRange(self.quality));
        }
        if let Some(hash) = &self.meta.context_hash {
            if !is_valid_context_hash(hash) {
                return Err(EnvelopeError::InvalidContextHash(hash.clone()));
            }
        }
        Ok(())
    }
}

/// Structural validation failures for an [`EventEnvelope`].
#[derive(Debug, Clone, PartialEq)]
pub enum EnvelopeError {
    /// Agent name does not match `^[a-z][a-z0-9-]*$`.
    InvalidAgent(String),
    /// Session id does not match `<prefix>-YYYY-MM-DD-NNN`.
    InvalidSessionId(String),
    /// Schema version is not `<major>.<minor>`.
    InvalidSchemaVersion(String),
    /// Quality scalar outside `[-1.0, +1.0]`.
    QualityOutOfRange(f32),
    /// Context hash is not `sha256:` followed by 64 hex chars.
    InvalidContextHash(String),
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvelopeError::InvalidAgent(name) => {
                write!(f, "invalid agent name: {:?}", name)
            }
            EnvelopeError::InvalidSessionId(id) => {
                write!(f, "invalid session id: {:?}", id)
            }
            EnvelopeError::InvalidSchemaVersion(v) => {
                write!(f, "invalid schema version: {:?}", v)
            }
            EnvelopeError::QualityOutOfRange(q) => {
                write!(f, "quality {} outside [-1.0, +1.0]", q)
            }
            EnvelopeError::InvalidContextHash(h) => {
                write!(f, "invalid context hash: {:?}", h)
            }
        }
    }
}

impl Error for EnvelopeError {}

/// Admission gate for the downstream embedding pipeline.
///
/// Tracks how many events were admitted versus skipped so the pipeline can
/// report its filtering behavior. Purely local counters; the filter itself
/// is just the quality threshold.
#[derive(Debug, Default)]
pub struct QualityFilter {
    processed: u64,
    skipped: u64,
}

impl QualityFilter {
    /// Create a filter with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` and counts the event as processed when its quality
    /// clears the embedding threshold; otherwise counts it as skipped.
    pub fn admit(&mut self, event: &EventEnvelope) -> bool {
        if event.is_embeddable() {
            self.processed += 1;
            true
        } else {
            log::debug!("skipping low-quality event {} ({})", event.id, event.quality);
            self.skipped += 1;
            false
        }
    }

    /// Number of events admitted so far.
    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// Number of events filtered so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

/// Agent names are lowercase identifiers: `^[a-z][a-z0-9-]*$`.
pub fn is_valid_agent_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Session ids are `<prefix>-YYYY-MM-DD-NNN` where the prefix is itself a
/// valid agent-style identifier and NNN is one to four digits.
pub fn is_valid_session_id(id: &str) -> bool {
    let parts: Vec<&str> = id.split('-').collect();
    if parts.len() < 5 {
        return false;
    }
    let n = parts.len();
    let all_digits = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
    let (year, month, day, seq) = (parts[n - 4], parts[n - 3], parts[n - 2], parts[n - 1]);
    if year.len() != 4 || month.len() != 2 || day.len() != 2 {
        return false;
    }
    if !all_digits(year) || !all_digits(month) || !all_digits(day) {
        return false;
    }
    if seq.is_empty() || seq.len() > 4 || !all_digits(seq) {
        return false;
    }
    let prefix = parts[..n - 4].join("-");
    is_valid_agent_name(&prefix)
}

/// Schema versions are `<major>.<minor>` with plain digit runs.
pub fn is_valid_schema_version(version: &str) -> bool {
    let mut halves = version.splitn(2, '.');
    let digits = |s: Option<&str>| {
        s.map(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()))
            .unwrap_or(false)
    };
    digits(halves.next()) && digits(halves.next())
}

/// Context hashes are `sha256:` followed by exactly 64 lowercase hex chars.
pub fn is_valid_context_hash(hash: &str) -> bool {
    match hash.strip_prefix("sha256:") {
        Some(hex) => {
            hex.len() == 64
                && hex
                    .chars()
                    .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn legacy_garbage_true_migrates_low() {
        let raw = json!({
            "id": "550e8400-e29b-41d4-a716-446655440000",
            "type": "tool_call",
            "timestamp": "2026-08-01T00:00:00Z",
            "agent": "planner",
            "payload": {},
            "meta": {"session_id": "evoloop-2026-08-01-001"},
            "garbage": true
        });
        let event: EventEnvelope = serde_json::from_value(raw).unwrap();
        assert!((event.quality - LEGACY_IGNORE_QUALITY).abs() < f32::EPSILON);
        assert!(!event.is_embeddable());
    }

    #[test]
    fn quality_field_wins_over_garbage() {
        let raw = json!({
            "id": "550e8400-e29b-41d4-a716-446655440000",
            "type": "completion",
            "timestamp": "2026-08-01T00:00:00Z",
            "agent": "planner",
            "payload": {},
            "meta": {"session_id": "evoloop-2026-08-01-001"},
            "quality": 0.9,
            "garbage": true
        });
        let event: EventEnvelope = serde_json::from_value(raw).unwrap();
        assert!((event.quality - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn serialization_never_writes_garbage() {
        let event = EventEnvelope::new(
            EventType::Completion,
            "planner",
            json!({}),
            EventMeta::new("evoloop-2026-08-01-001"),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert!(value.get("garbage").is_none());
        assert!(value.get("quality").is_some());
        assert_eq!(value["type"], "completion");
    }

    #[test]
    fn session_id_pattern() {
        assert!(is_valid_session_id("evoloop-2026-08-01-1"));
        assert!(is_valid_session_id("uma-v2-2025-08-07-042"));
        assert!(!is_valid_session_id("evoloop-2026-08-01"));
        assert!(!is_valid_session_id("Evoloop-2026-08-01-1"));
        assert!(!is_valid_session_id("evoloop-2026-08-01-12345"));
    }
}
