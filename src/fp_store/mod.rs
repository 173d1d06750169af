//! False-Positive Event Store
//!
//! Records every rule evaluation outcome, carries reviewer verdicts, and
//! serves windowed FPR statistics back to the L1 evaluator and the
//! calibration aggregator.
//!
//! # Stable FPR definition
//!
//! `observed_fpr = false_positives / max(1, total - pending)`; pending
//! events (no reviewer assigned) are excluded from the denominator.
//!
//! Errors never degrade to empty results: a transport fault propagates as
//! `StoreError`, a duplicate `(rule_id, event_id)` insert is
//! `DuplicateEvent`, and a miss on the `finding_id` index is `NotFound`.

pub mod intake;
pub mod memory;
pub mod sqlite;

pub use intake::CalibrationIntake;
pub use memory::{InMemoryConsentStore, InMemoryFpEventStore};
pub use sqlite::{SqliteConsentStore, SqliteFpEventStore};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::OracleResult;

/// Evaluation outcome of a single finding or of a whole decision record.
/// Severity order for document decisions: `Block > Warn > Pass`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    #[default]
    Pass,
    Warn,
    Block,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Warn => "warn",
            Self::Block => "block",
        }
    }
}

impl std::str::FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pass" => Ok(Self::Pass),
            "warn" => Ok(Self::Warn),
            "block" => Ok(Self::Block),
            other => Err(format!("unknown outcome '{other}'")),
        }
    }
}

/// Where an event came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FpEventContext {
    pub org_id: String,
    pub repo: String,
    pub branch: String,
    pub event_type: String,
    /// Stable hash of the finding's context (rule, evidence path, repo).
    /// Lets the evaluator match a candidate finding against reviewed false
    /// positives without comparing finding ids.
    pub context_hash: Option<String>,
}

/// One recorded rule-evaluation outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FpEvent {
    /// Unique per `(rule_id, event_id)`.
    pub event_id: String,
    pub rule_id: String,
    pub rule_version: String,
    pub finding_id: String,
    pub outcome: Outcome,
    pub is_false_positive: bool,
    pub timestamp: DateTime<Utc>,
    pub context: FpEventContext,
    /// Set together with `reviewed_at` when the event is reviewed.
    pub reviewer: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub suppression_ticket: Option<String>,
    /// Store-level TTL.
    pub expires_at: DateTime<Utc>,
}

impl FpEvent {
    /// Build an unreviewed event with the default 90-day TTL.
    pub fn new(
        event_id: impl Into<String>,
        rule_id: impl Into<String>,
        rule_version: impl Into<String>,
        finding_id: impl Into<String>,
        outcome: Outcome,
        context: FpEventContext,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            rule_id: rule_id.into(),
            rule_version: rule_version.into(),
            finding_id: finding_id.into(),
            outcome,
            is_false_positive: false,
            timestamp: now,
            context,
            reviewer: None,
            reviewed_at: None,
            suppression_ticket: None,
            expires_at: now + Duration::days(90),
        }
    }

    /// An event is pending until a reviewer is assigned.
    pub fn is_pending(&self) -> bool {
        self.reviewer.is_none()
    }
}

/// Window statistics; a pure function of the events in the window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FpWindowStats {
    pub total: usize,
    pub pending: usize,
    pub false_positives: usize,
    pub observed_fpr: f64,
}

/// Derived newest-first view over one rule's events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FpWindow {
    pub rule_id: String,
    pub window_size: usize,
    /// Newest first.
    pub events: Vec<FpEvent>,
    /// Statistical mode of versions in the window; ties resolve to the
    /// version carried by the newest tied event.
    pub rule_version: String,
    pub statistics: FpWindowStats,
}

impl FpWindow {
    /// Compute a window from events already filtered to one rule.
    /// Events may arrive in any order; the window sorts newest-first and
    /// truncates to `window_size` when `window_size > 0`.
    pub fn compute(rule_id: &str, mut events: Vec<FpEvent>, window_size: usize) -> Self {
        events.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.event_id.cmp(&a.event_id))
        });
        if window_size > 0 && events.len() > window_size {
            events.truncate(window_size);
        }

        let total = events.len();
        let pending = events.iter().filter(|e| e.is_pending()).count();
        let false_positives = events.iter().filter(|e| e.is_false_positive).count();
        let denominator = (total - pending).max(1);
        let observed_fpr = false_positives as f64 / denominator as f64;

        let rule_version = mode_version(&events);

        Self {
            rule_id: rule_id.to_string(),
            window_size,
            rule_version,
            statistics: FpWindowStats {
                total,
                pending,
                false_positives,
                observed_fpr,
            },
            events,
        }
    }
}

/// Mode of versions; ties break to the version of the newest tied event.
/// Events must already be sorted newest-first.
fn mode_version(events: &[FpEvent]) -> String {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for event in events {
        *counts.entry(event.rule_version.as_str()).or_default() += 1;
    }
    let Some(&max_count) = counts.values().max() else {
        return String::new();
    };
    events
        .iter()
        .find(|e| counts[e.rule_version.as_str()] == max_count)
        .map(|e| e.rule_version.clone())
        .unwrap_or_default()
}

/// The FP event store capability.
#[async_trait]
pub trait FpEventStore: Send + Sync {
    /// Conditional insert keyed by `(rule_id, event_id)`.
    async fn record_event(&self, event: &FpEvent) -> OracleResult<()>;

    /// Locate by the `finding_id` index and mark reviewed-false-positive in
    /// one write. Returns the updated event.
    async fn mark_false_positive(
        &self,
        finding_id: &str,
        reviewer: &str,
        suppression_ticket: Option<&str>,
        now: DateTime<Utc>,
    ) -> OracleResult<FpEvent>;

    /// Up to `n` newest events for the rule, as a window.
    async fn window_by_count(&self, rule_id: &str, n: usize) -> OracleResult<FpWindow>;

    /// All events for the rule at or after `since`, as a window.
    async fn window_by_since(
        &self,
        rule_id: &str,
        since: DateTime<Utc>,
    ) -> OracleResult<FpWindow>;

    /// Full rule slice for calibration. Snapshotted by the caller.
    async fn events_for_rule(&self, rule_id: &str) -> OracleResult<Vec<FpEvent>>;

    /// Drop events past their TTL. Returns the number removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> OracleResult<u64>;
}

// =============================================================================
// CONSENT
// =============================================================================

/// How an org consented to calibration participation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentType {
    Explicit,
    Implicit,
    None,
}

/// The latest consent state for an org.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub org_id: String,
    pub granted_by: String,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub consent_type: ConsentType,
}

impl ConsentRecord {
    /// A calibration-destined event is admitted only on a live explicit
    /// grant.
    pub fn admits_calibration(&self, now: DateTime<Utc>) -> bool {
        self.consent_type == ConsentType::Explicit
            && self.revoked_at.is_none()
            && self.expires_at > now
    }
}

/// Consent record storage.
#[async_trait]
pub trait ConsentStore: Send + Sync {
    /// Latest record for the org, if any.
    async fn latest_consent(&self, org_id: &str) -> OracleResult<Option<ConsentRecord>>;

    /// Append a new consent record (becomes the latest).
    async fn record_consent(&self, record: &ConsentRecord) -> OracleResult<()>;

    /// Revoke the latest record. Idempotent.
    async fn revoke_consent(&self, org_id: &str, now: DateTime<Utc>) -> OracleResult<()>;
}
