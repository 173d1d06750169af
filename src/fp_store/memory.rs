//! In-memory FP event and consent stores.
//!
//! Used by `local` mode and tests. Semantics (error kinds, uniqueness,
//! window behaviour) match the SQLite backend exactly; the trait-level tests
//! in `sqlite.rs` run against both.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

use super::{ConsentRecord, ConsentStore, FpEvent, FpEventStore, FpWindow};
use crate::error::{OracleError, OracleResult};

/// In-memory event store keyed by rule, with a secondary finding index.
#[derive(Default)]
pub struct InMemoryFpEventStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    /// rule_id -> events (unordered; windows sort).
    by_rule: HashMap<String, Vec<FpEvent>>,
    /// finding_id -> (rule_id, event_id).
    by_finding: HashMap<String, (String, String)>,
}

impl InMemoryFpEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored events across all rules. Test helper.
    pub fn len(&self) -> usize {
        self.inner.read().by_rule.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl FpEventStore for InMemoryFpEventStore {
    async fn record_event(&self, event: &FpEvent) -> OracleResult<()> {
        let mut inner = self.inner.write();
        let events = inner.by_rule.entry(event.rule_id.clone()).or_default();
        if events.iter().any(|e| e.event_id == event.event_id) {
            return Err(OracleError::DuplicateEvent {
                rule_id: event.rule_id.clone(),
                event_id: event.event_id.clone(),
            });
        }
        events.push(event.clone());
        inner.by_finding.insert(
            event.finding_id.clone(),
            (event.rule_id.clone(), event.event_id.clone()),
        );
        Ok(())
    }

    async fn mark_false_positive(
        &self,
        finding_id: &str,
        reviewer: &str,
        suppression_ticket: Option<&str>,
        now: DateTime<Utc>,
    ) -> OracleResult<FpEvent> {
        let mut inner = self.inner.write();
        let (rule_id, event_id) =
            inner
                .by_finding
                .get(finding_id)
                .cloned()
                .ok_or_else(|| OracleError::NotFound {
                    entity: "finding",
                    key: finding_id.to_string(),
                })?;

        let events = inner
            .by_rule
            .get_mut(&rule_id)
            .ok_or_else(|| OracleError::NotFound {
                entity: "finding",
                key: finding_id.to_string(),
            })?;
        let event = events
            .iter_mut()
            .find(|e| e.event_id == event_id)
            .ok_or_else(|| OracleError::NotFound {
                entity: "finding",
                key: finding_id.to_string(),
            })?;

        // The transition to is_false_positive=true carries reviewer and
        // reviewed_at in the same write.
        event.is_false_positive = true;
        event.reviewer = Some(reviewer.to_string());
        event.reviewed_at = Some(now);
        event.suppression_ticket = suppression_ticket.map(str::to_string);
        Ok(event.clone())
    }

    async fn window_by_count(&self, rule_id: &str, n: usize) -> OracleResult<FpWindow> {
        let events = self
            .inner
            .read()
            .by_rule
            .get(rule_id)
            .cloned()
            .unwrap_or_default();
        Ok(FpWindow::compute(rule_id, events, n))
    }

    async fn window_by_since(
        &self,
        rule_id: &str,
        since: DateTime<Utc>,
    ) -> OracleResult<FpWindow> {
        let events: Vec<FpEvent> = self
            .inner
            .read()
            .by_rule
            .get(rule_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.timestamp >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(FpWindow::compute(rule_id, events, 0))
    }

    async fn events_for_rule(&self, rule_id: &str) -> OracleResult<Vec<FpEvent>> {
        Ok(self
            .inner
            .read()
            .by_rule
            .get(rule_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> OracleResult<u64> {
        let mut inner = self.inner.write();
        let mut removed = 0u64;
        let mut dropped_findings = Vec::new();
        for events in inner.by_rule.values_mut() {
            events.retain(|e| {
                let keep = e.expires_at > now;
                if !keep {
                    removed += 1;
                    dropped_findings.push(e.finding_id.clone());
                }
                keep
            });
        }
        for finding in dropped_findings {
            inner.by_finding.remove(&finding);
        }
        Ok(removed)
    }
}

/// In-memory consent store: latest record per org.
#[derive(Default)]
pub struct InMemoryConsentStore {
    records: RwLock<HashMap<String, ConsentRecord>>,
}

impl InMemoryConsentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConsentStore for InMemoryConsentStore {
    async fn latest_consent(&self, org_id: &str) -> OracleResult<Option<ConsentRecord>> {
        Ok(self.records.read().get(org_id).cloned())
    }

    async fn record_consent(&self, record: &ConsentRecord) -> OracleResult<()> {
        self.records
            .write()
            .insert(record.org_id.clone(), record.clone());
        Ok(())
    }

    async fn revoke_consent(&self, org_id: &str, now: DateTime<Utc>) -> OracleResult<()> {
        if let Some(record) = self.records.write().get_mut(org_id) {
            if record.revoked_at.is_none() {
                record.revoked_at = Some(now);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fp_store::{ConsentType, FpEventContext, Outcome};
    use chrono::Duration;

    fn event(id: &str, finding: &str, now: DateTime<Utc>) -> FpEvent {
        FpEvent::new(
            id,
            "MD-002",
            "1.0.0",
            finding,
            Outcome::Block,
            FpEventContext::default(),
            now,
        )
    }

    #[tokio::test]
    async fn test_duplicate_insert_leaves_store_unchanged() {
        let store = InMemoryFpEventStore::new();
        let now = Utc::now();
        store.record_event(&event("e1", "f1", now)).await.unwrap();

        let err = store.record_event(&event("e1", "f1", now)).await.unwrap_err();
        assert!(matches!(err, OracleError::DuplicateEvent { .. }));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_mark_false_positive_round_trip() {
        // Scenario: record, review, window shows fpr 1.0 with no pending.
        let store = InMemoryFpEventStore::new();
        let now = Utc::now();
        store.record_event(&event("e1", "f1", now)).await.unwrap();

        let updated = store
            .mark_false_positive("f1", "alice", Some("TICK-1"), now)
            .await
            .unwrap();
        assert!(updated.is_false_positive);
        assert_eq!(updated.reviewer.as_deref(), Some("alice"));
        assert!(updated.reviewed_at.is_some());
        assert_eq!(updated.suppression_ticket.as_deref(), Some("TICK-1"));

        let window = store.window_by_count("MD-002", 10).await.unwrap();
        assert_eq!(window.statistics.false_positives, 1);
        assert_eq!(window.statistics.pending, 0);
        assert_eq!(window.statistics.observed_fpr, 1.0);
    }

    #[tokio::test]
    async fn test_mark_unknown_finding_not_found() {
        let store = InMemoryFpEventStore::new();
        let err = store
            .mark_false_positive("missing", "alice", None, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OracleError::NotFound {
                entity: "finding",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_window_by_since_filters() {
        let store = InMemoryFpEventStore::new();
        let now = Utc::now();
        let mut old = event("e1", "f1", now);
        old.timestamp = now - Duration::hours(5);
        store.record_event(&old).await.unwrap();
        store.record_event(&event("e2", "f2", now)).await.unwrap();

        let window = store
            .window_by_since("MD-002", now - Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(window.statistics.total, 1);
        assert_eq!(window.events[0].event_id, "e2");
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = InMemoryFpEventStore::new();
        let now = Utc::now();
        let mut stale = event("e1", "f1", now);
        stale.expires_at = now - Duration::days(1);
        store.record_event(&stale).await.unwrap();
        store.record_event(&event("e2", "f2", now)).await.unwrap();

        let removed = store.purge_expired(now).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);
        // The purged finding's index entry is gone too.
        assert!(store
            .mark_false_positive("f1", "alice", None, now)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_consent_revoke_idempotent() {
        let store = InMemoryConsentStore::new();
        let now = Utc::now();
        store
            .record_consent(&ConsentRecord {
                org_id: "acme".to_string(),
                granted_by: "cto@acme".to_string(),
                granted_at: now,
                expires_at: now + Duration::days(365),
                revoked_at: None,
                consent_type: ConsentType::Explicit,
            })
            .await
            .unwrap();

        store.revoke_consent("acme", now).await.unwrap();
        let first = store.latest_consent("acme").await.unwrap().unwrap();
        let revoked_at = first.revoked_at.unwrap();

        // Second revoke does not move the timestamp.
        store
            .revoke_consent("acme", now + Duration::hours(1))
            .await
            .unwrap();
        let second = store.latest_consent("acme").await.unwrap().unwrap();
        assert_eq!(second.revoked_at.unwrap(), revoked_at);
    }
}
