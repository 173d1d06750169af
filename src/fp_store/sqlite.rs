//! SQLite-backed FP event and consent stores.
//!
//! The on-disk layout mirrors the partitioned key schema: a partition key
//! `rule#{rule_id}`, a sort key `event#{timestamp}#{event_id}`, a secondary
//! index on `finding_id`, and a TTL column holding a Unix epoch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OpenFlags};
use std::path::Path;
use tracing::debug;

use super::{
    ConsentRecord, ConsentStore, ConsentType, FpEvent, FpEventContext, FpEventStore, FpWindow,
    Outcome,
};
use crate::error::{OracleError, OracleResult};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS fp_events (
    partition_key TEXT NOT NULL,
    sort_key TEXT NOT NULL,
    rule_id TEXT NOT NULL,
    event_id TEXT NOT NULL,
    rule_version TEXT NOT NULL,
    finding_id TEXT NOT NULL,
    outcome TEXT NOT NULL,
    is_false_positive INTEGER NOT NULL DEFAULT 0,
    timestamp TEXT NOT NULL,
    org_id TEXT NOT NULL,
    repo TEXT NOT NULL,
    branch TEXT NOT NULL,
    event_type TEXT NOT NULL,
    context_hash TEXT,
    reviewer TEXT,
    reviewed_at TEXT,
    suppression_ticket TEXT,
    expires_at_epoch INTEGER NOT NULL,
    UNIQUE(rule_id, event_id)
);

CREATE INDEX IF NOT EXISTS idx_fp_events_partition
    ON fp_events(partition_key, sort_key DESC);

CREATE INDEX IF NOT EXISTS idx_fp_events_finding
    ON fp_events(finding_id);

CREATE INDEX IF NOT EXISTS idx_fp_events_expiry
    ON fp_events(expires_at_epoch);

CREATE TABLE IF NOT EXISTS consent_records (
    org_id TEXT PRIMARY KEY,
    granted_by TEXT NOT NULL,
    granted_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    revoked_at TEXT,
    consent_type TEXT NOT NULL
);
"#;

/// SQLite FP event store. One connection behind a mutex, WAL mode.
pub struct SqliteFpEventStore {
    conn: Mutex<Connection>,
}

impl SqliteFpEventStore {
    pub fn open(path: impl AsRef<Path>) -> OracleResult<Self> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(|e| OracleError::store("open", path.as_ref().display().to_string(), e))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| OracleError::store("init_schema", "fp_events", e))?;
        debug!(path = %path.as_ref().display(), "fp event store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<FpEvent> {
        let outcome: String = row.get("outcome")?;
        let timestamp: String = row.get("timestamp")?;
        let reviewed_at: Option<String> = row.get("reviewed_at")?;
        let expires_epoch: i64 = row.get("expires_at_epoch")?;
        Ok(FpEvent {
            event_id: row.get("event_id")?,
            rule_id: row.get("rule_id")?,
            rule_version: row.get("rule_version")?,
            finding_id: row.get("finding_id")?,
            outcome: outcome.parse::<Outcome>().unwrap_or_default(),
            is_false_positive: row.get::<_, i64>("is_false_positive")? != 0,
            timestamp: parse_ts(&timestamp),
            context: FpEventContext {
                org_id: row.get("org_id")?,
                repo: row.get("repo")?,
                branch: row.get("branch")?,
                event_type: row.get("event_type")?,
                context_hash: row.get("context_hash")?,
            },
            reviewer: row.get("reviewer")?,
            reviewed_at: reviewed_at.map(|s| parse_ts(&s)),
            suppression_ticket: row.get("suppression_ticket")?,
            expires_at: DateTime::<Utc>::from_timestamp(expires_epoch, 0).unwrap_or_default(),
        })
    }
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

#[async_trait]
impl FpEventStore for SqliteFpEventStore {
    async fn record_event(&self, event: &FpEvent) -> OracleResult<()> {
        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO fp_events (
                partition_key, sort_key, rule_id, event_id, rule_version,
                finding_id, outcome, is_false_positive, timestamp,
                org_id, repo, branch, event_type, context_hash,
                reviewer, reviewed_at, suppression_ticket, expires_at_epoch
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                format!("rule#{}", event.rule_id),
                format!("event#{}#{}", ts(event.timestamp), event.event_id),
                event.rule_id,
                event.event_id,
                event.rule_version,
                event.finding_id,
                event.outcome.as_str(),
                event.is_false_positive as i64,
                ts(event.timestamp),
                event.context.org_id,
                event.context.repo,
                event.context.branch,
                event.context.event_type,
                event.context.context_hash,
                event.reviewer,
                event.reviewed_at.map(ts),
                event.suppression_ticket,
                event.expires_at.timestamp(),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                Err(OracleError::DuplicateEvent {
                    rule_id: event.rule_id.clone(),
                    event_id: event.event_id.clone(),
                })
            }
            Err(e) => Err(OracleError::store(
                "record_event",
                format!("({}, {})", event.rule_id, event.event_id),
                e,
            )),
        }
    }

    async fn mark_false_positive(
        &self,
        finding_id: &str,
        reviewer: &str,
        suppression_ticket: Option<&str>,
        now: DateTime<Utc>,
    ) -> OracleResult<FpEvent> {
        let conn = self.conn.lock();
        let updated = conn
            .execute(
                "UPDATE fp_events
                 SET is_false_positive = 1, reviewer = ?2, reviewed_at = ?3,
                     suppression_ticket = ?4
                 WHERE finding_id = ?1",
                params![finding_id, reviewer, ts(now), suppression_ticket],
            )
            .map_err(|e| OracleError::store("mark_false_positive", finding_id.to_string(), e))?;

        if updated == 0 {
            return Err(OracleError::NotFound {
                entity: "finding",
                key: finding_id.to_string(),
            });
        }

        conn.query_row(
            "SELECT * FROM fp_events WHERE finding_id = ?1",
            params![finding_id],
            Self::row_to_event,
        )
        .map_err(|e| OracleError::store("mark_false_positive", finding_id.to_string(), e))
    }

    async fn window_by_count(&self, rule_id: &str, n: usize) -> OracleResult<FpWindow> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT * FROM fp_events
                 WHERE partition_key = ?1
                 ORDER BY sort_key DESC
                 LIMIT ?2",
            )
            .map_err(|e| OracleError::store("window_by_count", rule_id.to_string(), e))?;
        let events = stmt
            .query_map(
                params![format!("rule#{rule_id}"), n as i64],
                Self::row_to_event,
            )
            .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
            .map_err(|e| OracleError::store("window_by_count", rule_id.to_string(), e))?;
        Ok(FpWindow::compute(rule_id, events, n))
    }

    async fn window_by_since(
        &self,
        rule_id: &str,
        since: DateTime<Utc>,
    ) -> OracleResult<FpWindow> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT * FROM fp_events
                 WHERE partition_key = ?1 AND timestamp >= ?2
                 ORDER BY sort_key DESC",
            )
            .map_err(|e| OracleError::store("window_by_since", rule_id.to_string(), e))?;
        let events = stmt
            .query_map(
                params![format!("rule#{rule_id}"), ts(since)],
                Self::row_to_event,
            )
            .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
            .map_err(|e| OracleError::store("window_by_since", rule_id.to_string(), e))?;
        Ok(FpWindow::compute(rule_id, events, 0))
    }

    async fn events_for_rule(&self, rule_id: &str) -> OracleResult<Vec<FpEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM fp_events WHERE partition_key = ?1")
            .map_err(|e| OracleError::store("events_for_rule", rule_id.to_string(), e))?;
        stmt.query_map(params![format!("rule#{rule_id}")], Self::row_to_event)
            .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
            .map_err(|e| OracleError::store("events_for_rule", rule_id.to_string(), e))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> OracleResult<u64> {
        let conn = self.conn.lock();
        let removed = conn
            .execute(
                "DELETE FROM fp_events WHERE expires_at_epoch <= ?1",
                params![now.timestamp()],
            )
            .map_err(|e| OracleError::store("purge_expired", "fp_events", e))?;
        Ok(removed as u64)
    }
}

// =============================================================================
// CONSENT STORE
// =============================================================================

/// SQLite consent store sharing the schema above.
pub struct SqliteConsentStore {
    conn: Mutex<Connection>,
}

impl SqliteConsentStore {
    pub fn open(path: impl AsRef<Path>) -> OracleResult<Self> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(|e| OracleError::store("open", path.as_ref().display().to_string(), e))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| OracleError::store("init_schema", "consent_records", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn consent_type_str(t: ConsentType) -> &'static str {
    match t {
        ConsentType::Explicit => "explicit",
        ConsentType::Implicit => "implicit",
        ConsentType::None => "none",
    }
}

fn parse_consent_type(raw: &str) -> ConsentType {
    match raw {
        "explicit" => ConsentType::Explicit,
        "implicit" => ConsentType::Implicit,
        _ => ConsentType::None,
    }
}

#[async_trait]
impl ConsentStore for SqliteConsentStore {
    async fn latest_consent(&self, org_id: &str) -> OracleResult<Option<ConsentRecord>> {
        let conn = self.conn.lock();
        let result = conn.query_row(
            "SELECT granted_by, granted_at, expires_at, revoked_at, consent_type
             FROM consent_records WHERE org_id = ?1",
            params![org_id],
            |row| {
                let granted_at: String = row.get(1)?;
                let expires_at: String = row.get(2)?;
                let revoked_at: Option<String> = row.get(3)?;
                let consent_type: String = row.get(4)?;
                Ok(ConsentRecord {
                    org_id: org_id.to_string(),
                    granted_by: row.get(0)?,
                    granted_at: parse_ts(&granted_at),
                    expires_at: parse_ts(&expires_at),
                    revoked_at: revoked_at.map(|s| parse_ts(&s)),
                    consent_type: parse_consent_type(&consent_type),
                })
            },
        );
        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(OracleError::store("latest_consent", org_id.to_string(), e)),
        }
    }

    async fn record_consent(&self, record: &ConsentRecord) -> OracleResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO consent_records (org_id, granted_by, granted_at, expires_at, revoked_at, consent_type)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(org_id) DO UPDATE SET
                granted_by = excluded.granted_by,
                granted_at = excluded.granted_at,
                expires_at = excluded.expires_at,
                revoked_at = excluded.revoked_at,
                consent_type = excluded.consent_type",
            params![
                record.org_id,
                record.granted_by,
                ts(record.granted_at),
                ts(record.expires_at),
                record.revoked_at.map(ts),
                consent_type_str(record.consent_type),
            ],
        )
        .map_err(|e| OracleError::store("record_consent", record.org_id.clone(), e))?;
        Ok(())
    }

    async fn revoke_consent(&self, org_id: &str, now: DateTime<Utc>) -> OracleResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE consent_records SET revoked_at = ?2
             WHERE org_id = ?1 AND revoked_at IS NULL",
            params![org_id, ts(now)],
        )
        .map_err(|e| OracleError::store("revoke_consent", org_id.to_string(), e))?;
        Ok(())
    }
}
