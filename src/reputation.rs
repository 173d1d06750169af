//! Reputation Engine & Consistency Scorer
//!
//! Computes the contribution weight each organisation carries in the
//! calibration network: base reputation, a log-scaled stake multiplier, and
//! a consistency bonus earned by agreeing with past consensus. Slashing is
//! irreversible and zeroes everything.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

use crate::config::ReputationConfig;
use crate::error::{OracleError, OracleResult};
use crate::identity::IdentityStore;

/// Stake lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StakeStatus {
    Active,
    Slashed,
    Withdrawn,
}

impl StakeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Slashed => "slashed",
            Self::Withdrawn => "withdrawn",
        }
    }
}

/// Per-organisation reputation state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganizationReputation {
    pub org_id: String,
    /// In [0,1]. Forced to 0 while slashed.
    pub reputation_score: f64,
    /// In [0.5, 0.5 + max_consistency_bonus].
    pub consistency_score: f64,
    /// USD, integer.
    pub stake_pledge: u64,
    pub stake_status: StakeStatus,
    pub contribution_count: u64,
    pub flagged_count: u64,
    pub age_score: f64,
    pub volume_score: f64,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    /// Set when slashed; never cleared.
    pub slash_reason: Option<String>,
}

impl OrganizationReputation {
    /// Fresh record for an org entering the network.
    pub fn new(org_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            org_id: org_id.into(),
            reputation_score: 0.5,
            consistency_score: 0.5,
            stake_pledge: 0,
            stake_status: StakeStatus::Active,
            contribution_count: 0,
            flagged_count: 0,
            age_score: 0.0,
            volume_score: 0.0,
            created_at: now,
            last_updated: now,
            slash_reason: None,
        }
    }
}

/// One attested (org, rule) calibration sample. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContributionRecord {
    pub org_id: String,
    pub rule_id: String,
    pub contributed_fp_rate: f64,
    pub consensus_fp_rate: f64,
    pub event_count: u64,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of consistency scoring over a contribution series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyScore {
    pub score: f64,
    /// False when too few recent records existed; the score is neutral.
    pub has_minimum_data: bool,
    pub sample_count: usize,
    pub outlier_count: usize,
}

/// Reputation persistence.
#[async_trait]
pub trait ReputationStore: Send + Sync {
    async fn get_reputation(&self, org_id: &str) -> OracleResult<Option<OrganizationReputation>>;
    async fn put_reputation(&self, reputation: &OrganizationReputation) -> OracleResult<()>;
    async fn append_contribution(&self, record: &ContributionRecord) -> OracleResult<()>;
    async fn contributions_for_org(&self, org_id: &str) -> OracleResult<Vec<ContributionRecord>>;
}

// =============================================================================
// ENGINE
// =============================================================================

/// The reputation engine over its store and the identity store.
pub struct ReputationEngine {
    config: ReputationConfig,
    store: Arc<dyn ReputationStore>,
    identity_store: Arc<dyn IdentityStore>,
}

impl ReputationEngine {
    pub fn new(
        config: ReputationConfig,
        store: Arc<dyn ReputationStore>,
        identity_store: Arc<dyn IdentityStore>,
    ) -> Self {
        Self {
            config,
            store,
            identity_store,
        }
    }

    pub fn store(&self) -> &Arc<dyn ReputationStore> {
        &self.store
    }

    /// Contribution weight in [0,1]:
    /// `clamp(base × stake_multiplier + consistency_bonus, 0, 1)`.
    pub fn contribution_weight(&self, reputation: &OrganizationReputation) -> f64 {
        if reputation.stake_status == StakeStatus::Slashed {
            return 0.0;
        }

        let base = reputation.reputation_score;
        let stake_multiplier = self.stake_multiplier(reputation);
        let consistency_bonus = ((reputation.consistency_score - 0.5) * 2.0)
            .clamp(0.0, self.config.consistency_bonus_cap);

        (base * stake_multiplier + consistency_bonus).clamp(0.0, 1.0)
    }

    fn stake_multiplier(&self, reputation: &OrganizationReputation) -> f64 {
        match reputation.stake_status {
            StakeStatus::Active if reputation.stake_pledge > 0 => {
                let ratio = reputation.stake_pledge as f64 / self.config.min_stake.max(1) as f64;
                ratio.ln_1p().min(self.config.stake_multiplier_cap)
            }
            StakeStatus::Slashed => 0.0,
            _ => {
                if self.config.require_stake {
                    0.0
                } else {
                    1.0
                }
            }
        }
    }

    /// Weight for an org by id; absent orgs weigh nothing.
    pub async fn weight_for(&self, org_id: &str) -> OracleResult<f64> {
        Ok(self
            .store
            .get_reputation(org_id)
            .await?
            .map(|r| self.contribution_weight(&r))
            .unwrap_or(0.0))
    }

    /// Score a contributor's series against the consensus values recorded
    /// alongside each sample.
    pub fn consistency_score(
        &self,
        records: &[ContributionRecord],
        now: DateTime<Utc>,
    ) -> ConsistencyScore {
        let max_age = chrono::Duration::days(self.config.max_contribution_age_days);
        let recent: Vec<&ContributionRecord> = records
            .iter()
            .filter(|r| now - r.timestamp <= max_age)
            .collect();

        if recent.len() < self.config.min_contributions_required {
            return ConsistencyScore {
                score: 0.5,
                has_minimum_data: false,
                sample_count: recent.len(),
                outlier_count: 0,
            };
        }

        let deviations: Vec<f64> = recent
            .iter()
            .map(|r| (r.contributed_fp_rate - r.consensus_fp_rate).abs())
            .collect();
        let mean = deviations.as_slice().mean();
        let std_dev = deviations.as_slice().std_dev();

        let mut outlier_count = 0;
        let mut weighted_sum = 0.0;
        let mut weight_sum = 0.0;
        for (record, deviation) in recent.iter().zip(&deviations) {
            let z = if std_dev > 0.0 {
                (deviation - mean) / std_dev
            } else {
                0.0
            };
            if *deviation > self.config.outlier_threshold || z.abs() > 3.0 {
                outlier_count += 1;
            }
            let age_days = (now - record.timestamp).num_days().max(0) as f64;
            let weight = (-self.config.decay_rate * age_days).exp();
            weighted_sum += weight * deviation;
            weight_sum += weight;
        }

        let weighted_mean_deviation = if weight_sum > 0.0 {
            weighted_sum / weight_sum
        } else {
            0.0
        };
        let raw = 1.0 - weighted_mean_deviation;
        let bonus = (raw - 0.5).clamp(0.0, self.config.max_consistency_bonus);

        ConsistencyScore {
            score: 0.5 + bonus,
            has_minimum_data: true,
            sample_count: recent.len(),
            outlier_count,
        }
    }

    /// Recompute and persist the derived scores for an org.
    pub async fn refresh_scores(&self, org_id: &str, now: DateTime<Utc>) -> OracleResult<()> {
        let Some(mut reputation) = self.store.get_reputation(org_id).await? else {
            return Err(OracleError::NotFound {
                entity: "reputation",
                key: org_id.to_string(),
            });
        };
        if reputation.stake_status == StakeStatus::Slashed {
            // Slashing is terminal; scores stay zeroed.
            return Ok(());
        }

        let records = self.store.contributions_for_org(org_id).await?;
        let consistency = self.consistency_score(&records, now);

        let age_days = (now - reputation.created_at).num_days().max(0) as f64;
        reputation.age_score = (age_days / 365.0).min(1.0);
        reputation.volume_score =
            ((1.0 + reputation.contribution_count as f64).ln() / (101.0f64).ln()).min(1.0);
        reputation.consistency_score = consistency.score;
        reputation.flagged_count = consistency.outlier_count as u64;
        reputation.reputation_score = (0.3 * reputation.age_score
            + 0.3 * reputation.volume_score
            + 0.4 * consistency.score * 2.0)
            .clamp(0.0, 1.0);
        reputation.last_updated = now;

        self.store.put_reputation(&reputation).await
    }

    /// Record a new attested sample and bump the contribution counter.
    pub async fn record_contribution(
        &self,
        record: &ContributionRecord,
        now: DateTime<Utc>,
    ) -> OracleResult<()> {
        self.store.append_contribution(record).await?;
        let mut reputation = self
            .store
            .get_reputation(&record.org_id)
            .await?
            .unwrap_or_else(|| OrganizationReputation::new(&record.org_id, now));
        reputation.contribution_count += 1;
        reputation.last_updated = now;
        self.store.put_reputation(&reputation).await
    }

    /// Network participation gate.
    pub async fn can_participate(&self, org_id: &str) -> OracleResult<bool> {
        if self.identity_store.get_identity(org_id).await?.is_none() {
            return Ok(false);
        }
        let Some(reputation) = self.store.get_reputation(org_id).await? else {
            return Ok(false);
        };
        if reputation.stake_status == StakeStatus::Slashed {
            return Ok(false);
        }
        if reputation.reputation_score < self.config.minimum_reputation_score {
            return Ok(false);
        }
        if self.config.require_stake
            && reputation.stake_pledge < self.config.min_stake_for_participation
        {
            return Ok(false);
        }
        Ok(true)
    }

    /// Irreversible stake slash: score zeroed, org excluded from
    /// calibration.
    pub async fn slash_stake(
        &self,
        org_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> OracleResult<()> {
        let mut reputation = self
            .store
            .get_reputation(org_id)
            .await?
            .ok_or_else(|| OracleError::NotFound {
                entity: "reputation",
                key: org_id.to_string(),
            })?;
        reputation.stake_status = StakeStatus::Slashed;
        reputation.reputation_score = 0.0;
        reputation.slash_reason = Some(reason.to_string());
        reputation.last_updated = now;
        warn!(org_id, reason, "stake slashed");
        self.store.put_reputation(&reputation).await
    }
}

// =============================================================================
// IN-MEMORY STORE
// =============================================================================

/// In-memory reputation store.
#[derive(Default)]
pub struct InMemoryReputationStore {
    reputations: RwLock<HashMap<String, OrganizationReputation>>,
    contributions: RwLock<Vec<ContributionRecord>>,
}

impl InMemoryReputationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReputationStore for InMemoryReputationStore {
    async fn get_reputation(&self, org_id: &str) -> OracleResult<Option<OrganizationReputation>> {
        Ok(self.reputations.read().get(org_id).cloned())
    }

    async fn put_reputation(&self, reputation: &OrganizationReputation) -> OracleResult<()> {
        // A slashed record never leaves the slashed state.
        if let Some(existing) = self.reputations.read().get(&reputation.org_id) {
            if existing.stake_status == StakeStatus::Slashed
                && reputation.stake_status != StakeStatus::Slashed
            {
                return Err(OracleError::Config(format!(
                    "org {} is slashed; slashing is irreversible",
                    reputation.org_id
                )));
            }
        }
        self.reputations
            .write()
            .insert(reputation.org_id.clone(), reputation.clone());
        Ok(())
    }

    async fn append_contribution(&self, record: &ContributionRecord) -> OracleResult<()> {
        self.contributions.write().push(record.clone());
        Ok(())
    }

    async fn contributions_for_org(&self, org_id: &str) -> OracleResult<Vec<ContributionRecord>> {
        Ok(self
            .contributions
            .read()
            .iter()
            .filter(|r| r.org_id == org_id)
            .cloned()
            .collect())
    }
}

// =============================================================================
// SQLITE STORE
// =============================================================================

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS org_reputations (
    org_id TEXT PRIMARY KEY,
    reputation_score REAL NOT NULL,
    consistency_score REAL NOT NULL,
    stake_pledge INTEGER NOT NULL,
    stake_status TEXT NOT NULL,
    contribution_count INTEGER NOT NULL,
    flagged_count INTEGER NOT NULL,
    age_score REAL NOT NULL,
    volume_score REAL NOT NULL,
    created_at TEXT NOT NULL,
    last_updated TEXT NOT NULL,
    slash_reason TEXT
);

CREATE TABLE IF NOT EXISTS contribution_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    org_id TEXT NOT NULL,
    rule_id TEXT NOT NULL,
    contributed_fp_rate REAL NOT NULL,
    consensus_fp_rate REAL NOT NULL,
    event_count INTEGER NOT NULL,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_contribution_records_org
    ON contribution_records(org_id, timestamp);
"#;

/// SQLite reputation store.
pub struct SqliteReputationStore {
    conn: parking_lot::Mutex<Connection>,
}

impl SqliteReputationStore {
    pub fn open(path: impl AsRef<Path>) -> OracleResult<Self> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(|e| OracleError::store("open", path.as_ref().display().to_string(), e))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| OracleError::store("init_schema", "org_reputations", e))?;
        Ok(Self {
            conn: parking_lot::Mutex::new(conn),
        })
    }
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

fn parse_stake_status(raw: &str) -> StakeStatus {
    match raw {
        "active" => StakeStatus::Active,
        "slashed" => StakeStatus::Slashed,
        _ => StakeStatus::Withdrawn,
    }
}

#[async_trait]
impl ReputationStore for SqliteReputationStore {
    async fn get_reputation(&self, org_id: &str) -> OracleResult<Option<OrganizationReputation>> {
        let conn = self.conn.lock();
        let result = conn.query_row(
            "SELECT reputation_score, consistency_score, stake_pledge, stake_status,
                    contribution_count, flagged_count, age_score, volume_score,
                    created_at, last_updated, slash_reason
             FROM org_reputations WHERE org_id = ?1",
            params![org_id],
            |row| {
                let status: String = row.get(3)?;
                let created_at: String = row.get(8)?;
                let last_updated: String = row.get(9)?;
                Ok(OrganizationReputation {
                    org_id: org_id.to_string(),
                    reputation_score: row.get(0)?,
                    consistency_score: row.get(1)?,
                    stake_pledge: row.get::<_, i64>(2)? as u64,
                    stake_status: parse_stake_status(&status),
                    contribution_count: row.get::<_, i64>(4)? as u64,
                    flagged_count: row.get::<_, i64>(5)? as u64,
                    age_score: row.get(6)?,
                    volume_score: row.get(7)?,
                    created_at: parse_ts(&created_at),
                    last_updated: parse_ts(&last_updated),
                    slash_reason: row.get(10)?,
                })
            },
        );
        match result {
            Ok(reputation) => Ok(Some(reputation)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(OracleError::store("get_reputation", org_id.to_string(), e)),
        }
    }

    async fn put_reputation(&self, reputation: &OrganizationReputation) -> OracleResult<()> {
        let conn = self.conn.lock();
        let existing_status: Option<String> = conn
            .query_row(
                "SELECT stake_status FROM org_reputations WHERE org_id = ?1",
                params![reputation.org_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(OracleError::store(
                    "put_reputation",
                    reputation.org_id.clone(),
                    other,
                )),
            })?;
        if existing_status.as_deref() == Some("slashed")
            && reputation.stake_status != StakeStatus::Slashed
        {
            return Err(OracleError::Config(format!(
                "org {} is slashed; slashing is irreversible",
                reputation.org_id
            )));
        }

        conn.execute(
            "INSERT INTO org_reputations (
                org_id, reputation_score, consistency_score, stake_pledge, stake_status,
                contribution_count, flagged_count, age_score, volume_score,
                created_at, last_updated, slash_reason
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(org_id) DO UPDATE SET
                reputation_score = excluded.reputation_score,
                consistency_score = excluded.consistency_score,
                stake_pledge = excluded.stake_pledge,
                stake_status = excluded.stake_status,
                contribution_count = excluded.contribution_count,
                flagged_count = excluded.flagged_count,
                age_score = excluded.age_score,
                volume_score = excluded.volume_score,
                last_updated = excluded.last_updated,
                slash_reason = excluded.slash_reason",
            params![
                reputation.org_id,
                reputation.reputation_score,
                reputation.consistency_score,
                reputation.stake_pledge as i64,
                reputation.stake_status.as_str(),
                reputation.contribution_count as i64,
                reputation.flagged_count as i64,
                reputation.age_score,
                reputation.volume_score,
                reputation.created_at.to_rfc3339(),
                reputation.last_updated.to_rfc3339(),
                reputation.slash_reason,
            ],
        )
        .map_err(|e| OracleError::store("put_reputation", reputation.org_id.clone(), e))?;
        Ok(())
    }

    async fn append_contribution(&self, record: &ContributionRecord) -> OracleResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO contribution_records (org_id, rule_id, contributed_fp_rate, consensus_fp_rate, event_count, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.org_id,
                record.rule_id,
                record.contributed_fp_rate,
                record.consensus_fp_rate,
                record.event_count as i64,
                record.timestamp.to_rfc3339(),
            ],
        )
        .map_err(|e| OracleError::store("append_contribution", record.org_id.clone(), e))?;
        Ok(())
    }

    async fn contributions_for_org(&self, org_id: &str) -> OracleResult<Vec<ContributionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT rule_id, contributed_fp_rate, consensus_fp_rate, event_count, timestamp
                 FROM contribution_records WHERE org_id = ?1 ORDER BY timestamp ASC",
            )
            .map_err(|e| OracleError::store("contributions_for_org", org_id.to_string(), e))?;
        stmt.query_map(params![org_id], |row| {
            let timestamp: String = row.get(4)?;
            Ok(ContributionRecord {
                org_id: org_id.to_string(),
                rule_id: row.get(0)?,
                contributed_fp_rate: row.get(1)?,
                consensus_fp_rate: row.get(2)?,
                event_count: row.get::<_, i64>(3)? as u64,
                timestamp: parse_ts(&timestamp),
            })
        })
        .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
        .map_err(|e| OracleError::store("contributions_for_org", org_id.to_string(), e))
    }
}
