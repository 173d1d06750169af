//! Time-Bucketed Block Counter
//!
//! Counts BLOCK outcomes per `(rule_id, org_repo_hash, hour)` bucket. The
//! circuit breaker sums recent buckets; TTL eviction (24 h default) means
//! the counter self-heals without any compaction job.
//!
//! Increments are atomic adds; reads never read-modify-write.

use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Utc};
use parking_lot::RwLock;
use rusqlite::{params, Connection, OpenFlags};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{OracleError, OracleResult};

/// Floor a timestamp to its hour bucket.
pub fn hour_bucket(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(Duration::hours(1)).expect("hour trunc")
}

/// Rendered composite key: `{rule_id}#{org_repo_hash}#{YYYY-MM-DD-HH}`.
pub fn bucket_key(rule_id: &str, org_repo_hash: &str, hour: DateTime<Utc>) -> String {
    format!(
        "{rule_id}#{org_repo_hash}#{}",
        hour.format("%Y-%m-%d-%H")
    )
}

/// The block counter capability.
#[async_trait]
pub trait BlockCounterStore: Send + Sync {
    /// Atomic add of 1 to the current hour bucket; sets the TTL on first
    /// write.
    async fn increment(
        &self,
        rule_id: &str,
        org_repo_hash: &str,
        now: DateTime<Utc>,
    ) -> OracleResult<()>;

    /// Count in the bucket containing `at`.
    async fn get_count(
        &self,
        rule_id: &str,
        org_repo_hash: &str,
        at: DateTime<Utc>,
    ) -> OracleResult<u64>;

    /// Sum over the `hours` consecutive buckets ending at `now`'s bucket.
    async fn sum_last_n(
        &self,
        rule_id: &str,
        org_repo_hash: &str,
        hours: u32,
        now: DateTime<Utc>,
    ) -> OracleResult<u64>;
}

// =============================================================================
// IN-MEMORY COUNTER
// =============================================================================

struct Bucket {
    count: u64,
    expires_at: DateTime<Utc>,
}

/// In-memory counter for `local` mode and tests.
pub struct InMemoryBlockCounter {
    ttl_hours: u32,
    buckets: RwLock<HashMap<String, Bucket>>,
}

impl InMemoryBlockCounter {
    pub fn new(ttl_hours: u32) -> Self {
        Self {
            ttl_hours,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    fn evict_expired(&self, now: DateTime<Utc>) {
        let mut buckets = self.buckets.write();
        buckets.retain(|_, b| b.expires_at > now);
    }
}

#[async_trait]
impl BlockCounterStore for InMemoryBlockCounter {
    async fn increment(
        &self,
        rule_id: &str,
        org_repo_hash: &str,
        now: DateTime<Utc>,
    ) -> OracleResult<()> {
        self.evict_expired(now);
        let key = bucket_key(rule_id, org_repo_hash, hour_bucket(now));
        let mut buckets = self.buckets.write();
        let bucket = buckets.entry(key).or_insert_with(|| Bucket {
            count: 0,
            expires_at: now + Duration::hours(self.ttl_hours as i64),
        });
        bucket.count += 1;
        Ok(())
    }

    async fn get_count(
        &self,
        rule_id: &str,
        org_repo_hash: &str,
        at: DateTime<Utc>,
    ) -> OracleResult<u64> {
        let key = bucket_key(rule_id, org_repo_hash, hour_bucket(at));
        Ok(self.buckets.read().get(&key).map(|b| b.count).unwrap_or(0))
    }

    async fn sum_last_n(
        &self,
        rule_id: &str,
        org_repo_hash: &str,
        hours: u32,
        now: DateTime<Utc>,
    ) -> OracleResult<u64> {
        let buckets = self.buckets.read();
        let mut sum = 0u64;
        let newest = hour_bucket(now);
        for offset in 0..hours {
            let hour = newest - Duration::hours(offset as i64);
            let key = bucket_key(rule_id, org_repo_hash, hour);
            sum += buckets.get(&key).map(|b| b.count).unwrap_or(0);
        }
        Ok(sum)
    }
}

// =============================================================================
// SQLITE COUNTER
// =============================================================================

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS block_buckets (
    bucket_key TEXT PRIMARY KEY,
    rule_id TEXT NOT NULL,
    org_repo_hash TEXT NOT NULL,
    hour_stamp TEXT NOT NULL,
    count INTEGER NOT NULL DEFAULT 0,
    expires_at_epoch INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_block_buckets_expiry
    ON block_buckets(expires_at_epoch);
"#;

/// SQLite-backed counter. The upsert is a single atomic statement.
pub struct SqliteBlockCounter {
    ttl_hours: u32,
    conn: parking_lot::Mutex<Connection>,
}

impl SqliteBlockCounter {
    pub fn open(path: impl AsRef<Path>, ttl_hours: u32) -> OracleResult<Self> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(|e| OracleError::store("open", path.as_ref().display().to_string(), e))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| OracleError::store("init_schema", "block_buckets", e))?;
        Ok(Self {
            ttl_hours,
            conn: parking_lot::Mutex::new(conn),
        })
    }
}

#[async_trait]
impl BlockCounterStore for SqliteBlockCounter {
    async fn increment(
        &self,
        rule_id: &str,
        org_repo_hash: &str,
        now: DateTime<Utc>,
    ) -> OracleResult<()> {
        let hour = hour_bucket(now);
        let key = bucket_key(rule_id, org_repo_hash, hour);
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM block_buckets WHERE expires_at_epoch <= ?1",
            params![now.timestamp()],
        )
        .map_err(|e| OracleError::store("increment", key.clone(), e))?;
        conn.execute(
            "INSERT INTO block_buckets (bucket_key, rule_id, org_repo_hash, hour_stamp, count, expires_at_epoch)
             VALUES (?1, ?2, ?3, ?4, 1, ?5)
             ON CONFLICT(bucket_key) DO UPDATE SET count = count + 1",
            params![
                key,
                rule_id,
                org_repo_hash,
                hour.format("%Y-%m-%d-%H").to_string(),
                (now + Duration::hours(self.ttl_hours as i64)).timestamp(),
            ],
        )
        .map_err(|e| OracleError::store("increment", key.clone(), e))?;
        Ok(())
    }

    async fn get_count(
        &self,
        rule_id: &str,
        org_repo_hash: &str,
        at: DateTime<Utc>,
    ) -> OracleResult<u64> {
        let key = bucket_key(rule_id, org_repo_hash, hour_bucket(at));
        let conn = self.conn.lock();
        let result = conn.query_row(
            "SELECT count FROM block_buckets WHERE bucket_key = ?1",
            params![key],
            |row| row.get::<_, i64>(0),
        );
        match result {
            Ok(count) => Ok(count as u64),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
            Err(e) => Err(OracleError::store("get_count", key, e)),
        }
    }

    async fn sum_last_n(
        &self,
        rule_id: &str,
        org_repo_hash: &str,
        hours: u32,
        now: DateTime<Utc>,
    ) -> OracleResult<u64> {
        let newest = hour_bucket(now);
        let oldest = newest - Duration::hours(hours.saturating_sub(1) as i64);
        let conn = self.conn.lock();
        let sum: i64 = conn
            .query_row(
                "SELECT COALESCE(SUM(count), 0) FROM block_buckets
                 WHERE rule_id = ?1 AND org_repo_hash = ?2
                   AND hour_stamp >= ?3 AND hour_stamp <= ?4",
                params![
                    rule_id,
                    org_repo_hash,
                    oldest.format("%Y-%m-%d-%H").to_string(),
                    newest.format("%Y-%m-%d-%H").to_string(),
                ],
                |row| row.get(0),
            )
            .map_err(|e| OracleError::store("sum_last_n", rule_id.to_string(), e))?;
        Ok(sum as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 14, 35, 0).unwrap()
    }

    #[test]
    fn test_bucket_key_rendering() {
        let hour = hour_bucket(fixed_now());
        assert_eq!(
            bucket_key("MD-001", "abc123", hour),
            "MD-001#abc123#2024-06-15-14"
        );
    }

    #[tokio::test]
    async fn test_memory_increment_and_sum() {
        let counter = InMemoryBlockCounter::new(24);
        let now = fixed_now();

        for _ in 0..3 {
            counter.increment("MD-001", "h1", now).await.unwrap();
        }
        counter
            .increment("MD-001", "h1", now - Duration::hours(2))
            .await
            .unwrap();
        // A different hash does not leak in.
        counter.increment("MD-001", "h2", now).await.unwrap();

        assert_eq!(counter.get_count("MD-001", "h1", now).await.unwrap(), 3);
        assert_eq!(
            counter.sum_last_n("MD-001", "h1", 1, now).await.unwrap(),
            3
        );
        assert_eq!(
            counter.sum_last_n("MD-001", "h1", 3, now).await.unwrap(),
            4
        );
        assert_eq!(
            counter.sum_last_n("MD-001", "h1", 24, now).await.unwrap(),
            4
        );
    }

    #[tokio::test]
    async fn test_memory_ttl_eviction() {
        let counter = InMemoryBlockCounter::new(24);
        let now = fixed_now();
        counter.increment("MD-001", "h1", now).await.unwrap();

        // 25 hours later the bucket has expired; the next increment evicts.
        let later = now + Duration::hours(25);
        counter.increment("MD-001", "h1", later).await.unwrap();
        assert_eq!(counter.get_count("MD-001", "h1", now).await.unwrap(), 0);
        assert_eq!(counter.get_count("MD-001", "h1", later).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sqlite_counter_matches_memory_semantics() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let counter = SqliteBlockCounter::open(file.path(), 24).unwrap();
        let now = fixed_now();

        for _ in 0..5 {
            counter.increment("MD-001", "h1", now).await.unwrap();
        }
        counter
            .increment("MD-001", "h1", now - Duration::hours(3))
            .await
            .unwrap();
        counter.increment("MD-002", "h1", now).await.unwrap();

        assert_eq!(counter.get_count("MD-001", "h1", now).await.unwrap(), 5);
        assert_eq!(
            counter.sum_last_n("MD-001", "h1", 4, now).await.unwrap(),
            6
        );
        assert_eq!(
            counter.sum_last_n("MD-001", "h1", 2, now).await.unwrap(),
            5
        );
        assert_eq!(
            counter.sum_last_n("MD-002", "h1", 24, now).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_sqlite_ttl_eviction_on_write() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let counter = SqliteBlockCounter::open(file.path(), 24).unwrap();
        let now = fixed_now();
        counter.increment("MD-001", "h1", now).await.unwrap();

        let later = now + Duration::hours(30);
        counter.increment("MD-001", "h1", later).await.unwrap();
        assert_eq!(counter.get_count("MD-001", "h1", now).await.unwrap(), 0);
    }
}
