//! Nonce Binding Service
//!
//! Ties a verified organisational identity to exactly one active
//! cryptographic nonce. The nonce is the single-org credential carried on
//! every FP contribution; lookups recompute the binding signature every
//! time, so a tampered record can never validate.
//!
//! At any instant at most one non-revoked binding exists per org. Rotation
//! revokes the old binding and links the new one back through
//! `previous_nonce`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use super::IdentityStore;
use crate::canonical::{sha256_hex, PayloadBuilder};
use crate::error::{NonceFailure, OracleError, OracleResult};

/// Length of generated nonce material in bytes (hex-encoded on the wire).
pub const NONCE_BYTES: usize = 32;

/// One signed nonce-to-org association.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NonceBinding {
    /// The nonce itself, lowercase hex. Primary key.
    pub nonce: String,
    pub org_id: String,
    pub public_key: String,
    /// `hex(SHA256(nonce ‖ org_id ‖ public_key))`, recomputed on every
    /// lookup.
    pub signature: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub usage_count: u64,
    pub revoked: bool,
    pub revocation_reason: Option<String>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub previous_nonce: Option<String>,
}

/// Recompute the binding signature.
pub fn binding_signature(nonce: &str, org_id: &str, public_key: &str) -> String {
    let payload = PayloadBuilder::new()
        .text_field("nonce", nonce)
        .text_field("org_id", org_id)
        .text_field("public_key", public_key)
        .finish();
    sha256_hex(&payload)
}

/// Binding persistence. Partitioned by nonce with a secondary org index.
#[async_trait]
pub trait BindingStore: Send + Sync {
    async fn get_by_nonce(&self, nonce: &str) -> OracleResult<Option<NonceBinding>>;
    /// The non-revoked binding for an org, if one exists.
    async fn get_active_by_org(&self, org_id: &str) -> OracleResult<Option<NonceBinding>>;
    async fn put_binding(&self, binding: &NonceBinding) -> OracleResult<()>;
    /// All bindings for an org, oldest first.
    async fn history_by_org(&self, org_id: &str) -> OracleResult<Vec<NonceBinding>>;
    /// Atomic usage-count bump.
    async fn increment_usage(&self, nonce: &str) -> OracleResult<()>;
}

// =============================================================================
// SERVICE
// =============================================================================

/// The binding service over an identity store, a binding store, and an RNG.
///
/// The RNG sits behind a mutex so deterministic test RNGs can be injected;
/// production construction uses OS entropy.
pub struct NonceBindingService {
    identity_store: Arc<dyn IdentityStore>,
    binding_store: Arc<dyn BindingStore>,
    rng: Mutex<Box<dyn RngCore + Send>>,
}

impl NonceBindingService {
    pub fn new(
        identity_store: Arc<dyn IdentityStore>,
        binding_store: Arc<dyn BindingStore>,
    ) -> Self {
        Self::with_rng(
            identity_store,
            binding_store,
            Box::new(rand::rngs::OsRng),
        )
    }

    pub fn with_rng(
        identity_store: Arc<dyn IdentityStore>,
        binding_store: Arc<dyn BindingStore>,
        rng: Box<dyn RngCore + Send>,
    ) -> Self {
        Self {
            identity_store,
            binding_store,
            rng: Mutex::new(rng),
        }
    }

    fn fresh_nonce(&self) -> String {
        let mut bytes = [0u8; NONCE_BYTES];
        self.rng.lock().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Generate a nonce and bind it to a verified org. Rejects unverified
    /// orgs and orgs that already hold an active binding (rotate instead).
    pub async fn generate_and_bind(
        &self,
        org_id: &str,
        public_key: &str,
        now: DateTime<Utc>,
    ) -> OracleResult<NonceBinding> {
        self.bind_internal(org_id, public_key, None, now).await
    }

    async fn bind_internal(
        &self,
        org_id: &str,
        public_key: &str,
        previous_nonce: Option<String>,
        now: DateTime<Utc>,
    ) -> OracleResult<NonceBinding> {
        let mut identity = self
            .identity_store
            .get_identity(org_id)
            .await?
            .ok_or_else(|| OracleError::NotFound {
                entity: "verified identity",
                key: org_id.to_string(),
            })?;

        if previous_nonce.is_none() {
            if let Some(existing) = self.binding_store.get_active_by_org(org_id).await? {
                return Err(OracleError::Config(format!(
                    "org {org_id} already holds active nonce issued {}; rotate instead",
                    existing.issued_at.to_rfc3339()
                )));
            }
        }

        let nonce = self.fresh_nonce();
        let binding = NonceBinding {
            signature: binding_signature(&nonce, org_id, public_key),
            nonce: nonce.clone(),
            org_id: org_id.to_string(),
            public_key: public_key.to_string(),
            issued_at: now,
            expires_at: None,
            usage_count: 0,
            revoked: false,
            revocation_reason: None,
            revoked_at: None,
            previous_nonce,
        };
        self.binding_store.put_binding(&binding).await?;

        identity.unique_nonce = Some(nonce);
        identity.public_key = public_key.to_string();
        self.identity_store.put_identity(&identity).await?;

        info!(org_id, "nonce bound to organisation");
        Ok(binding)
    }

    /// Validate a nonce presented by a claimed org.
    pub async fn verify(&self, nonce: &str, claimed_org_id: &str) -> OracleResult<NonceBinding> {
        let binding = self
            .binding_store
            .get_by_nonce(nonce)
            .await?
            .ok_or(OracleError::NonceValidation(NonceFailure::UnknownNonce))?;

        if binding.revoked {
            return Err(OracleError::NonceValidation(NonceFailure::BindingRevoked {
                reason: binding
                    .revocation_reason
                    .clone()
                    .unwrap_or_else(|| "revoked".to_string()),
            }));
        }

        let expected = binding_signature(&binding.nonce, &binding.org_id, &binding.public_key);
        if expected != binding.signature {
            warn!(org_id = %binding.org_id, "binding signature does not recompute");
            return Err(OracleError::NonceValidation(NonceFailure::SignatureInvalid));
        }

        if binding.org_id != claimed_org_id {
            return Err(OracleError::NonceValidation(NonceFailure::OrgMismatch {
                claimed: claimed_org_id.to_string(),
            }));
        }

        Ok(binding)
    }

    /// Rotate the org's nonce: revoke the current binding, issue a new one
    /// linked back through `previous_nonce`.
    pub async fn rotate(
        &self,
        org_id: &str,
        new_public_key: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> OracleResult<NonceBinding> {
        let current = self
            .binding_store
            .get_active_by_org(org_id)
            .await?
            .ok_or_else(|| OracleError::NotFound {
                entity: "active nonce binding",
                key: org_id.to_string(),
            })?;

        let mut revoked = current.clone();
        revoked.revoked = true;
        revoked.revocation_reason = Some(reason.to_string());
        revoked.revoked_at = Some(now);
        self.binding_store.put_binding(&revoked).await?;

        self.bind_internal(org_id, new_public_key, Some(current.nonce), now)
            .await
    }

    /// Revoke the org's current binding. Idempotent on already-revoked.
    pub async fn revoke(
        &self,
        org_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> OracleResult<()> {
        let Some(current) = self.binding_store.get_active_by_org(org_id).await? else {
            return Ok(());
        };
        let mut revoked = current;
        revoked.revoked = true;
        revoked.revocation_reason = Some(reason.to_string());
        revoked.revoked_at = Some(now);
        self.binding_store.put_binding(&revoked).await?;

        if let Some(mut identity) = self.identity_store.get_identity(org_id).await? {
            identity.unique_nonce = None;
            self.identity_store.put_identity(&identity).await?;
        }
        info!(org_id, reason, "nonce binding revoked");
        Ok(())
    }

    /// Bump the usage counter after a successful submission.
    pub async fn increment_usage(&self, nonce: &str, org_id: &str) -> OracleResult<()> {
        // Verify first so a revoked or stolen nonce cannot accrue usage.
        self.verify(nonce, org_id).await?;
        self.binding_store.increment_usage(nonce).await
    }

    /// Chronological binding history, oldest first.
    pub async fn rotation_history(&self, org_id: &str) -> OracleResult<Vec<NonceBinding>> {
        self.binding_store.history_by_org(org_id).await
    }
}

// =============================================================================
// IN-MEMORY STORE
// =============================================================================

/// In-memory binding store.
#[derive(Default)]
pub struct InMemoryBindingStore {
    bindings: RwLock<HashMap<String, NonceBinding>>,
}

impl InMemoryBindingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BindingStore for InMemoryBindingStore {
    async fn get_by_nonce(&self, nonce: &str) -> OracleResult<Option<NonceBinding>> {
        Ok(self.bindings.read().get(nonce).cloned())
    }

    async fn get_active_by_org(&self, org_id: &str) -> OracleResult<Option<NonceBinding>> {
        Ok(self
            .bindings
            .read()
            .values()
            .find(|b| b.org_id == org_id && !b.revoked)
            .cloned())
    }

    async fn put_binding(&self, binding: &NonceBinding) -> OracleResult<()> {
        self.bindings
            .write()
            .insert(binding.nonce.clone(), binding.clone());
        Ok(())
    }

    async fn history_by_org(&self, org_id: &str) -> OracleResult<Vec<NonceBinding>> {
        let mut history: Vec<NonceBinding> = self
            .bindings
            .read()
            .values()
            .filter(|b| b.org_id == org_id)
            .cloned()
            .collect();
        history.sort_by_key(|b| b.issued_at);
        Ok(history)
    }

    async fn increment_usage(&self, nonce: &str) -> OracleResult<()> {
        let mut bindings = self.bindings.write();
        let binding = bindings.get_mut(nonce).ok_or(OracleError::NonceValidation(
            NonceFailure::UnknownNonce,
        ))?;
        binding.usage_count += 1;
        Ok(())
    }
}

// =============================================================================
// SQLITE STORE
// =============================================================================

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS nonce_bindings (
    nonce TEXT PRIMARY KEY,
    org_id TEXT NOT NULL,
    public_key TEXT NOT NULL,
    signature TEXT NOT NULL,
    issued_at TEXT NOT NULL,
    expires_at TEXT,
    usage_count INTEGER NOT NULL DEFAULT 0,
    revoked INTEGER NOT NULL DEFAULT 0,
    revocation_reason TEXT,
    revoked_at TEXT,
    previous_nonce TEXT
);

CREATE INDEX IF NOT EXISTS idx_nonce_bindings_org
    ON nonce_bindings(org_id, revoked);
"#;

/// SQLite binding store.
pub struct SqliteBindingStore {
    conn: Mutex<Connection>,
}

impl SqliteBindingStore {
    pub fn open(path: impl AsRef<Path>) -> OracleResult<Self> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(|e| OracleError::store("open", path.as_ref().display().to_string(), e))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| OracleError::store("init_schema", "nonce_bindings", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn row_to_binding(row: &rusqlite::Row<'_>) -> rusqlite::Result<NonceBinding> {
        let issued_at: String = row.get("issued_at")?;
        let expires_at: Option<String> = row.get("expires_at")?;
        let revoked_at: Option<String> = row.get("revoked_at")?;
        Ok(NonceBinding {
            nonce: row.get("nonce")?,
            org_id: row.get("org_id")?,
            public_key: row.get("public_key")?,
            signature: row.get("signature")?,
            issued_at: parse_ts(&issued_at),
            expires_at: expires_at.map(|s| parse_ts(&s)),
            usage_count: row.get::<_, i64>("usage_count")? as u64,
            revoked: row.get::<_, i64>("revoked")? != 0,
            revocation_reason: row.get("revocation_reason")?,
            revoked_at: revoked_at.map(|s| parse_ts(&s)),
            previous_nonce: row.get("previous_nonce")?,
        })
    }
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

#[async_trait]
impl BindingStore for SqliteBindingStore {
    async fn get_by_nonce(&self, nonce: &str) -> OracleResult<Option<NonceBinding>> {
        let conn = self.conn.lock();
        let result = conn.query_row(
            "SELECT * FROM nonce_bindings WHERE nonce = ?1",
            params![nonce],
            Self::row_to_binding,
        );
        match result {
            Ok(binding) => Ok(Some(binding)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(OracleError::store("get_by_nonce", "nonce", e)),
        }
    }

    async fn get_active_by_org(&self, org_id: &str) -> OracleResult<Option<NonceBinding>> {
        let conn = self.conn.lock();
        let result = conn.query_row(
            "SELECT * FROM nonce_bindings WHERE org_id = ?1 AND revoked = 0",
            params![org_id],
            Self::row_to_binding,
        );
        match result {
            Ok(binding) => Ok(Some(binding)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(OracleError::store("get_active_by_org", org_id.to_string(), e)),
        }
    }

    async fn put_binding(&self, binding: &NonceBinding) -> OracleResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO nonce_bindings (
                nonce, org_id, public_key, signature, issued_at, expires_at,
                usage_count, revoked, revocation_reason, revoked_at, previous_nonce
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(nonce) DO UPDATE SET
                public_key = excluded.public_key,
                signature = excluded.signature,
                usage_count = excluded.usage_count,
                revoked = excluded.revoked,
                revocation_reason = excluded.revocation_reason,
                revoked_at = excluded.revoked_at,
                previous_nonce = excluded.previous_nonce",
            params![
                binding.nonce,
                binding.org_id,
                binding.public_key,
                binding.signature,
                binding.issued_at.to_rfc3339(),
                binding.expires_at.map(|t| t.to_rfc3339()),
                binding.usage_count as i64,
                binding.revoked as i64,
                binding.revocation_reason,
                binding.revoked_at.map(|t| t.to_rfc3339()),
                binding.previous_nonce,
            ],
        )
        .map_err(|e| OracleError::store("put_binding", binding.org_id.clone(), e))?;
        Ok(())
    }

    async fn history_by_org(&self, org_id: &str) -> OracleResult<Vec<NonceBinding>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM nonce_bindings WHERE org_id = ?1 ORDER BY issued_at ASC")
            .map_err(|e| OracleError::store("history_by_org", org_id.to_string(), e))?;
        stmt.query_map(params![org_id], Self::row_to_binding)
            .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
            .map_err(|e| OracleError::store("history_by_org", org_id.to_string(), e))
    }

    async fn increment_usage(&self, nonce: &str) -> OracleResult<()> {
        let conn = self.conn.lock();
        let updated = conn
            .execute(
                "UPDATE nonce_bindings SET usage_count = usage_count + 1 WHERE nonce = ?1",
                params![nonce],
            )
            .map_err(|e| OracleError::store("increment_usage", "nonce", e))?;
        if updated == 0 {
            return Err(OracleError::NonceValidation(NonceFailure::UnknownNonce));
        }
        Ok(())
    }
}
