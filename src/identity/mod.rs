//! Organisational Identity
//!
//! A verified organisation is the unit of trust in the calibration network.
//! Identities are created only by the verification service and carry the
//! current nonce binding; administrative revocation destroys them.

pub mod nonce_binding;
pub mod verifier;

pub use nonce_binding::{
    BindingStore, InMemoryBindingStore, NonceBinding, NonceBindingService, SqliteBindingStore,
};
pub use verifier::{
    GitHubOrgProfile, GitHubOrgVerifier, IdentityVerifier, StaticGitHubVerifier,
    StaticStripeVerifier, StripeCustomerProfile, StripeCustomerVerifier, VerificationMetadata,
    VerificationResult,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{OracleError, OracleResult};

/// How an organisation proved who it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMethod {
    GithubOrg,
    StripeCustomer,
    Manual,
}

impl VerificationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GithubOrg => "github_org",
            Self::StripeCustomer => "stripe_customer",
            Self::Manual => "manual",
        }
    }
}

impl std::str::FromStr for VerificationMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "github_org" => Ok(Self::GithubOrg),
            "stripe_customer" => Ok(Self::StripeCustomer),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown verification method '{other}'")),
        }
    }
}

/// A verified organisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganizationIdentity {
    pub org_id: String,
    pub public_key: String,
    pub verification_method: VerificationMethod,
    pub verified_at: DateTime<Utc>,
    /// The currently bound nonce, once one has been generated.
    pub unique_nonce: Option<String>,
}

/// Identity persistence.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn get_identity(&self, org_id: &str) -> OracleResult<Option<OrganizationIdentity>>;
    async fn put_identity(&self, identity: &OrganizationIdentity) -> OracleResult<()>;
    /// Administrative removal; idempotent.
    async fn delete_identity(&self, org_id: &str) -> OracleResult<()>;
}

/// In-memory identity store.
#[derive(Default)]
pub struct InMemoryIdentityStore {
    identities: RwLock<HashMap<String, OrganizationIdentity>>,
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdentityStore for InMemoryIdentityStore {
    async fn get_identity(&self, org_id: &str) -> OracleResult<Option<OrganizationIdentity>> {
        Ok(self.identities.read().get(org_id).cloned())
    }

    async fn put_identity(&self, identity: &OrganizationIdentity) -> OracleResult<()> {
        self.identities
            .write()
            .insert(identity.org_id.clone(), identity.clone());
        Ok(())
    }

    async fn delete_identity(&self, org_id: &str) -> OracleResult<()> {
        self.identities.write().remove(org_id);
        Ok(())
    }
}

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS org_identities (
    org_id TEXT PRIMARY KEY,
    public_key TEXT NOT NULL,
    verification_method TEXT NOT NULL,
    verified_at TEXT NOT NULL,
    unique_nonce TEXT
);
"#;

/// SQLite identity store.
pub struct SqliteIdentityStore {
    conn: parking_lot::Mutex<Connection>,
}

impl SqliteIdentityStore {
    pub fn open(path: impl AsRef<Path>) -> OracleResult<Self> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(|e| OracleError::store("open", path.as_ref().display().to_string(), e))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| OracleError::store("init_schema", "org_identities", e))?;
        Ok(Self {
            conn: parking_lot::Mutex::new(conn),
        })
    }
}

#[async_trait]
impl IdentityStore for SqliteIdentityStore {
    async fn get_identity(&self, org_id: &str) -> OracleResult<Option<OrganizationIdentity>> {
        let conn = self.conn.lock();
        let result = conn.query_row(
            "SELECT public_key, verification_method, verified_at, unique_nonce
             FROM org_identities WHERE org_id = ?1",
            params![org_id],
            |row| {
                let method: String = row.get(1)?;
                let verified_at: String = row.get(2)?;
                Ok(OrganizationIdentity {
                    org_id: org_id.to_string(),
                    public_key: row.get(0)?,
                    verification_method: method
                        .parse()
                        .unwrap_or(VerificationMethod::Manual),
                    verified_at: DateTime::parse_from_rfc3339(&verified_at)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_default(),
                    unique_nonce: row.get(3)?,
                })
            },
        );
        match result {
            Ok(identity) => Ok(Some(identity)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(OracleError::store("get_identity", org_id.to_string(), e)),
        }
    }

    async fn put_identity(&self, identity: &OrganizationIdentity) -> OracleResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO org_identities (org_id, public_key, verification_method, verified_at, unique_nonce)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(org_id) DO UPDATE SET
                public_key = excluded.public_key,
                verification_method = excluded.verification_method,
                verified_at = excluded.verified_at,
                unique_nonce = excluded.unique_nonce",
            params![
                identity.org_id,
                identity.public_key,
                identity.verification_method.as_str(),
                identity.verified_at.to_rfc3339(),
                identity.unique_nonce,
            ],
        )
        .map_err(|e| OracleError::store("put_identity", identity.org_id.clone(), e))?;
        Ok(())
    }

    async fn delete_identity(&self, org_id: &str) -> OracleResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM org_identities WHERE org_id = ?1",
            params![org_id],
        )
        .map_err(|e| OracleError::store("delete_identity", org_id.to_string(), e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_identity_round_trip_memory_and_sqlite() {
        let identity = OrganizationIdentity {
            org_id: "acme".to_string(),
            public_key: "pk-A".to_string(),
            verification_method: VerificationMethod::GithubOrg,
            verified_at: Utc::now(),
            unique_nonce: None,
        };

        let memory = InMemoryIdentityStore::new();
        memory.put_identity(&identity).await.unwrap();
        assert_eq!(
            memory.get_identity("acme").await.unwrap().unwrap().public_key,
            "pk-A"
        );
        memory.delete_identity("acme").await.unwrap();
        assert!(memory.get_identity("acme").await.unwrap().is_none());

        let file = tempfile::NamedTempFile::new().unwrap();
        let sqlite = SqliteIdentityStore::open(file.path()).unwrap();
        sqlite.put_identity(&identity).await.unwrap();
        let loaded = sqlite.get_identity("acme").await.unwrap().unwrap();
        assert_eq!(loaded.verification_method, VerificationMethod::GithubOrg);
        sqlite.delete_identity("acme").await.unwrap();
        assert!(sqlite.get_identity("acme").await.unwrap().is_none());
        // Idempotent delete.
        sqlite.delete_identity("acme").await.unwrap();
    }

    #[test]
    fn test_method_parse_round_trip() {
        for method in [
            VerificationMethod::GithubOrg,
            VerificationMethod::StripeCustomer,
            VerificationMethod::Manual,
        ] {
            assert_eq!(method.as_str().parse::<VerificationMethod>(), Ok(method));
        }
    }
}
