//! Versioned Nonce Cache
//!
//! Lifecycle state machine per nonce version:
//!
//! ```text
//! Missing ──load──▶ Active ──successor──▶ Grace ──expiry──▶ Evicted
//! ```
//!
//! The secret store holds a pointer secret `{prefix}current` naming the
//! active version, and one secret per version at `{prefix}{version}` holding
//! base64 nonce material (>= 32 bytes decoded). Production of new MACs
//! always uses the current version; verification accepts current or grace.
//!
//! Load failures fail closed unless a cached current entry is still within
//! its TTL, in which case the cache enters degraded mode and keeps serving
//! the cached key while a metric records the fallback.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::RedactionConfig;
use crate::error::{NonceFailure, OracleError, OracleResult};
use crate::secrets::SecretStore;

/// Minimum decoded nonce length.
pub const MIN_NONCE_BYTES: usize = 32;

/// Externally observable state of one nonce version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceStatus {
    /// Loaded and current; signs new redactions and verifies.
    Active,
    /// Superseded but inside the grace window; verifies only.
    Grace,
    /// Grace expired; verification fails.
    Evicted,
    /// Never seen by this cache.
    Missing,
}

#[derive(Debug, Clone)]
enum EntryState {
    Active { loaded_at: DateTime<Utc> },
    Grace { until: DateTime<Utc> },
    Evicted,
}

#[derive(Clone)]
struct NonceEntry {
    version: String,
    key: Vec<u8>,
    state: EntryState,
}

struct CacheInner {
    current_version: Option<String>,
    entries: HashMap<String, NonceEntry>,
    /// Set when a load failure was absorbed by a still-valid cached entry.
    degraded: bool,
}

/// Shared nonce cache. Many verifications read in parallel; loads and
/// rotations take the write guard and complete before readers observe the
/// new version.
pub struct NonceCache {
    store: Arc<dyn SecretStore>,
    config: RedactionConfig,
    inner: RwLock<CacheInner>,
}

impl NonceCache {
    pub fn new(store: Arc<dyn SecretStore>, config: RedactionConfig) -> Self {
        Self {
            store,
            config,
            inner: RwLock::new(CacheInner {
                current_version: None,
                entries: HashMap::new(),
                degraded: false,
            }),
        }
    }

    fn pointer_name(&self) -> String {
        format!("{}current", self.config.nonce_prefix)
    }

    fn version_name(&self, version: &str) -> String {
        format!("{}{}", self.config.nonce_prefix, version)
    }

    fn ttl(&self) -> Duration {
        Duration::seconds(self.config.nonce_ttl_secs as i64)
    }

    fn grace(&self) -> Duration {
        Duration::seconds(self.config.nonce_grace_window_secs as i64)
    }

    /// Whether the last refresh fell back to a cached key.
    pub fn is_degraded(&self) -> bool {
        self.inner.read().degraded
    }

    /// Key for producing new MACs: the current version's material.
    ///
    /// Refreshes from the secret store when there is no current entry or the
    /// cached one has outlived its TTL.
    pub async fn current_key(&self, now: DateTime<Utc>) -> OracleResult<(String, Vec<u8>)> {
        if let Some(hit) = self.fresh_current(now) {
            return Ok(hit);
        }
        self.refresh(now).await?;
        self.fresh_current(now).ok_or_else(|| {
            OracleError::NonceValidation(NonceFailure::UnknownNonce)
        })
    }

    fn fresh_current(&self, now: DateTime<Utc>) -> Option<(String, Vec<u8>)> {
        let inner = self.inner.read();
        let version = inner.current_version.as_ref()?;
        let entry = inner.entries.get(version)?;
        match entry.state {
            EntryState::Active { loaded_at } if now - loaded_at < self.ttl() => {
                Some((entry.version.clone(), entry.key.clone()))
            }
            _ => None,
        }
    }

    /// Key for verifying a MAC carried by `version`. Succeeds while the
    /// version is Active or within grace; fails with `VersionEvicted` after.
    pub async fn verification_key(
        &self,
        version: &str,
        now: DateTime<Utc>,
    ) -> OracleResult<Vec<u8>> {
        self.expire_grace(now);
        {
            let inner = self.inner.read();
            if let Some(entry) = inner.entries.get(version) {
                return match entry.state {
                    EntryState::Active { .. } | EntryState::Grace { .. } => Ok(entry.key.clone()),
                    EntryState::Evicted => Err(OracleError::NonceValidation(
                        NonceFailure::VersionEvicted {
                            nonce_version: version.to_string(),
                        },
                    )),
                };
            }
        }
        // Unknown version: it may simply predate this process. One lazy load
        // attempt; a miss in the secret store means the version is gone.
        match self.load_version(version).await {
            Ok(key) => {
                let mut inner = self.inner.write();
                let is_current = inner.current_version.as_deref() == Some(version);
                let state = if is_current {
                    EntryState::Active { loaded_at: now }
                } else {
                    EntryState::Grace {
                        until: now + self.grace(),
                    }
                };
                inner.entries.insert(
                    version.to_string(),
                    NonceEntry {
                        version: version.to_string(),
                        key: key.clone(),
                        state,
                    },
                );
                Ok(key)
            }
            Err(OracleError::NotFound { .. }) => Err(OracleError::NonceValidation(
                NonceFailure::VersionEvicted {
                    nonce_version: version.to_string(),
                },
            )),
            Err(e) => Err(e),
        }
    }

    /// Observable status of a version.
    pub fn status(&self, version: &str, now: DateTime<Utc>) -> NonceStatus {
        self.expire_grace(now);
        let inner = self.inner.read();
        match inner.entries.get(version).map(|e| &e.state) {
            Some(EntryState::Active { .. }) => NonceStatus::Active,
            Some(EntryState::Grace { .. }) => NonceStatus::Grace,
            Some(EntryState::Evicted) => NonceStatus::Evicted,
            None => NonceStatus::Missing,
        }
    }

    /// Re-read the pointer secret and rotate if a successor appeared.
    pub async fn refresh(&self, now: DateTime<Utc>) -> OracleResult<()> {
        let pointer = match self.store.get_secret(&self.pointer_name()).await {
            Ok(secret) => secret.expose().trim().to_string(),
            Err(e) => return self.absorb_load_failure(now, e),
        };

        let already_current = {
            let inner = self.inner.read();
            inner.current_version.as_deref() == Some(pointer.as_str())
                && inner.entries.contains_key(pointer.as_str())
        };
        if already_current {
            // Pointer unchanged; renew the TTL on the existing entry.
            let mut inner = self.inner.write();
            if let Some(entry) = inner.entries.get_mut(pointer.as_str()) {
                entry.state = EntryState::Active { loaded_at: now };
            }
            inner.degraded = false;
            return Ok(());
        }

        let key = match self.load_version(&pointer).await {
            Ok(key) => key,
            Err(e) => return self.absorb_load_failure(now, e),
        };

        let mut inner = self.inner.write();
        if let Some(previous) = inner.current_version.take() {
            if previous != pointer {
                if let Some(entry) = inner.entries.get_mut(&previous) {
                    entry.state = EntryState::Grace {
                        until: now + self.grace(),
                    };
                    debug!(version = %previous, "nonce version entered grace window");
                }
            }
        }
        inner.entries.insert(
            pointer.clone(),
            NonceEntry {
                version: pointer.clone(),
                key,
                state: EntryState::Active { loaded_at: now },
            },
        );
        inner.current_version = Some(pointer);
        inner.degraded = false;
        Ok(())
    }

    fn absorb_load_failure(&self, now: DateTime<Utc>, cause: OracleError) -> OracleResult<()> {
        let mut inner = self.inner.write();
        let has_fresh_cached = inner
            .current_version
            .as_ref()
            .and_then(|v| inner.entries.get(v))
            .map(|entry| match entry.state {
                EntryState::Active { loaded_at } => now - loaded_at < self.ttl(),
                _ => false,
            })
            .unwrap_or(false);

        if has_fresh_cached {
            inner.degraded = true;
            metrics::counter!("oracle_nonce_cache_degraded_total", 1);
            warn!(%cause, "nonce load failed; serving cached key in degraded mode");
            Ok(())
        } else {
            Err(cause)
        }
    }

    async fn load_version(&self, version: &str) -> OracleResult<Vec<u8>> {
        let secret = self.store.get_secret(&self.version_name(version)).await?;
        let key = secret.decode_base64()?;
        if key.len() < MIN_NONCE_BYTES {
            return Err(OracleError::Config(format!(
                "nonce version {version} decodes to {} bytes, minimum is {MIN_NONCE_BYTES}",
                key.len()
            )));
        }
        Ok(key)
    }

    fn expire_grace(&self, now: DateTime<Utc>) {
        let needs_expiry = {
            let inner = self.inner.read();
            inner.entries.values().any(|e| match e.state {
                EntryState::Grace { until } => now >= until,
                _ => false,
            })
        };
        if !needs_expiry {
            return;
        }
        let mut inner = self.inner.write();
        for entry in inner.entries.values_mut() {
            if let EntryState::Grace { until } = entry.state {
                if now >= until {
                    debug!(version = %entry.version, "nonce version evicted");
                    entry.state = EntryState::Evicted;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::InMemorySecretStore;
    use base64::Engine;

    fn encoded_key(seed: u8) -> String {
        base64::engine::general_purpose::STANDARD.encode([seed; 32])
    }

    fn cache_with_versions(versions: &[(&str, u8)], current: &str) -> (NonceCache, Arc<InMemorySecretStore>) {
        let store = Arc::new(InMemorySecretStore::new());
        for (version, seed) in versions {
            store.insert(format!("oracle/redaction-nonce/{version}"), encoded_key(*seed));
        }
        store.insert("oracle/redaction-nonce/current", current);
        let cache = NonceCache::new(store.clone(), RedactionConfig::default());
        (cache, store)
    }

    #[tokio::test]
    async fn test_lazy_load_and_current_key() {
        let (cache, _store) = cache_with_versions(&[("v1", 1)], "v1");
        let now = Utc::now();
        let (version, key) = cache.current_key(now).await.unwrap();
        assert_eq!(version, "v1");
        assert_eq!(key, vec![1u8; 32]);
        assert_eq!(cache.status("v1", now), NonceStatus::Active);
    }

    #[tokio::test]
    async fn test_rotation_moves_predecessor_to_grace() {
        let (cache, store) = cache_with_versions(&[("v1", 1), ("v2", 2)], "v1");
        let now = Utc::now();
        cache.current_key(now).await.unwrap();

        store.insert("oracle/redaction-nonce/current", "v2");
        cache.refresh(now).await.unwrap();

        assert_eq!(cache.status("v1", now), NonceStatus::Grace);
        assert_eq!(cache.status("v2", now), NonceStatus::Active);

        // v1 still verifies during grace.
        assert!(cache.verification_key("v1", now).await.is_ok());

        // New production uses v2.
        let (version, _) = cache.current_key(now).await.unwrap();
        assert_eq!(version, "v2");
    }

    #[tokio::test]
    async fn test_grace_expiry_evicts() {
        let (cache, store) = cache_with_versions(&[("v1", 1), ("v2", 2)], "v1");
        let now = Utc::now();
        cache.current_key(now).await.unwrap();
        store.insert("oracle/redaction-nonce/current", "v2");
        cache.refresh(now).await.unwrap();

        let after_grace = now + Duration::seconds(3601);
        let err = cache.verification_key("v1", after_grace).await.unwrap_err();
        assert!(matches!(
            err,
            OracleError::NonceValidation(NonceFailure::VersionEvicted { .. })
        ));
        assert_eq!(cache.status("v1", after_grace), NonceStatus::Evicted);
    }

    #[tokio::test]
    async fn test_load_failure_fails_closed_without_cache() {
        let store = Arc::new(InMemorySecretStore::new());
        let cache = NonceCache::new(store, RedactionConfig::default());
        let err = cache.current_key(Utc::now()).await.unwrap_err();
        assert!(matches!(err, OracleError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_load_failure_with_fresh_cache_degrades() {
        let (cache, store) = cache_with_versions(&[("v1", 1)], "v1");
        let now = Utc::now();
        cache.current_key(now).await.unwrap();

        // Secret store goes away entirely.
        store.remove("oracle/redaction-nonce/current");
        store.remove("oracle/redaction-nonce/v1");

        cache.refresh(now).await.unwrap();
        assert!(cache.is_degraded());

        // Cached key still serves production inside the TTL.
        let (version, _) = cache.current_key(now).await.unwrap();
        assert_eq!(version, "v1");
    }

    #[tokio::test]
    async fn test_short_nonce_rejected() {
        let store = Arc::new(InMemorySecretStore::new());
        store.insert(
            "oracle/redaction-nonce/v1",
            base64::engine::general_purpose::STANDARD.encode([9u8; 8]),
        );
        store.insert("oracle/redaction-nonce/current", "v1");
        let cache = NonceCache::new(store, RedactionConfig::default());
        let err = cache.current_key(Utc::now()).await.unwrap_err();
        assert!(err.to_string().contains("minimum"));
    }

    #[tokio::test]
    async fn test_unknown_version_is_evicted_not_transport_error() {
        let (cache, _store) = cache_with_versions(&[("v1", 1)], "v1");
        let err = cache
            .verification_key("v0", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OracleError::NonceValidation(NonceFailure::VersionEvicted { .. })
        ));
    }
}
