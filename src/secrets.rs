//! Secret Store
//!
//! Named-secret lookup for the salt and the versioned redaction nonces. The
//! oracle never accepts secret material inline; everything arrives through
//! this capability, selected by configuration.
//!
//! Variants: an in-memory store (tests, `local` mode) and a file-backed
//! store reading a TOML document of `name = "value"` pairs.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{OracleError, OracleResult};

/// A secret value. `Debug` never prints the material.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the raw material. Call sites should be few and deliberate.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Decode as base64 (standard alphabet), for binary secret material.
    pub fn decode_base64(&self) -> OracleResult<Vec<u8>> {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD
            .decode(&self.0)
            .map_err(|e| OracleError::Config(format!("secret is not valid base64: {e}")))
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Secret").field(&"[REDACTED]").finish()
    }
}

/// Named-secret lookup.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch a secret by name. `NotFound` when the name is absent;
    /// `Store` on transport faults.
    async fn get_secret(&self, name: &str) -> OracleResult<Secret>;
}

// =============================================================================
// IN-MEMORY STORE
// =============================================================================

/// In-memory secret store for tests and `local` mode.
#[derive(Default)]
pub struct InMemorySecretStore {
    secrets: RwLock<HashMap<String, Secret>>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, value: impl Into<String>) {
        self.secrets
            .write()
            .insert(name.into(), Secret::new(value));
    }

    pub fn remove(&self, name: &str) {
        self.secrets.write().remove(name);
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn get_secret(&self, name: &str) -> OracleResult<Secret> {
        self.secrets
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| OracleError::NotFound {
                entity: "secret",
                key: name.to_string(),
            })
    }
}

// =============================================================================
// FILE-BACKED STORE
// =============================================================================

/// File-backed secret store. The file is a flat TOML table of string pairs,
/// re-read on every lookup so operators can rotate without a restart.
pub struct FileSecretStore {
    path: PathBuf,
}

impl FileSecretStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn read_table(&self) -> OracleResult<HashMap<String, String>> {
        let raw = std::fs::read_to_string(&self.path)
            .map_err(|e| OracleError::store("read_secret_file", self.path.display().to_string(), e))?;
        toml::from_str(&raw).map_err(|e| {
            OracleError::Config(format!(
                "secret file {} is not a flat string table: {e}",
                self.path.display()
            ))
        })
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn get_secret(&self, name: &str) -> OracleResult<Secret> {
        let table = self.read_table()?;
        table
            .get(name)
            .map(|v| Secret::new(v.clone()))
            .ok_or_else(|| OracleError::NotFound {
                entity: "secret",
                key: name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_in_memory_lookup_and_miss() {
        let store = InMemorySecretStore::new();
        store.insert("oracle/anonymizer-salt", "a".repeat(64));

        let secret = store.get_secret("oracle/anonymizer-salt").await.unwrap();
        assert_eq!(secret.expose().len(), 64);

        let err = store.get_secret("missing").await.unwrap_err();
        assert!(matches!(err, OracleError::NotFound { entity: "secret", .. }));
    }

    #[tokio::test]
    async fn test_file_store_reads_and_reloads() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "\"oracle/nonce/v1\" = \"c2VjcmV0LW1hdGVyaWFsLTMyLWJ5dGVzISEhISEh\"").unwrap();
        file.flush().unwrap();

        let store = FileSecretStore::new(file.path());
        let secret = store.get_secret("oracle/nonce/v1").await.unwrap();
        assert!(!secret.expose().is_empty());

        // Rotation: rewrite the file, next lookup sees the new value.
        writeln!(file, "\"oracle/nonce/v2\" = \"bmV3LXNlY3JldC1tYXRlcmlhbC0zMi1ieXRlcyEh\"").unwrap();
        file.flush().unwrap();
        assert!(store.get_secret("oracle/nonce/v2").await.is_ok());
    }

    #[test]
    fn test_debug_never_prints_material() {
        let secret = Secret::new("hunter2");
        let rendered = format!("{secret:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn test_base64_decoding() {
        let secret = Secret::new("aGVsbG8=");
        assert_eq!(secret.decode_base64().unwrap(), b"hello");
        assert!(Secret::new("not base64!!").decode_base64().is_err());
    }
}
