//! Organisation/Repository Anonymiser
//!
//! Pseudonyms are `HMAC_SHA256(salt, canonicalise(org ‖ "/" ‖ repo))` as
//! lowercase hex. The salt is a 64-hex secret fetched by name, rotated
//! monthly; the loader records which rotation month a salt belongs to and
//! swaps it atomically so in-flight pseudonym computations never observe a
//! torn update.
//!
//! A test-mode variant uses a fixed known-safe salt. It is selected only by
//! configuration, never by sniffing the environment.

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Datelike, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use tracing::info;

use crate::canonical::PayloadBuilder;
use crate::config::AnonymizerConfig;
use crate::error::{OracleError, OracleResult};
use crate::secrets::SecretStore;

type HmacSha256 = Hmac<Sha256>;

/// Fixed salt for test mode. Publicly known, safe precisely because nothing
/// real is ever keyed with it.
const TEST_MODE_SALT: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// A loaded salt with its provenance.
#[derive(Clone)]
struct LoadedSalt {
    key: Vec<u8>,
    /// `YYYY-MM` of the rotation this salt belongs to.
    rotation_month: String,
    loaded_at: DateTime<Utc>,
}

/// Pseudonym generator with a hot-swappable salt.
pub struct Anonymizer {
    store: Arc<dyn SecretStore>,
    config: AnonymizerConfig,
    salt: ArcSwapOption<LoadedSalt>,
}

impl Anonymizer {
    pub fn new(store: Arc<dyn SecretStore>, config: AnonymizerConfig) -> Self {
        Self {
            store,
            config,
            salt: ArcSwapOption::empty(),
        }
    }

    /// Load (or reload) the salt from the secret store. In test mode the
    /// fixed salt is installed without touching the store.
    pub async fn load_salt(&self, now: DateTime<Utc>) -> OracleResult<()> {
        let raw = if self.config.test_mode {
            TEST_MODE_SALT.to_string()
        } else {
            self.store
                .get_secret(&self.config.salt_parameter_name)
                .await?
                .expose()
                .to_string()
        };

        validate_salt(&raw)?;
        let loaded = LoadedSalt {
            key: hex::decode(&raw).expect("validated hex"),
            rotation_month: format!("{:04}-{:02}", now.year(), now.month()),
            loaded_at: now,
        };
        info!(
            rotation_month = %loaded.rotation_month,
            test_mode = self.config.test_mode,
            "anonymizer salt loaded"
        );
        self.salt.store(Some(Arc::new(loaded)));
        Ok(())
    }

    /// The rotation month of the currently loaded salt, if any.
    pub fn rotation_month(&self) -> Option<String> {
        self.salt.load().as_ref().map(|s| s.rotation_month.clone())
    }

    /// When the current salt was loaded, if any.
    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.salt.load().as_ref().map(|s| s.loaded_at)
    }

    /// Compute the pseudonym for an (org, repo) pair.
    pub fn pseudonym(&self, org_id: &str, repo_id: &str) -> OracleResult<String> {
        let guard = self.salt.load();
        let salt = guard.as_ref().ok_or_else(|| {
            OracleError::Config("anonymizer salt not loaded".to_string())
        })?;

        let payload = PayloadBuilder::new()
            .text_field("subject", &format!("{org_id}/{repo_id}"))
            .finish();
        let mut mac = HmacSha256::new_from_slice(&salt.key)
            .map_err(|e| OracleError::Config(format!("salt rejected as HMAC key: {e}")))?;
        mac.update(&payload);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Pseudonym for an org alone (used when bucketing calibration
    /// contributors, where no single repo applies).
    pub fn org_pseudonym(&self, org_id: &str) -> OracleResult<String> {
        self.pseudonym(org_id, "")
    }
}

fn validate_salt(raw: &str) -> OracleResult<()> {
    let ok = raw.len() == 64 && raw.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
    if !ok {
        return Err(OracleError::Config(
            "salt must be exactly 64 lowercase hex characters".to_string(),
        ));
    }
    Ok(())
}
