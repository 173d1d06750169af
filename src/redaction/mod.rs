//! Redaction Layer
//!
//! Produces opaque [`RedactedText`] values: pattern-scrubbed text wrapped in
//! an HMAC-SHA256 over the canonicalised payload, keyed by a versioned nonce
//! from the shared [`NonceCache`]. Consumers must verify before trusting the
//! displayed value; report-boundary verification is fail-closed by default.

pub mod nonce_cache;

pub use nonce_cache::{NonceCache, NonceStatus, MIN_NONCE_BYTES};

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::warn;

use crate::canonical::PayloadBuilder;
use crate::config::ValidationPolicy;
use crate::error::{NonceFailure, OracleError, OracleResult};

type HmacSha256 = Hmac<Sha256>;

/// Replacement marker inserted where a pattern matched.
pub const REDACTION_MARKER: &str = "[REDACTED]";

/// One literal pattern in the registered set. Patterns apply in registration
/// order, each replacing every occurrence of its needle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactionPattern {
    /// Stable pattern name, for audit output.
    pub name: String,
    /// Literal text to scrub.
    pub needle: String,
}

impl RedactionPattern {
    pub fn new(name: impl Into<String>, needle: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            needle: needle.into(),
        }
    }
}

/// Opaque redacted value. Constructed only by [`Redactor::redact`]; never
/// mutated. The `mac` must verify under a nonce in the active cache before
/// any consumer trusts `value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedactedText {
    /// Displayed (already scrubbed) string.
    pub value: String,
    /// Lowercase hex HMAC-SHA256 over the canonicalised payload.
    pub mac: String,
    /// Version of the nonce that keyed the MAC.
    pub nonce_version: String,
}

/// Outcome of verifying a whole report under a policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportValidation {
    /// True when every MAC verified, or the policy is fail-open.
    pub accepted: bool,
    /// Indexes of entries that failed, with the failure reason.
    pub failures: Vec<(usize, String)>,
}

/// The redaction engine: a pattern set plus the shared nonce cache.
pub struct Redactor {
    cache: NonceCache,
    patterns: Vec<RedactionPattern>,
}

impl Redactor {
    pub fn new(cache: NonceCache, patterns: Vec<RedactionPattern>) -> Self {
        Self { cache, patterns }
    }

    pub fn cache(&self) -> &NonceCache {
        &self.cache
    }

    /// Scrub the input and wrap it with a MAC under the current nonce.
    pub async fn redact(&self, input: &str, now: DateTime<Utc>) -> OracleResult<RedactedText> {
        let mut value = input.to_string();
        for pattern in &self.patterns {
            if pattern.needle.is_empty() {
                continue;
            }
            value = value.replace(&pattern.needle, REDACTION_MARKER);
        }

        let (nonce_version, key) = self.cache.current_key(now).await?;
        let mac = compute_mac(&key, &value, &nonce_version)?;
        Ok(RedactedText {
            value,
            mac,
            nonce_version,
        })
    }

    /// Verify a single redacted value. Constant-time MAC comparison.
    pub async fn verify(&self, text: &RedactedText, now: DateTime<Utc>) -> OracleResult<()> {
        let key = self
            .cache
            .verification_key(&text.nonce_version, now)
            .await?;

        let expected = hex::decode(&text.mac).map_err(|_| {
            OracleError::NonceValidation(NonceFailure::MacMismatch {
                nonce_version: text.nonce_version.clone(),
            })
        })?;

        let mut mac = HmacSha256::new_from_slice(&key)
            .map_err(|e| OracleError::Config(format!("HMAC key rejected: {e}")))?;
        mac.update(&mac_payload(&text.value, &text.nonce_version));
        mac.verify_slice(&expected).map_err(|_| {
            OracleError::NonceValidation(NonceFailure::MacMismatch {
                nonce_version: text.nonce_version.clone(),
            })
        })
    }

    /// Verify every redacted value in a report under the given policy.
    ///
    /// Fail-closed: the first description of each failure is collected and
    /// `accepted` is false if any entry failed. Fail-open: failures are
    /// logged and collected but the report is still accepted.
    pub async fn verify_report(
        &self,
        texts: &[RedactedText],
        policy: ValidationPolicy,
        now: DateTime<Utc>,
    ) -> OracleResult<ReportValidation> {
        let mut failures = Vec::new();
        for (index, text) in texts.iter().enumerate() {
            match self.verify(text, now).await {
                Ok(()) => {}
                Err(OracleError::NonceValidation(reason)) => {
                    failures.push((index, reason.to_string()));
                }
                Err(other) => return Err(other),
            }
        }

        let accepted = match policy {
            ValidationPolicy::FailClosed => failures.is_empty(),
            ValidationPolicy::FailOpen => {
                for (index, reason) in &failures {
                    warn!(index, %reason, "redacted value failed verification (fail-open)");
                }
                true
            }
        };

        Ok(ReportValidation { accepted, failures })
    }
}

fn mac_payload(value: &str, nonce_version: &str) -> Vec<u8> {
    PayloadBuilder::new()
        .text_field("value", value)
        .text_field("nonce_version", nonce_version)
        .finish()
}

fn compute_mac(key: &[u8], value: &str, nonce_version: &str) -> OracleResult<String> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| OracleError::Config(format!("HMAC key rejected: {e}")))?;
    mac.update(&mac_payload(value, nonce_version));
    Ok(hex::encode(mac.finalize().into_bytes()))
}
