//! Error Taxonomy
//!
//! Every failure the engine can surface is one of the kinds below. Local
//! components recover only from the expected kinds (`DuplicateEvent`,
//! `CircuitBreakerDegraded`, `ConsentMissing`); everything else propagates to
//! the pipeline, which decides once between fail-closed and degraded.
//!
//! The exit code of the process is derived from the final pipeline outcome,
//! not from individual error kinds; see [`OracleError::exit_code`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used throughout the engine.
pub type OracleResult<T> = Result<T, OracleError>;

/// Reason detail for nonce validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NonceFailure {
    /// MAC did not verify under any active or grace nonce.
    MacMismatch { nonce_version: String },
    /// The nonce version has been evicted from the cache.
    VersionEvicted { nonce_version: String },
    /// The binding for this nonce has been revoked.
    BindingRevoked { reason: String },
    /// The caller claimed an org that does not own the nonce.
    OrgMismatch { claimed: String },
    /// The stored binding signature does not recompute.
    SignatureInvalid,
    /// No binding exists for this nonce.
    UnknownNonce,
}

impl std::fmt::Display for NonceFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MacMismatch { nonce_version } => {
                write!(f, "MAC mismatch under nonce version {nonce_version}")
            }
            Self::VersionEvicted { nonce_version } => {
                write!(f, "nonce version {nonce_version} evicted")
            }
            Self::BindingRevoked { reason } => write!(f, "binding revoked: {reason}"),
            Self::OrgMismatch { claimed } => {
                write!(f, "claimed org {claimed} does not own this nonce")
            }
            Self::SignatureInvalid => write!(f, "binding signature does not recompute"),
            Self::UnknownNonce => write!(f, "no binding for nonce"),
        }
    }
}

/// The engine-wide error taxonomy.
#[derive(Debug, Error)]
pub enum OracleError {
    /// Fatal gate failure; no downstream work runs.
    #[error("L0 invariant violation [{invariant_id}]: {evidence}")]
    L0Violation {
        invariant_id: &'static str,
        evidence: String,
    },

    /// Transport or contention fault against a backing store.
    #[error("store error during {operation} on {key}: {cause}")]
    Store {
        operation: &'static str,
        key: String,
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Conditional insert collided; expected under retries and tolerated.
    #[error("duplicate event ({rule_id}, {event_id})")]
    DuplicateEvent { rule_id: String, event_id: String },

    /// A semantically meaningful miss: unknown finding, binding, or identity.
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    /// MAC mismatch, revoked binding, wrong claimed org, or evicted cache.
    #[error("nonce validation failed: {0}")]
    NonceValidation(NonceFailure),

    /// Event excluded from calibration; not a pipeline failure.
    #[error("no explicit consent on record for org {org_id}")]
    ConsentMissing { org_id: String },

    /// Outcome downgraded by the breaker; not a failure.
    #[error("circuit breaker tripped for {rule_id} ({recent_blocks} recent blocks)")]
    CircuitBreakerDegraded {
        rule_id: String,
        recent_blocks: u64,
    },

    /// Infrastructure unavailable; `can_proceed` determines tier behaviour.
    #[error("oracle degraded ({reason}); can_proceed={can_proceed}")]
    Degraded { reason: String, can_proceed: bool },

    /// The invocation deadline expired.
    #[error("deadline expired after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// Invalid or inconsistent configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl OracleError {
    /// Construct a store error from any transport-layer cause.
    pub fn store(
        operation: &'static str,
        key: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Store {
            operation,
            key: key.into(),
            cause: Box::new(cause),
        }
    }

    /// Expected kinds are recoverable by the component that observes them.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Self::DuplicateEvent { .. }
                | Self::CircuitBreakerDegraded { .. }
                | Self::ConsentMissing { .. }
        )
    }

    /// Community-tier exit semantics: 0 = PASS, 1 = BLOCK or L0,
    /// 2 = degraded but proceeded. The paid tier reclassifies 2 as 1 at the
    /// pipeline boundary, not here.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::L0Violation { .. } => 1,
            Self::Degraded { can_proceed, .. } => {
                if *can_proceed {
                    2
                } else {
                    1
                }
            }
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_kinds() {
        assert!(OracleError::DuplicateEvent {
            rule_id: "MD-001".into(),
            event_id: "e1".into(),
        }
        .is_expected());
        assert!(OracleError::ConsentMissing {
            org_id: "acme".into()
        }
        .is_expected());
        assert!(!OracleError::Timeout { elapsed_ms: 100 }.is_expected());
        assert!(!OracleError::L0Violation {
            invariant_id: "schema_hash",
            evidence: "digest mismatch".into(),
        }
        .is_expected());
    }

    #[test]
    fn test_exit_codes() {
        let degraded_proceed = OracleError::Degraded {
            reason: "fp store unreachable".into(),
            can_proceed: true,
        };
        assert_eq!(degraded_proceed.exit_code(), 2);

        let degraded_halt = OracleError::Degraded {
            reason: "fp store unreachable".into(),
            can_proceed: false,
        };
        assert_eq!(degraded_halt.exit_code(), 1);

        let l0 = OracleError::L0Violation {
            invariant_id: "permission_bits",
            evidence: "mask unsatisfied".into(),
        };
        assert_eq!(l0.exit_code(), 1);
    }

    #[test]
    fn test_store_error_preserves_cause() {
        let cause = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = OracleError::store("record_event", "rule#MD-001", cause);
        let msg = err.to_string();
        assert!(msg.contains("record_event"));
        assert!(msg.contains("rule#MD-001"));
        assert!(msg.contains("reset"));
    }
}
