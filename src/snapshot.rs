//! Repository Snapshot State
//!
//! Immutable input to the L0 gate and the L1 evaluator. Construction goes
//! through [`SnapshotStateBuilder`], which rejects missing fields so that
//! every field is present and type-valid before any rule runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OracleError, OracleResult};

/// Snapshot of the repository state under evaluation. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnapshotState {
    /// Hex digest of the expected evidence-schema version, `algorithm:hex`.
    pub schema_hash: String,
    /// Permission bitset, masked against the required bitset at L0.
    pub permission_bits: u64,
    /// Drift magnitude in [0,1].
    pub drift_magnitude: f64,
    /// Monotonic nonce epoch.
    pub nonce_epoch: u64,
    /// When the snapshot's nonce was issued.
    pub nonce_issued_at: DateTime<Utc>,
    /// Contraction witness; must sit within epsilon of the fixed target.
    pub contraction_witness: f64,
}

impl SnapshotState {
    pub fn builder() -> SnapshotStateBuilder {
        SnapshotStateBuilder::default()
    }

    /// Parse a snapshot from its JSON document form.
    pub fn from_json(raw: &str) -> OracleResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| OracleError::Config(format!("invalid snapshot document: {e}")))
    }
}

/// Builder that refuses to produce a partially-populated snapshot.
#[derive(Debug, Default)]
pub struct SnapshotStateBuilder {
    schema_hash: Option<String>,
    permission_bits: Option<u64>,
    drift_magnitude: Option<f64>,
    nonce_epoch: Option<u64>,
    nonce_issued_at: Option<DateTime<Utc>>,
    contraction_witness: Option<f64>,
}

impl SnapshotStateBuilder {
    pub fn schema_hash(mut self, v: impl Into<String>) -> Self {
        self.schema_hash = Some(v.into());
        self
    }

    pub fn permission_bits(mut self, v: u64) -> Self {
        self.permission_bits = Some(v);
        self
    }

    pub fn drift_magnitude(mut self, v: f64) -> Self {
        self.drift_magnitude = Some(v);
        self
    }

    pub fn nonce_epoch(mut self, v: u64) -> Self {
        self.nonce_epoch = Some(v);
        self
    }

    pub fn nonce_issued_at(mut self, v: DateTime<Utc>) -> Self {
        self.nonce_issued_at = Some(v);
        self
    }

    pub fn contraction_witness(mut self, v: f64) -> Self {
        self.contraction_witness = Some(v);
        self
    }

    pub fn build(self) -> OracleResult<SnapshotState> {
        fn require<T>(v: Option<T>, name: &str) -> OracleResult<T> {
            v.ok_or_else(|| OracleError::Config(format!("snapshot field '{name}' missing")))
        }

        let state = SnapshotState {
            schema_hash: require(self.schema_hash, "schema_hash")?,
            permission_bits: require(self.permission_bits, "permission_bits")?,
            drift_magnitude: require(self.drift_magnitude, "drift_magnitude")?,
            nonce_epoch: require(self.nonce_epoch, "nonce_epoch")?,
            nonce_issued_at: require(self.nonce_issued_at, "nonce_issued_at")?,
            contraction_witness: require(self.contraction_witness, "contraction_witness")?,
        };

        if !state.drift_magnitude.is_finite() || !state.contraction_witness.is_finite() {
            return Err(OracleError::Config(
                "snapshot contains non-finite magnitudes".to_string(),
            ));
        }

        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_snapshot() -> SnapshotState {
        SnapshotState::builder()
            .schema_hash("sha256:abcd")
            .permission_bits(0b1111)
            .drift_magnitude(0.1)
            .nonce_epoch(3)
            .nonce_issued_at(Utc::now())
            .contraction_witness(1.0)
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_all_fields() {
        let err = SnapshotState::builder()
            .schema_hash("sha256:abcd")
            .permission_bits(1)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("drift_magnitude"));
    }

    #[test]
    fn test_builder_rejects_non_finite() {
        let err = SnapshotState::builder()
            .schema_hash("sha256:abcd")
            .permission_bits(1)
            .drift_magnitude(f64::NAN)
            .nonce_epoch(1)
            .nonce_issued_at(Utc::now())
            .contraction_witness(1.0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("non-finite"));
    }

    #[test]
    fn test_json_round_trip() {
        let state = sample_snapshot();
        let raw = serde_json::to_string(&state).unwrap();
        let parsed = SnapshotState::from_json(&raw).unwrap();
        assert_eq!(parsed, state);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let raw = r#"{
            "schema_hash": "sha256:abcd",
            "permission_bits": 15,
            "drift_magnitude": 0.1,
            "nonce_epoch": 3,
            "nonce_issued_at": "2024-01-01T00:00:00Z",
            "contraction_witness": 1.0,
            "extra": true
        }"#;
        assert!(SnapshotState::from_json(raw).is_err());
    }
}
