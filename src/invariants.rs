//! L0 Invariant Checker
//!
//! Constant-time safety gate that runs before any rule evaluation. Five
//! predicates, fixed order, first failure wins; none of the later predicates
//! run once one has failed.
//!
//! # Invariants
//!
//! 1. `schema_hash`: the snapshot's digest matches the compiled expectation.
//! 2. `permission_bits`: `(bits AND mask) == mask`.
//! 3. `drift_magnitude`: within `[0, configured max]`.
//! 4. `nonce_freshness`: issued within the freshness window AND epoch at or
//!    above the floor.
//! 5. `contraction_witness`: within epsilon of the fixed target.
//!
//! The checker is pure, never suspends, and allocates only when producing a
//! violation. It runs on every state transition, so any variable cost would
//! dwarf its usefulness as a gate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::L0Config;
use crate::error::{OracleError, OracleResult};
use crate::snapshot::SnapshotState;

/// The five L0 invariants, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum L0Invariant {
    SchemaHash,
    PermissionBits,
    DriftMagnitude,
    NonceFreshness,
    ContractionWitness,
}

impl L0Invariant {
    /// Fixed evaluation order.
    pub const ORDER: [L0Invariant; 5] = [
        Self::SchemaHash,
        Self::PermissionBits,
        Self::DriftMagnitude,
        Self::NonceFreshness,
        Self::ContractionWitness,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            Self::SchemaHash => "schema_hash",
            Self::PermissionBits => "permission_bits",
            Self::DriftMagnitude => "drift_magnitude",
            Self::NonceFreshness => "nonce_freshness",
            Self::ContractionWitness => "contraction_witness",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::SchemaHash => "evidence-schema digest matches the compiled expectation",
            Self::PermissionBits => "required permission mask fully covered",
            Self::DriftMagnitude => "drift magnitude within configured bound",
            Self::NonceFreshness => "nonce issued within freshness window at a valid epoch",
            Self::ContractionWitness => "contraction witness within epsilon of target",
        }
    }
}

/// Compiled L0 gate. Construct once, reuse for every invocation.
#[derive(Debug, Clone)]
pub struct L0Checker {
    expectations: L0Config,
    /// `algorithm` part of the expected digest, split once at construction.
    expected_algorithm: String,
    /// `hex` part of the expected digest.
    expected_value: String,
}

impl L0Checker {
    pub fn new(expectations: L0Config) -> OracleResult<Self> {
        let (algorithm, value) = expectations
            .expected_schema_hash
            .split_once(':')
            .ok_or_else(|| {
                OracleError::Config(format!(
                    "expected_schema_hash '{}' is not 'algorithm:hex'",
                    expectations.expected_schema_hash
                ))
            })?;
        if algorithm.is_empty() || value.is_empty() {
            return Err(OracleError::Config(
                "expected_schema_hash has an empty component".to_string(),
            ));
        }
        Ok(Self {
            expected_algorithm: algorithm.to_string(),
            expected_value: value.to_string(),
            expectations,
        })
    }

    /// Run all five predicates in order. Returns the first violation.
    pub fn check(&self, state: &SnapshotState, now: DateTime<Utc>) -> OracleResult<()> {
        for invariant in L0Invariant::ORDER {
            self.check_one(invariant, state, now)?;
        }
        Ok(())
    }

    fn check_one(
        &self,
        invariant: L0Invariant,
        state: &SnapshotState,
        now: DateTime<Utc>,
    ) -> OracleResult<()> {
        match invariant {
            L0Invariant::SchemaHash => {
                let Some((algorithm, value)) = state.schema_hash.split_once(':') else {
                    return Err(violation(
                        invariant,
                        format!("schema hash '{}' is not 'algorithm:hex'", state.schema_hash),
                    ));
                };
                if algorithm != self.expected_algorithm || value != self.expected_value {
                    return Err(violation(
                        invariant,
                        format!(
                            "schema digest {}:{}… does not match expected {}:{}…",
                            algorithm,
                            truncate(value),
                            self.expected_algorithm,
                            truncate(&self.expected_value)
                        ),
                    ));
                }
            }
            L0Invariant::PermissionBits => {
                let mask = self.expectations.required_permission_mask;
                if state.permission_bits & mask != mask {
                    return Err(violation(
                        invariant,
                        format!(
                            "permission bits {:#b} do not cover required mask {:#b}",
                            state.permission_bits, mask
                        ),
                    ));
                }
            }
            L0Invariant::DriftMagnitude => {
                let max = self.expectations.max_drift_magnitude;
                if !(0.0..=max).contains(&state.drift_magnitude) {
                    return Err(violation(
                        invariant,
                        format!(
                            "drift magnitude {} outside [0, {max}]",
                            state.drift_magnitude
                        ),
                    ));
                }
            }
            L0Invariant::NonceFreshness => {
                let age = now.signed_duration_since(state.nonce_issued_at);
                let window =
                    chrono::Duration::seconds(self.expectations.nonce_freshness_window_secs as i64);
                if age >= window {
                    return Err(violation(
                        invariant,
                        format!(
                            "nonce issued {}s ago, freshness window is {}s",
                            age.num_seconds(),
                            window.num_seconds()
                        ),
                    ));
                }
                if state.nonce_epoch < self.expectations.min_nonce_epoch {
                    return Err(violation(
                        invariant,
                        format!(
                            "nonce epoch {} below minimum {}",
                            state.nonce_epoch, self.expectations.min_nonce_epoch
                        ),
                    ));
                }
            }
            L0Invariant::ContractionWitness => {
                let delta = (state.contraction_witness - self.expectations.contraction_target).abs();
                if delta >= self.expectations.contraction_epsilon {
                    return Err(violation(
                        invariant,
                        format!(
                            "contraction witness {} deviates {delta} from target {}",
                            state.contraction_witness, self.expectations.contraction_target
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn violation(invariant: L0Invariant, evidence: String) -> OracleError {
    OracleError::L0Violation {
        invariant_id: invariant.id(),
        evidence,
    }
}

fn truncate(hex: &str) -> String {
    hex.chars().take(12).collect()
}
