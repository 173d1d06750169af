//! Oracle Configuration
//!
//! Every tunable the engine recognises, with defaults, TOML file loading,
//! and environment overrides. Components receive their section by value at
//! construction; nothing reads the environment after startup.
//!
//! Secrets are NOT configuration: the salt and nonce material are fetched by
//! name from the secret store, never accepted inline here.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{OracleError, OracleResult};

/// Invocation mode, set by the CI gate that calls the oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationMode {
    PullRequest,
    MergeGroup,
    Drift,
    /// Short-circuits the event store, block counter, and binding service to
    /// in-memory no-op stores. Used by pre-push hooks and development runs.
    Local,
}

impl InvocationMode {
    pub fn requires_full_pipeline(&self) -> bool {
        !matches!(self, Self::Local)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PullRequest => "pull_request",
            Self::MergeGroup => "merge_group",
            Self::Drift => "drift",
            Self::Local => "local",
        }
    }
}

impl std::str::FromStr for InvocationMode {
    type Err = OracleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pull_request" | "pull-request" => Ok(Self::PullRequest),
            "merge_group" | "merge-group" => Ok(Self::MergeGroup),
            "drift" => Ok(Self::Drift),
            "local" => Ok(Self::Local),
            other => Err(OracleError::Config(format!("unknown mode '{other}'"))),
        }
    }
}

/// Billing tier, which only changes exit-code semantics for degraded runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    #[default]
    Community,
    Paid,
}

// =============================================================================
// PER-COMPONENT SECTIONS
// =============================================================================

/// Compiled expectations for the L0 gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct L0Config {
    /// Expected evidence-schema digest, `algorithm:hex`.
    pub expected_schema_hash: String,
    /// Bitmask that `permission_bits` must fully cover.
    pub required_permission_mask: u64,
    /// Upper bound for `drift_magnitude`.
    pub max_drift_magnitude: f64,
    /// Nonce freshness window in seconds.
    pub nonce_freshness_window_secs: u64,
    /// Minimum acceptable nonce epoch.
    pub min_nonce_epoch: u64,
    /// Fixed target for the contraction witness.
    pub contraction_target: f64,
    /// Tolerance around the contraction target.
    pub contraction_epsilon: f64,
}

impl Default for L0Config {
    fn default() -> Self {
        Self {
            // Placeholder digest; operators configure the real one. A
            // snapshot never matches this, so an unconfigured gate fails
            // closed.
            expected_schema_hash: "sha256:unconfigured".to_string(),
            required_permission_mask: 0,
            max_drift_magnitude: 0.5,
            nonce_freshness_window_secs: 3600,
            min_nonce_epoch: 0,
            contraction_target: 1.0,
            contraction_epsilon: 1e-9,
        }
    }
}

/// Redaction layer and nonce cache tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactionConfig {
    /// Secret-store name prefix for versioned nonces
    /// (`{nonce_prefix}{version}`).
    pub nonce_prefix: String,
    /// Cache TTL for a loaded nonce, seconds.
    pub nonce_ttl_secs: u64,
    /// Grace window after rotation, seconds. Must be >= the TTL.
    pub nonce_grace_window_secs: u64,
    /// Whole-report validation policy; report boundaries are fail-closed.
    pub validation_policy: ValidationPolicy,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            nonce_prefix: "oracle/redaction-nonce/".to_string(),
            nonce_ttl_secs: 3600,
            nonce_grace_window_secs: 3600,
            validation_policy: ValidationPolicy::FailClosed,
        }
    }
}

/// What a MAC mismatch does to the surrounding operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationPolicy {
    /// Warn and continue; the finding is kept but flagged.
    FailOpen,
    /// Any mismatch blocks the operation.
    #[default]
    FailClosed,
}

/// FP event store tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FpStoreConfig {
    /// Event TTL in days (store-level expiry).
    pub event_ttl_days: i64,
    /// Default window size for local FPR consultation.
    pub default_window_size: usize,
    /// Per-rule local FPR threshold above which demotion is considered.
    pub critical_fpr: f64,
}

impl Default for FpStoreConfig {
    fn default() -> Self {
        Self {
            event_ttl_days: 90,
            default_window_size: 50,
            critical_fpr: 0.25,
        }
    }
}

/// Block counter and circuit breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Blocks within the window required to trip.
    pub threshold: u64,
    /// Window over which blocks are summed, hours.
    pub window_hours: u32,
    /// How long a trip holds, hours.
    pub cooldown_hours: u32,
    /// Quiet period required after cooldown before re-closing, hours.
    pub hysteresis_hours: u32,
    /// Bucket TTL, hours.
    pub bucket_ttl_hours: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 10,
            window_hours: 6,
            cooldown_hours: 2,
            hysteresis_hours: 1,
            bucket_ttl_hours: 24,
        }
    }
}

/// Anonymiser salt handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnonymizerConfig {
    /// Secret-store name of the 64-hex salt.
    pub salt_parameter_name: String,
    /// Test mode uses a fixed known-safe salt instead of the secret store.
    /// Selected only here, never by environment sniffing.
    pub test_mode: bool,
}

impl Default for AnonymizerConfig {
    fn default() -> Self {
        Self {
            salt_parameter_name: "oracle/anonymizer-salt".to_string(),
            test_mode: false,
        }
    }
}

/// Identity verification heuristics. Every threshold is a named option.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// GitHub: minimum org age in days.
    pub github_min_org_age_days: i64,
    /// GitHub: minimum member count.
    pub github_min_members: u64,
    /// GitHub: minimum public repository count.
    pub github_min_public_repos: u64,
    /// GitHub: maximum days since last activity.
    pub github_max_inactivity_days: i64,
    /// Stripe: minimum account age in days.
    pub stripe_min_account_age_days: i64,
    /// Stripe: minimum count of successful payments.
    pub stripe_min_successful_payments: u64,
    /// Stripe: reject delinquent accounts.
    pub stripe_reject_delinquent: bool,
    /// Stripe: if non-empty, an active subscription to one of these product
    /// ids is required.
    pub stripe_required_product_ids: Vec<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            github_min_org_age_days: 90,
            github_min_members: 3,
            github_min_public_repos: 1,
            github_max_inactivity_days: 180,
            stripe_min_account_age_days: 30,
            stripe_min_successful_payments: 1,
            stripe_reject_delinquent: true,
            stripe_required_product_ids: Vec::new(),
        }
    }
}

/// Reputation engine and consistency scorer tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationConfig {
    /// Stake normalisation denominator, USD.
    pub min_stake: u64,
    /// Cap on the log-scaled stake multiplier.
    pub stake_multiplier_cap: f64,
    /// Cap on the consistency bonus term.
    pub consistency_bonus_cap: f64,
    /// Whether network participation requires an active stake.
    pub require_stake: bool,
    /// Minimum pledge for participation when staking is required, USD.
    pub min_stake_for_participation: u64,
    /// Reputation floor for participation.
    pub minimum_reputation_score: f64,
    /// Contribution records older than this are ignored, days.
    pub max_contribution_age_days: i64,
    /// Records required before a real consistency score is computed.
    pub min_contributions_required: usize,
    /// Absolute deviation above which a record is an outlier.
    pub outlier_threshold: f64,
    /// Exponential decay rate per day of record age.
    pub decay_rate: f64,
    /// Cap on the bonus added above the 0.5 consistency floor.
    pub max_consistency_bonus: f64,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            min_stake: 100,
            stake_multiplier_cap: 2.0,
            consistency_bonus_cap: 0.5,
            require_stake: false,
            min_stake_for_participation: 0,
            minimum_reputation_score: 0.1,
            max_contribution_age_days: 180,
            min_contributions_required: 3,
            outlier_threshold: 0.3,
            decay_rate: 0.01,
            max_consistency_bonus: 0.2,
        }
    }
}

/// Calibration aggregator tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Minimum distinct consenting contributors before any aggregate is
    /// disclosed.
    pub k_anonymity_floor: usize,
    /// |z| above this drops a contributor as Byzantine.
    pub byzantine_z_threshold: f64,
    /// Fraction of contributors dropped from the bottom by reputation.
    pub byzantine_percentile: f64,
    /// Byzantine filtering only applies at or above this contributor count.
    pub min_contributors_for_filtering: usize,
    /// Confidence level above which a consensus FPR participates in L1
    /// demotion.
    pub high_confidence_level: f64,
    /// Fan-out ceiling for parallel store reads.
    pub max_concurrent_reads: usize,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            k_anonymity_floor: 5,
            byzantine_z_threshold: 3.0,
            byzantine_percentile: 0.2,
            min_contributors_for_filtering: 5,
            high_confidence_level: 0.5,
            max_concurrent_reads: 8,
        }
    }
}

/// Pipeline-level policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Invocation deadline, seconds.
    pub deadline_secs: u64,
    /// Billing tier (exit-code semantics only).
    pub tier: Tier,
    /// Whether infrastructure faults degrade (true) or fail closed (false).
    pub allow_degraded: bool,
    /// Engine version stamped into every decision record.
    pub engine_version: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            deadline_secs: 120,
            tier: Tier::Community,
            allow_degraded: true,
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

// =============================================================================
// TOP-LEVEL CONFIG
// =============================================================================

/// The full recognised-options contract.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub l0: L0Config,
    pub redaction: RedactionConfig,
    pub fp_store: FpStoreConfig,
    pub breaker: BreakerConfig,
    pub anonymizer: AnonymizerConfig,
    pub identity: IdentityConfig,
    pub reputation: ReputationConfig,
    pub calibration: CalibrationConfig,
    pub pipeline: PipelineConfig,
}

impl OracleConfig {
    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> OracleResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            OracleError::Config(format!("cannot read config {}: {e}", path.display()))
        })?;
        let mut config: Self = toml::from_str(&raw)
            .map_err(|e| OracleError::Config(format!("invalid config: {e}")))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment overrides for the handful of options operators flip in CI
    /// without shipping a config file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("ORACLE_K_ANONYMITY_FLOOR") {
            if let Ok(n) = v.parse() {
                self.calibration.k_anonymity_floor = n;
            }
        }
        if let Ok(v) = std::env::var("ORACLE_CRITICAL_FPR") {
            if let Ok(n) = v.parse() {
                self.fp_store.critical_fpr = n;
            }
        }
        if let Ok(v) = std::env::var("ORACLE_BREAKER_THRESHOLD") {
            if let Ok(n) = v.parse() {
                self.breaker.threshold = n;
            }
        }
        if let Ok(v) = std::env::var("ORACLE_SALT_PARAMETER_NAME") {
            self.anonymizer.salt_parameter_name = v;
        }
        if let Ok(v) = std::env::var("ORACLE_NONCE_PREFIX") {
            self.redaction.nonce_prefix = v;
        }
    }

    /// Structural validation; run once at startup.
    pub fn validate(&self) -> OracleResult<()> {
        if self.redaction.nonce_grace_window_secs < self.redaction.nonce_ttl_secs {
            return Err(OracleError::Config(format!(
                "nonce_grace_window_secs ({}) must be >= nonce_ttl_secs ({}); a shorter \
                 grace window can evict a version mid-validation",
                self.redaction.nonce_grace_window_secs, self.redaction.nonce_ttl_secs
            )));
        }
        if !(0.0..=1.0).contains(&self.fp_store.critical_fpr) {
            return Err(OracleError::Config(format!(
                "critical_fpr {} outside [0,1]",
                self.fp_store.critical_fpr
            )));
        }
        if !(0.0..1.0).contains(&self.calibration.byzantine_percentile) {
            return Err(OracleError::Config(format!(
                "byzantine_percentile {} outside [0,1)",
                self.calibration.byzantine_percentile
            )));
        }
        if self.calibration.k_anonymity_floor == 0 {
            return Err(OracleError::Config(
                "k_anonymity_floor must be at least 1".to_string(),
            ));
        }
        if self.l0.max_drift_magnitude < 0.0 || self.l0.max_drift_magnitude > 1.0 {
            return Err(OracleError::Config(format!(
                "max_drift_magnitude {} outside [0,1]",
                self.l0.max_drift_magnitude
            )));
        }
        if self.calibration.max_concurrent_reads == 0 {
            return Err(OracleError::Config(
                "max_concurrent_reads must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn nonce_ttl(&self) -> Duration {
        Duration::from_secs(self.redaction.nonce_ttl_secs)
    }

    pub fn nonce_grace_window(&self) -> Duration {
        Duration::from_secs(self.redaction.nonce_grace_window_secs)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.pipeline.deadline_secs)
    }
}
