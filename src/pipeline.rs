//! Oracle Pipeline
//!
//! Single entry point per invocation: gate on L0, evaluate rules, apply the
//! circuit breaker, canonicalise, and emit the decision record. Side-effects
//! (event records, block-counter increments, nonce usage bumps) are queued
//! during evaluation and drained once on the way out; they complete or
//! surface an error, never drop silently.
//!
//! Failure policy is decided here, centrally: expected kinds are absorbed
//! where they occur, infrastructure faults either fail closed or degrade
//! with `degradation.reason` populated, and the exit code communicates
//! severity per tier.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::anonymizer::Anonymizer;
use crate::block_counter::BlockCounterStore;
use crate::calibration::{CalibrationAggregator, CalibrationResult};
use crate::canonical::{canonical_digest, canonical_json, canonical_timestamp};
use crate::circuit_breaker::CircuitBreaker;
use crate::config::{InvocationMode, OracleConfig, Tier};
use crate::error::{OracleError, OracleResult};
use crate::fp_store::{FpEventStore, Outcome};
use crate::identity::NonceBindingService;
use crate::invariants::L0Checker;
use crate::redaction::{RedactedText, Redactor};
use crate::rules::{EvaluationInput, EvidenceSet, Finding, L1Evaluator, RepoContext, RuleEvaluation};
use crate::snapshot::SnapshotState;

/// Reason stamped when the breaker downgrades a finding.
pub const CIRCUIT_BREAKER: &str = "CIRCUIT_BREAKER";
/// Reason stamped when L0 rejects the snapshot.
pub const L0_VIOLATION: &str = "L0_VIOLATION";
/// Reason stamped when the deadline expires.
pub const TIMEOUT: &str = "TIMEOUT";
/// Reason stamped when a store was unavailable but policy allowed
/// proceeding.
pub const STORE_UNAVAILABLE: &str = "STORE_UNAVAILABLE";
/// Reason stamped when report-boundary MAC verification failed.
pub const NONCE_VALIDATION: &str = "NONCE_VALIDATION";

/// One oracle invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub mode: InvocationMode,
    pub repo: RepoContext,
    /// Evaluation timestamp; identical inputs at the same instant produce
    /// byte-identical records.
    pub now: DateTime<Utc>,
    /// The org's bound nonce, when this invocation contributes usage.
    pub nonce: Option<String>,
}

/// Degradation stamp. `reason` is empty on clean runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Degradation {
    pub reason: String,
    pub details: Option<String>,
}

impl Degradation {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(reason: &str, details: impl Into<String>) -> Self {
        Self {
            reason: reason.to_string(),
            details: Some(details.into()),
        }
    }

    pub fn is_none(&self) -> bool {
        self.reason.is_empty()
    }
}

/// Record metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionMeta {
    pub schema_hash: String,
    /// RFC 3339 UTC, fixed millisecond precision.
    pub generated_at: String,
    pub engine_version: String,
    pub inputs_digest: String,
}

/// The emitted document. Stable key order and fixed number/timestamp
/// formatting come from the canonicaliser, never from field order here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub meta: DecisionMeta,
    pub findings: Vec<Finding>,
    pub decision: Outcome,
    pub degradation: Degradation,
}

impl DecisionRecord {
    /// The byte-stable document form.
    pub fn to_canonical_json(&self) -> OracleResult<String> {
        canonical_json(self)
    }
}

/// Record plus process-level exit semantics.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub record: DecisionRecord,
    pub exit_code: i32,
}

/// The assembled oracle.
pub struct Oracle {
    config: OracleConfig,
    l0: L0Checker,
    evaluator: L1Evaluator,
    redactor: Arc<Redactor>,
    anonymizer: Arc<Anonymizer>,
    breaker: CircuitBreaker,
    block_counter: Arc<dyn BlockCounterStore>,
    fp_store: Arc<dyn FpEventStore>,
    /// Absent in `local` mode.
    aggregator: Option<Arc<CalibrationAggregator>>,
    /// Absent in `local` mode.
    binding_service: Option<Arc<NonceBindingService>>,
}

impl Oracle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OracleConfig,
        l0: L0Checker,
        evaluator: L1Evaluator,
        redactor: Arc<Redactor>,
        anonymizer: Arc<Anonymizer>,
        breaker: CircuitBreaker,
        block_counter: Arc<dyn BlockCounterStore>,
        fp_store: Arc<dyn FpEventStore>,
        aggregator: Option<Arc<CalibrationAggregator>>,
        binding_service: Option<Arc<NonceBindingService>>,
    ) -> Self {
        Self {
            config,
            l0,
            evaluator,
            redactor,
            anonymizer,
            breaker,
            block_counter,
            fp_store,
            aggregator,
            binding_service,
        }
    }

    /// Assemble a fully in-memory oracle for `local` mode: no-op-equivalent
    /// stores, a generated redaction nonce, and the test-mode salt. No
    /// calibration aggregator and no binding service are wired.
    pub async fn local(mut config: OracleConfig) -> OracleResult<Self> {
        use crate::block_counter::InMemoryBlockCounter;
        use crate::fp_store::InMemoryFpEventStore;
        use crate::redaction::NonceCache;
        use crate::rules::{builtin_rules, RuleRegistry};
        use crate::secrets::InMemorySecretStore;
        use base64::Engine;
        use rand::RngCore;

        config.anonymizer.test_mode = true;
        config.validate()?;

        let secret_store = Arc::new(InMemorySecretStore::new());
        let mut nonce_material = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut nonce_material);
        secret_store.insert(
            format!("{}v1", config.redaction.nonce_prefix),
            base64::engine::general_purpose::STANDARD.encode(nonce_material),
        );
        secret_store.insert(format!("{}current", config.redaction.nonce_prefix), "v1");

        let redactor = Arc::new(Redactor::new(
            NonceCache::new(secret_store.clone(), config.redaction.clone()),
            Vec::new(),
        ));
        let anonymizer = Arc::new(Anonymizer::new(
            secret_store.clone(),
            config.anonymizer.clone(),
        ));
        anonymizer.load_salt(Utc::now()).await?;

        let fp_store: Arc<dyn FpEventStore> = Arc::new(InMemoryFpEventStore::new());
        let counter: Arc<dyn BlockCounterStore> = Arc::new(InMemoryBlockCounter::new(
            config.breaker.bucket_ttl_hours,
        ));
        let evaluator = L1Evaluator::new(
            Arc::new(RuleRegistry::new(builtin_rules())?),
            Arc::clone(&fp_store),
            Arc::clone(&redactor),
            config.fp_store.clone(),
        );
        let breaker = CircuitBreaker::new(config.breaker.clone(), Arc::clone(&counter));
        let l0 = L0Checker::new(config.l0.clone())?;

        Ok(Self::new(
            config, l0, evaluator, redactor, anonymizer, breaker, counter, fp_store, None,
            None,
        ))
    }

    /// Run one invocation under the configured deadline.
    pub async fn run(
        &self,
        snapshot: &SnapshotState,
        evidence: EvidenceSet,
        invocation: &Invocation,
    ) -> OracleResult<Verdict> {
        let started = std::time::Instant::now();
        let inputs_digest = self.inputs_digest(snapshot, &evidence, invocation)?;
        let result = tokio::time::timeout(
            self.config.deadline(),
            self.run_inner(snapshot, evidence, invocation, inputs_digest.clone()),
        )
        .await;

        match result {
            Ok(verdict) => verdict,
            Err(_) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                error!(elapsed_ms, "pipeline deadline expired");
                metrics::counter!("oracle_pipeline_timeout_total", 1);
                let record = self.assemble(
                    snapshot,
                    invocation,
                    Vec::new(),
                    Outcome::Block,
                    Degradation::new(TIMEOUT, format!("deadline expired after {elapsed_ms}ms")),
                    inputs_digest,
                )?;
                Ok(Verdict {
                    record,
                    exit_code: 1,
                })
            }
        }
    }

    async fn run_inner(
        &self,
        snapshot: &SnapshotState,
        evidence: EvidenceSet,
        invocation: &Invocation,
        inputs_digest: String,
    ) -> OracleResult<Verdict> {
        let now = invocation.now;

        // L0 gate. Terminal on failure.
        if let Err(err) = self.l0.check(snapshot, now) {
            let OracleError::L0Violation {
                invariant_id,
                evidence: l0_evidence,
            } = &err
            else {
                return Err(err);
            };
            warn!(invariant_id, "L0 gate rejected the snapshot");
            metrics::counter!("oracle_l0_violation_total", 1);
            let record = self.assemble(
                snapshot,
                invocation,
                Vec::new(),
                Outcome::Block,
                Degradation::new(L0_VIOLATION, format!("{invariant_id}: {l0_evidence}")),
                inputs_digest,
            )?;
            return Ok(Verdict {
                record,
                exit_code: 1,
            });
        }

        let mut degradation = Degradation::none();

        // Network consensus, fetched up front for every registered rule so
        // the evaluation loop never suspends on the aggregator.
        let consensus = match self.collect_consensus(now).await {
            Ok(consensus) => consensus,
            Err(err) => {
                self.degrade_or_fail(err, &mut degradation)?;
                HashMap::new()
            }
        };

        let input = EvaluationInput {
            repo: invocation.repo.clone(),
            evidence,
        };
        let evaluation = match self
            .evaluator
            .evaluate_all(
                &input,
                &consensus,
                self.config.calibration.high_confidence_level,
                invocation.mode.as_str(),
                now,
            )
            .await
        {
            Ok(evaluation) => evaluation,
            Err(err) => {
                self.degrade_or_fail(err, &mut degradation)?;
                RuleEvaluation::default()
            }
        };
        let mut findings = evaluation.findings;

        // Circuit breaker: demote still-blocking findings for tripped rules.
        let org_repo_hash = self
            .anonymizer
            .pseudonym(&invocation.repo.org_id, &invocation.repo.repo)?;
        for finding in findings.iter_mut() {
            if finding.outcome != Outcome::Block {
                continue;
            }
            let decision = self
                .breaker
                .check(&finding.rule_id, &org_repo_hash, now)
                .await?;
            if decision.tripped {
                finding.outcome = Outcome::Warn;
                finding.demotion_reason = Some(CIRCUIT_BREAKER.to_string());
                if degradation.is_none() {
                    degradation = Degradation::new(
                        CIRCUIT_BREAKER,
                        format!(
                            "rule {} tripped with {} recent blocks",
                            finding.rule_id, decision.recent_blocks
                        ),
                    );
                }
            }
        }

        // Report-boundary MAC verification is fail-closed by default.
        let quoted: Vec<RedactedText> = findings
            .iter()
            .flat_map(|f| f.evidence.iter().filter_map(|e| e.quoted.clone()))
            .collect();
        let validation = self
            .redactor
            .verify_report(&quoted, self.config.redaction.validation_policy, now)
            .await?;
        if !validation.accepted {
            let record = self.assemble(
                snapshot,
                invocation,
                Vec::new(),
                Outcome::Block,
                Degradation::new(
                    NONCE_VALIDATION,
                    format!("{} redacted values failed verification", validation.failures.len()),
                ),
                inputs_digest,
            )?;
            return Ok(Verdict {
                record,
                exit_code: 1,
            });
        }

        let decision = findings
            .iter()
            .map(|f| f.outcome)
            .max()
            .unwrap_or(Outcome::Pass);

        // Drain side-effects on this exit path. Store faults here follow the
        // same degrade-or-fail policy as reads.
        if let Err(err) = self
            .drain_side_effects(
                &evaluation.events,
                &evaluation.block_rule_ids,
                &org_repo_hash,
                invocation,
                now,
            )
            .await
        {
            self.degrade_or_fail(err, &mut degradation)?;
        }

        let record = self.assemble(
            snapshot,
            invocation,
            findings,
            decision,
            degradation.clone(),
            inputs_digest,
        )?;

        // BLOCK dominates; the degraded code only applies to runs that
        // would otherwise have passed.
        let exit_code = if record.decision == Outcome::Block {
            1
        } else if degradation.reason == STORE_UNAVAILABLE {
            match self.config.pipeline.tier {
                Tier::Community => 2,
                Tier::Paid => 1,
            }
        } else {
            0
        };

        info!(
            decision = record.decision.as_str(),
            findings = record.findings.len(),
            degradation = %record.degradation.reason,
            exit_code,
            "oracle run complete"
        );
        Ok(Verdict { record, exit_code })
    }

    /// Policy seam: infrastructure faults either degrade (stamping the
    /// record) or fail the run, decided once here.
    fn degrade_or_fail(
        &self,
        err: OracleError,
        degradation: &mut Degradation,
    ) -> OracleResult<()> {
        if err.is_expected() {
            return Ok(());
        }
        match err {
            OracleError::Store { .. } | OracleError::NotFound { .. } => {
                if self.config.pipeline.allow_degraded {
                    warn!(%err, "store unavailable; proceeding degraded");
                    metrics::counter!("oracle_degraded_total", 1);
                    if degradation.is_none() {
                        *degradation = Degradation::new(STORE_UNAVAILABLE, err.to_string());
                    }
                    Ok(())
                } else {
                    Err(OracleError::Degraded {
                        reason: err.to_string(),
                        can_proceed: false,
                    })
                }
            }
            other => Err(other),
        }
    }

    async fn collect_consensus(
        &self,
        now: DateTime<Utc>,
    ) -> OracleResult<HashMap<String, CalibrationResult>> {
        let Some(aggregator) = &self.aggregator else {
            return Ok(HashMap::new());
        };
        let mut consensus = HashMap::new();
        for rule in self.evaluator.registry_ids() {
            let result = aggregator.calibrate(&rule, now).await?;
            consensus.insert(rule, result);
        }
        Ok(consensus)
    }

    async fn drain_side_effects(
        &self,
        events: &[crate::fp_store::FpEvent],
        block_rule_ids: &[String],
        org_repo_hash: &str,
        invocation: &Invocation,
        now: DateTime<Utc>,
    ) -> OracleResult<()> {
        for event in events {
            match self.fp_store.record_event(event).await {
                Ok(()) => {}
                // Retries land here; the first write won.
                Err(OracleError::DuplicateEvent { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        for rule_id in block_rule_ids {
            self.block_counter
                .increment(rule_id, org_repo_hash, now)
                .await?;
        }
        if let (Some(service), Some(nonce)) = (&self.binding_service, &invocation.nonce) {
            for _ in events {
                service
                    .increment_usage(nonce, &invocation.repo.org_id)
                    .await?;
            }
        }
        // Drift runs double as the store's TTL hygiene pass.
        if invocation.mode == InvocationMode::Drift {
            let purged = self.fp_store.purge_expired(now).await?;
            if purged > 0 {
                info!(purged, "expired FP events purged during drift run");
            }
        }
        Ok(())
    }

    fn inputs_digest(
        &self,
        snapshot: &SnapshotState,
        evidence: &EvidenceSet,
        invocation: &Invocation,
    ) -> OracleResult<String> {
        #[derive(Serialize)]
        struct Inputs<'a> {
            snapshot: &'a SnapshotState,
            evidence: &'a EvidenceSet,
            repo: &'a RepoContext,
            mode: &'a str,
        }
        canonical_digest(&Inputs {
            snapshot,
            evidence,
            repo: &invocation.repo,
            mode: invocation.mode.as_str(),
        })
    }

    fn assemble(
        &self,
        snapshot: &SnapshotState,
        invocation: &Invocation,
        findings: Vec<Finding>,
        decision: Outcome,
        degradation: Degradation,
        inputs_digest: String,
    ) -> OracleResult<DecisionRecord> {
        Ok(DecisionRecord {
            meta: DecisionMeta {
                schema_hash: snapshot.schema_hash.clone(),
                generated_at: canonical_timestamp(invocation.now),
                engine_version: self.config.pipeline.engine_version.clone(),
                inputs_digest,
            },
            findings,
            decision,
            degradation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_counter::InMemoryBlockCounter;
    use crate::config::{L0Config, OracleConfig};
    use crate::fp_store::InMemoryFpEventStore;
    use crate::redaction::{NonceCache, RedactionPattern};
    use crate::rules::{builtin_rules, Evidence, EvidenceKind, RuleRegistry};
    use crate::secrets::InMemorySecretStore;
    use base64::Engine;
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeMap;

    struct Harness {
        oracle: Oracle,
        fp_store: Arc<InMemoryFpEventStore>,
        counter: Arc<InMemoryBlockCounter>,
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
    }

    async fn harness() -> Harness {
        let mut config = OracleConfig::default();
        config.l0 = L0Config {
            expected_schema_hash: "sha256:deadbeef".to_string(),
            required_permission_mask: 0b1100,
            max_drift_magnitude: 0.5,
            nonce_freshness_window_secs: 3600,
            min_nonce_epoch: 1,
            contraction_target: 1.0,
            contraction_epsilon: 1e-6,
        };
        config.anonymizer.test_mode = true;

        let secret_store = Arc::new(InMemorySecretStore::new());
        secret_store.insert(
            "oracle/redaction-nonce/v1",
            base64::engine::general_purpose::STANDARD.encode([3u8; 32]),
        );
        secret_store.insert("oracle/redaction-nonce/current", "v1");

        let redactor = Arc::new(Redactor::new(
            NonceCache::new(secret_store.clone(), config.redaction.clone()),
            vec![RedactionPattern::new("token", "tok_abc123")],
        ));
        let anonymizer = Arc::new(Anonymizer::new(
            secret_store.clone(),
            config.anonymizer.clone(),
        ));
        anonymizer.load_salt(fixed_now()).await.unwrap();

        let fp_store = Arc::new(InMemoryFpEventStore::new());
        let counter = Arc::new(InMemoryBlockCounter::new(24));
        let evaluator = L1Evaluator::new(
            Arc::new(RuleRegistry::new(builtin_rules()).unwrap()),
            fp_store.clone(),
            redactor.clone(),
            config.fp_store.clone(),
        );
        let breaker = CircuitBreaker::new(config.breaker.clone(), counter.clone());
        let l0 = L0Checker::new(config.l0.clone()).unwrap();

        Harness {
            oracle: Oracle::new(
                config,
                l0,
                evaluator,
                redactor,
                anonymizer,
                breaker,
                counter.clone(),
                fp_store.clone(),
                None,
                None,
            ),
            fp_store,
            counter,
        }
    }

    fn good_snapshot(now: DateTime<Utc>) -> SnapshotState {
        SnapshotState::builder()
            .schema_hash("sha256:deadbeef")
            .permission_bits(0b1111)
            .drift_magnitude(0.1)
            .nonce_epoch(2)
            .nonce_issued_at(now - Duration::minutes(5))
            .contraction_witness(1.0)
            .build()
            .unwrap()
    }

    fn invocation(now: DateTime<Utc>) -> Invocation {
        Invocation {
            mode: InvocationMode::PullRequest,
            repo: RepoContext {
                org_id: "acme".to_string(),
                repo: "widgets".to_string(),
                branch: "main".to_string(),
            },
            now,
            nonce: None,
        }
    }

    fn drift_evidence() -> Evidence {
        let mut attributes = BTreeMap::new();
        attributes.insert("field".to_string(), "owner".to_string());
        attributes.insert("declared".to_string(), "team-a".to_string());
        attributes.insert("observed".to_string(), "team-b".to_string());
        Evidence {
            kind: EvidenceKind::ManifestField,
            path: "manifest.yaml".to_string(),
            line_range: Some((1, 3)),
            attributes,
            quoted: None,
        }
    }

    #[tokio::test]
    async fn test_clean_run_passes_with_exit_zero() {
        let h = harness().await;
        let now = fixed_now();
        let verdict = h
            .oracle
            .run(&good_snapshot(now), EvidenceSet::default(), &invocation(now))
            .await
            .unwrap();
        assert_eq!(verdict.record.decision, Outcome::Pass);
        assert!(verdict.record.degradation.is_none());
        assert!(verdict.record.findings.is_empty());
        assert_eq!(verdict.exit_code, 0);
    }

    #[tokio::test]
    async fn test_l0_violation_blocks_with_exit_one() {
        let h = harness().await;
        let now = fixed_now();
        let mut snapshot = good_snapshot(now);
        snapshot.permission_bits = 0b0101;

        let verdict = h
            .oracle
            .run(&snapshot, EvidenceSet::default(), &invocation(now))
            .await
            .unwrap();
        assert_eq!(verdict.record.decision, Outcome::Block);
        assert_eq!(verdict.record.degradation.reason, L0_VIOLATION);
        assert!(verdict
            .record
            .degradation
            .details
            .as_ref()
            .unwrap()
            .contains("permission_bits"));
        assert_eq!(verdict.exit_code, 1);
        // Terminal: no rule ran, no events recorded.
        assert!(h.fp_store.is_empty());
    }

    #[tokio::test]
    async fn test_block_finding_blocks_and_records_side_effects() {
        let h = harness().await;
        let now = fixed_now();
        let verdict = h
            .oracle
            .run(
                &good_snapshot(now),
                EvidenceSet::new(vec![drift_evidence()]),
                &invocation(now),
            )
            .await
            .unwrap();

        assert_eq!(verdict.record.decision, Outcome::Block);
        assert_eq!(verdict.exit_code, 1);
        assert_eq!(verdict.record.findings.len(), 1);
        assert_eq!(verdict.record.findings[0].rule_id, "MD-001");

        // Side-effects drained: one event, one block increment.
        assert_eq!(h.fp_store.len(), 1);
        let window = h.fp_store.window_by_count("MD-001", 10).await.unwrap();
        assert_eq!(window.statistics.total, 1);
    }

    #[tokio::test]
    async fn test_tripped_breaker_demotes_to_warn() {
        let h = harness().await;
        let now = fixed_now();
        // 12 recent blocks against a threshold of 10.
        let hash = h
            .oracle
            .anonymizer
            .pseudonym("acme", "widgets")
            .unwrap();
        for _ in 0..12 {
            h.counter.increment("MD-001", &hash, now).await.unwrap();
        }

        let verdict = h
            .oracle
            .run(
                &good_snapshot(now),
                EvidenceSet::new(vec![drift_evidence()]),
                &invocation(now),
            )
            .await
            .unwrap();

        assert_eq!(verdict.record.decision, Outcome::Warn);
        assert_eq!(verdict.record.degradation.reason, CIRCUIT_BREAKER);
        assert!(verdict
            .record
            .degradation
            .details
            .as_ref()
            .unwrap()
            .contains("MD-001"));
        assert_eq!(
            verdict.record.findings[0].demotion_reason.as_deref(),
            Some(CIRCUIT_BREAKER)
        );
        // The event is still recorded for observability.
        assert_eq!(h.fp_store.len(), 1);
        // WARN is not a blocking exit.
        assert_eq!(verdict.exit_code, 0);
    }

    #[tokio::test]
    async fn test_byte_identical_records_for_identical_inputs() {
        let h = harness().await;
        let now = fixed_now();
        let evidence = || EvidenceSet::new(vec![drift_evidence()]);

        let first = h
            .oracle
            .run(&good_snapshot(now), evidence(), &invocation(now))
            .await
            .unwrap();
        let second = h
            .oracle
            .run(&good_snapshot(now), evidence(), &invocation(now))
            .await
            .unwrap();

        assert_eq!(
            first.record.to_canonical_json().unwrap(),
            second.record.to_canonical_json().unwrap()
        );
    }

    #[tokio::test]
    async fn test_canonical_json_key_order() {
        let h = harness().await;
        let now = fixed_now();
        let verdict = h
            .oracle
            .run(&good_snapshot(now), EvidenceSet::default(), &invocation(now))
            .await
            .unwrap();
        let json = verdict.record.to_canonical_json().unwrap();
        // Top-level keys in lexicographic order.
        let decision_pos = json.find("\"decision\"").unwrap();
        let degradation_pos = json.find("\"degradation\"").unwrap();
        let findings_pos = json.find("\"findings\"").unwrap();
        let meta_pos = json.find("\"meta\"").unwrap();
        assert!(decision_pos < degradation_pos);
        assert!(degradation_pos < findings_pos);
        assert!(findings_pos < meta_pos);
        assert!(json.contains("\"generated_at\":\"2024-06-15T12:00:00.000Z\""));
    }

    struct FailingFpStore;

    #[async_trait::async_trait]
    impl crate::fp_store::FpEventStore for FailingFpStore {
        async fn record_event(&self, event: &crate::fp_store::FpEvent) -> crate::error::OracleResult<()> {
            Err(OracleError::store(
                "record_event",
                format!("({}, {})", event.rule_id, event.event_id),
                std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "down"),
            ))
        }
        async fn mark_false_positive(
            &self,
            finding_id: &str,
            _reviewer: &str,
            _ticket: Option<&str>,
            _now: DateTime<Utc>,
        ) -> crate::error::OracleResult<crate::fp_store::FpEvent> {
            Err(OracleError::store(
                "mark_false_positive",
                finding_id.to_string(),
                std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "down"),
            ))
        }
        async fn window_by_count(
            &self,
            rule_id: &str,
            _n: usize,
        ) -> crate::error::OracleResult<crate::fp_store::FpWindow> {
            Err(OracleError::store(
                "window_by_count",
                rule_id.to_string(),
                std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "down"),
            ))
        }
        async fn window_by_since(
            &self,
            rule_id: &str,
            _since: DateTime<Utc>,
        ) -> crate::error::OracleResult<crate::fp_store::FpWindow> {
            Err(OracleError::store(
                "window_by_since",
                rule_id.to_string(),
                std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "down"),
            ))
        }
        async fn events_for_rule(
            &self,
            rule_id: &str,
        ) -> crate::error::OracleResult<Vec<crate::fp_store::FpEvent>> {
            Err(OracleError::store(
                "events_for_rule",
                rule_id.to_string(),
                std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "down"),
            ))
        }
        async fn purge_expired(&self, _now: DateTime<Utc>) -> crate::error::OracleResult<u64> {
            Ok(0)
        }
    }

    async fn degraded_harness(tier: Tier) -> Oracle {
        let mut config = OracleConfig::default();
        config.l0.expected_schema_hash = "sha256:deadbeef".to_string();
        config.l0.required_permission_mask = 0b1100;
        config.l0.min_nonce_epoch = 1;
        config.anonymizer.test_mode = true;
        config.pipeline.tier = tier;

        let secret_store = Arc::new(InMemorySecretStore::new());
        secret_store.insert(
            "oracle/redaction-nonce/v1",
            base64::engine::general_purpose::STANDARD.encode([3u8; 32]),
        );
        secret_store.insert("oracle/redaction-nonce/current", "v1");

        let redactor = Arc::new(Redactor::new(
            NonceCache::new(secret_store.clone(), config.redaction.clone()),
            Vec::new(),
        ));
        let anonymizer = Arc::new(Anonymizer::new(
            secret_store.clone(),
            config.anonymizer.clone(),
        ));
        anonymizer.load_salt(fixed_now()).await.unwrap();

        let fp_store: Arc<dyn crate::fp_store::FpEventStore> = Arc::new(FailingFpStore);
        let counter = Arc::new(InMemoryBlockCounter::new(24));
        let evaluator = L1Evaluator::new(
            Arc::new(RuleRegistry::new(builtin_rules()).unwrap()),
            Arc::clone(&fp_store),
            redactor.clone(),
            config.fp_store.clone(),
        );
        let breaker = CircuitBreaker::new(config.breaker.clone(), counter.clone());
        let l0 = L0Checker::new(config.l0.clone()).unwrap();

        Oracle::new(
            config,
            l0,
            evaluator,
            redactor,
            anonymizer,
            breaker,
            counter,
            fp_store,
            None,
            None,
        )
    }

    #[tokio::test]
    async fn test_store_outage_degrades_community_to_exit_two() {
        let oracle = degraded_harness(Tier::Community).await;
        let now = fixed_now();
        let verdict = oracle
            .run(
                &good_snapshot(now),
                EvidenceSet::new(vec![drift_evidence()]),
                &invocation(now),
            )
            .await
            .unwrap();
        assert_eq!(verdict.record.degradation.reason, STORE_UNAVAILABLE);
        // Evaluation could not complete; the degraded record carries no
        // findings and the community tier proceeds with exit 2.
        assert!(verdict.record.findings.is_empty());
        assert_eq!(verdict.exit_code, 2);
    }

    #[tokio::test]
    async fn test_store_outage_paid_tier_fails_closed_exit_one() {
        let oracle = degraded_harness(Tier::Paid).await;
        let now = fixed_now();
        let verdict = oracle
            .run(
                &good_snapshot(now),
                EvidenceSet::new(vec![drift_evidence()]),
                &invocation(now),
            )
            .await
            .unwrap();
        assert_eq!(verdict.record.degradation.reason, STORE_UNAVAILABLE);
        assert_eq!(verdict.exit_code, 1);
    }

    #[tokio::test]
    async fn test_store_outage_fail_closed_policy_errors() {
        let mut oracle = degraded_harness(Tier::Community).await;
        oracle.config.pipeline.allow_degraded = false;
        let now = fixed_now();
        let err = oracle
            .run(
                &good_snapshot(now),
                EvidenceSet::new(vec![drift_evidence()]),
                &invocation(now),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OracleError::Degraded {
                can_proceed: false,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_duplicate_event_on_rerun_is_tolerated() {
        // Two runs at the same instant produce equal finding ids but
        // distinct event ids; even if an event id collided, the drain
        // tolerates DuplicateEvent.
        let h = harness().await;
        let now = fixed_now();
        let evidence = || EvidenceSet::new(vec![drift_evidence()]);
        h.oracle
            .run(&good_snapshot(now), evidence(), &invocation(now))
            .await
            .unwrap();
        h.oracle
            .run(&good_snapshot(now), evidence(), &invocation(now))
            .await
            .unwrap();
        assert_eq!(h.fp_store.len(), 2);
    }
}
