//! L1 Evaluator
//!
//! Runs every registered rule against the invocation input, wraps quoted
//! evidence through the redaction layer, and applies false-positive
//! suppression: a BLOCK whose rule shows a high observed FPR *and* whose
//! context matches a reviewed false positive demotes to WARN.
//!
//! The evaluator is deterministic: rules run in lexicographic id order and
//! findings within a rule are sorted by evidence path then line range. It
//! queues side-effects (event records, block increments) for the pipeline
//! to drain; it never writes stores itself.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::{
    context_hash, finding_id, EvaluationInput, Finding, FindingEvidence, RuleRegistry,
    RuleViolation,
};
use crate::calibration::CalibrationResult;
use crate::config::FpStoreConfig;
use crate::error::OracleResult;
use crate::fp_store::{FpEvent, FpEventContext, FpEventStore, FpWindow, Outcome};
use crate::redaction::Redactor;

/// Reason stamped on findings demoted by FP suppression.
pub const FPR_SUPPRESSION: &str = "FPR_SUPPRESSION";

/// Everything one evaluation pass produced.
#[derive(Debug, Default)]
pub struct RuleEvaluation {
    /// Findings in canonical order, outcomes post-suppression.
    pub findings: Vec<Finding>,
    /// Events to record, one per finding.
    pub events: Vec<FpEvent>,
    /// Rule ids to increment the block counter for, one per BLOCK finding.
    pub block_rule_ids: Vec<String>,
}

/// The evaluator over the registry, the FP store, and the redactor.
pub struct L1Evaluator {
    registry: Arc<RuleRegistry>,
    fp_store: Arc<dyn FpEventStore>,
    redactor: Arc<Redactor>,
    config: FpStoreConfig,
}

impl L1Evaluator {
    pub fn new(
        registry: Arc<RuleRegistry>,
        fp_store: Arc<dyn FpEventStore>,
        redactor: Arc<Redactor>,
        config: FpStoreConfig,
    ) -> Self {
        Self {
            registry,
            fp_store,
            redactor,
            config,
        }
    }

    /// Rule ids in canonical order, for consensus prefetch.
    pub fn registry_ids(&self) -> Vec<String> {
        self.registry
            .iter()
            .map(|r| r.rule_id().to_string())
            .collect()
    }

    /// Evaluate all rules. `consensus` carries any precomputed calibration
    /// results keyed by rule id; `high_confidence_level` gates their use.
    pub async fn evaluate_all(
        &self,
        input: &EvaluationInput,
        consensus: &HashMap<String, CalibrationResult>,
        high_confidence_level: f64,
        invocation_mode: &str,
        now: DateTime<Utc>,
    ) -> OracleResult<RuleEvaluation> {
        let mut evaluation = RuleEvaluation::default();

        for rule in self.registry.iter() {
            let mut violations = rule.evaluate(input);
            sort_violations(&mut violations);
            if violations.is_empty() {
                continue;
            }

            let window = self
                .fp_store
                .window_by_count(rule.rule_id(), self.config.default_window_size)
                .await?;
            let local_fpr = window.statistics.observed_fpr;
            let threshold = rule
                .local_fpr_threshold()
                .unwrap_or(self.config.critical_fpr);
            let consensus_fpr = consensus
                .get(rule.rule_id())
                .filter(|r| r.is_high_confidence(high_confidence_level))
                .and_then(|r| r.consensus_fp_rate);
            // The demotion test uses the higher of the local and network
            // estimates.
            let effective_fpr = consensus_fpr.map_or(local_fpr, |c| c.max(local_fpr));

            for violation in violations {
                let finding = self
                    .build_finding(rule.rule_id(), rule.rule_version(), rule.severity(), violation, input, now)
                    .await?;
                let finding =
                    apply_suppression(finding, effective_fpr, threshold, &window);

                evaluation.events.push(FpEvent {
                    event_id: Uuid::new_v4().to_string(),
                    rule_id: finding.rule_id.clone(),
                    rule_version: finding.rule_version.clone(),
                    finding_id: finding.finding_id.clone(),
                    outcome: finding.outcome,
                    is_false_positive: false,
                    timestamp: now,
                    context: FpEventContext {
                        org_id: input.repo.org_id.clone(),
                        repo: input.repo.repo.clone(),
                        branch: input.repo.branch.clone(),
                        event_type: invocation_mode.to_string(),
                        context_hash: Some(finding.context_hash.clone()),
                    },
                    reviewer: None,
                    reviewed_at: None,
                    suppression_ticket: None,
                    expires_at: now + chrono::Duration::days(self.config.event_ttl_days),
                });
                if finding.outcome == Outcome::Block {
                    evaluation.block_rule_ids.push(finding.rule_id.clone());
                }
                evaluation.findings.push(finding);
            }
        }

        debug!(
            findings = evaluation.findings.len(),
            blocks = evaluation.block_rule_ids.len(),
            "rule evaluation complete"
        );
        Ok(evaluation)
    }

    async fn build_finding(
        &self,
        rule_id: &str,
        rule_version: &str,
        severity: super::Severity,
        violation: RuleViolation,
        input: &EvaluationInput,
        now: DateTime<Utc>,
    ) -> OracleResult<Finding> {
        let id = finding_id(rule_id, &input.repo, &violation.evidence)?;
        let primary_path = violation
            .evidence
            .first()
            .map(|e| e.path.as_str())
            .unwrap_or("");
        let ctx_hash = context_hash(rule_id, primary_path, &input.repo);

        let mut finding_evidence = Vec::with_capacity(violation.evidence.len());
        for evidence in violation.evidence {
            let quoted = match &evidence.quoted {
                Some(raw) => Some(self.redactor.redact(raw, now).await?),
                None => None,
            };
            finding_evidence.push(FindingEvidence {
                kind: evidence.kind,
                path: evidence.path,
                line_range: evidence.line_range,
                attributes: evidence.attributes,
                quoted,
            });
        }

        Ok(Finding {
            finding_id: id,
            rule_id: rule_id.to_string(),
            rule_version: rule_version.to_string(),
            severity,
            outcome: violation.outcome,
            message: violation.message,
            evidence: finding_evidence,
            context_hash: ctx_hash,
            demotion_reason: None,
        })
    }
}

fn sort_violations(violations: &mut [RuleViolation]) {
    violations.sort_by(|a, b| {
        let path_a = a.evidence.first().map(|e| e.path.as_str()).unwrap_or("");
        let path_b = b.evidence.first().map(|e| e.path.as_str()).unwrap_or("");
        path_a
            .cmp(path_b)
            .then_with(|| {
                let lines_a = a.evidence.first().and_then(|e| e.line_range);
                let lines_b = b.evidence.first().and_then(|e| e.line_range);
                lines_a.cmp(&lines_b)
            })
    });
}

/// Demote a BLOCK to WARN when the rule's effective FPR crosses the
/// threshold and the finding's context matches a reviewed false positive in
/// the window.
fn apply_suppression(
    mut finding: Finding,
    effective_fpr: f64,
    threshold: f64,
    window: &FpWindow,
) -> Finding {
    if finding.outcome != Outcome::Block || effective_fpr < threshold {
        return finding;
    }
    let known_fp_context = window.events.iter().any(|event| {
        event.is_false_positive
            && event.context.context_hash.as_deref() == Some(finding.context_hash.as_str())
    });
    if known_fp_context {
        debug!(
            rule_id = %finding.rule_id,
            finding_id = %finding.finding_id,
            effective_fpr,
            "demoting BLOCK to WARN on FP suppression"
        );
        finding.outcome = Outcome::Warn;
        finding.demotion_reason = Some(FPR_SUPPRESSION.to_string());
    }
    finding
}
