//! Calibration Aggregator
//!
//! Computes the network consensus false-positive rate per rule from
//! consenting, participating contributors. Contributors are bucketed by
//! pseudonym, never disclosed; no aggregate leaves this module unless at
//! least `k_anonymity_floor` distinct contributors stand behind it.
//!
//! # Byzantine filtering
//!
//! Applied only once the contributor count reaches
//! `min_contributors_for_filtering`:
//!
//! 1. Leave-one-out z-score on per-contributor FPRs: a contributor whose
//!    rate sits more than `byzantine_z_threshold` sigmas from the rest is
//!    dropped. (A plain z-score can never exceed ~sqrt(n) at small n, which
//!    would make the filter inert exactly where poisoning is cheapest.)
//! 2. The bottom `byzantine_percentile` of the original pool by reputation
//!    is dropped as well; contributors caught by both filters count once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::debug;

use crate::anonymizer::Anonymizer;
use crate::config::CalibrationConfig;
use crate::error::{OracleError, OracleResult};
use crate::fp_store::{ConsentStore, FpEvent, FpEventStore};
use crate::reputation::ReputationEngine;

/// Confidence category thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceCategory {
    High,
    Medium,
    Low,
    Insufficient,
}

impl ConfidenceCategory {
    pub fn from_level(level: f64) -> Self {
        if level >= 0.75 {
            Self::High
        } else if level >= 0.5 {
            Self::Medium
        } else if level >= 0.25 {
            Self::Low
        } else {
            Self::Insufficient
        }
    }
}

/// The four confidence inputs, each in [0,1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ConfidenceFactors {
    pub contributor_count: f64,
    pub agreement: f64,
    pub event_count: f64,
    pub mean_reputation: f64,
}

/// Blended confidence. The blend is the geometric mean of the four factors,
/// so one near-zero factor drags the level down instead of averaging away.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Confidence {
    pub level: f64,
    pub category: ConfidenceCategory,
    pub factors: ConfidenceFactors,
    pub reason: Option<String>,
}

impl Confidence {
    fn insufficient(reason: impl Into<String>) -> Self {
        Self {
            level: 0.0,
            category: ConfidenceCategory::Insufficient,
            factors: ConfidenceFactors::default(),
            reason: Some(reason.into()),
        }
    }
}

/// What the Byzantine filter did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ByzantineFilterSummary {
    pub applied: bool,
    pub z_outliers_dropped: usize,
    pub low_reputation_dropped: usize,
    /// Dropped contributors over the original pool.
    pub filter_rate: f64,
}

/// Per-rule aggregation output. Never mutated after construction and never
/// carries contributor identities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    pub rule_id: String,
    /// Absent below the k-anonymity floor.
    pub consensus_fp_rate: Option<f64>,
    pub confidence: Confidence,
    pub trusted_contributor_count: usize,
    pub total_contributor_count: usize,
    pub total_event_count: u64,
    pub byzantine_filter: ByzantineFilterSummary,
    pub calculated_at: DateTime<Utc>,
}

impl CalibrationResult {
    /// Whether this result is strong enough to participate in L1 demotion.
    pub fn is_high_confidence(&self, min_level: f64) -> bool {
        self.consensus_fp_rate.is_some() && self.confidence.level >= min_level
    }
}

/// One contributor's aggregated slice. Internal only.
struct Contributor {
    org_id: String,
    pseudonym: String,
    fpr: f64,
    event_count: u64,
    weight: f64,
    reputation_score: f64,
}

/// The aggregator over its four collaborators.
pub struct CalibrationAggregator {
    config: CalibrationConfig,
    fp_store: Arc<dyn FpEventStore>,
    consent_store: Arc<dyn ConsentStore>,
    reputation: Arc<ReputationEngine>,
    anonymizer: Arc<Anonymizer>,
}

impl CalibrationAggregator {
    pub fn new(
        config: CalibrationConfig,
        fp_store: Arc<dyn FpEventStore>,
        consent_store: Arc<dyn ConsentStore>,
        reputation: Arc<ReputationEngine>,
        anonymizer: Arc<Anonymizer>,
    ) -> Self {
        Self {
            config,
            fp_store,
            consent_store,
            reputation,
            anonymizer,
        }
    }

    /// Aggregate a rule. Deterministic given the store contents and `now`.
    pub async fn calibrate(
        &self,
        rule_id: &str,
        now: DateTime<Utc>,
    ) -> OracleResult<CalibrationResult> {
        // One snapshot of the rule slice; everything below works off it.
        let events = self.fp_store.events_for_rule(rule_id).await?;

        let mut by_org: HashMap<String, Vec<FpEvent>> = HashMap::new();
        for event in events {
            by_org
                .entry(event.context.org_id.clone())
                .or_default()
                .push(event);
        }
        // Stable iteration order for determinism.
        let mut org_ids: Vec<String> = by_org.keys().cloned().collect();
        org_ids.sort_unstable();

        let contributors = self.eligible_contributors(org_ids, &by_org, now).await?;
        // The disclosure floor is defined over distinct pseudonyms, which is
        // what an observer of the aggregate could ever distinguish.
        let total_contributor_count = contributors
            .iter()
            .map(|c| c.pseudonym.as_str())
            .collect::<std::collections::HashSet<_>>()
            .len();
        let total_event_count: u64 = contributors.iter().map(|c| c.event_count).sum();

        if total_contributor_count < self.config.k_anonymity_floor {
            debug!(
                rule_id,
                contributors = total_contributor_count,
                floor = self.config.k_anonymity_floor,
                "below k-anonymity floor"
            );
            return Ok(CalibrationResult {
                rule_id: rule_id.to_string(),
                consensus_fp_rate: None,
                confidence: Confidence::insufficient(format!(
                    "{total_contributor_count} consenting contributors, k-anonymity floor is {}",
                    self.config.k_anonymity_floor
                )),
                trusted_contributor_count: 0,
                total_contributor_count,
                total_event_count,
                byzantine_filter: ByzantineFilterSummary::default(),
                calculated_at: now,
            });
        }

        let (surviving, summary) = self.byzantine_filter(contributors);
        let trusted_contributor_count = surviving.len();

        let weight_sum: f64 = surviving.iter().map(|c| c.weight).sum();
        if weight_sum <= 0.0 {
            return Ok(CalibrationResult {
                rule_id: rule_id.to_string(),
                consensus_fp_rate: None,
                confidence: Confidence::insufficient(
                    "surviving contributors carry zero aggregate weight",
                ),
                trusted_contributor_count,
                total_contributor_count,
                total_event_count,
                byzantine_filter: summary,
                calculated_at: now,
            });
        }

        let consensus_fp_rate =
            surviving.iter().map(|c| c.weight * c.fpr).sum::<f64>() / weight_sum;
        let confidence = self.confidence(&surviving);

        metrics::counter!("oracle_calibration_computed_total", 1);
        Ok(CalibrationResult {
            rule_id: rule_id.to_string(),
            consensus_fp_rate: Some(consensus_fp_rate),
            confidence,
            trusted_contributor_count,
            total_contributor_count,
            total_event_count,
            byzantine_filter: summary,
            calculated_at: now,
        })
    }

    /// Filter orgs to consenting network participants, with read fan-out
    /// bounded by `max_concurrent_reads`.
    async fn eligible_contributors(
        &self,
        org_ids: Vec<String>,
        by_org: &HashMap<String, Vec<FpEvent>>,
        now: DateTime<Utc>,
    ) -> OracleResult<Vec<Contributor>> {
        let mut eligible: Vec<(String, f64, f64)> = Vec::new();

        for chunk in org_ids.chunks(self.config.max_concurrent_reads) {
            let mut join_set = JoinSet::new();
            for org_id in chunk {
                let org_id = org_id.clone();
                let consent_store = Arc::clone(&self.consent_store);
                let reputation = Arc::clone(&self.reputation);
                join_set.spawn(async move {
                    let consent = consent_store.latest_consent(&org_id).await?;
                    let admitted = consent
                        .map(|c| c.admits_calibration(now))
                        .unwrap_or(false);
                    if !admitted || !reputation.can_participate(&org_id).await? {
                        return Ok::<_, OracleError>(None);
                    }
                    let weight = reputation.weight_for(&org_id).await?;
                    let score = reputation
                        .store()
                        .get_reputation(&org_id)
                        .await?
                        .map(|r| r.reputation_score)
                        .unwrap_or(0.0);
                    Ok(Some((org_id, weight, score)))
                });
            }
            while let Some(joined) = join_set.join_next().await {
                let result = joined
                    .map_err(|e| OracleError::store("eligibility_check", "calibration", e))??;
                if let Some(entry) = result {
                    eligible.push(entry);
                }
            }
        }
        // Join order is nondeterministic; restore the canonical order.
        eligible.sort_by(|a, b| a.0.cmp(&b.0));

        let mut contributors = Vec::with_capacity(eligible.len());
        for (org_id, weight, reputation_score) in eligible {
            let events = &by_org[&org_id];
            let total = events.len();
            let pending = events.iter().filter(|e| e.is_pending()).count();
            let false_positives = events.iter().filter(|e| e.is_false_positive).count();
            let fpr = false_positives as f64 / (total - pending).max(1) as f64;

            let pseudonym = self.anonymizer.org_pseudonym(&org_id)?;
            contributors.push(Contributor {
                org_id,
                pseudonym,
                fpr,
                event_count: total as u64,
                weight,
                reputation_score,
            });
        }
        Ok(contributors)
    }

    fn byzantine_filter(
        &self,
        contributors: Vec<Contributor>,
    ) -> (Vec<Contributor>, ByzantineFilterSummary) {
        let original = contributors.len();
        if original < self.config.min_contributors_for_filtering {
            return (
                contributors,
                ByzantineFilterSummary {
                    applied: false,
                    ..ByzantineFilterSummary::default()
                },
            );
        }

        // Leave-one-out z-score per contributor.
        let mut z_dropped: Vec<bool> = vec![false; original];
        for i in 0..original {
            let others: Vec<f64> = contributors
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, c)| c.fpr)
                .collect();
            let mean = others.iter().sum::<f64>() / others.len() as f64;
            let variance = others
                .iter()
                .map(|v| (v - mean).powi(2))
                .sum::<f64>()
                / others.len() as f64;
            let std_dev = variance.sqrt();
            let deviation = (contributors[i].fpr - mean).abs();
            let is_outlier = if std_dev > 0.0 {
                deviation / std_dev > self.config.byzantine_z_threshold
            } else {
                deviation > 1e-9
            };
            if is_outlier {
                z_dropped[i] = true;
            }
        }

        // Bottom percentile of the original pool by reputation.
        let percentile_count =
            (original as f64 * self.config.byzantine_percentile).floor() as usize;
        let mut by_reputation: Vec<usize> = (0..original).collect();
        by_reputation.sort_by(|&a, &b| {
            contributors[a]
                .reputation_score
                .partial_cmp(&contributors[b].reputation_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| contributors[a].org_id.cmp(&contributors[b].org_id))
        });
        let mut reputation_dropped: Vec<bool> = vec![false; original];
        for &index in by_reputation.iter().take(percentile_count) {
            reputation_dropped[index] = true;
        }

        let z_outliers_dropped = z_dropped.iter().filter(|&&d| d).count();
        let low_reputation_dropped = reputation_dropped
            .iter()
            .zip(&z_dropped)
            .filter(|(&by_rep, &by_z)| by_rep && !by_z)
            .count();

        let surviving: Vec<Contributor> = contributors
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !z_dropped[*i] && !reputation_dropped[*i])
            .map(|(_, c)| c)
            .collect();

        let dropped = original - surviving.len();
        (
            surviving,
            ByzantineFilterSummary {
                applied: true,
                z_outliers_dropped,
                low_reputation_dropped,
                filter_rate: dropped as f64 / original as f64,
            },
        )
    }

    fn confidence(&self, surviving: &[Contributor]) -> Confidence {
        let n = surviving.len();
        if n == 0 {
            return Confidence::insufficient("no contributors survived filtering");
        }

        let contributor_count = (n as f64 / 10.0).min(1.0);

        let fprs: Vec<f64> = surviving.iter().map(|c| c.fpr).collect();
        let mean = fprs.iter().sum::<f64>() / n as f64;
        let variance = fprs.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
        // Dispersion normalised against 0.25 std-dev of a rate, the most a
        // "roughly agreeing" pool plausibly shows.
        let agreement = (1.0 - (variance.sqrt() / 0.25)).clamp(0.0, 1.0);

        let events: u64 = surviving.iter().map(|c| c.event_count).sum();
        let event_count = (events as f64 / 100.0).min(1.0);

        let mean_reputation =
            surviving.iter().map(|c| c.reputation_score).sum::<f64>() / n as f64;

        let factors = ConfidenceFactors {
            contributor_count,
            agreement,
            event_count,
            mean_reputation,
        };
        let level = (factors.contributor_count
            * factors.agreement
            * factors.event_count
            * factors.mean_reputation)
            .powf(0.25);

        Confidence {
            level,
            category: ConfidenceCategory::from_level(level),
            factors,
            reason: None,
        }
    }
}
