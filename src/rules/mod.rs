//! Rule Registry
//!
//! Rules are closed-world: the full set is handed to the registry at
//! construction, identified by `(rule_id, rule_version)`, and executed in
//! lexicographic `rule_id` order. A rule declares the evidence kinds it
//! needs, its severity, and a predicate over the evidence set; it never
//! touches stores, clocks, or the network.

pub mod builtin;
pub mod evaluator;

pub use builtin::builtin_rules;
pub use evaluator::{L1Evaluator, RuleEvaluation};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::canonical::{canonical_digest, sha256_hex, PayloadBuilder};
use crate::error::{OracleError, OracleResult};
use crate::fp_store::Outcome;
use crate::redaction::RedactedText;

/// Rule severity. Drives the default outcome mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Default outcome for a violation at this severity.
    pub fn default_outcome(&self) -> Outcome {
        match self {
            Self::Low | Self::Medium => Outcome::Warn,
            Self::High | Self::Critical => Outcome::Block,
        }
    }
}

/// The kinds of evidence the scanning front-end can supply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    /// A declared manifest field and its observed repository counterpart.
    ManifestField,
    /// A permission grant (requested vs approved bitsets).
    PermissionGrant,
    /// A cross-document reference.
    Reference,
    /// A declared/observed version pair.
    VersionPair,
    /// A quoted text span.
    TextSpan,
}

/// One piece of evidence as supplied by the front-end. Quoted text here is
/// raw; it is wrapped through the redaction layer before it can appear in a
/// finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub kind: EvidenceKind,
    /// Repository-relative path the evidence points at.
    pub path: String,
    /// 1-based inclusive line range, when line-addressable.
    pub line_range: Option<(u32, u32)>,
    /// Kind-specific attributes.
    pub attributes: BTreeMap<String, String>,
    /// Raw quoted text, if any.
    pub quoted: Option<String>,
}

impl Evidence {
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// The evidence set for one invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvidenceSet {
    items: Vec<Evidence>,
}

impl EvidenceSet {
    pub fn new(items: Vec<Evidence>) -> Self {
        Self { items }
    }

    pub fn of_kind(&self, kind: EvidenceKind) -> impl Iterator<Item = &Evidence> {
        self.items.iter().filter(move |e| e.kind == kind)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

/// Repository coordinates for the invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RepoContext {
    pub org_id: String,
    pub repo: String,
    pub branch: String,
}

/// Everything a rule sees.
#[derive(Debug, Clone)]
pub struct EvaluationInput {
    pub repo: RepoContext,
    pub evidence: EvidenceSet,
}

/// A violation as a rule reports it, before redaction and demotion.
#[derive(Debug, Clone)]
pub struct RuleViolation {
    pub message: String,
    pub evidence: Vec<Evidence>,
    /// Outcome before suppression; defaults to the severity mapping.
    pub outcome: Outcome,
}

/// A closed-world governance rule.
pub trait Rule: Send + Sync {
    fn rule_id(&self) -> &str;
    fn rule_version(&self) -> &str;
    fn severity(&self) -> Severity;
    /// Evidence kinds this rule consumes. Evaluation still runs when none
    /// are present; the rule simply finds nothing.
    fn required_kinds(&self) -> &[EvidenceKind];
    fn evaluate(&self, input: &EvaluationInput) -> Vec<RuleViolation>;
    /// Per-rule override for the local FPR demotion threshold.
    fn local_fpr_threshold(&self) -> Option<f64> {
        None
    }
}

/// Redacted evidence as it appears inside a finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindingEvidence {
    pub kind: EvidenceKind,
    pub path: String,
    pub line_range: Option<(u32, u32)>,
    pub attributes: BTreeMap<String, String>,
    /// Quoted text, MAC-wrapped. Raw text never reaches a finding.
    pub quoted: Option<RedactedText>,
}

/// One finalised rule-evaluation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub finding_id: String,
    pub rule_id: String,
    pub rule_version: String,
    pub severity: Severity,
    pub outcome: Outcome,
    pub message: String,
    pub evidence: Vec<FindingEvidence>,
    /// Stable context hash used for known-FP matching.
    pub context_hash: String,
    /// Set when suppression or the breaker downgraded the outcome.
    pub demotion_reason: Option<String>,
}

/// Stable context hash: the rule, the primary evidence path, and the repo.
/// Independent of finding-id assignment order and of line ranges, so a
/// finding that moves a few lines still matches its reviewed history.
pub fn context_hash(rule_id: &str, primary_path: &str, repo: &RepoContext) -> String {
    let payload = PayloadBuilder::new()
        .text_field("rule_id", rule_id)
        .text_field("path", primary_path)
        .text_field("repo", &format!("{}/{}", repo.org_id, repo.repo))
        .finish();
    sha256_hex(&payload)
}

/// Deterministic finding id from the rule and its evidence coordinates.
pub fn finding_id(
    rule_id: &str,
    repo: &RepoContext,
    evidence: &[Evidence],
) -> OracleResult<String> {
    #[derive(Serialize)]
    struct IdInput<'a> {
        rule_id: &'a str,
        org_id: &'a str,
        repo: &'a str,
        paths: Vec<&'a str>,
        lines: Vec<Option<(u32, u32)>>,
    }
    let digest = canonical_digest(&IdInput {
        rule_id,
        org_id: &repo.org_id,
        repo: &repo.repo,
        paths: evidence.iter().map(|e| e.path.as_str()).collect(),
        lines: evidence.iter().map(|e| e.line_range).collect(),
    })?;
    Ok(format!("f-{}", &digest[..16]))
}

/// The closed-world registry.
pub struct RuleRegistry {
    rules: Vec<Arc<dyn Rule>>,
}

impl std::fmt::Debug for RuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleRegistry")
            .field("rule_ids", &self.rules.iter().map(|r| r.rule_id()).collect::<Vec<_>>())
            .finish()
    }
}

impl RuleRegistry {
    /// Build from the full rule set. Duplicate ids are rejected; order is
    /// normalised to lexicographic `rule_id`.
    pub fn new(mut rules: Vec<Arc<dyn Rule>>) -> OracleResult<Self> {
        rules.sort_by(|a, b| a.rule_id().cmp(b.rule_id()));
        for pair in rules.windows(2) {
            if pair[0].rule_id() == pair[1].rule_id() {
                return Err(OracleError::Config(format!(
                    "duplicate rule id {}",
                    pair[0].rule_id()
                )));
            }
        }
        Ok(Self { rules })
    }

    /// Rules in canonical evaluation order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Rule>> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn get(&self, rule_id: &str) -> Option<&Arc<dyn Rule>> {
        self.rules
            .binary_search_by(|r| r.rule_id().cmp(rule_id))
            .ok()
            .map(|i| &self.rules[i])
    }
}
