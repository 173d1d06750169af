//! Built-in Governance Rules
//!
//! The closed-world rule set shipped with the engine. Each rule is a pure
//! predicate over typed evidence; the scanning front-end decides what
//! evidence exists, these rules decide what it means.

use std::sync::Arc;

use super::{EvaluationInput, Evidence, EvidenceKind, Rule, RuleViolation, Severity};

/// All shipped rules, unsorted; the registry normalises order.
pub fn builtin_rules() -> Vec<Arc<dyn Rule>> {
    vec![
        Arc::new(ManifestDrift),
        Arc::new(PermissionWidening),
        Arc::new(OrphanReference),
        Arc::new(VersionSkew),
        Arc::new(SecretEcho),
    ]
}

fn violation(rule: &dyn Rule, message: String, evidence: Vec<Evidence>) -> RuleViolation {
    RuleViolation {
        message,
        evidence,
        outcome: rule.severity().default_outcome(),
    }
}

// =============================================================================
// MD-001: MANIFEST DRIFT
// =============================================================================

/// A manifest field declares one thing; the repository observably does
/// another.
pub struct ManifestDrift;

impl Rule for ManifestDrift {
    fn rule_id(&self) -> &str {
        "MD-001"
    }

    fn rule_version(&self) -> &str {
        "1.2.0"
    }

    fn severity(&self) -> Severity {
        Severity::High
    }

    fn required_kinds(&self) -> &[EvidenceKind] {
        &[EvidenceKind::ManifestField]
    }

    fn evaluate(&self, input: &EvaluationInput) -> Vec<RuleViolation> {
        input
            .evidence
            .of_kind(EvidenceKind::ManifestField)
            .filter_map(|evidence| {
                let declared = evidence.attr("declared")?;
                let observed = evidence.attr("observed")?;
                if declared == observed {
                    return None;
                }
                let field = evidence.attr("field").unwrap_or("<unknown>");
                Some(violation(
                    self,
                    format!(
                        "manifest field '{field}' declares '{declared}' but the repository shows '{observed}'"
                    ),
                    vec![evidence.clone()],
                ))
            })
            .collect()
    }
}

// =============================================================================
// MD-002: PERMISSION WIDENING
// =============================================================================

/// A grant requests permission bits beyond what was approved.
pub struct PermissionWidening;

impl PermissionWidening {
    fn parse_bits(raw: &str) -> Option<u64> {
        if let Some(binary) = raw.strip_prefix("0b") {
            u64::from_str_radix(binary, 2).ok()
        } else {
            raw.parse().ok()
        }
    }
}

impl Rule for PermissionWidening {
    fn rule_id(&self) -> &str {
        "MD-002"
    }

    fn rule_version(&self) -> &str {
        "1.0.1"
    }

    fn severity(&self) -> Severity {
        Severity::Critical
    }

    fn required_kinds(&self) -> &[EvidenceKind] {
        &[EvidenceKind::PermissionGrant]
    }

    fn evaluate(&self, input: &EvaluationInput) -> Vec<RuleViolation> {
        input
            .evidence
            .of_kind(EvidenceKind::PermissionGrant)
            .filter_map(|evidence| {
                let requested = Self::parse_bits(evidence.attr("requested")?)?;
                let approved = Self::parse_bits(evidence.attr("approved")?)?;
                let widened = requested & !approved;
                if widened == 0 {
                    return None;
                }
                Some(violation(
                    self,
                    format!(
                        "grant requests bits {requested:#b} beyond the approved {approved:#b} (excess {widened:#b})"
                    ),
                    vec![evidence.clone()],
                ))
            })
            .collect()
    }
}

// =============================================================================
// MD-003: ORPHAN REFERENCE
// =============================================================================

/// A document references a target that no longer exists.
pub struct OrphanReference;

impl Rule for OrphanReference {
    fn rule_id(&self) -> &str {
        "MD-003"
    }

    fn rule_version(&self) -> &str {
        "2.0.0"
    }

    fn severity(&self) -> Severity {
        Severity::Medium
    }

    fn required_kinds(&self) -> &[EvidenceKind] {
        &[EvidenceKind::Reference]
    }

    fn evaluate(&self, input: &EvaluationInput) -> Vec<RuleViolation> {
        input
            .evidence
            .of_kind(EvidenceKind::Reference)
            .filter(|evidence| evidence.attr("target_exists") == Some("false"))
            .map(|evidence| {
                let target = evidence.attr("target").unwrap_or("<unknown>");
                violation(
                    self,
                    format!("reference to '{target}' resolves to nothing"),
                    vec![evidence.clone()],
                )
            })
            .collect()
    }
}

// =============================================================================
// MD-004: VERSION SKEW
// =============================================================================

/// Two coupled components declare versions that must match and do not.
pub struct VersionSkew;

impl Rule for VersionSkew {
    fn rule_id(&self) -> &str {
        "MD-004"
    }

    fn rule_version(&self) -> &str {
        "1.1.0"
    }

    fn severity(&self) -> Severity {
        Severity::High
    }

    fn required_kinds(&self) -> &[EvidenceKind] {
        &[EvidenceKind::VersionPair]
    }

    fn evaluate(&self, input: &EvaluationInput) -> Vec<RuleViolation> {
        input
            .evidence
            .of_kind(EvidenceKind::VersionPair)
            .filter_map(|evidence| {
                let expected = evidence.attr("expected")?;
                let actual = evidence.attr("actual")?;
                if expected == actual {
                    return None;
                }
                let component = evidence.attr("component").unwrap_or("<unknown>");
                Some(violation(
                    self,
                    format!(
                        "component '{component}' pinned at {expected} but {actual} is deployed"
                    ),
                    vec![evidence.clone()],
                ))
            })
            .collect()
    }
}

// =============================================================================
// MD-005: SECRET ECHO
// =============================================================================

/// A quoted span carries material the scanner marked as secret-bearing.
/// The quoted text itself is wrapped by the redaction layer downstream;
/// this rule only decides that the span is a violation.
pub struct SecretEcho;

impl Rule for SecretEcho {
    fn rule_id(&self) -> &str {
        "MD-005"
    }

    fn rule_version(&self) -> &str {
        "1.0.0"
    }

    fn severity(&self) -> Severity {
        Severity::Critical
    }

    fn required_kinds(&self) -> &[EvidenceKind] {
        &[EvidenceKind::TextSpan]
    }

    fn evaluate(&self, input: &EvaluationInput) -> Vec<RuleViolation> {
        input
            .evidence
            .of_kind(EvidenceKind::TextSpan)
            .filter(|evidence| evidence.attr("contains_secret") == Some("true"))
            .map(|evidence| {
                violation(
                    self,
                    format!("secret material echoed in {}", evidence.path),
                    vec![evidence.clone()],
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fp_store::Outcome;
    use crate::rules::{EvidenceSet, RepoContext};
    use std::collections::BTreeMap;

    fn input(evidence: Vec<Evidence>) -> EvaluationInput {
        EvaluationInput {
            repo: RepoContext {
                org_id: "acme".to_string(),
                repo: "widgets".to_string(),
                branch: "main".to_string(),
            },
            evidence: EvidenceSet::new(evidence),
        }
    }

    fn evidence(kind: EvidenceKind, path: &str, attrs: &[(&str, &str)]) -> Evidence {
        Evidence {
            kind,
            path: path.to_string(),
            line_range: None,
            attributes: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            quoted: None,
        }
    }

    #[test]
    fn test_manifest_drift_fires_on_mismatch_only() {
        let rule = ManifestDrift;
        let matching = input(vec![evidence(
            EvidenceKind::ManifestField,
            "manifest.yaml",
            &[("field", "owner"), ("declared", "team-a"), ("observed", "team-a")],
        )]);
        assert!(rule.evaluate(&matching).is_empty());

        let drifted = input(vec![evidence(
            EvidenceKind::ManifestField,
            "manifest.yaml",
            &[("field", "owner"), ("declared", "team-a"), ("observed", "team-b")],
        )]);
        let violations = rule.evaluate(&drifted);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].outcome, Outcome::Block);
        assert!(violations[0].message.contains("owner"));
    }

    #[test]
    fn test_permission_widening_bit_math() {
        let rule = PermissionWidening;
        let widened = input(vec![evidence(
            EvidenceKind::PermissionGrant,
            "ci/perms.yaml",
            &[("requested", "0b1111"), ("approved", "0b0011")],
        )]);
        let violations = rule.evaluate(&widened);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].message.contains("0b1100"));

        let within = input(vec![evidence(
            EvidenceKind::PermissionGrant,
            "ci/perms.yaml",
            &[("requested", "0b0011"), ("approved", "0b0111")],
        )]);
        assert!(rule.evaluate(&within).is_empty());

        // Unparseable bits find nothing rather than guessing.
        let garbage = input(vec![evidence(
            EvidenceKind::PermissionGrant,
            "ci/perms.yaml",
            &[("requested", "lots"), ("approved", "0b1")],
        )]);
        assert!(rule.evaluate(&garbage).is_empty());
    }

    #[test]
    fn test_orphan_reference_and_version_skew() {
        let orphan = OrphanReference;
        let violations = orphan.evaluate(&input(vec![
            evidence(
                EvidenceKind::Reference,
                "docs/arch.md",
                &[("target", "docs/old.md"), ("target_exists", "false")],
            ),
            evidence(
                EvidenceKind::Reference,
                "docs/arch.md",
                &[("target", "docs/new.md"), ("target_exists", "true")],
            ),
        ]));
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].outcome, Outcome::Warn);

        let skew = VersionSkew;
        let violations = skew.evaluate(&input(vec![evidence(
            EvidenceKind::VersionPair,
            "deploy/lock.toml",
            &[("component", "gateway"), ("expected", "2.1.0"), ("actual", "2.0.3")],
        )]));
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].outcome, Outcome::Block);
    }

    #[test]
    fn test_secret_echo_flags_marked_spans() {
        let rule = SecretEcho;
        let mut marked = evidence(
            EvidenceKind::TextSpan,
            "config/prod.env",
            &[("contains_secret", "true")],
        );
        marked.quoted = Some("API_KEY=tok_abc123".to_string());
        let violations = rule.evaluate(&input(vec![marked]));
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].outcome, Outcome::Block);

        let clean = evidence(
            EvidenceKind::TextSpan,
            "config/prod.env",
            &[("contains_secret", "false")],
        );
        assert!(rule.evaluate(&input(vec![clean])).is_empty());
    }

    #[test]
    fn test_rules_ignore_foreign_evidence_kinds() {
        let rule = ManifestDrift;
        let foreign = input(vec![evidence(
            EvidenceKind::Reference,
            "docs/arch.md",
            &[("declared", "a"), ("observed", "b")],
        )]);
        assert!(rule.evaluate(&foreign).is_empty());
    }
}
