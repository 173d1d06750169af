//! End-to-end oracle scenarios exercised through the public crate surface.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

use dissonance_oracle::anonymizer::Anonymizer;
use dissonance_oracle::calibration::{CalibrationAggregator, ConfidenceCategory};
use dissonance_oracle::config::{AnonymizerConfig, L0Config, OracleConfig};
use dissonance_oracle::fp_store::{
    ConsentRecord, ConsentStore, ConsentType, FpEvent, FpEventContext, FpEventStore,
    InMemoryConsentStore, InMemoryFpEventStore,
};
use dissonance_oracle::identity::{
    InMemoryBindingStore, InMemoryIdentityStore, IdentityStore, NonceBindingService,
    OrganizationIdentity, VerificationMethod,
};
use dissonance_oracle::reputation::{
    InMemoryReputationStore, OrganizationReputation, ReputationEngine, ReputationStore,
};
use dissonance_oracle::secrets::InMemorySecretStore;
use dissonance_oracle::{
    Evidence, EvidenceKind, EvidenceSet, Invocation, InvocationMode, Oracle, Outcome,
    RepoContext, SnapshotState,
};

fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
}

fn test_config() -> OracleConfig {
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
    config
}

fn snapshot(now: DateTime<Utc>) -> SnapshotState {
    SnapshotState::builder()
        .schema_hash("sha256:deadbeef")
        .permission_bits(0b1111)
        .drift_magnitude(0.1)
        .nonce_epoch(2)
        .nonce_issued_at(now - Duration::minutes(10))
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
        line_range: Some((1, 4)),
        attributes,
        quoted: None,
    }
}

// Scenario 1: L0 pass, no findings -> PASS, empty degradation, exit 0.
#[tokio::test]
async fn scenario_clean_pass() {
    let oracle = Oracle::local(test_config()).await.unwrap();
    let now = fixed_now();
    let verdict = oracle
        .run(&snapshot(now), EvidenceSet::default(), &invocation(now))
        .await
        .unwrap();
    assert_eq!(verdict.record.decision, Outcome::Pass);
    assert!(verdict.record.degradation.reason.is_empty());
    assert_eq!(verdict.exit_code, 0);
}

// Scenario 2: permissionBits=0b0101 vs requiredMask=0b1100 -> L0 violation,
// BLOCK, exit 1.
#[tokio::test]
async fn scenario_permission_bits_violation() {
    let oracle = Oracle::local(test_config()).await.unwrap();
    let now = fixed_now();
    let mut state = snapshot(now);
    state.permission_bits = 0b0101;

    let verdict = oracle
        .run(&state, EvidenceSet::default(), &invocation(now))
        .await
        .unwrap();
    assert_eq!(verdict.record.decision, Outcome::Block);
    assert_eq!(verdict.record.degradation.reason, "L0_VIOLATION");
    assert!(verdict
        .record
        .degradation
        .details
        .as_ref()
        .unwrap()
        .contains("permission_bits"));
    assert_eq!(verdict.exit_code, 1);
}

// Scenario 3: a blocking rule trips the circuit breaker after enough
// blocks accumulate; the finding is still recorded but the decision is
// demoted to WARN with degradation CIRCUIT_BREAKER.
#[tokio::test]
async fn scenario_circuit_breaker_demotes() {
    let oracle = Oracle::local(test_config()).await.unwrap();
    let now = fixed_now();
    let evidence = || EvidenceSet::new(vec![drift_evidence()]);

    // Default threshold is 10 blocks inside the window. The first ten runs
    // block normally and accumulate counters.
    for _ in 0..10 {
        let verdict = oracle
            .run(&snapshot(now), evidence(), &invocation(now))
            .await
            .unwrap();
        assert_eq!(verdict.record.decision, Outcome::Block);
    }

    // The next run sees recentBlocks >= threshold and demotes.
    let verdict = oracle
        .run(&snapshot(now), evidence(), &invocation(now))
        .await
        .unwrap();
    assert_eq!(verdict.record.decision, Outcome::Warn);
    assert_eq!(verdict.record.degradation.reason, "CIRCUIT_BREAKER");
    assert_eq!(
        verdict.record.findings[0].demotion_reason.as_deref(),
        Some("CIRCUIT_BREAKER")
    );
    assert_eq!(verdict.exit_code, 0);
}

// Scenario 4: record -> mark false positive -> window statistics.
#[tokio::test]
async fn scenario_false_positive_review_round_trip() {
    let store = InMemoryFpEventStore::new();
    let now = fixed_now();
    let event = FpEvent::new(
        "e1",
        "MD-002",
        "1.0.1",
        "f1",
        Outcome::Block,
        FpEventContext {
            org_id: "acme".to_string(),
            repo: "widgets".to_string(),
            branch: "main".to_string(),
            event_type: "pull_request".to_string(),
            context_hash: None,
        },
        now,
    );
    store.record_event(&event).await.unwrap();
    store
        .mark_false_positive("f1", "alice", Some("TICK-1"), now)
        .await
        .unwrap();

    let window = store.window_by_count("MD-002", 10).await.unwrap();
    assert_eq!(window.statistics.false_positives, 1);
    assert_eq!(window.statistics.pending, 0);
    assert_eq!(window.statistics.observed_fpr, 1.0);
    assert_eq!(window.rule_version, "1.0.1");
}

// Scenario 5: generate -> verify -> rotate -> old nonce invalid.
#[tokio::test]
async fn scenario_nonce_rotation() {
    let identities = Arc::new(InMemoryIdentityStore::new());
    identities
        .put_identity(&OrganizationIdentity {
            org_id: "acme".to_string(),
            public_key: "A-key".to_string(),
            verification_method: VerificationMethod::GithubOrg,
            verified_at: fixed_now(),
            unique_nonce: None,
        })
        .await
        .unwrap();
    let service = NonceBindingService::new(identities, Arc::new(InMemoryBindingStore::new()));
    let now = fixed_now();

    let old = service.generate_and_bind("acme", "A-key", now).await.unwrap();
    assert!(service.verify(&old.nonce, "acme").await.is_ok());

    let new = service
        .rotate("acme", "B-key", "quarterly", now)
        .await
        .unwrap();
    assert_eq!(new.previous_nonce.as_deref(), Some(old.nonce.as_str()));

    let err = service.verify(&old.nonce, "acme").await.unwrap_err();
    assert!(err.to_string().contains("revoked"));

    let history = service.rotation_history("acme").await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].revoked);
    assert_eq!(history[0].revocation_reason.as_deref(), Some("quarterly"));
    assert!(!history[1].revoked);
}

// Scenario 6: k-anonymity floor, then a fifth contributor unlocking a
// Byzantine-filtered consensus.
#[tokio::test]
async fn scenario_calibration_k_anonymity_and_byzantine_filter() {
    let fp_store = Arc::new(InMemoryFpEventStore::new());
    let consent_store = Arc::new(InMemoryConsentStore::new());
    let reputation_store = Arc::new(InMemoryReputationStore::new());
    let identity_store = Arc::new(InMemoryIdentityStore::new());
    let anonymizer = Arc::new(Anonymizer::new(
        Arc::new(InMemorySecretStore::new()),
        AnonymizerConfig {
            test_mode: true,
            ..AnonymizerConfig::default()
        },
    ));
    anonymizer.load_salt(fixed_now()).await.unwrap();

    let aggregator = CalibrationAggregator::new(
        Default::default(),
        fp_store.clone(),
        consent_store.clone(),
        Arc::new(ReputationEngine::new(
            Default::default(),
            reputation_store.clone(),
            identity_store.clone(),
        )),
        anonymizer,
    );

    let now = fixed_now();
    let enroll = |org: &str, score: f64| {
        let org = org.to_string();
        let identity_store = identity_store.clone();
        let consent_store = consent_store.clone();
        let reputation_store = reputation_store.clone();
        async move {
            identity_store
                .put_identity(&OrganizationIdentity {
                    org_id: org.clone(),
                    public_key: format!("pk-{org}"),
                    verification_method: VerificationMethod::Manual,
                    verified_at: now,
                    unique_nonce: None,
                })
                .await
                .unwrap();
            consent_store
                .record_consent(&ConsentRecord {
                    org_id: org.clone(),
                    granted_by: format!("cto@{org}"),
                    granted_at: now - Duration::days(1),
                    expires_at: now + Duration::days(365),
                    revoked_at: None,
                    consent_type: ConsentType::Explicit,
                })
                .await
                .unwrap();
            let mut reputation = OrganizationReputation::new(&org, now);
            reputation.reputation_score = score;
            reputation_store.put_reputation(&reputation).await.unwrap();
        }
    };
    let seed = |org: &str, fp: usize| {
        let org = org.to_string();
        let fp_store = fp_store.clone();
        async move {
            for i in 0..10usize {
                let mut event = FpEvent::new(
                    format!("{org}-e{i}"),
                    "MD-003",
                    "2.0.0",
                    format!("{org}-f{i}"),
                    Outcome::Block,
                    FpEventContext {
                        org_id: org.clone(),
                        repo: "repo".to_string(),
                        branch: "main".to_string(),
                        event_type: "drift".to_string(),
                        context_hash: None,
                    },
                    now,
                );
                event.reviewer = Some("auditor".to_string());
                event.reviewed_at = Some(now);
                event.is_false_positive = i < fp;
                fp_store.record_event(&event).await.unwrap();
            }
        }
    };

    for org in ["a1", "a2", "a3", "a4"] {
        enroll(org, 0.6).await;
        seed(org, 1).await;
    }

    // Four contributors: below the floor of five.
    let result = aggregator.calibrate("MD-003", now).await.unwrap();
    assert_eq!(result.consensus_fp_rate, None);
    assert_eq!(result.confidence.category, ConfidenceCategory::Insufficient);

    // A fifth, wildly disagreeing contributor unlocks disclosure; the
    // Byzantine filter drops it and the consensus is the weighted mean of
    // the agreeing four.
    enroll("byz", 0.2).await;
    seed("byz", 9).await;

    let result = aggregator.calibrate("MD-003", now).await.unwrap();
    assert_eq!(result.total_contributor_count, 5);
    assert_eq!(result.byzantine_filter.z_outliers_dropped, 1);
    assert_eq!(result.trusted_contributor_count, 4);
    let consensus = result.consensus_fp_rate.unwrap();
    assert!((consensus - 0.1).abs() < 1e-9, "consensus {consensus}");
}

// Determinism: two independently assembled oracles over identical inputs
// emit byte-identical canonical records (no quoted evidence, so no MACs).
#[tokio::test]
async fn determinism_across_engine_instances() {
    let now = fixed_now();
    let evidence = || EvidenceSet::new(vec![drift_evidence()]);

    let first = Oracle::local(test_config())
        .await
        .unwrap()
        .run(&snapshot(now), evidence(), &invocation(now))
        .await
        .unwrap();
    let second = Oracle::local(test_config())
        .await
        .unwrap()
        .run(&snapshot(now), evidence(), &invocation(now))
        .await
        .unwrap();

    assert_eq!(
        first.record.to_canonical_json().unwrap(),
        second.record.to_canonical_json().unwrap()
    );
    assert_eq!(first.record.decision, Outcome::Block);
}

// Stable layout: the emitted document carries the spec'd top-level shape.
#[tokio::test]
async fn decision_record_layout() {
    let oracle = Oracle::local(test_config()).await.unwrap();
    let now = fixed_now();
    let verdict = oracle
        .run(&snapshot(now), EvidenceSet::default(), &invocation(now))
        .await
        .unwrap();
    let json = verdict.record.to_canonical_json().unwrap();

    let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert!(parsed["meta"]["schema_hash"].is_string());
    assert!(parsed["meta"]["generated_at"].is_string());
    assert!(parsed["meta"]["engine_version"].is_string());
    assert!(parsed["meta"]["inputs_digest"].is_string());
    assert!(parsed["findings"].is_array());
    assert_eq!(parsed["decision"], "pass");
    assert_eq!(parsed["degradation"]["reason"], "");
    assert_eq!(
        parsed["meta"]["generated_at"].as_str().unwrap(),
        "2024-06-15T12:00:00.000Z"
    );
}
