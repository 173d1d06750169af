//! Calibration Intake
//!
//! The admission gate for FP contributions arriving from other
//! organisations. Every submission carries the org's bound nonce; the gate
//! validates the binding (fail-closed on mismatch or revocation), requires
//! live explicit consent, records the event, and bumps the nonce usage
//! counter.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

use super::{ConsentStore, FpEvent, FpEventStore};
use crate::error::{OracleError, OracleResult};
use crate::identity::NonceBindingService;

/// Intake over the binding service, consent store, and event store.
pub struct CalibrationIntake {
    binding_service: Arc<NonceBindingService>,
    consent_store: Arc<dyn ConsentStore>,
    fp_store: Arc<dyn FpEventStore>,
}

impl CalibrationIntake {
    pub fn new(
        binding_service: Arc<NonceBindingService>,
        consent_store: Arc<dyn ConsentStore>,
        fp_store: Arc<dyn FpEventStore>,
    ) -> Self {
        Self {
            binding_service,
            consent_store,
            fp_store,
        }
    }

    /// Admit one contribution. The nonce must belong to the event's org;
    /// the org must hold live explicit consent.
    pub async fn submit(
        &self,
        event: &FpEvent,
        nonce: &str,
        now: DateTime<Utc>,
    ) -> OracleResult<()> {
        let org_id = &event.context.org_id;

        // Fail closed: any nonce failure rejects the submission outright.
        self.binding_service.verify(nonce, org_id).await?;

        let admitted = self
            .consent_store
            .latest_consent(org_id)
            .await?
            .map(|c| c.admits_calibration(now))
            .unwrap_or(false);
        if !admitted {
            return Err(OracleError::ConsentMissing {
                org_id: org_id.clone(),
            });
        }

        self.fp_store.record_event(event).await?;
        self.binding_service.increment_usage(nonce, org_id).await?;
        debug!(
            org_id,
            rule_id = %event.rule_id,
            event_id = %event.event_id,
            "calibration contribution admitted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fp_store::{
        ConsentRecord, ConsentType, FpEventContext, InMemoryConsentStore, InMemoryFpEventStore,
        Outcome,
    };
    use crate::identity::{
        IdentityStore, InMemoryBindingStore, InMemoryIdentityStore, OrganizationIdentity,
        VerificationMethod,
    };
    use chrono::Duration;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    struct Fixture {
        intake: CalibrationIntake,
        binding_service: Arc<NonceBindingService>,
        consent_store: Arc<InMemoryConsentStore>,
        fp_store: Arc<InMemoryFpEventStore>,
    }

    async fn fixture() -> Fixture {
        let identities = Arc::new(InMemoryIdentityStore::new());
        identities
            .put_identity(&OrganizationIdentity {
                org_id: "acme".to_string(),
                public_key: "pk-A".to_string(),
                verification_method: VerificationMethod::GithubOrg,
                verified_at: Utc::now(),
                unique_nonce: None,
            })
            .await
            .unwrap();
        let binding_service = Arc::new(NonceBindingService::with_rng(
            identities,
            Arc::new(InMemoryBindingStore::new()),
            Box::new(ChaCha8Rng::seed_from_u64(11)),
        ));
        let consent_store = Arc::new(InMemoryConsentStore::new());
        let fp_store = Arc::new(InMemoryFpEventStore::new());
        Fixture {
            intake: CalibrationIntake::new(
                binding_service.clone(),
                consent_store.clone(),
                fp_store.clone(),
            ),
            binding_service,
            consent_store,
            fp_store,
        }
    }

    fn event(now: DateTime<Utc>) -> FpEvent {
        FpEvent::new(
            "e1",
            "MD-003",
            "2.0.0",
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
        )
    }

    async fn grant_consent(store: &InMemoryConsentStore, now: DateTime<Utc>) {
        store
            .record_consent(&ConsentRecord {
                org_id: "acme".to_string(),
                granted_by: "cto@acme".to_string(),
                granted_at: now,
                expires_at: now + Duration::days(365),
                revoked_at: None,
                consent_type: ConsentType::Explicit,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_valid_submission_records_and_counts_usage() {
        let fx = fixture().await;
        let now = Utc::now();
        grant_consent(&fx.consent_store, now).await;
        let binding = fx
            .binding_service
            .generate_and_bind("acme", "pk-A", now)
            .await
            .unwrap();

        fx.intake.submit(&event(now), &binding.nonce, now).await.unwrap();
        assert_eq!(fx.fp_store.len(), 1);
        let stored = fx
            .binding_service
            .verify(&binding.nonce, "acme")
            .await
            .unwrap();
        assert_eq!(stored.usage_count, 1);
    }

    #[tokio::test]
    async fn test_wrong_org_nonce_fails_closed() {
        let fx = fixture().await;
        let now = Utc::now();
        grant_consent(&fx.consent_store, now).await;
        let binding = fx
            .binding_service
            .generate_and_bind("acme", "pk-A", now)
            .await
            .unwrap();

        let mut foreign = event(now);
        foreign.context.org_id = "intruder".to_string();
        let err = fx
            .intake
            .submit(&foreign, &binding.nonce, now)
            .await
            .unwrap_err();
        assert!(matches!(err, OracleError::NonceValidation(_)));
        assert!(fx.fp_store.is_empty());
    }

    #[tokio::test]
    async fn test_revoked_nonce_rejected() {
        let fx = fixture().await;
        let now = Utc::now();
        grant_consent(&fx.consent_store, now).await;
        let binding = fx
            .binding_service
            .generate_and_bind("acme", "pk-A", now)
            .await
            .unwrap();
        fx.binding_service
            .revoke("acme", "compromise", now)
            .await
            .unwrap();

        let err = fx
            .intake
            .submit(&event(now), &binding.nonce, now)
            .await
            .unwrap_err();
        assert!(matches!(err, OracleError::NonceValidation(_)));
    }

    #[tokio::test]
    async fn test_missing_consent_is_consent_missing() {
        let fx = fixture().await;
        let now = Utc::now();
        let binding = fx
            .binding_service
            .generate_and_bind("acme", "pk-A", now)
            .await
            .unwrap();

        let err = fx
            .intake
            .submit(&event(now), &binding.nonce, now)
            .await
            .unwrap_err();
        assert!(matches!(err, OracleError::ConsentMissing { .. }));
        assert!(err.is_expected());
        assert!(fx.fp_store.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_submission_does_not_double_count_usage() {
        let fx = fixture().await;
        let now = Utc::now();
        grant_consent(&fx.consent_store, now).await;
        let binding = fx
            .binding_service
            .generate_and_bind("acme", "pk-A", now)
            .await
            .unwrap();

        fx.intake.submit(&event(now), &binding.nonce, now).await.unwrap();
        let err = fx
            .intake
            .submit(&event(now), &binding.nonce, now)
            .await
            .unwrap_err();
        assert!(matches!(err, OracleError::DuplicateEvent { .. }));
        let stored = fx
            .binding_service
            .verify(&binding.nonce, "acme")
            .await
            .unwrap();
        assert_eq!(stored.usage_count, 1);
    }
}
