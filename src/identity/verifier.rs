//! Identity Verification
//!
//! Replaces provider-specific duck typing with a closed set of verification
//! methods, each producing a typed metadata record callers can match on.
//! The providers themselves are external; the engine consumes the narrow
//! profile-fetching capabilities below and applies the configured
//! heuristics in one place.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::{IdentityStore, OrganizationIdentity, VerificationMethod};
use crate::config::IdentityConfig;
use crate::error::{OracleError, OracleResult};

/// Raw GitHub organisation profile as the provider reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitHubOrgProfile {
    pub login: String,
    pub created_at: DateTime<Utc>,
    pub member_count: u64,
    pub public_repo_count: u64,
    pub last_activity_at: DateTime<Utc>,
}

/// Raw Stripe customer profile as the provider reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StripeCustomerProfile {
    pub customer_id: String,
    pub created_at: DateTime<Utc>,
    pub successful_payment_count: u64,
    pub delinquent: bool,
    /// Product ids with an active subscription.
    pub active_product_ids: Vec<String>,
}

/// Capability: fetch a GitHub org profile.
#[async_trait]
pub trait GitHubOrgVerifier: Send + Sync {
    async fn fetch_org_profile(&self, org_login: &str) -> OracleResult<GitHubOrgProfile>;
}

/// Capability: fetch a Stripe customer profile.
#[async_trait]
pub trait StripeCustomerVerifier: Send + Sync {
    async fn fetch_customer_profile(
        &self,
        customer_id: &str,
    ) -> OracleResult<StripeCustomerProfile>;
}

/// Typed metadata carried by a verification result. Callers pattern-match
/// on the method instead of inspecting a string map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum VerificationMetadata {
    GithubOrg {
        login: String,
        org_age_days: i64,
        member_count: u64,
        public_repo_count: u64,
        days_since_activity: i64,
    },
    StripeCustomer {
        customer_id: String,
        account_age_days: i64,
        successful_payment_count: u64,
        delinquent: bool,
    },
    Manual {
        approved_by: String,
    },
}

/// Outcome of one verification attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub verified: bool,
    pub method: VerificationMethod,
    pub metadata: VerificationMetadata,
    /// Populated when `verified` is false.
    pub reason: Option<String>,
}

/// The verification service: applies the configured heuristics to provider
/// profiles and persists identities for orgs that pass.
pub struct IdentityVerifier {
    config: IdentityConfig,
    identity_store: Arc<dyn IdentityStore>,
    github: Option<Arc<dyn GitHubOrgVerifier>>,
    stripe: Option<Arc<dyn StripeCustomerVerifier>>,
}

impl IdentityVerifier {
    pub fn new(
        config: IdentityConfig,
        identity_store: Arc<dyn IdentityStore>,
        github: Option<Arc<dyn GitHubOrgVerifier>>,
        stripe: Option<Arc<dyn StripeCustomerVerifier>>,
    ) -> Self {
        Self {
            config,
            identity_store,
            github,
            stripe,
        }
    }

    /// Verify an org through its GitHub organisation.
    pub async fn verify_github_org(
        &self,
        org_id: &str,
        org_login: &str,
        public_key: &str,
        now: DateTime<Utc>,
    ) -> OracleResult<VerificationResult> {
        let github = self.github.as_ref().ok_or_else(|| {
            OracleError::Config("no GitHub verifier configured".to_string())
        })?;
        let profile = github.fetch_org_profile(org_login).await?;

        let org_age_days = (now - profile.created_at).num_days();
        let days_since_activity = (now - profile.last_activity_at).num_days();
        let metadata = VerificationMetadata::GithubOrg {
            login: profile.login.clone(),
            org_age_days,
            member_count: profile.member_count,
            public_repo_count: profile.public_repo_count,
            days_since_activity,
        };

        let mut reasons = Vec::new();
        if org_age_days < self.config.github_min_org_age_days {
            reasons.push(format!(
                "org age {org_age_days}d below minimum {}d",
                self.config.github_min_org_age_days
            ));
        }
        if profile.member_count < self.config.github_min_members {
            reasons.push(format!(
                "member count {} below minimum {}",
                profile.member_count, self.config.github_min_members
            ));
        }
        if profile.public_repo_count < self.config.github_min_public_repos {
            reasons.push(format!(
                "public repo count {} below minimum {}",
                profile.public_repo_count, self.config.github_min_public_repos
            ));
        }
        if days_since_activity > self.config.github_max_inactivity_days {
            reasons.push(format!(
                "no activity for {days_since_activity}d (limit {}d)",
                self.config.github_max_inactivity_days
            ));
        }

        self.conclude(
            org_id,
            public_key,
            VerificationMethod::GithubOrg,
            metadata,
            reasons,
            now,
        )
        .await
    }

    /// Verify an org through its Stripe customer record.
    pub async fn verify_stripe_customer(
        &self,
        org_id: &str,
        customer_id: &str,
        public_key: &str,
        now: DateTime<Utc>,
    ) -> OracleResult<VerificationResult> {
        let stripe = self.stripe.as_ref().ok_or_else(|| {
            OracleError::Config("no Stripe verifier configured".to_string())
        })?;
        let profile = stripe.fetch_customer_profile(customer_id).await?;

        let account_age_days = (now - profile.created_at).num_days();
        let metadata = VerificationMetadata::StripeCustomer {
            customer_id: profile.customer_id.clone(),
            account_age_days,
            successful_payment_count: profile.successful_payment_count,
            delinquent: profile.delinquent,
        };

        let mut reasons = Vec::new();
        if account_age_days < self.config.stripe_min_account_age_days {
            reasons.push(format!(
                "account age {account_age_days}d below minimum {}d",
                self.config.stripe_min_account_age_days
            ));
        }
        if profile.successful_payment_count < self.config.stripe_min_successful_payments {
            reasons.push(format!(
                "{} successful payments, minimum is {}",
                profile.successful_payment_count, self.config.stripe_min_successful_payments
            ));
        }
        if self.config.stripe_reject_delinquent && profile.delinquent {
            reasons.push("account is delinquent".to_string());
        }
        if !self.config.stripe_required_product_ids.is_empty()
            && !self
                .config
                .stripe_required_product_ids
                .iter()
                .any(|id| profile.active_product_ids.contains(id))
        {
            reasons.push("no active subscription to a required product".to_string());
        }

        self.conclude(
            org_id,
            public_key,
            VerificationMethod::StripeCustomer,
            metadata,
            reasons,
            now,
        )
        .await
    }

    /// Record a manually approved identity. No heuristics apply; the
    /// approver is recorded in the metadata.
    pub async fn verify_manual(
        &self,
        org_id: &str,
        approved_by: &str,
        public_key: &str,
        now: DateTime<Utc>,
    ) -> OracleResult<VerificationResult> {
        self.conclude(
            org_id,
            public_key,
            VerificationMethod::Manual,
            VerificationMetadata::Manual {
                approved_by: approved_by.to_string(),
            },
            Vec::new(),
            now,
        )
        .await
    }

    async fn conclude(
        &self,
        org_id: &str,
        public_key: &str,
        method: VerificationMethod,
        metadata: VerificationMetadata,
        reasons: Vec<String>,
        now: DateTime<Utc>,
    ) -> OracleResult<VerificationResult> {
        if reasons.is_empty() {
            self.identity_store
                .put_identity(&OrganizationIdentity {
                    org_id: org_id.to_string(),
                    public_key: public_key.to_string(),
                    verification_method: method,
                    verified_at: now,
                    unique_nonce: None,
                })
                .await?;
            info!(org_id, method = method.as_str(), "organisation verified");
            Ok(VerificationResult {
                verified: true,
                method,
                metadata,
                reason: None,
            })
        } else {
            Ok(VerificationResult {
                verified: false,
                method,
                metadata,
                reason: Some(reasons.join("; ")),
            })
        }
    }
}

// =============================================================================
// STATIC PROVIDERS
// =============================================================================

/// Deterministic in-process GitHub provider, fed by tests or `local` mode.
#[derive(Default)]
pub struct StaticGitHubVerifier {
    profiles: RwLock<HashMap<String, GitHubOrgProfile>>,
}

impl StaticGitHubVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, profile: GitHubOrgProfile) {
        self.profiles
            .write()
            .insert(profile.login.clone(), profile);
    }
}

#[async_trait]
impl GitHubOrgVerifier for StaticGitHubVerifier {
    async fn fetch_org_profile(&self, org_login: &str) -> OracleResult<GitHubOrgProfile> {
        self.profiles
            .read()
            .get(org_login)
            .cloned()
            .ok_or_else(|| OracleError::NotFound {
                entity: "github org",
                key: org_login.to_string(),
            })
    }
}

/// Deterministic in-process Stripe provider.
#[derive(Default)]
pub struct StaticStripeVerifier {
    profiles: RwLock<HashMap<String, StripeCustomerProfile>>,
}

impl StaticStripeVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, profile: StripeCustomerProfile) {
        self.profiles
            .write()
            .insert(profile.customer_id.clone(), profile);
    }
}

#[async_trait]
impl StripeCustomerVerifier for StaticStripeVerifier {
    async fn fetch_customer_profile(
        &self,
        customer_id: &str,
    ) -> OracleResult<StripeCustomerProfile> {
        self.profiles
            .read()
            .get(customer_id)
            .cloned()
            .ok_or_else(|| OracleError::NotFound {
                entity: "stripe customer",
                key: customer_id.to_string(),
            })
    }
}
