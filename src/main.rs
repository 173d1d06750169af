//! Dissonance Oracle CLI
//!
//! CI-facing entry point plus the administrative operations of the trust
//! fabric: organisation verification, nonce binding lifecycle, false
//! positive review, consent, and on-demand calibration.
//!
//! `run` prints the canonical decision record to stdout and exits with the
//! tiered severity code: 0 = PASS, 1 = BLOCK or L0 failure, 2 = degraded
//! but proceeded (community tier).

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use dotenv::dotenv;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use dissonance_oracle::anonymizer::Anonymizer;
use dissonance_oracle::block_counter::{BlockCounterStore, SqliteBlockCounter};
use dissonance_oracle::calibration::CalibrationAggregator;
use dissonance_oracle::circuit_breaker::CircuitBreaker;
use dissonance_oracle::config::{InvocationMode, OracleConfig};
use dissonance_oracle::fp_store::{
    ConsentRecord, ConsentStore, ConsentType, FpEventStore, SqliteConsentStore,
    SqliteFpEventStore,
};
use dissonance_oracle::identity::{
    IdentityVerifier, NonceBindingService, SqliteBindingStore, SqliteIdentityStore,
};
use dissonance_oracle::invariants::L0Checker;
use dissonance_oracle::redaction::{NonceCache, Redactor};
use dissonance_oracle::reputation::{ReputationEngine, SqliteReputationStore};
use dissonance_oracle::rules::{builtin_rules, L1Evaluator, RuleRegistry};
use dissonance_oracle::secrets::{FileSecretStore, SecretStore};
use dissonance_oracle::{EvidenceSet, Invocation, Oracle, RepoContext, SnapshotState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreBackend {
    /// In-memory stores; nothing persists past the process.
    Memory,
    /// SQLite-backed stores under `--db`.
    Sqlite,
}

#[derive(Parser, Debug)]
#[command(
    name = "dissonance-oracle",
    version,
    about = "Inconsistency-finding oracle for CI gates"
)]
struct Cli {
    /// Path to the oracle TOML configuration.
    #[arg(long, global = true, env = "ORACLE_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database path for persistent stores.
    #[arg(long, global = true, env = "ORACLE_DB", default_value = "oracle.db")]
    db: PathBuf,

    /// Secret file (flat TOML table) holding the salt and nonce material.
    #[arg(long, global = true, env = "ORACLE_SECRETS_FILE")]
    secrets_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evaluate a snapshot and emit the decision record.
    Run(RunArgs),
    /// Mark a recorded finding as a reviewed false positive.
    MarkFp(MarkFpArgs),
    /// Compute the network consensus FPR for one rule.
    Calibrate(CalibrateArgs),
    /// Verify an organisation and persist its identity.
    VerifyOrg(VerifyOrgArgs),
    /// Generate and bind a nonce for a verified organisation.
    BindNonce(BindNonceArgs),
    /// Rotate an organisation's nonce.
    RotateNonce(RotateNonceArgs),
    /// Revoke an organisation's nonce.
    RevokeNonce(RevokeNonceArgs),
    /// Record explicit calibration consent for an organisation.
    GrantConsent(GrantConsentArgs),
    /// Drop expired FP events.
    Purge,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Invocation mode: pull_request, merge_group, drift, or local.
    #[arg(long, env = "ORACLE_MODE")]
    mode: InvocationMode,

    /// Path to the snapshot state JSON document.
    #[arg(long)]
    snapshot: PathBuf,

    /// Path to the evidence set JSON document. Empty set when omitted.
    #[arg(long)]
    evidence: Option<PathBuf>,

    /// Store backend. `local` mode always runs in-memory.
    #[arg(long, value_enum, default_value_t = StoreBackend::Sqlite)]
    store: StoreBackend,

    /// Organisation under evaluation.
    #[arg(long, env = "ORACLE_ORG")]
    org: String,

    /// Repository under evaluation.
    #[arg(long, env = "ORACLE_REPO")]
    repo: String,

    /// Branch under evaluation.
    #[arg(long, env = "ORACLE_BRANCH", default_value = "main")]
    branch: String,

    /// This org's bound nonce, when contributing usage on this run.
    #[arg(long, env = "ORACLE_NONCE")]
    nonce: Option<String>,
}

#[derive(Args, Debug)]
struct MarkFpArgs {
    /// Finding id to mark.
    #[arg(long)]
    finding: String,
    /// Reviewer recorded with the verdict.
    #[arg(long)]
    reviewer: String,
    /// Suppression ticket reference.
    #[arg(long)]
    ticket: Option<String>,
}

#[derive(Args, Debug)]
struct CalibrateArgs {
    /// Rule id to aggregate.
    #[arg(long)]
    rule: String,
}

#[derive(Args, Debug)]
struct VerifyOrgArgs {
    /// Organisation id.
    #[arg(long)]
    org: String,
    /// Verification route.
    #[arg(long, value_enum)]
    method: VerifyMethod,
    /// Provider-side identifier (GitHub login or Stripe customer id).
    #[arg(long)]
    provider_id: Option<String>,
    /// Approver, for manual verification.
    #[arg(long)]
    approved_by: Option<String>,
    /// The organisation's public key.
    #[arg(long)]
    public_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum VerifyMethod {
    Manual,
}

#[derive(Args, Debug)]
struct BindNonceArgs {
    #[arg(long)]
    org: String,
    #[arg(long)]
    public_key: String,
}

#[derive(Args, Debug)]
struct RotateNonceArgs {
    #[arg(long)]
    org: String,
    #[arg(long)]
    public_key: String,
    /// Rotation reason recorded on the revoked binding.
    #[arg(long)]
    reason: String,
}

#[derive(Args, Debug)]
struct RevokeNonceArgs {
    #[arg(long)]
    org: String,
    #[arg(long)]
    reason: String,
}

#[derive(Args, Debug)]
struct GrantConsentArgs {
    #[arg(long)]
    org: String,
    /// Person or role granting consent.
    #[arg(long)]
    granted_by: String,
    /// Validity in days.
    #[arg(long, default_value_t = 365)]
    valid_days: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match &cli.command {
        Command::Run(args) => run_pipeline(&cli, config, args).await,
        Command::MarkFp(args) => {
            let store = SqliteFpEventStore::open(&cli.db)?;
            let event = store
                .mark_false_positive(
                    &args.finding,
                    &args.reviewer,
                    args.ticket.as_deref(),
                    Utc::now(),
                )
                .await?;
            info!(
                finding = %args.finding,
                rule = %event.rule_id,
                reviewer = %args.reviewer,
                "finding marked as false positive"
            );
            Ok(())
        }
        Command::Calibrate(args) => {
            let services = Services::open(&cli, &config).await?;
            let result = services.aggregator.calibrate(&args.rule, Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Command::VerifyOrg(args) => {
            let services = Services::open(&cli, &config).await?;
            let result = match args.method {
                VerifyMethod::Manual => {
                    let approved_by = args
                        .approved_by
                        .as_deref()
                        .context("--approved-by is required for manual verification")?;
                    services
                        .verifier
                        .verify_manual(&args.org, approved_by, &args.public_key, Utc::now())
                        .await?
                }
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.verified {
                bail!("verification failed: {}", result.reason.unwrap_or_default());
            }
            Ok(())
        }
        Command::BindNonce(args) => {
            let services = Services::open(&cli, &config).await?;
            let binding = services
                .binding_service
                .generate_and_bind(&args.org, &args.public_key, Utc::now())
                .await?;
            // Only the nonce itself goes to stdout so operators can pipe it
            // into their secret manager.
            println!("{}", binding.nonce);
            Ok(())
        }
        Command::RotateNonce(args) => {
            let services = Services::open(&cli, &config).await?;
            let binding = services
                .binding_service
                .rotate(&args.org, &args.public_key, &args.reason, Utc::now())
                .await?;
            println!("{}", binding.nonce);
            Ok(())
        }
        Command::RevokeNonce(args) => {
            let services = Services::open(&cli, &config).await?;
            services
                .binding_service
                .revoke(&args.org, &args.reason, Utc::now())
                .await?;
            info!(org = %args.org, "nonce binding revoked");
            Ok(())
        }
        Command::GrantConsent(args) => {
            let store = SqliteConsentStore::open(&cli.db)?;
            let now = Utc::now();
            store
                .record_consent(&ConsentRecord {
                    org_id: args.org.clone(),
                    granted_by: args.granted_by.clone(),
                    granted_at: now,
                    expires_at: now + chrono::Duration::days(args.valid_days),
                    revoked_at: None,
                    consent_type: ConsentType::Explicit,
                })
                .await?;
            info!(org = %args.org, valid_days = args.valid_days, "explicit consent recorded");
            Ok(())
        }
        Command::Purge => {
            let store = SqliteFpEventStore::open(&cli.db)?;
            let removed = store.purge_expired(Utc::now()).await?;
            info!(removed, "expired FP events purged");
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<OracleConfig> {
    let config = match &cli.config {
        Some(path) => OracleConfig::load(path)?,
        None => {
            let mut config = OracleConfig::default();
            config.apply_env_overrides();
            config.validate()?;
            config
        }
    };
    Ok(config)
}

async fn run_pipeline(cli: &Cli, config: OracleConfig, args: &RunArgs) -> Result<()> {
    let raw_snapshot = std::fs::read_to_string(&args.snapshot)
        .with_context(|| format!("cannot read snapshot {}", args.snapshot.display()))?;
    let snapshot = SnapshotState::from_json(&raw_snapshot)?;

    let evidence = match &args.evidence {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read evidence {}", path.display()))?;
            serde_json::from_str::<EvidenceSet>(&raw).context("invalid evidence document")?
        }
        None => EvidenceSet::default(),
    };
    debug!(items = evidence.len(), "evidence loaded");

    let oracle = if args.mode == InvocationMode::Local || args.store == StoreBackend::Memory {
        Oracle::local(config).await?
    } else {
        Services::open(cli, &config).await?.into_oracle(config)?
    };

    let invocation = Invocation {
        mode: args.mode,
        repo: RepoContext {
            org_id: args.org.clone(),
            repo: args.repo.clone(),
            branch: args.branch.clone(),
        },
        now: Utc::now(),
        nonce: args.nonce.clone(),
    };

    let verdict = oracle.run(&snapshot, evidence, &invocation).await?;
    println!("{}", verdict.record.to_canonical_json()?);
    info!(
        decision = verdict.record.decision.as_str(),
        exit_code = verdict.exit_code,
        "done"
    );
    std::process::exit(verdict.exit_code);
}

/// The full persistent service graph behind the CLI subcommands.
struct Services {
    redactor: Arc<Redactor>,
    anonymizer: Arc<Anonymizer>,
    fp_store: Arc<dyn FpEventStore>,
    counter: Arc<dyn BlockCounterStore>,
    aggregator: Arc<CalibrationAggregator>,
    binding_service: Arc<NonceBindingService>,
    verifier: IdentityVerifier,
}

impl Services {
    async fn open(cli: &Cli, config: &OracleConfig) -> Result<Self> {
        let secrets_path = cli
            .secrets_file
            .as_ref()
            .context("--secrets-file is required for persistent operations")?;
        let secret_store: Arc<dyn SecretStore> = Arc::new(FileSecretStore::new(secrets_path));

        let redactor = Arc::new(Redactor::new(
            NonceCache::new(Arc::clone(&secret_store), config.redaction.clone()),
            Vec::new(),
        ));
        let anonymizer = Arc::new(Anonymizer::new(
            Arc::clone(&secret_store),
            config.anonymizer.clone(),
        ));
        anonymizer.load_salt(Utc::now()).await?;

        let fp_store: Arc<dyn FpEventStore> = Arc::new(SqliteFpEventStore::open(&cli.db)?);
        let consent_store = Arc::new(SqliteConsentStore::open(&cli.db)?);
        let counter: Arc<dyn BlockCounterStore> = Arc::new(SqliteBlockCounter::open(
            &cli.db,
            config.breaker.bucket_ttl_hours,
        )?);
        let identity_store = Arc::new(SqliteIdentityStore::open(&cli.db)?);
        let binding_store = Arc::new(SqliteBindingStore::open(&cli.db)?);
        let reputation_store = Arc::new(SqliteReputationStore::open(&cli.db)?);

        let reputation = Arc::new(ReputationEngine::new(
            config.reputation.clone(),
            reputation_store,
            identity_store.clone(),
        ));
        let aggregator = Arc::new(CalibrationAggregator::new(
            config.calibration.clone(),
            Arc::clone(&fp_store),
            consent_store,
            reputation,
            Arc::clone(&anonymizer),
        ));
        let binding_service = Arc::new(NonceBindingService::new(
            identity_store.clone(),
            binding_store,
        ));
        let verifier = IdentityVerifier::new(config.identity.clone(), identity_store, None, None);

        Ok(Self {
            redactor,
            anonymizer,
            fp_store,
            counter,
            aggregator,
            binding_service,
            verifier,
        })
    }

    fn into_oracle(self, config: OracleConfig) -> Result<Oracle> {
        let evaluator = L1Evaluator::new(
            Arc::new(RuleRegistry::new(builtin_rules())?),
            Arc::clone(&self.fp_store),
            Arc::clone(&self.redactor),
            config.fp_store.clone(),
        );
        let breaker = CircuitBreaker::new(config.breaker.clone(), Arc::clone(&self.counter));
        let l0 = L0Checker::new(config.l0.clone())?;

        Ok(Oracle::new(
            config,
            l0,
            evaluator,
            self.redactor,
            self.anonymizer,
            breaker,
            self.counter,
            self.fp_store,
            Some(self.aggregator),
            Some(self.binding_service),
        ))
    }
}
