//! Dissonance Oracle
//!
//! A callable, auditable inconsistency-finding oracle: evaluates a
//! repository snapshot against a closed-world registry of governance rules
//! and emits a deterministic, evidence-bearing decision record.
//!
//! Layering, leaves first: the L0 invariant gate, the HMAC redaction layer
//! with its versioned nonce cache, the FP event store, the time-bucketed
//! block counter and circuit breaker, the rule registry and L1 evaluator,
//! the anonymiser, identity verification and nonce binding, the reputation
//! engine, the k-anonymous calibration aggregator, and the pipeline that
//! orchestrates the lot.

pub mod anonymizer;
pub mod block_counter;
pub mod calibration;
pub mod canonical;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod fp_store;
pub mod identity;
pub mod invariants;
pub mod pipeline;
pub mod redaction;
pub mod reputation;
pub mod rules;
pub mod secrets;
pub mod snapshot;

pub use config::{InvocationMode, OracleConfig, Tier};
pub use error::{OracleError, OracleResult};
pub use fp_store::Outcome;
pub use pipeline::{DecisionRecord, Degradation, Invocation, Oracle, Verdict};
pub use rules::{Evidence, EvidenceKind, EvidenceSet, Finding, RepoContext};
pub use snapshot::SnapshotState;
