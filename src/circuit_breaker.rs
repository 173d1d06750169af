//! Circuit Breaker
//!
//! Degraded-mode trigger over the time-bucketed block counter. When a rule
//! blocks too often inside the window, new BLOCK outcomes for it demote to
//! WARN until the cooldown and a quiet hysteresis period have both elapsed.
//! Events are still recorded while tripped, so observability survives the
//! degradation.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::block_counter::BlockCounterStore;
use crate::config::BreakerConfig;
use crate::error::OracleResult;

/// Per-rule breaker state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BreakerState {
    Closed,
    Tripped {
        until: DateTime<Utc>,
        /// Last time the threshold was observed breached.
        last_breach: DateTime<Utc>,
    },
}

/// What the evaluator needs to know about one rule right now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerDecision {
    pub tripped: bool,
    pub recent_blocks: u64,
}

/// Breaker over a shared block counter. States are process-local; the
/// counter is the shared source of truth, so parallel instances converge
/// within one bucket interval.
pub struct CircuitBreaker {
    config: BreakerConfig,
    counter: Arc<dyn BlockCounterStore>,
    states: RwLock<HashMap<String, BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, counter: Arc<dyn BlockCounterStore>) -> Self {
        Self {
            config,
            counter,
            states: RwLock::new(HashMap::new()),
        }
    }

    fn state_key(rule_id: &str, org_repo_hash: &str) -> String {
        format!("{rule_id}#{org_repo_hash}")
    }

    /// Current state for observability.
    pub fn state(&self, rule_id: &str, org_repo_hash: &str) -> BreakerState {
        self.states
            .read()
            .get(&Self::state_key(rule_id, org_repo_hash))
            .cloned()
            .unwrap_or(BreakerState::Closed)
    }

    /// Evaluate the breaker for one rule at `now`.
    pub async fn check(
        &self,
        rule_id: &str,
        org_repo_hash: &str,
        now: DateTime<Utc>,
    ) -> OracleResult<BreakerDecision> {
        let recent_blocks = self
            .counter
            .sum_last_n(rule_id, org_repo_hash, self.config.window_hours, now)
            .await?;

        let key = Self::state_key(rule_id, org_repo_hash);
        let mut states = self.states.write();
        let state = states.entry(key).or_insert(BreakerState::Closed);

        let tripped = match state {
            BreakerState::Closed => {
                if recent_blocks >= self.config.threshold {
                    *state = BreakerState::Tripped {
                        until: now + Duration::hours(self.config.cooldown_hours as i64),
                        last_breach: now,
                    };
                    metrics::counter!("oracle_breaker_tripped_total", 1);
                    warn!(
                        rule_id,
                        recent_blocks,
                        threshold = self.config.threshold,
                        "circuit breaker tripped"
                    );
                    true
                } else {
                    false
                }
            }
            BreakerState::Tripped { until, last_breach } => {
                if recent_blocks >= self.config.threshold {
                    // Still breaching: extend the trip.
                    *until = now + Duration::hours(self.config.cooldown_hours as i64);
                    *last_breach = now;
                    true
                } else if now >= *until
                    && now - *last_breach
                        >= Duration::hours(self.config.hysteresis_hours as i64)
                {
                    info!(rule_id, "circuit breaker closed after cooldown");
                    *state = BreakerState::Closed;
                    false
                } else {
                    true
                }
            }
        };

        Ok(BreakerDecision {
            tripped,
            recent_blocks,
        })
    }
}
