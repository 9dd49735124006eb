//! A route-bound rate limiter with an explicit store-failure policy.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::admit::{Admit, AdmitError, Decision};
use super::algorithm::Algorithm;

/// What to decide when the counter store cannot be reached.
///
/// Only connectivity failures and timeouts are covered. A store that answers
/// with an error is never turned into a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Admit the request; availability over the rate guarantee.
    #[default]
    Open,
    /// Reject the request; the rate guarantee over availability.
    Closed,
}

impl FailurePolicy {
    /// The decision this policy substitutes for an unreachable store.
    pub fn decision(self) -> Decision {
        match self {
            FailurePolicy::Open => Decision::Allow,
            FailurePolicy::Closed => Decision::Deny,
        }
    }
}

/// One admission strategy bound to a route.
///
/// This struct is thread-safe and meant to be shared behind an `Arc` by every
/// request handler serving the route.
pub struct RateLimiter {
    route: String,
    strategy: Box<dyn Admit>,
    on_store_failure: FailurePolicy,
}

impl RateLimiter {
    pub fn new(
        route: impl Into<String>,
        strategy: Box<dyn Admit>,
        on_store_failure: FailurePolicy,
    ) -> Self {
        Self {
            route: route.into(),
            strategy,
            on_store_failure,
        }
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn algorithm(&self) -> Algorithm {
        self.strategy.algorithm()
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.on_store_failure
    }

    /// Decide whether the current request on this route may proceed.
    ///
    /// An unreachable store yields the failure policy's decision. Any other
    /// failure is returned to the caller; nothing is retried.
    pub async fn admit(&self) -> Result<Decision, AdmitError> {
        match self.strategy.admit().await {
            Ok(decision) => {
                if decision == Decision::Deny {
                    debug!(
                        route = %self.route,
                        algorithm = %self.algorithm(),
                        "Rate limit exceeded"
                    );
                }
                Ok(decision)
            }
            Err(AdmitError::Store(err)) if err.is_unavailable() => {
                let decision = self.on_store_failure.decision();
                warn!(
                    route = %self.route,
                    algorithm = %self.algorithm(),
                    error = %err,
                    policy = ?self.on_store_failure,
                    decision = ?decision,
                    "Counter store unavailable, applying failure policy"
                );
                Ok(decision)
            }
            Err(err) => {
                error!(
                    route = %self.route,
                    algorithm = %self.algorithm(),
                    error = %err,
                    "Admission check failed"
                );
                Err(err)
            }
        }
    }
}
