//! The admission interface shared by every algorithm.

use async_trait::async_trait;
use thiserror::Error;

use super::algorithm::Algorithm;
use crate::store::StoreError;

/// The two-valued admission outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decision {
    /// Continue handling the request.
    Allow,
    /// Reject the request with "too many requests".
    Deny,
}

impl Decision {
    /// Map a boolean admission result to a decision.
    pub fn from_allowed(allowed: bool) -> Self {
        if allowed {
            Decision::Allow
        } else {
            Decision::Deny
        }
    }

    pub fn is_allowed(self) -> bool {
        self == Decision::Allow
    }

    /// HTTP status the request layer should answer with on this decision,
    /// `None` when the request proceeds normally.
    pub fn rejection_status(self) -> Option<u16> {
        match self {
            Decision::Allow => None,
            Decision::Deny => Some(429),
        }
    }
}

/// Errors that prevent an admission decision.
#[derive(Debug, Error)]
pub enum AdmitError {
    /// The counter store failed the transaction.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The store answered with a value the algorithm cannot interpret.
    #[error("{algorithm} transaction returned unexpected reply {reply}")]
    UnexpectedReply {
        algorithm: Algorithm,
        reply: i64,
    },

    /// No limiter is registered for the requested route.
    #[error("no rate limiter configured for route '{0}'")]
    RouteNotFound(String),
}

/// An admission-control strategy.
///
/// Each call performs exactly one atomic transaction against the counter
/// store; implementations hold no mutable state of their own.
#[async_trait]
pub trait Admit: Send + Sync {
    /// Decide whether the current request may proceed.
    async fn admit(&self) -> Result<Decision, AdmitError>;

    /// The algorithm behind this strategy.
    fn algorithm(&self) -> Algorithm;
}

/// Interpret a 1/0 script reply.
pub(crate) fn flag_decision(algorithm: Algorithm, reply: i64) -> Result<Decision, AdmitError> {
    match reply {
        1 => Ok(Decision::Allow),
        0 => Ok(Decision::Deny),
        reply => Err(AdmitError::UnexpectedReply { algorithm, reply }),
    }
}
