//! Algorithm selection.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::admit::{Admit, AdmitError, Decision};
use super::fixed_window::FixedWindow;
use super::leaky_bucket::LeakyBucket;
use super::sliding_log::SlidingWindowLog;
use super::sliding_prorate::SlidingWindowProrate;
use super::token_bucket::TokenBucket;
use super::window::RateSettings;
use crate::clock::Clock;
use crate::store::CounterStore;

/// The admission strategies a route can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    TokenBucket,
    LeakyBucket,
    FixedWindow,
    SlidingWindowLog,
    SlidingWindowProrate,
    /// Admits everything; no store traffic.
    Unlimited,
}

impl Algorithm {
    /// Every algorithm, in a stable order.
    pub const ALL: [Algorithm; 6] = [
        Algorithm::TokenBucket,
        Algorithm::LeakyBucket,
        Algorithm::FixedWindow,
        Algorithm::SlidingWindowLog,
        Algorithm::SlidingWindowProrate,
        Algorithm::Unlimited,
    ];

    /// The configuration name, also used as the default key namespace.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::LeakyBucket => "leaky_bucket",
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::SlidingWindowLog => "sliding_window_log",
            Algorithm::SlidingWindowProrate => "sliding_window_prorate",
            Algorithm::Unlimited => "unlimited",
        }
    }

    /// Build the strategy for this algorithm, keyed under `namespace`.
    pub fn build(
        self,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        settings: RateSettings,
        namespace: &str,
    ) -> Box<dyn Admit> {
        match self {
            Algorithm::TokenBucket => Box::new(TokenBucket::new(store, settings, namespace)),
            Algorithm::LeakyBucket => Box::new(LeakyBucket::new(store, settings, namespace)),
            Algorithm::FixedWindow => {
                Box::new(FixedWindow::new(store, clock, settings, namespace))
            }
            Algorithm::SlidingWindowLog => {
                Box::new(SlidingWindowLog::new(store, clock, settings, namespace))
            }
            Algorithm::SlidingWindowProrate => {
                Box::new(SlidingWindowProrate::new(store, clock, settings, namespace))
            }
            Algorithm::Unlimited => Box::new(Unlimited),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A strategy that admits every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unlimited;

#[async_trait]
impl Admit for Unlimited {
    async fn admit(&self) -> Result<Decision, AdmitError> {
        Ok(Decision::Allow)
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::Unlimited
    }
}
