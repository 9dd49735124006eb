//! Sliding window prorate: a trailing-window estimate from two fixed windows.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use super::admit::{flag_decision, Admit, AdmitError, Decision};
use super::algorithm::Algorithm;
use super::window::RateSettings;
use crate::clock::Clock;
use crate::store::{CounterStore, Transaction};

/// A counter must still be readable as "previous" throughout the next window.
const TTL_WINDOWS: f64 = 4.0;

/// Sliding window prorate limiter.
///
/// Estimates the trailing-window count as
/// `current + previous * previous_window_weight`, where the weight is the
/// share of the trailing window that overlaps the previous fixed window.
/// Constant storage and work per check, at the cost of assuming requests in
/// the previous window were evenly spread.
pub struct SlidingWindowProrate {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    settings: RateSettings,
    namespace: String,
}

impl SlidingWindowProrate {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        settings: RateSettings,
        namespace: &str,
    ) -> Self {
        Self {
            store,
            clock,
            settings,
            namespace: namespace.to_string(),
        }
    }

    pub fn key_for(&self, window_index: i64) -> String {
        format!("{}:{}", self.namespace, window_index)
    }
}

#[async_trait]
impl Admit for SlidingWindowProrate {
    async fn admit(&self) -> Result<Decision, AdmitError> {
        let now = self.clock.now();
        let window_index = self.settings.window_index(now);
        let previous_weight = self.settings.previous_window_weight(now);

        let transaction = Transaction::SlidingProrate {
            current_key: self.key_for(window_index),
            previous_key: self.key_for(window_index - 1),
            capacity: self.settings.capacity(),
            previous_weight,
            ttl_ms: self.settings.ttl_ms(TTL_WINDOWS),
        };

        let reply = self.store.execute(&transaction).await?;
        trace!(
            window = window_index,
            previous_weight = previous_weight,
            reply = reply,
            "Sliding prorate checked"
        );
        flag_decision(Algorithm::SlidingWindowProrate, reply)
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::SlidingWindowProrate
    }
}
