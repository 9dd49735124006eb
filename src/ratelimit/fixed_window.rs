//! Fixed window counter: one independent counter per window index.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use super::admit::{Admit, AdmitError, Decision};
use super::algorithm::Algorithm;
use super::window::RateSettings;
use crate::clock::Clock;
use crate::store::{CounterStore, Transaction};

/// Counters live for two windows so the previous one can still be inspected.
const TTL_WINDOWS: f64 = 2.0;

/// Fixed window limiter.
///
/// Up to `2 * capacity` requests can pass around a window boundary; that burst
/// is inherent to fixed windows.
pub struct FixedWindow {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    settings: RateSettings,
    namespace: String,
}

impl FixedWindow {
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

    /// The store key for the window with the given index.
    pub fn key_for(&self, window_index: i64) -> String {
        format!("{}:{}", self.namespace, window_index)
    }
}

#[async_trait]
impl Admit for FixedWindow {
    async fn admit(&self) -> Result<Decision, AdmitError> {
        let window_index = self.settings.window_index(self.clock.now());
        let transaction = Transaction::FixedWindow {
            key: self.key_for(window_index),
            capacity: self.settings.capacity(),
            ttl_ms: self.settings.ttl_ms(TTL_WINDOWS),
        };

        let remaining = self.store.execute(&transaction).await?;
        trace!(
            window = window_index,
            remaining = remaining,
            "Fixed window decremented"
        );
        Ok(Decision::from_allowed(remaining >= 0))
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::FixedWindow
    }
}
