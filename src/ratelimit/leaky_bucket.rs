//! Leaky bucket, counting variant: requests admitted so far this window.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use super::admit::{Admit, AdmitError, Decision};
use super::algorithm::Algorithm;
use super::window::RateSettings;
use crate::store::{CounterStore, Transaction};

/// Leaky bucket limiter.
///
/// Counts up from zero instead of draining down from capacity. The store
/// re-applies the window TTL whenever it finds the counter without one.
pub struct LeakyBucket {
    store: Arc<dyn CounterStore>,
    settings: RateSettings,
    key: String,
}

impl LeakyBucket {
    pub fn new(store: Arc<dyn CounterStore>, settings: RateSettings, namespace: &str) -> Self {
        Self {
            store,
            settings,
            key: format!("{}:bucket", namespace),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl Admit for LeakyBucket {
    async fn admit(&self) -> Result<Decision, AdmitError> {
        let transaction = Transaction::LeakyBucket {
            key: self.key.clone(),
            capacity: self.settings.capacity(),
            ttl_ms: self.settings.ttl_ms(1.0),
        };
        let count = self.store.execute(&transaction).await?;
        if count < 1 {
            return Err(AdmitError::UnexpectedReply {
                algorithm: Algorithm::LeakyBucket,
                reply: count,
            });
        }

        trace!(key = %self.key, count = count, "Leaky bucket filled");
        Ok(Decision::from_allowed(count as u64 <= self.settings.capacity()))
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::LeakyBucket
    }
}
