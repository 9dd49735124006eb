//! Token bucket: a counter of tokens left in the current window.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use super::admit::{Admit, AdmitError, Decision};
use super::algorithm::Algorithm;
use super::window::RateSettings;
use crate::store::{CounterStore, Transaction};

/// Token bucket limiter.
///
/// The bucket is created full with a one-window TTL on the first request of
/// a window and drained by one token per request. A bucket found empty and
/// without an expiry is refilled (minus the current request) instead of
/// denying forever.
pub struct TokenBucket {
    store: Arc<dyn CounterStore>,
    settings: RateSettings,
    key: String,
}

impl TokenBucket {
    pub fn new(store: Arc<dyn CounterStore>, settings: RateSettings, namespace: &str) -> Self {
        Self {
            store,
            settings,
            key: format!("{}:bucket", namespace),
        }
    }

    /// The store key holding the bucket.
    pub fn key(&self) -> &str {
        &self.key
    }

    fn transaction(&self) -> Transaction {
        Transaction::TokenBucket {
            key: self.key.clone(),
            capacity: self.settings.capacity(),
            ttl_ms: self.settings.ttl_ms(1.0),
        }
    }
}

#[async_trait]
impl Admit for TokenBucket {
    async fn admit(&self) -> Result<Decision, AdmitError> {
        let remaining = self.store.execute(&self.transaction()).await?;
        trace!(key = %self.key, remaining = remaining, "Token bucket drained");
        Ok(Decision::from_allowed(remaining >= 0))
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::TokenBucket
    }
}
