//! Sliding window log: an exact trailing-window count of admitted requests.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use super::admit::{flag_decision, Admit, AdmitError, Decision};
use super::algorithm::Algorithm;
use super::window::RateSettings;
use crate::clock::Clock;
use crate::store::{CounterStore, Transaction};

/// Sliding window log limiter.
///
/// Keeps one sorted-set member per admitted request, scored by its admission
/// time. Members get unique ids from a sequence counter because timestamps
/// collide under load. Each check prunes everything older than the window
/// before counting, so cost grows with the number of entries in the window.
pub struct SlidingWindowLog {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    settings: RateSettings,
    log_key: String,
    seq_key: String,
}

impl SlidingWindowLog {
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
            log_key: format!("{}:log", namespace),
            seq_key: format!("{}:seq", namespace),
        }
    }

    pub fn log_key(&self) -> &str {
        &self.log_key
    }

    pub fn seq_key(&self) -> &str {
        &self.seq_key
    }
}

#[async_trait]
impl Admit for SlidingWindowLog {
    async fn admit(&self) -> Result<Decision, AdmitError> {
        let now = self.clock.now();
        let transaction = Transaction::SlidingLog {
            log_key: self.log_key.clone(),
            seq_key: self.seq_key.clone(),
            capacity: self.settings.capacity(),
            now,
            cutoff: now - self.settings.window_secs(),
            ttl_ms: self.settings.ttl_ms(1.0),
        };

        let reply = self.store.execute(&transaction).await?;
        trace!(key = %self.log_key, now = now, reply = reply, "Sliding log checked");
        flag_decision(Algorithm::SlidingWindowLog, reply)
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::SlidingWindowLog
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn setup(
        capacity: u64,
        rate: f64,
        start: f64,
    ) -> (ManualClock, Arc<MemoryStore>, SlidingWindowLog) {
        let clock = ManualClock::new(start);
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = Arc::new(MemoryStore::new(shared.clone()));
        let settings = RateSettings::new(capacity, rate, 1000.0).unwrap();
        let limiter =
            SlidingWindowLog::new(store.clone(), shared, settings, "test:sliding_window_log");
        (clock, store, limiter)
    }

    #[tokio::test]
    async fn test_no_burst_across_fixed_boundaries() {
        let (clock, store, limiter) = setup(10, 10.0, 0.1);

        for _ in 0..10 {
            assert_eq!(limiter.admit().await.unwrap(), Decision::Allow);
        }
        clock.set(0.9);
        for _ in 0..10 {
            assert_eq!(limiter.admit().await.unwrap(), Decision::Deny);
        }
        // Crossing t=1.0 does not reset anything.
        clock.set(1.05);
        assert_eq!(limiter.admit().await.unwrap(), Decision::Deny);
        assert_eq!(store.cardinality(limiter.log_key()), 10);

        // Once the t=0.1 entries are more than a window old they stop counting.
        clock.set(1.15);
        for _ in 0..10 {
            assert_eq!(limiter.admit().await.unwrap(), Decision::Allow);
        }
        assert_eq!(limiter.admit().await.unwrap(), Decision::Deny);
    }

    #[tokio::test]
    async fn test_any_window_holds_at_most_capacity() {
        let (clock, _, limiter) = setup(5, 5.0, 50.0);
        let mut admitted_at = Vec::new();

        // Offer a request every 70ms for 5 seconds. The spacing never lines
        // two requests up exactly one window apart.
        for step in 0..72 {
            let now = 50.0 + step as f64 * 0.07;
            clock.set(now);
            if limiter.admit().await.unwrap().is_allowed() {
                admitted_at.push(now);
            }
        }

        for (i, start) in admitted_at.iter().enumerate() {
            let in_window = admitted_at[i..]
                .iter()
                .take_while(|t| **t < start + 1.0)
                .count();
            assert!(in_window <= 5, "{} admitted within 1s of {}", in_window, start);
        }
        assert!(admitted_at.len() >= 20);
    }

    #[tokio::test]
    async fn test_denied_requests_are_not_logged() {
        let (_, store, limiter) = setup(3, 3.0, 10.0);

        for _ in 0..8 {
            limiter.admit().await.unwrap();
        }
        assert_eq!(store.cardinality(limiter.log_key()), 3);
        assert_eq!(store.get(limiter.seq_key()), Some(3));
    }

    #[tokio::test]
    async fn test_log_keys_expire_when_idle() {
        let (clock, store, limiter) = setup(3, 3.0, 10.0);

        limiter.admit().await.unwrap();
        assert_eq!(store.pttl(limiter.log_key()), 1000);
        assert_eq!(store.pttl(limiter.seq_key()), 1000);

        clock.advance(1.0);
        assert!(store.is_empty());
    }
}
