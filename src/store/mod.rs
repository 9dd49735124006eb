//! The shared counter store.
//!
//! Each admission check is a single [`Transaction`] submitted through
//! [`CounterStore::execute`]. Implementations must run the whole transaction
//! atomically: no other caller may observe or mutate the touched keys between
//! its first read and its last write.

mod memory;
mod redis_store;
mod scripts;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by a counter store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or the connection dropped mid-call.
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    /// The call did not complete within the transport timeout.
    #[error("counter store call timed out after {0:?}")]
    Timeout(Duration),

    /// The store rejected the transaction itself (wrong key type, script error).
    #[error("counter store rejected transaction: {0}")]
    Script(String),
}

impl StoreError {
    /// Whether this error means the store could not answer at all, as opposed
    /// to answering with an error.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }
}

/// One atomic admission transaction and its runtime arguments.
///
/// Durations are carried as whole milliseconds because window lengths are
/// frequently fractional seconds.
#[derive(Debug, Clone, PartialEq)]
pub enum Transaction {
    /// Initialize to `capacity` if absent, decrement, repair a missing TTL.
    /// Replies with the remaining tokens. A decrement below zero is undone.
    TokenBucket {
        key: String,
        capacity: u64,
        ttl_ms: u64,
    },
    /// Initialize to 0 if absent, increment, repair a missing TTL.
    /// Replies with the count after the increment. An increment past
    /// `capacity` is undone.
    LeakyBucket {
        key: String,
        capacity: u64,
        ttl_ms: u64,
    },
    /// Initialize the window's counter to `capacity` if absent, decrement.
    /// Replies with the decremented value.
    FixedWindow {
        key: String,
        capacity: u64,
        ttl_ms: u64,
    },
    /// Prune entries scored below `cutoff`, then insert a fresh member scored
    /// `now` unless the log already holds `capacity` entries.
    /// Replies 1 when inserted, 0 when full.
    SlidingLog {
        log_key: String,
        seq_key: String,
        capacity: u64,
        now: f64,
        cutoff: f64,
        ttl_ms: u64,
    },
    /// Increment the current window's counter when
    /// `current + previous * previous_weight < capacity`.
    /// Replies 1 when incremented, 0 otherwise.
    SlidingProrate {
        current_key: String,
        previous_key: String,
        capacity: u64,
        previous_weight: f64,
        ttl_ms: u64,
    },
}

impl Transaction {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Transaction::TokenBucket { .. } => "token_bucket",
            Transaction::LeakyBucket { .. } => "leaky_bucket",
            Transaction::FixedWindow { .. } => "fixed_window",
            Transaction::SlidingLog { .. } => "sliding_window_log",
            Transaction::SlidingProrate { .. } => "sliding_window_prorate",
        }
    }

    /// The primary key this transaction mutates.
    pub fn key(&self) -> &str {
        match self {
            Transaction::TokenBucket { key, .. }
            | Transaction::LeakyBucket { key, .. }
            | Transaction::FixedWindow { key, .. } => key,
            Transaction::SlidingLog { log_key, .. } => log_key,
            Transaction::SlidingProrate { current_key, .. } => current_key,
        }
    }
}

/// Convert a duration in seconds to a store TTL in milliseconds, rounding up
/// so a key never expires before the end of its window.
pub fn ttl_millis(secs: f64) -> u64 {
    (secs * 1000.0).ceil().max(1.0) as u64
}

/// A shared store able to execute admission transactions atomically.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Execute one transaction in a single round trip and return its reply.
    async fn execute(&self, transaction: &Transaction) -> Result<i64, StoreError>;
}
