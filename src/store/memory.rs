//! In-process counter store with Redis semantics.
//!
//! Used by tests and single-process deployments. Every transaction runs under
//! one lock, which gives the same serialization a Redis script gets from the
//! server's single command thread. Expiry is lazy and driven by the injected
//! clock, so synthetic time moves TTLs too.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{CounterStore, StoreError, Transaction};
use crate::clock::Clock;

const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

#[derive(Debug, Clone)]
enum Value {
    Int(i64),
    SortedSet(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    /// Absolute expiry in seconds; `None` means the key persists.
    expires_at: Option<f64>,
}

/// The keyspace as seen by one transaction: all reads share a single `now`.
struct Keyspace<'a> {
    entries: &'a mut HashMap<String, Entry>,
    now: f64,
}

impl<'a> Keyspace<'a> {
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= self.now);
        if expired {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn expiry(&self, ttl_ms: u64) -> Option<f64> {
        Some(self.now + ttl_ms as f64 / 1000.0)
    }

    /// `SET key value NX PX ttl`. Returns whether the key was written.
    fn set_nx(&mut self, key: &str, value: i64, ttl_ms: u64) -> bool {
        if self.live(key).is_some() {
            return false;
        }
        let expires_at = self.expiry(ttl_ms);
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Int(value),
                expires_at,
            },
        );
        true
    }

    /// `SET key value PX ttl`.
    fn set(&mut self, key: &str, value: i64, ttl_ms: u64) {
        let expires_at = self.expiry(ttl_ms);
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Int(value),
                expires_at,
            },
        );
    }

    /// `GET key` as an integer.
    fn get(&mut self, key: &str) -> Result<Option<i64>, StoreError> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Int(v),
                ..
            }) => Ok(Some(*v)),
            Some(_) => Err(StoreError::Script(WRONGTYPE.to_string())),
        }
    }

    /// `INCRBY key delta`. A missing key starts at 0 with no expiry.
    fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64, StoreError> {
        if let Some(entry) = self.live(key) {
            return match &mut entry.value {
                Value::Int(v) => {
                    *v += delta;
                    Ok(*v)
                }
                Value::SortedSet(_) => Err(StoreError::Script(WRONGTYPE.to_string())),
            };
        }
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Int(delta),
                expires_at: None,
            },
        );
        Ok(delta)
    }

    /// `PTTL key`: -2 when missing, -1 when the key has no expiry.
    fn pttl(&mut self, key: &str) -> i64 {
        let now = self.now;
        match self.live(key) {
            None => -2,
            Some(Entry {
                expires_at: None, ..
            }) => -1,
            Some(Entry {
                expires_at: Some(at),
                ..
            }) => ((*at - now) * 1000.0).round() as i64,
        }
    }

    /// `PEXPIRE key ttl`.
    fn pexpire(&mut self, key: &str, ttl_ms: u64) {
        let expires_at = self.expiry(ttl_ms);
        if let Some(entry) = self.live(key) {
            entry.expires_at = expires_at;
        }
    }

    fn sorted_set(&mut self, key: &str) -> Result<Option<&mut HashMap<String, f64>>, StoreError> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::SortedSet(set),
                ..
            }) => Ok(Some(set)),
            Some(_) => Err(StoreError::Script(WRONGTYPE.to_string())),
        }
    }

    /// `ZREMRANGEBYSCORE key -inf (cutoff` followed by `ZCARD key`.
    fn prune_and_count(&mut self, key: &str, cutoff: f64) -> Result<usize, StoreError> {
        let remaining = match self.sorted_set(key)? {
            None => return Ok(0),
            Some(set) => {
                set.retain(|_, score| *score >= cutoff);
                set.len()
            }
        };
        // Redis deletes a sorted set once its last member goes.
        if remaining == 0 {
            self.entries.remove(key);
        }
        Ok(remaining)
    }

    /// `ZADD key score member`.
    fn zadd(&mut self, key: &str, score: f64, member: String) -> Result<(), StoreError> {
        if let Some(set) = self.sorted_set(key)? {
            set.insert(member, score);
            return Ok(());
        }
        let mut set = HashMap::new();
        set.insert(member, score);
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::SortedSet(set),
                expires_at: None,
            },
        );
        Ok(())
    }
}

/// A counter store held in process memory.
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    /// Create an empty store whose TTLs follow `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn with_keyspace<T>(&self, f: impl FnOnce(&mut Keyspace<'_>) -> T) -> T {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let mut keyspace = Keyspace {
            entries: &mut *entries,
            now,
        };
        f(&mut keyspace)
    }

    /// Integer value at `key`, if present and not a sorted set.
    pub fn get(&self, key: &str) -> Option<i64> {
        self.with_keyspace(|ks| ks.get(key).ok().flatten())
    }

    /// Remaining TTL of `key` in milliseconds, Redis `PTTL` style.
    pub fn pttl(&self, key: &str) -> i64 {
        self.with_keyspace(|ks| ks.pttl(key))
    }

    /// Remove the expiry from `key`. Returns whether the key existed.
    pub fn persist(&self, key: &str) -> bool {
        self.with_keyspace(|ks| match ks.live(key) {
            Some(entry) => {
                entry.expires_at = None;
                true
            }
            None => false,
        })
    }

    /// Write an integer with no expiry, replacing whatever was at `key`.
    pub fn set_raw(&self, key: &str, value: i64) {
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: Value::Int(value),
                expires_at: None,
            },
        );
    }

    /// Number of members in the sorted set at `key` (expired members included
    /// until the next prune).
    pub fn cardinality(&self, key: &str) -> usize {
        self.with_keyspace(|ks| match ks.sorted_set(key) {
            Ok(Some(set)) => set.len(),
            _ => 0,
        })
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.with_keyspace(|ks| {
            let now = ks.now;
            ks.entries
                .retain(|_, e| e.expires_at.map_or(true, |at| at > now));
            ks.entries.len()
        })
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn apply(ks: &mut Keyspace<'_>, transaction: &Transaction) -> Result<i64, StoreError> {
        match transaction {
            Transaction::TokenBucket {
                key,
                capacity,
                ttl_ms,
            } => {
                let capacity = *capacity as i64;
                ks.set_nx(key, capacity, *ttl_ms);
                let remaining = ks.incr_by(key, -1)?;
                if remaining >= 0 {
                    return Ok(remaining);
                }
                if ks.pttl(key) == -1 {
                    ks.set(key, capacity - 1, *ttl_ms);
                    return Ok(capacity - 1);
                }
                ks.incr_by(key, 1)?;
                Ok(remaining)
            }
            Transaction::LeakyBucket {
                key,
                capacity,
                ttl_ms,
            } => {
                ks.set_nx(key, 0, *ttl_ms);
                let count = ks.incr_by(key, 1)?;
                if ks.pttl(key) == -1 {
                    ks.pexpire(key, *ttl_ms);
                }
                if count > *capacity as i64 {
                    ks.incr_by(key, -1)?;
                }
                Ok(count)
            }
            Transaction::FixedWindow {
                key,
                capacity,
                ttl_ms,
            } => {
                ks.set_nx(key, *capacity as i64, *ttl_ms);
                ks.incr_by(key, -1)
            }
            Transaction::SlidingLog {
                log_key,
                seq_key,
                capacity,
                now,
                cutoff,
                ttl_ms,
            } => {
                if ks.prune_and_count(log_key, *cutoff)? as u64 >= *capacity {
                    return Ok(0);
                }
                let member = ks.incr_by(seq_key, 1)?;
                ks.zadd(log_key, *now, member.to_string())?;
                ks.pexpire(log_key, *ttl_ms);
                ks.pexpire(seq_key, *ttl_ms);
                Ok(1)
            }
            Transaction::SlidingProrate {
                current_key,
                previous_key,
                capacity,
                previous_weight,
                ttl_ms,
            } => {
                ks.set_nx(current_key, 0, *ttl_ms);
                let current = ks.get(current_key)?.unwrap_or(0);
                let previous = ks.get(previous_key)?.unwrap_or(0);
                if (current as f64) + (previous as f64) * previous_weight < *capacity as f64 {
                    ks.incr_by(current_key, 1)?;
                    return Ok(1);
                }
                Ok(0)
            }
        }
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("keys", &self.entries.lock().len())
            .finish()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn execute(&self, transaction: &Transaction) -> Result<i64, StoreError> {
        self.with_keyspace(|ks| Self::apply(ks, transaction))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (ManualClock, MemoryStore) {
        let clock = ManualClock::new(1_000.0);
        let store = MemoryStore::new(Arc::new(clock.clone()));
        (clock, store)
    }

    #[tokio::test]
    async fn test_fixed_window_initializes_with_ttl() {
        let (_, store) = store();
        let tx = Transaction::FixedWindow {
            key: "fw:1".into(),
            capacity: 3,
            ttl_ms: 2000,
        };

        assert_eq!(store.execute(&tx).await.unwrap(), 2);
        assert_eq!(store.get("fw:1"), Some(2));
        assert_eq!(store.pttl("fw:1"), 2000);
    }

    #[tokio::test]
    async fn test_keys_expire_with_clock() {
        let (clock, store) = store();
        let tx = Transaction::FixedWindow {
            key: "fw:1".into(),
            capacity: 3,
            ttl_ms: 1500,
        };
        store.execute(&tx).await.unwrap();

        clock.advance(1.0);
        assert_eq!(store.pttl("fw:1"), 500);

        clock.advance(0.5);
        assert_eq!(store.get("fw:1"), None);
        assert_eq!(store.pttl("fw:1"), -2);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_persist_strips_expiry() {
        let (_, store) = store();
        store
            .execute(&Transaction::LeakyBucket {
                key: "lb".into(),
                capacity: 2,
                ttl_ms: 1000,
            })
            .await
            .unwrap();

        assert!(store.persist("lb"));
        assert_eq!(store.pttl("lb"), -1);
        assert!(!store.persist("missing"));
    }

    #[tokio::test]
    async fn test_sliding_log_prunes_strictly_below_cutoff() {
        let (_, store) = store();
        let tx = |now: f64| Transaction::SlidingLog {
            log_key: "log".into(),
            seq_key: "seq".into(),
            capacity: 2,
            now,
            cutoff: now - 1.0,
            ttl_ms: 1000,
        };

        assert_eq!(store.execute(&tx(10.0)).await.unwrap(), 1);
        assert_eq!(store.execute(&tx(10.5)).await.unwrap(), 1);
        // The entry at 10.0 sits exactly on the cutoff and still counts.
        assert_eq!(store.execute(&tx(11.0)).await.unwrap(), 0);
        assert_eq!(store.execute(&tx(11.01)).await.unwrap(), 1);
        assert_eq!(store.cardinality("log"), 2);
    }

    #[tokio::test]
    async fn test_sliding_log_members_are_unique_for_equal_timestamps() {
        let (_, store) = store();
        let tx = Transaction::SlidingLog {
            log_key: "log".into(),
            seq_key: "seq".into(),
            capacity: 5,
            now: 42.0,
            cutoff: 41.0,
            ttl_ms: 1000,
        };

        for _ in 0..3 {
            assert_eq!(store.execute(&tx).await.unwrap(), 1);
        }
        assert_eq!(store.cardinality("log"), 3);
        assert_eq!(store.get("seq"), Some(3));
    }

    #[tokio::test]
    async fn test_wrong_type_is_script_error() {
        let (_, store) = store();
        store
            .execute(&Transaction::SlidingLog {
                log_key: "shared".into(),
                seq_key: "seq".into(),
                capacity: 5,
                now: 1.0,
                cutoff: 0.0,
                ttl_ms: 1000,
            })
            .await
            .unwrap();

        let err = store
            .execute(&Transaction::FixedWindow {
                key: "shared".into(),
                capacity: 5,
                ttl_ms: 1000,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Script(_)));
    }

    #[tokio::test]
    async fn test_prorate_treats_missing_previous_as_zero() {
        let (_, store) = store();
        let tx = Transaction::SlidingProrate {
            current_key: "p:2".into(),
            previous_key: "p:1".into(),
            capacity: 1,
            previous_weight: 0.9,
            ttl_ms: 4000,
        };

        assert_eq!(store.execute(&tx).await.unwrap(), 1);
        assert_eq!(store.execute(&tx).await.unwrap(), 0);
        assert_eq!(store.get("p:2"), Some(1));
        assert_eq!(store.get("p:1"), None);
    }
}
