//! Redis-backed counter store.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{RedisError, RedisResult, Script};
use tracing::{info, trace};

use super::scripts;
use super::{CounterStore, StoreError, Transaction};

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
        {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Script(err.to_string())
        }
    }
}

/// A counter store on a shared Redis connection.
///
/// The connection manager multiplexes every caller onto one connection and
/// reconnects in the background; cloning it per call only clones the handle.
/// Commands are never retried.
pub struct RedisStore {
    connection: ConnectionManager,
    timeout: Duration,
    token_bucket: Script,
    leaky_bucket: Script,
    sliding_log: Script,
    sliding_prorate: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("timeout", &self.timeout)
            .field("connection", &"<ConnectionManager>")
            .finish()
    }
}

impl RedisStore {
    /// Connect to the store at `url` and verify it answers.
    ///
    /// `timeout` bounds every subsequent transaction.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| {
            StoreError::Unavailable(format!("invalid counter store url '{}': {}", url, e))
        })?;

        // Initial connects back off internally, so give them more room than a
        // single transaction gets.
        let connect_timeout = timeout.max(Duration::from_secs(1));
        let mut connection = tokio::time::timeout(connect_timeout, client.get_connection_manager())
            .await
            .map_err(|_| StoreError::Timeout(connect_timeout))??;

        let pong: String = redis::cmd("PING").query_async(&mut connection).await?;
        info!(
            url = %url,
            reply = %pong,
            timeout_ms = timeout.as_millis() as u64,
            "Connected to counter store"
        );

        Ok(Self {
            connection,
            timeout,
            token_bucket: Script::new(scripts::TOKEN_BUCKET),
            leaky_bucket: Script::new(scripts::LEAKY_BUCKET),
            sliding_log: Script::new(scripts::SLIDING_LOG),
            sliding_prorate: Script::new(scripts::SLIDING_PRORATE),
        })
    }

    async fn run(&self, transaction: &Transaction) -> RedisResult<i64> {
        let mut conn = self.connection.clone();

        let reply: i64 = match transaction {
            Transaction::TokenBucket {
                key,
                capacity,
                ttl_ms,
            } => {
                self.token_bucket
                    .key(key)
                    .arg(*capacity)
                    .arg(*ttl_ms)
                    .invoke_async(&mut conn)
                    .await?
            }
            Transaction::LeakyBucket {
                key,
                capacity,
                ttl_ms,
            } => {
                self.leaky_bucket
                    .key(key)
                    .arg(*capacity)
                    .arg(*ttl_ms)
                    .invoke_async(&mut conn)
                    .await?
            }
            Transaction::FixedWindow {
                key,
                capacity,
                ttl_ms,
            } => {
                let (remaining,): (i64,) = redis::pipe()
                    .atomic()
                    .cmd("SET")
                    .arg(key)
                    .arg(*capacity)
                    .arg("NX")
                    .arg("PX")
                    .arg(*ttl_ms)
                    .ignore()
                    .cmd("DECR")
                    .arg(key)
                    .query_async(&mut conn)
                    .await?;
                remaining
            }
            Transaction::SlidingLog {
                log_key,
                seq_key,
                capacity,
                now,
                cutoff,
                ttl_ms,
            } => {
                self.sliding_log
                    .key(log_key)
                    .key(seq_key)
                    .arg(*capacity)
                    .arg(now.to_string())
                    .arg(format!("({}", cutoff))
                    .arg(*ttl_ms)
                    .invoke_async(&mut conn)
                    .await?
            }
            Transaction::SlidingProrate {
                current_key,
                previous_key,
                capacity,
                previous_weight,
                ttl_ms,
            } => {
                self.sliding_prorate
                    .key(current_key)
                    .key(previous_key)
                    .arg(*capacity)
                    .arg(previous_weight.to_string())
                    .arg(*ttl_ms)
                    .invoke_async(&mut conn)
                    .await?
            }
        };

        Ok(reply)
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn execute(&self, transaction: &Transaction) -> Result<i64, StoreError> {
        let reply = tokio::time::timeout(self.timeout, self.run(transaction))
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))??;

        trace!(
            transaction = transaction.name(),
            key = transaction.key(),
            reply = reply,
            "Executed store transaction"
        );
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ttl_millis;

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    async fn live_store() -> RedisStore {
        RedisStore::connect(&redis_url(), Duration::from_millis(500))
            .await
            .unwrap()
    }

    /// A second connection for inspecting and tampering with keys.
    async fn raw_connection() -> redis::aio::MultiplexedConnection {
        redis::Client::open(redis_url())
            .unwrap()
            .get_multiplexed_async_connection()
            .await
            .unwrap()
    }

    fn unique_key(kind: &str) -> String {
        format!("turnstile-test:{}:{}", kind, chrono::Utc::now().timestamp_micros())
    }

    async fn raw_get(conn: &mut redis::aio::MultiplexedConnection, key: &str) -> Option<i64> {
        let value: Option<i64> = redis::cmd("GET").arg(key).query_async(conn).await.unwrap();
        value
    }

    async fn raw_pttl(conn: &mut redis::aio::MultiplexedConnection, key: &str) -> i64 {
        let ttl: i64 = redis::cmd("PTTL").arg(key).query_async(conn).await.unwrap();
        ttl
    }

    async fn raw_persist(conn: &mut redis::aio::MultiplexedConnection, key: &str) {
        let removed: i64 = redis::cmd("PERSIST").arg(key).query_async(conn).await.unwrap();
        assert_eq!(removed, 1);
    }

    /// Run `tx` from `callers` concurrent futures and count the admitted ones.
    async fn concurrent_admissions(
        store: &RedisStore,
        tx: &Transaction,
        callers: usize,
        admitted: fn(i64) -> bool,
    ) -> usize {
        futures::future::join_all((0..callers).map(|_| store.execute(tx)))
            .await
            .into_iter()
            .filter(|reply| admitted(*reply.as_ref().unwrap()))
            .count()
    }

    #[test]
    fn test_io_errors_are_unavailable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: StoreError = RedisError::from(io).into();
        assert!(err.is_unavailable());
    }

    #[test]
    fn test_response_errors_are_script_errors() {
        let err: StoreError = RedisError::from((
            redis::ErrorKind::TypeError,
            "WRONGTYPE Operation against a key holding the wrong kind of value",
        ))
        .into();
        assert!(matches!(err, StoreError::Script(_)));
    }

    #[tokio::test]
    async fn test_invalid_url_is_unavailable() {
        let err = RedisStore::connect("not a redis url", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(err.to_string().contains("invalid counter store url"));
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let result = RedisStore::connect("redis://127.0.0.1:1", Duration::from_millis(50)).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().is_unavailable());
    }

    #[tokio::test]
    #[ignore = "requires a running Redis (set REDIS_URL)"]
    async fn test_fixed_window_against_redis() {
        let store = RedisStore::connect(&redis_url(), Duration::from_millis(200))
            .await
            .unwrap();
        let key = format!("turnstile-test:fixed:{}", chrono::Utc::now().timestamp_micros());
        let tx = Transaction::FixedWindow {
            key,
            capacity: 3,
            ttl_ms: ttl_millis(10.0),
        };

        let replies: Vec<i64> = futures::future::join_all((0..5).map(|_| store.execute(&tx)))
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        let admitted = replies.iter().filter(|r| **r >= 0).count();
        assert_eq!(admitted, 3);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis (set REDIS_URL)"]
    async fn test_sliding_log_against_redis() {
        let store = RedisStore::connect(&redis_url(), Duration::from_millis(200))
            .await
            .unwrap();
        let suffix = chrono::Utc::now().timestamp_micros();
        let tx = |now: f64| Transaction::SlidingLog {
            log_key: format!("turnstile-test:log:{}", suffix),
            seq_key: format!("turnstile-test:seq:{}", suffix),
            capacity: 2,
            now,
            cutoff: now - 1.0,
            ttl_ms: 1000,
        };

        assert_eq!(store.execute(&tx(100.0)).await.unwrap(), 1);
        assert_eq!(store.execute(&tx(100.5)).await.unwrap(), 1);
        assert_eq!(store.execute(&tx(100.9)).await.unwrap(), 0);
        assert_eq!(store.execute(&tx(101.2)).await.unwrap(), 1);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis (set REDIS_URL)"]
    async fn test_token_bucket_script_against_redis() {
        let store = live_store().await;
        let mut conn = raw_connection().await;
        let key = unique_key("token");
        let tx = Transaction::TokenBucket {
            key: key.clone(),
            capacity: 3,
            ttl_ms: 10_000,
        };

        for expected in [2, 1, 0] {
            assert_eq!(store.execute(&tx).await.unwrap(), expected);
        }
        assert!(store.execute(&tx).await.unwrap() < 0);
        assert!(store.execute(&tx).await.unwrap() < 0);
        assert_eq!(raw_get(&mut conn, &key).await, Some(0));

        // An exhausted bucket without expiry is refilled on the next request.
        raw_persist(&mut conn, &key).await;
        assert_eq!(raw_pttl(&mut conn, &key).await, -1);
        assert_eq!(store.execute(&tx).await.unwrap(), 2);
        assert_eq!(raw_get(&mut conn, &key).await, Some(2));
        assert!(raw_pttl(&mut conn, &key).await > 0);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis (set REDIS_URL)"]
    async fn test_leaky_bucket_script_against_redis() {
        let store = live_store().await;
        let mut conn = raw_connection().await;
        let key = unique_key("leaky");
        let tx = Transaction::LeakyBucket {
            key: key.clone(),
            capacity: 3,
            ttl_ms: 10_000,
        };

        for expected in [1, 2, 3, 4, 4] {
            assert_eq!(store.execute(&tx).await.unwrap(), expected);
        }
        assert_eq!(raw_get(&mut conn, &key).await, Some(3));

        raw_persist(&mut conn, &key).await;
        assert_eq!(raw_pttl(&mut conn, &key).await, -1);
        assert_eq!(store.execute(&tx).await.unwrap(), 4);
        assert!(raw_pttl(&mut conn, &key).await > 0);
        assert_eq!(raw_get(&mut conn, &key).await, Some(3));
    }

    #[tokio::test]
    #[ignore = "requires a running Redis (set REDIS_URL)"]
    async fn test_sliding_prorate_script_against_redis() {
        let store = live_store().await;
        let mut conn = raw_connection().await;

        // Missing previous window counts as zero.
        let current = unique_key("prorate-current");
        let tx = Transaction::SlidingProrate {
            current_key: current.clone(),
            previous_key: unique_key("prorate-missing"),
            capacity: 2,
            previous_weight: 0.9,
            ttl_ms: 10_000,
        };
        assert_eq!(store.execute(&tx).await.unwrap(), 1);
        assert_eq!(store.execute(&tx).await.unwrap(), 1);
        assert_eq!(store.execute(&tx).await.unwrap(), 0);
        assert_eq!(raw_get(&mut conn, &current).await, Some(2));
        assert!(raw_pttl(&mut conn, &current).await > 0);

        // A full previous window at half weight leaves half the capacity.
        let previous = unique_key("prorate-previous");
        let _: () = redis::cmd("SET")
            .arg(&previous)
            .arg(10)
            .arg("PX")
            .arg(10_000)
            .query_async(&mut conn)
            .await
            .unwrap();
        let tx = Transaction::SlidingProrate {
            current_key: unique_key("prorate-weighted"),
            previous_key: previous,
            capacity: 10,
            previous_weight: 0.5,
            ttl_ms: 10_000,
        };
        let mut allowed = 0;
        for _ in 0..10 {
            allowed += store.execute(&tx).await.unwrap();
        }
        assert_eq!(allowed, 5);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis (set REDIS_URL)"]
    async fn test_scripts_admit_exactly_capacity_under_concurrency() {
        let store = live_store().await;

        let token = Transaction::TokenBucket {
            key: unique_key("concurrent-token"),
            capacity: 25,
            ttl_ms: 10_000,
        };
        assert_eq!(concurrent_admissions(&store, &token, 200, |r| r >= 0).await, 25);

        let leaky = Transaction::LeakyBucket {
            key: unique_key("concurrent-leaky"),
            capacity: 25,
            ttl_ms: 10_000,
        };
        assert_eq!(concurrent_admissions(&store, &leaky, 200, |r| r <= 25).await, 25);

        let prorate = Transaction::SlidingProrate {
            current_key: unique_key("concurrent-prorate"),
            previous_key: unique_key("concurrent-prorate-previous"),
            capacity: 25,
            previous_weight: 0.5,
            ttl_ms: 10_000,
        };
        assert_eq!(concurrent_admissions(&store, &prorate, 200, |r| r == 1).await, 25);
    }
}
