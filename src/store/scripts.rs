//! Lua bodies for the Redis backend.
//!
//! The bodies are fixed; capacity, TTLs and timestamps arrive through ARGV so
//! each script is loaded once and invoked by SHA afterwards.

/// KEYS[1] bucket. ARGV: capacity, ttl_ms. Returns remaining tokens; a
/// rejected decrement is undone so the bucket never drops below zero.
pub const TOKEN_BUCKET: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local ttl = tonumber(ARGV[2])
redis.call('SET', key, capacity, 'NX', 'PX', ttl)
local remaining = redis.call('DECR', key)
if remaining >= 0 then
  return remaining
end
if redis.call('PTTL', key) == -1 then
  redis.call('SET', key, capacity - 1, 'PX', ttl)
  return capacity - 1
end
redis.call('INCR', key)
return remaining
"#;

/// KEYS[1] bucket. ARGV: capacity, ttl_ms. Returns the count after increment;
/// an increment past capacity is undone before returning.
pub const LEAKY_BUCKET: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local ttl = tonumber(ARGV[2])
redis.call('SET', key, 0, 'NX', 'PX', ttl)
local count = redis.call('INCR', key)
if redis.call('PTTL', key) == -1 then
  redis.call('PEXPIRE', key, ttl)
end
if count > capacity then
  redis.call('DECR', key)
end
return count
"#;

/// KEYS[1] log, KEYS[2] sequence. ARGV: capacity, now, exclusive min score
/// ("(cutoff"), ttl_ms. Returns 1 when admitted, 0 when the log is full.
pub const SLIDING_LOG: &str = r#"
local log_key = KEYS[1]
local seq_key = KEYS[2]
local capacity = tonumber(ARGV[1])
local ttl = tonumber(ARGV[4])
redis.call('ZREMRANGEBYSCORE', log_key, '-inf', ARGV[3])
if redis.call('ZCARD', log_key) >= capacity then
  return 0
end
local member = redis.call('INCR', seq_key)
redis.call('ZADD', log_key, ARGV[2], member)
redis.call('PEXPIRE', log_key, ttl)
redis.call('PEXPIRE', seq_key, ttl)
return 1
"#;

/// KEYS[1] current window, KEYS[2] previous window. ARGV: capacity,
/// previous_weight, ttl_ms. Returns 1 when admitted, 0 otherwise.
pub const SLIDING_PRORATE: &str = r#"
local current_key = KEYS[1]
local previous_key = KEYS[2]
local capacity = tonumber(ARGV[1])
local weight = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])
redis.call('SET', current_key, 0, 'NX', 'PX', ttl)
local current = tonumber(redis.call('GET', current_key))
local previous = tonumber(redis.call('GET', previous_key) or '0')
if current + previous * weight < capacity then
  redis.call('INCR', current_key)
  return 1
end
return 0
"#;
