//! Redis-backed store.
//!
//! Window transforms and conditional writes run as Lua scripts so that the
//! trim, append and expiry update for a key happen in one server-side step.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use tracing::{debug, info};

use super::{SharedCounterStore, StoreError, StoreResult};
use crate::config::StoreConfig;
use crate::ratelimit::{TransformOutcome, WindowRecord, WindowTransform};

/// Trim-and-record for one hit. Must stay in step with `WindowTransform::apply`.
///
/// KEYS[1] record key
/// ARGV: now ms, window ms, expiry ms, representation
/// Returns {encoded record, 1 if the previous value was unreadable}.
const RECORD_HIT_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local expiry = tonumber(ARGV[3])
local mode = ARGV[4]

local function whole(n)
  return type(n) == 'number' and n >= 0 and n == math.floor(n)
end

-- A stored value is a timestamp array, a full counter object, or corrupt.
local log, counter = nil, nil
local corrupt = 0
if raw then
  local ok, value = pcall(cjson.decode, raw)
  if not ok or type(value) ~= 'table' then
    corrupt = 1
  elseif string.match(raw, '^%s*%[') then
    log = value
    for _, t in ipairs(log) do
      if not whole(t) then
        log = nil
        corrupt = 1
        break
      end
    end
  elseif whole(value.start) and whole(value.current) and whole(value.previous) then
    counter = value
  else
    corrupt = 1
  end
end

local encoded
if mode == 'log' then
  local hits = {}
  if log then
    for _, t in ipairs(log) do
      if now - t < window then
        hits[#hits + 1] = t
      end
    end
  end
  local at = #hits + 1
  while at > 1 and hits[at - 1] > now do
    at = at - 1
  end
  table.insert(hits, at, now)
  local parts = {}
  for i, t in ipairs(hits) do
    parts[i] = string.format('%.0f', t)
  end
  encoded = '[' .. table.concat(parts, ',') .. ']'
else
  local bucket = now - (now % window)
  local start, current, previous = bucket, 0, 0
  if counter then
    start, current, previous = counter.start, counter.current, counter.previous
  end
  if bucket <= start then
    current = current + 1
  elseif bucket == start + window then
    previous = current
    current = 1
    start = bucket
  else
    previous = 0
    current = 1
    start = bucket
  end
  encoded = string.format(
    '{"start":%.0f,"current":%.0f,"previous":%.0f}', start, current, previous)
end

redis.call('SET', KEYS[1], encoded, 'PX', expiry)
return {encoded, corrupt}
"#;

/// Conditional write.
///
/// KEYS[1] record key
/// ARGV: "1" if a value is expected else "0", expected value, new value, expiry ms
const COMPARE_AND_SET_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if current ~= ARGV[2] then
    return 0
  end
elseif current then
  return 0
end
redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[4])
return 1
"#;

/// A [`SharedCounterStore`] backed by a Redis server.
pub struct RedisStore {
    /// Multiplexed connection, cloned per operation
    connection: MultiplexedConnection,
    /// Prepended to every key
    key_prefix: String,
    /// Upper bound on any single round trip
    response_timeout: Duration,
    record_hit_script: Script,
    compare_and_set_script: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("key_prefix", &self.key_prefix)
            .field("response_timeout", &self.response_timeout)
            .finish()
    }
}

impl RedisStore {
    /// Connect to the server named by `config.redis_url`.
    pub async fn connect(config: &StoreConfig) -> StoreResult<Self> {
        info!(
            url = %sanitize_url(&config.redis_url),
            key_prefix = %config.key_prefix,
            "Connecting to redis counter store"
        );

        let client = Client::open(config.redis_url.as_str())?;
        let connect_timeout = Duration::from_millis(config.connect_timeout_ms);
        let connection =
            tokio::time::timeout(connect_timeout, client.get_multiplexed_async_connection())
                .await
                .map_err(|_| StoreError::Timeout(connect_timeout))?
                .map_err(classify)?;

        info!("Redis counter store connected");

        Ok(Self {
            connection,
            key_prefix: config.key_prefix.clone(),
            response_timeout: Duration::from_millis(config.response_timeout_ms),
            record_hit_script: Script::new(RECORD_HIT_SCRIPT),
            compare_and_set_script: Script::new(COMPARE_AND_SET_SCRIPT),
        })
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn bounded<T, F>(&self, operation: F) -> StoreResult<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.response_timeout, operation).await {
            Ok(result) => result.map_err(classify),
            Err(_) => Err(StoreError::Timeout(self.response_timeout)),
        }
    }
}

/// Transport failures become `Unavailable`; anything else stays a redis error.
fn classify(error: redis::RedisError) -> StoreError {
    if error.is_io_error() || error.is_connection_dropped() || error.is_timeout() {
        StoreError::Unavailable(error.to_string())
    } else {
        StoreError::Redis(error)
    }
}

/// Hide the password when logging a redis URL.
fn sanitize_url(url: &str) -> String {
    match url.split_once('@') {
        Some((credentials, host)) => match credentials.rsplit_once(':') {
            Some((user, _password)) if user.contains("://") => format!("{user}:***@{host}"),
            _ => format!("{credentials}@{host}"),
        },
        None => url.to_string(),
    }
}

#[async_trait]
impl SharedCounterStore for RedisStore {
    async fn read(&self, key: &str) -> StoreResult<Option<String>> {
        let key = self.prefixed(key);
        let mut conn = self.connection.clone();
        self.bounded(async move { conn.get(&key).await }).await
    }

    async fn write(&self, key: &str, value: &str, expiry: Duration) -> StoreResult<()> {
        let key = self.prefixed(key);
        let mut conn = self.connection.clone();
        self.bounded(async move {
            let _: () = redis::cmd("SET")
                .arg(&key)
                .arg(value)
                .arg("PX")
                .arg(expiry.as_millis() as u64)
                .query_async(&mut conn)
                .await?;
            Ok(())
        })
        .await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        expiry: Duration,
    ) -> StoreResult<bool> {
        let key = self.prefixed(key);
        let mut conn = self.connection.clone();
        let mut invocation = self.compare_and_set_script.key(&key);
        invocation
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or(""))
            .arg(value)
            .arg(expiry.as_millis() as u64);

        let written: i64 = self
            .bounded(async { invocation.invoke_async(&mut conn).await })
            .await?;
        Ok(written == 1)
    }

    fn supports_mutate(&self) -> bool {
        true
    }

    async fn mutate(
        &self,
        key: &str,
        transform: &WindowTransform,
    ) -> StoreResult<TransformOutcome> {
        let key = self.prefixed(key);
        let mut conn = self.connection.clone();
        let mut invocation = self.record_hit_script.key(&key);
        invocation
            .arg(transform.now_ms)
            .arg(transform.window_ms)
            .arg(transform.expiry().as_millis() as u64)
            .arg(transform.representation.as_str());

        let (encoded, corrupt): (String, i64) = self
            .bounded(async { invocation.invoke_async(&mut conn).await })
            .await?;

        debug!(key = %key, record = %encoded, "Window record updated by script");

        let record = WindowRecord::decode(&encoded)
            .map_err(|e| {
                StoreError::Unavailable(format!("script returned unreadable record: {e}"))
            })?;
        Ok(TransformOutcome {
            record,
            recovered_corrupt: corrupt == 1,
        })
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        let _: String = self
            .bounded(async move { redis::cmd("PING").query_async(&mut conn).await })
            .await?;
        Ok(())
    }
}
