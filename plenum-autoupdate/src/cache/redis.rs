//! Redis-backed cache provider for multi-worker deployments.
//!
//! Layout:
//! ```text
//! {prefix}:full       hash    cache_key -> full data (JSON)
//! {prefix}:log        zset    score = change id, member = log entry (JSON)
//! {prefix}:change_id  string  last allocated change id
//! {prefix}:lowest     string  retention floor
//! {prefix}:init       string  startup rebuild marker (SET NX)
//! ```
//!
//! Batch atomicity comes from a single Lua script: it increments the change
//! id counter, writes every element of the batch, appends the log entry and
//! prunes old entries in one atomic step, so a reader on any worker either
//! sees the whole batch or none of it. The connection is a multiplexed
//! `ConnectionManager` cloned per call.

use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{Client, Script};
use serde::Deserialize;
use std::time::Duration;

use async_trait::async_trait;

use super::element::{CacheChange, Element, ElementId, FullData};
use super::provider::{CacheError, CacheProvider, SinceOutcome};

/// Atomic batch apply: allocate id, write data, append log, prune.
///
/// KEYS: full, log, change_id, lowest
/// ARGV: max_log, changed_count, [key, json]*, [deleted_key]*
const APPLY_BATCH_SCRIPT: &str = r#"
local id = redis.call('INCR', KEYS[3])
local max_log = tonumber(ARGV[1])
local changed = tonumber(ARGV[2])
local touched = {}
local i = 3
for n = 1, changed do
    redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
    table.insert(touched, ARGV[i])
    i = i + 2
end
while i <= #ARGV do
    redis.call('HDEL', KEYS[1], ARGV[i])
    table.insert(touched, ARGV[i])
    i = i + 1
end
local entry = '{"change_id":' .. id .. ',"touched":['
for n = 1, #touched do
    entry = entry .. cjson.encode(touched[n])
    if n < #touched then entry = entry .. ',' end
end
entry = entry .. ']}'
redis.call('ZADD', KEYS[2], id, entry)
local count = redis.call('ZCARD', KEYS[2])
if count > max_log then
    local surplus = count - max_log
    local removed = redis.call('ZRANGE', KEYS[2], 0, surplus - 1, 'WITHSCORES')
    redis.call('ZREMRANGEBYRANK', KEYS[2], 0, surplus - 1)
    redis.call('SET', KEYS[4], removed[#removed])
end
return id
"#;

/// Atomic clear: wipe data, log and marker; keep the counter, move the floor.
///
/// KEYS: full, log, change_id, lowest, init
const CLEAR_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[3])
if current == false then current = '0' end
redis.call('DEL', KEYS[1], KEYS[2], KEYS[5])
redis.call('SET', KEYS[4], current)
return 1
"#;

/// Redis provider configuration.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL, e.g. `redis://127.0.0.1:6379`
    pub url: String,
    /// Key prefix so several deployments can share one redis
    pub key_prefix: String,
    /// Maximum retained change log entries
    pub max_log_entries: usize,
    /// Connection timeout for the manager
    pub connect_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "plenum".to_string(),
            max_log_entries: 10_000,
            connect_timeout: Duration::from_millis(500),
        }
    }
}

/// Shape of a change log zset member.
#[derive(Debug, Deserialize)]
struct LogEntry {
    #[allow(dead_code)]
    change_id: u64,
    touched: Vec<String>,
}

/// Redis-backed [`CacheProvider`].
pub struct RedisCacheProvider {
    conn: ConnectionManager,
    config: RedisConfig,
    apply_script: Script,
    clear_script: Script,
    full_key: String,
    log_key: String,
    change_id_key: String,
    lowest_key: String,
    init_key: String,
}

impl RedisCacheProvider {
    /// Connect to redis and build the provider.
    pub async fn connect(config: RedisConfig) -> Result<Self, CacheError> {
        let manager_config = ConnectionManagerConfig::new()
            .set_number_of_retries(2)
            .set_connection_timeout(config.connect_timeout);

        let client = Client::open(config.url.as_str())?;
        let conn = client
            .get_connection_manager_with_config(manager_config)
            .await?;

        let prefix = config.key_prefix.clone();
        Ok(Self {
            conn,
            apply_script: Script::new(APPLY_BATCH_SCRIPT),
            clear_script: Script::new(CLEAR_SCRIPT),
            full_key: format!("{prefix}:full"),
            log_key: format!("{prefix}:log"),
            change_id_key: format!("{prefix}:change_id"),
            lowest_key: format!("{prefix}:lowest"),
            init_key: format!("{prefix}:init"),
            config,
        })
    }

    fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    fn element_from_entry(key: &str, json: &str) -> Result<Element, CacheError> {
        let id = ElementId::parse_cache_key(key).ok_or_else(|| {
            CacheError::Serialization(format!("invalid cache key in redis: {key}"))
        })?;
        let data: FullData = serde_json::from_str(json)?;
        Ok(Element::new(id, data))
    }
}

#[async_trait]
impl CacheProvider for RedisCacheProvider {
    async fn get_full_data(&self, id: &ElementId) -> Result<Option<FullData>, CacheError> {
        let mut conn = self.connection();
        let raw: Option<String> = redis::cmd("HGET")
            .arg(&self.full_key)
            .arg(id.cache_key())
            .query_async(&mut conn)
            .await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn get_all_data(&self) -> Result<Vec<Element>, CacheError> {
        let mut conn = self.connection();
        let raw: Vec<(String, String)> = redis::cmd("HGETALL")
            .arg(&self.full_key)
            .query_async(&mut conn)
            .await?;

        let mut elements = Vec::with_capacity(raw.len());
        for (key, json) in &raw {
            elements.push(Self::element_from_entry(key, json)?);
        }
        elements.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(elements)
    }

    async fn apply_batch(&self, batch: &CacheChange) -> Result<u64, CacheError> {
        let mut invocation = self.apply_script.prepare_invoke();
        invocation
            .key(&self.full_key)
            .key(&self.log_key)
            .key(&self.change_id_key)
            .key(&self.lowest_key)
            .arg(self.config.max_log_entries)
            .arg(batch.changed.len());
        for element in &batch.changed {
            let json = serde_json::to_string(&element.data)?;
            invocation.arg(element.id.cache_key()).arg(json);
        }
        for id in &batch.deleted {
            invocation.arg(id.cache_key());
        }

        let mut conn = self.connection();
        let change_id: u64 = invocation.invoke_async(&mut conn).await?;
        Ok(change_id)
    }

    async fn data_since(&self, from: u64, to: Option<u64>) -> Result<SinceOutcome, CacheError> {
        let lowest = self.lowest_change_id().await?;
        if from < lowest {
            return Ok(SinceOutcome::TooOld);
        }

        let current = self.current_change_id().await?;
        let upper = to.unwrap_or(current).min(current);
        if upper <= from {
            return Ok(SinceOutcome::Diff {
                changed: Vec::new(),
                deleted: Vec::new(),
                to_change_id: from,
            });
        }

        let mut conn = self.connection();
        let entries: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.log_key)
            .arg(from + 1)
            .arg(upper)
            .query_async(&mut conn)
            .await?;

        let mut keys: Vec<String> = Vec::new();
        for raw in &entries {
            let entry: LogEntry = serde_json::from_str(raw)?;
            for key in entry.touched {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }

        if keys.is_empty() {
            return Ok(SinceOutcome::Diff {
                changed: Vec::new(),
                deleted: Vec::new(),
                to_change_id: upper,
            });
        }

        let values: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(&self.full_key)
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        let mut changed = Vec::new();
        let mut deleted = Vec::new();
        for (key, value) in keys.iter().zip(values) {
            match value {
                Some(json) => changed.push(Self::element_from_entry(key, &json)?),
                None => {
                    let id = ElementId::parse_cache_key(key).ok_or_else(|| {
                        CacheError::Serialization(format!("invalid cache key in redis: {key}"))
                    })?;
                    deleted.push(id);
                }
            }
        }

        Ok(SinceOutcome::Diff {
            changed,
            deleted,
            to_change_id: upper,
        })
    }

    async fn current_change_id(&self) -> Result<u64, CacheError> {
        let mut conn = self.connection();
        let raw: Option<u64> = redis::cmd("GET")
            .arg(&self.change_id_key)
            .query_async(&mut conn)
            .await?;
        Ok(raw.unwrap_or(0))
    }

    async fn lowest_change_id(&self) -> Result<u64, CacheError> {
        let mut conn = self.connection();
        let raw: Option<u64> = redis::cmd("GET")
            .arg(&self.lowest_key)
            .query_async(&mut conn)
            .await?;
        Ok(raw.unwrap_or(0))
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let mut conn = self.connection();
        let _: i64 = self
            .clear_script
            .prepare_invoke()
            .key(&self.full_key)
            .key(&self.log_key)
            .key(&self.change_id_key)
            .key(&self.lowest_key)
            .key(&self.init_key)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn try_init_marker(&self) -> Result<bool, CacheError> {
        let mut conn = self.connection();
        let set: Option<String> = redis::cmd("SET")
            .arg(&self.init_key)
            .arg(1)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        Ok(set.is_some())
    }
}
