//! Per-call streaming context store.
//!
//! Policies that evaluate streaming chunks often need the accumulated text
//! so far and a stable chunk index, across processes. This store keeps
//! both under TTL-guarded keys:
//!
//! - `stream:<id>:text` - append-only text accumulator
//! - `stream:<id>:index` - monotonically increasing chunk counter
//!
//! Transactions use independent keyspaces and never interfere.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use redis::AsyncCommands;

/// Minimal key/value surface the store needs from its backend.
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    /// Append to a string value, refreshing its TTL.
    async fn append(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()>;

    /// Increment a counter, refreshing its TTL. Returns the new value.
    async fn incr(&self, key: &str, ttl: Duration) -> anyhow::Result<i64>;

    /// Read a value.
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    /// Delete a value.
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
}

/// Redis-backed store, shared across proxy processes.
pub struct RedisBackend {
    connection: redis::aio::ConnectionManager,
}

impl RedisBackend {
    /// Connect to the given Redis URL.
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let connection = client.get_connection_manager().await?;
        Ok(Self { connection })
    }
}

#[async_trait]
impl KeyValueBackend for RedisBackend {
    async fn append(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        let mut connection = self.connection.clone();
        let () = connection.append(key, value).await?;
        let () = connection.expire(key, ttl.as_secs() as i64).await?;
        Ok(())
    }

    async fn incr(&self, key: &str, ttl: Duration) -> anyhow::Result<i64> {
        let mut connection = self.connection.clone();
        let value: i64 = connection.incr(key, 1).await?;
        let () = connection.expire(key, ttl.as_secs() as i64).await?;
        Ok(value)
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut connection = self.connection.clone();
        Ok(connection.get(key).await?)
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let mut connection = self.connection.clone();
        let () = connection.del(key).await?;
        Ok(())
    }
}

/// In-process store for tests and single-node deployments without Redis.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryBackend {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, (String, Instant)>) -> T) -> T {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut entries)
    }
}

#[async_trait]
impl KeyValueBackend for MemoryBackend {
    async fn append(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        self.with_entries(|entries| {
            let deadline = Instant::now() + ttl;
            match entries.get_mut(key) {
                Some((existing, expires)) if *expires > Instant::now() => {
                    existing.push_str(value);
                    *expires = deadline;
                }
                _ => {
                    entries.insert(key.to_string(), (value.to_string(), deadline));
                }
            }
        });
        Ok(())
    }

    async fn incr(&self, key: &str, ttl: Duration) -> anyhow::Result<i64> {
        Ok(self.with_entries(|entries| {
            let deadline = Instant::now() + ttl;
            let next = match entries.get(key) {
                Some((value, expires)) if *expires > Instant::now() => {
                    value.parse::<i64>().unwrap_or(0) + 1
                }
                _ => 1,
            };
            entries.insert(key.to_string(), (next.to_string(), deadline));
            next
        }))
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.with_entries(|entries| match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Some(value.clone()),
            _ => None,
        }))
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.with_entries(|entries| {
            entries.remove(key);
        });
        Ok(())
    }
}

/// Accumulated-text and chunk-index storage keyed by transaction id.
pub struct StreamContextStore {
    backend: Box<dyn KeyValueBackend>,
    ttl: Duration,
}

impl StreamContextStore {
    /// Build a store over the given backend.
    pub fn new(backend: Box<dyn KeyValueBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    /// Build a store from configuration: Redis when a URL is configured,
    /// the in-process backend otherwise.
    pub async fn from_config(config: &config::StreamStoreConfig) -> anyhow::Result<Self> {
        let backend: Box<dyn KeyValueBackend> = match &config.redis_url {
            Some(url) => {
                log::info!("Stream context store backed by Redis");
                Box::new(RedisBackend::connect(url).await?)
            }
            None => {
                log::info!("Stream context store backed by process memory");
                Box::new(MemoryBackend::new())
            }
        };

        Ok(Self::new(backend, config.ttl))
    }

    fn text_key(call_id: &str) -> String {
        format!("stream:{call_id}:text")
    }

    fn index_key(call_id: &str) -> String {
        format!("stream:{call_id}:index")
    }

    /// Append delta text and bump the chunk index, refreshing TTLs.
    pub async fn append_delta(&self, call_id: &str, text: &str) -> anyhow::Result<()> {
        if call_id.is_empty() || text.is_empty() {
            return Ok(());
        }

        self.backend
            .append(&Self::text_key(call_id), text, self.ttl)
            .await?;
        self.backend.incr(&Self::index_key(call_id), self.ttl).await?;
        Ok(())
    }

    /// The accumulated text for a call, empty when missing.
    pub async fn get_accumulated(&self, call_id: &str) -> anyhow::Result<String> {
        if call_id.is_empty() {
            return Ok(String::new());
        }

        Ok(self
            .backend
            .get(&Self::text_key(call_id))
            .await?
            .unwrap_or_default())
    }

    /// The current chunk index for a call, 0 when missing.
    pub async fn get_index(&self, call_id: &str) -> anyhow::Result<u64> {
        if call_id.is_empty() {
            return Ok(0);
        }

        Ok(self
            .backend
            .get(&Self::index_key(call_id))
            .await?
            .and_then(|value| value.parse().ok())
            .unwrap_or(0))
    }

    /// Drop the stored text and index for a call.
    pub async fn clear(&self, call_id: &str) -> anyhow::Result<()> {
        if call_id.is_empty() {
            return Ok(());
        }

        self.backend.delete(&Self::text_key(call_id)).await?;
        self.backend.delete(&Self::index_key(call_id)).await?;
        Ok(())
    }
}
