//! Result Cache
//!
//! Memoizes whole scan responses behind a key that includes target identity.
//! The backend is optional and fallible: when it is absent or erroring, the
//! cache behaves as an always-miss and scans stay correct, only slower.

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::types::{ComplianceQuery, ScanTarget, SeverityFilter};

/// Every cache key starts with this
pub const KEY_PREFIX: &str = "compliance";

/// Key/value store with per-entry TTL
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;
    /// Returns how many keys were removed
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Vec<u8>,
    pub stored_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn is_expired(&self) -> bool {
        self.stored_at.elapsed() >= self.ttl
    }
}

/// Process-local backend; expired entries are dropped on read and swept on write
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    entries: DashMap<String, CacheEntry>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired() => return Ok(Some(entry.value.clone())),
            Some(_) => {}
            None => return Ok(None),
        }
        self.entries.remove_if(key, |_, entry| entry.is_expired());
        Ok(None)
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.entries.retain(|_, entry| !entry.is_expired());
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                stored_at: Instant::now(),
                ttl,
            },
        );
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        Ok(before.saturating_sub(self.entries.len()))
    }
}

#[cfg(feature = "redis-cache")]
mod redis_backend {
    use anyhow::{Context, Result};
    use async_trait::async_trait;
    use redis::{aio::ConnectionManager, AsyncCommands};
    use std::fmt;
    use std::time::Duration;
    use tracing::{debug, info};

    use super::CacheBackend;

    const SCAN_BATCH: usize = 500;

    /// Shared cache across engine replicas
    #[derive(Clone)]
    pub struct RedisBackend {
        conn: ConnectionManager,
    }

    impl fmt::Debug for RedisBackend {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("RedisBackend")
                .field("connection", &"ConnectionManager")
                .finish()
        }
    }

    impl RedisBackend {
        pub async fn connect(redis_url: &str) -> Result<Self> {
            info!("Connecting to Redis result cache");
            let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
            let conn = ConnectionManager::new(client)
                .await
                .context("Failed to connect to Redis")?;
            Ok(Self { conn })
        }
    }

    #[async_trait]
    impl CacheBackend for RedisBackend {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            let mut conn = self.conn.clone();
            let value: Option<Vec<u8>> = conn.get(key).await.context("Redis GET failed")?;
            Ok(value)
        }

        async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
            let mut conn = self.conn.clone();
            conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
                .await
                .context("Redis SETEX failed")?;
            Ok(())
        }

        async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
            let mut conn = self.conn.clone();
            let pattern = format!("{}*", prefix);
            let mut cursor: u64 = 0;
            let mut removed = 0;

            loop {
                let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_BATCH)
                    .query_async(&mut conn)
                    .await
                    .context("Redis SCAN failed")?;

                if !keys.is_empty() {
                    let deleted: usize = conn.del(keys).await.context("Redis DEL failed")?;
                    removed += deleted;
                }
                if next == 0 {
                    break;
                }
                cursor = next;
            }

            debug!(removed, prefix = %prefix, "Deleted cached results");
            Ok(removed)
        }
    }
}

#[cfg(feature = "redis-cache")]
pub use redis_backend::RedisBackend;

/// Deterministic cache key: `compliance:<scope>:<sha256>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn builder() -> CacheKeyBuilder {
        CacheKeyBuilder::default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix matching every key for one querying account
    pub fn scope_prefix(scope: &str) -> String {
        format!("{}:{}:", KEY_PREFIX, scope)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Collects every component that distinguishes one query from another.
/// Order of targets, resource types and filters does not matter.
#[derive(Debug, Clone, Default)]
pub struct CacheKeyBuilder {
    scope: Option<String>,
    mode: Option<String>,
    target_ids: Vec<String>,
    selector: BTreeMap<String, Vec<String>>,
    resource_types: Vec<String>,
    filters: BTreeMap<String, String>,
    severity: SeverityFilter,
}

impl CacheKeyBuilder {
    /// The querying account
    pub fn scope(mut self, scope: &str) -> Self {
        self.scope = Some(scope.to_string());
        self
    }

    /// Response shape, so single-target and aggregated answers never collide
    pub fn mode(mut self, mode: &str) -> Self {
        self.mode = Some(mode.to_string());
        self
    }

    pub fn targets(mut self, targets: &[ScanTarget]) -> Self {
        self.target_ids
            .extend(targets.iter().map(|t| format!("{}:{}", t.kind, t.id)));
        self
    }

    /// How targets are to be chosen, for keys computed before the targets are known
    pub fn selector(mut self, name: &str, values: &[String]) -> Self {
        let mut values = values.to_vec();
        values.sort();
        values.dedup();
        self.selector.insert(name.to_string(), values);
        self
    }

    pub fn query(mut self, query: &ComplianceQuery) -> Self {
        self.resource_types.extend(query.resource_types.iter().cloned());
        self.filters
            .extend(query.filters.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.severity = query.severity;
        self
    }

    pub fn build(mut self) -> CacheKey {
        self.target_ids.sort();
        self.target_ids.dedup();
        self.resource_types.sort();
        self.resource_types.dedup();

        let scope = self.scope.unwrap_or_else(|| "local".to_string());
        let canonical = serde_json::json!({
            "scope": &scope,
            "mode": self.mode.unwrap_or_default(),
            "targets": self.target_ids,
            "selector": self.selector,
            "resource_types": self.resource_types,
            "filters": self.filters,
            "severity": self.severity.as_str(),
        });

        let digest = Sha256::digest(canonical.to_string().as_bytes());
        CacheKey(format!("{}{}", CacheKey::scope_prefix(&scope), hex::encode(digest)))
    }
}

/// Front for an optional backend; backend failures are logged, never raised
#[derive(Clone)]
pub struct ResultCache {
    backend: Option<Arc<dyn CacheBackend>>,
    ttl: Duration,
}

impl fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCache")
            .field("enabled", &self.backend.is_some())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl ResultCache {
    pub fn new(backend: Option<Arc<dyn CacheBackend>>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(Some(Arc::new(InMemoryBackend::new())), ttl)
    }

    pub fn disabled() -> Self {
        Self::new(None, Duration::ZERO)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some() && !self.ttl.is_zero()
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        if !self.is_enabled() {
            return None;
        }
        let backend = self.backend.as_ref()?;

        match backend.get(key.as_str()).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(value) => {
                    debug!(key = %key, "Result cache hit");
                    Some(value)
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Discarding undecodable cache entry");
                    None
                }
            },
            Ok(None) => {
                debug!(key = %key, "Result cache miss");
                None
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Result cache unavailable, treating as miss");
                None
            }
        }
    }

    /// Store `value`; `ttl` overrides the default
    pub async fn put<T: Serialize>(&self, key: &CacheKey, value: &T, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.ttl);
        let Some(backend) = self.backend.as_ref() else {
            return;
        };
        if ttl.is_zero() {
            return;
        }

        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to encode scan result for cache");
                return;
            }
        };

        match backend.put(key.as_str(), bytes, ttl).await {
            Ok(()) => debug!(key = %key, ttl_secs = ttl.as_secs(), "Result cached"),
            Err(e) => warn!(key = %key, error = %e, "Result cache write failed"),
        }
    }

    /// Drop every key under `prefix`, or every scan result
    pub async fn invalidate(&self, prefix: Option<&str>) -> usize {
        let Some(backend) = self.backend.as_ref() else {
            return 0;
        };
        let prefix = match prefix {
            Some(p) if p.starts_with(KEY_PREFIX) => p.to_string(),
            Some(scope) => CacheKey::scope_prefix(scope),
            None => format!("{}:", KEY_PREFIX),
        };

        match backend.delete_prefix(&prefix).await {
            Ok(removed) => {
                debug!(prefix = %prefix, removed, "Result cache invalidated");
                removed
            }
            Err(e) => {
                warn!(prefix = %prefix, error = %e, "Result cache invalidation failed");
                0
            }
        }
    }
}
