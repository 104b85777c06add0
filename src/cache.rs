// Token Cache - TTL key-value write path for enriched market pairs
// Key: "token:<base token address>", value: pair JSON + transaction_signature, TTL 24h

use anyhow::Result;
#[cfg(feature = "redis")]
use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, error, info, warn};
#[cfg(feature = "redis")]
use redis::aio::ConnectionManager;
#[cfg(feature = "redis")]
use redis::{AsyncCommands, Client};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::market_data::MarketPairRecord;
use crate::metrics;

pub const DEFAULT_TTL: Duration = Duration::from_secs(86_400);
pub const DEFAULT_KEY_PREFIX: &str = "token:";

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to serialize pair: {0}")]
    Serialize(#[from] serde_json::Error),
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Set-with-expiry key-value store.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
}

/// Redis (or Upstash over `rediss://`) backend. Connected once per process.
#[cfg(feature = "redis")]
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
}

#[cfg(feature = "redis")]
impl RedisBackend {
    /// Connects and answers a `PING` before returning.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).context("Failed to create Redis client")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;
        let backend = Self { conn };
        backend.health_check().await?;
        info!("✅ [Cache] Redis connected");
        Ok(backend)
    }

    /// Test Redis connection
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Redis health check failed")?;

        if pong == "PONG" {
            Ok(())
        } else {
            anyhow::bail!("Unexpected Redis response: {}", pong)
        }
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl CacheBackend for RedisBackend {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs()).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        Ok(conn.get::<_, Option<String>>(key).await?)
    }
}

/// Process-local TTL map. Used when no Redis endpoint is configured, and in tests.
#[derive(Default)]
pub struct InMemoryTtlCache {
    entries: DashMap<String, (String, Instant)>,
}

impl InMemoryTtlCache {
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
impl CacheBackend for InMemoryTtlCache {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.entries
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let hit = self
            .entries
            .get(key)
            .map(|entry| (entry.0.clone(), entry.1));
        match hit {
            Some((value, expires_at)) if Instant::now() < expires_at => Ok(Some(value)),
            Some(_) => {
                self.entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

/// Writes enriched pairs keyed by base token address.
pub struct TokenCache {
    backend: Option<Arc<dyn CacheBackend>>,
    ttl: Duration,
    key_prefix: String,
}

impl TokenCache {
    pub fn new(backend: Option<Arc<dyn CacheBackend>>) -> Self {
        Self {
            backend,
            ttl: DEFAULT_TTL,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn is_available(&self) -> bool {
        self.backend.is_some()
    }

    pub fn key_for(&self, base_token_address: &str) -> String {
        format!("{}{}", self.key_prefix, base_token_address)
    }

    /// Writes every pair tagged with `signature`. Per-pair failures are logged and
    /// skipped. Returns the number of pairs written.
    pub async fn store(&self, signature: &str, pairs: &[MarketPairRecord]) -> usize {
        let Some(backend) = &self.backend else {
            warn!(
                "⚠️ [Cache] Cannot store token data for {}: cache unavailable",
                signature
            );
            return 0;
        };
        if pairs.is_empty() {
            warn!("⚠️ [Cache] Cannot store token data for {}: no pairs", signature);
            return 0;
        }

        let mut stored = 0;
        for pair in pairs {
            let Some(base_token_address) = pair.base_token_address() else {
                warn!(
                    "⚠️ [Cache] No base token address found in pair for transaction {}",
                    signature
                );
                continue;
            };

            let key = self.key_for(base_token_address);
            let written = match serde_json::to_string(&pair.tagged_with(signature)) {
                Ok(value) => backend.set_ex(&key, &value, self.ttl).await,
                Err(e) => Err(e.into()),
            };

            match written {
                Ok(()) => {
                    stored += 1;
                    debug!(
                        "💾 [Cache] Stored pair data for base token {} from transaction {}",
                        base_token_address, signature
                    );
                }
                Err(e) => {
                    metrics::increment_cache_write_failures();
                    error!(
                        "❌ [Cache] Failed to store pair data for transaction {}: {}",
                        signature, e
                    );
                }
            }
        }

        metrics::increment_pairs_cached(stored as u64);
        info!("💾 [Cache] Stored {} token pairs from transaction {}", stored, signature);
        stored
    }

    /// Reads back the record cached for `base_token_address`.
    pub async fn get(&self, base_token_address: &str) -> Result<Option<Value>, CacheError> {
        let Some(backend) = &self.backend else {
            return Ok(None);
        };
        match backend.get(&self.key_for(base_token_address)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::parse_pairs_response;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const BASE_A: &str = "So11111111111111111111111111111111111111112";
    const BASE_B: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

    fn pairs(bases: &[&str]) -> Vec<MarketPairRecord> {
        let raw: Vec<Value> = bases
            .iter()
            .map(|b| json!({ "baseToken": { "address": b, "symbol": "X" }, "priceNative": "1.5" }))
            .collect();
        parse_pairs_response(&json!({ "pairs": raw })).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_readable_until_ttl_elapses() {
        let cache = TokenCache::new(Some(Arc::new(InMemoryTtlCache::new())));
        let records = pairs(&[BASE_A]);
        assert_eq!(cache.store("sigA", &records).await, 1);

        let mut expected = records[0].fields().clone();
        expected.insert("transaction_signature".to_string(), json!("sigA"));

        let cached = cache.get(BASE_A).await.unwrap().unwrap();
        assert_eq!(cached, Value::Object(expected.clone()));

        tokio::time::advance(DEFAULT_TTL - Duration::from_secs(1)).await;
        assert_eq!(cache.get(BASE_A).await.unwrap(), Some(Value::Object(expected)));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get(BASE_A).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_later_observation_overwrites() {
        let cache = TokenCache::new(Some(Arc::new(InMemoryTtlCache::new())));
        cache.store("sigA", &pairs(&[BASE_A])).await;
        cache.store("sigB", &pairs(&[BASE_A])).await;

        let cached = cache.get(BASE_A).await.unwrap().unwrap();
        assert_eq!(cached["transaction_signature"], "sigB");
    }

    #[tokio::test]
    async fn test_unavailable_or_empty_is_noop() {
        let cache = TokenCache::new(None);
        assert!(!cache.is_available());
        assert_eq!(cache.store("sigA", &pairs(&[BASE_A])).await, 0);

        let backend = Arc::new(InMemoryTtlCache::new());
        let cache = TokenCache::new(Some(backend.clone()));
        assert_eq!(cache.store("sigA", &[]).await, 0);
        assert!(backend.is_empty());
    }

    /// Fails the first write, accepts the rest.
    struct FlakyBackend {
        inner: InMemoryTtlCache,
        writes: AtomicUsize,
    }

    #[async_trait]
    impl CacheBackend for FlakyBackend {
        async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
            if self.writes.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(CacheError::Serialize(
                    serde_json::from_str::<Value>("{").unwrap_err(),
                ));
            }
            self.inner.set_ex(key, value, ttl).await
        }

        async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
            self.inner.get(key).await
        }
    }

    #[tokio::test]
    async fn test_partial_failure_continues() {
        let backend = Arc::new(FlakyBackend {
            inner: InMemoryTtlCache::new(),
            writes: AtomicUsize::new(0),
        });
        let cache = TokenCache::new(Some(backend.clone()));

        assert_eq!(cache.store("sigA", &pairs(&[BASE_A, BASE_B])).await, 1);
        assert!(cache.get(BASE_A).await.unwrap().is_none());
        assert!(cache.get(BASE_B).await.unwrap().is_some());
    }

    #[test]
    fn test_key_format() {
        let cache = TokenCache::new(None);
        assert_eq!(cache.key_for(BASE_A), format!("token:{}", BASE_A));
    }

    /// Minimal RESP responder: `PING` gets `ping_reply`, every other command `+OK`.
    #[cfg(feature = "redis")]
    async fn spawn_resp_server(ping_reply: &'static str) -> String {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (tcp, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let (read, mut write) = tcp.into_split();
                    let mut lines = BufReader::new(read).lines();
                    while let Ok(Some(header)) = lines.next_line().await {
                        let Some(argc) = header.strip_prefix('*').and_then(|n| n.parse::<usize>().ok()) else {
                            continue;
                        };
                        let mut args = Vec::with_capacity(argc);
                        for _ in 0..argc {
                            let _len = lines.next_line().await.unwrap();
                            args.push(lines.next_line().await.unwrap().unwrap_or_default());
                        }
                        let reply = match args.first().map(|a| a.to_ascii_uppercase()) {
                            Some(cmd) if cmd == "PING" => ping_reply,
                            _ => "+OK\r\n",
                        };
                        if write.write_all(reply.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        format!("redis://{}", addr)
    }

    #[tokio::test]
    #[cfg(feature = "redis")]
    async fn test_connect_checks_server_health() {
        let healthy = spawn_resp_server("+PONG\r\n").await;
        let backend = RedisBackend::connect(&healthy).await.unwrap();
        backend.health_check().await.unwrap();

        let broken = spawn_resp_server("-ERR loading dataset\r\n").await;
        assert!(RedisBackend::connect(&broken).await.is_err());
    }

    #[tokio::test]
    #[cfg(feature = "redis")]
    #[ignore] // Requires Redis running
    async fn test_redis_round_trip() {
        let backend = RedisBackend::connect("redis://localhost:6379").await.unwrap();
        let cache = TokenCache::new(Some(Arc::new(backend)));
        assert_eq!(cache.store("sigA", &pairs(&[BASE_A])).await, 1);
        assert!(cache.get(BASE_A).await.unwrap().is_some());
    }
}
