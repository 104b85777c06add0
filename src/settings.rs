use anyhow::{Context, Result};
use config::{Config, Environment, File};
use log::warn;
use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::address::is_valid_address;
use crate::backoff::ReconnectPolicy;
use crate::supervisor::FeedConfig;

pub const RAYDIUM_AMM_PROGRAM_ID: &str = "675kPX9MHTjS2zt1qfr1NYHuzeLXfQM9H24wFSUt1Mp8";
pub const DEFAULT_CONFIG_PATH: &str = "Config.toml";

#[derive(Debug, Deserialize, Clone)]
pub struct Feed {
    #[serde(default)]
    pub ws_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_program_id")]
    pub program_id: String,
    #[serde(default = "default_feed_commitment")]
    pub commitment: String,
}

fn default_program_id() -> String {
    RAYDIUM_AMM_PROGRAM_ID.to_string()
}
fn default_feed_commitment() -> String {
    "processed".to_string()
}

impl Default for Feed {
    fn default() -> Self {
        Self {
            ws_url: String::new(),
            api_key: None,
            program_id: default_program_id(),
            commitment: default_feed_commitment(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Rpc {
    /// Falls back to the Helius mainnet endpoint keyed by `feed.api_key`.
    #[serde(default)]
    pub http_url: Option<String>,
    #[serde(default = "default_rpc_commitment")]
    pub commitment: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_rpc_commitment() -> String {
    "confirmed".to_string()
}
fn default_timeout_secs() -> u64 {
    10
}

impl Default for Rpc {
    fn default() -> Self {
        Self {
            http_url: None,
            commitment: default_rpc_commitment(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MarketData {
    #[serde(default = "default_market_data_url")]
    pub base_url: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_market_data_url() -> String {
    "https://api.dexscreener.com/latest/dex/tokens".to_string()
}
fn default_batch_size() -> usize {
    crate::market_data::DEFAULT_BATCH_SIZE
}

impl Default for MarketData {
    fn default() -> Self {
        Self {
            base_url: default_market_data_url(),
            batch_size: default_batch_size(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Cache {
    /// `redis://` or `rediss://`. Unset means an in-process cache.
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_cache_ttl_secs() -> u64 {
    86_400 // 24h
}
fn default_key_prefix() -> String {
    crate::cache::DEFAULT_KEY_PREFIX.to_string()
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            redis_url: None,
            ttl_secs: default_cache_ttl_secs(),
            key_prefix: default_key_prefix(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Tracking {
    #[serde(default = "default_tracking_path")]
    pub path: String,
    #[serde(default = "default_true")]
    pub negative_cache_enabled: bool,
    #[serde(default = "default_not_found_ttl_secs")]
    pub not_found_ttl_secs: u64,
}

fn default_tracking_path() -> String {
    "tracked_addresses.bin".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_not_found_ttl_secs() -> u64 {
    3600
}

impl Default for Tracking {
    fn default() -> Self {
        Self {
            path: default_tracking_path(),
            negative_cache_enabled: default_true(),
            not_found_ttl_secs: default_not_found_ttl_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Reconnect {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_max_total_secs")]
    pub max_total_secs: u64,
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_max_attempts() -> u32 {
    10
}
fn default_max_total_secs() -> u64 {
    3600
}
fn default_jitter_ratio() -> f64 {
    0.1
}

impl Default for Reconnect {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            max_total_secs: default_max_total_secs(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

impl Reconnect {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_attempts: self.max_attempts,
            max_total: Duration::from_secs(self.max_total_secs),
            jitter_ratio: self.jitter_ratio,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Stream {
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_pong_timeout_secs")]
    pub pong_timeout_secs: u64,
    #[serde(default = "default_message_pause_ms")]
    pub message_pause_ms: u64,
    #[serde(default = "default_error_pause_ms")]
    pub error_pause_ms: u64,
}

fn default_ping_interval_secs() -> u64 {
    30
}
fn default_pong_timeout_secs() -> u64 {
    10
}
fn default_message_pause_ms() -> u64 {
    500
}
fn default_error_pause_ms() -> u64 {
    1000
}

impl Default for Stream {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval_secs(),
            pong_timeout_secs: default_pong_timeout_secs(),
            message_pause_ms: default_message_pause_ms(),
            error_pause_ms: default_error_pause_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Pipeline {
    #[serde(default = "default_false")]
    pub skip_failed_transactions: bool,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self {
            skip_failed_transactions: default_false(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Logging {
    /// Appended to instead of stderr when set.
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub feed: Feed,
    #[serde(default)]
    pub rpc: Rpc,
    #[serde(default)]
    pub market_data: MarketData,
    #[serde(default)]
    pub cache: Cache,
    #[serde(default)]
    pub tracking: Tracking,
    #[serde(default)]
    pub reconnect: Reconnect,
    #[serde(default)]
    pub stream: Stream,
    #[serde(default)]
    pub pipeline: Pipeline,
    #[serde(default)]
    pub logging: Logging,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("feed.ws_url is not set (HELIUS_WSS_ENDPOINT)")]
    MissingWsUrl,
    #[error("feed.ws_url is not a ws:// or wss:// URL: {0}")]
    InvalidWsUrl(String),
    #[error("feed.program_id is not set (RAYDIUM_AMM_PROGRAM_ID)")]
    MissingProgramId,
    #[error("feed.program_id is not a valid address: {0}")]
    InvalidProgramId(String),
    #[error("market_data.batch_size must be at least 1")]
    InvalidBatchSize,
}

impl Settings {
    /// Loads `Config.toml` (optional), `MONITOR__*` variables and the well-known
    /// unprefixed overrides, in that order.
    pub fn new() -> Result<Self> {
        Self::from_path(DEFAULT_CONFIG_PATH)
    }

    pub fn from_path(path: &str) -> Result<Self> {
        let s = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("MONITOR")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path))?;

        let mut settings: Self = s
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        settings.apply_env_overrides(|key| env::var(key).ok());
        Ok(settings)
    }

    /// Applies the unprefixed variables the deployment environment already uses.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(ws_url) = var("HELIUS_WSS_ENDPOINT") {
            self.feed.ws_url = ws_url;
        }
        if let Some(api_key) = var("HELIUS_API_KEY") {
            self.feed.api_key = Some(api_key);
        }
        if let Some(program_id) = var("RAYDIUM_AMM_PROGRAM_ID") {
            self.feed.program_id = program_id;
        }

        if let Some(redis_url) = var("REDIS_URL") {
            self.cache.redis_url = Some(redis_url);
        } else if let Some(host) = var("UPSTASH_ENDPOINT") {
            let port = var("UPSTASH_PORT").unwrap_or_else(|| "6379".to_string());
            let password = var("UPSTASH_PASSWORD").unwrap_or_default();
            match upstash_url(&host, &port, &password) {
                Some(url) => self.cache.redis_url = Some(url),
                None => warn!("⚠️ [Settings] Ignoring malformed UPSTASH_ENDPOINT {}:{}", host, port),
            }
        }
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let ws_url = self.feed.ws_url.trim();
        if ws_url.is_empty() {
            return Err(SettingsError::MissingWsUrl);
        }
        match url::Url::parse(ws_url) {
            Ok(u) if u.scheme() == "ws" || u.scheme() == "wss" => {}
            _ => return Err(SettingsError::InvalidWsUrl(ws_url.to_string())),
        }

        let program_id = self.feed.program_id.trim();
        if program_id.is_empty() {
            return Err(SettingsError::MissingProgramId);
        }
        if !is_valid_address(program_id) {
            return Err(SettingsError::InvalidProgramId(program_id.to_string()));
        }

        if self.market_data.batch_size == 0 {
            return Err(SettingsError::InvalidBatchSize);
        }
        Ok(())
    }

    pub fn rpc_url(&self) -> String {
        match &self.rpc.http_url {
            Some(url) if !url.trim().is_empty() => url.clone(),
            _ => format!(
                "https://mainnet.helius-rpc.com/?api-key={}",
                self.feed.api_key.as_deref().unwrap_or_default()
            ),
        }
    }

    pub fn feed_config(&self) -> FeedConfig {
        FeedConfig {
            ws_url: self.feed.ws_url.clone(),
            api_key: self.feed.api_key.clone(),
            program_id: self.feed.program_id.clone(),
            commitment: self.feed.commitment.clone(),
            ping_interval: Duration::from_secs(self.stream.ping_interval_secs),
            pong_timeout: Duration::from_secs(self.stream.pong_timeout_secs),
            message_pause: Duration::from_millis(self.stream.message_pause_ms),
            error_pause: Duration::from_millis(self.stream.error_pause_ms),
        }
    }

    pub fn not_found_ttl(&self) -> Option<Duration> {
        self.tracking
            .negative_cache_enabled
            .then(|| Duration::from_secs(self.tracking.not_found_ttl_secs))
    }
}

/// Upstash serves Redis over TLS only. The password is percent-encoded into the userinfo.
fn upstash_url(host: &str, port: &str, password: &str) -> Option<String> {
    let mut url = url::Url::parse(&format!("rediss://{}:{}", host, port)).ok()?;
    if !password.is_empty() {
        url.set_username("default").ok()?;
        url.set_password(Some(password)).ok()?;
    }
    Some(url.to_string())
}
