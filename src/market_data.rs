//! # Market Data Enrichment
//!
//! Looks up DexScreener pairs for token addresses that have not been enriched yet.
//!
//! ## Flow
//!
//! 1. Drop candidates the [`TrackedAddressStore`] already knows about
//! 2. Submit at most `batch_size` (30) of the rest in one request; the remainder waits
//!    for a later event
//! 3. Keep pairs with a non-empty `baseToken.address` and mark those base tokens tracked
//!
//! Every failure path yields an empty list and a log line.

use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::address::TokenAddress;
use crate::metrics;
use crate::tracked_addresses::TrackedAddressStore;

pub const DEFAULT_BATCH_SIZE: usize = 30;

#[derive(Debug, thiserror::Error)]
pub enum MarketDataError {
    #[error("DexScreener API request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid or empty token data: {0}")]
    MalformedResponse(String),
}

/// One market pair exactly as the API returned it.
///
/// The raw JSON object is kept so the cached value matches the API payload.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketPairRecord {
    fields: Map<String, Value>,
}

impl MarketPairRecord {
    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// `baseToken.address`, if present and non-empty.
    pub fn base_token_address(&self) -> Option<&str> {
        self.fields
            .get("baseToken")
            .and_then(|t| t.get("address"))
            .and_then(Value::as_str)
            .filter(|a| !a.is_empty())
    }

    pub fn quote_token_address(&self) -> Option<&str> {
        self.fields
            .get("quoteToken")
            .and_then(|t| t.get("address"))
            .and_then(Value::as_str)
            .filter(|a| !a.is_empty())
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// The record with `transaction_signature` merged in, as written to the cache.
    pub fn tagged_with(&self, signature: &str) -> Map<String, Value> {
        let mut fields = self.fields.clone();
        fields.insert(
            "transaction_signature".to_string(),
            Value::String(signature.to_string()),
        );
        fields
    }
}

impl Serialize for MarketPairRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.fields.serialize(serializer)
    }
}

/// Batched pair lookup keyed by token address.
#[async_trait]
pub trait PairSource: Send + Sync {
    /// Returns the raw response body for `addresses` (at most one batch).
    async fn fetch_pairs(&self, addresses: &[TokenAddress]) -> Result<Value, MarketDataError>;
}

/// `GET {base_url}/{addr1},{addr2},...`
pub struct DexScreenerClient {
    client: reqwest::Client,
    base_url: String,
}

impl DexScreenerClient {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self, MarketDataError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn request_url(&self, addresses: &[TokenAddress]) -> String {
        let joined = addresses
            .iter()
            .map(TokenAddress::as_str)
            .collect::<Vec<_>>()
            .join(",");
        format!("{}/{}", self.base_url, joined)
    }
}

#[async_trait]
impl PairSource for DexScreenerClient {
    async fn fetch_pairs(&self, addresses: &[TokenAddress]) -> Result<Value, MarketDataError> {
        let url = self.request_url(addresses);
        let body = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body)
    }
}

/// Validates the response shape: an object with a list-valued `pairs` field.
pub fn parse_pairs_response(body: &Value) -> Result<Vec<MarketPairRecord>, MarketDataError> {
    let pairs = body
        .get("pairs")
        .and_then(Value::as_array)
        .ok_or_else(|| MarketDataError::MalformedResponse(truncate(&body.to_string(), 200)))?;

    Ok(pairs
        .iter()
        .filter_map(|p| p.as_object().cloned().map(MarketPairRecord::from_fields))
        .collect())
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

pub struct MarketDataFetcher {
    source: Arc<dyn PairSource>,
    store: Arc<TrackedAddressStore>,
    batch_size: usize,
}

impl MarketDataFetcher {
    pub fn new(source: Arc<dyn PairSource>, store: Arc<TrackedAddressStore>) -> Self {
        Self {
            source,
            store,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Fetches pairs for the new addresses among `candidates`. Never fails.
    pub async fn fetch_new_pairs(&self, candidates: &HashSet<TokenAddress>) -> Vec<MarketPairRecord> {
        let mut new_addresses: Vec<TokenAddress> = candidates
            .iter()
            .filter(|a| self.store.is_new(a))
            .cloned()
            .collect();

        if new_addresses.is_empty() {
            info!("[MarketData] No new token addresses to fetch");
            return Vec::new();
        }

        // Deterministic batch selection; the rest is deferred, not tracked.
        new_addresses.sort_unstable();
        let deferred = new_addresses.len().saturating_sub(self.batch_size);
        new_addresses.truncate(self.batch_size);

        info!(
            "[MarketData] Fetching token details for {} new addresses ({} deferred)",
            new_addresses.len(),
            deferred
        );

        let body = match self.source.fetch_pairs(&new_addresses).await {
            Ok(body) => body,
            Err(e) => {
                error!("❌ [MarketData] {}", e);
                metrics::increment_market_data_requests("http_error");
                return Vec::new();
            }
        };

        let pairs = match parse_pairs_response(&body) {
            Ok(pairs) => pairs,
            Err(e) => {
                warn!("⚠️ [MarketData] {}", e);
                metrics::increment_market_data_requests("malformed");
                return Vec::new();
            }
        };
        metrics::increment_market_data_requests("ok");

        let total = pairs.len();
        let valid_pairs: Vec<MarketPairRecord> = pairs
            .into_iter()
            .filter(|p| p.base_token_address().is_some())
            .collect();
        if valid_pairs.len() < total {
            debug!(
                "[MarketData] Dropped {} pairs without a base token address",
                total - valid_pairs.len()
            );
        }

        for pair in &valid_pairs {
            let Some(raw) = pair.base_token_address() else {
                continue;
            };
            match TokenAddress::parse(raw) {
                Some(base) => self.store.mark_tracked(&base),
                None => warn!("⚠️ [MarketData] Base token address {} is not a valid address, not tracking", raw),
            }
        }

        self.remember_unmatched(&new_addresses, &valid_pairs);

        valid_pairs
    }

    fn remember_unmatched(&self, submitted: &[TokenAddress], pairs: &[MarketPairRecord]) {
        let matched: HashSet<&str> = pairs
            .iter()
            .flat_map(|p| [p.base_token_address(), p.quote_token_address()])
            .flatten()
            .collect();

        for address in submitted {
            if !matched.contains(address.as_str()) {
                self.store.mark_not_found(address);
            }
        }
    }
}
