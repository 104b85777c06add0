//! # Event Pipeline
//!
//! Per-notification enrichment: resolve the transaction, extract candidate token
//! addresses, fetch market data for the new ones, and cache what comes back.
//!
//! Each stage either feeds the next or ends the event with a [`SkipReason`]; no stage
//! failure escapes to the caller.

use async_trait::async_trait;
use log::{debug, error, info};
use std::sync::Arc;

use crate::address::extract_token_addresses;
use crate::cache::TokenCache;
use crate::market_data::MarketDataFetcher;
use crate::notification::{LogNotification, TransactionStatus};
use crate::supervisor::NotificationHandler;
use crate::transaction_resolver::TransactionSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Failed transaction and `skip_failed_transactions` is set.
    FailedTransaction,
    /// The transaction lookup errored.
    ResolutionFailed,
    /// The node has no record of the transaction.
    TransactionNotFound,
    NoAddresses,
    /// Every address was already tracked, or the market call matched nothing.
    NoNewPairs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Cached {
        signature: String,
        addresses: usize,
        pairs_found: usize,
        pairs_stored: usize,
    },
    Skipped(SkipReason),
}

impl EventOutcome {
    /// True when the event was dropped because a dependency errored.
    pub fn is_error(&self) -> bool {
        matches!(self, EventOutcome::Skipped(SkipReason::ResolutionFailed))
    }
}

pub struct Pipeline {
    resolver: Arc<dyn TransactionSource>,
    fetcher: MarketDataFetcher,
    cache: TokenCache,
    skip_failed_transactions: bool,
}

impl Pipeline {
    pub fn new(resolver: Arc<dyn TransactionSource>, fetcher: MarketDataFetcher, cache: TokenCache) -> Self {
        Self {
            resolver,
            fetcher,
            cache,
            skip_failed_transactions: false,
        }
    }

    pub fn with_skip_failed_transactions(mut self, skip: bool) -> Self {
        self.skip_failed_transactions = skip;
        self
    }

    pub fn cache(&self) -> &TokenCache {
        &self.cache
    }

    pub async fn process(&self, notification: &LogNotification) -> EventOutcome {
        let summary = notification.summary();
        match serde_json::to_string(&summary) {
            Ok(json) => info!("[Pipeline] Transaction summary: {}", json),
            Err(_) => info!("[Pipeline] Transaction summary: {:?}", summary),
        }

        if summary.status == TransactionStatus::Failed && self.skip_failed_transactions {
            debug!("[Pipeline] Skipping failed transaction {}", notification.signature);
            return EventOutcome::Skipped(SkipReason::FailedTransaction);
        }

        let transaction = match self.resolver.try_resolve(&notification.signature).await {
            Ok(Some(tx)) => tx,
            Ok(None) => {
                info!(
                    "[Pipeline] No transaction details found for {}",
                    notification.signature
                );
                return EventOutcome::Skipped(SkipReason::TransactionNotFound);
            }
            Err(e) => {
                error!(
                    "❌ [Pipeline] Error fetching transaction details for {}: {}",
                    notification.signature, e
                );
                return EventOutcome::Skipped(SkipReason::ResolutionFailed);
            }
        };

        let addresses = extract_token_addresses(Some(&transaction));
        if addresses.is_empty() {
            info!(
                "[Pipeline] No token addresses found in transaction {}",
                notification.signature
            );
            return EventOutcome::Skipped(SkipReason::NoAddresses);
        }

        let pairs = self.fetcher.fetch_new_pairs(&addresses).await;
        if pairs.is_empty() {
            return EventOutcome::Skipped(SkipReason::NoNewPairs);
        }

        let pairs_stored = self.cache.store(&notification.signature, &pairs).await;
        EventOutcome::Cached {
            signature: notification.signature.clone(),
            addresses: addresses.len(),
            pairs_found: pairs.len(),
            pairs_stored,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("event {signature} dropped: {reason:?}")]
pub struct PipelineError {
    pub signature: String,
    pub reason: SkipReason,
}

#[async_trait]
impl NotificationHandler for Pipeline {
    async fn on_notification(&self, notification: LogNotification) -> anyhow::Result<()> {
        let outcome = self.process(&notification).await;
        debug!("[Pipeline] {} -> {:?}", notification.signature, outcome);
        let failed = outcome.is_error();
        match outcome {
            EventOutcome::Skipped(reason) if failed => Err(PipelineError {
                signature: notification.signature,
                reason,
            }
            .into()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::TokenAddress;
    use crate::cache::InMemoryTtlCache;
    use crate::market_data::{MarketDataError, PairSource};
    use crate::tracked_addresses::TrackedAddressStore;
    use crate::transaction_resolver::ResolveError;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TOKEN: &str = "So11111111111111111111111111111111111111112";

    struct FixedResolver(Result<Option<Value>, ()>);

    #[async_trait]
    impl TransactionSource for FixedResolver {
        async fn try_resolve(&self, _signature: &str) -> Result<Option<Value>, ResolveError> {
            self.0.clone().map_err(|_| ResolveError::MalformedResponse)
        }
    }

    #[derive(Default)]
    struct CountingSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PairSource for CountingSource {
        async fn fetch_pairs(&self, addresses: &[TokenAddress]) -> Result<Value, MarketDataError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let pairs: Vec<Value> = addresses
                .iter()
                .map(|a| json!({ "baseToken": { "address": a.as_str() }, "priceUsd": "1" }))
                .collect();
            Ok(json!({ "pairs": pairs }))
        }
    }

    fn notification(err: Option<Value>) -> LogNotification {
        LogNotification {
            signature: "sigA".to_string(),
            slot: 1,
            logs: vec!["Program log: ray_log".to_string()],
            err,
        }
    }

    fn pipeline(resolver: FixedResolver, source: Arc<CountingSource>) -> Pipeline {
        let store = Arc::new(TrackedAddressStore::in_memory());
        Pipeline::new(
            Arc::new(resolver),
            MarketDataFetcher::new(source, store),
            TokenCache::new(Some(Arc::new(InMemoryTtlCache::new()))),
        )
    }

    fn transaction() -> Value {
        json!({ "transaction": { "message": { "accountKeys": [TOKEN] } } })
    }

    #[tokio::test]
    async fn test_failed_transaction_skipped_when_configured() {
        let source = Arc::new(CountingSource::default());
        let pipeline = pipeline(FixedResolver(Ok(Some(transaction()))), source.clone())
            .with_skip_failed_transactions(true);

        let outcome = pipeline.process(&notification(Some(json!({ "InstructionError": [0, "Custom"] })))).await;
        assert_eq!(outcome, EventOutcome::Skipped(SkipReason::FailedTransaction));
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_transaction_enriched_by_default() {
        let source = Arc::new(CountingSource::default());
        let pipeline = pipeline(FixedResolver(Ok(Some(transaction()))), source.clone());

        let outcome = pipeline.process(&notification(Some(json!("err")))).await;
        assert!(matches!(outcome, EventOutcome::Cached { pairs_stored: 1, .. }));
    }

    #[tokio::test]
    async fn test_unresolved_transaction_is_dropped() {
        let source = Arc::new(CountingSource::default());

        let missing = pipeline(FixedResolver(Ok(None)), source.clone());
        assert_eq!(
            missing.process(&notification(None)).await,
            EventOutcome::Skipped(SkipReason::TransactionNotFound)
        );

        let failing = pipeline(FixedResolver(Err(())), source.clone());
        let outcome = failing.process(&notification(None)).await;
        assert_eq!(outcome, EventOutcome::Skipped(SkipReason::ResolutionFailed));
        assert!(outcome.is_error());
        assert!(failing.on_notification(notification(None)).await.is_err());

        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_addresses() {
        let source = Arc::new(CountingSource::default());
        let pipeline = pipeline(FixedResolver(Ok(Some(json!({ "meta": {} })))), source.clone());
        assert_eq!(
            pipeline.process(&notification(None)).await,
            EventOutcome::Skipped(SkipReason::NoAddresses)
        );
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_second_sighting_is_not_refetched() {
        let source = Arc::new(CountingSource::default());
        let pipeline = pipeline(FixedResolver(Ok(Some(transaction()))), source.clone());

        assert!(matches!(
            pipeline.process(&notification(None)).await,
            EventOutcome::Cached { .. }
        ));
        assert_eq!(
            pipeline.process(&notification(None)).await,
            EventOutcome::Skipped(SkipReason::NoNewPairs)
        );
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(pipeline.on_notification(notification(None)).await.is_ok());
    }
}
