//! # Raydium Swap Monitor
//!
//! Real-time ingestion of Raydium AMM activity on Solana. The monitor subscribes to the
//! program's log notifications over WebSocket, resolves each transaction, extracts the
//! token addresses it touches, fetches market data for addresses it has not seen
//! before, and caches the enriched pairs with a 24h TTL.
//!
//! ## Architecture
//!
//! ### Feed Layer
//! A supervised `logsSubscribe` connection with keep-alive and exponential backoff
//! reconnects. Feed frames are classified into acknowledgements and notifications.
//!
//! ### Enrichment Layer
//! Transaction resolution over JSON-RPC, address extraction, and batched market data
//! lookups filtered through a durable set of already-tracked addresses.
//!
//! ### Cache Layer
//! Pairs keyed by base token address in Redis (or an in-process TTL map).
//!
//! Events are processed strictly one at a time in arrival order.

// Core Types
/// Address validation and extraction from resolved transactions
pub mod address;
/// Feed message classification and notification summaries
pub mod notification;

// Feed Layer
/// Reconnect delay schedule and retry budget
pub mod backoff;
/// Connection state machine, keep-alive and reconnect loop
pub mod supervisor;

// Enrichment Layer
/// `getTransaction` client
pub mod transaction_resolver;
/// Durable set of already-enriched addresses
pub mod tracked_addresses;
/// Market pair lookups
pub mod market_data;

// Cache Layer
/// TTL cache write path
pub mod cache;

/// Per-notification composition of the stages above
pub mod pipeline;

// Infrastructure
/// Configuration loading
pub mod settings;
/// Metrics facade (no-op without the `observability` feature)
pub mod metrics;

pub use address::{extract_token_addresses, is_valid_address, TokenAddress};
pub use cache::TokenCache;
pub use market_data::{MarketDataFetcher, MarketPairRecord};
pub use notification::LogNotification;
pub use pipeline::{EventOutcome, Pipeline, SkipReason};
pub use settings::Settings;
pub use supervisor::{ConnectionState, ConnectionSupervisor, NotificationHandler};
pub use tracked_addresses::TrackedAddressStore;
