//! # Feed Connection Supervisor
//!
//! Owns the `logsSubscribe` WebSocket: connect, subscribe, receive, keep alive, and
//! reconnect with exponential backoff until the retry budget runs out.
//!
//! ## States
//!
//! ```text
//! Disconnected -> Connecting -> Subscribed -> Streaming -> Closing -> Disconnected
//!                                                  \-> Failed (budget exhausted, terminal)
//! ```
//!
//! - **Subscribed**: handshake done, subscribe request sent, keep-alive pinging
//! - **Streaming**: subscription acknowledged (or first notification seen); the
//!   attempt counter is reset
//! - **Closing**: the keep-alive task is aborted and awaited before anything else
//!
//! Notifications are handed to the [`NotificationHandler`] one at a time on the
//! receive loop; there is never more than one event in flight.

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::time::{sleep, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::backoff::{BudgetExhausted, ReconnectPolicy, RetryBudget};
use crate::metrics;
use crate::notification::{parse_feed_message, subscribe_request, FeedMessage, FeedMessageError, LogNotification};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SharedSink = Arc<Mutex<SplitSink<WsStream, Message>>>;

const SUBSCRIBE_REQUEST_ID: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribed,
    Streaming,
    Closing,
    Failed,
}

/// Receives every notification forwarded by the supervisor.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    /// An `Err` makes the receive loop wait `error_pause` instead of `message_pause`.
    async fn on_notification(&self, notification: LogNotification) -> anyhow::Result<()>;
}

/// Feed endpoint and pacing.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub ws_url: String,
    /// Sent as `Authorization: Bearer <key>` on the upgrade request.
    pub api_key: Option<String>,
    pub program_id: String,
    pub commitment: String,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub message_pause: Duration,
    pub error_pause: Duration,
}

impl FeedConfig {
    pub fn new(ws_url: impl Into<String>, program_id: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            api_key: None,
            program_id: program_id.into(),
            commitment: "processed".to_string(),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            message_pause: Duration::from_millis(500),
            error_pause: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("retry budget exhausted: {0:?}")]
    RetryBudgetExhausted(BudgetExhausted),
}

/// Why a single connection ended.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("invalid feed request: {0}")]
    InvalidRequest(String),
    #[error("websocket error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("subscription rejected: {0}")]
    SubscriptionRejected(String),
    #[error("keep-alive failed: {0}")]
    KeepAlive(KeepAliveFailure),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeepAliveFailure {
    PingFailed(String),
    PongTimeout(Duration),
    Stopped,
}

impl std::fmt::Display for KeepAliveFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeepAliveFailure::PingFailed(e) => write!(f, "ping failed: {}", e),
            KeepAliveFailure::PongTimeout(d) => write!(f, "peer silent for {:?}", d),
            KeepAliveFailure::Stopped => write!(f, "keep-alive task stopped"),
        }
    }
}

pub struct ConnectionSupervisor {
    config: FeedConfig,
    policy: ReconnectPolicy,
    handler: Arc<dyn NotificationHandler>,
    state: watch::Sender<ConnectionState>,
}

impl ConnectionSupervisor {
    pub fn new(config: FeedConfig, policy: ReconnectPolicy, handler: Arc<dyn NotificationHandler>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            policy,
            handler,
            state,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::debug!(from = ?prev, to = ?next, "[Supervisor] state transition");
        }
    }

    /// Runs until the retry budget is exhausted. This is the only way it returns.
    pub async fn run(&self) -> Result<(), SupervisorError> {
        let mut budget = RetryBudget::new(self.policy.clone());

        loop {
            if let Err(exhausted) = budget.check() {
                self.set_state(ConnectionState::Failed);
                match exhausted {
                    BudgetExhausted::Attempts { attempts } => error!(
                        "🛑 CRITICAL [Supervisor] Max reconnection attempts reached ({}). Stopping.",
                        attempts
                    ),
                    BudgetExhausted::WallClock { elapsed } => error!(
                        "🛑 CRITICAL [Supervisor] Total connection attempt time exceeded ({:?}). Stopping.",
                        elapsed
                    ),
                }
                return Err(SupervisorError::RetryBudgetExhausted(exhausted));
            }

            self.set_state(ConnectionState::Connecting);
            metrics::increment_reconnect_attempts();
            info!(
                "🔌 [Supervisor] Attempting WebSocket connection (Attempt {})",
                budget.attempt() + 1
            );

            match self.run_connection(&mut budget).await {
                Ok(()) => warn!("⚠️ [Supervisor] WebSocket connection closed"),
                Err(e) => error!(
                    "❌ [Supervisor] WebSocket connection error (Attempt {}): {}",
                    budget.attempt() + 1,
                    e
                ),
            }
            self.set_state(ConnectionState::Disconnected);

            let delay = budget.record_failure(&mut rand::thread_rng());
            info!("🔄 [Supervisor] Reconnection delay: {:.2} seconds", delay.as_secs_f64());
            sleep(delay).await;
        }
    }

    /// One connection lifetime. `Ok` means the peer closed the stream.
    async fn run_connection(&self, budget: &mut RetryBudget) -> Result<(), ConnectionError> {
        let request = self.build_request()?;
        let (ws, _response) = connect_async(request).await?;
        info!("✅ [Supervisor] WebSocket connection established successfully");

        let (sink, mut stream) = ws.split();
        let sink: SharedSink = Arc::new(Mutex::new(sink));

        let subscribe = subscribe_request(SUBSCRIBE_REQUEST_ID, &self.config.program_id, &self.config.commitment);
        sink.lock().await.send(Message::Text(subscribe.to_string())).await?;
        self.set_state(ConnectionState::Subscribed);
        info!(
            "📌 [Supervisor] Sent logs subscription request for program {}",
            self.config.program_id
        );

        // Pinging starts here so a peer that never acks is still detected.
        let last_seen = Arc::new(std::sync::Mutex::new(Instant::now()));
        let (failed_tx, mut failed_rx) = oneshot::channel();
        let keep_alive_task = tokio::spawn(keep_alive(
            sink.clone(),
            last_seen.clone(),
            self.config.ping_interval,
            self.config.pong_timeout,
            failed_tx,
        ));
        let mut streaming = false;

        let result = loop {
            let next = tokio::select! {
                msg = stream.next() => msg,
                failure = &mut failed_rx => {
                    break Err(ConnectionError::KeepAlive(failure.unwrap_or(KeepAliveFailure::Stopped)));
                }
            };

            // Any inbound frame proves the peer is alive; pongs may sit behind a backlog.
            if let Some(Ok(_)) = &next {
                *last_seen.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
            }

            let text = match next {
                None => break Ok(()),
                Some(Err(e)) => break Err(e.into()),
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(frame))) => {
                    info!("[Supervisor] Close frame received: {:?}", frame);
                    break Ok(());
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(_)) => {
                    warn!("⚠️ [Supervisor] Ignoring non-text frame");
                    metrics::increment_messages_dropped("non_text");
                    continue;
                }
            };
            debug!("[Supervisor] Raw WebSocket message: {}", text);

            let notification = match parse_feed_message(&text) {
                Ok(FeedMessage::SubscriptionAck { subscription, .. }) => {
                    info!("✅ [Supervisor] Logs subscription confirmed (id {})", subscription);
                    if !streaming {
                        self.enter_streaming(budget);
                        streaming = true;
                    }
                    continue;
                }
                Ok(FeedMessage::Notification(notification)) => notification,
                Err(FeedMessageError::SubscriptionRejected(reason)) => {
                    break Err(ConnectionError::SubscriptionRejected(reason));
                }
                Err(e) => {
                    warn!("⚠️ [Supervisor] Dropping feed message: {}", e);
                    metrics::increment_messages_dropped(e.reason());
                    continue;
                }
            };

            if !streaming {
                self.enter_streaming(budget);
                streaming = true;
            }

            metrics::increment_notifications_received();
            info!("[Supervisor] Processing transaction: {}", notification.signature);
            let pause = match self.handler.on_notification(notification).await {
                Ok(()) => self.config.message_pause,
                Err(e) => {
                    error!("❌ [Supervisor] WebSocket message processing error: {}", e);
                    self.config.error_pause
                }
            };
            if !pause.is_zero() {
                sleep(pause).await;
            }
            // Silence is measured only while the loop is waiting on the stream.
            *last_seen.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        };

        self.set_state(ConnectionState::Closing);
        keep_alive_task.abort();
        // Cancellation has landed once the handle resolves.
        let _ = keep_alive_task.await;

        result
    }

    fn enter_streaming(&self, budget: &mut RetryBudget) {
        self.set_state(ConnectionState::Streaming);
        budget.reset();
    }

    fn build_request(&self) -> Result<tungstenite::handshake::client::Request, ConnectionError> {
        let mut request = self
            .config
            .ws_url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectionError::InvalidRequest(e.to_string()))?;

        if let Some(key) = self.config.api_key.as_deref().filter(|k| !k.is_empty()) {
            let value = HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|e| ConnectionError::InvalidRequest(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        Ok(request)
    }
}

/// Sends a ping every `interval` until a send fails or the peer goes quiet for longer
/// than `interval + pong_timeout`.
async fn keep_alive(
    sink: SharedSink,
    last_seen: Arc<std::sync::Mutex<Instant>>,
    interval: Duration,
    pong_timeout: Duration,
    failed: oneshot::Sender<KeepAliveFailure>,
) {
    let interval = interval.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval(interval);

    let failure = loop {
        ticker.tick().await;

        let silent_for = last_seen.lock().unwrap_or_else(|e| e.into_inner()).elapsed();
        if silent_for > interval + pong_timeout {
            break KeepAliveFailure::PongTimeout(silent_for);
        }

        if let Err(e) = sink.lock().await.send(Message::Ping(Vec::new())).await {
            break KeepAliveFailure::PingFailed(e.to_string());
        }
        debug!("🏓 [Supervisor] Ping sent");
    };

    error!("❌ [Supervisor] WebSocket keep-alive error: {}", failure);
    let _ = failed.send(failure);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;

    #[async_trait]
    impl NotificationHandler for NoopHandler {
        async fn on_notification(&self, _notification: LogNotification) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn supervisor(config: FeedConfig) -> ConnectionSupervisor {
        ConnectionSupervisor::new(config, ReconnectPolicy::default(), Arc::new(NoopHandler))
    }

    #[test]
    fn test_request_carries_bearer_token() {
        let mut config = FeedConfig::new("wss://mainnet.helius-rpc.com", "675kPX9MHTjS2zt1qfr1NYHuzeLXfQM9H24wFSUt1Mp8");
        config.api_key = Some("secret".to_string());
        let request = supervisor(config).build_request().unwrap();
        assert_eq!(request.headers()[AUTHORIZATION], "Bearer secret");
    }

    #[test]
    fn test_request_without_key_has_no_auth_header() {
        let config = FeedConfig::new("ws://127.0.0.1:8900", "675kPX9MHTjS2zt1qfr1NYHuzeLXfQM9H24wFSUt1Mp8");
        let request = supervisor(config).build_request().unwrap();
        assert!(request.headers().get(AUTHORIZATION).is_none());
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        let config = FeedConfig::new("not a url", "675kPX9MHTjS2zt1qfr1NYHuzeLXfQM9H24wFSUt1Mp8");
        assert!(matches!(
            supervisor(config).build_request(),
            Err(ConnectionError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_initial_state_is_disconnected() {
        let s = supervisor(FeedConfig::new("ws://127.0.0.1:1", "x"));
        assert_eq!(s.state(), ConnectionState::Disconnected);
    }
}
