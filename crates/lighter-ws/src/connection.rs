//! WebSocket connection manager.
//!
//! State machine per stream:
//! `Disconnected → Connecting → Connected (→ Authenticating → Connected)`.
//! Any transport error or close returns to `Disconnected`, followed by a
//! backoff sleep that is raced against shutdown.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use lighter_auth::Signer;
use lighter_telemetry::Metrics;
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::{self, Backoff};
use crate::budget::SubscriptionBudget;
use crate::error::{WsError, WsResult};
use crate::heartbeat::{self, HeartbeatManager};
use crate::message::{ChannelMessage, Subscription, WsMessage, WsRequest, PONG_FRAME};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Source of auth tokens for private streams.
pub trait TokenProvider: Send + Sync {
    /// Mint a token for the next connection attempt.
    fn fresh_token(&self) -> WsResult<String>;
}

impl TokenProvider for Signer {
    fn fresh_token(&self) -> WsResult<String> {
        self.create_auth_token(self.token_cache().lifetime())
            .map(|t| t.token)
            .map_err(|e| WsError::Auth(e.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: String,
    /// Label used in logs and metrics ("public", "private").
    pub stream: String,
    pub backoff_floor: Duration,
    pub backoff_ceiling: Duration,
    /// Uptime after which a connection counts as stable.
    pub stability_threshold: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    /// Consecutive failed attempts before giving up (0 = infinite).
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            stream: "public".to_string(),
            backoff_floor: backoff::DEFAULT_FLOOR,
            backoff_ceiling: backoff::DEFAULT_CEILING,
            stability_threshold: backoff::DEFAULT_STABILITY_THRESHOLD,
            heartbeat_interval: heartbeat::DEFAULT_INTERVAL,
            heartbeat_timeout: heartbeat::DEFAULT_TIMEOUT,
            max_reconnect_attempts: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Authenticating => "authenticating",
        }
    }

    fn is_open(&self) -> bool {
        matches!(self, Self::Connected | Self::Authenticating)
    }
}

/// What the manager publishes to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Subscriptions are (re)established. `reconnect` is false only for
    /// the first session.
    Connected { reconnect: bool },
    Message(ChannelMessage),
    /// The session ended; data may have been missed until the next
    /// `Connected`.
    Disconnected { reason: String },
}

pub struct ConnectionManager {
    config: ConnectionConfig,
    state: Arc<RwLock<ConnectionState>>,
    budget: Arc<SubscriptionBudget>,
    /// Desired subscriptions, restored in order after each reconnect.
    subscriptions: RwLock<Vec<Subscription>>,
    token_provider: Option<Arc<dyn TokenProvider>>,
    session_token: RwLock<Option<String>>,
    heartbeat: HeartbeatManager,
    backoff: Mutex<Backoff>,
    event_tx: mpsc::Sender<StreamEvent>,
    outbound_tx: mpsc::Sender<String>,
    outbound_rx: TokioMutex<mpsc::Receiver<String>>,
    reconnect_count: AtomicU32,
    sessions: AtomicU64,
    shutdown_token: CancellationToken,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        budget: Arc<SubscriptionBudget>,
        event_tx: mpsc::Sender<StreamEvent>,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(256);
        Self {
            heartbeat: HeartbeatManager::new(config.heartbeat_interval, config.heartbeat_timeout),
            backoff: Mutex::new(Backoff::new(
                config.backoff_floor,
                config.backoff_ceiling,
                config.stability_threshold,
            )),
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            budget,
            subscriptions: RwLock::new(Vec::new()),
            token_provider: None,
            session_token: RwLock::new(None),
            event_tx,
            outbound_tx,
            outbound_rx: TokioMutex::new(outbound_rx),
            reconnect_count: AtomicU32::new(0),
            sessions: AtomicU64::new(0),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Attach a token source; required before subscribing to private
    /// channels.
    #[must_use]
    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions.read().clone()
    }

    /// Consecutive failed attempts in the current outage.
    pub fn reconnect_count(&self) -> u32 {
        self.reconnect_count.load(Ordering::Relaxed)
    }

    /// Delay the next reconnect would wait.
    pub fn next_backoff(&self) -> Duration {
        self.backoff.lock().current()
    }

    pub fn budget(&self) -> &Arc<SubscriptionBudget> {
        &self.budget
    }

    /// Cooperative shutdown: the run loop exits at its next await point,
    /// at the latest after the current backoff sleep.
    pub fn shutdown(&self) {
        info!(stream = %self.config.stream, "ConnectionManager shutdown requested");
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
        Metrics::ws_state_set(&self.config.stream, state.as_str());
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Add a subscription. Budget is checked first; a rejected request
    /// never reaches the network. Re-subscribing is a no-op.
    pub async fn subscribe(&self, sub: Subscription) -> WsResult<()> {
        if sub.is_private() && self.token_provider.is_none() {
            return Err(WsError::Auth(format!(
                "private channel {sub} needs a token provider"
            )));
        }
        {
            let mut subs = self.subscriptions.write();
            if subs.contains(&sub) {
                return Ok(());
            }
            self.budget.acquire_subscription(sub.account())?;
            subs.push(sub);
        }
        info!(stream = %self.config.stream, subscription = %sub, "Subscription added");

        if self.state().is_open() {
            let token = self.session_token.read().clone();
            let frame = sub.request("subscribe", token.as_deref()).to_text()?;
            self.queue(frame).await;
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, sub: Subscription) -> WsResult<()> {
        let removed = {
            let mut subs = self.subscriptions.write();
            let before = subs.len();
            subs.retain(|s| *s != sub);
            subs.len() != before
        };
        if !removed {
            return Ok(());
        }
        self.budget.release_subscription(sub.account());
        info!(stream = %self.config.stream, subscription = %sub, "Subscription removed");

        if self.state().is_open() {
            let frame = sub.request("unsubscribe", None).to_text()?;
            self.queue(frame).await;
        }
        Ok(())
    }

    async fn queue(&self, frame: String) {
        if self.outbound_tx.send(frame).await.is_err() {
            warn!(stream = %self.config.stream, "Outbound queue closed");
        }
    }

    fn has_private(&self) -> bool {
        self.subscriptions.read().iter().any(Subscription::is_private)
    }

    // ========================================================================
    // Run loop
    // ========================================================================

    /// Connect and keep the stream alive until shutdown.
    pub async fn run(&self) -> WsResult<()> {
        let mut attempt = 0u32;

        loop {
            if self.is_shutdown() {
                info!(stream = %self.config.stream, "Shutdown requested, exiting connect loop");
                self.set_state(ConnectionState::Disconnected);
                return Ok(());
            }

            self.set_state(ConnectionState::Connecting);
            let mut uptime = None;
            let result = self.connect_once(&mut uptime).await;

            self.set_state(ConnectionState::Disconnected);
            Metrics::ws_disconnected(&self.config.stream);

            let reason = match &result {
                Ok(()) => "closed".to_string(),
                Err(e) => e.to_string(),
            };
            match result {
                Ok(()) => info!(stream = %self.config.stream, "WebSocket session ended"),
                Err(WsError::SubscriptionLimitExceeded { kind, limit }) => {
                    error!(stream = %self.config.stream, %kind, limit, "Cannot open session");
                    return Err(WsError::SubscriptionLimitExceeded { kind, limit });
                }
                Err(e) => warn!(stream = %self.config.stream, error = %e, "WebSocket session failed"),
            }

            if let Some(uptime) = uptime {
                attempt = 0;
                if self.backoff.lock().on_session_end(uptime) {
                    debug!(uptime_ms = uptime.as_millis() as u64, "Connection was stable, backoff reset");
                }
                if self.event_tx.send(StreamEvent::Disconnected { reason }).await.is_err() {
                    warn!("Stream event receiver dropped");
                }
            }

            if self.is_shutdown() {
                info!(stream = %self.config.stream, "Shutdown requested after disconnect, not reconnecting");
                return Ok(());
            }

            attempt += 1;
            self.reconnect_count.store(attempt, Ordering::Relaxed);
            if self.config.max_reconnect_attempts > 0 && attempt >= self.config.max_reconnect_attempts {
                error!(attempt, "Max reconnection attempts reached");
                return Err(WsError::ConnectionFailed(
                    "Max reconnection attempts reached".to_string(),
                ));
            }

            let delay = self.backoff.lock().next_delay();
            Metrics::ws_reconnect(&self.config.stream);
            warn!(
                stream = %self.config.stream,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting"
            );

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.shutdown_token.cancelled() => {
                    info!(stream = %self.config.stream, "Shutdown requested during backoff, exiting");
                    return Ok(());
                }
            }
        }
    }

    /// One session: token, budget, handshake, restore, message loop.
    async fn connect_once(&self, uptime: &mut Option<Duration>) -> WsResult<()> {
        let token = match (&self.token_provider, self.has_private()) {
            (Some(provider), true) => Some(provider.fresh_token()?),
            _ => None,
        };
        *self.session_token.write() = token.clone();

        self.budget.acquire_session()?;
        let result = self.session(token, uptime).await;
        self.budget.release_session();
        result
    }

    async fn session(&self, token: Option<String>, uptime: &mut Option<Duration>) -> WsResult<()> {
        info!(stream = %self.config.stream, url = %self.config.url, "Connecting to WebSocket");

        let mut request = self.config.url.as_str().into_client_request()?;
        if let Some(token) = &token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| WsError::Auth(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws_stream, _response) = connect_async_tls_with_config(request, None, true, None).await?;
        let started = Instant::now();
        let (mut write, mut read) = ws_stream.split();

        self.set_state(ConnectionState::Connected);
        Metrics::ws_connected(&self.config.stream);
        info!(stream = %self.config.stream, "WebSocket connected");

        self.heartbeat.reset();
        let result = self
            .serve(&mut write, &mut read, token.as_deref())
            .await;
        *uptime = Some(started.elapsed());
        result
    }

    async fn serve(&self, write: &mut WsSink, read: &mut WsSource, token: Option<&str>) -> WsResult<()> {
        self.discard_stale_outbound().await;
        self.restore_subscriptions(write, token).await?;

        let reconnect = self.sessions.fetch_add(1, Ordering::Relaxed) > 0;
        if self.event_tx.send(StreamEvent::Connected { reconnect }).await.is_err() {
            warn!("Stream event receiver dropped");
        }

        let mut check = tokio::time::interval(self.heartbeat.check_interval());
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        check.tick().await;

        let mut outbound = self.outbound_rx.lock().await;

        loop {
            tokio::select! {
                () = self.shutdown_token.cancelled() => {
                    info!(stream = %self.config.stream, "Shutdown signal received in message loop");
                    if let Err(e) = write.send(Message::Close(None)).await {
                        warn!(?e, "Failed to send Close frame during shutdown");
                    }
                    return Ok(());
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_text(&text, write).await?;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            self.heartbeat.record_message();
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            self.heartbeat.record_pong();
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|f| (u16::from(f.code), f.reason.to_string()))
                                .unwrap_or((1000, "Normal close".to_string()));
                            warn!(code, %reason, "WebSocket closed by server");
                            return Err(WsError::ConnectionClosed { code, reason });
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            warn!(stream = %self.config.stream, "WebSocket stream ended");
                            return Ok(());
                        }
                        Some(Ok(_)) => {}
                    }
                }

                frame = outbound.recv() => {
                    if let Some(frame) = frame {
                        write.send(Message::Text(frame)).await?;
                    }
                }

                _ = check.tick() => {
                    if self.heartbeat.is_timed_out() {
                        error!(stream = %self.config.stream, "Heartbeat timeout");
                        return Err(WsError::HeartbeatTimeout);
                    }
                    if self.heartbeat.should_send_ping() {
                        write.send(Message::Text(WsRequest::ping().to_text()?)).await?;
                        self.heartbeat.record_ping();
                        debug!("Sent heartbeat ping");
                    }
                }
            }
        }
    }

    /// Frames queued for a previous session; the restore below resends
    /// the full subscription set.
    async fn discard_stale_outbound(&self) {
        let mut rx = self.outbound_rx.lock().await;
        let mut dropped = 0usize;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, "Discarded outbound frames from previous session");
        }
    }

    async fn restore_subscriptions(&self, write: &mut WsSink, token: Option<&str>) -> WsResult<()> {
        let subs = self.subscriptions();
        let (private, public): (Vec<_>, Vec<_>) = subs.into_iter().partition(Subscription::is_private);

        for sub in &public {
            write
                .send(Message::Text(sub.request("subscribe", None).to_text()?))
                .await?;
        }

        if !private.is_empty() {
            self.set_state(ConnectionState::Authenticating);
            for sub in &private {
                write
                    .send(Message::Text(sub.request("subscribe", token).to_text()?))
                    .await?;
            }
            self.set_state(ConnectionState::Connected);
        }

        info!(
            stream = %self.config.stream,
            public = public.len(),
            private = private.len(),
            "Subscriptions restored"
        );
        Ok(())
    }

    async fn handle_text(&self, text: &str, write: &mut WsSink) -> WsResult<()> {
        self.heartbeat.record_message();

        let msg: WsMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "Unparseable WebSocket frame, skipped");
                return Ok(());
            }
        };

        match msg {
            WsMessage::Control(control) => {
                if control.is_ping() {
                    write.send(Message::Text(PONG_FRAME.to_string())).await?;
                } else if control.is_pong() {
                    self.heartbeat.record_pong();
                } else if let Some(message) = control.error_message() {
                    warn!(stream = %self.config.stream, %message, "Error frame from server");
                } else {
                    debug!(kind = ?control.kind, "Control frame");
                }
            }
            WsMessage::Channel(channel) if channel.is_ack() => {
                debug!(channel = %channel.channel, "Subscription acknowledged");
            }
            WsMessage::Channel(channel) => {
                if self.event_tx.send(StreamEvent::Message(channel)).await.is_err() {
                    warn!("Stream event receiver dropped");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{BudgetKind, BudgetLimits};
    use lighter_core::MarketId;

    struct StaticToken;

    impl TokenProvider for StaticToken {
        fn fresh_token(&self) -> WsResult<String> {
            Ok("token".to_string())
        }
    }

    fn manager(budget: SubscriptionBudget) -> ConnectionManager {
        let (tx, _rx) = mpsc::channel(16);
        ConnectionManager::new(ConnectionConfig::default(), Arc::new(budget), tx)
    }

    #[test]
    fn test_default_config() {
        let config = ConnectionConfig::default();
        assert_eq!(config.backoff_floor, Duration::from_secs(1));
        assert_eq!(config.backoff_ceiling, Duration::from_secs(60));
        assert_eq!(config.max_reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn test_subscribe_while_disconnected_is_recorded() {
        let m = manager(SubscriptionBudget::default());
        m.subscribe(Subscription::order_book(MarketId(1))).await.unwrap();
        m.subscribe(Subscription::order_book(MarketId(1))).await.unwrap();

        assert_eq!(m.subscriptions().len(), 1);
        assert_eq!(m.budget().usage().subscriptions, 1);
    }

    #[tokio::test]
    async fn test_subscribe_over_budget_rejected_locally() {
        let m = manager(SubscriptionBudget::new(
            BudgetLimits {
                sessions: 1,
                subscriptions: 1,
                accounts: 1,
            },
            0.8,
        ));
        m.subscribe(Subscription::trades(MarketId(0))).await.unwrap();
        let err = m.subscribe(Subscription::trades(MarketId(1))).await.unwrap_err();
        assert!(matches!(
            err,
            WsError::SubscriptionLimitExceeded {
                kind: BudgetKind::Subscriptions,
                limit: 1
            }
        ));
        assert_eq!(m.subscriptions().len(), 1);
    }

    #[tokio::test]
    async fn test_private_requires_token_provider() {
        let m = manager(SubscriptionBudget::default());
        assert!(matches!(
            m.subscribe(Subscription::orders(5)).await,
            Err(WsError::Auth(_))
        ));

        let m = manager(SubscriptionBudget::default()).with_token_provider(Arc::new(StaticToken));
        m.subscribe(Subscription::orders(5)).await.unwrap();
        assert_eq!(m.budget().usage().accounts, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_releases_budget() {
        let m = manager(SubscriptionBudget::default()).with_token_provider(Arc::new(StaticToken));
        m.subscribe(Subscription::fills(5)).await.unwrap();
        m.unsubscribe(Subscription::fills(5)).await.unwrap();
        m.unsubscribe(Subscription::fills(5)).await.unwrap();

        assert!(m.subscriptions().is_empty());
        assert_eq!(m.budget().usage().subscriptions, 0);
        assert_eq!(m.budget().usage().accounts, 0);
    }

    #[tokio::test]
    async fn test_shutdown_during_backoff_is_bounded() {
        let (tx, _rx) = mpsc::channel(16);
        let config = ConnectionConfig {
            // Nothing listens on port 9 locally; every attempt fails fast
            url: "ws://127.0.0.1:9".to_string(),
            backoff_floor: Duration::from_secs(10),
            ..Default::default()
        };
        let m = Arc::new(ConnectionManager::new(
            config,
            Arc::new(SubscriptionBudget::default()),
            tx,
        ));

        let runner = m.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        m.shutdown();

        // Well under the 10s backoff
        let result = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(result.is_ok(), "run loop must exit within one backoff interval");
        assert_eq!(m.state(), ConnectionState::Disconnected);
    }
}
