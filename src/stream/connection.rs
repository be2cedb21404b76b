use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep_until, Instant};
use tracing::{info, warn};

use super::transport::{StreamTransport, TransportEvent, TransportFactory};
use super::{decode_frame, MarketEvent, StreamError};
use crate::api::{ExchangeClient, ExchangeError};

/// Connection lifecycle phases, observable through the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// Timing and identity parameters for one stream connection.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub url: String,
    pub symbol: String,
    pub interval: String,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub idle_threshold: Duration,
    /// How often the idle watchdog samples `last_message_time`.
    pub watchdog_interval: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_reconnect_attempts: u32,
    /// Number of historical candles fetched to warm indicator history.
    pub backfill_limit: u32,
}

enum Command {
    Subscribe(String),
    Unsubscribe(String),
    Close,
}

enum Attempt {
    Retry,
    Shutdown,
}

enum DriveEnd {
    /// Close command received or the event consumer is gone.
    Commanded,
    Lost(&'static str),
}

/// Cheap control handle for a running connection task.
#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::Sender<Command>,
    phase: watch::Receiver<ConnectionPhase>,
}

impl ConnectionHandle {
    /// Add a channel to the subscription set. Sent immediately when
    /// connected, otherwise replayed on the next successful connect.
    pub async fn subscribe(&self, channel: impl Into<String>) {
        let _ = self
            .commands
            .send(Command::Subscribe(channel.into()))
            .await;
    }

    pub async fn unsubscribe(&self, channel: impl Into<String>) {
        let _ = self
            .commands
            .send(Command::Unsubscribe(channel.into()))
            .await;
    }

    /// Deterministically stop the connection task: timers are cancelled,
    /// then the live transport is dropped.
    pub async fn close(&self) {
        let _ = self.commands.send(Command::Close).await;
    }

    pub fn phase(&self) -> ConnectionPhase {
        *self.phase.borrow()
    }
}

/// Owns one stream transport for a symbol session: heartbeat, idle
/// watchdog, reconnect-with-backoff and subscription replay. Decoded market
/// events are forwarded, in arrival order, into a bounded queue drained by
/// the session task.
pub struct ConnectionManager {
    config: StreamConfig,
    factory: Arc<dyn TransportFactory>,
    exchange: Arc<dyn ExchangeClient>,
    events: mpsc::Sender<MarketEvent>,
    commands: mpsc::Receiver<Command>,
    phase_tx: watch::Sender<ConnectionPhase>,
    attempt: u32,
    last_message_time: Instant,
    subscriptions: BTreeSet<String>,
    bootstrapped: bool,
    next_request_id: u64,
}

impl ConnectionManager {
    pub fn new(
        config: StreamConfig,
        factory: Arc<dyn TransportFactory>,
        exchange: Arc<dyn ExchangeClient>,
        events: mpsc::Sender<MarketEvent>,
    ) -> (Self, ConnectionHandle) {
        let (command_tx, command_rx) = mpsc::channel(16);
        let (phase_tx, phase_rx) = watch::channel(ConnectionPhase::Disconnected);

        let mut subscriptions = BTreeSet::new();
        subscriptions.insert(kline_channel(&config.symbol, &config.interval));

        let manager = Self {
            config,
            factory,
            exchange,
            events,
            commands: command_rx,
            phase_tx,
            attempt: 0,
            last_message_time: Instant::now(),
            subscriptions,
            bootstrapped: false,
            next_request_id: 0,
        };
        let handle = ConnectionHandle {
            commands: command_tx,
            phase: phase_rx,
        };
        (manager, handle)
    }

    /// Drive the connection until closed or the reconnect budget is spent.
    ///
    /// Exhausting `max_reconnect_attempts` is terminal and reported as an
    /// error; a commanded close returns `Ok`.
    pub async fn run(mut self) -> Result<(), StreamError> {
        loop {
            self.set_phase(ConnectionPhase::Connecting);
            match self.establish_and_drive().await {
                Attempt::Shutdown => {
                    self.set_phase(ConnectionPhase::Disconnected);
                    info!("stream session closed");
                    return Ok(());
                }
                Attempt::Retry => {
                    self.attempt += 1;
                    if self.attempt > self.config.max_reconnect_attempts {
                        self.set_phase(ConnectionPhase::Failed);
                        return Err(StreamError::ReconnectsExhausted {
                            attempts: self.config.max_reconnect_attempts,
                        });
                    }
                    self.set_phase(ConnectionPhase::Reconnecting);
                    let delay = backoff_delay(
                        self.config.base_delay,
                        self.config.max_delay,
                        self.attempt,
                    );
                    info!(
                        attempt = self.attempt,
                        delay_ms = delay.as_millis() as u64,
                        "reconnecting after backoff"
                    );
                    if let Attempt::Shutdown = self.backoff_wait(delay).await {
                        self.set_phase(ConnectionPhase::Disconnected);
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn establish_and_drive(&mut self) -> Attempt {
        let mut transport = match self.factory.connect(&self.config.url).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!("connect failed: {e}");
                return Attempt::Retry;
            }
        };

        // Warm indicator history before any live event is delivered.
        if !self.bootstrapped {
            match self.bootstrap().await {
                Ok(count) => {
                    self.bootstrapped = true;
                    info!(candles = count, "indicator history backfilled");
                }
                Err(e) => {
                    warn!("historical backfill failed: {e}");
                    transport.terminate().await;
                    if self.events.is_closed() {
                        return Attempt::Shutdown;
                    }
                    return Attempt::Retry;
                }
            }
        }

        // Replay the full subscription set as a single batched request.
        if !self.subscriptions.is_empty() {
            let channels: Vec<String> = self.subscriptions.iter().cloned().collect();
            let frame = self.control_frame("SUBSCRIBE", &channels);
            if let Err(e) = transport.send_text(frame).await {
                warn!("subscription replay failed: {e}");
                transport.terminate().await;
                return Attempt::Retry;
            }
        }

        self.set_phase(ConnectionPhase::Connected);
        self.attempt = 0;
        self.last_message_time = Instant::now();
        info!(url = %self.config.url, "stream connected");

        let outcome = self.drive(transport.as_mut()).await;
        transport.terminate().await;
        match outcome {
            DriveEnd::Commanded => Attempt::Shutdown,
            DriveEnd::Lost(reason) => {
                warn!("connection lost: {reason}");
                Attempt::Retry
            }
        }
    }

    /// Event loop for one live connection. Returns when the connection is
    /// lost (reconnect) or a close was commanded (shutdown).
    async fn drive(&mut self, transport: &mut dyn StreamTransport) -> DriveEnd {
        let mut ping_timer = interval_at(
            Instant::now() + self.config.ping_interval,
            self.config.ping_interval,
        );
        let mut watchdog = interval_at(
            Instant::now() + self.config.watchdog_interval,
            self.config.watchdog_interval,
        );
        let mut pong_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                event = transport.next_event() => {
                    match event {
                        Some(TransportEvent::Message(payload)) => {
                            self.last_message_time = Instant::now();
                            if let Some(event) = decode_frame(&payload) {
                                if self.events.send(event).await.is_err() {
                                    return DriveEnd::Commanded;
                                }
                            }
                        }
                        Some(TransportEvent::Ping(payload)) => {
                            self.last_message_time = Instant::now();
                            if transport.send_pong(payload).await.is_err() {
                                return DriveEnd::Lost("pong send failed");
                            }
                        }
                        Some(TransportEvent::Pong) => {
                            self.last_message_time = Instant::now();
                            pong_deadline = None;
                        }
                        Some(TransportEvent::Close { code, reason }) => {
                            warn!(?code, %reason, "peer closed the stream");
                            return DriveEnd::Lost("peer close");
                        }
                        Some(TransportEvent::Error(e)) => {
                            warn!("transport error: {e}");
                            return DriveEnd::Lost("transport error");
                        }
                        None => return DriveEnd::Lost("stream ended"),
                    }
                }
                _ = ping_timer.tick() => {
                    if transport.send_ping().await.is_err() {
                        return DriveEnd::Lost("ping send failed");
                    }
                    // An armed deadline means a pong is outstanding.
                    pong_deadline = Some(Instant::now() + self.config.pong_timeout);
                }
                _ = sleep_until(pong_deadline.unwrap_or_else(Instant::now)),
                        if pong_deadline.is_some() => {
                    warn!("pong not received in time, forcing reconnect");
                    return DriveEnd::Lost("pong timeout");
                }
                _ = watchdog.tick() => {
                    // Catches silent failures: transport nominally open but
                    // delivering nothing.
                    if self.last_message_time.elapsed() > self.config.idle_threshold {
                        warn!(
                            idle_secs = self.last_message_time.elapsed().as_secs(),
                            "idle threshold exceeded, forcing reconnect"
                        );
                        return DriveEnd::Lost("idle timeout");
                    }
                }
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Subscribe(channel)) => {
                            if self.subscriptions.insert(channel.clone()) {
                                let frame = self.control_frame(
                                    "SUBSCRIBE",
                                    std::slice::from_ref(&channel),
                                );
                                if transport.send_text(frame).await.is_err() {
                                    return DriveEnd::Lost("subscribe send failed");
                                }
                            }
                        }
                        Some(Command::Unsubscribe(channel)) => {
                            if self.subscriptions.remove(&channel) {
                                let frame = self.control_frame(
                                    "UNSUBSCRIBE",
                                    std::slice::from_ref(&channel),
                                );
                                if transport.send_text(frame).await.is_err() {
                                    return DriveEnd::Lost("unsubscribe send failed");
                                }
                            }
                        }
                        Some(Command::Close) | None => return DriveEnd::Commanded,
                    }
                }
            }
        }
    }

    /// Wait out the backoff delay while staying responsive to commands.
    async fn backoff_wait(&mut self, delay: Duration) -> Attempt {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return Attempt::Retry,
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Subscribe(channel)) => {
                            self.subscriptions.insert(channel);
                        }
                        Some(Command::Unsubscribe(channel)) => {
                            self.subscriptions.remove(&channel);
                        }
                        Some(Command::Close) | None => return Attempt::Shutdown,
                    }
                }
            }
        }
    }

    /// Fetch historical closed candles (the still-forming one is excluded)
    /// and deliver them ahead of any live event.
    async fn bootstrap(&mut self) -> Result<usize, ExchangeError> {
        let candles = self
            .exchange
            .historical_candles(
                &self.config.symbol,
                &self.config.interval,
                self.config.backfill_limit,
            )
            .await?;

        let mut delivered = 0;
        for candle in candles.into_iter().filter(|c| c.is_closed) {
            if self.events.send(MarketEvent::Candle(candle)).await.is_err() {
                break;
            }
            delivered += 1;
        }
        Ok(delivered)
    }

    fn control_frame(&mut self, method: &str, channels: &[String]) -> String {
        self.next_request_id += 1;
        serde_json::json!({
            "method": method,
            "params": channels,
            "id": self.next_request_id,
        })
        .to_string()
    }

    fn set_phase(&mut self, phase: ConnectionPhase) {
        let _ = self.phase_tx.send(phase);
    }
}

fn kline_channel(symbol: &str, interval: &str) -> String {
    format!("{}@kline_{}", symbol.to_lowercase(), interval)
}

/// Exponential backoff: `min(base * 2^(attempt-1), max)`, `attempt >= 1`.
pub(crate) fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    match base.checked_mul(1u32 << exponent) {
        Some(delay) => delay.min(max),
        None => max,
    }
}
