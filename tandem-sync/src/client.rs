//! Resilient WebSocket channel to the sync server.
//!
//! Provides:
//! - Connection lifecycle with automatic reconnection and exponential backoff
//! - Offline queue for messages sent while disconnected, flushed in order
//! - Periodic `ping` probes, round-trip latency reporting and a liveness
//!   deadline that drops connections the server stopped answering on
//!
//! All I/O happens on one driver task spawned by [`ResilientChannel::open`].
//! The handle talks to it over an unbounded command channel; the driver
//! reports back through an event channel and a `watch` of [`Connectivity`].
//! Until [`ResilientChannel::take_event_rx`] is called events are only
//! buffered up to `event_capacity`, never waited on.
//!
//! ```text
//! Disconnected ──► Connecting ──► Connected
//!       ▲              │              │ drop
//!       │   failure    ▼              ▼
//!       └──────── backoff sleep ◄─────┘
//!                      │ attempts exhausted
//!                      ▼
//!                   Failed
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::{unix_millis, ClientMessage, ProtocolError, ServerMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnection attempts exhausted. Terminal.
    Failed,
}

/// Connection state plus the most recent measurements.
#[derive(Debug, Clone, PartialEq)]
pub struct Connectivity {
    pub state: ConnectionState,
    /// Last measured ping round trip on the current connection.
    pub latency: Option<Duration>,
    /// Messages waiting in the offline queue.
    pub queued: usize,
}

impl Default for Connectivity {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            latency: None,
            queued: 0,
        }
    }
}

/// Events emitted by the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Connection established
    Connected,
    /// Connection lost; reconnection follows unless attempts run out
    Disconnected,
    /// Message from the server. An `init` must replace local state.
    Message(ServerMessage),
    /// A ping round trip completed
    Latency(Duration),
    /// Gave up after this many consecutive failed reconnections
    Failed { attempts: u32 },
}

/// Channel errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Channel configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Server URL, e.g. `ws://localhost:3000/default`
    pub url: String,
    /// First reconnection delay
    pub backoff_base: Duration,
    /// Upper bound for the doubling delay
    pub backoff_max: Duration,
    /// Consecutive reconnections tried before giving up
    pub max_attempts: u32,
    /// Limit on the TCP connect plus WebSocket handshake
    pub connect_timeout: Duration,
    /// How often `ping` probes are sent while connected
    pub ping_interval: Duration,
    /// Silence from the server after which the connection counts as dropped
    pub liveness_timeout: Duration,
    /// Event channel buffer
    pub event_capacity: usize,
}

impl ChannelConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(5),
            max_attempts: 5,
            connect_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(2),
            liveness_timeout: Duration::from_secs(6),
            event_capacity: 256,
        }
    }
}

/// Doubling delay with a ceiling and an attempt budget.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
    attempts: u32,
    max_attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            current: base,
            attempts: 0,
            max_attempts,
        }
    }

    /// Delay before the next attempt, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        let delay = self.current.min(self.max);
        self.current = self.current.saturating_mul(2).min(self.max);
        Some(delay)
    }

    /// Back to the base delay and a full budget.
    pub fn reset(&mut self) {
        self.current = self.base;
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Encoded outbound messages held while disconnected. Unbounded, FIFO.
#[derive(Debug, Default)]
pub struct OfflineQueue {
    queue: VecDeque<String>,
}

impl OfflineQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an encoded message at the back.
    pub fn enqueue(&mut self, payload: String) {
        self.queue.push_back(payload);
    }

    /// Put a message whose transmission failed back at the front.
    pub fn push_front(&mut self, payload: String) {
        self.queue.push_front(payload);
    }

    pub fn pop_front(&mut self) -> Option<String> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

enum Command {
    Send(String),
    Close,
}

/// Client handle to a self-healing connection.
pub struct ResilientChannel {
    commands: mpsc::UnboundedSender<Command>,
    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<ChannelEvent>>,
    events_taken: Arc<AtomicBool>,
    status: watch::Receiver<Connectivity>,
    url: String,
}

impl ResilientChannel {
    /// Spawn the driver task and start connecting. Requires a tokio runtime.
    pub fn open(config: ChannelConfig) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (status_tx, status_rx) = watch::channel(Connectivity::default());
        let url = config.url.clone();
        let events_taken = Arc::new(AtomicBool::new(false));

        let driver = Driver {
            backoff: Backoff::new(config.backoff_base, config.backoff_max, config.max_attempts),
            config,
            commands: command_rx,
            events: event_tx,
            events_taken: Arc::clone(&events_taken),
            status: status_tx,
            queue: OfflineQueue::new(),
        };
        tokio::spawn(driver.run());

        Self {
            commands: command_tx,
            event_rx: Some(event_rx),
            events_taken,
            status: status_rx,
            url,
        }
    }

    /// Take the event receiver (can only be called once).
    ///
    /// From then on the driver waits for room in the event buffer instead of
    /// dropping events, so the receiver must be drained.
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ChannelEvent>> {
        let rx = self.event_rx.take()?;
        self.events_taken.store(true, Ordering::Release);
        Some(rx)
    }

    /// Send now if connected, otherwise queue until the next connection.
    ///
    /// Fails only once the channel is closed or has given up.
    pub fn send(&self, message: &ClientMessage) -> Result<(), ChannelError> {
        let payload = message.encode()?;
        self.commands
            .send(Command::Send(payload))
            .map_err(|_| ChannelError::Closed)
    }

    /// Current state, latency and queue depth.
    pub fn connectivity(&self) -> Connectivity {
        self.status.borrow().clone()
    }

    /// Receiver that observes every connectivity change.
    pub fn watch(&self) -> watch::Receiver<Connectivity> {
        self.status.clone()
    }

    /// Stop reconnecting and close the connection. Queued messages are dropped.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Transport went away; reconnect
    Dropped,
    /// Closed on request; stop for good
    Closed,
}

struct Driver {
    config: ChannelConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::Sender<ChannelEvent>,
    events_taken: Arc<AtomicBool>,
    status: watch::Sender<Connectivity>,
    queue: OfflineQueue,
    backoff: Backoff,
}

impl Driver {
    async fn run(mut self) {
        loop {
            self.set_state(ConnectionState::Connecting);

            let connect = tokio_tungstenite::connect_async(self.config.url.as_str());
            match tokio::time::timeout(self.config.connect_timeout, connect).await {
                Ok(Ok((socket, _))) => {
                    log::info!("Connected to {}", self.config.url);
                    self.backoff.reset();
                    self.set_state(ConnectionState::Connected);
                    self.emit(ChannelEvent::Connected).await;

                    let end = self.session(socket).await;
                    self.status.send_modify(|c| {
                        c.state = ConnectionState::Disconnected;
                        c.latency = None;
                    });
                    if end == SessionEnd::Closed {
                        log::info!("Channel to {} closed", self.config.url);
                        return;
                    }
                    log::warn!("Lost connection to {}", self.config.url);
                    self.emit(ChannelEvent::Disconnected).await;
                }
                Ok(Err(e)) => {
                    log::warn!("Connection to {} failed: {e}", self.config.url);
                    self.set_state(ConnectionState::Disconnected);
                }
                Err(_) => {
                    log::warn!(
                        "Connection to {} timed out after {:?}",
                        self.config.url,
                        self.config.connect_timeout
                    );
                    self.set_state(ConnectionState::Disconnected);
                }
            }

            let Some(delay) = self.backoff.next_delay() else {
                let attempts = self.backoff.attempts();
                log::error!(
                    "Giving up on {} after {attempts} reconnection attempt(s)",
                    self.config.url
                );
                // refuse further sends before anyone can observe `Failed`
                self.commands.close();
                self.set_state(ConnectionState::Failed);
                self.emit(ChannelEvent::Failed { attempts }).await;
                return;
            };

            log::debug!(
                "Reconnecting in {delay:?} (attempt {}/{})",
                self.backoff.attempts(),
                self.config.max_attempts
            );
            if !self.sleep_queueing(delay).await {
                self.set_state(ConnectionState::Disconnected);
                return;
            }
        }
    }

    /// Wait out a backoff delay while still accepting sends into the queue.
    /// Returns `false` if the channel was closed meanwhile.
    async fn sleep_queueing(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    Some(Command::Send(payload)) => self.enqueue(payload),
                    Some(Command::Close) | None => return false,
                },
            }
        }
    }

    async fn session(&mut self, socket: Socket) -> SessionEnd {
        let (mut sink, mut stream) = socket.split();

        // Replay the offline queue first, in order
        let replaying = self.queue.len();
        while let Some(payload) = self.queue.pop_front() {
            if let Err(e) = sink.send(Message::text(payload.clone())).await {
                log::warn!("Replay interrupted: {e}");
                self.queue.push_front(payload);
                self.sync_queued();
                return SessionEnd::Dropped;
            }
        }
        if replaying > 0 {
            log::info!("Replayed {replaying} queued message(s)");
        }
        self.sync_queued();

        let mut ping = tokio::time::interval(self.config.ping_interval.max(Duration::from_millis(1)));
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_heard = Instant::now();

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Send(payload)) => {
                        if let Err(e) = sink.send(Message::text(payload.clone())).await {
                            log::warn!("Send failed, message queued: {e}");
                            self.queue.push_front(payload);
                            self.sync_queued();
                            return SessionEnd::Dropped;
                        }
                    }
                    Some(Command::Close) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        return SessionEnd::Closed;
                    }
                },

                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        last_heard = Instant::now();
                        match ServerMessage::decode(text.as_str()) {
                            Ok(ServerMessage::Pong { timestamp }) => {
                                let rtt = Duration::from_millis(unix_millis().saturating_sub(timestamp));
                                self.status.send_modify(|c| c.latency = Some(rtt));
                                // already on the watch; never worth blocking for
                                self.emit_lossy(ChannelEvent::Latency(rtt));
                            }
                            Ok(message) => self.emit(ChannelEvent::Message(message)).await,
                            Err(e) => log::warn!("Ignoring undecodable server message: {e}"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Dropped,
                    Some(Err(e)) => {
                        log::warn!("WebSocket error: {e}");
                        return SessionEnd::Dropped;
                    }
                    Some(Ok(_)) => last_heard = Instant::now(),
                },

                _ = ping.tick() => {
                    if last_heard.elapsed() > self.config.liveness_timeout {
                        log::warn!(
                            "No traffic from {} for {:?}, dropping connection",
                            self.config.url,
                            last_heard.elapsed()
                        );
                        return SessionEnd::Dropped;
                    }
                    let probe = ClientMessage::Ping { timestamp: unix_millis() };
                    let sent = match probe.encode() {
                        Ok(payload) => sink.send(Message::text(payload)).await.is_ok(),
                        Err(e) => {
                            log::error!("Failed to encode ping: {e}");
                            true
                        }
                    };
                    if !sent {
                        return SessionEnd::Dropped;
                    }
                }
            }
        }
    }

    fn enqueue(&mut self, payload: String) {
        self.queue.enqueue(payload);
        self.sync_queued();
    }

    fn sync_queued(&self) {
        let queued = self.queue.len();
        self.status.send_modify(|c| c.queued = queued);
    }

    fn set_state(&self, state: ConnectionState) {
        self.status.send_modify(|c| c.state = state);
    }

    /// Deliver an event. Waits for buffer room only once someone holds the
    /// receiver; before that a full buffer drops the event.
    async fn emit(&self, event: ChannelEvent) {
        if self.events_taken.load(Ordering::Acquire) {
            let _ = self.events.send(event).await;
        } else {
            self.emit_lossy(event);
        }
    }

    fn emit_lossy(&self, event: ChannelEvent) {
        match self.events.try_send(event) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(event)) => log::debug!("Event buffer full, dropped {event:?}"),
        }
    }
}
