//! WebSocket sync server with path-based room routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── Room "default" ── OperationLog
//!             ├── Arc<Mutex<Hub>> ───┤        │            roster
//! Client B ──┘                       │        └── BroadcastGroup ──┐
//!                                    └── Room "sketch" ...         │
//!                          ┌───────────────────┬───────────────────┘
//!                          ▼                   ▼
//!                       Client A            Client B
//! ```
//!
//! One task per connection. The room is chosen from the request path
//! (`ws://host:3000/<room>`, empty path = `"default"`). On connect the task
//! joins the room, sends the `init` snapshot, then relays in both
//! directions until either side closes. Every message is applied through
//! the shared [`Hub`] while its lock is held.

use std::net::SocketAddr;
use std::num::ParseIntError;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::DEFAULT_BROADCAST_CAPACITY;
use crate::hub::{Hub, Membership, Subscription};
use crate::oplog::DEFAULT_MAX_OPERATIONS;
use crate::presence::assign_participant;
use crate::protocol::{ClientMessage, ParticipantId, ProtocolError, RoomId, DEFAULT_ROOM};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Operations retained per room before the oldest is evicted
    pub max_operations: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// How often empty rooms are swept
    pub sweep_interval: Duration,
    /// Inactivity after which an occupied room is logged as idle at debug
    /// level during a sweep. Occupied rooms are never evicted.
    pub idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            max_operations: DEFAULT_MAX_OPERATIONS,
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
            sweep_interval: Duration::from_secs(5 * 60),
            idle_timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl ServerConfig {
    /// Defaults, with the port taken from `PORT` when set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = std::env::var("PORT").ok();
        Self::default().with_port_override(port.as_deref())
    }

    /// Replace the port of `bind_addr`, keeping the host.
    pub fn with_port_override(mut self, port: Option<&str>) -> Result<Self, ConfigError> {
        let Some(raw) = port.map(str::trim).filter(|p| !p.is_empty()) else {
            return Ok(self);
        };

        let port: u16 = raw.parse().map_err(|source| ConfigError::InvalidPort {
            value: raw.to_string(),
            source,
        })?;

        let host = self
            .bind_addr
            .rsplit_once(':')
            .map_or("0.0.0.0", |(host, _)| host);
        self.bind_addr = format!("{host}:{port}");
        Ok(self)
    }
}

/// Invalid configuration input.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid PORT {value:?}: {source}")]
    InvalidPort {
        value: String,
        #[source]
        source: ParseIntError,
    },
}

/// Errors that end a connection or the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Connections closed for sending something invalid
    pub rejected_messages: u64,
    pub active_rooms: usize,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    /// All rooms, serialized behind one lock
    hub: Arc<Mutex<Hub>>,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a new sync server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let hub = Hub::new(config.max_operations, config.broadcast_capacity);
        Self {
            config,
            hub: Arc::new(Mutex::new(hub)),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Bind and serve until the accept loop fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    ///
    /// Also drives the periodic sweep of empty rooms for as long as it runs.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let sweeper = self.spawn_sweeper();
        let result = self.accept_loop(listener).await;
        sweeper.abort();
        result
    }

    async fn accept_loop(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    fn spawn_sweeper(&self) -> JoinHandle<()> {
        let hub = self.hub.clone();
        let period = self.config.sweep_interval.max(Duration::from_millis(1));
        let idle_timeout = self.config.idle_timeout;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let swept = hub.lock().await.sweep(Instant::now(), idle_timeout);
                if !swept.is_empty() {
                    log::info!("Swept {} empty room(s)", swept.len());
                }
            }
        })
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<Mutex<Hub>>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), ServerError> {
        let mut path = String::new();
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            path = req.uri().path().to_string();
            Ok::<_, ErrorResponse>(resp)
        })
        .await?;
        let room_id = room_from_path(&path);

        let participant = assign_participant(ParticipantId::generate());
        let (member, subscription) = hub.lock().await.join(&room_id, participant)?;

        log::info!(
            "WebSocket connection from {addr} is {} in room {room_id}",
            member.participant_id()
        );

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let outcome = Self::run_session(ws_stream, addr, &hub, &stats, &member, subscription).await;

        // Cleanup: leave the room whatever ended the session
        hub.lock().await.leave(&member);
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            if matches!(outcome, Err(ServerError::Protocol(_))) {
                s.rejected_messages += 1;
            }
        }

        outcome
    }

    async fn run_session(
        ws_stream: WebSocketStream<TcpStream>,
        addr: SocketAddr,
        hub: &Mutex<Hub>,
        stats: &RwLock<ServerStats>,
        member: &Membership,
        subscription: Subscription,
    ) -> Result<(), ServerError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let Subscription { init, mut receiver } = subscription;

        ws_sender.send(Message::text(init.encode()?)).await?;

        loop {
            tokio::select! {
                // Incoming WebSocket frame
                frame = ws_receiver.next() => {
                    let rejected = match frame {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += text.len() as u64;
                            }

                            let applied = match ClientMessage::decode(text.as_str()) {
                                Ok(message) => {
                                    log::trace!("{} sent {}", member.participant_id(), message.event_name());
                                    hub.lock().await.dispatch(member, message)
                                }
                                Err(e) => Err(e),
                            };

                            match applied {
                                Ok(Some(reply)) => {
                                    ws_sender.send(Message::text(reply.encode()?)).await?;
                                    None
                                }
                                Ok(None) => None,
                                Err(e) => Some(e),
                            }
                        }

                        Some(Ok(Message::Binary(data))) => Some(ProtocolError::UnexpectedBinary(data.len())),

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                            None
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            return Ok(());
                        }

                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            return Ok(());
                        }

                        Some(Ok(_)) => None,
                    };

                    if let Some(e) = rejected {
                        log::warn!("Closing {addr} ({}): {e}", member.participant_id());
                        // best effort; the peer may already be gone
                        let _ = ws_sender.send(Message::Close(None)).await;
                        return Err(e.into());
                    }
                }

                // Outgoing room broadcast
                envelope = receiver.recv() => {
                    match envelope {
                        Ok(envelope) => {
                            if envelope.reaches(member.participant_id()) {
                                ws_sender.send(Message::text(envelope.payload.clone())).await?;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            log::warn!(
                                "{} lagged by {n} messages, resending snapshot",
                                member.participant_id()
                            );
                            let fresh = hub.lock().await.resync(member);
                            receiver = fresh.receiver;
                            ws_sender.send(Message::text(fresh.init.encode()?)).await?;
                        }
                        Err(RecvError::Closed) => return Ok(()),
                    }
                }
            }
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.hub.lock().await.rooms().room_count();
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Shared handle to the room state.
    pub fn hub(&self) -> Arc<Mutex<Hub>> {
        self.hub.clone()
    }
}

/// Room named by a request path: `/sketch` → `sketch`, `/` → `default`.
pub fn room_from_path(path: &str) -> RoomId {
    let name = path.trim_matches('/');
    if name.is_empty() {
        DEFAULT_ROOM.to_string()
    } else {
        name.to_string()
    }
}
