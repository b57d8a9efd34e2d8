//! # tandem-sync - Real-time operation sync for a shared canvas
//!
//! Participants in a room draw on one logical canvas. Completed strokes are
//! committed to an authoritative per-room operation log on the server and
//! rebroadcast; undo, redo and clear are global to the room.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐     WebSocket      ┌─────────────┐
//! │ ResilientChannel │ ◄────────────────► │ SyncServer  │
//! │ (per user)       │     JSON frames    │ (central)   │
//! └────────┬─────────┘                    └──────┬──────┘
//!          │                                     │ Mutex<Hub>
//!          ▼                                     ▼
//! ┌──────────────────┐                    ┌─────────────┐
//! │ CanvasReplica    │                    │ RoomTable   │
//! │ (local copy)     │                    │ log, roster │
//! └──────────────────┘                    └──────┬──────┘
//!                                                │
//!                                        ┌───────┴───────┐
//!                                        │ BroadcastGroup│
//!                                        │ (fan-out)     │
//!                                        └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire messages and the operation model
//! - [`oplog`]: Ordered, capped, id-indexed operation log
//! - [`room`]: Room aggregate and the room table (rosters, lifecycle)
//! - [`broadcast`]: Per-room fan-out with audience filtering
//! - [`hub`]: Applies client messages to rooms under one lock
//! - [`server`]: WebSocket sync server
//! - [`client`]: Reconnecting client channel with offline queue
//! - [`replica`]: Client-side canvas state and undo/redo stacks
//! - [`presence`]: Participant colors, names and cursor throttling

pub mod protocol;
pub mod oplog;
pub mod room;
pub mod broadcast;
pub mod hub;
pub mod server;
pub mod client;
pub mod replica;
pub mod presence;

// Re-exports for convenience
pub use protocol::{
    ClientMessage, Operation, OperationId, Participant, ParticipantId, Point,
    ProtocolError, RoomId, ServerMessage, StrokeKind, StrokeSegment, DEFAULT_ROOM,
};
pub use oplog::OperationLog;
pub use room::{Departure, Room, RoomTable, TableStats};
pub use broadcast::{Audience, BroadcastGroup, BroadcastStats, Envelope};
pub use hub::{Hub, Membership, Subscription};
pub use server::{ConfigError, ServerConfig, ServerError, ServerStats, SyncServer};
pub use client::{
    Backoff, ChannelConfig, ChannelError, ChannelEvent, ConnectionState, Connectivity,
    OfflineQueue, ResilientChannel,
};
pub use replica::{CanvasReplica, StrokeSink};
pub use presence::{assign_participant, participant_color, CursorThrottle};
