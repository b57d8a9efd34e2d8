//! Message authority: binds client messages to room mutations and fan-out.
//!
//! The [`Hub`] owns the [`RoomTable`]. The server keeps exactly one hub
//! behind a `tokio::sync::Mutex`, and every call below runs to completion
//! (mutation *and* broadcast send) while that lock is held. That makes the
//! per-room broadcast stream a single serialized order that every
//! participant observes identically.
//!
//! | incoming  | effect        | fan-out              |
//! |-----------|---------------|----------------------|
//! | join      | roster insert | init → joiner, user-joined → others |
//! | draw      | none          | others               |
//! | operation | log append    | others               |
//! | undo      | log remove    | everyone             |
//! | redo      | log append    | everyone             |
//! | clear     | log clear     | everyone             |
//! | cursor    | none          | others               |
//! | ping      | none          | pong → sender        |
//! | leave     | roster remove | user-left → others   |

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use crate::broadcast::{Audience, Envelope};
use crate::presence::participant_color;
use crate::protocol::{ClientMessage, Participant, ParticipantId, ProtocolError, RoomId, ServerMessage};
use crate::room::{Departure, RoomTable, TableStats};

/// Where a connection lives: its room and its roster entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Membership {
    pub room_id: RoomId,
    pub participant: Participant,
}

impl Membership {
    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant.id
    }
}

/// A snapshot plus the receiver that continues exactly where it ends.
pub struct Subscription {
    /// Always `ServerMessage::Init`.
    pub init: ServerMessage,
    pub receiver: broadcast::Receiver<Arc<Envelope>>,
}

/// Shared state of every room on the server.
#[derive(Default)]
pub struct Hub {
    rooms: RoomTable,
}

impl Hub {
    pub fn new(max_operations: usize, broadcast_capacity: usize) -> Self {
        Self {
            rooms: RoomTable::new(max_operations, broadcast_capacity),
        }
    }

    /// Admit `participant` to `room_id`.
    ///
    /// The subscription is taken before the snapshot is read, so nothing
    /// committed afterwards can be missed or duplicated.
    pub fn join(
        &mut self,
        room_id: &str,
        participant: Participant,
    ) -> Result<(Membership, Subscription), ProtocolError> {
        let room = self.rooms.join(room_id, participant.clone());
        let receiver = room.broadcast().subscribe();
        let init = room.snapshot_for(&participant.id);

        room.broadcast().send(
            &participant.id,
            Audience::Others,
            &ServerMessage::UserJoined(participant.clone()),
        )?;

        log::info!(
            "{} ({}) joined room {room_id}, {} participant(s)",
            participant.display_name,
            participant.id,
            room.participants().len()
        );

        let membership = Membership {
            room_id: room_id.to_string(),
            participant,
        };
        Ok((membership, Subscription { init, receiver }))
    }

    /// Fresh snapshot and receiver for a connection whose receiver lagged.
    pub fn resync(&mut self, member: &Membership) -> Subscription {
        let room = self.rooms.get_or_create(&member.room_id);
        room.admit(member.participant.clone());
        let receiver = room.broadcast().subscribe();
        let init = room.snapshot_for(member.participant_id());
        Subscription { init, receiver }
    }

    /// Apply one client message.
    ///
    /// Returns a reply meant only for the sender (currently just `pong`).
    /// Invalid operations are rejected before any state is touched.
    pub fn dispatch(
        &mut self,
        member: &Membership,
        message: ClientMessage,
    ) -> Result<Option<ServerMessage>, ProtocolError> {
        let sender = member.participant_id();
        let room = self.rooms.get_or_create(&member.room_id);

        match message {
            ClientMessage::Draw(segment) => {
                let relay = ServerMessage::Draw {
                    author_id: sender.clone(),
                    segment,
                };
                room.broadcast().send(sender, Audience::Others, &relay)?;
            }

            ClientMessage::Operation { mut operation } => {
                operation.validate()?;
                operation.author_id = Some(sender.clone());
                let relay = ServerMessage::Operation {
                    operation: operation.clone(),
                    author_id: sender.clone(),
                };
                if let Some(evicted) = room.log_mut().append(operation) {
                    log::debug!("Room {} evicted operation {}", member.room_id, evicted.id);
                }
                room.broadcast().send(sender, Audience::Others, &relay)?;
            }

            ClientMessage::Undo { operation_id } => {
                if room.log_mut().remove(&operation_id).is_none() {
                    log::debug!(
                        "Undo of unknown operation {operation_id} in room {}",
                        member.room_id
                    );
                }
                room.broadcast()
                    .send(sender, Audience::Everyone, &ServerMessage::Undo { operation_id })?;
            }

            ClientMessage::Redo { mut operation } => {
                operation.validate()?;
                if operation.author_id.is_none() {
                    operation.author_id = Some(sender.clone());
                }
                let relay = ServerMessage::Redo {
                    operation: operation.clone(),
                };
                if let Some(evicted) = room.log_mut().append(operation) {
                    log::debug!("Room {} evicted operation {}", member.room_id, evicted.id);
                }
                room.broadcast().send(sender, Audience::Everyone, &relay)?;
            }

            ClientMessage::Clear {} => {
                let dropped = room.log().len();
                room.log_mut().clear();
                room.broadcast()
                    .send(sender, Audience::Everyone, &ServerMessage::Clear {})?;
                log::info!(
                    "Room {} cleared by {sender} ({dropped} operation(s))",
                    member.room_id
                );
            }

            ClientMessage::Cursor { x, y, .. } => {
                let color = room
                    .participant(sender)
                    .map(|p| p.color.clone())
                    .unwrap_or_else(|| participant_color(sender));
                let relay = ServerMessage::Cursor {
                    participant_id: sender.clone(),
                    x,
                    y,
                    color,
                };
                room.broadcast().send(sender, Audience::Others, &relay)?;
            }

            ClientMessage::Ping { timestamp } => {
                return Ok(Some(ServerMessage::Pong { timestamp }));
            }
        }

        Ok(None)
    }

    /// Remove the connection's roster entry and tell whoever remains.
    pub fn leave(&mut self, member: &Membership) -> Departure {
        let departure = self.rooms.leave(&member.room_id, member.participant_id());

        if departure.participant.is_some() && !departure.room_destroyed {
            if let Some(room) = self.rooms.room(&member.room_id) {
                let notice = ServerMessage::UserLeft {
                    participant_id: member.participant_id().clone(),
                };
                if let Err(e) = room.broadcast().send(member.participant_id(), Audience::Others, &notice) {
                    log::error!("Failed to announce departure of {}: {e}", member.participant_id());
                }
            }
        }

        log::info!(
            "{} left room {}{}",
            member.participant.display_name,
            member.room_id,
            if departure.room_destroyed { " (room closed)" } else { "" }
        );
        departure
    }

    /// Drop empty rooms; see [`RoomTable::sweep`].
    pub fn sweep(&mut self, now: Instant, idle_timeout: Duration) -> Vec<RoomId> {
        self.rooms.sweep(now, idle_timeout)
    }

    pub fn rooms(&self) -> &RoomTable {
        &self.rooms
    }

    pub fn stats(&self) -> TableStats {
        self.rooms.stats()
    }
}
