//! Room aggregate and the table of live rooms.
//!
//! A [`Room`] bundles everything one collaboration session owns: its
//! operation log, its roster and its broadcast group. The [`RoomTable`]
//! creates rooms lazily on first join and destroys them as soon as the
//! last participant leaves.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::broadcast::{BroadcastGroup, DEFAULT_BROADCAST_CAPACITY};
use crate::oplog::{OperationLog, DEFAULT_MAX_OPERATIONS};
use crate::protocol::{Participant, ParticipantId, RoomId, ServerMessage};

/// One collaboration session.
pub struct Room {
    id: RoomId,
    log: OperationLog,
    /// Join order.
    roster: Vec<Participant>,
    broadcast: BroadcastGroup,
}

impl Room {
    pub fn new(id: impl Into<RoomId>, max_operations: usize, broadcast_capacity: usize) -> Self {
        Self {
            id: id.into(),
            log: OperationLog::new(max_operations),
            roster: Vec::new(),
            broadcast: BroadcastGroup::new(broadcast_capacity),
        }
    }

    /// Add to the roster. A participant with the same id is replaced.
    pub fn admit(&mut self, participant: Participant) {
        match self.roster.iter_mut().find(|p| p.id == participant.id) {
            Some(existing) => *existing = participant,
            None => self.roster.push(participant),
        }
    }

    /// Remove from the roster.
    pub fn dismiss(&mut self, id: &ParticipantId) -> Option<Participant> {
        let pos = self.roster.iter().position(|p| &p.id == id)?;
        Some(self.roster.remove(pos))
    }

    /// The `init` message for `participant_id`: full log plus roster.
    pub fn snapshot_for(&self, participant_id: &ParticipantId) -> ServerMessage {
        ServerMessage::Init {
            participant_id: participant_id.clone(),
            operations: self.log.snapshot(),
            participants: self.roster.clone(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn log(&self) -> &OperationLog {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut OperationLog {
        &mut self.log
    }

    pub fn participants(&self) -> &[Participant] {
        &self.roster
    }

    pub fn participant(&self, id: &ParticipantId) -> Option<&Participant> {
        self.roster.iter().find(|p| &p.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.roster.is_empty()
    }

    pub fn broadcast(&self) -> &BroadcastGroup {
        &self.broadcast
    }
}

/// Outcome of [`RoomTable::leave`].
#[derive(Debug, Clone, PartialEq)]
pub struct Departure {
    /// The roster entry that was removed, if the participant was present.
    pub participant: Option<Participant>,
    /// The room became empty and was dropped along with its log.
    pub room_destroyed: bool,
}

/// Aggregate counters across every live room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    pub rooms: usize,
    pub participants: usize,
    pub operations: usize,
}

/// All live rooms, keyed by id.
pub struct RoomTable {
    rooms: HashMap<RoomId, Room>,
    max_operations: usize,
    broadcast_capacity: usize,
}

impl RoomTable {
    pub fn new(max_operations: usize, broadcast_capacity: usize) -> Self {
        Self {
            rooms: HashMap::new(),
            max_operations,
            broadcast_capacity,
        }
    }

    /// Existing room, or a fresh empty one.
    pub fn get_or_create(&mut self, room_id: &str) -> &mut Room {
        let (max_operations, capacity) = (self.max_operations, self.broadcast_capacity);
        self.rooms.entry(room_id.to_string()).or_insert_with(|| {
            log::info!("Room {room_id} created");
            Room::new(room_id, max_operations, capacity)
        })
    }

    /// Put `participant` on the room's roster, creating the room if needed.
    pub fn join(&mut self, room_id: &str, participant: Participant) -> &mut Room {
        let room = self.get_or_create(room_id);
        room.admit(participant);
        room
    }

    /// Take `participant_id` off the room's roster. Drops the room once empty.
    pub fn leave(&mut self, room_id: &str, participant_id: &ParticipantId) -> Departure {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return Departure {
                participant: None,
                room_destroyed: false,
            };
        };

        let participant = room.dismiss(participant_id);
        let room_destroyed = room.is_empty();
        if room_destroyed {
            self.rooms.remove(room_id);
            log::info!("Room {room_id} removed (empty)");
        }

        Departure {
            participant,
            room_destroyed,
        }
    }

    /// Current roster, empty for an unknown room.
    pub fn list(&self, room_id: &str) -> Vec<Participant> {
        self.rooms
            .get(room_id)
            .map(|room| room.participants().to_vec())
            .unwrap_or_default()
    }

    pub fn count(&self, room_id: &str) -> usize {
        self.rooms
            .get(room_id)
            .map_or(0, |room| room.participants().len())
    }

    /// Drop every room with no participants. Returns the dropped ids.
    ///
    /// Occupied rooms are kept however long they have been quiet; the ones
    /// idle past `idle_timeout` are only reported.
    pub fn sweep(&mut self, now: Instant, idle_timeout: Duration) -> Vec<RoomId> {
        let mut dropped = Vec::new();
        self.rooms.retain(|id, room| {
            if room.is_empty() {
                dropped.push(id.clone());
                return false;
            }
            let idle = room.log().idle_for(now);
            if idle >= idle_timeout {
                log::debug!(
                    "Room {id} idle for {}s with {} participant(s)",
                    idle.as_secs(),
                    room.participants().len()
                );
            }
            true
        });

        for id in &dropped {
            log::info!("Room {id} swept (empty)");
        }
        dropped
    }

    pub fn room(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    pub fn room_mut(&mut self, room_id: &str) -> Option<&mut Room> {
        self.rooms.get_mut(room_id)
    }

    pub fn contains(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn stats(&self) -> TableStats {
        self.rooms.values().fold(
            TableStats {
                rooms: self.rooms.len(),
                ..TableStats::default()
            },
            |mut acc, room| {
                acc.participants += room.participants().len();
                acc.operations += room.log().len();
                acc
            },
        )
    }
}

impl Default for RoomTable {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_OPERATIONS, DEFAULT_BROADCAST_CAPACITY)
    }
}
