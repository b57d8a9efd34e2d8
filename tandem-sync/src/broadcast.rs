//! Per-room fan-out of server messages.
//!
//! Each room owns one tokio broadcast channel. Messages are encoded to JSON
//! once and shared as `Arc<Envelope>`; every connection task holds its own
//! receiver and drops envelopes whose audience excludes it.
//!
//! A receiver that falls more than `capacity` messages behind observes
//! `RecvError::Lagged` and must resynchronize from a fresh snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::protocol::{ParticipantId, ProtocolError, ServerMessage};

/// Default per-receiver buffer.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Who receives a broadcast, relative to the participant that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// Everyone in the room except the origin.
    Others,
    /// Everyone in the room, origin included.
    Everyone,
}

/// One pre-encoded message on its way to a room.
#[derive(Debug)]
pub struct Envelope {
    pub origin: ParticipantId,
    pub audience: Audience,
    /// Encoded `ServerMessage` JSON.
    pub payload: String,
}

impl Envelope {
    /// Whether `participant` should receive this envelope.
    pub fn reaches(&self, participant: &ParticipantId) -> bool {
        match self.audience {
            Audience::Everyone => true,
            Audience::Others => &self.origin != participant,
        }
    }
}

/// Snapshot of broadcast counters.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub active_receivers: usize,
}

/// A broadcast group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Envelope>>,
    capacity: usize,
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    /// Create a group buffering up to `capacity` messages per receiver.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    /// A new receiver that sees every envelope sent from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Envelope>> {
        self.sender.subscribe()
    }

    /// Encode `message` and fan it out to the room.
    ///
    /// Returns how many receivers were handed the envelope (audience
    /// filtering happens on the receiving side). Zero receivers is not an
    /// error.
    pub fn send(
        &self,
        origin: &ParticipantId,
        audience: Audience,
        message: &ServerMessage,
    ) -> Result<usize, ProtocolError> {
        let envelope = Envelope {
            origin: origin.clone(),
            audience,
            payload: message.encode()?,
        };
        Ok(self.send_envelope(Arc::new(envelope)))
    }

    /// Fan out an already-encoded envelope.
    pub fn send_envelope(&self, envelope: Arc<Envelope>) -> usize {
        let count = self.sender.send(envelope).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_receivers: self.sender.receiver_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    fn alice() -> ParticipantId {
        ParticipantId::new("alice")
    }

    fn bob() -> ParticipantId {
        ParticipantId::new("bob")
    }

    #[test]
    fn test_audience_filter() {
        let to_others = Envelope {
            origin: alice(),
            audience: Audience::Others,
            payload: String::new(),
        };
        assert!(!to_others.reaches(&alice()));
        assert!(to_others.reaches(&bob()));

        let to_all = Envelope {
            origin: alice(),
            audience: Audience::Everyone,
            payload: String::new(),
        };
        assert!(to_all.reaches(&alice()));
        assert!(to_all.reaches(&bob()));
    }

    #[tokio::test]
    async fn test_fan_out_to_every_receiver() {
        let group = BroadcastGroup::new(16);
        let mut rx1 = group.subscribe();
        let mut rx2 = group.subscribe();

        let msg = ServerMessage::Clear {};
        let count = group.send(&alice(), Audience::Everyone, &msg).unwrap();
        assert_eq!(count, 2);

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();
        assert!(Arc::ptr_eq(&e1, &e2));
        assert_eq!(ServerMessage::decode(&e1.payload).unwrap(), msg);
    }

    #[test]
    fn test_send_without_receivers() {
        let group = BroadcastGroup::new(4);
        let count = group
            .send(&alice(), Audience::Others, &ServerMessage::Pong { timestamp: 1 })
            .unwrap();
        assert_eq!(count, 0);
        assert_eq!(group.stats().messages_sent, 1);
    }

    #[test]
    fn test_late_subscriber_misses_earlier_messages() {
        let group = BroadcastGroup::new(4);
        let _early = group.subscribe();
        group
            .send(&alice(), Audience::Everyone, &ServerMessage::Clear {})
            .unwrap();

        let mut late = group.subscribe();
        assert!(matches!(late.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_slow_receiver_lags() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.subscribe();

        for ts in 0..5 {
            group
                .send(&alice(), Audience::Others, &ServerMessage::Pong { timestamp: ts })
                .unwrap();
        }

        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(3))));
    }

    #[test]
    fn test_stats_and_capacity() {
        let group = BroadcastGroup::new(32);
        assert_eq!(group.capacity(), 32);

        let _rx = group.subscribe();
        group
            .send(&bob(), Audience::Others, &ServerMessage::Clear {})
            .unwrap();
        group
            .send(&bob(), Audience::Others, &ServerMessage::Clear {})
            .unwrap();

        let stats = group.stats();
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.active_receivers, 1);
        assert_eq!(group.receiver_count(), 1);
    }
}
