//! Client-side copy of a room's canvas.
//!
//! The replica mirrors what the server broadcasts and keeps the local
//! participant's undo/redo stacks. It is reconciled with the server only
//! through `init` snapshots, which replace everything.

use crate::protocol::{ClientMessage, Operation, OperationId, Participant, ParticipantId, ServerMessage};

/// Rendering collaborator.
pub trait StrokeSink {
    /// Repaint the canvas from scratch.
    fn redraw(&mut self, operations: &[Operation]);
    /// Paint one more operation on top.
    fn draw(&mut self, operation: &Operation);
}

/// Headless replicas render nothing.
impl StrokeSink for () {
    fn redraw(&mut self, _operations: &[Operation]) {}
    fn draw(&mut self, _operation: &Operation) {}
}

#[derive(Debug, Default)]
pub struct CanvasReplica {
    participant_id: Option<ParticipantId>,
    operations: Vec<Operation>,
    participants: Vec<Participant>,
    /// Own committed operations, most recent last.
    undo_stack: Vec<OperationId>,
    /// Own undone operations, kept by value for redo.
    redo_stack: Vec<Operation>,
}

impl CanvasReplica {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a locally completed stroke and produce the message to send.
    pub fn commit(&mut self, operation: Operation) -> ClientMessage {
        self.undo_stack.push(operation.id.clone());
        self.redo_stack.clear();
        self.upsert(operation.clone());
        ClientMessage::Operation { operation }
    }

    /// Optimistically undo the latest own operation that still exists.
    pub fn undo(&mut self, sink: &mut impl StrokeSink) -> Option<ClientMessage> {
        while let Some(id) = self.undo_stack.pop() {
            if let Some(operation) = self.take(&id) {
                sink.redraw(&self.operations);
                self.redo_stack.push(operation);
                return Some(ClientMessage::Undo { operation_id: id });
            }
        }
        None
    }

    /// Ask the server to re-apply the most recently undone operation.
    ///
    /// The local copy changes when the `redo` echo arrives.
    pub fn redo(&mut self) -> Option<ClientMessage> {
        let operation = self.redo_stack.pop()?;
        self.undo_stack.push(operation.id.clone());
        Some(ClientMessage::Redo { operation })
    }

    /// Mirror one server message.
    pub fn apply(&mut self, message: ServerMessage, sink: &mut impl StrokeSink) {
        match message {
            ServerMessage::Init {
                participant_id,
                operations,
                participants,
            } => {
                self.participant_id = Some(participant_id);
                self.operations = operations;
                self.participants = participants;

                let present = |id: &OperationId| self.operations.iter().any(|op| &op.id == id);
                self.undo_stack.retain(|id| present(id));
                self.redo_stack.retain(|op| !present(&op.id));

                sink.redraw(&self.operations);
            }

            ServerMessage::UserJoined(participant) => {
                match self.participants.iter_mut().find(|p| p.id == participant.id) {
                    Some(existing) => *existing = participant,
                    None => self.participants.push(participant),
                }
            }

            ServerMessage::UserLeft { participant_id } => {
                self.participants.retain(|p| p.id != participant_id);
            }

            ServerMessage::Operation { operation, .. } | ServerMessage::Redo { operation } => {
                if self.upsert(operation) {
                    sink.redraw(&self.operations);
                } else if let Some(added) = self.operations.last() {
                    sink.draw(added);
                }
            }

            ServerMessage::Undo { operation_id } => {
                self.undo_stack.retain(|id| id != &operation_id);
                if self.take(&operation_id).is_some() {
                    sink.redraw(&self.operations);
                }
            }

            ServerMessage::Clear {} => {
                self.operations.clear();
                self.undo_stack.clear();
                self.redo_stack.clear();
                sink.redraw(&self.operations);
            }

            // live strokes, cursors and pongs do not change the log
            ServerMessage::Draw { .. } | ServerMessage::Cursor { .. } | ServerMessage::Pong { .. } => {}
        }
    }

    /// Append at the tail; returns `true` if an entry with the same id moved.
    fn upsert(&mut self, operation: Operation) -> bool {
        let replaced = self.take(&operation.id).is_some();
        self.operations.push(operation);
        replaced
    }

    fn take(&mut self, id: &OperationId) -> Option<Operation> {
        let pos = self.operations.iter().position(|op| &op.id == id)?;
        Some(self.operations.remove(pos))
    }

    pub fn participant_id(&self) -> Option<&ParticipantId> {
        self.participant_id.as_ref()
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn can_undo(&self) -> bool {
        self.undo_stack.iter().any(|id| self.operations.iter().any(|op| &op.id == id))
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Point, StrokeKind};

    #[derive(Default)]
    struct Recorder {
        redraws: usize,
        drawn: Vec<String>,
        visible: Vec<String>,
    }

    impl StrokeSink for Recorder {
        fn redraw(&mut self, operations: &[Operation]) {
            self.redraws += 1;
            self.visible = operations.iter().map(|op| op.id.to_string()).collect();
        }

        fn draw(&mut self, operation: &Operation) {
            self.drawn.push(operation.id.to_string());
            self.visible.push(operation.id.to_string());
        }
    }

    fn op(id: &str) -> Operation {
        Operation {
            id: OperationId::new(id),
            kind: StrokeKind::Brush,
            color: "#000000".to_string(),
            stroke_width: 1.0,
            points: vec![Point::new(0.0, 0.0)],
            created_at: 0,
            author_id: None,
        }
    }

    fn ids(replica: &CanvasReplica) -> Vec<String> {
        replica.operations().iter().map(|op| op.id.to_string()).collect()
    }

    fn init(ops: &[&str]) -> ServerMessage {
        ServerMessage::Init {
            participant_id: ParticipantId::new("me"),
            operations: ops.iter().map(|id| op(id)).collect(),
            participants: vec![],
        }
    }

    #[test]
    fn test_commit_then_undo_redo_roundtrip() {
        let mut replica = CanvasReplica::new();
        let mut sink = Recorder::default();

        assert!(matches!(replica.commit(op("a")), ClientMessage::Operation { .. }));
        replica.commit(op("b"));
        assert_eq!(ids(&replica), ["a", "b"]);

        let undo = replica.undo(&mut sink).unwrap();
        assert_eq!(
            undo,
            ClientMessage::Undo {
                operation_id: OperationId::new("b")
            }
        );
        assert_eq!(ids(&replica), ["a"]);
        assert_eq!(sink.visible, ["a"]);
        assert!(replica.can_redo());

        // the server echo of our own undo is a no-op
        replica.apply(
            ServerMessage::Undo {
                operation_id: OperationId::new("b"),
            },
            &mut sink,
        );
        assert_eq!(ids(&replica), ["a"]);

        let redo = replica.redo().unwrap();
        match &redo {
            ClientMessage::Redo { operation } => assert_eq!(operation.id, OperationId::new("b")),
            other => panic!("Expected redo, got {other:?}"),
        }
        assert!(!replica.can_redo());

        replica.apply(ServerMessage::Redo { operation: op("b") }, &mut sink);
        assert_eq!(ids(&replica), ["a", "b"]);
        assert_eq!(sink.drawn, ["b"]);
    }

    #[test]
    fn test_commit_clears_redo_stack() {
        let mut replica = CanvasReplica::new();
        replica.commit(op("a"));
        replica.undo(&mut ()).unwrap();
        assert!(replica.can_redo());

        replica.commit(op("b"));
        assert!(!replica.can_redo());
        assert!(replica.redo().is_none());
    }

    #[test]
    fn test_undo_skips_operations_removed_by_others() {
        let mut replica = CanvasReplica::new();
        replica.commit(op("a"));
        replica.commit(op("b"));

        // someone else undid "b"
        replica.apply(
            ServerMessage::Undo {
                operation_id: OperationId::new("b"),
            },
            &mut (),
        );

        let undo = replica.undo(&mut ()).unwrap();
        assert_eq!(
            undo,
            ClientMessage::Undo {
                operation_id: OperationId::new("a")
            }
        );
        assert!(replica.undo(&mut ()).is_none());
        assert!(!replica.can_undo());
    }

    #[test]
    fn test_init_replaces_state_and_prunes_stacks() {
        let mut replica = CanvasReplica::new();
        let mut sink = Recorder::default();
        replica.commit(op("mine"));
        replica.commit(op("lost"));

        replica.apply(init(&["x", "mine"]), &mut sink);

        assert_eq!(replica.participant_id(), Some(&ParticipantId::new("me")));
        assert_eq!(ids(&replica), ["x", "mine"]);
        assert_eq!(sink.visible, ["x", "mine"]);
        assert_eq!(sink.redraws, 1);

        // "lost" never reached the server, so only "mine" is undoable
        assert_eq!(
            replica.undo(&mut sink),
            Some(ClientMessage::Undo {
                operation_id: OperationId::new("mine")
            })
        );
        assert!(replica.undo(&mut sink).is_none());
    }

    #[test]
    fn test_remote_operation_is_idempotent_by_id() {
        let mut replica = CanvasReplica::new();
        let mut sink = Recorder::default();
        replica.apply(init(&["a", "b"]), &mut sink);

        let remote = |id: &str| ServerMessage::Operation {
            operation: op(id),
            author_id: ParticipantId::new("other"),
        };
        replica.apply(remote("c"), &mut sink);
        replica.apply(remote("a"), &mut sink);

        assert_eq!(ids(&replica), ["b", "c", "a"]);
        assert_eq!(sink.drawn, ["c"]);
        assert_eq!(sink.redraws, 2);
    }

    #[test]
    fn test_unknown_undo_and_clear() {
        let mut replica = CanvasReplica::new();
        let mut sink = Recorder::default();
        replica.apply(init(&["a"]), &mut sink);

        replica.apply(
            ServerMessage::Undo {
                operation_id: OperationId::new("zzz"),
            },
            &mut sink,
        );
        assert_eq!(ids(&replica), ["a"]);
        assert_eq!(sink.redraws, 1);

        replica.apply(ServerMessage::Clear {}, &mut sink);
        assert!(replica.operations().is_empty());
        assert!(sink.visible.is_empty());
        assert!(!replica.can_undo());
    }

    #[test]
    fn test_roster_tracking() {
        let mut replica = CanvasReplica::new();
        let guest = |id: &str| Participant {
            id: ParticipantId::new(id),
            color: "#abcdef".to_string(),
            display_name: format!("Guest-{id}"),
        };

        replica.apply(ServerMessage::UserJoined(guest("p1")), &mut ());
        replica.apply(ServerMessage::UserJoined(guest("p2")), &mut ());
        replica.apply(ServerMessage::UserJoined(guest("p1")), &mut ());
        assert_eq!(replica.participants().len(), 2);

        replica.apply(
            ServerMessage::UserLeft {
                participant_id: ParticipantId::new("p1"),
            },
            &mut (),
        );
        assert_eq!(replica.participants(), &[guest("p2")]);

        replica.apply(ServerMessage::Pong { timestamp: 5 }, &mut ());
        assert_eq!(replica.participants().len(), 1);
    }
}
