//! Per-room authoritative operation log.
//!
//! Operations are kept in commit order with an id index beside them:
//! ```text
//! entries: seq → Operation    (BTreeMap, ascending seq = commit order)
//! index:   OperationId → seq  (HashMap, one entry per live operation)
//! ```
//! Every id in `index` appears exactly once in `entries` and vice versa.
//! Once the log holds more than `max_operations`, the oldest entry is
//! evicted (strict FIFO, regardless of author).

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use crate::protocol::{Operation, OperationId};

/// Default cap on operations retained per room.
pub const DEFAULT_MAX_OPERATIONS: usize = 1000;

/// Ordered, size-capped log of committed operations.
#[derive(Debug)]
pub struct OperationLog {
    entries: BTreeMap<u64, Operation>,
    index: HashMap<OperationId, u64>,
    next_seq: u64,
    max_operations: usize,
    created_at: Instant,
    last_activity_at: Instant,
}

impl OperationLog {
    /// Create an empty log. A cap of zero is treated as one.
    pub fn new(max_operations: usize) -> Self {
        let now = Instant::now();
        Self {
            entries: BTreeMap::new(),
            index: HashMap::new(),
            next_seq: 0,
            max_operations: max_operations.max(1),
            created_at: now,
            last_activity_at: now,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_MAX_OPERATIONS)
    }

    /// Append at the tail, evicting the oldest entry if the cap is exceeded.
    ///
    /// An operation whose id is already present replaces the earlier entry,
    /// which is dropped from its old position first. Returns the evicted
    /// operation, if any.
    pub fn append(&mut self, operation: Operation) -> Option<Operation> {
        self.touch();

        if let Some(old_seq) = self.index.remove(&operation.id) {
            self.entries.remove(&old_seq);
            log::debug!("Operation {} re-appended, previous entry dropped", operation.id);
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(operation.id.clone(), seq);
        self.entries.insert(seq, operation);

        if self.entries.len() > self.max_operations {
            let (_, oldest) = self.entries.pop_first()?;
            self.index.remove(&oldest.id);
            return Some(oldest);
        }
        None
    }

    /// Remove by id. `None` means the id was never present or already evicted.
    pub fn remove(&mut self, id: &OperationId) -> Option<Operation> {
        self.touch();
        let seq = self.index.remove(id)?;
        self.entries.remove(&seq)
    }

    /// The full log in commit order.
    pub fn snapshot(&self) -> Vec<Operation> {
        self.entries.values().cloned().collect()
    }

    /// Operations created strictly after `timestamp` (client clock), in log order.
    pub fn since(&self, timestamp: u64) -> Vec<Operation> {
        self.entries
            .values()
            .filter(|op| op.created_at > timestamp)
            .cloned()
            .collect()
    }

    pub fn clear(&mut self) {
        self.touch();
        self.entries.clear();
        self.index.clear();
    }

    /// Record activity now.
    pub fn touch(&mut self) {
        self.last_activity_at = Instant::now();
    }

    pub fn get(&self, id: &OperationId) -> Option<&Operation> {
        self.index.get(id).and_then(|seq| self.entries.get(seq))
    }

    pub fn contains(&self, id: &OperationId) -> bool {
        self.index.contains_key(id)
    }

    /// Iterate in commit order.
    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_operations(&self) -> usize {
        self.max_operations
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_activity_at(&self) -> Instant {
        self.last_activity_at
    }

    /// Time since the last append/remove/clear, measured at `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity_at)
    }
}

impl Default for OperationLog {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Point, StrokeKind};

    fn op(id: &str) -> Operation {
        op_at(id, 0)
    }

    fn op_at(id: &str, created_at: u64) -> Operation {
        Operation {
            id: OperationId::new(id),
            kind: StrokeKind::Brush,
            color: "#000000".to_string(),
            stroke_width: 2.0,
            points: vec![Point::new(0.0, 0.0), Point::new(1.0, 1.0)],
            created_at,
            author_id: None,
        }
    }

    fn ids(log: &OperationLog) -> Vec<String> {
        log.iter().map(|op| op.id.to_string()).collect()
    }

    /// Index and entries mirror each other exactly.
    fn assert_consistent(log: &OperationLog) {
        assert_eq!(log.index.len(), log.entries.len());
        for (id, seq) in &log.index {
            assert_eq!(&log.entries[seq].id, id);
        }
    }

    #[test]
    fn test_append_preserves_commit_order() {
        let mut log = OperationLog::new(10);
        assert!(log.is_empty());

        log.append(op("a"));
        log.append(op("b"));
        log.append(op("c"));

        assert_eq!(ids(&log), ["a", "b", "c"]);
        assert_eq!(log.len(), 3);
        assert!(log.contains(&OperationId::new("b")));
        assert_consistent(&log);
    }

    #[test]
    fn test_eviction_drops_oldest() {
        let mut log = OperationLog::new(2);

        assert!(log.append(op("o1")).is_none());
        assert!(log.append(op("o2")).is_none());
        let evicted = log.append(op("o3")).unwrap();

        assert_eq!(evicted.id, OperationId::new("o1"));
        assert_eq!(ids(&log), ["o2", "o3"]);
        assert!(!log.contains(&OperationId::new("o1")));
        assert_consistent(&log);
    }

    #[test]
    fn test_length_never_exceeds_cap() {
        let mut log = OperationLog::new(5);
        for i in 0..50 {
            let evicted = log.append(op(&format!("op-{i}")));
            assert!(log.len() <= 5);
            if i >= 5 {
                // the earliest surviving entry goes first
                assert_eq!(evicted.unwrap().id, OperationId::new(format!("op-{}", i - 5)));
            }
            assert_consistent(&log);
        }
        assert_eq!(ids(&log), ["op-45", "op-46", "op-47", "op-48", "op-49"]);
    }

    #[test]
    fn test_zero_cap_keeps_one() {
        let mut log = OperationLog::new(0);
        log.append(op("a"));
        log.append(op("b"));
        assert_eq!(log.max_operations(), 1);
        assert_eq!(ids(&log), ["b"]);
    }

    #[test]
    fn test_remove_then_redo_lands_at_tail() {
        let mut log = OperationLog::new(10);
        log.append(op("a"));
        log.append(op("b"));
        log.append(op("c"));

        let removed = log.remove(&OperationId::new("a")).unwrap();
        assert_eq!(ids(&log), ["b", "c"]);

        log.append(removed);
        assert_eq!(ids(&log), ["b", "c", "a"]);
        assert_eq!(log.index.keys().filter(|id| id.as_str() == "a").count(), 1);
        assert_consistent(&log);
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let mut log = OperationLog::new(10);
        log.append(op("a"));
        log.append(op("b"));
        let before = log.snapshot();

        assert!(log.remove(&OperationId::new("zzz")).is_none());
        assert_eq!(log.snapshot(), before);

        // removing twice is the same as removing once
        assert!(log.remove(&OperationId::new("a")).is_some());
        assert!(log.remove(&OperationId::new("a")).is_none());
        assert_eq!(ids(&log), ["b"]);
        assert_consistent(&log);
    }

    #[test]
    fn test_remove_after_eviction_is_noop() {
        let mut log = OperationLog::new(1);
        log.append(op("a"));
        log.append(op("b"));
        assert!(log.remove(&OperationId::new("a")).is_none());
        assert_eq!(ids(&log), ["b"]);
    }

    #[test]
    fn test_duplicate_id_replaces_entry() {
        let mut log = OperationLog::new(10);
        log.append(op("a"));
        log.append(op("b"));

        let mut recolored = op("a");
        recolored.color = "#ffffff".to_string();
        assert!(log.append(recolored).is_none());

        assert_eq!(ids(&log), ["b", "a"]);
        assert_eq!(log.get(&OperationId::new("a")).unwrap().color, "#ffffff");
        assert_consistent(&log);
    }

    #[test]
    fn test_since_filters_strictly_after() {
        let mut log = OperationLog::new(10);
        log.append(op_at("a", 100));
        log.append(op_at("b", 300));
        log.append(op_at("c", 200));

        let later: Vec<_> = log.since(200).into_iter().map(|op| op.id).collect();
        assert_eq!(later, vec![OperationId::new("b")]);

        let all: Vec<_> = log.since(0).into_iter().map(|op| op.id.to_string()).collect();
        assert_eq!(all, ["a", "b", "c"]);
    }

    #[test]
    fn test_clear_empties_both_structures() {
        let mut log = OperationLog::new(10);
        log.append(op("a"));
        log.append(op("b"));
        log.clear();

        assert!(log.is_empty());
        assert!(log.snapshot().is_empty());
        assert!(log.get(&OperationId::new("a")).is_none());
        assert_consistent(&log);

        log.append(op("a"));
        assert_eq!(ids(&log), ["a"]);
    }

    #[test]
    fn test_mutations_touch_activity() {
        let mut log = OperationLog::new(10);
        let created = log.last_activity_at();
        std::thread::sleep(Duration::from_millis(5));

        log.remove(&OperationId::new("missing"));
        assert!(log.last_activity_at() > created);
        assert!(log.idle_for(log.last_activity_at()).is_zero());
        assert!(log.created_at() <= log.last_activity_at());
    }
}
