//! Resume cursor and the ledger of confirmed progress.
//!
//! The cursor is a single message id that only ever moves forward in traversal
//! order. It is advanced to an id only once that message, and every message
//! dispatched before it, has a terminal outcome. Messages deferred to the upload
//! stage hold the cursor back until their upload reports.
//!
//! Terminal outcomes that land beyond the cursor (because an earlier message is
//! still uploading) are remembered as *settled*, so that a re-fetch after a flush
//! skips them rather than sending them twice.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::message::MessageId;

/// Traversal direction of the history walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Newest first
    Forward,
    /// Oldest first
    Reverse,
}

impl Direction {
    pub fn is_reverse(self) -> bool {
        matches!(self, Self::Reverse)
    }

    /// Maps an id onto a key that increases in traversal order.
    fn key(self, id: MessageId) -> i64 {
        match self {
            Self::Reverse => id as i64,
            Self::Forward => -(id as i64),
        }
    }

    /// Whether `id` lies at or before `mark` in traversal order.
    pub fn reached(self, id: MessageId, mark: MessageId) -> bool {
        self.key(id) <= self.key(mark)
    }

    fn id(self, key: i64) -> MessageId {
        match self {
            Self::Reverse => key as MessageId,
            Self::Forward => (-key) as MessageId,
        }
    }
}

/// The resume position of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub last_processed_id: MessageId,
    pub direction: Direction,
}

impl Cursor {
    pub fn new(last_processed_id: MessageId, direction: Direction) -> Self {
        Self {
            last_processed_id,
            direction,
        }
    }

    /// The `start_id` to hand to the history walker to continue right after
    /// `last_processed_id`.
    pub fn resume_id(&self) -> MessageId {
        match self.direction {
            Direction::Reverse => self.last_processed_id + 1,
            Direction::Forward => self.last_processed_id,
        }
    }
}

/// Tracks confirmed progress for one run. Owned by the dispatch stage.
#[derive(Debug)]
pub struct Ledger {
    direction: Direction,
    /// Caller-supplied starting offset, reported until something is confirmed
    start_id: MessageId,
    watermark: Option<i64>,
    /// Deferred ids whose upload has not reported yet
    in_flight: BTreeSet<i64>,
    /// Deferred ids whose staged work was flushed, awaiting re-dispatch
    requeued: BTreeSet<i64>,
    settled: BTreeSet<i64>,
}

impl Ledger {
    pub fn new(start_id: MessageId, direction: Direction) -> Self {
        // 0 means "nothing processed yet" in either direction
        let watermark = (start_id != 0).then(|| direction.key(start_id));

        Self {
            direction,
            start_id,
            watermark,
            in_flight: BTreeSet::new(),
            requeued: BTreeSet::new(),
            settled: BTreeSet::new(),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn last_processed_id(&self) -> MessageId {
        self.watermark
            .map(|key| self.direction.id(key))
            .unwrap_or(self.start_id)
    }

    pub fn cursor(&self) -> Cursor {
        Cursor::new(self.last_processed_id(), self.direction)
    }

    fn behind_watermark(&self, key: i64) -> bool {
        self.watermark.is_some_and(|wm| key <= wm)
    }

    /// Whether `id` already has a terminal outcome in this run.
    pub fn is_settled(&self, id: MessageId) -> bool {
        let key = self.direction.key(id);
        self.behind_watermark(key) || self.settled.contains(&key)
    }

    /// Whether `id` is staged or uploading right now.
    pub fn is_in_flight(&self, id: MessageId) -> bool {
        self.in_flight.contains(&self.direction.key(id))
    }

    pub fn has_in_flight(&self) -> bool {
        !self.in_flight.is_empty()
    }

    /// Records a terminal outcome (sent, skipped or failed) for `id`.
    pub fn settle(&mut self, id: MessageId) {
        let key = self.direction.key(id);
        self.in_flight.remove(&key);
        self.requeued.remove(&key);
        if !self.behind_watermark(key) {
            self.settled.insert(key);
        }
        self.advance();
    }

    /// Records that `id` was handed to the upload stage.
    pub fn defer(&mut self, id: MessageId) {
        let key = self.direction.key(id);
        self.requeued.remove(&key);
        if !self.behind_watermark(key) {
            self.in_flight.insert(key);
        }
    }

    /// Marks ids whose work was discarded by a flush as awaiting dispatch.
    ///
    /// They keep holding the cursor back until the re-fetch dispatches them again.
    /// Ids that already have a terminal outcome are left alone.
    pub fn abandon(&mut self, ids: impl IntoIterator<Item = MessageId>) {
        for id in ids {
            let key = self.direction.key(id);
            self.in_flight.remove(&key);
            if !self.behind_watermark(key) && !self.settled.contains(&key) {
                self.requeued.insert(key);
            }
        }
    }

    /// Records that the walk has reached `id`.
    ///
    /// Requeued ids that come before `id` in traversal order were not returned
    /// by the walk, so they no longer exist in the origin chat and stop holding
    /// the cursor back.
    pub fn pass(&mut self, id: MessageId) {
        let key = self.direction.key(id);
        let before = self.requeued.len();
        self.requeued = self.requeued.split_off(&key);

        if self.requeued.len() != before {
            self.advance();
        }
    }

    /// Releases every requeued id once a walk has reached the end of the history.
    pub fn release_requeued(&mut self) {
        if !self.requeued.is_empty() {
            self.requeued.clear();
            self.advance();
        }
    }

    fn advance(&mut self) {
        let blocker = match (self.in_flight.first(), self.requeued.first()) {
            (Some(a), Some(b)) => Some(*a.min(b)),
            (a, b) => a.or(b).copied(),
        };

        let next = match blocker {
            Some(blocker) => self.settled.range(..blocker).next_back().copied(),
            None => self.settled.last().copied(),
        };

        if let Some(key) = next {
            if !self.behind_watermark(key) {
                self.watermark = Some(key);
            }
            self.settled = self.settled.split_off(&(key + 1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resume_id() {
        assert_eq!(Cursor::new(0, Direction::Reverse).resume_id(), 1);
        assert_eq!(Cursor::new(41, Direction::Reverse).resume_id(), 42);
        assert_eq!(Cursor::new(0, Direction::Forward).resume_id(), 0);
        assert_eq!(Cursor::new(41, Direction::Forward).resume_id(), 41);
    }

    #[test]
    fn test_settle_advances_in_order() {
        let mut ledger = Ledger::new(0, Direction::Reverse);
        assert_eq!(ledger.last_processed_id(), 0);

        ledger.settle(1);
        ledger.settle(2);
        assert_eq!(ledger.last_processed_id(), 2);
        assert!(ledger.is_settled(1));
        assert!(!ledger.is_settled(3));
    }

    #[test]
    fn test_in_flight_holds_the_cursor_back() {
        let mut ledger = Ledger::new(10, Direction::Reverse);

        ledger.settle(11);
        ledger.defer(12);
        ledger.settle(13);
        ledger.settle(14);

        assert_eq!(ledger.last_processed_id(), 11);
        assert!(ledger.is_settled(13));
        assert!(ledger.is_in_flight(12));

        ledger.settle(12);
        assert_eq!(ledger.last_processed_id(), 14);
        assert!(!ledger.has_in_flight());
    }

    #[test]
    fn test_abandoned_ids_are_refetched_not_skipped() {
        let mut ledger = Ledger::new(0, Direction::Reverse);

        ledger.settle(1);
        ledger.defer(2);
        ledger.settle(3);
        ledger.abandon([2]);

        assert_eq!(ledger.last_processed_id(), 1);
        assert_eq!(ledger.cursor().resume_id(), 2);
        assert!(!ledger.is_in_flight(2));
        assert!(!ledger.has_in_flight());
        assert!(!ledger.is_settled(2));
        assert!(ledger.is_settled(3));

        ledger.defer(2);
        ledger.settle(2);
        assert_eq!(ledger.last_processed_id(), 3);
    }

    #[test]
    fn test_abandon_ignores_settled_ids() {
        let mut ledger = Ledger::new(0, Direction::Reverse);

        ledger.settle(1);
        ledger.abandon([1, 2]);
        ledger.settle(3);

        assert_eq!(ledger.last_processed_id(), 1);
        ledger.settle(2);
        assert_eq!(ledger.last_processed_id(), 3);
    }

    #[test]
    fn test_passing_a_missing_requeued_id_releases_the_cursor() {
        let mut ledger = Ledger::new(0, Direction::Reverse);

        ledger.settle(1);
        ledger.defer(2);
        ledger.defer(3);
        ledger.abandon([2, 3]);
        ledger.settle(4);
        assert_eq!(ledger.last_processed_id(), 1);

        // Re-walk returns 2, then 4: message 3 is gone
        ledger.pass(2);
        ledger.settle(2);
        assert_eq!(ledger.last_processed_id(), 2);

        ledger.pass(4);
        assert_eq!(ledger.last_processed_id(), 4);
    }

    #[test]
    fn test_release_requeued_at_end_of_history() {
        let mut ledger = Ledger::new(0, Direction::Forward);

        ledger.settle(9);
        ledger.defer(8);
        ledger.settle(7);
        ledger.abandon([8]);
        assert_eq!(ledger.last_processed_id(), 9);

        ledger.pass(9);
        assert_eq!(ledger.last_processed_id(), 9);

        ledger.release_requeued();
        assert_eq!(ledger.last_processed_id(), 7);
    }

    #[test]
    fn test_reached() {
        assert!(Direction::Reverse.reached(3, 5));
        assert!(!Direction::Reverse.reached(6, 5));
        assert!(Direction::Forward.reached(6, 5));
        assert!(Direction::Forward.reached(5, 5));
    }

    #[test]
    fn test_forward_direction() {
        let mut ledger = Ledger::new(0, Direction::Forward);

        ledger.settle(50);
        ledger.defer(49);
        ledger.settle(48);
        assert_eq!(ledger.last_processed_id(), 50);
        assert_eq!(ledger.cursor().resume_id(), 50);

        ledger.settle(49);
        assert_eq!(ledger.last_processed_id(), 48);
        assert!(ledger.is_settled(60));
        assert!(!ledger.is_settled(47));
    }

    #[test]
    fn test_cursor_never_moves_backwards() {
        let mut ledger = Ledger::new(20, Direction::Reverse);

        ledger.settle(5);
        ledger.defer(7);
        assert_eq!(ledger.last_processed_id(), 20);
        assert!(!ledger.is_in_flight(7));
    }
}
