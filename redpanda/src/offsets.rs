//! Commit positions for deliveries settled out of order.
//!
//! Workers finish messages of one partition in any order, but Kafka only
//! stores a single position per partition: "everything before this offset is
//! done". The tracker keeps the offsets still held by the consumer and only
//! ever commits up to the lowest of them.

use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Default)]
struct PartitionOffsets {
    /// Offsets handed out and not yet acknowledged. Rejected offsets stay here.
    outstanding: BTreeSet<i64>,
    /// One past the highest offset handed out.
    next: Option<i64>,
    /// Last position known to the broker.
    committed: Option<i64>,
}

impl PartitionOffsets {
    fn track(&mut self, offset: i64) {
        if self.next.is_some_and(|next| offset < next) {
            // The partition was rewound (rebalance or seek): everything from
            // `offset` on is being delivered again.
            let _redelivered = self.outstanding.split_off(&offset);
            if self.committed.is_some_and(|committed| committed > offset) {
                self.committed = Some(offset);
            }
        }
        // The first offset seen is where the group's committed position stands.
        self.committed.get_or_insert(offset);
        self.outstanding.insert(offset);
        self.next = Some(offset + 1);
    }

    fn ack(&mut self, offset: i64) -> Option<i64> {
        if !self.outstanding.remove(&offset) {
            return None;
        }

        let position = self.outstanding.first().copied().or(self.next)?;
        if self.committed.is_some_and(|committed| committed >= position) {
            return None;
        }
        self.committed = Some(position);
        Some(position)
    }
}

/// Outstanding offsets per `(topic, partition)`.
#[derive(Debug, Default)]
pub(crate) struct OffsetTracker {
    partitions: HashMap<(String, i32), PartitionOffsets>,
}

impl OffsetTracker {
    /// Record that `offset` was handed to the subscriber.
    pub(crate) fn track(&mut self, topic: &str, partition: i32, offset: i64) {
        self.partitions
            .entry((topic.to_string(), partition))
            .or_default()
            .track(offset);
    }

    /// Record that `offset` was acknowledged.
    ///
    /// Returns the new commit position when it moved forward.
    pub(crate) fn ack(&mut self, topic: &str, partition: i32, offset: i64) -> Option<i64> {
        self.partitions
            .get_mut(&(topic.to_string(), partition))?
            .ack(offset)
    }

    /// Offsets handed out and not acknowledged, across all partitions.
    pub(crate) fn outstanding(&self) -> usize {
        self.partitions.values().map(|p| p.outstanding.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "order-created";

    fn tracker_with(offsets: &[i64]) -> OffsetTracker {
        let mut tracker = OffsetTracker::default();
        for offset in offsets {
            tracker.track(TOPIC, 0, *offset);
        }
        tracker
    }

    #[test]
    fn in_order_acks_advance_the_position() {
        let mut tracker = tracker_with(&[0, 1, 2]);

        assert_eq!(tracker.ack(TOPIC, 0, 0), Some(1));
        assert_eq!(tracker.ack(TOPIC, 0, 1), Some(2));
        assert_eq!(tracker.ack(TOPIC, 0, 2), Some(3));
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn out_of_order_ack_waits_for_the_lowest_offset() {
        let mut tracker = tracker_with(&[10, 11, 12]);

        assert_eq!(tracker.ack(TOPIC, 0, 12), None);
        assert_eq!(tracker.ack(TOPIC, 0, 11), None);
        assert_eq!(tracker.ack(TOPIC, 0, 10), Some(13));
    }

    #[test]
    fn rejected_offset_holds_the_position() {
        let mut tracker = tracker_with(&[0, 1, 2]);

        // Offset 1 is rejected: it is never acknowledged.
        assert_eq!(tracker.ack(TOPIC, 0, 0), Some(1));
        assert_eq!(tracker.ack(TOPIC, 0, 2), None);
        assert_eq!(tracker.outstanding(), 1);
    }

    #[test]
    fn partitions_are_independent() {
        let mut tracker = OffsetTracker::default();
        tracker.track(TOPIC, 0, 5);
        tracker.track(TOPIC, 1, 7);

        assert_eq!(tracker.ack(TOPIC, 1, 7), Some(8));
        assert_eq!(tracker.ack(TOPIC, 0, 5), Some(6));
    }

    #[test]
    fn unknown_or_repeated_acks_are_ignored() {
        let mut tracker = tracker_with(&[3]);

        assert_eq!(tracker.ack("other", 0, 3), None);
        assert_eq!(tracker.ack(TOPIC, 0, 4), None);
        assert_eq!(tracker.ack(TOPIC, 0, 3), Some(4));
        assert_eq!(tracker.ack(TOPIC, 0, 3), None);
    }

    #[test]
    fn rewind_forgets_offsets_that_will_be_redelivered() {
        let mut tracker = tracker_with(&[0, 1, 2, 3]);
        assert_eq!(tracker.ack(TOPIC, 0, 0), Some(1));

        // The broker hands out offset 1 again after a rebalance.
        tracker.track(TOPIC, 0, 1);
        assert_eq!(tracker.outstanding(), 1);

        // A late ack for the forgotten offset 3 changes nothing.
        assert_eq!(tracker.ack(TOPIC, 0, 3), None);
        assert_eq!(tracker.ack(TOPIC, 0, 1), Some(2));
    }
}
