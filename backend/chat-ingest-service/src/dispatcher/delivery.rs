//! Redelivery bookkeeping for one consumer
//!
//! Counts deliveries per (topic, partition, offset) and remembers partitions
//! rewound by a nack, so records fetched ahead of the rewind are skipped
//! until the rewound offset comes back.

use std::collections::HashMap;

use tracing::debug;

/// Attempt entries for records never acked here (e.g. partition moved to
/// another worker) are dropped past this size
const MAX_TRACKED_ATTEMPTS: usize = 10_000;

type PartitionKey = (String, i32);

#[derive(Debug)]
pub struct DeliveryTracker {
    attempts: HashMap<(String, i32, i64), u32>,
    /// Rewound partitions, with the offset expected next
    rewound: HashMap<PartitionKey, i64>,
    max_tracked: usize,
}

impl Default for DeliveryTracker {
    fn default() -> Self {
        Self::with_limit(MAX_TRACKED_ATTEMPTS)
    }
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_tracked: usize) -> Self {
        Self {
            attempts: HashMap::new(),
            rewound: HashMap::new(),
            max_tracked,
        }
    }

    /// Delivery attempt of this record, 1 on first sight
    pub fn next_attempt(&mut self, topic: &str, partition: i32, offset: i64) -> u32 {
        if self.attempts.len() >= self.max_tracked {
            debug!(entries = self.attempts.len(), "Resetting delivery attempt tracker");
            self.attempts.clear();
        }

        let attempt = self
            .attempts
            .entry((topic.to_string(), partition, offset))
            .or_insert(0);
        *attempt += 1;
        *attempt
    }

    pub fn on_ack(&mut self, topic: &str, partition: i32, offset: i64) {
        self.attempts.remove(&(topic.to_string(), partition, offset));
    }

    /// The partition was sought back to `offset`
    pub fn on_nack(&mut self, topic: &str, partition: i32, offset: i64) {
        self.rewound.insert((topic.to_string(), partition), offset);
    }

    /// Rewound offset to return to when the record lies past a pending
    /// rewind on its partition, `None` when the record can be delivered.
    ///
    /// Reaching the rewound offset (or an earlier one) ends the rewind.
    pub fn stale_rewind(&mut self, topic: &str, partition: i32, offset: i64) -> Option<i64> {
        let key = (topic.to_string(), partition);
        let expected = *self.rewound.get(&key)?;

        if offset <= expected {
            self.rewound.remove(&key);
            return None;
        }
        Some(expected)
    }

    /// Drop a pending rewind that can no longer be honoured
    pub fn clear_rewind(&mut self, topic: &str, partition: i32) {
        self.rewound.remove(&(topic.to_string(), partition));
    }

    pub fn tracked(&self) -> usize {
        self.attempts.len()
    }
}
