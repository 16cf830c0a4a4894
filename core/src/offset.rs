use std::collections::HashMap;
use std::collections::hash_map::Entry;

use serde::{Deserialize, Serialize};

/// A broker-assigned position of one record within a partition, used both to
/// identify the record and to acknowledge progress past it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Offset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl Offset {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }
}

/// A typed payload paired with the offset of the record it came from.
///
/// The offset is only acknowledged once the envelope has been fully handled;
/// a processing stage returns it to signal "done, safe to commit".
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub payload: T,
    pub offset: Offset,
}

/// A deserialized payload before type resolution: the raw JSON value plus the
/// type discriminator the producer attached to it.
#[derive(Debug, Clone)]
pub struct UntypedEnvelope {
    pub value: serde_json::Value,
    pub type_tag: String,
    pub offset: Offset,
}

/// Accumulates offsets pending commit, keeping only the highest per
/// partition. Committing the highest offset implicitly acknowledges all
/// lower ones on that partition.
#[derive(Debug, Default, Clone)]
pub struct OffsetBatch {
    high_water: HashMap<(String, i32), i64>,
    folded: usize,
}

impl OffsetBatch {
    /// Folds one offset into the batch. The per-partition high-water mark
    /// never decreases, regardless of arrival order.
    pub fn fold(&mut self, offset: Offset) {
        match self.high_water.entry((offset.topic, offset.partition)) {
            Entry::Occupied(mut entry) => {
                if offset.offset > *entry.get() {
                    entry.insert(offset.offset);
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(offset.offset);
            }
        }
        self.folded += 1;
    }

    /// Number of offsets folded in since the batch opened. This is what the
    /// batch-size trigger counts, not the number of distinct partitions.
    pub fn folded(&self) -> usize {
        self.folded
    }

    pub fn partition_count(&self) -> usize {
        self.high_water.len()
    }

    pub fn is_empty(&self) -> bool {
        self.high_water.is_empty()
    }

    /// Per-partition high-water marks, as (topic, partition, offset).
    pub fn partitions(&self) -> impl Iterator<Item = (&str, i32, i64)> {
        self.high_water
            .iter()
            .map(|((topic, partition), offset)| (topic.as_str(), *partition, *offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_keeps_highest_offset_per_partition() {
        let mut batch = OffsetBatch::default();
        batch.fold(Offset::new("events", 0, 5));
        batch.fold(Offset::new("events", 0, 9));
        batch.fold(Offset::new("events", 0, 7));
        batch.fold(Offset::new("events", 1, 2));

        assert_eq!(batch.folded(), 4);
        assert_eq!(batch.partition_count(), 2);

        let mut marks: Vec<_> = batch.partitions().collect();
        marks.sort();
        assert_eq!(marks, vec![("events", 0, 9), ("events", 1, 2)]);
    }

    #[test]
    fn test_batch_separates_topics() {
        let mut batch = OffsetBatch::default();
        batch.fold(Offset::new("orders", 0, 3));
        batch.fold(Offset::new("payments", 0, 11));

        assert_eq!(batch.partition_count(), 2);
    }

    #[test]
    fn test_empty_batch() {
        let batch = OffsetBatch::default();
        assert!(batch.is_empty());
        assert_eq!(batch.folded(), 0);
    }
}
