//! Module providing the ownership and checkpoint store abstraction.
//!
//! The store is the only resource shared between hosts. It is never locked explicitly: every write
//! is conditional on the eTag last read by the writer, so concurrent claims of the same partition
//! resolve with exactly one winner.

use super::stream::{Event, EventPosition};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Ownership record for one partition of one consumer group, as last written to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionOwnership {
    /// Identifier of the owning host. Empty once the owner relinquished the partition.
    pub owner_id: String,
    pub partition_id: String,
    pub consumer_group: String,
    pub stream_id: String,

    /// Sequence number of the last checkpointed event.
    pub sequence_number: Option<u64>,
    /// Offset of the last checkpointed event.
    pub offset: Option<u64>,

    /// Version tag for optimistic-concurrency writes, assigned by the store.
    pub etag: Option<String>,
    /// Epoch of ownership. Incremented whenever a different host takes the partition over.
    pub owner_level: u64,
    /// Time of the last successful write, in epoch milliseconds, assigned by the store.
    pub last_modified_time_ms: u64,
}

impl PartitionOwnership {
    /// Creates a record for a partition that has never been owned.
    pub fn new(owner_id: &str, stream_id: &str, consumer_group: &str, partition_id: &str) -> Self {
        Self {
            owner_id: owner_id.into(),
            partition_id: partition_id.into(),
            consumer_group: consumer_group.into(),
            stream_id: stream_id.into(),
            sequence_number: None,
            offset: None,
            etag: None,
            owner_level: 0,
            last_modified_time_ms: 0,
        }
    }

    /// Whether the last owner gave this partition up on shutdown.
    pub fn is_relinquished(&self) -> bool {
        self.owner_id.is_empty()
    }

    /// Whether this record is owned and was written less than `inactive_time_limit` before `now_ms`.
    pub fn is_active(&self, now_ms: u64, inactive_time_limit: Duration) -> bool {
        !self.is_relinquished()
            && now_ms.saturating_sub(self.last_modified_time_ms)
                < inactive_time_limit.as_millis() as u64
    }

    /// Returns the checkpointed position, if any.
    pub fn checkpoint_position(&self) -> Option<CheckpointPosition> {
        match (self.sequence_number, self.offset) {
            (None, None) => None,
            (sequence_number, offset) => Some(CheckpointPosition {
                sequence_number,
                offset,
            }),
        }
    }

    /// Position right after the checkpoint, preferring the sequence number over the offset.
    pub fn resume_position(&self) -> Option<EventPosition> {
        self.sequence_number
            .map(EventPosition::after_sequence_number)
            .or_else(|| self.offset.map(EventPosition::after_offset))
    }
}

/// A read position to record as processing progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointPosition {
    pub sequence_number: Option<u64>,
    pub offset: Option<u64>,
}

impl From<&Event> for CheckpointPosition {
    fn from(event: &Event) -> Self {
        Self {
            sequence_number: Some(event.sequence_number),
            offset: Some(event.offset),
        }
    }
}

/// Key-value store of [`PartitionOwnership`] records keyed by
/// `(stream_id, consumer_group, partition_id)`, with eTag-conditional writes.
#[async_trait(?Send)]
pub trait OwnershipStore {
    /// Error type associated with this store. Rejected conditional writes are not errors.
    type Error: std::error::Error + 'static;

    /// Returns all ownership records of the given consumer group over the given stream.
    async fn list_ownership(
        &self,
        stream_id: &str,
        consumer_group: &str,
    ) -> Result<Vec<PartitionOwnership>, Self::Error>;

    /// Attempts to write each of the given records.
    ///
    /// A record is written only if its `etag` matches the stored record's eTag, or if it carries
    /// no eTag and no record exists yet for its key. Returns the accepted records with their new
    /// eTag and modification time; rejected records are omitted.
    async fn claim_ownership(
        &self,
        ownerships: Vec<PartitionOwnership>,
    ) -> Result<Vec<PartitionOwnership>, Self::Error>;

    /// Writes a new checkpoint position for a partition.
    ///
    /// Succeeds only if the stored record's eTag matches and it is still owned by
    /// `ownership.owner_id`. Returns the updated record, or `None` if the write was rejected.
    async fn update_checkpoint(
        &self,
        ownership: PartitionOwnership,
    ) -> Result<Option<PartitionOwnership>, Self::Error>;
}

pub mod in_memory;
