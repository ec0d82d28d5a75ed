//! Module providing abstractions over a partitioned, append-only event stream.
//!
//! A [`StreamClient`] lists the partitions of a stream and opens a [`StreamConsumer`] on one
//! partition at a given [`EventPosition`]. Consumers yield batches of [`Event`] instances until
//! they are closed.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A single event read from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Position of this event within its partition, starting at 0.
    pub sequence_number: u64,
    /// Byte offset of this event within its partition.
    pub offset: u64,
    /// Time at which the stream accepted this event, in epoch milliseconds.
    pub enqueued_time_ms: u64,
    /// Opaque event payload.
    pub body: Bytes,
}

/// Position within a partition from which a consumer starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EventPosition {
    /// The first event still retained in the partition.
    #[default]
    Earliest,
    /// Only events enqueued after the consumer is opened.
    Latest,
    SequenceNumber { value: u64, inclusive: bool },
    Offset { value: u64, inclusive: bool },
}

impl EventPosition {
    /// Position of the event immediately following the event with the given sequence number.
    pub fn after_sequence_number(value: u64) -> Self {
        Self::SequenceNumber {
            value,
            inclusive: false,
        }
    }

    /// Position of the event immediately following the event at the given offset.
    pub fn after_offset(value: u64) -> Self {
        Self::Offset {
            value,
            inclusive: false,
        }
    }
}

/// A cancelable reader over one partition.
#[async_trait(?Send)]
pub trait StreamConsumer {
    /// Error type associated with this consumer.
    type Error: std::error::Error + 'static;

    /// Receives up to `max_count` events, waiting at most `max_wait_time` for the first one.
    ///
    /// Returns an empty batch when the wait elapses or when `cancellation` fires; implementations
    /// must return promptly on cancellation instead of waiting out `max_wait_time`.
    async fn receive_batch(
        &mut self,
        max_count: usize,
        max_wait_time: Duration,
        cancellation: &CancellationToken,
    ) -> Result<Vec<Event>, Self::Error>;

    /// Closes this consumer. Closing an already closed consumer is not an error.
    async fn close(&mut self) -> Result<(), Self::Error>;
}

/// Client for a partitioned event stream.
#[async_trait(?Send)]
pub trait StreamClient {
    /// Error type associated with this client and its consumers.
    type Error: std::error::Error + 'static;

    /// Consumer type opened by this client.
    type Consumer: StreamConsumer<Error = Self::Error> + 'static;

    /// Returns the ids of all partitions in the given stream.
    async fn partition_ids(&self, stream_id: &str) -> Result<Vec<String>, Self::Error>;

    /// Opens a consumer on the given partition, starting at `start_position`.
    async fn open_consumer(
        &self,
        stream_id: &str,
        consumer_group: &str,
        partition_id: &str,
        start_position: EventPosition,
    ) -> Result<Self::Consumer, Self::Error>;
}

pub mod in_memory;
