//! In-memory [`StreamClient`] implementation.
//!
//! Useful for tests, benchmarks and demos. Every consumer opened through an [`InMemoryStream`] is
//! recorded along with its start position.

use super::{Event, EventPosition, StreamClient, StreamConsumer};
use crate::common::time::{SystemClock, TimeSource};
use async_trait::async_trait;
use bytes::Bytes;
use std::{cell::RefCell, error::Error, fmt::Display, rc::Rc, time::Duration};
use tokio::{sync::Notify, time::Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, PartialEq, Eq)]
pub enum InMemoryStreamError {
    StreamNotFound(String),
    PartitionNotFound(String),
    ConsumerClosed,
}

impl Display for InMemoryStreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InMemoryStreamError::StreamNotFound(stream_id) => {
                write!(f, "Stream with id {:?} not found.", stream_id)
            }
            InMemoryStreamError::PartitionNotFound(partition_id) => {
                write!(f, "Partition with id {:?} not found.", partition_id)
            }
            InMemoryStreamError::ConsumerClosed => write!(f, "Consumer already closed."),
        }
    }
}

impl Error for InMemoryStreamError {}

/// A consumer opening recorded by an [`InMemoryStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedConsumer {
    pub consumer_group: String,
    pub partition_id: String,
    pub start_position: EventPosition,
}

struct PartitionLog {
    partition_id: String,
    events: Vec<Event>,
    size: u64,
}

struct StreamState {
    stream_id: String,
    partitions: RefCell<Vec<PartitionLog>>,
    opened: RefCell<Vec<OpenedConsumer>>,
    appended: Notify,
}

impl StreamState {
    fn with_partition<T, F>(&self, partition_id: &str, f: F) -> Result<T, InMemoryStreamError>
    where
        F: FnOnce(&mut PartitionLog) -> T,
    {
        self.partitions
            .borrow_mut()
            .iter_mut()
            .find(|partition| partition.partition_id == partition_id)
            .map(f)
            .ok_or_else(|| InMemoryStreamError::PartitionNotFound(partition_id.into()))
    }
}

/// An in-memory stream with partitions `"0"` to `"{partition_count - 1}"`.
///
/// Clones share the same underlying partitions.
#[derive(Clone)]
pub struct InMemoryStream {
    state: Rc<StreamState>,
}

impl InMemoryStream {
    pub fn new(stream_id: &str, partition_count: usize) -> Self {
        let partitions = (0..partition_count)
            .map(|partition_number| PartitionLog {
                partition_id: partition_number.to_string(),
                events: Vec::new(),
                size: 0,
            })
            .collect();

        Self {
            state: Rc::new(StreamState {
                stream_id: stream_id.into(),
                partitions: RefCell::new(partitions),
                opened: RefCell::new(Vec::new()),
                appended: Notify::new(),
            }),
        }
    }

    /// Appends an event with the given body to a partition, returning its sequence number.
    pub fn append<B: Into<Bytes>>(
        &self,
        partition_id: &str,
        body: B,
    ) -> Result<u64, InMemoryStreamError> {
        let body = body.into();

        let sequence_number = self.state.with_partition(partition_id, |partition| {
            let sequence_number = partition.events.len() as u64;
            let offset = partition.size;

            partition.size += body.len() as u64;
            partition.events.push(Event {
                sequence_number,
                offset,
                enqueued_time_ms: SystemClock.current_millis(),
                body,
            });

            sequence_number
        })?;

        self.state.appended.notify_waiters();

        Ok(sequence_number)
    }

    /// Returns every consumer opening recorded so far, in order.
    pub fn opened_consumers(&self) -> Vec<OpenedConsumer> {
        self.state.opened.borrow().clone()
    }

    fn start_index(partition: &PartitionLog, start_position: EventPosition) -> usize {
        let events = &partition.events;

        match start_position {
            EventPosition::Earliest => 0,
            EventPosition::Latest => events.len(),
            EventPosition::SequenceNumber { value, inclusive } => events
                .iter()
                .position(|event| {
                    event.sequence_number > value || (inclusive && event.sequence_number == value)
                })
                .unwrap_or(events.len()),
            EventPosition::Offset { value, inclusive } => events
                .iter()
                .position(|event| event.offset > value || (inclusive && event.offset == value))
                .unwrap_or(events.len()),
        }
    }
}

#[async_trait(?Send)]
impl StreamClient for InMemoryStream {
    type Error = InMemoryStreamError;

    type Consumer = InMemoryConsumer;

    async fn partition_ids(&self, stream_id: &str) -> Result<Vec<String>, Self::Error> {
        if stream_id != self.state.stream_id {
            return Err(InMemoryStreamError::StreamNotFound(stream_id.into()));
        }

        Ok(self
            .state
            .partitions
            .borrow()
            .iter()
            .map(|partition| partition.partition_id.clone())
            .collect())
    }

    async fn open_consumer(
        &self,
        stream_id: &str,
        consumer_group: &str,
        partition_id: &str,
        start_position: EventPosition,
    ) -> Result<Self::Consumer, Self::Error> {
        if stream_id != self.state.stream_id {
            return Err(InMemoryStreamError::StreamNotFound(stream_id.into()));
        }

        let next_index = self.state.with_partition(partition_id, |partition| {
            Self::start_index(partition, start_position)
        })?;

        self.state.opened.borrow_mut().push(OpenedConsumer {
            consumer_group: consumer_group.into(),
            partition_id: partition_id.into(),
            start_position,
        });

        Ok(InMemoryConsumer {
            state: self.state.clone(),
            partition_id: partition_id.into(),
            next_index,
            closed: false,
        })
    }
}

/// Consumer over one partition of an [`InMemoryStream`].
pub struct InMemoryConsumer {
    state: Rc<StreamState>,
    partition_id: String,
    next_index: usize,
    closed: bool,
}

impl InMemoryConsumer {
    fn take_available(&mut self, max_count: usize) -> Result<Vec<Event>, InMemoryStreamError> {
        let next_index = self.next_index;

        let batch = self.state.with_partition(&self.partition_id, |partition| {
            partition
                .events
                .iter()
                .skip(next_index)
                .take(max_count)
                .cloned()
                .collect::<Vec<_>>()
        })?;

        self.next_index += batch.len();

        Ok(batch)
    }
}

#[async_trait(?Send)]
impl StreamConsumer for InMemoryConsumer {
    type Error = InMemoryStreamError;

    async fn receive_batch(
        &mut self,
        max_count: usize,
        max_wait_time: Duration,
        cancellation: &CancellationToken,
    ) -> Result<Vec<Event>, Self::Error> {
        if self.closed {
            return Err(InMemoryStreamError::ConsumerClosed);
        }

        let deadline = Instant::now() + max_wait_time;
        let state = self.state.clone();

        loop {
            // registered before reading so that an append in between is not missed
            let appended = state.appended.notified();

            let batch = self.take_available(max_count)?;

            if !batch.is_empty() {
                return Ok(batch);
            }

            tokio::select! {
                _ = cancellation.cancelled() => return Ok(Vec::new()),
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
                _ = appended => {}
            }
        }
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.closed = true;
        Ok(())
    }
}
