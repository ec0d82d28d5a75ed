#![allow(dead_code)]

use async_trait::async_trait;
use eventhost::{
    common::time::ManualClock,
    prelude::*,
    store::in_memory::InMemoryOwnershipStore,
    stream::in_memory::{InMemoryConsumer, InMemoryStream, InMemoryStreamError},
};
use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    error::Error,
    fmt::Display,
    rc::Rc,
    time::Duration,
};
use tokio_util::sync::CancellationToken;

pub const STREAM_ID: &str = "some_stream";
pub const CONSUMER_GROUP: &str = "$Default";
pub const START_MILLIS: u64 = 1_700_000_000_000;

pub fn host_config(owner_id: &str) -> ProcessorConfig {
    ProcessorConfig {
        owner_id: owner_id.into(),
        max_wait_time: Duration::from_millis(10),
        load_balance_interval: Duration::from_millis(20),
        pump_stop_timeout: Duration::from_millis(100),
        ..ProcessorConfig::for_stream(STREAM_ID)
    }
}

pub async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[derive(Debug, Default)]
pub struct Observed {
    pub sequence_numbers: Vec<u64>,
    pub errors: Vec<String>,
    pub close_reasons: Vec<CloseReason>,
}

/// Observations of every handler created by a factory, keyed by partition id.
pub type Observations = Rc<RefCell<HashMap<String, Observed>>>;

/// Handler recording what it sees and checkpointing after every batch.
pub struct RecordingHandler {
    observations: Observations,
}

#[async_trait(?Send)]
impl EventHandler for RecordingHandler {
    async fn process_events(
        &mut self,
        context: &PartitionContext,
        events: &[Event],
        checkpointer: &dyn Checkpointer,
    ) -> Result<(), HandlerError> {
        self.observations
            .borrow_mut()
            .entry(context.partition_id.clone())
            .or_default()
            .sequence_numbers
            .extend(events.iter().map(|x| x.sequence_number));

        if let Some(last) = events.last() {
            checkpointer.checkpoint(last.into()).await?;
        }

        Ok(())
    }

    async fn process_error(&mut self, context: &PartitionContext, error: &(dyn Error + 'static)) {
        self.observations
            .borrow_mut()
            .entry(context.partition_id.clone())
            .or_default()
            .errors
            .push(error.to_string());
    }

    async fn close(&mut self, context: &PartitionContext, reason: CloseReason) {
        self.observations
            .borrow_mut()
            .entry(context.partition_id.clone())
            .or_default()
            .close_reasons
            .push(reason);
    }
}

pub fn recording_factory(
    observations: &Observations,
) -> impl Fn(&PartitionContext) -> Box<dyn EventHandler> {
    let observations = observations.clone();

    move |_context: &PartitionContext| -> Box<dyn EventHandler> {
        Box::new(RecordingHandler {
            observations: observations.clone(),
        })
    }
}

pub fn sequence_numbers(observations: &Observations, partition_id: &str) -> Vec<u64> {
    observations
        .borrow()
        .get(partition_id)
        .map(|x| x.sequence_numbers.clone())
        .unwrap_or_default()
}

/// Which [`TestStore`] operations currently fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFault {
    Healthy,
    /// Claims and checkpoint updates fail, listing still works.
    Writes,
    All,
}

#[derive(Debug)]
pub struct StoreUnavailable;

impl Display for StoreUnavailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ownership store unavailable")
    }
}

impl Error for StoreUnavailable {}

/// [`OwnershipStore`] wrapper recording every submitted claim.
///
/// Optionally yields after reading the ownership list, letting concurrently running hosts all
/// observe the same snapshot before any of them claims. Failures are switched on and off with
/// [`TestStore::set_fault`], shared by every clone.
#[derive(Clone)]
pub struct TestStore {
    pub inner: InMemoryOwnershipStore,
    pub claims: Rc<RefCell<Vec<PartitionOwnership>>>,
    yield_after_list: bool,
    fault: Rc<Cell<StoreFault>>,
}

impl TestStore {
    pub fn new(clock: &ManualClock) -> Self {
        Self {
            inner: InMemoryOwnershipStore::with_time_source(clock.clone()),
            claims: Rc::new(RefCell::new(Vec::new())),
            yield_after_list: false,
            fault: Rc::new(Cell::new(StoreFault::Healthy)),
        }
    }

    pub fn set_fault(&self, fault: StoreFault) {
        self.fault.set(fault);
    }

    fn check_reads(&self) -> Result<(), StoreUnavailable> {
        match self.fault.get() {
            StoreFault::All => Err(StoreUnavailable),
            _ => Ok(()),
        }
    }

    fn check_writes(&self) -> Result<(), StoreUnavailable> {
        match self.fault.get() {
            StoreFault::Healthy => Ok(()),
            _ => Err(StoreUnavailable),
        }
    }

    pub fn yielding(clock: &ManualClock) -> Self {
        Self {
            yield_after_list: true,
            ..Self::new(clock)
        }
    }

    pub fn owner_of(&self, partition_id: &str) -> Option<String> {
        self.inner
            .get(STREAM_ID, CONSUMER_GROUP, partition_id)
            .map(|x| x.owner_id)
    }

    pub fn claimed_partition_ids(&self) -> Vec<String> {
        self.claims
            .borrow()
            .iter()
            .map(|x| x.partition_id.clone())
            .collect()
    }
}

#[async_trait(?Send)]
impl OwnershipStore for TestStore {
    type Error = StoreUnavailable;

    async fn list_ownership(
        &self,
        stream_id: &str,
        consumer_group: &str,
    ) -> Result<Vec<PartitionOwnership>, Self::Error> {
        self.check_reads()?;

        let ownerships = self
            .inner
            .list_ownership(stream_id, consumer_group)
            .await
            .map_err(|never| match never {})?;

        if self.yield_after_list {
            tokio::task::yield_now().await;
        }

        Ok(ownerships)
    }

    async fn claim_ownership(
        &self,
        ownerships: Vec<PartitionOwnership>,
    ) -> Result<Vec<PartitionOwnership>, Self::Error> {
        self.check_writes()?;

        self.claims.borrow_mut().extend(ownerships.iter().cloned());
        self.inner
            .claim_ownership(ownerships)
            .await
            .map_err(|never| match never {})
    }

    async fn update_checkpoint(
        &self,
        ownership: PartitionOwnership,
    ) -> Result<Option<PartitionOwnership>, Self::Error> {
        self.check_writes()?;

        self.inner
            .update_checkpoint(ownership)
            .await
            .map_err(|never| match never {})
    }
}

#[derive(Debug)]
pub enum FlakyStreamError {
    Stream(InMemoryStreamError),
    Injected { partition_id: String },
}

impl Display for FlakyStreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlakyStreamError::Stream(err) => write!(f, "{}", err),
            FlakyStreamError::Injected { partition_id } => {
                write!(f, "injected receive failure on partition {}", partition_id)
            }
        }
    }
}

impl Error for FlakyStreamError {}

/// [`StreamClient`] over an [`InMemoryStream`] whose first consumer opened on `failing_partition`
/// fails on its second `receive_batch` call.
#[derive(Clone)]
pub struct FlakyStream {
    pub inner: InMemoryStream,
    failing_partition: String,
    armed: Rc<Cell<bool>>,
}

impl FlakyStream {
    pub fn new(inner: InMemoryStream, failing_partition: &str) -> Self {
        Self {
            inner,
            failing_partition: failing_partition.into(),
            armed: Rc::new(Cell::new(true)),
        }
    }
}

pub struct FlakyConsumer {
    inner: InMemoryConsumer,
    partition_id: String,
    fail_on_call: Option<usize>,
    calls: usize,
}

#[async_trait(?Send)]
impl StreamConsumer for FlakyConsumer {
    type Error = FlakyStreamError;

    async fn receive_batch(
        &mut self,
        max_count: usize,
        max_wait_time: Duration,
        cancellation: &CancellationToken,
    ) -> Result<Vec<Event>, Self::Error> {
        self.calls += 1;

        if self.fail_on_call == Some(self.calls) {
            return Err(FlakyStreamError::Injected {
                partition_id: self.partition_id.clone(),
            });
        }

        self.inner
            .receive_batch(max_count, max_wait_time, cancellation)
            .await
            .map_err(FlakyStreamError::Stream)
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.inner.close().await.map_err(FlakyStreamError::Stream)
    }
}

#[async_trait(?Send)]
impl StreamClient for FlakyStream {
    type Error = FlakyStreamError;

    type Consumer = FlakyConsumer;

    async fn partition_ids(&self, stream_id: &str) -> Result<Vec<String>, Self::Error> {
        self.inner
            .partition_ids(stream_id)
            .await
            .map_err(FlakyStreamError::Stream)
    }

    async fn open_consumer(
        &self,
        stream_id: &str,
        consumer_group: &str,
        partition_id: &str,
        start_position: EventPosition,
    ) -> Result<Self::Consumer, Self::Error> {
        let inner = self
            .inner
            .open_consumer(stream_id, consumer_group, partition_id, start_position)
            .await
            .map_err(FlakyStreamError::Stream)?;

        let fail_on_call = if partition_id == self.failing_partition && self.armed.replace(false) {
            Some(2)
        } else {
            None
        };

        Ok(FlakyConsumer {
            inner,
            partition_id: partition_id.into(),
            fail_on_call,
            calls: 0,
        })
    }
}
