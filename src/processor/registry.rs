//! Module providing the set of partition pumps run by one host.

use super::{
    checkpoint::CheckpointWriter,
    handler::EventHandler,
    pump::{PartitionPump, PumpState, ReceiveOptions},
    CloseReason, PartitionContext,
};
use crate::{
    store::OwnershipStore,
    stream::{EventPosition, StreamClient},
};
use std::{
    collections::{BTreeSet, HashMap},
    error::Error,
    fmt::Display,
    rc::Rc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, PartialEq, Eq)]
pub enum RegistryError {
    /// A pump for this partition already exists in this host.
    AlreadyActive(String),
}

impl Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::AlreadyActive(partition_id) => {
                write!(f, "Partition {:?} already has an active pump.", partition_id)
            }
        }
    }
}

impl Error for RegistryError {}

/// Owns every [`PartitionPump`] of a host, at most one per partition.
///
/// Dropping a pump from the registry releases the last strong reference to it and, with it, the
/// pump's stream consumer.
pub struct PumpRegistry<C, S> {
    client: Rc<C>,
    options: ReceiveOptions,
    pumps: HashMap<String, PartitionPump<C, S>>,
    cancellation: CancellationToken,
}

impl<C, S> PumpRegistry<C, S>
where
    C: StreamClient + 'static,
    S: OwnershipStore + 'static,
{
    pub fn new(client: Rc<C>, options: ReceiveOptions) -> Self {
        Self {
            client,
            options,
            pumps: HashMap::new(),
            cancellation: CancellationToken::new(),
        }
    }

    /// Creates and starts a pump for a partition that has none in this host.
    pub fn create_pump(
        &mut self,
        context: PartitionContext,
        start_position: EventPosition,
        handler: Box<dyn EventHandler>,
        checkpoint_writer: Rc<CheckpointWriter<S>>,
    ) -> Result<(), RegistryError> {
        if self.pumps.contains_key(&context.partition_id) {
            return Err(RegistryError::AlreadyActive(context.partition_id));
        }

        let mut pump = PartitionPump::new(
            start_position,
            self.options,
            self.client.clone(),
            checkpoint_writer,
            handler,
            self.cancellation.child_token(),
        );

        pump.start();

        self.pumps.insert(context.partition_id, pump);

        Ok(())
    }

    /// Stops and discards the pump of the given partition. No-op if there is none.
    pub async fn remove_pump(&mut self, partition_id: &str, reason: CloseReason) {
        match self.pumps.remove(partition_id) {
            Some(mut pump) => pump.stop(reason).await,
            None => debug!(partition_id, "no pump to remove"),
        }
    }

    /// Removes pumps that stopped on their own after a receive or handler error.
    ///
    /// Returns the ids of the removed partitions.
    pub async fn remove_stopped(&mut self) -> Vec<String> {
        let stopped = self
            .pumps
            .iter()
            .filter(|(_, pump)| pump.state() == PumpState::Stopped)
            .map(|(partition_id, _)| partition_id.clone())
            .collect::<Vec<_>>();

        for partition_id in &stopped {
            warn!(%partition_id, "removing failed partition pump");
            self.remove_pump(partition_id, CloseReason::PumpFailed).await;
        }

        stopped
    }

    /// Stops every pump of this host.
    pub async fn stop_all(&mut self, reason: CloseReason) {
        self.cancellation.cancel();

        let pumps = std::mem::take(&mut self.pumps);

        futures_util::future::join_all(pumps.into_values().map(|mut pump| async move {
            pump.stop(reason).await;
        }))
        .await;

        self.cancellation = CancellationToken::new();
    }

    /// Snapshot of the partitions that have a pump in this host.
    pub fn active_partition_ids(&self) -> BTreeSet<String> {
        self.pumps.keys().cloned().collect()
    }

    pub fn contains(&self, partition_id: &str) -> bool {
        self.pumps.contains_key(partition_id)
    }

    pub fn pump_state(&self, partition_id: &str) -> Option<PumpState> {
        self.pumps.get(partition_id).map(PartitionPump::state)
    }

    pub fn pump_start_position(&self, partition_id: &str) -> Option<EventPosition> {
        self.pumps
            .get(partition_id)
            .map(PartitionPump::start_position)
    }

    /// Checkpoint writers of all pumps, used to renew ownership.
    pub fn checkpoint_writers(&self) -> Vec<Rc<CheckpointWriter<S>>> {
        self.pumps
            .values()
            .map(|pump| pump.checkpoint_writer().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pumps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pumps.is_empty()
    }
}
