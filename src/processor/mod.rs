//! Module providing the event processor host: load balancing passes and the pumps they start.
//!
//! An [`EventProcessor`] runs on a single thread inside a [`LocalSet`]. Every
//! `load_balance_interval` it renews the ownership of the partitions it pumps, reads the shared
//! ownership state and claims at most one more partition, starting a
//! [`PartitionPump`](pump::PartitionPump) for every partition it successfully claims.

use crate::{
    common::{
        rand::{RandSource, ThreadRandom},
        time::{SystemClock, TimeSource},
    },
    store::{OwnershipStore, PartitionOwnership},
    stream::StreamClient,
};
use balancer::{ClaimTarget, PartitionLoadBalancer};
use checkpoint::{CheckpointError, CheckpointWriter};
use config::{ConfigError, ProcessorConfig};
use handler::EventHandlerFactory;
use pump::ReceiveOptions;
use registry::PumpRegistry;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, error::Error, fmt::Display, io, rc::Rc, thread::JoinHandle};
use tokio::task::LocalSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Identifies the partition a handler or pump is working on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionContext {
    pub consumer_group: String,
    pub stream_id: String,
    pub partition_id: String,
}

impl From<&PartitionOwnership> for PartitionContext {
    fn from(ownership: &PartitionOwnership) -> Self {
        Self {
            consumer_group: ownership.consumer_group.clone(),
            stream_id: ownership.stream_id.clone(),
            partition_id: ownership.partition_id.clone(),
        }
    }
}

/// Why a pump was stopped, as reported to [`handler::EventHandler::close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The processor is shutting down.
    Shutdown,
    /// Another host claimed the partition.
    OwnershipLost,
    /// The pump stopped after a receive or handler error.
    PumpFailed,
}

/// Errors that prevent a processor from starting.
#[derive(Debug)]
pub enum ProcessorError<CE> {
    Config(ConfigError),
    StreamClient(CE),
    NoPartitions { stream_id: String },
}

impl<CE: Display> Display for ProcessorError<CE> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessorError::Config(err) => write!(f, "Invalid configuration: {}", err),
            ProcessorError::StreamClient(err) => write!(f, "Stream client error: {}", err),
            ProcessorError::NoPartitions { stream_id } => {
                write!(f, "Stream {:?} has no partitions.", stream_id)
            }
        }
    }
}

impl<CE: Error + 'static> Error for ProcessorError<CE> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ProcessorError::Config(err) => Some(err),
            ProcessorError::StreamClient(err) => Some(err),
            ProcessorError::NoPartitions { .. } => None,
        }
    }
}

/// Failure of a single load balancing pass. The next pass starts over from a fresh snapshot.
#[derive(Debug)]
pub enum IterationError<SE, CE> {
    Store(SE),
    StreamClient(CE),
}

impl<SE: Display, CE: Display> Display for IterationError<SE, CE> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IterationError::Store(err) => write!(f, "Ownership store error: {}", err),
            IterationError::StreamClient(err) => write!(f, "Stream client error: {}", err),
        }
    }
}

impl<SE, CE> Error for IterationError<SE, CE>
where
    SE: Error + 'static,
    CE: Error + 'static,
{
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            IterationError::Store(err) => Some(err),
            IterationError::StreamClient(err) => Some(err),
        }
    }
}

/// One host of a consumer group.
pub struct EventProcessor<C, S, F> {
    config: ProcessorConfig,

    client: Rc<C>,
    store: Rc<S>,
    handler_factory: F,

    balancer: PartitionLoadBalancer,
    registry: PumpRegistry<C, S>,
}

impl<C, S, F> EventProcessor<C, S, F>
where
    C: StreamClient + 'static,
    S: OwnershipStore + 'static,
    F: EventHandlerFactory,
{
    pub fn new(config: ProcessorConfig, client: Rc<C>, store: Rc<S>, handler_factory: F) -> Self {
        let balancer = PartitionLoadBalancer::new(
            &config.owner_id,
            &config.stream_id,
            &config.consumer_group,
            config.inactive_time_limit,
            Rc::new(ThreadRandom),
            Rc::new(SystemClock),
        );

        let registry = PumpRegistry::new(
            client.clone(),
            ReceiveOptions {
                max_batch_size: config.max_batch_size,
                max_wait_time: config.max_wait_time,
                stop_timeout: config.pump_stop_timeout,
            },
        );

        Self {
            config,
            client,
            store,
            handler_factory,
            balancer,
            registry,
        }
    }

    pub fn with_rand_source<R: RandSource + 'static>(mut self, rand: R) -> Self {
        self.balancer.set_rand_source(Rc::new(rand));
        self
    }

    pub fn with_time_source<T: TimeSource + 'static>(mut self, clock: T) -> Self {
        self.balancer.set_time_source(Rc::new(clock));
        self
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn owner_id(&self) -> &str {
        &self.config.owner_id
    }

    pub fn registry(&self) -> &PumpRegistry<C, S> {
        &self.registry
    }

    /// Partitions this host is currently pumping.
    pub fn active_partition_ids(&self) -> BTreeSet<String> {
        self.registry.active_partition_ids()
    }

    /// Runs load balancing passes until `cancellation` fires, then stops every pump and
    /// relinquishes its partition.
    ///
    /// Only fails before the first pass, on invalid configuration or a stream without partitions.
    /// Store and stream failures during a pass are logged and retried on the next pass.
    #[instrument(skip_all, fields(owner_id = %self.config.owner_id, stream_id = %self.config.stream_id))]
    pub async fn run(
        &mut self,
        cancellation: CancellationToken,
    ) -> Result<(), ProcessorError<C::Error>> {
        self.config.validate().map_err(ProcessorError::Config)?;

        let partition_ids = self
            .client
            .partition_ids(&self.config.stream_id)
            .await
            .map_err(ProcessorError::StreamClient)?;

        if partition_ids.is_empty() {
            return Err(ProcessorError::NoPartitions {
                stream_id: self.config.stream_id.clone(),
            });
        }

        info!(
            partition_count = partition_ids.len(),
            consumer_group = %self.config.consumer_group,
            "event processor started"
        );

        while !cancellation.is_cancelled() {
            if let Err(iteration_error) = self.run_iteration().await {
                warn!(%iteration_error, "load balancing pass failed");
            }

            tokio::select! {
                biased;
                _ = cancellation.cancelled() => break,
                _ = tokio::time::sleep(self.config.load_balance_interval) => {}
            }
        }

        self.shutdown().await;

        info!("event processor stopped");

        Ok(())
    }

    /// Executes one load balancing pass.
    #[instrument(skip(self), fields(owner_id = %self.config.owner_id))]
    pub async fn run_iteration(&mut self) -> Result<(), IterationError<S::Error, C::Error>> {
        self.registry.remove_stopped().await;

        self.renew_ownership().await;

        let partition_ids = self
            .client
            .partition_ids(&self.config.stream_id)
            .await
            .map_err(IterationError::StreamClient)?;

        let ownerships = self
            .store
            .list_ownership(&self.config.stream_id, &self.config.consumer_group)
            .await
            .map_err(IterationError::Store)?;

        let orphaned = self
            .balancer
            .active_ownerships(&ownerships)
            .into_iter()
            .filter(|x| {
                x.owner_id == self.config.owner_id
                    && partition_ids.contains(&x.partition_id)
                    && !self.registry.contains(&x.partition_id)
            })
            .map(|x| ClaimTarget {
                partition_id: x.partition_id.clone(),
                prior: Some(x.clone()),
            })
            .collect::<Vec<_>>();

        for target in orphaned {
            debug!(partition_id = %target.partition_id, "recovering owned partition");
            self.claim_and_pump(target).await?;
        }

        if let Some(target) = self.balancer.select_claim(&ownerships, &partition_ids) {
            self.claim_and_pump(target).await?;
        }

        Ok(())
    }

    async fn renew_ownership(&mut self) {
        let writers = self.registry.checkpoint_writers();

        let renewals = futures_util::future::join_all(writers.iter().map(|writer| async move {
            (
                writer.context().partition_id.clone(),
                writer.renew_ownership().await,
            )
        }))
        .await;

        for (partition_id, renewal) in renewals {
            match renewal {
                Ok(_) => {}
                Err(CheckpointError::OwnershipLost { .. }) => {
                    info!(%partition_id, "partition claimed by another host");
                    self.registry
                        .remove_pump(&partition_id, CloseReason::OwnershipLost)
                        .await;
                }
                Err(err) => {
                    warn!(%partition_id, %err, "unable to renew ownership");
                }
            }
        }
    }

    /// Claims `target` and starts pumping it. Returns whether the claim was accepted.
    async fn claim_and_pump(
        &mut self,
        target: ClaimTarget,
    ) -> Result<bool, IterationError<S::Error, C::Error>> {
        if self.registry.contains(&target.partition_id) {
            return Ok(false);
        }

        let claim = self.balancer.claim_record(&target);

        let ownership = match self
            .store
            .claim_ownership(vec![claim])
            .await
            .map_err(IterationError::Store)?
            .pop()
        {
            Some(ownership) => ownership,
            None => {
                debug!(partition_id = %target.partition_id, "ownership claim lost to another host");
                return Ok(false);
            }
        };

        let start_position = ownership
            .resume_position()
            .unwrap_or(self.config.initial_event_position);

        let checkpoint_writer = Rc::new(CheckpointWriter::new(self.store.clone(), ownership));
        let context = checkpoint_writer.context().clone();
        let handler = self.handler_factory.create_handler(&context);

        info!(
            partition_id = %context.partition_id,
            prior_owner = ?target.prior.as_ref().map(|x| x.owner_id.as_str()),
            "claimed partition"
        );

        if let Err(err) =
            self.registry
                .create_pump(context, start_position, handler, checkpoint_writer)
        {
            error!(%err, "unable to create partition pump");
            return Ok(false);
        }

        Ok(true)
    }

    /// Stops every pump and writes its partition back as unowned.
    pub async fn shutdown(&mut self) {
        let writers = self.registry.checkpoint_writers();

        self.registry.stop_all(CloseReason::Shutdown).await;

        let relinquished =
            futures_util::future::join_all(writers.iter().map(|writer| writer.relinquish())).await;

        for (writer, result) in writers.iter().zip(relinquished) {
            if let Err(err) = result {
                warn!(partition_id = %writer.context().partition_id, %err, "unable to relinquish ownership");
            }
        }
    }
}

/// Runs the processor built by `provider` on a dedicated thread with its own single threaded
/// runtime.
///
/// Returns the thread's handle and a token that stops the processor when cancelled.
pub fn orchestrate<P, C, S, F>(provider: P) -> (JoinHandle<io::Result<()>>, CancellationToken)
where
    P: FnOnce() -> EventProcessor<C, S, F> + Send + 'static,
    C: StreamClient + 'static,
    S: OwnershipStore + 'static,
    F: EventHandlerFactory + 'static,
{
    let cancellation = CancellationToken::new();
    let processor_cancellation = cancellation.clone();

    let join_handle = std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        LocalSet::new().block_on(&runtime, async move {
            provider()
                .run(processor_cancellation)
                .await
                .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))
        })
    });

    (join_handle, cancellation)
}

pub mod balancer;
pub mod checkpoint;
pub mod config;
pub mod handler;
pub mod pump;
pub mod registry;
