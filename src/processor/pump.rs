//! Module providing the consumption loop of one partition.
//!
//! A [`PartitionPump`] moves through `Idle → Receiving → Stopped` and never back. While
//! `Receiving`, a task spawned on the current [`LocalSet`](tokio::task::LocalSet) reads batches
//! from a [`StreamConsumer`] and hands them to the partition's [`EventHandler`]. The task stops on
//! the first receive or handler error, including a panicking handler; restarting the partition
//! is left to the load balancer. Stopping a pump never waits on a handler callback for longer than
//! [`ReceiveOptions::stop_timeout`].

use super::{
    checkpoint::{CheckpointWriter, Checkpointer},
    handler::{EventHandler, HandlerError},
    CloseReason, PartitionContext,
};
use crate::{
    store::OwnershipStore,
    stream::{EventPosition, StreamClient, StreamConsumer},
};
use futures_util::FutureExt;
use std::{
    any::Any, cell::Cell, error::Error, fmt::Display, panic::AssertUnwindSafe, rc::Rc,
    time::Duration,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, instrument, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    Idle,
    Receiving,
    Stopped,
}

/// Bounds applied to every `receive_batch` call of a pump, and to stopping it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveOptions {
    pub max_batch_size: usize,
    pub max_wait_time: Duration,
    pub stop_timeout: Duration,
}

#[derive(Debug)]
pub enum PumpError<CE> {
    OpenConsumer(CE),
    Receive(CE),
    Initialize(HandlerError),
    Handler(HandlerError),
    Panicked(String),
}

impl<CE: Display> Display for PumpError<CE> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PumpError::OpenConsumer(err) => write!(f, "Unable to open consumer: {}", err),
            PumpError::Receive(err) => write!(f, "Unable to receive events: {}", err),
            PumpError::Initialize(err) => write!(f, "Event handler failed to initialize: {}", err),
            PumpError::Handler(err) => write!(f, "Event handler failed: {}", err),
            PumpError::Panicked(message) => write!(f, "Event handler panicked: {}", message),
        }
    }
}

impl<CE: Error + 'static> Error for PumpError<CE> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PumpError::OpenConsumer(err) | PumpError::Receive(err) => Some(err),
            PumpError::Initialize(err) | PumpError::Handler(err) => Some(err.as_ref()),
            PumpError::Panicked(_) => None,
        }
    }
}

pub struct PartitionPump<C, S> {
    context: PartitionContext,
    start_position: EventPosition,
    options: ReceiveOptions,

    client: Rc<C>,
    checkpoint_writer: Rc<CheckpointWriter<S>>,

    state: Rc<Cell<PumpState>>,
    cancellation: CancellationToken,

    handler: Option<Box<dyn EventHandler>>,
    task: Option<JoinHandle<Box<dyn EventHandler>>>,
}

impl<C, S> PartitionPump<C, S>
where
    C: StreamClient + 'static,
    S: OwnershipStore + 'static,
{
    pub fn new(
        start_position: EventPosition,
        options: ReceiveOptions,
        client: Rc<C>,
        checkpoint_writer: Rc<CheckpointWriter<S>>,
        handler: Box<dyn EventHandler>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            context: checkpoint_writer.context().clone(),
            start_position,
            options,
            client,
            checkpoint_writer,
            state: Rc::new(Cell::new(PumpState::Idle)),
            cancellation,
            handler: Some(handler),
            task: None,
        }
    }

    pub fn context(&self) -> &PartitionContext {
        &self.context
    }

    /// Current state. A receive task that ended without reporting back counts as `Stopped`.
    pub fn state(&self) -> PumpState {
        match self.task.as_ref() {
            Some(task) if task.is_finished() => PumpState::Stopped,
            _ => self.state.get(),
        }
    }

    pub fn start_position(&self) -> EventPosition {
        self.start_position
    }

    pub fn checkpoint_writer(&self) -> &Rc<CheckpointWriter<S>> {
        &self.checkpoint_writer
    }

    /// Spawns the receive loop and moves to [`PumpState::Receiving`]. No-op unless `Idle`.
    ///
    /// Must be called from within a [`LocalSet`](tokio::task::LocalSet).
    pub fn start(&mut self) {
        let handler = match (self.state.get(), self.handler.take()) {
            (PumpState::Idle, Some(handler)) => handler,
            (_, handler) => {
                self.handler = handler;
                return;
            }
        };

        self.state.set(PumpState::Receiving);

        info!(
            partition_id = %self.context.partition_id,
            start_position = ?self.start_position,
            "starting partition pump"
        );

        let span = info_span!(
            "partition_pump",
            stream_id = %self.context.stream_id,
            consumer_group = %self.context.consumer_group,
            partition_id = %self.context.partition_id,
        );

        self.task = Some(tokio::task::spawn_local(
            pump_events(
                self.context.clone(),
                self.start_position,
                self.options,
                self.client.clone(),
                self.checkpoint_writer.clone(),
                handler,
                self.state.clone(),
                self.cancellation.clone(),
            )
            .instrument(span),
        ));
    }

    /// Cancels the receive loop, waits for it to finish and invokes the handler's close hook.
    ///
    /// Safe to call while a receive is in flight, after the loop failed, or more than once; the
    /// close hook runs at most once. A loop stuck in a handler callback past
    /// [`ReceiveOptions::stop_timeout`] is aborted and its handler dropped without closing.
    #[instrument(skip(self), fields(partition_id = %self.context.partition_id))]
    pub async fn stop(&mut self, reason: CloseReason) {
        self.cancellation.cancel();

        let handler = match self.task.take() {
            Some(mut task) => match tokio::time::timeout(self.options.stop_timeout, &mut task).await
            {
                Ok(Ok(handler)) => Some(handler),
                Ok(Err(join_error)) => {
                    error!(%join_error, "partition pump task did not complete");
                    None
                }
                Err(_) => {
                    warn!(
                        stop_timeout = ?self.options.stop_timeout,
                        "partition pump did not stop in time, aborting"
                    );
                    task.abort();
                    None
                }
            },
            None => {
                // never started: nothing was initialized, so there is nothing to close
                self.handler.take();
                None
            }
        };

        self.state.set(PumpState::Stopped);

        if let Some(mut handler) = handler {
            handler.close(&self.context, reason).await;
            info!(?reason, "partition pump stopped");
        }
    }
}

impl<C, S> Drop for PartitionPump<C, S> {
    fn drop(&mut self) {
        self.cancellation.cancel();
    }
}

#[allow(clippy::too_many_arguments)]
async fn pump_events<C, S>(
    context: PartitionContext,
    start_position: EventPosition,
    options: ReceiveOptions,
    client: Rc<C>,
    checkpoint_writer: Rc<CheckpointWriter<S>>,
    mut handler: Box<dyn EventHandler>,
    state: Rc<Cell<PumpState>>,
    cancellation: CancellationToken,
) -> Box<dyn EventHandler>
where
    C: StreamClient,
    S: OwnershipStore,
{
    let outcome = match client
        .open_consumer(
            &context.stream_id,
            &context.consumer_group,
            &context.partition_id,
            start_position,
        )
        .await
    {
        Ok(mut consumer) => {
            let outcome = AssertUnwindSafe(receive_events(
                &context,
                options,
                &mut consumer,
                checkpoint_writer.as_ref(),
                handler.as_mut(),
                &cancellation,
            ))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(PumpError::Panicked(panic_message(panic.as_ref()))));

            if let Err(err) = consumer.close().await {
                warn!(%err, "error closing consumer");
            }

            outcome
        }
        Err(err) => Err(PumpError::OpenConsumer(err)),
    };

    if let Err(pump_error) = outcome {
        error!(%pump_error, "partition pump failed");
        handler.process_error(&context, &pump_error).await;
    }

    state.set(PumpState::Stopped);

    handler
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    match (panic.downcast_ref::<&str>(), panic.downcast_ref::<String>()) {
        (Some(message), _) => message.to_string(),
        (_, Some(message)) => message.clone(),
        _ => "unknown panic payload".into(),
    }
}

async fn receive_events<C>(
    context: &PartitionContext,
    options: ReceiveOptions,
    consumer: &mut C,
    checkpointer: &dyn Checkpointer,
    handler: &mut dyn EventHandler,
    cancellation: &CancellationToken,
) -> Result<(), PumpError<C::Error>>
where
    C: StreamConsumer,
{
    handler
        .initialize(context)
        .await
        .map_err(PumpError::Initialize)?;

    while !cancellation.is_cancelled() {
        let events = tokio::select! {
            biased;
            _ = cancellation.cancelled() => break,
            events = consumer.receive_batch(
                options.max_batch_size,
                options.max_wait_time,
                cancellation,
            ) => events.map_err(PumpError::Receive)?,
        };

        if events.is_empty() {
            continue;
        }

        handler
            .process_events(context, &events, checkpointer)
            .await
            .map_err(PumpError::Handler)?;
    }

    Ok(())
}
