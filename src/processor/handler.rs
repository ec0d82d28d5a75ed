//! Module providing the user-facing event handling interface.

use super::{checkpoint::Checkpointer, CloseReason, PartitionContext};
use crate::stream::Event;
use async_trait::async_trait;
use std::error::Error;

/// Error type returned by [`EventHandler`] implementations.
pub type HandlerError = Box<dyn Error>;

/// User processing logic for the events of one partition.
///
/// One handler instance is created per pump, so an implementation only ever sees events of a
/// single partition, in stream order. Returning an error from [`EventHandler::initialize`] or
/// [`EventHandler::process_events`] stops the pump.
#[async_trait(?Send)]
pub trait EventHandler {
    /// Invoked once the pump's consumer is open, before the first batch.
    async fn initialize(&mut self, _context: &PartitionContext) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Processes a non-empty batch of events.
    ///
    /// Progress is recorded through `checkpointer`, at whatever frequency the handler chooses.
    async fn process_events(
        &mut self,
        context: &PartitionContext,
        events: &[Event],
        checkpointer: &dyn Checkpointer,
    ) -> Result<(), HandlerError>;

    /// Invoked exactly once when the pump stops because of an error.
    async fn process_error(&mut self, _context: &PartitionContext, _error: &(dyn Error + 'static)) {}

    /// Invoked when the pump is stopped by its host.
    async fn close(&mut self, _context: &PartitionContext, _reason: CloseReason) {}
}

/// Creates an [`EventHandler`] for every partition a host starts pumping.
pub trait EventHandlerFactory {
    fn create_handler(&self, context: &PartitionContext) -> Box<dyn EventHandler>;
}

impl<F> EventHandlerFactory for F
where
    F: Fn(&PartitionContext) -> Box<dyn EventHandler>,
{
    fn create_handler(&self, context: &PartitionContext) -> Box<dyn EventHandler> {
        self(context)
    }
}
