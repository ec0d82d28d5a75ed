//! Partition ownership load balancing and per-partition consumption for consumer groups reading a
//! partitioned, append-only event stream.
//!
//! Independent hosts cooperate only through a shared [`store::OwnershipStore`]: each host
//! periodically reads the global ownership state, claims at most one partition per pass with an
//! optimistic-concurrency write and runs a [`processor::pump::PartitionPump`] for every partition
//! it owns. Pumps resume from the last checkpoint recorded in the store.

pub mod common;
pub mod processor;
pub mod store;
pub mod stream;

pub mod prelude {
    //! Prelude module for [`eventhost`](super) with common exports for convenience.

    pub use super::common::{
        rand::{RandSource, ThreadRandom},
        time::{SystemClock, TimeSource},
    };
    pub use super::processor::{
        checkpoint::{CheckpointError, Checkpointer},
        config::ProcessorConfig,
        handler::{EventHandler, EventHandlerFactory, HandlerError},
        CloseReason, EventProcessor, PartitionContext,
    };
    pub use super::store::{CheckpointPosition, OwnershipStore, PartitionOwnership};
    pub use super::stream::{Event, EventPosition, StreamClient, StreamConsumer};
}
