//! Module providing per-partition checkpoint writes against an [`OwnershipStore`].

use super::PartitionContext;
use crate::store::{CheckpointPosition, OwnershipStore, PartitionOwnership};
use async_trait::async_trait;
use std::{error::Error, fmt::Display, rc::Rc};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

#[derive(Debug)]
pub enum CheckpointError {
    /// The store rejected the write: another host claimed the partition since it was last read.
    OwnershipLost { partition_id: String },
    Store(Box<dyn Error>),
}

impl Display for CheckpointError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointError::OwnershipLost { partition_id } => {
                write!(f, "Ownership of partition {:?} lost.", partition_id)
            }
            CheckpointError::Store(err) => write!(f, "Ownership store error: {}", err),
        }
    }
}

impl Error for CheckpointError {}

/// Records processing progress for one partition.
#[async_trait(?Send)]
pub trait Checkpointer {
    /// Durably records `position` as the last processed position of this partition.
    ///
    /// Fails with [`CheckpointError::OwnershipLost`] if this host no longer owns the partition.
    /// Failed writes are not retried.
    async fn checkpoint(&self, position: CheckpointPosition) -> Result<(), CheckpointError>;
}

/// Store-backed [`Checkpointer`] scoped to one partition and owner.
///
/// Holds the ownership record as last written by this host. Every write is conditional on that
/// record's eTag and replaces it with the store's result. Writes for the partition are
/// serialized, so checkpoints and renewals of the same partition never race for one eTag.
pub struct CheckpointWriter<S> {
    context: PartitionContext,
    store: Rc<S>,
    ownership: Mutex<PartitionOwnership>,
}

impl<S> CheckpointWriter<S>
where
    S: OwnershipStore,
{
    /// Creates a writer from a record this host just claimed successfully.
    pub fn new(store: Rc<S>, ownership: PartitionOwnership) -> Self {
        Self {
            context: PartitionContext::from(&ownership),
            store,
            ownership: Mutex::new(ownership),
        }
    }

    pub fn context(&self) -> &PartitionContext {
        &self.context
    }

    /// Returns the ownership record as last written by this writer.
    pub async fn ownership(&self) -> PartitionOwnership {
        self.ownership.lock().await.clone()
    }

    fn ownership_lost(&self) -> CheckpointError {
        CheckpointError::OwnershipLost {
            partition_id: self.context.partition_id.clone(),
        }
    }

    /// Re-claims the partition with the current record to refresh its modification time.
    #[instrument(skip(self), fields(partition_id = %self.context.partition_id))]
    pub async fn renew_ownership(&self) -> Result<(), CheckpointError> {
        let mut ownership = self.ownership.lock().await;

        let renewed = self
            .store
            .claim_ownership(vec![ownership.clone()])
            .await
            .map_err(|err| CheckpointError::Store(Box::new(err)))?
            .pop()
            .ok_or_else(|| self.ownership_lost())?;

        debug!(etag = ?renewed.etag, "ownership renewed");

        *ownership = renewed;

        Ok(())
    }

    /// Writes the record back with an empty owner id so that peers can claim it right away.
    #[instrument(skip(self), fields(partition_id = %self.context.partition_id))]
    pub async fn relinquish(&self) -> Result<(), CheckpointError> {
        let mut ownership = self.ownership.lock().await;

        let relinquished = self
            .store
            .claim_ownership(vec![PartitionOwnership {
                owner_id: String::new(),
                ..ownership.clone()
            }])
            .await
            .map_err(|err| CheckpointError::Store(Box::new(err)))?
            .pop()
            .ok_or_else(|| self.ownership_lost())?;

        debug!("ownership relinquished");

        *ownership = relinquished;

        Ok(())
    }
}

#[async_trait(?Send)]
impl<S> Checkpointer for CheckpointWriter<S>
where
    S: OwnershipStore,
{
    async fn checkpoint(&self, position: CheckpointPosition) -> Result<(), CheckpointError> {
        let mut ownership = self.ownership.lock().await;

        let checkpointed = self
            .store
            .update_checkpoint(PartitionOwnership {
                sequence_number: position.sequence_number,
                offset: position.offset,
                ..ownership.clone()
            })
            .await
            .map_err(|err| CheckpointError::Store(Box::new(err)))?
            .ok_or_else(|| self.ownership_lost())?;

        *ownership = checkpointed;

        Ok(())
    }
}
