//! In-memory [`OwnershipStore`] implementation with eTag-conditional writes.

use super::{OwnershipStore, PartitionOwnership};
use crate::common::time::{SystemClock, TimeSource};
use async_trait::async_trait;
use std::{cell::RefCell, collections::BTreeMap, convert::Infallible, rc::Rc};
use uuid::Uuid;

type OwnershipKey = (String, String, String);

fn ownership_key(ownership: &PartitionOwnership) -> OwnershipKey {
    (
        ownership.stream_id.clone(),
        ownership.consumer_group.clone(),
        ownership.partition_id.clone(),
    )
}

/// An in-memory ownership store.
///
/// Clones share the same records, so several hosts in one process can coordinate through it.
#[derive(Clone)]
pub struct InMemoryOwnershipStore {
    records: Rc<RefCell<BTreeMap<OwnershipKey, PartitionOwnership>>>,
    clock: Rc<dyn TimeSource>,
}

impl Default for InMemoryOwnershipStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryOwnershipStore {
    pub fn new() -> Self {
        Self::with_time_source(SystemClock)
    }

    /// Creates a store stamping modification times from the given [`TimeSource`].
    pub fn with_time_source<T: TimeSource + 'static>(clock: T) -> Self {
        Self {
            records: Rc::new(RefCell::new(BTreeMap::new())),
            clock: Rc::new(clock),
        }
    }

    /// Returns the stored record for a partition, if any.
    pub fn get(
        &self,
        stream_id: &str,
        consumer_group: &str,
        partition_id: &str,
    ) -> Option<PartitionOwnership> {
        self.records
            .borrow()
            .get(&(stream_id.into(), consumer_group.into(), partition_id.into()))
            .cloned()
    }

    fn conditional_write(
        &self,
        mut ownership: PartitionOwnership,
        require_same_owner: bool,
    ) -> Option<PartitionOwnership> {
        let key = ownership_key(&ownership);
        let mut records = self.records.borrow_mut();

        match (records.get(&key), ownership.etag.as_deref()) {
            (None, None) => {}
            (Some(stored), Some(etag)) if stored.etag.as_deref() == Some(etag) => {
                if ownership.owner_level < stored.owner_level
                    || (require_same_owner && stored.owner_id != ownership.owner_id)
                {
                    return None;
                }
            }
            _ => return None,
        }

        ownership.etag = Some(Uuid::new_v4().to_string());
        ownership.last_modified_time_ms = self.clock.current_millis();

        records.insert(key, ownership.clone());

        Some(ownership)
    }
}

#[async_trait(?Send)]
impl OwnershipStore for InMemoryOwnershipStore {
    type Error = Infallible;

    async fn list_ownership(
        &self,
        stream_id: &str,
        consumer_group: &str,
    ) -> Result<Vec<PartitionOwnership>, Self::Error> {
        Ok(self
            .records
            .borrow()
            .values()
            .filter(|x| x.stream_id == stream_id && x.consumer_group == consumer_group)
            .cloned()
            .collect())
    }

    async fn claim_ownership(
        &self,
        ownerships: Vec<PartitionOwnership>,
    ) -> Result<Vec<PartitionOwnership>, Self::Error> {
        Ok(ownerships
            .into_iter()
            .filter_map(|ownership| self.conditional_write(ownership, false))
            .collect())
    }

    async fn update_checkpoint(
        &self,
        ownership: PartitionOwnership,
    ) -> Result<Option<PartitionOwnership>, Self::Error> {
        Ok(self.conditional_write(ownership, true))
    }
}
