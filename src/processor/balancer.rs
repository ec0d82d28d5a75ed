//! Module providing the partition ownership balancing decision.
//!
//! Every host runs the same algorithm independently against a snapshot of the ownership store:
//!
//! 1. Records older than the inactivity limit, or relinquished, are ignored.
//! 2. With no active records at all, a random partition is claimed.
//! 3. Active records are grouped by owner; this host is counted even when it owns nothing.
//! 4. With `P` partitions and `N` owners, the distribution is balanced when every owner holds
//!    `P / N` or `P / N + 1` partitions and exactly `P % N` owners hold the larger count. An
//!    unbalanced distribution makes this host claim one more partition only if it holds fewer than
//!    `P / N`, or exactly `P / N` while no other owner holds fewer.
//! 5. Unowned partitions are preferred; otherwise a random partition of a random owner among the
//!    largest ones is stolen.
//!
//! Claims are single conditional writes, so hosts racing on the same decision resolve through the
//! store: one wins, the others retry differently on their next pass. Randomized tie-breaking only
//! keeps simultaneously starting hosts from colliding on every pass.

use crate::{
    common::{rand::RandSource, time::TimeSource},
    store::PartitionOwnership,
};
use std::{collections::BTreeMap, rc::Rc, time::Duration};

/// A partition this host decided to claim, along with the record it was last seen with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimTarget {
    pub partition_id: String,
    /// Latest record of the partition, active or stale. Carries the checkpoint and eTag to claim
    /// against.
    pub prior: Option<PartitionOwnership>,
}

/// Owner counts derived from a snapshot, keyed by owner id.
pub type OwnerPartitionMap<'a> = BTreeMap<&'a str, Vec<&'a PartitionOwnership>>;

/// Picks, from one snapshot of the ownership store, the next partition this host should claim.
pub struct PartitionLoadBalancer {
    owner_id: String,
    stream_id: String,
    consumer_group: String,
    inactive_time_limit: Duration,

    rand: Rc<dyn RandSource>,
    clock: Rc<dyn TimeSource>,
}

impl PartitionLoadBalancer {
    pub fn new(
        owner_id: &str,
        stream_id: &str,
        consumer_group: &str,
        inactive_time_limit: Duration,
        rand: Rc<dyn RandSource>,
        clock: Rc<dyn TimeSource>,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            stream_id: stream_id.into(),
            consumer_group: consumer_group.into(),
            inactive_time_limit,
            rand,
            clock,
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn set_rand_source(&mut self, rand: Rc<dyn RandSource>) {
        self.rand = rand;
    }

    pub fn set_time_source(&mut self, clock: Rc<dyn TimeSource>) {
        self.clock = clock;
    }

    /// Records of the snapshot that still count as owned.
    pub fn active_ownerships<'a>(
        &self,
        ownerships: &'a [PartitionOwnership],
    ) -> Vec<&'a PartitionOwnership> {
        let now_ms = self.clock.current_millis();

        ownerships
            .iter()
            .filter(|x| x.is_active(now_ms, self.inactive_time_limit))
            .collect()
    }

    /// Groups active records by owner, always including an entry for this host.
    pub fn owner_partition_map<'a>(
        &'a self,
        active_ownerships: &[&'a PartitionOwnership],
    ) -> OwnerPartitionMap<'a> {
        let mut owner_partition_map = OwnerPartitionMap::new();

        owner_partition_map.insert(self.owner_id.as_str(), Vec::new());

        for ownership in active_ownerships {
            owner_partition_map
                .entry(ownership.owner_id.as_str())
                .or_default()
                .push(ownership);
        }

        owner_partition_map
    }

    /// Decides which partition, if any, this host should claim next.
    pub fn select_claim(
        &self,
        ownerships: &[PartitionOwnership],
        partition_ids: &[String],
    ) -> Option<ClaimTarget> {
        if partition_ids.is_empty() {
            return None;
        }

        let prior_of = |partition_id: &str| {
            ownerships
                .iter()
                .find(|x| x.partition_id == partition_id)
                .cloned()
        };

        let active_ownerships = self.active_ownerships(ownerships);

        if active_ownerships.is_empty() {
            let partition_id = &partition_ids[self.rand.random_index(partition_ids.len())];

            return Some(ClaimTarget {
                partition_id: partition_id.clone(),
                prior: prior_of(partition_id),
            });
        }

        let owner_partition_map = self.owner_partition_map(&active_ownerships);

        let counts = owner_partition_map
            .values()
            .map(Vec::len)
            .collect::<Vec<_>>();

        if is_balanced(partition_ids.len(), &counts) {
            return None;
        }

        let own_count = owner_partition_map
            .get(self.owner_id.as_str())
            .map_or(0, Vec::len);

        let others_below_min = owner_partition_map
            .iter()
            .filter(|(owner_id, _)| **owner_id != self.owner_id)
            .any(|(_, owned)| owned.len() < min_per_owner(partition_ids.len(), counts.len()));

        if !should_own_more(
            partition_ids.len(),
            counts.len(),
            own_count,
            others_below_min,
        ) {
            return None;
        }

        if let Some(partition_id) = partition_ids.iter().find(|partition_id| {
            !active_ownerships
                .iter()
                .any(|x| &x.partition_id == *partition_id)
        }) {
            return Some(ClaimTarget {
                partition_id: partition_id.clone(),
                prior: prior_of(partition_id),
            });
        }

        let max_count = owner_partition_map
            .iter()
            .filter(|(owner_id, _)| **owner_id != self.owner_id)
            .map(|(_, owned)| owned.len())
            .max()
            .unwrap_or(0);

        if max_count <= own_count {
            return None;
        }

        let largest_owners = owner_partition_map
            .iter()
            .filter(|(owner_id, owned)| **owner_id != self.owner_id && owned.len() == max_count)
            .map(|(_, owned)| owned)
            .collect::<Vec<_>>();

        let victim = largest_owners[self.rand.random_index(largest_owners.len())];
        let stolen = victim[self.rand.random_index(victim.len())];

        Some(ClaimTarget {
            partition_id: stolen.partition_id.clone(),
            prior: Some(stolen.clone()),
        })
    }

    /// Builds the record to submit for claiming `target` as this host.
    ///
    /// The prior checkpoint and eTag are preserved; taking over another owner's record bumps the
    /// owner level.
    pub fn claim_record(&self, target: &ClaimTarget) -> PartitionOwnership {
        match &target.prior {
            Some(prior) => PartitionOwnership {
                owner_id: self.owner_id.clone(),
                owner_level: if prior.owner_id == self.owner_id {
                    prior.owner_level
                } else {
                    prior.owner_level + 1
                },
                ..prior.clone()
            },
            None => PartitionOwnership::new(
                &self.owner_id,
                &self.stream_id,
                &self.consumer_group,
                &target.partition_id,
            ),
        }
    }
}

/// Least number of partitions every owner should hold.
pub fn min_per_owner(partition_count: usize, owner_count: usize) -> usize {
    partition_count / owner_count.max(1)
}

/// Whether `counts` (one entry per owner) is an even distribution of `partition_count`
/// partitions.
pub fn is_balanced(partition_count: usize, counts: &[usize]) -> bool {
    if counts.is_empty() {
        return partition_count == 0;
    }

    let min = min_per_owner(partition_count, counts.len());
    let extra = partition_count % counts.len();

    counts.iter().all(|&count| count == min || count == min + 1)
        && counts.iter().filter(|&&count| count == min + 1).count() == extra
}

/// Whether an owner holding `own_count` partitions should claim one more.
pub fn should_own_more(
    partition_count: usize,
    owner_count: usize,
    own_count: usize,
    others_below_min: bool,
) -> bool {
    let min = min_per_owner(partition_count, owner_count);

    own_count < min || (own_count == min && !others_below_min)
}
