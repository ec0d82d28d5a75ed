mod common;

use common::*;
use eventhost::{
    common::{rand::FixedIndex, time::ManualClock},
    prelude::*,
    stream::in_memory::InMemoryStream,
};
use std::{rc::Rc, time::Duration};
use tokio::task::LocalSet;
use tokio_util::sync::CancellationToken;

type HandlerFactory = Box<dyn Fn(&PartitionContext) -> Box<dyn EventHandler>>;

type Host = EventProcessor<InMemoryStream, TestStore, HandlerFactory>;

fn new_host(
    owner_id: &str,
    stream: &InMemoryStream,
    store: &TestStore,
    clock: &ManualClock,
    observations: &Observations,
) -> Host {
    let handler_factory: HandlerFactory = Box::new(recording_factory(observations));

    EventProcessor::new(
        host_config(owner_id),
        Rc::new(stream.clone()),
        Rc::new(store.clone()),
        handler_factory,
    )
    .with_time_source(clock.clone())
}

async fn claim_for(store: &TestStore, owner_id: &str, partition_id: &str) -> PartitionOwnership {
    store
        .inner
        .claim_ownership(vec![PartitionOwnership::new(
            owner_id,
            STREAM_ID,
            CONSUMER_GROUP,
            partition_id,
        )])
        .await
        .unwrap()
        .remove(0)
}

fn assert_pumps_match_store(hosts: &[Host], store: &TestStore, partition_count: usize) {
    for partition_id in (0..partition_count).map(|x| x.to_string()) {
        let pumping = hosts
            .iter()
            .filter(|x| x.active_partition_ids().contains(&partition_id))
            .map(|x| x.owner_id().to_string())
            .collect::<Vec<_>>();

        assert_eq!(
            pumping,
            vec![store.owner_of(&partition_id).unwrap()],
            "partition {} pumped by the wrong hosts",
            partition_id
        );
    }
}

#[tokio::test]
async fn test_bootstrap_claims_exactly_one_partition() {
    LocalSet::new()
        .run_until(async {
            let clock = ManualClock::starting_at(START_MILLIS);
            let store = TestStore::new(&clock);
            let stream = InMemoryStream::new(STREAM_ID, 3);
            let observations = Observations::default();

            let mut host = new_host("host_a", &stream, &store, &clock, &observations);
            host.run_iteration().await.unwrap();

            let claimed = store.claimed_partition_ids();
            assert_eq!(claimed.len(), 1);
            assert!(["0", "1", "2"].contains(&claimed[0].as_str()));
            assert_eq!(store.owner_of(&claimed[0]).as_deref(), Some("host_a"));
            assert_eq!(host.active_partition_ids().len(), 1);

            host.shutdown().await;
        })
        .await;
}

#[tokio::test]
async fn test_steals_one_partition_from_larger_owner() {
    LocalSet::new()
        .run_until(async {
            let clock = ManualClock::starting_at(START_MILLIS);
            let store = TestStore::new(&clock);
            let stream = InMemoryStream::new(STREAM_ID, 3);
            let observations = Observations::default();

            for partition_id in ["0", "1", "2"] {
                claim_for(&store, "host_a", partition_id).await;
            }

            let mut host_b = new_host("host_b", &stream, &store, &clock, &observations);

            for _ in 0..3 {
                host_b.run_iteration().await.unwrap();

                let owned_by_b = ["0", "1", "2"]
                    .iter()
                    .filter(|x| store.owner_of(x).as_deref() == Some("host_b"))
                    .count();
                assert_eq!(owned_by_b, 1);
            }

            let first_claim = store.claims.borrow()[0].clone();
            assert_eq!(first_claim.owner_id, "host_b");
            assert_eq!(first_claim.owner_level, 1);
            assert_eq!(
                host_b.active_partition_ids().into_iter().collect::<Vec<_>>(),
                vec![first_claim.partition_id]
            );

            host_b.shutdown().await;
        })
        .await;
}

#[tokio::test]
async fn test_stale_ownership_is_reclaimed_from_checkpoint() {
    LocalSet::new()
        .run_until(async {
            let clock = ManualClock::starting_at(START_MILLIS);
            let store = TestStore::new(&clock);
            let stream = InMemoryStream::new(STREAM_ID, 2);
            let observations = Observations::default();

            let ownership = claim_for(&store, "dead_host", "0").await;
            store
                .inner
                .update_checkpoint(PartitionOwnership {
                    sequence_number: Some(41),
                    offset: Some(4100),
                    ..ownership
                })
                .await
                .unwrap()
                .unwrap();
            claim_for(&store, "dead_host", "1").await;

            clock.advance(Duration::from_secs(61));

            let mut host = new_host("host_b", &stream, &store, &clock, &observations)
                .with_rand_source(FixedIndex(0));

            host.run_iteration().await.unwrap();
            host.run_iteration().await.unwrap();

            assert_eq!(store.owner_of("0").as_deref(), Some("host_b"));
            assert_eq!(store.owner_of("1").as_deref(), Some("host_b"));

            let reclaimed = store.inner.get(STREAM_ID, CONSUMER_GROUP, "0").unwrap();
            assert_eq!(reclaimed.owner_level, 1);
            assert_eq!(reclaimed.sequence_number, Some(41));

            wait_for(|| stream.opened_consumers().len() == 2).await;

            let opened = stream.opened_consumers();
            assert_eq!(opened[0].partition_id, "0");
            assert_eq!(
                opened[0].start_position,
                EventPosition::SequenceNumber {
                    value: 41,
                    inclusive: false
                }
            );
            assert_eq!(opened[1].start_position, EventPosition::Earliest);

            host.shutdown().await;
        })
        .await;
}

#[tokio::test]
async fn test_racing_claims_create_a_single_pump() {
    LocalSet::new()
        .run_until(async {
            let clock = ManualClock::starting_at(START_MILLIS);
            let store = TestStore::yielding(&clock);
            let stream = InMemoryStream::new(STREAM_ID, 3);
            let observations = Observations::default();

            let mut hosts = vec![
                new_host("host_a", &stream, &store, &clock, &observations)
                    .with_rand_source(FixedIndex(0)),
                new_host("host_b", &stream, &store, &clock, &observations)
                    .with_rand_source(FixedIndex(0)),
            ];

            {
                let (host_a, host_b) = hosts.split_at_mut(1);
                let (a, b) = tokio::join!(host_a[0].run_iteration(), host_b[0].run_iteration());
                a.unwrap();
                b.unwrap();
            }

            // both hosts saw an empty store and went for the same partition
            assert_eq!(store.claimed_partition_ids(), vec!["0", "0"]);
            assert_eq!(
                hosts
                    .iter()
                    .map(|x| x.active_partition_ids().len())
                    .sum::<usize>(),
                1
            );
            assert_pumps_match_store(&hosts[..], &store, 1);

            // the winner only counts itself until the other host owns something
            for host in hosts.iter_mut() {
                host.run_iteration().await.unwrap();
            }

            assert_eq!(
                hosts
                    .iter()
                    .map(|x| x.active_partition_ids().len())
                    .collect::<Vec<_>>(),
                vec![2, 1]
            );
            assert_pumps_match_store(&hosts[..], &store, 3);

            for host in hosts.iter_mut() {
                host.shutdown().await;
            }
        })
        .await;
}

#[tokio::test]
async fn test_hosts_converge_to_even_distribution() {
    LocalSet::new()
        .run_until(async {
            const PARTITION_COUNT: usize = 8;

            let clock = ManualClock::starting_at(START_MILLIS);
            let store = TestStore::new(&clock);
            let stream = InMemoryStream::new(STREAM_ID, PARTITION_COUNT);
            let observations = Observations::default();

            let mut hosts = ["host_a", "host_b"]
                .iter()
                .map(|owner_id| new_host(owner_id, &stream, &store, &clock, &observations))
                .collect::<Vec<_>>();

            for _ in 0..8 {
                for host in hosts.iter_mut() {
                    host.run_iteration().await.unwrap();
                }
            }

            assert_eq!(
                hosts
                    .iter()
                    .map(|x| x.active_partition_ids().len())
                    .collect::<Vec<_>>(),
                vec![4, 4]
            );
            assert_pumps_match_store(&hosts, &store, PARTITION_COUNT);

            hosts.push(new_host("host_c", &stream, &store, &clock, &observations));

            for _ in 0..8 {
                for host in hosts.iter_mut() {
                    host.run_iteration().await.unwrap();
                }
            }

            let mut counts = hosts
                .iter()
                .map(|x| x.active_partition_ids().len())
                .collect::<Vec<_>>();
            counts.sort_unstable();
            assert_eq!(counts, vec![2, 3, 3]);
            assert_pumps_match_store(&hosts, &store, PARTITION_COUNT);

            // the newcomer took exactly two partitions, one steal per pass
            let ownership_lost = observations
                .borrow()
                .values()
                .flat_map(|x| x.close_reasons.iter())
                .filter(|x| **x == CloseReason::OwnershipLost)
                .count();
            assert_eq!(ownership_lost, 2);

            for host in hosts.iter_mut() {
                host.shutdown().await;
            }
        })
        .await;
}

#[tokio::test]
async fn test_run_loop_relinquishes_on_shutdown() {
    LocalSet::new()
        .run_until(async {
            let clock = ManualClock::starting_at(START_MILLIS);
            let store = TestStore::new(&clock);
            let stream = InMemoryStream::new(STREAM_ID, 2);
            let observations = Observations::default();

            let mut host_a = new_host("host_a", &stream, &store, &clock, &observations);
            let cancellation = CancellationToken::new();

            let run = tokio::task::spawn_local({
                let cancellation = cancellation.clone();
                async move {
                    let result = host_a.run(cancellation).await;
                    (host_a, result)
                }
            });

            wait_for(|| store.owner_of("0").is_some() && store.owner_of("1").is_some()).await;

            cancellation.cancel();
            let (host_a, result) = run.await.unwrap();
            assert!(result.is_ok());
            assert!(host_a.active_partition_ids().is_empty());

            for partition_id in ["0", "1"] {
                assert_eq!(store.owner_of(partition_id).as_deref(), Some(""));
                assert_eq!(
                    observations.borrow()[partition_id].close_reasons,
                    vec![CloseReason::Shutdown]
                );
            }

            // relinquished partitions are free to take without waiting for them to expire
            let mut host_b = new_host("host_b", &stream, &store, &clock, &observations);
            host_b.run_iteration().await.unwrap();
            host_b.run_iteration().await.unwrap();

            assert_eq!(host_b.active_partition_ids().len(), 2);

            host_b.shutdown().await;
        })
        .await;
}
