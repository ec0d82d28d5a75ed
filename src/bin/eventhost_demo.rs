use async_trait::async_trait;
use eventhost::{
    prelude::*,
    store::in_memory::InMemoryOwnershipStore,
    stream::in_memory::InMemoryStream,
};
use std::{collections::BTreeMap, rc::Rc, time::Duration};
use tokio::task::LocalSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const STREAM_ID: &str = "demo_stream";

const PARTITION_COUNT: usize = 8;

const OWNER_IDS: [&str; 3] = ["host_a", "host_b", "host_c"];

/// host_c leaves the group after this long, handing its partitions back.
const DEPARTING_HOST_LIFETIME: Duration = Duration::from_secs(8);

const PRODUCE_INTERVAL: Duration = Duration::from_millis(100);

struct LoggingHandler {
    owner_id: String,
}

#[async_trait(?Send)]
impl EventHandler for LoggingHandler {
    async fn initialize(&mut self, context: &PartitionContext) -> Result<(), HandlerError> {
        info!(owner_id = %self.owner_id, partition_id = %context.partition_id, "handler initialized");
        Ok(())
    }

    async fn process_events(
        &mut self,
        context: &PartitionContext,
        events: &[Event],
        checkpointer: &dyn Checkpointer,
    ) -> Result<(), HandlerError> {
        info!(
            owner_id = %self.owner_id,
            partition_id = %context.partition_id,
            count = events.len(),
            first = events.first().map(|x| x.sequence_number),
            last = events.last().map(|x| x.sequence_number),
            "processed batch"
        );

        if let Some(last) = events.last() {
            checkpointer.checkpoint(last.into()).await?;
        }

        Ok(())
    }

    async fn close(&mut self, context: &PartitionContext, reason: CloseReason) {
        info!(owner_id = %self.owner_id, partition_id = %context.partition_id, ?reason, "handler closed");
    }
}

fn demo_config(owner_id: &str) -> ProcessorConfig {
    ProcessorConfig {
        owner_id: owner_id.into(),
        inactive_time_limit: Duration::from_secs(5),
        load_balance_interval: Duration::from_secs(1),
        max_batch_size: 16,
        max_wait_time: Duration::from_millis(500),
        ..ProcessorConfig::for_stream(STREAM_ID)
    }
}

async fn wait_for_shutdown(duration: Option<Duration>) {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(_) => info!("Received CTRL+C."),
            Err(err) => error!(%err, "unable to listen for CTRL+C"),
        }
    };

    match duration {
        Some(duration) => tokio::select! {
            _ = ctrl_c => {}
            _ = tokio::time::sleep(duration) => {}
        },
        None => ctrl_c.await,
    }
}

async fn run_demo(duration: Option<Duration>) {
    let stream = InMemoryStream::new(STREAM_ID, PARTITION_COUNT);
    let store = InMemoryOwnershipStore::new();
    let cancellation = CancellationToken::new();

    let producer = tokio::task::spawn_local({
        let stream = stream.clone();
        let cancellation = cancellation.clone();

        async move {
            let mut interval = tokio::time::interval(PRODUCE_INTERVAL);

            for produced in 0usize.. {
                tokio::select! {
                    _ = cancellation.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let partition_id = (produced % PARTITION_COUNT).to_string();

                if let Err(err) = stream.append(&partition_id, format!("event-{}", produced)) {
                    error!(%err, "unable to append event");
                }
            }
        }
        .instrument(info_span!("producer"))
    });

    let hosts = OWNER_IDS
        .iter()
        .map(|owner_id| {
            let host_cancellation = cancellation.child_token();

            let owner = owner_id.to_string();
            let handler_factory = move |_: &PartitionContext| -> Box<dyn EventHandler> {
                Box::new(LoggingHandler {
                    owner_id: owner.clone(),
                })
            };

            let mut processor = EventProcessor::new(
                demo_config(owner_id),
                Rc::new(stream.clone()),
                Rc::new(store.clone()),
                handler_factory,
            );

            let join_handle = tokio::task::spawn_local(
                {
                    let host_cancellation = host_cancellation.clone();
                    async move {
                        if let Err(err) = processor.run(host_cancellation).await {
                            error!(%err, "event processor failed");
                        }
                    }
                }
                .instrument(info_span!("host", owner_id = %owner_id)),
            );

            (host_cancellation, join_handle)
        })
        .collect::<Vec<_>>();

    tokio::select! {
        _ = wait_for_shutdown(duration) => {}
        _ = tokio::time::sleep(DEPARTING_HOST_LIFETIME) => {
            info!("host_c leaving the consumer group");
            hosts[2].0.cancel();

            wait_for_shutdown(duration.map(|x| x.saturating_sub(DEPARTING_HOST_LIFETIME))).await;
        }
    }

    match store.list_ownership(STREAM_ID, "$Default").await {
        Ok(ownerships) => {
            let mut distribution = BTreeMap::<String, Vec<String>>::new();

            for ownership in ownerships.into_iter().filter(|x| !x.is_relinquished()) {
                distribution
                    .entry(ownership.owner_id)
                    .or_default()
                    .push(ownership.partition_id);
            }

            info!(?distribution, "final partition distribution");
        }
        Err(err) => error!(%err, "unable to list ownership"),
    }

    cancellation.cancel();

    for (_, join_handle) in hosts {
        if let Err(err) = join_handle.await {
            error!(%err, "host task panicked");
        }
    }

    if let Err(err) = producer.await {
        error!(%err, "producer task panicked");
    }
}

#[cfg(not(tarpaulin_include))]
#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("eventhost=debug,eventhost_demo=info")),
        )
        .init();

    let duration = std::env::var("DEMO_DURATION_SECS")
        .ok()
        .and_then(|x| x.parse().ok())
        .map(Duration::from_secs);

    LocalSet::new().run_until(run_demo(duration)).await;
}
