//! Module providing the [`EventProcessor`](super::EventProcessor) configuration surface.

use crate::stream::EventPosition;
use serde::{Deserialize, Serialize};
use std::{error::Error, fmt::Display, time::Duration};
use uuid::Uuid;

pub const DEFAULT_CONSUMER_GROUP: &str = "$Default";

pub const DEFAULT_INACTIVE_TIME_LIMIT: Duration = Duration::from_secs(60);

pub const DEFAULT_LOAD_BALANCE_INTERVAL: Duration = Duration::from_secs(10);

pub const DEFAULT_MAX_BATCH_SIZE: usize = 10;

pub const DEFAULT_MAX_WAIT_TIME: Duration = Duration::from_secs(1);

pub const DEFAULT_PUMP_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration of one event processor host. Fixed for the lifetime of the processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Identifier this host writes into the ownership records it claims.
    pub owner_id: String,
    pub stream_id: String,
    pub consumer_group: String,

    /// Age after which an ownership record no longer counts as owned.
    pub inactive_time_limit: Duration,
    /// Wait between two load balancing passes.
    pub load_balance_interval: Duration,

    /// Upper bound on the number of events handed to one `process_events` call.
    pub max_batch_size: usize,
    /// Upper bound on the time a pump waits for the first event of a batch.
    pub max_wait_time: Duration,
    /// Upper bound on the wait for a cancelled pump to return its handler. A pump still busy in
    /// a handler callback past this bound is aborted without its close hook.
    pub pump_stop_timeout: Duration,

    /// Start position for partitions without a checkpoint.
    pub initial_event_position: EventPosition,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            owner_id: Uuid::new_v4().to_string(),
            stream_id: String::new(),
            consumer_group: DEFAULT_CONSUMER_GROUP.into(),
            inactive_time_limit: DEFAULT_INACTIVE_TIME_LIMIT,
            load_balance_interval: DEFAULT_LOAD_BALANCE_INTERVAL,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_wait_time: DEFAULT_MAX_WAIT_TIME,
            pump_stop_timeout: DEFAULT_PUMP_STOP_TIMEOUT,
            initial_event_position: EventPosition::Earliest,
        }
    }
}

impl ProcessorConfig {
    /// Default configuration for the given stream, with a random owner id.
    pub fn for_stream(stream_id: &str) -> Self {
        Self {
            stream_id: stream_id.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.owner_id.is_empty() {
            return Err(ConfigError::EmptyField("owner_id"));
        }

        if self.stream_id.is_empty() {
            return Err(ConfigError::EmptyField("stream_id"));
        }

        if self.consumer_group.is_empty() {
            return Err(ConfigError::EmptyField("consumer_group"));
        }

        if self.max_batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }

        for (field, duration) in [
            ("inactive_time_limit", self.inactive_time_limit),
            ("load_balance_interval", self.load_balance_interval),
            ("max_wait_time", self.max_wait_time),
            ("pump_stop_timeout", self.pump_stop_timeout),
        ] {
            if duration.is_zero() {
                return Err(ConfigError::ZeroDuration(field));
            }
        }

        // renewals happen once per pass; a shorter limit lets peers steal healthy partitions
        if self.inactive_time_limit <= self.load_balance_interval {
            return Err(ConfigError::InactiveTimeLimitTooShort {
                inactive_time_limit: self.inactive_time_limit,
                load_balance_interval: self.load_balance_interval,
            });
        }

        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    EmptyField(&'static str),
    ZeroBatchSize,
    ZeroDuration(&'static str),
    InactiveTimeLimitTooShort {
        inactive_time_limit: Duration,
        load_balance_interval: Duration,
    },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::EmptyField(field) => write!(f, "Config field {} must not be empty.", field),
            ConfigError::ZeroBatchSize => write!(f, "max_batch_size must be at least 1."),
            ConfigError::ZeroDuration(field) => {
                write!(f, "Config duration {} must be non-zero.", field)
            }
            ConfigError::InactiveTimeLimitTooShort {
                inactive_time_limit,
                load_balance_interval,
            } => write!(
                f,
                "inactive_time_limit {:?} must exceed load_balance_interval {:?}.",
                inactive_time_limit, load_balance_interval
            ),
        }
    }
}

impl Error for ConfigError {}
