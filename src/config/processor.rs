//! Change feed processor options
//!
//! Controls how a host competes for leases and how it pumps the partitions it
//! owns.
//!
//! # Usage
//!
//! ```toml
//! [processor]
//! lease_renew_interval_ms = 17000
//! lease_acquire_interval_ms = 13000
//! lease_expiration_interval_ms = 60000
//! feed_poll_delay_ms = 5000
//! max_items_per_batch = 100
//! max_scale_count = 0   # 0 = bounded only by the partition count
//! ```

use std::time::Duration;
use std::time::SystemTime;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::utils::millis_since_epoch;
use crate::ChangeFeedStartFrom;
use crate::Error;
use crate::Result;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChangeFeedProcessorOptions {
    /// How often this host re-asserts ownership of the leases it holds
    #[serde(default = "default_lease_renew_interval_ms")]
    pub lease_renew_interval_ms: u64,

    /// How often this host scans the lease container for leases to take
    #[serde(default = "default_lease_acquire_interval_ms")]
    pub lease_acquire_interval_ms: u64,

    /// How long an unrenewed lease stays owned before other hosts may take it
    ///
    /// Must be greater than `lease_renew_interval_ms`.
    #[serde(default = "default_lease_expiration_interval_ms")]
    pub lease_expiration_interval_ms: u64,

    /// Idle wait before re-polling a partition that returned no changes,
    /// also the retry delay after a delegate failure
    #[serde(default = "default_feed_poll_delay_ms")]
    pub feed_poll_delay_ms: u64,

    /// Upper bound of items handed to the delegate in one batch
    #[serde(default = "default_max_items_per_batch")]
    pub max_items_per_batch: usize,

    /// Upper bound on the leases one host holds (0 = unlimited)
    #[serde(default)]
    pub max_scale_count: usize,

    /// Prefix for every document this processor writes into the lease container
    #[serde(default)]
    pub lease_prefix: String,

    /// Read newly discovered partitions from the beginning of the feed
    #[serde(default)]
    pub start_from_beginning: bool,

    /// Read newly discovered partitions starting at this wall-clock time
    /// (epoch milliseconds)
    #[serde(default)]
    pub start_time_ms: Option<u64>,

    /// Upper bound on how long `stop()` waits for in-flight batches
    /// (unset = wait for them to finish)
    #[serde(default)]
    pub shutdown_timeout_ms: Option<u64>,
}

impl Default for ChangeFeedProcessorOptions {
    fn default() -> Self {
        Self {
            lease_renew_interval_ms: default_lease_renew_interval_ms(),
            lease_acquire_interval_ms: default_lease_acquire_interval_ms(),
            lease_expiration_interval_ms: default_lease_expiration_interval_ms(),
            feed_poll_delay_ms: default_feed_poll_delay_ms(),
            max_items_per_batch: default_max_items_per_batch(),
            max_scale_count: 0,
            lease_prefix: String::new(),
            start_from_beginning: false,
            start_time_ms: None,
            shutdown_timeout_ms: None,
        }
    }
}

impl ChangeFeedProcessorOptions {
    pub fn validate(&self) -> Result<()> {
        if self.lease_renew_interval_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "lease_renew_interval_ms must be greater than 0".into(),
            )));
        }

        if self.lease_acquire_interval_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "lease_acquire_interval_ms must be greater than 0".into(),
            )));
        }

        if self.feed_poll_delay_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "feed_poll_delay_ms must be greater than 0".into(),
            )));
        }

        if self.lease_renew_interval_ms >= self.lease_expiration_interval_ms {
            return Err(Error::Config(ConfigError::Message(format!(
                "lease_renew_interval_ms {}ms must be less than lease_expiration_interval_ms {}ms",
                self.lease_renew_interval_ms, self.lease_expiration_interval_ms
            ))));
        }

        if self.max_items_per_batch == 0 {
            return Err(Error::Config(ConfigError::Message(
                "max_items_per_batch must be > 0".into(),
            )));
        }

        if self.start_from_beginning && self.start_time_ms.is_some() {
            return Err(Error::Config(ConfigError::Message(
                "start_from_beginning and start_time_ms are mutually exclusive".into(),
            )));
        }

        Ok(())
    }

    pub fn with_start_time(
        mut self,
        start_time: SystemTime,
    ) -> Self {
        self.start_time_ms = Some(millis_since_epoch(start_time));
        self
    }

    pub fn lease_renew_interval(&self) -> Duration {
        Duration::from_millis(self.lease_renew_interval_ms)
    }

    pub fn lease_acquire_interval(&self) -> Duration {
        Duration::from_millis(self.lease_acquire_interval_ms)
    }

    pub fn lease_expiration_interval(&self) -> Duration {
        Duration::from_millis(self.lease_expiration_interval_ms)
    }

    pub fn feed_poll_delay(&self) -> Duration {
        Duration::from_millis(self.feed_poll_delay_ms)
    }

    pub fn shutdown_timeout(&self) -> Option<Duration> {
        self.shutdown_timeout_ms.map(Duration::from_millis)
    }

    /// Initial cursor for leases that have no continuation yet.
    pub fn initial_start_from(&self) -> ChangeFeedStartFrom {
        if let Some(ms) = self.start_time_ms {
            ChangeFeedStartFrom::PointInTime(ms)
        } else if self.start_from_beginning {
            ChangeFeedStartFrom::Beginning
        } else {
            ChangeFeedStartFrom::Now
        }
    }
}

fn default_lease_renew_interval_ms() -> u64 {
    17_000
}
fn default_lease_acquire_interval_ms() -> u64 {
    13_000
}
fn default_lease_expiration_interval_ms() -> u64 {
    60_000
}
fn default_feed_poll_delay_ms() -> u64 {
    5_000
}
fn default_max_items_per_batch() -> usize {
    100
}
