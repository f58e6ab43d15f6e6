//! Change feed processor configuration

use crate::error::{ChangeFeedError, Result};
use crate::state::{ChangeFeedMode, ChangeFeedStartFrom};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Options shared by every component of one processor host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorOptions {
    /// Identity written into `Lease.owner`; unique per host
    pub host_name: String,

    /// Prefix of every lease document id, allowing several processors to share
    /// one lease container
    pub lease_prefix: String,

    /// How often an owned lease is renewed
    pub lease_renew_interval: Duration,

    /// How often the load balancer looks for leases to take
    pub lease_acquire_interval: Duration,

    /// A lease not renewed within this interval is considered abandoned
    pub lease_expiration_interval: Duration,

    /// Back-off after a page without changes
    pub feed_poll_delay: Duration,

    /// How often a supervisor checks its processor and renewer
    pub supervisor_poll_interval: Duration,

    /// Time-to-live of the store-wide bootstrap lock
    pub initialization_lock_duration: Duration,

    /// Host-level wait between bootstrap attempts while another host holds the lock
    pub bootstrap_retry_delay: Duration,

    /// Maximum number of changes per page
    pub max_items_per_page: usize,

    /// Starting point for ranges without a continuation
    pub start_from: ChangeFeedStartFrom,

    /// Which changes are reported
    pub mode: ChangeFeedMode,

    /// Lower bound of leases this host aims to own (0 = none)
    pub min_partition_count: usize,

    /// Upper bound of leases this host will own (0 = unbounded)
    pub max_partition_count: usize,

    /// Leave child leases created by a split for the load balancer instead of
    /// acquiring them on the host that observed the split
    pub skip_direct_split_assignment: bool,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            host_name: format!("host-{}", uuid::Uuid::new_v4()),
            lease_prefix: String::new(),
            lease_renew_interval: Duration::from_secs(17),
            lease_acquire_interval: Duration::from_secs(13),
            lease_expiration_interval: Duration::from_secs(60),
            feed_poll_delay: Duration::from_secs(5),
            supervisor_poll_interval: Duration::from_millis(100),
            initialization_lock_duration: Duration::from_secs(60),
            bootstrap_retry_delay: Duration::from_secs(1),
            max_items_per_page: 100,
            start_from: ChangeFeedStartFrom::Beginning,
            mode: ChangeFeedMode::Incremental,
            min_partition_count: 0,
            max_partition_count: 0,
            skip_direct_split_assignment: false,
        }
    }
}

impl ProcessorOptions {
    pub fn builder() -> ProcessorOptionsBuilder {
        ProcessorOptionsBuilder::new()
    }

    /// Short intervals suitable for tests and local simulation
    pub fn for_testing(host_name: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
            lease_renew_interval: Duration::from_millis(50),
            lease_acquire_interval: Duration::from_millis(50),
            lease_expiration_interval: Duration::from_millis(500),
            feed_poll_delay: Duration::from_millis(10),
            supervisor_poll_interval: Duration::from_millis(10),
            initialization_lock_duration: Duration::from_secs(5),
            bootstrap_retry_delay: Duration::from_millis(20),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.host_name.trim().is_empty() {
            return Err(ChangeFeedError::config("host_name must not be empty"));
        }
        let intervals = [
            ("lease_renew_interval", self.lease_renew_interval),
            ("lease_acquire_interval", self.lease_acquire_interval),
            ("lease_expiration_interval", self.lease_expiration_interval),
            ("supervisor_poll_interval", self.supervisor_poll_interval),
            ("initialization_lock_duration", self.initialization_lock_duration),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(ChangeFeedError::config(format!("{} must be positive", name)));
            }
        }
        if self.lease_expiration_interval <= self.lease_renew_interval {
            return Err(ChangeFeedError::config(format!(
                "lease_expiration_interval ({:?}) must exceed lease_renew_interval ({:?})",
                self.lease_expiration_interval, self.lease_renew_interval
            )));
        }
        if self.max_items_per_page == 0 {
            return Err(ChangeFeedError::config("max_items_per_page must be positive"));
        }
        if self.max_partition_count > 0 && self.min_partition_count > self.max_partition_count {
            return Err(ChangeFeedError::config(format!(
                "min_partition_count {} exceeds max_partition_count {}",
                self.min_partition_count, self.max_partition_count
            )));
        }
        Ok(())
    }
}

/// Builder for processor options
#[derive(Debug, Default)]
pub struct ProcessorOptionsBuilder {
    options: ProcessorOptions,
}

impl ProcessorOptionsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host_name(mut self, name: impl Into<String>) -> Self {
        self.options.host_name = name.into();
        self
    }

    pub fn lease_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.options.lease_prefix = prefix.into();
        self
    }

    pub fn lease_renew_interval(mut self, interval: Duration) -> Self {
        self.options.lease_renew_interval = interval;
        self
    }

    pub fn lease_acquire_interval(mut self, interval: Duration) -> Self {
        self.options.lease_acquire_interval = interval;
        self
    }

    pub fn lease_expiration_interval(mut self, interval: Duration) -> Self {
        self.options.lease_expiration_interval = interval;
        self
    }

    pub fn feed_poll_delay(mut self, delay: Duration) -> Self {
        self.options.feed_poll_delay = delay;
        self
    }

    pub fn max_items_per_page(mut self, max: usize) -> Self {
        self.options.max_items_per_page = max;
        self
    }

    pub fn start_from(mut self, start_from: ChangeFeedStartFrom) -> Self {
        self.options.start_from = start_from;
        self
    }

    pub fn mode(mut self, mode: ChangeFeedMode) -> Self {
        self.options.mode = mode;
        self
    }

    pub fn partition_count_bounds(mut self, min: usize, max: usize) -> Self {
        self.options.min_partition_count = min;
        self.options.max_partition_count = max;
        self
    }

    pub fn skip_direct_split_assignment(mut self, skip: bool) -> Self {
        self.options.skip_direct_split_assignment = skip;
        self
    }

    pub fn build(self) -> Result<ProcessorOptions> {
        self.options.validate()?;
        Ok(self.options)
    }
}
