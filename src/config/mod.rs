//! Client configuration
//!
//! Values mirror the Kafka consumer properties the coordination engine reads.
//! Every field has a serde default so partial JSON documents load cleanly.

use crate::error::{ConsumerError, Result};
use serde::{Deserialize, Serialize};

/// How share-group records are acknowledged by the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcknowledgementMode {
    /// Records delivered by a poll are accepted by the next poll or commit
    #[default]
    Implicit,
    /// Every record must be acknowledged explicitly
    Explicit,
}

/// Configuration for consumer, share and streams group members
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Group the member joins
    #[serde(default)]
    pub group_id: String,

    /// Static membership instance id
    #[serde(default)]
    pub group_instance_id: Option<String>,

    /// Client id reported to brokers
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Rack of the client, used by rack-aware assignors
    #[serde(default)]
    pub client_rack: Option<String>,

    /// Server-side assignor requested by the member
    #[serde(default)]
    pub group_remote_assignor: Option<String>,

    /// Base backoff after a failed request
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Upper bound for the exponential backoff
    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,

    /// Randomization applied to every backoff, as a fraction
    #[serde(default = "default_retry_backoff_jitter")]
    pub retry_backoff_jitter: f64,

    /// Per-request timeout on the network client
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Timeout for blocking API calls that take no explicit deadline
    #[serde(default = "default_api_timeout_ms")]
    pub default_api_timeout_ms: u64,

    /// Maximum time between application polls before the member leaves the group
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u64,

    /// Upper bound on a single background network poll
    #[serde(default = "default_network_poll_timeout_ms")]
    pub network_poll_timeout_ms: u64,

    /// Share group acknowledgement mode
    #[serde(default)]
    pub share_acknowledgement_mode: AcknowledgementMode,

    /// Maximum time a broker waits to fill a fetch
    #[serde(default = "default_fetch_max_wait_ms")]
    pub fetch_max_wait_ms: u32,

    /// Minimum bytes a broker accumulates before answering a fetch
    #[serde(default = "default_fetch_min_bytes")]
    pub fetch_min_bytes: u32,

    /// Maximum bytes returned by a fetch
    #[serde(default = "default_fetch_max_bytes")]
    pub fetch_max_bytes: u32,

    /// Maximum records returned by one application poll
    #[serde(default = "default_max_poll_records")]
    pub max_poll_records: u32,
}

fn default_client_id() -> String {
    "streamline-client".to_string()
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_retry_backoff_max_ms() -> u64 {
    1000
}

fn default_retry_backoff_jitter() -> f64 {
    0.2
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_api_timeout_ms() -> u64 {
    60_000
}

fn default_max_poll_interval_ms() -> u64 {
    300_000
}

fn default_network_poll_timeout_ms() -> u64 {
    5_000
}

fn default_fetch_max_wait_ms() -> u32 {
    500
}

fn default_fetch_min_bytes() -> u32 {
    1
}

fn default_fetch_max_bytes() -> u32 {
    50 * 1024 * 1024
}

fn default_max_poll_records() -> u32 {
    500
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: String::new(),
            group_instance_id: None,
            client_id: default_client_id(),
            client_rack: None,
            group_remote_assignor: None,
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
            retry_backoff_jitter: default_retry_backoff_jitter(),
            request_timeout_ms: default_request_timeout_ms(),
            default_api_timeout_ms: default_api_timeout_ms(),
            max_poll_interval_ms: default_max_poll_interval_ms(),
            network_poll_timeout_ms: default_network_poll_timeout_ms(),
            share_acknowledgement_mode: AcknowledgementMode::default(),
            fetch_max_wait_ms: default_fetch_max_wait_ms(),
            fetch_min_bytes: default_fetch_min_bytes(),
            fetch_max_bytes: default_fetch_max_bytes(),
            max_poll_records: default_max_poll_records(),
        }
    }
}

impl ConsumerConfig {
    /// Create a new config builder
    pub fn builder() -> ConsumerConfigBuilder {
        ConsumerConfigBuilder::new()
    }

    /// Load a configuration from a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        let config: ConsumerConfig = serde_json::from_str(json)
            .map_err(|e| ConsumerError::config("json", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.group_id.trim().is_empty() {
            return Err(ConsumerError::config("group_id", "must not be empty"));
        }

        if let Some(instance_id) = &self.group_instance_id {
            if instance_id.trim().is_empty() {
                return Err(ConsumerError::config(
                    "group_instance_id",
                    "must not be blank when set",
                ));
            }
        }

        if self.retry_backoff_max_ms < self.retry_backoff_ms {
            return Err(ConsumerError::config(
                "retry_backoff_max_ms",
                format!(
                    "({}) must not be lower than retry_backoff_ms ({})",
                    self.retry_backoff_max_ms, self.retry_backoff_ms
                ),
            ));
        }

        if !(0.0..1.0).contains(&self.retry_backoff_jitter) {
            return Err(ConsumerError::config(
                "retry_backoff_jitter",
                "must be in the range [0, 1)",
            ));
        }

        if self.request_timeout_ms == 0 {
            return Err(ConsumerError::config("request_timeout_ms", "must be positive"));
        }

        if self.max_poll_interval_ms == 0 {
            return Err(ConsumerError::config("max_poll_interval_ms", "must be positive"));
        }

        if self.max_poll_records == 0 {
            return Err(ConsumerError::config("max_poll_records", "must be at least 1"));
        }

        Ok(())
    }

    /// Rebalance timeout sent in heartbeats
    pub fn rebalance_timeout_ms(&self) -> i32 {
        i32::try_from(self.max_poll_interval_ms).unwrap_or(i32::MAX)
    }
}

/// Builder for ConsumerConfig
pub struct ConsumerConfigBuilder {
    config: ConsumerConfig,
}

impl ConsumerConfigBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self {
            config: ConsumerConfig::default(),
        }
    }

    /// Set the group id
    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.config.group_id = group_id.into();
        self
    }

    /// Use static membership with the given instance id
    pub fn group_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.config.group_instance_id = Some(instance_id.into());
        self
    }

    /// Set the client id
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config.client_id = client_id.into();
        self
    }

    /// Set the client rack
    pub fn client_rack(mut self, rack: impl Into<String>) -> Self {
        self.config.client_rack = Some(rack.into());
        self
    }

    /// Request a server-side assignor
    pub fn group_remote_assignor(mut self, assignor: impl Into<String>) -> Self {
        self.config.group_remote_assignor = Some(assignor.into());
        self
    }

    /// Set base and maximum retry backoff
    pub fn retry_backoff(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.config.retry_backoff_ms = base_ms;
        self.config.retry_backoff_max_ms = max_ms;
        self
    }

    /// Set backoff jitter fraction
    pub fn retry_backoff_jitter(mut self, jitter: f64) -> Self {
        self.config.retry_backoff_jitter = jitter;
        self
    }

    /// Set the request timeout
    pub fn request_timeout_ms(mut self, timeout: u64) -> Self {
        self.config.request_timeout_ms = timeout;
        self
    }

    /// Set the default API timeout
    pub fn default_api_timeout_ms(mut self, timeout: u64) -> Self {
        self.config.default_api_timeout_ms = timeout;
        self
    }

    /// Set max poll interval
    pub fn max_poll_interval_ms(mut self, interval: u64) -> Self {
        self.config.max_poll_interval_ms = interval;
        self
    }

    /// Set the share acknowledgement mode
    pub fn share_acknowledgement_mode(mut self, mode: AcknowledgementMode) -> Self {
        self.config.share_acknowledgement_mode = mode;
        self
    }

    /// Set max poll records
    pub fn max_poll_records(mut self, records: u32) -> Self {
        self.config.max_poll_records = records;
        self
    }

    /// Build the config without validation
    pub fn build(self) -> ConsumerConfig {
        self.config
    }

    /// Build and validate the config
    pub fn build_validated(self) -> Result<ConsumerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConsumerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
