// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

use crate::constants::{
    DEFAULT_INGEST_INTERVAL, DEFAULT_INGEST_NOOP_INTERVAL, DEFAULT_INGEST_RETRY_INTERVAL,
    DEFAULT_NEGOTIATION_RETRY_INTERVAL, DEFAULT_REQUEST_TIMEOUT, MIN_SCHEDULER_WAIT,
};
use crate::envelope::ProtocolVersion;
use crate::errors::ConfigError;

/// Tags added to every envelope a relay sends. Tags already set on an envelope win.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tags {
    tags: BTreeMap<String, String>,
}

impl Tags {
    pub fn from_env_string(env_tags: &str) -> Self {
        let mut tags = BTreeMap::new();

        // Space-separated key:value tags are the standard for tagging. Comma-separated tags are
        // accepted as well.
        let normalized = env_tags.replace(',', " ");

        for kv in normalized.split_whitespace() {
            let parts = kv.split(':').collect::<Vec<&str>>();
            if parts.len() == 2 {
                tags.insert(parts[0].to_string(), parts[1].to_string());
            }
        }
        Self { tags }
    }

    pub fn new() -> Self {
        Self::default()
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

/// Delays between flush cycles, chosen by the outcome of the previous cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Intervals {
    /// After a successful flush.
    pub ingest: Duration,
    /// After a transient failure.
    pub ingest_retry: Duration,
    /// After a cycle with nothing to send.
    pub ingest_noop: Duration,
    /// After a failed negotiation.
    pub negotiation_retry: Duration,
    /// Remaining waits shorter than this are skipped.
    pub min_wait: Duration,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            ingest: DEFAULT_INGEST_INTERVAL,
            ingest_retry: DEFAULT_INGEST_RETRY_INTERVAL,
            ingest_noop: DEFAULT_INGEST_NOOP_INTERVAL,
            negotiation_retry: DEFAULT_NEGOTIATION_RETRY_INTERVAL,
            min_wait: MIN_SCHEDULER_WAIT,
        }
    }
}

/// Configuration of a relay process.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Bearer token for the ingest backend
    pub api_key: Option<String>,
    /// Backend base URL (scheme + host, optional path)
    pub base_url: String,
    /// Overrides the negotiation URL derived from `base_url`
    pub negotiation_url: Option<String>,
    /// Identifies this process among its peers on the distributed queues
    pub instance_id: String,
    /// Name of the channel the agent sends to
    pub channel: String,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
    /// Tags added to every envelope
    pub tags: Tags,
    /// Reported in `X-Run-Mode`
    pub run_mode: String,
    pub protocol_version: ProtocolVersion,
    pub intervals: Intervals,
    pub request_timeout: Duration,
    /// zstd level for request bodies; `None` sends them uncompressed
    pub compression_level: Option<i32>,
    /// HTTPS proxy URL
    pub https_proxy: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "http://localhost:8080".to_string(),
            negotiation_url: None,
            instance_id: uuid::Uuid::new_v4().to_string(),
            channel: "analytics".to_string(),
            log_level: "info".to_string(),
            tags: Tags::new(),
            run_mode: "server".to_string(),
            protocol_version: ProtocolVersion::default(),
            intervals: Intervals::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            compression_level: None,
            https_proxy: None,
        }
    }
}

fn env_duration(name: &str, default: Duration, from_number: fn(u64) -> Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|val| val.trim().parse::<u64>().ok())
        .map(from_number)
        .unwrap_or(default)
}

impl RelayConfig {
    /// Create configuration from `RELAY_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let api_key = env::var("RELAY_API_KEY").ok();
        let base_url = env::var("RELAY_BASE_URL")
            .map(|val| val.trim_end_matches('/').to_string())
            .unwrap_or(defaults.base_url);
        let negotiation_url = env::var("RELAY_NEGOTIATION_URL").ok();
        let instance_id = env::var("RELAY_INSTANCE_ID").unwrap_or(defaults.instance_id);
        let channel = env::var("RELAY_CHANNEL").unwrap_or(defaults.channel);
        let log_level = env::var("RELAY_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or(defaults.log_level);
        let tags = env::var("RELAY_TAGS")
            .map(|val| Tags::from_env_string(&val))
            .unwrap_or_default();
        let run_mode = env::var("RELAY_RUN_MODE").unwrap_or(defaults.run_mode);
        let protocol_version = match env::var("RELAY_PROTOCOL_VERSION") {
            Ok(val) => val.parse().map_err(ConfigError::InvalidConfig)?,
            Err(_) => defaults.protocol_version,
        };

        let intervals = Intervals {
            ingest: env_duration(
                "RELAY_INGEST_INTERVAL_SECS",
                DEFAULT_INGEST_INTERVAL,
                Duration::from_secs,
            ),
            ingest_retry: env_duration(
                "RELAY_INGEST_RETRY_INTERVAL_SECS",
                DEFAULT_INGEST_RETRY_INTERVAL,
                Duration::from_secs,
            ),
            ingest_noop: env_duration(
                "RELAY_INGEST_NOOP_INTERVAL_MS",
                DEFAULT_INGEST_NOOP_INTERVAL,
                Duration::from_millis,
            ),
            negotiation_retry: env_duration(
                "RELAY_NEGOTIATION_RETRY_SECS",
                DEFAULT_NEGOTIATION_RETRY_INTERVAL,
                Duration::from_secs,
            ),
            min_wait: MIN_SCHEDULER_WAIT,
        };
        let request_timeout = env_duration(
            "RELAY_REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT,
            Duration::from_secs,
        );
        let compression_level = match env::var("RELAY_COMPRESSION_LEVEL") {
            Ok(val) => Some(val.trim().parse::<i32>().map_err(|_| {
                ConfigError::InvalidConfig(format!("RELAY_COMPRESSION_LEVEL '{val}' is not a number"))
            })?),
            Err(_) => None,
        };
        let https_proxy = env::var("RELAY_HTTPS_PROXY")
            .or_else(|_| env::var("HTTPS_PROXY"))
            .ok();

        let config = Self {
            api_key,
            base_url,
            negotiation_url,
            instance_id,
            channel,
            log_level,
            tags,
            run_mode,
            protocol_version,
            intervals,
            request_timeout,
            compression_level,
            https_proxy,
        };

        config.validate()?;
        Ok(config)
    }

    /// URL of the negotiation handshake for this instance.
    pub fn negotiation_url(&self) -> String {
        match &self.negotiation_url {
            Some(url) => url.clone(),
            None => format!("{}/instances/{}/messaging", self.base_url, self.instance_id),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(ConfigError::InvalidConfig(format!(
                "RELAY_BASE_URL '{}' must be an http or https URL",
                self.base_url
            )));
        }

        if self.instance_id.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "RELAY_INSTANCE_ID cannot be empty".to_string(),
            ));
        }

        // Channel names are embedded in queue names.
        if self.channel.trim().is_empty() || self.channel.contains('.') {
            return Err(ConfigError::InvalidConfig(format!(
                "Invalid channel name '{}'. Must be non-empty and contain no '.'",
                self.channel
            )));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        if self.intervals.ingest.is_zero() || self.intervals.ingest_retry.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "Ingest intervals must be greater than 0".to_string(),
            ));
        }

        // A no-op cycle that never waits would spin the scheduler.
        if self.intervals.ingest_noop.is_zero() || self.intervals.ingest_noop < self.intervals.min_wait
        {
            return Err(ConfigError::InvalidConfig(format!(
                "RELAY_INGEST_NOOP_INTERVAL_MS must be at least {}",
                self.intervals.min_wait.as_millis()
            )));
        }

        if self.intervals.negotiation_retry.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "RELAY_NEGOTIATION_RETRY_SECS must be greater than 0".to_string(),
            ));
        }

        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "RELAY_REQUEST_TIMEOUT_SECS must be greater than 0".to_string(),
            ));
        }

        if let Some(level) = self.compression_level {
            let range = zstd::compression_level_range();
            if !range.contains(&level) {
                return Err(ConfigError::InvalidConfig(format!(
                    "Compression level {level} outside {}..={}",
                    range.start(),
                    range.end()
                )));
            }
        }

        Ok(())
    }
}
