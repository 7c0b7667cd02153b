//! Configuration management for Floodgate.
//!
//! Two sources feed the limiter: service-wide settings from CLI flags with
//! environment fallbacks, and key-specific rules from an optional JSON file
//! that may change at runtime.

use clap::Parser;
use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::error;

use crate::error::{FloodgateError, Result};
use crate::limiter::{LimiterConfig, DEFAULT_SHARDS};

/// Upper bound for every client- or operator-supplied limit value.
pub const LIMIT_MAX: i64 = 1_000_000_000;

/// Service-wide settings.
#[derive(Parser, Debug, Clone)]
#[command(name = "floodgate")]
#[command(version, about = "An in-memory rate limiter with a fixed time window", long_about = None)]
pub struct ServiceConfig {
    /// Port to listen on (0 picks an ephemeral port)
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Default max requests per window per key
    #[arg(long, env = "MAX_REQUESTS", default_value_t = 100)]
    pub max_requests: i64,

    /// Default max requests in queue per key
    #[arg(long, env = "MAX_REQUESTS_IN_QUEUE", default_value_t = 400)]
    pub max_requests_in_queue: i64,

    /// Default window size in milliseconds
    #[arg(long, env = "WINDOW_MILLIS", default_value_t = 1000)]
    pub window_millis: i64,

    /// Allow clients to set their own rate via query parameter
    #[arg(long, env = "REQUESTS_CAN_SET_RATE", default_value_t = true, action = clap::ArgAction::Set)]
    pub requests_can_set_rate: bool,

    /// Allow clients to set their own queue size via query parameter
    #[arg(long, env = "REQUESTS_CAN_MOD_QUEUE", default_value_t = true, action = clap::ArgAction::Set)]
    pub requests_can_mod_queue: bool,

    /// Path to a JSON file with key-specific rate limits
    #[arg(long, env = "CONFIG_FILE")]
    pub config_file: Option<String>,

    /// Number of manager shards
    #[arg(long, env = "SHARDS", default_value_t = DEFAULT_SHARDS)]
    pub shards: usize,

    /// For distributed mode, the peer instance urls (including this instance)
    #[arg(long, env = "PEER_URLS", value_delimiter = ',')]
    pub peer_urls: Vec<String>,

    /// Log format: json or text
    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level: debug, info, warn or error
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl ServiceConfig {
    /// The global limiter defaults applied to keys with no matching file rule.
    pub fn limiter_config(&self) -> LimiterConfig {
        LimiterConfig {
            window_millis: self.window_millis,
            max_requests_per_window: self.max_requests,
            max_requests_in_queue: self.max_requests_in_queue,
        }
    }

    /// Bounds-check the numeric settings and parse the peer urls.
    pub fn validate(self) -> Result<ValidatedConfig> {
        check_range("window-millis", self.window_millis, 10, 3_600_000)?;
        check_range("max-requests", self.max_requests, 1, LIMIT_MAX)?;
        check_range("max-requests-in-queue", self.max_requests_in_queue, 0, LIMIT_MAX)?;
        check_range("shards", self.shards as i64, 1, 100)?;
        if self.log_format != "json" && self.log_format != "text" {
            return Err(FloodgateError::Config(format!(
                "log-format must be one of [json, text], got '{}'",
                self.log_format
            )));
        }
        if !matches!(
            self.log_level.to_ascii_lowercase().as_str(),
            "debug" | "info" | "warn" | "error"
        ) {
            return Err(FloodgateError::Config(format!(
                "log-level must be one of [debug, info, warn, error], got '{}'",
                self.log_level
            )));
        }

        let mut peers = Vec::with_capacity(self.peer_urls.len());
        let mut seen = HashSet::new();
        for raw in &self.peer_urls {
            let raw = raw.trim();
            if raw.is_empty() {
                return Err(FloodgateError::Config("peer url is empty".to_string()));
            }
            let url = Url::parse(raw)
                .map_err(|e| FloodgateError::Config(format!("invalid peer url '{raw}': {e}")))?;
            if url.cannot_be_a_base() || url.host_str().is_none() {
                return Err(FloodgateError::Config(format!(
                    "peer url '{raw}' is not absolute, only absolute urls are supported"
                )));
            }
            if !seen.insert(url.as_str().to_string()) {
                return Err(FloodgateError::Config("duplicate peer urls provided".to_string()));
            }
            peers.push(url);
        }
        if peers.len() == 1 {
            return Err(FloodgateError::Config(
                "only one peer url provided, distributed mode requires at least 2. \
                 Omit this setting to run in single instance mode"
                    .to_string(),
            ));
        }

        Ok(ValidatedConfig { service: self, peers })
    }
}

fn check_range(name: &str, value: i64, min: i64, max: i64) -> Result<()> {
    if value < min || value > max {
        return Err(FloodgateError::Config(format!(
            "{name} must be in [{min}, {max}], got {value}"
        )));
    }
    Ok(())
}

/// Settings after startup validation, with the peer urls parsed.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub service: ServiceConfig,
    pub peers: Vec<Url>,
}

impl ValidatedConfig {
    /// True when this process is one of several peers sharing the key space.
    pub fn distributed(&self) -> bool {
        !self.peers.is_empty()
    }
}

/// Key-specific rate limit rules loaded from a JSON file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub keys: Vec<KeyRule>,
}

/// One rule in the config file.
///
/// Rules are applied in file order: every rule whose pattern matches a key
/// overlays its non-zero fields onto the accumulating config, so a catch-all
/// rule can be refined by later, more specific ones. Zero means inherit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyRule {
    #[serde(default)]
    pub key_pattern: String,
    #[serde(default)]
    pub key_pattern_is_regex: bool,
    #[serde(default)]
    pub max_requests_per_window: i64,
    #[serde(default)]
    pub max_requests_in_queue: i64,
    #[serde(default)]
    pub window_millis: i64,
}

impl KeyRule {
    /// Whether this rule applies to `key`. A pattern that fails to compile
    /// matches nothing.
    pub fn matches(&self, key: &str) -> bool {
        if self.key_pattern_is_regex {
            match Regex::new(&self.key_pattern) {
                Ok(re) => re.is_match(key),
                Err(e) => {
                    error!(pattern = %self.key_pattern, error = %e, "Failed to compile key pattern");
                    false
                }
            }
        } else {
            self.key_pattern == key
        }
    }
}

impl FileConfig {
    /// Parse a configuration from a JSON string.
    pub fn from_json(data: &str) -> Result<Self> {
        serde_json::from_str(data)
            .map_err(|e| FloodgateError::Config(format!("failed to parse config file: {e}")))
    }

    /// Load a configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&contents)
    }

    /// Write the configuration back out as JSON.
    pub fn write_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let data = serde_json::to_string(self)
            .map_err(|e| FloodgateError::Config(format!("failed to serialize config: {e}")))?;
        std::fs::write(path, data)?;
        Ok(())
    }
}
