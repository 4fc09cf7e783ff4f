//! Ingestion configuration.
//!
//! Loaded from an optional YAML file; every field has a default. The binary
//! layers CLI flags and `FPMM_RPC_URLS` on top before calling [`IngestConfig::validate`].

use std::path::Path;
use std::time::Duration;

use alloy::primitives::Address;
use fpmm_decode::{addresses, DecoderConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::{Backoff, RetryPolicy};
use crate::scheduler::DispatchPolicy;

/// Environment variable holding a comma-separated provider list.
pub const RPC_URLS_ENV: &str = "FPMM_RPC_URLS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("at least one RPC provider is required")]
    NoProviders,
    #[error("`{field}` must be greater than zero")]
    Zero { field: &'static str },
    #[error("{workers} workers cannot cover {providers} providers")]
    TooFewWorkers { workers: usize, providers: usize },
    #[error("`{field}` is not a valid address: {value}")]
    InvalidAddress { field: &'static str, value: String },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchKind {
    #[default]
    SharedQueue,
    StaticChunks,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub providers: Vec<String>,
    /// Defaults to twice the provider count.
    pub workers: Option<usize>,
    pub dispatch: DispatchKind,
    pub pacing_ms: u64,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub backoff: BackoffKind,
    pub request_timeout_ms: u64,
    pub batch_size: usize,
    pub collateral_token: String,
    pub conditional_tokens: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            workers: None,
            dispatch: DispatchKind::SharedQueue,
            pacing_ms: 200,
            max_attempts: 3,
            retry_backoff_ms: 500,
            backoff: BackoffKind::Fixed,
            request_timeout_ms: 30_000,
            batch_size: 2000,
            collateral_token: format!("{:#x}", addresses::USDC),
            conditional_tokens: addresses::CONDITIONAL_TOKENS.to_checksum(None),
        }
    }
}

impl IngestConfig {
    /// Reads a YAML config file. Missing keys take their defaults.
    ///
    /// # Errors
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Appends comma-separated endpoints, skipping blanks and duplicates.
    pub fn add_providers(&mut self, list: &str) {
        for endpoint in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            if !self.providers.iter().any(|known| known == endpoint) {
                self.providers.push(endpoint.to_string());
            }
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or(self.providers.len() * 2)
    }

    /// # Errors
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.providers.is_empty() {
            return Err(ConfigError::NoProviders);
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Zero {
                field: "max_attempts",
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Zero { field: "batch_size" });
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Zero {
                field: "request_timeout_ms",
            });
        }
        let workers = self.worker_count();
        if workers == 0 {
            return Err(ConfigError::Zero { field: "workers" });
        }
        if self.dispatch == DispatchKind::SharedQueue && workers < self.providers.len() {
            return Err(ConfigError::TooFewWorkers {
                workers,
                providers: self.providers.len(),
            });
        }
        self.decoder_config()?;
        Ok(())
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let base = Duration::from_millis(self.retry_backoff_ms);
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: match self.backoff {
                BackoffKind::Fixed => Backoff::Fixed(base),
                BackoffKind::Exponential => Backoff::Exponential(base),
            },
        }
    }

    pub fn dispatch_policy(&self) -> DispatchPolicy {
        match self.dispatch {
            DispatchKind::SharedQueue => DispatchPolicy::SharedQueue {
                workers: self.worker_count(),
            },
            DispatchKind::StaticChunks => DispatchPolicy::StaticChunks,
        }
    }

    /// # Errors
    /// Returns [`ConfigError::InvalidAddress`] for a malformed contract address.
    pub fn decoder_config(&self) -> Result<DecoderConfig, ConfigError> {
        Ok(DecoderConfig {
            collateral_token: parse_address("collateral_token", &self.collateral_token)?,
            conditional_tokens: parse_address("conditional_tokens", &self.conditional_tokens)?,
        })
    }
}

fn parse_address(field: &'static str, value: &str) -> Result<Address, ConfigError> {
    value
        .trim()
        .parse::<Address>()
        .map_err(|_| ConfigError::InvalidAddress {
            field,
            value: value.to_string(),
        })
}
