//! Reconciler configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FeedError, Result};
use crate::feed::{ContainerConfig, FeedProfile};
use crate::identity::IdentityCacheConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Application whose shards are queried
    #[serde(default = "default_app_name")]
    pub app_name: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
        }
    }
}

fn default_app_name() -> String { "feed".to_string() }

/// Per-round reconciliation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Independent confirmations required from every shard
    #[serde(default = "default_quorum")]
    pub quorum: usize,

    /// Ceiling on pending-reference backfill rounds
    #[serde(default = "default_max_backfill_rounds")]
    pub max_backfill_rounds: usize,

    /// How long one phase of a round may wait for responses
    #[serde(default = "default_round_timeout_ms")]
    pub round_timeout_ms: u64,

    /// Items requested from each shard per page
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Items held per feed before the oldest are evicted
    #[serde(default = "default_container_capacity")]
    pub container_capacity: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            quorum: default_quorum(),
            max_backfill_rounds: default_max_backfill_rounds(),
            round_timeout_ms: default_round_timeout_ms(),
            page_size: default_page_size(),
            container_capacity: default_container_capacity(),
        }
    }
}

fn default_quorum() -> usize { 2 }
fn default_max_backfill_rounds() -> usize { 3 }
fn default_round_timeout_ms() -> u64 { 30_000 }
fn default_page_size() -> usize { 30 }
fn default_container_capacity() -> usize { 300 }

impl ReconcileConfig {
    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }

    pub fn container(&self, profile: &dyn FeedProfile) -> ContainerConfig {
        ContainerConfig {
            policy: profile.merge_policy(),
            grouping: profile.grouping(),
            capacity: Some(self.container_capacity),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_identity_entries")]
    pub max_entries: usize,

    #[serde(default = "default_identity_ttl")]
    pub ttl_secs: u64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            max_entries: default_identity_entries(),
            ttl_secs: default_identity_ttl(),
        }
    }
}

fn default_identity_entries() -> usize { 10_000 }
fn default_identity_ttl() -> u64 { 3600 }

impl IdentityConfig {
    pub fn cache_config(&self) -> IdentityCacheConfig {
        IdentityCacheConfig {
            ttl: Duration::from_secs(self.ttl_secs),
            max_entries: self.max_entries,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String { "info".to_string() }

impl Config {
    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.reconcile.quorum == 0 {
            return Err(FeedError::Config("reconcile.quorum must be at least 1".into()));
        }
        if self.reconcile.page_size == 0 {
            return Err(FeedError::Config("reconcile.page_size must be at least 1".into()));
        }
        if self.reconcile.container_capacity == 0 {
            return Err(FeedError::Config(
                "reconcile.container_capacity must be at least 1".into(),
            ));
        }
        if self.identity.max_entries == 0 {
            return Err(FeedError::Config("identity.max_entries must be at least 1".into()));
        }
        if self.network.app_name.trim().is_empty() {
            return Err(FeedError::Config("network.app_name must not be empty".into()));
        }
        Ok(())
    }
}
