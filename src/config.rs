// src/config.rs

//! Manages backend configuration: loading, defaults, and validation.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use tracing::warn;

/// Configuration for the per-cluster health heartbeat loop.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HeartbeatConfig {
    /// Seconds between `/readyz` sweeps over all selected clusters.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub interval_secs: u64,
    /// Per-request probe timeout in seconds.
    #[serde(default = "default_heartbeat_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval_secs(),
            request_timeout_secs: default_heartbeat_request_timeout_secs(),
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_heartbeat_interval_secs() -> u64 {
    15
}
fn default_heartbeat_request_timeout_secs() -> u64 {
    5
}

/// Retry policy for per-cluster authentication recovery.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AuthRecoveryConfig {
    /// Maximum recovery attempts before a cluster is marked invalid.
    /// `0` disables recovery entirely: any failure is immediately terminal.
    #[serde(default = "default_auth_max_attempts")]
    pub max_attempts: u32,
    /// Backoff before the first retry, in milliseconds. Doubles per attempt.
    #[serde(default = "default_auth_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound on the backoff, in milliseconds.
    #[serde(default = "default_auth_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Interval between recovery progress notifications, in milliseconds.
    #[serde(default = "default_auth_progress_tick_ms")]
    pub progress_tick_ms: u64,
}

impl Default for AuthRecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_auth_max_attempts(),
            initial_backoff_ms: default_auth_initial_backoff_ms(),
            max_backoff_ms: default_auth_max_backoff_ms(),
            progress_tick_ms: default_auth_progress_tick_ms(),
        }
    }
}

fn default_auth_max_attempts() -> u32 {
    5
}
fn default_auth_initial_backoff_ms() -> u64 {
    2_000
}
fn default_auth_max_backoff_ms() -> u64 {
    60_000
}
fn default_auth_progress_tick_ms() -> u64 {
    1_000
}

/// Thresholds gating transport-failure-driven cluster rebuilds.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TransportConfig {
    /// Failures within the window required to trigger a rebuild.
    #[serde(default = "default_transport_failure_threshold")]
    pub failure_threshold: u32,
    /// Sliding failure window in seconds.
    #[serde(default = "default_transport_failure_window_secs")]
    pub failure_window_secs: u64,
    /// Minimum seconds between two rebuilds of the same cluster.
    #[serde(default = "default_transport_rebuild_cooldown_secs")]
    pub rebuild_cooldown_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_transport_failure_threshold(),
            failure_window_secs: default_transport_failure_window_secs(),
            rebuild_cooldown_secs: default_transport_rebuild_cooldown_secs(),
        }
    }
}

fn default_transport_failure_threshold() -> u32 {
    3
}
fn default_transport_failure_window_secs() -> u64 {
    30
}
fn default_transport_rebuild_cooldown_secs() -> u64 {
    60
}

/// Bounds for the per-selection response cache.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ResponseCacheConfig {
    /// Entry time-to-live in milliseconds.
    #[serde(default = "default_cache_ttl_ms")]
    pub ttl_ms: u64,
    /// Maximum number of entries. On overflow the cache is fully flushed.
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
}

impl Default for ResponseCacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_cache_ttl_ms(),
            max_entries: default_cache_max_entries(),
        }
    }
}

impl ResponseCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

fn default_cache_ttl_ms() -> u64 {
    30_000
}
fn default_cache_max_entries() -> usize {
    512
}

/// Retry policy for single-read fetches against a cluster API.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FetchConfig {
    /// Total attempts per fetch, including the first.
    #[serde(default = "default_fetch_max_attempts")]
    pub max_attempts: u32,
    /// Delay between attempts, in milliseconds.
    #[serde(default = "default_fetch_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_fetch_max_attempts(),
            retry_delay_ms: default_fetch_retry_delay_ms(),
        }
    }
}

impl FetchConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

fn default_fetch_max_attempts() -> u32 {
    3
}
fn default_fetch_retry_delay_ms() -> u64 {
    250
}

/// Buffer sizes and intervals for the aggregate stream endpoints.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StreamConfig {
    /// Capacity of the merged per-subscription event channel.
    #[serde(default = "default_event_entry_buffer")]
    pub event_entry_buffer: usize,
    /// Entries retained per scope for SSE reconnect replay.
    #[serde(default = "default_event_resume_buffer")]
    pub event_resume_buffer: usize,
    /// Seconds between SSE keep-alive comments.
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Seconds of upstream silence before a stream is considered stalled.
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            event_entry_buffer: default_event_entry_buffer(),
            event_resume_buffer: default_event_resume_buffer(),
            keep_alive_secs: default_keep_alive_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
        }
    }
}

impl StreamConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

fn default_event_entry_buffer() -> usize {
    256
}
fn default_event_resume_buffer() -> usize {
    512
}
fn default_keep_alive_secs() -> u64 {
    15
}
fn default_heartbeat_timeout_secs() -> u64 {
    45
}

/// The initial cluster selection applied at startup. The desktop shell feeds
/// subsequent changes through the runtime selection channel.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SelectionConfig {
    /// `"path:context"` selection strings, in display order.
    #[serde(default)]
    pub kubeconfigs: Vec<String>,
}

/// Bind address for the loopback HTTP facade.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FacadeConfig {
    #[serde(default = "default_facade_host")]
    pub host: String,
    /// Port `0` asks the OS for an ephemeral port; the chosen base URL is
    /// advertised to the UI after bind.
    #[serde(default)]
    pub port: u16,
}

impl Default for FacadeConfig {
    fn default() -> Self {
        Self {
            host: default_facade_host(),
            port: 0,
        }
    }
}

fn default_facade_host() -> String {
    "127.0.0.1".to_string()
}

/// Represents the final, validated backend configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub auth: AuthRecoveryConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub cache: ResponseCacheConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub streams: StreamConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub facade: FacadeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            heartbeat: HeartbeatConfig::default(),
            auth: AuthRecoveryConfig::default(),
            transport: TransportConfig::default(),
            cache: ResponseCacheConfig::default(),
            fetch: FetchConfig::default(),
            streams: StreamConfig::default(),
            selection: SelectionConfig::default(),
            facade: FacadeConfig::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Loads and validates the configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;
        config.validate();
        Ok(config)
    }

    /// Warns about configurations that are legal but almost certainly wrong.
    fn validate(&self) {
        if self.fetch.max_attempts == 0 {
            warn!("fetch.max_attempts is 0; every fetch will fail without being attempted.");
        }
        if self.auth.max_attempts == 0 {
            warn!(
                "auth.max_attempts is 0; auth recovery is disabled and any credential failure is terminal."
            );
        }
        if self.streams.event_resume_buffer == 0 {
            warn!("streams.event_resume_buffer is 0; SSE reconnects will always replay a snapshot.");
        }
        if self.facade.host != "127.0.0.1" && self.facade.host != "localhost" {
            warn!(
                "facade.host '{}' is not loopback; the facade is designed for local UI access only.",
                self.facade.host
            );
        }
    }
}
