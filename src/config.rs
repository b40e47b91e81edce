//! Configuration for the registry service and for replicating nodes.
//!
//! Configuration can be constructed programmatically or deserialized from
//! YAML/JSON. Durations are humantime strings (`"500ms"`, `"30s"`, `"5m"`)
//! parsed by the `*_duration()` accessors, which fall back to the default
//! when the string does not parse.
//!
//! # Configuration Structure
//!
//! ```text
//! RegistryConfig                     # topology registry (control plane)
//! ├── cloud_url: String              # root of every follow chain
//! ├── offline_threshold: String      # "5m"
//! ├── cas: CasConfig                 # conflict retry budget
//! └── store: StoreConfig             # SQLite registry table
//!
//! NodeConfig                         # one replicating node
//! ├── group / generation / local_url
//! ├── cloud_url / registry_url
//! ├── read: ReadConfig               # types, location, timeout
//! ├── registration: RegistrationConfig
//! ├── health_check: HealthCheckConfig
//! ├── service_list_path: String      # persisted follow chain
//! └── cursor: CursorConfig           # SQLite cursor persistence
//!
//! LogConfig                          # reference in-memory log
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! group: "store-0042"
//! generation: "2.14.0"
//! local_url: "http://10.0.4.12:8080/"
//! cloud_url: "https://pipe.example.com/"
//! registry_url: "https://registry.example.com/"
//! read:
//!   types: ["price", "stock"]
//!   location: "store-0042"
//!   timeout: "30s"
//! registration:
//!   interval: "30s"
//! cursor:
//!   sqlite_path: "/var/lib/pipe/cursor.db"
//! ```

use crate::error::{ReplicationError, Result};
use crate::resilience::RateLimitConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

fn parse_url(field: &str, value: &str) -> Result<Url> {
    Url::parse(value).map_err(|e| ReplicationError::Config(format!("{field}: {e}")))
}

fn default_true() -> bool {
    true
}

fn default_cloud_url() -> String {
    "http://localhost:8080/".to_string()
}

// ═══════════════════════════════════════════════════════════════════════════════
// RegistryConfig: the topology registry service
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration of a registry instance.
///
/// Several registry instances may share one store; they coordinate purely
/// through the version CAS on each group row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// URL of the origin pipe. Every follow chain ends with it.
    #[serde(default = "default_cloud_url")]
    pub cloud_url: String,

    /// A node unseen for longer than this is classified offline.
    #[serde(default = "default_offline_threshold")]
    pub offline_threshold: String,

    /// Version conflict retry budget.
    #[serde(default)]
    pub cas: CasConfig,

    /// Registry table persistence.
    #[serde(default)]
    pub store: StoreConfig,
}

fn default_offline_threshold() -> String {
    "5m".to_string()
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cloud_url: default_cloud_url(),
            offline_threshold: default_offline_threshold(),
            cas: CasConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl RegistryConfig {
    /// Create a minimal config for testing.
    pub fn for_testing(cloud_url: &str) -> Self {
        Self {
            cloud_url: cloud_url.to_string(),
            offline_threshold: default_offline_threshold(),
            cas: CasConfig::testing(),
            store: StoreConfig::in_memory(),
        }
    }

    /// Parse the cloud URL.
    pub fn cloud_url(&self) -> Result<Url> {
        parse_url("cloud_url", &self.cloud_url)
    }

    /// Parse the offline threshold, defaulting to five minutes.
    pub fn offline_threshold_duration(&self) -> Duration {
        humantime::parse_duration(&self.offline_threshold).unwrap_or(Duration::from_secs(300))
    }
}

/// Retry budget for optimistic concurrency conflicts.
///
/// Delay before retry `n` is `base_delay + uniform(0, jitter)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CasConfig {
    /// Attempts before registration fails.
    #[serde(default = "default_cas_max_attempts")]
    pub max_attempts: usize,

    /// Fixed part of the conflict backoff.
    #[serde(default = "default_cas_base_delay")]
    pub base_delay: String,

    /// Upper bound of the random part of the conflict backoff.
    #[serde(default = "default_cas_jitter")]
    pub jitter: String,
}

fn default_cas_max_attempts() -> usize {
    10
}

fn default_cas_base_delay() -> String {
    "500ms".to_string()
}

fn default_cas_jitter() -> String {
    "500ms".to_string()
}

impl Default for CasConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_cas_max_attempts(),
            base_delay: default_cas_base_delay(),
            jitter: default_cas_jitter(),
        }
    }
}

impl CasConfig {
    /// Fast retries for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 5,
            base_delay: "1ms".to_string(),
            jitter: "1ms".to_string(),
        }
    }

    pub fn base_delay_duration(&self) -> Duration {
        humantime::parse_duration(&self.base_delay).unwrap_or(Duration::from_millis(500))
    }

    pub fn jitter_duration(&self) -> Duration {
        humantime::parse_duration(&self.jitter).unwrap_or(Duration::from_millis(500))
    }
}

/// Registry table persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database holding one row per group.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "registry.db".to_string(),
            wal_mode: true,
        }
    }
}

impl StoreConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// NodeConfig: one replicating node
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration of a replicating node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Business group (e.g. a store id). Empty means ungrouped.
    #[serde(default)]
    pub group: String,

    /// Software generation. Nodes of different generations never follow each other.
    #[serde(default)]
    pub generation: String,

    /// URL other nodes use to read from this node.
    pub local_url: String,

    /// Origin pipe, used when the registry has not answered yet.
    #[serde(default = "default_cloud_url")]
    pub cloud_url: String,

    /// Base URL of the registry service.
    #[serde(default = "default_cloud_url")]
    pub registry_url: String,

    #[serde(default)]
    pub read: ReadConfig,

    #[serde(default)]
    pub registration: RegistrationConfig,

    #[serde(default)]
    pub health_check: HealthCheckConfig,

    /// File holding the last follow chain, reloaded on start. Empty disables it.
    #[serde(default = "default_service_list_path")]
    pub service_list_path: String,

    #[serde(default)]
    pub cursor: CursorConfig,
}

fn default_service_list_path() -> String {
    "services.properties".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            group: String::new(),
            generation: String::new(),
            local_url: "http://localhost:8081/".to_string(),
            cloud_url: default_cloud_url(),
            registry_url: default_cloud_url(),
            read: ReadConfig::default(),
            registration: RegistrationConfig::default(),
            health_check: HealthCheckConfig::default(),
            service_list_path: default_service_list_path(),
            cursor: CursorConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Create a minimal config for testing.
    pub fn for_testing(group: &str, local_url: &str, cloud_url: &str) -> Self {
        Self {
            group: group.to_string(),
            generation: "v1".to_string(),
            local_url: local_url.to_string(),
            cloud_url: cloud_url.to_string(),
            registry_url: cloud_url.to_string(),
            read: ReadConfig {
                timeout: "500ms".to_string(),
                ..ReadConfig::default()
            },
            registration: RegistrationConfig {
                interval: "100ms".to_string(),
                timeout: "500ms".to_string(),
                bootstrap_delay: "10ms".to_string(),
            },
            health_check: HealthCheckConfig {
                enabled: false,
                interval: "100ms".to_string(),
                timeout: "500ms".to_string(),
                max_concurrent: 4,
            },
            service_list_path: String::new(),
            cursor: CursorConfig::in_memory(),
        }
    }

    pub fn local_url(&self) -> Result<Url> {
        parse_url("local_url", &self.local_url)
    }

    pub fn cloud_url(&self) -> Result<Url> {
        parse_url("cloud_url", &self.cloud_url)
    }

    pub fn registry_url(&self) -> Result<Url> {
        parse_url("registry_url", &self.registry_url)
    }

    /// Check every URL parses before the node starts.
    pub fn validate(&self) -> Result<()> {
        self.local_url()?;
        self.cloud_url()?;
        self.registry_url()?;
        if self.read.location.is_empty() {
            return Err(ReplicationError::Config("read.location must not be empty".to_string()));
        }
        Ok(())
    }
}

/// What a node reads from its upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadConfig {
    /// Message types to replicate. Empty means all types.
    #[serde(default)]
    pub types: Vec<String>,

    /// Location (target) the node reads for.
    #[serde(default = "default_location")]
    pub location: String,

    /// Timeout of a single read call.
    #[serde(default = "default_read_timeout")]
    pub timeout: String,
}

fn default_location() -> String {
    "default".to_string()
}

fn default_read_timeout() -> String {
    "30s".to_string()
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            types: Vec::new(),
            location: default_location(),
            timeout: default_read_timeout(),
        }
    }
}

impl ReadConfig {
    pub fn timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.timeout).unwrap_or(Duration::from_secs(30))
    }
}

/// Self-registration schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationConfig {
    /// How often the node reports itself to the registry.
    #[serde(default = "default_registration_interval")]
    pub interval: String,

    /// Timeout of one registry call.
    #[serde(default = "default_registration_timeout")]
    pub timeout: String,

    /// Extra wait, on top of one interval, before a delayed bootstrap restarts the pipe.
    #[serde(default = "default_bootstrap_delay")]
    pub bootstrap_delay: String,
}

fn default_registration_interval() -> String {
    "30s".to_string()
}

fn default_registration_timeout() -> String {
    "10s".to_string()
}

fn default_bootstrap_delay() -> String {
    "5m".to_string()
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            interval: default_registration_interval(),
            timeout: default_registration_timeout(),
            bootstrap_delay: default_bootstrap_delay(),
        }
    }
}

impl RegistrationConfig {
    pub fn interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.interval).unwrap_or(Duration::from_secs(30))
    }

    pub fn timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.timeout).unwrap_or(Duration::from_secs(10))
    }

    /// Wait applied by the `*_WITH_DELAY` bootstrap variants.
    ///
    /// One full registration interval plus the configured extra delay, so
    /// the rest of the group has reported in before the pipe restarts.
    pub fn bootstrap_wait(&self) -> Duration {
        let extra = humantime::parse_duration(&self.bootstrap_delay)
            .unwrap_or(Duration::from_secs(300));
        self.interval_duration() + extra
    }
}

/// Upstream health probe task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How often every upstream of the chain is probed.
    #[serde(default = "default_health_interval")]
    pub interval: String,

    /// Timeout of one probe.
    #[serde(default = "default_health_timeout")]
    pub timeout: String,

    /// Probes allowed in flight at once.
    #[serde(default = "default_health_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_health_interval() -> String {
    "10s".to_string()
}

fn default_health_timeout() -> String {
    "5s".to_string()
}

fn default_health_max_concurrent() -> usize {
    8
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_health_interval(),
            timeout: default_health_timeout(),
            max_concurrent: default_health_max_concurrent(),
        }
    }
}

impl HealthCheckConfig {
    pub fn interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.interval).unwrap_or(Duration::from_secs(10))
    }

    pub fn timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.timeout).unwrap_or(Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LogConfig: reference in-memory log
// ═══════════════════════════════════════════════════════════════════════════════

/// Read limits and backpressure of a served log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Maximum messages returned by one read.
    #[serde(default = "default_max_batch_messages")]
    pub max_batch_messages: usize,

    /// Maximum encoded bytes returned by one read.
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,

    /// Retry-after handed to consumers that are caught up.
    #[serde(default = "default_retry_after")]
    pub retry_after: String,

    /// Enable read throttling.
    #[serde(default)]
    pub rate_limit_enabled: bool,

    /// Reads per second served before throttling.
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,
}

fn default_max_batch_messages() -> usize {
    1000
}

fn default_max_batch_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_retry_after() -> String {
    "5s".to_string()
}

fn default_rate_limit_per_sec() -> u32 {
    10
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_batch_messages: default_max_batch_messages(),
            max_batch_bytes: default_max_batch_bytes(),
            retry_after: default_retry_after(),
            rate_limit_enabled: false,
            rate_limit_per_sec: default_rate_limit_per_sec(),
        }
    }
}

impl LogConfig {
    pub fn retry_after_duration(&self) -> Duration {
        humantime::parse_duration(&self.retry_after).unwrap_or(Duration::from_secs(5))
    }

    /// Rate limit for served reads, `None` when throttling is disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(RateLimitConfig {
                burst_size: self.rate_limit_per_sec,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CursorConfig: local offset persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Cursor persistence configuration.
///
/// The cursor is the last offset applied to the local store. It survives
/// restarts so a node resumes where it stopped instead of from zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorConfig {
    /// Path to SQLite database for cursor storage.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,

    /// How often dirty cursors are flushed.
    #[serde(default = "default_flush_interval")]
    pub flush_interval: String,
}

fn default_flush_interval() -> String {
    "5s".to_string()
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "pipe_cursor.db".to_string(),
            wal_mode: true,
            flush_interval: default_flush_interval(),
        }
    }
}

impl CursorConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
            flush_interval: "50ms".to_string(),
        }
    }

    pub fn flush_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.flush_interval).unwrap_or(Duration::from_secs(5))
    }
}
