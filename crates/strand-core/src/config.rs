//! Strand configuration
//!
//! One TOML document with a section per subsystem. Every field has a default,
//! so an empty file is a valid configuration. Durations are integer
//! milliseconds or seconds with `Duration` accessors.
//!
//! ```toml
//! [store]
//! store_id = "store-a"
//! data_dir = "/var/lib/strand/store-a"
//! timeline_max_size = 1000
//!
//! [router]
//! placement_policy = "least_loaded"
//!
//! [transactions.commit_policy]
//! mode = "retry_until_success"
//! max_attempts = 5
//! backoff_ms = 100
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{Result, StrandError};

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "STRAND_";

// =============================================================================
// Sections
// =============================================================================

/// When appended messages reach disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurabilityMode {
    /// Every record is appended to the open block's file before the call returns
    WriteThrough,
    /// Open blocks stay in memory until sealed or flushed
    SealOnly,
}

/// Local store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Identifier of this store
    pub store_id: String,
    /// Directory holding metadata and block files
    pub data_dir: PathBuf,
    /// Messages per block before it is sealed
    pub timeline_max_size: u64,
    /// Message slots available on this store
    pub max_capacity: u64,
    /// Timeline count the store is sized for
    pub max_timelines: u64,
    /// Durability of open blocks
    pub durability: DurabilityMode,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_id: "store-0".to_string(),
            data_dir: PathBuf::from("./data"),
            timeline_max_size: 1000,
            max_capacity: 10_000_000,
            max_timelines: 100_000,
            durability: DurabilityMode::WriteThrough,
        }
    }
}

/// How new timelines are placed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementPolicy {
    /// Consistent-hash owner, with load-aware fallback
    HashRing,
    /// Greedy pick of the best composite score
    LeastLoaded,
    /// Greedy pick of the lowest storage usage ratio
    LeastStorage,
}

/// Routing settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Ring positions per physical store
    pub virtual_nodes: usize,
    /// Load (1 - composite score) above which the primary candidate is skipped
    pub load_threshold: f64,
    /// Distinct ring successors considered for fallback
    pub fallback_candidates: usize,
    /// Placement of new timelines
    pub placement_policy: PlacementPolicy,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            virtual_nodes: 150,
            load_threshold: 0.8,
            fallback_candidates: 3,
            placement_policy: PlacementPolicy::HashRing,
        }
    }
}

/// Rebalancing settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RebalanceConfig {
    /// Run the periodic rebalancer
    pub enabled: bool,
    /// Seconds between rebalance cycles
    pub interval_secs: u64,
    /// Load-factor spread that triggers a proposal
    pub min_gap: f64,
    /// Minimal estimated gap reduction for a proposal to be accepted
    pub min_gain: f64,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            min_gap: 0.2,
            min_gain: 0.1,
        }
    }
}

impl RebalanceConfig {
    /// Interval between cycles
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Lease settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// TTL used by short facade operations
    pub default_ttl_ms: u64,
    /// Seconds between expired-lease sweeps
    pub sweep_interval_secs: u64,
    /// Extra attempts a locked read makes while a writer holds the timeline
    pub read_retry_attempts: u32,
    /// Backoff before the first read retry, growing linearly
    pub read_retry_backoff_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: 30_000,
            sweep_interval_secs: 30,
            read_retry_attempts: 5,
            read_retry_backoff_ms: 20,
        }
    }
}

impl LockConfig {
    /// Default lease TTL
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    /// Interval between sweeps
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Backoff before the first read retry
    pub fn read_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.read_retry_backoff_ms)
    }
}

/// What the coordinator does when a commit fails on some participants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum CommitPolicy {
    /// Mark the transaction aborted and report the partial commit
    AbortOnFailure,
    /// Retry failed participants before giving up
    RetryUntilSuccess {
        /// Commit attempts per participant, including the first
        max_attempts: u32,
        /// Delay between attempts
        backoff_ms: u64,
    },
}

impl Default for CommitPolicy {
    fn default() -> Self {
        Self::RetryUntilSuccess {
            max_attempts: 3,
            backoff_ms: 50,
        }
    }
}

/// Transaction coordinator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Timeout applied when the caller gives none
    pub default_timeout_ms: u64,
    /// Seconds between timeout sweeps
    pub sweep_interval_secs: u64,
    /// Seconds finished transactions stay queryable
    pub retention_secs: u64,
    /// Partial-commit handling
    pub commit_policy: CommitPolicy,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            sweep_interval_secs: 60,
            retention_secs: 600,
            commit_policy: CommitPolicy::default(),
        }
    }
}

impl TransactionConfig {
    /// Default transaction timeout
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Interval between sweeps
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// How long finished transactions are kept
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// Migration settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Lease TTL of the migration lock
    pub lock_ttl_secs: u64,
    /// Seconds between lease renewals
    pub lock_renew_secs: u64,
    /// Messages copied per batch
    pub copy_batch_size: usize,
    /// Seconds a finished migration stays queryable
    pub retention_secs: u64,
    /// Seconds between purges of finished migrations
    pub sweep_interval_secs: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: 30 * 60,
            lock_renew_secs: 10 * 60,
            copy_batch_size: 100,
            retention_secs: 60 * 60,
            sweep_interval_secs: 60,
        }
    }
}

impl MigrationConfig {
    /// Migration lock TTL
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    /// Renewal period
    pub fn lock_renew(&self) -> Duration {
        Duration::from_secs(self.lock_renew_secs)
    }

    /// How long finished migrations are kept
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    /// Period of the finished-migration purge
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Store registry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Seconds without a heartbeat before a store is marked unhealthy
    pub heartbeat_timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: 30,
        }
    }
}

impl RegistryConfig {
    /// Heartbeat timeout
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

/// Global index settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Queue capacity of each watcher
    pub watch_queue: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self { watch_queue: 64 }
    }
}

/// Cross-store RPC settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Listen address of the RPC server
    pub bind: String,
    /// Timeout attached to outgoing requests
    pub request_timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7400".to_string(),
            request_timeout_ms: 10_000,
        }
    }
}

impl RpcConfig {
    /// Request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// =============================================================================
// Root
// =============================================================================

/// Complete Strand configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrandConfig {
    /// Local store
    pub store: StoreConfig,
    /// Routing and placement
    pub router: RouterConfig,
    /// Rebalancing
    pub rebalance: RebalanceConfig,
    /// Leases
    pub locks: LockConfig,
    /// Transactions
    pub transactions: TransactionConfig,
    /// Migrations
    pub migration: MigrationConfig,
    /// Store registry
    pub registry: RegistryConfig,
    /// Global index
    pub index: IndexConfig,
    /// Cross-store RPC
    pub rpc: RpcConfig,
}

impl StrandConfig {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| StrandError::invalid(format!("Invalid TOML: {e}")))
    }

    /// Load a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StrandError::invalid(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Apply `STRAND_*` overrides from the process environment
    pub fn merge_env(&mut self) -> Result<()> {
        self.merge_env_from(std::env::vars())
    }

    /// Apply `STRAND_*` overrides from the given variables
    pub fn merge_env_from<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "STORE_ID" => self.store.store_id = value,
                "STORE_DATA_DIR" => self.store.data_dir = PathBuf::from(value),
                "STORE_TIMELINE_MAX_SIZE" => self.store.timeline_max_size = parse(&key, &value)?,
                "STORE_MAX_CAPACITY" => self.store.max_capacity = parse(&key, &value)?,
                "ROUTER_LOAD_THRESHOLD" => self.router.load_threshold = parse(&key, &value)?,
                "RPC_BIND" => self.rpc.bind = value,
                "RPC_REQUEST_TIMEOUT_MS" => self.rpc.request_timeout_ms = parse(&key, &value)?,
                _ => tracing::debug!(variable = %key, "ignoring unknown environment override"),
            }
        }
        Ok(())
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<()> {
        if self.store.store_id.is_empty() {
            return Err(StrandError::invalid("store.store_id must not be empty"));
        }
        if self.store.timeline_max_size == 0 {
            return Err(StrandError::invalid(
                "store.timeline_max_size must be greater than 0",
            ));
        }
        if self.store.max_capacity == 0 {
            return Err(StrandError::invalid("store.max_capacity must be greater than 0"));
        }
        if self.router.virtual_nodes == 0 {
            return Err(StrandError::invalid("router.virtual_nodes must be greater than 0"));
        }
        if self.router.fallback_candidates == 0 {
            return Err(StrandError::invalid(
                "router.fallback_candidates must be greater than 0",
            ));
        }
        check_unit("router.load_threshold", self.router.load_threshold)?;
        check_unit("rebalance.min_gap", self.rebalance.min_gap)?;
        check_unit("rebalance.min_gain", self.rebalance.min_gain)?;
        if self.migration.copy_batch_size == 0 {
            return Err(StrandError::invalid(
                "migration.copy_batch_size must be greater than 0",
            ));
        }
        if self.migration.lock_renew_secs == 0
            || self.migration.lock_renew_secs >= self.migration.lock_ttl_secs
        {
            return Err(StrandError::invalid(
                "migration.lock_renew_secs must be positive and shorter than lock_ttl_secs",
            ));
        }
        if let CommitPolicy::RetryUntilSuccess { max_attempts: 0, .. } =
            self.transactions.commit_policy
        {
            return Err(StrandError::invalid(
                "transactions.commit_policy.max_attempts must be greater than 0",
            ));
        }
        if self.index.watch_queue == 0 {
            return Err(StrandError::invalid("index.watch_queue must be greater than 0"));
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| StrandError::invalid(format!("{key}: cannot parse '{value}'")))
}

fn check_unit(field: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(StrandError::invalid(format!("{field} must be within [0, 1]")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = StrandConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rebalance.min_gap, 0.2);
        assert_eq!(config.rebalance.min_gain, 0.1);
        assert_eq!(config.locks.sweep_interval(), Duration::from_secs(30));
        assert_eq!(config.transactions.sweep_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = StrandConfig::from_toml_str(
            r#"
            [store]
            store_id = "store-a"
            timeline_max_size = 3

            [router]
            placement_policy = "least_storage"

            [transactions.commit_policy]
            mode = "abort_on_failure"
            "#,
        )
        .unwrap();
        assert_eq!(config.store.store_id, "store-a");
        assert_eq!(config.store.timeline_max_size, 3);
        assert_eq!(config.store.max_capacity, StoreConfig::default().max_capacity);
        assert_eq!(config.router.placement_policy, PlacementPolicy::LeastStorage);
        assert_eq!(config.transactions.commit_policy, CommitPolicy::AbortOnFailure);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = StrandConfig::default();
        config
            .merge_env_from(vec![
                ("STRAND_STORE_ID".to_string(), "store-env".to_string()),
                ("STRAND_RPC_BIND".to_string(), "0.0.0.0:9000".to_string()),
                ("HOME".to_string(), "/root".to_string()),
            ])
            .unwrap();
        assert_eq!(config.store.store_id, "store-env");
        assert_eq!(config.rpc.bind, "0.0.0.0:9000");

        let bad = config.merge_env_from(vec![(
            "STRAND_STORE_MAX_CAPACITY".to_string(),
            "lots".to_string(),
        )]);
        assert!(bad.is_err());
    }

    #[test]
    fn test_validation() {
        let mut config = StrandConfig::default();
        config.router.load_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = StrandConfig::default();
        config.migration.lock_renew_secs = config.migration.lock_ttl_secs;
        assert!(config.validate().is_err());

        let mut config = StrandConfig::default();
        config.store.timeline_max_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strand.toml");
        std::fs::write(&path, "[rpc]\nbind = \"127.0.0.1:9999\"\n").unwrap();
        let config = StrandConfig::load_from_file(&path).unwrap();
        assert_eq!(config.rpc.bind, "127.0.0.1:9999");
        assert!(StrandConfig::load_from_file(&dir.path().join("missing.toml")).is_err());
    }
}
