//! Configuration Module
//!
//! Handles loading and managing cache configuration from environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::CacheError;

// == Cache Mode ==
/// How writes are propagated across the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Single node, no remote owners
    Local,
    /// Every member owns every key
    Replicated { sync: bool },
    /// `num_owners` members own each key
    Distributed { sync: bool },
}

impl CacheMode {
    /// Returns true if writes wait for remote acknowledgments.
    pub fn is_sync(&self) -> bool {
        match self {
            CacheMode::Local => true,
            CacheMode::Replicated { sync } | CacheMode::Distributed { sync } => *sync,
        }
    }

    /// Returns true for any clustered mode.
    pub fn is_clustered(&self) -> bool {
        !matches!(self, CacheMode::Local)
    }
}

impl FromStr for CacheMode {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(CacheMode::Local),
            "repl-sync" => Ok(CacheMode::Replicated { sync: true }),
            "repl-async" => Ok(CacheMode::Replicated { sync: false }),
            "dist-sync" => Ok(CacheMode::Distributed { sync: true }),
            "dist-async" => Ok(CacheMode::Distributed { sync: false }),
            other => Err(CacheError::IllegalState(format!("unknown cache mode '{}'", other))),
        }
    }
}

// == Locking Mode ==
/// How concurrent writes to the same key are serialized on the primary owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockingMode {
    /// Striped per-key locks
    PerKey,
    /// All writes on a primary go through one ordering lock
    TotalOrder,
}

impl FromStr for LockingMode {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "per-key" => Ok(LockingMode::PerKey),
            "total-order" => Ok(LockingMode::TotalOrder),
            other => Err(CacheError::IllegalState(format!("unknown locking mode '{}'", other))),
        }
    }
}

// == Store Failure Policy ==
/// What a write does when the cache store rejects the matching modification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFailurePolicy {
    /// Roll back the in-memory mutation and surface `StoreUnavailable`
    Fail,
    /// Keep the in-memory mutation and log the divergence
    Ignore,
}

impl FromStr for StoreFailurePolicy {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fail" => Ok(StoreFailurePolicy::Fail),
            "ignore" => Ok(StoreFailurePolicy::Ignore),
            other => Err(CacheError::IllegalState(format!(
                "unknown store failure policy '{}'",
                other
            ))),
        }
    }
}

// == Near Cache Mode ==
/// Client-side caching behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NearCacheMode {
    Disabled,
    /// Remote events invalidate local entries
    Invalidated,
    /// Remote create/modify events carry the value and populate the near cache
    Eager,
}

impl FromStr for NearCacheMode {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disabled" => Ok(NearCacheMode::Disabled),
            "invalidated" | "lazy" => Ok(NearCacheMode::Invalidated),
            "eager" => Ok(NearCacheMode::Eager),
            other => Err(CacheError::IllegalState(format!(
                "unknown near cache mode '{}'",
                other
            ))),
        }
    }
}

/// Clustering parameters for a cache.
#[derive(Debug, Clone)]
pub struct ClusteringConfig {
    pub mode: CacheMode,
    /// Replication factor for distributed mode
    pub num_owners: usize,
    /// Number of hash segments keys are grouped into
    pub num_segments: u32,
    /// How long a synchronous write waits for remote acknowledgments
    pub remote_timeout: Duration,
    /// Topology-change retries before `OwnersUnavailable` is surfaced
    pub max_retries: usize,
    pub locking: LockingMode,
    pub lock_stripes: usize,
    /// Maximum in-memory entries, negative means unbounded
    pub eviction_max_entries: i64,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            mode: CacheMode::Distributed { sync: true },
            num_owners: 2,
            num_segments: 256,
            remote_timeout: Duration::from_millis(15_000),
            max_retries: 3,
            locking: LockingMode::PerKey,
            lock_stripes: 64,
            eviction_max_entries: -1,
        }
    }
}

impl ClusteringConfig {
    /// Returns the eviction limit, or None when the container is unbounded.
    pub fn max_entries(&self) -> Option<usize> {
        if self.eviction_max_entries > 0 {
            Some(self.eviction_max_entries as usize)
        } else {
            None
        }
    }
}

/// Cache store parameters.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Load the store contents into memory on start
    pub preload: bool,
    /// Memory and store hold complementary entry sets
    pub passivation: bool,
    /// The store is shared by all nodes; only primary owners write to it
    pub shared: bool,
    /// Only the cluster coordinator writes to the store
    pub singleton: bool,
    /// Never write to the store
    pub ignore_modifications: bool,
    pub failure_policy: StoreFailurePolicy,
    /// Interval of the expiry purge task
    pub purge_interval: Duration,
    /// Wrap the store in the write-behind decorator
    pub async_store: bool,
    pub async_queue_size: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            preload: false,
            passivation: false,
            shared: false,
            singleton: false,
            ignore_modifications: false,
            failure_policy: StoreFailurePolicy::Fail,
            purge_interval: Duration::from_secs(60),
            async_store: false,
            async_queue_size: 1024,
        }
    }
}

/// Key affinity service tuning.
#[derive(Debug, Clone)]
pub struct AffinityConfig {
    /// Keys buffered per address
    pub buffer_size: usize,
    /// Fraction of `buffer_size` below which generation resumes
    pub threshold: f32,
    /// Poll tick for consumers waiting on a key
    pub poll_interval: Duration,
}

impl Default for AffinityConfig {
    fn default() -> Self {
        Self {
            buffer_size: 100,
            threshold: 0.5,
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// Near cache parameters.
#[derive(Debug, Clone)]
pub struct NearCacheConfig {
    pub mode: NearCacheMode,
    /// Maximum entries, negative means unbounded
    pub max_entries: i64,
}

impl Default for NearCacheConfig {
    fn default() -> Self {
        Self {
            mode: NearCacheMode::Disabled,
            max_entries: -1,
        }
    }
}

/// Global state persistence parameters.
#[derive(Debug, Clone, Default)]
pub struct GlobalStateConfig {
    /// Directory holding one state file per scope, None disables persistence
    pub location: Option<PathBuf>,
}

/// Cache configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub clustering: ClusteringConfig,
    pub persistence: PersistenceConfig,
    pub affinity: AffinityConfig,
    pub near_cache: NearCacheConfig,
    pub global_state: GlobalStateConfig,
    /// Number of in-process nodes started by the binary
    pub cluster_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            clustering: ClusteringConfig::default(),
            persistence: PersistenceConfig::default(),
            affinity: AffinityConfig::default(),
            near_cache: NearCacheConfig::default(),
            global_state: GlobalStateConfig::default(),
            cluster_size: 3,
        }
    }
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `GRIDCACHE_CACHE_MODE` - local, repl-sync, repl-async, dist-sync, dist-async (default: dist-sync)
    /// - `GRIDCACHE_NUM_OWNERS` - Replication factor (default: 2)
    /// - `GRIDCACHE_NUM_SEGMENTS` - Hash segments (default: 256)
    /// - `GRIDCACHE_REMOTE_TIMEOUT_MS` - Sync replication timeout (default: 15000)
    /// - `GRIDCACHE_MAX_RETRIES` - Topology retries (default: 3)
    /// - `GRIDCACHE_LOCKING` - per-key or total-order (default: per-key)
    /// - `GRIDCACHE_LOCK_STRIPES` - Per-key lock stripes (default: 64)
    /// - `GRIDCACHE_EVICTION_MAX_ENTRIES` - In-memory limit, -1 unbounded (default: -1)
    /// - `GRIDCACHE_PRELOAD`, `GRIDCACHE_PASSIVATION`, `GRIDCACHE_SHARED`,
    ///   `GRIDCACHE_SINGLETON_STORE`, `GRIDCACHE_IGNORE_MODIFICATIONS`,
    ///   `GRIDCACHE_ASYNC_STORE` - booleans (default: false)
    /// - `GRIDCACHE_STORE_FAILURE_POLICY` - fail or ignore (default: fail)
    /// - `GRIDCACHE_PURGE_INTERVAL_SECS` - Expiry sweep interval (default: 60)
    /// - `GRIDCACHE_ASYNC_QUEUE_SIZE` - Write-behind queue bound (default: 1024)
    /// - `GRIDCACHE_AFFINITY_BUFFER_SIZE` - Keys per address (default: 100)
    /// - `GRIDCACHE_AFFINITY_THRESHOLD` - Refill low-water mark (default: 0.5)
    /// - `GRIDCACHE_AFFINITY_POLL_MS` - Consumer poll tick (default: 50)
    /// - `GRIDCACHE_NEAR_CACHE_MODE` - disabled, invalidated, eager (default: disabled)
    /// - `GRIDCACHE_NEAR_CACHE_MAX_ENTRIES` - -1 unbounded (default: -1)
    /// - `GRIDCACHE_GLOBAL_STATE_DIR` - State directory (default: unset)
    /// - `GRIDCACHE_CLUSTER_SIZE` - In-process nodes for the binary (default: 3)
    pub fn from_env() -> Self {
        let defaults = Config::default();

        let clustering = ClusteringConfig {
            mode: env_parse("GRIDCACHE_CACHE_MODE").unwrap_or(defaults.clustering.mode),
            num_owners: env_parse("GRIDCACHE_NUM_OWNERS").unwrap_or(defaults.clustering.num_owners),
            num_segments: env_parse("GRIDCACHE_NUM_SEGMENTS")
                .unwrap_or(defaults.clustering.num_segments),
            remote_timeout: env_parse("GRIDCACHE_REMOTE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.clustering.remote_timeout),
            max_retries: env_parse("GRIDCACHE_MAX_RETRIES")
                .unwrap_or(defaults.clustering.max_retries),
            locking: env_parse("GRIDCACHE_LOCKING").unwrap_or(defaults.clustering.locking),
            lock_stripes: env_parse("GRIDCACHE_LOCK_STRIPES")
                .unwrap_or(defaults.clustering.lock_stripes),
            eviction_max_entries: env_parse("GRIDCACHE_EVICTION_MAX_ENTRIES")
                .unwrap_or(defaults.clustering.eviction_max_entries),
        };

        let persistence = PersistenceConfig {
            preload: env_parse("GRIDCACHE_PRELOAD").unwrap_or(defaults.persistence.preload),
            passivation: env_parse("GRIDCACHE_PASSIVATION")
                .unwrap_or(defaults.persistence.passivation),
            shared: env_parse("GRIDCACHE_SHARED").unwrap_or(defaults.persistence.shared),
            singleton: env_parse("GRIDCACHE_SINGLETON_STORE")
                .unwrap_or(defaults.persistence.singleton),
            ignore_modifications: env_parse("GRIDCACHE_IGNORE_MODIFICATIONS")
                .unwrap_or(defaults.persistence.ignore_modifications),
            failure_policy: env_parse("GRIDCACHE_STORE_FAILURE_POLICY")
                .unwrap_or(defaults.persistence.failure_policy),
            purge_interval: env_parse("GRIDCACHE_PURGE_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.persistence.purge_interval),
            async_store: env_parse("GRIDCACHE_ASYNC_STORE")
                .unwrap_or(defaults.persistence.async_store),
            async_queue_size: env_parse("GRIDCACHE_ASYNC_QUEUE_SIZE")
                .unwrap_or(defaults.persistence.async_queue_size),
        };

        let affinity = AffinityConfig {
            buffer_size: env_parse("GRIDCACHE_AFFINITY_BUFFER_SIZE")
                .unwrap_or(defaults.affinity.buffer_size),
            threshold: env_parse("GRIDCACHE_AFFINITY_THRESHOLD")
                .unwrap_or(defaults.affinity.threshold),
            poll_interval: env_parse("GRIDCACHE_AFFINITY_POLL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.affinity.poll_interval),
        };

        let near_cache = NearCacheConfig {
            mode: env_parse("GRIDCACHE_NEAR_CACHE_MODE").unwrap_or(defaults.near_cache.mode),
            max_entries: env_parse("GRIDCACHE_NEAR_CACHE_MAX_ENTRIES")
                .unwrap_or(defaults.near_cache.max_entries),
        };

        let global_state = GlobalStateConfig {
            location: env::var("GRIDCACHE_GLOBAL_STATE_DIR").ok().map(PathBuf::from),
        };

        Self {
            clustering,
            persistence,
            affinity,
            near_cache,
            global_state,
            cluster_size: env_parse("GRIDCACHE_CLUSTER_SIZE").unwrap_or(defaults.cluster_size),
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.clustering.mode, CacheMode::Distributed { sync: true });
        assert_eq!(config.clustering.num_owners, 2);
        assert_eq!(config.clustering.num_segments, 256);
        assert_eq!(config.clustering.max_entries(), None);
        assert_eq!(config.affinity.buffer_size, 100);
        assert_eq!(config.affinity.threshold, 0.5);
        assert_eq!(config.affinity.poll_interval, Duration::from_millis(50));
        assert_eq!(config.persistence.failure_policy, StoreFailurePolicy::Fail);
        assert_eq!(config.near_cache.mode, NearCacheMode::Disabled);
        assert!(config.global_state.location.is_none());
    }

    #[test]
    fn test_config_from_env_defaults() {
        // Clear any existing env vars to test defaults
        env::remove_var("GRIDCACHE_CACHE_MODE");
        env::remove_var("GRIDCACHE_NUM_OWNERS");
        env::remove_var("GRIDCACHE_AFFINITY_BUFFER_SIZE");
        env::remove_var("GRIDCACHE_GLOBAL_STATE_DIR");

        let config = Config::from_env();
        assert_eq!(config.clustering.mode, CacheMode::Distributed { sync: true });
        assert_eq!(config.clustering.num_owners, 2);
        assert_eq!(config.affinity.buffer_size, 100);
        assert!(config.global_state.location.is_none());
    }

    #[test]
    fn test_cache_mode_parse() {
        assert_eq!("local".parse::<CacheMode>().unwrap(), CacheMode::Local);
        assert_eq!(
            "REPL-ASYNC".parse::<CacheMode>().unwrap(),
            CacheMode::Replicated { sync: false }
        );
        assert!("dist-sync".parse::<CacheMode>().unwrap().is_sync());
        assert!("bogus".parse::<CacheMode>().is_err());
    }

    #[test]
    fn test_max_entries_limit() {
        let mut clustering = ClusteringConfig::default();
        clustering.eviction_max_entries = 2;
        assert_eq!(clustering.max_entries(), Some(2));
        clustering.eviction_max_entries = 0;
        assert_eq!(clustering.max_entries(), None);
    }

    #[test]
    fn test_near_cache_mode_parse() {
        assert_eq!("lazy".parse::<NearCacheMode>().unwrap(), NearCacheMode::Invalidated);
        assert_eq!("eager".parse::<NearCacheMode>().unwrap(), NearCacheMode::Eager);
    }
}
