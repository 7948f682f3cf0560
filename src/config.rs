//! Node configuration
//!
//! Every setting has a default and can be overridden through `SHARDWRIGHT_*`
//! environment variables, so the same binary runs in development and
//! production without a config file.

use crate::{Error, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Writer cache sizing and eviction
#[derive(Debug, Clone)]
pub struct WriterCacheConfig {
    /// Evict writers unused for this long
    pub max_idle: Duration,
    /// Evict writers open for longer than this, used or not
    pub max_lifetime: Duration,
    /// Idle eviction never takes the cache below this many writers
    pub min_items: usize,
    /// Above this many writers, idle ones are evicted at half `max_idle`
    pub core_items: usize,
    /// Hard limit; least recently used writers beyond it are evicted
    pub max_items: usize,
    /// Number of stripe locks serializing opens and closes per shard id
    pub lock_stripes: usize,
    /// How often shutdown logs progress while waiting for writers
    pub progress_interval: Duration,
}

impl Default for WriterCacheConfig {
    fn default() -> Self {
        Self {
            max_idle: Duration::from_secs(10),
            max_lifetime: Duration::from_secs(24 * 60 * 60),
            min_items: 0,
            core_items: 50,
            max_items: 100,
            lock_stripes: 1024,
            progress_interval: Duration::from_secs(10),
        }
    }
}

/// Active shard pool settings
#[derive(Debug, Clone)]
pub struct ActiveShardsConfig {
    /// Scans under the pool lock before the final attempt
    pub max_attempts: usize,
    /// Pools unused for this long are dropped and rebuilt from metadata on
    /// next use
    pub max_idle: Duration,
}

impl Default for ActiveShardsConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10_000,
            max_idle: Duration::from_secs(10),
        }
    }
}

/// Shard manager settings
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// How often bulk actions log the number of shards remaining
    pub progress_interval: Duration,
    pub lock_stripes: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            progress_interval: Duration::from_secs(10),
            lock_stripes: 1024,
        }
    }
}

/// Periods of the scheduled jobs
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub retention_interval: Duration,
    pub sweep_interval: Duration,
    pub flush_interval: Duration,
    pub delete_interval: Duration,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            retention_interval: Duration::from_secs(10 * 60),
            sweep_interval: Duration::from_secs(10),
            flush_interval: Duration::from_secs(10 * 60),
            delete_interval: Duration::from_secs(10 * 60),
        }
    }
}

/// Configuration for one indexing node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Name this node records as shard owner
    pub node_name: String,
    /// Volume group used when an index does not name one
    pub default_volume_group: String,
    /// Local volume directories
    pub volume_paths: Vec<PathBuf>,
    pub writer_cache: WriterCacheConfig,
    pub active_shards: ActiveShardsConfig,
    pub manager: ManagerConfig,
    pub jobs: JobConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: "node-1".to_string(),
            default_volume_group: "default".to_string(),
            volume_paths: vec![PathBuf::from("/var/lib/shardwright/volumes")],
            writer_cache: WriterCacheConfig::default(),
            active_shards: ActiveShardsConfig::default(),
            manager: ManagerConfig::default(),
            jobs: JobConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Build configuration from environment
    ///
    /// Environment variables:
    /// - SHARDWRIGHT_NODE_NAME: owner node name (default: node-1)
    /// - SHARDWRIGHT_VOLUME_GROUP: default volume group (default: default)
    /// - SHARDWRIGHT_VOLUMES: comma separated volume directories
    /// - SHARDWRIGHT_WRITER_MAX_IDLE_SECS, SHARDWRIGHT_WRITER_MAX_LIFETIME_SECS
    /// - SHARDWRIGHT_WRITER_MIN_ITEMS, SHARDWRIGHT_WRITER_CORE_ITEMS,
    ///   SHARDWRIGHT_WRITER_MAX_ITEMS
    /// - SHARDWRIGHT_POOL_MAX_ATTEMPTS, SHARDWRIGHT_POOL_MAX_IDLE_SECS
    /// - SHARDWRIGHT_RETENTION_INTERVAL_SECS, SHARDWRIGHT_SWEEP_INTERVAL_SECS,
    ///   SHARDWRIGHT_FLUSH_INTERVAL_SECS, SHARDWRIGHT_DELETE_INTERVAL_SECS
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let node_name = std::env::var("SHARDWRIGHT_NODE_NAME").unwrap_or(defaults.node_name);
        if node_name.trim().is_empty() {
            return Err(Error::Config("SHARDWRIGHT_NODE_NAME cannot be empty".to_string()));
        }

        let volume_paths = match std::env::var("SHARDWRIGHT_VOLUMES") {
            Ok(value) => parse_paths(&value)?,
            Err(_) => defaults.volume_paths,
        };

        let cache = defaults.writer_cache;
        let writer_cache = WriterCacheConfig {
            max_idle: env_secs("SHARDWRIGHT_WRITER_MAX_IDLE_SECS", cache.max_idle)?,
            max_lifetime: env_secs("SHARDWRIGHT_WRITER_MAX_LIFETIME_SECS", cache.max_lifetime)?,
            min_items: env_parse("SHARDWRIGHT_WRITER_MIN_ITEMS", cache.min_items)?,
            core_items: env_parse("SHARDWRIGHT_WRITER_CORE_ITEMS", cache.core_items)?,
            max_items: env_parse("SHARDWRIGHT_WRITER_MAX_ITEMS", cache.max_items)?,
            ..cache
        };
        let jobs = defaults.jobs;
        let jobs = JobConfig {
            retention_interval: env_secs("SHARDWRIGHT_RETENTION_INTERVAL_SECS", jobs.retention_interval)?,
            sweep_interval: env_secs("SHARDWRIGHT_SWEEP_INTERVAL_SECS", jobs.sweep_interval)?,
            flush_interval: env_secs("SHARDWRIGHT_FLUSH_INTERVAL_SECS", jobs.flush_interval)?,
            delete_interval: env_secs("SHARDWRIGHT_DELETE_INTERVAL_SECS", jobs.delete_interval)?,
        };

        let config = Self {
            node_name,
            default_volume_group: std::env::var("SHARDWRIGHT_VOLUME_GROUP")
                .unwrap_or(defaults.default_volume_group),
            volume_paths,
            writer_cache,
            active_shards: ActiveShardsConfig {
                max_attempts: env_parse(
                    "SHARDWRIGHT_POOL_MAX_ATTEMPTS",
                    defaults.active_shards.max_attempts,
                )?,
                max_idle: env_secs(
                    "SHARDWRIGHT_POOL_MAX_IDLE_SECS",
                    defaults.active_shards.max_idle,
                )?,
            },
            manager: defaults.manager,
            jobs,
        };
        config.validate()?;

        info!(
            node = %config.node_name,
            volumes = config.volume_paths.len(),
            max_open_writers = config.writer_cache.max_items,
            "Loaded node configuration"
        );
        Ok(config)
    }
}

impl WriterCacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_items > self.core_items || self.core_items > self.max_items {
            return Err(Error::Config(format!(
                "Writer cache limits must satisfy min <= core <= max, got {} / {} / {}",
                self.min_items, self.core_items, self.max_items
            )));
        }
        if self.max_items == 0 {
            return Err(Error::Config("max_items must be at least 1".to_string()));
        }
        if self.lock_stripes == 0 {
            return Err(Error::Config("lock_stripes must be at least 1".to_string()));
        }
        non_zero("writer max_idle", self.max_idle)?;
        non_zero("writer max_lifetime", self.max_lifetime)?;
        non_zero("writer cache progress_interval", self.progress_interval)
    }
}

impl ActiveShardsConfig {
    pub fn validate(&self) -> Result<()> {
        non_zero("pool max_idle", self.max_idle)
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<()> {
        non_zero("manager progress_interval", self.progress_interval)
    }
}

impl JobConfig {
    /// Every job period must be non-zero.
    pub fn validate(&self) -> Result<()> {
        non_zero("retention interval", self.retention_interval)?;
        non_zero("sweep interval", self.sweep_interval)?;
        non_zero("flush interval", self.flush_interval)?;
        non_zero("delete interval", self.delete_interval)
    }
}

impl NodeConfig {
    pub fn validate(&self) -> Result<()> {
        self.writer_cache.validate()?;
        self.active_shards.validate()?;
        self.manager.validate()?;
        self.jobs.validate()
    }
}

fn non_zero(name: &str, value: Duration) -> Result<()> {
    if value.is_zero() {
        return Err(Error::Config(format!("{} must be greater than zero", name)));
    }
    Ok(())
}

fn parse_paths(value: &str) -> Result<Vec<PathBuf>> {
    let paths: Vec<PathBuf> = value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect();
    if paths.is_empty() {
        return Err(Error::Config("SHARDWRIGHT_VOLUMES lists no paths".to_string()));
    }
    Ok(paths)
}

fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("Invalid value for {}: '{}'", name, raw))),
        Err(_) => Ok(default),
    }
}

fn env_secs(name: &str, default: Duration) -> Result<Duration> {
    env_parse(name, default.as_secs()).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        NodeConfig::default().validate().unwrap();
    }

    #[test]
    fn test_invalid_limits_rejected() {
        let config = WriterCacheConfig {
            core_items: 200,
            max_items: 100,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_empty_writer_cache_rejected() {
        let config = WriterCacheConfig {
            min_items: 0,
            core_items: 0,
            max_items: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_job_interval_rejected() {
        let mut config = NodeConfig::default();
        config.jobs.sweep_interval = Duration::ZERO;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_parse_paths() {
        let paths = parse_paths(" /a, /b ,,").unwrap();
        assert_eq!(paths, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        assert!(parse_paths(" , ").is_err());
    }
}
