use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{CarouselError, Result};
use crate::models::EvictionThresholds;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Pool router configuration
    pub pool: PoolConfig,
    /// Verification lifecycle configuration
    pub probe: ProbeConfig,
    /// Snapshot persistence configuration
    pub persist: PersistConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of shards the pool is partitioned into (default: 32)
    pub shard_count: usize,
    /// Outbound executor parallelism; also the work-queue capacity
    pub executors: usize,
    /// Hourly offer limit before the per-entry circuit breaker trips
    pub offer_limit: u64,
    /// Quarantine applied after a failed routed request
    pub short_sleep: Duration,
    /// Optional delay before each serial is minted
    pub serial_delay: Duration,
    /// Accumulated pressure that trips the leaky-bucket throttle
    pub pressure_threshold: u64,
    /// How long the serial generator pauses once the throttle trips
    pub pressure_pause: Duration,
    /// Eviction thresholds applied during shard maintenance
    pub eviction: EvictionThresholds,
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Verification worker parallelism (default: 16)
    pub workers: usize,
    /// Probe mailbox capacity; backpressures candidate producers
    pub mailbox: usize,
    /// Base interval between reverify passes
    pub reverify_base: Duration,
    /// Upper bound of the random jitter added to each reverify interval
    pub reverify_jitter: Duration,
    /// How long a timed-out proxy waits before its next verification
    pub reverify_deadline: Duration,
    /// Reverify attempts before a proxy is force-blacklisted
    pub max_reverifies: u32,
    /// URL the default checker fetches through candidate proxies
    pub check_url: String,
    /// Per-check timeout
    pub check_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PersistConfig {
    /// Pool snapshot file
    pub pool_path: PathBuf,
    /// Probe snapshot file
    pub probe_path: PathBuf,
    /// Debounce between a heartbeat and the flush it triggers
    pub flush_debounce: Duration,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let config = Config {
            pool: PoolConfig {
                shard_count: parse_env("POOL_SHARD_COUNT", "32")?,
                executors: parse_env("POOL_EXECUTORS", "16")?,
                offer_limit: parse_env("POOL_OFFER_LIMIT", "3")?,
                short_sleep: Duration::from_secs(parse_env("POOL_SHORT_SLEEP_SECS", "300")?),
                serial_delay: Duration::from_millis(parse_env("POOL_SERIAL_DELAY_MS", "0")?),
                pressure_threshold: parse_env("POOL_PRESSURE_THRESHOLD", "128")?,
                pressure_pause: Duration::from_secs(parse_env("POOL_PRESSURE_PAUSE_SECS", "60")?),
                eviction: EvictionThresholds {
                    timeouts: parse_env("POOL_EVICT_TIMEOUTS", "30")?,
                    failures: parse_env("POOL_EVICT_FAILURES", "30")?,
                    reanimations: parse_env("POOL_EVICT_REANIMATIONS", "10")?,
                    longer_sleep: Duration::from_secs(parse_env(
                        "POOL_EVICT_LONG_SLEEP_SECS",
                        "3600",
                    )?),
                },
            },
            probe: ProbeConfig {
                workers: parse_env("PROBE_WORKERS", "16")?,
                mailbox: parse_env("PROBE_MAILBOX", "64")?,
                reverify_base: Duration::from_secs(parse_env("PROBE_REVERIFY_BASE_SECS", "1800")?),
                reverify_jitter: Duration::from_secs(parse_env(
                    "PROBE_REVERIFY_JITTER_SECS",
                    "500",
                )?),
                reverify_deadline: Duration::from_secs(parse_env(
                    "PROBE_REVERIFY_DEADLINE_SECS",
                    "3600",
                )?),
                max_reverifies: parse_env("PROBE_MAX_REVERIFIES", "5")?,
                check_url: get_env_or("PROBE_CHECK_URL", "http://httpbin.org/ip"),
                check_timeout: Duration::from_secs(parse_env("PROBE_CHECK_TIMEOUT_SECS", "10")?),
            },
            persist: PersistConfig {
                pool_path: PathBuf::from(get_env_or("PERSIST_POOL_PATH", "carousel-pool.bin")),
                probe_path: PathBuf::from(get_env_or("PERSIST_PROBE_PATH", "carousel-probe.bin")),
                flush_debounce: Duration::from_secs(parse_env("PERSIST_FLUSH_DEBOUNCE_SECS", "30")?),
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "json"),
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.pool.shard_count == 0 {
            return Err(CarouselError::InvalidConfig(
                "POOL_SHARD_COUNT must be at least 1".into(),
            ));
        }
        if self.pool.executors == 0 {
            return Err(CarouselError::InvalidConfig(
                "POOL_EXECUTORS must be at least 1".into(),
            ));
        }
        if self.probe.workers == 0 {
            return Err(CarouselError::InvalidConfig(
                "PROBE_WORKERS must be at least 1".into(),
            ));
        }
        if self.probe.mailbox == 0 {
            return Err(CarouselError::InvalidConfig(
                "PROBE_MAILBOX must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: &str) -> Result<T> {
    get_env_or(key, default)
        .parse()
        .map_err(|_| CarouselError::InvalidConfig(format!("{} must be a valid number", key)))
}
