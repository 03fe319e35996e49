//! Engine and maintenance configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveTime;
use locks::AcquireOptions;

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_secs(key: &str, default: Duration) -> Duration {
    env_parse::<u64>(key)
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    env_parse::<u64>(key)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

/// Engine settings.
///
/// Reads from environment variables:
/// - `WORKFLOW_LOCK_TTL_SECS` (default: `30`)
/// - `WORKFLOW_LOCK_ACQUIRE_ATTEMPTS` (default: `10`)
/// - `WORKFLOW_LOCK_BASE_DELAY_MS` (default: `100`)
/// - `WORKFLOW_LOCK_MAX_DELAY_MS` (default: `2000`)
/// - `WORKFLOW_DEFAULT_TIMEOUT_SECS` (default: `300`)
/// - `WORKFLOW_PARALLEL_GROUP_LIMIT` (default: `16`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub lock_ttl: Duration,
    pub lock_acquire_attempts: u32,
    pub lock_base_delay: Duration,
    pub lock_max_delay: Duration,
    pub default_timeout: Duration,
    pub parallel_group_limit: usize,
}

impl EngineConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            lock_ttl: env_secs("WORKFLOW_LOCK_TTL_SECS", defaults.lock_ttl),
            lock_acquire_attempts: env_parse("WORKFLOW_LOCK_ACQUIRE_ATTEMPTS")
                .unwrap_or(defaults.lock_acquire_attempts),
            lock_base_delay: env_millis("WORKFLOW_LOCK_BASE_DELAY_MS", defaults.lock_base_delay),
            lock_max_delay: env_millis("WORKFLOW_LOCK_MAX_DELAY_MS", defaults.lock_max_delay),
            default_timeout: env_secs("WORKFLOW_DEFAULT_TIMEOUT_SECS", defaults.default_timeout),
            parallel_group_limit: env_parse("WORKFLOW_PARALLEL_GROUP_LIMIT")
                .unwrap_or(defaults.parallel_group_limit),
        }
    }

    /// Lock wait policy derived from these settings.
    pub fn acquire_options(&self) -> AcquireOptions {
        AcquireOptions {
            attempts: self.lock_acquire_attempts,
            base_delay: self.lock_base_delay,
            max_delay: self.lock_max_delay,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(30),
            lock_acquire_attempts: 10,
            lock_base_delay: Duration::from_millis(100),
            lock_max_delay: Duration::from_secs(2),
            default_timeout: Duration::from_secs(300),
            parallel_group_limit: 16,
        }
    }
}

/// Background maintenance settings.
///
/// Reads from environment variables (all optional):
/// - `WORKFLOW_TIMEOUT_SWEEP_SECS` (default: `60`)
/// - `WORKFLOW_RETRY_SWEEP_SECS` (default: `300`)
/// - `WORKFLOW_STALE_SWEEP_SECS` (default: `300`)
/// - `WORKFLOW_STALE_STEP_THRESHOLD_SECS` (default: `900`)
/// - `WORKFLOW_RETRY_LOOKBACK_SECS` (default: `86400`)
/// - `WORKFLOW_RETRY_MAX_ATTEMPTS` (default: `3`)
/// - `WORKFLOW_RETRY_BASE_DELAY_SECS` (default: `30`)
/// - `WORKFLOW_RETRY_MAX_DELAY_SECS` (default: `1800`)
/// - `WORKFLOW_RETENTION_DAYS` (default: `30`)
/// - `WORKFLOW_CLEANUP_TIME` as `HH:MM` UTC (default: `03:00`)
/// - `WORKFLOW_HEALTH_LOOKBACK_SECS` (default: `3600`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenanceConfig {
    pub timeout_sweep_interval: Duration,
    pub retry_sweep_interval: Duration,
    pub stale_sweep_interval: Duration,
    pub stale_step_threshold: Duration,
    pub retry_lookback: Duration,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub retention: Duration,
    pub cleanup_time: NaiveTime,
    pub health_failure_lookback: Duration,
}

impl MaintenanceConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            timeout_sweep_interval: env_secs(
                "WORKFLOW_TIMEOUT_SWEEP_SECS",
                defaults.timeout_sweep_interval,
            ),
            retry_sweep_interval: env_secs(
                "WORKFLOW_RETRY_SWEEP_SECS",
                defaults.retry_sweep_interval,
            ),
            stale_sweep_interval: env_secs(
                "WORKFLOW_STALE_SWEEP_SECS",
                defaults.stale_sweep_interval,
            ),
            stale_step_threshold: env_secs(
                "WORKFLOW_STALE_STEP_THRESHOLD_SECS",
                defaults.stale_step_threshold,
            ),
            retry_lookback: env_secs("WORKFLOW_RETRY_LOOKBACK_SECS", defaults.retry_lookback),
            max_attempts: env_parse("WORKFLOW_RETRY_MAX_ATTEMPTS").unwrap_or(defaults.max_attempts),
            retry_base_delay: env_secs(
                "WORKFLOW_RETRY_BASE_DELAY_SECS",
                defaults.retry_base_delay,
            ),
            retry_max_delay: env_secs("WORKFLOW_RETRY_MAX_DELAY_SECS", defaults.retry_max_delay),
            retention: env_parse::<u64>("WORKFLOW_RETENTION_DAYS")
                .map(|days| Duration::from_secs(days * 24 * 60 * 60))
                .unwrap_or(defaults.retention),
            cleanup_time: std::env::var("WORKFLOW_CLEANUP_TIME")
                .ok()
                .and_then(|v| NaiveTime::parse_from_str(&v, "%H:%M").ok())
                .unwrap_or(defaults.cleanup_time),
            health_failure_lookback: env_secs(
                "WORKFLOW_HEALTH_LOOKBACK_SECS",
                defaults.health_failure_lookback,
            ),
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            timeout_sweep_interval: Duration::from_secs(60),
            retry_sweep_interval: Duration::from_secs(5 * 60),
            stale_sweep_interval: Duration::from_secs(5 * 60),
            stale_step_threshold: Duration::from_secs(15 * 60),
            retry_lookback: Duration::from_secs(24 * 60 * 60),
            max_attempts: 3,
            retry_base_delay: Duration::from_secs(30),
            retry_max_delay: Duration::from_secs(30 * 60),
            retention: Duration::from_secs(30 * 24 * 60 * 60),
            cleanup_time: NaiveTime::from_hms_opt(3, 0, 0).unwrap_or(NaiveTime::MIN),
            health_failure_lookback: Duration::from_secs(60 * 60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.lock_ttl, Duration::from_secs(30));
        assert_eq!(config.default_timeout, Duration::from_secs(300));
        assert_eq!(config.parallel_group_limit, 16);

        let options = config.acquire_options();
        assert_eq!(options.attempts, 10);
        assert_eq!(options.base_delay, Duration::from_millis(100));
        assert_eq!(options.max_delay, Duration::from_secs(2));
    }

    #[test]
    fn maintenance_defaults() {
        let config = MaintenanceConfig::default();
        assert_eq!(config.timeout_sweep_interval, Duration::from_secs(60));
        assert_eq!(config.retry_sweep_interval, Duration::from_secs(300));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.cleanup_time, NaiveTime::from_hms_opt(3, 0, 0).unwrap());
        assert_eq!(config.retention, Duration::from_secs(30 * 86_400));
    }
}
