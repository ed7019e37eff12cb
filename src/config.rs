use crate::errors::ConfigError;
use std::time::Duration;

type Result<T> = std::result::Result<T, ConfigError>;

/// Capacity of the task context registry.
///
/// Bounds the number of cancellation handles held in memory for in-flight
/// tasks. When the registry approaches this limit, stale entries are evicted
/// before new registrations are accepted.
#[derive(Clone, Debug)]
pub struct ContextRegistryCapacity(usize);

impl Default for ContextRegistryCapacity {
    fn default() -> Self {
        Self(1000)
    }
}

impl TryFrom<String> for ContextRegistryCapacity {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self> {
        let size = value
            .parse::<usize>()
            .map_err(|_| ConfigError::InvalidNumber {
                details: format!("Invalid context registry capacity: {}", value),
            })?;

        if size == 0 {
            return Err(ConfigError::InvalidNumber {
                details: "Context registry capacity must be greater than 0".to_string(),
            });
        }

        Ok(Self(size))
    }
}

impl AsRef<usize> for ContextRegistryCapacity {
    fn as_ref(&self) -> &usize {
        &self.0
    }
}

/// Maximum age of a context registry entry before the stale sweep removes it.
#[derive(Clone, Debug)]
pub struct ContextMaxAgeSeconds(u64);

impl Default for ContextMaxAgeSeconds {
    fn default() -> Self {
        Self(3600)
    }
}

impl TryFrom<String> for ContextMaxAgeSeconds {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self> {
        let seconds = parse_nonzero_seconds(&value)?;
        Ok(Self(seconds))
    }
}

impl ContextMaxAgeSeconds {
    pub fn to_duration(&self) -> Duration {
        Duration::from_secs(self.0)
    }
}

/// How long a provider pool may sit with an empty queue before eviction.
#[derive(Clone, Debug)]
pub struct PoolIdleTimeoutSeconds(u64);

impl Default for PoolIdleTimeoutSeconds {
    fn default() -> Self {
        Self(600)
    }
}

impl TryFrom<String> for PoolIdleTimeoutSeconds {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self> {
        Ok(Self(parse_nonzero_seconds(&value)?))
    }
}

impl PoolIdleTimeoutSeconds {
    pub fn to_duration(&self) -> Duration {
        Duration::from_secs(self.0)
    }
}

/// Hard ceiling on a provider pool's lifetime. A pool older than this is
/// replaced on the next sweep once its queue is empty, even if it never went
/// idle long enough for the idle timeout to apply.
#[derive(Clone, Debug)]
pub struct PoolMaxLifetimeSeconds(u64);

impl Default for PoolMaxLifetimeSeconds {
    fn default() -> Self {
        Self(21600)
    }
}

impl TryFrom<String> for PoolMaxLifetimeSeconds {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self> {
        Ok(Self(parse_nonzero_seconds(&value)?))
    }
}

impl PoolMaxLifetimeSeconds {
    pub fn to_duration(&self) -> Duration {
        Duration::from_secs(self.0)
    }
}

/// Upper bound on how long `start_task` waits for space in a provider's
/// queue before returning a backpressure error.
#[derive(Clone, Debug)]
pub struct EnqueueTimeoutSeconds(u64);

impl Default for EnqueueTimeoutSeconds {
    fn default() -> Self {
        Self(30)
    }
}

impl TryFrom<String> for EnqueueTimeoutSeconds {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self> {
        Ok(Self(parse_nonzero_seconds(&value)?))
    }
}

impl EnqueueTimeoutSeconds {
    pub fn to_duration(&self) -> Duration {
        Duration::from_secs(self.0)
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }
}

fn parse_nonzero_seconds(value: &str) -> Result<u64> {
    let seconds = value
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidDuration {
            value: value.to_string(),
        })?;

    if seconds == 0 {
        return Err(ConfigError::InvalidDuration {
            value: value.to_string(),
        });
    }

    Ok(seconds)
}

/// Tunables handed to the engine components.
///
/// Built from [`Config`] in the binary; tests construct it directly with
/// `Default` and override individual fields.
#[derive(Clone, Debug)]
pub struct EngineSettings {
    pub context_capacity: usize,
    pub context_max_age: Duration,
    pub pool_idle_timeout: Duration,
    pub pool_max_lifetime: Duration,
    pub enqueue_timeout: Duration,
    pub sweep_interval: Duration,
    /// A `running` task not updated for this long is reclassified `timeout`.
    pub running_stuck_threshold: Duration,
    /// A `cancelling` task not updated for this long is reclassified `cancelled`.
    pub cancelling_stuck_threshold: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            context_capacity: *ContextRegistryCapacity::default().as_ref(),
            context_max_age: ContextMaxAgeSeconds::default().to_duration(),
            pool_idle_timeout: PoolIdleTimeoutSeconds::default().to_duration(),
            pool_max_lifetime: PoolMaxLifetimeSeconds::default().to_duration(),
            enqueue_timeout: EnqueueTimeoutSeconds::default().to_duration(),
            sweep_interval: Duration::from_secs(60),
            running_stuck_threshold: Duration::from_secs(7200),
            cancelling_stuck_threshold: Duration::from_secs(600),
        }
    }
}

/// Metrics publisher configuration.
#[derive(Clone, Debug, Default)]
pub struct MetricsConfig {
    pub adapter: String,
    pub statsd_host: Option<String>,
    pub prefix: String,
    pub statsd_bind: String,
    pub tags: Option<String>,
}

/// Service configuration loaded from environment variables.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub engine: EngineSettings,
    pub metrics: MetricsConfig,
    /// Interval of the pending-task dispatch loop's fallback poll tick.
    pub dispatch_poll_interval: Duration,
}

impl Config {
    pub fn new() -> Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::EnvVarRequired {
                var_name: "DATABASE_URL".to_string(),
            })?;

        let engine = EngineSettings {
            context_capacity: *env_or_default::<ContextRegistryCapacity>(
                "CONTEXT_REGISTRY_CAPACITY",
            )?
            .as_ref(),
            context_max_age: env_or_default::<ContextMaxAgeSeconds>("CONTEXT_MAX_AGE_SECONDS")?
                .to_duration(),
            pool_idle_timeout: env_or_default::<PoolIdleTimeoutSeconds>(
                "POOL_IDLE_TIMEOUT_SECONDS",
            )?
            .to_duration(),
            pool_max_lifetime: env_or_default::<PoolMaxLifetimeSeconds>(
                "POOL_MAX_LIFETIME_SECONDS",
            )?
            .to_duration(),
            enqueue_timeout: env_or_default::<EnqueueTimeoutSeconds>("ENQUEUE_TIMEOUT_SECONDS")?
                .to_duration(),
            sweep_interval: env_seconds_or("SWEEP_INTERVAL_SECONDS", 60)?,
            running_stuck_threshold: env_seconds_or("RUNNING_STUCK_THRESHOLD_SECONDS", 7200)?,
            cancelling_stuck_threshold: env_seconds_or("CANCELLING_STUCK_THRESHOLD_SECONDS", 600)?,
        };

        let metrics = MetricsConfig {
            adapter: std::env::var("METRICS_ADAPTER").unwrap_or_else(|_| "noop".to_string()),
            statsd_host: std::env::var("METRICS_STATSD_HOST").ok(),
            prefix: std::env::var("METRICS_PREFIX").unwrap_or_else(|_| "provisor".to_string()),
            statsd_bind: std::env::var("METRICS_STATSD_BIND")
                .unwrap_or_else(|_| "[::]:0".to_string()),
            tags: std::env::var("METRICS_TAGS").ok(),
        };

        Ok(Self {
            database_url,
            engine,
            metrics,
            dispatch_poll_interval: env_seconds_or("DISPATCH_POLL_INTERVAL_SECONDS", 30)?,
        })
    }
}

fn env_or_default<T>(var: &str) -> Result<T>
where
    T: Default + TryFrom<String, Error = ConfigError>,
{
    match std::env::var(var) {
        Ok(value) => T::try_from(value),
        Err(_) => Ok(T::default()),
    }
}

fn env_seconds_or(var: &str, default: u64) -> Result<Duration> {
    match std::env::var(var) {
        Ok(value) => Ok(Duration::from_secs(parse_nonzero_seconds(&value)?)),
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_capacity_parsing() {
        assert_eq!(
            *ContextRegistryCapacity::try_from("250".to_string())
                .unwrap()
                .as_ref(),
            250
        );
        assert!(ContextRegistryCapacity::try_from("0".to_string()).is_err());
        assert!(ContextRegistryCapacity::try_from("many".to_string()).is_err());
    }

    #[test]
    fn test_duration_newtypes_reject_zero() {
        assert!(ContextMaxAgeSeconds::try_from("0".to_string()).is_err());
        assert!(PoolIdleTimeoutSeconds::try_from("0".to_string()).is_err());
        assert!(EnqueueTimeoutSeconds::try_from("0".to_string()).is_err());
    }

    #[test]
    fn test_engine_settings_defaults() {
        let settings = EngineSettings::default();
        assert_eq!(settings.context_capacity, 1000);
        assert_eq!(settings.enqueue_timeout, Duration::from_secs(30));
        assert_eq!(settings.pool_idle_timeout, Duration::from_secs(600));
    }
}
