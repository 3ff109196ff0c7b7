//! Process configuration, loaded from environment variables.
//!
//! Every knob has a default; unparseable or out-of-range values are fatal at
//! startup. Nothing here is reloadable at runtime.

use std::time::Duration;

use crate::gateway::dispatcher::DispatcherConfig;
use crate::gateway::scheduler::SchedulerConfig;

/// A configuration value that fails eager validation. Construction-time only;
/// never produced after startup.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    NonPositive(&'static str),
    #[error("min_frequency must be >= 1")]
    MinFrequencyZero,
    #[error("max_frequency ({max}) must be >= min_frequency ({min})")]
    FrequencyRangeInverted { min: u32, max: u32 },
    #[error("default_frequency ({value}) must be within [{min}, {max}]")]
    DefaultFrequencyOutOfRange { value: u32, min: u32, max: u32 },
}

/// Arena API configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP/WebSocket server binds to.
    pub port: u16,
    /// Wall-clock interval of the scheduler tick loop.
    pub tick_interval_ms: u64,
    /// Tick divisor applied to battles started without an explicit frequency.
    pub default_frequency: u32,
    /// Lower clamp for per-battle frequencies.
    pub min_frequency: u32,
    /// Upper clamp for per-battle frequencies.
    pub max_frequency: u32,
    /// A full snapshot is broadcast every this many generated frames.
    pub snapshot_interval_frames: u64,
    /// Stop broadcasting ended battles automatically.
    pub auto_cleanup_finished_battles: bool,
    /// Grace period before an ended battle is cleaned up.
    pub cleanup_delay_secs: u64,
    /// Maximum simultaneously broadcasting battles; 0 means unlimited.
    pub max_concurrent_battles: usize,
    /// Per-battle frame buffer capacity (versions retained for replay).
    pub frame_buffer_max_size: usize,
    /// Outbound dispatcher queue capacity across all priority tiers.
    pub queue_capacity: usize,
    /// Maximum messages delivered per consumer wakeup.
    pub batch_size: usize,
    /// Accumulation window before the consumer drains a batch.
    pub batch_interval_ms: u64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a variable is set but
    /// unparseable, or if the resulting combination fails validation.
    pub fn from_env() -> Self {
        let config = Self {
            port: env_or("PORT", 4003),
            tick_interval_ms: env_or("TICK_INTERVAL_MS", 100),
            default_frequency: env_or("DEFAULT_FREQUENCY", 2),
            min_frequency: env_or("MIN_FREQUENCY", 1),
            max_frequency: env_or("MAX_FREQUENCY", 10),
            snapshot_interval_frames: env_or("SNAPSHOT_INTERVAL_FRAMES", 50),
            auto_cleanup_finished_battles: env_or("AUTO_CLEANUP_FINISHED_BATTLES", true),
            cleanup_delay_secs: env_or("CLEANUP_DELAY_SECS", 30),
            max_concurrent_battles: env_or("MAX_CONCURRENT_BATTLES", 0),
            frame_buffer_max_size: env_or("FRAME_BUFFER_MAX_SIZE", 600),
            queue_capacity: env_or("QUEUE_CAPACITY", 10_000),
            batch_size: env_or("BATCH_SIZE", 64),
            batch_interval_ms: env_or("BATCH_INTERVAL_MS", 10),
        };
        if let Err(err) = config.validate() {
            panic!("invalid configuration: {err}");
        }
        config
    }

    /// Validate the full option set. Called by `from_env`; exposed so tests
    /// and embedders can validate hand-built configs the same way.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler_config().validate()?;
        self.dispatcher_config().validate()
    }

    /// The scheduler's slice of the configuration.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            default_frequency: self.default_frequency,
            min_frequency: self.min_frequency,
            max_frequency: self.max_frequency,
            snapshot_interval_frames: self.snapshot_interval_frames,
            auto_cleanup_finished_battles: self.auto_cleanup_finished_battles,
            cleanup_delay: Duration::from_secs(self.cleanup_delay_secs),
            max_concurrent_battles: self.max_concurrent_battles,
            buffer_max_size: self.frame_buffer_max_size,
        }
    }

    /// The dispatcher's slice of the configuration.
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            queue_capacity: self.queue_capacity,
            batch_size: self.batch_size,
            batch_interval: Duration::from_millis(self.batch_interval_ms),
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .unwrap_or_else(|_| panic!("{name} env var is not a valid value: {raw:?}")),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            port: 0,
            tick_interval_ms: 100,
            default_frequency: 2,
            min_frequency: 1,
            max_frequency: 10,
            snapshot_interval_frames: 50,
            auto_cleanup_finished_battles: true,
            cleanup_delay_secs: 30,
            max_concurrent_battles: 0,
            frame_buffer_max_size: 600,
            queue_capacity: 10_000,
            batch_size: 64,
            batch_interval_ms: 10,
        }
    }

    #[test]
    fn default_combination_is_valid() {
        assert_eq!(base().validate(), Ok(()));
    }

    #[test]
    fn zero_tick_interval_is_fatal() {
        let mut c = base();
        c.tick_interval_ms = 0;
        assert_eq!(c.validate(), Err(ConfigError::NonPositive("tick_interval")));
    }

    #[test]
    fn inverted_frequency_range_is_fatal() {
        let mut c = base();
        c.min_frequency = 5;
        c.max_frequency = 3;
        assert!(matches!(
            c.validate(),
            Err(ConfigError::FrequencyRangeInverted { min: 5, max: 3 })
        ));
    }

    #[test]
    fn default_frequency_outside_range_is_fatal() {
        let mut c = base();
        c.default_frequency = 20;
        assert!(matches!(
            c.validate(),
            Err(ConfigError::DefaultFrequencyOutOfRange { value: 20, .. })
        ));
    }

    #[test]
    fn zero_batch_size_is_fatal() {
        let mut c = base();
        c.batch_size = 0;
        assert_eq!(c.validate(), Err(ConfigError::NonPositive("batch_size")));
    }
}
