use std::path::Path;
use std::time::Duration;

use chrono::Weekday;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "strata.toml";

/// Prefix for environment overrides, e.g. `STRATA__EXECUTOR__MAX_CONCURRENT=8`.
pub const ENV_PREFIX: &str = "STRATA__";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Data source name of the lifecycle store.
    ///
    /// `memory://` keeps all state in process; any `sqlite:` DSN persists
    /// policies, queue and execution log in SQLite.
    ///
    /// Env: STRATA__STORE__DSN
    pub dsn: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dsn: String::from("sqlite://.data/strata.db"),
        }
    }
}

impl StoreConfig {
    /// Create an in-memory store configuration
    pub fn in_memory() -> Self {
        Self {
            dsn: String::from("memory://"),
        }
    }

    pub fn is_memory(&self) -> bool {
        self.dsn.starts_with("memory:")
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Lowest accepted policy priority (runs first).
    ///
    /// Env: STRATA__REGISTRY__PRIORITY_MIN
    #[serde(default = "default_priority_min")]
    pub priority_min: u32,

    /// Highest accepted policy priority.
    ///
    /// Env: STRATA__REGISTRY__PRIORITY_MAX
    #[serde(default = "default_priority_max")]
    pub priority_max: u32,

    /// Namespaces that may be targeted before any of their objects are
    /// registered in the store.
    #[serde(default)]
    pub known_namespaces: Vec<String>,
}

fn default_priority_min() -> u32 {
    1
}

fn default_priority_max() -> u32 {
    999
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            priority_min: default_priority_min(),
            priority_max: default_priority_max(),
            known_namespaces: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Targets written (or, as a tie-break, read) within this many days are hot.
    ///
    /// Env: STRATA__TRACKER__HOT_DAYS
    pub hot_days: u32,

    /// Targets untouched for at least this many days are cold.
    ///
    /// Env: STRATA__TRACKER__COLD_DAYS
    pub cold_days: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            hot_days: 7,
            cold_days: 30,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Upper bound on queue entries RUNNING at the same time.
    ///
    /// Env: STRATA__EXECUTOR__MAX_CONCURRENT
    pub max_concurrent: usize,

    /// Attempts (including the first) before a transient failure becomes FAILED.
    ///
    /// Env: STRATA__EXECUTOR__MAX_ATTEMPTS
    pub max_attempts: u32,

    /// Delay before the first retry; doubled for every further attempt.
    ///
    /// Env: STRATA__EXECUTOR__RETRY_BASE_DELAY
    #[serde(with = "humantime_serde")]
    pub retry_base_delay: Duration,

    /// Cap for the exponential retry delay.
    ///
    /// Env: STRATA__EXECUTOR__RETRY_MAX_DELAY
    #[serde(with = "humantime_serde")]
    pub retry_max_delay: Duration,

    /// Operations dispatched per execution cycle when the caller gives no bound.
    ///
    /// Env: STRATA__EXECUTOR__MAX_OPERATIONS_PER_CYCLE
    pub max_operations_per_cycle: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_attempts: 3,
            retry_base_delay: Duration::from_secs(60),
            retry_max_delay: Duration::from_secs(3600),
            max_operations_per_cycle: 100,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Restrict execution to the maintenance window below.
    /// When disabled the window is always open.
    ///
    /// Env: STRATA__SCHEDULE__ENABLED
    #[serde(default)]
    pub enabled: bool,

    /// IANA timezone the window hours are expressed in.
    ///
    /// Env: STRATA__SCHEDULE__TIMEZONE
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// First hour (0-23) of the window.
    pub start_hour: u32,

    /// Hour (0-23) the window closes. May be smaller than `start_hour`
    /// for windows spanning midnight.
    pub end_hour: u32,

    /// Weekdays on which the window opens (`mon`, `tue`, ...). Empty means every day.
    #[serde(default)]
    pub weekdays: Vec<String>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timezone: default_timezone(),
            start_hour: 22,
            end_hour: 6,
            weekdays: Vec::new(),
        }
    }
}

impl ScheduleConfig {
    pub fn parsed_timezone(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| ConfigError::InvalidTimezone {
                timezone: self.timezone.clone(),
                message: e.to_string(),
            })
    }

    pub fn parsed_weekdays(&self) -> Result<Vec<Weekday>, ConfigError> {
        self.weekdays
            .iter()
            .map(|day| {
                day.parse::<Weekday>()
                    .map_err(|_| ConfigError::InvalidWeekday(day.clone()))
            })
            .collect()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Interval between evaluation cycles in `strata run`.
    ///
    /// Env: STRATA__DAEMON__EVALUATION_INTERVAL
    #[serde(with = "humantime_serde")]
    pub evaluation_interval: Duration,

    /// Interval between execution cycles in `strata run`.
    ///
    /// Env: STRATA__DAEMON__EXECUTION_INTERVAL
    #[serde(with = "humantime_serde")]
    pub execution_interval: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            evaluation_interval: Duration::from_secs(3600),
            execution_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Configuration {
    /// Lifecycle store (policies, targets, queue, execution log)
    #[serde(default)]
    pub store: StoreConfig,
    /// Policy registry limits
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Temperature classification thresholds
    #[serde(default)]
    pub tracker: TrackerConfig,
    /// Execution engine worker pool and retry settings
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Automation window consulted before dispatch
    #[serde(default)]
    pub schedule: ScheduleConfig,
    /// Loop intervals for daemon mode
    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl Configuration {
    /// Load defaults, then `strata.toml`, then `STRATA__*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::figment(Path::new(DEFAULT_CONFIG_FILE))
            .extract::<Configuration>()
            .map_err(|e| ConfigError::Load(Box::new(e)))
    }

    /// Same layering as [`Configuration::load`] with an explicit file.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::MissingFile(path.display().to_string()));
        }

        Self::figment(path)
            .extract::<Configuration>()
            .map_err(|e| ConfigError::Load(Box::new(e)))
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Check cross-field consistency that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.dsn.is_empty() {
            return Err(ConfigError::Invalid("store DSN cannot be empty".to_string()));
        }

        if self.registry.priority_min > self.registry.priority_max {
            return Err(ConfigError::Invalid(format!(
                "registry priority_min ({}) exceeds priority_max ({})",
                self.registry.priority_min, self.registry.priority_max
            )));
        }

        if self.tracker.cold_days <= self.tracker.hot_days {
            return Err(ConfigError::Invalid(format!(
                "tracker cold_days ({}) must be greater than hot_days ({})",
                self.tracker.cold_days, self.tracker.hot_days
            )));
        }

        if self.executor.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "executor max_concurrent must be at least 1".to_string(),
            ));
        }

        if self.executor.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "executor max_attempts must be at least 1".to_string(),
            ));
        }

        if self.executor.retry_base_delay > self.executor.retry_max_delay {
            return Err(ConfigError::Invalid(
                "executor retry_base_delay exceeds retry_max_delay".to_string(),
            ));
        }

        if self.schedule.start_hour > 23 || self.schedule.end_hour > 23 {
            return Err(ConfigError::Invalid(format!(
                "schedule hours must be within 0-23 (start={}, end={})",
                self.schedule.start_hour, self.schedule.end_hour
            )));
        }

        self.schedule.parsed_timezone()?;
        self.schedule.parsed_weekdays()?;

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    MissingFile(String),

    #[error("Failed to load configuration: {0}")]
    Load(Box<figment::Error>),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid timezone '{timezone}': {message}")]
    InvalidTimezone { timezone: String, message: String },

    #[error("Invalid weekday '{0}'")]
    InvalidWeekday(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_default_configuration_is_valid() {
        let config = Configuration::default();

        assert_eq!(config.store.dsn, "sqlite://.data/strata.db");
        assert_eq!(config.registry.priority_min, 1);
        assert_eq!(config.registry.priority_max, 999);
        assert_eq!(config.executor.max_attempts, 3);
        assert!(!config.schedule.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_configless_operation() {
        let config = Figment::from(Serialized::defaults(Configuration::default()))
            .extract::<Configuration>()
            .unwrap();

        assert_eq!(config.tracker.hot_days, 7);
        assert_eq!(config.tracker.cold_days, 30);
        assert_eq!(config.daemon.execution_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_toml_and_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "strata.toml",
                r#"
                [executor]
                max_concurrent = 2
                retry_base_delay = "30s"

                [schedule]
                enabled = true
                timezone = "Europe/Berlin"
                start_hour = 1
                end_hour = 5
                weekdays = ["sat", "sun"]
                "#,
            )?;
            jail.set_env("STRATA__EXECUTOR__MAX_ATTEMPTS", "5");
            jail.set_env("STRATA__STORE__DSN", "memory://");

            let config = Configuration::load().map_err(|e| e.to_string())?;

            assert_eq!(config.executor.max_concurrent, 2);
            assert_eq!(config.executor.max_attempts, 5);
            assert_eq!(config.executor.retry_base_delay, Duration::from_secs(30));
            assert!(config.store.is_memory());
            assert!(config.schedule.enabled);
            assert_eq!(
                config.schedule.parsed_weekdays().map_err(|e| e.to_string())?,
                vec![Weekday::Sat, Weekday::Sun]
            );
            assert!(config.validate().is_ok());

            Ok(())
        });
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("strata.toml");
        std::fs::write(
            &path,
            r#"
            [store]
            dsn = "memory://"

            [tracker]
            hot_days = 3
            cold_days = 60
            "#,
        )
        .unwrap();

        let config = Configuration::load_from_path(&path).unwrap();
        assert!(config.store.is_memory());
        assert_eq!(config.tracker.hot_days, 3);
        assert_eq!(config.tracker.cold_days, 60);
        assert_eq!(config.executor.max_attempts, 3);
    }

    #[test]
    fn test_load_from_missing_path() {
        let result = Configuration::load_from_path(Path::new("/nonexistent/strata.toml"));
        assert!(matches!(result, Err(ConfigError::MissingFile(_))));
    }

    #[test]
    fn test_validate_rejects_inconsistent_values() {
        let mut config = Configuration::default();
        config.tracker.cold_days = config.tracker.hot_days;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Configuration::default();
        config.executor.max_concurrent = 0;
        assert!(config.validate().is_err());

        let mut config = Configuration::default();
        config.registry.priority_min = 10;
        config.registry.priority_max = 5;
        assert!(config.validate().is_err());

        let mut config = Configuration::default();
        config.schedule.timezone = "Mars/Olympus".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidTimezone { .. })
        ));

        let mut config = Configuration::default();
        config.schedule.weekdays = vec!["someday".to_string()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidWeekday(_))
        ));
    }
}
