//! Test configuration builder for creating test setups quickly.

use std::time::Duration;

use crate::config::{Configuration, StoreConfig};

/// Builder for creating test configurations.
///
/// Starts from [`Configuration::default`] and exposes the knobs tests
/// usually need to pin down: store DSN, executor limits, retry backoff
/// and the maintenance window.
#[derive(Debug, Clone)]
pub struct TestConfigBuilder {
    config: Configuration,
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Configuration::default(),
        }
    }

    /// Keep every collection in process memory.
    pub fn in_memory(mut self) -> Self {
        self.config.store = StoreConfig::in_memory();
        self
    }

    /// Use a file-backed SQLite store inside `dir` (typically a `TempDir`).
    pub fn with_sqlite_dir(mut self, dir: &str) -> Self {
        self.config.store.dsn = format!("sqlite://{dir}/strata.db");
        self
    }

    pub fn with_store_dsn(mut self, dsn: &str) -> Self {
        self.config.store.dsn = dsn.to_string();
        self
    }

    pub fn with_known_namespace(mut self, namespace: &str) -> Self {
        self.config
            .registry
            .known_namespaces
            .push(namespace.to_string());
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.config.executor.max_concurrent = max_concurrent;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.config.executor.max_attempts = max_attempts;
        self
    }

    /// Retry transient failures on the very next cycle.
    pub fn without_retry_backoff(mut self) -> Self {
        self.config.executor.retry_base_delay = Duration::ZERO;
        self
    }

    pub fn with_temperature_thresholds(mut self, hot_days: u32, cold_days: u32) -> Self {
        self.config.tracker.hot_days = hot_days;
        self.config.tracker.cold_days = cold_days;
        self
    }

    /// Enable a daily UTC maintenance window from `start_hour` to `end_hour`.
    pub fn with_window(mut self, start_hour: u32, end_hour: u32) -> Self {
        self.config.schedule.enabled = true;
        self.config.schedule.timezone = "UTC".to_string();
        self.config.schedule.start_hour = start_hour;
        self.config.schedule.end_hour = end_hour;
        self
    }

    pub fn build(self) -> Configuration {
        self.config
    }
}
