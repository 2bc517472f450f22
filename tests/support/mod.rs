//! Shared setup for the lifecycle integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use common::Configuration;
use common::testing::TestConfigBuilder;
use lifecycle::testing::ScriptedDriver;
use lifecycle::{AlwaysOpen, InMemoryStore, LifecycleService, PolicyDefinition, Policy};

pub const MB: u64 = 1_000_000;

/// Fixed clock for deterministic ages: 2024-06-01 02:00 UTC.
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 2, 0, 0).unwrap()
}

pub fn minutes(n: i64) -> chrono::Duration {
    chrono::Duration::minutes(n)
}

pub fn config() -> TestConfigBuilder {
    TestConfigBuilder::new()
        .in_memory()
        .with_known_namespace("sales")
}

pub fn service(config: &Configuration, driver: Arc<ScriptedDriver>) -> LifecycleService {
    LifecycleService::new(
        Arc::new(InMemoryStore::new()),
        config,
        driver,
        Arc::new(AlwaysOpen),
    )
}

pub async fn register(service: &LifecycleService, definition: PolicyDefinition) -> Policy {
    service
        .registry()
        .register_at(definition, "test", now())
        .await
        .unwrap()
}
