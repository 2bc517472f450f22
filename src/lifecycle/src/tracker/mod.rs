//! Access tracking and temperature classification
//!
//! Access signals (last read/write times and cumulative counters) arrive
//! from an [`AccessSignalSource`] or are ingested directly. Records only
//! ever move forward: timestamps and counters merge by maximum, so
//! replaying an older snapshot cannot roll a record back.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::config::TrackerConfig;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{LifecycleError, Result, ValidationError};
use crate::policy::selector::glob_to_regex;
use crate::store::LifecycleStore;
use crate::target::{TargetId, TargetObject};

/// Coarse access-frequency class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Temperature {
    Hot,
    Warm,
    Cold,
}

impl Temperature {
    pub fn as_str(self) -> &'static str {
        match self {
            Temperature::Hot => "hot",
            Temperature::Warm => "warm",
            Temperature::Cold => "cold",
        }
    }

    /// `Cold` satisfies a `Warm` requirement, `Hot` satisfies only `Hot`.
    pub fn is_at_least_as_cold_as(self, required: Temperature) -> bool {
        self >= required
    }
}

impl fmt::Display for Temperature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Temperature {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hot" => Ok(Temperature::Hot),
            "warm" => Ok(Temperature::Warm),
            "cold" => Ok(Temperature::Cold),
            other => Err(format!("unknown temperature class '{other}'")),
        }
    }
}

/// One observation of a target's access statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessSignal {
    pub target_id: TargetId,
    #[serde(default)]
    pub last_read_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_write_at: Option<DateTime<Utc>>,
    /// Cumulative read counter
    #[serde(default)]
    pub read_count: u64,
    /// Cumulative write counter
    #[serde(default)]
    pub write_count: u64,
}

/// Accumulated access statistics of a target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRecord {
    pub target_id: TargetId,
    pub last_read_at: Option<DateTime<Utc>>,
    pub last_write_at: Option<DateTime<Utc>>,
    pub read_count: u64,
    pub write_count: u64,
    pub temperature: Temperature,
    pub first_observed_at: DateTime<Utc>,
    pub refreshed_at: DateTime<Utc>,
}

impl AccessRecord {
    pub fn empty(target_id: TargetId, now: DateTime<Utc>) -> Self {
        Self {
            target_id,
            last_read_at: None,
            last_write_at: None,
            read_count: 0,
            write_count: 0,
            temperature: Temperature::Warm,
            first_observed_at: now,
            refreshed_at: now,
        }
    }

    /// Merge a signal by taking the maximum of every field. Returns whether
    /// anything changed.
    pub fn merge(&mut self, signal: &AccessSignal) -> bool {
        let before = (
            self.last_read_at,
            self.last_write_at,
            self.read_count,
            self.write_count,
        );
        self.last_read_at = self.last_read_at.max(signal.last_read_at);
        self.last_write_at = self.last_write_at.max(signal.last_write_at);
        self.read_count = self.read_count.max(signal.read_count);
        self.write_count = self.write_count.max(signal.write_count);
        before
            != (
                self.last_read_at,
                self.last_write_at,
                self.read_count,
                self.write_count,
            )
    }
}

/// Which targets a refresh may touch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshScope {
    All,
    /// Targets whose owner matches the glob
    Namespace(String),
    Targets(Vec<TargetId>),
}

enum ScopeMatcher {
    All,
    Namespace(Regex),
    Targets(BTreeSet<TargetId>),
}

impl ScopeMatcher {
    fn new(scope: &RefreshScope) -> Result<Self> {
        Ok(match scope {
            RefreshScope::All => ScopeMatcher::All,
            RefreshScope::Namespace(glob) => {
                let regex = Regex::new(&glob_to_regex(glob)).map_err(|e| {
                    ValidationError::InvalidSelector {
                        pattern: glob.clone(),
                        message: e.to_string(),
                    }
                })?;
                ScopeMatcher::Namespace(regex)
            }
            RefreshScope::Targets(ids) => ScopeMatcher::Targets(ids.iter().cloned().collect()),
        })
    }

    fn includes(&self, id: &TargetId) -> bool {
        match self {
            ScopeMatcher::All => true,
            ScopeMatcher::Namespace(regex) => regex.is_match(id.owner()),
            ScopeMatcher::Targets(ids) => ids.contains(id),
        }
    }
}

/// Pull-based supplier of access signals
#[async_trait]
pub trait AccessSignalSource: Send + Sync {
    async fn collect(&self, scope: &RefreshScope) -> Result<Vec<AccessSignal>>;
}

/// A fixed batch of signals, used for push-style ingestion
#[derive(Debug, Clone, Default)]
pub struct StaticSignals(pub Vec<AccessSignal>);

#[async_trait]
impl AccessSignalSource for StaticSignals {
    async fn collect(&self, _scope: &RefreshScope) -> Result<Vec<AccessSignal>> {
        Ok(self.0.clone())
    }
}

/// Day thresholds separating hot, warm and cold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemperatureThresholds {
    pub hot_days: u32,
    pub cold_days: u32,
}

impl From<&TrackerConfig> for TemperatureThresholds {
    fn from(config: &TrackerConfig) -> Self {
        Self {
            hot_days: config.hot_days,
            cold_days: config.cold_days,
        }
    }
}

impl TemperatureThresholds {
    fn class_for(&self, idle_days: i64) -> Temperature {
        if idle_days < i64::from(self.hot_days) {
            Temperature::Hot
        } else if idle_days >= i64::from(self.cold_days) {
            Temperature::Cold
        } else {
            Temperature::Warm
        }
    }
}

/// Outcome of a refresh or ingest
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub signals_received: usize,
    pub records_created: usize,
    pub records_updated: usize,
    /// Signals for in-scope identifiers with no registered target
    pub unknown_targets: usize,
    /// Signals ignored because the target lies outside the scope
    pub out_of_scope: usize,
}

pub struct AccessTracker {
    store: Arc<dyn LifecycleStore>,
    thresholds: TemperatureThresholds,
}

impl AccessTracker {
    pub fn new(store: Arc<dyn LifecycleStore>, thresholds: TemperatureThresholds) -> Self {
        Self { store, thresholds }
    }

    pub fn thresholds(&self) -> TemperatureThresholds {
        self.thresholds
    }

    /// Classify a target. Write recency sets the base class; a recent read
    /// promotes a warm target to hot. Without any signal the target's own
    /// age stands in for idle time.
    pub fn classify(
        &self,
        target: &TargetObject,
        record: Option<&AccessRecord>,
        now: DateTime<Utc>,
    ) -> Temperature {
        let idle = |at: DateTime<Utc>| (now - at).num_days().max(0);
        let (last_read, last_write) = record
            .map(|r| (r.last_read_at, r.last_write_at))
            .unwrap_or((None, None));

        match (last_write, last_read) {
            (Some(write), read) => {
                let base = self.thresholds.class_for(idle(write));
                let recently_read =
                    read.is_some_and(|r| idle(r) < i64::from(self.thresholds.hot_days));
                if base == Temperature::Warm && recently_read {
                    Temperature::Hot
                } else {
                    base
                }
            }
            (None, Some(read)) => self.thresholds.class_for(idle(read)),
            (None, None) => self.thresholds.class_for(target.age_days(now)),
        }
    }

    /// Pull signals from `source` and fold them into the access records
    /// of targets inside `scope`.
    pub async fn refresh(
        &self,
        scope: &RefreshScope,
        source: &dyn AccessSignalSource,
        now: DateTime<Utc>,
    ) -> Result<RefreshReport> {
        let signals = source.collect(scope).await?;
        self.apply(scope, signals, now).await
    }

    /// Push-style ingestion of a batch of signals.
    pub async fn ingest(
        &self,
        scope: &RefreshScope,
        signals: Vec<AccessSignal>,
        now: DateTime<Utc>,
    ) -> Result<RefreshReport> {
        self.apply(scope, signals, now).await
    }

    async fn apply(
        &self,
        scope: &RefreshScope,
        signals: Vec<AccessSignal>,
        now: DateTime<Utc>,
    ) -> Result<RefreshReport> {
        let matcher = ScopeMatcher::new(scope)?;
        let targets: HashMap<TargetId, TargetObject> = self
            .store
            .list_targets()
            .await?
            .into_iter()
            .map(|t| (t.id(), t))
            .filter(|(id, _)| matcher.includes(id))
            .collect();
        let mut records: HashMap<TargetId, AccessRecord> = self
            .store
            .list_access()
            .await?
            .into_iter()
            .filter(|r| targets.contains_key(&r.target_id))
            .map(|r| (r.target_id.clone(), r))
            .collect();

        let mut report = RefreshReport {
            signals_received: signals.len(),
            ..Default::default()
        };
        let mut touched = BTreeSet::new();

        for signal in &signals {
            if !matcher.includes(&signal.target_id) {
                report.out_of_scope += 1;
                continue;
            }
            if !targets.contains_key(&signal.target_id) {
                debug!(target_id = %signal.target_id, "Ignoring access signal for unknown target");
                report.unknown_targets += 1;
                continue;
            }
            let record = records.entry(signal.target_id.clone()).or_insert_with(|| {
                report.records_created += 1;
                AccessRecord::empty(signal.target_id.clone(), now)
            });
            if record.merge(signal) {
                touched.insert(signal.target_id.clone());
            }
        }

        for (id, target) in &targets {
            let Some(record) = records.get_mut(id) else {
                continue;
            };
            let temperature = self.classify(target, Some(record), now);
            if touched.contains(id) || temperature != record.temperature {
                record.temperature = temperature;
                record.refreshed_at = now;
                self.store.put_access(record).await?;
                report.records_updated += 1;
            }
        }

        info!(
            signals = report.signals_received,
            created = report.records_created,
            updated = report.records_updated,
            unknown = report.unknown_targets,
            out_of_scope = report.out_of_scope,
            "Access records refreshed"
        );
        Ok(report)
    }

    pub async fn record(&self, target_id: &TargetId) -> Result<Option<AccessRecord>> {
        Ok(self.store.get_access(target_id).await?)
    }

    /// Current temperature of a registered target.
    pub async fn temperature_of(
        &self,
        target_id: &TargetId,
        now: DateTime<Utc>,
    ) -> Result<Temperature> {
        let target = self.store.get_target(target_id).await?.ok_or_else(|| {
            LifecycleError::InvalidState(format!("unknown target {target_id}"))
        })?;
        let record = self.store.get_access(target_id).await?;
        Ok(self.classify(&target, record.as_ref(), now))
    }
}
