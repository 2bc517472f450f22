//! Scripted storage driver for execution tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::execution::{DriverError, DriverReport, StorageDriver};
use crate::policy::{ActionParameters, ActionType};
use crate::target::{TargetId, TargetObject};

/// One recorded `perform` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverCall {
    pub target_id: TargetId,
    pub action: ActionType,
}

#[derive(Debug, Default)]
struct Script {
    outcomes: HashMap<TargetId, VecDeque<Option<DriverError>>>,
    statistics_failures: HashSet<TargetId>,
    rebuild_failures: HashSet<TargetId>,
    active: HashSet<TargetId>,
    calls: Vec<DriverCall>,
}

/// A [`StorageDriver`] whose results are scripted per target.
///
/// Unscripted calls succeed. Compression shrinks the target by the
/// configured ratio, drops report zero bytes after, everything else keeps
/// the size. The driver tracks how many calls overlap, globally and per
/// target.
#[derive(Debug)]
pub struct ScriptedDriver {
    script: Mutex<Script>,
    latency: Duration,
    reported_duration_ms: Option<u64>,
    compression_ratio: f64,
    current: AtomicUsize,
    peak: AtomicUsize,
    target_overlap: AtomicBool,
}

impl Default for ScriptedDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script::default()),
            latency: Duration::ZERO,
            reported_duration_ms: None,
            compression_ratio: 0.5,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            target_overlap: AtomicBool::new(false),
        }
    }

    /// Hold every `perform` call for `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Report this duration instead of the configured latency.
    pub fn with_reported_duration_ms(mut self, duration_ms: u64) -> Self {
        self.reported_duration_ms = Some(duration_ms);
        self
    }

    pub fn with_compression_ratio(mut self, ratio: f64) -> Self {
        self.compression_ratio = ratio;
        self
    }

    /// Queue failures for the next calls against `target_id`, one per call.
    pub fn failing(mut self, target_id: &TargetId, errors: Vec<DriverError>) -> Self {
        self.script
            .get_mut()
            .outcomes
            .entry(target_id.clone())
            .or_default()
            .extend(errors.into_iter().map(Some));
        self
    }

    pub fn failing_statistics(mut self, target_id: &TargetId) -> Self {
        self.script
            .get_mut()
            .statistics_failures
            .insert(target_id.clone());
        self
    }

    pub fn failing_rebuild(mut self, target_id: &TargetId) -> Self {
        self.script.get_mut().rebuild_failures.insert(target_id.clone());
        self
    }

    /// Queue an outcome while the driver is shared. `None` is a success.
    pub async fn script(&self, target_id: &TargetId, outcome: Option<DriverError>) {
        self.script
            .lock()
            .await
            .outcomes
            .entry(target_id.clone())
            .or_default()
            .push_back(outcome);
    }

    pub async fn calls(&self) -> Vec<DriverCall> {
        self.script.lock().await.calls.clone()
    }

    pub async fn calls_for(&self, target_id: &TargetId) -> usize {
        self.script
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.target_id == *target_id)
            .count()
    }

    /// Highest number of `perform` calls in progress at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Whether two calls ever ran against the same target at once.
    pub fn target_overlap_detected(&self) -> bool {
        self.target_overlap.load(Ordering::SeqCst)
    }

    fn size_after(&self, target: &TargetObject, action: ActionType) -> u64 {
        match action {
            ActionType::Compress => (target.size_bytes as f64 * self.compression_ratio).round() as u64,
            ActionType::Drop => 0,
            ActionType::Move | ActionType::MarkReadOnly | ActionType::Custom => target.size_bytes,
        }
    }
}

#[async_trait]
impl StorageDriver for ScriptedDriver {
    async fn perform(
        &self,
        target: &TargetObject,
        action: ActionType,
        _parameters: &ActionParameters,
    ) -> Result<DriverReport, DriverError> {
        let target_id = target.id();
        let running = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);

        let outcome = {
            let mut script = self.script.lock().await;
            if !script.active.insert(target_id.clone()) {
                self.target_overlap.store(true, Ordering::SeqCst);
            }
            script.calls.push(DriverCall {
                target_id: target_id.clone(),
                action,
            });
            script
                .outcomes
                .get_mut(&target_id)
                .and_then(VecDeque::pop_front)
                .flatten()
        };

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        self.script.lock().await.active.remove(&target_id);
        self.current.fetch_sub(1, Ordering::SeqCst);

        match outcome {
            Some(error) => Err(error),
            None => Ok(DriverReport {
                before_size: target.size_bytes,
                after_size: self.size_after(target, action),
                duration_ms: self
                    .reported_duration_ms
                    .unwrap_or(self.latency.as_millis() as u64),
            }),
        }
    }

    async fn refresh_statistics(&self, target: &TargetObject) -> Result<(), DriverError> {
        if self.script.lock().await.statistics_failures.contains(&target.id()) {
            return Err(DriverError::busy("statistics collection timed out"));
        }
        Ok(())
    }

    async fn rebuild_secondary_structures(
        &self,
        target: &TargetObject,
        _parallel_degree: Option<u32>,
    ) -> Result<(), DriverError> {
        if self.script.lock().await.rebuild_failures.contains(&target.id()) {
            return Err(DriverError::insufficient_space("no space to rebuild index"));
        }
        Ok(())
    }
}
