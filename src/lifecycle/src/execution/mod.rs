//! Execution cycle
//!
//! Drains eligible `PENDING` queue entries in priority order through a
//! [`StorageDriver`]. Each entry is claimed atomically in the store before
//! it is handed to a worker task, so concurrent executors never run the
//! same entry twice and never run two actions on one target at once.
//!
//! Limits applied per cycle:
//!
//! - `max_concurrent`: worker tasks in this process, and `RUNNING` entries
//!   across all processes sharing the store
//! - `max_operations`: entries dispatched by this cycle
//! - the schedule gate: no new dispatch while the window is closed

pub mod driver;
pub mod retry;
pub mod schedule;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use common::config::ExecutorConfig;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

pub use driver::{DriverError, DriverReport, DryRunDriver, StorageDriver};
pub use retry::RetryPolicy;
pub use schedule::{AlwaysOpen, MaintenanceWindow, ScheduleGate, gate_from_config};

use crate::audit::{ExecutionLogEntry, ExecutionOutcome};
use crate::error::{ExecutionError, ExecutionErrorKind, Result, StoreError};
use crate::metrics::LifecycleMetrics;
use crate::policy::{ActionType, Policy, PolicyId};
use crate::queue::{Completion, QueueEntry, QueueFilter, QueueKey, QueueStatus};
use crate::store::LifecycleStore;
use crate::target::{TargetId, TargetObject};

/// Attempts at finalizing a queue entry before giving up on it
const COMPLETE_ATTEMPTS: u32 = 3;
const COMPLETE_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub max_concurrent: usize,
    pub max_operations_per_cycle: usize,
    pub retry: RetryPolicy,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self::from(&ExecutorConfig::default())
    }
}

impl From<&ExecutorConfig> for ExecutionConfig {
    fn from(config: &ExecutorConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent.max(1),
            max_operations_per_cycle: config.max_operations_per_cycle,
            retry: RetryPolicy::from(config),
        }
    }
}

/// Why a candidate was not dispatched this cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Another action on the same target is running or was dispatched
    TargetBusy,
    /// Global `RUNNING` count reached the concurrency limit
    ConcurrencyLimit,
    /// Cycle dispatch budget exhausted
    CycleLimit,
    WindowClosed,
    /// Policy disabled or removed since evaluation
    PolicyUnavailable,
    /// Claimed by a concurrent executor
    NotClaimable,
    StoreError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedEntry {
    pub key: QueueKey,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub window_open: bool,
    pub candidates: usize,
    pub dispatched: usize,
    pub succeeded: usize,
    pub warnings: usize,
    pub retried: usize,
    pub failed: usize,
    pub skipped: Vec<SkippedEntry>,
    pub entries: Vec<ExecutionLogEntry>,
    pub errors: Vec<String>,
}

impl ExecutionReport {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            run_id: format!("execution_{}", now.timestamp_millis()),
            started_at: now,
            completed_at: now,
            window_open: true,
            candidates: 0,
            dispatched: 0,
            succeeded: 0,
            warnings: 0,
            retried: 0,
            failed: 0,
            skipped: Vec::new(),
            entries: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn skip(&mut self, key: QueueKey, reason: SkipReason) {
        debug!(queue_key = %key, ?reason, "Candidate skipped");
        self.skipped.push(SkippedEntry { key, reason });
    }

    pub fn skipped_for(&self, reason: SkipReason) -> usize {
        self.skipped.iter().filter(|s| s.reason == reason).count()
    }

    pub fn entry_for(&self, target_id: &TargetId) -> Option<&ExecutionLogEntry> {
        self.entries.iter().find(|e| e.target_id == *target_id)
    }

    pub fn bytes_saved(&self) -> u64 {
        self.entries
            .iter()
            .filter(|e| !e.outcome.is_failure())
            .filter_map(ExecutionLogEntry::space_saved)
            .sum()
    }
}

pub struct ExecutionEngine {
    worker: Arc<Worker>,
    store: Arc<dyn LifecycleStore>,
    gate: Arc<dyn ScheduleGate>,
    config: ExecutionConfig,
    metrics: LifecycleMetrics,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<dyn LifecycleStore>,
        driver: Arc<dyn StorageDriver>,
        gate: Arc<dyn ScheduleGate>,
        config: ExecutionConfig,
        metrics: LifecycleMetrics,
    ) -> Self {
        let worker = Arc::new(Worker {
            store: store.clone(),
            driver,
            retry: config.retry,
            metrics: metrics.clone(),
        });
        Self {
            worker,
            store,
            gate,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub async fn run_cycle(&self, max_operations: Option<usize>) -> Result<ExecutionReport> {
        self.run_cycle_at(Utc::now(), max_operations).await
    }

    /// Run one execution cycle as of `now`. `max_operations` overrides the
    /// configured per-cycle dispatch budget.
    pub async fn run_cycle_at(
        &self,
        now: DateTime<Utc>,
        max_operations: Option<usize>,
    ) -> Result<ExecutionReport> {
        let budget = max_operations.unwrap_or(self.config.max_operations_per_cycle);
        let clock = Instant::now();
        let mut report = ExecutionReport::new(now);

        if !self.gate.is_window_open(now) {
            info!(run_id = %report.run_id, "Maintenance window closed, nothing dispatched");
            report.window_open = false;
            self.metrics.record_execution_cycle();
            return Ok(report);
        }

        let policies: HashMap<PolicyId, Policy> = self
            .store
            .list_policies()
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();
        let candidates: Vec<QueueEntry> = self
            .store
            .list_queue(&QueueFilter::dispatchable())
            .await?
            .into_iter()
            .filter(|e| e.is_dispatchable(now))
            .collect();
        report.candidates = candidates.len();

        info!(
            run_id = %report.run_id,
            candidates = report.candidates,
            budget,
            max_concurrent = self.config.max_concurrent,
            "Starting execution cycle"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent));
        let mut tasks: JoinSet<Finished> = JoinSet::new();
        let mut dispatched_targets: HashSet<TargetId> = HashSet::new();
        let mut remaining = candidates.into_iter();

        while let Some(entry) = remaining.next() {
            let key = entry.key();
            if report.dispatched >= budget {
                report.skip(key, SkipReason::CycleLimit);
                continue;
            }
            if !self.gate.is_window_open(now + elapsed(clock)) {
                info!(run_id = %report.run_id, "Maintenance window closed, pausing dispatch");
                report.skip(key, SkipReason::WindowClosed);
                remaining
                    .by_ref()
                    .for_each(|rest| report.skip(rest.key(), SkipReason::WindowClosed));
                break;
            }
            let Some(policy) = policies.get(&entry.policy_id).filter(|p| p.is_enabled()) else {
                report.skip(key, SkipReason::PolicyUnavailable);
                continue;
            };
            if dispatched_targets.contains(&entry.target_id) {
                report.skip(key, SkipReason::TargetBusy);
                continue;
            }

            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                report.skip(key, SkipReason::ConcurrencyLimit);
                continue;
            };
            let capacity = match self.wait_for_capacity(&mut tasks, &mut report).await {
                Ok(capacity) => capacity,
                Err(e) => {
                    error!(
                        run_id = %report.run_id,
                        error = %e,
                        "Failed to count running entries, stopping dispatch"
                    );
                    report.errors.push(format!("count running: {e}"));
                    report.skip(key, SkipReason::StoreError);
                    remaining
                        .by_ref()
                        .for_each(|rest| report.skip(rest.key(), SkipReason::StoreError));
                    break;
                }
            };
            if !capacity {
                warn!(
                    run_id = %report.run_id,
                    max_concurrent = self.config.max_concurrent,
                    "Concurrency limit held by other executors, stopping dispatch"
                );
                report.skip(key, SkipReason::ConcurrencyLimit);
                remaining
                    .by_ref()
                    .for_each(|rest| report.skip(rest.key(), SkipReason::ConcurrencyLimit));
                break;
            }

            match self.store.try_claim(&key, now).await {
                Ok(Some(claimed)) => {
                    dispatched_targets.insert(claimed.target_id.clone());
                    report.dispatched += 1;
                    let worker = self.worker.clone();
                    let policy = policy.clone();
                    tasks.spawn(async move {
                        let finished = worker.run(policy, claimed, now).await;
                        drop(permit);
                        finished
                    });
                }
                Ok(None) => {
                    let reason = if self.target_running(&entry.target_id).await {
                        SkipReason::TargetBusy
                    } else {
                        SkipReason::NotClaimable
                    };
                    report.skip(key, reason);
                }
                Err(e) => {
                    warn!(queue_key = %key, error = %e, "Failed to claim queue entry");
                    report.errors.push(format!("claim {key}: {e}"));
                    report.skip(key, SkipReason::StoreError);
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            collect(joined, &mut report);
        }

        report.completed_at = now + elapsed(clock);
        report.entries.sort_by_key(|e| e.seq);
        self.metrics.record_execution_cycle();
        self.metrics.record_skipped(report.skipped.len());
        info!(
            run_id = %report.run_id,
            dispatched = report.dispatched,
            succeeded = report.succeeded,
            warnings = report.warnings,
            retried = report.retried,
            failed = report.failed,
            skipped = report.skipped.len(),
            bytes_saved = report.bytes_saved(),
            "Execution cycle completed"
        );
        Ok(report)
    }

    /// Block until the global `RUNNING` count is below the limit, draining
    /// local tasks meanwhile. Returns false when the limit is held entirely
    /// by other processes.
    async fn wait_for_capacity(
        &self,
        tasks: &mut JoinSet<Finished>,
        report: &mut ExecutionReport,
    ) -> Result<bool> {
        loop {
            let running = self.store.count_running().await?;
            if running < self.config.max_concurrent {
                return Ok(true);
            }
            match tasks.join_next().await {
                Some(joined) => collect(joined, report),
                None => return Ok(false),
            }
        }
    }

    async fn target_running(&self, target_id: &TargetId) -> bool {
        let filter = QueueFilter {
            status: Some(QueueStatus::Running),
            target_id: Some(target_id.clone()),
            ..Default::default()
        };
        self.store
            .list_queue(&filter)
            .await
            .is_ok_and(|running| !running.is_empty())
    }
}

fn elapsed(clock: Instant) -> chrono::Duration {
    chrono::Duration::from_std(clock.elapsed()).unwrap_or_else(|_| chrono::Duration::zero())
}

fn collect(joined: std::result::Result<Finished, JoinError>, report: &mut ExecutionReport) {
    match joined {
        Ok(Finished { log, errors }) => {
            match log.outcome {
                ExecutionOutcome::Success => report.succeeded += 1,
                ExecutionOutcome::Warning => report.warnings += 1,
                ExecutionOutcome::Retrying => report.retried += 1,
                ExecutionOutcome::Failed => report.failed += 1,
                ExecutionOutcome::Requeued => {}
            }
            report.entries.push(log);
            report.errors.extend(errors);
        }
        Err(e) => {
            error!(error = %e, "Execution task aborted");
            report.errors.push(format!("execution task aborted: {e}"));
        }
    }
}

/// Executes a single claimed entry and records its outcome
struct Worker {
    store: Arc<dyn LifecycleStore>,
    driver: Arc<dyn StorageDriver>,
    retry: RetryPolicy,
    metrics: LifecycleMetrics,
}

/// Outcome of one worker task
struct Finished {
    log: ExecutionLogEntry,
    /// Bookkeeping failures after the action ran
    errors: Vec<String>,
}

struct Performed {
    before_size: u64,
    after_size: u64,
    /// Primary operation time as reported by the driver
    duration_ms: u64,
    /// State signature after the action, `None` once dropped
    target_state: Option<String>,
    warnings: Vec<String>,
}

struct Failure {
    error: ExecutionError,
    before_size: Option<u64>,
}

impl Worker {
    async fn run(&self, policy: Policy, entry: QueueEntry, now: DateTime<Utc>) -> Finished {
        self.metrics.operation_started();
        let clock = Instant::now();
        let result = self.perform(&policy, &entry, now).await;
        let elapsed_ms = clock.elapsed().as_millis() as u64;
        let finished_at = now + elapsed(clock);
        let finished = self
            .finalize(&policy, &entry, result, now, finished_at, elapsed_ms)
            .await;
        self.metrics.operation_finished();
        finished
    }

    async fn perform(
        &self,
        policy: &Policy,
        entry: &QueueEntry,
        now: DateTime<Utc>,
    ) -> std::result::Result<Performed, Failure> {
        let action = policy.action();
        let parameters = policy.parameters();

        let mut target = match self.store.get_target(&entry.target_id).await {
            Ok(Some(target)) => target,
            Ok(None) => {
                return Err(Failure {
                    error: ExecutionError::classify(
                        ExecutionErrorKind::MissingTarget,
                        format!("target {} no longer exists", entry.target_id),
                    ),
                    before_size: None,
                });
            }
            Err(e) => {
                return Err(Failure {
                    error: ExecutionError::classify(
                        ExecutionErrorKind::Contention,
                        format!("store unavailable: {e}"),
                    ),
                    before_size: None,
                });
            }
        };

        let report = self
            .driver
            .perform(&target, action, parameters)
            .await
            .map_err(|e| Failure {
                error: e.into(),
                before_size: Some(target.size_bytes),
            })?;

        let mut warnings = Vec::new();
        if parameters.refresh_statistics {
            if let Err(e) = self.driver.refresh_statistics(&target).await {
                warnings.push(format!("statistics refresh failed: {e}"));
            }
        }
        if parameters.rebuild_secondary_structures && action != ActionType::Drop {
            if let Err(e) = self
                .driver
                .rebuild_secondary_structures(&target, parameters.parallel_degree)
                .await
            {
                warnings.push(format!("secondary structure rebuild failed: {e}"));
            }
        }

        if action != ActionType::Drop {
            target.apply(action, parameters, report.after_size);
        }
        if let Err(e) = self.record_new_state(&target, action, now).await {
            warnings.push(format!("target state update failed: {e}"));
        }

        Ok(Performed {
            before_size: report.before_size,
            after_size: report.after_size,
            duration_ms: report.duration_ms,
            target_state: (action != ActionType::Drop).then(|| target.state_signature()),
            warnings,
        })
    }

    async fn record_new_state(
        &self,
        target: &TargetObject,
        action: ActionType,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if action == ActionType::Drop {
            let withdrawn = self.store.drop_target(&target.id(), now).await?;
            if withdrawn > 0 {
                debug!(target_id = %target.id(), withdrawn, "Pending entries of dropped target withdrawn");
            }
        } else {
            self.store.upsert_target(target).await?;
        }
        Ok(())
    }

    /// Finalize a claimed entry, retrying briefly so a transient store
    /// error does not leave it `RUNNING`.
    async fn complete(
        &self,
        key: &QueueKey,
        completion: Completion,
        error: Option<&str>,
        finished_at: DateTime<Utc>,
    ) -> std::result::Result<(), StoreError> {
        let mut attempt = 1;
        loop {
            match self
                .store
                .complete(key, completion.clone(), error, finished_at)
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) if attempt < COMPLETE_ATTEMPTS => {
                    warn!(queue_key = %key, attempt, error = %e, "Failed to finalize queue entry, retrying");
                    tokio::time::sleep(COMPLETE_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn finalize(
        &self,
        policy: &Policy,
        entry: &QueueEntry,
        result: std::result::Result<Performed, Failure>,
        now: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        elapsed_ms: u64,
    ) -> Finished {
        let key = entry.key();
        let mut errors = Vec::new();
        let mut log = ExecutionLogEntry {
            seq: 0,
            policy_id: policy.id,
            target_id: entry.target_id.clone(),
            generation: entry.generation,
            attempt: entry.attempts,
            action: policy.action(),
            started_at: now,
            finished_at,
            before_size: None,
            after_size: None,
            duration_ms: elapsed_ms,
            outcome: ExecutionOutcome::Success,
            error_kind: None,
            error_detail: None,
            warnings: Vec::new(),
        };

        let (completion, error_text) = match result {
            Ok(performed) => {
                let duration_ms = performed.duration_ms;
                log.before_size = Some(performed.before_size);
                log.after_size = Some(performed.after_size);
                log.duration_ms = duration_ms;
                if performed.warnings.is_empty() {
                    self.metrics
                        .record_success(log.space_saved().unwrap_or(0), duration_ms);
                    info!(
                        policy = %policy.name(),
                        target_id = %entry.target_id,
                        action = %log.action,
                        before_size = performed.before_size,
                        after_size = performed.after_size,
                        duration_ms,
                        "Action completed"
                    );
                } else {
                    log.outcome = ExecutionOutcome::Warning;
                    self.metrics
                        .record_success(log.space_saved().unwrap_or(0), duration_ms);
                    self.metrics.record_warning();
                    warn!(
                        policy = %policy.name(),
                        target_id = %entry.target_id,
                        warnings = ?performed.warnings,
                        "Action completed with warnings"
                    );
                }
                log.warnings = performed.warnings;
                (Completion::done(performed.target_state), None)
            }
            Err(failure) => {
                log.before_size = failure.before_size;
                log.error_kind = Some(failure.error.kind());
                log.error_detail = Some(failure.error.message().to_string());
                self.metrics.record_duration_ms(elapsed_ms);

                let completion = self.retry.decide(entry.attempts, &failure.error, now);
                match &completion {
                    Completion::Retry { next_attempt_at } => {
                        log.outcome = ExecutionOutcome::Retrying;
                        self.metrics.record_retry();
                        warn!(
                            policy = %policy.name(),
                            target_id = %entry.target_id,
                            attempt = entry.attempts,
                            max_attempts = self.retry.max_attempts,
                            next_attempt_at = %next_attempt_at,
                            error = %failure.error,
                            "Action failed, will retry"
                        );
                    }
                    _ => {
                        log.outcome = ExecutionOutcome::Failed;
                        self.metrics.record_failure();
                        error!(
                            policy = %policy.name(),
                            target_id = %entry.target_id,
                            attempt = entry.attempts,
                            error = %failure.error,
                            "Action failed"
                        );
                    }
                }
                (completion, Some(failure.error.to_string()))
            }
        };

        if let Err(e) = self
            .complete(&key, completion, error_text.as_deref(), finished_at)
            .await
        {
            error!(queue_key = %key, error = %e, "Failed to finalize queue entry, left RUNNING");
            errors.push(format!("finalize {key}: {e}"));
        }

        let log = match self.store.append_log(log.clone()).await {
            Ok(appended) => appended,
            Err(e) => {
                error!(queue_key = %key, error = %e, "Failed to append execution log entry");
                errors.push(format!("execution log {key}: {e}"));
                log
            }
        };
        Finished { log, errors }
    }
}
