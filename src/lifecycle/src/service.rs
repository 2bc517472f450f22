//! Service facade owning every lifecycle component.
//!
//! Holds the store and the components built on it behind method-level
//! contracts. The binary and the integration tests only talk to this type.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::config::Configuration;
use tracing::info;

use crate::audit::{AuditLog, ExecutionLogEntry, ExecutionOutcome, LogQuery};
use crate::error::{LifecycleError, Result};
use crate::evaluation::{EvaluationReport, Evaluator};
use crate::execution::{
    ExecutionConfig, ExecutionEngine, ExecutionReport, ScheduleGate, StorageDriver,
    gate_from_config,
};
use crate::metrics::LifecycleMetrics;
use crate::policy::PolicyRegistry;
use crate::queue::{QueueEntry, QueueFilter, QueueKey};
use crate::store::{self, LifecycleStore};
use crate::target::{TargetId, TargetObject};
use crate::tracker::{AccessSignal, AccessTracker, RefreshReport, RefreshScope, TemperatureThresholds};

pub struct LifecycleService {
    store: Arc<dyn LifecycleStore>,
    registry: PolicyRegistry,
    tracker: Arc<AccessTracker>,
    evaluator: Evaluator,
    executor: ExecutionEngine,
    audit: AuditLog,
    metrics: LifecycleMetrics,
}

impl LifecycleService {
    /// Connect the configured store and wire every component to it.
    pub async fn from_config(
        config: &Configuration,
        driver: Arc<dyn StorageDriver>,
    ) -> Result<Self> {
        let store = store::connect(&config.store).await?;
        let gate = gate_from_config(&config.schedule)?;
        Ok(Self::new(store, config, driver, gate))
    }

    pub fn new(
        store: Arc<dyn LifecycleStore>,
        config: &Configuration,
        driver: Arc<dyn StorageDriver>,
        gate: Arc<dyn ScheduleGate>,
    ) -> Self {
        let metrics = LifecycleMetrics::new();
        let tracker = Arc::new(AccessTracker::new(
            store.clone(),
            TemperatureThresholds::from(&config.tracker),
        ));
        Self {
            registry: PolicyRegistry::new(store.clone(), &config.registry),
            evaluator: Evaluator::new(store.clone(), tracker.clone(), metrics.clone()),
            executor: ExecutionEngine::new(
                store.clone(),
                driver,
                gate,
                ExecutionConfig::from(&config.executor),
                metrics.clone(),
            ),
            audit: AuditLog::new(store.clone()),
            tracker,
            metrics,
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn LifecycleStore> {
        &self.store
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    pub fn tracker(&self) -> &AccessTracker {
        &self.tracker
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn metrics(&self) -> &LifecycleMetrics {
        &self.metrics
    }

    /// Upsert target objects produced by the segmentation step.
    pub async fn import_targets(&self, targets: Vec<TargetObject>) -> Result<usize> {
        let count = targets.len();
        for target in &targets {
            self.store.upsert_target(target).await?;
        }
        info!(count, "Imported target objects");
        Ok(count)
    }

    pub async fn targets(&self) -> Result<Vec<TargetObject>> {
        Ok(self.store.list_targets().await?)
    }

    pub async fn ingest_signals(
        &self,
        scope: &RefreshScope,
        signals: Vec<AccessSignal>,
    ) -> Result<RefreshReport> {
        self.tracker.ingest(scope, signals, Utc::now()).await
    }

    pub async fn evaluate(&self) -> Result<EvaluationReport> {
        self.evaluator.run_cycle().await
    }

    pub async fn evaluate_at(&self, now: DateTime<Utc>) -> Result<EvaluationReport> {
        self.evaluator.run_cycle_at(now).await
    }

    pub async fn execute(&self, max_operations: Option<usize>) -> Result<ExecutionReport> {
        self.executor.run_cycle(max_operations).await
    }

    pub async fn execute_at(
        &self,
        now: DateTime<Utc>,
        max_operations: Option<usize>,
    ) -> Result<ExecutionReport> {
        self.executor.run_cycle_at(now, max_operations).await
    }

    /// The queue entry, and so the latest eligibility decision with its
    /// reason, for a policy (by name or id) and a target.
    pub async fn explain(&self, policy: &str, target_id: &TargetId) -> Result<QueueEntry> {
        let key = self.queue_key(policy, target_id).await?;
        self.store
            .get_queue_entry(&key)
            .await?
            .ok_or_else(|| LifecycleError::QueueEntryNotFound {
                policy: policy.to_string(),
                target: target_id.to_string(),
            })
    }

    pub async fn queue_entries(&self, filter: &QueueFilter) -> Result<Vec<QueueEntry>> {
        Ok(self.store.list_queue(filter).await?)
    }

    pub async fn requeue(
        &self,
        policy: &str,
        target_id: &TargetId,
        actor: &str,
    ) -> Result<QueueEntry> {
        self.requeue_at(policy, target_id, actor, Utc::now()).await
    }

    /// Move a `FAILED` entry back to `PENDING` and record the requeue in
    /// the execution log.
    pub async fn requeue_at(
        &self,
        policy: &str,
        target_id: &TargetId,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<QueueEntry> {
        let failed = self.explain(policy, target_id).await?;
        let action = self.registry.get(&failed.policy_id).await?.action();
        let requeued = self.store.requeue(&failed.key(), now).await?;

        self.audit
            .append(ExecutionLogEntry {
                seq: 0,
                policy_id: failed.policy_id,
                target_id: failed.target_id.clone(),
                generation: failed.generation,
                attempt: failed.attempts,
                action,
                started_at: now,
                finished_at: now,
                before_size: None,
                after_size: None,
                duration_ms: 0,
                outcome: ExecutionOutcome::Requeued,
                error_kind: None,
                error_detail: Some(format!("requeued by {actor}")),
                warnings: Vec::new(),
            })
            .await?;
        info!(queue_key = %requeued.key(), actor, "Queue entry requeued");
        Ok(requeued)
    }

    pub async fn execution_log(&self, query: &LogQuery) -> Result<Vec<ExecutionLogEntry>> {
        self.audit.entries(query).await
    }

    pub async fn recent_failure_count(&self, since: DateTime<Utc>) -> Result<usize> {
        self.audit.recent_failure_count(since).await
    }

    async fn queue_key(&self, policy: &str, target_id: &TargetId) -> Result<QueueKey> {
        let policy = self.registry.resolve(policy).await?;
        Ok(QueueKey::new(policy.id, target_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::execution::AlwaysOpen;
    use crate::queue::{Completion, QueueStatus};
    use crate::store::InMemoryStore;
    use crate::testing::{PolicyBuilder, ScriptedDriver, TargetBuilder};
    use chrono::TimeZone;
    use common::testing::TestConfigBuilder;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn service() -> LifecycleService {
        let config = TestConfigBuilder::new().in_memory().build();
        LifecycleService::new(
            Arc::new(InMemoryStore::new()),
            &config,
            Arc::new(ScriptedDriver::new()),
            Arc::new(AlwaysOpen),
        )
    }

    #[tokio::test]
    async fn test_explain_reports_decision_reason() {
        let service = service();
        let target = TargetBuilder::new("sales", "orders").aged_days(40, now()).build();
        service.import_targets(vec![target.clone()]).await.unwrap();
        service
            .registry()
            .register(
                PolicyBuilder::new("compress-90d", "sales")
                    .older_than_days(90)
                    .build(),
                "alice",
            )
            .await
            .unwrap();

        service.evaluate_at(now()).await.unwrap();

        let entry = service.explain("compress-90d", &target.id()).await.unwrap();
        assert!(!entry.eligible);
        assert_eq!(entry.reason, "age 40d < 90d threshold");
    }

    #[tokio::test]
    async fn test_explain_unknown_policy() {
        let service = service();
        let err = service
            .explain("compress-90d", &TargetId::from("sales.orders"))
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::PolicyNotFound(_)));
    }

    #[tokio::test]
    async fn test_requeue_reopens_failed_entry_and_logs_it() {
        let service = service();
        let target = TargetBuilder::new("sales", "orders").aged_days(120, now()).build();
        service.import_targets(vec![target.clone()]).await.unwrap();
        let policy = service
            .registry()
            .register(
                PolicyBuilder::new("compress-90d", "sales")
                    .older_than_days(90)
                    .build(),
                "alice",
            )
            .await
            .unwrap();
        service.evaluate_at(now()).await.unwrap();

        let key = QueueKey::new(policy.id, target.id());
        service.store().try_claim(&key, now()).await.unwrap().unwrap();
        service
            .store()
            .complete(&key, Completion::Failed, Some("permission denied"), now())
            .await
            .unwrap();

        let requeued = service
            .requeue_at("compress-90d", &target.id(), "bob", now())
            .await
            .unwrap();
        assert_eq!(requeued.status, QueueStatus::Pending);
        assert_eq!(requeued.attempts, 0);

        let log = service.execution_log(&LogQuery::default()).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].outcome, ExecutionOutcome::Requeued);
        assert_eq!(log[0].attempt, 1);
        assert_eq!(log[0].error_detail.as_deref(), Some("requeued by bob"));
    }

    #[tokio::test]
    async fn test_requeue_rejects_pending_entry() {
        let service = service();
        let target = TargetBuilder::new("sales", "orders").aged_days(120, now()).build();
        service.import_targets(vec![target.clone()]).await.unwrap();
        service
            .registry()
            .register(
                PolicyBuilder::new("compress-90d", "sales")
                    .older_than_days(90)
                    .build(),
                "alice",
            )
            .await
            .unwrap();
        service.evaluate_at(now()).await.unwrap();

        let err = service
            .requeue_at("compress-90d", &target.id(), "bob", now())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::Store(StoreError::Conflict(_))
        ));
    }
}
