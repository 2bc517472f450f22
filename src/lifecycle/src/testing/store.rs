//! Store wrapper that injects failures into selected operations.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::audit::{ExecutionLogEntry, LogQuery};
use crate::error::StoreError;
use crate::policy::{Policy, PolicyAuditRecord, PolicyId};
use crate::queue::{Completion, Decision, QueueEntry, QueueFilter, QueueKey};
use crate::store::{LifecycleStore, StoreResult};
use crate::target::{TargetId, TargetObject};
use crate::tracker::AccessRecord;

/// Delegates to an inner [`LifecycleStore`] and fails on request.
///
/// Decision writes (`record_decision`, `supersede`, `refresh_terminal`) fail
/// for the configured targets. `complete` fails for its first N calls.
#[derive(Debug)]
pub struct FaultyStore {
    inner: Arc<dyn LifecycleStore>,
    decision_failures: HashSet<TargetId>,
    completion_failures: AtomicUsize,
    completion_calls: AtomicUsize,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn LifecycleStore>) -> Self {
        Self {
            inner,
            decision_failures: HashSet::new(),
            completion_failures: AtomicUsize::new(0),
            completion_calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_decisions(mut self, target_id: &TargetId) -> Self {
        self.decision_failures.insert(target_id.clone());
        self
    }

    pub fn failing_completions(self, count: usize) -> Self {
        self.completion_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Number of `complete` calls seen, failed ones included.
    pub fn completion_calls(&self) -> usize {
        self.completion_calls.load(Ordering::SeqCst)
    }

    fn check_decision(&self, key: &QueueKey) -> StoreResult<()> {
        if self.decision_failures.contains(&key.target_id) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl LifecycleStore for FaultyStore {
    async fn insert_policy(&self, policy: &Policy, audit: &PolicyAuditRecord) -> StoreResult<()> {
        self.inner.insert_policy(policy, audit).await
    }

    async fn update_policy(&self, policy: &Policy, audit: &PolicyAuditRecord) -> StoreResult<()> {
        self.inner.update_policy(policy, audit).await
    }

    async fn get_policy(&self, id: &PolicyId) -> StoreResult<Option<Policy>> {
        self.inner.get_policy(id).await
    }

    async fn get_policy_by_name(&self, name: &str) -> StoreResult<Option<Policy>> {
        self.inner.get_policy_by_name(name).await
    }

    async fn list_policies(&self) -> StoreResult<Vec<Policy>> {
        self.inner.list_policies().await
    }

    async fn policy_audit(&self, id: &PolicyId) -> StoreResult<Vec<PolicyAuditRecord>> {
        self.inner.policy_audit(id).await
    }

    async fn upsert_target(&self, target: &TargetObject) -> StoreResult<()> {
        self.inner.upsert_target(target).await
    }

    async fn get_target(&self, id: &TargetId) -> StoreResult<Option<TargetObject>> {
        self.inner.get_target(id).await
    }

    async fn list_targets(&self) -> StoreResult<Vec<TargetObject>> {
        self.inner.list_targets().await
    }

    async fn remove_target(&self, id: &TargetId) -> StoreResult<bool> {
        self.inner.remove_target(id).await
    }

    async fn drop_target(&self, id: &TargetId, now: DateTime<Utc>) -> StoreResult<usize> {
        self.inner.drop_target(id, now).await
    }

    async fn list_namespaces(&self) -> StoreResult<BTreeSet<String>> {
        self.inner.list_namespaces().await
    }

    async fn get_access(&self, id: &TargetId) -> StoreResult<Option<AccessRecord>> {
        self.inner.get_access(id).await
    }

    async fn put_access(&self, record: &AccessRecord) -> StoreResult<()> {
        self.inner.put_access(record).await
    }

    async fn list_access(&self) -> StoreResult<Vec<AccessRecord>> {
        self.inner.list_access().await
    }

    async fn record_decision(
        &self,
        decision: &Decision,
        now: DateTime<Utc>,
    ) -> StoreResult<QueueEntry> {
        self.check_decision(&decision.key)?;
        self.inner.record_decision(decision, now).await
    }

    async fn supersede(
        &self,
        decision: &Decision,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<QueueEntry>> {
        self.check_decision(&decision.key)?;
        self.inner.supersede(decision, now).await
    }

    async fn refresh_terminal(
        &self,
        decision: &Decision,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<QueueEntry>> {
        self.check_decision(&decision.key)?;
        self.inner.refresh_terminal(decision, now).await
    }

    async fn try_claim(
        &self,
        key: &QueueKey,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<QueueEntry>> {
        self.inner.try_claim(key, now).await
    }

    async fn complete(
        &self,
        key: &QueueKey,
        completion: Completion,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<QueueEntry> {
        self.completion_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .completion_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.complete(key, completion, error, now).await
    }

    async fn requeue(&self, key: &QueueKey, now: DateTime<Utc>) -> StoreResult<QueueEntry> {
        self.inner.requeue(key, now).await
    }

    async fn get_queue_entry(&self, key: &QueueKey) -> StoreResult<Option<QueueEntry>> {
        self.inner.get_queue_entry(key).await
    }

    async fn list_queue(&self, filter: &QueueFilter) -> StoreResult<Vec<QueueEntry>> {
        self.inner.list_queue(filter).await
    }

    async fn count_running(&self) -> StoreResult<usize> {
        self.inner.count_running().await
    }

    async fn append_log(&self, entry: ExecutionLogEntry) -> StoreResult<ExecutionLogEntry> {
        self.inner.append_log(entry).await
    }

    async fn list_log(&self, query: &LogQuery) -> StoreResult<Vec<ExecutionLogEntry>> {
        self.inner.list_log(query).await
    }

    async fn count_failures_since(&self, since: DateTime<Utc>) -> StoreResult<usize> {
        self.inner.count_failures_since(since).await
    }
}
