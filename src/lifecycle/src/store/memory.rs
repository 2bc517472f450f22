use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{LifecycleStore, REQUEUE_REASON, StoreResult, TARGET_DROPPED_REASON};
use crate::audit::{ExecutionLogEntry, LogQuery};
use crate::error::StoreError;
use crate::policy::{Policy, PolicyAuditRecord, PolicyId};
use crate::queue::{
    Completion, Decision, QueueEntry, QueueFilter, QueueKey, QueueStatus, sort_for_dispatch,
};
use crate::target::{TargetId, TargetObject};
use crate::tracker::AccessRecord;

#[derive(Debug, Default)]
struct State {
    policies: BTreeMap<PolicyId, Policy>,
    policy_audit: Vec<PolicyAuditRecord>,
    targets: BTreeMap<TargetId, TargetObject>,
    access: HashMap<TargetId, AccessRecord>,
    queue: HashMap<QueueKey, QueueEntry>,
    next_queue_seq: u64,
    log: Vec<ExecutionLogEntry>,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        self.next_queue_seq += 1;
        self.next_queue_seq
    }

    fn name_taken(&self, name: &str, except: Option<PolicyId>) -> bool {
        self.policies
            .values()
            .any(|p| p.name() == name && Some(p.id) != except)
    }
}

/// Process-local store. All operations run under one lock, which makes
/// every queue transition atomic.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(key: &QueueKey) -> StoreError {
    StoreError::NotFound {
        entity: "queue entry",
        id: key.to_string(),
    }
}

#[async_trait]
impl LifecycleStore for InMemoryStore {
    async fn insert_policy(&self, policy: &Policy, audit: &PolicyAuditRecord) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.name_taken(policy.name(), None) {
            return Err(StoreError::Conflict(format!(
                "policy name '{}' already exists",
                policy.name()
            )));
        }
        state.policies.insert(policy.id, policy.clone());
        state.policy_audit.push(audit.clone());
        Ok(())
    }

    async fn update_policy(&self, policy: &Policy, audit: &PolicyAuditRecord) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if !state.policies.contains_key(&policy.id) {
            return Err(StoreError::NotFound {
                entity: "policy",
                id: policy.id.to_string(),
            });
        }
        if state.name_taken(policy.name(), Some(policy.id)) {
            return Err(StoreError::Conflict(format!(
                "policy name '{}' already exists",
                policy.name()
            )));
        }
        state.policies.insert(policy.id, policy.clone());
        state.policy_audit.push(audit.clone());
        Ok(())
    }

    async fn get_policy(&self, id: &PolicyId) -> StoreResult<Option<Policy>> {
        Ok(self.state.lock().await.policies.get(id).cloned())
    }

    async fn get_policy_by_name(&self, name: &str) -> StoreResult<Option<Policy>> {
        let state = self.state.lock().await;
        Ok(state.policies.values().find(|p| p.name() == name).cloned())
    }

    async fn list_policies(&self) -> StoreResult<Vec<Policy>> {
        Ok(self.state.lock().await.policies.values().cloned().collect())
    }

    async fn policy_audit(&self, id: &PolicyId) -> StoreResult<Vec<PolicyAuditRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .policy_audit
            .iter()
            .filter(|r| r.policy_id == *id)
            .cloned()
            .collect())
    }

    async fn upsert_target(&self, target: &TargetObject) -> StoreResult<()> {
        self.state
            .lock()
            .await
            .targets
            .insert(target.id(), target.clone());
        Ok(())
    }

    async fn get_target(&self, id: &TargetId) -> StoreResult<Option<TargetObject>> {
        Ok(self.state.lock().await.targets.get(id).cloned())
    }

    async fn list_targets(&self) -> StoreResult<Vec<TargetObject>> {
        Ok(self.state.lock().await.targets.values().cloned().collect())
    }

    async fn remove_target(&self, id: &TargetId) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        state.access.remove(id);
        Ok(state.targets.remove(id).is_some())
    }

    async fn drop_target(&self, id: &TargetId, now: DateTime<Utc>) -> StoreResult<usize> {
        let mut state = self.state.lock().await;
        state.access.remove(id);
        state.targets.remove(id);
        let mut withdrawn = 0;
        for entry in state
            .queue
            .values_mut()
            .filter(|e| e.target_id == *id && e.status == QueueStatus::Pending)
        {
            entry.eligible = false;
            entry.reason = TARGET_DROPPED_REASON.to_string();
            entry.evaluated_at = now;
            entry.updated_at = now;
            withdrawn += 1;
        }
        Ok(withdrawn)
    }

    async fn list_namespaces(&self) -> StoreResult<BTreeSet<String>> {
        let state = self.state.lock().await;
        Ok(state.targets.values().map(|t| t.owner.clone()).collect())
    }

    async fn get_access(&self, id: &TargetId) -> StoreResult<Option<AccessRecord>> {
        Ok(self.state.lock().await.access.get(id).cloned())
    }

    async fn put_access(&self, record: &AccessRecord) -> StoreResult<()> {
        self.state
            .lock()
            .await
            .access
            .insert(record.target_id.clone(), record.clone());
        Ok(())
    }

    async fn list_access(&self) -> StoreResult<Vec<AccessRecord>> {
        Ok(self.state.lock().await.access.values().cloned().collect())
    }

    async fn record_decision(
        &self,
        decision: &Decision,
        now: DateTime<Utc>,
    ) -> StoreResult<QueueEntry> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.queue.get_mut(&decision.key) {
            if entry.status == QueueStatus::Pending {
                entry.priority = decision.priority;
                entry.eligible = decision.eligible;
                entry.reason = decision.reason.clone();
                entry.evaluated_at = now;
                entry.updated_at = now;
            }
            return Ok(entry.clone());
        }

        let seq = state.next_seq();
        let entry = QueueEntry {
            policy_id: decision.key.policy_id,
            target_id: decision.key.target_id.clone(),
            seq,
            generation: 0,
            priority: decision.priority,
            eligible: decision.eligible,
            reason: decision.reason.clone(),
            status: QueueStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: now,
            evaluated_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            next_attempt_at: None,
            target_state: None,
        };
        state.queue.insert(decision.key.clone(), entry.clone());
        Ok(entry)
    }

    async fn supersede(
        &self,
        decision: &Decision,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<QueueEntry>> {
        let mut state = self.state.lock().await;
        let is_done = state
            .queue
            .get(&decision.key)
            .is_some_and(|e| e.status == QueueStatus::Done);
        if !is_done {
            return Ok(None);
        }
        let seq = state.next_seq();
        let Some(entry) = state.queue.get_mut(&decision.key) else {
            return Ok(None);
        };
        entry.seq = seq;
        entry.generation += 1;
        entry.priority = decision.priority;
        entry.eligible = decision.eligible;
        entry.reason = decision.reason.clone();
        entry.status = QueueStatus::Pending;
        entry.attempts = 0;
        entry.last_error = None;
        entry.started_at = None;
        entry.finished_at = None;
        entry.next_attempt_at = None;
        entry.evaluated_at = now;
        entry.updated_at = now;
        Ok(Some(entry.clone()))
    }

    async fn refresh_terminal(
        &self,
        decision: &Decision,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<QueueEntry>> {
        let mut state = self.state.lock().await;
        match state.queue.get_mut(&decision.key) {
            Some(entry) if entry.status.is_terminal() => {
                entry.eligible = decision.eligible;
                entry.reason = decision.reason.clone();
                entry.evaluated_at = now;
                Ok(Some(entry.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn try_claim(
        &self,
        key: &QueueKey,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<QueueEntry>> {
        let mut state = self.state.lock().await;
        let target_busy = state
            .queue
            .values()
            .any(|e| e.target_id == key.target_id && e.status == QueueStatus::Running);
        if target_busy {
            return Ok(None);
        }
        match state.queue.get_mut(key) {
            Some(entry) if entry.is_dispatchable(now) => {
                entry.status = QueueStatus::Running;
                entry.attempts += 1;
                entry.started_at = Some(now);
                entry.finished_at = None;
                entry.updated_at = now;
                Ok(Some(entry.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn complete(
        &self,
        key: &QueueKey,
        completion: Completion,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<QueueEntry> {
        let mut state = self.state.lock().await;
        let entry = state.queue.get_mut(key).ok_or_else(|| not_found(key))?;
        if entry.status != QueueStatus::Running {
            return Err(StoreError::Conflict(format!(
                "queue entry {key} is {} not RUNNING",
                entry.status
            )));
        }
        entry.status = completion.status();
        entry.last_error = error.map(str::to_string);
        entry.updated_at = now;
        match completion {
            Completion::Done { target_state } => {
                entry.finished_at = Some(now);
                entry.next_attempt_at = None;
                entry.target_state = target_state;
            }
            Completion::Failed => {
                entry.finished_at = Some(now);
                entry.next_attempt_at = None;
                entry.target_state = None;
            }
            Completion::Retry { next_attempt_at } => {
                entry.next_attempt_at = Some(next_attempt_at);
                entry.target_state = None;
            }
        }
        Ok(entry.clone())
    }

    async fn requeue(&self, key: &QueueKey, now: DateTime<Utc>) -> StoreResult<QueueEntry> {
        let mut state = self.state.lock().await;
        let entry = state.queue.get_mut(key).ok_or_else(|| not_found(key))?;
        if entry.status != QueueStatus::Failed {
            return Err(StoreError::Conflict(format!(
                "queue entry {key} is {} not FAILED",
                entry.status
            )));
        }
        entry.status = QueueStatus::Pending;
        entry.attempts = 0;
        entry.eligible = true;
        entry.reason = REQUEUE_REASON.to_string();
        entry.next_attempt_at = None;
        entry.finished_at = None;
        entry.updated_at = now;
        Ok(entry.clone())
    }

    async fn get_queue_entry(&self, key: &QueueKey) -> StoreResult<Option<QueueEntry>> {
        Ok(self.state.lock().await.queue.get(key).cloned())
    }

    async fn list_queue(&self, filter: &QueueFilter) -> StoreResult<Vec<QueueEntry>> {
        let state = self.state.lock().await;
        let mut entries: Vec<QueueEntry> = state
            .queue
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        sort_for_dispatch(&mut entries);
        Ok(entries)
    }

    async fn count_running(&self) -> StoreResult<usize> {
        let state = self.state.lock().await;
        Ok(state
            .queue
            .values()
            .filter(|e| e.status == QueueStatus::Running)
            .count())
    }

    async fn append_log(&self, mut entry: ExecutionLogEntry) -> StoreResult<ExecutionLogEntry> {
        let mut state = self.state.lock().await;
        entry.seq = state.log.len() as u64 + 1;
        state.log.push(entry.clone());
        Ok(entry)
    }

    async fn list_log(&self, query: &LogQuery) -> StoreResult<Vec<ExecutionLogEntry>> {
        let state = self.state.lock().await;
        let matching = state.log.iter().filter(|e| query.matches(e)).cloned();
        Ok(match query.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }

    async fn count_failures_since(&self, since: DateTime<Utc>) -> StoreResult<usize> {
        let state = self.state.lock().await;
        Ok(state
            .log
            .iter()
            .filter(|e| e.started_at >= since && e.outcome.is_failure())
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn decision(policy_id: PolicyId, target: &str, eligible: bool) -> Decision {
        Decision {
            key: QueueKey::new(policy_id, TargetId::from(target)),
            priority: 100,
            eligible,
            reason: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_per_target() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let first = decision(PolicyId::new(), "sales.orders", true);
        let second = decision(PolicyId::new(), "sales.orders", true);
        store.record_decision(&first, now).await.unwrap();
        store.record_decision(&second, now).await.unwrap();

        let claimed = store.try_claim(&first.key, now).await.unwrap().unwrap();
        assert_eq!(claimed.status, QueueStatus::Running);
        assert_eq!(claimed.attempts, 1);

        assert!(store.try_claim(&first.key, now).await.unwrap().is_none());
        assert!(store.try_claim(&second.key, now).await.unwrap().is_none());
        assert_eq!(store.count_running().await.unwrap(), 1);

        store
            .complete(&first.key, Completion::done(None), None, now)
            .await
            .unwrap();
        assert!(store.try_claim(&second.key, now).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_decisions_only_refresh_pending_entries() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let d = decision(PolicyId::new(), "sales.orders", true);
        let inserted = store.record_decision(&d, now).await.unwrap();
        assert_eq!(inserted.seq, 1);

        let later = now + Duration::minutes(1);
        let ineligible = Decision {
            eligible: false,
            reason: "changed".to_string(),
            ..d.clone()
        };
        let refreshed = store.record_decision(&ineligible, later).await.unwrap();
        assert!(!refreshed.eligible);
        assert_eq!(refreshed.seq, 1);
        assert_eq!(refreshed.evaluated_at, later);

        store.record_decision(&d, later).await.unwrap();
        store.try_claim(&d.key, later).await.unwrap().unwrap();
        let untouched = store.record_decision(&ineligible, later).await.unwrap();
        assert_eq!(untouched.status, QueueStatus::Running);
        assert!(untouched.eligible);
    }

    #[tokio::test]
    async fn test_retry_supersede_and_requeue_transitions() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let d = decision(PolicyId::new(), "sales.orders", true);
        store.record_decision(&d, now).await.unwrap();

        store.try_claim(&d.key, now).await.unwrap().unwrap();
        let retry_at = now + Duration::minutes(2);
        let pending = store
            .complete(&d.key, Completion::Retry { next_attempt_at: retry_at }, Some("busy"), now)
            .await
            .unwrap();
        assert_eq!(pending.status, QueueStatus::Pending);
        assert_eq!(pending.attempts, 1);
        assert!(store.try_claim(&d.key, now).await.unwrap().is_none());

        store.try_claim(&d.key, retry_at).await.unwrap().unwrap();
        let failed = store
            .complete(&d.key, Completion::Failed, Some("denied"), retry_at)
            .await
            .unwrap();
        assert_eq!(failed.status, QueueStatus::Failed);
        assert_eq!(failed.attempts, 2);
        assert!(store.supersede(&d, retry_at).await.unwrap().is_none());

        let requeued = store.requeue(&d.key, retry_at).await.unwrap();
        assert_eq!(requeued.status, QueueStatus::Pending);
        assert_eq!(requeued.attempts, 0);
        assert_eq!(requeued.reason, REQUEUE_REASON);

        store.try_claim(&d.key, retry_at).await.unwrap().unwrap();
        store
            .complete(&d.key, Completion::done(None), None, retry_at)
            .await
            .unwrap();
        let reopened = store.supersede(&d, retry_at).await.unwrap().unwrap();
        assert_eq!(reopened.generation, 1);
        assert_eq!(reopened.attempts, 0);
        assert!(reopened.seq > 1);

        assert!(matches!(
            store.complete(&d.key, Completion::done(None), None, retry_at).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_terminal_keeps_status() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let d = decision(PolicyId::new(), "sales.orders", true);
        store.record_decision(&d, now).await.unwrap();
        assert!(store.refresh_terminal(&d, now).await.unwrap().is_none());

        store.try_claim(&d.key, now).await.unwrap().unwrap();
        store
            .complete(&d.key, Completion::done(Some("tier=archive".to_string())), None, now)
            .await
            .unwrap();

        let later = now + Duration::hours(1);
        let at_destination = Decision {
            eligible: false,
            reason: "already at target state: tier archive".to_string(),
            ..d.clone()
        };
        let refreshed = store
            .refresh_terminal(&at_destination, later)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(refreshed.status, QueueStatus::Done);
        assert!(!refreshed.eligible);
        assert_eq!(refreshed.reason, "already at target state: tier archive");
        assert_eq!(refreshed.evaluated_at, later);
        assert_eq!(refreshed.target_state.as_deref(), Some("tier=archive"));
        assert_eq!(refreshed.generation, 0);
    }

    #[tokio::test]
    async fn test_drop_target_withdraws_pending_siblings() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let purge = decision(PolicyId::new(), "sales.orders", true);
        let compress = decision(PolicyId::new(), "sales.orders", true);
        let other = decision(PolicyId::new(), "sales.returns", true);
        for d in [&purge, &compress, &other] {
            store.record_decision(d, now).await.unwrap();
        }
        store.try_claim(&purge.key, now).await.unwrap().unwrap();

        let withdrawn = store
            .drop_target(&purge.key.target_id, now)
            .await
            .unwrap();
        assert_eq!(withdrawn, 1);

        let sibling = store.get_queue_entry(&compress.key).await.unwrap().unwrap();
        assert!(!sibling.eligible);
        assert_eq!(sibling.reason, TARGET_DROPPED_REASON);
        assert!(store.try_claim(&compress.key, now).await.unwrap().is_none());

        let running = store.get_queue_entry(&purge.key).await.unwrap().unwrap();
        assert_eq!(running.status, QueueStatus::Running);
        let unrelated = store.get_queue_entry(&other.key).await.unwrap().unwrap();
        assert!(unrelated.eligible);
    }
}
