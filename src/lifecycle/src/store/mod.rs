//! Persistence for policies, targets, access records, the action queue
//! and the execution log.
//!
//! Two backends implement [`LifecycleStore`]: [`InMemoryStore`] for tests
//! and one-shot runs, and [`SqliteStore`] for durable state shared by
//! several processes. Queue transitions that must be atomic (claiming an
//! entry, finalizing it, reopening it) are single store operations.

mod memory;
mod sqlite;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::config::StoreConfig;
use tracing::info;

use crate::audit::{ExecutionLogEntry, LogQuery};
use crate::error::StoreError;
use crate::policy::{Policy, PolicyAuditRecord, PolicyId};
use crate::queue::{Completion, Decision, QueueEntry, QueueFilter, QueueKey};
use crate::target::{TargetId, TargetObject};
use crate::tracker::AccessRecord;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// Reason recorded when an operator reopens a failed entry.
pub const REQUEUE_REASON: &str = "requeued by operator";

/// Reason recorded on pending entries of a target removed by a drop action.
pub const TARGET_DROPPED_REASON: &str = "target dropped";

#[async_trait]
pub trait LifecycleStore: std::fmt::Debug + Send + Sync + 'static {
    /// Persist a new policy together with its first audit record. Fails
    /// with [`StoreError::Conflict`] when the name is taken.
    async fn insert_policy(&self, policy: &Policy, audit: &PolicyAuditRecord) -> StoreResult<()>;

    /// Replace a policy and append an audit record in one step.
    async fn update_policy(&self, policy: &Policy, audit: &PolicyAuditRecord) -> StoreResult<()>;

    async fn get_policy(&self, id: &PolicyId) -> StoreResult<Option<Policy>>;

    async fn get_policy_by_name(&self, name: &str) -> StoreResult<Option<Policy>>;

    async fn list_policies(&self) -> StoreResult<Vec<Policy>>;

    async fn policy_audit(&self, id: &PolicyId) -> StoreResult<Vec<PolicyAuditRecord>>;

    async fn upsert_target(&self, target: &TargetObject) -> StoreResult<()>;

    async fn get_target(&self, id: &TargetId) -> StoreResult<Option<TargetObject>>;

    async fn list_targets(&self) -> StoreResult<Vec<TargetObject>>;

    /// Remove a target and its access record. Returns whether it existed.
    async fn remove_target(&self, id: &TargetId) -> StoreResult<bool>;

    /// Remove a target after a successful drop and, in the same step, mark
    /// every `PENDING` entry of that target ineligible with
    /// [`TARGET_DROPPED_REASON`]. Returns the number of entries withdrawn.
    async fn drop_target(&self, id: &TargetId, now: DateTime<Utc>) -> StoreResult<usize>;

    /// Distinct owners of all registered targets.
    async fn list_namespaces(&self) -> StoreResult<BTreeSet<String>>;

    async fn get_access(&self, id: &TargetId) -> StoreResult<Option<AccessRecord>>;

    async fn put_access(&self, record: &AccessRecord) -> StoreResult<()>;

    async fn list_access(&self) -> StoreResult<Vec<AccessRecord>>;

    /// Insert a `PENDING` entry for a new pair, or refresh eligibility,
    /// reason and priority of an existing `PENDING` entry. Entries in any
    /// other state are returned unchanged.
    async fn record_decision(&self, decision: &Decision, now: DateTime<Utc>)
    -> StoreResult<QueueEntry>;

    /// Reopen a `DONE` entry for a new action: back to `PENDING` with
    /// attempts reset, generation incremented and a fresh sequence number.
    /// Returns `None` when the entry is not `DONE`.
    async fn supersede(
        &self,
        decision: &Decision,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<QueueEntry>>;

    /// Refresh eligibility, reason and evaluation time of a `DONE` or
    /// `FAILED` entry without changing its status. Returns `None` when the
    /// entry is not terminal.
    async fn refresh_terminal(
        &self,
        decision: &Decision,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<QueueEntry>>;

    /// Atomically move a dispatchable entry to `RUNNING` and count the
    /// attempt. Returns `None` if the entry is not dispatchable or another
    /// entry for the same target is already running.
    async fn try_claim(&self, key: &QueueKey, now: DateTime<Utc>)
    -> StoreResult<Option<QueueEntry>>;

    /// Finalize a `RUNNING` entry. `DONE` records the target state carried
    /// by the completion.
    async fn complete(
        &self,
        key: &QueueKey,
        completion: Completion,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<QueueEntry>;

    /// Return a `FAILED` entry to `PENDING` with attempts reset.
    async fn requeue(&self, key: &QueueKey, now: DateTime<Utc>) -> StoreResult<QueueEntry>;

    async fn get_queue_entry(&self, key: &QueueKey) -> StoreResult<Option<QueueEntry>>;

    /// Entries matching `filter`, in dispatch order.
    async fn list_queue(&self, filter: &QueueFilter) -> StoreResult<Vec<QueueEntry>>;

    async fn count_running(&self) -> StoreResult<usize>;

    /// Append to the execution log, returning the entry with its sequence
    /// number assigned.
    async fn append_log(&self, entry: ExecutionLogEntry) -> StoreResult<ExecutionLogEntry>;

    /// Log entries matching `query`, oldest first.
    async fn list_log(&self, query: &LogQuery) -> StoreResult<Vec<ExecutionLogEntry>>;

    async fn count_failures_since(&self, since: DateTime<Utc>) -> StoreResult<usize>;
}

/// Open the store described by `config`.
pub async fn connect(config: &StoreConfig) -> StoreResult<Arc<dyn LifecycleStore>> {
    if config.is_memory() {
        info!("Using in-memory lifecycle store");
        return Ok(Arc::new(InMemoryStore::new()));
    }
    if config.dsn.starts_with("sqlite:") {
        let store = SqliteStore::connect(&config.dsn).await?;
        return Ok(Arc::new(store));
    }
    Err(StoreError::UnsupportedDsn(config.dsn.clone()))
}
