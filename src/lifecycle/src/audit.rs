//! Execution audit log
//!
//! Every execution attempt appends one entry, whatever its outcome. The
//! log is append-only and ordered by a store-assigned sequence number.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ExecutionErrorKind, Result};
use crate::policy::{ActionType, PolicyId};
use crate::store::LifecycleStore;
use crate::target::TargetId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success,
    /// Primary action succeeded, a secondary step did not
    Warning,
    /// Transient failure, entry returned to the queue
    Retrying,
    Failed,
    /// Operator reopened a failed entry
    Requeued,
}

impl ExecutionOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionOutcome::Success => "success",
            ExecutionOutcome::Warning => "warning",
            ExecutionOutcome::Retrying => "retrying",
            ExecutionOutcome::Failed => "failed",
            ExecutionOutcome::Requeued => "requeued",
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, ExecutionOutcome::Retrying | ExecutionOutcome::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    /// Assigned on append
    pub seq: u64,
    pub policy_id: PolicyId,
    pub target_id: TargetId,
    pub generation: u32,
    pub attempt: u32,
    pub action: ActionType,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub before_size: Option<u64>,
    pub after_size: Option<u64>,
    pub duration_ms: u64,
    pub outcome: ExecutionOutcome,
    pub error_kind: Option<ExecutionErrorKind>,
    pub error_detail: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ExecutionLogEntry {
    /// Bytes reclaimed, when both sizes are known.
    pub fn space_saved(&self) -> Option<u64> {
        match (self.before_size, self.after_size) {
            (Some(before), Some(after)) => Some(before.saturating_sub(after)),
            _ => None,
        }
    }

    /// `before / after`, e.g. 6.25 for 500 MB compressed to 80 MB.
    pub fn compression_ratio(&self) -> Option<f64> {
        match (self.before_size, self.after_size) {
            (Some(before), Some(after)) if after > 0 => Some(before as f64 / after as f64),
            _ => None,
        }
    }
}

/// Time-bounded query over the log
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogQuery {
    pub since: Option<DateTime<Utc>>,
    pub policy_id: Option<PolicyId>,
    pub target_id: Option<TargetId>,
    pub failures_only: bool,
    pub limit: Option<usize>,
}

impl LogQuery {
    pub fn matches(&self, entry: &ExecutionLogEntry) -> bool {
        self.since.is_none_or(|since| entry.started_at >= since)
            && self.policy_id.is_none_or(|p| p == entry.policy_id)
            && self.target_id.as_ref().is_none_or(|t| *t == entry.target_id)
            && (!self.failures_only || entry.outcome.is_failure())
    }
}

/// Aggregate over a set of log entries
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AuditSummary {
    pub entries: usize,
    pub successes: usize,
    pub warnings: usize,
    pub failures: usize,
    pub bytes_saved: u64,
}

/// Read and append access to the execution log
#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn LifecycleStore>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn LifecycleStore>) -> Self {
        Self { store }
    }

    pub async fn append(&self, entry: ExecutionLogEntry) -> Result<ExecutionLogEntry> {
        Ok(self.store.append_log(entry).await?)
    }

    pub async fn entries(&self, query: &LogQuery) -> Result<Vec<ExecutionLogEntry>> {
        Ok(self.store.list_log(query).await?)
    }

    /// Failed and retried attempts since `since`.
    pub async fn recent_failure_count(&self, since: DateTime<Utc>) -> Result<usize> {
        Ok(self.store.count_failures_since(since).await?)
    }

    pub async fn summary(&self, query: &LogQuery) -> Result<AuditSummary> {
        let entries = self.entries(query).await?;
        let mut summary = AuditSummary {
            entries: entries.len(),
            ..Default::default()
        };
        for entry in &entries {
            match entry.outcome {
                ExecutionOutcome::Success => summary.successes += 1,
                ExecutionOutcome::Warning => summary.warnings += 1,
                ExecutionOutcome::Retrying | ExecutionOutcome::Failed => summary.failures += 1,
                ExecutionOutcome::Requeued => {}
            }
            if !entry.outcome.is_failure() {
                summary.bytes_saved += entry.space_saved().unwrap_or(0);
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use chrono::Duration;

    const MB: u64 = 1024 * 1024;

    fn entry(outcome: ExecutionOutcome, started_at: DateTime<Utc>) -> ExecutionLogEntry {
        ExecutionLogEntry {
            seq: 0,
            policy_id: PolicyId::new(),
            target_id: TargetId::from("sales.orders.p2024_01"),
            generation: 0,
            attempt: 1,
            action: ActionType::Compress,
            started_at,
            finished_at: started_at,
            before_size: Some(500 * MB),
            after_size: Some(80 * MB),
            duration_ms: 12,
            outcome,
            error_kind: None,
            error_detail: None,
            warnings: vec![],
        }
    }

    #[test]
    fn test_space_saved_and_ratio() {
        let e = entry(ExecutionOutcome::Success, Utc::now());
        assert_eq!(e.space_saved(), Some(420 * MB));
        assert_eq!(e.compression_ratio(), Some(6.25));

        let unknown = ExecutionLogEntry {
            after_size: None,
            ..e
        };
        assert_eq!(unknown.space_saved(), None);
        assert_eq!(unknown.compression_ratio(), None);
    }

    #[tokio::test]
    async fn test_append_assigns_sequence_and_counts_failures() {
        let now = Utc::now();
        let log = AuditLog::new(Arc::new(InMemoryStore::new()));

        let first = log.append(entry(ExecutionOutcome::Success, now)).await.unwrap();
        let second = log
            .append(entry(ExecutionOutcome::Retrying, now - Duration::hours(30)))
            .await
            .unwrap();
        log.append(entry(ExecutionOutcome::Failed, now)).await.unwrap();
        assert!(second.seq > first.seq);

        assert_eq!(
            log.recent_failure_count(now - Duration::hours(24)).await.unwrap(),
            1
        );
        assert_eq!(
            log.recent_failure_count(now - Duration::hours(48)).await.unwrap(),
            2
        );

        let summary = log.summary(&LogQuery::default()).await.unwrap();
        assert_eq!(summary.entries, 3);
        assert_eq!(summary.successes, 1);
        assert_eq!(summary.failures, 2);
        assert_eq!(summary.bytes_saved, 420 * MB);
    }
}
