//! Durable action queue
//!
//! One entry per (policy, target) pair. The evaluator inserts and refreshes
//! `PENDING` entries, the executor claims them (`RUNNING`) and finalizes
//! them as `DONE` or `FAILED`, or returns them to `PENDING` for a retry.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::policy::PolicyId;
use crate::target::TargetId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl QueueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "PENDING",
            QueueStatus::Running => "RUNNING",
            QueueStatus::Done => "DONE",
            QueueStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, QueueStatus::Done | QueueStatus::Failed)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(QueueStatus::Pending),
            "RUNNING" => Ok(QueueStatus::Running),
            "DONE" => Ok(QueueStatus::Done),
            "FAILED" => Ok(QueueStatus::Failed),
            other => Err(format!("unknown queue status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueKey {
    pub policy_id: PolicyId,
    pub target_id: TargetId,
}

impl QueueKey {
    pub fn new(policy_id: PolicyId, target_id: TargetId) -> Self {
        Self {
            policy_id,
            target_id,
        }
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.policy_id, self.target_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub policy_id: PolicyId,
    pub target_id: TargetId,
    /// Insertion order, used to break priority ties
    pub seq: u64,
    /// Bumped each time a completed entry is reopened for a new action
    pub generation: u32,
    pub priority: u32,
    pub eligible: bool,
    pub reason: String,
    pub status: QueueStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub evaluated_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Earliest time a retry may be claimed
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// State signature of the target when the entry last reached `DONE`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_state: Option<String>,
}

impl QueueEntry {
    pub fn key(&self) -> QueueKey {
        QueueKey::new(self.policy_id, self.target_id.clone())
    }

    /// Pending, eligible and past any retry backoff.
    pub fn is_dispatchable(&self, now: DateTime<Utc>) -> bool {
        self.status == QueueStatus::Pending
            && self.eligible
            && self.next_attempt_at.is_none_or(|at| at <= now)
    }

    /// Whether the target moved away from the state this entry left it in.
    /// Entries without a recorded state count as changed.
    pub fn target_changed_since_done(&self, current_state: &str) -> bool {
        self.target_state.as_deref() != Some(current_state)
    }
}

/// An evaluation outcome for one (policy, target) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub key: QueueKey,
    pub priority: u32,
    pub eligible: bool,
    pub reason: String,
}

/// How a claimed entry is finalized
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// `target_state` is the target's state signature after the action,
    /// `None` when the target no longer exists
    Done { target_state: Option<String> },
    Retry { next_attempt_at: DateTime<Utc> },
    Failed,
}

impl Completion {
    pub fn done(target_state: Option<String>) -> Self {
        Completion::Done { target_state }
    }

    pub fn status(&self) -> QueueStatus {
        match self {
            Completion::Done { .. } => QueueStatus::Done,
            Completion::Retry { .. } => QueueStatus::Pending,
            Completion::Failed => QueueStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueFilter {
    pub status: Option<QueueStatus>,
    pub policy_id: Option<PolicyId>,
    pub target_id: Option<TargetId>,
    pub eligible: Option<bool>,
}

impl QueueFilter {
    pub fn all() -> Self {
        Self::default()
    }

    /// Pending and eligible, regardless of backoff.
    pub fn dispatchable() -> Self {
        Self {
            status: Some(QueueStatus::Pending),
            eligible: Some(true),
            ..Default::default()
        }
    }

    pub fn with_status(status: QueueStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn matches(&self, entry: &QueueEntry) -> bool {
        self.status.is_none_or(|s| s == entry.status)
            && self.policy_id.is_none_or(|p| p == entry.policy_id)
            && self.target_id.as_ref().is_none_or(|t| *t == entry.target_id)
            && self.eligible.is_none_or(|e| e == entry.eligible)
    }
}

/// Dispatch order: priority, then insertion order.
pub fn sort_for_dispatch(entries: &mut [QueueEntry]) {
    entries.sort_by_key(|e| (e.priority, e.seq));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(priority: u32, seq: u64) -> QueueEntry {
        let now = Utc::now();
        QueueEntry {
            policy_id: PolicyId::new(),
            target_id: TargetId::from("sales.orders"),
            seq,
            generation: 0,
            priority,
            eligible: true,
            reason: String::new(),
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
        }
    }

    #[test]
    fn test_dispatch_order() {
        let mut entries = vec![entry(200, 1), entry(100, 3), entry(100, 2)];
        sort_for_dispatch(&mut entries);
        let order: Vec<(u32, u64)> = entries.iter().map(|e| (e.priority, e.seq)).collect();
        assert_eq!(order, vec![(100, 2), (100, 3), (200, 1)]);
    }

    #[test]
    fn test_dispatchable_respects_backoff() {
        let now = Utc::now();
        let mut e = entry(1, 1);
        assert!(e.is_dispatchable(now));

        e.next_attempt_at = Some(now + Duration::minutes(5));
        assert!(!e.is_dispatchable(now));
        assert!(e.is_dispatchable(now + Duration::minutes(5)));

        e.next_attempt_at = None;
        e.eligible = false;
        assert!(!e.is_dispatchable(now));
    }

    #[test]
    fn test_target_change_detection() {
        let mut e = entry(1, 1);
        assert!(e.target_changed_since_done("tier=standard"));

        e.target_state = Some("tier=standard".to_string());
        assert!(!e.target_changed_since_done("tier=standard"));
        assert!(e.target_changed_since_done("tier=archive"));
    }

    #[test]
    fn test_filter_and_status_parsing() {
        let e = entry(1, 1);
        assert!(QueueFilter::all().matches(&e));
        assert!(QueueFilter::dispatchable().matches(&e));
        assert!(!QueueFilter::with_status(QueueStatus::Failed).matches(&e));
        assert_eq!("failed".parse::<QueueStatus>().unwrap(), QueueStatus::Failed);
        assert!(QueueStatus::Done.is_terminal());
        assert!(!QueueStatus::Running.is_terminal());
        assert_eq!(
            serde_json::to_string(&QueueStatus::Running).unwrap(),
            "\"RUNNING\""
        );
    }
}
