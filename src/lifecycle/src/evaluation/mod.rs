//! Evaluation cycle
//!
//! Matches every enabled policy against every registered target, decides
//! eligibility and records the decision in the queue. Running the cycle
//! twice against unchanged inputs leaves the queue unchanged apart from
//! refresh timestamps.
//!
//! Entry handling per (policy, target) pair:
//!
//! - no entry: insert `PENDING` with the decision
//! - `PENDING`: refresh eligibility, reason and priority
//! - `RUNNING`: left alone, the action is in flight
//! - `DONE`: reopened as a new generation once the target is eligible again
//!   and its state changed since the action completed, otherwise the
//!   decision is refreshed in place
//! - `FAILED`: left alone until an operator requeues it
//!
//! A store failure on one pair is reported and the cycle moves on.

pub mod conditions;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::metrics::LifecycleMetrics;
use crate::policy::{Policy, PolicyId, PredicateContext, SelectorCache};
use crate::queue::{Decision, QueueEntry, QueueFilter, QueueKey, QueueStatus};
use crate::store::{LifecycleStore, TARGET_DROPPED_REASON};
use crate::target::{TargetId, TargetObject};
use crate::tracker::{AccessRecord, AccessTracker, Temperature};

pub use conditions::{ALREADY_AT_TARGET_STATE, Assessment, assess, format_bytes};

/// Reason recorded on a completed entry whose target has not changed since.
pub const COMPLETED_UNCHANGED: &str = "action already completed, target unchanged";

/// One (policy, target) decision of a cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecisionRecord {
    pub policy_id: PolicyId,
    pub policy_name: String,
    pub target_id: TargetId,
    pub eligible: bool,
    pub reason: String,
    /// Queue status after the cycle
    pub status: QueueStatus,
    pub temperature: Temperature,
}

/// A target selected by more than one eligible policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Overlap {
    pub target_id: TargetId,
    /// Policy names in execution order
    pub policies: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub policies_evaluated: usize,
    pub pairs_considered: usize,
    pub eligible: usize,
    pub ineligible: usize,
    pub new_entries: usize,
    /// Completed entries reopened for a new action
    pub superseded: usize,
    /// Pairs skipped because their action is running
    pub in_flight: usize,
    /// Pairs whose last execution failed and await a requeue
    pub awaiting_requeue: usize,
    /// Pending entries whose policy or target no longer applies
    pub withdrawn: usize,
    pub decisions: Vec<DecisionRecord>,
    pub overlaps: Vec<Overlap>,
    pub errors: Vec<String>,
}

impl EvaluationReport {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            run_id: format!("evaluation_{}", now.timestamp_millis()),
            started_at: now,
            completed_at: now,
            policies_evaluated: 0,
            pairs_considered: 0,
            eligible: 0,
            ineligible: 0,
            new_entries: 0,
            superseded: 0,
            in_flight: 0,
            awaiting_requeue: 0,
            withdrawn: 0,
            decisions: Vec::new(),
            overlaps: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Decision for a given pair, if the cycle produced one.
    pub fn decision(&self, policy_id: &PolicyId, target_id: &TargetId) -> Option<&DecisionRecord> {
        self.decisions
            .iter()
            .find(|d| d.policy_id == *policy_id && d.target_id == *target_id)
    }
}

pub struct Evaluator {
    store: Arc<dyn LifecycleStore>,
    tracker: Arc<AccessTracker>,
    selectors: SelectorCache,
    metrics: LifecycleMetrics,
}

impl Evaluator {
    pub fn new(
        store: Arc<dyn LifecycleStore>,
        tracker: Arc<AccessTracker>,
        metrics: LifecycleMetrics,
    ) -> Self {
        Self {
            store,
            tracker,
            selectors: SelectorCache::new(),
            metrics,
        }
    }

    pub async fn run_cycle(&self) -> Result<EvaluationReport> {
        self.run_cycle_at(Utc::now()).await
    }

    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<EvaluationReport> {
        let mut report = EvaluationReport::new(now);
        info!(run_id = %report.run_id, "Starting evaluation cycle");

        let all_policies = self.store.list_policies().await?;
        let mut policies: Vec<&Policy> = all_policies.iter().filter(|p| p.is_enabled()).collect();
        policies.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        self.selectors
            .retain(&all_policies.iter().map(|p| p.id).collect::<Vec<_>>())
            .await;

        let targets = self.store.list_targets().await?;
        let access: HashMap<TargetId, AccessRecord> = self
            .store
            .list_access()
            .await?
            .into_iter()
            .map(|r| (r.target_id.clone(), r))
            .collect();
        let existing: HashMap<QueueKey, QueueEntry> = self
            .store
            .list_queue(&QueueFilter::all())
            .await?
            .into_iter()
            .map(|e| (e.key(), e))
            .collect();

        let temperatures: HashMap<TargetId, Temperature> = targets
            .iter()
            .map(|t| {
                let id = t.id();
                let temperature = self.tracker.classify(t, access.get(&id), now);
                (id, temperature)
            })
            .collect();

        let mut visited: HashSet<QueueKey> = HashSet::new();
        let mut skipped: HashSet<PolicyId> = HashSet::new();
        let mut eligible_by_target: BTreeMap<TargetId, Vec<String>> = BTreeMap::new();

        for policy in &policies {
            let selector = match self.selectors.get(policy).await {
                Ok(selector) => selector,
                Err(e) => {
                    warn!(policy = %policy.name(), error = %e, "Skipping policy with invalid selector");
                    report
                        .errors
                        .push(format!("policy '{}': {e}", policy.name()));
                    skipped.insert(policy.id);
                    continue;
                }
            };
            report.policies_evaluated += 1;

            for target in targets.iter().filter(|t| selector.matches(t)) {
                let target_id = target.id();
                let temperature = temperatures
                    .get(&target_id)
                    .copied()
                    .unwrap_or(Temperature::Warm);
                let key = QueueKey::new(policy.id, target_id.clone());
                visited.insert(key.clone());
                report.pairs_considered += 1;

                let decided = self
                    .decide(
                        policy,
                        target,
                        access.get(&target_id),
                        temperature,
                        existing.get(&key),
                        now,
                        &mut report,
                    )
                    .await;
                let record = match decided {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(
                            policy = %policy.name(),
                            target_id = %target_id,
                            error = %e,
                            "Failed to record decision"
                        );
                        report.errors.push(format!("decision {key}: {e}"));
                        continue;
                    }
                };

                if record.eligible && record.status == QueueStatus::Pending {
                    eligible_by_target
                        .entry(target_id)
                        .or_default()
                        .push(policy.name().to_string());
                }
                report.decisions.push(record);
            }
        }

        self.withdraw_stale(
            &all_policies,
            &targets,
            &existing,
            &visited,
            &skipped,
            now,
            &mut report,
        )
        .await;

        for (target_id, names) in eligible_by_target {
            if names.len() > 1 {
                warn!(
                    target_id = %target_id,
                    policies = ?names,
                    "Target selected by several eligible policies, executing in priority order"
                );
                report.overlaps.push(Overlap {
                    target_id,
                    policies: names,
                });
            }
        }

        report.completed_at = Utc::now().max(now);
        self.metrics
            .record_evaluation_cycle(report.eligible, report.ineligible, report.overlaps.len());
        info!(
            run_id = %report.run_id,
            policies = report.policies_evaluated,
            pairs = report.pairs_considered,
            eligible = report.eligible,
            ineligible = report.ineligible,
            superseded = report.superseded,
            overlaps = report.overlaps.len(),
            errors = report.errors.len(),
            "Evaluation cycle completed"
        );
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn decide(
        &self,
        policy: &Policy,
        target: &TargetObject,
        access: Option<&AccessRecord>,
        temperature: Temperature,
        existing: Option<&QueueEntry>,
        now: DateTime<Utc>,
        report: &mut EvaluationReport,
    ) -> Result<DecisionRecord> {
        let target_id = target.id();
        let record = |eligible: bool, reason: String, status: QueueStatus| DecisionRecord {
            policy_id: policy.id,
            policy_name: policy.name().to_string(),
            target_id: target_id.clone(),
            eligible,
            reason,
            status,
            temperature,
        };

        match existing.map(|e| e.status) {
            Some(QueueStatus::Running) => {
                report.in_flight += 1;
                let attempts = existing.map(|e| e.attempts).unwrap_or_default();
                return Ok(record(
                    false,
                    format!("operation in flight (attempt {attempts})"),
                    QueueStatus::Running,
                ));
            }
            Some(QueueStatus::Failed) => {
                report.awaiting_requeue += 1;
                let error = existing
                    .and_then(|e| e.last_error.clone())
                    .unwrap_or_else(|| "unknown error".to_string());
                return Ok(record(
                    false,
                    format!("last execution failed ({error}), awaiting requeue"),
                    QueueStatus::Failed,
                ));
            }
            _ => {}
        }

        let ctx = PredicateContext {
            target,
            access,
            temperature,
            now,
        };
        let assessment = assess(policy, &ctx);
        let unchanged_since_done = existing.is_some_and(|e| {
            e.status == QueueStatus::Done && !e.target_changed_since_done(&target.state_signature())
        });
        let (eligible, reason) = if assessment.eligible && unchanged_since_done {
            (false, COMPLETED_UNCHANGED.to_string())
        } else {
            (assessment.eligible, assessment.reason)
        };
        if eligible {
            report.eligible += 1;
        } else {
            report.ineligible += 1;
        }
        let decision = Decision {
            key: QueueKey::new(policy.id, target_id.clone()),
            priority: policy.priority(),
            eligible,
            reason,
        };

        let entry = match existing.map(|e| e.status) {
            Some(QueueStatus::Done) if eligible => {
                match self.store.supersede(&decision, now).await? {
                    Some(entry) => {
                        report.superseded += 1;
                        info!(
                            policy = %policy.name(),
                            target_id = %target_id,
                            generation = entry.generation,
                            "Completed entry reopened"
                        );
                        entry
                    }
                    None => self.store.record_decision(&decision, now).await?,
                }
            }
            Some(QueueStatus::Done) => match self.store.refresh_terminal(&decision, now).await? {
                Some(entry) => entry,
                None => self.store.record_decision(&decision, now).await?,
            },
            None => {
                report.new_entries += 1;
                self.store.record_decision(&decision, now).await?
            }
            _ => self.store.record_decision(&decision, now).await?,
        };

        debug!(
            policy = %policy.name(),
            target_id = %target_id,
            eligible = decision.eligible,
            reason = %decision.reason,
            "Decision recorded"
        );
        Ok(record(entry.eligible, entry.reason, entry.status))
    }

    /// Mark pending entries ineligible when their policy was disabled or
    /// their target vanished or no longer matches.
    #[allow(clippy::too_many_arguments)]
    async fn withdraw_stale(
        &self,
        policies: &[Policy],
        targets: &[TargetObject],
        existing: &HashMap<QueueKey, QueueEntry>,
        visited: &HashSet<QueueKey>,
        skipped: &HashSet<PolicyId>,
        now: DateTime<Utc>,
        report: &mut EvaluationReport,
    ) {
        let target_ids: HashSet<TargetId> = targets.iter().map(|t| t.id()).collect();
        let policies: HashMap<PolicyId, &Policy> = policies.iter().map(|p| (p.id, p)).collect();

        for (key, entry) in existing {
            if entry.status != QueueStatus::Pending
                || visited.contains(key)
                || skipped.contains(&key.policy_id)
            {
                continue;
            }
            let policy = policies.get(&key.policy_id);
            let reason = match policy {
                None => "policy no longer registered",
                Some(p) if !p.is_enabled() => "policy is disabled",
                Some(_) if !target_ids.contains(&key.target_id) => "target no longer exists",
                Some(_) => "target no longer matches the policy selector",
            };
            let already_withdrawn = entry.reason == reason || entry.reason == TARGET_DROPPED_REASON;
            if !entry.eligible && already_withdrawn {
                continue;
            }

            let decision = Decision {
                key: key.clone(),
                priority: entry.priority,
                eligible: false,
                reason: reason.to_string(),
            };
            match self.store.record_decision(&decision, now).await {
                Ok(_) => {
                    report.withdrawn += 1;
                    debug!(queue_key = %key, reason, "Pending entry withdrawn");
                }
                Err(e) => {
                    warn!(queue_key = %key, error = %e, "Failed to withdraw pending entry");
                    report.errors.push(format!("withdraw {key}: {e}"));
                }
            }
        }
    }
}
