use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use lifecycle::{LifecycleService, LogQuery, QueueFilter, QueueStatus, TargetId};

use super::print_json;

pub async fn evaluate(service: &LifecycleService, json: bool) -> Result<()> {
    let report = service.evaluate().await.context("Evaluation cycle failed")?;
    if json {
        return print_json(&report);
    }
    println!(
        "Evaluated {} policies over {} pairs: {} eligible, {} ineligible, {} new, {} superseded",
        report.policies_evaluated,
        report.pairs_considered,
        report.eligible,
        report.ineligible,
        report.new_entries,
        report.superseded
    );
    for overlap in &report.overlaps {
        println!(
            "Overlap on {}: {}",
            overlap.target_id,
            overlap.policies.join(" -> ")
        );
    }
    for error in &report.errors {
        println!("Error: {error}");
    }
    Ok(())
}

pub async fn execute(
    service: &LifecycleService,
    max_operations: Option<usize>,
    json: bool,
) -> Result<()> {
    let report = service
        .execute(max_operations)
        .await
        .context("Execution cycle failed")?;
    if json {
        return print_json(&report);
    }
    if !report.window_open {
        println!("Maintenance window closed, nothing dispatched.");
        return Ok(());
    }
    println!(
        "Dispatched {} of {} candidates: {} succeeded, {} with warnings, {} retrying, {} failed, {} skipped",
        report.dispatched,
        report.candidates,
        report.succeeded,
        report.warnings,
        report.retried,
        report.failed,
        report.skipped.len()
    );
    for entry in &report.entries {
        println!(
            "  {:<40}  {:<14}  {:<8}  {}",
            entry.target_id.as_str(),
            entry.action.as_str(),
            entry.outcome.as_str(),
            entry.error_detail.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

pub async fn explain(service: &LifecycleService, policy: &str, target: &str) -> Result<()> {
    let entry = service.explain(policy, &TargetId::from(target)).await?;
    println!("Policy:    {}", entry.policy_id);
    println!("Target:    {}", entry.target_id);
    println!("Eligible:  {}", entry.eligible);
    println!("Reason:    {}", entry.reason);
    println!("Status:    {}", entry.status);
    println!("Attempts:  {}", entry.attempts);
    if let Some(error) = &entry.last_error {
        println!("Last error: {error}");
    }
    Ok(())
}

#[derive(Args, Debug)]
pub struct QueueArgs {
    /// PENDING, RUNNING, DONE or FAILED
    #[arg(long)]
    status: Option<QueueStatus>,
    /// Only entries of this policy (name or id)
    #[arg(long)]
    policy: Option<String>,
    /// Only eligible entries
    #[arg(long)]
    eligible: bool,
    #[arg(long)]
    json: bool,
}

impl QueueArgs {
    pub async fn run(self, service: &LifecycleService) -> Result<()> {
        let policy_id = match &self.policy {
            Some(policy) => Some(service.registry().resolve(policy).await?.id),
            None => None,
        };
        let filter = QueueFilter {
            status: self.status,
            policy_id,
            target_id: None,
            eligible: self.eligible.then_some(true),
        };
        let entries = service.queue_entries(&filter).await?;
        if self.json {
            return print_json(&entries);
        }
        for entry in &entries {
            println!(
                "{:>5}  {:<8}  {:<40}  {}",
                entry.priority,
                entry.status.as_str(),
                entry.target_id.as_str(),
                entry.reason
            );
        }
        Ok(())
    }
}

pub async fn requeue(
    service: &LifecycleService,
    policy: &str,
    target: &str,
    actor: &str,
) -> Result<()> {
    let entry = service
        .requeue(policy, &TargetId::from(target), actor)
        .await
        .context("Failed to requeue entry")?;
    println!("Entry {} is {} again.", entry.key(), entry.status);
    Ok(())
}

pub async fn failures(service: &LifecycleService, since: Duration) -> Result<()> {
    let since = Utc::now() - chrono::Duration::from_std(since).context("Period too long")?;
    let count = service.recent_failure_count(since).await?;
    println!("{count}");
    Ok(())
}

#[derive(Args, Debug)]
pub struct LogArgs {
    /// Look-back period, e.g. `24h`
    #[arg(long, value_parser = humantime::parse_duration)]
    since: Option<Duration>,
    /// Only failed and retried attempts
    #[arg(long)]
    failures: bool,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    json: bool,
}

impl LogArgs {
    pub async fn run(self, service: &LifecycleService) -> Result<()> {
        let since = self
            .since
            .map(|period| chrono::Duration::from_std(period).map(|d| Utc::now() - d))
            .transpose()
            .context("Period too long")?;
        let query = LogQuery {
            since,
            failures_only: self.failures,
            limit: self.limit,
            ..Default::default()
        };
        let entries = service.execution_log(&query).await?;
        if self.json {
            return print_json(&entries);
        }
        for entry in &entries {
            let saved = entry
                .space_saved()
                .map(|bytes| format!("saved {bytes}B"))
                .unwrap_or_default();
            println!(
                "{:>6}  {}  {:<40}  {:<14}  {:<8}  {:>6}ms  {}",
                entry.seq,
                entry.finished_at.to_rfc3339(),
                entry.target_id.as_str(),
                entry.action.as_str(),
                entry.outcome.as_str(),
                entry.duration_ms,
                entry
                    .error_detail
                    .as_deref()
                    .map(str::to_string)
                    .unwrap_or(saved)
            );
        }
        Ok(())
    }
}
