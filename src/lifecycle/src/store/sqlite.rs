use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteQueryResult, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction, query};
use tracing::{debug, info};

use super::{LifecycleStore, REQUEUE_REASON, StoreResult, TARGET_DROPPED_REASON};
use crate::audit::{ExecutionLogEntry, LogQuery};
use crate::error::StoreError;
use crate::policy::{Policy, PolicyAuditRecord, PolicyId};
use crate::queue::{Completion, Decision, QueueEntry, QueueFilter, QueueKey, QueueStatus};
use crate::target::{TargetId, TargetObject};
use crate::tracker::AccessRecord;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS policies (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        priority INTEGER NOT NULL,
        enabled INTEGER NOT NULL,
        body TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS policy_audit (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        policy_id TEXT NOT NULL,
        body TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS targets (
        id TEXT PRIMARY KEY,
        owner TEXT NOT NULL,
        body TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS access_records (
        target_id TEXT PRIMARY KEY,
        body TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS queue_entries (
        policy_id TEXT NOT NULL,
        target_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        generation INTEGER NOT NULL,
        priority INTEGER NOT NULL,
        eligible INTEGER NOT NULL,
        reason TEXT NOT NULL,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL,
        last_error TEXT,
        created_at TEXT NOT NULL,
        evaluated_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        started_at TEXT,
        finished_at TEXT,
        next_attempt_at TEXT,
        target_state TEXT,
        PRIMARY KEY (policy_id, target_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_queue_dispatch ON queue_entries (status, priority, seq)",
    "CREATE INDEX IF NOT EXISTS idx_queue_target ON queue_entries (target_id, status)",
    r#"
    CREATE TABLE IF NOT EXISTS execution_log (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        policy_id TEXT NOT NULL,
        target_id TEXT NOT NULL,
        started_at TEXT NOT NULL,
        outcome TEXT NOT NULL,
        body TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_log_started ON execution_log (started_at)",
];

const QUEUE_COLUMNS: &str = "policy_id, target_id, seq, generation, priority, eligible, reason, \
     status, attempts, last_error, created_at, evaluated_at, updated_at, started_at, \
     finished_at, next_attempt_at, target_state";

/// SQLite-backed store shared by every process pointing at the same file.
/// Conditional `UPDATE` statements make queue transitions atomic across
/// processes.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect and create the schema if needed.
    pub async fn connect(dsn: &str) -> StoreResult<Self> {
        info!(dsn = %dsn, "Connecting to lifecycle store");

        let in_memory = dsn.contains(":memory:") || dsn.contains("mode=memory");
        let pool = if in_memory {
            // Every connection to an in-memory database sees its own data
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
                .connect(dsn)
                .await?
        } else {
            prepare_parent_dir(dsn)?;
            let dsn_with_create = if dsn.contains('?') {
                if dsn.contains("mode=") {
                    dsn.to_string()
                } else {
                    format!("{dsn}&mode=rwc")
                }
            } else {
                format!("{dsn}?mode=rwc")
            };
            SqlitePoolOptions::new()
                .max_connections(8)
                .connect(&dsn_with_create)
                .await?
        };

        let store = Self { pool };
        store.init().await?;
        info!("Lifecycle store schema initialized");
        Ok(store)
    }

    async fn init(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn fetch_entry(&self, key: &QueueKey) -> StoreResult<Option<QueueEntry>> {
        let sql = format!(
            "SELECT {QUEUE_COLUMNS} FROM queue_entries WHERE policy_id = ? AND target_id = ?"
        );
        let row = query(&sql)
            .bind(key.policy_id.to_string())
            .bind(key.target_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(queue_entry_from_row).transpose()
    }

    /// Distinguish "missing" from "wrong state" after a conditional update
    /// touched no row.
    async fn transition_error(&self, key: &QueueKey, expected: QueueStatus) -> StoreError {
        match self.fetch_entry(key).await {
            Ok(Some(entry)) => StoreError::Conflict(format!(
                "queue entry {key} is {} not {expected}",
                entry.status
            )),
            Ok(None) => StoreError::NotFound {
                entity: "queue entry",
                id: key.to_string(),
            },
            Err(e) => e,
        }
    }
}

fn prepare_parent_dir(dsn: &str) -> StoreResult<()> {
    let path = dsn
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:");
    let path = path.split('?').next().unwrap_or_default();
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            debug!(dir = %parent.display(), "Creating store directory");
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("invalid timestamp '{value}': {e}")))
}

fn parse_opt_ts(value: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_ts).transpose()
}

fn to_u32(value: i64, field: &str) -> StoreResult<u32> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{field} out of range: {value}")))
}

fn to_u64(value: i64, field: &str) -> StoreResult<u64> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("{field} out of range: {value}")))
}

fn queue_entry_from_row(row: &SqliteRow) -> StoreResult<QueueEntry> {
    let policy_id: String = row.try_get("policy_id")?;
    let status: String = row.try_get("status")?;
    Ok(QueueEntry {
        policy_id: PolicyId::from_str(&policy_id)
            .map_err(|e| StoreError::Corrupt(format!("invalid policy id '{policy_id}': {e}")))?,
        target_id: TargetId::from(row.try_get::<String, _>("target_id")?),
        seq: to_u64(row.try_get("seq")?, "seq")?,
        generation: to_u32(row.try_get("generation")?, "generation")?,
        priority: to_u32(row.try_get("priority")?, "priority")?,
        eligible: row.try_get("eligible")?,
        reason: row.try_get("reason")?,
        status: QueueStatus::from_str(&status).map_err(StoreError::Corrupt)?,
        attempts: to_u32(row.try_get("attempts")?, "attempts")?,
        last_error: row.try_get("last_error")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        evaluated_at: parse_ts(&row.try_get::<String, _>("evaluated_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
        started_at: parse_opt_ts(row.try_get("started_at")?)?,
        finished_at: parse_opt_ts(row.try_get("finished_at")?)?,
        next_attempt_at: parse_opt_ts(row.try_get("next_attempt_at")?)?,
        target_state: row.try_get("target_state")?,
    })
}

fn body<T: serde::de::DeserializeOwned>(row: &SqliteRow) -> StoreResult<T> {
    let body: String = row.try_get("body")?;
    Ok(serde_json::from_str(&body)?)
}

async fn insert_audit(
    tx: &mut Transaction<'_, Sqlite>,
    audit: &PolicyAuditRecord,
) -> StoreResult<()> {
    query("INSERT INTO policy_audit (policy_id, body) VALUES (?, ?)")
        .bind(audit.policy_id.to_string())
        .bind(serde_json::to_string(audit)?)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn name_conflict(result: &Result<SqliteQueryResult, sqlx::Error>, name: &str) -> Option<StoreError> {
    match result {
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Some(
            StoreError::Conflict(format!("policy name '{name}' already exists")),
        ),
        _ => None,
    }
}

#[async_trait]
impl LifecycleStore for SqliteStore {
    async fn insert_policy(&self, policy: &Policy, audit: &PolicyAuditRecord) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let result = query(
            "INSERT INTO policies (id, name, priority, enabled, body) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(policy.id.to_string())
        .bind(policy.name())
        .bind(i64::from(policy.priority()))
        .bind(policy.is_enabled())
        .bind(serde_json::to_string(policy)?)
        .execute(&mut *tx)
        .await;
        if let Some(conflict) = name_conflict(&result, policy.name()) {
            return Err(conflict);
        }
        result?;
        insert_audit(&mut tx, audit).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_policy(&self, policy: &Policy, audit: &PolicyAuditRecord) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let result = query(
            "UPDATE policies SET name = ?, priority = ?, enabled = ?, body = ? WHERE id = ?",
        )
        .bind(policy.name())
        .bind(i64::from(policy.priority()))
        .bind(policy.is_enabled())
        .bind(serde_json::to_string(policy)?)
        .bind(policy.id.to_string())
        .execute(&mut *tx)
        .await;
        if let Some(conflict) = name_conflict(&result, policy.name()) {
            return Err(conflict);
        }
        if result?.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "policy",
                id: policy.id.to_string(),
            });
        }
        insert_audit(&mut tx, audit).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_policy(&self, id: &PolicyId) -> StoreResult<Option<Policy>> {
        let row = query("SELECT body FROM policies WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(body).transpose()
    }

    async fn get_policy_by_name(&self, name: &str) -> StoreResult<Option<Policy>> {
        let row = query("SELECT body FROM policies WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(body).transpose()
    }

    async fn list_policies(&self) -> StoreResult<Vec<Policy>> {
        let rows = query("SELECT body FROM policies ORDER BY priority, name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(body).collect()
    }

    async fn policy_audit(&self, id: &PolicyId) -> StoreResult<Vec<PolicyAuditRecord>> {
        let rows = query("SELECT body FROM policy_audit WHERE policy_id = ? ORDER BY seq")
            .bind(id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(body).collect()
    }

    async fn upsert_target(&self, target: &TargetObject) -> StoreResult<()> {
        query(
            r#"
            INSERT INTO targets (id, owner, body) VALUES (?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET owner = excluded.owner, body = excluded.body
            "#,
        )
        .bind(target.id().as_str())
        .bind(&target.owner)
        .bind(serde_json::to_string(target)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_target(&self, id: &TargetId) -> StoreResult<Option<TargetObject>> {
        let row = query("SELECT body FROM targets WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(body).transpose()
    }

    async fn list_targets(&self) -> StoreResult<Vec<TargetObject>> {
        let rows = query("SELECT body FROM targets ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(body).collect()
    }

    async fn remove_target(&self, id: &TargetId) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        query("DELETE FROM access_records WHERE target_id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        let removed = query("DELETE FROM targets WHERE id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(removed > 0)
    }

    async fn drop_target(&self, id: &TargetId, now: DateTime<Utc>) -> StoreResult<usize> {
        let mut tx = self.pool.begin().await?;
        query("DELETE FROM access_records WHERE target_id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        query("DELETE FROM targets WHERE id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        let withdrawn = query(
            r#"
            UPDATE queue_entries SET
                eligible = 0, reason = ?1, evaluated_at = ?2, updated_at = ?2
            WHERE target_id = ?3 AND status = 'PENDING'
            "#,
        )
        .bind(TARGET_DROPPED_REASON)
        .bind(ts(now))
        .bind(id.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        Ok(usize::try_from(withdrawn).unwrap_or(0))
    }

    async fn list_namespaces(&self) -> StoreResult<BTreeSet<String>> {
        let rows = query("SELECT DISTINCT owner FROM targets")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("owner").map_err(StoreError::from))
            .collect()
    }

    async fn get_access(&self, id: &TargetId) -> StoreResult<Option<AccessRecord>> {
        let row = query("SELECT body FROM access_records WHERE target_id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(body).transpose()
    }

    async fn put_access(&self, record: &AccessRecord) -> StoreResult<()> {
        query(
            r#"
            INSERT INTO access_records (target_id, body) VALUES (?, ?)
            ON CONFLICT (target_id) DO UPDATE SET body = excluded.body
            "#,
        )
        .bind(record.target_id.as_str())
        .bind(serde_json::to_string(record)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_access(&self) -> StoreResult<Vec<AccessRecord>> {
        let rows = query("SELECT body FROM access_records")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(body).collect()
    }

    async fn record_decision(
        &self,
        decision: &Decision,
        now: DateTime<Utc>,
    ) -> StoreResult<QueueEntry> {
        let now = ts(now);
        query(
            r#"
            INSERT INTO queue_entries (
                policy_id, target_id, seq, generation, priority, eligible, reason,
                status, attempts, created_at, evaluated_at, updated_at
            )
            VALUES (
                ?1, ?2, (SELECT COALESCE(MAX(seq), 0) + 1 FROM queue_entries), 0, ?3, ?4, ?5,
                'PENDING', 0, ?6, ?6, ?6
            )
            ON CONFLICT (policy_id, target_id) DO UPDATE SET
                priority = excluded.priority,
                eligible = excluded.eligible,
                reason = excluded.reason,
                evaluated_at = excluded.evaluated_at,
                updated_at = excluded.updated_at
            WHERE queue_entries.status = 'PENDING'
            "#,
        )
        .bind(decision.key.policy_id.to_string())
        .bind(decision.key.target_id.as_str())
        .bind(i64::from(decision.priority))
        .bind(decision.eligible)
        .bind(&decision.reason)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.fetch_entry(&decision.key)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "queue entry",
                id: decision.key.to_string(),
            })
    }

    async fn supersede(
        &self,
        decision: &Decision,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<QueueEntry>> {
        let updated = query(
            r#"
            UPDATE queue_entries SET
                seq = (SELECT COALESCE(MAX(seq), 0) + 1 FROM queue_entries),
                generation = generation + 1,
                priority = ?1,
                eligible = ?2,
                reason = ?3,
                status = 'PENDING',
                attempts = 0,
                last_error = NULL,
                started_at = NULL,
                finished_at = NULL,
                next_attempt_at = NULL,
                evaluated_at = ?4,
                updated_at = ?4
            WHERE policy_id = ?5 AND target_id = ?6 AND status = 'DONE'
            "#,
        )
        .bind(i64::from(decision.priority))
        .bind(decision.eligible)
        .bind(&decision.reason)
        .bind(ts(now))
        .bind(decision.key.policy_id.to_string())
        .bind(decision.key.target_id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Ok(None);
        }
        self.fetch_entry(&decision.key).await
    }

    async fn refresh_terminal(
        &self,
        decision: &Decision,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<QueueEntry>> {
        let updated = query(
            r#"
            UPDATE queue_entries SET eligible = ?1, reason = ?2, evaluated_at = ?3
            WHERE policy_id = ?4 AND target_id = ?5 AND status IN ('DONE', 'FAILED')
            "#,
        )
        .bind(decision.eligible)
        .bind(&decision.reason)
        .bind(ts(now))
        .bind(decision.key.policy_id.to_string())
        .bind(decision.key.target_id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Ok(None);
        }
        self.fetch_entry(&decision.key).await
    }

    async fn try_claim(
        &self,
        key: &QueueKey,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<QueueEntry>> {
        let claimed = query(
            r#"
            UPDATE queue_entries SET
                status = 'RUNNING',
                attempts = attempts + 1,
                started_at = ?3,
                finished_at = NULL,
                updated_at = ?3
            WHERE policy_id = ?1 AND target_id = ?2
              AND status = 'PENDING' AND eligible = 1
              AND (next_attempt_at IS NULL OR next_attempt_at <= ?3)
              AND NOT EXISTS (
                  SELECT 1 FROM queue_entries AS other
                  WHERE other.target_id = ?2 AND other.status = 'RUNNING'
              )
            "#,
        )
        .bind(key.policy_id.to_string())
        .bind(key.target_id.as_str())
        .bind(ts(now))
        .execute(&self.pool)
        .await?
        .rows_affected();

        if claimed == 0 {
            return Ok(None);
        }
        self.fetch_entry(key).await
    }

    async fn complete(
        &self,
        key: &QueueKey,
        completion: Completion,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<QueueEntry> {
        let status = completion.status();
        let (finished_at, next_attempt_at, target_state) = match completion {
            Completion::Done { target_state } => (Some(ts(now)), None, target_state),
            Completion::Failed => (Some(ts(now)), None, None),
            Completion::Retry { next_attempt_at } => (None, Some(ts(next_attempt_at)), None),
        };
        let updated = query(
            r#"
            UPDATE queue_entries SET
                status = ?, last_error = ?, updated_at = ?, finished_at = ?, next_attempt_at = ?,
                target_state = ?
            WHERE policy_id = ? AND target_id = ? AND status = 'RUNNING'
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(ts(now))
        .bind(finished_at)
        .bind(next_attempt_at)
        .bind(target_state)
        .bind(key.policy_id.to_string())
        .bind(key.target_id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(self.transition_error(key, QueueStatus::Running).await);
        }
        self.fetch_entry(key).await?.ok_or_else(|| StoreError::NotFound {
            entity: "queue entry",
            id: key.to_string(),
        })
    }

    async fn requeue(&self, key: &QueueKey, now: DateTime<Utc>) -> StoreResult<QueueEntry> {
        let updated = query(
            r#"
            UPDATE queue_entries SET
                status = 'PENDING', attempts = 0, eligible = 1, reason = ?,
                next_attempt_at = NULL, finished_at = NULL, updated_at = ?
            WHERE policy_id = ? AND target_id = ? AND status = 'FAILED'
            "#,
        )
        .bind(REQUEUE_REASON)
        .bind(ts(now))
        .bind(key.policy_id.to_string())
        .bind(key.target_id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(self.transition_error(key, QueueStatus::Failed).await);
        }
        self.fetch_entry(key).await?.ok_or_else(|| StoreError::NotFound {
            entity: "queue entry",
            id: key.to_string(),
        })
    }

    async fn get_queue_entry(&self, key: &QueueKey) -> StoreResult<Option<QueueEntry>> {
        self.fetch_entry(key).await
    }

    async fn list_queue(&self, filter: &QueueFilter) -> StoreResult<Vec<QueueEntry>> {
        let rows = match filter.status {
            Some(status) => {
                let sql = format!(
                    "SELECT {QUEUE_COLUMNS} FROM queue_entries WHERE status = ? ORDER BY priority, seq"
                );
                query(&sql)
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql =
                    format!("SELECT {QUEUE_COLUMNS} FROM queue_entries ORDER BY priority, seq");
                query(&sql).fetch_all(&self.pool).await?
            }
        };

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            let entry = queue_entry_from_row(row)?;
            if filter.matches(&entry) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    async fn count_running(&self) -> StoreResult<usize> {
        let row = query("SELECT COUNT(*) AS n FROM queue_entries WHERE status = 'RUNNING'")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    async fn append_log(&self, mut entry: ExecutionLogEntry) -> StoreResult<ExecutionLogEntry> {
        let result = query(
            r#"
            INSERT INTO execution_log (policy_id, target_id, started_at, outcome, body)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.policy_id.to_string())
        .bind(entry.target_id.as_str())
        .bind(ts(entry.started_at))
        .bind(entry.outcome.as_str())
        .bind(serde_json::to_string(&entry)?)
        .execute(&self.pool)
        .await?;
        entry.seq = to_u64(result.last_insert_rowid(), "seq")?;
        Ok(entry)
    }

    async fn list_log(&self, log_query: &LogQuery) -> StoreResult<Vec<ExecutionLogEntry>> {
        let since = log_query.since.map(ts).unwrap_or_default();
        let rows = query("SELECT seq, body FROM execution_log WHERE started_at >= ? ORDER BY seq")
            .bind(since)
            .fetch_all(&self.pool)
            .await?;

        let mut entries = Vec::new();
        for row in &rows {
            let mut entry: ExecutionLogEntry = body(row)?;
            entry.seq = to_u64(row.try_get("seq")?, "seq")?;
            if log_query.matches(&entry) {
                entries.push(entry);
            }
            if log_query.limit.is_some_and(|limit| entries.len() >= limit) {
                break;
            }
        }
        Ok(entries)
    }

    async fn count_failures_since(&self, since: DateTime<Utc>) -> StoreResult<usize> {
        let row = query(
            r#"
            SELECT COUNT(*) AS n FROM execution_log
            WHERE started_at >= ? AND outcome IN ('retrying', 'failed')
            "#,
        )
        .bind(ts(since))
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.try_get("n")?;
        Ok(usize::try_from(n).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    async fn memory_store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    fn target(owner: &str, name: &str) -> TargetObject {
        TargetObject {
            owner: owner.to_string(),
            name: name.to_string(),
            subobject: None,
            size_bytes: 10,
            created_at: Utc::now(),
            tier: "standard".to_string(),
            compression_profile: "NONE".to_string(),
            read_only: false,
            tags: BTreeMap::new(),
        }
    }

    #[test]
    fn test_timestamps_sort_lexicographically() {
        let early = Utc::now();
        let late = early + chrono::Duration::milliseconds(5);
        assert!(ts(early) < ts(late));
        assert_eq!(parse_ts(&ts(early)).unwrap().timestamp_micros(), early.timestamp_micros());
    }

    #[tokio::test]
    async fn test_targets_and_namespaces() {
        let store = memory_store().await;
        store.upsert_target(&target("sales", "orders")).await.unwrap();
        store.upsert_target(&target("sales", "customers")).await.unwrap();
        store.upsert_target(&target("hr", "people")).await.unwrap();

        let namespaces = store.list_namespaces().await.unwrap();
        assert_eq!(
            namespaces.into_iter().collect::<Vec<_>>(),
            vec!["hr".to_string(), "sales".to_string()]
        );

        let id = TargetId::from("hr.people");
        store
            .put_access(&AccessRecord::empty(id.clone(), Utc::now()))
            .await
            .unwrap();
        assert!(store.remove_target(&id).await.unwrap());
        assert!(store.get_access(&id).await.unwrap().is_none());
        assert!(!store.remove_target(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_conditional_claim() {
        let store = memory_store().await;
        let now = Utc::now();
        let a = Decision {
            key: QueueKey::new(PolicyId::new(), TargetId::from("sales.orders")),
            priority: 10,
            eligible: true,
            reason: "eligible".to_string(),
        };
        let b = Decision {
            key: QueueKey::new(PolicyId::new(), TargetId::from("sales.orders")),
            ..a.clone()
        };
        let first = store.record_decision(&a, now).await.unwrap();
        let second = store.record_decision(&b, now).await.unwrap();
        assert!(second.seq > first.seq);

        assert!(store.try_claim(&a.key, now).await.unwrap().is_some());
        assert!(store.try_claim(&b.key, now).await.unwrap().is_none());
        assert_eq!(store.count_running().await.unwrap(), 1);

        let err = store.requeue(&a.key, now).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let done = store
            .complete(&a.key, Completion::done(None), None, now)
            .await
            .unwrap();
        assert_eq!(done.status, QueueStatus::Done);
        assert!(done.finished_at.is_some());

        let pending = store
            .list_queue(&QueueFilter::with_status(QueueStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].key(), b.key);
    }

    #[tokio::test]
    async fn test_file_store_creates_parent_dir_and_persists() {
        let dir = tempfile::TempDir::new().unwrap();
        let dsn = format!("sqlite://{}/nested/strata.db", dir.path().display());

        let store = SqliteStore::connect(&dsn).await.unwrap();
        store.upsert_target(&target("sales", "orders")).await.unwrap();
        store.close().await;

        let reopened = SqliteStore::connect(&dsn).await.unwrap();
        let targets = reopened.list_targets().await.unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].id().as_str(), "sales.orders");
        assert!(dir.path().join("nested").join("strata.db").exists());
    }

    #[tokio::test]
    async fn test_done_state_refresh_and_drop() {
        let store = memory_store().await;
        let now = Utc::now();
        let compress = Decision {
            key: QueueKey::new(PolicyId::new(), TargetId::from("sales.orders")),
            priority: 10,
            eligible: true,
            reason: "age 120d ≥ 90d threshold".to_string(),
        };
        let purge = Decision {
            key: QueueKey::new(PolicyId::new(), TargetId::from("sales.orders")),
            priority: 20,
            ..compress.clone()
        };
        store.upsert_target(&target("sales", "orders")).await.unwrap();
        store.record_decision(&compress, now).await.unwrap();
        store.record_decision(&purge, now).await.unwrap();

        store.try_claim(&compress.key, now).await.unwrap().unwrap();
        let done = store
            .complete(
                &compress.key,
                Completion::done(Some("tier=standard;profile=HIGH".to_string())),
                None,
                now,
            )
            .await
            .unwrap();
        assert_eq!(done.target_state.as_deref(), Some("tier=standard;profile=HIGH"));

        let at_destination = Decision {
            eligible: false,
            reason: "already at target state: profile HIGH".to_string(),
            ..compress.clone()
        };
        let refreshed = store
            .refresh_terminal(&at_destination, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(refreshed.status, QueueStatus::Done);
        assert!(!refreshed.eligible);
        assert_eq!(refreshed.reason, "already at target state: profile HIGH");
        assert!(store.refresh_terminal(&purge, now).await.unwrap().is_none());

        let withdrawn = store
            .drop_target(&TargetId::from("sales.orders"), now)
            .await
            .unwrap();
        assert_eq!(withdrawn, 1);
        assert!(store.list_targets().await.unwrap().is_empty());
        let sibling = store.get_queue_entry(&purge.key).await.unwrap().unwrap();
        assert!(!sibling.eligible);
        assert_eq!(sibling.reason, TARGET_DROPPED_REASON);
        let finished = store.get_queue_entry(&compress.key).await.unwrap().unwrap();
        assert_eq!(finished.status, QueueStatus::Done);
    }
}
