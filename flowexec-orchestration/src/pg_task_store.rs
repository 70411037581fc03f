//! A Postgres-backed [`TaskStore`], provided as a reference implementation
//! of the seam described in the component design — the task-record
//! database itself is out of scope for this crate, but a real manager needs
//! *some* concrete store, and this is the teacher workspace's own backend
//! of choice (`sqlx`, `postgres`).
//!
//! Schema assumed (see `migrations/` in an embedding application):
//!
//! ```sql
//! CREATE TABLE flowexec_tasks (
//!     id BIGINT PRIMARY KEY,
//!     status TEXT NOT NULL,
//!     run_language TEXT,
//!     process_error JSONB NOT NULL DEFAULT '[]',
//!     process_rc INTEGER,
//!     name TEXT NOT NULL,
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//!
//! CREATE TABLE flowexec_dependencies (
//!     parent_id BIGINT NOT NULL,
//!     child_id BIGINT NOT NULL,
//!     kind TEXT NOT NULL,
//!     PRIMARY KEY (parent_id, child_id)
//! );
//! ```
//!
//! Row locking uses `SELECT ... FOR UPDATE` inside an explicit transaction
//! kept open between [`PgTaskStore::lock_for_update`] and whichever of
//! [`PgTaskStore::commit`] / [`PgTaskStore::rollback`] follows it, matching
//! §4.6's "the per-row lock is the only lock held" property.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Postgres, Row, Transaction};

use flowexec_shared::error::{FlowError, FlowResult};

use crate::task::{Dependency, DependencyKind, ParentStatus, ProcessDescriptor, Task, TaskStatus, TaskStore};

fn status_to_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Resolving => "RESOLVING",
        TaskStatus::Waiting => "WAITING",
        TaskStatus::Processing => "PROCESSING",
        TaskStatus::Done => "DONE",
        TaskStatus::Error => "ERROR",
    }
}

fn status_from_str(s: &str) -> FlowResult<TaskStatus> {
    match s {
        "RESOLVING" => Ok(TaskStatus::Resolving),
        "WAITING" => Ok(TaskStatus::Waiting),
        "PROCESSING" => Ok(TaskStatus::Processing),
        "DONE" => Ok(TaskStatus::Done),
        "ERROR" => Ok(TaskStatus::Error),
        other => Err(FlowError::IntegrityError(format!("unknown task status '{other}'"))),
    }
}

fn kind_to_str(kind: DependencyKind) -> &'static str {
    match kind {
        DependencyKind::Io => "IO",
        DependencyKind::Other => "OTHER",
    }
}

/// [`TaskStore`] backed by a `PgPool`. Open transactions live in a process-
/// local map keyed by task id between `lock_for_update` and
/// `commit`/`rollback`; callers must not call `lock_for_update` twice for
/// the same id without releasing the first (the scanner never does).
pub struct PgTaskStore {
    pool: PgPool,
    open: Mutex<HashMap<i64, Transaction<'static, Postgres>>>,
}

impl std::fmt::Debug for PgTaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgTaskStore").finish_non_exhaustive()
    }
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            open: Mutex::new(HashMap::new()),
        }
    }

    fn take_open(&self, task_id: i64) -> FlowResult<Transaction<'static, Postgres>> {
        self.open
            .lock()
            .unwrap()
            .remove(&task_id)
            .ok_or_else(|| FlowError::IntegrityError(format!("no open transaction for task {task_id}")))
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn resolving_task_ids(&self) -> FlowResult<Vec<i64>> {
        let rows = sqlx::query("SELECT id FROM flowexec_tasks WHERE status = 'RESOLVING'")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get::<i64, _>("id")).collect())
    }

    async fn parent_statuses(&self, task_id: i64) -> FlowResult<Vec<ParentStatus>> {
        let rows = sqlx::query(
            "SELECT p.status AS status \
             FROM flowexec_dependencies d \
             LEFT JOIN flowexec_tasks p ON p.id = d.parent_id \
             WHERE d.child_id = $1 AND d.kind = 'IO'",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| match r.get::<Option<String>, _>("status") {
                Some(s) => status_from_str(&s).map(Some),
                None => Ok(None),
            })
            .collect()
    }

    async fn lock_for_update(&self, task_id: i64) -> FlowResult<Option<Task>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT id, status, run_language, process_error, process_rc, name \
             FROM flowexec_tasks WHERE id = $1 FOR UPDATE",
        )
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        let status = status_from_str(row.get::<String, _>("status").as_str())?;
        let process_error: serde_json::Value = row.get("process_error");
        let process_error: Vec<String> = serde_json::from_value(process_error)?;

        let task = Task {
            id: row.get("id"),
            status,
            process: ProcessDescriptor {
                run_language: row.get("run_language"),
            },
            process_error,
            process_rc: row.get("process_rc"),
            name: row.get("name"),
        };

        self.open.lock().unwrap().insert(task_id, tx);
        Ok(Some(task))
    }

    async fn commit(&self, task: Task) -> FlowResult<()> {
        let mut tx = self.take_open(task.id)?;

        sqlx::query(
            "UPDATE flowexec_tasks \
             SET status = $1, process_error = $2, process_rc = $3, name = $4, updated_at = $5 \
             WHERE id = $6",
        )
        .bind(status_to_str(task.status))
        .bind(serde_json::to_value(&task.process_error)?)
        .bind(task.process_rc)
        .bind(&task.name)
        .bind(Utc::now())
        .bind(task.id)
        .execute(&mut *tx)
        .await?;

        Ok(tx.commit().await?)
    }

    async fn rollback(&self, task_id: i64) -> FlowResult<()> {
        let tx = self.take_open(task_id)?;
        Ok(tx.rollback().await?)
    }

    /// Inserts outside the enclosing scan's transaction: this reference
    /// store does not thread the parent's open transaction through the
    /// engine-registry seam, so a spawned task becomes visible slightly
    /// before the parent's own commit rather than atomically with it. A
    /// production store wired into a specific engine implementation can
    /// close this gap by routing inserts through the same `Transaction`
    /// `lock_for_update` opened for the parent.
    async fn insert_spawned(&self, task: Task) -> FlowResult<()> {
        sqlx::query(
            "INSERT INTO flowexec_tasks (id, status, run_language, process_error, process_rc, name, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(task.id)
        .bind(status_to_str(task.status))
        .bind(task.process.run_language)
        .bind(serde_json::to_value(&task.process_error)?)
        .bind(task.process_rc)
        .bind(task.name)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Insert an `Io` dependency edge; used by setup code and tests, not by the
/// scanner itself (which only ever reads edges).
pub async fn insert_dependency(pool: &PgPool, dep: &Dependency) -> FlowResult<()> {
    sqlx::query(
        "INSERT INTO flowexec_dependencies (parent_id, child_id, kind) VALUES ($1, $2, $3) \
         ON CONFLICT DO NOTHING",
    )
    .bind(dep.parent_id)
    .bind(dep.child_id)
    .bind(kind_to_str(dep.kind))
    .execute(pool)
    .await?;
    Ok(())
}
