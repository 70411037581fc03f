//! The external task record and the narrow store interface the scanner and
//! dependency resolver consult. The task-record database itself is out of
//! scope for this crate; [`TaskStore`] is the seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use flowexec_shared::error::FlowResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Resolving,
    Waiting,
    Processing,
    Done,
    Error,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Error)
    }
}

/// Names the execution language of a task's `run` section, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDescriptor {
    /// Present when the task has a `run` section to evaluate; absent for
    /// zero-work tasks.
    pub run_language: Option<String>,
}

/// Edge kind between two tasks; the resolver only consults `Io` edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DependencyKind {
    Io,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub parent_id: i64,
    pub child_id: i64,
    pub kind: DependencyKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub status: TaskStatus,
    pub process: ProcessDescriptor,
    pub process_error: Vec<String>,
    pub process_rc: Option<i32>,
    pub name: String,
}

impl Task {
    pub fn new_resolving(id: i64) -> Self {
        Self {
            id,
            status: TaskStatus::Resolving,
            process: ProcessDescriptor { run_language: None },
            process_error: Vec::new(),
            process_rc: None,
            name: format!("task-{id}"),
        }
    }

    pub fn with_run_language(mut self, language: impl Into<String>) -> Self {
        self.process.run_language = Some(language.into());
        self
    }

    pub fn mark_error(&mut self, message: impl Into<String>, rc: i32) {
        self.status = TaskStatus::Error;
        self.process_error.push(message.into());
        self.process_rc = Some(rc);
    }

    /// Rerender the display name the way the reference codebase's `save()`
    /// does on every scanner transition, so it reflects current status.
    pub fn rerender_name(&mut self) {
        self.name = format!("task-{}:{:?}", self.id, self.status);
    }
}

/// Either a resolved status, or `None` meaning the parent row no longer
/// exists (it was deleted out from under the dependency graph).
pub type ParentStatus = Option<TaskStatus>;

/// The seam between the scanner/resolver and the task-record database.
/// Implementations must give the scanner the `FOR UPDATE` semantics
/// documented in the component design: `lock_for_update` must block
/// concurrent lockers of the same row and must be released only when the
/// returned guard commits or rolls back.
#[async_trait]
pub trait TaskStore: Send + Sync + std::fmt::Debug {
    /// Snapshot of every task id currently in `RESOLVING` status, taken
    /// without holding any row lock.
    async fn resolving_task_ids(&self) -> FlowResult<Vec<i64>>;

    /// Parent statuses across `Io` edges for `task_id`, as a set (callers
    /// must not rely on order or on duplicates being preserved).
    async fn parent_statuses(&self, task_id: i64) -> FlowResult<Vec<ParentStatus>>;

    /// Acquire the row-level lock for `task_id` and return its current
    /// state, or `None` if the task no longer exists. Must be paired with
    /// exactly one of [`TaskStore::commit`] / [`TaskStore::rollback`].
    async fn lock_for_update(&self, task_id: i64) -> FlowResult<Option<Task>>;

    /// Persist `task` and release the row lock acquired by
    /// [`TaskStore::lock_for_update`].
    async fn commit(&self, task: Task) -> FlowResult<()>;

    /// Release the row lock acquired by [`TaskStore::lock_for_update`]
    /// without persisting any change.
    async fn rollback(&self, task_id: i64) -> FlowResult<()>;

    /// Insert a new task spawned by engine evaluation, atomically with the
    /// enclosing scan transaction (callers only invoke this between
    /// `lock_for_update` and `commit`).
    async fn insert_spawned(&self, task: Task) -> FlowResult<()>;
}

/// In-memory fakes for the store traits in this crate, available to both
/// unit tests (`#[cfg(test)]`) and the scenario integration tests under
/// `tests/`, which compile against this crate as an external dependency and
/// so cannot see `#[cfg(test)]`-gated items.
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory [`TaskStore`] for unit and scenario tests. Row locking is
    /// modeled with a per-task `Mutex` held across `lock_for_update` ..
    /// `commit`/`rollback`; a real database would use `SELECT ... FOR
    /// UPDATE` inside a transaction instead.
    #[derive(Debug, Default)]
    pub struct InMemoryTaskStore {
        tasks: Mutex<HashMap<i64, Task>>,
        dependencies: Mutex<Vec<Dependency>>,
        locked: Mutex<std::collections::HashSet<i64>>,
    }

    impl InMemoryTaskStore {
        pub fn insert(&self, task: Task) {
            self.tasks.lock().unwrap().insert(task.id, task);
        }

        pub fn add_dependency(&self, dep: Dependency) {
            self.dependencies.lock().unwrap().push(dep);
        }

        pub fn get(&self, id: i64) -> Option<Task> {
            self.tasks.lock().unwrap().get(&id).cloned()
        }

        pub fn delete(&self, id: i64) {
            self.tasks.lock().unwrap().remove(&id);
        }
    }

    #[async_trait]
    impl TaskStore for InMemoryTaskStore {
        async fn resolving_task_ids(&self) -> FlowResult<Vec<i64>> {
            Ok(self
                .tasks
                .lock()
                .unwrap()
                .values()
                .filter(|t| t.status == TaskStatus::Resolving)
                .map(|t| t.id)
                .collect())
        }

        async fn parent_statuses(&self, task_id: i64) -> FlowResult<Vec<ParentStatus>> {
            let deps = self.dependencies.lock().unwrap();
            let tasks = self.tasks.lock().unwrap();
            Ok(deps
                .iter()
                .filter(|d| d.child_id == task_id && d.kind == DependencyKind::Io)
                .map(|d| tasks.get(&d.parent_id).map(|t| t.status))
                .collect())
        }

        async fn lock_for_update(&self, task_id: i64) -> FlowResult<Option<Task>> {
            self.locked.lock().unwrap().insert(task_id);
            Ok(self.tasks.lock().unwrap().get(&task_id).cloned())
        }

        async fn commit(&self, task: Task) -> FlowResult<()> {
            self.tasks.lock().unwrap().insert(task.id, task.clone());
            self.locked.lock().unwrap().remove(&task.id);
            Ok(())
        }

        async fn rollback(&self, task_id: i64) -> FlowResult<()> {
            self.locked.lock().unwrap().remove(&task_id);
            Ok(())
        }

        async fn insert_spawned(&self, task: Task) -> FlowResult<()> {
            self.tasks.lock().unwrap().insert(task.id, task);
            Ok(())
        }
    }
}
