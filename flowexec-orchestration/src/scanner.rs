//! The scan-lock-evaluate-schedule loop over tasks in `RESOLVING` status.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use flowexec_shared::error::{FlowError, FlowResult};

use crate::dependency::{DependencyResolver, DependencyStatus};
use crate::engine_registry::EngineRegistry;
use crate::task::{Task, TaskStatus, TaskStore};

/// Invoked strictly after a task's scanner transaction commits, with the
/// task id and resolved program text bound by value — the scanner loop
/// reuses its locals across iterations, so a hand-off that captured by
/// reference would race the next iteration's writes.
#[async_trait]
pub trait ScheduleHandler: Send + Sync + std::fmt::Debug {
    async fn schedule(&self, task_id: i64, program: String) -> FlowResult<()>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanOutcome {
    pub scanned: usize,
    pub scheduled: usize,
    pub errored: usize,
    pub deferred: usize,
}

#[derive(Debug)]
pub struct Scanner {
    task_store: Arc<dyn TaskStore>,
    resolver: DependencyResolver,
    engine_registry: Arc<RwLock<EngineRegistry>>,
    schedule_handler: Arc<dyn ScheduleHandler>,
}

impl Scanner {
    pub fn new(
        task_store: Arc<dyn TaskStore>,
        engine_registry: Arc<RwLock<EngineRegistry>>,
        schedule_handler: Arc<dyn ScheduleHandler>,
    ) -> Self {
        Self {
            task_store,
            resolver: DependencyResolver,
            engine_registry,
            schedule_handler,
        }
    }

    /// One pass over every task currently `RESOLVING`, reselecting each
    /// under its row lock before acting on it. `executor_override`, if set,
    /// rebinds the active executor for the duration of this scan — commands
    /// may carry an override because the CommandLoop composes it from
    /// per-message settings.
    #[instrument(skip(self), fields(correlation_id = %Uuid::now_v7()))]
    pub async fn scan(&self, executor_override: Option<&str>) -> FlowResult<ScanOutcome> {
        if let Some(name) = executor_override {
            self.engine_registry.write().await.reload(name);
        }

        let mut outcome = ScanOutcome::default();
        let snapshot = self.task_store.resolving_task_ids().await?;
        info!(candidate_count = snapshot.len(), "scan pass starting");

        for task_id in snapshot {
            outcome.scanned += 1;
            match self.scan_one(task_id).await {
                Ok(ScanStep::Scheduled) => outcome.scheduled += 1,
                Ok(ScanStep::Errored) => outcome.errored += 1,
                Ok(ScanStep::Deferred) => outcome.deferred += 1,
                Err(e) => {
                    // Only an integrity violation (or an otherwise
                    // unclassified store error) reaches this arm —
                    // `scan_one` contains `PermissionDenied`/`OsError` to the
                    // one task and never propagates them. Tasks already
                    // scheduled in earlier iterations stand.
                    error!(task_id, error = %e, "scanner pass terminated by a store error");
                    return Err(e);
                }
            }
        }

        Ok(outcome)
    }

    async fn scan_one(&self, task_id: i64) -> FlowResult<ScanStep> {
        let Some(mut task) = self.task_store.lock_for_update(task_id).await? else {
            // Row disappeared between the snapshot and the lock attempt.
            return Ok(ScanStep::Deferred);
        };

        if task.status != TaskStatus::Resolving {
            self.task_store.rollback(task_id).await?;
            return Ok(ScanStep::Deferred);
        }

        let parents = self.task_store.parent_statuses(task_id).await?;
        let dependency = self.resolver.resolve(&parents);

        match dependency {
            DependencyStatus::Error => {
                task.mark_error("One or more inputs have status ERROR", 1);
                task.rerender_name();
                self.task_store.commit(task).await?;
                return Ok(ScanStep::Errored);
            }
            DependencyStatus::Pending => {
                self.task_store.rollback(task_id).await?;
                return Ok(ScanStep::Deferred);
            }
            DependencyStatus::Done => {}
        }

        let program = match &task.process.run_language {
            Some(language) => {
                let engine = {
                    let registry = self.engine_registry.read().await;
                    registry.execution_engine(language)
                };
                match engine {
                    Ok(engine) => match engine.evaluate(&task).await {
                        Ok(program) => program,
                        Err(e) => {
                            debug!(task_id, error = %e, "execution engine rejected task script");
                            task.mark_error(format!("Error in process script: {e}"), 1);
                            task.rerender_name();
                            self.task_store.commit(task).await?;
                            return Ok(ScanStep::Errored);
                        }
                    },
                    Err(e) => {
                        task.mark_error(e.to_string(), 1);
                        task.rerender_name();
                        self.task_store.commit(task).await?;
                        return Ok(ScanStep::Errored);
                    }
                }
            }
            None => String::new(),
        };

        // Engines may already have marked the task DONE directly (zero-work
        // tasks); never overwrite a terminal status with WAITING.
        if task.status != TaskStatus::Done {
            task.status = TaskStatus::Waiting;
        }
        task.rerender_name();
        self.task_store.commit(task).await?;

        match self.schedule_handler.schedule(task_id, program).await {
            Ok(()) => Ok(ScanStep::Scheduled),
            Err(FlowError::PermissionDenied(msg)) => {
                // The handler already moved the task to ERROR with this
                // diagnostic before returning; the pass continues.
                error!(task_id, error = %msg, "sandbox build denied permission");
                Ok(ScanStep::Errored)
            }
            Err(FlowError::OsError(msg)) => {
                // Left WAITING for a later pass; this is not a task-level
                // terminal state, just a hand-off that didn't take this time.
                warn!(task_id, error = %msg, "sandbox build failed with an OS error, skipping for now");
                Ok(ScanStep::Deferred)
            }
            Err(e) => {
                warn!(task_id, error = %e, "post-commit hand-off failed");
                Err(e)
            }
        }
    }
}

enum ScanStep {
    Scheduled,
    Errored,
    Deferred,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::fake::InMemoryTaskStore;
    use crate::task::{Dependency, DependencyKind};
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Default)]
    struct RecordingScheduleHandler {
        scheduled: StdMutex<Vec<(i64, String)>>,
    }

    #[async_trait]
    impl ScheduleHandler for RecordingScheduleHandler {
        async fn schedule(&self, task_id: i64, program: String) -> FlowResult<()> {
            self.scheduled.lock().unwrap().push((task_id, program));
            Ok(())
        }
    }

    /// Fails `schedule` for one chosen task id, mirroring how
    /// `manager::ManagerScheduleHandler` reacts to a sandbox-build failure:
    /// a `PermissionDenied` is written back to the store as an ERROR before
    /// the error is returned, an `OsError` is simply reported.
    #[derive(Debug)]
    struct FailingScheduleHandler {
        store: Arc<InMemoryTaskStore>,
        fail_task_id: i64,
        error: fn(String) -> FlowError,
    }

    #[async_trait]
    impl ScheduleHandler for FailingScheduleHandler {
        async fn schedule(&self, task_id: i64, _program: String) -> FlowResult<()> {
            if task_id != self.fail_task_id {
                return Ok(());
            }
            let err = (self.error)(format!("boom on task {task_id}"));
            if let FlowError::PermissionDenied(ref msg) = err {
                if let Some(mut task) = self.store.lock_for_update(task_id).await? {
                    task.mark_error(msg.clone(), 1);
                    task.rerender_name();
                    self.store.commit(task).await?;
                }
            }
            Err(err)
        }
    }

    fn setup() -> (
        Arc<InMemoryTaskStore>,
        Arc<RwLock<EngineRegistry>>,
        Arc<RecordingScheduleHandler>,
        Scanner,
    ) {
        let store = Arc::new(InMemoryTaskStore::default());
        let registry = Arc::new(RwLock::new(EngineRegistry::new()));
        let handler = Arc::new(RecordingScheduleHandler::default());
        let scanner = Scanner::new(
            store.clone() as Arc<dyn TaskStore>,
            registry.clone(),
            handler.clone() as Arc<dyn ScheduleHandler>,
        );
        (store, registry, handler, scanner)
    }

    #[tokio::test]
    async fn trivial_ready_task_is_scheduled_as_waiting() {
        let (store, _registry, handler, scanner) = setup();
        store.insert(Task::new_resolving(1));

        let outcome = scanner.scan(None).await.unwrap();

        assert_eq!(outcome.scheduled, 1);
        assert_eq!(store.get(1).unwrap().status, TaskStatus::Waiting);
        assert_eq!(handler.scheduled.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn task_blocked_by_pending_parent_stays_resolving() {
        let (store, _registry, handler, scanner) = setup();
        let mut parent = Task::new_resolving(1);
        parent.status = TaskStatus::Waiting;
        store.insert(parent);
        store.insert(Task::new_resolving(2));
        store.add_dependency(Dependency {
            parent_id: 1,
            child_id: 2,
            kind: DependencyKind::Io,
        });

        let outcome = scanner.scan(None).await.unwrap();

        assert_eq!(outcome.deferred, 1);
        assert_eq!(store.get(2).unwrap().status, TaskStatus::Resolving);
        assert!(handler.scheduled.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn error_parent_propagates_to_child() {
        let (store, _registry, _handler, scanner) = setup();
        let mut parent = Task::new_resolving(1);
        parent.status = TaskStatus::Error;
        store.insert(parent);
        store.insert(Task::new_resolving(2));
        store.add_dependency(Dependency {
            parent_id: 1,
            child_id: 2,
            kind: DependencyKind::Io,
        });

        let outcome = scanner.scan(None).await.unwrap();

        assert_eq!(outcome.errored, 1);
        let child = store.get(2).unwrap();
        assert_eq!(child.status, TaskStatus::Error);
        assert_eq!(child.process_rc, Some(1));
        assert!(child
            .process_error
            .iter()
            .any(|m| m.contains("One or more inputs have status ERROR")));
    }

    #[tokio::test]
    async fn missing_parent_row_marks_child_error() {
        let (store, _registry, _handler, scanner) = setup();
        store.insert(Task::new_resolving(2));
        store.add_dependency(Dependency {
            parent_id: 999,
            child_id: 2,
            kind: DependencyKind::Io,
        });

        let outcome = scanner.scan(None).await.unwrap();

        assert_eq!(outcome.errored, 1);
        assert_eq!(store.get(2).unwrap().status, TaskStatus::Error);
    }

    #[tokio::test]
    async fn task_already_not_resolving_is_skipped() {
        let (store, _registry, handler, scanner) = setup();
        let mut task = Task::new_resolving(1);
        task.status = TaskStatus::Processing;
        store.insert(task);

        // Not in the RESOLVING snapshot in the first place, so a scan finds
        // nothing to do; confirms scanning is a no-op for non-RESOLVING rows.
        let outcome = scanner.scan(None).await.unwrap();
        assert_eq!(outcome.scanned, 0);
        assert!(handler.scheduled.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unsupported_execution_engine_marks_task_error() {
        let (store, _registry, _handler, scanner) = setup();
        store.insert(Task::new_resolving(1).with_run_language("nonexistent"));

        let outcome = scanner.scan(None).await.unwrap();

        assert_eq!(outcome.errored, 1);
        assert_eq!(store.get(1).unwrap().status, TaskStatus::Error);
    }

    #[tokio::test]
    async fn permission_denied_during_hand_off_errors_one_task_and_the_pass_continues() {
        let store = Arc::new(InMemoryTaskStore::default());
        let registry = Arc::new(RwLock::new(EngineRegistry::new()));
        store.insert(Task::new_resolving(1));
        store.insert(Task::new_resolving(2));
        let handler = Arc::new(FailingScheduleHandler {
            store: store.clone(),
            fail_task_id: 1,
            error: FlowError::PermissionDenied,
        });
        let scanner = Scanner::new(
            store.clone() as Arc<dyn TaskStore>,
            registry,
            handler as Arc<dyn ScheduleHandler>,
        );

        let outcome = scanner.scan(None).await.unwrap();

        assert_eq!(outcome.errored, 1);
        assert_eq!(outcome.scheduled, 1);
        assert_eq!(store.get(1).unwrap().status, TaskStatus::Error);
        assert_eq!(store.get(2).unwrap().status, TaskStatus::Waiting);
    }

    #[tokio::test]
    async fn os_error_during_hand_off_is_skipped_and_the_pass_continues() {
        let store = Arc::new(InMemoryTaskStore::default());
        let registry = Arc::new(RwLock::new(EngineRegistry::new()));
        store.insert(Task::new_resolving(1));
        store.insert(Task::new_resolving(2));
        let handler = Arc::new(FailingScheduleHandler {
            store: store.clone(),
            fail_task_id: 1,
            error: FlowError::OsError,
        });
        let scanner = Scanner::new(
            store.clone() as Arc<dyn TaskStore>,
            registry,
            handler as Arc<dyn ScheduleHandler>,
        );

        let outcome = scanner.scan(None).await.unwrap();

        assert_eq!(outcome.deferred, 1);
        assert_eq!(outcome.scheduled, 1);
        // Already committed WAITING before the hand-off failed; an OS
        // error leaves it there for a later pass rather than erroring it.
        assert_eq!(store.get(1).unwrap().status, TaskStatus::Waiting);
    }
}
