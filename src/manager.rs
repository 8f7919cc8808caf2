//! The bounded-concurrency scheduler driving tasks to completion.
//!
//! One manager owns its pool of live tasks and drives everything from a
//! single controlling loop: spawning in FIFO order as slots free up,
//! polling, evaluating stop conditions, and reaping. The loop is the sole
//! mutator of task state, so no locking is needed; concurrency comes
//! entirely from the worker processes themselves.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{RunSettings, TaskConfig};
use crate::stop::StopCondition;
use crate::task::{Profiling, Task, TaskError, TaskId, TaskStatus};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("worker manager requires at least one worker slot")]
    NoWorkers,

    #[error("task queue limit {limit} reached")]
    Capacity { limit: usize },

    #[error(transparent)]
    Task(#[from] TaskError),
}

/// Why a task reached its terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionCause {
    /// The worker exited on its own; the exit code is data, not an error.
    Exited,
    /// Terminated because the named stop condition fired.
    StopCondition(String),
    /// Terminated because the overall `start_working` timeout elapsed.
    Timeout,
    /// The worker process could not be launched.
    SpawnFailed(String),
}

/// Terminal record for one task, returned from `start_working` in enqueue
/// order.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub name: String,
    pub exit_code: Option<i32>,
    pub cause: CompletionCause,
    pub profiling: Profiling,
}

impl TaskOutcome {
    pub fn success(&self) -> bool {
        matches!(self.cause, CompletionCause::Exited) && self.exit_code == Some(0)
    }
}

/// Synchronous observer invoked once per loop iteration after polling,
/// e.g. for resource sampling of the live tasks.
pub type PostPollHook = Box<dyn FnMut(&[Task]) + Send>;

/// Scheduler with a bounded pool of concurrently running tasks.
#[derive(Debug)]
pub struct WorkerManager {
    num_workers: usize,
    queue_limit: Option<usize>,
    poll_interval: Duration,
    grace_period: Duration,
    output_dir: PathBuf,
    next_id: u64,
    pending: VecDeque<Task>,
    running: Vec<Task>,
    completed: Vec<TaskOutcome>,
    stop_conditions: Vec<Arc<StopCondition>>,
}

impl WorkerManager {
    /// Create a manager with default polling cadence and grace period.
    /// Task working directories are created under `output_dir`, namespaced
    /// by task name.
    pub fn new(num_workers: usize, output_dir: PathBuf) -> Result<Self, ManagerError> {
        Self::with_settings(
            &RunSettings {
                num_workers,
                ..RunSettings::default()
            },
            output_dir,
        )
    }

    pub fn with_settings(
        settings: &RunSettings,
        output_dir: PathBuf,
    ) -> Result<Self, ManagerError> {
        if settings.num_workers == 0 {
            return Err(ManagerError::NoWorkers);
        }
        Ok(Self {
            num_workers: settings.num_workers,
            queue_limit: None,
            poll_interval: settings.poll_interval(),
            grace_period: settings.grace_period(),
            output_dir,
            next_id: 0,
            pending: VecDeque::new(),
            running: Vec::new(),
            completed: Vec::new(),
            stop_conditions: Vec::new(),
        })
    }

    /// Impose a hard limit on the pending queue. Unbounded by default.
    pub fn set_queue_limit(&mut self, limit: usize) {
        self.queue_limit = Some(limit);
    }

    /// Attach a stop condition evaluated against every task of this manager.
    pub fn add_stop_condition(&mut self, condition: Arc<StopCondition>) {
        self.stop_conditions.push(condition);
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Enqueue a pending task. Tasks spawn in enqueue order as pool slots
    /// free up.
    ///
    /// # Errors
    ///
    /// `Capacity` if a queue limit is configured and reached.
    pub fn add_task(&mut self, config: TaskConfig) -> Result<TaskId, ManagerError> {
        if let Some(limit) = self.queue_limit {
            if self.pending.len() >= limit {
                return Err(ManagerError::Capacity { limit });
            }
        }
        let id = TaskId(self.next_id);
        self.next_id += 1;
        let working_dir = self.output_dir.join(&config.name);
        debug!(task = %id, name = %config.name, "Enqueued task");
        self.pending.push_back(Task::new(id, config, working_dir));
        Ok(id)
    }

    /// Run the scheduling loop until every enqueued task reaches a terminal
    /// state or `timeout` elapses. This is the only blocking call; each
    /// iteration is non-blocking apart from the poll-interval sleep.
    ///
    /// On timeout, still-running workers receive a graceful stop (escalating
    /// after the grace period), so the call returns within a bounded
    /// overshoot of `timeout` even for workers ignoring the soft signal.
    pub async fn start_working(
        &mut self,
        timeout: Option<Duration>,
        mut post_poll: Option<PostPollHook>,
    ) -> Result<Vec<TaskOutcome>, ManagerError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        info!(
            workers = self.num_workers,
            tasks = self.pending.len(),
            timeout_secs = timeout.map(|t| t.as_secs()),
            "Starting worker pool"
        );

        loop {
            // Fill free slots, FIFO. A spawn failure is recorded and the
            // slot is immediately available again.
            while self.running.len() < self.num_workers {
                let Some(mut task) = self.pending.pop_front() else {
                    break;
                };
                match task.spawn().await {
                    Ok(()) => self.running.push(task),
                    Err(e) => {
                        warn!(task = %task.id(), name = task.name(), error = %e, "Worker failed to spawn");
                        self.completed.push(TaskOutcome {
                            task_id: task.id(),
                            name: task.name().to_string(),
                            exit_code: None,
                            cause: CompletionCause::SpawnFailed(e.to_string()),
                            profiling: task.profiling().clone(),
                        });
                    }
                }
            }

            // Poll every running task and consult the stop conditions.
            for task in self.running.iter_mut() {
                let status = task.poll()?;
                if status.is_terminal() || task.triggered_condition().is_some() {
                    continue;
                }
                let fired = self
                    .stop_conditions
                    .iter()
                    .find(|condition| condition.fulfilled(task));
                if let Some(condition) = fired {
                    info!(
                        task = %task.id(),
                        name = task.name(),
                        condition = condition.name(),
                        "Stop condition fulfilled, terminating worker"
                    );
                    task.record_trigger(condition.name());
                    task.signal_stop(self.grace_period)?;
                }
            }

            if let Some(hook) = post_poll.as_mut() {
                hook(&self.running);
            }

            self.reap(false)?;

            if let Some(deadline) = deadline {
                let work_left = !self.pending.is_empty() || !self.running.is_empty();
                if work_left && Instant::now() >= deadline {
                    warn!("Overall timeout elapsed, terminating remaining tasks");
                    self.abort_remaining().await?;
                    break;
                }
            }

            if self.pending.is_empty() && self.running.is_empty() {
                break;
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        let mut outcomes = std::mem::take(&mut self.completed);
        outcomes.sort_by_key(|outcome| outcome.task_id);
        info!(tasks = outcomes.len(), "Worker pool drained");
        Ok(outcomes)
    }

    /// Move exited tasks from the running pool to the completed list.
    fn reap(&mut self, timed_out: bool) -> Result<(), ManagerError> {
        let mut i = 0;
        while i < self.running.len() {
            if !self.running[i].status().is_terminal() {
                i += 1;
                continue;
            }
            let mut task = self.running.remove(i);
            let outcome = match task.status().clone() {
                TaskStatus::Finished(_) => {
                    let (code, profiling) = task.finalize()?;
                    let cause = match task.triggered_condition() {
                        Some(name) => CompletionCause::StopCondition(name.to_string()),
                        None if timed_out => CompletionCause::Timeout,
                        None => CompletionCause::Exited,
                    };
                    TaskOutcome {
                        task_id: task.id(),
                        name: task.name().to_string(),
                        exit_code: Some(code),
                        cause,
                        profiling,
                    }
                }
                TaskStatus::Errored(cause) => TaskOutcome {
                    task_id: task.id(),
                    name: task.name().to_string(),
                    exit_code: None,
                    cause: CompletionCause::SpawnFailed(cause),
                    profiling: task.profiling().clone(),
                },
                // reap() only sees terminal tasks.
                other => unreachable!("non-terminal status {other:?} in reap"),
            };
            debug!(task = %outcome.task_id, cause = ?outcome.cause, "Reaped task");
            self.completed.push(outcome);
        }
        Ok(())
    }

    /// Timeout path: cancel pending tasks, stop running ones, and wait out
    /// the grace-period escalation so every process is reaped.
    async fn abort_remaining(&mut self) -> Result<(), ManagerError> {
        while let Some(task) = self.pending.pop_front() {
            self.completed.push(TaskOutcome {
                task_id: task.id(),
                name: task.name().to_string(),
                exit_code: None,
                cause: CompletionCause::Timeout,
                profiling: task.profiling().clone(),
            });
        }

        for task in self.running.iter_mut() {
            task.signal_stop(self.grace_period)?;
        }

        // Escalation is bounded by the grace period; the slack covers kill
        // delivery and reaping.
        let hard_deadline = Instant::now() + self.grace_period + Duration::from_secs(10);
        while !self.running.is_empty() {
            for task in self.running.iter_mut() {
                task.poll()?;
            }
            self.reap(true)?;
            if self.running.is_empty() {
                break;
            }
            if Instant::now() >= hard_deadline {
                warn!(
                    stragglers = self.running.len(),
                    "Workers survived the kill escalation, abandoning handles"
                );
                // kill_on_drop covers any process still alive.
                let stragglers: Vec<Task> = self.running.drain(..).collect();
                for task in stragglers {
                    self.completed.push(TaskOutcome {
                        task_id: task.id(),
                        name: task.name().to_string(),
                        exit_code: None,
                        cause: CompletionCause::Timeout,
                        profiling: task.profiling().clone(),
                    });
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StopConditionSpec;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn test_settings(num_workers: usize) -> RunSettings {
        RunSettings {
            num_workers,
            timeout_secs: None,
            poll_interval_ms: 20,
            grace_period_secs: 1,
        }
    }

    fn sh_task(name: &str, script: &str) -> TaskConfig {
        TaskConfig {
            name: name.to_string(),
            executable: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string(), "--".to_string()],
            parameters: serde_json::Map::new(),
            env: HashMap::new(),
        }
    }

    fn condition(yaml: &str) -> Arc<StopCondition> {
        let spec: StopConditionSpec = serde_yaml::from_str(yaml).unwrap();
        Arc::new(StopCondition::from_spec(&spec).unwrap())
    }

    #[tokio::test]
    async fn test_single_slot_respects_fifo_spawn_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager =
            WorkerManager::with_settings(&test_settings(1), dir.path().to_path_buf()).unwrap();
        for name in ["a", "b", "c"] {
            manager.add_task(sh_task(name, "sleep 0.1")).unwrap();
        }

        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let seen_in_hook = Arc::clone(&seen);
        let hook: PostPollHook = Box::new(move |running| {
            assert!(running.len() <= 1, "more than one task running at once");
            let mut seen = seen_in_hook.lock().unwrap();
            for task in running {
                let name = task.name().to_string();
                if !seen.contains(&name) {
                    seen.push(name);
                }
            }
        });

        let outcomes = manager.start_working(None, Some(hook)).await.unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| o.success()));
        // Spawn order follows enqueue order when only one slot exists.
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
        // Outcomes are reported in enqueue order.
        assert_eq!(
            outcomes.iter().map(|o| o.name.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_data_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager =
            WorkerManager::with_settings(&test_settings(2), dir.path().to_path_buf()).unwrap();
        manager.add_task(sh_task("ok", "exit 0")).unwrap();
        manager.add_task(sh_task("bad", "exit 7")).unwrap();

        let outcomes = manager.start_working(None, None).await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].exit_code, Some(0));
        assert_eq!(outcomes[1].exit_code, Some(7));
        assert_eq!(outcomes[1].cause, CompletionCause::Exited);
    }

    #[tokio::test]
    async fn test_spawn_failure_does_not_abort_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager =
            WorkerManager::with_settings(&test_settings(2), dir.path().to_path_buf()).unwrap();
        let mut broken = sh_task("broken", "");
        broken.executable = PathBuf::from("/nonexistent/model");
        manager.add_task(broken).unwrap();
        manager.add_task(sh_task("fine", "exit 0")).unwrap();

        let outcomes = manager.start_working(None, None).await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(matches!(
            outcomes[0].cause,
            CompletionCause::SpawnFailed(_)
        ));
        assert!(outcomes[1].success());
    }

    #[tokio::test]
    async fn test_queue_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager =
            WorkerManager::with_settings(&test_settings(1), dir.path().to_path_buf()).unwrap();
        manager.set_queue_limit(1);
        manager.add_task(sh_task("a", "exit 0")).unwrap();
        let err = manager.add_task(sh_task("b", "exit 0")).unwrap_err();
        assert!(matches!(err, ManagerError::Capacity { limit: 1 }));
    }

    #[tokio::test]
    async fn test_overall_timeout_terminates_and_returns() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager =
            WorkerManager::with_settings(&test_settings(1), dir.path().to_path_buf()).unwrap();
        manager.add_task(sh_task("slow", "sleep 30")).unwrap();
        manager.add_task(sh_task("never", "sleep 30")).unwrap();

        let started = Instant::now();
        let outcomes = manager
            .start_working(Some(Duration::from_millis(300)), None)
            .await
            .unwrap();
        // Bounded overshoot: timeout + grace period + reaping slack.
        assert!(started.elapsed() < Duration::from_secs(15));
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].cause, CompletionCause::Timeout);
        // The second task never got a slot and was cancelled while pending.
        assert_eq!(outcomes[1].cause, CompletionCause::Timeout);
        assert_eq!(outcomes[1].exit_code, None);
    }

    #[tokio::test]
    async fn test_timeout_bounded_even_if_worker_ignores_sigterm() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager =
            WorkerManager::with_settings(&test_settings(1), dir.path().to_path_buf()).unwrap();
        manager
            .add_task(sh_task("stubborn", r#"trap "" TERM; sleep 30"#))
            .unwrap();

        let started = Instant::now();
        let outcomes = manager
            .start_working(Some(Duration::from_millis(300)), None)
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(15));
        assert_eq!(outcomes[0].cause, CompletionCause::Timeout);
        assert_eq!(outcomes[0].exit_code, Some(128 + libc::SIGKILL));
    }

    #[tokio::test]
    async fn test_wall_timeout_condition_stops_worker() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager =
            WorkerManager::with_settings(&test_settings(1), dir.path().to_path_buf()).unwrap();
        manager.add_stop_condition(condition(
            r#"
name: wall
checks:
  - function: wall_timeout
    params: { seconds: 0.3 }
"#,
        ));
        manager.add_task(sh_task("slow", "sleep 30")).unwrap();

        let outcomes = manager.start_working(None, None).await.unwrap();
        assert_eq!(
            outcomes[0].cause,
            CompletionCause::StopCondition("wall".to_string())
        );
        assert_eq!(outcomes[0].exit_code, Some(128 + libc::SIGTERM));
    }

    #[tokio::test]
    async fn test_monitor_condition_stops_worker_at_target() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager =
            WorkerManager::with_settings(&test_settings(1), dir.path().to_path_buf()).unwrap();
        manager.add_stop_condition(condition(
            r#"
name: converged
checks:
  - function: monitor_compare
    params: { key: progress.percent, op: "==", value: 100 }
"#,
        ));
        let script = r#"
echo '{"progress": {"percent": 50}}'
sleep 0.2
echo '{"progress": {"percent": 100}}'
sleep 30
"#;
        manager.add_task(sh_task("model", script)).unwrap();

        let started = Instant::now();
        let outcomes = manager.start_working(None, None).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(15));
        assert_eq!(
            outcomes[0].cause,
            CompletionCause::StopCondition("converged".to_string())
        );
    }

    #[tokio::test]
    async fn test_disabled_condition_does_not_stop_worker() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager =
            WorkerManager::with_settings(&test_settings(1), dir.path().to_path_buf()).unwrap();
        manager.add_stop_condition(condition(
            r#"
name: wall
enabled: false
checks:
  - function: wall_timeout
    params: { seconds: 0.1 }
"#,
        ));
        manager.add_task(sh_task("quick", "sleep 0.5")).unwrap();

        let outcomes = manager.start_working(None, None).await.unwrap();
        assert_eq!(outcomes[0].cause, CompletionCause::Exited);
        assert_eq!(outcomes[0].exit_code, Some(0));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = WorkerManager::new(0, PathBuf::from("/tmp")).unwrap_err();
        assert!(matches!(err, ManagerError::NoWorkers));
    }
}
