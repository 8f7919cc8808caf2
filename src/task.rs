//! One schedulable unit of work: a supervised external worker process.
//!
//! A `Task` owns exactly one child process for its lifetime. The scheduling
//! loop never blocks on it: stream readers run as spawned tokio tasks feeding
//! an unbounded channel, `poll()` drains that channel and checks liveness
//! with `try_wait`, and forceful kills use `start_kill`.
//!
//! Status transitions are monotonic:
//!
//! ```text
//! Pending -> Spawned -> Running -> Finished(exit_code)
//!                   \-> Stopping -> Finished(exit_code)
//!         \-> Errored(cause)
//! ```

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::TaskConfig;
use crate::monitor::MonitorEntry;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("failed to spawn worker {executable}: {source}")]
    Spawn {
        executable: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to prepare working directory {dir}: {source}")]
    WorkingDir {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("task {id} used after finalize")]
    UseAfterFinalize { id: TaskId },

    #[error("task {id} finalized before its process exited")]
    NotExited { id: TaskId },
}

/// Identifier assigned by the WorkerManager at enqueue time, unique within
/// one manager and immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task lifecycle state. Transitions are monotonic; a task never re-enters
/// an earlier state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    /// Enqueued, no process yet.
    Pending,
    /// Process launched, not yet observed by a poll.
    Spawned,
    /// Process alive.
    Running,
    /// Soft stop requested; escalation pending.
    Stopping,
    /// Process exited with the recorded code.
    Finished(i32),
    /// The task could not be run at all (e.g. spawn failure).
    Errored(String),
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Finished(_) | TaskStatus::Errored(_))
    }
}

/// Timestamps recorded over a task's lifetime. Mutated only by the task
/// itself; read by stop conditions and reporting.
#[derive(Debug, Clone)]
pub struct Profiling {
    pub created_at: DateTime<Utc>,
    pub spawned_at: Option<DateTime<Utc>>,
    pub first_monitor_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    created_instant: Instant,
}

impl Profiling {
    fn new() -> Self {
        Self {
            created_at: Utc::now(),
            spawned_at: None,
            first_monitor_at: None,
            completed_at: None,
            created_instant: Instant::now(),
        }
    }

    /// Monotonic time since task creation, the reference clock for
    /// wall-timeout checks.
    pub fn age(&self) -> Duration {
        self.created_instant.elapsed()
    }
}

/// Which standard stream a captured line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
    Stdout,
    Stderr,
}

/// One raw captured output line, in arrival order.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub source: StreamSource,
    pub text: String,
}

/// One supervised worker process plus its configuration, captured streams,
/// parsed monitor entries, and profiling record.
#[derive(Debug)]
pub struct Task {
    id: TaskId,
    config: TaskConfig,
    working_dir: PathBuf,
    status: TaskStatus,
    profiling: Profiling,
    child: Option<Child>,
    pid: Option<u32>,
    lines: Vec<OutputLine>,
    monitors: Vec<MonitorEntry>,
    line_rx: Option<mpsc::UnboundedReceiver<OutputLine>>,
    exit_code: Option<i32>,
    stop_requested_at: Option<Instant>,
    grace_period: Duration,
    kill_sent: bool,
    triggered_condition: Option<String>,
    finalized: bool,
}

impl Task {
    pub fn new(id: TaskId, config: TaskConfig, working_dir: PathBuf) -> Self {
        Self {
            id,
            config,
            working_dir,
            status: TaskStatus::Pending,
            profiling: Profiling::new(),
            child: None,
            pid: None,
            lines: Vec::new(),
            monitors: Vec::new(),
            line_rx: None,
            exit_code: None,
            stop_requested_at: None,
            grace_period: Duration::from_secs(5),
            kill_sent: false,
            triggered_condition: None,
            finalized: false,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub fn working_dir(&self) -> &PathBuf {
        &self.working_dir
    }

    pub fn status(&self) -> &TaskStatus {
        &self.status
    }

    pub fn profiling(&self) -> &Profiling {
        &self.profiling
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// All captured output lines so far, both streams interleaved in
    /// arrival order.
    pub fn output_lines(&self) -> &[OutputLine] {
        &self.lines
    }

    pub fn monitors(&self) -> &[MonitorEntry] {
        &self.monitors
    }

    /// The most recently parsed monitor entry, if any arrived yet.
    pub fn latest_monitor(&self) -> Option<&MonitorEntry> {
        self.monitors.last()
    }

    /// Name of the stop condition that requested this task's termination.
    pub fn triggered_condition(&self) -> Option<&str> {
        self.triggered_condition.as_deref()
    }

    pub(crate) fn record_trigger(&mut self, condition: &str) {
        if self.triggered_condition.is_none() {
            self.triggered_condition = Some(condition.to_string());
        }
    }

    /// Launch the worker process.
    ///
    /// Creates the working directory, writes the resolved parameter record
    /// to `config.json`, and runs `executable [args..] config.json` with the
    /// working directory as cwd. Standard streams are piped into the
    /// capture channel.
    ///
    /// # Errors
    ///
    /// `WorkingDir` if the directory or config file cannot be written,
    /// `Spawn` if the executable cannot be launched. On `Spawn` the task
    /// transitions to `Errored`.
    pub async fn spawn(&mut self) -> Result<(), TaskError> {
        self.ensure_live()?;
        debug_assert_eq!(self.status, TaskStatus::Pending);

        tokio::fs::create_dir_all(&self.working_dir)
            .await
            .map_err(|source| TaskError::WorkingDir {
                dir: self.working_dir.clone(),
                source,
            })?;

        let config_path = self.working_dir.join("config.json");
        let params = serde_json::Value::Object(self.config.parameters.clone());
        let body = serde_json::to_vec_pretty(&params).unwrap_or_else(|_| b"{}".to_vec());
        tokio::fs::write(&config_path, body)
            .await
            .map_err(|source| TaskError::WorkingDir {
                dir: self.working_dir.clone(),
                source,
            })?;

        let child = Command::new(&self.config.executable)
            .args(&self.config.args)
            .arg(&config_path)
            .current_dir(&self.working_dir)
            .envs(&self.config.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match child {
            Ok(child) => child,
            Err(source) => {
                self.status = TaskStatus::Errored(format!(
                    "spawn of {} failed: {}",
                    self.config.executable.display(),
                    source
                ));
                return Err(TaskError::Spawn {
                    executable: self.config.executable.clone(),
                    source,
                });
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, StreamSource::Stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, StreamSource::Stderr, tx);
        }

        self.pid = child.id();
        self.child = Some(child);
        self.line_rx = Some(rx);
        self.profiling.spawned_at = Some(Utc::now());
        self.status = TaskStatus::Spawned;
        info!(
            task = %self.id,
            name = self.name(),
            pid = self.pid,
            executable = %self.config.executable.display(),
            "Spawned worker process"
        );
        Ok(())
    }

    /// One non-blocking supervision step: drain newly available output,
    /// escalate a pending stop past its grace period, and check liveness.
    ///
    /// # Errors
    ///
    /// `UseAfterFinalize` if the task was already finalized.
    pub fn poll(&mut self) -> Result<TaskStatus, TaskError> {
        self.ensure_live()?;
        if self.status.is_terminal() {
            return Ok(self.status.clone());
        }

        self.drain_output();

        if self.status == TaskStatus::Spawned {
            self.status = TaskStatus::Running;
        }

        if self.status == TaskStatus::Stopping && !self.kill_sent {
            let overdue = self
                .stop_requested_at
                .map(|at| at.elapsed() > self.grace_period)
                .unwrap_or(false);
            if overdue {
                if let Some(child) = self.child.as_mut() {
                    warn!(task = %self.id, "Grace period elapsed, killing worker");
                    let _ = child.start_kill();
                }
                self.kill_sent = true;
            }
        }

        if let Some(child) = self.child.as_mut() {
            match child.try_wait() {
                Ok(Some(exit)) => {
                    let code = exit_code_of(exit);
                    self.exit_code = Some(code);
                    self.status = TaskStatus::Finished(code);
                    debug!(task = %self.id, code, "Worker process exited");
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(task = %self.id, error = %e, "Liveness check failed");
                }
            }
        }

        Ok(self.status.clone())
    }

    /// Request graceful termination: SIGTERM now, SIGKILL once `grace` has
    /// elapsed without an exit. Idempotent; a no-op on tasks that are
    /// already stopping or terminal.
    pub fn signal_stop(&mut self, grace: Duration) -> Result<(), TaskError> {
        self.ensure_live()?;
        if self.status == TaskStatus::Stopping || self.status.is_terminal() {
            return Ok(());
        }
        if let Some(pid) = self.pid {
            // SAFETY: plain kill(2) on the child's pid; no memory is touched.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
        self.stop_requested_at = Some(Instant::now());
        self.grace_period = grace;
        self.status = TaskStatus::Stopping;
        info!(task = %self.id, name = self.name(), "Requested worker stop");
        Ok(())
    }

    /// Record completion and release the process handle. Valid exactly once,
    /// after the process has exited; every later lifecycle call fails with
    /// `UseAfterFinalize`.
    pub fn finalize(&mut self) -> Result<(i32, Profiling), TaskError> {
        self.ensure_live()?;
        let code = match self.exit_code {
            Some(code) => code,
            None => return Err(TaskError::NotExited { id: self.id }),
        };
        self.drain_output();
        self.profiling.completed_at = Some(Utc::now());
        self.child = None;
        self.line_rx = None;
        self.finalized = true;
        debug!(task = %self.id, code, "Task finalized");
        Ok((code, self.profiling.clone()))
    }

    fn ensure_live(&self) -> Result<(), TaskError> {
        if self.finalized {
            Err(TaskError::UseAfterFinalize { id: self.id })
        } else {
            Ok(())
        }
    }

    fn drain_output(&mut self) {
        let Some(rx) = self.line_rx.as_mut() else {
            return;
        };
        while let Ok(line) = rx.try_recv() {
            if line.source == StreamSource::Stdout {
                if let Some(entry) = MonitorEntry::parse(&line.text) {
                    if self.profiling.first_monitor_at.is_none() {
                        self.profiling.first_monitor_at = Some(entry.received_at());
                    }
                    self.monitors.push(entry);
                }
            }
            self.lines.push(line);
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate_created(&mut self, by: Duration) {
        self.profiling.created_instant -= by;
    }

    #[cfg(test)]
    pub(crate) fn push_monitor(&mut self, entry: MonitorEntry) {
        self.monitors.push(entry);
    }
}

fn exit_code_of(exit: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    exit.code()
        .or_else(|| exit.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

fn spawn_line_reader<R>(reader: R, source: StreamSource, tx: mpsc::UnboundedSender<OutputLine>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(text)) = lines.next_line().await {
            if tx.send(OutputLine { source, text }).is_err() {
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh_config(name: &str, script: &str) -> TaskConfig {
        TaskConfig {
            name: name.to_string(),
            executable: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string(), "--".to_string()],
            parameters: serde_json::Map::new(),
            env: Default::default(),
        }
    }

    async fn poll_until_terminal(task: &mut Task) -> TaskStatus {
        let deadline = Instant::now() + Duration::from_secs(20);
        loop {
            let status = task.poll().unwrap();
            if status.is_terminal() {
                return status;
            }
            assert!(Instant::now() < deadline, "task did not terminate in time");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_spawn_run_and_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let mut task = Task::new(
            TaskId(1),
            sh_config("t1", r#"echo '{"progress": {"percent": 100}}'; echo done; exit 3"#),
            dir.path().join("t1"),
        );
        task.spawn().await.unwrap();
        assert_eq!(*task.status(), TaskStatus::Spawned);

        let status = poll_until_terminal(&mut task).await;
        assert_eq!(status, TaskStatus::Finished(3));

        // Allow the line readers to flush, then take one more drain pass.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (code, profiling) = task.finalize().unwrap();
        assert_eq!(code, 3);
        assert!(profiling.spawned_at.is_some());
        assert!(profiling.completed_at.is_some());
        assert_eq!(task.monitors().len(), 1);
        assert_eq!(
            task.latest_monitor().unwrap().lookup("progress.percent"),
            Some(&serde_json::json!(100))
        );
        assert!(task
            .output_lines()
            .iter()
            .any(|l| l.source == StreamSource::Stdout && l.text == "done"));
    }

    #[tokio::test]
    async fn test_config_json_written_to_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = sh_config("t2", "cat \"$1\"");
        config
            .parameters
            .insert("seed".to_string(), serde_json::json!(17));
        let mut task = Task::new(TaskId(2), config, dir.path().join("t2"));
        task.spawn().await.unwrap();
        let status = poll_until_terminal(&mut task).await;
        assert_eq!(status, TaskStatus::Finished(0));
        let written = std::fs::read_to_string(dir.path().join("t2/config.json")).unwrap();
        assert!(written.contains("\"seed\""));
    }

    #[tokio::test]
    async fn test_spawn_failure_errors_the_task() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = sh_config("t3", "");
        config.executable = PathBuf::from("/nonexistent/model-binary");
        let mut task = Task::new(TaskId(3), config, dir.path().join("t3"));
        let err = task.spawn().await.unwrap_err();
        assert!(matches!(err, TaskError::Spawn { .. }));
        assert!(matches!(task.status(), TaskStatus::Errored(_)));
    }

    #[tokio::test]
    async fn test_signal_stop_terminates_cooperative_worker() {
        let dir = tempfile::tempdir().unwrap();
        let mut task = Task::new(
            TaskId(4),
            sh_config("t4", "sleep 30"),
            dir.path().join("t4"),
        );
        task.spawn().await.unwrap();
        task.poll().unwrap();
        task.signal_stop(Duration::from_secs(10)).unwrap();
        assert_eq!(*task.status(), TaskStatus::Stopping);
        // Idempotent.
        task.signal_stop(Duration::from_secs(10)).unwrap();

        let status = poll_until_terminal(&mut task).await;
        assert_eq!(status, TaskStatus::Finished(128 + libc::SIGTERM));
    }

    #[tokio::test]
    async fn test_stop_escalates_past_grace_period() {
        let dir = tempfile::tempdir().unwrap();
        let mut task = Task::new(
            TaskId(5),
            sh_config("t5", r#"trap "" TERM; sleep 30"#),
            dir.path().join("t5"),
        );
        task.spawn().await.unwrap();
        task.poll().unwrap();
        // Give the shell a moment to install its trap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        task.signal_stop(Duration::from_millis(200)).unwrap();

        let started = Instant::now();
        let status = poll_until_terminal(&mut task).await;
        assert_eq!(status, TaskStatus::Finished(128 + libc::SIGKILL));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_use_after_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let mut task = Task::new(TaskId(6), sh_config("t6", "exit 0"), dir.path().join("t6"));
        task.spawn().await.unwrap();
        poll_until_terminal(&mut task).await;
        task.finalize().unwrap();

        assert!(matches!(
            task.poll(),
            Err(TaskError::UseAfterFinalize { .. })
        ));
        assert!(matches!(
            task.signal_stop(Duration::from_secs(1)),
            Err(TaskError::UseAfterFinalize { .. })
        ));
        assert!(matches!(
            task.finalize(),
            Err(TaskError::UseAfterFinalize { .. })
        ));
    }

    #[tokio::test]
    async fn test_finalize_before_exit_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut task = Task::new(
            TaskId(7),
            sh_config("t7", "sleep 30"),
            dir.path().join("t7"),
        );
        task.spawn().await.unwrap();
        task.poll().unwrap();
        assert!(matches!(task.finalize(), Err(TaskError::NotExited { .. })));
        task.signal_stop(Duration::from_secs(5)).unwrap();
        poll_until_terminal(&mut task).await;
        task.finalize().unwrap();
    }
}
