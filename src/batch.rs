//! Batch sequencing: runs declared entries in order, one WorkerManager per
//! entry, with per-entry output directories and fail-fast error policy.
//!
//! An entry may carry expected-failure metadata for the verification
//! harness: such an entry is satisfied only when the run fails with the
//! declared error kind and message substring.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cluster::{ClusterContext, NodeListError};
use crate::config::{BatchEntry, BatchSpec, ConfigError, ParallelizationLevel, RunSettings};
use crate::manager::{
    CompletionCause, ManagerError, PostPollHook, TaskOutcome, WorkerManager,
};
use crate::stop::StopCondition;
use crate::task::TaskError;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    NodeList(#[from] NodeListError),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error("failed to create entry output directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("entry {entry:?}: {failures} task(s) failed to start, first: {first}")]
    EntryFailed {
        entry: String,
        failures: usize,
        first: String,
    },

    #[error(
        "entry {entry:?} was expected to fail with {expected_kind} \
         (message containing {expected_message:?}) but {actual}"
    )]
    ExpectedFailureMismatch {
        entry: String,
        expected_kind: String,
        expected_message: String,
        actual: String,
    },
}

impl BatchError {
    /// Stable error-kind name for automated callers and the expected-failure
    /// harness.
    pub fn kind(&self) -> &'static str {
        match self {
            BatchError::Config(_) => "ConfigError",
            BatchError::NodeList(NodeListError::Format { .. }) => "FormatError",
            BatchError::NodeList(NodeListError::CountMismatch { .. }) => "CountMismatch",
            BatchError::NodeList(NodeListError::Membership { .. }) => "MembershipError",
            BatchError::Manager(ManagerError::NoWorkers) => "ConfigError",
            BatchError::Manager(ManagerError::Capacity { .. }) => "CapacityError",
            BatchError::Manager(ManagerError::Task(
                TaskError::Spawn { .. } | TaskError::WorkingDir { .. },
            )) => "SpawnError",
            BatchError::Manager(ManagerError::Task(
                TaskError::UseAfterFinalize { .. } | TaskError::NotExited { .. },
            )) => "UseAfterFinalizeError",
            BatchError::Io { .. } => "IoError",
            BatchError::EntryFailed { .. } => "SpawnError",
            BatchError::ExpectedFailureMismatch { .. } => "ExpectedFailureMismatch",
        }
    }
}

/// How one batch entry ended.
#[derive(Debug)]
pub enum EntryDisposition {
    /// The entry ran; per-task outcomes in enqueue order. Non-zero exits
    /// are recorded here, not raised.
    Completed(Vec<TaskOutcome>),
    /// The entry failed exactly as its expected-failure metadata declared.
    ExpectedFailure { kind: String, message: String },
}

#[derive(Debug)]
pub struct EntryOutcome {
    pub name: String,
    pub disposition: EntryDisposition,
}

impl EntryOutcome {
    pub fn all_succeeded(&self) -> bool {
        match &self.disposition {
            EntryDisposition::Completed(outcomes) => outcomes.iter().all(|o| o.success()),
            EntryDisposition::ExpectedFailure { .. } => true,
        }
    }
}

/// Sequences the entries of one batch specification.
///
/// Entries run in declaration order, each under
/// `output_dir/<entry name>/`, so entries never collide. The first entry
/// error aborts the remaining entries.
pub struct BatchTaskManager {
    spec: BatchSpec,
    run_id: Uuid,
    stop_conditions: Vec<Arc<StopCondition>>,
    cluster: Option<ClusterContext>,
    post_poll_factory: Option<Box<dyn Fn() -> PostPollHook + Send>>,
}

impl std::fmt::Debug for BatchTaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchTaskManager")
            .field("spec", &self.spec)
            .field("run_id", &self.run_id)
            .field("stop_conditions", &self.stop_conditions)
            .field("cluster", &self.cluster)
            .field(
                "post_poll_factory",
                &self.post_poll_factory.as_ref().map(|_| "Fn"),
            )
            .finish()
    }
}

impl BatchTaskManager {
    /// Validate the spec, build the stop conditions, and resolve the
    /// cluster allocation. All configuration-time errors surface here,
    /// before any task is spawned.
    pub fn new(spec: BatchSpec) -> Result<Self, BatchError> {
        spec.validate()?;
        let stop_conditions = spec
            .stop_conditions
            .iter()
            .map(|condition_spec| StopCondition::from_spec(condition_spec).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        let cluster = match &spec.cluster {
            Some(settings) => Some(ClusterContext::resolve(
                &settings.node_list,
                &settings.mode,
                settings.num_nodes,
                &settings.node_name,
            )?),
            None => None,
        };
        Ok(Self {
            spec,
            run_id: Uuid::new_v4(),
            stop_conditions,
            cluster,
            post_poll_factory: None,
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn cluster(&self) -> Option<&ClusterContext> {
        self.cluster.as_ref()
    }

    /// Install a factory producing a fresh post-poll observer hook for each
    /// entry's WorkerManager, e.g. a resource sampler.
    pub fn set_post_poll_factory<F>(&mut self, factory: F)
    where
        F: Fn() -> PostPollHook + Send + 'static,
    {
        self.post_poll_factory = Some(Box::new(factory));
    }

    /// Run every entry in declaration order. Fail-fast: the first entry
    /// error (or unmet expected failure) aborts the remaining entries.
    pub async fn perform_tasks(&mut self) -> Result<Vec<EntryOutcome>, BatchError> {
        info!(
            run = %self.run_id,
            entries = self.spec.entries.len(),
            output_dir = %self.spec.output_dir.display(),
            "Starting batch"
        );
        let entries = self.spec.entries.clone();
        let mut results = Vec::with_capacity(entries.len());
        for entry in &entries {
            let disposition = self.perform_entry(entry).await?;
            results.push(EntryOutcome {
                name: entry.name.clone(),
                disposition,
            });
        }
        info!(run = %self.run_id, "Batch complete");
        Ok(results)
    }

    async fn perform_entry(&self, entry: &BatchEntry) -> Result<EntryDisposition, BatchError> {
        info!(entry = %entry.name, tasks = entry.tasks.len(), "Running batch entry");
        let result = self.run_entry(entry).await;

        let Some(expected) = &entry.expected_failure else {
            let outcomes = result?;
            let failures: Vec<&TaskOutcome> = outcomes
                .iter()
                .filter(|o| matches!(o.cause, CompletionCause::SpawnFailed(_)))
                .collect();
            if let Some(first) = failures.first() {
                return Err(BatchError::EntryFailed {
                    entry: entry.name.clone(),
                    failures: failures.len(),
                    first: match &first.cause {
                        CompletionCause::SpawnFailed(msg) => msg.clone(),
                        _ => unreachable!(),
                    },
                });
            }
            return Ok(EntryDisposition::Completed(outcomes));
        };

        // Verification entry: only the declared failure satisfies it.
        let mismatch = |actual: String| BatchError::ExpectedFailureMismatch {
            entry: entry.name.clone(),
            expected_kind: expected.kind.clone(),
            expected_message: expected.message_contains.clone(),
            actual,
        };
        match result {
            Err(e) => {
                let message = e.to_string();
                if e.kind() == expected.kind && message.contains(&expected.message_contains) {
                    info!(entry = %entry.name, kind = e.kind(), "Entry failed as expected");
                    Ok(EntryDisposition::ExpectedFailure {
                        kind: e.kind().to_string(),
                        message,
                    })
                } else {
                    Err(mismatch(format!("failed with {}: {}", e.kind(), message)))
                }
            }
            Ok(outcomes) => {
                // Spawn failures are recorded per task, not raised; match
                // them here so harness entries can expect them.
                let spawn_failure = outcomes.iter().find_map(|o| match &o.cause {
                    CompletionCause::SpawnFailed(msg)
                        if msg.contains(&expected.message_contains) =>
                    {
                        Some(msg.clone())
                    }
                    _ => None,
                });
                match spawn_failure {
                    Some(message) if expected.kind == "SpawnError" => {
                        info!(entry = %entry.name, "Entry failed as expected");
                        Ok(EntryDisposition::ExpectedFailure {
                            kind: "SpawnError".to_string(),
                            message,
                        })
                    }
                    _ => Err(mismatch("completed without the expected failure".to_string())),
                }
            }
        }
    }

    async fn run_entry(&self, entry: &BatchEntry) -> Result<Vec<TaskOutcome>, BatchError> {
        let entry_dir = self.spec.output_dir.join(&entry.name);
        tokio::fs::create_dir_all(&entry_dir)
            .await
            .map_err(|source| BatchError::Io {
                path: entry_dir.clone(),
                source,
            })?;

        let num_workers = match self.spec.parallelization_level {
            ParallelizationLevel::Sweep => self.spec.run.num_workers,
            ParallelizationLevel::Entry => 1,
        };
        let settings = RunSettings {
            num_workers,
            ..self.spec.run.clone()
        };
        let mut manager = WorkerManager::with_settings(&settings, entry_dir)?;
        for condition in &self.stop_conditions {
            manager.add_stop_condition(Arc::clone(condition));
        }

        // Sweeps are partitioned across cluster nodes; a single run is not
        // split and executes wherever this process runs.
        let tasks = match &self.cluster {
            Some(ctx) if entry.tasks.len() > 1 => {
                let assigned = ctx.assigned(entry.tasks.clone());
                info!(
                    entry = %entry.name,
                    node = ctx.node_name(),
                    assigned = assigned.len(),
                    total = entry.tasks.len(),
                    "Partitioned sweep for this node"
                );
                assigned
            }
            _ => entry.tasks.clone(),
        };
        if tasks.is_empty() {
            warn!(entry = %entry.name, "No tasks assigned to this node");
            return Ok(Vec::new());
        }
        for config in tasks {
            manager.add_task(config)?;
        }

        let hook = self.post_poll_factory.as_ref().map(|factory| factory());
        let outcomes = manager.start_working(self.spec.run.timeout(), hook).await?;
        Ok(outcomes)
    }
}
