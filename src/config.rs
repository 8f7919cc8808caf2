//! Batch configuration data model.
//!
//! A batch run is described by one YAML document:
//!
//! ```yaml
//! output_dir: /scratch/sweeps/run-17
//! parallelization_level: sweep
//! run:
//!   num_workers: 4
//!   timeout_secs: 3600
//! stop_conditions:
//!   - name: converged
//!     checks:
//!       - function: monitor_compare
//!         params: { key: progress.percent, op: "==", value: 100 }
//! cluster:
//!   node_list: "node[001-004]"
//!   mode: condensed
//!   num_nodes: 4
//!   node_name: node002
//! entries:
//!   - name: baseline
//!     tasks:
//!       - name: u0
//!         executable: /opt/models/run_model
//!         parameters: { seed: 17, density: 0.3 }
//! ```
//!
//! All configuration-time validation happens here or at StopCondition
//! construction; a batch that passes validation can only fail at runtime
//! through its workers.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("output directory must be absolute, got {path}")]
    RelativeOutputDir { path: PathBuf },

    #[error("num_workers must be at least 1")]
    NoWorkers,

    #[error("duplicate batch entry name {name:?}")]
    DuplicateEntry { name: String },

    #[error("duplicate task name {name:?} in entry {entry:?}")]
    DuplicateTask { entry: String, name: String },

    #[error("batch entry {name:?} declares no tasks")]
    EmptyEntry { name: String },

    #[error("stop condition {condition:?} has an empty check list")]
    EmptyChecks { condition: String },

    #[error("stop condition {condition:?} references unknown check function {function:?}")]
    UnknownCheckFunction { condition: String, function: String },

    #[error("check function {function:?}, parameter {param:?}: {reason}")]
    BadCheckParam {
        function: String,
        param: String,
        reason: String,
    },
}

fn default_true() -> bool {
    true
}

fn default_num_workers() -> usize {
    1
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_grace_period_secs() -> u64 {
    5
}

fn default_mode() -> String {
    "condensed".to_string()
}

/// Where the configured worker concurrency applies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelizationLevel {
    /// `num_workers` concurrent workers within each entry's sweep.
    #[default]
    Sweep,
    /// One worker per entry; parallelism comes from running one process per
    /// cluster node (or per entry) under an external scheduler.
    Entry,
}

/// Global run settings shared by every entry in the batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSettings {
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Overall wall-clock limit for one entry's `start_working` call.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Delay between the soft stop signal and the forceful kill.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            timeout_secs: None,
            poll_interval_ms: default_poll_interval_ms(),
            grace_period_secs: default_grace_period_secs(),
        }
    }
}

impl RunSettings {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// One check inside a stop condition: a registry function name plus its
/// keyword parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckSpec {
    pub function: String,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

/// Declaration of a named stop condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopConditionSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub checks: Vec<CheckSpec>,
}

/// Cluster-mode fields, present only for partitioned sweeps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSettings {
    pub node_list: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    pub num_nodes: usize,
    pub node_name: String,
}

/// Fully resolved configuration for one worker run.
///
/// The worker is launched as `executable [args..] <config.json path>` with
/// `parameters` serialized to `config.json` in the task's working directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Unique id within the entry, e.g. a universe/sweep-cell id.
    pub name: String,
    pub executable: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Failure a verification entry is expected to produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpectedFailure {
    /// Stable error kind name, e.g. `CountMismatch` or `ConfigError`.
    pub kind: String,
    #[serde(default)]
    pub message_contains: String,
}

/// One named unit of batch work: a single run (one task) or a sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEntry {
    pub name: String,
    pub tasks: Vec<TaskConfig>,
    #[serde(default)]
    pub expected_failure: Option<ExpectedFailure>,
}

/// The whole batch document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSpec {
    pub output_dir: PathBuf,
    #[serde(default)]
    pub parallelization_level: ParallelizationLevel,
    #[serde(default)]
    pub run: RunSettings,
    #[serde(default)]
    pub stop_conditions: Vec<StopConditionSpec>,
    #[serde(default)]
    pub cluster: Option<ClusterSettings>,
    pub entries: Vec<BatchEntry>,
}

impl BatchSpec {
    /// Load and validate a batch spec from a YAML file.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let spec: BatchSpec =
            serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        spec.validate()?;
        Ok(spec)
    }

    /// Structural validation, applied before any task is spawned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.output_dir.is_absolute() {
            return Err(ConfigError::RelativeOutputDir {
                path: self.output_dir.clone(),
            });
        }
        if self.run.num_workers == 0 {
            return Err(ConfigError::NoWorkers);
        }

        let mut entry_names = HashSet::new();
        for entry in &self.entries {
            if !entry_names.insert(entry.name.as_str()) {
                return Err(ConfigError::DuplicateEntry {
                    name: entry.name.clone(),
                });
            }
            if entry.tasks.is_empty() {
                return Err(ConfigError::EmptyEntry {
                    name: entry.name.clone(),
                });
            }
            let mut task_names = HashSet::new();
            for task in &entry.tasks {
                if !task_names.insert(task.name.as_str()) {
                    return Err(ConfigError::DuplicateTask {
                        entry: entry.name.clone(),
                        name: task.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}
