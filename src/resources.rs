//! Live resource usage of running worker processes.
//!
//! Wired into the scheduling loop through the post-poll hook, so an
//! operator can watch CPU and memory of active tasks without the manager
//! knowing anything about system monitoring.

use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::debug;

use crate::manager::PostPollHook;
use crate::task::{Task, TaskId};

/// One sample of a running task's process.
#[derive(Debug, Clone)]
pub struct ResourceUsage {
    pub task_id: TaskId,
    pub name: String,
    pub pid: u32,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
}

/// Samples CPU and resident memory for the pids of running tasks.
pub struct ResourceSampler {
    system: System,
}

impl ResourceSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    /// Refresh and report usage for every task that currently has a live
    /// process. Tasks whose process already exited are skipped.
    pub fn sample(&mut self, tasks: &[Task]) -> Vec<ResourceUsage> {
        let pids: Vec<Pid> = tasks
            .iter()
            .filter_map(Task::pid)
            .map(Pid::from_u32)
            .collect();
        if pids.is_empty() {
            return Vec::new();
        }
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&pids), true);

        tasks
            .iter()
            .filter_map(|task| {
                let pid = task.pid()?;
                let process = self.system.process(Pid::from_u32(pid))?;
                Some(ResourceUsage {
                    task_id: task.id(),
                    name: task.name().to_string(),
                    pid,
                    cpu_percent: process.cpu_usage(),
                    memory_bytes: process.memory(),
                })
            })
            .collect()
    }

    /// Consume the sampler into a post-poll hook that logs each sample.
    pub fn into_hook(mut self) -> PostPollHook {
        Box::new(move |tasks| {
            for usage in self.sample(tasks) {
                debug!(
                    task = %usage.task_id,
                    name = %usage.name,
                    pid = usage.pid,
                    cpu_percent = usage.cpu_percent,
                    memory_bytes = usage.memory_bytes,
                    "Worker resource usage"
                );
            }
        })
    }
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self::new()
    }
}
