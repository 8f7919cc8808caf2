//! Stop conditions: named, toggleable predicates over live task state.
//!
//! A condition is a conjunction of checks drawn from a fixed registry of
//! check functions, referenced by name in configuration. Unknown function
//! names are rejected at construction, never at evaluation. Checks read
//! task state and never mutate it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde_json::Value;
use tracing::warn;

use crate::config::{CheckSpec, ConfigError, StopConditionSpec};
use crate::monitor::CompareOp;
use crate::task::Task;

/// Registered check function names.
pub const CHECK_FUNCTIONS: &[&str] = &["wall_timeout", "monitor_compare"];

/// One resolved check. Built from a [`CheckSpec`] at condition construction.
#[derive(Debug)]
enum Check {
    /// True once the task has existed longer than `seconds` (monotonic clock).
    WallTimeout { seconds: f64 },
    /// Compares a dotted key path in the latest monitor entry against a
    /// reference value. Undecidable (no monitor entry yet) is false.
    MonitorCompare {
        key: String,
        op: CompareOp,
        value: Value,
        /// Key paths already warned about, to keep repeated polls from
        /// flooding the log. Owned by this check, not process-wide.
        warned_keys: Mutex<HashSet<String>>,
    },
}

impl Check {
    fn from_spec(condition: &str, spec: &CheckSpec) -> Result<Self, ConfigError> {
        let bad_param = |param: &str, reason: &str| ConfigError::BadCheckParam {
            function: spec.function.clone(),
            param: param.to_string(),
            reason: reason.to_string(),
        };

        match spec.function.as_str() {
            "wall_timeout" => {
                let seconds = spec
                    .params
                    .get("seconds")
                    .ok_or_else(|| bad_param("seconds", "required"))?
                    .as_f64()
                    .ok_or_else(|| bad_param("seconds", "must be a number"))?;
                if seconds <= 0.0 {
                    return Err(bad_param("seconds", "must be positive"));
                }
                Ok(Check::WallTimeout { seconds })
            }
            "monitor_compare" => {
                let key = spec
                    .params
                    .get("key")
                    .and_then(Value::as_str)
                    .ok_or_else(|| bad_param("key", "required string"))?
                    .to_string();
                let op_text = spec
                    .params
                    .get("op")
                    .and_then(Value::as_str)
                    .ok_or_else(|| bad_param("op", "required string"))?;
                let op = CompareOp::parse(op_text)
                    .ok_or_else(|| bad_param("op", &format!("unknown operator {:?}", op_text)))?;
                let value = spec
                    .params
                    .get("value")
                    .ok_or_else(|| bad_param("value", "required"))?
                    .clone();
                Ok(Check::MonitorCompare {
                    key,
                    op,
                    value,
                    warned_keys: Mutex::new(HashSet::new()),
                })
            }
            _ => Err(ConfigError::UnknownCheckFunction {
                condition: condition.to_string(),
                function: spec.function.clone(),
            }),
        }
    }

    fn evaluate(&self, condition: &str, task: &Task) -> bool {
        match self {
            Check::WallTimeout { seconds } => task.profiling().age().as_secs_f64() > *seconds,
            Check::MonitorCompare {
                key,
                op,
                value,
                warned_keys,
            } => {
                let Some(entry) = task.latest_monitor() else {
                    // No monitor data yet: not decidable, not an error.
                    return false;
                };
                match entry.lookup(key) {
                    Some(found) => op.apply(found, value),
                    None => {
                        let mut warned = match warned_keys.lock() {
                            Ok(warned) => warned,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        if warned.insert(key.clone()) {
                            warn!(
                                condition,
                                task = %task.id(),
                                key = %key,
                                "Monitor entry has no such key, treating check as false"
                            );
                        }
                        false
                    }
                }
            }
        }
    }
}

/// A named predicate evaluated against running tasks. Shared read-only
/// across every task it is attached to; only the enabled flag is mutable.
#[derive(Debug)]
pub struct StopCondition {
    name: String,
    description: String,
    enabled: AtomicBool,
    checks: Vec<Check>,
}

impl StopCondition {
    /// Build a condition from its configuration record.
    ///
    /// # Errors
    ///
    /// `EmptyChecks` for an empty check list, `UnknownCheckFunction` or
    /// `BadCheckParam` for an unresolvable check.
    pub fn from_spec(spec: &StopConditionSpec) -> Result<Self, ConfigError> {
        if spec.checks.is_empty() {
            return Err(ConfigError::EmptyChecks {
                condition: spec.name.clone(),
            });
        }
        let checks = spec
            .checks
            .iter()
            .map(|check| Check::from_spec(&spec.name, check))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            name: spec.name.clone(),
            description: spec.description.clone(),
            enabled: AtomicBool::new(spec.enabled),
            checks,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// True iff the condition is enabled and every check holds for the
    /// task's current state. Checks run in declaration order and
    /// short-circuit on the first false result; a disabled condition
    /// returns false without evaluating anything.
    pub fn fulfilled(&self, task: &Task) -> bool {
        if !self.is_enabled() {
            return false;
        }
        self.checks
            .iter()
            .all(|check| check.evaluate(&self.name, task))
    }
}
