//! Pipeline lifecycle hooks.
//!
//! Hooks are task names run after the main pipeline finishes on a host:
//! `afterSuccess` once every step succeeded, `afterFailure` once a step
//! failed. Hook tasks run in declaration order. A failing hook never changes
//! the host's outcome; it is logged and recorded.

use serde::{Deserialize, Serialize};

use crate::env::Env;
use crate::error::{Error, Result};
use crate::task::TaskGraph;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HookEvent {
    AfterSuccess,
    AfterFailure,
}

impl HookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::AfterSuccess => "afterSuccess",
            HookEvent::AfterFailure => "afterFailure",
        }
    }
}

/// Ordered hook task lists per event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hooks {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after_success: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after_failure: Vec<String>,
}

/// Result of running one hook task.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HookTaskResult {
    pub task: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of running all hooks for an event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HookRunResult {
    pub event: HookEvent,
    pub tasks: Vec<HookTaskResult>,
    pub all_succeeded: bool,
}

impl Hooks {
    pub fn for_event(&self, event: HookEvent) -> &[String] {
        match event {
            HookEvent::AfterSuccess => &self.after_success,
            HookEvent::AfterFailure => &self.after_failure,
        }
    }

    /// Every hook must name a task that resolves against `env`.
    pub fn validate(&self, graph: &TaskGraph, env: &Env) -> Result<()> {
        for event in [HookEvent::AfterSuccess, HookEvent::AfterFailure] {
            for name in self.for_event(event) {
                graph.resolve(name, env).map_err(|e| {
                    if e.code == crate::error::ErrorCode::TaskNotFound {
                        Error::config_invalid_value(
                            format!("hooks.{}", event.as_str()),
                            Some(name.clone()),
                            "hook names an undefined task",
                        )
                    } else {
                        e
                    }
                })?;
            }
        }
        Ok(())
    }
}

/// Run the hooks for `event`, continuing past failures.
///
/// `run_task` executes one hook task; the caller owns the host context.
pub fn run_hooks<F>(hooks: &Hooks, event: HookEvent, host: &str, mut run_task: F) -> HookRunResult
where
    F: FnMut(&str) -> Result<()>,
{
    let mut tasks = Vec::new();
    let mut all_succeeded = true;

    for name in hooks.for_event(event) {
        log_status!("hook", "Running {} hook '{}' on {}", event.as_str(), name, host);
        match run_task(name) {
            Ok(()) => tasks.push(HookTaskResult {
                task: name.clone(),
                success: true,
                error: None,
            }),
            Err(e) => {
                all_succeeded = false;
                tracing::warn!(
                    host = %host,
                    hook = %name,
                    code = e.code.as_str(),
                    "{} hook failed: {}",
                    event.as_str(),
                    e.message
                );
                tasks.push(HookTaskResult {
                    task: name.clone(),
                    success: false,
                    error: Some(e.message),
                });
            }
        }
    }

    HookRunResult {
        event,
        tasks,
        all_succeeded,
    }
}
