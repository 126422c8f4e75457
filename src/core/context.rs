//! Per-host execution state handed to every step.

use serde::Serialize;
use std::time::{Duration, Instant};

use crate::env::Env;
use crate::host::HostConfig;
use crate::release::{ReleaseLayout, ReleaseRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    /// Nonzero exit on a step that tolerates failure.
    Tolerated,
    Failed,
}

/// One executed step. The log is append-only.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepLogEntry {
    pub task: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub outcome: StepOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stderr: String,
}

/// State for one host within one invocation.
///
/// Env precedence: recipe defaults, then host env, then invocation overrides,
/// then the runtime release variables once a release exists.
#[derive(Debug)]
pub struct ExecutionContext<'a> {
    pub host: &'a HostConfig,
    pub env: Env,
    pub layout: Option<ReleaseLayout>,
    pub release: Option<ReleaseRecord>,
    /// Release that was active before this invocation's swap.
    pub previous: Option<ReleaseRecord>,
    pub activated: bool,
    deadline: Option<Instant>,
    log: Vec<StepLogEntry>,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(host: &'a HostConfig, defaults: &Env, overrides: &Env) -> Self {
        let env = host.resolve_env(defaults, overrides);
        let layout = env.non_empty("deploy_path").map(ReleaseLayout::new);
        Self {
            host,
            env,
            layout,
            release: None,
            previous: None,
            activated: false,
            deadline: None,
            log: Vec::new(),
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Env including the layout paths and the current release, if any.
    pub fn template_env(&self) -> Env {
        match &self.layout {
            Some(layout) => self.env.merged_with(&layout.vars(self.release.as_ref())),
            None => self.env.clone(),
        }
    }

    /// Directory commands run in: the new release once it exists, then
    /// `deploy_path`, falling back to the filesystem root.
    pub fn working_dir(&self) -> String {
        if let Some(release) = &self.release {
            return release.path.clone();
        }
        self.layout
            .as_ref()
            .map(|l| l.deploy_path.clone())
            .unwrap_or_else(|| "/".to_string())
    }

    /// Time left before the pipeline deadline, or `None` if there is none.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Per-command timeout capped by the pipeline deadline.
    pub fn timeout_for(&self, requested: Duration) -> Duration {
        match self.remaining() {
            Some(left) => requested.min(left),
            None => requested,
        }
    }

    pub fn deadline_passed(&self) -> bool {
        matches!(self.remaining(), Some(left) if left.is_zero())
    }

    pub fn record(&mut self, entry: StepLogEntry) {
        self.log.push(entry);
    }

    pub fn into_log(self) -> Vec<StepLogEntry> {
        self.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> HostConfig {
        HostConfig::new("web", "web.example.com", "deploy").with_env("deploy_path", "/srv/app")
    }

    #[test]
    fn overrides_win_over_host_env() {
        let host = host().with_env("branch", "master");
        let overrides: Env = [("branch", "release-1")].into_iter().collect();
        let ctx = ExecutionContext::new(&host, &Env::new(), &overrides);

        assert_eq!(ctx.env.get("branch"), Some("release-1"));
        assert_eq!(ctx.working_dir(), "/srv/app");
    }

    #[test]
    fn template_env_includes_release_vars() {
        let host = host();
        let mut ctx = ExecutionContext::new(&host, &Env::new(), &Env::new());
        ctx.release = Some(ReleaseRecord {
            id: "20240101120000".to_string(),
            path: "/srv/app/releases/20240101120000".to_string(),
            status: crate::release::ReleaseStatus::Preparing,
        });

        let env = ctx.template_env();
        assert_eq!(env.get("release_id"), Some("20240101120000"));
        assert_eq!(env.get("current_path"), Some("/srv/app/current"));
        assert_eq!(ctx.working_dir(), "/srv/app/releases/20240101120000");
    }

    #[test]
    fn timeout_is_capped_by_deadline() {
        let host = host();
        let ctx = ExecutionContext::new(&host, &Env::new(), &Env::new())
            .with_deadline(Some(Instant::now() + Duration::from_secs(2)));

        assert!(ctx.timeout_for(Duration::from_secs(600)) <= Duration::from_secs(2));
        assert!(!ctx.deadline_passed());
    }

    #[test]
    fn no_deadline_keeps_requested_timeout() {
        let host = host();
        let ctx = ExecutionContext::new(&host, &Env::new(), &Env::new());
        assert_eq!(ctx.timeout_for(Duration::from_secs(5)), Duration::from_secs(5));
        assert_eq!(ctx.remaining(), None);
    }
}
