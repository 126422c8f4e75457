//! Pipeline runner: drives one state machine per host across a bounded
//! worker pool.
//!
//! Each host walks `Prepared -> Updating -> SharedLinked -> Symlinked ->
//! TaskHooksRunning` as the built-in release actions complete, ending in
//! `Succeeded` or `Failed`. Steps on one host are strictly sequential.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use crate::context::{ExecutionContext, StepLogEntry, StepOutcome};
use crate::env::Env;
use crate::error::{Error, ErrorCode, Hint, RemoteCommandTimeoutDetails, Result, TargetDetails};
use crate::hooks::{self, HookEvent, HookRunResult, Hooks};
use crate::host::{HostConfig, HostRegistry};
use crate::release::{ReleaseLayout, ReleaseManager, ReleaseRecord, ReleaseStatus};
use crate::ssh::{RemoteCommand, RemoteExecutor};
use crate::task::{ReleaseAction, ResolvedStep, Step, TaskGraph};
use crate::utils::template;

/// Release directory settings shared by every host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseSettings {
    #[serde(default = "default_keep_releases")]
    pub keep_releases: usize,
    #[serde(default)]
    pub shared_dirs: Vec<String>,
    #[serde(default)]
    pub shared_files: Vec<String>,
    #[serde(default)]
    pub writable_dirs: Vec<String>,
    #[serde(default = "default_writable_mode")]
    pub writable_mode: String,
    /// Command template that fills a new release. Without it,
    /// `deploy:update_code` clones `repository`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_command: Option<String>,
}

fn default_keep_releases() -> usize {
    5
}

fn default_writable_mode() -> String {
    "ug+rwX".to_string()
}

impl Default for ReleaseSettings {
    fn default() -> Self {
        Self {
            keep_releases: default_keep_releases(),
            shared_dirs: Vec::new(),
            shared_files: Vec::new(),
            writable_dirs: Vec::new(),
            writable_mode: default_writable_mode(),
            update_command: None,
        }
    }
}

/// How a pipeline runs across hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSettings {
    /// Worker cap; defaults to one worker per host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<usize>,
    /// Stop every host once any host fails.
    #[serde(default)]
    pub all_or_nothing: bool,
    #[serde(default = "default_true")]
    pub rollback_on_failure: bool,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Overall budget for the whole invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_secs: Option<u64>,
    #[serde(default)]
    pub release: ReleaseSettings,
    #[serde(default)]
    pub hooks: Hooks,
}

fn default_true() -> bool {
    true
}

fn default_command_timeout() -> u64 {
    300
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            parallel: None,
            all_or_nothing: false,
            rollback_on_failure: true,
            command_timeout_secs: default_command_timeout(),
            deadline_secs: None,
            release: ReleaseSettings::default(),
            hooks: Hooks::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostPhase {
    Prepared,
    Updating,
    SharedLinked,
    Symlinked,
    TaskHooksRunning,
    Succeeded,
    Failed,
}

impl HostPhase {
    /// Phase reached once `step` completes, if the step moves the machine.
    fn after(step: &Step, activated: bool) -> Option<HostPhase> {
        match step {
            Step::Action { action } => match action {
                ReleaseAction::Prepare | ReleaseAction::Release => Some(HostPhase::Prepared),
                ReleaseAction::UpdateCode => Some(HostPhase::Updating),
                ReleaseAction::Shared | ReleaseAction::Writable => Some(HostPhase::SharedLinked),
                ReleaseAction::Symlink => Some(HostPhase::Symlinked),
                ReleaseAction::Cleanup | ReleaseAction::Rollback => None,
            },
            Step::Command(_) if activated => Some(HostPhase::TaskHooksRunning),
            Step::Command(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Succeeded,
    Failed,
    /// Failed after activation; `current` was pointed back.
    RolledBack,
    /// Stopped before finishing because another host failed.
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    PartialSuccess,
    Failed,
}

/// Serializable view of the error that stopped a host.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostFailure {
    pub code: String,
    pub message: String,
    pub details: serde_json::Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<Hint>,
}

impl From<&Error> for HostFailure {
    fn from(err: &Error) -> Self {
        Self {
            code: err.code.as_str().to_string(),
            message: err.message.clone(),
            details: err.details.clone(),
            hints: err.hints.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostReport {
    pub host: String,
    pub status: HostStatus,
    pub phase: HostPhase,
    /// Last non-terminal phase the host reached.
    pub reached: HostPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release: Option<ReleaseRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<HostFailure>,
    pub steps: Vec<StepLogEntry>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<HookRunResult>,
    pub duration_ms: u64,
    #[serde(skip)]
    pub error: Option<Error>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub total_hosts: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub rolled_back: usize,
    pub aborted: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub next_actions: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub tasks: Vec<String>,
    pub status: RunStatus,
    pub hosts: Vec<HostReport>,
    pub summary: RunSummary,
}

impl RunReport {
    /// The error of the first host that failed on its own, in host order,
    /// falling back to hosts stopped by all-or-nothing.
    pub fn first_error(&self) -> Option<&Error> {
        self.hosts
            .iter()
            .filter(|h| h.status != HostStatus::Aborted)
            .find_map(|h| h.error.as_ref())
            .or_else(|| self.hosts.iter().find_map(|h| h.error.as_ref()))
    }
}

/// Flat step list for one host, resolved before anything runs.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostPlan {
    pub host: String,
    pub steps: Vec<ResolvedStep>,
    #[serde(skip)]
    pub overrides: Env,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelinePlan {
    pub tasks: Vec<String>,
    pub hosts: Vec<HostPlan>,
}

/// Static inputs of a run; shared read-only across workers.
pub struct Pipeline<'a> {
    pub registry: &'a HostRegistry,
    pub graph: &'a TaskGraph,
    pub defaults: &'a Env,
    pub settings: &'a PipelineSettings,
}

impl<'a> Pipeline<'a> {
    /// Resolve `tasks` for every selected host.
    ///
    /// All configuration problems surface here, before any remote command:
    /// unknown hosts or tasks, cycles, missing parameters, and release
    /// actions without a `deploy_path` or out of order.
    pub fn plan(&self, tasks: &[String], hosts: &[String], overrides: &Env) -> Result<PipelinePlan> {
        if tasks.is_empty() {
            return Err(Error::validation_invalid_argument("task", "No task given"));
        }

        let selected = self.registry.select(hosts)?;
        if selected.is_empty() {
            return Err(Error::validation_invalid_argument(
                "hosts",
                "The recipe declares no hosts",
            ));
        }

        let mut host_plans = Vec::with_capacity(selected.len());
        for host in selected {
            let env = host.resolve_env(self.defaults, overrides);
            let steps = self.graph.resolve_all(tasks, &env)?;
            check_release_actions(&steps, &env)?;
            self.settings.hooks.validate(self.graph, &env)?;

            host_plans.push(HostPlan {
                host: host.name.clone(),
                steps,
                overrides: overrides.clone(),
            });
        }

        Ok(PipelinePlan {
            tasks: tasks.to_vec(),
            hosts: host_plans,
        })
    }

    /// Run a plan across its hosts.
    pub fn run(&self, plan: &PipelinePlan, executor: &dyn RemoteExecutor) -> RunReport {
        let deadline = self
            .settings
            .deadline_secs
            .map(|secs| Instant::now() + Duration::from_secs(secs));
        let workers = self
            .settings
            .parallel
            .unwrap_or(plan.hosts.len())
            .clamp(1, plan.hosts.len().max(1));
        let abort = AtomicBool::new(false);
        let queue: Mutex<VecDeque<usize>> = Mutex::new((0..plan.hosts.len()).collect());
        let reports: Mutex<Vec<Option<HostReport>>> = Mutex::new(vec![None; plan.hosts.len()]);

        log_status!(
            "pipeline",
            "Running {} on {} host(s) with {} worker(s)",
            plan.tasks.join(", "),
            plan.hosts.len(),
            workers
        );

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let next = queue.lock().ok().and_then(|mut q| q.pop_front());
                    let Some(idx) = next else { break };
                    let host_plan = &plan.hosts[idx];

                    let report = match self.registry.resolve(&host_plan.host) {
                        Ok(host) => {
                            let runner = HostRunner {
                                pipeline: self,
                                executor,
                                host,
                                abort: &abort,
                            };
                            runner.run(host_plan, deadline)
                        }
                        Err(e) => failed_before_start(&host_plan.host, e),
                    };

                    if report.status != HostStatus::Succeeded && self.settings.all_or_nothing {
                        abort.store(true, Ordering::SeqCst);
                    }
                    if let Ok(mut slots) = reports.lock() {
                        slots[idx] = Some(report);
                    }
                });
            }
        });

        let hosts: Vec<HostReport> = reports
            .into_inner()
            .unwrap_or_default()
            .into_iter()
            .flatten()
            .collect();
        let status = derive_status(&hosts);
        let summary = build_summary(&hosts, status);

        RunReport {
            tasks: plan.tasks.clone(),
            status,
            hosts,
            summary,
        }
    }
}

fn failed_before_start(host: &str, err: Error) -> HostReport {
    HostReport {
        host: host.to_string(),
        status: HostStatus::Failed,
        phase: HostPhase::Failed,
        reached: HostPhase::Prepared,
        release: None,
        failure: Some(HostFailure::from(&err)),
        steps: Vec::new(),
        hooks: Vec::new(),
        duration_ms: 0,
        error: Some(err),
    }
}

/// Reject plans whose release actions cannot run: they need `deploy_path`,
/// and actions that work on the new release need `deploy:release` first.
fn check_release_actions(steps: &[ResolvedStep], env: &Env) -> Result<()> {
    let mut has_release = false;
    for resolved in steps {
        let Step::Action { action } = &resolved.step else {
            continue;
        };
        if env.non_empty("deploy_path").is_none() {
            return Err(Error::missing_parameter(&resolved.task, "deploy_path"));
        }
        match action {
            ReleaseAction::Release => has_release = true,
            ReleaseAction::UpdateCode
            | ReleaseAction::Shared
            | ReleaseAction::Writable
            | ReleaseAction::Symlink
                if !has_release =>
            {
                return Err(Error::config_invalid_value(
                    "tasks",
                    Some(resolved.task.clone()),
                    format!(
                        "'{}' needs '{}' earlier in the pipeline",
                        action.task_name(),
                        ReleaseAction::Release.task_name()
                    ),
                ));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Per-process host locks keyed by address and deploy path.
fn host_lock(key: &str) -> Arc<Mutex<()>> {
    static LOCKS: OnceLock<Mutex<HashMap<String, Arc<Mutex<()>>>>> = OnceLock::new();
    let locks = LOCKS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut map = match locks.lock() {
        Ok(map) => map,
        Err(poisoned) => poisoned.into_inner(),
    };
    map.entry(key.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

struct HostRunner<'p, 'a> {
    pipeline: &'p Pipeline<'a>,
    executor: &'p dyn RemoteExecutor,
    host: &'p HostConfig,
    abort: &'p AtomicBool,
}

impl<'p, 'a> HostRunner<'p, 'a> {
    fn settings(&self) -> &PipelineSettings {
        self.pipeline.settings
    }

    fn run(&self, plan: &HostPlan, deadline: Option<Instant>) -> HostReport {
        let started = Instant::now();
        let mut ctx = ExecutionContext::new(self.host, self.pipeline.defaults, &plan.overrides)
            .with_deadline(deadline);

        let lock_key = format!("{}:{}", self.host.address, ctx.working_dir());
        let lock = host_lock(&lock_key);
        let _guard = match lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut reached = HostPhase::Prepared;
        let mut outcome: Result<()> = Ok(());
        let mut aborted = false;

        for resolved in &plan.steps {
            if self.abort.load(Ordering::SeqCst) {
                aborted = true;
                outcome = Err(Error::internal_unexpected(
                    "Stopped because another host failed",
                ));
                break;
            }
            if let Err(e) = self.run_step(&mut ctx, resolved) {
                outcome = Err(e);
                break;
            }
            if let Some(next) = HostPhase::after(&resolved.step, ctx.activated) {
                reached = reached.max(next);
            }
        }

        let mut hook_results = Vec::new();
        let (status, phase, error) = match outcome {
            Ok(()) => {
                log_status!("pipeline", "{} succeeded", self.host.name);
                hook_results.push(self.run_hooks(&mut ctx, HookEvent::AfterSuccess));
                (HostStatus::Succeeded, HostPhase::Succeeded, None)
            }
            Err(err) => {
                tracing::error!(
                    host = %self.host.name,
                    code = err.code.as_str(),
                    "{}",
                    err.message
                );
                let rolled_back = self.recover(&mut ctx);
                hook_results.push(self.run_hooks(&mut ctx, HookEvent::AfterFailure));
                let status = if rolled_back {
                    HostStatus::RolledBack
                } else if aborted {
                    HostStatus::Aborted
                } else {
                    HostStatus::Failed
                };
                (status, HostPhase::Failed, Some(err))
            }
        };
        hook_results.retain(|r| !r.tasks.is_empty());

        HostReport {
            host: self.host.name.clone(),
            status,
            phase,
            reached,
            release: ctx.release.clone(),
            failure: error.as_ref().map(HostFailure::from),
            hooks: hook_results,
            duration_ms: started.elapsed().as_millis() as u64,
            steps: ctx.into_log(),
            error,
        }
    }

    /// Undo what a failed run left behind. Returns true when `current` was
    /// pointed back at the previous release.
    fn recover(&self, ctx: &mut ExecutionContext) -> bool {
        let Some(layout) = ctx.layout.clone() else {
            return false;
        };
        let timeout = Duration::from_secs(self.settings().command_timeout_secs);
        let manager = ReleaseManager::new(self.executor, self.host, layout).with_timeout(timeout);

        if ctx.activated {
            if !self.settings().rollback_on_failure {
                return false;
            }
            let Some(previous) = ctx.previous.clone() else {
                return false;
            };
            return match manager.restore(&previous) {
                Ok(restored) => {
                    if let Some(release) = ctx.release.as_mut() {
                        release.status = ReleaseStatus::Failed;
                        discard_or_warn(&manager, release, &self.host.name);
                    }
                    ctx.previous = Some(restored);
                    true
                }
                Err(e) => {
                    tracing::error!(host = %self.host.name, "Rollback failed: {}", e.message);
                    false
                }
            };
        }

        if let Some(release) = ctx.release.as_mut() {
            discard_or_warn(&manager, release, &self.host.name);
        }
        false
    }

    fn run_hooks(&self, ctx: &mut ExecutionContext, event: HookEvent) -> HookRunResult {
        let graph = self.pipeline.graph;
        hooks::run_hooks(&self.settings().hooks, event, &self.host.name, |name| {
            let steps = graph.resolve(name, &ctx.env)?;
            for resolved in &steps {
                self.run_step(ctx, resolved)?;
            }
            Ok(())
        })
    }

    fn run_step(&self, ctx: &mut ExecutionContext, resolved: &ResolvedStep) -> Result<()> {
        let label = resolved.step.label();
        let requested = match &resolved.step {
            Step::Command(cmd) => cmd.timeout_secs,
            Step::Action { .. } => None,
        }
        .unwrap_or(self.settings().command_timeout_secs);
        let timeout = ctx.timeout_for(Duration::from_secs(requested));

        if ctx.deadline_passed() {
            let err = Error::command_timeout(RemoteCommandTimeoutDetails {
                command: label.clone(),
                timeout_secs: self.settings().deadline_secs.unwrap_or_default(),
                target: TargetDetails {
                    host: self.host.name.clone(),
                    address: self.host.address.clone(),
                },
            })
            .with_hint("The pipeline deadline passed before this step started");
            ctx.record(failed_entry(resolved, &label, None, &err, Duration::ZERO));
            return Err(err);
        }

        log_status!("step", "[{}] {} ({})", self.host.name, label, resolved.task);
        let started = Instant::now();

        match &resolved.step {
            Step::Command(cmd) => {
                let script = template::render_shell(&cmd.run, &ctx.template_env());
                let mut command = RemoteCommand::new(script.clone(), ctx.working_dir(), timeout);
                if cmd.tolerate_failure {
                    command = command.tolerating_failure();
                }

                match self.executor.execute(self.host, &command) {
                    Ok(output) => {
                        if !output.stdout.trim().is_empty() {
                            tracing::debug!(host = %self.host.name, step = %label, "{}", output.stdout.trim_end());
                        }
                        ctx.record(StepLogEntry {
                            task: resolved.task.clone(),
                            label,
                            command: Some(script),
                            outcome: if output.success {
                                StepOutcome::Succeeded
                            } else {
                                StepOutcome::Tolerated
                            },
                            exit_code: Some(output.exit_code),
                            duration_ms: started.elapsed().as_millis() as u64,
                            stdout: output.stdout,
                            stderr: output.stderr,
                        });
                        Ok(())
                    }
                    Err(err) => {
                        ctx.record(failed_entry(resolved, &label, Some(script), &err, started.elapsed()));
                        Err(err)
                    }
                }
            }
            Step::Action { action } => {
                let result = self.run_action(ctx, *action, timeout);
                match &result {
                    Ok(()) => ctx.record(StepLogEntry {
                        task: resolved.task.clone(),
                        label,
                        command: None,
                        outcome: StepOutcome::Succeeded,
                        exit_code: None,
                        duration_ms: started.elapsed().as_millis() as u64,
                        stdout: String::new(),
                        stderr: String::new(),
                    }),
                    Err(err) => {
                        ctx.record(failed_entry(resolved, &label, None, err, started.elapsed()))
                    }
                }
                result
            }
        }
    }

    fn run_action(
        &self,
        ctx: &mut ExecutionContext,
        action: ReleaseAction,
        timeout: Duration,
    ) -> Result<()> {
        let layout: ReleaseLayout = ctx
            .layout
            .clone()
            .ok_or_else(|| Error::missing_parameter(action.task_name(), "deploy_path"))?;
        let manager = ReleaseManager::new(self.executor, self.host, layout).with_timeout(timeout);
        let release_settings = &self.settings().release;

        match action {
            ReleaseAction::Prepare => manager.prepare(),
            ReleaseAction::Release => {
                ctx.release = Some(manager.prepare_release()?);
                Ok(())
            }
            ReleaseAction::UpdateCode => {
                let release = require_release(ctx, action)?;
                manager.update_code(
                    release,
                    &ctx.env,
                    release_settings.update_command.as_deref(),
                )
            }
            ReleaseAction::Shared => manager.link_shared(
                require_release(ctx, action)?,
                &release_settings.shared_dirs,
                &release_settings.shared_files,
            ),
            ReleaseAction::Writable => manager.make_writable(
                require_release(ctx, action)?,
                &release_settings.writable_dirs,
                &release_settings.writable_mode,
            ),
            ReleaseAction::Symlink => {
                let release = ctx
                    .release
                    .as_mut()
                    .ok_or_else(|| missing_release(action))?;
                ctx.previous = manager.activate(release)?;
                ctx.activated = true;
                Ok(())
            }
            ReleaseAction::Cleanup => {
                let keep = keep_releases(&ctx.env, release_settings.keep_releases)?;
                manager.cleanup(keep).map(|_| ())
            }
            ReleaseAction::Rollback => {
                manager.rollback()?;
                Ok(())
            }
        }
    }
}

fn discard_or_warn(manager: &ReleaseManager, release: &mut ReleaseRecord, host: &str) {
    if let Err(e) = manager.discard(release) {
        tracing::warn!(
            host = %host,
            "Could not remove failed release {}: {}",
            release.id,
            e.message
        );
        release.status = ReleaseStatus::Failed;
    }
}

fn missing_release(action: ReleaseAction) -> Error {
    Error::internal_unexpected(format!(
        "'{}' ran before a release was prepared",
        action.task_name()
    ))
}

fn require_release<'c>(ctx: &'c ExecutionContext, action: ReleaseAction) -> Result<&'c ReleaseRecord> {
    ctx.release.as_ref().ok_or_else(|| missing_release(action))
}

/// `keep_releases` from env wins over the recipe setting.
fn keep_releases(env: &Env, configured: usize) -> Result<usize> {
    match env.non_empty("keep_releases") {
        Some(raw) => raw.trim().parse::<usize>().map_err(|_| {
            Error::config_invalid_value(
                "keep_releases",
                Some(raw.to_string()),
                "expected a non-negative integer",
            )
        }),
        None => Ok(configured),
    }
}

fn failed_entry(
    resolved: &ResolvedStep,
    label: &str,
    command: Option<String>,
    err: &Error,
    elapsed: Duration,
) -> StepLogEntry {
    let details = |key: &str| {
        err.details
            .get(key)
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    StepLogEntry {
        task: resolved.task.clone(),
        label: label.to_string(),
        command,
        outcome: StepOutcome::Failed,
        exit_code: err.remote_exit_code(),
        duration_ms: elapsed.as_millis() as u64,
        stdout: details("stdout"),
        stderr: if err.code == ErrorCode::RemoteCommandFailed {
            details("stderr")
        } else {
            err.message.clone()
        },
    }
}

fn derive_status(hosts: &[HostReport]) -> RunStatus {
    let succeeded = hosts
        .iter()
        .filter(|h| h.status == HostStatus::Succeeded)
        .count();
    if succeeded == hosts.len() {
        RunStatus::Success
    } else if succeeded > 0 {
        RunStatus::PartialSuccess
    } else {
        RunStatus::Failed
    }
}

fn build_summary(hosts: &[HostReport], status: RunStatus) -> RunSummary {
    let count = |status: HostStatus| hosts.iter().filter(|h| h.status == status).count();

    let next_actions = match status {
        RunStatus::Success => Vec::new(),
        RunStatus::PartialSuccess | RunStatus::Failed => vec![
            "Fix the issue and re-run (each run prepares a fresh release)".to_string(),
            "Run 'rollout releases' to inspect what each host is serving".to_string(),
        ],
    };

    RunSummary {
        total_hosts: hosts.len(),
        succeeded: count(HostStatus::Succeeded),
        failed: count(HostStatus::Failed),
        rolled_back: count(HostStatus::RolledBack),
        aborted: count(HostStatus::Aborted),
        next_actions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::CommandOutput;
    use crate::task::Task;
    use std::sync::atomic::AtomicUsize;

    /// Records scripts and fails any script containing `fail_on`.
    struct FakeExecutor {
        calls: Mutex<Vec<(String, String)>>,
        fail_on: Option<&'static str>,
        count: AtomicUsize,
    }

    impl FakeExecutor {
        fn new(fail_on: Option<&'static str>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_on,
                count: AtomicUsize::new(0),
            }
        }

        fn scripts(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|(_, s)| s.clone()).collect()
        }
    }

    impl RemoteExecutor for FakeExecutor {
        fn execute(&self, host: &HostConfig, command: &RemoteCommand) -> Result<CommandOutput> {
            self.count.fetch_add(1, Ordering::SeqCst);
            self.calls
                .lock()
                .unwrap()
                .push((host.name.clone(), command.script.clone()));
            if matches!(self.fail_on, Some(needle) if command.script.contains(needle)) {
                return crate::ssh::classify(
                    host,
                    command,
                    CommandOutput {
                        exit_code: 1,
                        stderr: "boom".to_string(),
                        ..CommandOutput::default()
                    },
                    false,
                );
            }
            Ok(CommandOutput {
                success: true,
                ..CommandOutput::default()
            })
        }
    }

    fn registry() -> HostRegistry {
        let mut registry = HostRegistry::new();
        registry
            .register(HostConfig::new("web1", "web1.example.com", "deploy").with_env("deploy_path", "/srv/app"))
            .unwrap();
        registry
            .register(HostConfig::new("web2", "web2.example.com", "deploy").with_env("deploy_path", "/srv/app"))
            .unwrap();
        registry
    }

    fn graph() -> TaskGraph {
        let mut graph = TaskGraph::new();
        for (name, cmd) in [("one", "echo one"), ("two", "echo two"), ("three", "run-three"), ("four", "echo four"), ("five", "echo five")] {
            graph.define(Task::steps(name, vec![Step::command(cmd)])).unwrap();
        }
        graph
            .define(Task::composite(
                "all",
                ["one", "two", "three", "four", "five"].iter().map(|s| s.to_string()).collect(),
            ))
            .unwrap();
        graph
    }

    fn tasks(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn third_step_failure_stops_the_host() {
        let registry = registry();
        let graph = graph();
        let settings = PipelineSettings::default();
        let pipeline = Pipeline {
            registry: &registry,
            graph: &graph,
            defaults: &Env::new(),
            settings: &settings,
        };
        let plan = pipeline.plan(&tasks(&["all"]), &tasks(&["web1"]), &Env::new()).unwrap();
        let executor = FakeExecutor::new(Some("run-three"));

        let report = pipeline.run(&plan, &executor);

        assert_eq!(report.status, RunStatus::Failed);
        let host = &report.hosts[0];
        assert_eq!(host.status, HostStatus::Failed);
        assert_eq!(host.phase, HostPhase::Failed);
        assert_eq!(host.steps.len(), 3);
        assert_eq!(host.steps[2].outcome, StepOutcome::Failed);
        assert_eq!(executor.scripts(), vec!["echo one", "echo two", "run-three"]);
        assert_eq!(host.error.as_ref().unwrap().remote_exit_code(), Some(1));
    }

    #[test]
    fn one_failing_host_does_not_stop_the_other() {
        let registry = registry();
        let mut graph = graph();
        graph
            .define(Task::steps("on_host", vec![Step::command("check {{host}}")]))
            .unwrap();
        let settings = PipelineSettings::default();
        let pipeline = Pipeline {
            registry: &registry,
            graph: &graph,
            defaults: &Env::new(),
            settings: &settings,
        };
        let plan = pipeline.plan(&tasks(&["on_host"]), &[], &Env::new()).unwrap();
        let executor = FakeExecutor::new(Some("web1.example.com"));

        let report = pipeline.run(&plan, &executor);

        assert_eq!(report.status, RunStatus::PartialSuccess);
        assert_eq!(report.hosts[0].status, HostStatus::Failed);
        assert_eq!(report.hosts[1].status, HostStatus::Succeeded);
        assert_eq!(report.summary.failed, 1);
    }

    #[test]
    fn missing_parameter_fails_before_any_remote_call() {
        let registry = registry();
        let mut graph = graph();
        graph
            .define(
                Task::steps("new_instance", vec![Step::command("bin/instance create {{instance}}")])
                    .requiring("instance"),
            )
            .unwrap();
        let settings = PipelineSettings::default();
        let pipeline = Pipeline {
            registry: &registry,
            graph: &graph,
            defaults: &Env::new(),
            settings: &settings,
        };

        let err = pipeline
            .plan(&tasks(&["new_instance"]), &[], &Env::new())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationMissingParameter);
    }

    #[test]
    fn release_actions_need_deploy_release_first() {
        let mut registry = HostRegistry::new();
        registry
            .register(HostConfig::new("web", "web.example.com", "deploy").with_env("deploy_path", "/srv/app"))
            .unwrap();
        let graph = TaskGraph::with_builtins();
        let settings = PipelineSettings::default();
        let pipeline = Pipeline {
            registry: &registry,
            graph: &graph,
            defaults: &Env::new(),
            settings: &settings,
        };

        let err = pipeline
            .plan(&tasks(&["deploy:symlink"]), &[], &Env::new())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigInvalidValue);
    }

    #[test]
    fn release_actions_need_deploy_path() {
        let mut registry = HostRegistry::new();
        registry
            .register(HostConfig::new("web", "web.example.com", "deploy"))
            .unwrap();
        let graph = TaskGraph::with_builtins();
        let settings = PipelineSettings::default();
        let pipeline = Pipeline {
            registry: &registry,
            graph: &graph,
            defaults: &Env::new(),
            settings: &settings,
        };

        let err = pipeline
            .plan(&tasks(&["deploy:prepare"]), &[], &Env::new())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationMissingParameter);
    }

    #[test]
    fn all_or_nothing_stops_remaining_hosts() {
        let registry = registry();
        let graph = graph();
        let settings = PipelineSettings {
            parallel: Some(1),
            all_or_nothing: true,
            ..PipelineSettings::default()
        };
        let pipeline = Pipeline {
            registry: &registry,
            graph: &graph,
            defaults: &Env::new(),
            settings: &settings,
        };
        let plan = pipeline.plan(&tasks(&["all"]), &[], &Env::new()).unwrap();
        let executor = FakeExecutor::new(Some("run-three"));

        let report = pipeline.run(&plan, &executor);

        assert_eq!(report.hosts[0].status, HostStatus::Failed);
        assert_eq!(report.hosts[1].status, HostStatus::Aborted);
        assert!(report.hosts[1].steps.is_empty());
        assert_eq!(executor.count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn after_failure_hooks_run_and_success_hooks_do_not() {
        let registry = registry();
        let mut graph = graph();
        graph
            .define(Task::steps("alert", vec![Step::command("notify-failure")]))
            .unwrap();
        graph
            .define(Task::steps("celebrate", vec![Step::command("notify-success")]))
            .unwrap();
        let settings = PipelineSettings {
            hooks: Hooks {
                after_success: vec!["celebrate".to_string()],
                after_failure: vec!["alert".to_string()],
            },
            ..PipelineSettings::default()
        };
        let pipeline = Pipeline {
            registry: &registry,
            graph: &graph,
            defaults: &Env::new(),
            settings: &settings,
        };
        let plan = pipeline.plan(&tasks(&["three"]), &tasks(&["web1"]), &Env::new()).unwrap();
        let executor = FakeExecutor::new(Some("run-three"));

        let report = pipeline.run(&plan, &executor);

        assert_eq!(executor.scripts(), vec!["run-three", "notify-failure"]);
        assert_eq!(report.hosts[0].hooks[0].event, HookEvent::AfterFailure);
    }

    #[test]
    fn failing_success_hook_keeps_host_succeeded() {
        let registry = registry();
        let mut graph = graph();
        graph
            .define(Task::steps("celebrate", vec![Step::command("notify-success")]))
            .unwrap();
        let settings = PipelineSettings {
            hooks: Hooks {
                after_success: vec!["celebrate".to_string()],
                after_failure: Vec::new(),
            },
            ..PipelineSettings::default()
        };
        let pipeline = Pipeline {
            registry: &registry,
            graph: &graph,
            defaults: &Env::new(),
            settings: &settings,
        };
        let plan = pipeline.plan(&tasks(&["one"]), &tasks(&["web1"]), &Env::new()).unwrap();
        let executor = FakeExecutor::new(Some("notify-success"));

        let report = pipeline.run(&plan, &executor);

        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.hosts[0].status, HostStatus::Succeeded);
        assert!(!report.hosts[0].hooks[0].all_succeeded);
    }

    #[test]
    fn phases_only_move_forward() {
        let step = |action| Step::Action { action };
        assert_eq!(HostPhase::after(&step(ReleaseAction::Symlink), true), Some(HostPhase::Symlinked));
        assert_eq!(HostPhase::after(&Step::command("x"), false), None);
        assert_eq!(HostPhase::after(&Step::command("x"), true), Some(HostPhase::TaskHooksRunning));
        assert!(HostPhase::Symlinked.max(HostPhase::Prepared) == HostPhase::Symlinked);
    }

    #[test]
    fn keep_releases_override_must_be_numeric() {
        let env: Env = [("keep_releases", "3")].into_iter().collect();
        assert_eq!(keep_releases(&env, 5).unwrap(), 3);
        assert_eq!(keep_releases(&Env::new(), 5).unwrap(), 5);

        let bad: Env = [("keep_releases", "lots")].into_iter().collect();
        assert!(keep_releases(&bad, 5).is_err());
    }

    #[test]
    fn deadline_stops_the_running_command_and_the_rest_of_the_host() {
        let mut registry = HostRegistry::new();
        registry
            .register(HostConfig::new("local", "localhost", "deploy"))
            .unwrap();
        let mut graph = TaskGraph::new();
        graph
            .define(Task::steps(
                "slow",
                vec![Step::command("sleep 30"), Step::command("echo after")],
            ))
            .unwrap();
        let settings = PipelineSettings {
            deadline_secs: Some(1),
            ..PipelineSettings::default()
        };
        let pipeline = Pipeline {
            registry: &registry,
            graph: &graph,
            defaults: &Env::new(),
            settings: &settings,
        };
        let plan = pipeline.plan(&tasks(&["slow"]), &[], &Env::new()).unwrap();

        let started = Instant::now();
        let report = pipeline.run(&plan, &crate::ssh::SshExecutor::default());

        assert!(started.elapsed() < Duration::from_secs(10));
        let host = &report.hosts[0];
        assert_eq!(host.status, HostStatus::Failed);
        assert_eq!(host.error.as_ref().unwrap().code, ErrorCode::RemoteCommandTimeout);
        assert_eq!(host.steps.len(), 1);
        assert_eq!(host.steps[0].label, "sleep 30");
    }
}
