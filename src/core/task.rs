//! Named tasks and their resolution into a flat, ordered step list.
//!
//! A task is either a list of steps or a list of other task names. Resolution
//! walks composites depth-first in declaration order, so
//! `deploy = [deploy:prepare, deploy:release, ..., cleanup]` yields the leaf
//! steps of each subtask in turn.

use serde::{Deserialize, Serialize};

use crate::env::Env;
use crate::error::{Error, Result};
use crate::utils::template::{self, TemplateVars};

/// Release directory operations that are available as built-in tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseAction {
    Prepare,
    Release,
    UpdateCode,
    Shared,
    Writable,
    Symlink,
    Cleanup,
    Rollback,
}

impl ReleaseAction {
    pub fn all() -> &'static [ReleaseAction] {
        &[
            ReleaseAction::Prepare,
            ReleaseAction::Release,
            ReleaseAction::UpdateCode,
            ReleaseAction::Shared,
            ReleaseAction::Writable,
            ReleaseAction::Symlink,
            ReleaseAction::Cleanup,
            ReleaseAction::Rollback,
        ]
    }

    pub fn task_name(&self) -> &'static str {
        match self {
            ReleaseAction::Prepare => "deploy:prepare",
            ReleaseAction::Release => "deploy:release",
            ReleaseAction::UpdateCode => "deploy:update_code",
            ReleaseAction::Shared => "deploy:shared",
            ReleaseAction::Writable => "deploy:writable",
            ReleaseAction::Symlink => "deploy:symlink",
            ReleaseAction::Cleanup => "cleanup",
            ReleaseAction::Rollback => "rollback",
        }
    }

    fn description(&self) -> &'static str {
        match self {
            ReleaseAction::Prepare => "Create the releases and shared directories",
            ReleaseAction::Release => "Create a new release directory",
            ReleaseAction::UpdateCode => "Check out the repository into the release",
            ReleaseAction::Shared => "Link shared files and directories into the release",
            ReleaseAction::Writable => "Make writable directories writable",
            ReleaseAction::Symlink => "Point current at the new release",
            ReleaseAction::Cleanup => "Remove old releases",
            ReleaseAction::Rollback => "Point current back at the previous release",
        }
    }
}

/// A shell command template with per-step options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandStep {
    pub run: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub tolerate_failure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl CommandStep {
    pub fn new(run: impl Into<String>) -> Self {
        Self {
            run: run.into(),
            label: None,
            tolerate_failure: false,
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Step {
    Command(CommandStep),
    Action { action: ReleaseAction },
}

impl Step {
    pub fn command(run: impl Into<String>) -> Self {
        Step::Command(CommandStep::new(run))
    }

    pub fn label(&self) -> String {
        match self {
            Step::Command(cmd) => cmd.label.clone().unwrap_or_else(|| cmd.run.clone()),
            Step::Action { action } => action.task_name().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskBody {
    Steps(Vec<Step>),
    Subtasks(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub name: String,
    pub description: Option<String>,
    /// Parameters that must be set and non-empty whenever this task is part
    /// of a resolved pipeline.
    pub requires: Vec<String>,
    pub body: TaskBody,
}

impl Task {
    pub fn steps(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            description: None,
            requires: Vec::new(),
            body: TaskBody::Steps(steps),
        }
    }

    pub fn composite(name: impl Into<String>, subtasks: Vec<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            requires: Vec::new(),
            body: TaskBody::Subtasks(subtasks),
        }
    }

    pub fn requiring(mut self, parameter: impl Into<String>) -> Self {
        self.requires.push(parameter.into());
        self
    }

    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A leaf step together with the task that contributed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedStep {
    pub task: String,
    pub step: Step,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub subtasks: Vec<String>,
    pub steps: usize,
}

#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    tasks: Vec<Task>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Graph with every `ReleaseAction` registered under its task name.
    pub fn with_builtins() -> Self {
        let mut graph = Self::new();
        for action in ReleaseAction::all() {
            graph.tasks.push(
                Task::steps(action.task_name(), vec![Step::Action { action: *action }])
                    .described(action.description()),
            );
        }
        graph
    }

    pub fn define(&mut self, task: Task) -> Result<()> {
        if self.contains(&task.name) {
            return Err(Error::duplicate_task(task.name));
        }
        self.tasks.push(task);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.iter().any(|t| t.name == name)
    }

    pub fn get(&self, name: &str) -> Result<&Task> {
        self.tasks
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| Error::unknown_task(name, self.names()))
    }

    pub fn names(&self) -> Vec<String> {
        self.tasks.iter().map(|t| t.name.clone()).collect()
    }

    /// Check every task expands without cycles or dangling references.
    /// Parameters are not checked here; they depend on the invocation.
    pub fn validate(&self) -> Result<()> {
        for task in &self.tasks {
            let mut path = Vec::new();
            self.walk(&task.name, &mut path, &mut |_: &Task, _: &Step| Ok(()))?;
        }
        Ok(())
    }

    /// Expand `name` into its leaf steps, checking declared parameters and
    /// template placeholders against `env`.
    pub fn resolve(&self, name: &str, env: &Env) -> Result<Vec<ResolvedStep>> {
        self.resolve_all(&[name.to_string()], env)
    }

    /// Expand several tasks in order as one pipeline.
    pub fn resolve_all(&self, names: &[String], env: &Env) -> Result<Vec<ResolvedStep>> {
        let mut resolved = Vec::new();
        for name in names {
            let mut path = Vec::new();
            self.walk(name, &mut path, &mut |task: &Task, step: &Step| {
                check_placeholders(task, step, env)?;
                resolved.push(ResolvedStep {
                    task: task.name.clone(),
                    step: step.clone(),
                });
                Ok(())
            })?;
        }

        // Requirements are checked for every expanded task, composite or leaf.
        for name in names {
            let mut path = Vec::new();
            self.check_requirements(name, env, &mut path)?;
        }

        Ok(resolved)
    }

    fn walk<F>(&self, name: &str, path: &mut Vec<String>, visit: &mut F) -> Result<()>
    where
        F: FnMut(&Task, &Step) -> Result<()>,
    {
        if let Some(start) = path.iter().position(|p| p == name) {
            let mut cycle: Vec<String> = path[start..].to_vec();
            cycle.push(name.to_string());
            return Err(Error::cyclic_task(cycle));
        }

        let task = self.get(name)?;
        path.push(name.to_string());

        match &task.body {
            TaskBody::Steps(steps) => {
                for step in steps {
                    visit(task, step)?;
                }
            }
            TaskBody::Subtasks(children) => {
                for child in children {
                    self.walk(child, path, visit)?;
                }
            }
        }

        path.pop();
        Ok(())
    }

    fn check_requirements(&self, name: &str, env: &Env, path: &mut Vec<String>) -> Result<()> {
        let task = self.get(name)?;
        for parameter in &task.requires {
            if env.non_empty(parameter).is_none() {
                return Err(Error::missing_parameter(&task.name, parameter));
            }
        }
        if let TaskBody::Subtasks(children) = &task.body {
            path.push(name.to_string());
            for child in children {
                // Cycles were rejected by `walk` already.
                if !path.contains(child) {
                    self.check_requirements(child, env, path)?;
                }
            }
            path.pop();
        }
        Ok(())
    }

    pub fn summaries(&self) -> Vec<TaskSummary> {
        self.tasks
            .iter()
            .map(|task| {
                let (subtasks, steps) = match &task.body {
                    TaskBody::Steps(steps) => (Vec::new(), steps.len()),
                    TaskBody::Subtasks(children) => (children.clone(), 0),
                };
                TaskSummary {
                    name: task.name.clone(),
                    description: task.description.clone(),
                    requires: task.requires.clone(),
                    subtasks,
                    steps,
                }
            })
            .collect()
    }
}

fn check_placeholders(task: &Task, step: &Step, env: &Env) -> Result<()> {
    let Step::Command(cmd) = step else {
        return Ok(());
    };
    for key in template::placeholders(&cmd.run) {
        if !env.contains(&key) && !TemplateVars::runtime().contains(&key.as_str()) {
            return Err(Error::missing_parameter(&task.name, key));
        }
    }
    Ok(())
}
