//! Recipe loading.
//!
//! A recipe is one JSON document declaring hosts, defaults, the option
//! schema, release settings, tasks and hooks:
//!
//! ```json
//! {
//!   "defaults": { "branch": "master" },
//!   "options": { "instance": { "type": "string" } },
//!   "hosts": {
//!     "prod": { "address": "example.com", "user": "deploy",
//!               "env": { "deploy_path": "/var/www/example.com" } }
//!   },
//!   "release": { "keepReleases": 5, "sharedDirs": ["var/log"] },
//!   "tasks": {
//!     "migrate": { "steps": ["php {{release_path}}/bin/migrations.php migrate"] },
//!     "deploy": { "subtasks": ["deploy:prepare", "deploy:release", "migrate"] }
//!   },
//!   "hooks": { "afterFailure": ["notify"] }
//! }
//! ```
//!
//! Hosts are registered in name order. Everything is validated on load, so
//! a recipe that loads can be planned without further configuration errors
//! other than invocation-specific ones (parameters, host selection).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::env::Env;
use crate::error::{Error, Result};
use crate::hooks::Hooks;
use crate::host::{HostConfig, HostRegistry};
use crate::options::OptionSchema;
use crate::pipeline::{Pipeline, PipelineSettings, ReleaseSettings};
use crate::task::{CommandStep, ReleaseAction, Step, Task, TaskGraph};
use crate::utils::io;

pub const DEFAULT_RECIPE_FILE: &str = "rollout.json";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRecipe {
    #[serde(default)]
    defaults: Env,
    #[serde(default)]
    options: OptionSchema,
    #[serde(default)]
    hosts: BTreeMap<String, HostConfig>,
    #[serde(default)]
    release: ReleaseSettings,
    #[serde(default)]
    settings: RawSettings,
    #[serde(default)]
    tasks: BTreeMap<String, RawTask>,
    #[serde(default)]
    hooks: Hooks,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSettings {
    parallel: Option<usize>,
    #[serde(default)]
    all_or_nothing: bool,
    rollback_on_failure: Option<bool>,
    command_timeout_secs: Option<u64>,
    deadline_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTask {
    description: Option<String>,
    #[serde(default)]
    requires: Vec<String>,
    steps: Option<Vec<RawStep>>,
    subtasks: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawStep {
    Run(String),
    Action { action: ReleaseAction },
    Command(CommandStep),
}

impl From<RawStep> for Step {
    fn from(raw: RawStep) -> Self {
        match raw {
            RawStep::Run(run) => Step::command(run),
            RawStep::Action { action } => Step::Action { action },
            RawStep::Command(cmd) => Step::Command(cmd),
        }
    }
}

/// A loaded, validated recipe.
#[derive(Debug, Clone)]
pub struct Recipe {
    pub source: String,
    /// Declared option defaults overlaid with the recipe's `defaults`.
    pub defaults: Env,
    pub options: OptionSchema,
    pub registry: HostRegistry,
    pub graph: TaskGraph,
    pub settings: PipelineSettings,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostSummary {
    pub name: String,
    pub address: String,
    pub user: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deploy_path: Option<String>,
}

impl Recipe {
    pub fn load(path: &Path) -> Result<Self> {
        let content = io::read_file(path, &format!("read recipe {}", path.display()))?;
        Self::from_json(&content, &path.display().to_string())
    }

    pub fn from_json(content: &str, source: &str) -> Result<Self> {
        let raw: RawRecipe =
            serde_json::from_str(content).map_err(|e| Error::config_invalid_json(source, e))?;

        raw.options.validate()?;
        let defaults = raw.options.defaults()?.merged_with(&raw.defaults);

        let mut registry = HostRegistry::new();
        for (name, mut host) in raw.hosts {
            host.name = name;
            if !host.is_valid() {
                return Err(Error::config_invalid_value(
                    format!("hosts.{}", host.name),
                    Some(host.address.clone()),
                    "host needs a non-empty address and user",
                ));
            }
            registry.register(host)?;
        }

        let mut graph = TaskGraph::with_builtins();
        for (name, raw_task) in raw.tasks {
            graph.define(build_task(name, raw_task)?)?;
        }
        graph.validate()?;

        for name in raw.hooks.after_success.iter().chain(&raw.hooks.after_failure) {
            if !graph.contains(name) {
                return Err(Error::config_invalid_value(
                    "hooks",
                    Some(name.clone()),
                    "hook names an undefined task",
                ));
            }
        }

        for (key, paths) in [
            ("release.sharedDirs", &raw.release.shared_dirs),
            ("release.sharedFiles", &raw.release.shared_files),
            ("release.writableDirs", &raw.release.writable_dirs),
        ] {
            for path in paths {
                check_relative(key, path)?;
            }
        }

        let defaults_settings = PipelineSettings::default();
        let settings = PipelineSettings {
            parallel: raw.settings.parallel,
            all_or_nothing: raw.settings.all_or_nothing,
            rollback_on_failure: raw
                .settings
                .rollback_on_failure
                .unwrap_or(defaults_settings.rollback_on_failure),
            command_timeout_secs: raw
                .settings
                .command_timeout_secs
                .unwrap_or(defaults_settings.command_timeout_secs),
            deadline_secs: raw.settings.deadline_secs,
            release: raw.release,
            hooks: raw.hooks,
        };
        if settings.parallel == Some(0) {
            return Err(Error::config_invalid_value(
                "settings.parallel",
                Some("0".to_string()),
                "must be at least 1",
            ));
        }

        tracing::debug!(
            source = source,
            hosts = registry.len(),
            "loaded recipe"
        );

        Ok(Self {
            source: source.to_string(),
            defaults,
            options: raw.options,
            registry,
            graph,
            settings,
        })
    }

    pub fn pipeline(&self) -> Pipeline<'_> {
        Pipeline {
            registry: &self.registry,
            graph: &self.graph,
            defaults: &self.defaults,
            settings: &self.settings,
        }
    }

    pub fn host_summaries(&self) -> Vec<HostSummary> {
        self.registry
            .iter()
            .map(|host| HostSummary {
                name: host.name.clone(),
                address: host.address.clone(),
                user: host.user.clone(),
                port: host.port,
                deploy_path: host
                    .resolve_env(&self.defaults, &Env::new())
                    .non_empty("deploy_path")
                    .map(str::to_string),
            })
            .collect()
    }
}

fn build_task(name: String, raw: RawTask) -> Result<Task> {
    let mut task = match (raw.steps, raw.subtasks) {
        (Some(steps), None) => Task::steps(name, steps.into_iter().map(Step::from).collect()),
        (None, Some(subtasks)) => Task::composite(name, subtasks),
        _ => {
            return Err(Error::config_invalid_value(
                format!("tasks.{}", name),
                None,
                "a task declares exactly one of 'steps' or 'subtasks'",
            ))
        }
    };
    for parameter in raw.requires {
        task = task.requiring(parameter);
    }
    if let Some(description) = raw.description {
        task = task.described(description);
    }
    Ok(task)
}

/// Shared and writable paths live inside the release; they must be relative
/// and stay below it.
fn check_relative(key: &str, path: &str) -> Result<()> {
    let escapes = path.split('/').any(|segment| segment == "..");
    if path.trim().is_empty() || path.starts_with('/') || escapes {
        return Err(Error::config_invalid_value(
            key,
            Some(path.to_string()),
            "expected a relative path inside the release",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    const RECIPE: &str = r#"{
        "defaults": { "branch": "master" },
        "options": {
            "fixtures": { "type": "bool", "default": false },
            "instance": { "type": "string", "description": "Instance to create" }
        },
        "hosts": {
            "prod": {
                "address": "azzryel.com",
                "user": "root",
                "identityRef": "~/.ssh/deploy",
                "env": { "deploy_path": "/var/www/azzryel.com", "branch": "prod" }
            }
        },
        "release": { "keepReleases": 3, "sharedDirs": ["var/log"], "sharedFiles": ["config/conf.php"] },
        "settings": { "parallel": 2, "rollbackOnFailure": false },
        "tasks": {
            "migrate": { "steps": [
                "php {{release_path}}/bin/migrations.php migrate",
                { "run": "php {{release_path}}/bin/cache.php warm", "tolerateFailure": true }
            ] },
            "new_instance": {
                "requires": ["instance"],
                "steps": ["php {{current_path}}/bin/instance.php create {{instance}}"]
            },
            "deploy": { "subtasks": ["deploy:prepare", "deploy:release", "deploy:shared", "deploy:symlink", "migrate", "cleanup"] },
            "notify": { "steps": [{ "action": "cleanup" }] }
        },
        "hooks": { "afterFailure": ["notify"] }
    }"#;

    #[test]
    fn loads_hosts_tasks_and_settings() {
        let recipe = Recipe::from_json(RECIPE, "rollout.json").unwrap();

        let prod = recipe.registry.resolve("prod").unwrap();
        assert_eq!(prod.port, 22);
        assert_eq!(prod.identity_ref.as_deref(), Some("~/.ssh/deploy"));
        assert_eq!(recipe.defaults.get("fixtures"), Some("false"));
        assert_eq!(recipe.defaults.get("branch"), Some("master"));

        assert_eq!(recipe.settings.release.keep_releases, 3);
        assert_eq!(recipe.settings.parallel, Some(2));
        assert!(!recipe.settings.rollback_on_failure);
        assert_eq!(recipe.settings.command_timeout_secs, 300);
        assert_eq!(recipe.settings.hooks.after_failure, vec!["notify"]);

        let migrate = recipe.graph.get("migrate").unwrap();
        assert!(matches!(migrate.body, crate::task::TaskBody::Steps(_)));
        assert!(recipe.graph.contains("deploy:symlink"));
    }

    #[test]
    fn host_env_beats_recipe_defaults() {
        let recipe = Recipe::from_json(RECIPE, "rollout.json").unwrap();
        let prod = recipe.registry.resolve("prod").unwrap();
        let env = prod.resolve_env(&recipe.defaults, &Env::new());
        assert_eq!(env.get("branch"), Some("prod"));

        let summaries = recipe.host_summaries();
        assert_eq!(summaries[0].deploy_path.as_deref(), Some("/var/www/azzryel.com"));
    }

    #[test]
    fn deploy_plan_expands_builtins() {
        let recipe = Recipe::from_json(RECIPE, "rollout.json").unwrap();
        let plan = recipe
            .pipeline()
            .plan(&["deploy".to_string()], &[], &Env::new())
            .unwrap();

        let labels: Vec<String> = plan.hosts[0].steps.iter().map(|s| s.step.label()).collect();
        assert_eq!(labels[0], "deploy:prepare");
        assert_eq!(labels[3], "deploy:symlink");
        assert_eq!(labels.len(), 7);
        assert_eq!(labels[6], "cleanup");
    }

    #[test]
    fn invalid_json_is_reported_with_source() {
        let err = Recipe::from_json("{ not json", "broken.json").unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigInvalidJson);
        assert_eq!(err.details["path"], "broken.json");
    }

    #[test]
    fn task_with_steps_and_subtasks_is_rejected() {
        let json = r#"{ "tasks": { "bad": { "steps": ["true"], "subtasks": ["cleanup"] } } }"#;
        let err = Recipe::from_json(json, "rollout.json").unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigInvalidValue);
    }

    #[test]
    fn cyclic_recipe_is_rejected_on_load() {
        let json = r#"{ "tasks": {
            "a": { "subtasks": ["b"] },
            "b": { "subtasks": ["a"] }
        } }"#;
        let err = Recipe::from_json(json, "rollout.json").unwrap_err();
        assert_eq!(err.code, ErrorCode::TaskCyclic);
    }

    #[test]
    fn redefining_a_builtin_is_a_duplicate() {
        let json = r#"{ "tasks": { "cleanup": { "steps": ["true"] } } }"#;
        let err = Recipe::from_json(json, "rollout.json").unwrap_err();
        assert_eq!(err.code, ErrorCode::TaskDuplicate);
    }

    #[test]
    fn shared_paths_must_stay_inside_release() {
        let json = r#"{ "release": { "sharedDirs": ["../etc"] } }"#;
        let err = Recipe::from_json(json, "rollout.json").unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigInvalidValue);

        let json = r#"{ "release": { "sharedFiles": ["/etc/passwd"] } }"#;
        assert!(Recipe::from_json(json, "rollout.json").is_err());
    }

    #[test]
    fn hooks_must_name_defined_tasks() {
        let json = r#"{ "hooks": { "afterSuccess": ["missing"] } }"#;
        let err = Recipe::from_json(json, "rollout.json").unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigInvalidValue);
    }

    #[test]
    fn missing_recipe_file_is_an_io_error() {
        let err = Recipe::load(Path::new("/nonexistent/rollout.json")).unwrap_err();
        assert_eq!(err.code, ErrorCode::InternalIoError);
    }

    #[test]
    fn demo_recipe_loads_and_plans() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/rollout.json");
        let recipe = Recipe::load(&path).unwrap();

        assert_eq!(recipe.registry.names(), vec!["prod", "staging"]);
        assert_eq!(recipe.defaults.get("skip_migrations"), Some("false"));

        let plan = recipe
            .pipeline()
            .plan(&["deploy".to_string()], &["staging".to_string()], &Env::new())
            .unwrap();
        assert_eq!(plan.hosts.len(), 1);
        assert_eq!(plan.hosts[0].steps.len(), 10);
    }
}
