use clap::Args;

use rollout::env::Env;
use rollout::pipeline::{Pipeline, RunReport};
use rollout::ssh::SshExecutor;
use rollout::task::ReleaseAction;

use super::run::effective_settings;
use super::{exit_code_for_report, CmdResult, GlobalArgs, HostSelection};

#[derive(Args)]
pub struct RollbackArgs {
    #[command(flatten)]
    pub selection: HostSelection,

    /// Maximum hosts rolled back at once
    #[arg(long, value_name = "N")]
    pub parallel: Option<usize>,
}

/// Point `current` back at the previous release on each selected host.
pub fn run(args: RollbackArgs, global: &GlobalArgs) -> CmdResult<RunReport> {
    let recipe = global.load_recipe()?;
    let mut settings = effective_settings(&recipe, args.parallel, false, None)?;
    // Lifecycle hooks only run around deploys.
    settings.hooks = Default::default();

    let pipeline = Pipeline {
        registry: &recipe.registry,
        graph: &recipe.graph,
        defaults: &recipe.defaults,
        settings: &settings,
    };
    let tasks = vec![ReleaseAction::Rollback.task_name().to_string()];
    let plan = pipeline.plan(&tasks, &args.selection.hosts, &Env::new())?;
    let report = pipeline.run(&plan, &SshExecutor::default());

    let exit_code = exit_code_for_report(&report);
    Ok((report, exit_code))
}
