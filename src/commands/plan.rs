use clap::Args;

use rollout::pipeline::PipelinePlan;

use super::{CmdResult, GlobalArgs, HostSelection};

#[derive(Args)]
pub struct PlanArgs {
    /// Task to expand
    pub task: String,

    #[command(flatten)]
    pub selection: HostSelection,

    /// Invocation overrides, as for `run`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub overrides: Vec<String>,
}

/// Resolve a task for each selected host without touching any host.
pub fn run(args: PlanArgs, global: &GlobalArgs) -> CmdResult<PipelinePlan> {
    let recipe = global.load_recipe()?;
    let overrides = recipe.options.parse_overrides(&args.overrides)?;

    let mut tasks = vec![args.task];
    tasks.extend(overrides.extra_tasks);

    let plan = recipe
        .pipeline()
        .plan(&tasks, &args.selection.hosts, &overrides.env)?;
    Ok((plan, 0))
}
