use clap::Args;

use rollout::pipeline::{Pipeline, PipelineSettings, RunReport};
use rollout::recipe::Recipe;
use rollout::ssh::SshExecutor;

use super::{exit_code_for_report, CmdResult, GlobalArgs, HostSelection};

#[derive(Args)]
pub struct RunArgs {
    /// Task to run (e.g. deploy)
    pub task: String,

    #[command(flatten)]
    pub selection: HostSelection,

    /// Maximum hosts deployed at once
    #[arg(long, value_name = "N")]
    pub parallel: Option<usize>,

    /// Stop every host as soon as one host fails
    #[arg(long)]
    pub all_or_nothing: bool,

    /// Overall time budget in seconds
    #[arg(long, value_name = "SECS")]
    pub deadline: Option<u64>,

    /// Invocation overrides: --key=value, --flag, --tasks=a,b
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub overrides: Vec<String>,
}

/// Recipe settings with command-line flags applied on top.
pub(crate) fn effective_settings(
    recipe: &Recipe,
    parallel: Option<usize>,
    all_or_nothing: bool,
    deadline: Option<u64>,
) -> rollout::Result<PipelineSettings> {
    if parallel == Some(0) {
        return Err(rollout::Error::validation_invalid_argument(
            "parallel",
            "--parallel must be at least 1",
        ));
    }

    let mut settings = recipe.settings.clone();
    if parallel.is_some() {
        settings.parallel = parallel;
    }
    settings.all_or_nothing |= all_or_nothing;
    if deadline.is_some() {
        settings.deadline_secs = deadline;
    }
    Ok(settings)
}

pub fn run(args: RunArgs, global: &GlobalArgs) -> CmdResult<RunReport> {
    let recipe = global.load_recipe()?;
    let overrides = recipe.options.parse_overrides(&args.overrides)?;
    let settings = effective_settings(&recipe, args.parallel, args.all_or_nothing, args.deadline)?;

    let mut tasks = vec![args.task];
    tasks.extend(overrides.extra_tasks);

    let pipeline = Pipeline {
        registry: &recipe.registry,
        graph: &recipe.graph,
        defaults: &recipe.defaults,
        settings: &settings,
    };
    let plan = pipeline.plan(&tasks, &args.selection.hosts, &overrides.env)?;
    let report = pipeline.run(&plan, &SshExecutor::default());

    let exit_code = exit_code_for_report(&report);
    Ok((report, exit_code))
}
