use clap::Args;
use std::path::PathBuf;

use rollout::recipe::Recipe;

pub type CmdResult<T> = rollout::Result<(T, i32)>;

pub(crate) struct GlobalArgs {
    pub recipe: PathBuf,
}

impl GlobalArgs {
    pub fn load_recipe(&self) -> rollout::Result<Recipe> {
        Recipe::load(&self.recipe)
    }
}

/// Shared host selection. Empty means every host in the recipe.
#[derive(Args, Default, Debug)]
pub struct HostSelection {
    /// Hosts to target, comma separated (default: all)
    #[arg(long = "on", value_name = "HOST", value_delimiter = ',')]
    pub hosts: Vec<String>,
}

/// Exit code for a finished run: 0 when every host succeeded, otherwise the
/// class of the first real failure.
pub(crate) fn exit_code_for_report(report: &rollout::pipeline::RunReport) -> i32 {
    report
        .first_error()
        .map(|err| crate::output::exit_code_for_error(err.code))
        .unwrap_or(0)
}

pub mod hosts;
pub mod plan;
pub mod releases;
pub mod rollback;
pub mod run;
pub mod tasks;

/// Dispatch a command to its handler and map result to JSON.
macro_rules! dispatch {
    ($args:expr, $global:expr, $module:ident) => {
        crate::output::map_cmd_result_to_json($module::run($args, $global))
    };
}

pub(crate) fn run_json(
    command: crate::Commands,
    global: &GlobalArgs,
) -> (rollout::Result<serde_json::Value>, i32) {
    crate::tty::status("rollout is working...");

    match command {
        crate::Commands::Run(args) => dispatch!(args, global, run),
        crate::Commands::Rollback(args) => dispatch!(args, global, rollback),
        crate::Commands::Releases(args) => dispatch!(args, global, releases),
        crate::Commands::Plan(args) => dispatch!(args, global, plan),
        crate::Commands::Hosts(args) => dispatch!(args, global, hosts),
        crate::Commands::Tasks(args) => dispatch!(args, global, tasks),
    }
}
