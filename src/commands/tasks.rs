use clap::Args;
use serde::Serialize;

use rollout::task::TaskSummary;

use super::{CmdResult, GlobalArgs};

#[derive(Args)]
pub struct TasksArgs {}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TasksOutput {
    pub recipe: String,
    pub tasks: Vec<TaskSummary>,
}

/// Built-in and recipe tasks, in definition order.
pub fn run(_args: TasksArgs, global: &GlobalArgs) -> CmdResult<TasksOutput> {
    let recipe = global.load_recipe()?;
    Ok((
        TasksOutput {
            tasks: recipe.graph.summaries(),
            recipe: recipe.source,
        },
        0,
    ))
}
