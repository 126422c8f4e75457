use clap::Args;
use serde::Serialize;

use rollout::recipe::HostSummary;

use super::{CmdResult, GlobalArgs};

#[derive(Args)]
pub struct HostsArgs {}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostsOutput {
    pub recipe: String,
    pub hosts: Vec<HostSummary>,
}

pub fn run(_args: HostsArgs, global: &GlobalArgs) -> CmdResult<HostsOutput> {
    let recipe = global.load_recipe()?;
    Ok((
        HostsOutput {
            hosts: recipe.host_summaries(),
            recipe: recipe.source,
        },
        0,
    ))
}
