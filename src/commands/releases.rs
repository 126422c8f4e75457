use clap::Args;
use serde::Serialize;
use std::time::Duration;

use rollout::env::Env;
use rollout::pipeline::HostFailure;
use rollout::release::{ReleaseEntry, ReleaseLayout, ReleaseManager};
use rollout::ssh::SshExecutor;

use super::{CmdResult, GlobalArgs, HostSelection};

#[derive(Args)]
pub struct ReleasesArgs {
    #[command(flatten)]
    pub selection: HostSelection,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostReleases {
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<String>,
    pub releases: Vec<ReleaseEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<HostFailure>,
}

/// List releases on each selected host, oldest first.
pub fn run(args: ReleasesArgs, global: &GlobalArgs) -> CmdResult<Vec<HostReleases>> {
    let recipe = global.load_recipe()?;
    let hosts = recipe.registry.select(&args.selection.hosts)?;
    let executor = SshExecutor::default();
    let timeout = Duration::from_secs(recipe.settings.command_timeout_secs);

    let mut output = Vec::with_capacity(hosts.len());
    let mut exit_code = 0;

    for host in hosts {
        let env = host.resolve_env(&recipe.defaults, &Env::new());
        let deploy_path = env
            .non_empty("deploy_path")
            .ok_or_else(|| rollout::Error::missing_parameter("releases", "deploy_path"))?;
        let manager = ReleaseManager::new(&executor, host, ReleaseLayout::new(deploy_path))
            .with_timeout(timeout);

        match manager.list() {
            Ok(releases) => output.push(HostReleases {
                host: host.name.clone(),
                current: releases.iter().find(|r| r.active).map(|r| r.id.clone()),
                releases,
                failure: None,
            }),
            Err(err) => {
                if exit_code == 0 {
                    exit_code = crate::output::exit_code_for_error(err.code);
                }
                output.push(HostReleases {
                    host: host.name.clone(),
                    current: None,
                    releases: Vec::new(),
                    failure: Some(HostFailure::from(&err)),
                });
            }
        }
    }

    Ok((output, exit_code))
}
