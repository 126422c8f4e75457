use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use commands::GlobalArgs;

mod commands;
mod output;
mod tty;

use commands::{hosts, plan, releases, rollback, run, tasks};
use rollout::recipe::DEFAULT_RECIPE_FILE;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "rollout")]
#[command(version = VERSION)]
#[command(about = "Atomic, symlink-based release deployments over SSH")]
struct Cli {
    /// Recipe file declaring hosts, tasks and hooks
    #[arg(long, global = true, value_name = "PATH", default_value = DEFAULT_RECIPE_FILE)]
    recipe: PathBuf,

    /// Log step output (-vv for trace level)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a task on the selected hosts
    Run(run::RunArgs),
    /// Point current back at the previous release
    Rollback(rollback::RollbackArgs),
    /// List releases on each host
    Releases(releases::ReleasesArgs),
    /// Show the resolved steps of a task without running anything
    Plan(plan::PlanArgs),
    /// List hosts declared in the recipe
    Hosts(hosts::HostsArgs),
    /// List tasks declared in the recipe
    Tasks(tasks::TasksArgs),
}

/// Logs go to stderr; stdout carries the JSON response. `RUST_LOG` wins over
/// `-v`.
fn init_tracing(verbose: u8) {
    let default_filter = match verbose {
        0 => "rollout=info",
        1 => "rollout=debug",
        _ => "rollout=trace",
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();
}

fn main() -> std::process::ExitCode {
    let args = rollout::utils::args::normalize(std::env::args().collect());
    let cli = Cli::parse_from(args);

    init_tracing(cli.verbose);

    let global = GlobalArgs { recipe: cli.recipe };
    let (json_result, exit_code) = commands::run_json(cli.command, &global);

    if let Err(err) = output::print_json_result(json_result) {
        eprintln!("{}", err);
        return std::process::ExitCode::from(1);
    }

    std::process::ExitCode::from(exit_code_to_u8(exit_code))
}

fn exit_code_to_u8(code: i32) -> u8 {
    if code <= 0 {
        0
    } else if code >= 255 {
        255
    } else {
        code as u8
    }
}
