use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod output;
mod tty;

use commands::{config, plan, run, GlobalArgs};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "pgmigrate")]
#[command(version = VERSION)]
#[command(about = "Migrate PostgreSQL databases and roles between clusters")]
struct Cli {
    /// Path to pgmigrate.json (default: ~/.config/pgmigrate/pgmigrate.json)
    #[arg(long, short = 'c', global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Do not mirror command output to the terminal (logs are still written)
    #[arg(long, short = 'q', global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy roles, then dump, archive, unpack and restore each database
    Run(run::RunArgs),
    /// Show resolved settings and every command a run would execute
    Plan(plan::PlanArgs),
    /// Manage pgmigrate.json
    Config(config::ConfigArgs),
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let global = GlobalArgs {
        config: cli.config,
        quiet: cli.quiet,
    };

    let (json_result, exit_code) = commands::run_json(cli.command, &global);

    if let Err(err) = output::print_json_result(json_result) {
        eprintln!("pgmigrate: {}", err);
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
