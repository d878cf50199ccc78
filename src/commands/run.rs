use clap::Args;
use serde::Serialize;
use std::sync::Arc;

use pgmigrate::config;
use pgmigrate::console::Console;
use pgmigrate::pipeline::{MigrationPipeline, MigrationReport};
use pgmigrate::runner::ProcessExecutor;

use super::{CmdResult, GlobalArgs, MigrationArgs};

#[derive(Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub migration: MigrationArgs,
}

#[derive(Debug, Serialize)]
pub struct RunOutput {
    command: String,
    config_path: String,
    #[serde(flatten)]
    report: MigrationReport,
}

pub fn run(args: RunArgs, global: &GlobalArgs) -> CmdResult<RunOutput> {
    let (settings, path) =
        config::load_settings(global.config.as_deref(), &args.migration.overrides())?;

    let console = Arc::new(if global.quiet {
        Console::silent()
    } else {
        Console::stderr()
    });
    let executor = Arc::new(ProcessExecutor::new(console.clone()));
    let report = MigrationPipeline::new(settings, executor, console).run()?;
    let exit_code = report.exit_code;

    Ok((
        RunOutput {
            command: "run".to_string(),
            config_path: path.display().to_string(),
            report,
        },
        exit_code,
    ))
}
