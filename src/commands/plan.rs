use chrono::Local;
use clap::Args;
use serde::Serialize;

use pgmigrate::config::{self, RunSettings};
use pgmigrate::logs;
use pgmigrate::pipeline::{self, MigrationPlan};

use super::{CmdResult, GlobalArgs, MigrationArgs};

#[derive(Args)]
pub struct PlanArgs {
    #[command(flatten)]
    pub migration: MigrationArgs,
}

#[derive(Debug, Serialize)]
pub struct PlanOutput {
    command: String,
    config_path: String,
    settings: RunSettings,
    plan: MigrationPlan,
}

/// Resolve settings and list every command `run` would execute.
pub fn run(args: PlanArgs, global: &GlobalArgs) -> CmdResult<PlanOutput> {
    let (settings, path) =
        config::load_settings(global.config.as_deref(), &args.migration.overrides())?;
    let plan = pipeline::plan(&settings, &logs::run_timestamp(Local::now()));

    Ok((
        PlanOutput {
            command: "plan".to_string(),
            config_path: path.display().to_string(),
            settings,
            plan,
        },
        0,
    ))
}
