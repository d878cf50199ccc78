use clap::Args;
use std::path::PathBuf;

use pgmigrate::config::{ConfigOverrides, FailurePolicy};

pub type CmdResult<T> = pgmigrate::Result<(T, i32)>;

pub(crate) struct GlobalArgs {
    pub config: Option<PathBuf>,
    pub quiet: bool,
}

/// Overrides shared by `run` and `plan`.
#[derive(Args, Debug, Default)]
pub struct MigrationArgs {
    /// Migrate only these databases (repeatable; replaces the configured list)
    #[arg(long = "database", short = 'd', value_name = "NAME")]
    pub databases: Vec<String>,

    /// Parallel jobs for dump and restore (default: half the logical cores)
    #[arg(long, short = 'j', value_name = "N")]
    pub jobs: Option<usize>,

    /// Skip the role import stage
    #[arg(long)]
    pub skip_roles: bool,

    /// Allow dropping and recreating target databases
    #[arg(long)]
    pub allow_destructive: bool,

    /// What to do with remaining databases after one fails
    #[arg(long, value_name = "POLICY", value_parser = parse_failure_policy)]
    pub on_database_failure: Option<FailurePolicy>,

    /// Exit with code 20 when any database failed
    #[arg(long)]
    pub fail_on_database_error: bool,

    /// Directory for dumps and archives
    #[arg(long, value_name = "DIR")]
    pub work_dir: Option<String>,

    /// Directory for log files
    #[arg(long, value_name = "DIR")]
    pub log_dir: Option<String>,
}

impl MigrationArgs {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            databases: self.databases.clone(),
            parallel_jobs: self.jobs,
            skip_roles: self.skip_roles,
            allow_destructive: self.allow_destructive,
            on_database_failure: self.on_database_failure,
            fail_on_database_error: self.fail_on_database_error,
            work_dir: self.work_dir.clone(),
            log_dir: self.log_dir.clone(),
        }
    }
}

fn parse_failure_policy(value: &str) -> Result<FailurePolicy, String> {
    match value {
        "continue" => Ok(FailurePolicy::Continue),
        "abort" => Ok(FailurePolicy::Abort),
        other => Err(format!(
            "unknown policy '{}' (expected 'continue' or 'abort')",
            other
        )),
    }
}

pub mod config;
pub mod plan;
pub mod run;

macro_rules! dispatch {
    ($args:expr, $global:expr, $module:ident) => {
        crate::output::map_cmd_result_to_json($module::run($args, $global))
    };
}

pub(crate) fn run_json(
    command: crate::Commands,
    global: &GlobalArgs,
) -> (pgmigrate::Result<serde_json::Value>, i32) {
    crate::tty::status("pgmigrate is working...");

    match command {
        crate::Commands::Run(args) => dispatch!(args, global, run),
        crate::Commands::Plan(args) => dispatch!(args, global, plan),
        crate::Commands::Config(args) => dispatch!(args, global, config),
    }
}
