use clap::{Args, Subcommand};
use serde::Serialize;

use pgmigrate::config::{self, ConfigOverrides, MigrationConfig, RunSettings};

use super::{CmdResult, GlobalArgs};

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommand,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Display pgmigrate.json and the settings a run would use
    Show,
    /// Show the path to pgmigrate.json
    Path,
    /// Write a starter pgmigrate.json
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Serialize)]
pub struct ConfigOutput {
    command: String,
    path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    exists: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    config: Option<MigrationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    settings: Option<RunSettings>,
}

pub fn run(args: ConfigArgs, global: &GlobalArgs) -> CmdResult<ConfigOutput> {
    let explicit = global.config.as_deref();

    match args.command {
        ConfigCommand::Show => {
            let (config, path) = config::load(explicit)?;
            let settings = config::resolve_local(&config, &ConfigOverrides::default())?;
            Ok((
                ConfigOutput {
                    command: "config.show".to_string(),
                    path: path.display().to_string(),
                    exists: Some(true),
                    config: Some(config),
                    settings: Some(settings),
                },
                0,
            ))
        }
        ConfigCommand::Path => {
            let path = config::config_path(explicit)?;
            Ok((
                ConfigOutput {
                    command: "config.path".to_string(),
                    exists: Some(path.exists()),
                    path: path.display().to_string(),
                    config: None,
                    settings: None,
                },
                0,
            ))
        }
        ConfigCommand::Init { force } => {
            let path = config::write_starter(explicit, force)?;
            Ok((
                ConfigOutput {
                    command: "config.init".to_string(),
                    path: path.display().to_string(),
                    exists: Some(true),
                    config: Some(config::starter()),
                    settings: None,
                },
                0,
            ))
        }
    }
}
