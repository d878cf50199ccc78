use crate::error::{Error, Result};
use std::env;
use std::path::PathBuf;

/// Base pgmigrate config directory (universal ~/.config/pgmigrate/ on all platforms)
pub fn pgmigrate() -> Result<PathBuf> {
    #[cfg(windows)]
    {
        let appdata = env::var("APPDATA").map_err(|_| {
            Error::internal_unexpected(
                "APPDATA environment variable not set on Windows".to_string(),
            )
        })?;
        Ok(PathBuf::from(appdata).join("pgmigrate"))
    }

    #[cfg(not(windows))]
    {
        let home = env::var("HOME").map_err(|_| {
            Error::internal_unexpected(
                "HOME environment variable not set on Unix-like system".to_string(),
            )
        })?;
        Ok(PathBuf::from(home).join(".config").join("pgmigrate"))
    }
}

/// Default migration config file path
pub fn config_file() -> Result<PathBuf> {
    Ok(pgmigrate()?.join("pgmigrate.json"))
}
