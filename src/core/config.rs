//! Migration configuration: file format, overrides and resolution.
//!
//! The JSON file is the only persistent input. `resolve` folds CLI overrides,
//! secrets from the environment and the local core count into an immutable
//! [`RunSettings`] value that the pipeline receives by construction.

use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::parallelism;
use crate::paths;
use crate::redact::Secret;
use crate::utils::io;

/// Database names that are never migrated (cluster-owned).
pub const RESERVED_DATABASES: &[&str] = &["postgres", "template0", "template1"];

pub const DEFAULT_SOURCE_PASSWORD_ENV: &str = "PGMIGRATE_SOURCE_PASSWORD";
pub const DEFAULT_TARGET_PASSWORD_ENV: &str = "PGMIGRATE_TARGET_PASSWORD";

/// Root structure of pgmigrate.json
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ConnectionConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ConnectionConfig>,

    #[serde(default)]
    pub databases: Vec<String>,

    /// Explicit `-j` value; derived from the core count when absent.
    #[serde(default)]
    pub parallel_jobs: Option<usize>,

    #[serde(default = "default_import_roles")]
    pub import_roles: bool,

    #[serde(default = "default_admin_database")]
    pub admin_database: String,

    #[serde(default)]
    pub on_database_failure: FailurePolicy,

    /// Exit non-zero when any database failed (roles always do).
    #[serde(default)]
    pub fail_on_database_error: bool,

    /// Required for `run`: every target database is dropped and recreated.
    #[serde(default)]
    pub allow_destructive: bool,

    #[serde(default = "default_dir")]
    pub work_dir: String,

    #[serde(default = "default_dir")]
    pub log_dir: String,

    #[serde(default)]
    pub tools: ToolPaths,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Name of the environment variable holding this side's password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
}

/// What to do with the remaining databases after one fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Log the failure and move on to the next database.
    #[default]
    Continue,
    /// Stop; the remaining databases are reported as skipped.
    Abort,
}

impl FailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailurePolicy::Continue => "continue",
            FailurePolicy::Abort => "abort",
        }
    }
}

/// Program paths for the external tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPaths {
    #[serde(default = "default_pg_dump")]
    pub pg_dump: String,
    #[serde(default = "default_pg_restore")]
    pub pg_restore: String,
    #[serde(default = "default_pg_dumpall")]
    pub pg_dumpall: String,
    #[serde(default = "default_psql")]
    pub psql: String,
    #[serde(default = "default_tar")]
    pub tar: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            pg_dump: default_pg_dump(),
            pg_restore: default_pg_restore(),
            pg_dumpall: default_pg_dumpall(),
            psql: default_psql(),
            tar: default_tar(),
        }
    }
}

// =============================================================================
// Default value functions
// =============================================================================

fn default_import_roles() -> bool {
    true
}

fn default_admin_database() -> String {
    "postgres".to_string()
}

fn default_dir() -> String {
    ".".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_pg_dump() -> String {
    "pg_dump".to_string()
}

fn default_pg_restore() -> String {
    "pg_restore".to_string()
}

fn default_pg_dumpall() -> String {
    "pg_dumpall".to_string()
}

fn default_psql() -> String {
    "psql".to_string()
}

fn default_tar() -> String {
    "tar".to_string()
}

// =============================================================================
// Resolved settings
// =============================================================================

/// One side of the migration. Immutable for the run.
#[derive(Debug, Clone, Serialize)]
pub struct Connection {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password_env: String,
    #[serde(rename = "password", serialize_with = "serialize_secret_state")]
    pub secret: Option<Secret>,
}

fn serialize_secret_state<S: Serializer>(
    secret: &Option<Secret>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(if secret.is_some() { "set" } else { "unset" })
}

/// Everything a run needs, fixed before the first command executes.
#[derive(Debug, Clone, Serialize)]
pub struct RunSettings {
    pub source: Connection,
    pub target: Connection,
    pub databases: Vec<String>,
    pub parallel_jobs: usize,
    pub parallel_jobs_derived: bool,
    pub import_roles: bool,
    pub admin_database: String,
    pub on_database_failure: FailurePolicy,
    pub fail_on_database_error: bool,
    pub allow_destructive: bool,
    pub work_dir: PathBuf,
    pub log_dir: PathBuf,
    pub tools: ToolPaths,
}

/// CLI-level overrides applied on top of the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Replaces the configured list when non-empty.
    pub databases: Vec<String>,
    pub parallel_jobs: Option<usize>,
    pub skip_roles: bool,
    pub allow_destructive: bool,
    pub on_database_failure: Option<FailurePolicy>,
    pub fail_on_database_error: bool,
    pub work_dir: Option<String>,
    pub log_dir: Option<String>,
}

/// Resolve file config + overrides into run settings.
///
/// `env` looks up environment variables (secrets); `logical_cores` feeds the
/// derived parallelism.
pub fn resolve(
    config: &MigrationConfig,
    overrides: &ConfigOverrides,
    logical_cores: usize,
    env: impl Fn(&str) -> Option<String>,
) -> Result<RunSettings> {
    let source = resolve_connection(
        "source",
        config.source.as_ref(),
        DEFAULT_SOURCE_PASSWORD_ENV,
        &env,
    )?;
    let target = resolve_connection(
        "target",
        config.target.as_ref(),
        DEFAULT_TARGET_PASSWORD_ENV,
        &env,
    )?;

    let databases = if overrides.databases.is_empty() {
        config.databases.clone()
    } else {
        overrides.databases.clone()
    };
    validate_databases(&databases)?;

    let explicit_jobs = overrides.parallel_jobs.or(config.parallel_jobs);
    if explicit_jobs == Some(0) {
        return Err(Error::config_invalid_value(
            "parallel_jobs",
            Some("0".to_string()),
            "must be at least 1",
        ));
    }

    if config.admin_database.trim().is_empty() {
        return Err(Error::config_invalid_value(
            "admin_database",
            None,
            "must not be empty",
        ));
    }

    Ok(RunSettings {
        source,
        target,
        databases,
        parallel_jobs: parallelism::resolve_parallel_jobs(explicit_jobs, logical_cores),
        parallel_jobs_derived: explicit_jobs.is_none(),
        import_roles: config.import_roles && !overrides.skip_roles,
        admin_database: config.admin_database.clone(),
        on_database_failure: overrides
            .on_database_failure
            .unwrap_or(config.on_database_failure),
        fail_on_database_error: config.fail_on_database_error || overrides.fail_on_database_error,
        allow_destructive: config.allow_destructive || overrides.allow_destructive,
        work_dir: expand_dir(overrides.work_dir.as_deref().unwrap_or(&config.work_dir)),
        log_dir: expand_dir(overrides.log_dir.as_deref().unwrap_or(&config.log_dir)),
        tools: expand_tools(&config.tools),
    })
}

fn resolve_connection(
    side: &str,
    config: Option<&ConnectionConfig>,
    default_password_env: &str,
    env: &impl Fn(&str) -> Option<String>,
) -> Result<Connection> {
    let config = config.ok_or_else(|| Error::config_missing_key(side, None))?;

    let host = required_field(side, "host", config.host.as_deref())?;
    let user = required_field(side, "user", config.user.as_deref())?;

    if config.port == 0 {
        return Err(Error::config_invalid_value(
            format!("{}.port", side),
            Some("0".to_string()),
            "must be between 1 and 65535",
        ));
    }

    let password_env = config
        .password_env
        .clone()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default_password_env.to_string());
    let secret = env(&password_env)
        .filter(|v| !v.is_empty())
        .map(Secret::new);

    Ok(Connection {
        host,
        port: config.port,
        user,
        password_env,
        secret,
    })
}

fn required_field(side: &str, field: &str, value: Option<&str>) -> Result<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::config_missing_key(format!("{}.{}", side, field), None))
}

/// Check the database list: non-empty, unique, not reserved, usable as a path component.
pub fn validate_databases(databases: &[String]) -> Result<()> {
    if databases.is_empty() {
        return Err(Error::config_missing_key("databases", None)
            .with_hint("List the databases to migrate under \"databases\" or pass --database"));
    }

    let mut seen = HashSet::new();
    for name in databases {
        let problem = if name.trim().is_empty() {
            Some("database name must not be empty")
        } else if RESERVED_DATABASES.contains(&name.as_str()) {
            Some("reserved system database cannot be migrated")
        } else if name == "." || name == ".." || name.contains(&['/', '\\', '\0'][..]) {
            Some("database name must be usable as a file name")
        } else if !seen.insert(name.as_str()) {
            Some("database listed more than once")
        } else {
            None
        };

        if let Some(problem) = problem {
            return Err(Error::config_invalid_value(
                "databases",
                Some(name.clone()),
                problem,
            ));
        }
    }

    Ok(())
}

/// Blank means the current directory, so derived paths always carry a prefix.
fn expand_dir(dir: &str) -> PathBuf {
    let dir = dir.trim();
    if dir.is_empty() {
        return PathBuf::from(".");
    }
    PathBuf::from(shellexpand::tilde(dir).to_string())
}

fn expand_tools(tools: &ToolPaths) -> ToolPaths {
    let expand = |p: &str| shellexpand::tilde(p).to_string();
    ToolPaths {
        pg_dump: expand(&tools.pg_dump),
        pg_restore: expand(&tools.pg_restore),
        pg_dumpall: expand(&tools.pg_dumpall),
        psql: expand(&tools.psql),
        tar: expand(&tools.tar),
    }
}

// =============================================================================
// Loading functions
// =============================================================================

/// Resolve the config path: explicit path or the default location.
pub fn config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(PathBuf::from(
            shellexpand::tilde(&path.to_string_lossy()).to_string(),
        )),
        None => paths::config_file(),
    }
}

/// Load pgmigrate.json. A missing file is a configuration error.
pub fn load(explicit: Option<&Path>) -> Result<(MigrationConfig, PathBuf)> {
    let path = config_path(explicit)?;

    if !path.exists() {
        return Err(Error::config_not_found(path.display().to_string()));
    }

    let content = io::read_file(&path, &format!("read {}", path.display()))?;
    let config: MigrationConfig = serde_json::from_str(&content)
        .map_err(|e| Error::config_invalid_json(path.display().to_string(), e))?;

    Ok((config, path))
}

/// Load and resolve using the process environment and local core count.
pub fn load_settings(
    explicit: Option<&Path>,
    overrides: &ConfigOverrides,
) -> Result<(RunSettings, PathBuf)> {
    let (config, path) = load(explicit)?;
    let settings = resolve_local(&config, overrides)?;
    Ok((settings, path))
}

/// Resolve against the process environment and the local core count.
pub fn resolve_local(config: &MigrationConfig, overrides: &ConfigOverrides) -> Result<RunSettings> {
    resolve(
        config,
        overrides,
        parallelism::local_logical_cores(),
        |key| std::env::var(key).ok(),
    )
}

/// Starter configuration written by `config init`.
pub fn starter() -> MigrationConfig {
    MigrationConfig {
        source: Some(ConnectionConfig {
            host: Some("old-db.example.internal".to_string()),
            port: default_port(),
            user: Some("postgres".to_string()),
            password_env: Some(DEFAULT_SOURCE_PASSWORD_ENV.to_string()),
        }),
        target: Some(ConnectionConfig {
            host: Some("new-db.example.internal".to_string()),
            port: default_port(),
            user: Some("postgres".to_string()),
            password_env: Some(DEFAULT_TARGET_PASSWORD_ENV.to_string()),
        }),
        databases: vec!["app".to_string()],
        parallel_jobs: None,
        import_roles: default_import_roles(),
        admin_database: default_admin_database(),
        on_database_failure: FailurePolicy::Continue,
        fail_on_database_error: false,
        allow_destructive: false,
        work_dir: default_dir(),
        log_dir: default_dir(),
        tools: ToolPaths::default(),
    }
}

/// Write the starter config. Refuses to overwrite unless `force`.
pub fn write_starter(explicit: Option<&Path>, force: bool) -> Result<PathBuf> {
    let path = config_path(explicit)?;

    if path.exists() && !force {
        return Err(Error::validation_invalid_argument(
            "config",
            format!("{} already exists", path.display()),
            None,
        )
        .with_hint("Pass --force to overwrite it"));
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        io::ensure_dir(parent, &format!("create {}", parent.display()))?;
    }

    let content = serde_json::to_string_pretty(&starter()).map_err(|e| {
        Error::internal_json(e.to_string(), Some("serialize pgmigrate.json".to_string()))
    })?;
    io::write_file(&path, &content, &format!("write {}", path.display()))?;

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn config_json() -> serde_json::Value {
        serde_json::json!({
            "source": {"host": "old", "user": "admin", "password_env": "SRC_PW"},
            "target": {"host": "new", "port": 6543, "user": "admin"},
            "databases": ["orders", "billing"]
        })
    }

    fn parse(value: serde_json::Value) -> MigrationConfig {
        serde_json::from_value(value).unwrap()
    }

    fn env_with(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_fill_optional_fields() {
        let settings = resolve(
            &parse(config_json()),
            &ConfigOverrides::default(),
            8,
            env_with(&[]),
        )
        .unwrap();

        assert_eq!(settings.source.port, 5432);
        assert_eq!(settings.target.port, 6543);
        assert_eq!(settings.parallel_jobs, 4);
        assert!(settings.parallel_jobs_derived);
        assert!(settings.import_roles);
        assert_eq!(settings.admin_database, "postgres");
        assert_eq!(settings.on_database_failure, FailurePolicy::Continue);
        assert!(!settings.fail_on_database_error);
        assert!(!settings.allow_destructive);
        assert_eq!(settings.tools, ToolPaths::default());
        assert_eq!(settings.target.password_env, DEFAULT_TARGET_PASSWORD_ENV);
    }

    #[test]
    fn secrets_come_from_named_env_vars() {
        let settings = resolve(
            &parse(config_json()),
            &ConfigOverrides::default(),
            8,
            env_with(&[("SRC_PW", "source-secret"), (DEFAULT_TARGET_PASSWORD_ENV, "target-secret")]),
        )
        .unwrap();

        assert_eq!(settings.source.secret.as_ref().unwrap().expose(), "source-secret");
        assert_eq!(settings.target.secret.as_ref().unwrap().expose(), "target-secret");
    }

    #[test]
    fn serialized_settings_never_contain_secrets() {
        let settings = resolve(
            &parse(config_json()),
            &ConfigOverrides::default(),
            8,
            env_with(&[("SRC_PW", "source-secret")]),
        )
        .unwrap();

        let json = serde_json::to_string(&settings).unwrap();
        assert!(!json.contains("source-secret"));
        assert!(json.contains("\"password\":\"set\""));
        assert!(json.contains("\"password\":\"unset\""));
    }

    #[test]
    fn overrides_take_precedence() {
        let overrides = ConfigOverrides {
            databases: vec!["inventory".to_string()],
            parallel_jobs: Some(6),
            skip_roles: true,
            allow_destructive: true,
            on_database_failure: Some(FailurePolicy::Abort),
            fail_on_database_error: true,
            work_dir: Some("/tmp/work".to_string()),
            log_dir: None,
        };

        let settings = resolve(&parse(config_json()), &overrides, 2, env_with(&[])).unwrap();

        assert_eq!(settings.databases, vec!["inventory".to_string()]);
        assert_eq!(settings.parallel_jobs, 6);
        assert!(!settings.parallel_jobs_derived);
        assert!(!settings.import_roles);
        assert!(settings.allow_destructive);
        assert_eq!(settings.on_database_failure, FailurePolicy::Abort);
        assert!(settings.fail_on_database_error);
        assert_eq!(settings.work_dir, PathBuf::from("/tmp/work"));
        assert_eq!(settings.log_dir, PathBuf::from("."));
    }

    #[test]
    fn missing_connection_is_config_error() {
        let mut value = config_json();
        value.as_object_mut().unwrap().remove("target");

        let err = resolve(&parse(value), &ConfigOverrides::default(), 4, env_with(&[])).unwrap_err();
        assert_eq!(err.code.as_str(), "config.missing_key");
        assert_eq!(err.details["key"], "target");
    }

    #[test]
    fn missing_host_is_config_error() {
        let mut value = config_json();
        value["source"]["host"] = serde_json::json!("  ");

        let err = resolve(&parse(value), &ConfigOverrides::default(), 4, env_with(&[])).unwrap_err();
        assert_eq!(err.details["key"], "source.host");
    }

    #[test]
    fn empty_database_list_is_config_error() {
        let mut value = config_json();
        value["databases"] = serde_json::json!([]);

        let err = resolve(&parse(value), &ConfigOverrides::default(), 4, env_with(&[])).unwrap_err();
        assert_eq!(err.code.as_str(), "config.missing_key");
        assert_eq!(err.details["key"], "databases");
    }

    #[test]
    fn rejects_reserved_duplicate_and_unsafe_names() {
        for bad in [
            vec!["postgres"],
            vec!["template1"],
            vec!["orders", "orders"],
            vec!["../etc"],
            vec![""],
        ] {
            let names: Vec<String> = bad.iter().map(|s| s.to_string()).collect();
            let err = validate_databases(&names).unwrap_err();
            assert_eq!(err.code.as_str(), "config.invalid_value", "{:?}", bad);
        }
    }

    #[test]
    fn leading_dash_names_are_accepted() {
        let names = vec!["-orders".to_string(), "--billing".to_string()];
        assert!(validate_databases(&names).is_ok());
    }

    #[test]
    fn blank_dirs_resolve_to_current_dir() {
        let mut value = config_json();
        value["work_dir"] = serde_json::json!("  ");
        value["log_dir"] = serde_json::json!("");

        let settings =
            resolve(&parse(value), &ConfigOverrides::default(), 4, env_with(&[])).unwrap();
        assert_eq!(settings.work_dir, PathBuf::from("."));
        assert_eq!(settings.log_dir, PathBuf::from("."));
    }

    #[test]
    fn resolve_local_uses_process_cores() {
        let settings = resolve_local(&parse(config_json()), &ConfigOverrides::default()).unwrap();
        assert_eq!(
            settings.parallel_jobs,
            parallelism::resolve_parallel_jobs(None, parallelism::local_logical_cores())
        );
        assert_eq!(settings.databases, vec!["orders", "billing"]);
    }

    #[test]
    fn zero_parallel_jobs_is_rejected() {
        let mut value = config_json();
        value["parallel_jobs"] = serde_json::json!(0);

        let err = resolve(&parse(value), &ConfigOverrides::default(), 4, env_with(&[])).unwrap_err();
        assert_eq!(err.details["key"], "parallel_jobs");
    }

    #[test]
    fn policy_parses_snake_case() {
        let mut value = config_json();
        value["on_database_failure"] = serde_json::json!("abort");
        assert_eq!(parse(value).on_database_failure, FailurePolicy::Abort);
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = load(Some(&dir.path().join("absent.json"))).unwrap_err();
        assert_eq!(err.code.as_str(), "config.not_found");
    }

    #[test]
    fn load_reports_invalid_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = load(Some(&path)).unwrap_err();
        assert_eq!(err.code.as_str(), "config.invalid_json");
    }

    #[test]
    fn starter_round_trips_and_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("pgmigrate.json");

        write_starter(Some(&path), false).unwrap();
        let (config, _) = load(Some(&path)).unwrap();
        assert_eq!(config.databases, vec!["app".to_string()]);

        let err = write_starter(Some(&path), false).unwrap_err();
        assert_eq!(err.code.as_str(), "validation.invalid_argument");
        assert!(write_starter(Some(&path), true).is_ok());
    }
}
