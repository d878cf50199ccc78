//! Sequential migration pipeline.
//!
//! The role stage runs once and is fatal on failure. Database stages run once
//! per configured database, strictly in order; a failing sub-step ends that
//! database's sequence only. Transient artifacts are removed by a scope guard
//! whatever the outcome.

use chrono::Local;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use crate::artifacts::{self, ArtifactGuard, CleanupReport, DatabaseArtifacts};
use crate::config::{FailurePolicy, RunSettings};
use crate::console::{Console, StreamTag};
use crate::error::{Error, Result};
use crate::logs::{self, LogSink};
use crate::runner::{CommandExecutor, Invocation, PlannedCommand};
use crate::tools::CommandTemplates;
use crate::utils::io;

/// Exit code for role-stage failures and escalated database failures.
pub const EXIT_MIGRATION_FAILED: i32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Create,
    Dump,
    Archive,
    Unpack,
    Restore,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Create,
        Stage::Dump,
        Stage::Archive,
        Stage::Unpack,
        Stage::Restore,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Create => "create",
            Stage::Dump => "dump",
            Stage::Archive => "archive",
            Stage::Unpack => "unpack",
            Stage::Restore => "restore",
        }
    }

    /// State a database is in while this stage runs.
    pub fn state(&self) -> DatabaseState {
        match self {
            Stage::Create => DatabaseState::Creating,
            Stage::Dump => DatabaseState::Dumping,
            Stage::Archive => DatabaseState::Archiving,
            Stage::Unpack => DatabaseState::Unpacking,
            Stage::Restore => DatabaseState::Restoring,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "stage", rename_all = "snake_case")]
pub enum DatabaseState {
    Pending,
    Creating,
    Dumping,
    Archiving,
    Unpacking,
    Restoring,
    Done,
    Failed(Stage),
    CleanedUp,
}

impl DatabaseState {
    pub fn can_transition_to(&self, next: DatabaseState) -> bool {
        use DatabaseState::*;
        match (self, next) {
            (Pending, Creating)
            | (Creating, Dumping)
            | (Dumping, Archiving)
            | (Archiving, Unpacking)
            | (Unpacking, Restoring)
            | (Restoring, Done) => true,
            (Pending | Creating | Dumping | Archiving | Unpacking | Restoring, Failed(_)) => true,
            (Pending | Done | Failed(_), CleanedUp) => true,
            _ => false,
        }
    }
}

/// Current state plus every state visited, in order.
#[derive(Debug, Clone)]
struct StateTrail {
    history: Vec<DatabaseState>,
}

impl StateTrail {
    fn new() -> Self {
        Self {
            history: vec![DatabaseState::Pending],
        }
    }

    fn current(&self) -> DatabaseState {
        self.history
            .last()
            .copied()
            .unwrap_or(DatabaseState::Pending)
    }

    fn advance(&mut self, next: DatabaseState) {
        debug_assert!(
            self.current().can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self.current(),
            next
        );
        self.history.push(next);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Error as it appears in a report.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorSummary {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub details: serde_json::Value,
}

impl From<&Error> for ErrorSummary {
    fn from(err: &Error) -> Self {
        Self {
            code: err.code.as_str().to_string(),
            message: err.message.clone(),
            exit_code: err.command_exit_code(),
            details: err.details.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoleReport {
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<CleanupReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseReport {
    pub database: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<Stage>,
    pub stages: Vec<StageRecord>,
    pub states: Vec<DatabaseState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<CleanupReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorSummary>,
}

impl DatabaseReport {
    fn skipped(database: &str) -> Self {
        Self {
            database: database.to_string(),
            status: StepStatus::Skipped,
            failed_stage: None,
            stages: Vec::new(),
            states: vec![DatabaseState::Pending],
            cleanup: None,
            log_file: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    PartialSuccess,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub status: RunStatus,
    pub exit_code: i32,
    pub parallel_jobs: usize,
    pub on_database_failure: FailurePolicy,
    pub general_log: String,
    pub roles: RoleReport,
    pub databases: Vec<DatabaseReport>,
    pub summary: RunSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedStage {
    pub stage: Stage,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub removes_first: Vec<String>,
    pub commands: Vec<PlannedCommand>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabasePlan {
    pub database: String,
    pub log_file: String,
    pub stages: Vec<PlannedStage>,
    pub cleanup: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationPlan {
    pub parallel_jobs: usize,
    pub parallel_jobs_derived: bool,
    pub allow_destructive: bool,
    pub general_log: String,
    pub roles: Vec<PlannedCommand>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roles_cleanup: Option<String>,
    pub databases: Vec<DatabasePlan>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

pub struct MigrationPipeline {
    settings: RunSettings,
    executor: Arc<dyn CommandExecutor>,
    console: Arc<Console>,
    timestamp: String,
}

impl MigrationPipeline {
    pub fn new(
        settings: RunSettings,
        executor: Arc<dyn CommandExecutor>,
        console: Arc<Console>,
    ) -> Self {
        Self {
            settings,
            executor,
            console,
            timestamp: logs::run_timestamp(Local::now()),
        }
    }

    /// Fix the timestamp used in log file names.
    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = timestamp.into();
        self
    }

    fn templates(&self) -> CommandTemplates<'_> {
        CommandTemplates::new(&self.settings)
    }

    fn general_log_path(&self) -> PathBuf {
        general_log_path(&self.settings, &self.timestamp)
    }

    fn artifacts_for(&self, database: &str) -> DatabaseArtifacts {
        database_artifacts(&self.settings, database, &self.timestamp)
    }

    fn note(&self, log: Option<&LogSink>, tag: StreamTag, message: &str) {
        self.console.line(tag, message);
        if let Some(sink) = log {
            if let Err(err) = sink.write_line(tag, message) {
                self.console.line(
                    StreamTag::Fail,
                    &format!("Log write to {} failed: {}", sink.name(), err),
                );
            }
        }
    }

    fn execute(
        &self,
        invocation: &Invocation,
        log: &LogSink,
        commands: &mut Vec<String>,
    ) -> Result<()> {
        commands.push(invocation.command_line());
        self.executor.execute(invocation, Some(log)).map(|_| ())
    }

    /// Run the whole migration.
    ///
    /// Errors only for configuration problems, staging I/O and role-stage
    /// failure; per-database failures are reported inside the returned report.
    pub fn run(&self) -> Result<MigrationReport> {
        if !self.settings.allow_destructive {
            return Err(Error::migration_destructive_not_allowed(
                &self.settings.databases,
            ));
        }

        io::ensure_dir(&self.settings.work_dir, "create work dir")?;
        io::ensure_dir(&self.settings.log_dir, "create log dir")?;

        let general_path = self.general_log_path();
        let general = LogSink::open(&general_path)?;

        self.note(
            Some(&general),
            StreamTag::Info,
            &format!(
                "Migrating {} database(s) from {}:{} to {}:{} with {} parallel job(s), on failure: {}",
                self.settings.databases.len(),
                self.settings.source.host,
                self.settings.source.port,
                self.settings.target.host,
                self.settings.target.port,
                self.settings.parallel_jobs,
                self.settings.on_database_failure.as_str()
            ),
        );

        let roles = if self.settings.import_roles {
            self.run_role_stage(&general)?
        } else {
            self.note(Some(&general), StreamTag::Info, "Role import disabled; skipping");
            RoleReport {
                status: StepStatus::Skipped,
                commands: Vec::new(),
                cleanup: None,
            }
        };

        let mut databases = Vec::with_capacity(self.settings.databases.len());
        let mut aborted = false;

        for database in &self.settings.databases {
            if aborted {
                self.note(
                    Some(&general),
                    StreamTag::Info,
                    &format!("Skipping '{}' after earlier failure", database),
                );
                databases.push(DatabaseReport::skipped(database));
                continue;
            }

            let report = self.migrate_database(database, &general);
            if report.status == StepStatus::Failed
                && self.settings.on_database_failure == FailurePolicy::Abort
            {
                aborted = true;
            }
            databases.push(report);
        }

        let summary = build_summary(&databases);
        let status = derive_status(&summary);
        let exit_code = if summary.failed > 0 && self.settings.fail_on_database_error {
            EXIT_MIGRATION_FAILED
        } else {
            0
        };

        self.note(
            Some(&general),
            if summary.failed > 0 { StreamTag::Fail } else { StreamTag::Info },
            &format!(
                "Migration finished: {} succeeded, {} failed, {} skipped",
                summary.succeeded, summary.failed, summary.skipped
            ),
        );

        Ok(MigrationReport {
            status,
            exit_code,
            parallel_jobs: self.settings.parallel_jobs,
            on_database_failure: self.settings.on_database_failure,
            general_log: general_path.display().to_string(),
            roles,
            databases,
            summary,
        })
    }

    fn run_role_stage(&self, general: &LogSink) -> Result<RoleReport> {
        log_status!("roles", "Copying roles from {}", self.settings.source.host);

        let dump_file =
            artifacts::roles_dump_path(&self.settings.work_dir, &self.settings.source.host);
        let templates = self.templates();
        let mut commands = Vec::new();

        let guard = ArtifactGuard::new(vec![dump_file.clone()], &self.console, Some(general));
        let outcome = self
            .execute(&templates.roles_dump(&dump_file), general, &mut commands)
            .and_then(|_| {
                self.execute(&templates.roles_restore(&dump_file), general, &mut commands)
            });
        let cleanup = guard.release();

        match outcome {
            Ok(()) => {
                self.note(Some(general), StreamTag::Info, "Roles imported");
                Ok(RoleReport {
                    status: StepStatus::Succeeded,
                    commands,
                    cleanup: Some(cleanup),
                })
            }
            Err(err) => {
                let fatal = Error::migration_role_stage_failed(&err);
                self.note(
                    Some(general),
                    StreamTag::Fail,
                    &format!("{}; aborting run", fatal.message),
                );
                Err(fatal)
            }
        }
    }

    fn migrate_database(&self, database: &str, general: &LogSink) -> DatabaseReport {
        log_status!(database, "Migrating with {} job(s)", self.settings.parallel_jobs);

        let artifacts = self.artifacts_for(database);
        let mut trail = StateTrail::new();

        let own_log = match LogSink::open(&artifacts.log_file) {
            Ok(sink) => Some(sink),
            Err(err) => {
                self.note(
                    Some(general),
                    StreamTag::Fail,
                    &format!(
                        "Cannot open log for '{}' ({}); using general log",
                        database,
                        err.details["error"].as_str().unwrap_or(&err.message)
                    ),
                );
                None
            }
        };
        let log = own_log.as_ref().unwrap_or(general);

        self.note(
            Some(general),
            StreamTag::Info,
            &format!("Migrating '{}' (log: {})", database, log.name()),
        );

        let mut stages = Vec::with_capacity(Stage::ALL.len());
        let guard = ArtifactGuard::new(artifacts.transient_paths(), &self.console, Some(log));
        let outcome = self.run_stages(&artifacts, log, &mut trail, &mut stages);
        let cleanup = guard.release();

        let (status, failed_stage, error) = match outcome {
            Ok(()) => {
                self.note(
                    Some(log),
                    StreamTag::Info,
                    &format!("Database '{}' migrated", database),
                );
                (StepStatus::Succeeded, None, None)
            }
            Err((stage, err)) => {
                let failure = Error::migration_database_failed(database, stage.as_str(), &err);
                self.note(Some(log), StreamTag::Fail, &failure.message);
                if let Some(command) = err.details["command"].as_str() {
                    self.note(Some(log), StreamTag::Fail, &format!("Command: {}", command));
                }
                if own_log.is_some() {
                    self.note(Some(general), StreamTag::Fail, &failure.message);
                }
                (StepStatus::Failed, Some(stage), Some(ErrorSummary::from(&err)))
            }
        };

        trail.advance(DatabaseState::CleanedUp);

        DatabaseReport {
            database: database.to_string(),
            status,
            failed_stage,
            stages,
            states: trail.history,
            cleanup: Some(cleanup),
            log_file: own_log
                .as_ref()
                .and_then(|sink| sink.path())
                .map(|p| p.display().to_string()),
            error,
        }
    }

    fn run_stages(
        &self,
        artifacts: &DatabaseArtifacts,
        log: &LogSink,
        trail: &mut StateTrail,
        records: &mut Vec<StageRecord>,
    ) -> std::result::Result<(), (Stage, Error)> {
        for (index, stage) in Stage::ALL.iter().copied().enumerate() {
            trail.advance(stage.state());
            self.note(
                Some(log),
                StreamTag::Info,
                &format!("[{}] {}", artifacts.database, stage.as_str()),
            );

            let mut commands = Vec::new();
            if let Err(err) = self.run_stage(stage, artifacts, log, &mut commands) {
                trail.advance(DatabaseState::Failed(stage));
                records.push(StageRecord {
                    stage,
                    status: StepStatus::Failed,
                    commands,
                    error: Some(ErrorSummary::from(&err)),
                });
                records.extend(Stage::ALL[index + 1..].iter().map(|&skipped| StageRecord {
                    stage: skipped,
                    status: StepStatus::Skipped,
                    commands: Vec::new(),
                    error: None,
                }));
                return Err((stage, err));
            }

            records.push(StageRecord {
                stage,
                status: StepStatus::Succeeded,
                commands,
                error: None,
            });
        }

        trail.advance(DatabaseState::Done);
        Ok(())
    }

    fn run_stage(
        &self,
        stage: Stage,
        artifacts: &DatabaseArtifacts,
        log: &LogSink,
        commands: &mut Vec<String>,
    ) -> Result<()> {
        let templates = self.templates();
        let database = artifacts.database.as_str();

        match stage {
            Stage::Create => {
                self.execute(&templates.drop_database(database), log, commands)?;
                self.execute(&templates.create_database(database), log, commands)
            }
            Stage::Dump => {
                artifacts::remove_stale(&artifacts.dump_dir, &self.console, Some(log))?;
                self.execute(&templates.dump_database(artifacts), log, commands)
            }
            Stage::Archive => {
                artifacts::remove_stale(&artifacts.archive, &self.console, Some(log))?;
                self.execute(&templates.archive(artifacts), log, commands)
            }
            Stage::Unpack => {
                artifacts::remove_stale(&artifacts.dump_dir, &self.console, Some(log))?;
                self.execute(&templates.unpack(artifacts), log, commands)
            }
            Stage::Restore => self.execute(&templates.restore_database(artifacts), log, commands),
        }
    }
}

fn general_log_path(settings: &RunSettings, timestamp: &str) -> PathBuf {
    settings.log_dir.join(logs::general_log_name(timestamp))
}

fn database_artifacts(
    settings: &RunSettings,
    database: &str,
    timestamp: &str,
) -> DatabaseArtifacts {
    DatabaseArtifacts::new(&settings.work_dir, &settings.log_dir, database, timestamp)
}

/// Everything `run` would execute, in order, without executing it.
pub fn plan(settings: &RunSettings, timestamp: &str) -> MigrationPlan {
    let templates = CommandTemplates::new(settings);
    let mut warnings = Vec::new();

    if !settings.allow_destructive {
        warnings.push(
            "Destructive mode is off: 'run' will refuse to drop and recreate target databases"
                .to_string(),
        );
    }
    if settings.target.secret.is_none() {
        warnings.push(format!(
            "{} is not set; target commands rely on .pgpass or trust authentication",
            settings.target.password_env
        ));
    }
    if settings.source.secret.is_none() {
        warnings.push(format!(
            "{} is not set; source commands rely on .pgpass or trust authentication",
            settings.source.password_env
        ));
    }

    let (roles, roles_cleanup) = if settings.import_roles {
        let dump_file = artifacts::roles_dump_path(&settings.work_dir, &settings.source.host);
        (
            vec![
                templates.roles_dump(&dump_file).describe(),
                templates.roles_restore(&dump_file).describe(),
            ],
            Some(dump_file.display().to_string()),
        )
    } else {
        (Vec::new(), None)
    };

    let databases = settings
        .databases
        .iter()
        .map(|database| {
            let artifacts = database_artifacts(settings, database, timestamp);
            let display = |p: &PathBuf| p.display().to_string();
            let stages = vec![
                PlannedStage {
                    stage: Stage::Create,
                    removes_first: Vec::new(),
                    commands: vec![
                        templates.drop_database(database).describe(),
                        templates.create_database(database).describe(),
                    ],
                },
                PlannedStage {
                    stage: Stage::Dump,
                    removes_first: vec![display(&artifacts.dump_dir)],
                    commands: vec![templates.dump_database(&artifacts).describe()],
                },
                PlannedStage {
                    stage: Stage::Archive,
                    removes_first: vec![display(&artifacts.archive)],
                    commands: vec![templates.archive(&artifacts).describe()],
                },
                PlannedStage {
                    stage: Stage::Unpack,
                    removes_first: vec![display(&artifacts.dump_dir)],
                    commands: vec![templates.unpack(&artifacts).describe()],
                },
                PlannedStage {
                    stage: Stage::Restore,
                    removes_first: Vec::new(),
                    commands: vec![templates.restore_database(&artifacts).describe()],
                },
            ];

            DatabasePlan {
                database: database.clone(),
                log_file: display(&artifacts.log_file),
                stages,
                cleanup: artifacts.transient_paths().iter().map(display).collect(),
            }
        })
        .collect();

    MigrationPlan {
        parallel_jobs: settings.parallel_jobs,
        parallel_jobs_derived: settings.parallel_jobs_derived,
        allow_destructive: settings.allow_destructive,
        general_log: general_log_path(settings, timestamp).display().to_string(),
        roles,
        roles_cleanup,
        databases,
        warnings,
    }
}

fn build_summary(databases: &[DatabaseReport]) -> RunSummary {
    let count = |status: StepStatus| databases.iter().filter(|d| d.status == status).count();
    RunSummary {
        total: databases.len(),
        succeeded: count(StepStatus::Succeeded),
        failed: count(StepStatus::Failed),
        skipped: count(StepStatus::Skipped),
    }
}

fn derive_status(summary: &RunSummary) -> RunStatus {
    if summary.failed == 0 && summary.skipped == 0 {
        RunStatus::Success
    } else if summary.succeeded > 0 {
        RunStatus::PartialSuccess
    } else {
        RunStatus::Failed
    }
}
