//! Transient per-database artifacts and their guaranteed cleanup.

use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::console::{Console, StreamTag};
use crate::logs::{self, LogSink};
use crate::utils::io;

/// Filesystem layout for one database's migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseArtifacts {
    pub database: String,
    pub work_dir: PathBuf,
    pub dump_dir: PathBuf,
    pub archive: PathBuf,
    pub log_file: PathBuf,
}

impl DatabaseArtifacts {
    pub fn new(work_dir: &Path, log_dir: &Path, database: &str, timestamp: &str) -> Self {
        Self {
            database: database.to_string(),
            work_dir: work_dir.to_path_buf(),
            dump_dir: work_dir.join(format!("{}_dump_dir", database)),
            archive: work_dir.join(format!("{}_dump.tar.gz", database)),
            log_file: log_dir.join(logs::database_log_name(database, timestamp)),
        }
    }

    /// Dump directory name relative to the work dir (what the archive contains).
    pub fn dump_dir_name(&self) -> String {
        format!("{}_dump_dir", self.database)
    }

    /// Paths removed by cleanup, archive first.
    pub fn transient_paths(&self) -> Vec<PathBuf> {
        vec![self.archive.clone(), self.dump_dir.clone()]
    }
}

/// Temporary role script: `roles_dump_<host>.sql`.
pub fn roles_dump_path(work_dir: &Path, host: &str) -> PathBuf {
    let host: String = host
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    work_dir.join(format!("roles_dump_{}.sql", host))
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Remove a stale artifact before a stage reuses its path.
pub fn remove_stale(path: &Path, console: &Console, log: Option<&LogSink>) -> crate::Result<()> {
    if io::remove_path(path, &format!("remove stale {}", path.display()))? {
        record(console, log, StreamTag::Info, &format!("Removed stale {}", path.display()));
    }
    Ok(())
}

/// Scope guard that deletes transient paths when released or dropped.
///
/// Cleanup errors are logged and collected, never returned.
pub struct ArtifactGuard<'a> {
    paths: Vec<PathBuf>,
    console: &'a Console,
    log: Option<&'a LogSink>,
    released: bool,
}

impl<'a> ArtifactGuard<'a> {
    pub fn new(paths: Vec<PathBuf>, console: &'a Console, log: Option<&'a LogSink>) -> Self {
        Self {
            paths,
            console,
            log,
            released: false,
        }
    }

    pub fn release(mut self) -> CleanupReport {
        self.released = true;
        self.cleanup()
    }

    fn cleanup(&self) -> CleanupReport {
        let mut report = CleanupReport::default();

        for path in &self.paths {
            match io::remove_path(path, &format!("cleanup {}", path.display())) {
                Ok(true) => {
                    record(
                        self.console,
                        self.log,
                        StreamTag::Info,
                        &format!("Cleanup removed {}", path.display()),
                    );
                    report.removed.push(path.display().to_string());
                }
                Ok(false) => {}
                Err(err) => {
                    let detail = err.details["error"].as_str().unwrap_or(&err.message).to_string();
                    let message = format!("Cleanup of {} failed: {}", path.display(), detail);
                    record(self.console, self.log, StreamTag::Fail, &message);
                    report.errors.push(message);
                }
            }
        }

        report
    }
}

impl Drop for ArtifactGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.cleanup();
        }
    }
}

fn record(console: &Console, log: Option<&LogSink>, tag: StreamTag, message: &str) {
    console.line(tag, message);
    if let Some(sink) = log {
        if let Err(err) = sink.write_line(tag, message) {
            console.line(StreamTag::Fail, &format!("Log write to {} failed: {}", sink.name(), err));
        }
    }
}
