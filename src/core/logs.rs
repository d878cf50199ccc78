//! Append-only run logs.
//!
//! One general log per run plus one log per database. Files are opened in
//! append mode and never truncated or rotated.

use chrono::{DateTime, Local};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::console::StreamTag;
use crate::error::{Error, Result};

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Timestamp embedded in log file names; fixed once per run.
pub fn run_timestamp(now: DateTime<Local>) -> String {
    now.format(TIMESTAMP_FORMAT).to_string()
}

pub fn general_log_name(timestamp: &str) -> String {
    format!("migration_general_log_{}.log", timestamp)
}

pub fn database_log_name(database: &str, timestamp: &str) -> String {
    format!("{}_migration_log_{}.log", database, timestamp)
}

/// Line-oriented append target shared by the two stream readers of a command.
pub struct LogSink {
    name: String,
    path: Option<PathBuf>,
    writer: Mutex<Box<dyn Write + Send>>,
}

impl LogSink {
    /// Open (or create) a log file for appending.
    pub fn open(path: &Path) -> Result<Self> {
        let file: File = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                Error::internal_io(e.to_string(), Some(format!("open log {}", path.display())))
            })?;

        Ok(Self {
            name: path.display().to_string(),
            path: Some(path.to_path_buf()),
            writer: Mutex::new(Box::new(file)),
        })
    }

    /// Wrap an arbitrary writer (used for in-memory sinks).
    pub fn from_writer(name: impl Into<String>, writer: Box<dyn Write + Send>) -> Self {
        Self {
            name: name.into(),
            path: None,
            writer: Mutex::new(writer),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn write_line(&self, tag: StreamTag, line: &str) -> Result<()> {
        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| Error::internal_unexpected(format!("log {} lock poisoned", self.name)))?;

        writeln!(writer, "{} [{}] {}", stamp, tag.as_str(), line)
            .and_then(|_| writer.flush())
            .map_err(|e| Error::internal_io(e.to_string(), Some(format!("write log {}", self.name))))
    }
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSink").field("name", &self.name).finish()
    }
}
