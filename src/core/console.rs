//! Console mirror for command output.
//!
//! Output goes to stderr; stdout is reserved for the JSON response envelope.

use serde::Serialize;
use std::io::{self, Write};
use std::sync::Mutex;

/// Origin of a mirrored line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamTag {
    Out,
    Err,
    Info,
    Fail,
}

impl StreamTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamTag::Out => "OUT",
            StreamTag::Err => "ERR",
            StreamTag::Info => "INFO",
            StreamTag::Fail => "FAIL",
        }
    }
}

enum ConsoleMode {
    Stderr,
    Silent,
    Capture(Mutex<Vec<(StreamTag, String)>>),
}

pub struct Console {
    mode: ConsoleMode,
}

impl Console {
    pub fn stderr() -> Self {
        Self {
            mode: ConsoleMode::Stderr,
        }
    }

    pub fn silent() -> Self {
        Self {
            mode: ConsoleMode::Silent,
        }
    }

    /// Keep lines in memory instead of printing them.
    pub fn capture() -> Self {
        Self {
            mode: ConsoleMode::Capture(Mutex::new(Vec::new())),
        }
    }

    /// Write one whole line. Safe to call from several reader threads at once.
    pub fn line(&self, tag: StreamTag, line: &str) {
        match &self.mode {
            ConsoleMode::Stderr => {
                let mut handle = io::stderr().lock();
                // Console mirroring is best effort; the log file is the record.
                let _ = writeln!(handle, "[{}] {}", tag.as_str(), line);
            }
            ConsoleMode::Silent => {}
            ConsoleMode::Capture(lines) => {
                if let Ok(mut lines) = lines.lock() {
                    lines.push((tag, line.to_string()));
                }
            }
        }
    }

    /// Lines seen so far in capture mode (empty otherwise).
    pub fn captured(&self) -> Vec<(StreamTag, String)> {
        match &self.mode {
            ConsoleMode::Capture(lines) => lines.lock().map(|l| l.clone()).unwrap_or_default(),
            _ => Vec::new(),
        }
    }
}
