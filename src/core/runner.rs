//! External command execution with live, two-stream log mirroring.
//!
//! Each invocation is spawned from a structured argument list with an
//! environment overlay. Standard output and standard error are drained
//! concurrently, line by line, to the console and an optional log sink so a
//! child never blocks on a full pipe. Both readers are joined and the child is
//! reaped before `execute` returns, on every path.

use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;

use crate::console::{Console, StreamTag};
use crate::error::{CommandFailedDetails, Error, Result};
use crate::logs::LogSink;
use crate::redact::{Redactor, Secret};
use crate::utils::command::CapturedOutput;
use crate::utils::shell;

/// Lines of error output attached to a `command.failed` error.
const ERROR_TAIL_LINES: usize = 20;

/// One external command, built fresh for every call.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub label: String,
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub secret_env: BTreeMap<String, Secret>,
}

impl Invocation {
    pub fn new(label: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            secret_env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Overlay variable whose value must never be rendered.
    pub fn secret_env(mut self, key: impl Into<String>, secret: Option<&Secret>) -> Self {
        if let Some(secret) = secret {
            self.secret_env.insert(key.into(), secret.clone());
        }
        self
    }

    pub fn redactor(&self) -> Redactor {
        Redactor::new(self.secret_env.values())
    }

    /// Shell-quoted command text with secrets redacted.
    pub fn command_line(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(self.args.iter().cloned());
        self.redactor().redact(&shell::quote_args(&parts))
    }

    pub fn describe(&self) -> PlannedCommand {
        let mut env: Vec<String> = self
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, self.redactor().redact(v)))
            .collect();
        env.extend(self.secret_env.keys().map(|k| format!("{}=<secret>", k)));

        PlannedCommand {
            label: self.label.clone(),
            command: self.command_line(),
            working_dir: self
                .working_dir
                .as_ref()
                .map(|d| d.display().to_string()),
            env,
        }
    }
}

/// Display form of an invocation, safe to print.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedCommand {
    pub label: String,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
}

/// Result of a command that exited successfully.
#[derive(Debug, Clone, Serialize)]
pub struct ExitInfo {
    pub exit_code: i32,
    #[serde(skip)]
    pub output: CapturedOutput,
}

/// Seam between the migration pipeline and process execution.
pub trait CommandExecutor: Send + Sync {
    fn execute(&self, invocation: &Invocation, log: Option<&LogSink>) -> Result<ExitInfo>;
}

/// Executes invocations as real child processes.
pub struct ProcessExecutor {
    console: Arc<Console>,
}

impl ProcessExecutor {
    pub fn new(console: Arc<Console>) -> Self {
        Self { console }
    }
}

impl CommandExecutor for ProcessExecutor {
    fn execute(&self, invocation: &Invocation, log: Option<&LogSink>) -> Result<ExitInfo> {
        execute(invocation, &self.console, log)
    }
}

#[derive(Default)]
struct StreamDrain {
    lines: Vec<String>,
    sink_error: Option<Error>,
    read_error: Option<Error>,
}

/// Run one invocation to completion.
///
/// Returns `command.failed` with the exact exit code on non-zero exit (a
/// signal-terminated child reports -1), `command.spawn_failed` when the
/// program cannot be started, and `internal.io_error` when the log sink
/// rejected a write during an otherwise successful run.
pub fn execute(
    invocation: &Invocation,
    console: &Console,
    log: Option<&LogSink>,
) -> Result<ExitInfo> {
    let redactor = invocation.redactor();
    let command_line = invocation.command_line();

    console.line(StreamTag::Info, &format!("$ {}", command_line));
    let mut sink_error = log
        .and_then(|sink| sink.write_line(StreamTag::Info, &format!("$ {}", command_line)).err());

    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if let Some(dir) = &invocation.working_dir {
        cmd.current_dir(dir);
    }
    cmd.envs(&invocation.env);
    for (key, secret) in &invocation.secret_env {
        cmd.env(key, secret.expose());
    }

    let mut child = cmd.spawn().map_err(|e| {
        Error::command_spawn_failed(
            &invocation.label,
            &command_line,
            redactor.redact(&e.to_string()),
        )
    })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let (out, err) = thread::scope(|scope| {
        let out_handle = scope.spawn(|| drain(stdout, StreamTag::Out, console, log, &redactor));
        let err_handle = scope.spawn(|| drain(stderr, StreamTag::Err, console, log, &redactor));
        (
            join_drain(out_handle.join(), "stdout"),
            join_drain(err_handle.join(), "stderr"),
        )
    });

    let status = child.wait().map_err(|e| {
        Error::internal_io(
            e.to_string(),
            Some(format!("wait for {}", invocation.label)),
        )
    })?;
    let exit_code = status.code().unwrap_or(-1);

    let read_error = out.read_error.or(err.read_error);
    sink_error = sink_error.or(out.sink_error).or(err.sink_error);
    let output = CapturedOutput::new(out.lines, err.lines);

    if exit_code != 0 {
        let details = CommandFailedDetails {
            label: invocation.label.clone(),
            command: command_line,
            exit_code,
            stderr_tail: output.error_tail(ERROR_TAIL_LINES),
        };
        return Err(Error::command_failed(details));
    }

    if let Some(err) = read_error.or(sink_error) {
        return Err(err);
    }

    Ok(ExitInfo { exit_code, output })
}

fn join_drain(joined: thread::Result<StreamDrain>, stream: &str) -> StreamDrain {
    joined.unwrap_or_else(|_| StreamDrain {
        read_error: Some(Error::internal_unexpected(format!(
            "{} reader thread panicked",
            stream
        ))),
        ..StreamDrain::default()
    })
}

fn drain<R: Read>(
    pipe: Option<R>,
    tag: StreamTag,
    console: &Console,
    log: Option<&LogSink>,
    redactor: &Redactor,
) -> StreamDrain {
    let mut result = StreamDrain::default();
    let Some(pipe) = pipe else {
        return result;
    };

    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = redactor.redact(&decode_line(&buf));
                console.line(tag, &line);
                if let Some(sink) = log {
                    // Keep draining after a failed write so the child never stalls.
                    if let Err(e) = sink.write_line(tag, &line) {
                        result.sink_error.get_or_insert(e);
                    }
                }
                result.lines.push(line);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                result.read_error = Some(Error::internal_io(
                    e.to_string(),
                    Some(format!("read {}", tag.as_str())),
                ));
                break;
            }
        }
    }

    result
}

fn decode_line(buf: &[u8]) -> String {
    let mut end = buf.len();
    if end > 0 && buf[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && buf[end - 1] == b'\r' {
        end -= 1;
    }
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redact::REDACTED;
    use std::io::Write;
    use tempfile::TempDir;

    fn sh(label: &str, script: &str) -> Invocation {
        Invocation::new(label, "sh").arg("-c").arg(script)
    }

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn zero_exit_is_success() {
        let console = Console::silent();
        let info = execute(&sh("ok", "echo hello"), &console, None).unwrap();
        assert_eq!(info.exit_code, 0);
        assert_eq!(info.output.stdout, vec!["hello".to_string()]);
    }

    #[test]
    fn non_zero_exit_carries_exact_code() {
        let console = Console::silent();
        for code in [1, 2, 7, 42, 255] {
            let err = execute(&sh("fail", &format!("exit {}", code)), &console, None).unwrap_err();
            assert_eq!(err.code.as_str(), "command.failed");
            assert_eq!(err.command_exit_code(), Some(code));
        }
    }

    #[test]
    fn failure_details_include_stderr_tail() {
        let console = Console::silent();
        let err = execute(
            &sh("restore", "echo 'relation missing' >&2; exit 1"),
            &console,
            None,
        )
        .unwrap_err();

        assert_eq!(err.details["label"], "restore");
        assert_eq!(err.details["stderrTail"][0], "relation missing");
    }

    #[test]
    fn each_stream_keeps_its_order() {
        let console = Console::silent();
        let script = "i=0; while [ $i -lt 300 ]; do echo out$i; echo err$i >&2; i=$((i+1)); done";
        let info = execute(&sh("interleave", script), &console, None).unwrap();

        let expected_out: Vec<String> = (0..300).map(|i| format!("out{}", i)).collect();
        let expected_err: Vec<String> = (0..300).map(|i| format!("err{}", i)).collect();
        assert_eq!(info.output.stdout, expected_out);
        assert_eq!(info.output.stderr, expected_err);
    }

    #[test]
    fn large_output_on_both_streams_does_not_deadlock() {
        let console = Console::silent();
        let script = "i=0; while [ $i -lt 20000 ]; do echo \"stdout line $i\"; echo \"stderr line $i\" >&2; i=$((i+1)); done";
        let info = execute(&sh("flood", script), &console, None).unwrap();

        assert_eq!(info.output.stdout.len(), 20000);
        assert_eq!(info.output.stderr.len(), 20000);
        assert_eq!(info.output.stdout[19999], "stdout line 19999");
    }

    #[test]
    fn last_line_without_newline_is_kept() {
        let console = Console::silent();
        let info = execute(&sh("printf", "printf 'a\\r\\nb'"), &console, None).unwrap();
        assert_eq!(info.output.stdout, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn lines_are_mirrored_to_console_and_log() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("run.log");
        let sink = LogSink::open(&log_path).unwrap();
        let console = Console::capture();

        execute(&sh("mirror", "echo visible; echo warning >&2"), &console, Some(&sink)).unwrap();

        let captured = console.captured();
        assert!(captured.contains(&(StreamTag::Out, "visible".to_string())));
        assert!(captured.contains(&(StreamTag::Err, "warning".to_string())));
        assert!(captured[0].1.starts_with("$ sh -c"));

        let content = std::fs::read_to_string(&log_path).unwrap();
        assert!(content.contains("[OUT] visible"));
        assert!(content.contains("[ERR] warning"));
        assert!(content.contains("[INFO] $ sh -c"));
    }

    #[test]
    fn secret_reaches_child_but_never_output() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("secret.log");
        let sink = LogSink::open(&log_path).unwrap();
        let console = Console::capture();
        let secret = Secret::new("hunter2-topsecret");

        let invocation = sh(
            "secret",
            "[ \"$PGPASSWORD\" = hunter2-topsecret ] && echo match; echo \"$PGPASSWORD\"; echo \"$PGPASSWORD\" >&2; exit 3",
        )
        .secret_env("PGPASSWORD", Some(&secret));

        let err = execute(&invocation, &console, Some(&sink)).unwrap_err();

        assert_eq!(err.command_exit_code(), Some(3));
        assert!(!err.message.contains(secret.expose()));
        assert!(!err.details.to_string().contains(secret.expose()));

        let content = std::fs::read_to_string(&log_path).unwrap();
        assert!(content.contains("[OUT] match"));
        assert!(content.contains(REDACTED));
        assert!(!content.contains(secret.expose()));
        assert!(console
            .captured()
            .iter()
            .all(|(_, line)| !line.contains(secret.expose())));
    }

    #[test]
    fn overlay_merges_onto_ambient_environment() {
        let console = Console::silent();
        let invocation = sh("env", "echo \"$PGMIGRATE_TEST_OVERLAY\"; [ -n \"$PATH\" ] && echo has-path")
            .env("PGMIGRATE_TEST_OVERLAY", "overlay-value");

        let info = execute(&invocation, &console, None).unwrap();
        assert_eq!(
            info.output.stdout,
            vec!["overlay-value".to_string(), "has-path".to_string()]
        );
    }

    #[test]
    fn working_directory_is_applied() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "in-workdir\n").unwrap();
        let console = Console::silent();

        let info = execute(
            &sh("cwd", "cat marker.txt").current_dir(dir.path()),
            &console,
            None,
        )
        .unwrap();
        assert_eq!(info.output.stdout, vec!["in-workdir".to_string()]);
    }

    #[test]
    fn log_failure_is_reported_after_child_completes() {
        let dir = TempDir::new().unwrap();
        let done = dir.path().join("done");
        let sink = LogSink::from_writer("broken", Box::new(FailingWriter));
        let console = Console::silent();
        let script = format!("echo one; echo two >&2; touch '{}'", done.display());

        let err = execute(&sh("broken-log", &script), &console, Some(&sink)).unwrap_err();

        assert_eq!(err.code.as_str(), "internal.io_error");
        assert!(done.exists());
    }

    #[test]
    fn missing_program_is_spawn_failure() {
        let console = Console::silent();
        let err = execute(
            &Invocation::new("ghost", "pgmigrate-no-such-program-xyz"),
            &console,
            None,
        )
        .unwrap_err();
        assert_eq!(err.code.as_str(), "command.spawn_failed");
        assert_eq!(err.command_exit_code(), None);
    }

    #[test]
    fn command_line_is_quoted_and_redacted() {
        let secret = Secret::new("pw");
        let invocation = Invocation::new("create", "psql")
            .args(["-c", "CREATE DATABASE \"orders\""])
            .arg("--note=pw")
            .secret_env("PGPASSWORD", Some(&secret));

        assert_eq!(
            invocation.command_line(),
            format!("psql -c 'CREATE DATABASE \"orders\"' --note={}", REDACTED)
        );
        assert_eq!(invocation.describe().env, vec!["PGPASSWORD=<secret>".to_string()]);
    }
}
