//! Captured output primitives for external command execution.

use serde::Serialize;

/// Captured output from command execution, one entry per line and stream.
/// Reusable primitive for any command that executes external processes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CapturedOutput {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stdout: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stderr: Vec<String>,
}

impl CapturedOutput {
    pub fn new(stdout: Vec<String>, stderr: Vec<String>) -> Self {
        Self { stdout, stderr }
    }

    /// Last `count` lines of error output, falling back to stdout when stderr is empty.
    pub fn error_tail(&self, count: usize) -> Vec<String> {
        let source = if self.stderr.iter().any(|l| !l.trim().is_empty()) {
            &self.stderr
        } else {
            &self.stdout
        };
        let start = source.len().saturating_sub(count);
        source[start..].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn error_tail_prefers_stderr() {
        let output = CapturedOutput::new(lines(&["out"]), lines(&["a", "b", "c"]));
        assert_eq!(output.error_tail(2), lines(&["b", "c"]));
    }

    #[test]
    fn error_tail_falls_back_to_stdout() {
        let output = CapturedOutput::new(lines(&["only stdout"]), lines(&["  "]));
        assert_eq!(output.error_tail(5), lines(&["only stdout"]));
    }
}
