//! Secret redaction for anything that leaves the process as text.

use std::fmt;

pub const REDACTED: &str = "********";

/// A secret value (database password).
///
/// Never serialized; `Debug` and `Display` print a placeholder.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw value. Only the environment overlay of a child process should see this.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({})", REDACTED)
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

/// Replaces every occurrence of known secrets in a piece of text.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    secrets: Vec<Secret>,
}

impl Redactor {
    pub fn new<'a>(secrets: impl IntoIterator<Item = &'a Secret>) -> Self {
        // Longest first so a secret containing another is replaced whole.
        let mut secrets: Vec<Secret> = secrets
            .into_iter()
            .filter(|s| !s.expose().is_empty())
            .cloned()
            .collect();
        secrets.sort_by(|a, b| b.expose().len().cmp(&a.expose().len()));
        secrets.dedup();
        Self { secrets }
    }

    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for secret in &self.secrets {
            if out.contains(secret.expose()) {
                out = out.replace(secret.expose(), REDACTED);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_and_display_hide_value() {
        let secret = Secret::new("hunter2");
        assert!(!format!("{:?}", secret).contains("hunter2"));
        assert_eq!(secret.to_string(), REDACTED);
    }

    #[test]
    fn redacts_every_occurrence() {
        let secret = Secret::new("s3cr3t");
        let redactor = Redactor::new([&secret]);
        assert_eq!(
            redactor.redact("password=s3cr3t again s3cr3t"),
            format!("password={} again {}", REDACTED, REDACTED)
        );
    }

    #[test]
    fn longer_secret_wins_over_prefix() {
        let short = Secret::new("abc");
        let long = Secret::new("abcdef");
        let redactor = Redactor::new([&short, &long]);
        assert_eq!(redactor.redact("xabcdefx"), format!("x{}x", REDACTED));
    }

    #[test]
    fn empty_secret_is_ignored() {
        let empty = Secret::new("");
        let redactor = Redactor::new([&empty]);
        assert_eq!(redactor.redact("unchanged"), "unchanged");
    }
}
