//! Append-only diagnostic log attached to a session.
//!
//! Every line is prefixed with a millisecond Unix timestamp and mirrored to
//! `tracing`, so the same information lands in the console/file logs and in
//! the text shipped with full telemetry.

use chrono::Utc;

/// Monotonically growing, timestamped session log.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticLog {
    text: String,
    lines: usize,
}

impl DiagnosticLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an informational line.
    pub fn record(&mut self, message: &str) {
        tracing::debug!(target: "surge::session", "{message}");
        self.push(None, message);
    }

    /// Appends a warning line.
    pub fn warn(&mut self, message: &str) {
        tracing::warn!(target: "surge::session", "{message}");
        self.push(Some("WARN"), message);
    }

    fn push(&mut self, level: Option<&str>, message: &str) {
        let now = Utc::now().timestamp_millis();
        match level {
            Some(level) => self.text.push_str(&format!("{now} {level}: {message}\n")),
            None => self.text.push_str(&format!("{now}: {message}\n")),
        }
        self.lines += 1;
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn line_count(&self) -> usize {
        self.lines
    }

    /// Counts lines whose message starts with `prefix`.
    pub fn count_matching(&self, prefix: &str) -> usize {
        self.text
            .lines()
            .filter_map(|line| line.split_once(": ").map(|(_, message)| message))
            .filter(|message| message.starts_with(prefix))
            .count()
    }
}
