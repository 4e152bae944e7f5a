//! Command definitions for the speed test engine actor model.

use serde::Serialize;
use tokio::sync::oneshot;

use crate::session::{Phase, SessionSnapshot};

/// Commands that can be sent to the speed test engine actor.
///
/// Each command carries a response channel for the actor to send back its
/// result. Start and abort are serialised through the actor, so they never
/// race each other or a phase completion.
pub enum SpeedTestCommand {
    /// Start a session with optional JSON overrides.
    Start {
        overrides: Option<String>,
        responder: oneshot::Sender<StartOutcome>,
    },
    /// Abort the running session.
    Abort { responder: oneshot::Sender<bool> },
    /// Shutdown the engine actor gracefully.
    Shutdown { responder: oneshot::Sender<()> },
}

/// Internal notifications from phase and telemetry tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The phase dispatched for `session_id` finished.
    PhaseCompleted { session_id: u64, phase: Phase },
    /// The end-of-run telemetry submission finished.
    TelemetrySubmitted {
        session_id: u64,
        test_id: Option<String>,
    },
}

/// Result of a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StartOutcome {
    /// A new session began.
    Started { session_id: u64 },
    /// A session was already active; nothing changed.
    AlreadyRunning { session_id: u64 },
}

impl StartOutcome {
    pub fn session_id(self) -> u64 {
        match self {
            Self::Started { session_id } | Self::AlreadyRunning { session_id } => session_id,
        }
    }
}

/// Errors produced while parsing a text command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("Empty command")]
    Empty,

    #[error("Unknown command: {command}")]
    Unknown { command: String },
}

/// Text command protocol accepted by the control surface.
///
/// `status`, `abort`, or `start` optionally followed by a JSON object of
/// setting overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Status,
    Start { overrides: Option<String> },
    Abort,
}

impl ControlCommand {
    /// Parses one command line.
    ///
    /// # Errors
    /// - `CommandError::Empty` - Line is blank
    /// - `CommandError::Unknown` - Verb is not `status`, `start` or `abort`
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(CommandError::Empty);
        }
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };

        match verb.to_lowercase().as_str() {
            "status" => Ok(Self::Status),
            "abort" => Ok(Self::Abort),
            "start" => Ok(Self::Start {
                overrides: (!rest.is_empty()).then(|| rest.to_string()),
            }),
            _ => Err(CommandError::Unknown {
                command: verb.to_string(),
            }),
        }
    }
}

/// Reply to an executed `ControlCommand`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CommandResponse {
    Status(SessionSnapshot),
    Started(StartOutcome),
    Aborted { aborted: bool },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(ControlCommand::parse("status"), Ok(ControlCommand::Status));
        assert_eq!(ControlCommand::parse(" ABORT "), Ok(ControlCommand::Abort));
        assert_eq!(
            ControlCommand::parse("start"),
            Ok(ControlCommand::Start { overrides: None })
        );
        assert_eq!(
            ControlCommand::parse(r#"start {"time_dl": 5, "test_order": "D"}"#),
            Ok(ControlCommand::Start {
                overrides: Some(r#"{"time_dl": 5, "test_order": "D"}"#.to_string())
            })
        );
    }

    #[test]
    fn test_parse_rejects_unknown_and_empty() {
        assert_eq!(ControlCommand::parse("   "), Err(CommandError::Empty));
        assert_eq!(
            ControlCommand::parse("restart now"),
            Err(CommandError::Unknown {
                command: "restart".to_string()
            })
        );
    }

    #[test]
    fn test_start_outcome_json() {
        let json = serde_json::to_value(StartOutcome::Started { session_id: 3 }).unwrap();
        assert_eq!(json, serde_json::json!({"outcome": "started", "session_id": 3}));
        assert_eq!(StartOutcome::AlreadyRunning { session_id: 3 }.session_id(), 3);
    }
}
