//! Surge Core - Network speed test measurement engine
//!
//! This crate provides the building blocks for measuring download throughput,
//! upload throughput, latency and jitter against a single server endpoint:
//! the phase orchestrator, the multi-stream throughput sampler, the latency
//! estimator, the network transport layer and session state reporting.

pub mod config;
pub mod engine;
pub mod measurement;
pub mod network;
pub mod session;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::SurgeConfig;
pub use engine::{
    CommandError, CommandResponse, ControlCommand, SpeedTestHandle, StartOutcome,
    spawn_speed_test_engine,
};
pub use measurement::{Direction, Measurement};
pub use network::{HttpTransport, SimulatedTransport, Transport, TransportError};
pub use session::{SessionSnapshot, SettingsError, SharedSession, TestSettings, TestStatus};

/// Core errors that can bubble up from any Surge subsystem.
///
/// High-level error types representing failures in core functionality.
#[derive(Debug, thiserror::Error)]
pub enum SurgeError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Speed test engine has shut down")]
    EngineShutdown,
}

impl SurgeError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            SurgeError::Transport(e) => match e {
                TransportError::ConnectionFailed { url, .. } => {
                    format!("Could not reach test server: {url}")
                }
                TransportError::HttpStatus { url, status } => {
                    format!("Test server answered {status} for {url}")
                }
                _ => "Network error occurred".to_string(),
            },
            SurgeError::Settings(e) => format!("Invalid test settings: {e}"),
            SurgeError::Command(e) => format!("Invalid command: {e}"),
            SurgeError::Configuration { reason } => format!("Configuration error: {reason}"),
            SurgeError::Io(_) => "File system error occurred".to_string(),
            SurgeError::EngineShutdown => "The speed test engine is not running".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            SurgeError::Configuration { .. } | SurgeError::Settings(_) | SurgeError::Command(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SurgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_for_connection_failure() {
        let error = SurgeError::Transport(TransportError::ConnectionFailed {
            url: "http://speed.example.com/empty".to_string(),
            reason: "refused".to_string(),
        });
        assert_eq!(
            error.user_message(),
            "Could not reach test server: http://speed.example.com/empty"
        );
        assert!(!error.is_user_error());
    }

    #[test]
    fn test_configuration_errors_are_user_errors() {
        let error = SurgeError::Configuration {
            reason: "bad server url".to_string(),
        };
        assert!(error.is_user_error());
        assert!(!SurgeError::EngineShutdown.is_user_error());
    }

    #[test]
    fn test_command_errors_convert() {
        let error: SurgeError = ControlCommand::parse("reboot").unwrap_err().into();
        assert!(error.is_user_error());
        assert!(error.user_message().starts_with("Invalid command"));
    }
}
