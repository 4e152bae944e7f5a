//! Handle for communicating with the speed test engine actor.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use super::commands::{CommandResponse, ControlCommand, SpeedTestCommand, StartOutcome};
use crate::session::{SessionSnapshot, SharedSession};
use crate::{Result, SurgeError};

/// Handle for communicating with the speed test engine actor.
///
/// Cheap to clone and safe to share across tasks. Commands go through the
/// actor; `status` reads the shared session without waiting on it.
#[derive(Clone)]
pub struct SpeedTestHandle {
    sender: mpsc::Sender<SpeedTestCommand>,
    session: SharedSession,
}

impl SpeedTestHandle {
    /// Creates a new handle with the given command sender.
    pub fn new(sender: mpsc::Sender<SpeedTestCommand>, session: SharedSession) -> Self {
        Self { sender, session }
    }

    /// Starts a session, merging `overrides` (a JSON object) over the
    /// engine defaults. A no-op while a session is active.
    ///
    /// # Errors
    /// - `SurgeError::EngineShutdown` - The actor is no longer running
    pub async fn start(&self, overrides: Option<&str>) -> Result<StartOutcome> {
        let (responder, rx) = oneshot::channel();
        let cmd = SpeedTestCommand::Start {
            overrides: overrides.map(str::to_string),
            responder,
        };

        self.sender
            .send(cmd)
            .await
            .map_err(|_| SurgeError::EngineShutdown)?;

        rx.await.map_err(|_| SurgeError::EngineShutdown)
    }

    /// Aborts the active session. Returns whether anything was aborted.
    ///
    /// # Errors
    /// - `SurgeError::EngineShutdown` - The actor is no longer running
    pub async fn abort(&self) -> Result<bool> {
        let (responder, rx) = oneshot::channel();
        self.sender
            .send(SpeedTestCommand::Abort { responder })
            .await
            .map_err(|_| SurgeError::EngineShutdown)?;

        rx.await.map_err(|_| SurgeError::EngineShutdown)
    }

    /// Snapshot of the current session.
    pub fn status(&self) -> SessionSnapshot {
        self.session.snapshot()
    }

    /// Full diagnostic log text of the current session.
    pub fn diagnostic_log(&self) -> String {
        self.session.log_text()
    }

    pub fn is_running(&self) -> bool {
        self.session.status().is_active()
    }

    /// Executes a parsed text command.
    ///
    /// # Errors
    /// - `SurgeError::EngineShutdown` - The actor is no longer running
    pub async fn execute(&self, command: ControlCommand) -> Result<CommandResponse> {
        match command {
            ControlCommand::Status => Ok(CommandResponse::Status(self.status())),
            ControlCommand::Start { overrides } => self
                .start(overrides.as_deref())
                .await
                .map(CommandResponse::Started),
            ControlCommand::Abort => self
                .abort()
                .await
                .map(|aborted| CommandResponse::Aborted { aborted }),
        }
    }

    /// Polls the status every `poll` until no session is active.
    pub async fn wait_until_idle(&self, poll: Duration) -> SessionSnapshot {
        loop {
            let snapshot = self.status();
            if !snapshot.status.is_active() {
                return snapshot;
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Shuts the engine down, aborting any active session.
    ///
    /// # Errors
    /// - `SurgeError::EngineShutdown` - The actor already stopped
    pub async fn shutdown(&self) -> Result<()> {
        let (responder, rx) = oneshot::channel();
        self.sender
            .send(SpeedTestCommand::Shutdown { responder })
            .await
            .map_err(|_| SurgeError::EngineShutdown)?;

        rx.await.map_err(|_| SurgeError::EngineShutdown)
    }
}
