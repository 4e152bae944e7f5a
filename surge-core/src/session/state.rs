//! Session state shared between the orchestrator, the active phase and
//! status readers.
//!
//! One `SessionState` lives behind a lock for the lifetime of the engine.
//! Writers hold the lock only for a single field update and must present a
//! `PhaseTicket`; a ticket goes stale as soon as the session is aborted, moves
//! to another phase or is replaced, which turns late writes into no-ops.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Serialize, Serializer};

use super::log::DiagnosticLog;
use crate::measurement::Measurement;

/// Test id reported until telemetry assigns one.
pub const NO_TEST_ID: &str = "noID";

/// Overall status of the speed test session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestStatus {
    Idle,
    Starting,
    Download,
    Ping,
    Upload,
    Finished,
    Aborted,
}

impl TestStatus {
    /// Numeric status code used in the status payload.
    pub fn code(self) -> i8 {
        match self {
            Self::Idle => -1,
            Self::Starting => 0,
            Self::Download => 1,
            Self::Ping => 2,
            Self::Upload => 3,
            Self::Finished => 4,
            Self::Aborted => 5,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Download => "download",
            Self::Ping => "ping",
            Self::Upload => "upload",
            Self::Finished => "finished",
            Self::Aborted => "aborted",
        }
    }

    /// True while a session is running.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Download | Self::Ping | Self::Upload
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Aborted)
    }
}

impl Serialize for TestStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i8(self.code())
    }
}

/// Mutable record of the current session.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub session_id: u64,
    pub status: TestStatus,
    pub download: Measurement,
    pub upload: Measurement,
    pub ping: Measurement,
    pub jitter: Measurement,
    pub download_progress: f64,
    pub upload_progress: f64,
    pub ping_progress: f64,
    pub client_ip: String,
    /// Raw ISP details returned by the client lookup, kept for telemetry
    pub isp_info: Option<serde_json::Value>,
    pub test_id: Option<String>,
    pub log: DiagnosticLog,
}

impl SessionState {
    fn idle() -> Self {
        Self {
            session_id: 0,
            status: TestStatus::Idle,
            download: Measurement::Pending,
            upload: Measurement::Pending,
            ping: Measurement::Pending,
            jitter: Measurement::Pending,
            download_progress: 0.0,
            upload_progress: 0.0,
            ping_progress: 0.0,
            client_ip: String::new(),
            isp_info: None,
            test_id: None,
            log: DiagnosticLog::new(),
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::idle()
    }
}

/// Authorisation for a phase to write into the session.
///
/// Valid only while the session id matches and the status is unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTicket {
    pub session_id: u64,
    pub status: TestStatus,
}

/// Immutable copy of the session handed to status readers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub status: TestStatus,
    pub status_name: &'static str,
    pub download: Measurement,
    pub upload: Measurement,
    pub ping: Measurement,
    pub jitter: Measurement,
    pub client_ip: String,
    pub download_progress: f64,
    pub upload_progress: f64,
    pub ping_progress: f64,
    pub test_id: String,
    pub session_id: u64,
}

impl SessionSnapshot {
    fn of(state: &SessionState) -> Self {
        Self {
            status: state.status,
            status_name: state.status.name(),
            download: state.download,
            upload: state.upload,
            ping: state.ping,
            jitter: state.jitter,
            client_ip: state.client_ip.clone(),
            download_progress: state.download_progress,
            upload_progress: state.upload_progress,
            ping_progress: state.ping_progress,
            test_id: state
                .test_id
                .clone()
                .unwrap_or_else(|| NO_TEST_ID.to_string()),
            session_id: state.session_id,
        }
    }
}

/// Cloneable handle to the engine's session state.
#[derive(Debug, Clone, Default)]
pub struct SharedSession {
    inner: Arc<RwLock<SessionState>>,
}

impl SharedSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a consistent snapshot for status readers.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot::of(&self.inner.read())
    }

    pub fn status(&self) -> TestStatus {
        self.inner.read().status
    }

    /// Runs a read-only closure against the current state.
    pub fn read<R>(&self, f: impl FnOnce(&SessionState) -> R) -> R {
        f(&self.inner.read())
    }

    /// Replaces the state with a fresh session in `Starting`.
    pub fn begin(&self, session_id: u64) -> PhaseTicket {
        let mut state = self.inner.write();
        let log = std::mem::take(&mut state.log);
        *state = SessionState {
            session_id,
            status: TestStatus::Starting,
            log,
            ..SessionState::idle()
        };
        PhaseTicket {
            session_id,
            status: TestStatus::Starting,
        }
    }

    /// Checks that a ticket still authorises writes.
    pub fn is_current(&self, ticket: PhaseTicket) -> bool {
        let state = self.inner.read();
        state.session_id == ticket.session_id && state.status == ticket.status
    }

    /// Applies `f` if the ticket is current. Returns whether it ran.
    pub fn update(&self, ticket: PhaseTicket, f: impl FnOnce(&mut SessionState)) -> bool {
        let mut state = self.inner.write();
        if state.session_id != ticket.session_id || state.status != ticket.status {
            return false;
        }
        f(&mut state);
        true
    }

    /// Moves an active session to `status` and issues the matching ticket.
    pub fn transition(&self, session_id: u64, status: TestStatus) -> Option<PhaseTicket> {
        let mut state = self.inner.write();
        if state.session_id != session_id || !state.status.is_active() {
            return None;
        }
        state.status = status;
        Some(PhaseTicket { session_id, status })
    }

    /// Issues a ticket for the session's current status without changing it.
    pub fn ticket(&self, session_id: u64) -> Option<PhaseTicket> {
        let state = self.inner.read();
        (state.session_id == session_id && state.status.is_active()).then_some(PhaseTicket {
            session_id,
            status: state.status,
        })
    }

    /// Marks an active session finished, optionally with a telemetry id.
    pub fn finish(&self, session_id: u64, test_id: Option<String>) -> bool {
        let mut state = self.inner.write();
        if state.session_id != session_id || !state.status.is_active() {
            return false;
        }
        if test_id.is_some() {
            state.test_id = test_id;
        }
        state.status = TestStatus::Finished;
        state.log.record("test finished");
        true
    }

    /// Aborts the active session, clearing its readings.
    ///
    /// Returns false when no session was active; the state is left untouched.
    pub fn abort(&self) -> bool {
        let mut state = self.inner.write();
        if !state.status.is_active() {
            return false;
        }
        state.status = TestStatus::Aborted;
        state.download = Measurement::Pending;
        state.upload = Measurement::Pending;
        state.ping = Measurement::Pending;
        state.jitter = Measurement::Pending;
        state.log.record("manually aborted");
        true
    }

    /// Appends an informational line to the diagnostic log.
    pub fn record(&self, message: &str) {
        self.inner.write().log.record(message);
    }

    /// Appends a warning to the diagnostic log.
    pub fn warn(&self, message: &str) {
        self.inner.write().log.warn(message);
    }

    /// Copy of the full diagnostic log text.
    pub fn log_text(&self) -> String {
        self.inner.read().log.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(TestStatus::Idle.code(), -1);
        assert_eq!(TestStatus::Starting.code(), 0);
        assert_eq!(TestStatus::Download.code(), 1);
        assert_eq!(TestStatus::Ping.code(), 2);
        assert_eq!(TestStatus::Upload.code(), 3);
        assert_eq!(TestStatus::Finished.code(), 4);
        assert_eq!(TestStatus::Aborted.code(), 5);
        assert!(TestStatus::Upload.is_active());
        assert!(!TestStatus::Finished.is_active());
    }

    #[test]
    fn test_stale_ticket_cannot_write() {
        let session = SharedSession::new();
        session.begin(1);
        let ticket = session.transition(1, TestStatus::Download).unwrap();

        assert!(session.update(ticket, |s| s.download_progress = 0.5));
        assert!(session.transition(1, TestStatus::Upload).is_some());
        assert!(!session.update(ticket, |s| s.download_progress = 0.9));
        assert_eq!(session.snapshot().download_progress, 0.5);
    }

    #[test]
    fn test_abort_freezes_state() {
        let session = SharedSession::new();
        session.begin(7);
        let ticket = session.transition(7, TestStatus::Download).unwrap();
        session.update(ticket, |s| s.download = Measurement::Value(42.0));

        assert!(session.abort());
        let frozen = session.snapshot();
        assert_eq!(frozen.status, TestStatus::Aborted);
        assert_eq!(frozen.download, Measurement::Pending);

        assert!(!session.update(ticket, |s| s.download_progress = 1.0));
        assert!(session.transition(7, TestStatus::Upload).is_none());
        assert!(!session.finish(7, None));
        assert!(!session.abort());
        assert_eq!(session.snapshot(), frozen);
    }

    #[test]
    fn test_new_session_invalidates_old_tickets() {
        let session = SharedSession::new();
        let old = session.begin(1);
        session.begin(2);
        assert!(!session.is_current(old));
        assert_eq!(session.snapshot().session_id, 2);
    }

    #[test]
    fn test_snapshot_json_shape() {
        let session = SharedSession::new();
        let snapshot = serde_json::to_value(session.snapshot()).unwrap();
        assert_eq!(snapshot["status"], -1);
        assert_eq!(snapshot["status_name"], "idle");
        assert_eq!(snapshot["download"], "");
        assert_eq!(snapshot["test_id"], "noID");
    }

    #[test]
    fn test_log_survives_new_session() {
        let session = SharedSession::new();
        session.record("first");
        session.begin(1);
        session.record("second");
        assert_eq!(session.read(|s| s.log.line_count()), 2);
    }
}
