//! Session configuration, shared state and diagnostic log.

pub mod log;
pub mod settings;
pub mod state;

pub use log::DiagnosticLog;
pub use settings::{
    DistanceUnit, Endpoints, ErrorPolicy, Phase, ResolvedSettings, SettingsError,
    TelemetryLevel, TestOrder, TestSettings, UnitBase,
};
pub use state::{
    NO_TEST_ID, PhaseTicket, SessionSnapshot, SessionState, SharedSession, TestStatus,
};
