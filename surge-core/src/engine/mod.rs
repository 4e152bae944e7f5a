//! Speed test engine using the actor model.
//!
//! One actor task owns the phase orchestrator. Callers talk to it through a
//! cloneable `SpeedTestHandle`; phase tasks report back through an internal
//! event channel.

pub mod actor;
pub mod commands;
pub mod handle;
pub mod orchestrator;

pub use actor::spawn_speed_test_engine;
pub use commands::{
    CommandError, CommandResponse, ControlCommand, EngineEvent, SpeedTestCommand, StartOutcome,
};
pub use handle::SpeedTestHandle;
pub use orchestrator::{PHASE_DELAY, PhaseState, PhaseTracker, SpeedTestEngine};
