//! Phase orchestration for one speed test session at a time.
//!
//! The orchestrator lives inside the engine actor. It walks the configured
//! phase order, runs exactly one phase task at a time and advances only when
//! that task reports completion through the actor's event channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::commands::{EngineEvent, StartOutcome};
use crate::measurement::{
    ClientLookup, Direction, LatencyEstimator, PhaseContext, TelemetryReport, ThroughputSampler,
    TransferProfile, telemetry,
};
use crate::network::Transport;
use crate::session::{Phase, SharedSession, TelemetryLevel, TestSettings, TestStatus};

/// Length of the `_` pause between phases.
pub const PHASE_DELAY: Duration = Duration::from_secs(1);

/// Lifecycle of a non-delay phase within one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PhaseState {
    #[default]
    NotStarted,
    Running,
    Done,
}

/// Per-session record of which phases have run.
#[derive(Debug, Default, Clone)]
pub struct PhaseTracker {
    states: HashMap<Phase, PhaseState>,
}

impl PhaseTracker {
    pub fn state(&self, phase: Phase) -> PhaseState {
        self.states.get(&phase).copied().unwrap_or_default()
    }

    /// Claims `phase` for running. Delays can always run; any other phase
    /// only once per session.
    pub fn begin(&mut self, phase: Phase) -> bool {
        if phase == Phase::Delay {
            return true;
        }
        if self.state(phase) != PhaseState::NotStarted {
            return false;
        }
        self.states.insert(phase, PhaseState::Running);
        true
    }

    pub fn finish(&mut self, phase: Phase) {
        if phase != Phase::Delay {
            self.states.insert(phase, PhaseState::Done);
        }
    }
}

/// The session currently owned by the orchestrator.
struct ActiveRun {
    session_id: u64,
    settings: Arc<TestSettings>,
    profile: TransferProfile,
    position: usize,
    phases: PhaseTracker,
    in_flight: Option<(Phase, JoinHandle<()>)>,
    awaiting_telemetry: bool,
}

/// Drives speed test sessions phase by phase.
pub struct SpeedTestEngine {
    defaults: TestSettings,
    transport: Arc<dyn Transport>,
    session: SharedSession,
    events: mpsc::UnboundedSender<EngineEvent>,
    next_session_id: u64,
    run: Option<ActiveRun>,
}

impl SpeedTestEngine {
    pub fn new(
        defaults: TestSettings,
        transport: Arc<dyn Transport>,
        session: SharedSession,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            defaults,
            transport,
            session,
            events,
            next_session_id: 0,
            run: None,
        }
    }

    /// Starts a session unless one is already active.
    ///
    /// Overrides are merged over the defaults; problems with them become
    /// warnings in the diagnostic log and never prevent the start.
    pub fn start(&mut self, overrides: Option<&str>) -> StartOutcome {
        let status = self.session.status();
        if status.is_active() {
            tracing::debug!("Start ignored, session already {}", status.name());
            return StartOutcome::AlreadyRunning {
                session_id: self.next_session_id,
            };
        }

        self.next_session_id += 1;
        let session_id = self.next_session_id;
        let resolved = TestSettings::resolve(&self.defaults, overrides);
        self.session.begin(session_id);
        for warning in &resolved.warnings {
            self.session.warn(warning);
        }

        let profile = TransferProfile::detect(
            &self.transport.capabilities(),
            &resolved.settings,
            &resolved.overridden,
        );
        self.session
            .record(&format!("test started: {}", resolved.settings));
        self.session.record(&format!("transfer profile: {profile}"));
        tracing::info!(
            "Speed test session {} started with order {}",
            session_id,
            resolved.settings.order
        );

        self.run = Some(ActiveRun {
            session_id,
            settings: Arc::new(resolved.settings),
            profile,
            position: 0,
            phases: PhaseTracker::default(),
            in_flight: None,
            awaiting_telemetry: false,
        });
        self.advance();

        StartOutcome::Started { session_id }
    }

    /// Aborts the active session. Returns false when nothing was running.
    pub fn abort(&mut self) -> bool {
        // Results are cleared by the abort, so the report is taken first.
        let report = self
            .run
            .as_ref()
            .filter(|run| run.settings.telemetry_level == TelemetryLevel::Full)
            .map(|run| {
                self.session
                    .read(|state| TelemetryReport::from_session(state, &run.settings))
            });

        if !self.session.abort() {
            return false;
        }
        tracing::info!("Speed test session aborted");

        if let Some(run) = self.run.take() {
            if let Some((phase, task)) = run.in_flight {
                tracing::debug!("Cancelling in-flight {} phase", phase);
                task.abort();
            }
            if let Some(report) = report {
                let transport = self.transport.clone();
                let session = self.session.clone();
                let settings = run.settings.clone();
                tokio::spawn(async move {
                    telemetry::submit_report(transport.as_ref(), &settings, &session, &report)
                        .await;
                });
            }
        }
        true
    }

    /// Handles a completion event from a phase or telemetry task.
    pub fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::PhaseCompleted { session_id, phase } => {
                self.on_phase_completed(session_id, phase)
            }
            EngineEvent::TelemetrySubmitted {
                session_id,
                test_id,
            } => self.on_telemetry_submitted(session_id, test_id),
        }
    }

    fn on_phase_completed(&mut self, session_id: u64, phase: Phase) {
        let Some(run) = self.run.as_mut() else {
            tracing::debug!("Ignoring late {} completion for session {}", phase, session_id);
            return;
        };
        let expected = run.in_flight.as_ref().map(|(p, _)| *p);
        if run.session_id != session_id || expected != Some(phase) {
            tracing::debug!("Ignoring stale {} completion for session {}", phase, session_id);
            return;
        }

        run.in_flight = None;
        run.phases.finish(phase);
        self.advance();
    }

    fn on_telemetry_submitted(&mut self, session_id: u64, test_id: Option<String>) {
        let matches = self
            .run
            .as_ref()
            .is_some_and(|run| run.session_id == session_id && run.awaiting_telemetry);
        if !matches {
            return;
        }
        if let Some(id) = &test_id {
            self.session.record(&format!("telemetry accepted, test id {id}"));
        }
        self.finish(session_id, test_id);
    }

    /// Dispatches the next runnable phase, or wraps up the session.
    fn advance(&mut self) {
        let Some(run) = self.run.as_mut() else {
            return;
        };

        let next = loop {
            let Some(phase) = run.settings.order.get(run.position) else {
                break None;
            };
            run.position += 1;
            if run.phases.begin(phase) {
                break Some(phase);
            }
            self.session
                .record(&format!("{phase} already ran this session, skipping"));
        };

        match next {
            Some(phase) => self.dispatch(phase),
            None => self.complete_order(),
        }
    }

    fn dispatch(&mut self, phase: Phase) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        let session_id = run.session_id;

        let ticket = match phase {
            Phase::Download => self.session.transition(session_id, TestStatus::Download),
            Phase::Upload => self.session.transition(session_id, TestStatus::Upload),
            Phase::Ping => self.session.transition(session_id, TestStatus::Ping),
            Phase::ClientLookup | Phase::Delay => self.session.ticket(session_id),
        };
        let Some(ticket) = ticket else {
            tracing::debug!("Session {} no longer active, not starting {}", session_id, phase);
            return;
        };

        tracing::debug!("Session {} dispatching {} phase", session_id, phase);
        let ctx = PhaseContext {
            settings: run.settings.clone(),
            profile: run.profile,
            transport: self.transport.clone(),
            session: self.session.clone(),
            ticket,
        };
        let events = self.events.clone();

        let task = tokio::spawn(async move {
            match phase {
                Phase::ClientLookup => {
                    ClientLookup::new(ctx).run().await;
                }
                Phase::Download => {
                    ThroughputSampler::new(Direction::Download, ctx).run().await;
                }
                Phase::Upload => {
                    ThroughputSampler::new(Direction::Upload, ctx).run().await;
                }
                Phase::Ping => {
                    LatencyEstimator::new(ctx).run().await;
                }
                Phase::Delay => tokio::time::sleep(PHASE_DELAY).await,
            }
            let _ = events.send(EngineEvent::PhaseCompleted { session_id, phase });
        });
        run.in_flight = Some((phase, task));
    }

    /// The order is exhausted: submit telemetry if enabled, then finish.
    fn complete_order(&mut self) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        let session_id = run.session_id;

        if !run.settings.telemetry_level.is_enabled() {
            self.finish(session_id, None);
            return;
        }

        run.awaiting_telemetry = true;
        self.session.record("sending telemetry");
        let transport = self.transport.clone();
        let session = self.session.clone();
        let settings = run.settings.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let test_id = telemetry::submit(transport.as_ref(), &settings, &session).await;
            let _ = events.send(EngineEvent::TelemetrySubmitted {
                session_id,
                test_id,
            });
        });
    }

    fn finish(&mut self, session_id: u64, test_id: Option<String>) {
        if self.session.finish(session_id, test_id) {
            let snapshot = self.session.snapshot();
            tracing::info!(
                "Speed test session {} finished: dl={} ul={} ping={} jitter={}",
                session_id,
                snapshot.download,
                snapshot.upload,
                snapshot.ping,
                snapshot.jitter
            );
        }
        self.run = None;
    }

    /// Cancels everything on actor shutdown.
    pub fn shutdown(&mut self) {
        self.abort();
        self.run = None;
    }

    pub fn session(&self) -> &SharedSession {
        &self.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_runs_each_phase_once() {
        let mut tracker = PhaseTracker::default();
        assert_eq!(tracker.state(Phase::Download), PhaseState::NotStarted);
        assert!(tracker.begin(Phase::Download));
        assert_eq!(tracker.state(Phase::Download), PhaseState::Running);
        assert!(!tracker.begin(Phase::Download));

        tracker.finish(Phase::Download);
        assert_eq!(tracker.state(Phase::Download), PhaseState::Done);
        assert!(!tracker.begin(Phase::Download));
    }

    #[test]
    fn test_tracker_always_allows_delays() {
        let mut tracker = PhaseTracker::default();
        assert!(tracker.begin(Phase::Delay));
        tracker.finish(Phase::Delay);
        assert!(tracker.begin(Phase::Delay));
        assert_eq!(tracker.state(Phase::Delay), PhaseState::NotStarted);
    }
}
