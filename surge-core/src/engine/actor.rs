//! Actor implementation for the speed test engine.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::commands::{EngineEvent, SpeedTestCommand};
use super::handle::SpeedTestHandle;
use super::orchestrator::SpeedTestEngine;
use crate::config::SurgeConfig;
use crate::network::Transport;
use crate::session::SharedSession;

/// Spawns the speed test engine actor and returns its handle.
///
/// The actor processes start and abort commands and phase completion events
/// sequentially. Status reads bypass the actor and snapshot the shared
/// session directly.
///
/// # Examples
/// ```rust,no_run
/// # #[tokio::main]
/// # async fn main() {
/// use std::sync::Arc;
/// use surge_core::config::SurgeConfig;
/// use surge_core::engine::spawn_speed_test_engine;
/// use surge_core::network::SimulatedTransport;
///
/// let handle = spawn_speed_test_engine(SurgeConfig::default(), Arc::new(SimulatedTransport::default()));
/// handle.start(None).await.unwrap();
/// # }
/// ```
pub fn spawn_speed_test_engine<T>(config: SurgeConfig, transport: Arc<T>) -> SpeedTestHandle
where
    T: Transport + 'static,
{
    let (sender, receiver) = mpsc::channel(32);
    let (event_sender, event_receiver) = mpsc::unbounded_channel();
    let session = SharedSession::new();
    let transport: Arc<dyn Transport> = transport;
    let engine = SpeedTestEngine::new(config.defaults, transport, session.clone(), event_sender);

    tokio::spawn(async move {
        run_actor_loop(engine, receiver, event_receiver).await;
    });

    SpeedTestHandle::new(sender, session)
}

/// Runs the main actor message processing loop.
///
/// The loop ends on a shutdown command or once every handle is dropped.
async fn run_actor_loop(
    mut engine: SpeedTestEngine,
    mut receiver: mpsc::Receiver<SpeedTestCommand>,
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
) {
    tracing::debug!("Speed test engine actor started");

    loop {
        tokio::select! {
            command = receiver.recv() => match command {
                Some(command) => {
                    if !handle_command(&mut engine, command) {
                        break;
                    }
                }
                None => {
                    engine.shutdown();
                    break;
                }
            },
            Some(event) = events.recv() => engine.handle_event(event),
        }
    }

    tracing::debug!("Speed test engine actor stopped");
}

/// Handles a single command. Returns true to continue processing, false to
/// shutdown.
fn handle_command(engine: &mut SpeedTestEngine, command: SpeedTestCommand) -> bool {
    match command {
        SpeedTestCommand::Start {
            overrides,
            responder,
        } => {
            let outcome = engine.start(overrides.as_deref());
            let _ = responder.send(outcome);
        }

        SpeedTestCommand::Abort { responder } => {
            let _ = responder.send(engine.abort());
        }

        SpeedTestCommand::Shutdown { responder } => {
            tracing::debug!("Speed test engine actor shutting down");
            engine.shutdown();
            let _ = responder.send(());
            return false;
        }
    }

    true
}
