//! State every driver shares: the event sink, turn bookkeeping and the
//! supervised backend process.

use std::{
    path::Path,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::process::{ChildStdin, ChildStdout};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use agent_bridge_core::{AgentEvent, AgentType, DriverError, EventSink, InitInfo};

use crate::{
    config::BackendConfig,
    process::{self, ProcessHandle},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Phase {
    #[default]
    Created,
    Starting,
    Ready,
    Stopped,
}

#[derive(Debug, Default)]
struct TurnState {
    phase: Phase,
    in_flight: bool,
    /// Bumped by every `begin_turn`.
    generation: u64,
    agent_id: String,
    session_id: Option<String>,
}

/// Driver-side bookkeeping for one `start()`..`stop()` span.
pub struct DriverCore {
    agent_type: AgentType,
    config: BackendConfig,
    sink: EventSink,
    state: Mutex<TurnState>,
    exit_sent: AtomicBool,
    closed: CancellationToken,
    process: Mutex<Option<ProcessHandle>>,
}

impl DriverCore {
    pub fn new(agent_type: AgentType, config: BackendConfig, sink: EventSink) -> Arc<Self> {
        Arc::new(Self {
            agent_type,
            config,
            sink,
            state: Mutex::new(TurnState::default()),
            exit_sent: AtomicBool::new(false),
            closed: CancellationToken::new(),
            process: Mutex::new(None),
        })
    }

    fn state(&self) -> MutexGuard<'_, TurnState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub const fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    pub const fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn agent_id(&self) -> String {
        self.state().agent_id.clone()
    }

    pub fn emit(&self, event: AgentEvent) {
        tracing::trace!(agent_type = %self.agent_type, kind = event.kind(), "Driver event");
        if self.sink.send(event).is_err() {
            tracing::debug!(agent_type = %self.agent_type, "Event sink closed; dropping event");
        }
    }

    pub fn emit_error(&self, message: impl std::fmt::Display) {
        self.emit(AgentEvent::error(message));
    }

    /// Emit `exit` unless one was already emitted for this span.
    pub fn emit_exit(&self, code: Option<i32>, signal: Option<String>) {
        if self.exit_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.state();
            state.phase = Phase::Stopped;
            state.in_flight = false;
        }
        self.closed.cancel();
        tracing::info!(agent_id = %self.agent_id(), ?code, ?signal, "Backend exited");
        self.emit(AgentEvent::Exit { code, signal });
    }

    /// Claim the single start of this span.
    pub fn begin_start(&self, agent_id: &str) -> Result<(), DriverError> {
        let mut state = self.state();
        if state.phase != Phase::Created {
            return Err(DriverError::AlreadyStarted);
        }
        state.phase = Phase::Starting;
        agent_id.clone_into(&mut state.agent_id);
        Ok(())
    }

    /// Finish the handshake and emit `init`. Later calls only refresh the
    /// session id.
    pub fn mark_ready(&self, info: InitInfo) {
        let first = {
            let mut state = self.state();
            if info.session_id.is_some() {
                state.session_id.clone_from(&info.session_id);
            }
            match state.phase {
                Phase::Starting => {
                    state.phase = Phase::Ready;
                    true
                }
                _ => false,
            }
        };
        if first {
            self.emit(AgentEvent::Init(info));
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state().phase == Phase::Ready
    }

    pub fn is_stopped(&self) -> bool {
        self.state().phase == Phase::Stopped
    }

    pub fn session_id(&self) -> Option<String> {
        self.state().session_id.clone()
    }

    pub fn set_session_id(&self, session_id: Option<String>) {
        if session_id.is_some() {
            self.state().session_id = session_id;
        }
    }

    /// Claim the turn slot and return the new turn's generation. The error is
    /// the message for the `error` event.
    pub fn begin_turn(&self) -> Result<u64, &'static str> {
        let mut state = self.state();
        match state.phase {
            Phase::Ready if state.in_flight => Err("A turn is already in flight"),
            Phase::Ready => {
                state.in_flight = true;
                state.generation += 1;
                Ok(state.generation)
            }
            Phase::Stopped => Err("Agent has stopped"),
            Phase::Created | Phase::Starting => Err("Agent is not ready"),
        }
    }

    /// Release the turn slot. Returns whether a turn was in flight.
    pub fn end_turn(&self) -> bool {
        std::mem::take(&mut self.state().in_flight)
    }

    /// Release the turn slot only if turn `generation` still holds it.
    pub fn end_turn_of(&self, generation: u64) -> bool {
        let mut state = self.state();
        if state.in_flight && state.generation == generation {
            state.in_flight = false;
            true
        } else {
            false
        }
    }

    /// Generation of the turn in flight, if any.
    pub fn current_turn(&self) -> Option<u64> {
        let state = self.state();
        state.in_flight.then_some(state.generation)
    }

    pub fn in_flight(&self) -> bool {
        self.state().in_flight
    }

    /// Enter the stopped phase and kill the process. Returns `false` if the
    /// span had already stopped.
    pub fn stop(&self) -> bool {
        let was_running = {
            let mut state = self.state();
            state.in_flight = false;
            std::mem::replace(&mut state.phase, Phase::Stopped) != Phase::Stopped
        };
        self.closed.cancel();
        self.kill_process();
        was_running
    }

    /// Resolves once the span has stopped or the backend exited.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    pub fn has_process(&self) -> bool {
        self.process
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn kill_process(&self) {
        let handle = self
            .process
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handle) = handle {
            handle.kill();
        }
    }

    /// Launch the configured backend command with piped stdio.
    ///
    /// The process is supervised: its exit becomes the span's `exit` event.
    pub async fn spawn_backend(
        self: &Arc<Self>,
        cwd: &Path,
        extra_args: &[String],
    ) -> Result<(ChildStdin, ChildStdout), DriverError> {
        let (program, args) = self
            .config
            .command_builder()
            .build(extra_args)
            .map_err(|e| DriverError::SpawnFailed(e.to_string()))?
            .into_resolved()
            .await
            .map_err(|e| DriverError::SpawnFailed(e.to_string()))?;

        tracing::info!(
            agent_id = %self.agent_id(),
            agent_type = %self.agent_type,
            program = %program.display(),
            ?args,
            cwd = %cwd.display(),
            "Launching backend"
        );

        let core = Arc::clone(self);
        let spawned = process::spawn_supervised(&program, &args, cwd, move |exit| {
            core.emit_exit(exit.code, exit.signal);
        })?;

        if let Some(stderr) = spawned.stderr {
            process::drain_to_log(stderr, self.agent_id());
        }
        *self.process.lock().unwrap_or_else(PoisonError::into_inner) = Some(spawned.handle);

        Ok((spawned.stdin, spawned.stdout))
    }
}
