//! Command surface between the outside world and the orchestrator thread.
//!
//! Callers enqueue commands and read the last published [`AgentState`]; both
//! live behind one mutex. The orchestrator drains the queue only at its
//! checkpoints, so a command never lands in the middle of an iteration.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;

use crate::agent_engine::state::{ActiveHours, AgentMode, AgentState};

#[derive(Debug, Clone, PartialEq)]
pub enum AgentCommand {
    Start { mode: AgentMode, goal: Option<String> },
    Stop,
    Pause,
    Resume,
    Restart,
    SetActiveWindow(Option<String>),
    SetActiveHours(Option<ActiveHours>),
    /// Ends the orchestrator thread after the current checkpoint.
    Shutdown,
}

struct Shared {
    state: AgentState,
    commands: VecDeque<AgentCommand>,
}

struct ControlInner {
    shared: Mutex<Shared>,
    wake: Notify,
}

/// Cloneable handle held by the control surface and by the orchestrator.
#[derive(Clone)]
pub struct AgentHandle {
    inner: Arc<ControlInner>,
}

impl AgentHandle {
    pub fn new(initial: AgentState) -> Self {
        Self {
            inner: Arc::new(ControlInner {
                shared: Mutex::new(Shared {
                    state: initial,
                    commands: VecDeque::new(),
                }),
                wake: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        // A panic while holding the lock cannot leave a half-written record:
        // the state is only ever replaced wholesale.
        self.inner.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn send(&self, command: AgentCommand) {
        tracing::debug!(?command, "command queued");
        self.lock().commands.push_back(command);
        self.inner.wake.notify_one();
    }

    pub fn start(&self, mode: AgentMode, goal: Option<String>) {
        self.send(AgentCommand::Start { mode, goal });
    }

    pub fn stop(&self) {
        self.send(AgentCommand::Stop);
    }

    pub fn pause(&self) {
        self.send(AgentCommand::Pause);
    }

    pub fn resume(&self) {
        self.send(AgentCommand::Resume);
    }

    pub fn restart(&self) {
        self.send(AgentCommand::Restart);
    }

    pub fn set_active_window(&self, hint: Option<String>) {
        self.send(AgentCommand::SetActiveWindow(hint));
    }

    pub fn set_active_hours(&self, hours: Option<ActiveHours>) {
        self.send(AgentCommand::SetActiveHours(hours));
    }

    pub fn shutdown(&self) {
        self.send(AgentCommand::Shutdown);
    }

    /// A complete copy of the most recently published state.
    pub fn state(&self) -> AgentState {
        self.lock().state.clone()
    }

    pub(crate) fn publish(&self, state: &AgentState) {
        self.lock().state = state.clone();
    }

    pub(crate) fn drain(&self) -> Vec<AgentCommand> {
        self.lock().commands.drain(..).collect()
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.lock().commands.is_empty()
    }

    /// Parks until at least one command is queued.
    pub(crate) async fn wait_for_command(&self) {
        while !self.has_pending() {
            self.inner.wake.notified().await;
        }
    }

    /// Sleeps for `duration`, returning early only if a command is waiting.
    pub(crate) async fn sleep_interruptible(&self, duration: Duration) {
        let deadline = tokio::time::Instant::now() + duration;
        loop {
            if self.has_pending() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return,
                _ = self.inner.wake.notified() => {}
            }
        }
    }
}
