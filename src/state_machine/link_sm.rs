//! Remote link state machine for the duplex bridge.
//!
//! ```text
//! Disconnected ──Dial──► Connecting ──Established──► Connected
//!      ▲                     │ Failed                   │
//!      └─────────────────────┴──────── Lost ◄───────────┘
//! ```
//!
//! One machine is shared by both relay directions; it lives inside the
//! bridge's connection slot and is only driven while that lock is held.

use statig::prelude::*;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A connect attempt is starting.
    Dial,
    /// The connect attempt succeeded; carries the new lease generation.
    Established { generation: u64 },
    /// The connect attempt failed and will be retried.
    Failed,
    /// I/O on the current connection failed.
    Lost,
}

// ---------------------------------------------------------------------------
// Shared storage
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct LinkMachine {
    /// Connect attempts since the last successful one.
    attempts: u32,
}

// ---------------------------------------------------------------------------
// State machine implementation
// ---------------------------------------------------------------------------

#[state_machine(
    initial = "State::disconnected()",
    state(derive(Debug, Clone, PartialEq, Eq))
)]
impl LinkMachine {
    #[state]
    fn disconnected(&mut self, event: &LinkEvent) -> Outcome<State> {
        match event {
            LinkEvent::Dial => {
                self.attempts += 1;
                Transition(State::connecting())
            }
            _ => Handled,
        }
    }

    #[state]
    fn connecting(&mut self, event: &LinkEvent) -> Outcome<State> {
        match event {
            LinkEvent::Established { generation } => {
                info!(target: "bridge", generation, attempts = self.attempts, "remote connected");
                self.attempts = 0;
                Transition(State::connected())
            }
            LinkEvent::Failed => {
                debug!(target: "bridge", attempts = self.attempts, "connect attempt failed");
                Transition(State::disconnected())
            }
            _ => Handled,
        }
    }

    #[state]
    fn connected(&mut self, event: &LinkEvent) -> Outcome<State> {
        match event {
            LinkEvent::Lost => {
                warn!(target: "bridge", "remote link lost");
                Transition(State::disconnected())
            }
            _ => Handled,
        }
    }
}

/// Coarse link status, for callers outside the slot lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Owned wrapper around the generated `StateMachine`.
pub struct LinkStateMachine {
    inner: StateMachine<LinkMachine>,
    losses: u64,
}

impl Default for LinkStateMachine {
    fn default() -> Self {
        Self {
            inner: LinkMachine::default().state_machine(),
            losses: 0,
        }
    }
}

impl LinkStateMachine {
    pub fn handle(&mut self, event: LinkEvent) {
        let was_connected = self.status() == LinkStatus::Connected;
        self.inner.handle(&event);
        if was_connected && self.status() == LinkStatus::Disconnected {
            self.losses += 1;
        }
    }

    pub fn status(&self) -> LinkStatus {
        match self.inner.state() {
            State::Disconnected {} => LinkStatus::Disconnected,
            State::Connecting {} => LinkStatus::Connecting,
            State::Connected {} => LinkStatus::Connected,
        }
    }

    /// Times a connected link has been lost.
    pub fn losses(&self) -> u64 {
        self.losses
    }
}
