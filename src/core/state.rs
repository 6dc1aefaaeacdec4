//! # Supervisor state machine.
//!
//! [`SupervisorState`] is a plain value: no I/O, no clocks, no locks. The supervisor holds
//! it behind a mutex and is the only writer; everything about restart admission is
//! decided here and can be tested without timing.
//!
//! ```text
//!                 finish(true)                       admit() == Proceed
//! Initializing ───────────────► Streaming ─────────────────────────────► Restarting
//!      │                          ▲   ▲                                      │
//!      │ finish(false)            │   └──────────── finish(true) ────────────┤
//!      ▼                          │                                          │
//!   Stalled ◄─────────────────────┼──────────────── finish(false) ───────────┘
//!      │      admit() == Proceed  │
//!      └──────────────────────────┘ (via Restarting)
//!
//! any ──begin_shutdown()──► ShuttingDown (terminal)
//! ```
//!
//! ## Restart admission, in order
//! 1. shutting down → `Busy`
//! 2. `restart_count >= hard_limit` → `Exhausted` (caller shuts down)
//! 3. the request comes from a fault → `restart_count += 1`
//! 4. phase is not `Streaming`/`Stalled` (bring-up or restart in flight) → `Busy`
//! 5. otherwise → phase := `Restarting`, `Proceed`
//!
//! Every finished attempt resets `restart_count` to 0. Faults only accumulate while an
//! attempt is in flight, so the budget is spent by faults that keep arriving before a
//! sequence can complete.

use crate::policies::DEFAULT_RESTART_LIMIT;

/// Supervisor lifecycle phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// First bring-up in progress.
    Initializing,
    /// Encoder, feed loop and frame source are up.
    Streaming,
    /// The last bring-up failed; nothing is streaming, restarts are accepted.
    Stalled,
    /// A restart sequence is in flight.
    Restarting,
    /// Terminal.
    ShuttingDown,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Initializing => "initializing",
            Phase::Streaming => "streaming",
            Phase::Stalled => "stalled",
            Phase::Restarting => "restarting",
            Phase::ShuttingDown => "shutting-down",
        }
    }
}

/// Why a restart was requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestartCause {
    /// `restart` command over the control plane.
    Command,
    /// Uncaught fault (panic, unexpected encoder exit, failed bring-up).
    Fault,
    /// Forced restart timer.
    Scheduled,
}

impl RestartCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartCause::Command => "command",
            RestartCause::Fault => "fault",
            RestartCause::Scheduled => "scheduled",
        }
    }
}

/// Outcome of [`SupervisorState::admit`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Run the restart sequence, then call [`SupervisorState::finish`].
    Proceed,
    /// Another sequence is in flight or shutdown began; report `false`.
    Busy,
    /// Restart budget spent; shut down instead.
    Exhausted,
}

/// Restart bookkeeping and lifecycle phase.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SupervisorState {
    phase: Phase,
    restart_count: u32,
    hard_limit: u32,
}

impl Default for SupervisorState {
    fn default() -> Self {
        Self::new(DEFAULT_RESTART_LIMIT)
    }
}

impl SupervisorState {
    pub fn new(hard_limit: u32) -> Self {
        Self {
            phase: Phase::Initializing,
            restart_count: 0,
            hard_limit,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    pub fn hard_limit(&self) -> u32 {
        self.hard_limit
    }

    /// Whether a restart sequence (or the first bring-up) is in flight.
    pub fn is_restarting(&self) -> bool {
        matches!(self.phase, Phase::Initializing | Phase::Restarting)
    }

    /// Decides what to do with a restart request.
    pub fn admit(&mut self, cause: RestartCause) -> Admission {
        if self.phase == Phase::ShuttingDown {
            return Admission::Busy;
        }
        if self.restart_count >= self.hard_limit {
            return Admission::Exhausted;
        }
        if cause == RestartCause::Fault {
            self.restart_count = self.restart_count.saturating_add(1);
        }
        match self.phase {
            Phase::Streaming | Phase::Stalled => {
                self.phase = Phase::Restarting;
                Admission::Proceed
            }
            _ => Admission::Busy,
        }
    }

    /// Ends a bring-up or restart attempt.
    pub fn finish(&mut self, ok: bool) {
        self.restart_count = 0;
        if self.is_restarting() {
            self.phase = if ok { Phase::Streaming } else { Phase::Stalled };
        }
    }

    /// Enters `ShuttingDown`. Returns `true` only for the first call.
    pub fn begin_shutdown(&mut self) -> bool {
        if self.phase == Phase::ShuttingDown {
            return false;
        }
        self.phase = Phase::ShuttingDown;
        true
    }
}
