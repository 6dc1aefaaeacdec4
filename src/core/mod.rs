//! Runtime core: lifecycle state and the stream supervisor.
//!
//! Internal modules:
//! - [`state`]: restart admission and lifecycle phases, no I/O;
//! - [`supervisor`]: owns the encoder, the frame source and the broker connection;
//! - [`shutdown`]: cross-platform termination signal handling.

mod shutdown;
mod state;
mod supervisor;

pub use shutdown::{wait_for_shutdown_signal, ShutdownSignal};
pub use state::{Admission, Phase, RestartCause, SupervisorState};
pub use supervisor::{load_startup_frame, Collaborators, FaultReporter, StreamSupervisor};
