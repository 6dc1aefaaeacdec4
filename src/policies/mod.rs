//! Retry and restart policies.
//!
//! ## Contents
//! - [`BackoffPolicy`] how broker reconnect delays evolve (first / factor / max + jitter)
//! - [`JitterPolicy`]  randomization of reconnect delays
//! - [`RestartPolicy`] restart budget and scheduled forced restarts for the stream
//!
//! ## Quick wiring
//! ```text
//! BrokerConnection ──► backoff.next(retry_counter) before every reconnect
//! StreamSupervisor ──► restart.hard_limit on every restart request
//!                  └─► restart.forced_interval drives the scheduled restart timer
//! ```

mod backoff;
mod jitter;
mod restart;

pub use backoff::BackoffPolicy;
pub use jitter::JitterPolicy;
pub use restart::{RestartPolicy, DEFAULT_FORCED_RESTART, DEFAULT_RESTART_LIMIT};
