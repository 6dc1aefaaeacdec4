//! # Event subscribers for the streamvisor runtime.
//!
//! ## Architecture
//! ```text
//! Event flow:
//!   Supervisor / BrokerConnection ── publish(Event) ──► Bus ──► event listener
//!                                                                    │
//!                                                          SubscriberSet::emit(&Event)
//!                                                        ┌───────────┼───────────┐
//!                                                        ▼           ▼           ▼
//!                                                    LogWriter    Metrics      Custom
//! ```

mod log;
mod set;
mod subscribe;

pub use log::LogWriter;
pub use set::SubscriberSet;
pub use subscribe::Subscribe;
