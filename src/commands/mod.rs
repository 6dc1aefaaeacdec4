//! Inbound command handling.
//!
//! - [`CommandDispatcher`] topic → handler routing, one message at a time
//! - [`ControlTarget`] the supervisor surface handlers may use
//! - [`evaluate`], [`prepare_script`] remote script execution for `eval`
//! - [`normalize`], [`RemoteValue`] canonical string form of evaluation results

mod dispatcher;
mod eval;
mod normalize;

pub use dispatcher::{CommandContext, CommandDispatcher, CommandHandler, ControlTarget};
pub use eval::{evaluate, prepare_script, EvalRequest, EvalResponse};
pub use normalize::{normalize, RemoteValue};
