//! Error types used by the streamvisor runtime and its collaborators.
//!
//! One enum per concern:
//!
//! - [`RuntimeError`]: errors raised by the supervisor itself.
//! - [`BrokerError`]: transport faults on the control-plane connection.
//! - [`ProcessError`]: encoder spawn/teardown faults.
//! - [`SourceError`]: faults reported by the frame source / page collaborator.
//! - [`StartError`]: why a bring-up of encoder and frame source failed.
//! - [`CommandError`]: malformed or unserviceable control messages.
//! - [`ConfigError`]: configuration loading and validation.
//!
//! Each type provides `as_label` (stable snake_case label for logs/events).

use std::time::Duration;
use thiserror::Error;

/// # Errors produced by the supervisor runtime.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Shutdown grace period was exceeded while waiting for the control plane to drain.
    #[error("shutdown timeout {grace:?} exceeded; stuck: {stuck:?}; forcing termination")]
    GraceExceeded {
        /// The configured grace duration.
        grace: Duration,
        /// Components that did not stop in time.
        stuck: Vec<String>,
    },

    /// Configuration rejected at startup.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// OS-level failure (signal registration, etc.).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs/events.
    ///
    /// # Example
    /// ```
    /// use streamvisor::RuntimeError;
    /// use std::time::Duration;
    ///
    /// let err = RuntimeError::GraceExceeded { grace: Duration::from_secs(5), stuck: vec![] };
    /// assert_eq!(err.as_label(), "runtime_grace_exceeded");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::GraceExceeded { .. } => "runtime_grace_exceeded",
            RuntimeError::Config(_) => "runtime_config",
            RuntimeError::Io(_) => "runtime_io",
        }
    }
}

/// # Transport faults on the control-plane connection.
///
/// Always retried via reconnect backoff; never surfaced to a remote caller
/// except as a missing reply.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Could not establish a session.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Outbound message could not be sent.
    #[error("publish to {topic} failed: {reason}")]
    Publish {
        /// Destination topic.
        topic: String,
        /// Transport-specific reason.
        reason: String,
    },

    /// Subscription could not be opened.
    #[error("subscribe to {pattern} failed: {reason}")]
    Subscribe {
        /// Requested subject pattern.
        pattern: String,
        /// Transport-specific reason.
        reason: String,
    },

    /// Drain did not complete cleanly.
    #[error("drain failed: {0}")]
    Drain(String),

    /// No live session (disconnected, connecting, draining or closed).
    #[error("not connected")]
    NotConnected,

    /// A request did not receive its reply in time.
    #[error("no reply on {topic} within {timeout:?}")]
    Timeout {
        /// Request topic.
        topic: String,
        /// Bounded wait that elapsed.
        timeout: Duration,
    },

    /// The session or subscription was closed underneath the caller.
    #[error("session closed")]
    Closed,

    /// Envelope/payload (de)serialization failure.
    #[error("codec error: {0}")]
    Codec(String),
}

impl BrokerError {
    /// Returns a short stable label (snake_case) for use in logs/events.
    pub fn as_label(&self) -> &'static str {
        match self {
            BrokerError::Connect(_) => "broker_connect",
            BrokerError::Publish { .. } => "broker_publish",
            BrokerError::Subscribe { .. } => "broker_subscribe",
            BrokerError::Drain(_) => "broker_drain",
            BrokerError::NotConnected => "broker_not_connected",
            BrokerError::Timeout { .. } => "broker_timeout",
            BrokerError::Closed => "broker_closed",
            BrokerError::Codec(_) => "broker_codec",
        }
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::Codec(e.to_string())
    }
}

/// # Encoder process faults.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ProcessError {
    /// The encoder binary could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The child was spawned without a piped stdin.
    #[error("encoder stdin unavailable")]
    MissingInput,

    /// Termination was requested but the process tree did not exit in time.
    #[error("process {pid:?} did not exit within {timeout:?}")]
    TerminateTimeout {
        /// Process id, if known.
        pid: Option<u32>,
        /// Bounded wait that elapsed.
        timeout: Duration,
    },

    /// The encoder died before its bring-up completed.
    #[error("encoder {pid:?} exited during start: {description}")]
    ExitedDuringStart {
        /// Process id, if known.
        pid: Option<u32>,
        /// How it ended.
        description: String,
    },

    /// Sending the termination signal failed.
    #[error("failed to kill process {pid}: {reason}")]
    Kill {
        /// Process id.
        pid: u32,
        /// OS-specific reason.
        reason: String,
    },
}

impl ProcessError {
    /// Returns a short stable label (snake_case) for use in logs/events.
    pub fn as_label(&self) -> &'static str {
        match self {
            ProcessError::Spawn { .. } => "process_spawn",
            ProcessError::MissingInput => "process_missing_input",
            ProcessError::TerminateTimeout { .. } => "process_terminate_timeout",
            ProcessError::ExitedDuringStart { .. } => "process_exited_during_start",
            ProcessError::Kill { .. } => "process_kill",
        }
    }
}

/// # Faults reported by the frame source / page collaborator.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum SourceError {
    /// Browser/page session could not be attached.
    #[error("attach failed: {0}")]
    Attach(String),

    /// Page reload failed.
    #[error("reload failed: {0}")]
    Reload(String),

    /// Script evaluation raised; the message is what gets returned to the caller.
    #[error("{0}")]
    Evaluate(String),

    /// Frame payload was not valid base64.
    #[error("frame decode failed: {0}")]
    Decode(String),

    /// The operation is not offered by this source.
    #[error("{0} is not supported by this frame source")]
    Unsupported(&'static str),

    /// The session went away.
    #[error("frame source closed")]
    Closed,

    /// Any other collaborator failure.
    #[error("{0}")]
    Other(String),
}

impl SourceError {
    /// Returns a short stable label (snake_case) for use in logs/events.
    pub fn as_label(&self) -> &'static str {
        match self {
            SourceError::Attach(_) => "source_attach",
            SourceError::Reload(_) => "source_reload",
            SourceError::Evaluate(_) => "source_evaluate",
            SourceError::Decode(_) => "source_decode",
            SourceError::Unsupported(_) => "source_unsupported",
            SourceError::Closed => "source_closed",
            SourceError::Other(_) => "source_other",
        }
    }
}

/// # Why a bring-up (initial start or restart) did not complete.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum StartError {
    /// The encoder could not be started.
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// The frame source could not be attached.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// Shutdown began while the bring-up was in progress.
    #[error("shutdown in progress")]
    ShuttingDown,
}

impl StartError {
    /// Returns a short stable label (snake_case) for use in logs/events.
    pub fn as_label(&self) -> &'static str {
        match self {
            StartError::Process(e) => e.as_label(),
            StartError::Source(e) => e.as_label(),
            StartError::ShuttingDown => "start_shutting_down",
        }
    }
}

/// # Control messages that cannot be serviced.
///
/// Logged by the dispatcher; the message is dropped and supervisor state is untouched.
#[non_exhaustive]
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CommandError {
    /// A request-type topic arrived without a reply address.
    #[error("no reply address provided for {topic}")]
    MissingReplyAddress {
        /// Topic of the dropped message.
        topic: String,
    },

    /// The command needs a page and none is attached.
    #[error("no active page, cannot {action}")]
    NoActivePage {
        /// What was attempted.
        action: &'static str,
    },

    /// Payload missing required fields or not decodable.
    #[error("invalid {topic} payload: {reason}")]
    InvalidPayload {
        /// Topic of the dropped message.
        topic: String,
        /// What was wrong.
        reason: String,
    },
}

impl CommandError {
    /// Returns a short stable label (snake_case) for use in logs/events.
    pub fn as_label(&self) -> &'static str {
        match self {
            CommandError::MissingReplyAddress { .. } => "command_missing_reply",
            CommandError::NoActivePage { .. } => "command_no_page",
            CommandError::InvalidPayload { .. } => "command_invalid_payload",
        }
    }

    /// Whether the dispatcher should log this at error level (hard precondition failure).
    pub fn is_precondition(&self) -> bool {
        matches!(self, CommandError::MissingReplyAddress { .. })
    }
}

/// # Configuration loading and validation errors.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// Path that was read.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for [`Config`](crate::Config).
    #[error("failed to parse {path}: {reason}")]
    Parse {
        /// Path that was parsed.
        path: String,
        /// Parser message.
        reason: String,
    },

    /// A required field is missing or empty.
    #[error("please provide {0} in the configuration")]
    Missing(&'static str),

    /// A field holds a value the runtime cannot use.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Dotted field name.
        field: &'static str,
        /// What was wrong.
        reason: String,
    },
}

impl ConfigError {
    /// Returns a short stable label (snake_case) for use in logs/events.
    pub fn as_label(&self) -> &'static str {
        match self {
            ConfigError::Read { .. } => "config_read",
            ConfigError::Parse { .. } => "config_parse",
            ConfigError::Missing(_) => "config_missing",
            ConfigError::Invalid { .. } => "config_invalid",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_error_severity() {
        let missing = CommandError::MissingReplyAddress {
            topic: "control.restart".into(),
        };
        assert!(missing.is_precondition());
        assert_eq!(missing.as_label(), "command_missing_reply");

        let no_page = CommandError::NoActivePage { action: "reload" };
        assert!(!no_page.is_precondition());
        assert_eq!(no_page.to_string(), "no active page, cannot reload");
    }

    #[test]
    fn evaluate_error_displays_bare_message() {
        let err = SourceError::Evaluate("ReferenceError: foo is not defined".into());
        assert_eq!(err.to_string(), "ReferenceError: foo is not defined");
    }

    #[test]
    fn broker_labels_are_stable() {
        assert_eq!(BrokerError::NotConnected.as_label(), "broker_not_connected");
        let t = BrokerError::Timeout {
            topic: "streamer.ping".into(),
            timeout: Duration::from_secs(5),
        };
        assert_eq!(t.as_label(), "broker_timeout");
        assert!(t.to_string().contains("streamer.ping"));
    }
}
