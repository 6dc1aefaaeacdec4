//! # LogWriter: renders runtime events through `tracing`.
//!
//! ## Example output
//! ```text
//! INFO  broker-connected topic="streamer.connected"
//! WARN  reconnect-scheduled attempt=2 delay_ms=4000 reason="connection refused"
//! INFO  encoder-spawned pid=4242
//! WARN  restart-rejected reason="command"
//! ERROR fault-recorded attempt=1 reason="encoder exited: signal 9"
//! ```

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::events::{Event, EventKind};
use crate::subscribers::Subscribe;

/// Event writer subscriber.
#[derive(Default)]
pub struct LogWriter;

impl LogWriter {
    /// Construct a new [`LogWriter`].
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        let kind = e.kind.as_str();
        let topic = e.topic.as_deref();
        let reason = e.reason.as_deref();

        match e.kind {
            EventKind::BrokerConnecting | EventKind::LoopbackSuppressed => {
                debug!(seq = e.seq, attempt = e.attempt, topic, "{kind}");
            }
            EventKind::BrokerConnected
            | EventKind::BrokerClosed
            | EventKind::SourceAttached
            | EventKind::RestartRequested
            | EventKind::RestartSucceeded
            | EventKind::ShutdownRequested
            | EventKind::ShutdownComplete => {
                info!(seq = e.seq, topic, reason, "{kind}");
            }
            EventKind::EncoderSpawned => {
                info!(seq = e.seq, pid = e.pid, "{kind}");
            }
            EventKind::EncoderExited | EventKind::FeedStopped => {
                warn!(seq = e.seq, pid = e.pid, reason, "{kind}");
            }
            EventKind::ReconnectScheduled => {
                warn!(
                    seq = e.seq,
                    attempt = e.attempt,
                    delay_ms = e.delay_ms,
                    reason,
                    "{kind}"
                );
            }
            EventKind::BrokerDisconnected
            | EventKind::HeartbeatMissed
            | EventKind::RestartRejected
            | EventKind::SubscriberOverflow => {
                warn!(seq = e.seq, topic, reason, "{kind}");
            }
            EventKind::RestartFailed
            | EventKind::FaultRecorded
            | EventKind::BudgetExhausted
            | EventKind::GraceExceeded
            | EventKind::SubscriberPanicked => {
                error!(seq = e.seq, attempt = e.attempt, topic, reason, "{kind}");
            }
        }
    }

    fn name(&self) -> &'static str {
        "log-writer"
    }
}
