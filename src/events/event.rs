//! # Runtime events emitted by the supervisor, the broker connection and the feed loop.
//!
//! The [`EventKind`] enum classifies event types across four categories:
//! - **Control-plane events**: broker connection lifecycle (connecting, connected, lost, backoff)
//! - **Stream events**: encoder lifecycle and the feed loop
//! - **Restart events**: requests, rejections, outcomes, faults and budget exhaustion
//! - **Shutdown events**: the single shutdown path and its grace handling
//!
//! The [`Event`] struct carries additional metadata such as timestamps, topic,
//! reasons, process ids and backoff delays.
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases monotonically.
//! Use `seq` to restore the exact order when events are delivered out of order.
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use streamvisor::{Event, EventKind};
//!
//! let ev = Event::new(EventKind::ReconnectScheduled)
//!     .with_attempt(3)
//!     .with_delay(Duration::from_secs(8))
//!     .with_reason("connection refused");
//!
//! assert_eq!(ev.kind, EventKind::ReconnectScheduled);
//! assert_eq!(ev.delay_ms, Some(8_000));
//! assert_eq!(ev.reason.as_deref(), Some("connection refused"));
//! ```

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Subscriber events ===
    /// Subscriber panicked during event processing.
    ///
    /// Sets:
    /// - `topic`: subscriber name
    /// - `reason`: panic info/message
    SubscriberPanicked,

    /// Subscriber dropped an event (queue full or worker closed).
    ///
    /// Sets:
    /// - `topic`: subscriber name
    /// - `reason`: reason string (e.g., "full", "closed")
    SubscriberOverflow,

    // === Control-plane events ===
    /// A broker session is being established.
    ///
    /// Sets:
    /// - `attempt`: current retry counter
    BrokerConnecting,

    /// Broker session established and the liveness probe answered.
    ///
    /// Sets:
    /// - `topic`: announcement topic that was published
    BrokerConnected,

    /// Session lost or failed to come up.
    ///
    /// Sets:
    /// - `reason`: failure message
    BrokerDisconnected,

    /// Next connection attempt scheduled.
    ///
    /// Sets:
    /// - `attempt`: retry counter after increment
    /// - `delay_ms`: backoff before the next attempt
    /// - `reason`: last failure message, if any
    ReconnectScheduled,

    /// A periodic liveness probe got no answer.
    ///
    /// Sets:
    /// - `topic`: probe topic
    /// - `reason`: failure message
    HeartbeatMissed,

    /// Inbound message carried this connection's own origin tag and was not dispatched.
    ///
    /// Sets:
    /// - `topic`: message topic
    LoopbackSuppressed,

    /// Broker session drained and closed.
    BrokerClosed,

    // === Stream events ===
    /// Encoder process spawned.
    ///
    /// Sets:
    /// - `pid`: process id (when known)
    EncoderSpawned,

    /// Encoder process exited.
    ///
    /// Sets:
    /// - `pid`: process id (when known)
    /// - `reason`: exit status description
    EncoderExited,

    /// Feed loop stopped (stream closed or cancelled).
    ///
    /// Sets:
    /// - `reason`: why it stopped
    FeedStopped,

    /// Frame source attached and frames are flowing into the cell.
    SourceAttached,

    // === Restart events ===
    /// Restart requested.
    ///
    /// Sets:
    /// - `reason`: cause (command, fault, schedule)
    RestartRequested,

    /// Restart rejected because another sequence is in flight or shutdown began.
    ///
    /// Sets:
    /// - `reason`: cause of the rejected request
    RestartRejected,

    /// Restart sequence completed.
    RestartSucceeded,

    /// Restart sequence failed.
    ///
    /// Sets:
    /// - `reason`: failure message
    RestartFailed,

    /// Fatal fault recorded.
    ///
    /// Sets:
    /// - `attempt`: restart counter after the fault
    /// - `reason`: fault description
    FaultRecorded,

    /// Restart budget exhausted; shutdown follows.
    ///
    /// Sets:
    /// - `attempt`: restart counter at the time of the request
    BudgetExhausted,

    // === Shutdown events ===
    /// Shutdown requested (signal, budget exhaustion, fatal feed failure).
    ///
    /// Sets:
    /// - `reason`: trigger
    ShutdownRequested,

    /// Shutdown finished within the grace period.
    ShutdownComplete,

    /// Grace period exceeded; some components did not stop in time.
    ///
    /// Sets:
    /// - `reason`: stuck components
    GraceExceeded,
}

impl EventKind {
    /// Short kebab-case name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SubscriberPanicked => "subscriber-panicked",
            EventKind::SubscriberOverflow => "subscriber-overflow",
            EventKind::BrokerConnecting => "broker-connecting",
            EventKind::BrokerConnected => "broker-connected",
            EventKind::BrokerDisconnected => "broker-disconnected",
            EventKind::ReconnectScheduled => "reconnect-scheduled",
            EventKind::HeartbeatMissed => "heartbeat-missed",
            EventKind::LoopbackSuppressed => "loopback-suppressed",
            EventKind::BrokerClosed => "broker-closed",
            EventKind::EncoderSpawned => "encoder-spawned",
            EventKind::EncoderExited => "encoder-exited",
            EventKind::FeedStopped => "feed-stopped",
            EventKind::SourceAttached => "source-attached",
            EventKind::RestartRequested => "restart-requested",
            EventKind::RestartRejected => "restart-rejected",
            EventKind::RestartSucceeded => "restart-succeeded",
            EventKind::RestartFailed => "restart-failed",
            EventKind::FaultRecorded => "fault-recorded",
            EventKind::BudgetExhausted => "budget-exhausted",
            EventKind::ShutdownRequested => "shutdown-requested",
            EventKind::ShutdownComplete => "shutdown-complete",
            EventKind::GraceExceeded => "grace-exceeded",
        }
    }
}

/// Runtime event with optional metadata.
///
/// - `seq`: monotonic global sequence for ordering
/// - `at`: wall-clock timestamp (for logs)
/// - other optional fields are set depending on the [`EventKind`]
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,

    /// Topic or component name, if applicable.
    pub topic: Option<Arc<str>>,
    /// Human-readable reason (errors, causes, overflow details).
    pub reason: Option<Arc<str>>,
    /// Attempt / counter value.
    pub attempt: Option<u32>,
    /// Backoff delay in milliseconds (compact).
    pub delay_ms: Option<u32>,
    /// Encoder process id.
    pub pid: Option<u32>,
}

impl Event {
    /// Creates a new event of the given kind with current timestamp and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            topic: None,
            reason: None,
            attempt: None,
            delay_ms: None,
            pid: None,
        }
    }

    /// Attaches a human-readable reason.
    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attaches a topic or component name.
    #[inline]
    pub fn with_topic(mut self, topic: impl Into<Arc<str>>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Attaches a backoff delay (stored as milliseconds).
    #[inline]
    pub fn with_delay(mut self, d: Duration) -> Self {
        let ms = d.as_millis().min(u128::from(u32::MAX)) as u32;
        self.delay_ms = Some(ms);
        self
    }

    /// Attaches an attempt / counter value.
    #[inline]
    pub fn with_attempt(mut self, n: u32) -> Self {
        self.attempt = Some(n);
        self
    }

    /// Attaches a process id when one is known.
    #[inline]
    pub fn with_pid(mut self, pid: Option<u32>) -> Self {
        self.pid = pid;
        self
    }

    /// Creates a subscriber overflow event.
    #[inline]
    pub fn subscriber_overflow(subscriber: &'static str, reason: &'static str) -> Self {
        Event::new(EventKind::SubscriberOverflow)
            .with_topic(subscriber)
            .with_reason(format!("subscriber={subscriber} reason={reason}"))
    }

    /// Creates a subscriber panic event.
    #[inline]
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        Event::new(EventKind::SubscriberPanicked)
            .with_topic(subscriber)
            .with_reason(info)
    }

    #[inline]
    pub fn is_subscriber_overflow(&self) -> bool {
        matches!(self.kind, EventKind::SubscriberOverflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_increase() {
        let a = Event::new(EventKind::BrokerConnecting);
        let b = Event::new(EventKind::BrokerConnected);
        assert!(b.seq > a.seq);
    }

    #[test]
    fn delay_is_clamped_to_u32_millis() {
        let ev = Event::new(EventKind::ReconnectScheduled).with_delay(Duration::from_secs(u64::MAX));
        assert_eq!(ev.delay_ms, Some(u32::MAX));
    }
}
