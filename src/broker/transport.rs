//! # Transport capability.
//!
//! The broker connection depends on exactly one abstract capability, implemented per backend:
//!
//! ```text
//! Transport::connect() ──► Session
//!                            ├─ publish(msg)
//!                            ├─ subscribe(pattern) ──► Subscription (ordered stream)
//!                            ├─ settle(msg, Ack | Requeue)
//!                            └─ drain()
//! ```
//!
//! Subject patterns use dot-separated tokens with `*` (one token) and `>` (all remaining
//! tokens) wildcards. Backends translate them to their native syntax.
//!
//! A [`Subscription`] ending (`recv()` returning `None`) means the session was lost.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::broker::message::{ControlMessage, Settle};
use crate::error::BrokerError;

/// Factory for broker sessions.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opens a new session.
    async fn connect(&self) -> Result<Arc<dyn Session>, BrokerError>;

    /// Backend name for logs.
    fn name(&self) -> &'static str;
}

/// One live broker session.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Sends a message.
    async fn publish(&self, msg: ControlMessage) -> Result<(), BrokerError>;

    /// Opens an ordered subscription on a subject pattern.
    async fn subscribe(&self, pattern: &str) -> Result<Subscription, BrokerError>;

    /// Settles a received message. Backends without acknowledgement treat this as a no-op.
    async fn settle(&self, _msg: &ControlMessage, _how: Settle) -> Result<(), BrokerError> {
        Ok(())
    }

    /// Finishes in-flight work and closes the session.
    async fn drain(&self) -> Result<(), BrokerError>;
}

/// Ordered stream of messages matching one pattern.
///
/// Dropping the subscription stops the backend listener feeding it, if any.
pub struct Subscription {
    pattern: String,
    rx: mpsc::Receiver<ControlMessage>,
    listener: Option<AbortHandle>,
}

impl Subscription {
    /// Wraps a receiver fed by the backend.
    pub fn new(pattern: impl Into<String>, rx: mpsc::Receiver<ControlMessage>) -> Self {
        Self {
            pattern: pattern.into(),
            rx,
            listener: None,
        }
    }

    /// Ties the lifetime of a backend listener task to this subscription.
    pub fn with_listener(mut self, listener: AbortHandle) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Next message, or `None` once the session is gone.
    pub async fn recv(&mut self) -> Option<ControlMessage> {
        self.rx.recv().await
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("pattern", &self.pattern)
            .finish()
    }
}

/// Matches a dot-separated subject against a pattern with `*` and `>` wildcards.
///
/// # Example
/// ```
/// use streamvisor::subject_matches;
///
/// assert!(subject_matches("bot.>", "bot.eval"));
/// assert!(subject_matches("bot.*", "bot.ping"));
/// assert!(!subject_matches("bot.*", "bot.a.b"));
/// assert!(!subject_matches("bot.>", "bot"));
/// ```
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');
    loop {
        match (pat.next(), sub.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_subjects() {
        assert!(subject_matches("a.b", "a.b"));
        assert!(!subject_matches("a.b", "a.c"));
        assert!(!subject_matches("a.b", "a.b.c"));
        assert!(!subject_matches("a.b.c", "a.b"));
    }

    #[test]
    fn tail_wildcard_needs_at_least_one_token() {
        assert!(subject_matches(">", "a"));
        assert!(subject_matches("a.>", "a.b.c.d"));
        assert!(!subject_matches("a.>", "a"));
        assert!(!subject_matches("a.>", "b.c"));
    }

    #[test]
    fn single_token_wildcard() {
        assert!(subject_matches("a.*.c", "a.b.c"));
        assert!(!subject_matches("a.*.c", "a.b.d"));
        assert!(!subject_matches("a.*", "a"));
    }
}
