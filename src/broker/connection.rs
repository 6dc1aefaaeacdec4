//! # Control-plane connection.
//!
//! [`BrokerConnection`] owns one broker session at a time and keeps it alive for the
//! whole process lifetime.
//!
//! ```text
//!            ┌──────────── reconnect: teardown, retries += 1, sleep backoff(retries) ◄──┐
//!            ▼                                                                          │
//! Disconnected ──► Connecting ──► Connected ──► probe <out>.ping ──► announce <out>.connected
//!                      │              │                                                 │
//!                      └─ error ──────┴─ probe timeout / subscription lost ─────────────┘
//!
//! cancel ──► Draining ──► drain() ──► Closed
//! ```
//!
//! ## Rules
//! - Connection loss is retried forever; the retry counter is reset on every successful connect.
//! - Inbound messages are handled one at a time, in receipt order.
//! - A message carrying this connection's own loopback tag is requeued and never dispatched.
//! - `publish` never fails towards the caller; transport errors are logged.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::message::{ControlMessage, Settle};
use crate::broker::transport::{Session, Subscription, Transport};
use crate::commands::CommandDispatcher;
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::events::{Bus, Event, EventKind};
use crate::policies::BackoffPolicy;

/// Lifecycle of a [`BrokerConnection`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Draining,
    Closed,
}

/// Outbound half of the control plane, as seen by command handlers.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes `payload` on `topic` and returns the correlation id used as reply address.
    async fn publish(&self, topic: &str, payload: Option<Value>) -> String;
}

struct Link {
    state: ConnectionState,
    session: Option<Arc<dyn Session>>,
    retries: u32,
}

/// One broker session with reconnect, heartbeat and inbound dispatch.
pub struct BrokerConnection {
    transport: Arc<dyn Transport>,
    inbound: String,
    outbound: String,
    probe_timeout: Duration,
    heartbeat: Option<Duration>,
    backoff: BackoffPolicy,
    tag: String,
    link: Mutex<Link>,
    bus: Bus,
}

impl BrokerConnection {
    /// Creates a disconnected connection with a fresh loopback tag.
    pub fn new(transport: Arc<dyn Transport>, cfg: &BrokerConfig, bus: Bus) -> Self {
        Self {
            transport,
            inbound: cfg.inbound_namespace.clone(),
            outbound: cfg.outbound_namespace.clone(),
            probe_timeout: cfg.probe_timeout(),
            heartbeat: cfg.heartbeat(),
            backoff: cfg.backoff,
            tag: Uuid::new_v4().simple().to_string(),
            link: Mutex::new(Link {
                state: ConnectionState::Disconnected,
                session: None,
                retries: 0,
            }),
            bus,
        }
    }

    /// Loopback tag stamped on every outgoing message.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn state(&self) -> ConnectionState {
        self.link().state
    }

    /// Consecutive failed attempts since the last successful connect.
    pub fn retry_count(&self) -> u32 {
        self.link().retries
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self) -> Result<Arc<dyn Session>, BrokerError> {
        let link = self.link();
        match (&link.session, link.state) {
            (Some(session), ConnectionState::Connected) => Ok(Arc::clone(session)),
            _ => Err(BrokerError::NotConnected),
        }
    }

    /// Keeps the connection alive until `token` is cancelled, then drains it.
    pub async fn run(self: Arc<Self>, dispatcher: Arc<CommandDispatcher>, token: CancellationToken) {
        loop {
            let attempt = tokio::select! {
                _ = token.cancelled() => break,
                res = self.connect() => res,
            };

            let reason = match attempt {
                Ok(subscription) => {
                    let heartbeat = token.child_token();
                    self.spawn_heartbeat(heartbeat.clone());
                    let lost = tokio::select! {
                        _ = token.cancelled() => None,
                        reason = self.pump(subscription, &dispatcher) => Some(reason),
                    };
                    heartbeat.cancel();
                    match lost {
                        Some(reason) => reason,
                        None => break,
                    }
                }
                Err(e) => e.to_string(),
            };

            if !self.reconnect(&reason, &token).await {
                break;
            }
        }
        self.destroy().await;
    }

    /// Opens a session, subscribes to the inbound namespace, probes the counterpart and
    /// announces this process.
    pub async fn connect(&self) -> Result<Subscription, BrokerError> {
        let retries = {
            let mut link = self.link();
            link.state = ConnectionState::Connecting;
            link.retries
        };
        self.bus.publish(
            Event::new(EventKind::BrokerConnecting)
                .with_attempt(retries)
                .with_topic(self.transport.name()),
        );

        let session = self.transport.connect().await?;
        let subscription = match session.subscribe(&format!("{}.>", self.inbound)).await {
            Ok(sub) => sub,
            Err(e) => {
                let _ = session.drain().await;
                return Err(e);
            }
        };

        {
            let mut link = self.link();
            link.session = Some(session);
            link.state = ConnectionState::Connected;
            link.retries = 0;
        }

        let probe = format!("{}.ping", self.outbound);
        self.request(&probe, None, self.probe_timeout).await?;

        let announce = format!("{}.connected", self.outbound);
        self.publish(&announce, None).await;
        self.bus
            .publish(Event::new(EventKind::BrokerConnected).with_topic(announce));
        Ok(subscription)
    }

    /// Drops the current session, bumps the retry counter and waits out the backoff.
    ///
    /// Returns `false` if cancelled while waiting.
    async fn reconnect(&self, reason: &str, token: &CancellationToken) -> bool {
        self.teardown().await;
        self.bus
            .publish(Event::new(EventKind::BrokerDisconnected).with_reason(reason));

        let retries = {
            let mut link = self.link();
            link.retries = link.retries.saturating_add(1);
            link.retries
        };
        let delay = self.backoff.next(retries);
        self.bus.publish(
            Event::new(EventKind::ReconnectScheduled)
                .with_attempt(retries)
                .with_delay(delay)
                .with_reason(reason),
        );

        tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn teardown(&self) {
        let session = {
            let mut link = self.link();
            link.state = ConnectionState::Disconnected;
            link.session.take()
        };
        if let Some(session) = session {
            if let Err(e) = session.drain().await {
                debug!(error = %e, "drain of a lost session failed");
            }
        }
    }

    /// Drains the session and closes the connection. Later calls are no-ops.
    pub async fn destroy(&self) {
        let session = {
            let mut link = self.link();
            if link.state == ConnectionState::Closed {
                return;
            }
            link.state = ConnectionState::Draining;
            link.session.clone()
        };
        if let Some(session) = session {
            if let Err(e) = session.drain().await {
                warn!(error = %e, "broker drain failed");
            }
        }
        {
            let mut link = self.link();
            link.session = None;
            link.state = ConnectionState::Closed;
        }
        self.bus.publish(Event::new(EventKind::BrokerClosed));
    }

    async fn pump(&self, mut subscription: Subscription, dispatcher: &CommandDispatcher) -> String {
        while let Some(msg) = subscription.recv().await {
            self.deliver(msg, dispatcher).await;
        }
        format!("subscription {} closed", subscription.pattern())
    }

    async fn deliver(&self, msg: ControlMessage, dispatcher: &CommandDispatcher) {
        let Ok(session) = self.session() else {
            return;
        };

        if msg.origin.as_deref() == Some(self.tag.as_str()) {
            if let Err(e) = session.settle(&msg, Settle::Requeue).await {
                debug!(topic = %msg.topic, error = %e, "requeue failed");
            }
            self.bus.publish(
                Event::new(EventKind::LoopbackSuppressed).with_topic(msg.topic.as_str()),
            );
            return;
        }

        if let Err(e) = session.settle(&msg, Settle::Ack).await {
            debug!(topic = %msg.topic, error = %e, "ack failed");
        }
        dispatcher.dispatch(&msg, self).await;
    }

    fn spawn_heartbeat(self: &Arc<Self>, token: CancellationToken) {
        let Some(period) = self.heartbeat else {
            return;
        };
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let probe = format!("{}.ping", conn.outbound);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = conn.request(&probe, None, conn.probe_timeout).await {
                    conn.bus.publish(
                        Event::new(EventKind::HeartbeatMissed)
                            .with_topic(probe.as_str())
                            .with_reason(e.to_string()),
                    );
                }
            }
        });
    }

    /// Publishes a message and returns its correlation id (`<topic>.<uuid>`).
    ///
    /// The id doubles as the reply address. Failures are logged, not returned.
    pub async fn publish(&self, topic: &str, payload: Option<Value>) -> String {
        let id = format!("{topic}.{}", Uuid::new_v4().simple());
        if let Err(e) = self.try_publish(topic, payload, &id).await {
            warn!(topic, error = %e, "publish failed");
        }
        id
    }

    async fn try_publish(
        &self,
        topic: &str,
        payload: Option<Value>,
        reply: &str,
    ) -> Result<(), BrokerError> {
        let session = self.session()?;
        let mut msg = ControlMessage::new(topic)
            .with_reply(reply)
            .with_origin(self.tag.as_str());
        if let Some(payload) = payload {
            msg = msg.with_json(&payload)?;
        }
        session.publish(msg).await
    }

    /// Sends a request and waits up to `timeout` for the first reply.
    pub async fn request(
        &self,
        topic: &str,
        payload: Option<Value>,
        timeout: Duration,
    ) -> Result<ControlMessage, BrokerError> {
        let session = self.session()?;
        let inbox = format!("_INBOX.{}.{}", self.tag, Uuid::new_v4().simple());
        let mut replies = session.subscribe(&inbox).await?;

        let mut msg = ControlMessage::new(topic)
            .with_reply(inbox.as_str())
            .with_origin(self.tag.as_str());
        if let Some(payload) = payload {
            msg = msg.with_json(&payload)?;
        }
        session.publish(msg).await?;

        match tokio::time::timeout(timeout, replies.recv()).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(BrokerError::Closed),
            Err(_) => Err(BrokerError::Timeout {
                topic: topic.to_string(),
                timeout,
            }),
        }
    }
}

#[async_trait]
impl Publisher for BrokerConnection {
    async fn publish(&self, topic: &str, payload: Option<Value>) -> String {
        BrokerConnection::publish(self, topic, payload).await
    }
}
