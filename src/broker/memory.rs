//! # In-process transport.
//!
//! [`MemoryTransport`] is a hub shared by every session opened from it (and by its clones).
//! Publishing routes a message to every live subscription whose pattern matches the topic,
//! in publish order. It backs the `memory` broker backend and the test suite.
//!
//! Test hooks:
//! - [`MemoryTransport::fail_next_connects`] makes the next `n` connects fail
//! - [`MemoryTransport::sever`] drops every live session, as if the broker went away
//! - [`MemoryTransport::peer`] opens a counterpart session that plays the remote side
//! - [`MemoryTransport::settled`] lists how received messages were settled
//! - [`MemoryTransport::answer_probes`] replies to liveness probes on behalf of the remote side

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::broker::message::{ControlMessage, Settle};
use crate::broker::transport::{subject_matches, Session, Subscription, Transport};
use crate::error::BrokerError;

const SUBSCRIPTION_BUFFER: usize = 256;

struct Route {
    session: u64,
    pattern: String,
    tx: mpsc::Sender<ControlMessage>,
}

#[derive(Default)]
struct Hub {
    routes: Mutex<Vec<Route>>,
    live: Mutex<HashMap<u64, Arc<AtomicBool>>>,
    settled: Mutex<Vec<(String, Settle)>>,
    next_session: AtomicU64,
    fail_connects: AtomicU32,
    connects: AtomicU32,
}

impl Hub {
    async fn route(&self, msg: ControlMessage) {
        let targets: Vec<mpsc::Sender<ControlMessage>> = {
            let mut routes = self.routes.lock().await;
            routes.retain(|r| !r.tx.is_closed());
            routes
                .iter()
                .filter(|r| subject_matches(&r.pattern, &msg.topic))
                .map(|r| r.tx.clone())
                .collect()
        };
        for tx in targets {
            let _ = tx.send(msg.clone()).await;
        }
    }

    async fn close_session(&self, id: u64) {
        if let Some(flag) = self.live.lock().await.remove(&id) {
            flag.store(true, Ordering::SeqCst);
        }
        self.routes.lock().await.retain(|r| r.session != id);
    }

    fn open_session(&self) -> (u64, Arc<AtomicBool>) {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        (id, Arc::new(AtomicBool::new(false)))
    }
}

/// In-process broker hub.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    hub: Arc<Hub>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` calls to [`Transport::connect`] fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.hub.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Number of successful [`Transport::connect`] calls so far (peers excluded).
    pub fn connect_count(&self) -> u32 {
        self.hub.connects.load(Ordering::SeqCst)
    }

    /// Closes every session opened through [`Transport::connect`]; their subscriptions end.
    pub async fn sever(&self) {
        let ids: Vec<u64> = self.hub.live.lock().await.keys().copied().collect();
        for id in ids {
            self.hub.close_session(id).await;
        }
    }

    /// Opens a session for the remote side of the conversation.
    ///
    /// Peers are unaffected by failure injection and by [`MemoryTransport::sever`].
    pub fn peer(&self) -> Arc<dyn Session> {
        let (id, closed) = self.hub.open_session();
        Arc::new(MemorySession {
            id,
            hub: Arc::clone(&self.hub),
            closed,
        })
    }

    /// Answers every request on `topic` with an empty reply from a peer session.
    ///
    /// Stands in for the remote counterpart's liveness responder; the subscription is live
    /// when this returns.
    pub async fn answer_probes(&self, topic: &str) -> Result<JoinHandle<()>, BrokerError> {
        let peer = self.peer();
        let mut probes = peer.subscribe(topic).await?;
        Ok(tokio::spawn(async move {
            while let Some(msg) = probes.recv().await {
                if let Some(reply) = msg.reply {
                    if peer.publish(ControlMessage::new(reply)).await.is_err() {
                        return;
                    }
                }
            }
        }))
    }

    /// Topics and settle outcomes recorded so far, in order.
    pub async fn settled(&self) -> Vec<(String, Settle)> {
        self.hub.settled.lock().await.clone()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<Arc<dyn Session>, BrokerError> {
        let injected = self
            .hub
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BrokerError::Connect("injected connect failure".into()));
        }

        let (id, closed) = self.hub.open_session();
        self.hub.live.lock().await.insert(id, Arc::clone(&closed));
        self.hub.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemorySession {
            id,
            hub: Arc::clone(&self.hub),
            closed,
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

struct MemorySession {
    id: u64,
    hub: Arc<Hub>,
    closed: Arc<AtomicBool>,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn publish(&self, msg: ControlMessage) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.hub.route(msg).await;
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription, BrokerError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.hub.routes.lock().await.push(Route {
            session: self.id,
            pattern: pattern.to_string(),
            tx,
        });
        Ok(Subscription::new(pattern, rx))
    }

    async fn settle(&self, msg: &ControlMessage, how: Settle) -> Result<(), BrokerError> {
        self.hub
            .settled
            .lock()
            .await
            .push((msg.topic.clone(), how));
        Ok(())
    }

    async fn drain(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        self.hub.close_session(self.id).await;
        Ok(())
    }
}
