#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use futures::FutureExt;
use serde_json::{json, Value};
use streamvisor::{
    Attachment, Backend, Collaborators, Config, ControlMessage, EncoderLauncher, Event, EventKind,
    ExitReport, FrameSource, MemoryTransport, Page, ProcessError, ProcessHandle, RemoteValue,
    ScreencastFrame, Session, SourceError, StreamSupervisor, Subscription,
};
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::sync::{broadcast, mpsc, watch, Semaphore};
use tokio::task::JoinHandle;

pub const WAIT: Duration = Duration::from_secs(5);

/// Config for an in-process run: memory backend, quick reconnects, no timers.
pub fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.stream.stream_key = "test-key".into();
    cfg.stream.dashboard_url = "http://localhost/dashboard".into();
    cfg.stream.frame_rate = 50;
    cfg.stream.forced_restart_secs = 0;
    cfg.stream.credential_refresh_secs = 0;
    cfg.broker.backend = Backend::Memory;
    cfg.broker.probe_timeout_ms = 500;
    cfg.broker.heartbeat_secs = 0;
    cfg.broker.backoff.first = Duration::from_millis(10);
    cfg.broker.backoff.max = Duration::from_millis(50);
    cfg.supervisor.grace_secs = 2;
    cfg
}

struct FakeEncoder {
    pid: u32,
    output: Option<DuplexStream>,
    exit: Arc<watch::Sender<Option<ExitReport>>>,
}

/// Launches in-memory encoders. Each launch takes one permit from the gate.
pub struct ScriptedLauncher {
    gate: Semaphore,
    launched: AtomicU32,
    released: Arc<AtomicU32>,
    encoders: Mutex<Vec<FakeEncoder>>,
}

impl ScriptedLauncher {
    /// Unlimited launches.
    pub fn open() -> Self {
        Self::gated(Semaphore::MAX_PERMITS)
    }

    /// Only `permits` launches go through until [`ScriptedLauncher::allow`] is called.
    pub fn gated(permits: usize) -> Self {
        Self {
            gate: Semaphore::new(permits),
            launched: AtomicU32::new(0),
            released: Arc::new(AtomicU32::new(0)),
            encoders: Mutex::new(Vec::new()),
        }
    }

    pub fn allow(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn launched(&self) -> u32 {
        self.launched.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> u32 {
        self.released.load(Ordering::SeqCst)
    }

    /// Makes the `index`-th encoder exit on its own.
    pub fn crash(&self, index: usize) {
        let encoders = self.encoders.lock().unwrap();
        encoders[index].exit.send_replace(Some(ExitReport {
            code: Some(1),
            description: "exit status: 1".into(),
        }));
    }

    pub fn pid(&self, index: usize) -> u32 {
        self.encoders.lock().unwrap()[index].pid
    }

    /// Takes what the `index`-th encoder receives on stdin.
    pub fn take_output(&self, index: usize) -> DuplexStream {
        self.encoders.lock().unwrap()[index]
            .output
            .take()
            .expect("output already taken")
    }
}

#[async_trait]
impl EncoderLauncher for ScriptedLauncher {
    async fn launch(&self) -> Result<ProcessHandle, ProcessError> {
        self.gate
            .acquire()
            .await
            .map_err(|e| ProcessError::Spawn {
                program: "fake-encoder".into(),
                source: std::io::Error::other(e.to_string()),
            })?
            .forget();

        let n = self.launched.fetch_add(1, Ordering::SeqCst) + 1;
        let pid = 1000 + n;
        let (input, output) = tokio::io::duplex(1 << 20);
        let (exit_tx, exit_rx) = watch::channel(None);
        let exit = Arc::new(exit_tx);

        let released = Arc::clone(&self.released);
        let on_release = Arc::clone(&exit);
        let handle = ProcessHandle::new(Some(pid), Box::new(input), exit_rx, move || {
            async move {
                released.fetch_add(1, Ordering::SeqCst);
                on_release.send_replace(Some(ExitReport {
                    code: None,
                    description: "signal: 9 (SIGKILL)".into(),
                }));
                Ok(())
            }
            .boxed()
        });

        self.encoders.lock().unwrap().push(FakeEncoder {
            pid,
            output: Some(output),
            exit,
        });
        Ok(handle)
    }
}

/// Page double: `1+1` evaluates to 2, anything else echoes the script.
#[derive(Default)]
pub struct FakePage {
    pub reloads: AtomicU32,
}

#[async_trait]
impl Page for FakePage {
    async fn reload(&self) -> Result<bool, SourceError> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn evaluate(&self, script: &str) -> Result<RemoteValue, SourceError> {
        if script.contains("1+1") {
            Ok(RemoteValue::pending(async { RemoteValue::Data(json!(2)) }))
        } else if script.contains("throw") {
            Err(SourceError::Evaluate("Error: thrown".into()))
        } else {
            Ok(RemoteValue::Data(json!(script)))
        }
    }

    async fn ack_frame(&self, _session_id: u64) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Frame source double; keeps the frame sender of the latest attachment.
///
/// Each attach takes one permit from the gate, after counting itself in `attached`.
pub struct FakeSource {
    pub attached: AtomicU32,
    pub closed: AtomicU32,
    pub persisted: AtomicU32,
    gate: Semaphore,
    current: Mutex<Option<(Arc<FakePage>, mpsc::Sender<ScreencastFrame>)>>,
}

impl FakeSource {
    /// Attaches without waiting.
    pub fn open() -> Self {
        Self::gated(Semaphore::MAX_PERMITS)
    }

    /// Only `permits` attaches complete until [`FakeSource::allow`] is called.
    pub fn gated(permits: usize) -> Self {
        Self {
            attached: AtomicU32::new(0),
            closed: AtomicU32::new(0),
            persisted: AtomicU32::new(0),
            gate: Semaphore::new(permits),
            current: Mutex::new(None),
        }
    }

    pub fn allow(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn page(&self) -> Option<Arc<FakePage>> {
        self.current.lock().unwrap().as_ref().map(|(p, _)| Arc::clone(p))
    }

    pub async fn push_frame(&self, image: &[u8]) {
        let tx = self
            .current
            .lock()
            .unwrap()
            .as_ref()
            .map(|(_, tx)| tx.clone())
            .expect("no attachment");
        tx.send(ScreencastFrame {
            data: STANDARD.encode(image),
            session_id: 1,
        })
        .await
        .unwrap();
    }
}

#[async_trait]
impl FrameSource for FakeSource {
    async fn attach(&self) -> Result<Attachment, SourceError> {
        self.attached.fetch_add(1, Ordering::SeqCst);
        self.gate
            .acquire()
            .await
            .map_err(|e| SourceError::Attach(e.to_string()))?
            .forget();
        let (tx, rx) = mpsc::channel(8);
        let page = Arc::new(FakePage::default());
        *self.current.lock().unwrap() = Some((Arc::clone(&page), tx));
        Ok(Attachment { page, frames: rx })
    }

    async fn persist_credentials(&self) -> Result<(), SourceError> {
        self.persisted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), SourceError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        self.current.lock().unwrap().take();
        Ok(())
    }
}

/// A supervisor running against in-memory collaborators.
pub struct Harness {
    pub sup: Arc<StreamSupervisor>,
    pub transport: MemoryTransport,
    pub launcher: Arc<ScriptedLauncher>,
    pub source: Arc<FakeSource>,
    pub peer: Arc<dyn Session>,
    pub events: broadcast::Receiver<Event>,
    pub run: JoinHandle<i32>,
}

impl Harness {
    /// Starts the supervisor and waits until the stream is up and the broker connected.
    pub async fn start(cfg: Config, launcher: ScriptedLauncher) -> Self {
        Self::start_with(cfg, launcher, FakeSource::open()).await
    }

    /// Like [`Harness::start`], with a caller-provided frame source.
    pub async fn start_with(cfg: Config, launcher: ScriptedLauncher, source: FakeSource) -> Self {
        let transport = MemoryTransport::new();
        transport.answer_probes("streamer.ping").await.unwrap();
        let launcher = Arc::new(launcher);
        let source = Arc::new(source);

        let sup = StreamSupervisor::new(
            &cfg,
            Collaborators {
                transport: Arc::new(transport.clone()),
                launcher: launcher.clone(),
                source: source.clone(),
            },
            Vec::new(),
            Bytes::from_static(b"startup"),
        );
        let mut events = sup.bus().subscribe();
        let run = tokio::spawn({
            let sup = Arc::clone(&sup);
            async move { sup.run().await }
        });

        next_event(&mut events, EventKind::BrokerConnected).await;
        let streaming = Arc::clone(&sup);
        eventually(move || streaming.phase() == streamvisor::Phase::Streaming).await;

        Self {
            sup,
            peer: transport.peer(),
            transport,
            launcher,
            source,
            events,
            run,
        }
    }

    /// Sends `bot.<action>` and waits for the reply payload.
    pub async fn request(&self, action: &str, payload: Option<Value>) -> Value {
        let reply = format!("reply.{action}.{}", uuid::Uuid::new_v4().simple());
        let mut replies = self.peer.subscribe(&reply).await.unwrap();
        let mut msg = ControlMessage::new(format!("bot.{action}")).with_reply(reply.as_str());
        if let Some(payload) = payload {
            msg = msg.with_json(&payload).unwrap();
        }
        self.peer.publish(msg).await.unwrap();
        recv_json(&mut replies).await
    }
}

pub async fn recv_json(sub: &mut Subscription) -> Value {
    let msg = tokio::time::timeout(WAIT, sub.recv())
        .await
        .expect("no reply in time")
        .expect("subscription closed");
    msg.json::<Value>().unwrap()
}

/// Waits for the next event of `kind`, skipping others.
pub async fn next_event(rx: &mut broadcast::Receiver<Event>, kind: EventKind) -> Event {
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(ev) if ev.kind == kind => return ev,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("bus closed"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {kind:?} event in time"))
}

/// Polls `cond` until it holds.
pub async fn eventually(cond: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Reads encoder input until `needle` shows up.
pub async fn read_until(output: &mut DuplexStream, needle: &[u8]) {
    let mut seen = Vec::new();
    let mut buf = [0u8; 4096];
    tokio::time::timeout(WAIT, async {
        loop {
            let n = output.read(&mut buf).await.unwrap();
            assert!(n > 0, "encoder input closed");
            seen.extend_from_slice(&buf[..n]);
            if seen.windows(needle.len()).any(|w| w == needle) {
                return;
            }
        }
    })
    .await
    .expect("frame never reached the encoder");
}
