//! # StreamSupervisor: owns the live stream and everything that can restart it.
//!
//! The supervisor ties the media path (encoder process, feed loop, frame source) to the
//! control plane ([`BrokerConnection`]) and decides when the stream is rebuilt.
//!
//! ```text
//!                          ┌──────────── StreamSupervisor ─────────────┐
//!  signal / halt ────────► │ run(): select signal vs halt → shutdown() │
//!                          │                                           │
//!  restart command ──┐     │  SupervisorState (admission, budget)      │
//!  fault reporter ───┼───► │  restart(cause):                          │
//!  forced timer ─────┘     │    teardown → bring_up → finish(ok)       │
//!                          └───────┬───────────────┬───────────────────┘
//!                                  ▼               ▼
//!                       generation token     Bus ──► event listener ──► SubscriberSet
//!                    ┌──────────┼──────────┐
//!                    ▼          ▼          ▼
//!                run_feed  exit watch  pump_frames (+ credential refresh)
//! ```
//!
//! ## Generations
//! Every bring-up starts a new generation with its own cancellation token (a child of the
//! runtime token). Teardown cancels it, so the feed loop, the frame pump and the exit
//! watcher of an old encoder never act on the stream that replaced it.
//!
//! ## Faults
//! Faults (unexpected encoder exit, failed initial start, panics routed through a
//! [`FaultReporter`]) are queued and each one becomes a restart request. They are counted
//! against the restart budget while a sequence is in flight; once the budget is spent the
//! supervisor shuts down with exit code 1.
//!
//! Only shutdown makes an encoder exit expected. An encoder that dies while its own
//! bring-up is still attaching the source is recorded as a fault and fails that bring-up.
//!
//! ## Shutdown
//! Exactly once: cancel timers and the generation, release the encoder, close the frame
//! source, drain the broker connection within `grace`, then flush subscribers.

use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerConnection, Transport};
use crate::commands::{CommandDispatcher, ControlTarget};
use crate::config::Config;
use crate::core::shutdown::wait_for_shutdown_signal;
use crate::core::state::{Admission, Phase, RestartCause, SupervisorState};
use crate::error::{ProcessError, RuntimeError, StartError};
use crate::events::{Bus, Event, EventKind};
use crate::media::{
    pump_frames, run_feed, EncoderInput, EncoderLauncher, ExitReport, FeedExit, FrameCell,
    FrameSource, Page, ProcessHandle,
};
use crate::subscribers::{Subscribe, SubscriberSet};

/// External pieces the supervisor drives.
pub struct Collaborators {
    /// Control-plane backend.
    pub transport: Arc<dyn Transport>,
    /// Starts encoder processes.
    pub launcher: Arc<dyn EncoderLauncher>,
    /// Opens render sessions.
    pub source: Arc<dyn FrameSource>,
}

/// Queues faults into a supervisor from anywhere, including a panic hook.
#[derive(Clone, Debug)]
pub struct FaultReporter {
    tx: mpsc::UnboundedSender<String>,
}

impl FaultReporter {
    /// Records a fault. Ignored once the supervisor is gone.
    pub fn report(&self, reason: impl Into<String>) {
        let _ = self.tx.send(reason.into());
    }
}

struct Halt {
    reason: String,
    code: i32,
}

struct Generation {
    id: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct Background {
    broker: Option<JoinHandle<()>>,
    listener: Option<JoinHandle<()>>,
}

/// Supervises one live stream and its control plane.
pub struct StreamSupervisor {
    me: Weak<Self>,
    bus: Bus,
    state: Mutex<SupervisorState>,

    cell: FrameCell,
    encoder: tokio::sync::Mutex<Option<ProcessHandle>>,
    page: RwLock<Option<Arc<dyn Page>>>,
    generation: Mutex<Generation>,

    launcher: Arc<dyn EncoderLauncher>,
    source: Arc<dyn FrameSource>,
    broker: Arc<BrokerConnection>,

    inbound: String,
    frame_period: Duration,
    credential_refresh: Option<Duration>,
    forced_restart: Option<Duration>,
    eval_timeout: Option<Duration>,
    grace: Duration,

    runtime: CancellationToken,
    broker_token: CancellationToken,
    events_token: CancellationToken,
    background: Mutex<Background>,

    faults: FaultReporter,
    fault_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    halt_tx: mpsc::UnboundedSender<Halt>,
    halt_rx: Mutex<Option<mpsc::UnboundedReceiver<Halt>>>,
}

impl StreamSupervisor {
    /// Builds a supervisor and starts forwarding its events to `subscribers`.
    ///
    /// `startup_frame` is shown until the frame source delivers its first frame.
    /// Must be called from within a Tokio runtime.
    pub fn new(
        cfg: &Config,
        parts: Collaborators,
        subscribers: Vec<Arc<dyn Subscribe>>,
        startup_frame: Bytes,
    ) -> Arc<Self> {
        let policy = cfg.restart_policy();
        let bus = Bus::new(cfg.supervisor.bus_capacity_clamped());
        let broker = Arc::new(BrokerConnection::new(
            parts.transport,
            &cfg.broker,
            bus.clone(),
        ));
        let runtime = CancellationToken::new();
        let events_token = CancellationToken::new();
        let listener = spawn_event_listener(
            &bus,
            SubscriberSet::new(subscribers, bus.clone()),
            events_token.clone(),
        );
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();
        let (halt_tx, halt_rx) = mpsc::unbounded_channel();

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            bus,
            state: Mutex::new(SupervisorState::new(policy.hard_limit)),
            cell: FrameCell::new(startup_frame),
            encoder: tokio::sync::Mutex::new(None),
            page: RwLock::new(None),
            generation: Mutex::new(Generation {
                id: 0,
                token: runtime.child_token(),
            }),
            launcher: parts.launcher,
            source: parts.source,
            broker,
            inbound: cfg.broker.inbound_namespace.clone(),
            frame_period: cfg.stream.frame_period(),
            credential_refresh: cfg.stream.credential_refresh(),
            forced_restart: policy.forced_interval,
            eval_timeout: cfg.supervisor.eval_timeout(),
            grace: cfg.supervisor.grace(),
            runtime,
            broker_token: CancellationToken::new(),
            events_token,
            background: Mutex::new(Background {
                broker: None,
                listener: Some(listener),
            }),
            faults: FaultReporter { tx: fault_tx },
            fault_rx: Mutex::new(Some(fault_rx)),
            halt_tx,
            halt_rx: Mutex::new(Some(halt_rx)),
        })
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// The latest frame, as fed to the encoder.
    pub fn frame_cell(&self) -> &FrameCell {
        &self.cell
    }

    pub fn broker(&self) -> &Arc<BrokerConnection> {
        &self.broker
    }

    pub fn phase(&self) -> Phase {
        self.state().phase()
    }

    pub fn restart_count(&self) -> u32 {
        self.state().restart_count()
    }

    /// Pid of the current encoder, if one is running.
    pub async fn encoder_pid(&self) -> Option<u32> {
        self.encoder.lock().await.as_ref().and_then(ProcessHandle::pid)
    }

    pub fn fault_reporter(&self) -> FaultReporter {
        self.faults.clone()
    }

    /// Records an uncaught fault; it turns into a restart request.
    pub fn report_fault(&self, reason: impl Into<String>) {
        let reason = reason.into();
        error!(%reason, "fault recorded");
        self.faults.report(reason);
    }

    /// Asks [`run`](Self::run) to shut down and exit with `code`.
    ///
    /// Never waits for the shutdown itself, so it is safe to call from command handlers.
    pub fn request_shutdown(&self, reason: impl Into<String>, code: i32) {
        let _ = self.halt_tx.send(Halt {
            reason: reason.into(),
            code,
        });
    }

    /// Runs until a termination signal (exit code 0) or a halt request, then shuts down.
    ///
    /// Returns the process exit code. A second call returns 1 immediately.
    pub async fn run(self: &Arc<Self>) -> i32 {
        let halt_rx = lock(&self.halt_rx).take();
        let fault_rx = lock(&self.fault_rx).take();
        let (Some(mut halt_rx), Some(fault_rx)) = (halt_rx, fault_rx) else {
            warn!("supervisor is already running");
            return 1;
        };

        self.spawn_fault_listener(fault_rx);
        self.spawn_broker();
        self.spawn_initial_start();
        self.spawn_forced_restart();

        let signal = async {
            match wait_for_shutdown_signal().await {
                Ok(signal) => signal,
                Err(e) => {
                    error!(error = %e, "signal handlers unavailable; waiting for halt requests only");
                    std::future::pending().await
                }
            }
        };

        let (reason, code) = tokio::select! {
            signal = signal => {
                info!(signal = signal.as_str(), "termination signal received");
                (signal.as_str().to_string(), 0)
            }
            halt = halt_rx.recv() => match halt {
                Some(halt) => (halt.reason, halt.code),
                None => ("halt channel closed".to_string(), 1),
            },
        };

        if let Err(e) = self.shutdown(&reason).await {
            error!(error = %e, label = e.as_label(), "shutdown incomplete");
        }
        code
    }

    /// Runs a restart sequence for `cause`. Returns whether the stream came back up.
    pub async fn request_restart(&self, cause: RestartCause) -> bool {
        self.restart_for(cause, cause.as_str()).await
    }

    async fn restart_for(&self, cause: RestartCause, detail: &str) -> bool {
        let (admission, count) = {
            let mut state = self.state();
            let admission = state.admit(cause);
            (admission, state.restart_count())
        };

        self.bus.publish(
            Event::new(EventKind::RestartRequested)
                .with_reason(cause.as_str())
                .with_attempt(count),
        );
        if cause == RestartCause::Fault {
            self.bus.publish(
                Event::new(EventKind::FaultRecorded)
                    .with_reason(detail)
                    .with_attempt(count),
            );
        }

        match admission {
            Admission::Proceed => {}
            Admission::Busy => {
                info!(cause = cause.as_str(), "restart already in progress");
                self.bus.publish(
                    Event::new(EventKind::RestartRejected).with_reason(cause.as_str()),
                );
                return false;
            }
            Admission::Exhausted => {
                error!(count, "restart budget exhausted, shutting down");
                self.bus
                    .publish(Event::new(EventKind::BudgetExhausted).with_attempt(count));
                self.request_shutdown("restart budget exhausted", 1);
                return false;
            }
        }

        info!(cause = cause.as_str(), "restarting stream");
        self.teardown().await;
        let result = self.start().await;
        self.state().finish(result.is_ok());

        match result {
            Ok(()) => {
                info!("stream restarted");
                self.bus.publish(Event::new(EventKind::RestartSucceeded));
                true
            }
            Err(e) => {
                error!(error = %e, label = e.as_label(), "restart failed");
                self.bus
                    .publish(Event::new(EventKind::RestartFailed).with_reason(e.to_string()));
                false
            }
        }
    }

    /// Tears everything down exactly once. Later calls return `Ok(())` immediately.
    ///
    /// Fails only when the broker connection did not drain within the grace period.
    pub async fn shutdown(&self, reason: &str) -> Result<(), RuntimeError> {
        if !self.state().begin_shutdown() {
            return Ok(());
        }
        info!(%reason, "shutting down");
        self.bus
            .publish(Event::new(EventKind::ShutdownRequested).with_reason(reason));

        self.runtime.cancel();
        self.teardown().await;

        self.broker_token.cancel();
        let broker = lock(&self.background).broker.take();
        let result = match broker {
            Some(task) => match tokio::time::timeout(self.grace, task).await {
                Ok(_) => Ok(()),
                Err(_) => {
                    self.bus
                        .publish(Event::new(EventKind::GraceExceeded).with_reason("broker"));
                    Err(RuntimeError::GraceExceeded {
                        grace: self.grace,
                        stuck: vec!["broker".to_string()],
                    })
                }
            },
            None => Ok(()),
        };
        if result.is_ok() {
            self.bus.publish(Event::new(EventKind::ShutdownComplete));
        }

        self.events_token.cancel();
        let listener = lock(&self.background).listener.take();
        if let Some(listener) = listener {
            if tokio::time::timeout(self.grace, listener).await.is_err() {
                warn!("event subscribers did not flush in time");
            }
        }
        result
    }

    /// Start with teardown of whatever came up if it fails halfway.
    async fn start(&self) -> Result<(), StartError> {
        let result = self.bring_up().await;
        if result.is_err() {
            self.teardown().await;
        }
        result
    }

    async fn bring_up(&self) -> Result<(), StartError> {
        let (generation, token) = self.begin_generation();

        let mut handle = self.launcher.launch().await?;
        let pid = handle.pid();
        info!(?pid, "encoder spawned");
        self.bus
            .publish(Event::new(EventKind::EncoderSpawned).with_pid(pid));

        let input = handle.take_input();
        let exited = handle.exited();
        let previous = self.encoder.lock().await.replace(handle);
        if let Some(mut previous) = previous {
            let stale = previous.pid();
            warn!(pid = ?stale, "releasing encoder left over from an earlier generation");
            if let Err(e) = previous.release().await {
                error!(pid = ?stale, error = %e, label = e.as_label(), "encoder did not terminate");
            }
        }
        if self.is_shutting_down() {
            return Err(StartError::ShuttingDown);
        }
        let input = input.ok_or(ProcessError::MissingInput)?;

        self.spawn_feed(input, token.clone());
        self.spawn_exit_watch(generation, pid, exited, token.clone());

        let attachment = self.source.attach().await?;
        if self.is_shutting_down() {
            return Err(StartError::ShuttingDown);
        }
        let died = self
            .encoder
            .lock()
            .await
            .as_ref()
            .and_then(ProcessHandle::exit_report);
        if let Some(report) = died {
            return Err(ProcessError::ExitedDuringStart {
                pid,
                description: report.description,
            }
            .into());
        }
        *self.page.write().unwrap_or_else(PoisonError::into_inner) =
            Some(Arc::clone(&attachment.page));
        tokio::spawn(pump_frames(
            attachment.frames,
            attachment.page,
            self.cell.clone(),
            token.child_token(),
        ));
        self.bus.publish(Event::new(EventKind::SourceAttached));

        self.spawn_credential_refresh(token);
        Ok(())
    }

    async fn teardown(&self) {
        lock(&self.generation).token.cancel();
        *self.page.write().unwrap_or_else(PoisonError::into_inner) = None;

        let handle = self.encoder.lock().await.take();
        if let Some(mut handle) = handle {
            let pid = handle.pid();
            match handle.release().await {
                Ok(()) => debug!(?pid, "encoder released"),
                Err(e) => error!(?pid, error = %e, label = e.as_label(), "encoder did not terminate"),
            }
        }
        if let Err(e) = self.source.close().await {
            warn!(error = %e, "closing frame source failed");
        }
    }

    fn begin_generation(&self) -> (u64, CancellationToken) {
        let mut generation = lock(&self.generation);
        generation.token.cancel();
        generation.id += 1;
        generation.token = self.runtime.child_token();
        (generation.id, generation.token.clone())
    }

    fn is_current(&self, generation: u64) -> bool {
        lock(&self.generation).id == generation
    }

    fn is_shutting_down(&self) -> bool {
        self.phase() == Phase::ShuttingDown
    }

    fn state(&self) -> MutexGuard<'_, SupervisorState> {
        lock(&self.state)
    }

    fn spawn_feed(&self, input: EncoderInput, token: CancellationToken) {
        let cell = self.cell.clone();
        let period = self.frame_period;
        let bus = self.bus.clone();
        let halt = self.halt_tx.clone();

        tokio::spawn(async move {
            match run_feed(cell, input, period, token).await {
                FeedExit::Cancelled => {}
                FeedExit::Closed(reason) => {
                    warn!(%reason, "encoder input closed");
                    bus.publish(Event::new(EventKind::FeedStopped).with_reason(reason));
                }
                FeedExit::Failed(e) => {
                    error!(error = %e, "writing to encoder failed");
                    bus.publish(Event::new(EventKind::FeedStopped).with_reason(e.to_string()));
                    let _ = halt.send(Halt {
                        reason: format!("encoder input write failed: {e}"),
                        code: 1,
                    });
                }
            }
        });
    }

    fn spawn_exit_watch<F>(
        &self,
        generation: u64,
        pid: Option<u32>,
        exited: F,
        token: CancellationToken,
    ) where
        F: Future<Output = Option<ExitReport>> + Send + 'static,
    {
        let me = self.me.clone();
        tokio::spawn(async move {
            let report = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                report = exited => report,
            };
            // Teardown cancels the generation before releasing its encoder.
            if token.is_cancelled() {
                return;
            }
            let Some(this) = me.upgrade() else { return };

            let description = report
                .map(|r| r.description)
                .unwrap_or_else(|| "exit status unknown".to_string());
            this.bus.publish(
                Event::new(EventKind::EncoderExited)
                    .with_pid(pid)
                    .with_reason(description.clone()),
            );

            if this.is_current(generation) && !this.is_shutting_down() {
                warn!(?pid, %description, "encoder exited unexpectedly");
                this.report_fault(format!("encoder exited: {description}"));
            }
        });
    }

    fn spawn_credential_refresh(&self, token: CancellationToken) {
        let Some(every) = self.credential_refresh else {
            return;
        };
        let source = Arc::clone(&self.source);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval_at(Instant::now() + every, every);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tick.tick() => {}
                }
                if let Err(e) = source.persist_credentials().await {
                    warn!(error = %e, "persisting credentials failed");
                }
            }
        });
    }

    fn spawn_fault_listener(&self, mut rx: mpsc::UnboundedReceiver<String>) {
        let me = self.me.clone();
        let token = self.runtime.clone();
        tokio::spawn(async move {
            loop {
                let reason = tokio::select! {
                    _ = token.cancelled() => return,
                    reason = rx.recv() => reason,
                };
                let (Some(reason), Some(this)) = (reason, me.upgrade()) else {
                    return;
                };
                // One task per fault, so faults keep counting while a restart runs.
                tokio::spawn(async move {
                    this.restart_for(RestartCause::Fault, &reason).await;
                });
            }
        });
    }

    fn spawn_broker(self: &Arc<Self>) {
        let target: Arc<dyn ControlTarget> = Arc::clone(self) as Arc<dyn ControlTarget>;
        let dispatcher = Arc::new(CommandDispatcher::new(
            self.inbound.clone(),
            target,
            self.eval_timeout,
        ));
        let task = tokio::spawn(
            Arc::clone(&self.broker).run(dispatcher, self.broker_token.clone()),
        );
        lock(&self.background).broker = Some(task);
    }

    fn spawn_initial_start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = this.start().await;
            this.state().finish(result.is_ok());
            match result {
                Ok(()) => info!("stream is live"),
                Err(StartError::ShuttingDown) => debug!("initial start abandoned for shutdown"),
                Err(e) => {
                    error!(error = %e, label = e.as_label(), "initial start failed");
                    this.report_fault(format!("initial start failed: {e}"));
                }
            }
        });
    }

    fn spawn_forced_restart(&self) {
        let Some(every) = self.forced_restart else {
            return;
        };
        let me = self.me.clone();
        let token = self.runtime.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval_at(Instant::now() + every, every);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tick.tick() => {}
                }
                let Some(this) = me.upgrade() else { return };
                info!(every = ?every, "forced restart due");
                this.request_restart(RestartCause::Scheduled).await;
            }
        });
    }
}

#[async_trait]
impl ControlTarget for StreamSupervisor {
    async fn restart(&self) -> bool {
        self.request_restart(RestartCause::Command).await
    }

    fn page(&self) -> Option<Arc<dyn Page>> {
        self.page
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Reads the startup image; a missing file yields an empty frame (nothing is fed until
/// the source delivers one).
pub async fn load_startup_frame(path: &Path) -> Bytes {
    match tokio::fs::read(path).await {
        Ok(bytes) => Bytes::from(bytes),
        Err(e) => {
            error!(path = %path.display(), error = %e, "could not read startup image");
            Bytes::new()
        }
    }
}

/// Forwards bus events to subscribers until `token` is cancelled and the backlog is empty.
fn spawn_event_listener(bus: &Bus, set: SubscriberSet, token: CancellationToken) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                biased;
                received = rx.recv() => received,
                _ = token.cancelled() => break,
            };
            match received {
                Ok(ev) => set.emit(&ev),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event listener lagged"),
                Err(RecvError::Closed) => break,
            }
        }
        set.shutdown().await;
    })
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
