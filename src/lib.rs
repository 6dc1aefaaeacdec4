//! # streamvisor
//!
//! **Streamvisor** keeps an always-on dashboard live stream running and lets other
//! services control it over a message bus.
//!
//! A headless page renders the dashboard; its screencast frames are stored in a single
//! latest-frame cell, and a feed loop writes that cell into an `ffmpeg` encoder at a fixed
//! frame rate, so the output never stalls even when the page is idle. A control-plane
//! connection answers `restart`, `reload` and `eval` commands and restarts the whole
//! stream on faults, within a budget.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!      ┌──────────────┐        ┌─────────────────────────────────────────────┐
//!      │ FrameSource  │ frames │  StreamSupervisor                           │
//!      │ (page/still) ├───────►│  - SupervisorState (phase, restart budget)  │
//!      └──────┬───────┘        │  - FrameCell (latest frame, lock-free)      │
//!             │ Page           │  - ProcessHandle (encoder, process group)   │
//!             ▼                │  - generation token per bring-up            │
//!      ┌──────────────┐        └───┬────────────────────┬────────────────────┘
//!      │  eval/reload │            │ run_feed           │ ControlTarget
//!      │  (commands)  │            ▼                    ▼
//!      └──────▲───────┘     ┌──────────────┐     ┌──────────────────┐     ┌───────────┐
//!             │             │ encoder stdin│     │ BrokerConnection ├────►│ Transport │
//!             │             │  (ffmpeg)    │     │ reconnect/probe  │     │ redis/mem │
//!             │             └──────────────┘     └────────┬─────────┘     └───────────┘
//!             │                                           │ one message at a time
//!             └──────────────── CommandDispatcher ◄───────┘
//!
//!  every component ── publish(Event) ──► Bus ──► event listener ──► SubscriberSet
//!                                                                  ┌──────┼──────┐
//!                                                                  ▼      ▼      ▼
//!                                                              LogWriter  ...  custom
//! ```
//!
//! ### Restart sequence
//! ```text
//! restart(cause)
//!   ├─► admit(cause): Busy ──► RestartRejected, reply false
//!   │                 Exhausted ──► BudgetExhausted, shutdown(exit 1)
//!   ├─► teardown: cancel generation, release encoder tree, close source
//!   ├─► bring_up: launch encoder ─► feed loop ─► exit watch ─► attach source ─► pump
//!   └─► finish(ok): counter := 0, Streaming | Stalled
//! ```
//!
//! ## Features
//! | Area              | Description                                              | Key types / traits                         |
//! |-------------------|----------------------------------------------------------|--------------------------------------------|
//! | **Supervision**   | Owns the stream, restarts it, shuts down once.           | [`StreamSupervisor`], [`SupervisorState`]  |
//! | **Control plane** | Reconnecting broker session, sequential dispatch.        | [`BrokerConnection`], [`Transport`]        |
//! | **Commands**      | `ping`, `restart`, `reload`, `eval`, `proxy-socket`.     | [`CommandDispatcher`], [`CommandHandler`]  |
//! | **Media**         | Latest-frame cell, fixed-rate feed, encoder process.     | [`FrameCell`], [`run_feed`], [`ProcessHandle`] |
//! | **Events**        | Broadcast runtime events to subscribers.                 | [`Event`], [`Subscribe`]                   |
//! | **Policies**      | Reconnect backoff and restart budget.                    | [`BackoffPolicy`], [`RestartPolicy`]       |
//! | **Configuration** | TOML file with defaults for everything but the essentials.| [`Config`]                                |
//!
//! ## Optional features
//! - `redis` (default): [`RedisTransport`], Redis pub/sub as the control-plane backend.
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use streamvisor::{
//!     load_startup_frame, Collaborators, Config, FfmpegLauncher, LogWriter, MemoryTransport,
//!     StillImageSource, StreamSupervisor, Subscribe,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cfg = Config::load("config.toml")?;
//!     let parts = Collaborators {
//!         transport: Arc::new(MemoryTransport::default()),
//!         launcher: Arc::new(FfmpegLauncher::new(cfg.encoder.clone(), &cfg.stream)),
//!         source: Arc::new(StillImageSource::new(cfg.stream.startup_image.clone())),
//!     };
//!     let subs: Vec<Arc<dyn Subscribe>> = vec![Arc::new(LogWriter::new())];
//!     let frame = load_startup_frame(&cfg.stream.startup_image).await;
//!
//!     let sup = StreamSupervisor::new(&cfg, parts, subs, frame);
//!     std::process::exit(sup.run().await);
//! }
//! ```
mod broker;
mod commands;
mod config;
mod core;
mod error;
mod events;
mod media;
mod policies;
mod subscribers;

// ---- Public re-exports ----

pub use broker::{
    subject_matches, BrokerConnection, ConnectionState, ControlMessage, MemoryTransport,
    Publisher, Session, Settle, Subscription, Transport,
};
pub use commands::{
    evaluate, normalize, prepare_script, CommandContext, CommandDispatcher, CommandHandler,
    ControlTarget, EvalRequest, EvalResponse, RemoteValue,
};
pub use config::{
    Backend, BrokerConfig, Config, EncoderConfig, LogConfig, StreamConfig, SupervisorConfig,
    CONFIG_ENV, DEFAULT_CONFIG_PATH,
};
pub use self::core::{
    load_startup_frame, wait_for_shutdown_signal, Admission, Collaborators, FaultReporter, Phase,
    RestartCause, ShutdownSignal, StreamSupervisor, SupervisorState,
};
pub use error::{
    BrokerError, CommandError, ConfigError, ProcessError, RuntimeError, SourceError, StartError,
};
pub use events::{Bus, Event, EventKind};
pub use media::{
    pump_frames, run_feed, Attachment, EncoderInput, EncoderLauncher, ExitReport, FeedExit,
    FfmpegLauncher, FrameCell, FrameSource, Page, ProcessHandle, ScreencastFrame,
    StillImageSource,
};
pub use policies::{
    BackoffPolicy, JitterPolicy, RestartPolicy, DEFAULT_FORCED_RESTART, DEFAULT_RESTART_LIMIT,
};
pub use subscribers::{LogWriter, Subscribe, SubscriberSet};

#[cfg(feature = "redis")]
pub use broker::RedisTransport;
