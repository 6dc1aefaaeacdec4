//! # Runtime configuration.
//!
//! [`Config`] is loaded once at startup from a TOML file and handed to the collaborators
//! that need it. Every section and field has a default except the two that identify the
//! stream (`stream.stream_key`, `stream.dashboard_url`).
//!
//! ```toml
//! [stream]
//! stream_key = "live_123"
//! dashboard_url = "https://example.com/dashboard"
//!
//! [broker]
//! backend = "redis"
//! url = "redis://127.0.0.1:6379"
//!
//! [broker.backoff]
//! first_ms = 1000
//! max_ms = 30000
//! ```
//!
//! ## Sentinel values
//! - `stream.forced_restart_secs = 0` → no scheduled restart
//! - `stream.credential_refresh_secs = 0` → no credential refresh timer
//! - `broker.heartbeat_secs = 0` → no heartbeat
//! - `supervisor.eval_timeout_ms = 0` → evaluations are never cut short
//!
//! Use the `Option`-returning accessors instead of checking for `0` at call sites.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::policies::{BackoffPolicy, RestartPolicy, DEFAULT_FORCED_RESTART, DEFAULT_RESTART_LIMIT};

/// Environment variable consulted when no path is given on the command line.
pub const CONFIG_ENV: &str = "STREAMVISOR_CONFIG";

/// File used when neither a CLI argument nor [`CONFIG_ENV`] is present.
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Highest accepted `stream.frame_rate`.
pub const MAX_FRAME_RATE: u32 = 1000;

/// Upper bound for interval settings in seconds (ten years).
pub const MAX_TIMER_SECS: u64 = 10 * 365 * 24 * 3600;

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub stream: StreamConfig,
    pub encoder: EncoderConfig,
    pub broker: BrokerConfig,
    pub supervisor: SupervisorConfig,
    pub log: LogConfig,
}

/// What is streamed and where it comes from.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Ingest key appended to the encoder's output URL. Required.
    pub stream_key: String,
    /// Page the browser collaborator renders. Required.
    pub dashboard_url: String,
    /// Browser executable handed to the frame source, if not the bundled one.
    pub executable_path: Option<PathBuf>,
    /// Stylesheet injected into the rendered page.
    pub injected_css: Option<String>,
    /// Image that seeds the frame cell before the first real frame arrives.
    pub startup_image: PathBuf,
    /// Frames written to the encoder per second.
    pub frame_rate: u32,
    /// Interval of the scheduled forced restart (`0` = disabled).
    pub forced_restart_secs: u64,
    /// Interval of the credential persistence timer (`0` = disabled).
    pub credential_refresh_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            stream_key: String::new(),
            dashboard_url: String::new(),
            executable_path: None,
            injected_css: None,
            startup_image: PathBuf::from("image.png"),
            frame_rate: 30,
            forced_restart_secs: DEFAULT_FORCED_RESTART.as_secs(),
            credential_refresh_secs: 10,
        }
    }
}

impl StreamConfig {
    /// Period between two feed-loop writes.
    pub fn frame_period(&self) -> Duration {
        Duration::from_secs(1) / self.frame_rate.max(1)
    }

    #[inline]
    pub fn forced_restart(&self) -> Option<Duration> {
        non_zero_secs(self.forced_restart_secs)
    }

    #[inline]
    pub fn credential_refresh(&self) -> Option<Duration> {
        non_zero_secs(self.credential_refresh_secs)
    }
}

/// Encoder process settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub program: String,
    /// RTMP endpoint; the stream key is appended as the last path segment.
    pub ingest_url: String,
    /// Audio file looped under the video.
    pub audio_input: PathBuf,
    pub preset: String,
    pub video_bitrate_kbps: u32,
    pub max_bitrate_kbps: u32,
    pub buffer_kbps: u32,
    /// Keyframe interval in frames.
    pub gop: u32,
    pub audio_bitrate_kbps: u32,
    /// Bounded wait for the process tree to exit after the kill signal.
    pub terminate_timeout_ms: u64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".into(),
            ingest_url: "rtmp://live.twitch.tv/app".into(),
            audio_input: PathBuf::from("music.mp3"),
            preset: "veryfast".into(),
            video_bitrate_kbps: 5000,
            max_bitrate_kbps: 6000,
            buffer_kbps: 12000,
            gop: 60,
            audio_bitrate_kbps: 128,
            terminate_timeout_ms: 5000,
        }
    }
}

impl EncoderConfig {
    #[inline]
    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }
}

/// Which transport carries the control plane.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Redis,
    /// In-process hub; nothing outside this process can reach it.
    Memory,
}

/// Control-plane connection settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub backend: Backend,
    pub url: String,
    /// Namespace of commands addressed to this process (subscribed as `<ns>.>`).
    pub inbound_namespace: String,
    /// Namespace this process announces itself on (`<ns>.ping`, `<ns>.connected`).
    pub outbound_namespace: String,
    /// Bounded wait for the liveness probe answer.
    pub probe_timeout_ms: u64,
    /// Heartbeat probe interval (`0` = disabled).
    pub heartbeat_secs: u64,
    pub backoff: BackoffPolicy,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Redis,
            url: "redis://127.0.0.1:6379".into(),
            inbound_namespace: "bot".into(),
            outbound_namespace: "streamer".into(),
            probe_timeout_ms: 5000,
            heartbeat_secs: 30,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl BrokerConfig {
    #[inline]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    #[inline]
    pub fn heartbeat(&self) -> Option<Duration> {
        non_zero_secs(self.heartbeat_secs)
    }
}

/// Supervisor limits.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Restart budget.
    pub restart_limit: u32,
    /// Maximum wait for the control plane to drain during shutdown.
    pub grace_secs: u64,
    /// Event bus ring buffer size (min 1).
    pub bus_capacity: usize,
    /// Upper bound for one remote evaluation (`0` = none).
    pub eval_timeout_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_limit: DEFAULT_RESTART_LIMIT,
            grace_secs: 10,
            bus_capacity: 1024,
            eval_timeout_ms: 0,
        }
    }
}

impl SupervisorConfig {
    #[inline]
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    #[inline]
    pub fn eval_timeout(&self) -> Option<Duration> {
        match self.eval_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }
}

/// Log filter used when `RUST_LOG` is unset.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info,streamvisor=debug".into(),
        }
    }
}

impl Config {
    /// Reads, parses and validates the file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content, &path.display().to_string())
    }

    /// Parses and validates TOML text; `origin` names the source in error messages.
    pub fn parse(content: &str, origin: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: origin.to_string(),
            reason: e.message().to_string(),
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Resolves the config path: first CLI argument, then [`CONFIG_ENV`], then [`DEFAULT_CONFIG_PATH`].
    pub fn resolve_path(arg: Option<String>) -> PathBuf {
        arg.or_else(|| std::env::var(CONFIG_ENV).ok())
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Checks required fields and value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stream.stream_key.trim().is_empty() {
            return Err(ConfigError::Missing("stream.stream_key"));
        }
        if self.stream.dashboard_url.trim().is_empty() {
            return Err(ConfigError::Missing("stream.dashboard_url"));
        }
        if !(1..=MAX_FRAME_RATE).contains(&self.stream.frame_rate) {
            return Err(ConfigError::Invalid {
                field: "stream.frame_rate",
                reason: format!("{} is not within 1..={MAX_FRAME_RATE}", self.stream.frame_rate),
            });
        }
        let timers = [
            ("stream.forced_restart_secs", self.stream.forced_restart_secs),
            ("stream.credential_refresh_secs", self.stream.credential_refresh_secs),
            ("broker.heartbeat_secs", self.broker.heartbeat_secs),
            ("supervisor.grace_secs", self.supervisor.grace_secs),
        ];
        for (field, secs) in timers {
            if secs > MAX_TIMER_SECS {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{secs}s exceeds the {MAX_TIMER_SECS}s maximum"),
                });
            }
        }
        let backoff = &self.broker.backoff;
        if !backoff.factor.is_finite() || backoff.factor < 1.0 {
            return Err(ConfigError::Invalid {
                field: "broker.backoff.factor",
                reason: format!("{} is not a finite number >= 1", backoff.factor),
            });
        }
        if self.broker.inbound_namespace.is_empty() || self.broker.outbound_namespace.is_empty() {
            return Err(ConfigError::Missing("broker namespaces"));
        }
        Ok(())
    }

    /// Restart budget and scheduled restart interval.
    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            hard_limit: self.supervisor.restart_limit,
            forced_interval: self.stream.forced_restart(),
        }
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    match secs {
        0 => None,
        s => Some(Duration::from_secs(s)),
    }
}
