//! # Encoder process handle and launchers.
//!
//! A [`ProcessHandle`] is the supervisor's only grip on a running encoder:
//!
//! ```text
//! ProcessHandle
//!   ├─ pid          (cleared once released)
//!   ├─ input        raw image bytes go here, taken once by the feed loop
//!   ├─ exited()     resolves with an ExitReport when the process is gone
//!   └─ release()    kill the whole process tree, wait (bounded) for it to go away
//! ```
//!
//! `release` is idempotent: after the first call the handle is inert.
//! Dropping a handle without releasing it still kills the process.

use std::future::Future;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::io::{AsyncBufReadExt, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use crate::config::{EncoderConfig, StreamConfig};
use crate::error::ProcessError;

/// How an encoder process ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExitReport {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Human-readable status (`"exit status: 1"`, `"signal: 9 (SIGKILL)"`, ...).
    pub description: String,
}

impl ExitReport {
    fn from_status(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            description: status.to_string(),
        }
    }
}

/// Writable encoder input.
pub type EncoderInput = Box<dyn AsyncWrite + Send + Unpin>;

type Release = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), ProcessError>> + Send>;

/// Handle on one spawned encoder process.
pub struct ProcessHandle {
    pid: Option<u32>,
    input: Option<EncoderInput>,
    exit: watch::Receiver<Option<ExitReport>>,
    release: Option<Release>,
}

impl ProcessHandle {
    /// Assembles a handle.
    ///
    /// `exit` must be set to `Some(report)` by whoever owns the process once it is gone.
    /// `release` must terminate the process tree and return once it is gone or a bounded
    /// wait elapsed.
    pub fn new<F>(
        pid: Option<u32>,
        input: EncoderInput,
        exit: watch::Receiver<Option<ExitReport>>,
        release: F,
    ) -> Self
    where
        F: FnOnce() -> BoxFuture<'static, Result<(), ProcessError>> + Send + 'static,
    {
        Self {
            pid,
            input: Some(input),
            exit,
            release: Some(Box::new(release)),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Takes the input stream. Only the first call returns it.
    pub fn take_input(&mut self) -> Option<EncoderInput> {
        self.input.take()
    }

    /// Resolves when the process has exited; `None` if its owner vanished without a report.
    pub fn exited(&self) -> impl Future<Output = Option<ExitReport>> + Send + 'static {
        let mut exit = self.exit.clone();
        async move {
            match exit.wait_for(Option::is_some).await {
                Ok(report) => (*report).clone(),
                Err(_) => None,
            }
        }
    }

    /// The exit report, if the process is already gone.
    pub fn exit_report(&self) -> Option<ExitReport> {
        self.exit.borrow().clone()
    }

    pub fn is_released(&self) -> bool {
        self.release.is_none()
    }

    /// Tears the process tree down. Later calls return `Ok(())` immediately.
    pub async fn release(&mut self) -> Result<(), ProcessError> {
        self.pid = None;
        self.input = None;
        match self.release.take() {
            Some(release) => release().await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Starts encoder processes.
#[async_trait]
pub trait EncoderLauncher: Send + Sync + 'static {
    async fn launch(&self) -> Result<ProcessHandle, ProcessError>;
}

/// Launches `ffmpeg` reading PNG frames from stdin and pushing FLV over RTMP.
pub struct FfmpegLauncher {
    encoder: EncoderConfig,
    stream_key: String,
    frame_rate: u32,
}

impl FfmpegLauncher {
    pub fn new(encoder: EncoderConfig, stream: &StreamConfig) -> Self {
        Self {
            encoder,
            stream_key: stream.stream_key.clone(),
            frame_rate: stream.frame_rate,
        }
    }

    /// Full argument list handed to the encoder.
    pub fn args(&self) -> Vec<String> {
        let e = &self.encoder;
        let kbps = |v: u32| format!("{v}k");
        let output = format!("{}/{}", e.ingest_url.trim_end_matches('/'), self.stream_key);

        [
            "-y",
            "-re",
            "-stream_loop",
            "-1",
            "-f",
            "image2pipe",
            "-r",
        ]
        .iter()
        .map(|s| s.to_string())
        .chain([
            self.frame_rate.to_string(),
            "-i".into(),
            "-".into(),
            "-i".into(),
            e.audio_input.display().to_string(),
            "-filter_complex".into(),
            "[1:a]aloop=loop=-1:size=2e9[aout]".into(),
            "-map".into(),
            "0:v".into(),
            "-map".into(),
            "[aout]".into(),
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            e.preset.clone(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-b:v".into(),
            kbps(e.video_bitrate_kbps),
            "-maxrate".into(),
            kbps(e.max_bitrate_kbps),
            "-bufsize".into(),
            kbps(e.buffer_kbps),
            "-g".into(),
            e.gop.to_string(),
            "-keyint_min".into(),
            e.gop.to_string(),
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            kbps(e.audio_bitrate_kbps),
            "-f".into(),
            "flv".into(),
            output,
        ])
        .collect()
    }
}

#[async_trait]
impl EncoderLauncher for FfmpegLauncher {
    async fn launch(&self) -> Result<ProcessHandle, ProcessError> {
        let mut cmd = Command::new(&self.encoder.program);
        cmd.args(self.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: self.encoder.program.clone(),
            source,
        })?;
        let pid = child.id();
        let stdin = child.stdin.take().ok_or(ProcessError::MissingInput)?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr, pid));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(own_child(child, kill_rx, exit_tx));

        let timeout = self.encoder.terminate_timeout();
        let exit_wait = exit_rx.clone();
        let release = move || {
            async move {
                let _ = kill_tx.send(());
                wait_for_exit(exit_wait, pid, timeout).await
            }
            .boxed()
        };

        Ok(ProcessHandle::new(pid, Box::new(stdin), exit_rx, release))
    }
}

async fn wait_for_exit(
    mut exit: watch::Receiver<Option<ExitReport>>,
    pid: Option<u32>,
    timeout: Duration,
) -> Result<(), ProcessError> {
    match tokio::time::timeout(timeout, exit.wait_for(Option::is_some)).await {
        Ok(_) => Ok(()),
        Err(_) => Err(ProcessError::TerminateTimeout { pid, timeout }),
    }
}

/// Waits for the child, killing its process group when asked (or when the handle is dropped).
async fn own_child(
    mut child: Child,
    kill: oneshot::Receiver<()>,
    exit: watch::Sender<Option<ExitReport>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill => {
            if let Err(e) = kill_tree(&mut child) {
                warn!(error = %e, "kill failed");
            }
            child.wait().await
        }
    };
    let report = match status {
        Ok(status) => ExitReport::from_status(status),
        Err(e) => ExitReport {
            code: None,
            description: format!("wait failed: {e}"),
        },
    };
    let _ = exit.send(Some(report));
}

#[cfg(unix)]
fn kill_tree(child: &mut Child) -> Result<(), ProcessError> {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return Ok(());
    };
    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => Ok(()),
        Err(errno) => {
            let _ = child.start_kill();
            Err(ProcessError::Kill {
                pid,
                reason: errno.to_string(),
            })
        }
    }
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) -> Result<(), ProcessError> {
    let pid = child.id().unwrap_or_default();
    child.start_kill().map_err(|e| ProcessError::Kill {
        pid,
        reason: e.to_string(),
    })
}

async fn forward_stderr(stderr: ChildStderr, pid: Option<u32>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(target: "streamvisor::encoder", pid, "{line}"),
            Ok(None) => return,
            Err(e) => {
                debug!(target: "streamvisor::encoder", pid, error = %e, "stderr closed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn scripted(releases: Arc<AtomicUsize>) -> (ProcessHandle, watch::Sender<Option<ExitReport>>) {
        let (exit_tx, exit_rx) = watch::channel(None);
        let (writer, _reader) = tokio::io::duplex(64);
        let handle = ProcessHandle::new(Some(7), Box::new(writer), exit_rx, move || {
            releases.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }.boxed()
        });
        (handle, exit_tx)
    }

    #[tokio::test]
    async fn release_runs_once_and_clears_pid() {
        let releases = Arc::new(AtomicUsize::new(0));
        let (mut handle, _exit) = scripted(releases.clone());
        assert_eq!(handle.pid(), Some(7));

        handle.release().await.unwrap();
        handle.release().await.unwrap();

        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert_eq!(handle.pid(), None);
        assert!(handle.is_released());
        assert!(handle.take_input().is_none());
    }

    #[tokio::test]
    async fn exited_resolves_with_the_report() {
        let (handle, exit) = scripted(Arc::new(AtomicUsize::new(0)));
        let waiter = handle.exited();
        exit.send(Some(ExitReport {
            code: Some(1),
            description: "exit status: 1".into(),
        }))
        .unwrap();
        assert_eq!(waiter.await.unwrap().code, Some(1));
        assert_eq!(handle.exit_report().and_then(|r| r.code), Some(1));
    }

    #[tokio::test]
    async fn exited_is_none_when_the_owner_vanishes() {
        let (handle, exit) = scripted(Arc::new(AtomicUsize::new(0)));
        drop(exit);
        assert!(handle.exited().await.is_none());
    }

    #[test]
    fn ffmpeg_arguments_follow_the_configuration() {
        let stream = StreamConfig {
            stream_key: "live_42".into(),
            ..StreamConfig::default()
        };
        let launcher = FfmpegLauncher::new(EncoderConfig::default(), &stream);
        let args = launcher.args();

        assert_eq!(&args[..7], &["-y", "-re", "-stream_loop", "-1", "-f", "image2pipe", "-r"]);
        assert_eq!(args[7], "30");
        assert!(args.windows(2).any(|w| w == ["-b:v", "5000k"]));
        assert!(args.windows(2).any(|w| w == ["-keyint_min", "60"]));
        assert!(args.windows(2).any(|w| w == ["-i", "music.mp3"]));
        assert_eq!(args.last().unwrap(), "rtmp://live.twitch.tv/app/live_42");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let encoder = EncoderConfig {
            program: "/nonexistent/streamvisor-encoder".into(),
            ..EncoderConfig::default()
        };
        let launcher = FfmpegLauncher::new(encoder, &StreamConfig::default());
        let err = launcher.launch().await.unwrap_err();
        assert_eq!(err.as_label(), "process_spawn");
    }
}
