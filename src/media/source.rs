//! # Frame source collaborator.
//!
//! The browser that renders the dashboard lives outside this crate. The supervisor talks to
//! it through two traits:
//!
//! - [`FrameSource`] opens and closes a render session and persists its credentials.
//! - [`Page`] is the live page of one session: reload, script evaluation, frame acks.
//!
//! Frames arrive as base64 screencast events at an irregular rate. [`pump_frames`] decodes
//! each one into the [`FrameCell`] and acknowledges it, so the source keeps sending.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::commands::RemoteValue;
use crate::error::SourceError;
use crate::media::frame::FrameCell;

/// One screencast frame as delivered by the source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScreencastFrame {
    /// Base64-encoded image.
    pub data: String,
    /// Id to acknowledge the frame with.
    pub session_id: u64,
}

/// A live render session.
pub struct Attachment {
    pub page: Arc<dyn Page>,
    pub frames: mpsc::Receiver<ScreencastFrame>,
}

/// Live page handle.
#[async_trait]
pub trait Page: Send + Sync + 'static {
    /// Reloads the page; `Ok(false)` means the page reported an unsuccessful reload.
    async fn reload(&self) -> Result<bool, SourceError>;

    /// Runs `script` in the page and returns its completion value.
    ///
    /// A script that throws yields `Err(SourceError::Evaluate(message))`.
    async fn evaluate(&self, script: &str) -> Result<RemoteValue, SourceError>;

    /// Acknowledges a screencast frame.
    async fn ack_frame(&self, session_id: u64) -> Result<(), SourceError>;
}

/// Opens render sessions.
#[async_trait]
pub trait FrameSource: Send + Sync + 'static {
    /// Starts a session: browser up, dashboard loaded, screencast running.
    async fn attach(&self) -> Result<Attachment, SourceError>;

    /// Writes the current session credentials to durable storage if they changed.
    async fn persist_credentials(&self) -> Result<(), SourceError> {
        Ok(())
    }

    /// Tears the session down.
    async fn close(&self) -> Result<(), SourceError>;
}

/// Forwards frames into `cell` until the source stops or `token` is cancelled.
///
/// Undecodable frames are skipped; the cell keeps its previous frame.
pub async fn pump_frames(
    mut frames: mpsc::Receiver<ScreencastFrame>,
    page: Arc<dyn Page>,
    cell: FrameCell,
    token: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => return,
            frame = frames.recv() => frame,
        };
        let Some(frame) = frame else {
            debug!("frame source stopped sending");
            return;
        };

        match STANDARD.decode(frame.data.as_bytes()) {
            Ok(bytes) => cell.store(Bytes::from(bytes)),
            Err(e) => warn!(error = %SourceError::Decode(e.to_string()), "skipping frame"),
        }
        if let Err(e) = page.ack_frame(frame.session_id).await {
            debug!(session_id = frame.session_id, error = %e, "frame ack failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct AckLog(Mutex<Vec<u64>>);

    #[async_trait]
    impl Page for AckLog {
        async fn reload(&self) -> Result<bool, SourceError> {
            Ok(true)
        }
        async fn evaluate(&self, _script: &str) -> Result<RemoteValue, SourceError> {
            Ok(RemoteValue::Undefined)
        }
        async fn ack_frame(&self, session_id: u64) -> Result<(), SourceError> {
            self.0.lock().unwrap().push(session_id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn decodes_into_cell_and_acks_every_frame() {
        let (tx, rx) = mpsc::channel(4);
        let page = Arc::new(AckLog::default());
        let cell = FrameCell::new(Bytes::from_static(b"startup"));

        tx.send(ScreencastFrame {
            data: STANDARD.encode(b"frame-1"),
            session_id: 1,
        })
        .await
        .unwrap();
        tx.send(ScreencastFrame {
            data: "%%% not base64".into(),
            session_id: 2,
        })
        .await
        .unwrap();
        drop(tx);

        pump_frames(rx, page.clone(), cell.clone(), CancellationToken::new()).await;

        assert_eq!(cell.load(), Bytes::from_static(b"frame-1"));
        assert_eq!(*page.0.lock().unwrap(), vec![1, 2]);
    }
}
