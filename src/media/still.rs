//! # Still-image frame source.
//!
//! Serves one image file as the whole "screencast". Used when no browser driver is wired
//! in: the stream shows the image, `reload` re-reads it from disk, and script evaluation
//! is unsupported.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::commands::RemoteValue;
use crate::error::SourceError;
use crate::media::source::{Attachment, FrameSource, Page, ScreencastFrame};

/// [`FrameSource`] backed by an image file.
pub struct StillImageSource {
    path: PathBuf,
    current: Mutex<Option<Arc<StillPage>>>,
}

impl StillImageSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            current: Mutex::new(None),
        }
    }
}

#[async_trait]
impl FrameSource for StillImageSource {
    async fn attach(&self) -> Result<Attachment, SourceError> {
        let (tx, rx) = mpsc::channel(4);
        let page = Arc::new(StillPage {
            path: self.path.clone(),
            frames: tx,
            next_id: AtomicU64::new(0),
        });
        page.push_frame()
            .await
            .map_err(|e| SourceError::Attach(e.to_string()))?;

        *self.current.lock().await = Some(Arc::clone(&page));
        Ok(Attachment { page, frames: rx })
    }

    async fn close(&self) -> Result<(), SourceError> {
        if self.current.lock().await.take().is_some() {
            debug!(path = %self.path.display(), "still image source closed");
        }
        Ok(())
    }
}

struct StillPage {
    path: PathBuf,
    frames: mpsc::Sender<ScreencastFrame>,
    next_id: AtomicU64,
}

impl StillPage {
    async fn push_frame(&self) -> Result<(), SourceError> {
        let image = tokio::fs::read(&self.path)
            .await
            .map_err(|e| SourceError::Other(format!("{}: {e}", self.path.display())))?;
        let frame = ScreencastFrame {
            data: STANDARD.encode(image),
            session_id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };
        self.frames.send(frame).await.map_err(|_| SourceError::Closed)
    }
}

#[async_trait]
impl Page for StillPage {
    async fn reload(&self) -> Result<bool, SourceError> {
        match self.push_frame().await {
            Ok(()) => Ok(true),
            Err(SourceError::Closed) => Err(SourceError::Closed),
            Err(e) => Err(SourceError::Reload(e.to_string())),
        }
    }

    async fn evaluate(&self, _script: &str) -> Result<RemoteValue, SourceError> {
        Err(SourceError::Unsupported("script evaluation"))
    }

    async fn ack_frame(&self, _session_id: u64) -> Result<(), SourceError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_image(name: &str, bytes: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("streamvisor-{}-{name}", std::process::id()));
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[tokio::test]
    async fn attach_emits_the_image_and_reload_rereads_it() {
        let path = temp_image("still.png", b"first");
        let source = StillImageSource::new(&path);

        let Attachment { page, mut frames } = source.attach().await.unwrap();
        let first = frames.recv().await.unwrap();
        assert_eq!(STANDARD.decode(first.data).unwrap(), b"first");

        std::fs::write(&path, b"second").unwrap();
        assert!(page.reload().await.unwrap());
        let second = frames.recv().await.unwrap();
        assert_eq!(STANDARD.decode(second.data).unwrap(), b"second");
        assert!(second.session_id > first.session_id);

        assert!(matches!(
            page.evaluate("1").await,
            Err(SourceError::Unsupported(_))
        ));
        source.close().await.unwrap();
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn missing_image_fails_attach() {
        let source = StillImageSource::new("/nonexistent/streamvisor/image.png");
        assert!(matches!(source.attach().await, Err(SourceError::Attach(_))));
    }
}
