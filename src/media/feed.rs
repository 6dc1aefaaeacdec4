//! # Fixed-rate feed loop.
//!
//! Writes the current [`FrameCell`] contents to the encoder input once per tick. The loop
//! does not own the encoder: a restart can replace it at any time, so the loop must notice
//! a closed input and stop on its own.
//!
//! ```text
//! tick ──► frame = cell.load()
//!            ├─ empty          ─► skip (never write an empty frame)
//!            └─ write_all+flush
//!                  ├─ ok               ─► next tick
//!                  ├─ pipe closed      ─► FeedExit::Closed   (stop quietly)
//!                  └─ any other error  ─► FeedExit::Failed   (fatal)
//! ```

use std::io::ErrorKind;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::media::frame::FrameCell;

/// Why the feed loop stopped.
#[derive(Debug)]
pub enum FeedExit {
    /// The generation was cancelled.
    Cancelled,
    /// The encoder input was closed (encoder gone or replaced).
    Closed(String),
    /// A write failed for another reason; the encoder pipe is load-bearing.
    Failed(std::io::Error),
}

/// Runs until cancelled, the input closes or a write fails.
pub async fn run_feed<W>(
    cell: FrameCell,
    mut input: W,
    period: Duration,
    token: CancellationToken,
) -> FeedExit
where
    W: AsyncWrite + Unpin,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return FeedExit::Cancelled,
            _ = ticker.tick() => {}
        }

        let frame = cell.load();
        if frame.is_empty() {
            continue;
        }

        let written = tokio::select! {
            biased;
            _ = token.cancelled() => return FeedExit::Cancelled,
            res = write_frame(&mut input, &frame) => res,
        };
        match written {
            Ok(()) => {}
            Err(e) if is_closed(&e) => return FeedExit::Closed(e.to_string()),
            Err(e) => return FeedExit::Failed(e),
        }
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(input: &mut W, frame: &[u8]) -> std::io::Result<()> {
    input.write_all(frame).await?;
    input.flush().await
}

fn is_closed(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::WriteZero
            | ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::AsyncReadExt;

    const PERIOD: Duration = Duration::from_millis(33);

    #[tokio::test(start_paused = true)]
    async fn repeats_the_last_frame_without_new_input() {
        let cell = FrameCell::new(Bytes::from_static(b"AB"));
        let (writer, mut reader) = tokio::io::duplex(1024);
        let token = CancellationToken::new();
        let feed = tokio::spawn(run_feed(cell.clone(), writer, PERIOD, token.clone()));

        let mut buf = [0u8; 6];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ABABAB");

        cell.store(Bytes::from_static(b"CD"));
        let mut buf = [0u8; 4];
        loop {
            reader.read_exact(&mut buf[..2]).await.unwrap();
            if &buf[..2] == b"CD" {
                break;
            }
            assert_eq!(&buf[..2], b"AB");
        }
        reader.read_exact(&mut buf[2..]).await.unwrap();
        assert_eq!(&buf[2..], b"CD");

        token.cancel();
        assert!(matches!(feed.await.unwrap(), FeedExit::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_frames_are_never_written() {
        let cell = FrameCell::default();
        let (writer, mut reader) = tokio::io::duplex(64);
        let token = CancellationToken::new();
        let feed = tokio::spawn(run_feed(cell.clone(), writer, PERIOD, token.clone()));

        tokio::time::sleep(PERIOD * 5).await;
        cell.store(Bytes::from_static(b"X"));

        let mut first = [0u8; 1];
        reader.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"X");
        token.cancel();
        feed.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn closed_input_stops_the_loop() {
        let cell = FrameCell::new(Bytes::from_static(b"frame"));
        let (writer, reader) = tokio::io::duplex(64);
        drop(reader);

        let exit = run_feed(cell, writer, PERIOD, CancellationToken::new()).await;
        assert!(matches!(exit, FeedExit::Closed(_)));
    }

    struct Faulty;

    impl AsyncWrite for Faulty {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::Error::other("device error")))
        }
        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn other_write_errors_are_fatal() {
        let cell = FrameCell::new(Bytes::from_static(b"frame"));
        let exit = run_feed(cell, Faulty, PERIOD, CancellationToken::new()).await;
        assert!(matches!(exit, FeedExit::Failed(_)));
    }
}
