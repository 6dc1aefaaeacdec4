//! Media path: frames in from the source, bytes out to the encoder.
//!
//! ```text
//! FrameSource ──frames──► pump_frames ──store──► FrameCell ──load──► run_feed ──► encoder stdin
//!                                                                               (ProcessHandle)
//! ```

mod feed;
mod frame;
mod process;
mod source;
mod still;

pub use feed::{run_feed, FeedExit};
pub use frame::FrameCell;
pub use process::{EncoderInput, EncoderLauncher, ExitReport, FfmpegLauncher, ProcessHandle};
pub use source::{pump_frames, Attachment, FrameSource, Page, ScreencastFrame};
pub use still::StillImageSource;
