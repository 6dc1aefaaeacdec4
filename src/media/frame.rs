//! # Single-slot frame holder.
//!
//! [`FrameCell`] decouples the irregular frame source from the fixed-rate feed loop.
//! Writers replace the whole frame atomically; readers get either the previous or the
//! new frame, never a torn one. A reader that misses an update simply sees the previous
//! frame again (frame repetition).
//!
//! ```text
//! frame source ──store()──► [ FrameCell ] ──load()──► feed loop (every 1000/fps ms)
//!   (irregular)            (one slot, overwrite)        (constant rate)
//! ```

use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::Bytes;

/// Shared, overwrite-on-write slot holding the most recent encoded frame.
///
/// Cloning is cheap and every clone observes the same slot.
#[derive(Clone)]
pub struct FrameCell {
    slot: Arc<ArcSwap<Bytes>>,
}

impl FrameCell {
    /// Creates a cell seeded with `initial` (typically the startup image, or empty).
    pub fn new(initial: Bytes) -> Self {
        Self {
            slot: Arc::new(ArcSwap::from_pointee(initial)),
        }
    }

    /// Replaces the current frame.
    pub fn store(&self, frame: Bytes) {
        self.slot.store(Arc::new(frame));
    }

    /// Returns the current frame (a cheap reference-counted handle).
    pub fn load(&self) -> Bytes {
        Bytes::clone(&self.slot.load())
    }

    /// Whether the slot currently holds no data.
    pub fn is_empty(&self) -> bool {
        self.slot.load().is_empty()
    }
}

impl Default for FrameCell {
    fn default() -> Self {
        Self::new(Bytes::new())
    }
}

impl std::fmt::Debug for FrameCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCell")
            .field("len", &self.slot.load().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_write_wins_across_clones() {
        let cell = FrameCell::new(Bytes::from_static(b"startup"));
        let reader = cell.clone();
        assert_eq!(reader.load(), Bytes::from_static(b"startup"));

        cell.store(Bytes::from_static(b"one"));
        cell.store(Bytes::from_static(b"two"));
        assert_eq!(reader.load(), Bytes::from_static(b"two"));
        // Without a new write the same frame is observed again.
        assert_eq!(reader.load(), Bytes::from_static(b"two"));
    }

    #[test]
    fn default_is_empty() {
        assert!(FrameCell::default().is_empty());
    }

    #[test]
    fn concurrent_readers_never_see_torn_frames() {
        let cell = FrameCell::new(Bytes::from(vec![0u8; 4096]));
        let writer = cell.clone();

        let handle = std::thread::spawn(move || {
            for i in 1..=200u8 {
                writer.store(Bytes::from(vec![i; 4096]));
            }
        });

        for _ in 0..2_000 {
            let frame = cell.load();
            let first = frame[0];
            assert!(frame.iter().all(|b| *b == first));
        }
        handle.join().unwrap();
    }
}
