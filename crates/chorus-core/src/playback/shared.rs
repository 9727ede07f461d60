//! State shared between the control surface, the fill thread and the
//! real-time reader
//!
//! Everything here is a relaxed atomic: these values are UI-visible
//! approximations and coordination flags, not synchronization points. The
//! audio data itself only ever moves through the rings and the state-swap
//! channel.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

pub(crate) struct Shared {
    /// Playing/idle; the real-time reader returns silence when false
    pub playing: AtomicBool,
    /// Set once at teardown; the fill thread exits its loop
    pub exiting: AtomicBool,
    /// Next source frame the fill thread will render
    pub render_frame: AtomicU64,
    /// Source frames written to the active buffer set since construction
    pub frames_written: AtomicU64,
    /// Source frames consumed from the active buffer set since construction
    pub frames_read: AtomicU64,
    /// Lowest buffer-set generation the reader may serve. Bumped on seek so
    /// stale pre-seek audio is never audible while the new set is prefilled
    pub required_generation: AtomicU64,
    /// Union sample rate of the registered models; 0 until the first model
    pub source_rate: AtomicU32,
    /// One-time advisory: a model or device rate differs from the source
    pub rate_mismatch: AtomicBool,
    /// Peak meter levels, f32 bits
    level_left: AtomicU32,
    level_right: AtomicU32,
}

impl Shared {
    pub fn new() -> Self {
        Self {
            playing: AtomicBool::new(false),
            exiting: AtomicBool::new(false),
            render_frame: AtomicU64::new(0),
            frames_written: AtomicU64::new(0),
            frames_read: AtomicU64::new(0),
            required_generation: AtomicU64::new(0),
            source_rate: AtomicU32::new(0),
            rate_mismatch: AtomicBool::new(false),
            level_left: AtomicU32::new(0),
            level_right: AtomicU32::new(0),
        }
    }

    pub fn set_levels(&self, left: f32, right: f32) {
        self.level_left.store(left.to_bits(), Ordering::Relaxed);
        self.level_right.store(right.to_bits(), Ordering::Relaxed);
    }

    pub fn levels(&self) -> (f32, f32) {
        (
            f32::from_bits(self.level_left.load(Ordering::Relaxed)),
            f32::from_bits(self.level_right.load(Ordering::Relaxed)),
        )
    }

    /// Source frames currently buffered between the fill thread and the
    /// reader. Approximate while both sides are moving.
    pub fn buffered_frames(&self) -> u64 {
        let written = self.frames_written.load(Ordering::Relaxed);
        let read = self.frames_read.load(Ordering::Relaxed);
        written.saturating_sub(read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_round_trip_through_bits() {
        let shared = Shared::new();
        shared.set_levels(0.25, 0.75);
        assert_eq!(shared.levels(), (0.25, 0.75));
    }

    #[test]
    fn test_buffered_frames_never_underflows() {
        let shared = Shared::new();
        shared.frames_read.store(100, Ordering::Relaxed);
        shared.frames_written.store(40, Ordering::Relaxed);
        assert_eq!(shared.buffered_frames(), 0);
    }
}
