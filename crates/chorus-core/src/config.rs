//! Playback pipeline configuration
//!
//! Defines the tunable parameters of the coordinator: ring buffer capacity,
//! mixer block size, and the device-reported target parameters accepted
//! before the stream starts.

use serde::{Deserialize, Serialize};

/// Per-channel ring buffer capacity in frames.
/// At 44.1kHz this is ~0.74s of read-ahead, enough to ride out fill-thread
/// scheduling jitter without making seeks feel sluggish.
pub const DEFAULT_RING_CAPACITY: usize = 32768;

/// Internal mixer block size in frames. `frame_count` arguments to the
/// mixer must be a multiple of this.
pub const DEFAULT_MIX_BLOCK_SIZE: usize = 1024;

/// Default device callback block size in frames, until the target reports one.
pub const DEFAULT_TARGET_BLOCK_SIZE: usize = 1024;

/// Largest device callback block the read path pre-allocates for.
pub const MAX_TARGET_BLOCK_SIZE: usize = 8192;

/// Largest supported integer time-stretch ratio.
pub const MAX_STRETCH_RATIO: usize = 16;

/// Configuration for a [`PlaybackSource`](crate::playback::PlaybackSource).
///
/// All values have working defaults; use the `with_*` builders to override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Per-channel ring buffer capacity in frames
    pub ring_capacity: usize,

    /// Internal mixer block size in frames
    pub mix_block_size: usize,

    /// Device callback block size in frames (may be updated later via
    /// `set_target_block_size`)
    pub target_block_size: usize,

    /// Device playback latency in frames at the target rate (may be updated
    /// later via `set_target_play_latency`)
    pub target_play_latency: usize,

    /// Fixed device sample rate, if the target cannot follow the source rate
    /// (None = follow the source; mismatch inserts a resampler)
    pub target_sample_rate: Option<u32>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            ring_capacity: DEFAULT_RING_CAPACITY,
            mix_block_size: DEFAULT_MIX_BLOCK_SIZE,
            target_block_size: DEFAULT_TARGET_BLOCK_SIZE,
            target_play_latency: 0,
            target_sample_rate: None,
        }
    }
}

impl PlaybackConfig {
    /// Create a config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-channel ring buffer capacity in frames
    pub fn with_ring_capacity(mut self, frames: usize) -> Self {
        self.ring_capacity = frames;
        self
    }

    /// Set the internal mixer block size in frames
    pub fn with_mix_block_size(mut self, frames: usize) -> Self {
        self.mix_block_size = frames;
        self
    }

    /// Set the device callback block size in frames
    pub fn with_target_block_size(mut self, frames: usize) -> Self {
        self.target_block_size = frames.min(MAX_TARGET_BLOCK_SIZE);
        self
    }

    /// Set the device playback latency in frames
    pub fn with_target_play_latency(mut self, frames: usize) -> Self {
        self.target_play_latency = frames;
        self
    }

    /// Fix the device sample rate
    pub fn with_target_sample_rate(mut self, rate: u32) -> Self {
        self.target_sample_rate = Some(rate);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_overrides() {
        let config = PlaybackConfig::new()
            .with_ring_capacity(4096)
            .with_target_block_size(256)
            .with_target_sample_rate(48000);
        assert_eq!(config.ring_capacity, 4096);
        assert_eq!(config.target_block_size, 256);
        assert_eq!(config.target_sample_rate, Some(48000));
        assert_eq!(config.mix_block_size, DEFAULT_MIX_BLOCK_SIZE);
    }

    #[test]
    fn test_block_size_clamped_to_max() {
        let config = PlaybackConfig::new().with_target_block_size(1 << 20);
        assert_eq!(config.target_block_size, MAX_TARGET_BLOCK_SIZE);
    }
}
