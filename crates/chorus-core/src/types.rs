//! Common types for the chorus playback core.

/// Audio sample type used throughout the pipeline (32-bit float, planar).
pub type Sample = f32;

/// Default source sample rate assumed until a model establishes one.
pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

/// Stable handle issued when a model is registered with the playback source.
///
/// Handles index the coordinator's model table and the mixer's per-model
/// synth and note-off state. They stay valid until the model is removed;
/// they are never reused within the lifetime of a `PlaybackSource`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelHandle(pub(crate) u64);

impl ModelHandle {
    /// Raw handle value, for display and logging.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Gain applied to one output channel for a source panned with `pan`.
///
/// Balance-style pan law: pan > 0 attenuates the left channel, pan < 0 the
/// right, centre leaves both at unity. Channels beyond the first two (or a
/// mono target) get unity.
#[inline]
pub fn pan_gain(channel: usize, target_channels: usize, pan: f32) -> f32 {
    if target_channels < 2 {
        return 1.0;
    }
    match channel {
        0 => {
            if pan > 0.0 {
                1.0 - pan
            } else {
                1.0
            }
        }
        1 => {
            if pan < 0.0 {
                pan + 1.0
            } else {
                1.0
            }
        }
        _ => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pan_gain_centre_is_unity() {
        assert_eq!(pan_gain(0, 2, 0.0), 1.0);
        assert_eq!(pan_gain(1, 2, 0.0), 1.0);
    }

    #[test]
    fn test_pan_gain_hard_right_kills_left() {
        assert_eq!(pan_gain(0, 2, 1.0), 0.0);
        assert_eq!(pan_gain(1, 2, 1.0), 1.0);
    }

    #[test]
    fn test_pan_gain_mono_target_ignores_pan() {
        assert_eq!(pan_gain(0, 1, -1.0), 1.0);
    }
}
