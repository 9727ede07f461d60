//! Playable data models
//!
//! The mixer supports a small, fixed set of model categories, expressed as
//! a closed enum so dispatch is exhaustive at compile time: dense sampled
//! waveforms played directly, sparse instant events synthesized as
//! percussive hits, and pitched note intervals synthesized with on/off
//! pairs. Model content is immutable once registered; the owning document
//! layer replaces models rather than mutating them.

use std::path::PathBuf;
use std::sync::Arc;

use crate::types::Sample;

/// Per-model playback parameters, adjustable after registration.
#[derive(Debug, Clone, Copy)]
pub struct PlayParams {
    /// Linear gain applied when mixing
    pub gain: f32,
    /// Stereo placement in [-1, 1]
    pub pan: f32,
    /// Muted models stay registered but contribute nothing
    pub muted: bool,
}

impl Default for PlayParams {
    fn default() -> Self {
        Self {
            gain: 1.0,
            pan: 0.0,
            muted: false,
        }
    }
}

/// Reference clip and fundamental used to synthesize an event-based model.
#[derive(Debug, Clone)]
pub struct SynthSpec {
    /// WAV file holding the reference clip
    pub clip_path: PathBuf,
    /// Fundamental frequency of the clip in Hz
    pub clip_f0: f32,
}

/// A dense sampled waveform: planar channel data at a native rate.
#[derive(Debug, Clone)]
pub struct WaveModel {
    sample_rate: u32,
    channels: Vec<Arc<[Sample]>>,
    frame_count: u64,
}

impl WaveModel {
    /// Build from planar channel data. All channels must be equally long
    /// and there must be at least one.
    pub fn new(sample_rate: u32, channels: Vec<Vec<Sample>>) -> Self {
        assert!(!channels.is_empty(), "waveform needs at least one channel");
        let frame_count = channels[0].len() as u64;
        assert!(
            channels.iter().all(|c| c.len() as u64 == frame_count),
            "waveform channels must be the same length"
        );
        Self {
            sample_rate,
            channels: channels.into_iter().map(Arc::from).collect(),
            frame_count,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Copy up to `out.len()` frames of `channel` starting at `start`;
    /// returns the number copied (short at end of model, zero past it).
    pub fn read_frames(&self, channel: usize, start: u64, out: &mut [Sample]) -> usize {
        let data = &self.channels[channel];
        if start >= self.frame_count {
            return 0;
        }
        let start = start as usize;
        let count = out.len().min(data.len() - start);
        out[..count].copy_from_slice(&data[start..start + count]);
        count
    }
}

/// A sparse one-dimensional model: instants on the timeline, each
/// triggering a percussive hit from the model's clip synth.
#[derive(Debug, Clone)]
pub struct InstantModel {
    sample_rate: u32,
    /// Event frames, ascending
    frames: Vec<u64>,
    synth: SynthSpec,
}

impl InstantModel {
    pub fn new(sample_rate: u32, mut frames: Vec<u64>, synth: SynthSpec) -> Self {
        frames.sort_unstable();
        Self {
            sample_rate,
            frames,
            synth,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn synth(&self) -> &SynthSpec {
        &self.synth
    }

    pub fn end_frame(&self) -> u64 {
        self.frames.last().copied().unwrap_or(0)
    }

    /// Instants with `start <= frame < end`, in order.
    pub fn instants_in(&self, start: u64, end: u64) -> &[u64] {
        let lo = self.frames.partition_point(|&f| f < start);
        let hi = self.frames.partition_point(|&f| f < end);
        &self.frames[lo..hi]
    }
}

/// One pitched note: a frequency sounding over a frame interval.
#[derive(Debug, Clone, Copy)]
pub struct NoteEvent {
    pub frame: u64,
    pub duration: u64,
    pub frequency: f32,
    /// Per-note velocity in (0, 1]
    pub level: f32,
}

impl NoteEvent {
    pub fn new(frame: u64, duration: u64, frequency: f32) -> Self {
        Self {
            frame,
            duration,
            frequency,
            level: 1.0,
        }
    }

    /// Convenience constructor from a MIDI pitch number.
    pub fn from_midi(frame: u64, duration: u64, pitch: u8) -> Self {
        let frequency = 440.0 * ((pitch as f32 - 69.0) / 12.0).exp2();
        Self::new(frame, duration, frequency)
    }

    pub fn end_frame(&self) -> u64 {
        self.frame + self.duration
    }
}

/// A pitched note-interval model, synthesized with the model's clip synth.
#[derive(Debug, Clone)]
pub struct NoteModel {
    sample_rate: u32,
    /// Notes ascending by start frame
    notes: Vec<NoteEvent>,
    synth: SynthSpec,
}

impl NoteModel {
    pub fn new(sample_rate: u32, mut notes: Vec<NoteEvent>, synth: SynthSpec) -> Self {
        notes.sort_by_key(|n| n.frame);
        Self {
            sample_rate,
            notes,
            synth,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn synth(&self) -> &SynthSpec {
        &self.synth
    }

    pub fn end_frame(&self) -> u64 {
        self.notes.iter().map(|n| n.end_frame()).max().unwrap_or(0)
    }

    /// Notes with `start <= note.frame < end`, in order.
    pub fn notes_starting_in(&self, start: u64, end: u64) -> &[NoteEvent] {
        let lo = self.notes.partition_point(|n| n.frame < start);
        let hi = self.notes.partition_point(|n| n.frame < end);
        &self.notes[lo..hi]
    }
}

/// The closed set of model categories the mixer can play.
#[derive(Debug, Clone)]
pub enum ModelData {
    /// Dense sampled waveform
    Wave(WaveModel),
    /// Sparse instant events (percussive synthesis)
    Instants(InstantModel),
    /// Pitched note intervals (sampled synthesis)
    Notes(NoteModel),
}

impl ModelData {
    pub fn sample_rate(&self) -> u32 {
        match self {
            ModelData::Wave(m) => m.sample_rate(),
            ModelData::Instants(m) => m.sample_rate(),
            ModelData::Notes(m) => m.sample_rate(),
        }
    }

    /// Channels this model natively provides. Event models synthesize at
    /// the mixer's target width and report 1.
    pub fn channel_count(&self) -> usize {
        match self {
            ModelData::Wave(m) => m.channel_count(),
            ModelData::Instants(_) | ModelData::Notes(_) => 1,
        }
    }

    /// Frame after which this model has nothing further to play.
    pub fn end_frame(&self) -> u64 {
        match self {
            ModelData::Wave(m) => m.frame_count(),
            ModelData::Instants(m) => m.end_frame(),
            ModelData::Notes(m) => m.end_frame(),
        }
    }

    /// Synth spec for event-based models, if any.
    pub fn synth(&self) -> Option<&SynthSpec> {
        match self {
            ModelData::Wave(_) => None,
            ModelData::Instants(m) => Some(m.synth()),
            ModelData::Notes(m) => Some(m.synth()),
        }
    }
}
