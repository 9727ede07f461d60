//! Sampled-clip note synthesis
//!
//! A digital sampler in the musician's sense: notes of arbitrary frequency
//! are produced by resampling one prerecorded reference clip with linear
//! interpolation. Any number of simultaneous notes is supported, as long as
//! they all come from the same clip; a sampler plays exactly one clip for
//! its whole life, so the generator constructs one sampler per event model.

use std::path::{Path, PathBuf};

use hound::{SampleFormat, WavReader};

use crate::error::{EngineError, EngineResult};
use crate::types::Sample;

/// Release fade applied to the tail of an ending note, in seconds.
const RELEASE_TIME: f32 = 0.01;

/// A note beginning inside the current processing block.
#[derive(Debug, Clone, Copy)]
pub struct NoteStart {
    /// Offset within the current block; goes negative as the note ages
    /// across subsequent blocks
    pub frame_offset: i64,
    /// Pitch in Hz
    pub frequency: f32,
    /// Volume in (0, 1]
    pub level: f32,
    /// Stereo placement in [-1, 1]
    pub pan: f32,
}

/// A note ending inside the current processing block, matched to its start
/// by frequency.
#[derive(Debug, Clone, Copy)]
pub struct NoteEnd {
    /// Offset within the current block
    pub frame_offset: usize,
    pub frequency: f32,
}

/// Polyphonic single-clip sampler mixing into planar output buffers.
pub struct ClipSampler {
    channels: usize,
    sample_rate: u32,
    block_size: usize,

    clip_path: PathBuf,
    /// Mono clip data; empty until a clip is loaded
    clip: Vec<Sample>,
    clip_f0: f32,
    clip_rate: f32,

    playing: Vec<NoteStart>,
}

impl ClipSampler {
    pub fn new(channels: usize, sample_rate: u32, block_size: usize) -> Self {
        Self {
            channels,
            sample_rate,
            block_size,
            clip_path: PathBuf::new(),
            clip: Vec::new(),
            clip_f0: 0.0,
            clip_rate: 0.0,
            playing: Vec::new(),
        }
    }

    pub fn set_channel_count(&mut self, channels: usize) {
        self.channels = channels;
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Load the reference clip from a WAV file, mixed down to mono. This can
    /// only happen once: construct a new sampler for a different clip.
    pub fn load_clip_data(&mut self, path: &Path, clip_f0: f32) -> EngineResult<()> {
        if !self.clip.is_empty() {
            return Err(EngineError::ClipAlreadyLoaded);
        }

        let reader = WavReader::open(path).map_err(|e| EngineError::ClipLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;

        let interleaved: Vec<Sample> = match spec.sample_format {
            SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<Result<_, _>>()
                .map_err(|e| EngineError::ClipLoad {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })?,
            SampleFormat::Int => {
                let scale = 1.0 / (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 * scale))
                    .collect::<Result<_, _>>()
                    .map_err(|e| EngineError::ClipLoad {
                        path: path.to_path_buf(),
                        reason: e.to_string(),
                    })?
            }
        };

        let frames = interleaved.len() / channels;
        let mut mono = vec![0.0; frames];
        for (i, frame) in interleaved.chunks_exact(channels).enumerate() {
            mono[i] = frame.iter().sum::<Sample>() / channels as Sample;
        }

        log::debug!(
            "loaded clip {:?}: {} frames at {} Hz, f0 {} Hz",
            path,
            frames,
            spec.sample_rate,
            clip_f0
        );

        self.clip_path = path.to_path_buf();
        self.clip = mono;
        self.clip_f0 = clip_f0;
        self.clip_rate = spec.sample_rate as f32;
        Ok(())
    }

    pub fn clip_path(&self) -> &Path {
        &self.clip_path
    }

    /// Discard any playing notes.
    pub fn reset(&mut self) {
        self.playing.clear();
    }

    /// Clip-data step per output sample for a note at `frequency`.
    fn source_step_for(&self, frequency: f32) -> f32 {
        if self.clip.is_empty() || self.clip_rate == 0.0 || self.clip_f0 == 0.0 {
            return 1.0;
        }
        (frequency / self.clip_f0) * (self.clip_rate / self.sample_rate as f32)
    }

    /// Length in output samples of the whole clip resampled for `frequency`.
    fn resampled_duration_for(&self, frequency: f32) -> i64 {
        let step = self.source_step_for(frequency);
        (self.clip.len() as f32 / step).ceil() as i64
    }

    /// Mix one block of all playing notes into `to`, which must hold
    /// `channels` buffers of at least `block_size` samples each.
    ///
    /// `new_notes` begin at their frame offsets within this block;
    /// `ending_notes` are matched to playing notes by frequency and given a
    /// short release fade. Notes that have exhausted the resampled clip are
    /// dropped silently.
    pub fn mix(
        &mut self,
        to: &mut [&mut [Sample]],
        gain: f32,
        new_notes: &[NoteStart],
        ending_notes: &[NoteEnd],
    ) {
        debug_assert!(to.len() >= self.channels);

        self.playing.extend_from_slice(new_notes);

        let mut remaining = Vec::with_capacity(self.playing.len());
        let playing = std::mem::take(&mut self.playing);
        let mut levels = vec![0.0; self.channels];
        // Each end terminates exactly one note; `playing` is oldest-first,
        // so overlapping same-pitch notes release in starting order
        let mut ends_used = vec![false; ending_notes.len()];

        for mut note in playing {
            for level in levels.iter_mut() {
                *level = note.level * gain;
            }
            if note.pan != 0.0 && self.channels == 2 {
                levels[0] *= 1.0 - note.pan;
                levels[1] *= note.pan + 1.0;
            }

            let ending = ending_notes
                .iter()
                .zip(ends_used.iter_mut())
                .find(|(end, used)| !**used && end.frequency == note.frequency)
                .map(|(end, used)| {
                    *used = true;
                    *end
                });

            let target_start = note.frame_offset.max(0) as usize;
            let target_end = match ending {
                Some(end) => end.frame_offset.min(self.block_size),
                None => self.block_size,
            };
            if target_start >= target_end {
                continue;
            }
            let source_offset = (-note.frame_offset).max(0);

            self.mix_note(
                to,
                &levels,
                note.frequency,
                source_offset,
                target_start,
                target_end - target_start,
                ending.is_some(),
            );

            if ending.is_none() {
                note.frame_offset -= self.block_size as i64;
                // A note past the end of its resampled clip has gone silent
                if -note.frame_offset < self.resampled_duration_for(note.frequency) {
                    remaining.push(note);
                }
            }
        }

        self.playing = remaining;
    }

    fn mix_note(
        &self,
        to: &mut [&mut [Sample]],
        levels: &[Sample],
        frequency: f32,
        source_offset: i64,
        target_offset: usize,
        sample_count: usize,
        is_end: bool,
    ) {
        if self.clip.is_empty() {
            return;
        }
        let step = self.source_step_for(frequency);

        let mut release_samples = (RELEASE_TIME * self.sample_rate as f32) as usize;
        if release_samples > sample_count {
            release_samples = sample_count;
        }
        let release_fraction = 1.0 / release_samples.max(1) as f32;

        for i in 0..sample_count {
            let source = (source_offset + i as i64) as f32 * step;
            let index = source.floor() as i64;
            if index < 0 || index as usize + 1 >= self.clip.len() {
                continue;
            }
            let index = index as usize;
            let frac = source - index as f32;
            let mut value = self.clip[index] * (1.0 - frac) + self.clip[index + 1] * frac;

            if is_end && i + release_samples > sample_count {
                value *= (sample_count - i) as f32 * release_fraction;
            }

            for (channel, &level) in to.iter_mut().zip(levels.iter()) {
                channel[target_offset + i] += level * value;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    /// Write a mono sine clip and return its path.
    fn write_clip(
        dir: &tempfile::TempDir,
        freq: f32,
        rate: u32,
        frames: usize,
    ) -> Result<PathBuf> {
        let path = dir.path().join("clip.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(&path, spec)?;
        for i in 0..frames {
            writer.write_sample((2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin())?;
        }
        writer.finalize()?;
        Ok(path)
    }

    fn zero_crossing_period(signal: &[Sample]) -> Option<f32> {
        let crossings: Vec<usize> = signal
            .windows(2)
            .enumerate()
            .filter(|(_, w)| w[0] <= 0.0 && w[1] > 0.0)
            .map(|(i, _)| i)
            .collect();
        if crossings.len() < 2 {
            return None;
        }
        let span = (crossings[crossings.len() - 1] - crossings[0]) as f32;
        Some(span / (crossings.len() - 1) as f32)
    }

    #[test]
    fn test_clip_loads_once_only() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_clip(&dir, 220.0, 44100, 4410)?;

        let mut sampler = ClipSampler::new(2, 44100, 1024);
        sampler.load_clip_data(&path, 220.0)?;
        assert!(matches!(
            sampler.load_clip_data(&path, 220.0),
            Err(EngineError::ClipAlreadyLoaded)
        ));
        Ok(())
    }

    #[test]
    fn test_missing_clip_file_reports_path() {
        let mut sampler = ClipSampler::new(2, 44100, 1024);
        let err = sampler
            .load_clip_data(Path::new("/nonexistent/clip.wav"), 220.0)
            .unwrap_err();
        match err {
            EngineError::ClipLoad { path, .. } => {
                assert_eq!(path, PathBuf::from("/nonexistent/clip.wav"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_octave_up_doubles_playback_frequency() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_clip(&dir, 220.0, 44100, 44100)?;

        let block = 1024;
        let mut sampler = ClipSampler::new(1, 44100, block);
        sampler.load_clip_data(&path, 220.0)?;

        let note = NoteStart {
            frame_offset: 0,
            frequency: 440.0,
            level: 1.0,
            pan: 0.0,
        };
        let mut out = vec![0.0; block];
        sampler.mix(&mut [out.as_mut_slice()], 1.0, &[note], &[]);
        for _ in 0..3 {
            out.fill(0.0);
            sampler.mix(&mut [out.as_mut_slice()], 1.0, &[], &[]);
        }

        // Clip recorded at 220 Hz, requested at 440: period should halve
        let period = zero_crossing_period(&out).expect("no signal in block");
        let expected = 44100.0 / 440.0;
        assert!(
            (period - expected).abs() < 2.0,
            "period {period}, expected {expected}"
        );
        Ok(())
    }

    #[test]
    fn test_pan_splits_levels_between_channels() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_clip(&dir, 220.0, 44100, 44100)?;

        let block = 512;
        let mut sampler = ClipSampler::new(2, 44100, block);
        sampler.load_clip_data(&path, 220.0)?;

        let note = NoteStart {
            frame_offset: 0,
            frequency: 220.0,
            level: 1.0,
            pan: 0.5,
        };
        let mut left_buf = vec![0.0; block];
        let mut right_buf = vec![0.0; block];
        sampler.mix(
            &mut [left_buf.as_mut_slice(), right_buf.as_mut_slice()],
            1.0,
            &[note],
            &[],
        );

        let rms = |b: &[Sample]| (b.iter().map(|s| s * s).sum::<f32>() / b.len() as f32).sqrt();
        let (left, right) = (rms(&left_buf), rms(&right_buf));
        assert!(right > left * 2.0, "pan 0.5: left {left}, right {right}");
        Ok(())
    }

    #[test]
    fn test_ending_note_stops_sounding() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_clip(&dir, 220.0, 44100, 44100)?;

        let block = 1024;
        let mut sampler = ClipSampler::new(1, 44100, block);
        sampler.load_clip_data(&path, 220.0)?;

        let note = NoteStart {
            frame_offset: 0,
            frequency: 220.0,
            level: 1.0,
            pan: 0.0,
        };
        let mut out = vec![0.0; block];
        sampler.mix(&mut [out.as_mut_slice()], 1.0, &[note], &[]);

        let end = NoteEnd {
            frame_offset: 0,
            frequency: 220.0,
        };
        out.fill(0.0);
        sampler.mix(&mut [out.as_mut_slice()], 1.0, &[], &[end]);
        // Ended at offset 0: nothing of the note remains in this block
        assert!(out.iter().all(|&s| s == 0.0));

        out.fill(0.0);
        sampler.mix(&mut [out.as_mut_slice()], 1.0, &[], &[]);
        assert!(out.iter().all(|&s| s == 0.0));
        Ok(())
    }

    #[test]
    fn test_zero_duration_note_in_one_call_is_silent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_clip(&dir, 220.0, 44100, 44100)?;

        let block = 1024;
        let mut sampler = ClipSampler::new(1, 44100, block);
        sampler.load_clip_data(&path, 220.0)?;

        // Start and end at the same offset, delivered together
        let note = NoteStart {
            frame_offset: 300,
            frequency: 220.0,
            level: 1.0,
            pan: 0.0,
        };
        let end = NoteEnd {
            frame_offset: 300,
            frequency: 220.0,
        };
        let mut out = vec![0.0; block];
        sampler.mix(&mut [out.as_mut_slice()], 1.0, &[note], &[end]);
        assert!(out.iter().all(|&s| s == 0.0));

        // And nothing lingers into the next block
        out.fill(0.0);
        sampler.mix(&mut [out.as_mut_slice()], 1.0, &[], &[]);
        assert!(out.iter().all(|&s| s == 0.0));
        Ok(())
    }

    #[test]
    fn test_one_end_stops_one_of_two_same_pitch_notes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_clip(&dir, 220.0, 44100, 44100)?;

        let block = 1024;
        let mut sampler = ClipSampler::new(1, 44100, block);
        sampler.load_clip_data(&path, 220.0)?;

        let note = NoteStart {
            frame_offset: 0,
            frequency: 220.0,
            level: 1.0,
            pan: 0.0,
        };
        let end = NoteEnd {
            frame_offset: 0,
            frequency: 220.0,
        };
        let mut out = vec![0.0; block];
        sampler.mix(&mut [out.as_mut_slice()], 1.0, &[note], &[]);

        // Second note at the same pitch starts as the first one ends
        out.fill(0.0);
        sampler.mix(&mut [out.as_mut_slice()], 1.0, &[note], &[end]);

        // The newer note must still be sounding in the following block
        out.fill(0.0);
        sampler.mix(&mut [out.as_mut_slice()], 1.0, &[], &[]);
        let energy: f32 = out.iter().map(|s| s * s).sum();
        assert!(energy > 0.1, "surviving note went silent: energy {energy}");

        // A second end takes out the remaining note
        out.fill(0.0);
        sampler.mix(&mut [out.as_mut_slice()], 1.0, &[], &[end]);
        out.fill(0.0);
        sampler.mix(&mut [out.as_mut_slice()], 1.0, &[], &[]);
        assert!(out.iter().all(|&s| s == 0.0));
        Ok(())
    }

    #[test]
    fn test_reset_discards_playing_notes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_clip(&dir, 220.0, 44100, 44100)?;

        let block = 512;
        let mut sampler = ClipSampler::new(1, 44100, block);
        sampler.load_clip_data(&path, 220.0)?;

        let note = NoteStart {
            frame_offset: 0,
            frequency: 220.0,
            level: 1.0,
            pan: 0.0,
        };
        let mut out = vec![0.0; block];
        sampler.mix(&mut [out.as_mut_slice()], 1.0, &[note], &[]);
        sampler.reset();

        out.fill(0.0);
        sampler.mix(&mut [out.as_mut_slice()], 1.0, &[], &[]);
        assert!(out.iter().all(|&s| s == 0.0));
        Ok(())
    }
}
