//! Per-model rendering into the mix
//!
//! The source mixer knows how to turn each registered model into audio and
//! add it to a set of planar output buffers. Dense waveforms are copied with
//! channel mapping; event models are synthesized through a per-model
//! [`ClipSampler`]. All rendering happens on the fill thread at the source
//! sample rate; the mixer itself holds no timeline state beyond pending
//! note-offs.

use std::collections::{BTreeSet, HashMap};

use crate::clip::{ClipSampler, NoteEnd, NoteStart};
use crate::error::{EngineError, EngineResult};
use crate::model::{ModelData, PlayParams};
use crate::types::{pan_gain, ModelHandle, Sample};

/// A pending note-off, ordered by frame then pitch; `seq` keeps insertion
/// order stable between otherwise identical offs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct NoteOff {
    frame: u64,
    frequency_bits: u32,
    seq: u64,
}

/// Synthesis state for one event-based model. `sampler` stays `None` when
/// the clip failed to load; the model is then registered but silent.
struct SynthState {
    sampler: Option<ClipSampler>,
    f0: f32,
    note_offs: BTreeSet<NoteOff>,
}

/// Renders single models additively into planar buffers.
pub struct SourceMixer {
    sample_rate: u32,
    target_channels: usize,
    block_size: usize,
    synths: HashMap<u64, SynthState>,
    note_off_seq: u64,
    scratch: Vec<Sample>,
}

impl SourceMixer {
    pub fn new(sample_rate: u32, target_channels: usize, block_size: usize) -> Self {
        Self {
            sample_rate,
            target_channels,
            block_size,
            synths: HashMap::new(),
            note_off_seq: 0,
            scratch: vec![0.0; block_size],
        }
    }

    /// The internal processing block size. `frame_count` arguments to
    /// [`mix_model`](Self::mix_model) must be a multiple of this for event
    /// models; they are rendered in sub-blocks of this many frames.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Buffers passed to `mix_model` must hold at least this many channels.
    pub fn set_target_channel_count(&mut self, channels: usize) {
        self.target_channels = channels;
        for synth in self.synths.values_mut() {
            if let Some(sampler) = synth.sampler.as_mut() {
                sampler.set_channel_count(channels);
            }
        }
    }

    pub fn target_channel_count(&self) -> usize {
        self.target_channels
    }

    /// Register a model, building its synth if it needs one. A failed clip
    /// load registers the model silent and reports the failure; the caller
    /// decides whether that is fatal.
    pub fn add_model(&mut self, handle: ModelHandle, model: &ModelData) -> EngineResult<()> {
        let spec = match model.synth() {
            Some(spec) => spec,
            None => return Ok(()),
        };

        let mut sampler = ClipSampler::new(self.target_channels, self.sample_rate, self.block_size);
        let loaded = sampler.load_clip_data(&spec.clip_path, spec.clip_f0);
        let state = SynthState {
            sampler: loaded.is_ok().then_some(sampler),
            f0: spec.clip_f0,
            note_offs: BTreeSet::new(),
        };
        self.synths.insert(handle.raw(), state);

        match loaded {
            Ok(()) => Ok(()),
            Err(e) => Err(EngineError::SynthUnavailable {
                handle: handle.raw(),
                reason: e.to_string(),
            }),
        }
    }

    pub fn remove_model(&mut self, handle: ModelHandle) {
        self.synths.remove(&handle.raw());
    }

    pub fn clear_models(&mut self) {
        self.synths.clear();
    }

    /// Drop all playing notes and pending note-offs, keeping models
    /// registered. Called on seek and stop.
    pub fn reset(&mut self) {
        for synth in self.synths.values_mut() {
            if let Some(sampler) = synth.sampler.as_mut() {
                sampler.reset();
            }
            synth.note_offs.clear();
        }
    }

    /// Mix `frame_count` frames of one model, starting at `start_frame` on
    /// the model's timeline, additively into `buffers`. Returns the number
    /// of frames the model actually contributed.
    ///
    /// `fade_in` and `fade_out` apply linear edge ramps within the rendered
    /// span (used at loop boundaries). For event models `frame_count` must
    /// be a multiple of [`block_size`](Self::block_size); fades are not
    /// applied to synthesized material.
    pub fn mix_model(
        &mut self,
        handle: ModelHandle,
        model: &ModelData,
        params: PlayParams,
        start_frame: u64,
        frame_count: usize,
        buffers: &mut [Vec<Sample>],
        fade_in: usize,
        fade_out: usize,
    ) -> usize {
        debug_assert!(buffers.len() >= self.target_channels);
        if params.muted || params.gain == 0.0 {
            return frame_count;
        }

        match model {
            ModelData::Wave(wave) => {
                self.mix_dense(wave, params, start_frame, frame_count, buffers, fade_in, fade_out)
            }
            ModelData::Instants(_) | ModelData::Notes(_) => {
                debug_assert_eq!(frame_count % self.block_size, 0);
                self.mix_synthetic(handle, model, params, start_frame, frame_count, buffers)
            }
        }
    }

    fn mix_dense(
        &mut self,
        wave: &crate::model::WaveModel,
        params: PlayParams,
        start_frame: u64,
        frame_count: usize,
        buffers: &mut [Vec<Sample>],
        fade_in: usize,
        fade_out: usize,
    ) -> usize {
        let model_channels = wave.channel_count();
        if self.scratch.len() < frame_count {
            self.scratch.resize(frame_count, 0.0);
        }

        let mut mixed = 0;
        for target in 0..self.target_channels {
            // Replicates mono across all targets, wraps when the model has
            // fewer channels than the output
            let source = target % model_channels;
            let got = wave.read_frames(source, start_frame, &mut self.scratch[..frame_count]);
            if got == 0 {
                continue;
            }
            mixed = mixed.max(got);

            let gain = params.gain * pan_gain(target, self.target_channels, params.pan);
            let buffer = &mut buffers[target];
            for (i, &sample) in self.scratch[..got].iter().enumerate() {
                let mut value = sample * gain;
                if fade_in > 0 && i < fade_in {
                    value *= (i + 1) as f32 / fade_in as f32;
                }
                if fade_out > 0 && i + fade_out >= frame_count {
                    value *= (frame_count - i) as f32 / fade_out as f32;
                }
                buffer[i] += value;
            }
        }
        mixed
    }

    fn mix_synthetic(
        &mut self,
        handle: ModelHandle,
        model: &ModelData,
        params: PlayParams,
        start_frame: u64,
        frame_count: usize,
        buffers: &mut [Vec<Sample>],
    ) -> usize {
        let channels = self.target_channels;
        let block = self.block_size;
        let synth = match self.synths.get_mut(&handle.raw()) {
            Some(synth) => synth,
            None => return 0,
        };

        let mut offset = 0;
        while offset < frame_count {
            let block_start = start_frame + offset as u64;
            let block_end = block_start + block as u64;

            let mut starts = Vec::new();
            let mut ends = Vec::new();

            match model {
                ModelData::Instants(instants) => {
                    // Percussive hits at the clip's own pitch; the note
                    // simply plays out, no explicit off
                    for &frame in instants.instants_in(block_start, block_end) {
                        starts.push(NoteStart {
                            frame_offset: (frame - block_start) as i64,
                            frequency: synth.f0,
                            level: 1.0,
                            pan: params.pan,
                        });
                    }
                }
                ModelData::Notes(notes) => {
                    for note in notes.notes_starting_in(block_start, block_end) {
                        starts.push(NoteStart {
                            frame_offset: (note.frame - block_start) as i64,
                            frequency: note.frequency,
                            level: note.level,
                            pan: params.pan,
                        });
                        self.note_off_seq += 1;
                        synth.note_offs.insert(NoteOff {
                            frame: note.end_frame(),
                            frequency_bits: note.frequency.to_bits(),
                            seq: self.note_off_seq,
                        });
                    }

                    let due_bound = NoteOff {
                        frame: block_end,
                        frequency_bits: 0,
                        seq: 0,
                    };
                    let due: Vec<NoteOff> = synth.note_offs.range(..due_bound).copied().collect();
                    for off in due {
                        synth.note_offs.remove(&off);
                        ends.push(NoteEnd {
                            frame_offset: off.frame.saturating_sub(block_start) as usize,
                            frequency: f32::from_bits(off.frequency_bits),
                        });
                    }
                }
                ModelData::Wave(_) => unreachable!("dense models never reach the synth path"),
            }

            if let Some(sampler) = synth.sampler.as_mut() {
                let mut views: Vec<&mut [Sample]> = buffers[..channels]
                    .iter_mut()
                    .map(|b| &mut b[offset..offset + block])
                    .collect();
                sampler.mix(&mut views, params.gain, &starts, &ends);
            }

            offset += block;
        }
        frame_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InstantModel, NoteEvent, NoteModel, SynthSpec, WaveModel};
    use anyhow::Result;
    use std::path::PathBuf;

    const BLOCK: usize = 1024;

    fn buffers(channels: usize, frames: usize) -> Vec<Vec<Sample>> {
        vec![vec![0.0; frames]; channels]
    }

    fn energy(buffer: &[Sample]) -> f32 {
        buffer.iter().map(|s| s * s).sum()
    }

    fn write_clip(dir: &tempfile::TempDir) -> Result<PathBuf> {
        let path = dir.path().join("clip.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 44100,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(&path, spec)?;
        for i in 0..44100 {
            writer.write_sample(
                (2.0 * std::f32::consts::PI * 220.0 * i as f32 / 44100.0).sin(),
            )?;
        }
        writer.finalize()?;
        Ok(path)
    }

    #[test]
    fn test_dense_stereo_mix_applies_gain() {
        let wave = WaveModel::new(44100, vec![vec![1.0; BLOCK], vec![-1.0; BLOCK]]);
        let model = ModelData::Wave(wave);
        let mut mixer = SourceMixer::new(44100, 2, BLOCK);
        let params = PlayParams {
            gain: 0.5,
            ..Default::default()
        };

        let mut out = buffers(2, BLOCK);
        let mixed = mixer.mix_model(ModelHandle(1), &model, params, 0, BLOCK, &mut out, 0, 0);
        assert_eq!(mixed, BLOCK);
        assert!(out[0].iter().all(|&s| (s - 0.5).abs() < 1e-6));
        assert!(out[1].iter().all(|&s| (s + 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_dense_mono_replicates_with_pan() {
        let wave = WaveModel::new(44100, vec![vec![1.0; BLOCK]]);
        let model = ModelData::Wave(wave);
        let mut mixer = SourceMixer::new(44100, 2, BLOCK);
        let params = PlayParams {
            pan: 1.0,
            ..Default::default()
        };

        let mut out = buffers(2, BLOCK);
        mixer.mix_model(ModelHandle(1), &model, params, 0, BLOCK, &mut out, 0, 0);
        // Full right pan silences the left channel
        assert!(out[0].iter().all(|&s| s.abs() < 1e-6));
        assert!(out[1].iter().all(|&s| (s - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_dense_mix_past_model_end_is_silent() {
        let wave = WaveModel::new(44100, vec![vec![1.0; 100]]);
        let model = ModelData::Wave(wave);
        let mut mixer = SourceMixer::new(44100, 1, BLOCK);

        let mut out = buffers(1, BLOCK);
        let mixed = mixer.mix_model(
            ModelHandle(1),
            &model,
            PlayParams::default(),
            1000,
            BLOCK,
            &mut out,
            0,
            0,
        );
        assert_eq!(mixed, 0);
        assert!(out[0].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_muted_model_contributes_nothing() {
        let wave = WaveModel::new(44100, vec![vec![1.0; BLOCK]]);
        let model = ModelData::Wave(wave);
        let mut mixer = SourceMixer::new(44100, 1, BLOCK);
        let params = PlayParams {
            muted: true,
            ..Default::default()
        };

        let mut out = buffers(1, BLOCK);
        mixer.mix_model(ModelHandle(1), &model, params, 0, BLOCK, &mut out, 0, 0);
        assert!(out[0].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_fade_in_ramps_from_silence() {
        let wave = WaveModel::new(44100, vec![vec![1.0; BLOCK]]);
        let model = ModelData::Wave(wave);
        let mut mixer = SourceMixer::new(44100, 1, BLOCK);

        let mut out = buffers(1, BLOCK);
        mixer.mix_model(
            ModelHandle(1),
            &model,
            PlayParams::default(),
            0,
            BLOCK,
            &mut out,
            64,
            0,
        );
        assert!(out[0][0] < 0.1);
        assert!(out[0][63] > 0.9);
        assert!((out[0][64] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_note_model_starts_and_ends_notes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_clip(&dir)?;
        let synth = SynthSpec {
            clip_path: path,
            clip_f0: 220.0,
        };
        // One note spanning the first block only
        let notes = NoteModel::new(44100, vec![NoteEvent::new(0, BLOCK as u64, 220.0)], synth);
        let model = ModelData::Notes(notes);

        let mut mixer = SourceMixer::new(44100, 1, BLOCK);
        mixer.add_model(ModelHandle(1), &model)?;

        let mut out = buffers(1, BLOCK);
        mixer.mix_model(
            ModelHandle(1),
            &model,
            PlayParams::default(),
            0,
            BLOCK,
            &mut out,
            0,
            0,
        );
        assert!(energy(&out[0]) > 0.1, "note should sound in its own block");

        // Two blocks later the note has been switched off
        let mut later = buffers(1, BLOCK);
        mixer.mix_model(
            ModelHandle(1),
            &model,
            PlayParams::default(),
            2 * BLOCK as u64,
            BLOCK,
            &mut later,
            0,
            0,
        );
        assert!(
            energy(&later[0]) < 1e-6,
            "note should be silent after its off"
        );
        Ok(())
    }

    #[test]
    fn test_reset_cuts_held_notes_and_pending_offs() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_clip(&dir)?;
        let synth = SynthSpec {
            clip_path: path,
            clip_f0: 220.0,
        };
        // A long note held across many blocks
        let notes = NoteModel::new(
            44100,
            vec![NoteEvent::new(0, 10 * BLOCK as u64, 220.0)],
            synth,
        );
        let model = ModelData::Notes(notes);

        let mut mixer = SourceMixer::new(44100, 1, BLOCK);
        mixer.add_model(ModelHandle(1), &model)?;

        let mut out = buffers(1, BLOCK);
        mixer.mix_model(
            ModelHandle(1),
            &model,
            PlayParams::default(),
            0,
            BLOCK,
            &mut out,
            0,
            0,
        );
        assert!(energy(&out[0]) > 0.1);

        // A cursor jump (loop wrap, seek) resets the mixer; the held note
        // must not ring on into material after the jump
        mixer.reset();
        let mut after = buffers(1, BLOCK);
        mixer.mix_model(
            ModelHandle(1),
            &model,
            PlayParams::default(),
            4 * BLOCK as u64,
            BLOCK,
            &mut after,
            0,
            0,
        );
        assert!(
            energy(&after[0]) < 1e-6,
            "note survived a mixer reset across a cursor jump"
        );
        Ok(())
    }

    #[test]
    fn test_instants_trigger_percussive_hits() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_clip(&dir)?;
        let synth = SynthSpec {
            clip_path: path,
            clip_f0: 220.0,
        };
        let instants = InstantModel::new(44100, vec![100], synth);
        let model = ModelData::Instants(instants);

        let mut mixer = SourceMixer::new(44100, 2, BLOCK);
        mixer.add_model(ModelHandle(1), &model)?;

        let mut out = buffers(2, BLOCK);
        mixer.mix_model(
            ModelHandle(1),
            &model,
            PlayParams::default(),
            0,
            BLOCK,
            &mut out,
            0,
            0,
        );
        assert!(energy(&out[0][..100]) < 1e-12, "silent before the instant");
        assert!(energy(&out[0][100..]) > 0.1, "hit sounds from the instant");
        Ok(())
    }

    #[test]
    fn test_missing_clip_registers_silent_model() {
        let synth = SynthSpec {
            clip_path: PathBuf::from("/nonexistent/clip.wav"),
            clip_f0: 220.0,
        };
        let instants = InstantModel::new(44100, vec![0], synth);
        let model = ModelData::Instants(instants);

        let mut mixer = SourceMixer::new(44100, 1, BLOCK);
        let err = mixer.add_model(ModelHandle(7), &model).unwrap_err();
        assert!(matches!(err, EngineError::SynthUnavailable { handle: 7, .. }));

        // Still registered: mixing succeeds and produces silence
        let mut out = buffers(1, BLOCK);
        let mixed = mixer.mix_model(
            ModelHandle(7),
            &model,
            PlayParams::default(),
            0,
            BLOCK,
            &mut out,
            0,
            0,
        );
        assert_eq!(mixed, BLOCK);
        assert!(out[0].iter().all(|&s| s == 0.0));
    }
}
