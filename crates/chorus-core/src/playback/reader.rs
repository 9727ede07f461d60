//! Real-time read side of the playback source
//!
//! The device callback owns a [`SourceReader`]. Every call drains the
//! state-swap channel first, so reconfiguration is a wholesale replacement
//! of the read state between callbacks, never a partial mutation under the
//! callback's feet. Superseded states go back over the retire channel; the
//! fill thread feeds them to the scavenger. Nothing on this path blocks,
//! allocates or frees.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use rtrb::{Consumer, Producer};
use rubato::{FastFixedIn, PolynomialDegree, Resampler};

use crate::error::{EngineError, EngineResult};
use crate::ring::{RingReader, RingWriter, SampleRing};
use crate::stretch::TimeStretcher;
use crate::types::Sample;

use super::shared::Shared;

/// Capacity of the state-swap channel; the retire channel holds two more so
/// the reader can always hand a superseded state back.
pub(crate) const STATE_CHANNEL_CAP: usize = 64;

/// Source frames fed to a stretcher per iteration of the read loop.
const STRETCH_FEED: usize = 256;

/// Source frames fed to the resampler per conversion call.
const RESAMPLE_CHUNK: usize = 1024;

/// One channel's read path: its sample ring, plus stretch state when a
/// slowdown factor is active.
pub(crate) struct ChannelLane {
    ring: RingReader,
    stretch: Option<LaneStretch>,
}

struct LaneStretch {
    stretcher: TimeStretcher,
    /// Stretched samples produced beyond the current request
    carry_w: RingWriter,
    carry_r: RingReader,
}

/// Everything the real-time thread reads from, swapped in as one unit.
pub(crate) struct ReadState {
    generation: u64,
    ratio: usize,
    channels: Vec<ChannelLane>,
    stage_in: Vec<Sample>,
    stage_out: Vec<Sample>,
    resample: Option<ResampleStage>,
}

impl ReadState {
    /// Build a state and the matching ring writers for the fill thread.
    /// Runs on the control thread; allocation is fine here.
    pub fn build(
        generation: u64,
        channel_count: usize,
        ring_capacity: usize,
        ratio: usize,
        resample_ratio: Option<f64>,
        target_block: usize,
    ) -> EngineResult<(Box<ReadState>, Vec<RingWriter>)> {
        let mut channels = Vec::with_capacity(channel_count);
        let mut writers = Vec::with_capacity(channel_count);

        for _ in 0..channel_count {
            let (writer, reader) = SampleRing::with_capacity(ring_capacity);
            writers.push(writer);
            let stretch = if ratio > 1 {
                let stretcher = TimeStretcher::with_ratio(ratio, STRETCH_FEED);
                let (carry_w, carry_r) = SampleRing::with_capacity(STRETCH_FEED * ratio * 2);
                Some(LaneStretch {
                    stretcher,
                    carry_w,
                    carry_r,
                })
            } else {
                None
            };
            channels.push(ChannelLane {
                ring: reader,
                stretch,
            });
        }

        let resample = match resample_ratio {
            Some(r) if (r - 1.0).abs() > f64::EPSILON => {
                Some(ResampleStage::new(r, channel_count, target_block)?)
            }
            _ => None,
        };

        let state = Box::new(ReadState {
            generation,
            ratio,
            channels,
            stage_in: vec![0.0; STRETCH_FEED],
            stage_out: vec![0.0; STRETCH_FEED * ratio],
            resample,
        });
        Ok((state, writers))
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Deliver `count` frames per channel, zero-padded wherever the
    /// pipeline runs dry.
    fn read<'a>(
        &mut self,
        count: usize,
        outs: impl Iterator<Item = &'a mut [Sample]>,
        shared: &Shared,
    ) {
        if let Some(mut resample) = self.resample.take() {
            resample.pull(self, count, outs, shared);
            self.resample = Some(resample);
        } else {
            self.read_stretched(count, outs, shared);
        }
    }

    /// Drain the rings, through the stretchers when active, into the
    /// per-channel output slices.
    fn read_stretched<'a>(
        &mut self,
        count: usize,
        outs: impl Iterator<Item = &'a mut [Sample]>,
        shared: &Shared,
    ) {
        let ratio = self.ratio;
        let mut first = true;

        for (lane, out) in self.channels.iter_mut().zip(outs) {
            let count = count.min(out.len());
            let out = &mut out[..count];
            let mut produced;
            let mut consumed = 0;

            match lane.stretch.as_mut() {
                None => {
                    produced = lane.ring.read(out);
                    consumed = produced;
                }
                Some(stretch) => {
                    produced = stretch.carry_r.read(out);
                    while produced < count {
                        let need = count - produced;
                        let want = (need + ratio - 1) / ratio;
                        let feed = want.min(STRETCH_FEED).min(lane.ring.read_space());
                        if feed == 0 {
                            break;
                        }
                        lane.ring.read(&mut self.stage_in[..feed]);
                        consumed += feed;

                        let emitted = feed * ratio;
                        stretch
                            .stretcher
                            .process(&self.stage_in[..feed], &mut self.stage_out[..emitted]);

                        let take = emitted.min(need);
                        out[produced..produced + take]
                            .copy_from_slice(&self.stage_out[..take]);
                        stretch.carry_w.write(&self.stage_out[take..emitted]);
                        produced += take;
                    }
                }
            }

            out[produced..].fill(0.0);
            if first {
                shared
                    .frames_read
                    .fetch_add(consumed as u64, Ordering::Relaxed);
                first = false;
            }
        }
    }
}

/// Sample-rate conversion stage, present when the device rate differs from
/// the source rate.
struct ResampleStage {
    resampler: FastFixedIn<Sample>,
    in_buf: Vec<Vec<Sample>>,
    out_buf: Vec<Vec<Sample>>,
    /// Converted frames awaiting delivery, per channel
    fifo: Vec<(RingWriter, RingReader)>,
    fifo_capacity: usize,
}

impl ResampleStage {
    fn new(ratio: f64, channel_count: usize, target_block: usize) -> EngineResult<Self> {
        let resampler = FastFixedIn::new(
            ratio,
            1.0,
            PolynomialDegree::Cubic,
            RESAMPLE_CHUNK,
            channel_count,
        )
        .map_err(|e| EngineError::ReconfigFailed(e.to_string()))?;

        let in_buf = resampler.input_buffer_allocate(true);
        let out_buf = resampler.output_buffer_allocate(true);
        let per_chunk = (RESAMPLE_CHUNK as f64 * ratio).ceil() as usize;
        let fifo_capacity = target_block * 2 + per_chunk * 2;
        let fifo = (0..channel_count)
            .map(|_| SampleRing::with_capacity(fifo_capacity))
            .collect();

        Ok(Self {
            resampler,
            in_buf,
            out_buf,
            fifo,
            fifo_capacity,
        })
    }

    /// Accumulate converted frames until `count` are available (or no
    /// further progress is possible), then deliver them.
    fn pull<'a>(
        &mut self,
        source: &mut ReadState,
        count: usize,
        outs: impl Iterator<Item = &'a mut [Sample]>,
        shared: &Shared,
    ) {
        let target = count.min(self.fifo_capacity.saturating_sub(1));

        while self.fifo[0].1.read_space() < target {
            source.read_stretched(
                RESAMPLE_CHUNK,
                self.in_buf.iter_mut().map(|v| v.as_mut_slice()),
                shared,
            );
            let converted = match self
                .resampler
                .process_into_buffer(&self.in_buf, &mut self.out_buf, None)
            {
                Ok((_, converted)) => converted,
                Err(e) => {
                    log::warn!("sample rate conversion failed: {e}");
                    break;
                }
            };
            if converted == 0 {
                break;
            }
            for ((writer, _), converted_channel) in
                self.fifo.iter_mut().zip(self.out_buf.iter())
            {
                writer.write(&converted_channel[..converted]);
            }
        }

        for ((_, reader), out) in self.fifo.iter_mut().zip(outs) {
            let count = count.min(out.len());
            let out = &mut out[..count];
            let got = reader.read(out);
            out[got..].fill(0.0);
        }
    }
}

/// Real-time handle polled by the device callback.
pub struct SourceReader {
    state: Box<ReadState>,
    incoming: Consumer<Box<ReadState>>,
    retire: Producer<Box<ReadState>>,
    shared: Arc<Shared>,
}

impl SourceReader {
    pub(crate) fn new(
        state: Box<ReadState>,
        incoming: Consumer<Box<ReadState>>,
        retire: Producer<Box<ReadState>>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            state,
            incoming,
            retire,
            shared,
        }
    }

    /// Channel count of the active buffer set.
    pub fn channel_count(&self) -> usize {
        self.state.channel_count()
    }

    /// Store peak meter levels for the UI side to poll.
    pub fn set_output_levels(&self, left: f32, right: f32) {
        self.shared.set_levels(left, right);
    }

    /// Fill `count` frames per channel into `buffers`. Always writes
    /// exactly `count` frames to every provided buffer, zero-padding on
    /// underrun and returning pure silence while stopped; returns `count`.
    ///
    /// Real-time safe: never blocks, never allocates, never frees.
    pub fn get_source_samples(&mut self, count: usize, buffers: &mut [&mut [Sample]]) -> usize {
        self.adopt_incoming();

        // A seek invalidates everything buffered before it; until the
        // post-seek buffer set arrives, silence is the only correct output
        let awaiting_seek = self.state.generation()
            < self.shared.required_generation.load(Ordering::Relaxed);
        if awaiting_seek || !self.shared.playing.load(Ordering::Relaxed) {
            for buffer in buffers.iter_mut() {
                let count = count.min(buffer.len());
                buffer[..count].fill(0.0);
            }
            self.shared.set_levels(0.0, 0.0);
            return count;
        }

        let channels = self.state.channel_count().min(buffers.len());
        self.state.read(
            count,
            buffers[..channels].iter_mut().map(|b| &mut **b),
            &self.shared,
        );
        for buffer in buffers[channels..].iter_mut() {
            let count = count.min(buffer.len());
            buffer[..count].fill(0.0);
        }

        let peak = |buffer: &[Sample]| {
            buffer[..count.min(buffer.len())]
                .iter()
                .fold(0.0f32, |m, s| m.max(s.abs()))
                .min(1.0)
        };
        let left = buffers.first().map(|b| peak(b)).unwrap_or(0.0);
        let right = buffers.get(1).map(|b| peak(b)).unwrap_or(left);
        self.shared.set_levels(left, right);

        count
    }

    /// Swap in any pending read state, handing the superseded one back for
    /// scavenging.
    fn adopt_incoming(&mut self) {
        while let Ok(new_state) = self.incoming.pop() {
            let old = std::mem::replace(&mut self.state, new_state);
            if self.retire.push(old).is_err() {
                // Channel sized so this cannot happen while the fill
                // thread is draining it
                debug_assert!(false, "retire channel overflow");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> Shared {
        Shared::new()
    }

    #[test]
    fn test_plain_read_zero_pads_underrun() {
        let (mut state, mut writers) =
            ReadState::build(1, 2, 1024, 1, None, 1024).expect("build");
        writers[0].write(&[1.0; 100]);
        writers[1].write(&[2.0; 100]);

        let mut left = [9.0; 256];
        let mut right = [9.0; 256];
        let s = shared();
        state.read(
            256,
            [&mut left[..], &mut right[..]].into_iter(),
            &s,
        );
        assert!(left[..100].iter().all(|&v| v == 1.0));
        assert!(left[100..].iter().all(|&v| v == 0.0));
        assert!(right[..100].iter().all(|&v| v == 2.0));
        assert_eq!(s.frames_read.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn test_stretched_read_consumes_fraction_of_source() {
        let ratio = 2;
        let (mut state, mut writers) =
            ReadState::build(1, 1, 8192, ratio, None, 1024).expect("build");
        let tone: Vec<Sample> = (0..4096)
            .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 44100.0).sin())
            .collect();
        writers[0].write(&tone);

        let mut out = [0.0; 1024];
        let s = shared();
        state.read(1024, [&mut out[..]].into_iter(), &s);
        // 1024 output frames require 512 source frames at ratio 2
        assert_eq!(s.frames_read.load(Ordering::Relaxed), 512);
    }

    #[test]
    fn test_resampled_read_delivers_requested_count() {
        // 44100 -> 22050: half as many output frames per source frame
        let (mut state, mut writers) =
            ReadState::build(1, 1, 16384, 1, Some(0.5), 1024).expect("build");
        let source = vec![0.5; 8192];
        writers[0].write(&source);

        let mut out = [9.0; 1000];
        let s = shared();
        state.read(1000, [&mut out[..]].into_iter(), &s);
        assert_eq!(out.len(), 1000);
        // Interior of the block is converted data, not padding
        assert!(out[100..900].iter().any(|&v| v != 0.0));
    }
}
