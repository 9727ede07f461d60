//! Integer-ratio time stretching without pitch change
//!
//! A phase-vocoder stretcher: each analysis window is windowed, rotated for
//! phase alignment, transformed to the frequency domain, and every bin's
//! phase is multiplied by the integer stretch ratio while its magnitude is
//! preserved. The inverse transform is re-windowed and overlap-added into a
//! persistent accumulation buffer, from which `input_hop * ratio` samples
//! are emitted per analysis step. The time axis lengthens by the ratio; the
//! per-window phase progression, and so the perceived pitch, does not.
//!
//! One instance per channel. Instances are not real-time-constructible
//! (FFT planning allocates); the coordinator builds them on configuration
//! changes and swaps them in whole.

mod window;

pub use window::Window;

use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::ring::{RingReader, RingWriter, SampleRing};
use crate::types::Sample;

/// Default analysis hop on the input side, in samples.
pub const DEFAULT_INPUT_HOP: usize = 256;

/// Default analysis window length, in samples. The constructor grows this
/// if needed so the window always spans at least two output hops.
pub const DEFAULT_WINDOW_LEN: usize = 1024;

/// Phase-vocoder time stretcher for a single channel.
pub struct TimeStretcher {
    ratio: usize,
    input_hop: usize,
    output_hop: usize,
    wlen: usize,
    window: Window,
    fft: Arc<dyn Fft<Sample>>,
    ifft: Arc<dyn Fft<Sample>>,
    /// Frequency-domain work buffer, reused across blocks
    freq: Vec<Complex<Sample>>,
    fft_scratch: Vec<Complex<Sample>>,
    /// Time-domain frame being analysed/synthesised
    frame: Vec<Sample>,
    /// Overlap-add accumulation buffer ("mash buffer")
    mash: Vec<Sample>,
    in_writer: RingWriter,
    in_reader: RingReader,
    out_writer: RingWriter,
    out_reader: RingReader,
    underruns: u64,
}

impl TimeStretcher {
    /// Create a stretcher for the given integer `ratio`.
    ///
    /// `max_block` is the largest `input.len()` a single `process` call will
    /// see; it sizes the output ring. `input_hop` and `window_len` control
    /// analysis granularity; `window_len` is grown to at least twice the
    /// output hop so successive synthesis windows always overlap.
    pub fn new(ratio: usize, max_block: usize, input_hop: usize, window_len: usize) -> Self {
        assert!(ratio >= 1, "stretch ratio must be at least 1");
        assert!(input_hop > 0 && max_block > 0);

        let output_hop = input_hop * ratio;
        let wlen = window_len.max(output_hop * 2);

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(wlen);
        let ifft = planner.plan_fft_inverse(wlen);
        let scratch_len = fft
            .get_inplace_scratch_len()
            .max(ifft.get_inplace_scratch_len());

        let (in_writer, in_reader) = SampleRing::with_capacity(wlen);
        let (out_writer, out_reader) = SampleRing::with_capacity(max_block * ratio + wlen);

        Self {
            ratio,
            input_hop,
            output_hop,
            wlen,
            window: Window::hann(wlen),
            fft,
            ifft,
            freq: vec![Complex::new(0.0, 0.0); wlen],
            fft_scratch: vec![Complex::new(0.0, 0.0); scratch_len],
            frame: vec![0.0; wlen],
            mash: vec![0.0; wlen],
            in_writer,
            in_reader,
            out_writer,
            out_reader,
            underruns: 0,
        }
    }

    /// Create a stretcher with the default hop and window length.
    pub fn with_ratio(ratio: usize, max_block: usize) -> Self {
        Self::new(ratio, max_block, DEFAULT_INPUT_HOP, DEFAULT_WINDOW_LEN)
    }

    pub fn ratio(&self) -> usize {
        self.ratio
    }

    pub fn window_len(&self) -> usize {
        self.wlen
    }

    /// Processing latency in output samples: a full window must accumulate
    /// before the first hop is emitted.
    pub fn latency(&self) -> usize {
        self.wlen - self.output_hop
    }

    /// Number of times `process` had to pad its output with silence.
    pub fn underruns(&self) -> u64 {
        self.underruns
    }

    /// Discard all buffered input, output and overlap state.
    pub fn reset(&mut self) {
        let pending_in = self.in_reader.read_space();
        self.in_reader.skip(pending_in);
        let pending_out = self.out_reader.read_space();
        self.out_reader.skip(pending_out);
        self.mash.fill(0.0);
        self.underruns = 0;
    }

    /// Consume `input` and produce `input.len() * ratio` samples into
    /// `output`.
    ///
    /// Output that has not yet accumulated (during the initial window fill)
    /// is zero-filled at the front of `output`; this is the reported
    /// latency, not an error. A starved request after warm-up is logged as
    /// a warning and padded the same way.
    pub fn process(&mut self, input: &[Sample], output: &mut [Sample]) {
        assert_eq!(
            output.len(),
            input.len() * self.ratio,
            "output must hold input.len() * ratio samples"
        );

        let mut consumed = 0;
        while consumed < input.len() {
            let written = self.in_writer.write(&input[consumed..]);
            if written == 0 {
                // Input ring full yet no window ready: output ring must be
                // full too. Should not happen with a correctly sized ring.
                log::warn!("time stretcher input stalled with {} pending", consumed);
                break;
            }
            consumed += written;

            while self.in_reader.read_space() >= self.wlen
                && self.out_writer.write_space() >= self.output_hop
            {
                let got = self.in_reader.peek(&mut self.frame);
                debug_assert_eq!(got, self.wlen);

                self.process_block();

                self.in_reader.skip(self.input_hop);
                self.out_writer.write(&self.mash[..self.output_hop]);

                // Shift the accumulation buffer by one output hop
                self.mash.copy_within(self.output_hop.., 0);
                let tail = self.wlen - self.output_hop;
                self.mash[tail..].fill(0.0);
            }
        }

        let wanted = output.len();
        let available = self.out_reader.read_space();
        if available < wanted {
            if self.underruns > 0 || available > 0 {
                log::warn!(
                    "time stretcher starved: {} of {} output samples ready",
                    available,
                    wanted
                );
            }
            self.underruns += 1;
            let fill = wanted - available;
            output[..fill].fill(0.0);
            self.out_reader.read(&mut output[fill..]);
        } else {
            self.out_reader.read(output);
        }
    }

    /// Stretch one analysis window from `frame` into the mash buffer.
    fn process_block(&mut self) {
        let wlen = self.wlen;
        let half = wlen / 2;

        self.window.cut(&mut self.frame);

        // Rotate so the window centre sits at phase origin
        for i in 0..half {
            self.frame.swap(i, i + half);
        }

        for (bin, &sample) in self.freq.iter_mut().zip(self.frame.iter()) {
            *bin = Complex::new(sample, 0.0);
        }
        self.fft
            .process_with_scratch(&mut self.freq, &mut self.fft_scratch);

        // Multiply each bin's phase by the ratio, preserving magnitude
        let ratio = self.ratio as Sample;
        for bin in self.freq.iter_mut() {
            let mag = bin.norm();
            let phase = bin.im.atan2(bin.re) * ratio;
            *bin = Complex::new(mag * phase.cos(), mag * phase.sin());
        }

        self.ifft
            .process_with_scratch(&mut self.freq, &mut self.fft_scratch);

        // Undo the rotation, normalising the unscaled inverse transform
        let scale = 1.0 / wlen as Sample;
        for i in 0..half {
            let temp = self.freq[i].re * scale;
            self.frame[i] = self.freq[i + half].re * scale;
            self.frame[i + half] = temp;
        }

        self.window.cut(&mut self.frame);

        // Compensate overlap-add gain from windows spaced output_hop apart
        let mut div = wlen / self.output_hop;
        if div > 1 {
            div /= 2;
        }
        let gain = 1.0 / div as Sample;

        for (acc, &sample) in self.mash.iter_mut().zip(self.frame.iter()) {
            *acc += sample * gain;
        }
    }
}
