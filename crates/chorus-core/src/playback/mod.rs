//! Playback source coordinator
//!
//! Owns the registered model set and the background fill thread, and hands
//! out a [`SourceReader`] for the device callback. The two sides never share
//! mutable structures: the fill thread renders into ring writers, the reader
//! drains the matching ring readers, and every configuration change builds a
//! complete replacement read state that is prefilled, pushed over a state
//! channel, and adopted by the reader between callbacks. Superseded states
//! come back over a retire channel and are freed by the scavenger on the
//! fill thread.

mod reader;
mod shared;

pub use reader::SourceReader;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use rtrb::{Consumer, Producer, PushError, RingBuffer};

use crate::config::{PlaybackConfig, MAX_STRETCH_RATIO, MAX_TARGET_BLOCK_SIZE};
use crate::error::{EngineError, EngineResult};
use crate::generator::SourceMixer;
use crate::model::{ModelData, PlayParams};
use crate::ring::RingWriter;
use crate::scavenger::Scavenger;
use crate::types::{ModelHandle, Sample, DEFAULT_SAMPLE_RATE};

use reader::{ReadState, STATE_CHANNEL_CAP};
use shared::Shared;

/// Edge fade length applied on the blocks adjacent to a loop wrap, frames.
const LOOP_FADE: usize = 256;

/// Fill thread poll interval while idle or buffer-full. Drain signalling
/// from the real-time side is by polling; the callback never touches the
/// condition variable.
const FILL_POLL: Duration = Duration::from_millis(20);

struct ModelEntry {
    data: ModelData,
    params: PlayParams,
}

/// Write side of one buffer-set generation: ring writers plus the planar
/// mix scratch the fill thread renders into.
struct WriterSet {
    writers: Vec<RingWriter>,
    mix: Vec<Vec<Sample>>,
}

/// A freshly built read state waiting to be prefilled and published.
struct PendingSwap {
    state: Box<ReadState>,
    writers: WriterSet,
}

struct FillState {
    config: PlaybackConfig,
    models: HashMap<u64, ModelEntry>,
    mixer: SourceMixer,
    writers: Option<WriterSet>,
    pending: Option<PendingSwap>,
    /// Next source frame to render
    cursor: u64,
    play_range: Option<(u64, u64)>,
    looping: bool,
    slowdown: usize,
    /// 0 until the first model establishes it
    source_rate: u32,
    target_rate: Option<u32>,
    target_block: usize,
    play_latency: usize,
    last_model_end: u64,
    next_handle: u64,
    generation: u64,
}

impl FillState {
    fn source_rate_or_default(&self) -> u32 {
        if self.source_rate == 0 {
            DEFAULT_SAMPLE_RATE
        } else {
            self.source_rate
        }
    }

    /// Channel count the device sees: stereo minimum, wider if any model is.
    fn target_channels(&self) -> usize {
        self.models
            .values()
            .map(|m| m.data.channel_count())
            .max()
            .unwrap_or(0)
            .max(2)
    }

    fn source_channels(&self) -> usize {
        self.models
            .values()
            .map(|m| m.data.channel_count())
            .max()
            .unwrap_or(0)
    }

    fn recompute_end(&mut self) {
        self.last_model_end = self
            .models
            .values()
            .map(|m| m.data.end_frame())
            .max()
            .unwrap_or(0);
    }

    fn effective_end(&self) -> u64 {
        self.play_range
            .map(|(_, end)| end)
            .unwrap_or(self.last_model_end)
    }

    /// Build a replacement read state for the current configuration and
    /// queue it for prefill and publication. The previous set stays active
    /// (and audible) until the swap lands.
    fn schedule_rebuild(&mut self) -> EngineResult<()> {
        let channels = self.target_channels();
        let source_rate = self.source_rate_or_default();
        let resample_ratio = match self.target_rate {
            Some(target) if target != source_rate => Some(target as f64 / source_rate as f64),
            _ => None,
        };

        self.generation += 1;
        let (state, writers) = ReadState::build(
            self.generation,
            channels,
            self.config.ring_capacity,
            self.slowdown,
            resample_ratio,
            self.target_block,
        )?;

        let block = self.mixer.block_size();
        self.mixer.set_target_channel_count(channels);
        // An unsent pending set is superseded outright; it never reached
        // the reader, so dropping it here is safe
        self.pending = Some(PendingSwap {
            state,
            writers: WriterSet {
                writers,
                mix: vec![vec![0.0; block]; channels],
            },
        });
        Ok(())
    }

    /// Render one mixer block into `writers`. Returns false when there is
    /// no space or no material left to render.
    fn render_block(&mut self, writers: &mut WriterSet, shared: &Shared) -> bool {
        let block = self.mixer.block_size();
        let has_space = writers
            .writers
            .first()
            .map(|w| w.write_space() >= block)
            .unwrap_or(false);
        if !has_space {
            return false;
        }

        let end = self.effective_end();
        let loop_start = self.play_range.map(|(start, _)| start).unwrap_or(0);

        // Loop spans are quantized to whole mixer blocks so event models
        // always see block-aligned render ranges
        let (fade_in, fade_out, wrap_to) = if self.looping && end > loop_start {
            let span_blocks = (((end - loop_start) as usize) / block).max(1);
            let quantized_end = loop_start + (span_blocks * block) as u64;
            if self.cursor < loop_start || self.cursor >= quantized_end {
                self.cursor = loop_start;
            }
            let fade_in = if self.cursor == loop_start {
                LOOP_FADE.min(block)
            } else {
                0
            };
            let wrapping = self.cursor + block as u64 >= quantized_end;
            let fade_out = if wrapping { LOOP_FADE.min(block) } else { 0 };
            (fade_in, fade_out, wrapping.then_some(loop_start))
        } else {
            if self.cursor >= end {
                return false;
            }
            (0, 0, None)
        };

        for channel in writers.mix.iter_mut() {
            channel.fill(0.0);
        }
        for (&raw, entry) in self.models.iter() {
            self.mixer.mix_model(
                ModelHandle(raw),
                &entry.data,
                entry.params,
                self.cursor,
                block,
                &mut writers.mix,
                fade_in,
                fade_out,
            );
        }
        for (writer, channel) in writers.writers.iter_mut().zip(writers.mix.iter()) {
            writer.write(channel);
        }

        if wrap_to.is_some() {
            // The timeline jumps back to the range start: notes ringing
            // across the seam and their queued offs belong to the old pass
            self.mixer.reset();
        }
        self.cursor = wrap_to.unwrap_or(self.cursor + block as u64);
        shared.render_frame.store(self.cursor, Ordering::Relaxed);
        shared
            .frames_written
            .fetch_add(block as u64, Ordering::Relaxed);
        true
    }
}

/// Prefill the pending buffer set and push it toward the reader. Called on
/// the fill thread with the state lock held.
fn publish_pending(
    st: &mut FillState,
    shared: &Shared,
    state_tx: &mut Producer<Box<ReadState>>,
) {
    let Some(mut pending) = st.pending.take() else {
        return;
    };

    // The counters describe the new set from here on; the reader's last few
    // updates against the old set only cost metering accuracy
    shared.frames_written.store(0, Ordering::Relaxed);
    shared.frames_read.store(0, Ordering::Relaxed);

    if shared.playing.load(Ordering::Relaxed) {
        let block = st.mixer.block_size();
        let target = st.config.ring_capacity / 2;
        let mut prefilled = pending
            .writers
            .writers
            .first()
            .map(|w| w.buffered())
            .unwrap_or(0);
        while prefilled + block <= target && st.render_block(&mut pending.writers, shared) {
            prefilled += block;
        }
    }

    let generation = pending.state.generation();
    match state_tx.push(pending.state) {
        Ok(()) => {
            log::info!("published buffer set generation {generation}");
            st.writers = Some(pending.writers);
        }
        Err(PushError::Full(state)) => {
            log::warn!("state channel full, deferring generation {generation}");
            st.pending = Some(PendingSwap {
                state,
                writers: pending.writers,
            });
        }
    }
}

fn fill_once(st: &mut FillState, shared: &Shared) -> bool {
    if !shared.playing.load(Ordering::Relaxed) {
        return false;
    }
    let Some(mut writers) = st.writers.take() else {
        return false;
    };
    let rendered = st.render_block(&mut writers, shared);
    st.writers = Some(writers);

    if !rendered && !st.looping && st.cursor >= st.effective_end() {
        // Out of material: stop once the reader has drained what is left
        if shared.buffered_frames() == 0 && shared.playing.swap(false, Ordering::Relaxed) {
            log::info!("playback reached end of material at frame {}", st.cursor);
        }
    }
    rendered
}

fn fill_loop(
    shared: Arc<Shared>,
    state: Arc<(Mutex<FillState>, Condvar)>,
    mut state_tx: Producer<Box<ReadState>>,
    mut retire_rx: Consumer<Box<ReadState>>,
) {
    let mut scavenger = Scavenger::new();
    let gc = scavenger.handle();
    let (lock, condvar) = &*state;
    log::info!("fill thread running");

    loop {
        while let Ok(retired) = retire_rx.pop() {
            gc.retire(retired);
        }
        scavenger.scavenge();

        if shared.exiting.load(Ordering::Relaxed) {
            break;
        }

        let mut guard = lock_state(lock);
        if guard.pending.is_some() {
            publish_pending(&mut guard, &shared, &mut state_tx);
        }
        let worked = fill_once(&mut guard, &shared);
        if worked {
            // Release the lock between blocks so control calls get in
            continue;
        }
        let waited = condvar.wait_timeout(guard, FILL_POLL);
        drop(match waited {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        });
    }

    // Teardown: the reader may still hand back states; free what is here
    while let Ok(retired) = retire_rx.pop() {
        gc.retire(retired);
    }
    drop(gc);
    scavenger.scavenge();
    log::info!("fill thread exiting with {} tracked objects", scavenger.tracked());
}

fn lock_state(lock: &Mutex<FillState>) -> MutexGuard<'_, FillState> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Control surface of the audio supply pipeline.
///
/// Construction yields the coordinator and the [`SourceReader`] for the
/// device callback. All methods here are non-real-time; they take the fill
/// state lock and never touch the read path directly.
pub struct PlaybackSource {
    shared: Arc<Shared>,
    state: Arc<(Mutex<FillState>, Condvar)>,
    fill_thread: Option<JoinHandle<()>>,
}

impl PlaybackSource {
    pub fn new(config: PlaybackConfig) -> EngineResult<(PlaybackSource, SourceReader)> {
        if config.mix_block_size == 0 {
            return Err(EngineError::InvalidArgument(
                "mix block size must be non-zero".into(),
            ));
        }
        if config.ring_capacity < config.mix_block_size {
            return Err(EngineError::InvalidArgument(
                "ring capacity must hold at least one mixer block".into(),
            ));
        }

        let shared = Arc::new(Shared::new());
        let (initial_state, initial_writers) = ReadState::build(
            0,
            2,
            config.ring_capacity,
            1,
            None,
            config.target_block_size,
        )?;

        let (state_tx, state_rx) = RingBuffer::new(STATE_CHANNEL_CAP);
        let (retire_tx, retire_rx) = RingBuffer::new(STATE_CHANNEL_CAP + 2);

        let reader = SourceReader::new(initial_state, state_rx, retire_tx, Arc::clone(&shared));

        let block = config.mix_block_size;
        let target_block = config.target_block_size;
        let target_rate = config.target_sample_rate;
        let play_latency = config.target_play_latency;
        let fill_state = FillState {
            mixer: SourceMixer::new(DEFAULT_SAMPLE_RATE, 2, block),
            config,
            models: HashMap::new(),
            writers: Some(WriterSet {
                writers: initial_writers,
                mix: vec![vec![0.0; block]; 2],
            }),
            pending: None,
            cursor: 0,
            play_range: None,
            looping: false,
            slowdown: 1,
            source_rate: 0,
            target_rate,
            target_block,
            play_latency,
            last_model_end: 0,
            next_handle: 0,
            generation: 0,
        };

        let state = Arc::new((Mutex::new(fill_state), Condvar::new()));
        let fill_thread = std::thread::Builder::new()
            .name("playback-fill".into())
            .spawn({
                let shared = Arc::clone(&shared);
                let state = Arc::clone(&state);
                move || fill_loop(shared, state, state_tx, retire_rx)
            })?;

        let source = PlaybackSource {
            shared,
            state,
            fill_thread: Some(fill_thread),
        };
        Ok((source, reader))
    }

    fn lock(&self) -> MutexGuard<'_, FillState> {
        lock_state(&self.state.0)
    }

    fn notify(&self) {
        self.state.1.notify_one();
    }

    /// Register a model for playback. The first model establishes the
    /// source sample rate; later models at other rates play at the source
    /// rate and raise the one-time mismatch advisory.
    ///
    /// A failed synth load returns `SynthUnavailable` carrying the issued
    /// handle; the model stays registered and contributes silence.
    pub fn add_model(&self, model: ModelData) -> EngineResult<ModelHandle> {
        if self.shared.exiting.load(Ordering::Relaxed) {
            return Err(EngineError::ShuttingDown);
        }
        let mut st = self.lock();

        st.next_handle += 1;
        let handle = ModelHandle(st.next_handle);

        let rate = model.sample_rate();
        if st.source_rate == 0 {
            st.source_rate = rate;
            self.shared.source_rate.store(rate, Ordering::Relaxed);
            let channels = st.mixer.target_channel_count();
            let block = st.mixer.block_size();
            st.mixer = SourceMixer::new(rate, channels, block);
        } else if rate != st.source_rate && !self.shared.rate_mismatch.swap(true, Ordering::Relaxed)
        {
            log::warn!(
                "model rate {rate} differs from source rate {}; playing at source rate",
                st.source_rate
            );
        }

        let synth_result = st.mixer.add_model(handle, &model);
        st.models.insert(
            handle.raw(),
            ModelEntry {
                data: model,
                params: PlayParams::default(),
            },
        );
        st.recompute_end();
        st.schedule_rebuild()?;
        drop(st);
        self.notify();

        synth_result.map(|()| handle)
    }

    pub fn remove_model(&self, handle: ModelHandle) -> EngineResult<()> {
        let mut st = self.lock();
        if st.models.remove(&handle.raw()).is_none() {
            return Err(EngineError::InvalidArgument(format!(
                "unknown model handle {}",
                handle.raw()
            )));
        }
        st.mixer.remove_model(handle);
        st.recompute_end();
        st.schedule_rebuild()?;
        drop(st);
        self.notify();
        Ok(())
    }

    pub fn clear_models(&self) -> EngineResult<()> {
        let mut st = self.lock();
        st.models.clear();
        st.mixer.clear_models();
        st.recompute_end();
        st.schedule_rebuild()?;
        drop(st);
        self.notify();
        Ok(())
    }

    /// Start (or restart) playback from `start_frame`. Buffered audio from
    /// before the seek is flushed by swapping in a fresh buffer set.
    pub fn play(&self, start_frame: u64) -> EngineResult<()> {
        let mut st = self.lock();
        st.cursor = start_frame;
        st.mixer.reset();
        st.schedule_rebuild()?;
        // The reader must not serve anything buffered before this seek; it
        // returns silence until the new generation reaches it
        self.shared
            .required_generation
            .store(st.generation, Ordering::Relaxed);
        self.shared
            .render_frame
            .store(start_frame, Ordering::Relaxed);
        self.shared.playing.store(true, Ordering::Relaxed);
        drop(st);
        self.notify();
        log::info!("play from frame {start_frame}");
        Ok(())
    }

    /// Stop playback. The read path returns silence from the next callback
    /// on; buffered-but-unplayed audio is discarded on the next `play`.
    pub fn stop(&self) {
        self.shared.playing.store(false, Ordering::Relaxed);
        let mut st = self.lock();
        st.mixer.reset();
        drop(st);
        self.notify();
        log::info!("stop");
    }

    pub fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::Relaxed)
    }

    /// Set the integer time-stretch ratio (1 = no stretch). Swaps in a new
    /// stretcher bank wholesale.
    pub fn set_slowdown_factor(&self, factor: usize) -> EngineResult<()> {
        if factor == 0 || factor > MAX_STRETCH_RATIO {
            return Err(EngineError::InvalidArgument(format!(
                "slowdown factor {factor} outside 1..={MAX_STRETCH_RATIO}"
            )));
        }
        let mut st = self.lock();
        if st.slowdown == factor {
            return Ok(());
        }
        st.slowdown = factor;
        st.schedule_rebuild()?;
        drop(st);
        self.notify();
        Ok(())
    }

    pub fn set_target_block_size(&self, frames: usize) -> EngineResult<()> {
        let frames = frames.min(MAX_TARGET_BLOCK_SIZE).max(1);
        let mut st = self.lock();
        if st.target_block == frames {
            return Ok(());
        }
        st.target_block = frames;
        st.schedule_rebuild()?;
        drop(st);
        self.notify();
        Ok(())
    }

    pub fn set_target_play_latency(&self, frames: usize) {
        self.lock().play_latency = frames;
    }

    /// Fix the device sample rate. A mismatch against the source rate
    /// inserts a sample-rate converter on the read path and raises the
    /// one-time advisory.
    pub fn set_target_sample_rate(&self, rate: u32) -> EngineResult<()> {
        let mut st = self.lock();
        st.target_rate = Some(rate);
        if rate != st.source_rate_or_default()
            && !self.shared.rate_mismatch.swap(true, Ordering::Relaxed)
        {
            log::warn!(
                "device rate {rate} differs from source rate {}; resampling",
                st.source_rate_or_default()
            );
        }
        st.schedule_rebuild()?;
        drop(st);
        self.notify();
        Ok(())
    }

    /// Constrain playback to `[start, end)`.
    pub fn set_play_range(&self, start: u64, end: u64) -> EngineResult<()> {
        if end <= start {
            return Err(EngineError::InvalidArgument(
                "play range end must be after start".into(),
            ));
        }
        let mut st = self.lock();
        st.play_range = Some((start, end));
        drop(st);
        self.notify();
        Ok(())
    }

    pub fn clear_play_range(&self) {
        self.lock().play_range = None;
        self.notify();
    }

    pub fn set_loop_mode(&self, looping: bool) {
        self.lock().looping = looping;
        self.notify();
    }

    pub fn set_model_gain(&self, handle: ModelHandle, gain: f32) -> EngineResult<()> {
        self.with_params(handle, |p| p.gain = gain)
    }

    pub fn set_model_pan(&self, handle: ModelHandle, pan: f32) -> EngineResult<()> {
        self.with_params(handle, |p| p.pan = pan.clamp(-1.0, 1.0))
    }

    pub fn set_model_muted(&self, handle: ModelHandle, muted: bool) -> EngineResult<()> {
        self.with_params(handle, |p| p.muted = muted)
    }

    fn with_params(
        &self,
        handle: ModelHandle,
        apply: impl FnOnce(&mut PlayParams),
    ) -> EngineResult<()> {
        let mut st = self.lock();
        match st.models.get_mut(&handle.raw()) {
            Some(entry) => {
                apply(&mut entry.params);
                Ok(())
            }
            None => Err(EngineError::InvalidArgument(format!(
                "unknown model handle {}",
                handle.raw()
            ))),
        }
    }

    /// Frame currently audible, combining the render cursor, buffered but
    /// unplayed frames and the configured device latency. Approximate while
    /// the pipeline is moving.
    pub fn get_current_playing_frame(&self) -> u64 {
        let st = self.lock();
        let cursor = self.shared.render_frame.load(Ordering::Relaxed);
        let buffered = self.shared.buffered_frames();
        let source_rate = st.source_rate_or_default() as f64;
        let target_rate = st.target_rate.unwrap_or(st.source_rate_or_default()) as f64;
        let latency =
            (st.play_latency as f64 * source_rate / target_rate / st.slowdown as f64).round() as u64;
        cursor.saturating_sub(buffered + latency)
    }

    /// Peak meter levels in [0, 1], updated each device callback.
    pub fn get_output_levels(&self) -> (f32, f32) {
        self.shared.levels()
    }

    /// Union channel count of the registered models (0 with no models).
    pub fn source_channel_count(&self) -> usize {
        self.lock().source_channels()
    }

    /// Channel count delivered to the device (stereo minimum).
    pub fn target_channel_count(&self) -> usize {
        self.lock().target_channels()
    }

    /// Sample rate established by the first registered model.
    pub fn source_sample_rate(&self) -> Option<u32> {
        match self.shared.source_rate.load(Ordering::Relaxed) {
            0 => None,
            rate => Some(rate),
        }
    }

    pub fn target_sample_rate(&self) -> u32 {
        let st = self.lock();
        st.target_rate.unwrap_or_else(|| st.source_rate_or_default())
    }

    /// True once any sample-rate mismatch (model vs. source, or device vs.
    /// source) has been observed.
    pub fn sample_rate_mismatch(&self) -> bool {
        self.shared.rate_mismatch.load(Ordering::Relaxed)
    }
}

impl Drop for PlaybackSource {
    fn drop(&mut self) {
        self.shared.exiting.store(true, Ordering::Relaxed);
        self.shared.playing.store(false, Ordering::Relaxed);
        self.notify();
        if let Some(handle) = self.fill_thread.take() {
            if handle.join().is_err() {
                log::error!("fill thread panicked during teardown");
            }
        }
    }
}
