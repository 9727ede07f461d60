//! Chorus Core - Real-time audio supply pipeline
//!
//! Feeds an externally driven audio device callback from a set of
//! registered data models: dense waveforms played directly, sparse event
//! models synthesized from sampled clips. A background fill thread renders
//! ahead through the source mixer into lock-free rings; the real-time side
//! drains them through an optional integer time stretcher and sample-rate
//! converter, never blocking and never allocating.

pub mod clip;
pub mod config;
pub mod error;
pub mod generator;
pub mod model;
pub mod playback;
pub mod ring;
pub mod scavenger;
pub mod stretch;
pub mod types;

pub use config::PlaybackConfig;
pub use error::{EngineError, EngineResult};
pub use model::{InstantModel, ModelData, NoteEvent, NoteModel, PlayParams, SynthSpec, WaveModel};
pub use playback::{PlaybackSource, SourceReader};
pub use types::*;
