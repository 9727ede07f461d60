//! Playback engine error types

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur on the non-real-time side of the pipeline.
///
/// The real-time read path never returns errors; it degrades to silence.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Failed to read a clip file for the sampler
    #[error("Failed to load clip {path}: {reason}")]
    ClipLoad { path: PathBuf, reason: String },

    /// A clip was already loaded into this sampler instance
    #[error("Clip already loaded; construct a new sampler to change clips")]
    ClipAlreadyLoaded,

    /// The synthesizer for an event-based model could not be prepared.
    /// The model stays registered but contributes silence.
    #[error("Synth unavailable for model {handle}: {reason}")]
    SynthUnavailable { handle: u64, reason: String },

    /// Buffer-set reconfiguration failed; the previous set remains active
    #[error("Reconfiguration failed: {0}")]
    ReconfigFailed(String),

    /// The background fill thread could not be started
    #[error("Failed to start fill thread: {0}")]
    FillThread(#[from] std::io::Error),

    /// The coordinator has begun teardown and accepts no further work
    #[error("Playback source is shutting down")]
    ShuttingDown,

    /// Invalid argument to a control call
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result type for playback engine operations
pub type EngineResult<T> = Result<T, EngineError>;
