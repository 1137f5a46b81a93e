//! Audio backend adapter for the Tactus engine.
//!
//! This crate connects a [`tactus_core::Scheduler`] to an audio device:
//!
//! - **Backends**: the object-safe [`AudioBackend`] trait with a cpal
//!   implementation ([`CpalBackend`]) and a silent timer-driven
//!   [`NullBackend`]
//! - **Driver**: [`AudioDriver`] owns the scheduler, negotiates the stream and
//!   fails over to the null backend when the device disappears
//! - **Statistics**: [`BackendStats`] counts callbacks, xruns and failovers
//! - **WAV output**: [`write_wav`] for offline renders
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tactus_core::{Engine, EngineOptions};
//! use tactus_io::{AudioBackend, AudioDriver, CpalBackend, StreamRequest};
//!
//! let backend = CpalBackend::new();
//! let config = backend.negotiate(&StreamRequest::default())?;
//! let (engine, scheduler) = Engine::new(EngineOptions {
//!     sample_rate: f64::from(config.sample_rate),
//!     max_block: config.block_size as usize,
//!     ..EngineOptions::default()
//! })?;
//! let driver = AudioDriver::start(Box::new(backend), config, scheduler)?;
//! println!("running on {} at {} Hz", driver.backend_name(), driver.config().sample_rate);
//! ```

pub mod backend;
pub mod cpal_backend;
pub mod driver;
pub mod null_backend;
pub mod stats;
mod wav;

pub use backend::{
    AudioBackend, AudioDevice, BlockCallback, ErrorCallback, NegotiatedConfig, StreamHandle,
    StreamRequest,
};
pub use cpal_backend::CpalBackend;
pub use driver::AudioDriver;
pub use null_backend::NullBackend;
pub use stats::{BackendStats, StatsSnapshot};
pub use wav::{WavSpec, read_wav, write_wav};

/// Error types for audio I/O operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// WAV file read/write error.
    #[error("WAV file error: {0}")]
    Wav(#[from] hound::Error),

    /// Audio stream setup error.
    #[error("Audio stream error: {0}")]
    Stream(String),

    /// No audio device available on the system.
    #[error("No audio device available")]
    NoDevice,

    /// The device cannot run the requested configuration.
    #[error("Unsupported stream configuration: {0}")]
    UnsupportedConfig(String),

    /// The requested audio device was not found.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Events a running stream reports from the audio side.
///
/// Delivered through the [`ErrorCallback`]; never returned as an `Err`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// A callback missed its deadline or input was starved.
    #[error("xrun")]
    Xrun,

    /// The device went away; the stream will not deliver more callbacks.
    #[error("device lost: {0}")]
    DeviceLost(String),

    /// Any other stream error reported by the platform.
    #[error("stream error: {0}")]
    Stream(String),
}

/// Convenience result type for audio I/O operations.
pub type Result<T> = std::result::Result<T, Error>;
