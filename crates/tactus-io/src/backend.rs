//! Pluggable audio backend abstraction.
//!
//! [`AudioBackend`] decouples the engine from any specific platform audio API.
//! A backend does two things: it negotiates a `(sample_rate, block_size)` pair
//! with the device, and it opens a stream that calls a single block callback
//! on the device's real-time thread.
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │           AudioDriver            │
//! │  owns the Scheduler, failover    │
//! └──────────────┬───────────────────┘
//!                │ negotiate / open
//!                ▼
//! ┌──────────────────────────────────┐
//! │        AudioBackend trait        │
//! └──────────────┬───────────────────┘
//!        ┌───────┴────────┐
//!        ▼                ▼
//! ┌─────────────┐  ┌─────────────┐
//! │ CpalBackend │  │ NullBackend │
//! │  (device)   │  │  (silent)   │
//! └─────────────┘  └─────────────┘
//! ```
//!
//! Callbacks are boxed closures so the trait stays object-safe and backends can
//! be chosen at run time. Streams are returned as a type-erased
//! [`StreamHandle`] that stops the stream on drop.

use tactus_core::BlockIo;

use crate::{BackendError, Result};

/// Audio device information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioDevice {
    /// Human-readable device name.
    pub name: String,
    /// Whether the device supports audio input.
    pub is_input: bool,
    /// Whether the device supports audio output.
    pub is_output: bool,
    /// Default sample rate in Hz.
    pub default_sample_rate: u32,
}

/// What the engine would like the device to run at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    /// Requested sample rate in Hz.
    pub sample_rate: u32,
    /// Preferred block size in frames.
    pub block_size: u32,
    /// Input channels; zero opens no input stream.
    pub input_channels: u16,
    /// Output channels.
    pub output_channels: u16,
    /// Device name filter (uses the system default if `None`).
    pub device_name: Option<String>,
}

impl Default for StreamRequest {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            block_size: 512,
            input_channels: 0,
            output_channels: 2,
            device_name: None,
        }
    }
}

/// What the device agreed to.
///
/// The engine's schedule and buffers must be sized for this before the
/// stream is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedConfig {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Largest block the callback will receive, in frames.
    pub block_size: u32,
    /// Input channels.
    pub input_channels: u16,
    /// Output channels.
    pub output_channels: u16,
    /// Resolved device name.
    pub device_name: Option<String>,
}

impl NegotiatedConfig {
    /// Nominal duration of one block.
    pub fn period(&self) -> std::time::Duration {
        std::time::Duration::from_nanos(
            u64::from(self.block_size) * 1_000_000_000 / u64::from(self.sample_rate.max(1)),
        )
    }
}

/// Type-erased stream handle.
///
/// The stream runs while this handle exists; dropping it stops the stream.
pub struct StreamHandle {
    _inner: Box<dyn Send>,
}

impl StreamHandle {
    /// Wraps a backend-specific stream object, kept alive until drop.
    pub fn new<T: Send + 'static>(stream: T) -> Self {
        Self {
            _inner: Box::new(stream),
        }
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle").finish_non_exhaustive()
    }
}

/// Block callback.
///
/// Runs on the real-time thread once per device period with interleaved input
/// and output. Must not allocate, lock or perform I/O.
pub type BlockCallback = Box<dyn FnMut(&mut BlockIo<'_>) + Send>;

/// Error callback.
///
/// May run on the real-time thread; implementations must not block.
pub type ErrorCallback = Box<dyn FnMut(BackendError) + Send>;

/// Pluggable audio backend.
///
/// Object-safe, so backends can be selected at run time through
/// `Box<dyn AudioBackend>`.
pub trait AudioBackend: Send {
    /// Human-readable name of this backend (e.g. "cpal", "null").
    fn name(&self) -> &str;

    /// Lists available devices.
    fn list_devices(&self) -> Result<Vec<AudioDevice>>;

    /// The default output device, if any.
    fn default_output_device(&self) -> Result<Option<AudioDevice>>;

    /// Resolves `request` against the device.
    ///
    /// The returned block size is an upper bound on the frames any single
    /// callback will carry.
    fn negotiate(&self, request: &StreamRequest) -> Result<NegotiatedConfig>;

    /// Opens and starts a stream for a previously negotiated configuration.
    ///
    /// `on_block` is called for every device period. `on_error` receives xruns
    /// and device loss; after [`BackendError::DeviceLost`] no further blocks
    /// are delivered.
    fn open(
        &self,
        config: &NegotiatedConfig,
        on_block: BlockCallback,
        on_error: ErrorCallback,
    ) -> Result<StreamHandle>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_request() {
        let request = StreamRequest::default();
        assert_eq!(request.sample_rate, 48000);
        assert_eq!(request.block_size, 512);
        assert_eq!(request.input_channels, 0);
        assert_eq!(request.output_channels, 2);
        assert!(request.device_name.is_none());
    }

    #[test]
    fn test_period() {
        let config = NegotiatedConfig {
            sample_rate: 48000,
            block_size: 480,
            input_channels: 0,
            output_channels: 2,
            device_name: None,
        };
        assert_eq!(config.period().as_micros(), 10_000);
    }

    #[test]
    fn test_stream_handle_debug() {
        let handle = StreamHandle::new(42u32);
        assert!(format!("{:?}", handle).contains("StreamHandle"));
    }
}
