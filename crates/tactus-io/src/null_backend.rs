//! Silent backend driven by a timer thread.
//!
//! Used when no device is available and as the failover target when a device
//! is lost: the engine keeps running at the negotiated rate, output goes
//! nowhere and input is silence.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;

use tactus_core::BlockIo;

use crate::backend::{
    AudioBackend, AudioDevice, BlockCallback, ErrorCallback, NegotiatedConfig, StreamHandle,
    StreamRequest,
};
use crate::{Error, Result};

/// Name reported for the only device of the null backend.
pub const NULL_DEVICE: &str = "null";

/// Timer-driven silent backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullBackend {
    free_running: bool,
}

impl NullBackend {
    /// Creates a backend that delivers one block per period.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend that delivers blocks back to back, without waiting.
    pub fn free_running() -> Self {
        Self { free_running: true }
    }
}

struct NullStream {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for NullStream {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl AudioBackend for NullBackend {
    fn name(&self) -> &'static str {
        "null"
    }

    fn list_devices(&self) -> Result<Vec<AudioDevice>> {
        Ok(self.default_output_device()?.into_iter().collect())
    }

    fn default_output_device(&self) -> Result<Option<AudioDevice>> {
        Ok(Some(AudioDevice {
            name: NULL_DEVICE.to_string(),
            is_input: true,
            is_output: true,
            default_sample_rate: 48000,
        }))
    }

    fn negotiate(&self, request: &StreamRequest) -> Result<NegotiatedConfig> {
        if request.sample_rate == 0 || request.block_size == 0 {
            return Err(Error::UnsupportedConfig(format!(
                "{} Hz / {} frames",
                request.sample_rate, request.block_size
            )));
        }
        Ok(NegotiatedConfig {
            sample_rate: request.sample_rate,
            block_size: request.block_size,
            input_channels: request.input_channels,
            output_channels: request.output_channels,
            device_name: Some(NULL_DEVICE.to_string()),
        })
    }

    fn open(
        &self,
        config: &NegotiatedConfig,
        mut on_block: BlockCallback,
        _on_error: ErrorCallback,
    ) -> Result<StreamHandle> {
        let running = Arc::new(AtomicBool::new(true));
        let period = config.period();
        let frames = config.block_size as usize;
        let in_ch = usize::from(config.input_channels);
        let out_ch = usize::from(config.output_channels).max(1);
        let free_running = self.free_running;

        let flag = Arc::clone(&running);
        let thread = std::thread::Builder::new()
            .name("tactus-null-backend".into())
            .spawn(move || {
                let input = vec![0.0f32; frames * in_ch];
                let mut output = vec![0.0f32; frames * out_ch];
                let mut deadline = Instant::now();
                while flag.load(Ordering::Acquire) {
                    on_block(&mut BlockIo {
                        input: &input,
                        input_channels: in_ch,
                        output: &mut output,
                        output_channels: out_ch,
                        events: &[],
                    });
                    if free_running {
                        std::thread::yield_now();
                        continue;
                    }
                    deadline += period;
                    let now = Instant::now();
                    if deadline > now {
                        std::thread::sleep(deadline - now);
                    } else if now - deadline > period * 8 {
                        // Far behind after a stall: resynchronise instead of bursting.
                        deadline = now;
                    }
                }
            })?;
        tracing::info!(
            sample_rate = config.sample_rate,
            block_size = config.block_size,
            "null stream started"
        );

        Ok(StreamHandle::new(NullStream {
            running,
            thread: Some(thread),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    #[test]
    fn negotiate_echoes_request() {
        let request = StreamRequest {
            sample_rate: 44100,
            block_size: 128,
            input_channels: 2,
            output_channels: 2,
            device_name: Some("whatever".into()),
        };
        let config = NullBackend::new().negotiate(&request).unwrap();
        assert_eq!(config.sample_rate, 44100);
        assert_eq!(config.block_size, 128);
        assert_eq!(config.input_channels, 2);
        assert_eq!(config.device_name.as_deref(), Some(NULL_DEVICE));
    }

    #[test]
    fn negotiate_rejects_zero_block() {
        let request = StreamRequest {
            block_size: 0,
            ..StreamRequest::default()
        };
        assert!(NullBackend::new().negotiate(&request).is_err());
    }

    #[test]
    fn stream_delivers_blocks_until_dropped() {
        let backend = NullBackend::free_running();
        let config = backend.negotiate(&StreamRequest::default()).unwrap();
        let count = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&count);
        let handle = backend
            .open(
                &config,
                Box::new(move |io: &mut BlockIo<'_>| {
                    assert_eq!(io.frames(), 512);
                    seen.fetch_add(1, Ordering::Relaxed);
                }),
                Box::new(|_| {}),
            )
            .unwrap();
        while count.load(Ordering::Relaxed) < 10 {
            std::thread::yield_now();
        }
        drop(handle);
        let after = count.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::Relaxed), after);
    }
}
