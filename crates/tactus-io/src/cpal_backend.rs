//! cpal-based audio backend.
//!
//! [`CpalBackend`] wraps [cpal](https://crates.io/crates/cpal) for ALSA,
//! CoreAudio and WASAPI. Output drives the engine. When input channels are
//! requested, a separate input stream feeds an `rtrb` ring that the output
//! callback drains, so the engine sees input and output in one block.

use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Host};
use parking_lot::Mutex;
use tactus_core::BlockIo;

use crate::backend::{
    AudioBackend, AudioDevice, BlockCallback, ErrorCallback, NegotiatedConfig, StreamHandle,
    StreamRequest,
};
use crate::{BackendError, Error, Result};

/// Input ring capacity in blocks.
const INPUT_RING_BLOCKS: usize = 4;

/// Extracts a device name via `description()` (cpal 0.17+).
fn device_name(device: &Device) -> std::result::Result<String, cpal::DeviceNameError> {
    device.description().map(|d| d.name().to_string())
}

fn backend_error(err: cpal::StreamError) -> BackendError {
    match err {
        cpal::StreamError::DeviceNotAvailable => BackendError::DeviceLost(err.to_string()),
        other => BackendError::Stream(other.to_string()),
    }
}

/// Forwards an event without blocking; dropped if another stream is reporting.
fn report(errors: &Mutex<ErrorCallback>, error: BackendError) {
    if let Some(mut on_error) = errors.try_lock() {
        on_error(error);
    }
}

/// cpal-based audio backend.
///
/// Holds the platform's default cpal [`Host`].
pub struct CpalBackend {
    host: Host,
}

impl CpalBackend {
    /// Creates a backend on the platform's default audio host.
    pub fn new() -> Self {
        let host = cpal::default_host();
        tracing::info!(host = host.id().name(), "cpal backend initialized");
        Self { host }
    }

    fn find_output_device(&self, name: Option<&str>) -> Result<Device> {
        match name {
            Some(search) => {
                let search_lower = search.to_lowercase();
                let devices = self
                    .host
                    .output_devices()
                    .map_err(|e| Error::Stream(e.to_string()))?;
                for device in devices {
                    if let Ok(dev_name) = device_name(&device)
                        && dev_name.to_lowercase().contains(search_lower.as_str())
                    {
                        return Ok(device);
                    }
                }
                Err(Error::DeviceNotFound(format!(
                    "no output device matching '{}'",
                    search
                )))
            }
            None => self.host.default_output_device().ok_or(Error::NoDevice),
        }
    }

    fn default_input(&self) -> Result<Device> {
        self.host.default_input_device().ok_or(Error::NoDevice)
    }

    fn describe(device: &Device, is_input: bool, is_output: bool) -> Option<AudioDevice> {
        let name = device_name(device).ok()?;
        let config = if is_output {
            device.default_output_config()
        } else {
            device.default_input_config()
        };
        Some(AudioDevice {
            name,
            is_input,
            is_output,
            default_sample_rate: config.map(|c| c.sample_rate()).unwrap_or(48000),
        })
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for CpalBackend {
    fn name(&self) -> &'static str {
        "cpal"
    }

    fn list_devices(&self) -> Result<Vec<AudioDevice>> {
        let mut devices: Vec<AudioDevice> = Vec::new();
        if let Ok(inputs) = self.host.input_devices() {
            for device in inputs {
                let is_output = device.default_output_config().is_ok();
                if let Some(info) = Self::describe(&device, true, is_output) {
                    devices.push(info);
                }
            }
        }
        if let Ok(outputs) = self.host.output_devices() {
            for device in outputs {
                if let Some(info) = Self::describe(&device, false, true)
                    && !devices.iter().any(|d| d.name == info.name)
                {
                    devices.push(info);
                }
            }
        }
        Ok(devices)
    }

    fn default_output_device(&self) -> Result<Option<AudioDevice>> {
        Ok(self
            .host
            .default_output_device()
            .and_then(|d| Self::describe(&d, false, true)))
    }

    fn negotiate(&self, request: &StreamRequest) -> Result<NegotiatedConfig> {
        let device = self.find_output_device(request.device_name.as_deref())?;
        let ranges: Vec<cpal::SupportedStreamConfigRange> = device
            .supported_output_configs()
            .map_err(|e| Error::Stream(e.to_string()))?
            .filter(|r| {
                r.sample_format() == cpal::SampleFormat::F32 && r.channels() == request.output_channels
            })
            .collect();
        if ranges.is_empty() {
            return Err(Error::UnsupportedConfig(format!(
                "no f32 output with {} channels",
                request.output_channels
            )));
        }

        let sample_rate = if ranges
            .iter()
            .any(|r| (r.min_sample_rate()..=r.max_sample_rate()).contains(&request.sample_rate))
        {
            request.sample_rate
        } else {
            let fallback = device
                .default_output_config()
                .map_err(|e| Error::UnsupportedConfig(e.to_string()))?
                .sample_rate();
            tracing::warn!(
                requested = request.sample_rate,
                fallback,
                "sample rate unsupported, using device default"
            );
            fallback
        };
        let block_size = ranges
            .iter()
            .find_map(|r| match *r.buffer_size() {
                cpal::SupportedBufferSize::Range { min, max } => {
                    Some(request.block_size.clamp(min, max))
                }
                cpal::SupportedBufferSize::Unknown => None,
            })
            .unwrap_or(request.block_size);
        if request.input_channels > 0 {
            self.default_input()?;
        }

        let negotiated = NegotiatedConfig {
            sample_rate,
            block_size,
            input_channels: request.input_channels,
            output_channels: request.output_channels,
            device_name: device_name(&device).ok(),
        };
        tracing::info!(
            sample_rate,
            block_size,
            device = negotiated.device_name.as_deref().unwrap_or("?"),
            "stream negotiated"
        );
        Ok(negotiated)
    }

    fn open(
        &self,
        config: &NegotiatedConfig,
        mut on_block: BlockCallback,
        on_error: ErrorCallback,
    ) -> Result<StreamHandle> {
        let device = self.find_output_device(config.device_name.as_deref())?;
        let errors = Arc::new(Mutex::new(on_error));
        let block = config.block_size as usize;
        let in_ch = usize::from(config.input_channels);
        let out_ch = usize::from(config.output_channels).max(1);

        let (input_stream, mut input_rx) = if in_ch > 0 {
            let (mut tx, rx) = rtrb::RingBuffer::<f32>::new(block * in_ch * INPUT_RING_BLOCKS);
            let stream_config = cpal::StreamConfig {
                channels: config.input_channels,
                sample_rate: config.sample_rate,
                buffer_size: cpal::BufferSize::Fixed(config.block_size),
            };
            let errors = Arc::clone(&errors);
            let stream = self
                .default_input()?
                .build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        for &sample in data {
                            if tx.push(sample).is_err() {
                                break;
                            }
                        }
                    },
                    move |err| report(&errors, backend_error(err)),
                    None,
                )
                .map_err(|e| Error::Stream(e.to_string()))?;
            stream.play().map_err(|e| Error::Stream(e.to_string()))?;
            (Some(stream), Some(rx))
        } else {
            (None, None)
        };

        let stream_config = cpal::StreamConfig {
            channels: config.output_channels,
            sample_rate: config.sample_rate,
            buffer_size: cpal::BufferSize::Fixed(config.block_size),
        };
        let mut scratch = vec![0.0f32; block * in_ch * INPUT_RING_BLOCKS];
        let mut primed = false;
        let data_errors = Arc::clone(&errors);
        let output_stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let frames = data.len() / out_ch;
                    let wanted = (frames * in_ch).min(scratch.len());
                    if let Some(rx) = &mut input_rx {
                        let mut starved = false;
                        for slot in &mut scratch[..wanted] {
                            *slot = if let Ok(sample) = rx.pop() {
                                primed = true;
                                sample
                            } else {
                                starved = true;
                                0.0
                            };
                        }
                        if starved && primed {
                            report(&data_errors, BackendError::Xrun);
                        }
                    }
                    on_block(&mut BlockIo {
                        input: &scratch[..wanted],
                        input_channels: in_ch,
                        output: data,
                        output_channels: out_ch,
                        events: &[],
                    });
                },
                move |err| report(&errors, backend_error(err)),
                None,
            )
            .map_err(|e| Error::Stream(e.to_string()))?;
        output_stream
            .play()
            .map_err(|e| Error::Stream(e.to_string()))?;
        tracing::info!(
            input_channels = config.input_channels,
            output_channels = config.output_channels,
            sample_rate = config.sample_rate,
            block_size = config.block_size,
            "cpal stream started"
        );

        Ok(StreamHandle::new((output_stream, input_stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpal_backend_name() {
        let backend = CpalBackend::new();
        assert_eq!(backend.name(), "cpal");
    }

    #[test]
    fn test_cpal_backend_list_devices() {
        let backend = CpalBackend::new();
        // Device availability depends on the system.
        assert!(backend.list_devices().is_ok());
    }

    #[test]
    fn test_device_not_available_is_loss() {
        assert!(matches!(
            backend_error(cpal::StreamError::DeviceNotAvailable),
            BackendError::DeviceLost(_)
        ));
    }
}
