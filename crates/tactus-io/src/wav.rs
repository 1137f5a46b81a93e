//! WAV output for offline renders.

use std::path::Path;

use hound::{SampleFormat, WavReader, WavWriter};

use crate::Result;

/// WAV file specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavSpec {
    /// Interleaved channel count.
    pub channels: u16,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Bit depth: 32 writes IEEE float, 16 and 24 write PCM.
    pub bits_per_sample: u16,
}

impl Default for WavSpec {
    fn default() -> Self {
        Self {
            channels: 2,
            sample_rate: 48000,
            bits_per_sample: 32,
        }
    }
}

impl From<WavSpec> for hound::WavSpec {
    fn from(spec: WavSpec) -> Self {
        hound::WavSpec {
            channels: spec.channels,
            sample_rate: spec.sample_rate,
            bits_per_sample: spec.bits_per_sample,
            sample_format: if spec.bits_per_sample == 32 {
                SampleFormat::Float
            } else {
                SampleFormat::Int
            },
        }
    }
}

/// Writes interleaved samples.
///
/// PCM output is clamped to [-1, 1] before quantising.
pub fn write_wav<P: AsRef<Path>>(path: P, samples: &[f32], spec: WavSpec) -> Result<()> {
    let mut writer = WavWriter::create(path, spec.into())?;
    if spec.bits_per_sample == 32 {
        for &sample in samples {
            writer.write_sample(sample)?;
        }
    } else {
        let max_val = ((1i32 << (spec.bits_per_sample - 1)) - 1) as f32;
        for &sample in samples {
            writer.write_sample((sample.clamp(-1.0, 1.0) * max_val) as i32)?;
        }
    }
    writer.finalize()?;
    Ok(())
}

/// Reads a WAV file as interleaved f32 samples.
pub fn read_wav<P: AsRef<Path>>(path: P) -> Result<(Vec<f32>, WavSpec)> {
    let reader = WavReader::open(path)?;
    let raw = reader.spec();
    let spec = WavSpec {
        channels: raw.channels,
        sample_rate: raw.sample_rate,
        bits_per_sample: raw.bits_per_sample,
    };
    let samples = match raw.sample_format {
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()?,
        SampleFormat::Int => {
            let max_val = ((1i32 << (raw.bits_per_sample - 1)) - 1) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
    };
    Ok((samples, spec))
}
