use crate::node::{ProcessContext, ProcessResult, Processor};
use crate::param::{SmoothedParam, db_to_linear};
use crate::port::{ControlRange, PortSpec};

use super::channel_ports;

const SMOOTHING_MS: f32 = 10.0;

/// Channel fader with smoothed gain and mute.
///
/// ## Ports
///
/// | Index | Name | Range | Default |
/// |-------|------|-------|---------|
/// | 0..N | audio in | | |
/// | N | gain_db | -96.0–12.0 dB | 0.0 |
/// | N+1 | mute | 0.0–1.0 | 0.0 |
///
/// Outputs are the N audio channels. Gain changes ramp over 10 ms so
/// automation does not click.
#[derive(Debug, Clone)]
pub struct Fader {
    channels: u16,
    gain: SmoothedParam,
    /// Per-frame gain for the current block, sized in `prepare`.
    ramp: Vec<f32>,
}

impl Fader {
    /// Creates a fader at unity gain.
    pub fn new(channels: u16) -> Self {
        Self {
            channels,
            gain: SmoothedParam::with_config(1.0, 48000.0, SMOOTHING_MS),
            ramp: Vec::new(),
        }
    }

    /// Current (smoothed) linear gain.
    pub fn gain(&self) -> f32 {
        self.gain.get()
    }
}

impl Processor for Fader {
    fn ports(&self) -> Vec<PortSpec> {
        let mut ports = channel_ports(self.channels);
        ports.push(PortSpec::control_in("gain_db", ControlRange::new(-96.0, 12.0, 0.0)));
        ports.push(PortSpec::control_in("mute", ControlRange::new(0.0, 1.0, 0.0)));
        ports
    }

    fn prepare(&mut self, sample_rate: f64, max_block: usize) {
        self.gain.set_sample_rate(sample_rate as f32);
        self.ramp = vec![0.0; max_block];
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> ProcessResult {
        let channels = usize::from(self.channels);
        let frames = ctx.frames;
        if self.ramp.len() < frames {
            return ProcessResult::Failed("fader not prepared for block size");
        }
        let muted = ctx.control(channels + 1, 0.0) >= 0.5;
        let target = if muted {
            0.0
        } else {
            db_to_linear(ctx.control(channels, 0.0))
        };
        self.gain.set_target(target);
        for g in &mut self.ramp[..frames] {
            *g = self.gain.advance();
        }
        for c in 0..channels {
            let (input, output) = ctx.io(c, c);
            for ((out, &x), &g) in output.iter_mut().zip(input).zip(&self.ramp) {
                *out = x * g;
            }
        }
        ProcessResult::Ok
    }

    fn reset(&mut self) {
        self.gain.snap_to_target();
    }

    fn type_name(&self) -> &str {
        "fader"
    }

    fn parameters(&self) -> Vec<(String, f32)> {
        vec![("channels".into(), f32::from(self.channels))]
    }
}
