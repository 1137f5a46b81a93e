use std::f64::consts::TAU;

use crate::node::{ProcessContext, ProcessResult, Processor};
use crate::port::PortSpec;

/// Sine test tone.
#[derive(Debug, Clone)]
pub struct SineSource {
    frequency: f64,
    amplitude: f32,
    phase: f64,
    increment: f64,
}

impl SineSource {
    /// Creates a tone at `frequency` Hz with peak `amplitude`.
    pub fn new(frequency: f64, amplitude: f32) -> Self {
        Self {
            frequency,
            amplitude,
            phase: 0.0,
            increment: frequency / 48000.0,
        }
    }

    /// Tone frequency in Hz.
    pub fn frequency(&self) -> f64 {
        self.frequency
    }
}

impl Processor for SineSource {
    fn ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::audio_out("out")]
    }

    fn prepare(&mut self, sample_rate: f64, _max_block: usize) {
        self.increment = self.frequency / sample_rate;
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> ProcessResult {
        let (amplitude, increment) = (self.amplitude, self.increment);
        for out in ctx.output(0) {
            *out = (self.phase * TAU).sin() as f32 * amplitude;
            self.phase = (self.phase + increment).fract();
        }
        ProcessResult::Ok
    }

    fn reset(&mut self) {
        self.phase = 0.0;
    }

    fn type_name(&self) -> &str {
        "sine"
    }

    fn parameters(&self) -> Vec<(String, f32)> {
        vec![
            ("frequency".into(), self.frequency as f32),
            ("amplitude".into(), self.amplitude),
        ]
    }
}
