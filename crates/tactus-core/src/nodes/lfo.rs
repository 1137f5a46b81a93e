use std::f64::consts::TAU;

use crate::node::{ProcessContext, ProcessResult, Processor};
use crate::port::PortSpec;

/// Sine LFO writing `offset + depth * sin` to a CV output.
#[derive(Debug, Clone)]
pub struct Lfo {
    rate: f64,
    depth: f32,
    offset: f32,
    phase: f64,
    sample_rate: f64,
}

impl Lfo {
    /// Creates an LFO at `rate` Hz.
    pub fn new(rate: f64, depth: f32, offset: f32) -> Self {
        Self {
            rate,
            depth,
            offset,
            phase: 0.0,
            sample_rate: 48000.0,
        }
    }
}

impl Processor for Lfo {
    fn ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::cv_out("cv")]
    }

    fn prepare(&mut self, sample_rate: f64, _max_block: usize) {
        self.sample_rate = sample_rate;
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> ProcessResult {
        let increment = self.rate / self.sample_rate;
        let (depth, offset) = (self.depth, self.offset);
        for out in ctx.output(0) {
            *out = offset + depth * (self.phase * TAU).sin() as f32;
            self.phase = (self.phase + increment).fract();
        }
        ProcessResult::Ok
    }

    fn reset(&mut self) {
        self.phase = 0.0;
    }

    fn type_name(&self) -> &str {
        "lfo"
    }

    fn parameters(&self) -> Vec<(String, f32)> {
        vec![
            ("rate".into(), self.rate as f32),
            ("depth".into(), self.depth),
            ("offset".into(), self.offset),
        ]
    }
}
