use crate::buffer::SignalDelay;
use crate::node::{ProcessContext, ProcessResult, Processor};
use crate::port::PortSpec;

use super::channel_ports;

/// Fixed delay that reports its delay as processing latency.
///
/// Stands in for lookahead processing (limiters, linear-phase filters) when
/// exercising delay compensation.
#[derive(Debug, Clone)]
pub struct LatencyDelay {
    channels: u16,
    lines: Vec<SignalDelay>,
}

impl LatencyDelay {
    /// Creates a delay of `samples` on `channels` channels.
    pub fn new(channels: u16, samples: u32) -> Self {
        Self {
            channels,
            lines: (0..channels).map(|_| SignalDelay::new(samples as usize)).collect(),
        }
    }

    /// Changes the delay. Call off the real-time thread; the engine picks up
    /// the new latency on its next maintenance pass.
    pub fn set_delay(&mut self, samples: u32) {
        self.lines = (0..self.channels)
            .map(|_| SignalDelay::new(samples as usize))
            .collect();
    }
}

impl Processor for LatencyDelay {
    fn ports(&self) -> Vec<PortSpec> {
        channel_ports(self.channels)
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> ProcessResult {
        for (c, line) in self.lines.iter_mut().enumerate() {
            let (input, output) = ctx.io(c, c);
            for (out, &x) in output.iter_mut().zip(input) {
                *out = line.tick(x);
            }
        }
        ProcessResult::Ok
    }

    fn latency_samples(&self) -> u32 {
        self.lines.first().map_or(0, |l| l.delay_samples() as u32)
    }

    fn reset(&mut self) {
        for line in &mut self.lines {
            line.clear();
        }
    }

    fn type_name(&self) -> &str {
        "latency_delay"
    }

    fn parameters(&self) -> Vec<(String, f32)> {
        vec![
            ("channels".into(), f32::from(self.channels)),
            ("samples".into(), self.latency_samples() as f32),
        ]
    }
}
