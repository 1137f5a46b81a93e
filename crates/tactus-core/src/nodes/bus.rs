use crate::node::{ProcessContext, ProcessResult, Processor};
use crate::port::{ControlRange, PortSpec};

use super::channel_ports;

/// Summing bus for groups, folders and the master.
///
/// Connections into the same input port are summed (with their multipliers)
/// before the bus runs; the bus then applies its `gain` control.
#[derive(Debug, Clone)]
pub struct Bus {
    channels: u16,
}

impl Bus {
    /// Creates a bus with `channels` channels.
    pub fn new(channels: u16) -> Self {
        Self { channels }
    }

    /// Channel count.
    pub fn channels(&self) -> u16 {
        self.channels
    }
}

impl Processor for Bus {
    fn ports(&self) -> Vec<PortSpec> {
        let mut ports = channel_ports(self.channels);
        ports.push(PortSpec::control_in("gain", ControlRange::new(0.0, 4.0, 1.0)));
        ports
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> ProcessResult {
        let channels = usize::from(self.channels);
        let gain = ctx.control(channels, 1.0);
        for c in 0..channels {
            let (input, output) = ctx.io(c, c);
            for (out, &x) in output.iter_mut().zip(input) {
                *out = x * gain;
            }
        }
        ProcessResult::Ok
    }

    fn type_name(&self) -> &str {
        "bus"
    }

    fn parameters(&self) -> Vec<(String, f32)> {
        vec![("channels".into(), f32::from(self.channels))]
    }
}
