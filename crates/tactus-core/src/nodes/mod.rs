//! Built-in processors.
//!
//! | Type | Ports | Purpose |
//! |------|-------|---------|
//! | [`Bus`] | N audio in/out, `gain` control | Group, folder or master summing point |
//! | [`Fader`] | N audio in/out, `gain_db` and `mute` controls | Channel-strip level |
//! | [`LatencyDelay`] | N audio in/out | Fixed delay that reports its latency |
//! | [`SineSource`] | 1 audio out | Test tone |
//! | [`Lfo`] | 1 CV out | Modulation source |
//! | [`Metronome`] | 1 audio out | Clicks on every beat, accented on the bar |
//!
//! Every input port sums all of its connections before a node runs, so a
//! [`Bus`] aggregates any number of tracks per channel without extra ports.

mod bus;
mod fader;
mod latency;
mod lfo;
mod metronome;
mod sine;

pub use bus::Bus;
pub use fader::Fader;
pub use latency::LatencyDelay;
pub use lfo::Lfo;
pub use metronome::Metronome;
pub use sine::SineSource;

use crate::port::PortSpec;

/// Per-channel audio inputs followed by per-channel audio outputs.
pub(crate) fn channel_ports(channels: u16) -> Vec<PortSpec> {
    let mut ports: Vec<PortSpec> = (0..channels)
        .map(|c| PortSpec::audio_in(format!("in {}", c + 1)))
        .collect();
    ports.extend((0..channels).map(|c| PortSpec::audio_out(format!("out {}", c + 1))));
    ports
}
