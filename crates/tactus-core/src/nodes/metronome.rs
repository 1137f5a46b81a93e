use std::f64::consts::TAU;

use crate::node::{ProcessContext, ProcessResult, Processor};
use crate::port::PortSpec;
use crate::tempo::TICKS_PER_WHOLE;

const CLICK_MS: f64 = 30.0;
const BEAT_HZ: f64 = 880.0;
const BAR_HZ: f64 = 1760.0;

/// Click on every beat of the tempo map, accented on the first beat of each bar.
///
/// Beats are found from the tick position of each frame, so clicks follow
/// tempo changes, seeks and loop wraps. Silent while the transport is stopped.
#[derive(Debug, Clone)]
pub struct Metronome {
    level: f32,
    sample_rate: f64,
    phase: f64,
    frequency: f64,
    remaining: usize,
    envelope: f32,
    decay: f32,
}

impl Metronome {
    /// Creates a metronome with click peak `level`.
    pub fn new(level: f32) -> Self {
        let mut metronome = Self {
            level,
            sample_rate: 48000.0,
            phase: 0.0,
            frequency: BEAT_HZ,
            remaining: 0,
            envelope: 0.0,
            decay: 0.0,
        };
        metronome.prepare(48000.0, 0);
        metronome
    }

    fn click_len(&self) -> usize {
        (self.sample_rate * CLICK_MS / 1000.0) as usize
    }
}

impl Processor for Metronome {
    fn ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::audio_out("click")]
    }

    fn prepare(&mut self, sample_rate: f64, _max_block: usize) {
        self.sample_rate = sample_rate;
        // -60 dB over the click.
        self.decay = (0.001f64.ln() / self.click_len().max(1) as f64).exp() as f32;
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> ProcessResult {
        let info = ctx.transport;
        if !info.rolling {
            self.remaining = 0;
            return ProcessResult::Ok;
        }
        let beat_unit = u64::from(info.beat_unit.max(1));
        let ticks_per_beat = (TICKS_PER_WHOLE / beat_unit) as f64;
        let ticks_per_bar = ticks_per_beat * f64::from(info.beats_per_bar.max(1));
        let click_len = self.click_len();
        let sample_rate = self.sample_rate;
        let level = self.level;

        for (i, out) in ctx.output(0).iter_mut().enumerate() {
            let tick = info.tick + i as f64 * info.ticks_per_sample;
            let previous = tick - info.ticks_per_sample;
            if (tick / ticks_per_beat).floor() > (previous / ticks_per_beat).floor() {
                let on_bar = tick.rem_euclid(ticks_per_bar) < ticks_per_beat;
                self.frequency = if on_bar { BAR_HZ } else { BEAT_HZ };
                self.phase = 0.0;
                self.envelope = 1.0;
                self.remaining = click_len;
            }
            if self.remaining > 0 {
                *out = (self.phase * TAU).sin() as f32 * self.envelope * level;
                self.phase = (self.phase + self.frequency / sample_rate).fract();
                self.envelope *= self.decay;
                self.remaining -= 1;
            }
        }
        ProcessResult::Ok
    }

    fn reset(&mut self) {
        self.remaining = 0;
        self.envelope = 0.0;
    }

    fn type_name(&self) -> &str {
        "metronome"
    }

    fn parameters(&self) -> Vec<(String, f32)> {
        vec![("level".into(), self.level)]
    }
}
