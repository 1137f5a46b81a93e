//! Tempo map: the single conversion between sample time and musical time.
//!
//! Musical positions are measured in ticks at [`TICKS_PER_QUARTER`] resolution.
//! A map holds tempo change points and time-signature change points, both
//! keyed by tick. Each tempo point caches the sample offset at which it starts,
//! so conversions in either direction are a binary search plus one linear step.
//!
//! Conversions are pure functions of the map. The transport stores only a
//! sample position and derives ticks from the map on demand, so a tempo edit
//! can never leave two position counters out of step.
//!
//! # Example
//!
//! ```rust
//! use tactus_core::TempoMap;
//!
//! let mut map = TempoMap::new(48000.0, 120.0);
//! // One quarter note at 120 BPM is 0.5 s.
//! assert_eq!(map.ticks_to_samples(960.0), 24000.0);
//!
//! map.set_tempo(960 * 4, 60.0).unwrap();
//! assert_eq!(map.bpm_at_sample(24000 * 4), 60.0);
//! ```

use serde::{Deserialize, Serialize};

/// Ticks per quarter note.
pub const TICKS_PER_QUARTER: u64 = 960;

/// Ticks in a whole note. Ticks per beat is this divided by the beat unit.
pub const TICKS_PER_WHOLE: u64 = TICKS_PER_QUARTER * 4;

/// Slowest accepted tempo in quarter notes per minute.
pub const MIN_BPM: f64 = 1.0;

/// Fastest accepted tempo in quarter notes per minute.
pub const MAX_BPM: f64 = 1000.0;

/// Invalid tempo map edit.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TempoError {
    /// Tempo outside [`MIN_BPM`]..=[`MAX_BPM`] or not finite.
    #[error("tempo {0} BPM is out of range")]
    InvalidTempo(f64),

    /// Beats per bar is zero or the beat unit is not a power of two up to 32.
    #[error("invalid time signature {0}/{1}")]
    InvalidSignature(u8, u8),

    /// The change point at tick 0 cannot be removed.
    #[error("the initial change point cannot be removed")]
    InitialPoint,

    /// A map without a change point at tick 0.
    #[error("tempo map has no change point at tick 0")]
    MissingInitialPoint,
}

/// Tempo change point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TempoPoint {
    /// Position in ticks.
    pub tick: u64,
    /// Quarter notes per minute from this point on.
    pub bpm: f64,
}

/// Time-signature change point. Always lands on a bar line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSignaturePoint {
    /// Position in ticks.
    pub tick: u64,
    /// Beats per bar.
    pub beats_per_bar: u8,
    /// Note value of one beat (4 = quarter note).
    pub beat_unit: u8,
}

impl TimeSignaturePoint {
    /// Ticks in one beat of this meter.
    #[inline]
    pub fn ticks_per_beat(&self) -> u64 {
        TICKS_PER_WHOLE / u64::from(self.beat_unit)
    }

    /// Ticks in one bar of this meter.
    #[inline]
    pub fn ticks_per_bar(&self) -> u64 {
        self.ticks_per_beat() * u64::from(self.beats_per_bar)
    }
}

/// Bar/beat/tick position. Bars and beats are 1-based.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bbt {
    /// Bar number, starting at 1.
    pub bar: u32,
    /// Beat within the bar, starting at 1.
    pub beat: u32,
    /// Ticks into the beat.
    pub tick: f64,
}

#[derive(Debug, Clone, Copy)]
struct TempoSegment {
    point: TempoPoint,
    /// Sample offset where this point takes effect.
    sample: f64,
    samples_per_tick: f64,
}

#[derive(Debug, Clone, Copy)]
struct MeterSegment {
    point: TimeSignaturePoint,
    /// Zero-based bar index at this point.
    bar: u64,
}

/// Persisted form of a [`TempoMap`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempoMapData {
    /// Tempo change points.
    pub tempos: Vec<TempoPoint>,
    /// Time-signature change points.
    pub signatures: Vec<TimeSignaturePoint>,
}

/// Sorted tempo and meter change points with cached sample offsets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "TempoMapData", into = "TempoMapData")]
pub struct TempoMap {
    sample_rate: f64,
    tempos: Vec<TempoSegment>,
    meters: Vec<MeterSegment>,
}

fn valid_bpm(bpm: f64) -> Result<(), TempoError> {
    if bpm.is_finite() && (MIN_BPM..=MAX_BPM).contains(&bpm) {
        Ok(())
    } else {
        Err(TempoError::InvalidTempo(bpm))
    }
}

fn valid_signature(beats_per_bar: u8, beat_unit: u8) -> Result<(), TempoError> {
    if beats_per_bar == 0 || !beat_unit.is_power_of_two() || beat_unit > 32 {
        Err(TempoError::InvalidSignature(beats_per_bar, beat_unit))
    } else {
        Ok(())
    }
}

impl TempoMap {
    /// Creates a map with one tempo and 4/4 time.
    ///
    /// `bpm` is clamped into the accepted range.
    pub fn new(sample_rate: f64, bpm: f64) -> Self {
        let bpm = if bpm.is_finite() {
            bpm.clamp(MIN_BPM, MAX_BPM)
        } else {
            120.0
        };
        let mut map = Self {
            sample_rate,
            tempos: vec![TempoSegment {
                point: TempoPoint { tick: 0, bpm },
                sample: 0.0,
                samples_per_tick: 0.0,
            }],
            meters: vec![MeterSegment {
                point: TimeSignaturePoint {
                    tick: 0,
                    beats_per_bar: 4,
                    beat_unit: 4,
                },
                bar: 0,
            }],
        };
        map.rebuild();
        map
    }

    /// Same change points at another sample rate.
    pub fn with_sample_rate(mut self, sample_rate: f64) -> Self {
        self.sample_rate = sample_rate;
        self.rebuild();
        self
    }

    /// Sample rate the cached offsets are computed for.
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Inserts or replaces the tempo at `tick`.
    pub fn set_tempo(&mut self, tick: u64, bpm: f64) -> Result<(), TempoError> {
        valid_bpm(bpm)?;
        let point = TempoPoint { tick, bpm };
        match self.tempos.binary_search_by_key(&tick, |s| s.point.tick) {
            Ok(i) => self.tempos[i].point = point,
            Err(i) => self.tempos.insert(
                i,
                TempoSegment {
                    point,
                    sample: 0.0,
                    samples_per_tick: 0.0,
                },
            ),
        }
        self.rebuild();
        Ok(())
    }

    /// Removes the tempo point at `tick`. Returns `Ok(false)` if none exists there.
    pub fn remove_tempo(&mut self, tick: u64) -> Result<bool, TempoError> {
        if tick == 0 {
            return Err(TempoError::InitialPoint);
        }
        match self.tempos.binary_search_by_key(&tick, |s| s.point.tick) {
            Ok(i) => {
                self.tempos.remove(i);
                self.rebuild();
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    /// Sets the meter from the bar line at or after `tick`.
    ///
    /// Returns the tick the change was placed at.
    pub fn set_time_signature(
        &mut self,
        tick: u64,
        beats_per_bar: u8,
        beat_unit: u8,
    ) -> Result<u64, TempoError> {
        valid_signature(beats_per_bar, beat_unit)?;
        let tick = self.next_bar_line(tick);
        let point = TimeSignaturePoint {
            tick,
            beats_per_bar,
            beat_unit,
        };
        match self.meters.binary_search_by_key(&tick, |m| m.point.tick) {
            Ok(i) => self.meters[i].point = point,
            Err(i) => self.meters.insert(i, MeterSegment { point, bar: 0 }),
        }
        self.rebuild();
        Ok(tick)
    }

    /// Tempo points in tick order.
    pub fn tempo_points(&self) -> impl Iterator<Item = TempoPoint> + '_ {
        self.tempos.iter().map(|s| s.point)
    }

    /// Time-signature points in tick order.
    pub fn signature_points(&self) -> impl Iterator<Item = TimeSignaturePoint> + '_ {
        self.meters.iter().map(|m| m.point)
    }

    /// Converts a sample position to ticks.
    pub fn samples_to_ticks(&self, sample: f64) -> f64 {
        let seg = &self.tempos[self.tempo_index_at_sample(sample)];
        seg.point.tick as f64 + (sample - seg.sample) / seg.samples_per_tick
    }

    /// Converts ticks to a sample position.
    pub fn ticks_to_samples(&self, tick: f64) -> f64 {
        let i = self
            .tempos
            .partition_point(|s| s.point.tick as f64 <= tick)
            .saturating_sub(1);
        let seg = &self.tempos[i];
        seg.sample + (tick - seg.point.tick as f64) * seg.samples_per_tick
    }

    /// Tempo in effect at a sample position.
    pub fn bpm_at_sample(&self, sample: u64) -> f64 {
        self.tempos[self.tempo_index_at_sample(sample as f64)].point.bpm
    }

    /// Ticks advanced per sample at a sample position.
    pub fn ticks_per_sample_at(&self, sample: u64) -> f64 {
        1.0 / self.tempos[self.tempo_index_at_sample(sample as f64)].samples_per_tick
    }

    /// First sample strictly after `sample` at which the tempo changes.
    pub fn next_tempo_change_after(&self, sample: u64) -> Option<u64> {
        let pos = sample as f64;
        let i = self.tempos.partition_point(|s| s.sample <= pos);
        self.tempos.get(i).map(|s| s.sample.ceil() as u64)
    }

    /// Meter in effect at `tick`.
    pub fn signature_at_tick(&self, tick: f64) -> TimeSignaturePoint {
        self.meters[self.meter_index_at_tick(tick)].point
    }

    /// Converts ticks to bar/beat/tick.
    pub fn ticks_to_bbt(&self, tick: f64) -> Bbt {
        let tick = tick.max(0.0);
        let meter = &self.meters[self.meter_index_at_tick(tick)];
        let into = tick - meter.point.tick as f64;
        let per_bar = meter.point.ticks_per_bar() as f64;
        let per_beat = meter.point.ticks_per_beat() as f64;
        let bars = (into / per_bar).floor();
        let in_bar = into - bars * per_bar;
        let beat = (in_bar / per_beat).floor();
        Bbt {
            bar: (meter.bar + bars as u64) as u32 + 1,
            beat: beat as u32 + 1,
            tick: in_bar - beat * per_beat,
        }
    }

    /// Converts bar/beat/tick to ticks. Bars and beats below 1 are treated as 1.
    pub fn bbt_to_ticks(&self, bbt: Bbt) -> f64 {
        let bar = u64::from(bbt.bar.max(1) - 1);
        let i = self
            .meters
            .partition_point(|m| m.bar <= bar)
            .saturating_sub(1);
        let meter = &self.meters[i];
        let beat = u64::from(bbt.beat.max(1) - 1);
        (meter.point.tick
            + (bar - meter.bar) * meter.point.ticks_per_bar()
            + beat * meter.point.ticks_per_beat()) as f64
            + bbt.tick
    }

    /// Sample position of a bar/beat/tick.
    pub fn bbt_to_samples(&self, bbt: Bbt) -> f64 {
        self.ticks_to_samples(self.bbt_to_ticks(bbt))
    }

    fn tempo_index_at_sample(&self, sample: f64) -> usize {
        self.tempos
            .partition_point(|s| s.sample <= sample)
            .saturating_sub(1)
    }

    fn meter_index_at_tick(&self, tick: f64) -> usize {
        self.meters
            .partition_point(|m| m.point.tick as f64 <= tick)
            .saturating_sub(1)
    }

    fn next_bar_line(&self, tick: u64) -> u64 {
        let meter = &self.meters[self.meter_index_at_tick(tick as f64)];
        let per_bar = meter.point.ticks_per_bar();
        let into = tick - meter.point.tick;
        meter.point.tick + into.div_ceil(per_bar) * per_bar
    }

    fn rebuild(&mut self) {
        let sample_rate = self.sample_rate;
        let mut sample = 0.0;
        let mut prev: Option<TempoSegment> = None;
        for seg in &mut self.tempos {
            if let Some(p) = prev {
                sample = p.sample + (seg.point.tick - p.point.tick) as f64 * p.samples_per_tick;
            }
            seg.sample = sample;
            seg.samples_per_tick = sample_rate * 60.0 / (seg.point.bpm * TICKS_PER_QUARTER as f64);
            prev = Some(*seg);
        }

        // A change that no longer lands on a bar line of the preceding meter
        // cuts that bar short and opens the next one.
        let mut bar = 0;
        let mut prev: Option<MeterSegment> = None;
        for meter in &mut self.meters {
            if let Some(p) = prev {
                bar = p.bar + (meter.point.tick - p.point.tick).div_ceil(p.point.ticks_per_bar());
            }
            meter.bar = bar;
            prev = Some(*meter);
        }
    }
}

impl Default for TempoMap {
    fn default() -> Self {
        Self::new(48000.0, 120.0)
    }
}

impl From<TempoMap> for TempoMapData {
    fn from(map: TempoMap) -> Self {
        Self {
            tempos: map.tempo_points().collect(),
            signatures: map.signature_points().collect(),
        }
    }
}

impl TryFrom<TempoMapData> for TempoMap {
    type Error = TempoError;

    fn try_from(data: TempoMapData) -> Result<Self, Self::Error> {
        let first = data
            .tempos
            .iter()
            .find(|p| p.tick == 0)
            .ok_or(TempoError::MissingInitialPoint)?;
        let mut map = Self::new(48000.0, first.bpm);
        valid_bpm(first.bpm)?;
        for point in &data.tempos {
            map.set_tempo(point.tick, point.bpm)?;
        }
        let mut signatures = data.signatures;
        signatures.sort_by_key(|s| s.tick);
        for sig in signatures {
            map.set_time_signature(sig.tick, sig.beats_per_bar, sig.beat_unit)?;
        }
        Ok(map)
    }
}
