//! Parameter smoothing and level conversions for built-in nodes.
//!
//! Control inputs usually change once per block. Applied directly, a step in
//! gain is audible as a click, so faders and oscillators run their control
//! values through a [`SmoothedParam`] one sample at a time.

const SETTLE_EPSILON: f32 = 1e-6;

/// One-pole smoothed parameter.
///
/// `y[n] = y[n-1] + coeff * (target - y[n-1])`, with
/// `coeff = 1 - exp(-1 / (tau * sample_rate))` and `tau` the smoothing time.
/// A smoothing time of 0 makes changes instant.
#[derive(Debug, Clone)]
pub struct SmoothedParam {
    current: f32,
    target: f32,
    coeff: f32,
    sample_rate: f32,
    smoothing_time_ms: f32,
}

impl SmoothedParam {
    /// Creates a parameter with instant changes.
    pub fn new(initial: f32) -> Self {
        Self {
            current: initial,
            target: initial,
            coeff: 1.0,
            sample_rate: 48000.0,
            smoothing_time_ms: 0.0,
        }
    }

    /// Creates a parameter with the given sample rate and smoothing time.
    pub fn with_config(initial: f32, sample_rate: f32, smoothing_time_ms: f32) -> Self {
        let mut param = Self::new(initial);
        param.sample_rate = sample_rate;
        param.smoothing_time_ms = smoothing_time_ms;
        param.recalculate_coeff();
        param
    }

    /// Sets the value to move towards.
    #[inline]
    pub fn set_target(&mut self, target: f32) {
        self.target = target;
    }

    /// Advances one sample and returns the smoothed value.
    #[inline]
    pub fn advance(&mut self) -> f32 {
        let next = self.current + self.coeff * (self.target - self.current);
        // f32 rounding can stall the approach just short of the target.
        self.current = if next == self.current || (self.target - next).abs() < SETTLE_EPSILON {
            self.target
        } else {
            next
        };
        self.current
    }

    /// Current value without advancing.
    #[inline]
    pub fn get(&self) -> f32 {
        self.current
    }

    /// Target value.
    #[inline]
    pub fn target(&self) -> f32 {
        self.target
    }

    /// True once the value is within 1e-6 of the target.
    #[inline]
    pub fn is_settled(&self) -> bool {
        (self.current - self.target).abs() < SETTLE_EPSILON
    }

    /// Jumps to the target.
    #[inline]
    pub fn snap_to_target(&mut self) {
        self.current = self.target;
    }

    /// Updates the sample rate.
    pub fn set_sample_rate(&mut self, sample_rate: f32) {
        self.sample_rate = sample_rate;
        self.recalculate_coeff();
    }

    fn recalculate_coeff(&mut self) {
        if self.smoothing_time_ms <= 0.0 || self.sample_rate <= 0.0 {
            self.coeff = 1.0;
        } else {
            let samples = self.smoothing_time_ms / 1000.0 * self.sample_rate;
            self.coeff = 1.0 - (-1.0 / samples).exp();
        }
    }
}

impl Default for SmoothedParam {
    fn default() -> Self {
        Self::new(0.0)
    }
}

/// Decibels to linear gain. Values at or below -144 dB map to 0.
#[inline]
pub fn db_to_linear(db: f32) -> f32 {
    if db <= -144.0 {
        0.0
    } else {
        10.0_f32.powf(db / 20.0)
    }
}

/// Linear gain to decibels, floored at -144 dB.
#[inline]
pub fn linear_to_db(linear: f32) -> f32 {
    (20.0 * linear.max(1e-10).log10()).max(-144.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instant_without_smoothing() {
        let mut p = SmoothedParam::new(0.0);
        p.set_target(1.0);
        assert_eq!(p.advance(), 1.0);
        assert!(p.is_settled());
    }

    #[test]
    fn smoothing_converges() {
        let mut p = SmoothedParam::with_config(0.0, 48000.0, 5.0);
        p.set_target(1.0);
        let first = p.advance();
        assert!(first > 0.0 && first < 0.1);
        for _ in 0..48000 {
            p.advance();
        }
        assert!(p.is_settled());
        assert_eq!(p.get(), 1.0);
    }

    #[test]
    fn settles_on_small_steps() {
        let mut p = SmoothedParam::with_config(0.5, 48000.0, 20.0);
        p.set_target(0.500_01);
        for _ in 0..48000 {
            p.advance();
        }
        assert_eq!(p.get(), p.target());
    }

    #[test]
    fn snap() {
        let mut p = SmoothedParam::with_config(0.0, 48000.0, 50.0);
        p.set_target(0.25);
        p.snap_to_target();
        assert_eq!(p.get(), 0.25);
    }

    #[test]
    fn db_round_trip() {
        assert!((db_to_linear(0.0) - 1.0).abs() < 1e-6);
        assert!((db_to_linear(-6.0206) - 0.5).abs() < 1e-3);
        assert!((linear_to_db(0.5) + 6.0206).abs() < 1e-3);
        assert_eq!(db_to_linear(-200.0), 0.0);
        assert_eq!(linear_to_db(0.0), -144.0);
    }
}
