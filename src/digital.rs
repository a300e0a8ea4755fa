//! Clocked and edge-triggered helpers shared by every module.
//!
//! These are the small state machines the per-sample engine is built from:
//! frame dividers for infrequent work, hysteretic edge detection for trigger
//! inputs, linear fades for matrix cells, long-press decoding for panel
//! buttons, and one-pole smoothing for mapped parameters.

/// Gates infrequent work to every N-th frame.
///
/// Light updates, scene polling and neighbour checks don't need to run at
/// audio rate; each caller owns a divider with its own period.
#[derive(Debug, Clone)]
pub struct ClockDivider {
    division: u32,
    clock: u32,
}

impl ClockDivider {
    /// `division` must be >= 1; a divider of 1 fires on every call.
    pub fn new(division: u32) -> Self {
        Self {
            division: division.max(1),
            clock: 0,
        }
    }

    pub fn set_division(&mut self, division: u32) {
        self.division = division.max(1);
    }

    pub fn division(&self) -> u32 {
        self.division
    }

    pub fn reset(&mut self) {
        self.clock = 0;
    }

    /// Returns true exactly once every `division` calls.
    pub fn tick(&mut self) -> bool {
        self.clock += 1;
        if self.clock >= self.division {
            self.clock = 0;
            return true;
        }
        false
    }
}

/// Hysteretic edge detector for trigger and clock inputs.
///
/// Rises when the signal reaches 1 V, falls back at 0.1 V. `process`
/// returns true only on the sample of the low-to-high transition.
#[derive(Debug, Clone, Default)]
pub struct SchmittTrigger {
    high: bool,
}

impl SchmittTrigger {
    pub const LOW_THRESHOLD: f32 = 0.1;
    pub const HIGH_THRESHOLD: f32 = 1.0;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.high = false;
    }

    pub fn is_high(&self) -> bool {
        self.high
    }

    pub fn process(&mut self, v: f32) -> bool {
        if self.high {
            if v <= Self::LOW_THRESHOLD {
                self.high = false;
            }
            false
        } else if v >= Self::HIGH_THRESHOLD {
            self.high = true;
            true
        } else {
            false
        }
    }
}

/// Emits a gate that stays high for a fixed duration after `trigger`.
#[derive(Debug, Clone, Default)]
pub struct PulseGenerator {
    remaining: f32,
}

impl PulseGenerator {
    /// Default pulse width of 1 ms, the common trigger length.
    pub const DEFAULT_WIDTH: f32 = 1e-3;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.remaining = 0.0;
    }

    pub fn trigger(&mut self, duration: f32) {
        // A retrigger never shortens a pulse already in flight.
        if duration > self.remaining {
            self.remaining = duration;
        }
    }

    pub fn process(&mut self, delta_time: f32) -> bool {
        if self.remaining > 0.0 {
            self.remaining -= delta_time;
            true
        } else {
            false
        }
    }
}

/// Linear ramp on [0, 1] with independent rise and fall times.
///
/// A time of zero means instantaneous: the level jumps straight to the
/// target instead of dividing by the time constant.
#[derive(Debug, Clone, Default)]
pub struct LinearFade {
    rise: f32,
    fall: f32,
    target: f32,
    current: f32,
}

impl LinearFade {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rise and fall time constants in seconds.
    pub fn set_rise_fall(&mut self, rise: f32, fall: f32) {
        self.rise = rise;
        self.fall = fall;
    }

    pub fn trigger_fade_in(&mut self) {
        self.target = 1.0;
    }

    pub fn trigger_fade_out(&mut self) {
        self.target = 0.0;
    }

    /// Forces current level and target to `v`.
    pub fn reset(&mut self, v: f32) {
        self.current = v;
        self.target = v;
    }

    pub fn value(&self) -> f32 {
        self.current
    }

    /// Advances the ramp by `delta_time` seconds and returns the new level.
    pub fn process(&mut self, delta_time: f32) -> f32 {
        if self.current < self.target {
            if self.rise <= 0.0 {
                self.current = self.target;
            } else {
                self.current = (self.current + delta_time / self.rise).min(self.target);
            }
        } else if self.current > self.target {
            if self.fall <= 0.0 {
                self.current = self.target;
            } else {
                self.current = (self.current - delta_time / self.fall).max(self.target);
            }
        }
        self.current
    }
}

/// Event reported by [`LongPressButton::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonEvent {
    NoPress,
    ShortPress,
    LongPress,
}

/// Distinguishes short presses from long (>= 1 s) presses of a panel button.
///
/// A long press fires the moment the threshold is crossed, without waiting
/// for release; the release that follows is swallowed. Exactly one of
/// short/long is reported per press-release cycle.
#[derive(Debug, Clone, Default)]
pub struct LongPressButton {
    pressed_time: f32,
    was_pressed: bool,
}

impl LongPressButton {
    pub const LONG_PRESS_TIME: f32 = 1.0;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(&mut self, pressed: bool, sample_time: f32) -> ButtonEvent {
        let mut result = ButtonEvent::NoPress;
        // pressed_time < 0 marks a long press already consumed.
        if pressed && self.pressed_time >= 0.0 {
            self.pressed_time += sample_time;
            if self.pressed_time >= Self::LONG_PRESS_TIME {
                self.pressed_time = -1.0;
                result = ButtonEvent::LongPress;
            }
        }
        if !pressed && self.was_pressed {
            if self.pressed_time >= 0.0 {
                result = ButtonEvent::ShortPress;
            }
            self.pressed_time = 0.0;
        }
        self.was_pressed = pressed;
        result
    }
}

/// One-pole exponential smoother, `y' = y + (x - y) * (1 - exp(-dt / tau))`.
#[derive(Debug, Clone)]
pub struct OnePoleFilter {
    tau: f32,
    out: f32,
}

impl OnePoleFilter {
    pub fn new(tau: f32) -> Self {
        Self { tau, out: 0.0 }
    }

    pub fn reset(&mut self) {
        self.out = 0.0;
    }

    pub fn value(&self) -> f32 {
        self.out
    }

    pub fn process(&mut self, delta_time: f32, x: f32) -> f32 {
        if self.tau <= 0.0 {
            self.out = x;
        } else {
            self.out += (x - self.out) * (1.0 - (-delta_time / self.tau).exp());
        }
        self.out
    }
}
