//! Tick/time conversion and external clock tempo measurement.
//!
//! The conversions here are pure functions of BPM, PPQN and elapsed
//! microseconds. They are done in `f64` so the fractional part of a tick is
//! carried from one output-loop iteration to the next instead of being
//! truncated away.

use std::time::Instant;

use crate::midi::{Pulse, BEATS_PER_BAR, CLOCKS_PER_BEAT};

/// Lowest accepted tempo.
pub const MINIMUM_BPM: f64 = 20.0;

/// Highest accepted tempo.
pub const MAXIMUM_BPM: f64 = 500.0;

pub const DEFAULT_BPM: f64 = 120.0;

pub const DEFAULT_PPQN: u32 = 192;

pub const MINIMUM_PPQN: u32 = 96;

pub const MAXIMUM_PPQN: u32 = 19200;

/// Size of the rolling window for BPM calculation (1 bar = 96 clocks at 24 ppqn in 4/4)
const BPM_WINDOW_CLOCKS: usize = (CLOCKS_PER_BEAT * BEATS_PER_BAR) as usize;

/// Clamp a tempo into the accepted range.
pub fn clamp_bpm(bpm: f64) -> f64 {
    if bpm.is_nan() {
        return DEFAULT_BPM;
    }
    bpm.clamp(MINIMUM_BPM, MAXIMUM_BPM)
}

/// Coerce a requested PPQN into the supported range; zero selects the default.
pub fn choose_ppqn(ppqn: u32) -> u32 {
    if ppqn == 0 {
        DEFAULT_PPQN
    } else {
        ppqn.clamp(MINIMUM_PPQN, MAXIMUM_PPQN)
    }
}

/// Duration of one pulse in microseconds.
pub fn pulse_length_us(bpm: f64, ppqn: u32) -> f64 {
    60_000_000.0 / f64::from(ppqn) / bpm
}

/// Pulses elapsed in `us` microseconds: `bpm * ppqn * us / 60e6`.
pub fn delta_time_us_to_ticks(us: u64, bpm: f64, ppqn: u32) -> f64 {
    bpm * f64::from(ppqn) * us as f64 / 60_000_000.0
}

/// Microseconds spanned by `ticks` pulses.
pub fn ticks_to_delta_time_us(ticks: Pulse, bpm: f64, ppqn: u32) -> f64 {
    ticks as f64 * pulse_length_us(bpm, ppqn)
}

/// Engine pulses per MIDI clock byte (PPQN / 24).
pub fn clock_ticks_from_ppqn(ppqn: u32) -> Pulse {
    Pulse::from(ppqn) / CLOCKS_PER_BEAT as Pulse
}

/// Same as [`clock_ticks_from_ppqn`] without integer truncation.
pub fn double_ticks_from_ppqn(ppqn: u32) -> f64 {
    f64::from(ppqn) / CLOCKS_PER_BEAT as f64
}

/// Pulses in one 4/4 measure.
pub fn pulses_per_measure(ppqn: u32) -> Pulse {
    Pulse::from(ppqn) * BEATS_PER_BAR as Pulse
}

/// Pulses in one sixteenth note, the unit of the Song Position Pointer.
pub fn pulses_per_sixteenth(ppqn: u32) -> Pulse {
    Pulse::from(ppqn) / 4
}

/// Rolling tempo estimate from incoming MIDI clock bytes.
///
/// Keeps the timestamps of the last bar of clocks. The estimate is
/// available as soon as two clocks have arrived and settles as the window
/// fills.
pub struct ClockMeter {
    times: [Option<Instant>; BPM_WINDOW_CLOCKS],
    index: usize,
    count: usize,
}

impl ClockMeter {
    pub fn new() -> Self {
        Self {
            times: [None; BPM_WINDOW_CLOCKS],
            index: 0,
            count: 0,
        }
    }

    /// Record one clock byte and return the current estimate, if any.
    pub fn push(&mut self, now: Instant) -> Option<f64> {
        self.times[self.index] = Some(now);
        self.index = (self.index + 1) % BPM_WINDOW_CLOCKS;
        if self.count < BPM_WINDOW_CLOCKS {
            self.count += 1;
        }
        self.bpm_at(now)
    }

    fn oldest(&self) -> Option<Instant> {
        if self.count < BPM_WINDOW_CLOCKS {
            self.times[0]
        } else {
            self.times[self.index]
        }
    }

    fn bpm_at(&self, now: Instant) -> Option<f64> {
        if self.count < 2 {
            return None;
        }
        let elapsed = now.duration_since(self.oldest()?).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        let beats = (self.count - 1) as f64 / CLOCKS_PER_BEAT as f64;
        Some(beats * 60.0 / elapsed)
    }

    pub fn clear(&mut self) {
        self.times = [None; BPM_WINDOW_CLOCKS];
        self.index = 0;
        self.count = 0;
    }
}

impl Default for ClockMeter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_half_second_at_120_bpm_is_one_beat() {
        let ticks = delta_time_us_to_ticks(500_000, 120.0, 192);
        assert!((ticks - 192.0).abs() < 1e-9);
    }

    #[test]
    fn test_fraction_is_kept() {
        // 1 ms at 120 bpm / 192 ppqn is 0.384 ticks
        let ticks = delta_time_us_to_ticks(1_000, 120.0, 192);
        assert!((ticks - 0.384).abs() < 1e-9);
    }

    #[test]
    fn test_pulse_length_round_trip() {
        let us = ticks_to_delta_time_us(192, 120.0, 192);
        assert!((us - 500_000.0).abs() < 1e-6);
        assert!((pulse_length_us(120.0, 192) - 2604.1666).abs() < 1e-3);
    }

    #[test]
    fn test_clock_ticks() {
        assert_eq!(clock_ticks_from_ppqn(192), 8);
        assert_eq!(clock_ticks_from_ppqn(96), 4);
        assert!((double_ticks_from_ppqn(120) - 5.0).abs() < 1e-12);
        assert_eq!(pulses_per_measure(192), 768);
        assert_eq!(pulses_per_sixteenth(192), 48);
    }

    #[test]
    fn test_clamp_bpm() {
        assert_eq!(clamp_bpm(10.0), MINIMUM_BPM);
        assert_eq!(clamp_bpm(900.0), MAXIMUM_BPM);
        assert_eq!(clamp_bpm(133.0), 133.0);
        assert_eq!(clamp_bpm(f64::NAN), DEFAULT_BPM);
    }

    #[test]
    fn test_choose_ppqn() {
        assert_eq!(choose_ppqn(0), DEFAULT_PPQN);
        assert_eq!(choose_ppqn(10), MINIMUM_PPQN);
        assert_eq!(choose_ppqn(960), 960);
        assert_eq!(choose_ppqn(100_000), MAXIMUM_PPQN);
    }

    #[test]
    fn test_meter_needs_two_clocks() {
        let mut meter = ClockMeter::new();
        assert_eq!(meter.push(Instant::now()), None);
    }

    #[test]
    fn test_meter_bpm_calculation() {
        let mut meter = ClockMeter::new();
        let start = Instant::now();
        // 120 BPM: 24 clocks per beat, 2 beats per second = 48 clocks/sec
        let clock_interval = Duration::from_micros(20833);

        let mut bpm = None;
        for i in 0..100 {
            bpm = meter.push(start + clock_interval * i);
        }
        let bpm = bpm.unwrap();
        assert!((bpm - 120.0).abs() < 1.2, "Expected BPM ~120, got {}", bpm);
    }

    #[test]
    fn test_meter_clear() {
        let mut meter = ClockMeter::new();
        let start = Instant::now();
        meter.push(start);
        meter.push(start + Duration::from_millis(20));
        meter.clear();
        assert_eq!(meter.push(start + Duration::from_millis(40)), None);
    }
}
