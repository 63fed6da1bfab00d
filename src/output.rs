//! The output scheduling loop.
//!
//! Idles on the engine condition variable until `running` is set, then
//! converts elapsed wall-clock time into pulses every few milliseconds,
//! plays every pattern up to the new tick and emits MIDI clock.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{info, trace, warn};

use crate::clock::{
    clock_ticks_from_ppqn, delta_time_us_to_ticks, double_ticks_from_ppqn, pulse_length_us,
};
use crate::midi::Pulse;
use crate::perform::PerformState;

/// Running position of one playback pass. Kept in `f64` so fractional
/// pulses carry over between iterations.
#[derive(Debug, Clone)]
pub struct OutputPad {
    current_tick: f64,
    total_tick: f64,
    clock_tick: f64,
    init_clock: bool,
}

impl OutputPad {
    /// Begin a pass. Song mode starts from the engine's starting tick.
    pub fn new(state: &mut PerformState) -> Self {
        let mut pad = Self {
            current_tick: 0.0,
            total_tick: 0.0,
            clock_tick: 0.0,
            init_clock: true,
        };
        if state.playback_mode {
            let start = state.starting_tick();
            pad.current_tick = start as f64;
            pad.clock_tick = start as f64;
            state.set_orig_ticks(start);
        }
        pad
    }

    pub fn current_tick(&self) -> f64 {
        self.current_tick
    }

    pub fn total_tick(&self) -> f64 {
        self.total_tick
    }

    /// One loop iteration: advance by `delta_us` (or by the external clock
    /// when slaved), wrap at the right marker, play and clock.
    pub fn advance(&mut self, state: &mut PerformState, delta_us: u64) {
        let mut delta_tick =
            delta_time_us_to_ticks(delta_us, state.beats_per_minute(), state.ppqn());
        if state.usemidiclock {
            delta_tick = state.midiclocktick as f64;
            state.midiclocktick = 0;
        }
        if let Some(pos) = state.midiclockpos.take() {
            delta_tick = 0.0;
            self.clock_tick = pos as f64;
            self.current_tick = pos as f64;
            self.total_tick = pos as f64;
            state.set_orig_ticks(pos);
        }

        self.clock_tick += delta_tick;
        self.current_tick += delta_tick;
        self.total_tick += delta_tick;

        if self.init_clock {
            state.bus.init_clock(self.clock_tick as Pulse);
            self.init_clock = false;
        }

        if state.looping {
            let right = state.right_tick();
            if self.current_tick >= right as f64 {
                let left = state.left_tick();
                let span = (right - left).max(1) as f64;
                let leftover = (self.current_tick - right as f64).rem_euclid(span);
                state.play(right - 1);
                state.reset_sequences();
                state.set_orig_ticks(left);
                self.current_tick = left as f64 + leftover;
            }
        }

        state.play(self.current_tick as Pulse);
        state.bus.clock(self.clock_tick as Pulse);
    }
}

/// Microseconds to sleep before the next iteration.
///
/// Aims for one iteration every `width_us`, but wakes early when the next
/// MIDI clock boundary falls within two widths. Zero or less means the
/// iteration overran its budget.
pub fn next_sleep_us(width_us: i64, elapsed_us: i64, total_tick: f64, bpm: f64, ppqn: u32) -> i64 {
    let mut sleep = width_us - elapsed_us;
    let dct = double_ticks_from_ppqn(ppqn);
    if dct > 0.0 {
        let next_clock = ((total_tick / dct).floor() + 1.0) * dct;
        let until_clock_us = ((next_clock - total_tick) * pulse_length_us(bpm, ppqn)) as i64;
        if until_clock_us < width_us * 2 && until_clock_us < sleep {
            sleep = until_clock_us;
        }
    }
    sleep
}

const BUCKETS: usize = 100;
const TRIGGER_BUCKET_US: u64 = 100;
const CLOCK_BUCKET_US: u64 = 300;
const REPORT_EVERY: u32 = 200;

/// Iteration timing and clock spacing histograms.
pub(crate) struct LoopStats {
    trigger_width: [u64; BUCKETS],
    clock_width: [u64; BUCKETS],
    min_us: u64,
    max_us: u64,
    sum_us: u64,
    iterations: u32,
    counted_tick: Pulse,
    last_clock: Option<Instant>,
}

impl LoopStats {
    pub(crate) fn new() -> Self {
        Self {
            trigger_width: [0; BUCKETS],
            clock_width: [0; BUCKETS],
            min_us: u64::MAX,
            max_us: 0,
            sum_us: 0,
            iterations: 0,
            counted_tick: 0,
            last_clock: None,
        }
    }

    fn bucket(us: u64, width: u64) -> usize {
        ((us / width) as usize).min(BUCKETS - 1)
    }

    /// Record one iteration's duration, logging a summary every 200.
    pub(crate) fn record_iteration(&mut self, us: u64) {
        self.trigger_width[Self::bucket(us, TRIGGER_BUCKET_US)] += 1;
        self.min_us = self.min_us.min(us);
        self.max_us = self.max_us.max(us);
        self.sum_us += us;
        self.iterations += 1;
        if self.iterations >= REPORT_EVERY {
            info!(
                avg_us = self.sum_us / u64::from(self.iterations),
                min_us = self.min_us,
                max_us = self.max_us,
                "output loop"
            );
            self.iterations = 0;
            self.sum_us = 0;
            self.min_us = u64::MAX;
            self.max_us = 0;
        }
    }

    /// Record the spacing of every clock boundary passed up to `total_tick`.
    pub(crate) fn record_clocks(&mut self, total_tick: f64, now: Instant, ppqn: u32) {
        let ct = clock_ticks_from_ppqn(ppqn).max(1);
        while (self.counted_tick as f64) <= total_tick {
            if self.counted_tick % ct == 0 {
                if let Some(last) = self.last_clock {
                    let us = now.duration_since(last).as_micros() as u64;
                    self.clock_width[Self::bucket(us, CLOCK_BUCKET_US)] += 1;
                }
                self.last_clock = Some(now);
            }
            self.counted_tick += 1;
        }
    }

    pub(crate) fn report(&self, bpm: f64, ppqn: u32) {
        let stamp = chrono::Local::now().format("%H:%M:%S");
        info!(%stamp, "trigger width histogram");
        for (i, n) in self.trigger_width.iter().enumerate().filter(|(_, n)| **n > 0) {
            info!(us = i as u64 * TRIGGER_BUCKET_US, count = n);
        }
        let optimal_us = pulse_length_us(bpm, ppqn) * double_ticks_from_ppqn(ppqn);
        info!(%stamp, optimal_us = optimal_us as u64, "clock width histogram");
        for (i, n) in self.clock_width.iter().enumerate().filter(|(_, n)| **n > 0) {
            info!(us = i as u64 * CLOCK_BUCKET_US, count = n);
        }
    }
}

/// Body of the output thread. Returns once `outputting` is cleared.
pub fn output_func(state: Arc<Mutex<PerformState>>, cond: Arc<Condvar>) {
    loop {
        let mut guard = state.lock();
        while !guard.running && guard.outputting {
            cond.wait(&mut guard);
        }
        if !guard.outputting {
            break;
        }

        let width_us = (guard.options.trigger_width_ms * 1000) as i64;
        let stats_on = guard.options.stats;
        let mut stats = LoopStats::new();
        let mut pad = OutputPad::new(&mut guard);
        drop(guard);
        info!("playback started");

        let mut last = Instant::now();
        loop {
            let current = Instant::now();
            let delta_us = current.duration_since(last).as_micros() as u64;
            last = current;

            let mut st = state.lock();
            if !st.running {
                st.tick = 0;
                st.bus.flush();
                st.bus.stop();
                if stats_on {
                    stats.report(st.beats_per_minute(), st.ppqn());
                }
                break;
            }
            pad.advance(&mut st, delta_us);
            if stats_on {
                stats.record_clocks(pad.total_tick(), current, st.ppqn());
            }

            let elapsed_us = current.elapsed().as_micros() as i64;
            let sleep_us = next_sleep_us(
                width_us,
                elapsed_us,
                pad.total_tick(),
                st.beats_per_minute(),
                st.ppqn(),
            );
            if sleep_us <= 0 {
                st.underruns += 1;
                if stats_on {
                    warn!(elapsed_us, "underrun");
                } else {
                    trace!(elapsed_us, "underrun");
                }
            }
            drop(st);

            if sleep_us > 0 {
                thread::sleep(Duration::from_micros(sleep_us as u64));
            }
            if stats_on {
                stats.record_iteration(current.elapsed().as_micros() as u64);
            }
        }
        info!("playback stopped");
    }
    info!("output loop exiting");
}
