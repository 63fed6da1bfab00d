//! A single output or input bus wrapped around a driver port.
//!
//! Output busses own the MIDI clock bookkeeping: which pulse the last clock
//! byte was generated for, and whether this bus sends clock at all.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::clock::{clock_ticks_from_ppqn, pulses_per_sixteenth};
use crate::midi::{MidiEvent, Pulse, MIDI_CLOCK, MIDI_CONTINUE, MIDI_START, MIDI_STOP, SONG_POSITION};
use crate::transport::{InputPort, OutputPort};

/// Default number of sixteenth notes a `mod` clock aligns its start to.
pub const DEFAULT_CLOCK_MOD: u32 = 16;

/// How an output bus participates in MIDI clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockMode {
    /// The bus is unused: no clock, no events.
    Disabled,
    /// Events only, no clock.
    #[default]
    Off,
    /// Clock, resuming mid-song with Song Position + Continue.
    Pos,
    /// Clock, always (re)starting on a `clock_mod` boundary.
    Mod,
}

impl ClockMode {
    pub fn sends_clock(self) -> bool {
        matches!(self, ClockMode::Pos | ClockMode::Mod)
    }
}

pub struct OutputBus {
    port: Box<dyn OutputPort>,
    clock: ClockMode,
    ppqn: u32,
    clock_mod: u32,
    last_tick: Pulse,
}

impl OutputBus {
    pub fn new(port: Box<dyn OutputPort>, ppqn: u32) -> Self {
        Self {
            port,
            clock: ClockMode::Off,
            ppqn,
            clock_mod: DEFAULT_CLOCK_MOD,
            last_tick: -1,
        }
    }

    pub fn name(&self) -> &str {
        self.port.name()
    }

    pub fn clock_mode(&self) -> ClockMode {
        self.clock
    }

    pub fn set_clock_mode(&mut self, mode: ClockMode) {
        self.clock = mode;
    }

    pub fn set_ppqn(&mut self, ppqn: u32) {
        self.ppqn = ppqn;
    }

    pub fn set_clock_mod(&mut self, sixteenths: u32) {
        self.clock_mod = sixteenths.max(1);
    }

    fn send(&mut self, message: &[u8]) {
        if let Err(e) = self.port.send(message) {
            warn!(bus = self.port.name(), "{}", e);
        }
    }

    /// Send one event, applying `channel` to channel messages.
    pub fn play(&mut self, event: &MidiEvent, channel: u8) {
        if self.clock == ClockMode::Disabled {
            return;
        }
        let mut buf = [0u8; 3];
        let len = event.encode(channel, &mut buf);
        self.send(&buf[..len]);
    }

    pub fn sysex(&mut self, event: &MidiEvent) {
        if self.clock == ClockMode::Disabled || event.sysex.is_empty() {
            return;
        }
        if let Err(e) = self.port.send(&event.sysex) {
            warn!(bus = self.port.name(), "sysex: {}", e);
        }
    }

    pub fn flush(&mut self) {
        if let Err(e) = self.port.flush() {
            warn!(bus = self.port.name(), "flush: {}", e);
        }
    }

    pub fn start(&mut self) {
        if self.clock.sends_clock() {
            self.send(&[MIDI_START]);
        }
    }

    pub fn stop(&mut self) {
        self.last_tick = -1;
        if self.clock.sends_clock() {
            self.send(&[MIDI_STOP]);
        }
    }

    /// Prepare clocking from `tick` at the start of playback.
    pub fn init_clock(&mut self, tick: Pulse) {
        if self.clock == ClockMode::Pos && tick != 0 {
            self.continue_from(tick);
        } else if self.clock == ClockMode::Mod || tick == 0 {
            self.start();
            let mod_ticks = (pulses_per_sixteenth(self.ppqn) * Pulse::from(self.clock_mod)).max(1);
            let leftover = tick % mod_ticks;
            let mut starting_tick = tick - leftover;
            if leftover > 0 {
                starting_tick += mod_ticks;
            }
            self.last_tick = starting_tick - 1;
        }
    }

    /// Resume clocking at `tick`: Song Position (in sixteenths), then Continue.
    pub fn continue_from(&mut self, tick: Pulse) {
        let pp16th = pulses_per_sixteenth(self.ppqn).max(1);
        let leftover = tick % pp16th;
        let beats = tick / pp16th;
        let mut starting_tick = tick - leftover;
        if leftover > 0 {
            starting_tick += pp16th;
        }
        self.last_tick = starting_tick - 1;
        if self.clock.sends_clock() {
            let beats = beats.clamp(0, 0x3FFF) as u16;
            self.send(&[SONG_POSITION, (beats & 0x7F) as u8, ((beats >> 7) & 0x7F) as u8]);
            self.send(&[MIDI_CONTINUE]);
        }
    }

    /// Emit one clock byte for every `ppqn / 24` pulses up to `tick`.
    pub fn clock(&mut self, tick: Pulse) {
        if !self.clock.sends_clock() {
            return;
        }
        let ct = clock_ticks_from_ppqn(self.ppqn).max(1);
        while self.last_tick < tick {
            self.last_tick += 1;
            if self.last_tick % ct == 0 {
                self.send(&[MIDI_CLOCK]);
            }
        }
        self.flush();
    }
}

pub struct InputBus {
    port: Box<dyn InputPort>,
    enabled: bool,
}

impl InputBus {
    pub fn new(port: Box<dyn InputPort>) -> Self {
        Self {
            port,
            enabled: false,
        }
    }

    pub fn name(&self) -> &str {
        self.port.name()
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        match self.port.set_enabled(enabled) {
            Ok(()) => self.enabled = enabled,
            Err(e) => warn!(bus = self.port.name(), "input enable: {}", e),
        }
    }

    pub fn pending(&self) -> usize {
        if self.enabled {
            self.port.pending()
        } else {
            0
        }
    }

    pub fn receive(&mut self) -> Option<Vec<u8>> {
        if self.enabled {
            self.port.receive()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::CapturePort;

    fn clocked(mode: ClockMode) -> (OutputBus, crate::transport::testing::Sent) {
        let (port, sent) = CapturePort::new("out");
        let mut bus = OutputBus::new(Box::new(port), 192);
        bus.set_clock_mode(mode);
        (bus, sent)
    }

    #[test]
    fn test_clock_off_sends_nothing() {
        let (mut bus, sent) = clocked(ClockMode::Off);
        bus.init_clock(0);
        bus.clock(100);
        assert!(sent.lock().is_empty());
    }

    #[test]
    fn test_mod_clock_from_zero() {
        let (mut bus, sent) = clocked(ClockMode::Mod);
        bus.init_clock(0);
        // pulses 0, 8, 16 at 192 ppqn
        bus.clock(16);
        let sent = sent.lock();
        assert_eq!(sent[0], vec![MIDI_START]);
        assert_eq!(sent.iter().filter(|m| m[0] == MIDI_CLOCK).count(), 3);
    }

    #[test]
    fn test_clock_is_not_repeated() {
        let (mut bus, sent) = clocked(ClockMode::Mod);
        bus.init_clock(0);
        bus.clock(7);
        bus.clock(7);
        bus.clock(8);
        assert_eq!(sent.lock().iter().filter(|m| m[0] == MIDI_CLOCK).count(), 2);
    }

    #[test]
    fn test_pos_clock_continues_with_song_position() {
        let (mut bus, sent) = clocked(ClockMode::Pos);
        // 960 pulses = 20 sixteenths at 192 ppqn
        bus.init_clock(960);
        let sent = sent.lock();
        assert_eq!(sent[0], vec![SONG_POSITION, 20, 0]);
        assert_eq!(sent[1], vec![MIDI_CONTINUE]);
    }

    #[test]
    fn test_mod_clock_waits_for_boundary() {
        let (mut bus, sent) = clocked(ClockMode::Mod);
        // one bar of sixteenths = 768 pulses; 100 rounds up to 768
        bus.init_clock(100);
        bus.clock(767);
        assert_eq!(sent.lock().iter().filter(|m| m[0] == MIDI_CLOCK).count(), 0);
        bus.clock(768);
        assert_eq!(sent.lock().iter().filter(|m| m[0] == MIDI_CLOCK).count(), 1);
    }

    #[test]
    fn test_disabled_bus_drops_events() {
        let (mut bus, sent) = clocked(ClockMode::Disabled);
        bus.play(&MidiEvent::note_on(0, 60, 100), 0);
        assert!(sent.lock().is_empty());
    }

    #[test]
    fn test_play_applies_channel() {
        let (mut bus, sent) = clocked(ClockMode::Off);
        bus.play(&MidiEvent::note_on(0, 60, 100), 2);
        assert_eq!(sent.lock()[0], vec![0x92, 60, 100]);
    }

    #[test]
    fn test_stop_sends_stop_when_clocking() {
        let (mut bus, sent) = clocked(ClockMode::Pos);
        bus.stop();
        assert_eq!(sent.lock()[0], vec![MIDI_STOP]);
    }
}
