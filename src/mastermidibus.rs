//! The master MIDI bus: every output and input bus behind one facade.
//!
//! The facade itself holds no lock. It lives inside the engine state and is
//! therefore serialized by the engine mutex, like everything else the
//! output and input loops touch.

use tracing::{debug, warn};

use crate::bus::{ClockMode, InputBus, OutputBus};
use crate::clock::{choose_ppqn, clamp_bpm};
use crate::midi::{MidiEvent, Pulse};
use crate::transport::{InputPort, OutputPort};

pub struct MasterMidiBus {
    ppqn: u32,
    bpm: f64,
    outputs: Vec<OutputBus>,
    inputs: Vec<InputBus>,
    filter_by_channel: bool,
    dumping: bool,
    /// Single recording pattern, used when not filtering by channel.
    record_slot: Option<usize>,
    /// Recording patterns, used when filtering by channel.
    record_slots: Vec<usize>,
}

impl MasterMidiBus {
    pub fn new(
        outputs: Vec<Box<dyn OutputPort>>,
        inputs: Vec<Box<dyn InputPort>>,
        ppqn: u32,
        bpm: f64,
    ) -> Self {
        let ppqn = choose_ppqn(ppqn);
        Self {
            ppqn,
            bpm: clamp_bpm(bpm),
            outputs: outputs.into_iter().map(|p| OutputBus::new(p, ppqn)).collect(),
            inputs: inputs.into_iter().map(InputBus::new).collect(),
            filter_by_channel: false,
            dumping: false,
            record_slot: None,
            record_slots: Vec::new(),
        }
    }

    /// A facade with no busses at all.
    pub fn detached(ppqn: u32, bpm: f64) -> Self {
        Self::new(Vec::new(), Vec::new(), ppqn, bpm)
    }

    pub fn ppqn(&self) -> u32 {
        self.ppqn
    }

    pub fn set_ppqn(&mut self, ppqn: u32) {
        self.ppqn = choose_ppqn(ppqn);
        for bus in self.outputs.iter_mut() {
            bus.set_ppqn(self.ppqn);
        }
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    pub fn set_bpm(&mut self, bpm: f64) {
        self.bpm = clamp_bpm(bpm);
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn start(&mut self) {
        for bus in self.outputs.iter_mut() {
            bus.start();
        }
    }

    pub fn stop(&mut self) {
        for bus in self.outputs.iter_mut() {
            bus.stop();
        }
    }

    pub fn init_clock(&mut self, tick: Pulse) {
        for bus in self.outputs.iter_mut() {
            bus.init_clock(tick);
        }
    }

    pub fn continue_from(&mut self, tick: Pulse) {
        for bus in self.outputs.iter_mut() {
            bus.continue_from(tick);
        }
    }

    pub fn clock(&mut self, tick: Pulse) {
        for bus in self.outputs.iter_mut() {
            bus.clock(tick);
        }
    }

    pub fn flush(&mut self) {
        for bus in self.outputs.iter_mut() {
            bus.flush();
        }
    }

    /// Send one event to `bus` on `channel`. Unknown busses are ignored.
    pub fn play(&mut self, bus: usize, event: &MidiEvent, channel: u8) {
        if let Some(out) = self.outputs.get_mut(bus) {
            out.play(event, channel);
        }
    }

    /// Broadcast a SysEx message to every output, then flush.
    pub fn sysex(&mut self, event: &MidiEvent) {
        for bus in self.outputs.iter_mut() {
            bus.sysex(event);
        }
        self.flush();
    }

    pub fn set_clock(&mut self, bus: usize, mode: ClockMode) -> bool {
        match self.outputs.get_mut(bus) {
            Some(out) => {
                out.set_clock_mode(mode);
                true
            }
            None => {
                warn!(bus, "set_clock: no such output bus");
                false
            }
        }
    }

    /// Clock mode of `bus`; `Off` for an unknown bus.
    pub fn get_clock(&self, bus: usize) -> ClockMode {
        self.outputs
            .get(bus)
            .map(OutputBus::clock_mode)
            .unwrap_or(ClockMode::Off)
    }

    pub fn set_clock_mod(&mut self, sixteenths: u32) {
        for bus in self.outputs.iter_mut() {
            bus.set_clock_mod(sixteenths);
        }
    }

    /// Name of output `bus`; empty for an unknown bus.
    pub fn output_name(&self, bus: usize) -> String {
        self.outputs
            .get(bus)
            .map(|b| b.name().to_string())
            .unwrap_or_default()
    }

    pub fn input_name(&self, bus: usize) -> String {
        self.inputs
            .get(bus)
            .map(|b| b.name().to_string())
            .unwrap_or_default()
    }

    pub fn set_input(&mut self, bus: usize, enabled: bool) -> bool {
        match self.inputs.get_mut(bus) {
            Some(input) => {
                input.set_enabled(enabled);
                input.enabled() == enabled
            }
            None => {
                warn!(bus, "set_input: no such input bus");
                false
            }
        }
    }

    pub fn get_input(&self, bus: usize) -> bool {
        self.inputs.get(bus).map(InputBus::enabled).unwrap_or(false)
    }

    /// Number of complete messages waiting across all inputs.
    pub fn poll_for_midi(&self) -> usize {
        self.inputs.iter().map(InputBus::pending).sum()
    }

    pub fn is_more_input(&self) -> bool {
        self.poll_for_midi() > 0
    }

    /// Take the next waiting input event, skipping anything unparseable.
    pub fn get_midi_event(&mut self) -> Option<MidiEvent> {
        for input in self.inputs.iter_mut() {
            while let Some(bytes) = input.receive() {
                match MidiEvent::from_bytes(0, &bytes) {
                    Some(ev) => return Some(ev),
                    None => debug!(bus = input.name(), ?bytes, "dropping unparseable input"),
                }
            }
        }
        None
    }

    pub fn filter_by_channel(&self) -> bool {
        self.filter_by_channel
    }

    pub fn set_filter_by_channel(&mut self, filter: bool) {
        self.filter_by_channel = filter;
    }

    /// True while input is being recorded into one or more patterns.
    pub fn is_dumping(&self) -> bool {
        self.dumping
    }

    /// Register (`state`) or unregister the recording pattern at `slot`.
    ///
    /// When filtering by channel, several patterns record at once and each
    /// takes the events on its own channel; `None` with `state == false`
    /// clears them all.
    pub fn set_sequence_input(&mut self, state: bool, slot: Option<usize>) {
        if self.filter_by_channel {
            match slot {
                Some(slot) if state => {
                    if !self.record_slots.contains(&slot) {
                        self.record_slots.push(slot);
                    }
                }
                Some(slot) => self.record_slots.retain(|&s| s != slot),
                None if !state => self.record_slots.clear(),
                None => {}
            }
            self.dumping = !self.record_slots.is_empty();
        } else {
            if state {
                self.record_slot = slot;
            } else if slot.is_none() || slot == self.record_slot {
                self.record_slot = None;
            }
            self.dumping = self.record_slot.is_some();
        }
    }

    /// Slots that should receive recorded input, in registration order.
    pub fn record_targets(&self) -> &[usize] {
        if self.filter_by_channel {
            &self.record_slots
        } else {
            self.record_slot.as_slice()
        }
    }
}
