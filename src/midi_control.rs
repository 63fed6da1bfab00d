//! Remote control over MIDI.
//!
//! Incoming bytes are matched against three tables (toggle, on, off), each
//! with one entry per control. Controls `0..32` address the slots of the
//! displayed screen-set, `32..64` recall mute groups, and the rest are the
//! named global actions below. Control-out sends feedback events when
//! patterns of the playing set change state.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::control::SEQS_IN_SET;
use crate::mastermidibus::MasterMidiBus;
use crate::midi::MidiEvent;

/// First group-recall control.
pub const GROUP_BASE: usize = SEQS_IN_SET;
/// First named global control.
pub const TRACK_CONTROLS: usize = 2 * SEQS_IN_SET;
pub const BPM_UP: usize = TRACK_CONTROLS;
pub const BPM_DN: usize = TRACK_CONTROLS + 1;
pub const SS_UP: usize = TRACK_CONTROLS + 2;
pub const SS_DN: usize = TRACK_CONTROLS + 3;
pub const MOD_REPLACE: usize = TRACK_CONTROLS + 4;
pub const MOD_SNAPSHOT: usize = TRACK_CONTROLS + 5;
pub const MOD_QUEUE: usize = TRACK_CONTROLS + 6;
pub const MOD_GMUTE: usize = TRACK_CONTROLS + 7;
pub const MOD_GLEARN: usize = TRACK_CONTROLS + 8;
pub const PLAY_SS: usize = TRACK_CONTROLS + 9;
/// Total number of controls.
pub const MIDI_CONTROLS: usize = TRACK_CONTROLS + 10;

/// One binding: fires when status and first data byte match exactly and
/// the second data byte falls inside `[min_value, max_value]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MidiControl {
    pub active: bool,
    /// On/off tables only: fire the opposite action when out of range.
    pub inverse_active: bool,
    pub status: u8,
    pub data: u8,
    pub min_value: u8,
    pub max_value: u8,
}

impl MidiControl {
    fn matches(&self, status: u8, d0: u8) -> bool {
        self.active && self.status == status && self.data == d0
    }

    fn in_range(&self, d1: u8) -> bool {
        (self.min_value..=self.max_value).contains(&d1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlKind {
    Toggle,
    On,
    Off,
}

/// What an incoming event asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlHit {
    /// Toggle the in-set slot.
    Toggle(usize),
    /// Turn control `index` on or off.
    Set(usize, bool),
}

#[derive(Debug, Clone)]
pub struct MidiControlTable {
    toggle: Vec<MidiControl>,
    on: Vec<MidiControl>,
    off: Vec<MidiControl>,
}

impl MidiControlTable {
    pub fn new() -> Self {
        Self {
            toggle: vec![MidiControl::default(); MIDI_CONTROLS],
            on: vec![MidiControl::default(); MIDI_CONTROLS],
            off: vec![MidiControl::default(); MIDI_CONTROLS],
        }
    }

    fn table(&self, kind: ControlKind) -> &[MidiControl] {
        match kind {
            ControlKind::Toggle => &self.toggle,
            ControlKind::On => &self.on,
            ControlKind::Off => &self.off,
        }
    }

    pub fn get(&self, kind: ControlKind, index: usize) -> Option<&MidiControl> {
        self.table(kind).get(index)
    }

    pub fn set(&mut self, kind: ControlKind, index: usize, control: MidiControl) -> bool {
        let table = match kind {
            ControlKind::Toggle => &mut self.toggle,
            ControlKind::On => &mut self.on,
            ControlKind::Off => &mut self.off,
        };
        match table.get_mut(index) {
            Some(entry) => {
                *entry = control;
                true
            }
            None => false,
        }
    }

    /// Every control fired by `status d0 d1`, in control order.
    pub fn matches(&self, status: u8, d0: u8, d1: u8) -> impl Iterator<Item = ControlHit> + '_ {
        (0..MIDI_CONTROLS).flat_map(move |i| {
            let toggle = &self.toggle[i];
            let toggled = (i < SEQS_IN_SET && toggle.matches(status, d0) && toggle.in_range(d1))
                .then_some(ControlHit::Toggle(i));

            let on = &self.on[i];
            let switched_on = if on.matches(status, d0) {
                if on.in_range(d1) {
                    Some(ControlHit::Set(i, true))
                } else if on.inverse_active {
                    Some(ControlHit::Set(i, false))
                } else {
                    None
                }
            } else {
                None
            };

            let off = &self.off[i];
            let switched_off = if off.matches(status, d0) {
                if off.in_range(d1) {
                    Some(ControlHit::Set(i, false))
                } else if off.inverse_active {
                    Some(ControlHit::Set(i, true))
                } else {
                    None
                }
            } else {
                None
            };

            [toggled, switched_on, switched_off].into_iter().flatten()
        })
    }
}

impl Default for MidiControlTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Pattern state changes reported by control-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeqAction {
    Play = 0,
    Mute = 1,
    Queue = 2,
    Unqueue = 3,
    Activate = 4,
    Delete = 5,
}

const SEQ_ACTIONS: usize = 6;

/// Default control-out bus.
pub const DEFAULT_CONTROL_OUT_BUS: usize = 15;

/// Feedback events sent to a control surface, per in-set slot and action.
#[derive(Debug, Clone)]
pub struct ControlOut {
    bus: usize,
    events: Vec<[Option<MidiEvent>; SEQ_ACTIONS]>,
}

impl ControlOut {
    pub fn new(bus: usize) -> Self {
        Self {
            bus,
            events: vec![Default::default(); SEQS_IN_SET],
        }
    }

    pub fn bus(&self) -> usize {
        self.bus
    }

    pub fn set_bus(&mut self, bus: usize) {
        self.bus = bus;
    }

    pub fn set_seq_event(&mut self, seq: usize, what: SeqAction, event: MidiEvent) -> bool {
        match self.events.get_mut(seq) {
            Some(row) => {
                row[what as usize] = Some(event);
                true
            }
            None => false,
        }
    }

    pub fn seq_event(&self, seq: usize, what: SeqAction) -> Option<&MidiEvent> {
        self.events.get(seq)?[what as usize].as_ref()
    }

    pub fn seq_event_is_active(&self, seq: usize, what: SeqAction) -> bool {
        self.seq_event(seq, what).is_some()
    }

    /// Send the event bound to (`seq`, `what`), if any, and flush.
    pub fn send_seq_event(&self, seq: usize, what: SeqAction, bus: &mut MasterMidiBus) {
        if let Some(ev) = self.seq_event(seq, what) {
            debug!(seq, ?what, "control out");
            bus.play(self.bus, ev, ev.channel());
            bus.flush();
        }
    }
}

impl Default for ControlOut {
    fn default() -> Self {
        Self::new(DEFAULT_CONTROL_OUT_BUS)
    }
}
