//! A single pattern and its playback.
//!
//! Events are stored without a channel and with timestamps relative to the
//! start of the pattern. `play` emits everything that falls between the
//! previous call and the requested tick, wrapping modulo the pattern length,
//! so consecutive calls never repeat or skip a pulse.

use std::mem;

use crate::clock::pulses_per_measure;
use crate::mastermidibus::MasterMidiBus;
use crate::midi::{MidiEvent, Pulse};
use crate::triggers::{Trigger, Triggers};

/// Name given to a pattern that has none.
pub const DEFAULT_NAME: &str = "Untitled";

#[derive(Debug, Clone)]
pub struct Pattern {
    name: String,
    number: usize,
    /// Sorted by timestamp; channel nibble cleared.
    events: Vec<MidiEvent>,
    length: Pulse,
    ppqn: u32,
    channel: u8,
    bus: usize,
    triggers: Triggers,
    playing: bool,
    queued: bool,
    queued_tick: Pulse,
    /// First pulse not yet played.
    last_tick: Pulse,
    song_mute: bool,
    editing: bool,
    recording: bool,
    thru: bool,
    dirty_main: bool,
    dirty_edit: bool,
    dirty_perf: bool,
    dirty_names: bool,
    /// Count of sounding note-ons per note number.
    playing_notes: [u16; 128],
}

impl Pattern {
    /// An empty one-measure pattern.
    pub fn new(ppqn: u32) -> Self {
        Self {
            name: String::new(),
            number: 0,
            events: Vec::new(),
            length: pulses_per_measure(ppqn),
            ppqn,
            channel: 0,
            bus: 0,
            triggers: Triggers::new(),
            playing: false,
            queued: false,
            queued_tick: 0,
            last_tick: 0,
            song_mute: false,
            editing: false,
            recording: false,
            thru: false,
            dirty_main: true,
            dirty_edit: true,
            dirty_perf: true,
            dirty_names: true,
            playing_notes: [0; 128],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.set_dirty_mp();
    }

    /// Give the pattern a name if it has none.
    pub fn ensure_name(&mut self) {
        if self.name.is_empty() {
            self.name = DEFAULT_NAME.to_string();
        }
    }

    pub fn number(&self) -> usize {
        self.number
    }

    pub fn set_number(&mut self, number: usize) {
        self.number = number;
    }

    pub fn ppqn(&self) -> u32 {
        self.ppqn
    }

    pub fn length(&self) -> Pulse {
        self.length
    }

    /// Set the loop length; anything below one pulse becomes one pulse.
    pub fn set_length(&mut self, length: Pulse) {
        self.length = length.max(1);
        self.set_dirty();
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn set_channel(&mut self, channel: u8) {
        self.channel = channel & 0x0F;
        self.set_dirty();
    }

    pub fn bus(&self) -> usize {
        self.bus
    }

    pub fn set_bus(&mut self, bus: usize) {
        self.bus = bus;
        self.set_dirty();
    }

    pub fn events(&self) -> &[MidiEvent] {
        &self.events
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Insert an event, keeping timestamp order. Same-time events keep
    /// insertion order.
    pub fn add_event(&mut self, event: MidiEvent) {
        let mut event = event;
        if event.is_channel_message() {
            event.status = event.kind();
        }
        let pos = self
            .events
            .partition_point(|e| e.timestamp <= event.timestamp);
        self.events.insert(pos, event);
        self.set_dirty();
    }

    /// Add a note-on at `tick` and its note-off `len` pulses later.
    pub fn add_note(&mut self, tick: Pulse, len: Pulse, note: u8, velocity: u8) {
        self.add_event(MidiEvent::note_on(tick, note, velocity));
        self.add_event(MidiEvent::note_off(tick + len.max(1), note, 0));
    }

    pub fn clear_events(&mut self) {
        self.events.clear();
        self.set_dirty();
    }

    pub fn playing(&self) -> bool {
        self.playing
    }

    /// Arm or disarm. Disarming silences sounding notes. Always clears the
    /// queued flag.
    pub fn set_playing(&mut self, playing: bool, bus: &mut MasterMidiBus) {
        if playing != self.playing {
            self.playing = playing;
            if !playing {
                self.off_playing_notes(bus);
            }
            self.set_dirty();
        }
        self.queued = false;
    }

    pub fn toggle_playing(&mut self, bus: &mut MasterMidiBus) {
        self.set_playing(!self.playing, bus);
    }

    pub fn queued(&self) -> bool {
        self.queued
    }

    pub fn queued_tick(&self) -> Pulse {
        self.queued_tick
    }

    /// Flip the queued flag; the toggle takes effect at the next pattern
    /// boundary.
    pub fn toggle_queued(&mut self) {
        self.queued = !self.queued;
        self.queued_tick = self.last_tick - self.last_tick.rem_euclid(self.length) + self.length;
        self.set_dirty_mp();
    }

    /// Drop a pending queue toggle without playing it.
    pub fn off_queued(&mut self) {
        if self.queued {
            self.queued = false;
            self.set_dirty_mp();
        }
    }

    pub fn last_tick(&self) -> Pulse {
        self.last_tick
    }

    pub fn zero_markers(&mut self) {
        self.last_tick = 0;
    }

    /// Resume playing from `tick` on the next `play`.
    pub fn set_orig_tick(&mut self, tick: Pulse) {
        self.last_tick = tick;
    }

    pub fn song_mute(&self) -> bool {
        self.song_mute
    }

    pub fn set_song_mute(&mut self, mute: bool) {
        self.song_mute = mute;
        self.set_dirty_mp();
    }

    pub fn toggle_song_mute(&mut self) {
        self.set_song_mute(!self.song_mute);
    }

    pub fn editing(&self) -> bool {
        self.editing
    }

    pub fn set_editing(&mut self, editing: bool) {
        self.editing = editing;
    }

    pub fn recording(&self) -> bool {
        self.recording
    }

    pub fn set_recording(&mut self, recording: bool) {
        self.recording = recording;
        self.dirty_edit = true;
    }

    pub fn thru(&self) -> bool {
        self.thru
    }

    pub fn set_thru(&mut self, thru: bool) {
        self.thru = thru;
    }

    /// Mark every view dirty.
    pub fn set_dirty(&mut self) {
        self.dirty_main = true;
        self.dirty_edit = true;
        self.dirty_perf = true;
        self.dirty_names = true;
    }

    /// Mark the main, performance and name views dirty.
    pub fn set_dirty_mp(&mut self) {
        self.dirty_main = true;
        self.dirty_perf = true;
        self.dirty_names = true;
    }

    pub fn is_dirty_main(&mut self) -> bool {
        mem::take(&mut self.dirty_main)
    }

    pub fn is_dirty_edit(&mut self) -> bool {
        mem::take(&mut self.dirty_edit)
    }

    pub fn is_dirty_perf(&mut self) -> bool {
        mem::take(&mut self.dirty_perf)
    }

    pub fn is_dirty_names(&mut self) -> bool {
        mem::take(&mut self.dirty_names)
    }

    /// Play up to `tick`, first resolving a queue toggle whose boundary has
    /// been reached.
    pub fn play_queue(&mut self, tick: Pulse, playback_mode: bool, bus: &mut MasterMidiBus) {
        if self.queued && self.queued_tick <= tick {
            // a jump may already have carried us past the boundary
            if self.queued_tick - 1 >= self.last_tick {
                self.play(self.queued_tick - 1, playback_mode, bus);
            }
            self.toggle_playing(bus);
        }
        self.play(tick, playback_mode, bus);
    }

    /// Emit every event in `[last_tick, tick]`.
    ///
    /// In song (`playback_mode`) mode the pattern sounds only inside its
    /// triggers, each with its own phase offset, and the playing flag
    /// follows the trigger under `tick`.
    pub fn play(&mut self, tick: Pulse, playback_mode: bool, bus: &mut MasterMidiBus) {
        let start = self.last_tick;
        if tick >= start {
            if playback_mode {
                self.play_triggers(start, tick, bus);
            } else if self.playing && !self.song_mute {
                self.emit_range(start, tick, 0, bus);
            }
        }
        self.last_tick = tick + 1;
    }

    fn play_triggers(&mut self, start: Pulse, end: Pulse, bus: &mut MasterMidiBus) {
        if !self.song_mute {
            for i in 0..self.triggers.len() {
                let t = self.triggers.list()[i];
                if t.overlaps(start, end) {
                    self.emit_range(start.max(t.tick_start), end.min(t.tick_end), t.offset, bus);
                }
            }
        }
        let now_playing = self.triggers.state_at(end) && !self.song_mute;
        if now_playing != self.playing {
            self.set_playing(now_playing, bus);
        }
    }

    fn emit_range(&mut self, from: Pulse, to: Pulse, offset: Pulse, bus: &mut MasterMidiBus) {
        if self.events.is_empty() || from > to {
            return;
        }
        let len = self.length;
        let a = from - offset;
        let b = to - offset;
        for lap in a.div_euclid(len)..=b.div_euclid(len) {
            let base = lap * len;
            for i in 0..self.events.len() {
                let stamp = base + self.events[i].timestamp;
                if stamp > b {
                    break;
                }
                if stamp >= a {
                    let ev = self.events[i].clone();
                    self.put_event_on_bus(&ev, bus);
                }
            }
        }
    }

    fn put_event_on_bus(&mut self, ev: &MidiEvent, bus: &mut MasterMidiBus) {
        if ev.is_note_on() && ev.data[1] > 0 {
            let n = &mut self.playing_notes[usize::from(ev.note() & 0x7F)];
            *n = n.saturating_add(1);
        } else if ev.is_note_off() || ev.is_note_on() {
            let n = &mut self.playing_notes[usize::from(ev.note() & 0x7F)];
            *n = n.saturating_sub(1);
        }
        bus.play(self.bus, ev, self.channel);
    }

    /// Send a note-off for every note this pattern left sounding.
    pub fn off_playing_notes(&mut self, bus: &mut MasterMidiBus) {
        for note in 0..128u8 {
            while self.playing_notes[usize::from(note)] > 0 {
                bus.play(self.bus, &MidiEvent::note_off(0, note, 0), self.channel);
                self.playing_notes[usize::from(note)] -= 1;
            }
        }
    }

    /// Offer an incoming event to this pattern.
    ///
    /// With `filter_by_channel` set, events on other channels are refused.
    /// An accepted event is folded into the pattern's length, recorded if
    /// recording, and echoed to the pattern's bus if `thru` is on.
    pub fn stream_event(
        &mut self,
        event: &MidiEvent,
        filter_by_channel: bool,
        bus: &mut MasterMidiBus,
    ) -> bool {
        if filter_by_channel && event.is_channel_message() && event.channel() != self.channel {
            return false;
        }
        let mut ev = event.clone();
        ev.timestamp = ev.timestamp.rem_euclid(self.length);
        if self.recording {
            self.add_event(ev.clone());
        }
        if self.thru {
            bus.play(self.bus, &ev, self.channel);
        }
        true
    }

    pub fn triggers(&self) -> &[Trigger] {
        self.triggers.list()
    }

    pub fn add_trigger(&mut self, tick: Pulse, len: Pulse, offset: Pulse) {
        self.triggers.add(tick, len, offset, self.length);
        self.dirty_perf = true;
    }

    pub fn get_trigger_state(&self, tick: Pulse) -> bool {
        self.triggers.state_at(tick)
    }

    pub fn delete_trigger(&mut self, tick: Pulse) -> bool {
        let done = self.triggers.delete_at(tick);
        self.dirty_perf |= done;
        done
    }

    pub fn split_trigger(&mut self, tick: Pulse) -> bool {
        let done = self.triggers.split_at(tick);
        self.dirty_perf |= done;
        done
    }

    pub fn select_trigger(&mut self, tick: Pulse) -> bool {
        self.triggers.select_at(tick)
    }

    pub fn select_triggers_in_range(&mut self, start: Pulse, end: Pulse) -> usize {
        self.triggers.select_in_range(start, end)
    }

    pub fn unselect_triggers(&mut self) {
        self.triggers.unselect_all();
    }

    pub fn delete_selected_triggers(&mut self) {
        self.triggers.delete_selected();
        self.dirty_perf = true;
    }

    /// Insert (`forward`) or remove `distance` pulses of song time at `start`.
    pub fn move_triggers(&mut self, start: Pulse, distance: Pulse, forward: bool) {
        self.triggers.shift(start, distance, forward, self.length);
        self.dirty_perf = true;
    }

    pub fn copy_triggers(&mut self, start: Pulse, distance: Pulse) {
        self.triggers.copy_window(start, distance, self.length);
        self.dirty_perf = true;
    }

    pub fn clear_triggers(&mut self) {
        self.triggers.clear();
        self.dirty_perf = true;
    }

    pub fn max_trigger(&self) -> Pulse {
        self.triggers.max_tick()
    }

    pub fn push_trigger_undo(&mut self) {
        self.triggers.push_undo();
    }

    pub fn pop_trigger_undo(&mut self) -> bool {
        let done = self.triggers.pop_undo();
        self.dirty_perf |= done;
        done
    }

    pub fn pop_trigger_redo(&mut self) -> bool {
        let done = self.triggers.pop_redo();
        self.dirty_perf |= done;
        done
    }
}
