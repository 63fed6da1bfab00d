//! The performance engine.
//!
//! [`PerformState`] holds everything the output loop, the input loop and the
//! caller share: the pattern registry, mute groups, modifiers, transport and
//! the master bus. It lives behind one mutex; [`Perform`] owns that mutex,
//! the condition variable that wakes the output loop, and both threads.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::bus::ClockMode;
use crate::clock::{pulses_per_measure, ClockMeter};
use crate::control::{
    ControlStatus, MuteGroups, PerformListener, ScreenSets, MAX_GROUPS, SEQS_IN_SET,
};
use crate::keys::KeyBindings;
use crate::mastermidibus::MasterMidiBus;
use crate::midi::Pulse;
use crate::midi_control::{
    ControlHit, ControlKind, ControlOut, MidiControl, MidiControlTable, SeqAction, BPM_DN,
    BPM_UP, GROUP_BASE, MOD_GLEARN, MOD_GMUTE, MOD_QUEUE, MOD_REPLACE, MOD_SNAPSHOT, PLAY_SS,
    SS_DN, SS_UP, TRACK_CONTROLS,
};
use crate::pattern::Pattern;
use crate::registry::{DirtyDomain, Registry, MAX_PATTERNS};
use crate::{input, output, rt};

/// Default output loop period.
pub const DEFAULT_TRIGGER_WIDTH_MS: u64 = 4;

/// Playing/queued flags of one pattern.
type Flags = (bool, bool);

/// Engine behaviour switches fixed at construction.
#[derive(Debug, Clone)]
pub struct PerformOptions {
    pub trigger_width_ms: u64,
    pub stats: bool,
    pub show_midi: bool,
    pub pass_sysex: bool,
    pub priority: bool,
}

impl Default for PerformOptions {
    fn default() -> Self {
        Self {
            trigger_width_ms: DEFAULT_TRIGGER_WIDTH_MS,
            stats: false,
            show_midi: false,
            pass_sysex: false,
            priority: false,
        }
    }
}

pub struct PerformState {
    pub(crate) bus: MasterMidiBus,
    pub(crate) registry: Registry,
    groups: MuteGroups,
    sets: ScreenSets,
    control_status: ControlStatus,
    /// Snapshot of every slot's playing flag.
    sequence_state: Vec<bool>,
    midi_controls: MidiControlTable,
    control_out: Option<ControlOut>,
    keys: KeyBindings,
    listeners: Vec<Arc<dyn PerformListener>>,

    pub(crate) tick: Pulse,
    left_tick: Pulse,
    right_tick: Pulse,
    starting_tick: Pulse,
    one_measure: Pulse,
    pub(crate) running: bool,
    pub(crate) looping: bool,
    pub(crate) playback_mode: bool,

    pub(crate) usemidiclock: bool,
    pub(crate) midiclockrunning: bool,
    /// External clock pulses not yet consumed by the output loop.
    pub(crate) midiclocktick: Pulse,
    /// One-shot jump target for the output loop.
    pub(crate) midiclockpos: Option<Pulse>,
    pub(crate) clock_meter: ClockMeter,
    pub(crate) measured_bpm: Option<f64>,

    pub(crate) outputting: bool,
    pub(crate) inputting: bool,
    pub(crate) options: PerformOptions,
    pub(crate) underruns: u64,
    modified: bool,
    pub(crate) cond: Arc<Condvar>,
}

impl PerformState {
    pub fn new(bus: MasterMidiBus, options: PerformOptions) -> Self {
        let one_measure = pulses_per_measure(bus.ppqn());
        Self {
            bus,
            registry: Registry::new(),
            groups: MuteGroups::new(),
            sets: ScreenSets::new(),
            control_status: ControlStatus::NONE,
            sequence_state: vec![false; MAX_PATTERNS],
            midi_controls: MidiControlTable::new(),
            control_out: None,
            keys: KeyBindings::new(),
            listeners: Vec::new(),
            tick: 0,
            left_tick: 0,
            right_tick: one_measure * 4,
            starting_tick: 0,
            one_measure,
            running: false,
            looping: false,
            playback_mode: false,
            usemidiclock: false,
            midiclockrunning: false,
            midiclocktick: 0,
            midiclockpos: None,
            clock_meter: ClockMeter::new(),
            measured_bpm: None,
            outputting: true,
            inputting: true,
            options,
            underruns: 0,
            modified: false,
            cond: Arc::new(Condvar::new()),
        }
    }

    pub fn master_bus(&self) -> &MasterMidiBus {
        &self.bus
    }

    pub fn master_bus_mut(&mut self) -> &mut MasterMidiBus {
        &mut self.bus
    }

    pub fn options(&self) -> &PerformOptions {
        &self.options
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn set_modified(&mut self, modified: bool) {
        self.modified = modified;
    }

    pub fn add_listener(&mut self, listener: Arc<dyn PerformListener>) {
        self.listeners.push(listener);
    }

    // ---- pattern registry ----

    pub fn ppqn(&self) -> u32 {
        self.bus.ppqn()
    }

    pub fn sequence_count(&self) -> usize {
        self.registry.count()
    }

    pub fn is_active(&self, slot: usize) -> bool {
        self.registry.is_active(slot)
    }

    pub fn get_sequence(&self, slot: usize) -> Option<&Pattern> {
        self.registry.get(slot)
    }

    pub fn get_sequence_mut(&mut self, slot: usize) -> Option<&mut Pattern> {
        self.registry.get_mut(slot)
    }

    /// Put `pattern` at `slot`, replacing anything already there.
    pub fn install_sequence(&mut self, pattern: Pattern, slot: usize) -> bool {
        let done = self.registry.install(slot, pattern, &mut self.bus);
        if done {
            self.modified = true;
            self.send_control_out(slot, SeqAction::Activate);
        }
        done
    }

    /// Add at `preferred` or the first free slot after it.
    pub fn add_sequence(&mut self, pattern: Pattern, preferred: usize) -> Option<usize> {
        let slot = self.registry.add(pattern, preferred)?;
        self.modified = true;
        self.send_control_out(slot, SeqAction::Activate);
        Some(slot)
    }

    /// Create an empty one-measure pattern at `slot`.
    pub fn new_sequence(&mut self, slot: usize) -> bool {
        let pattern = Pattern::new(self.ppqn());
        self.install_sequence(pattern, slot)
    }

    pub fn set_active(&mut self, slot: usize, active: bool) {
        self.registry.set_active(slot, active);
    }

    /// Delete the pattern at `slot` unless it is being edited.
    pub fn delete_sequence(&mut self, slot: usize) -> bool {
        let recording = self.registry.get(slot).map(Pattern::recording).unwrap_or(false);
        if !self.registry.delete(slot, &mut self.bus) {
            return false;
        }
        if recording {
            self.bus.set_sequence_input(false, Some(slot));
        }
        self.modified = true;
        self.send_control_out(slot, SeqAction::Delete);
        true
    }

    pub fn is_sequence_in_edit(&self, slot: usize) -> bool {
        self.registry.get(slot).map(Pattern::editing).unwrap_or(false)
    }

    pub fn is_dirty_main(&mut self, slot: usize) -> bool {
        self.registry.is_dirty(slot, DirtyDomain::Main)
    }

    pub fn is_dirty_edit(&mut self, slot: usize) -> bool {
        self.registry.is_dirty(slot, DirtyDomain::Edit)
    }

    pub fn is_dirty_perf(&mut self, slot: usize) -> bool {
        self.registry.is_dirty(slot, DirtyDomain::Perf)
    }

    pub fn is_dirty_names(&mut self, slot: usize) -> bool {
        self.registry.is_dirty(slot, DirtyDomain::Names)
    }

    /// Drop every pattern and notepad. Returns false if a pattern open in
    /// an editor had to be kept.
    pub fn clear_all(&mut self) -> bool {
        self.reset_sequences();
        let all = self.registry.clear(&mut self.bus);
        self.bus.set_sequence_input(false, None);
        self.sets.clear_notepads();
        self.modified = false;
        all
    }

    // ---- screen-sets and mute groups ----

    pub fn screenset(&self) -> usize {
        self.sets.screenset()
    }

    pub fn set_screenset(&mut self, ss: isize) {
        self.sets.set_screenset(ss);
    }

    pub fn playing_screenset(&self) -> usize {
        self.sets.playing_screen()
    }

    /// Make the displayed set the playing set, carrying the current arm
    /// states over as the mute state, then apply it.
    pub fn set_playing_screenset(&mut self) {
        let base = self.sets.playing_offset();
        let registry = &self.registry;
        self.groups
            .capture(|i| registry.get(base + i).map(Pattern::playing));
        self.sets.play_displayed();
        self.mute_group_tracks();
    }

    pub fn screen_set_notepad(&self, ss: usize) -> &str {
        self.sets.notepad(ss)
    }

    pub fn set_screen_set_notepad(&mut self, ss: usize, text: &str) {
        if self.sets.set_notepad(ss, text) {
            self.modified = true;
        }
    }

    pub fn is_group_mute(&self) -> bool {
        self.groups.mode_group()
    }

    pub fn set_mode_group_mute(&mut self) {
        self.groups.set_mode_group(true);
    }

    pub fn unset_mode_group_mute(&mut self) {
        self.groups.set_mode_group(false);
    }

    pub fn is_group_learning(&self) -> bool {
        self.groups.learning()
    }

    pub fn set_mode_group_learn(&mut self) {
        self.set_mode_group_mute();
        self.groups.set_learning(true);
        for listener in &self.listeners {
            listener.on_group_learn_change(true);
        }
    }

    pub fn unset_mode_group_learn(&mut self) {
        for listener in &self.listeners {
            listener.on_group_learn_change(false);
        }
        self.groups.set_learning(false);
    }

    pub fn mute_group_selected(&self) -> usize {
        self.groups.selected()
    }

    pub fn group_mute_state(&self, track: usize) -> bool {
        self.groups.group_state(track)
    }

    pub fn set_group_mute_state(&mut self, track: usize, armed: bool) {
        self.groups.set_group_state(track, armed);
    }

    pub fn mute_group(&self, group: usize) -> &[bool; SEQS_IN_SET] {
        self.groups.group(group)
    }

    /// Replace a whole mute group, as loaded from configuration.
    pub fn set_mute_group(&mut self, group: usize, states: [bool; SEQS_IN_SET]) {
        if group >= MAX_GROUPS {
            warn!(group, "mute group out of range");
            return;
        }
        self.groups.set_group(group, states);
    }

    /// Select a mute group, learning the playing set into it first when in
    /// learn mode.
    pub fn select_mute_group(&mut self, group: usize) {
        if group >= MAX_GROUPS {
            warn!(group, "mute group out of range, clamping");
        }
        let base = self.sets.playing_offset();
        let registry = &self.registry;
        self.groups
            .select(group, |i| registry.get(base + i).map(Pattern::playing));
    }

    /// Arm or disarm each slot of the playing set from the mute state.
    pub fn mute_group_tracks(&mut self) {
        if !self.groups.mode_group() {
            return;
        }
        let base = self.sets.playing_offset();
        for i in 0..SEQS_IN_SET {
            let slot = base + i;
            if self.registry.is_active(slot) {
                if self.groups.mute_state(i) {
                    self.sequence_playing_on(slot);
                } else {
                    self.sequence_playing_off(slot);
                }
            }
        }
    }

    /// Recall `group` onto the playing set.
    pub fn select_and_mute_group(&mut self, group: usize) {
        self.select_mute_group(group);
        self.mute_group_tracks();
    }

    /// Set the song-mute flag of every pattern.
    pub fn mute_all_tracks(&mut self) {
        for (_, p) in self.registry.iter_active_mut() {
            p.set_song_mute(true);
        }
    }

    // ---- modifiers and arm/disarm ----

    pub fn control_status(&self) -> ControlStatus {
        self.control_status
    }

    pub fn set_sequence_control_status(&mut self, status: ControlStatus) {
        if status.intersects(ControlStatus::SNAPSHOT) {
            self.save_playing_state();
        }
        self.control_status.insert(status);
    }

    pub fn unset_sequence_control_status(&mut self, status: ControlStatus) {
        if status.intersects(ControlStatus::SNAPSHOT) {
            self.restore_playing_state();
        }
        self.control_status.remove(status);
    }

    pub fn save_playing_state(&mut self) {
        for slot in 0..MAX_PATTERNS {
            self.sequence_state[slot] = self.registry.get(slot).map(Pattern::playing).unwrap_or(false);
        }
    }

    pub fn restore_playing_state(&mut self) {
        for slot in 0..MAX_PATTERNS {
            let before = self.flags(slot);
            if let Some(p) = self.registry.get_mut(slot) {
                p.set_playing(self.sequence_state[slot], &mut self.bus);
            }
            self.report_change(slot, before);
        }
    }

    fn flags(&self, slot: usize) -> Option<Flags> {
        self.registry.get(slot).map(|p| (p.playing(), p.queued()))
    }

    /// Toggle a pattern, or its queued flag under the queue modifier. The
    /// replace modifier silences everything else first and then clears
    /// itself.
    pub fn sequence_playing_toggle(&mut self, slot: usize) {
        if !self.registry.is_active(slot) {
            return;
        }
        if self.control_status.intersects(ControlStatus::QUEUE) {
            let before = self.flags(slot);
            if let Some(p) = self.registry.get_mut(slot) {
                p.toggle_queued();
            }
            self.report_change(slot, before);
        } else {
            if self.control_status.intersects(ControlStatus::REPLACE) {
                self.unset_sequence_control_status(ControlStatus::REPLACE);
                self.off_sequences();
            }
            let before = self.flags(slot);
            if let Some(p) = self.registry.get_mut(slot) {
                p.toggle_playing(&mut self.bus);
            }
            self.report_change(slot, before);
        }
    }

    /// Arm a pattern. Arming twice is the same as arming once.
    pub fn sequence_playing_on(&mut self, slot: usize) {
        self.sequence_playing_set(slot, true);
    }

    pub fn sequence_playing_off(&mut self, slot: usize) {
        self.sequence_playing_set(slot, false);
    }

    fn sequence_playing_set(&mut self, slot: usize, on: bool) {
        if !self.registry.is_active(slot) {
            return;
        }
        if self.groups.mode_group() {
            if let Some(i) = self.sets.playing_index(slot) {
                self.groups.set_mute_state(i, on);
            }
        }
        let queue = self.control_status.intersects(ControlStatus::QUEUE);
        let before = self.flags(slot);
        if let Some(p) = self.registry.get_mut(slot) {
            if p.playing() != on {
                if queue {
                    if !p.queued() {
                        p.toggle_queued();
                    }
                } else {
                    p.set_playing(on, &mut self.bus);
                }
            } else if p.queued() && queue {
                p.toggle_queued();
            }
        }
        self.report_change(slot, before);
    }

    /// Toggle slot `seq` of the displayed set, as a key press does.
    pub fn sequence_key(&mut self, seq: usize) {
        let slot = seq + self.sets.offset();
        if self.registry.is_active(slot) {
            self.sequence_playing_toggle(slot);
        }
    }

    fn send_control_out(&mut self, slot: usize, what: SeqAction) {
        if let (Some(out), Some(i)) = (self.control_out.as_ref(), self.sets.playing_index(slot)) {
            out.send_seq_event(i, what, &mut self.bus);
        }
    }

    fn report_change(&mut self, slot: usize, before: Option<Flags>) {
        if let (Some(before), Some(after)) = (before, self.flags(slot)) {
            report(
                self.control_out.as_ref(),
                &self.sets,
                &mut self.bus,
                slot,
                before,
                after,
            );
        }
    }

    // ---- transport ----

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn looping(&self) -> bool {
        self.looping
    }

    pub fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
    }

    pub fn playback_mode(&self) -> bool {
        self.playback_mode
    }

    pub fn set_playback_mode(&mut self, song_mode: bool) {
        self.playback_mode = song_mode;
    }

    /// Start playback in live (`false`) or song (`true`) mode and wake the
    /// output loop. Song mode starts with every pattern disarmed.
    pub fn start(&mut self, song_mode: bool) {
        if !self.running {
            self.playback_mode = song_mode;
            if song_mode {
                self.off_sequences();
            }
            self.running = true;
            self.cond.notify_all();
        }
    }

    /// Stop playback and wake the output loop.
    pub fn stop(&mut self) {
        self.running = false;
        self.reset_sequences();
        self.usemidiclock = false;
        self.cond.notify_all();
    }

    pub fn get_tick(&self) -> Pulse {
        self.tick
    }

    /// Move the transport. While running this is applied by the output
    /// loop at its next iteration.
    pub fn reposition(&mut self, tick: Pulse) {
        let tick = tick.max(0);
        self.starting_tick = tick;
        if self.running {
            self.midiclockpos = Some(tick);
        } else {
            self.tick = tick;
        }
    }

    pub fn one_measure(&self) -> Pulse {
        self.one_measure
    }

    pub fn left_tick(&self) -> Pulse {
        self.left_tick
    }

    pub fn right_tick(&self) -> Pulse {
        self.right_tick
    }

    pub fn starting_tick(&self) -> Pulse {
        self.starting_tick
    }

    pub fn set_start_tick(&mut self, tick: Pulse) {
        self.starting_tick = tick;
    }

    /// Place the left marker, pushing the right marker a measure past it
    /// if they would cross.
    pub fn set_left_tick(&mut self, tick: Pulse, setstart: bool) {
        self.left_tick = tick;
        if setstart {
            self.starting_tick = tick;
        }
        if self.left_tick >= self.right_tick {
            self.right_tick = self.left_tick + self.one_measure;
        }
    }

    /// Place the right marker. Ticks inside the first measure are refused.
    pub fn set_right_tick(&mut self, tick: Pulse, setstart: bool) {
        if tick < self.one_measure {
            return;
        }
        self.right_tick = tick;
        if self.right_tick <= self.left_tick {
            self.left_tick = self.right_tick - self.one_measure;
            if setstart {
                self.starting_tick = self.left_tick;
            }
        }
    }

    pub fn beats_per_minute(&self) -> f64 {
        self.bus.bpm()
    }

    pub fn set_beats_per_minute(&mut self, bpm: f64) {
        self.bus.set_bpm(bpm);
    }

    /// Tempo measured from incoming MIDI clock, once enough has arrived.
    pub fn measured_bpm(&self) -> Option<f64> {
        self.measured_bpm
    }

    pub fn use_midi_clock(&self) -> bool {
        self.usemidiclock
    }

    pub fn midi_clock_running(&self) -> bool {
        self.midiclockrunning
    }

    /// Output loop iterations that overran their time budget.
    pub fn underruns(&self) -> u64 {
        self.underruns
    }

    /// Disarm every pattern.
    pub fn off_sequences(&mut self) {
        for slot in 0..MAX_PATTERNS {
            let before = self.flags(slot);
            if let Some(p) = self.registry.get_mut(slot) {
                p.set_playing(false, &mut self.bus);
            }
            self.report_change(slot, before);
        }
    }

    /// Silence every sounding note without changing arm states.
    pub fn all_notes_off(&mut self) {
        for (_, p) in self.registry.iter_active_mut() {
            p.off_playing_notes(&mut self.bus);
        }
        self.bus.flush();
    }

    /// Silence and rewind every pattern. Live mode keeps arm states.
    pub fn reset_sequences(&mut self) {
        let keep = !self.playback_mode;
        for (_, p) in self.registry.iter_active_mut() {
            let playing = p.playing();
            p.off_playing_notes(&mut self.bus);
            p.set_playing(false, &mut self.bus);
            p.zero_markers();
            if keep {
                p.set_playing(playing, &mut self.bus);
            }
        }
        self.bus.flush();
    }

    pub fn set_orig_ticks(&mut self, tick: Pulse) {
        for (_, p) in self.registry.iter_active_mut() {
            p.set_orig_tick(tick);
        }
    }

    /// Play every non-empty pattern up to `tick`, resolving queued toggles
    /// at their boundaries, then flush.
    pub fn play(&mut self, tick: Pulse) {
        self.tick = tick;
        let mode = self.playback_mode;
        let Self {
            registry,
            bus,
            sets,
            control_out,
            ..
        } = self;
        for (slot, p) in registry.iter_active_mut() {
            if p.event_count() == 0 {
                continue;
            }
            let before = (p.playing(), p.queued());
            p.play_queue(tick, mode, bus);
            let after = (p.playing(), p.queued());
            report(control_out.as_ref(), sets, bus, slot, before, after);
        }
        bus.flush();
    }

    // ---- song triggers ----

    pub fn get_max_trigger(&self) -> Pulse {
        self.registry
            .iter_active()
            .map(|(_, p)| p.max_trigger())
            .max()
            .unwrap_or(0)
    }

    pub fn clear_sequence_triggers(&mut self, slot: usize) {
        if let Some(p) = self.registry.get_mut(slot) {
            p.clear_triggers();
        }
    }

    pub fn add_trigger(&mut self, slot: usize, tick: Pulse, len: Pulse, offset: Pulse) {
        if let Some(p) = self.registry.get_mut(slot) {
            p.add_trigger(tick, len, offset);
            self.modified = true;
        }
    }

    pub fn select_triggers_in_range(&mut self, slot: usize, start: Pulse, end: Pulse) -> usize {
        self.registry
            .get_mut(slot)
            .map(|p| p.select_triggers_in_range(start, end))
            .unwrap_or(0)
    }

    /// Insert (`forward`) or remove the song time between the markers.
    pub fn move_triggers(&mut self, forward: bool) {
        if self.left_tick < self.right_tick {
            let (left, distance) = (self.left_tick, self.right_tick - self.left_tick);
            for (_, p) in self.registry.iter_active_mut() {
                p.move_triggers(left, distance, forward);
            }
            self.modified = true;
        }
    }

    /// Duplicate the triggers between the markers right after the right
    /// marker.
    pub fn copy_triggers(&mut self) {
        if self.left_tick < self.right_tick {
            let (left, distance) = (self.left_tick, self.right_tick - self.left_tick);
            for (_, p) in self.registry.iter_active_mut() {
                p.copy_triggers(left, distance);
            }
            self.modified = true;
        }
    }

    pub fn push_trigger_undo(&mut self) {
        for (_, p) in self.registry.iter_active_mut() {
            p.push_trigger_undo();
        }
    }

    pub fn pop_trigger_undo(&mut self) {
        for (_, p) in self.registry.iter_active_mut() {
            p.pop_trigger_undo();
        }
    }

    pub fn pop_trigger_redo(&mut self) {
        for (_, p) in self.registry.iter_active_mut() {
            p.pop_trigger_redo();
        }
    }

    // ---- input, recording and remote control ----

    /// Start or stop recording input into the pattern at `slot`.
    pub fn set_sequence_input(&mut self, slot: usize, on: bool) {
        match self.registry.get_mut(slot) {
            Some(p) => {
                p.set_recording(on);
                self.bus.set_sequence_input(on, Some(slot));
            }
            None => warn!(slot, "cannot record into an empty slot"),
        }
    }

    pub fn set_input_bus(&mut self, bus: usize, active: bool) -> bool {
        self.bus.set_input(bus, active)
    }

    pub fn set_clock_bus(&mut self, bus: usize, mode: ClockMode) -> bool {
        self.bus.set_clock(bus, mode)
    }

    pub fn midi_control(&self, kind: ControlKind, index: usize) -> Option<&MidiControl> {
        self.midi_controls.get(kind, index)
    }

    pub fn set_midi_control(&mut self, kind: ControlKind, index: usize, control: MidiControl) -> bool {
        self.midi_controls.set(kind, index, control)
    }

    pub fn midi_controls(&self) -> &MidiControlTable {
        &self.midi_controls
    }

    pub fn set_control_out(&mut self, out: Option<ControlOut>) {
        self.control_out = out;
    }

    pub fn keys(&self) -> &KeyBindings {
        &self.keys
    }

    pub fn keys_mut(&mut self) -> &mut KeyBindings {
        &mut self.keys
    }

    /// Run the actions bound to an incoming `status d0 d1`.
    pub fn handle_control_event(&mut self, status: u8, d0: u8, d1: u8) {
        let offset = self.sets.offset();
        let hits: Vec<ControlHit> = self.midi_controls.matches(status, d0, d1).collect();
        for hit in hits {
            match hit {
                ControlHit::Toggle(i) => self.sequence_playing_toggle(i + offset),
                ControlHit::Set(i, on) if i < SEQS_IN_SET => {
                    self.sequence_playing_set(i + offset, on)
                }
                ControlHit::Set(i, on) => self.handle_midi_control(i, on),
            }
        }
    }

    /// Apply a global or group control.
    pub fn handle_midi_control(&mut self, control: usize, state: bool) {
        match control {
            BPM_UP => self.set_beats_per_minute(self.beats_per_minute() + 1.0),
            BPM_DN => self.set_beats_per_minute(self.beats_per_minute() - 1.0),
            SS_UP => self.set_screenset(self.screenset() as isize + 1),
            SS_DN => self.set_screenset(self.screenset() as isize - 1),
            MOD_REPLACE => self.set_modifier(ControlStatus::REPLACE, state),
            MOD_SNAPSHOT => self.set_modifier(ControlStatus::SNAPSHOT, state),
            MOD_QUEUE => self.set_modifier(ControlStatus::QUEUE, state),
            MOD_GMUTE => {
                if state {
                    self.set_mode_group_mute();
                } else {
                    self.unset_mode_group_mute();
                }
            }
            MOD_GLEARN => {
                if state {
                    self.set_mode_group_learn();
                } else {
                    self.unset_mode_group_learn();
                }
            }
            PLAY_SS => self.set_playing_screenset(),
            c if (GROUP_BASE..TRACK_CONTROLS).contains(&c) => {
                self.select_and_mute_group(c - GROUP_BASE)
            }
            _ => {}
        }
    }

    fn set_modifier(&mut self, status: ControlStatus, on: bool) {
        if on {
            self.set_sequence_control_status(status);
        } else {
            self.unset_sequence_control_status(status);
        }
    }
}

/// Send control-out feedback for a change of a pattern's flags.
fn report(
    out: Option<&ControlOut>,
    sets: &ScreenSets,
    bus: &mut MasterMidiBus,
    slot: usize,
    before: Flags,
    after: Flags,
) {
    let (Some(out), Some(i)) = (out, sets.playing_index(slot)) else {
        return;
    };
    if after.1 != before.1 {
        let what = if after.1 { SeqAction::Queue } else { SeqAction::Unqueue };
        out.send_seq_event(i, what, bus);
    }
    if after.0 != before.0 {
        let what = if after.0 { SeqAction::Play } else { SeqAction::Mute };
        out.send_seq_event(i, what, bus);
    }
}

/// Handle to a running engine: the shared state plus its two threads.
pub struct Perform {
    state: Arc<Mutex<PerformState>>,
    cond: Arc<Condvar>,
    output_thread: Option<JoinHandle<()>>,
    input_thread: Option<JoinHandle<()>>,
}

impl Perform {
    pub fn new(state: PerformState) -> Self {
        let cond = state.cond.clone();
        Self {
            state: Arc::new(Mutex::new(state)),
            cond,
            output_thread: None,
            input_thread: None,
        }
    }

    /// Lock the engine.
    pub fn lock(&self) -> MutexGuard<'_, PerformState> {
        self.state.lock()
    }

    /// Spawn the output and input threads. A thread that fails to spawn is
    /// logged and left out.
    pub fn launch(&mut self) {
        let priority = self.lock().options.priority;

        let state = self.state.clone();
        let cond = self.cond.clone();
        self.output_thread = spawn("seqperf-output", move || {
            if priority {
                rt::elevate("output");
            }
            output::output_func(state, cond);
        });

        let state = self.state.clone();
        self.input_thread = spawn("seqperf-input", move || {
            if priority {
                rt::elevate("input");
            }
            input::input_func(state);
        });
    }

    pub fn start(&self, song_mode: bool) {
        self.lock().start(song_mode);
    }

    pub fn stop(&self) {
        self.lock().stop();
    }

    pub fn is_running(&self) -> bool {
        self.lock().is_running()
    }
}

fn spawn(name: &str, f: impl FnOnce() + Send + 'static) -> Option<JoinHandle<()>> {
    match thread::Builder::new().name(name.to_string()).spawn(f) {
        Ok(handle) => {
            info!(thread = name, "launched");
            Some(handle)
        }
        Err(e) => {
            error!(thread = name, "failed to launch: {}", e);
            None
        }
    }
}

impl Drop for Perform {
    fn drop(&mut self) {
        {
            let mut state = self.state.lock();
            state.running = false;
            state.inputting = false;
            state.outputting = false;
        }
        self.cond.notify_all();
        for handle in [self.output_thread.take(), self.input_thread.take()]
            .into_iter()
            .flatten()
        {
            if handle.join().is_err() {
                error!("engine thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::MidiEvent;
    use crate::midi_control::MIDI_CONTROLS;
    use crate::output::OutputPad;
    use crate::transport::testing::{CapturePort, Sent};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn engine() -> (PerformState, Sent) {
        let (port, sent) = CapturePort::new("out");
        let bus = MasterMidiBus::new(vec![Box::new(port)], vec![], 192, 120.0);
        (PerformState::new(bus, PerformOptions::default()), sent)
    }

    fn with_patterns(state: &mut PerformState, slots: &[usize]) {
        for &slot in slots {
            let mut p = Pattern::new(192);
            p.add_note(0, 96, 60, 100);
            state.install_sequence(p, slot);
        }
    }

    fn playing(state: &PerformState, slot: usize) -> bool {
        state.get_sequence(slot).map(Pattern::playing).unwrap_or(false)
    }

    fn queued(state: &PerformState, slot: usize) -> bool {
        state.get_sequence(slot).map(Pattern::queued).unwrap_or(false)
    }

    #[test]
    fn test_add_sequence_activates_slot() {
        let (mut state, _) = engine();
        for preferred in [0, 0, 40, 2000] {
            let before = state.sequence_count();
            let slot = state.add_sequence(Pattern::new(192), preferred).unwrap();
            assert!(state.is_active(slot));
            assert_eq!(state.sequence_count(), before + 1);
        }
    }

    #[test]
    fn test_group_learn_then_recall() {
        let (mut state, _) = engine();
        with_patterns(&mut state, &[0, 1, 2, 3]);
        state.set_mode_group_learn();
        state.sequence_playing_on(1);
        state.sequence_playing_on(3);
        state.select_mute_group(5);
        state.unset_mode_group_learn();

        state.off_sequences();
        state.sequence_playing_on(0);
        state.select_and_mute_group(5);
        let armed: Vec<bool> = (0..4).map(|s| playing(&state, s)).collect();
        assert_eq!(armed, vec![false, true, false, true]);
    }

    #[test]
    fn test_recall_needs_group_mode() {
        let (mut state, _) = engine();
        with_patterns(&mut state, &[0]);
        state.set_mode_group_learn();
        state.sequence_playing_on(0);
        state.select_mute_group(1);
        state.unset_mode_group_learn();
        state.sequence_playing_off(0);
        state.unset_mode_group_mute();
        state.select_and_mute_group(1);
        assert!(!playing(&state, 0));
    }

    #[test]
    fn test_recall_only_touches_playing_set() {
        let (mut state, _) = engine();
        with_patterns(&mut state, &[0, SEQS_IN_SET]);
        state.sequence_playing_on(SEQS_IN_SET);
        state.select_and_mute_group(0);
        assert!(playing(&state, SEQS_IN_SET));
    }

    #[test]
    fn test_learn_notifies_listeners_in_order() {
        struct Recorder(Mutex<Vec<(bool, usize)>>, AtomicUsize);
        impl PerformListener for Recorder {
            fn on_group_learn_change(&self, learning: bool) {
                let n = self.1.fetch_add(1, Ordering::SeqCst);
                self.0.lock().push((learning, n));
            }
        }
        let (mut state, _) = engine();
        let rec = Arc::new(Recorder(Mutex::new(Vec::new()), AtomicUsize::new(0)));
        state.add_listener(rec.clone());
        state.unset_mode_group_mute();
        state.set_mode_group_learn();
        assert!(state.is_group_mute());
        assert!(state.is_group_learning());
        state.unset_mode_group_learn();
        assert!(!state.is_group_learning());
        assert_eq!(rec.0.lock().as_slice(), &[(true, 0), (false, 1)]);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let (mut state, _) = engine();
        with_patterns(&mut state, &[0, 1, 2, 700]);
        state.sequence_playing_on(0);
        state.sequence_playing_on(700);
        state.set_sequence_control_status(ControlStatus::SNAPSHOT);
        state.sequence_playing_off(0);
        state.sequence_playing_on(1);
        state.sequence_playing_on(2);
        state.sequence_playing_off(700);
        state.unset_sequence_control_status(ControlStatus::SNAPSHOT);
        let armed: Vec<bool> = [0, 1, 2, 700].iter().map(|&s| playing(&state, s)).collect();
        assert_eq!(armed, vec![true, false, false, true]);
        assert_eq!(state.control_status(), ControlStatus::NONE);
    }

    #[test]
    fn test_arm_twice_under_queue_is_arm_once() {
        let (mut state, _) = engine();
        with_patterns(&mut state, &[4]);
        state.set_sequence_control_status(ControlStatus::QUEUE);
        state.sequence_playing_on(4);
        let once = (playing(&state, 4), queued(&state, 4));
        state.sequence_playing_on(4);
        assert_eq!((playing(&state, 4), queued(&state, 4)), once);
        assert_eq!(once, (false, true));
    }

    #[test]
    fn test_arm_on_playing_cancels_queued_off() {
        let (mut state, _) = engine();
        with_patterns(&mut state, &[4]);
        state.sequence_playing_on(4);
        state.set_sequence_control_status(ControlStatus::QUEUE);
        state.sequence_playing_off(4);
        assert!(queued(&state, 4));
        state.sequence_playing_on(4);
        assert!(!queued(&state, 4));
        assert!(playing(&state, 4));
    }

    #[test]
    fn test_toggle_under_queue_only_queues() {
        let (mut state, _) = engine();
        with_patterns(&mut state, &[5]);
        state.set_sequence_control_status(ControlStatus::QUEUE);
        state.sequence_playing_toggle(5);
        assert!(queued(&state, 5));
        assert!(!playing(&state, 5));
    }

    #[test]
    fn test_toggle_with_replace_silences_others() {
        let (mut state, _) = engine();
        with_patterns(&mut state, &[0, 1, 2]);
        state.sequence_playing_on(0);
        state.sequence_playing_on(1);
        state.set_sequence_control_status(ControlStatus::REPLACE);
        state.sequence_playing_toggle(2);
        assert!(!playing(&state, 0));
        assert!(!playing(&state, 1));
        assert!(playing(&state, 2));
        assert!(!state.control_status().intersects(ControlStatus::REPLACE));
    }

    #[test]
    fn test_arm_mirrors_into_mute_state() {
        let (mut state, _) = engine();
        with_patterns(&mut state, &[3]);
        state.sequence_playing_on(3);
        // recall of the loaded (all-off) group would disarm; the manual arm wins
        state.mute_group_tracks();
        assert!(playing(&state, 3));
    }

    #[test]
    fn test_left_marker_pushes_right() {
        let (mut state, _) = engine();
        state.set_right_tick(1536, true);
        state.set_left_tick(2000, true);
        assert_eq!(state.right_tick(), 2000 + 768);
        assert_eq!(state.starting_tick(), 2000);
    }

    #[test]
    fn test_right_marker_inside_first_measure_refused() {
        let (mut state, _) = engine();
        let before = (state.left_tick(), state.right_tick());
        state.set_right_tick(767, true);
        assert_eq!((state.left_tick(), state.right_tick()), before);
        state.set_right_tick(768, true);
        assert_eq!(state.right_tick(), 768);
    }

    #[test]
    fn test_right_marker_pulls_left() {
        let (mut state, _) = engine();
        state.set_left_tick(3000, false);
        state.set_right_tick(1536, true);
        assert_eq!(state.left_tick(), 768);
        assert_eq!(state.starting_tick(), 768);
    }

    #[test]
    fn test_bpm_clamped() {
        let (mut state, _) = engine();
        state.set_beats_per_minute(5.0);
        assert_eq!(state.beats_per_minute(), 20.0);
        state.set_beats_per_minute(140.0);
        assert_eq!(state.beats_per_minute(), 140.0);
    }

    #[test]
    fn test_half_second_plays_one_beat() {
        let (mut state, sent) = engine();
        let mut p = Pattern::new(192);
        p.add_note(0, 192, 60, 100);
        state.install_sequence(p, 0);
        state.sequence_playing_on(0);
        state.start(false);
        let mut pad = OutputPad::new(&mut state);
        pad.advance(&mut state, 500_000);
        assert_eq!(state.get_tick(), 192);
        assert_eq!(
            sent.lock().as_slice(),
            &[vec![0x90, 60, 100], vec![0x80, 60, 0]]
        );
    }

    #[test]
    fn test_start_in_song_mode_disarms() {
        let (mut state, _) = engine();
        with_patterns(&mut state, &[0]);
        state.sequence_playing_on(0);
        state.start(true);
        assert!(state.is_running());
        assert!(state.playback_mode());
        assert!(!playing(&state, 0));
    }

    #[test]
    fn test_stop_keeps_live_arm_state() {
        let (mut state, _) = engine();
        with_patterns(&mut state, &[0]);
        state.sequence_playing_on(0);
        state.start(false);
        state.play(100);
        state.stop();
        assert!(!state.is_running());
        assert!(playing(&state, 0));
        assert_eq!(state.get_sequence(0).unwrap().last_tick(), 0);
    }

    #[test]
    fn test_delete_while_editing_refused() {
        let (mut state, _) = engine();
        with_patterns(&mut state, &[0]);
        state.get_sequence_mut(0).unwrap().set_editing(true);
        assert!(state.is_sequence_in_edit(0));
        assert!(!state.delete_sequence(0));
        state.get_sequence_mut(0).unwrap().set_editing(false);
        assert!(state.delete_sequence(0));
        assert!(state.is_dirty_main(0));
        assert!(!state.is_dirty_main(0));
    }

    #[test]
    fn test_delete_stops_recording() {
        let (mut state, _) = engine();
        with_patterns(&mut state, &[0]);
        state.set_sequence_input(0, true);
        assert!(state.master_bus().is_dumping());
        assert!(state.delete_sequence(0));
        assert!(!state.master_bus().is_dumping());
    }

    #[test]
    fn test_playing_screenset_carries_arm_states() {
        let (mut state, _) = engine();
        with_patterns(&mut state, &[2, SEQS_IN_SET + 2]);
        state.sequence_playing_on(2);
        state.set_screenset(1);
        state.set_playing_screenset();
        assert_eq!(state.playing_screenset(), 1);
        // offset 2 was armed in the old set, so it is armed in the new one
        assert!(playing(&state, SEQS_IN_SET + 2));
    }

    #[test]
    fn test_midi_control_toggles_displayed_set() {
        let (mut state, _) = engine();
        with_patterns(&mut state, &[SEQS_IN_SET + 1]);
        state.set_screenset(1);
        state.set_midi_control(
            ControlKind::Toggle,
            1,
            MidiControl {
                active: true,
                inverse_active: false,
                status: 0x90,
                data: 37,
                min_value: 1,
                max_value: 127,
            },
        );
        state.handle_control_event(0x90, 37, 100);
        assert!(playing(&state, SEQS_IN_SET + 1));
    }

    #[test]
    fn test_midi_control_globals() {
        let (mut state, _) = engine();
        state.handle_midi_control(BPM_UP, true);
        assert_eq!(state.beats_per_minute(), 121.0);
        state.handle_midi_control(SS_DN, true);
        assert_eq!(state.screenset(), 31);
        state.handle_midi_control(MOD_QUEUE, true);
        assert!(state.control_status().intersects(ControlStatus::QUEUE));
        // queue must not leak into group mute
        assert!(state.is_group_mute());
        state.handle_midi_control(MOD_QUEUE, false);
        assert_eq!(state.control_status(), ControlStatus::NONE);
        state.handle_midi_control(MIDI_CONTROLS + 3, true);
    }

    #[test]
    fn test_control_out_reports_arm() {
        let (mut state, sent) = engine();
        with_patterns(&mut state, &[1]);
        let mut out = ControlOut::new(0);
        out.set_seq_event(1, SeqAction::Play, MidiEvent::new(0, 0x90, 1, 127));
        out.set_seq_event(1, SeqAction::Mute, MidiEvent::new(0, 0x80, 1, 0));
        state.set_control_out(Some(out));
        state.sequence_playing_on(1);
        state.sequence_playing_on(1);
        state.sequence_playing_off(1);
        assert_eq!(
            sent.lock().as_slice(),
            &[vec![0x90, 1, 127], vec![0x80, 1, 0]]
        );
    }

    #[test]
    fn test_move_and_copy_triggers_use_markers() {
        let (mut state, _) = engine();
        with_patterns(&mut state, &[0]);
        state.add_trigger(0, 0, 768, 0);
        state.set_left_tick(0, true);
        state.set_right_tick(768, true);
        state.copy_triggers();
        assert_eq!(state.get_max_trigger(), 1535);
        state.push_trigger_undo();
        state.move_triggers(true);
        assert_eq!(state.get_max_trigger(), 2303);
        state.pop_trigger_undo();
        assert_eq!(state.get_max_trigger(), 1535);
    }

    #[test]
    fn test_clear_all() {
        let (mut state, _) = engine();
        with_patterns(&mut state, &[0, 9]);
        state.set_screen_set_notepad(0, "intro");
        assert!(state.clear_all());
        assert_eq!(state.sequence_count(), 0);
        assert_eq!(state.screen_set_notepad(0), "");
    }

    #[test]
    fn test_stop_wakes_waiting_thread() {
        let (state, _) = engine();
        let cond = state.cond.clone();
        let shared = Arc::new(Mutex::new(state));
        shared.lock().start(false);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let waiter = {
            let shared = shared.clone();
            thread::spawn(move || {
                let mut guard = shared.lock();
                ready_tx.send(()).unwrap();
                while guard.running {
                    if cond
                        .wait_for(&mut guard, std::time::Duration::from_secs(5))
                        .timed_out()
                    {
                        return false;
                    }
                }
                true
            })
        };
        ready_rx.recv().unwrap();
        shared.lock().stop();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_perform_drop_joins_threads() {
        let (state, _) = engine();
        let mut perform = Perform::new(state);
        perform.launch();
        perform.start(false);
        assert!(perform.is_running());
        perform.stop();
        drop(perform);
    }
}
