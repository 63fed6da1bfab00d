//! Performance control state: modifier keys, mute groups and screen-sets.

use std::ops::BitOr;

use tracing::warn;

/// Pattern slots per screen-set.
pub const SEQS_IN_SET: usize = 32;

/// Number of screen-sets.
pub const MAX_SETS: usize = 32;

/// Number of mute groups.
pub const MAX_GROUPS: usize = 32;

/// Replace / snapshot / queue modifiers. Independent bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlStatus(u8);

impl ControlStatus {
    pub const NONE: Self = Self(0);
    pub const REPLACE: Self = Self(1);
    pub const SNAPSHOT: Self = Self(2);
    pub const QUEUE: Self = Self(4);

    pub fn bits(self) -> u8 {
        self.0
    }

    /// True if any bit of `other` is set.
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for ControlStatus {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Clamp a group or in-set track number into `[0, SEQS_IN_SET)`.
pub fn clamp_track(track: usize) -> usize {
    track.min(SEQS_IN_SET - 1)
}

/// The mute-group table and the group/learn modes.
///
/// Each group records, per in-set offset, whether that slot is armed when
/// the group is recalled. The table is independent of which patterns
/// exist.
#[derive(Debug, Clone)]
pub struct MuteGroups {
    table: [[bool; SEQS_IN_SET]; MAX_GROUPS],
    selected: usize,
    /// Arm state applied by the next recall, per in-set offset.
    tracks_mute_state: [bool; SEQS_IN_SET],
    mode_group: bool,
    learn: bool,
}

impl MuteGroups {
    pub fn new() -> Self {
        Self {
            table: [[false; SEQS_IN_SET]; MAX_GROUPS],
            selected: 0,
            tracks_mute_state: [false; SEQS_IN_SET],
            mode_group: true,
            learn: false,
        }
    }

    pub fn selected(&self) -> usize {
        self.selected
    }

    pub fn mode_group(&self) -> bool {
        self.mode_group
    }

    pub fn set_mode_group(&mut self, on: bool) {
        self.mode_group = on;
    }

    pub fn learning(&self) -> bool {
        self.learn
    }

    pub fn set_learning(&mut self, on: bool) {
        self.learn = on;
    }

    /// Entry of the selected group for in-set `track`.
    pub fn group_state(&self, track: usize) -> bool {
        self.table[self.selected][clamp_track(track)]
    }

    pub fn set_group_state(&mut self, track: usize, armed: bool) {
        self.table[self.selected][clamp_track(track)] = armed;
    }

    pub fn group(&self, group: usize) -> &[bool; SEQS_IN_SET] {
        &self.table[clamp_track(group)]
    }

    pub fn set_group(&mut self, group: usize, states: [bool; SEQS_IN_SET]) {
        self.table[clamp_track(group)] = states;
    }

    pub fn mute_state(&self, offset: usize) -> bool {
        self.tracks_mute_state[clamp_track(offset)]
    }

    pub fn set_mute_state(&mut self, offset: usize, armed: bool) {
        self.tracks_mute_state[clamp_track(offset)] = armed;
    }

    pub fn mute_states(&self) -> &[bool; SEQS_IN_SET] {
        &self.tracks_mute_state
    }

    /// Select `group`. In learn mode the current arm state of each present
    /// slot (`playing(offset)` returns `None` for an empty slot) is first
    /// stored into that group. The group is then loaded for recall.
    pub fn select(&mut self, group: usize, playing: impl Fn(usize) -> Option<bool>) {
        let group = clamp_track(group);
        if self.learn {
            for offset in 0..SEQS_IN_SET {
                if let Some(armed) = playing(offset) {
                    self.table[group][offset] = armed;
                }
            }
        }
        self.selected = group;
        self.tracks_mute_state = self.table[group];
    }

    /// Store arm states into the mute-state shadow, for present slots only.
    pub fn capture(&mut self, playing: impl Fn(usize) -> Option<bool>) {
        for offset in 0..SEQS_IN_SET {
            if let Some(armed) = playing(offset) {
                self.tracks_mute_state[offset] = armed;
            }
        }
    }

    pub fn clear(&mut self) {
        self.table = [[false; SEQS_IN_SET]; MAX_GROUPS];
        self.tracks_mute_state = [false; SEQS_IN_SET];
        self.selected = 0;
    }
}

impl Default for MuteGroups {
    fn default() -> Self {
        Self::new()
    }
}

/// Which screen-set is displayed, which is playing, and their notepads.
#[derive(Debug, Clone)]
pub struct ScreenSets {
    screenset: usize,
    playing_screen: usize,
    notepads: Vec<String>,
}

impl ScreenSets {
    pub fn new() -> Self {
        Self {
            screenset: 0,
            playing_screen: 0,
            notepads: vec![String::new(); MAX_SETS],
        }
    }

    pub fn is_valid(ss: usize) -> bool {
        ss < MAX_SETS
    }

    pub fn screenset(&self) -> usize {
        self.screenset
    }

    /// Select the displayed set. Stepping below 0 or past the last set
    /// wraps around.
    pub fn set_screenset(&mut self, ss: isize) {
        self.screenset = if ss < 0 {
            MAX_SETS - 1
        } else if ss as usize >= MAX_SETS {
            0
        } else {
            ss as usize
        };
    }

    /// First slot of the displayed set.
    pub fn offset(&self) -> usize {
        self.screenset * SEQS_IN_SET
    }

    pub fn playing_screen(&self) -> usize {
        self.playing_screen
    }

    /// Make the displayed set the playing set.
    pub fn play_displayed(&mut self) {
        self.playing_screen = self.screenset;
    }

    /// First slot of the playing set.
    pub fn playing_offset(&self) -> usize {
        self.playing_screen * SEQS_IN_SET
    }

    /// In-set offset of `slot` if it belongs to the playing set.
    pub fn playing_index(&self, slot: usize) -> Option<usize> {
        let base = self.playing_offset();
        (base..base + SEQS_IN_SET).contains(&slot).then(|| slot - base)
    }

    pub fn notepad(&self, ss: usize) -> &str {
        self.notepads.get(ss).map(String::as_str).unwrap_or("")
    }

    /// Returns true if the text changed.
    pub fn set_notepad(&mut self, ss: usize, text: &str) -> bool {
        match self.notepads.get_mut(ss) {
            Some(pad) if pad != text => {
                *pad = text.to_string();
                true
            }
            Some(_) => false,
            None => {
                warn!(screenset = ss, "notepad: screen-set out of range");
                false
            }
        }
    }

    pub fn clear_notepads(&mut self) {
        for pad in self.notepads.iter_mut() {
            pad.clear();
        }
    }
}

impl Default for ScreenSets {
    fn default() -> Self {
        Self::new()
    }
}

/// Receives engine notifications. Called with the engine locked, so an
/// implementation must not call back into the engine.
pub trait PerformListener: Send + Sync {
    fn on_group_learn_change(&self, learning: bool);
}
