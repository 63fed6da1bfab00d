//! Fixed-capacity table of pattern slots.
//!
//! The table is sized once and never grows, so the output loop indexes it
//! without allocating. Each slot remembers, separately for each view domain,
//! that it went from active to inactive, and reports that edge once.

use tracing::{error, warn};

use crate::mastermidibus::MasterMidiBus;
use crate::pattern::Pattern;

/// Total number of pattern slots.
pub const MAX_PATTERNS: usize = 1024;

/// Slot index that means "no pattern". Accepted silently everywhere.
pub const SLOT_DISABLED: usize = usize::MAX;

/// Views that poll slots for changes independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyDomain {
    Main = 0,
    Edit = 1,
    Perf = 2,
    Names = 3,
}

#[derive(Default)]
struct Slot {
    pattern: Option<Box<Pattern>>,
    active: bool,
    /// Deactivation edge not yet reported, per [`DirtyDomain`].
    was_active: [bool; 4],
}

pub struct Registry {
    slots: Vec<Slot>,
    count: usize,
}

impl Registry {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_PATTERNS);
        slots.resize_with(MAX_PATTERNS, Slot::default);
        Self { slots, count: 0 }
    }

    /// Number of installed patterns.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_valid(slot: usize) -> bool {
        slot < MAX_PATTERNS
    }

    /// Validate `slot`, logging anything out of range except the sentinel.
    fn check(slot: usize) -> bool {
        if Self::is_valid(slot) {
            true
        } else {
            if slot != SLOT_DISABLED {
                warn!(slot, "pattern slot out of range");
            }
            false
        }
    }

    pub fn is_active(&self, slot: usize) -> bool {
        Self::check(slot) && self.slots[slot].active
    }

    /// The pattern at an active slot.
    pub fn get(&self, slot: usize) -> Option<&Pattern> {
        if !self.is_active(slot) {
            return None;
        }
        let found = self.slots[slot].pattern.as_deref();
        if found.is_none() {
            error!(slot, "active slot has no pattern");
        }
        found
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut Pattern> {
        if !self.is_active(slot) {
            return None;
        }
        let found = self.slots[slot].pattern.as_deref_mut();
        if found.is_none() {
            error!(slot, "active slot has no pattern");
        }
        found
    }

    /// Put `pattern` at `slot`, replacing whatever was there, and activate it.
    /// A replaced pattern is disarmed first so none of its notes hang.
    pub fn install(&mut self, slot: usize, pattern: Pattern, bus: &mut MasterMidiBus) -> bool {
        if !Self::check(slot) {
            return false;
        }
        if let Some(mut old) = self.put(slot, pattern) {
            old.set_playing(false, bus);
        }
        true
    }

    fn put(&mut self, slot: usize, pattern: Pattern) -> Option<Box<Pattern>> {
        let old = self.slots[slot].pattern.replace(Box::new(pattern));
        if old.is_some() {
            warn!(slot, "replacing an existing pattern");
        } else {
            self.count += 1;
        }
        self.set_active(slot, true);
        old
    }

    /// Install at `preferred`, or the first free slot after it.
    ///
    /// An out-of-range preference means slot 0. Returns the slot used, or
    /// `None` when every slot from the preference onward is taken.
    pub fn add(&mut self, pattern: Pattern, preferred: usize) -> Option<usize> {
        let preferred = if Self::is_valid(preferred) { preferred } else { 0 };
        let slot = (preferred..MAX_PATTERNS).find(|&s| !self.slots[s].active);
        match slot {
            Some(slot) => {
                self.put(slot, pattern);
                Some(slot)
            }
            None => {
                warn!(preferred, "no free pattern slot");
                None
            }
        }
    }

    pub fn set_active(&mut self, slot: usize, active: bool) {
        if !Self::check(slot) {
            return;
        }
        let entry = &mut self.slots[slot];
        if entry.active && !active {
            entry.was_active = [true; 4];
        }
        entry.active = active;
        if active {
            match entry.pattern.as_deref_mut() {
                Some(p) => {
                    p.set_number(slot);
                    p.ensure_name();
                }
                None => error!(slot, "activating a slot with no pattern"),
            }
        }
    }

    /// Remove the pattern at `slot` unless it is open in an editor.
    ///
    /// The removed pattern is disarmed first so none of its notes hang.
    pub fn delete(&mut self, slot: usize, bus: &mut MasterMidiBus) -> bool {
        if !Self::check(slot) {
            return false;
        }
        match self.slots[slot].pattern.as_deref() {
            Some(p) if !p.editing() => {}
            _ => return false,
        }
        self.set_active(slot, false);
        if let Some(mut p) = self.slots[slot].pattern.take() {
            p.set_playing(false, bus);
            self.count -= 1;
        }
        true
    }

    /// Has `slot` changed for `domain` since the last poll?
    pub fn is_dirty(&mut self, slot: usize, domain: DirtyDomain) -> bool {
        if !Self::check(slot) {
            return false;
        }
        let entry = &mut self.slots[slot];
        if entry.active {
            match entry.pattern.as_deref_mut() {
                Some(p) => match domain {
                    DirtyDomain::Main => p.is_dirty_main(),
                    DirtyDomain::Edit => p.is_dirty_edit(),
                    DirtyDomain::Perf => p.is_dirty_perf(),
                    DirtyDomain::Names => p.is_dirty_names(),
                },
                None => {
                    error!(slot, "active slot has no pattern");
                    false
                }
            }
        } else {
            std::mem::take(&mut entry.was_active[domain as usize])
        }
    }

    /// Active patterns with their slot numbers, in slot order.
    pub fn iter_active(&self) -> impl Iterator<Item = (usize, &Pattern)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.active)
            .filter_map(|(i, s)| s.pattern.as_deref().map(|p| (i, p)))
    }

    pub fn iter_active_mut(&mut self) -> impl Iterator<Item = (usize, &mut Pattern)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter(|(_, s)| s.active)
            .filter_map(|(i, s)| s.pattern.as_deref_mut().map(|p| (i, p)))
    }

    /// Drop every pattern. Slots open in an editor are kept; returns false
    /// if any were.
    pub fn clear(&mut self, bus: &mut MasterMidiBus) -> bool {
        let mut all = true;
        for slot in 0..MAX_PATTERNS {
            if self.slots[slot].pattern.is_some() && !self.delete(slot, bus) {
                all = false;
            }
        }
        all
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
