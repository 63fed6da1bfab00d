//! Keyboard bindings for slots and mute groups.
//!
//! The engine only stores them. Each binding is kept in both directions so
//! a UI can ask "which slot does this key toggle" and "which key shows on
//! this slot"; rebinding a key or a slot drops its previous pairing.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
struct BiMap {
    by_key: BTreeMap<u32, usize>,
    by_slot: BTreeMap<usize, u32>,
}

impl BiMap {
    fn bind(&mut self, keycode: u32, slot: usize) {
        if let Some(old_slot) = self.by_key.remove(&keycode) {
            self.by_slot.remove(&old_slot);
        }
        if let Some(old_key) = self.by_slot.remove(&slot) {
            self.by_key.remove(&old_key);
        }
        self.by_key.insert(keycode, slot);
        self.by_slot.insert(slot, keycode);
    }

    fn clear(&mut self) {
        self.by_key.clear();
        self.by_slot.clear();
    }
}

#[derive(Debug, Clone, Default)]
pub struct KeyBindings {
    events: BiMap,
    groups: BiMap,
}

impl KeyBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_key_event(&mut self, keycode: u32, slot: usize) {
        self.events.bind(keycode, slot);
    }

    pub fn set_key_group(&mut self, keycode: u32, group: usize) {
        self.groups.bind(keycode, group);
    }

    pub fn lookup_keyevent_seq(&self, keycode: u32) -> Option<usize> {
        self.events.by_key.get(&keycode).copied()
    }

    pub fn lookup_keyevent_key(&self, slot: usize) -> Option<u32> {
        self.events.by_slot.get(&slot).copied()
    }

    pub fn lookup_keygroup_group(&self, keycode: u32) -> Option<usize> {
        self.groups.by_key.get(&keycode).copied()
    }

    pub fn lookup_keygroup_key(&self, group: usize) -> Option<u32> {
        self.groups.by_slot.get(&group).copied()
    }

    /// Replace every slot binding.
    pub fn set_all_key_events(&mut self, bindings: impl IntoIterator<Item = (u32, usize)>) {
        self.events.clear();
        for (key, slot) in bindings {
            self.events.bind(key, slot);
        }
    }

    /// Replace every group binding.
    pub fn set_all_key_groups(&mut self, bindings: impl IntoIterator<Item = (u32, usize)>) {
        self.groups.clear();
        for (key, group) in bindings {
            self.groups.bind(key, group);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_both_ways() {
        let mut keys = KeyBindings::new();
        keys.set_key_event('q' as u32, 4);
        assert_eq!(keys.lookup_keyevent_seq('q' as u32), Some(4));
        assert_eq!(keys.lookup_keyevent_key(4), Some('q' as u32));
    }

    #[test]
    fn test_rebinding_drops_old_pairs() {
        let mut keys = KeyBindings::new();
        keys.set_key_event(1, 10);
        keys.set_key_event(2, 20);
        keys.set_key_event(1, 20);
        assert_eq!(keys.lookup_keyevent_seq(1), Some(20));
        assert_eq!(keys.lookup_keyevent_seq(2), None);
        assert_eq!(keys.lookup_keyevent_key(10), None);
    }

    #[test]
    fn test_groups_are_separate() {
        let mut keys = KeyBindings::new();
        keys.set_key_event(7, 0);
        keys.set_all_key_groups([(7, 3), (8, 4)]);
        assert_eq!(keys.lookup_keygroup_group(7), Some(3));
        assert_eq!(keys.lookup_keyevent_seq(7), Some(0));
        assert_eq!(keys.lookup_keygroup_key(4), Some(8));
    }
}
