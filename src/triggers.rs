//! Song-mode triggers: the spans of the song timeline during which a pattern
//! plays.
//!
//! A trigger covers `[tick_start, tick_end]` inclusive. Its `offset` shifts
//! the phase of the pattern so that moving a trigger along the timeline keeps
//! the same musical content under it.

use crate::midi::Pulse;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trigger {
    pub tick_start: Pulse,
    pub tick_end: Pulse,
    pub offset: Pulse,
    pub selected: bool,
}

impl Trigger {
    pub fn contains(&self, tick: Pulse) -> bool {
        self.tick_start <= tick && tick <= self.tick_end
    }

    pub fn overlaps(&self, start: Pulse, end: Pulse) -> bool {
        self.tick_start <= end && start <= self.tick_end
    }
}

/// Ordered trigger list with undo/redo snapshots.
#[derive(Debug, Clone, Default)]
pub struct Triggers {
    list: Vec<Trigger>,
    undo: Vec<Vec<Trigger>>,
    redo: Vec<Vec<Trigger>>,
}

impl Triggers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self) -> &[Trigger] {
        &self.list
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Add a trigger of `len` pulses at `tick`, trimming anything it covers.
    pub fn add(&mut self, tick: Pulse, len: Pulse, offset: Pulse, pattern_len: Pulse) {
        let end = tick + len - 1;
        let mut kept = Vec::with_capacity(self.list.len() + 1);
        for t in self.list.drain(..) {
            if t.tick_start >= tick && t.tick_end <= end {
                continue;
            }
            let mut t = t;
            if t.tick_end >= end && t.tick_start <= end && t.tick_start >= tick {
                t.tick_start = end + 1;
            } else if t.tick_end >= tick && t.tick_end <= end && t.tick_start < tick {
                t.tick_end = tick - 1;
            } else if t.tick_start < tick && t.tick_end > end {
                // the new trigger lands inside this one: split around it
                kept.push(Trigger {
                    tick_end: tick - 1,
                    ..t
                });
                t.tick_start = end + 1;
            }
            kept.push(t);
        }
        kept.push(Trigger {
            tick_start: tick,
            tick_end: end,
            offset: adjust_offset(offset, pattern_len),
            selected: false,
        });
        kept.sort_by_key(|t| t.tick_start);
        self.list = kept;
    }

    /// True if some trigger covers `tick`.
    pub fn state_at(&self, tick: Pulse) -> bool {
        self.list.iter().any(|t| t.contains(tick))
    }

    /// The trigger covering `tick`, if any.
    pub fn at(&self, tick: Pulse) -> Option<&Trigger> {
        self.list.iter().find(|t| t.contains(tick))
    }

    pub fn delete_at(&mut self, tick: Pulse) -> bool {
        let before = self.list.len();
        self.list.retain(|t| !t.contains(tick));
        before != self.list.len()
    }

    /// Split the trigger under `tick` into two, the second starting at `tick`.
    pub fn split_at(&mut self, tick: Pulse) -> bool {
        let Some(pos) = self
            .list
            .iter()
            .position(|t| t.tick_start < tick && tick <= t.tick_end)
        else {
            return false;
        };
        let second = Trigger {
            tick_start: tick,
            selected: false,
            ..self.list[pos]
        };
        self.list[pos].tick_end = tick - 1;
        self.list.insert(pos + 1, second);
        true
    }

    pub fn select_at(&mut self, tick: Pulse) -> bool {
        let mut found = false;
        for t in self.list.iter_mut().filter(|t| t.contains(tick)) {
            t.selected = true;
            found = true;
        }
        found
    }

    /// Select every trigger overlapping `[start, end]`; returns how many.
    pub fn select_in_range(&mut self, start: Pulse, end: Pulse) -> usize {
        let mut count = 0;
        for t in self.list.iter_mut() {
            if t.overlaps(start, end) {
                t.selected = true;
                count += 1;
            }
        }
        count
    }

    pub fn unselect_all(&mut self) {
        for t in self.list.iter_mut() {
            t.selected = false;
        }
    }

    pub fn selected_count(&self) -> usize {
        self.list.iter().filter(|t| t.selected).count()
    }

    pub fn delete_selected(&mut self) {
        self.list.retain(|t| !t.selected);
    }

    /// End of the last trigger, or 0 with no triggers.
    pub fn max_tick(&self) -> Pulse {
        self.list.iter().map(|t| t.tick_end).max().unwrap_or(0)
    }

    /// Open (`forward`) or close a gap of `distance` pulses at `start`.
    ///
    /// Forward shifts everything at or after `start` right, splitting a
    /// trigger that straddles `start`. Backward removes the window
    /// `[start, start + distance)` and pulls later triggers left.
    pub fn shift(&mut self, start: Pulse, distance: Pulse, forward: bool, pattern_len: Pulse) {
        if distance <= 0 {
            return;
        }
        let end = start + distance;
        self.split_at(start);
        if !forward {
            self.split_at(end);
        }
        let mut shifted = Vec::with_capacity(self.list.len());
        for mut t in self.list.drain(..) {
            if forward {
                if t.tick_start >= start {
                    t.tick_start += distance;
                    t.tick_end += distance;
                    t.offset = adjust_offset(t.offset + distance, pattern_len);
                }
            } else if t.tick_start >= start && t.tick_start < end {
                continue;
            } else if t.tick_start >= end {
                t.tick_start -= distance;
                t.tick_end -= distance;
                t.offset = adjust_offset(t.offset - distance, pattern_len);
            }
            shifted.push(t);
        }
        self.list = shifted;
    }

    /// Duplicate the window `[start, start + distance)` immediately after
    /// itself, pushing later triggers right to make room.
    pub fn copy_window(&mut self, start: Pulse, distance: Pulse, pattern_len: Pulse) {
        if distance <= 0 {
            return;
        }
        self.shift(start, distance, true, pattern_len);
        let from_start = start + distance;
        let from_end = from_start + distance - 1;
        let copies: Vec<Trigger> = self
            .list
            .iter()
            .filter(|t| t.tick_start >= from_start && t.tick_start <= from_end)
            .map(|t| Trigger {
                tick_start: t.tick_start - distance,
                tick_end: t.tick_end.min(from_end) - distance,
                offset: adjust_offset(t.offset - distance, pattern_len),
                selected: false,
            })
            .collect();
        self.list.extend(copies);
        self.list.sort_by_key(|t| t.tick_start);
    }

    pub fn clear(&mut self) {
        self.list.clear();
    }

    pub fn push_undo(&mut self) {
        self.undo.push(self.list.clone());
        self.redo.clear();
    }

    pub fn pop_undo(&mut self) -> bool {
        match self.undo.pop() {
            Some(prev) => {
                self.redo.push(std::mem::replace(&mut self.list, prev));
                true
            }
            None => false,
        }
    }

    pub fn pop_redo(&mut self) -> bool {
        match self.redo.pop() {
            Some(next) => {
                self.undo.push(std::mem::replace(&mut self.list, next));
                true
            }
            None => false,
        }
    }

    pub fn have_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn have_redo(&self) -> bool {
        !self.redo.is_empty()
    }
}

/// Normalize an offset into `[0, pattern_len)`.
pub fn adjust_offset(offset: Pulse, pattern_len: Pulse) -> Pulse {
    if pattern_len > 0 {
        offset.rem_euclid(pattern_len)
    } else {
        0
    }
}
