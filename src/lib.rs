//! Pattern performance engine: a live MIDI sequencer core.
//!
//! Patterns live in numbered slots grouped into screen-sets. They are armed,
//! muted and queued from the API, from mute groups, or from MIDI control
//! messages, while an output thread plays them against wall-clock or
//! external MIDI clock and an input thread records and interprets incoming
//! MIDI.

pub mod bus;
pub mod clock;
pub mod config;
pub mod control;
pub mod input;
pub mod keys;
pub mod mastermidibus;
pub mod midi;
pub mod midi_control;
pub mod midir_bus;
pub mod output;
pub mod pattern;
pub mod perform;
pub mod registry;
pub mod rt;
pub mod transport;
pub mod triggers;

pub use bus::ClockMode;
pub use config::PerformConfig;
pub use control::{ControlStatus, PerformListener};
pub use mastermidibus::MasterMidiBus;
pub use midi::{MidiEvent, Pulse};
pub use pattern::Pattern;
pub use perform::{Perform, PerformOptions, PerformState};
