//! Configuration persistence for the performance engine.
//!
//! Saves and loads engine configuration to/from YAML files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::bus::{ClockMode, DEFAULT_CLOCK_MOD};
use crate::clock::{choose_ppqn, clamp_bpm, DEFAULT_BPM, DEFAULT_PPQN};
use crate::control::SEQS_IN_SET;
use crate::midi::MidiEvent;
use crate::midi_control::{ControlKind, ControlOut, MidiControl, SeqAction, DEFAULT_CONTROL_OUT_BUS};
use crate::perform::{PerformOptions, PerformState, DEFAULT_TRIGGER_WIDTH_MS};

/// One MIDI-control binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlBinding {
    /// Control number: in-set slot, 32 + group, or a global action.
    pub slot: usize,
    pub kind: ControlKind,
    #[serde(flatten)]
    pub control: MidiControl,
}

/// One control-out feedback event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlOutEvent {
    pub slot: usize,
    pub action: SeqAction,
    pub status: u8,
    #[serde(default)]
    pub data0: u8,
    #[serde(default)]
    pub data1: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlOutConfig {
    #[serde(default = "default_control_out_bus")]
    pub bus: usize,
    #[serde(default)]
    pub events: Vec<ControlOutEvent>,
}

fn default_control_out_bus() -> usize {
    DEFAULT_CONTROL_OUT_BUS
}

/// Complete engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformConfig {
    pub ppqn: u32,
    pub bpm: f64,
    /// Output loop period in milliseconds
    pub trigger_width_ms: u64,
    /// Clock alignment for `mod` busses, in sixteenth notes
    pub clock_mod: u32,
    /// Request SCHED_FIFO for the engine threads
    pub priority: bool,
    pub stats: bool,
    pub show_midi: bool,
    pub pass_sysex: bool,
    pub filter_by_channel: bool,
    /// Clock mode per output bus; busses not listed stay `off`
    pub output_clocks: BTreeMap<usize, ClockMode>,
    /// Enabled flag per input bus; busses not listed stay disabled
    pub input_busses: BTreeMap<usize, bool>,
    pub midi_controls: Vec<ControlBinding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_out: Option<ControlOutConfig>,
    /// Mute groups: group number -> armed in-set slots
    pub mute_groups: BTreeMap<usize, Vec<usize>>,
    pub key_events: BTreeMap<u32, usize>,
    pub key_groups: BTreeMap<u32, usize>,
}

impl Default for PerformConfig {
    fn default() -> Self {
        Self {
            ppqn: DEFAULT_PPQN,
            bpm: DEFAULT_BPM,
            trigger_width_ms: DEFAULT_TRIGGER_WIDTH_MS,
            clock_mod: DEFAULT_CLOCK_MOD,
            priority: false,
            stats: false,
            show_midi: false,
            pass_sysex: false,
            filter_by_channel: false,
            output_clocks: BTreeMap::new(),
            input_busses: BTreeMap::new(),
            midi_controls: Vec::new(),
            control_out: None,
            mute_groups: BTreeMap::new(),
            key_events: BTreeMap::new(),
            key_groups: BTreeMap::new(),
        }
    }
}

impl PerformConfig {
    /// Get the default config file path.
    pub fn default_path() -> PathBuf {
        let project_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
        project_dir.join("seqperf.yaml")
    }

    /// Load configuration from a YAML file. A missing file gives defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config YAML {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let mut config: Self = serde_yaml::from_str(content)?;
        config.ppqn = choose_ppqn(config.ppqn);
        config.bpm = clamp_bpm(config.bpm);
        config.trigger_width_ms = config.trigger_width_ms.max(1);
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self).context("Failed to serialize config")?;

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file {}", path.display()))
    }

    /// Engine switches fixed at construction.
    pub fn options(&self) -> PerformOptions {
        PerformOptions {
            trigger_width_ms: self.trigger_width_ms,
            stats: self.stats,
            show_midi: self.show_midi,
            pass_sysex: self.pass_sysex,
            priority: self.priority,
        }
    }

    /// Apply bus, control, group and key settings to an engine.
    pub fn apply(&self, state: &mut PerformState) {
        let bus = state.master_bus_mut();
        bus.set_clock_mod(self.clock_mod);
        bus.set_filter_by_channel(self.filter_by_channel);
        for (&index, &mode) in &self.output_clocks {
            if !state.set_clock_bus(index, mode) {
                warn!(bus = index, "no such output bus");
            }
        }
        for (&index, &enabled) in &self.input_busses {
            if !state.set_input_bus(index, enabled) {
                warn!(bus = index, "no such input bus");
            }
        }

        for binding in &self.midi_controls {
            if !state.set_midi_control(binding.kind, binding.slot, binding.control) {
                warn!(control = binding.slot, "midi control out of range");
            }
        }

        state.set_control_out(self.control_out.as_ref().map(|cfg| {
            let mut out = ControlOut::new(cfg.bus);
            for ev in &cfg.events {
                let event = MidiEvent::new(0, ev.status, ev.data0, ev.data1);
                if !out.set_seq_event(ev.slot, ev.action, event) {
                    warn!(slot = ev.slot, "control-out slot out of range");
                }
            }
            out
        }));

        for (&group, armed) in &self.mute_groups {
            let mut states = [false; SEQS_IN_SET];
            for &track in armed {
                match states.get_mut(track) {
                    Some(s) => *s = true,
                    None => warn!(group, track, "mute group track out of range"),
                }
            }
            state.set_mute_group(group, states);
        }

        let keys = state.keys_mut();
        keys.set_all_key_events(self.key_events.iter().map(|(&k, &s)| (k, s)));
        keys.set_all_key_groups(self.key_groups.iter().map(|(&k, &g)| (k, g)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlStatus;
    use crate::mastermidibus::MasterMidiBus;
    use crate::midi_control::MOD_QUEUE;
    use crate::transport::testing::CapturePort;

    const SAMPLE: &str = r#"
ppqn: 96
bpm: 900
stats: true
output_clocks:
  0: mod
midi_controls:
  - slot: 70
    kind: on
    active: true
    status: 176
    data: 64
    min_value: 1
    max_value: 127
control_out:
  bus: 0
  events:
    - slot: 0
      action: play
      status: 144
      data0: 0
      data1: 127
mute_groups:
  2: [0, 5]
key_events:
  113: 0
unknown_key: 3
"#;

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = PerformConfig::load("/nonexistent/seqperf.yaml").unwrap();
        assert_eq!(config.ppqn, DEFAULT_PPQN);
        assert_eq!(config.bpm, DEFAULT_BPM);
        assert_eq!(config.trigger_width_ms, DEFAULT_TRIGGER_WIDTH_MS);
    }

    #[test]
    fn test_parse_and_clamp() {
        let config = PerformConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.ppqn, 96);
        assert_eq!(config.bpm, 500.0);
        assert!(config.options().stats);
        assert_eq!(config.output_clocks.get(&0), Some(&ClockMode::Mod));
        assert_eq!(config.midi_controls[0].kind, ControlKind::On);
        assert_eq!(config.midi_controls[0].control.data, 64);
    }

    #[test]
    fn test_save_then_load() {
        let path = std::env::temp_dir().join(format!("seqperf-test-{}.yaml", std::process::id()));
        let config = PerformConfig::from_yaml(SAMPLE).unwrap();
        config.save(&path).unwrap();
        let loaded = PerformConfig::load(&path).unwrap();
        let _ = fs::remove_file(&path);
        assert_eq!(loaded.mute_groups, config.mute_groups);
        assert_eq!(loaded.key_events, config.key_events);
        assert_eq!(loaded.control_out.unwrap().events.len(), 1);
    }

    #[test]
    fn test_apply() {
        let config = PerformConfig::from_yaml(SAMPLE).unwrap();
        let (port, sent) = CapturePort::new("out");
        let bus = MasterMidiBus::new(vec![Box::new(port)], vec![], config.ppqn, config.bpm);
        let mut state = PerformState::new(bus, config.options());
        config.apply(&mut state);

        assert_eq!(state.master_bus().get_clock(0), ClockMode::Mod);
        assert_eq!(state.keys().lookup_keyevent_seq(113), Some(0));

        state.handle_control_event(0xB0, 64, 100);
        assert!(state.control_status().intersects(ControlStatus::QUEUE));
        state.unset_sequence_control_status(ControlStatus::QUEUE);
        assert_eq!(
            state.midi_control(ControlKind::On, MOD_QUEUE).map(|c| c.active),
            Some(true)
        );

        state.new_sequence(5);
        state.select_and_mute_group(2);
        assert!(state.get_sequence(5).unwrap().playing());

        state.new_sequence(0);
        state.sequence_playing_on(0);
        assert!(sent.lock().contains(&vec![0x90, 0, 127]));
    }
}
