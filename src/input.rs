//! The input scheduling loop.
//!
//! Drains the master bus and dispatches each event: transport messages
//! drive the external-clock state, channel messages are recorded or matched
//! against the MIDI-control table, and SysEx is optionally passed through.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::clock::{clock_ticks_from_ppqn, pulses_per_sixteenth};
use crate::midi::{
    MidiEvent, Pulse, MIDI_CLOCK, MIDI_CONTINUE, MIDI_START, MIDI_STOP, SONG_POSITION, SYSEX,
};
use crate::perform::PerformState;

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Song Position Pointer data bytes to pulses.
pub fn song_position_to_pulses(lsb: u8, msb: u8, ppqn: u32) -> Pulse {
    let sixteenths = (Pulse::from(msb & 0x7F) << 7) | Pulse::from(lsb & 0x7F);
    sixteenths * pulses_per_sixteenth(ppqn)
}

/// Apply one incoming event to the engine.
pub fn handle_event(state: &mut PerformState, mut ev: MidiEvent, now: Instant) {
    if state.options.show_midi {
        debug!(status = ev.status, d0 = ev.data[0], d1 = ev.data[1], "midi in");
    }
    match ev.status {
        MIDI_START => {
            state.stop();
            state.start(false);
            state.midiclockrunning = true;
            state.usemidiclock = true;
            state.midiclocktick = 0;
            state.midiclockpos = Some(0);
            state.clock_meter.clear();
        }
        MIDI_CONTINUE => {
            state.midiclockrunning = true;
            state.start(false);
        }
        MIDI_STOP => {
            state.midiclockrunning = false;
            state.all_notes_off();
        }
        MIDI_CLOCK => {
            if state.midiclockrunning {
                state.midiclocktick += clock_ticks_from_ppqn(state.ppqn());
                if let Some(bpm) = state.clock_meter.push(now) {
                    state.measured_bpm = Some(bpm);
                }
            }
        }
        SONG_POSITION => {
            state.midiclockpos = Some(song_position_to_pulses(ev.data[0], ev.data[1], state.ppqn()));
        }
        SYSEX => {
            if state.options.pass_sysex {
                state.bus.sysex(&ev);
            }
        }
        _ if ev.is_channel_message() => {
            if state.bus.is_dumping() {
                ev.timestamp = state.tick;
                record(state, &ev);
            } else {
                state.handle_control_event(ev.status, ev.data[0], ev.data[1]);
            }
        }
        _ => {}
    }
}

/// Stream `ev` into the recording patterns. When filtering by channel the
/// first pattern that accepts the event takes it.
fn record(state: &mut PerformState, ev: &MidiEvent) {
    let filter = state.bus.filter_by_channel();
    let targets = state.bus.record_targets().to_vec();
    let PerformState { registry, bus, .. } = state;
    for slot in targets {
        if let Some(p) = registry.get_mut(slot) {
            if p.stream_event(ev, filter, bus) && filter {
                break;
            }
        }
    }
}

/// Body of the input thread. Returns once `inputting` is cleared.
pub fn input_func(state: Arc<Mutex<PerformState>>) {
    loop {
        {
            let mut st = state.lock();
            if !st.inputting {
                break;
            }
            while st.bus.is_more_input() {
                match st.bus.get_midi_event() {
                    Some(ev) => handle_event(&mut st, ev, Instant::now()),
                    None => break,
                }
            }
        }
        thread::sleep(POLL_INTERVAL);
    }
    info!("input loop exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlStatus;
    use crate::mastermidibus::MasterMidiBus;
    use crate::midi_control::{ControlKind, MidiControl, MOD_QUEUE};
    use crate::pattern::Pattern;
    use crate::perform::PerformOptions;
    use crate::transport::testing::{CapturePort, ScriptedInput, Sent};

    fn engine(options: PerformOptions) -> (PerformState, Sent) {
        let (port, sent) = CapturePort::new("out");
        let bus = MasterMidiBus::new(vec![Box::new(port)], vec![], 192, 120.0);
        (PerformState::new(bus, options), sent)
    }

    fn feed(state: &mut PerformState, bytes: &[u8]) {
        let ev = MidiEvent::from_bytes(0, bytes).unwrap();
        handle_event(state, ev, Instant::now());
    }

    #[test]
    fn test_start_slaves_to_external_clock() {
        let (mut state, _) = engine(PerformOptions::default());
        feed(&mut state, &[MIDI_START]);
        assert!(state.is_running());
        assert!(state.use_midi_clock());
        assert!(state.midi_clock_running());
        assert_eq!(state.midiclockpos, Some(0));
        feed(&mut state, &[MIDI_CLOCK]);
        feed(&mut state, &[MIDI_CLOCK]);
        assert_eq!(state.midiclocktick, 16);
    }

    #[test]
    fn test_clock_ignored_after_stop() {
        let (mut state, _) = engine(PerformOptions::default());
        feed(&mut state, &[MIDI_START]);
        feed(&mut state, &[MIDI_STOP]);
        feed(&mut state, &[MIDI_CLOCK]);
        assert_eq!(state.midiclocktick, 0);
        assert!(!state.midi_clock_running());
        feed(&mut state, &[MIDI_CONTINUE]);
        feed(&mut state, &[MIDI_CLOCK]);
        assert_eq!(state.midiclocktick, 8);
    }

    #[test]
    fn test_stop_silences_sounding_notes() {
        let (mut state, sent) = engine(PerformOptions::default());
        let mut p = Pattern::new(192);
        p.add_note(0, 100, 64, 90);
        state.install_sequence(p, 0);
        state.sequence_playing_on(0);
        state.start(false);
        state.play(10);
        feed(&mut state, &[MIDI_STOP]);
        assert_eq!(
            sent.lock().as_slice(),
            &[vec![0x90, 64, 90], vec![0x80, 64, 0]]
        );
        assert!(state.get_sequence(0).unwrap().playing());
    }

    #[test]
    fn test_song_position_in_sixteenths() {
        assert_eq!(song_position_to_pulses(0x10, 0x00, 192), 16 * 48);
        assert_eq!(song_position_to_pulses(0x00, 0x01, 192), 128 * 48);
        let (mut state, _) = engine(PerformOptions::default());
        feed(&mut state, &[SONG_POSITION, 4, 0]);
        assert_eq!(state.midiclockpos, Some(192));
    }

    #[test]
    fn test_recording_uses_engine_tick() {
        let (mut state, _) = engine(PerformOptions::default());
        state.install_sequence(Pattern::new(192), 3);
        state.set_sequence_input(3, true);
        state.tick = 800;
        feed(&mut state, &[0x91, 60, 100]);
        let events = state.get_sequence(3).unwrap().events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].timestamp, 800 - 768);
        assert_eq!(events[0].status, 0x90);
    }

    #[test]
    fn test_filter_by_channel_routes_to_matching_pattern() {
        let (mut state, _) = engine(PerformOptions::default());
        state.master_bus_mut().set_filter_by_channel(true);
        for (slot, ch) in [(0, 0), (1, 5)] {
            let mut p = Pattern::new(192);
            p.set_channel(ch);
            state.install_sequence(p, slot);
            state.set_sequence_input(slot, true);
        }
        feed(&mut state, &[0x95, 48, 100]);
        assert_eq!(state.get_sequence(0).unwrap().event_count(), 0);
        assert_eq!(state.get_sequence(1).unwrap().event_count(), 1);
    }

    #[test]
    fn test_control_when_not_recording() {
        let (mut state, _) = engine(PerformOptions::default());
        state.set_midi_control(
            ControlKind::On,
            MOD_QUEUE,
            MidiControl {
                active: true,
                inverse_active: true,
                status: 0xB0,
                data: 64,
                min_value: 64,
                max_value: 127,
            },
        );
        feed(&mut state, &[0xB0, 64, 127]);
        assert!(state.control_status().intersects(ControlStatus::QUEUE));
        feed(&mut state, &[0xB0, 64, 0]);
        assert_eq!(state.control_status(), ControlStatus::NONE);
    }

    #[test]
    fn test_sysex_pass_through() {
        let options = PerformOptions {
            pass_sysex: true,
            ..PerformOptions::default()
        };
        let (mut state, sent) = engine(options);
        feed(&mut state, &[0xF0, 0x7E, 0x01, 0xF7]);
        assert_eq!(sent.lock().as_slice(), &[vec![0xF0, 0x7E, 0x01, 0xF7]]);

        let (mut state, sent) = engine(PerformOptions::default());
        feed(&mut state, &[0xF0, 0x7E, 0x01, 0xF7]);
        assert!(sent.lock().is_empty());
    }

    #[test]
    fn test_input_loop_drains_and_exits() {
        let (input, script) = ScriptedInput::new("in");
        let bus = MasterMidiBus::new(vec![], vec![Box::new(input)], 192, 120.0);
        let mut state = PerformState::new(bus, PerformOptions::default());
        state.set_input_bus(0, true);
        script.lock().push_back(vec![MIDI_START]);
        let state = Arc::new(Mutex::new(state));

        let handle = {
            let state = state.clone();
            thread::spawn(move || input_func(state))
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        while !state.lock().is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(state.lock().is_running());
        state.lock().inputting = false;
        handle.join().unwrap();
    }
}
