//! MIDI protocol constants and the event type moved through the engine.
//!
//! Real-time and system messages follow the MIDI 1.0 specification. Channel
//! messages are stored with the channel nibble stripped inside patterns; the
//! channel is re-applied by the output bus when the event is played.

use midly::live::{LiveEvent, SystemCommon, SystemRealtime};
use midly::MidiMessage;

/// A position on the transport, in pulses (ticks).
pub type Pulse = i64;

/// Note Off, channel nibble clear
pub const NOTE_OFF: u8 = 0x80;

/// Note On, channel nibble clear
pub const NOTE_ON: u8 = 0x90;

/// Polyphonic aftertouch
pub const AFTERTOUCH: u8 = 0xA0;

/// Control change
pub const CONTROL_CHANGE: u8 = 0xB0;

/// Program change (one data byte)
pub const PROGRAM_CHANGE: u8 = 0xC0;

/// Channel pressure (one data byte)
pub const CHANNEL_PRESSURE: u8 = 0xD0;

/// Pitch wheel
pub const PITCH_WHEEL: u8 = 0xE0;

/// Start of a System Exclusive message
pub const SYSEX: u8 = 0xF0;

/// End of a System Exclusive message
pub const SYSEX_END: u8 = 0xF7;

/// Song Position Pointer, two data bytes (LSB, MSB) in MIDI beats
pub const SONG_POSITION: u8 = 0xF2;

/// MIDI Clock tick - sent 24 times per quarter note (24 ppqn)
pub const MIDI_CLOCK: u8 = 0xF8;

/// MIDI Start - resets position to beginning and starts playback
pub const MIDI_START: u8 = 0xFA;

/// MIDI Continue - resumes playback from current position
pub const MIDI_CONTINUE: u8 = 0xFB;

/// MIDI Stop - stops playback, maintains current position
pub const MIDI_STOP: u8 = 0xFC;

/// Number of MIDI clock pulses per quarter note (beat)
pub const CLOCKS_PER_BEAT: u64 = 24;

/// Beats per bar (assuming 4/4 time signature)
pub const BEATS_PER_BAR: u64 = 4;

/// Number of MIDI channels.
pub const CHANNELS: u8 = 16;

/// A timestamped MIDI message.
///
/// `status` keeps the full status byte as received; patterns strip the
/// channel nibble on record. `sysex` is empty for everything except
/// System Exclusive, where it holds the complete `F0 .. F7` message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MidiEvent {
    pub timestamp: Pulse,
    pub status: u8,
    pub data: [u8; 2],
    pub sysex: Vec<u8>,
}

impl MidiEvent {
    pub fn new(timestamp: Pulse, status: u8, d0: u8, d1: u8) -> Self {
        Self {
            timestamp,
            status,
            data: [d0, d1],
            sysex: Vec::new(),
        }
    }

    pub fn note_on(timestamp: Pulse, note: u8, velocity: u8) -> Self {
        Self::new(timestamp, NOTE_ON, note & 0x7F, velocity & 0x7F)
    }

    pub fn note_off(timestamp: Pulse, note: u8, velocity: u8) -> Self {
        Self::new(timestamp, NOTE_OFF, note & 0x7F, velocity & 0x7F)
    }

    /// A single status-byte real-time message (clock, start, stop, ...).
    pub fn realtime(status: u8) -> Self {
        Self::new(0, status, 0, 0)
    }

    /// Parse one complete message as delivered by the driver.
    ///
    /// Returns `None` for empty or malformed input.
    pub fn from_bytes(timestamp: Pulse, bytes: &[u8]) -> Option<Self> {
        let first = *bytes.first()?;
        if first == SYSEX {
            return Some(Self {
                timestamp,
                status: SYSEX,
                data: [0, 0],
                sysex: bytes.to_vec(),
            });
        }

        let event = LiveEvent::parse(bytes).ok()?;
        let (status, d0, d1) = match event {
            LiveEvent::Midi { channel, message } => {
                let ch = channel.as_int();
                match message {
                    MidiMessage::NoteOff { key, vel } => (NOTE_OFF | ch, key.as_int(), vel.as_int()),
                    MidiMessage::NoteOn { key, vel } => (NOTE_ON | ch, key.as_int(), vel.as_int()),
                    MidiMessage::Aftertouch { key, vel } => {
                        (AFTERTOUCH | ch, key.as_int(), vel.as_int())
                    }
                    MidiMessage::Controller { controller, value } => {
                        (CONTROL_CHANGE | ch, controller.as_int(), value.as_int())
                    }
                    MidiMessage::ProgramChange { program } => (PROGRAM_CHANGE | ch, program.as_int(), 0),
                    MidiMessage::ChannelAftertouch { vel } => (CHANNEL_PRESSURE | ch, vel.as_int(), 0),
                    MidiMessage::PitchBend { bend } => {
                        let value = bend.0.as_int();
                        (PITCH_WHEEL | ch, (value & 0x7F) as u8, ((value >> 7) & 0x7F) as u8)
                    }
                }
            }
            LiveEvent::Common(SystemCommon::SongPosition(beats)) => {
                let value = beats.as_int();
                (SONG_POSITION, (value & 0x7F) as u8, ((value >> 7) & 0x7F) as u8)
            }
            LiveEvent::Common(_) => (first, 0, 0),
            LiveEvent::Realtime(rt) => match rt {
                SystemRealtime::TimingClock => (MIDI_CLOCK, 0, 0),
                SystemRealtime::Start => (MIDI_START, 0, 0),
                SystemRealtime::Continue => (MIDI_CONTINUE, 0, 0),
                SystemRealtime::Stop => (MIDI_STOP, 0, 0),
                _ => (first, 0, 0),
            },
        };
        Some(Self::new(timestamp, status, d0, d1))
    }

    /// Status with the channel nibble removed (channel messages only).
    pub fn kind(&self) -> u8 {
        if self.is_channel_message() {
            self.status & 0xF0
        } else {
            self.status
        }
    }

    pub fn channel(&self) -> u8 {
        self.status & 0x0F
    }

    pub fn is_channel_message(&self) -> bool {
        (0x80..SYSEX).contains(&self.status)
    }

    pub fn is_note_on(&self) -> bool {
        self.kind() == NOTE_ON
    }

    pub fn is_note_off(&self) -> bool {
        self.kind() == NOTE_OFF
    }

    pub fn note(&self) -> u8 {
        self.data[0]
    }

    /// Data bytes that follow the status byte on the wire.
    pub fn data_len(&self) -> usize {
        match self.kind() {
            PROGRAM_CHANGE | CHANNEL_PRESSURE => 1,
            SONG_POSITION => 2,
            k if k < SYSEX => 2,
            _ => 0,
        }
    }

    /// Encode for the wire, applying `channel` to channel messages.
    ///
    /// Returns the number of bytes written into `out`.
    pub fn encode(&self, channel: u8, out: &mut [u8; 3]) -> usize {
        out[0] = if self.is_channel_message() {
            self.kind() | (channel & 0x0F)
        } else {
            self.status
        };
        let len = self.data_len();
        out[1..=len].copy_from_slice(&self.data[..len]);
        len + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_note_on_keeps_channel() {
        let ev = MidiEvent::from_bytes(5, &[0x93, 60, 100]).unwrap();
        assert_eq!(ev.status, 0x93);
        assert_eq!(ev.kind(), NOTE_ON);
        assert_eq!(ev.channel(), 3);
        assert_eq!(ev.data, [60, 100]);
        assert_eq!(ev.timestamp, 5);
    }

    #[test]
    fn test_parse_realtime() {
        assert_eq!(MidiEvent::from_bytes(0, &[MIDI_CLOCK]).unwrap().status, MIDI_CLOCK);
        assert_eq!(MidiEvent::from_bytes(0, &[MIDI_START]).unwrap().status, MIDI_START);
        assert_eq!(MidiEvent::from_bytes(0, &[MIDI_STOP]).unwrap().status, MIDI_STOP);
    }

    #[test]
    fn test_parse_song_position() {
        // 200 beats = 0x48 LSB, 0x01 MSB
        let ev = MidiEvent::from_bytes(0, &[SONG_POSITION, 0x48, 0x01]).unwrap();
        assert_eq!(ev.status, SONG_POSITION);
        assert_eq!(ev.data, [0x48, 0x01]);
    }

    #[test]
    fn test_parse_sysex_keeps_bytes() {
        let ev = MidiEvent::from_bytes(0, &[0xF0, 0x7E, 0x01, 0xF7]).unwrap();
        assert_eq!(ev.status, SYSEX);
        assert_eq!(ev.sysex, vec![0xF0, 0x7E, 0x01, 0xF7]);
    }

    #[test]
    fn test_empty_message_ignored() {
        assert!(MidiEvent::from_bytes(0, &[]).is_none());
    }

    #[test]
    fn test_encode_applies_channel() {
        let ev = MidiEvent::note_on(0, 64, 90);
        let mut buf = [0u8; 3];
        let n = ev.encode(9, &mut buf);
        assert_eq!(&buf[..n], &[0x99, 64, 90]);

        let pc = MidiEvent::new(0, PROGRAM_CHANGE, 12, 0);
        let n = pc.encode(1, &mut buf);
        assert_eq!(&buf[..n], &[0xC1, 12]);

        let clock = MidiEvent::realtime(MIDI_CLOCK);
        let n = clock.encode(4, &mut buf);
        assert_eq!(&buf[..n], &[MIDI_CLOCK]);
    }
}
