//! The boundary to the MIDI driver.
//!
//! The engine never talks to ALSA, JACK or CoreMIDI directly. A driver hands
//! the master bus a set of output and input ports implementing these traits;
//! [`crate::midir_bus`] is the stock implementation.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to initialise MIDI client: {0}")]
    Init(String),
    #[error("failed to connect to port '{port}': {reason}")]
    Connect { port: String, reason: String },
    #[error("failed to send MIDI: {0}")]
    Send(String),
    #[error("port info unavailable: {0}")]
    PortInfo(String),
}

/// One output port of the driver.
pub trait OutputPort: Send {
    fn name(&self) -> &str;

    /// Send one complete message.
    fn send(&mut self, message: &[u8]) -> Result<(), BusError>;

    /// Push any buffered output to the device.
    fn flush(&mut self) -> Result<(), BusError> {
        Ok(())
    }
}

/// One input port of the driver.
///
/// Input is polled: the driver buffers complete messages until the input
/// loop drains them with [`InputPort::receive`].
pub trait InputPort: Send {
    fn name(&self) -> &str;

    /// Start or stop delivering messages from this port.
    fn set_enabled(&mut self, enabled: bool) -> Result<(), BusError>;

    /// Number of complete messages waiting.
    fn pending(&self) -> usize;

    /// Take the next waiting message, if any.
    fn receive(&mut self) -> Option<Vec<u8>>;
}
