//! `midir` ports behind the driver traits.
//!
//! Every system port is opened, outputs in port order and inputs in port
//! order, so bus numbers match what `--list` prints. Input arrives on the
//! driver's callback thread and is queued on a bounded channel until the
//! input loop polls it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use midir::{Ignore, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use tracing::{info, warn};

use crate::transport::{BusError, InputPort, OutputPort};

const CLIENT_NAME: &str = "seqperf";

/// Messages buffered per input port before new ones are dropped.
const INPUT_QUEUE: usize = 1024;

pub struct MidirOutput {
    connection: MidiOutputConnection,
    name: String,
}

impl OutputPort for MidirOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&mut self, message: &[u8]) -> Result<(), BusError> {
        self.connection
            .send(message)
            .map_err(|e| BusError::Send(e.to_string()))
    }
}

pub struct MidirInput {
    name: String,
    enabled: Arc<AtomicBool>,
    rx: Receiver<Vec<u8>>,
    _connection: MidiInputConnection<()>,
}

impl InputPort for MidirInput {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_enabled(&mut self, enabled: bool) -> Result<(), BusError> {
        self.enabled.store(enabled, Ordering::Release);
        if !enabled {
            while self.rx.try_recv().is_ok() {}
        }
        Ok(())
    }

    fn pending(&self) -> usize {
        self.rx.len()
    }

    fn receive(&mut self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }
}

fn forward(tx: &Sender<Vec<u8>>, enabled: &AtomicBool, message: &[u8]) {
    if !enabled.load(Ordering::Acquire) || message.is_empty() {
        return;
    }
    if let Err(TrySendError::Full(_)) = tx.try_send(message.to_vec()) {
        warn!("MIDI input queue full, dropping message");
    }
}

/// Names of all output and input ports, in bus order.
pub fn list_ports() -> Result<(Vec<String>, Vec<String>), BusError> {
    let midi_out =
        MidiOutput::new(CLIENT_NAME).map_err(|e| BusError::Init(e.to_string()))?;
    let midi_in = MidiInput::new(CLIENT_NAME).map_err(|e| BusError::Init(e.to_string()))?;

    let outputs = midi_out
        .ports()
        .iter()
        .map(|p| midi_out.port_name(p).map_err(|e| BusError::PortInfo(e.to_string())))
        .collect::<Result<Vec<_>, _>>()?;
    let inputs = midi_in
        .ports()
        .iter()
        .map(|p| midi_in.port_name(p).map_err(|e| BusError::PortInfo(e.to_string())))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((outputs, inputs))
}

/// Connect to every output port. A port that refuses the connection is
/// skipped with a warning.
pub fn open_outputs() -> Result<Vec<Box<dyn OutputPort>>, BusError> {
    let probe = MidiOutput::new(CLIENT_NAME).map_err(|e| BusError::Init(e.to_string()))?;
    let ports = probe.ports();
    let mut opened: Vec<Box<dyn OutputPort>> = Vec::with_capacity(ports.len());

    for port in &ports {
        let name = probe
            .port_name(port)
            .unwrap_or_else(|_| "Unknown".to_string());
        // each connection consumes its client
        let client = MidiOutput::new(CLIENT_NAME).map_err(|e| BusError::Init(e.to_string()))?;
        match client.connect(port, &format!("{}-out", CLIENT_NAME)) {
            Ok(connection) => {
                info!(bus = opened.len(), port = %name, "output connected");
                opened.push(Box::new(MidirOutput { connection, name }));
            }
            Err(e) => warn!(
                "{}",
                BusError::Connect {
                    port: name,
                    reason: e.to_string(),
                }
            ),
        }
    }
    Ok(opened)
}

/// Connect to every input port. Ports start disabled; enable them through
/// the master bus.
pub fn open_inputs() -> Result<Vec<Box<dyn InputPort>>, BusError> {
    let probe = MidiInput::new(CLIENT_NAME).map_err(|e| BusError::Init(e.to_string()))?;
    let ports = probe.ports();
    let mut opened: Vec<Box<dyn InputPort>> = Vec::with_capacity(ports.len());

    for port in &ports {
        let name = probe
            .port_name(port)
            .unwrap_or_else(|_| "Unknown".to_string());
        let mut client =
            MidiInput::new(CLIENT_NAME).map_err(|e| BusError::Init(e.to_string()))?;
        client.ignore(Ignore::None);

        let (tx, rx) = crossbeam_channel::bounded::<Vec<u8>>(INPUT_QUEUE);
        let enabled = Arc::new(AtomicBool::new(false));
        let gate = enabled.clone();
        let connection = client.connect(
            port,
            &format!("{}-in", CLIENT_NAME),
            move |_timestamp, message, _| forward(&tx, &gate, message),
            (),
        );
        match connection {
            Ok(connection) => {
                info!(bus = opened.len(), port = %name, "input connected");
                opened.push(Box::new(MidirInput {
                    name,
                    enabled,
                    rx,
                    _connection: connection,
                }));
            }
            Err(e) => warn!(
                "{}",
                BusError::Connect {
                    port: name,
                    reason: e.to_string(),
                }
            ),
        }
    }
    Ok(opened)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_respects_gate() {
        let (tx, rx) = crossbeam_channel::bounded(4);
        let gate = AtomicBool::new(false);
        forward(&tx, &gate, &[0xF8]);
        assert!(rx.is_empty());
        gate.store(true, Ordering::Release);
        forward(&tx, &gate, &[0xF8]);
        forward(&tx, &gate, &[]);
        assert_eq!(rx.try_recv().ok(), Some(vec![0xF8]));
        assert!(rx.is_empty());
    }

    #[test]
    fn test_forward_drops_when_full() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let gate = AtomicBool::new(true);
        forward(&tx, &gate, &[0xFA]);
        forward(&tx, &gate, &[0xFC]);
        assert_eq!(rx.len(), 1);
        assert_eq!(rx.try_recv().ok(), Some(vec![0xFA]));
    }
}
