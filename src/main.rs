//! seqperf - headless pattern performer.
//!
//! Opens every MIDI port, applies the YAML configuration and runs the
//! engine's output and input threads until Enter is pressed.
//!
//! Usage: seqperf [--config <path>] [--list] [--play | --song] [--duration <secs>]

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use seqperf::midir_bus;
use seqperf::{MasterMidiBus, Perform, PerformConfig, PerformState};

fn arg_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn list_ports() -> Result<()> {
    let (outputs, inputs) = midir_bus::list_ports().context("Failed to list MIDI ports")?;
    println!("Output busses:");
    for (i, name) in outputs.iter().enumerate() {
        println!("  {}: {}", i, name);
    }
    println!("Input busses:");
    for (i, name) in inputs.iter().enumerate() {
        println!("  {}: {}", i, name);
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--list") {
        return list_ports();
    }

    let config_path = arg_value(&args, "--config")
        .map(PathBuf::from)
        .unwrap_or_else(PerformConfig::default_path);
    let config = PerformConfig::load(&config_path)?;
    info!(path = %config_path.display(), ppqn = config.ppqn, bpm = config.bpm, "configuration loaded");

    let outputs = midir_bus::open_outputs().context("Failed to open MIDI outputs")?;
    let inputs = midir_bus::open_inputs().context("Failed to open MIDI inputs")?;
    let bus = MasterMidiBus::new(outputs, inputs, config.ppqn, config.bpm);

    let mut state = PerformState::new(bus, config.options());
    config.apply(&mut state);

    let mut perform = Perform::new(state);
    perform.launch();

    if args.iter().any(|a| a == "--play") {
        perform.start(false);
    } else if args.iter().any(|a| a == "--song") {
        perform.start(true);
    }

    let duration_secs: Option<u64> = arg_value(&args, "--duration").and_then(|s| s.parse().ok());
    if let Some(secs) = duration_secs {
        info!("Running for {} seconds", secs);
        std::thread::sleep(Duration::from_secs(secs));
    } else {
        println!("Press Enter to quit (or use --duration <secs>)...");
        let mut input = String::new();
        io::stdin()
            .read_line(&mut input)
            .context("Failed to read stdin")?;
    }

    perform.stop();
    drop(perform);
    info!("shut down");
    Ok(())
}
