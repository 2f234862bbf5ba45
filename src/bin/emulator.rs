//! Emulator binary - writes synthetic TOP COPPER blocks to a raw data file
//!
//! Usage:
//!   cargo run --bin emulator -- -o run0001.b2raw                  # Use defaults
//!   cargo run --bin emulator -- -f config.toml -o run0001.b2raw   # Use config file
//!   cargo run --bin emulator -- -o out.b2raw -n 10000 --seed 1    # Override count and seed

use clap::Parser;
use b2daq_rs::common::EmulatorArgs;
use b2daq_rs::config::Config;
use b2daq_rs::data_source_emulator::Emulator;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("b2daq_rs=info".parse()?))
        .init();

    let args = EmulatorArgs::parse();

    let config = Config::load_or_default(&args.common.config_file)?;
    let mut emulator_config = config.emulator;
    if let Some(events) = args.events {
        emulator_config.num_events = events;
    }
    if let Some(seed) = args.seed {
        emulator_config.seed = Some(seed);
    }

    info!(
        config_file = %args.common.config_file,
        output = %args.output.display(),
        events = emulator_config.num_events,
        scrods = emulator_config.scrod_ids.len(),
        "Emulator starting"
    );

    let mut emulator = Emulator::new(emulator_config)?;
    let footer = emulator.write_file(&args.output)?;

    println!(
        "Wrote {} blocks (events {}..={}) to {}",
        footer.total_blocks,
        footer.first_event_number,
        footer.last_event_number,
        args.output.display()
    );
    Ok(())
}
