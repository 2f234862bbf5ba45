//! CLI argument parsing for the b2daq tools
//!
//! # Design Principles (KISS)
//! - Use clap's derive macro for declarative argument definition
//! - Common arguments shared via composition, not inheritance
//! - Each binary has its own Args struct that embeds CommonArgs

use std::path::PathBuf;

use clap::Parser;

/// Arguments shared by all tools
#[derive(Parser, Debug, Clone)]
pub struct CommonArgs {
    /// Path to configuration file (defaults are used when it does not exist)
    #[arg(short = 'f', long = "config", default_value = "config.toml")]
    pub config_file: String,
}

/// Arguments for the emulator (synthetic raw file writer)
#[derive(Parser, Debug, Clone)]
#[command(name = "emulator", about = "Write synthetic TOP COPPER blocks to a raw data file")]
pub struct EmulatorArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Output file
    #[arg(short = 'o', long = "output")]
    pub output: PathBuf,

    /// Number of events (overrides config)
    #[arg(short = 'n', long = "events")]
    pub events: Option<u64>,

    /// Random seed (overrides config)
    #[arg(long)]
    pub seed: Option<u64>,
}

/// Arguments for the unpacker (raw file → TOP digits)
#[derive(Parser, Debug, Clone)]
#[command(name = "unpacker", about = "Unpack and calibrate TOP data from a raw data file")]
pub struct UnpackerArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Input raw data file
    pub input: PathBuf,

    /// Calibration payload file (JSON, overrides config)
    #[arg(short = 'c', long = "calibration")]
    pub calibration: Option<PathBuf>,

    /// Number of worker tasks (overrides config)
    #[arg(short = 'w', long = "workers")]
    pub workers: Option<usize>,

    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,
}
