//! Unpacker binary - decodes a raw data file and calibrates TOP digits
//!
//! Usage:
//!   cargo run --bin unpacker -- run0001.b2raw                        # Uncalibrated
//!   cargo run --bin unpacker -- run0001.b2raw -c payloads.json       # With payloads
//!   cargo run --bin unpacker -- -f config.toml run0001.b2raw --json  # JSON summary

use clap::Parser;
use b2daq_rs::common::{setup_shutdown, UnpackerArgs};
use b2daq_rs::config::Config;
use b2daq_rs::pipeline::{build_registry, Pipeline, PipelineSummary};
use b2daq_rs::recorder::open_raw_file;
use b2daq_rs::top::ConditionsStore;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("b2daq_rs=info".parse()?))
        .init();

    let args = UnpackerArgs::parse();

    let mut config = Config::load_or_default(&args.common.config_file)?;
    if let Some(workers) = args.workers {
        config.pipeline.workers = workers.max(1);
    }
    if let Some(path) = &args.calibration {
        config.calibration.payloads = Some(path.clone());
    }

    let conditions = match &config.calibration.payloads {
        Some(path) => {
            let store = ConditionsStore::load(path)?;
            info!(path = %path.display(), payloads = store.len(), "Loaded calibration payloads");
            store
        }
        None => {
            info!("No calibration payloads, running uncalibrated");
            ConditionsStore::new()
        }
    };

    let mut reader = open_raw_file(&args.input)?;
    match reader.read_footer() {
        Ok(footer) if footer.is_complete() => {
            info!(blocks = footer.total_blocks, "Input file complete");
        }
        Ok(_) => warn!("Input file footer marks an incomplete write"),
        Err(e) => warn!(error = %e, "Input file has no footer, reading until the first bad record"),
    }
    if let Some(header) = reader.header() {
        info!(
            input = %args.input.display(),
            exp = header.exp_number,
            run = header.run_number,
            "Opened input"
        );
    }

    let registry = build_registry(&config, conditions.into_shared());
    let pipeline = Pipeline::new(config.pipeline.clone(), registry);
    let (_shutdown_tx, shutdown_rx) = setup_shutdown();

    let summary = pipeline.run(reader.into_data_blocks(), shutdown_rx).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn print_summary(summary: &PipelineSummary) {
    let c = &summary.counters;
    println!("=== Blocks ===");
    println!("  Received:        {}", c.blocks_received);
    println!("  Processed:       {}", c.blocks_processed);
    println!("  Quarantined:     {}", c.blocks_quarantined);
    println!("  Sequence issues: {}", c.sequence_issues);
    println!("  Runs:            {:?}", summary.runs);
    println!();
    println!("=== TOP ===");
    println!("  Raw hits:        {}", c.raw_hits);
    println!("  Digits good:     {}", summary.digits_good);
    println!("  Digits junk:     {}", summary.digits_junk);
    println!("  Digits cal:      {}", summary.digits_cal_pulse);
    println!("  Calibrated:      {}", summary.digits_fully_calibrated);
    if !summary.issue_counts.is_empty() {
        println!();
        println!("=== Unpack issues ===");
        for (kind, count) in &summary.issue_counts {
            println!("  {:<24} {}", kind, count);
        }
    }
    if !summary.quarantined.is_empty() {
        println!();
        println!("=== Quarantined (first {}) ===", summary.quarantined.len().min(10));
        for q in summary.quarantined.iter().take(10) {
            println!(
                "  #{:<8} event {:<10} node 0x{:08x}  {}",
                q.index, q.event_number, q.node_id, q.reason
            );
        }
    }
    if let Some(e) = &summary.read_error {
        println!();
        println!("Input ended early: {}", e);
    }
    println!();
    println!(
        "Elapsed {:.2} s ({:.0} blocks/s)",
        summary.elapsed_secs,
        c.blocks_received as f64 / summary.elapsed_secs.max(1e-9)
    );
}
