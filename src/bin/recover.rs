//! b2raw-recover - Integrity and recovery tool for raw data files
//!
//! Usage:
//!   recover validate <file>                          - Check file integrity
//!   recover info <file>                              - Show file metadata and block summary
//!   recover recover <file> [--output <path>]         - Rewrite readable blocks with a footer
//!   recover list <directory> [--recursive]           - List all .b2raw files with status
//!   recover reduce <file> [--output <path>]          - Write the reduced form of every block

use std::path::{Path, PathBuf};

use b2daq_rs::rawdata::{copy_reduced, CopperBlock};
use b2daq_rs::recorder::{open_raw_file, FileValidationResult, RawFileWriter};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

const RAW_EXTENSION: &str = "b2raw";

#[derive(Parser)]
#[command(name = "recover")]
#[command(about = "Integrity and recovery tool for raw data files")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate file integrity
    Validate {
        /// Path to the .b2raw file
        file: PathBuf,
    },

    /// Show file metadata
    Info {
        /// Path to the .b2raw file
        file: PathBuf,
    },

    /// Recover blocks from an incomplete file
    Recover {
        /// Path to the .b2raw file
        file: PathBuf,

        /// Output path (default: <input>_recovered.b2raw)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List all .b2raw files in a directory
    List {
        /// Directory to scan
        directory: PathBuf,

        /// Include subdirectories
        #[arg(short, long)]
        recursive: bool,
    },

    /// Strip COPPER and B2L framing from every block
    Reduce {
        /// Path to the .b2raw file
        file: PathBuf,

        /// Output path (default: <input>_reduced.b2raw)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

type ToolResult<T> = Result<T, Box<dyn std::error::Error>>;

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Validate { file } => validate_file(&file),
        Commands::Info { file } => show_info(&file),
        Commands::Recover { file, output } => recover_file(&file, output),
        Commands::List {
            directory,
            recursive,
        } => list_files(&directory, recursive),
        Commands::Reduce { file, output } => reduce_file(&file, output),
    };
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn format_time_ns(ns: u64) -> String {
    match DateTime::<Utc>::from_timestamp((ns / 1_000_000_000) as i64, (ns % 1_000_000_000) as u32)
    {
        Some(t) if ns > 0 => t.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        _ => "-".to_string(),
    }
}

fn validate_file(path: &Path) -> ToolResult<()> {
    println!("Validating: {}", path.display());
    println!();

    let mut reader = open_raw_file(path)?;
    let result = reader.validate();
    print_validation_result(&result);

    if result.is_valid {
        println!("\n\x1b[32m✓ File is valid\x1b[0m");
    } else if result.needs_recovery() {
        println!("\n\x1b[33m⚠ File needs recovery\x1b[0m");
        println!("  Run: recover recover \"{}\"", path.display());
    } else {
        println!("\n\x1b[31m✗ File is corrupted\x1b[0m");
    }

    Ok(())
}

fn show_info(path: &Path) -> ToolResult<()> {
    let mut reader = open_raw_file(path)?;

    println!("File: {}", path.display());
    println!("Size: {} bytes", std::fs::metadata(path)?.len());
    println!();

    if let Some(header) = reader.header() {
        println!("=== Header ===");
        println!("  Version:        {}", header.version);
        println!(
            "  Exp/Run/Subrun: {}/{}/{}",
            header.exp_number, header.run_number, header.subrun_number
        );
        println!("  File Sequence:  {}", header.file_sequence);
        println!("  Comment:        {}", header.comment);
        println!("  Start Time:     {}", format_time_ns(header.file_start_time_ns));
        if !header.node_ids.is_empty() {
            let ids: Vec<String> = header.node_ids.iter().map(|n| format!("0x{:08x}", n)).collect();
            println!("  Node IDs:       {}", ids.join(", "));
        }
        if !header.metadata.is_empty() {
            println!("  Metadata:       {:?}", header.metadata);
        }
    }

    println!();
    println!("=== Footer ===");
    match reader.read_footer() {
        Ok(footer) => {
            println!("  Complete:       {}", footer.is_complete());
            println!("  Total Blocks:   {}", footer.total_blocks);
            println!("  Data Bytes:     {}", footer.data_bytes);
            println!("  Checksum:       {:016x}", footer.data_checksum);
            println!(
                "  Event Range:    {} - {}",
                footer.first_event_number, footer.last_event_number
            );
            println!("  End Time:       {}", format_time_ns(footer.file_end_time_ns));
        }
        Err(e) => {
            println!("  \x1b[33mCould not read footer: {}\x1b[0m", e);
        }
    }

    // Block-level scan: decode each RawHeader and run the structural checks
    let mut blocks = 0u64;
    let mut malformed = 0u64;
    let mut runs: Vec<(u32, u32)> = Vec::new();
    for record in reader.data_blocks() {
        let words = match record {
            Ok(words) => words,
            Err(e) => {
                println!("  \x1b[33mScan stopped after {} blocks: {}\x1b[0m", blocks, e);
                break;
            }
        };
        blocks += 1;
        match CopperBlock::new(&words) {
            Ok(block) if block.validate().is_ok() => {
                let run = (block.exp_no(), block.run_no());
                if !runs.contains(&run) {
                    runs.push(run);
                }
            }
            _ => malformed += 1,
        }
    }
    println!();
    println!("=== Blocks ===");
    println!("  Scanned:        {}", blocks);
    println!("  Malformed:      {}", malformed);
    println!("  Runs:           {:?}", runs);

    Ok(())
}

fn recover_file(input_path: &Path, output_path: Option<PathBuf>) -> ToolResult<()> {
    println!("Recovering: {}", input_path.display());

    let mut reader = open_raw_file(input_path)?;
    let result = reader.validate();

    if result.is_valid {
        println!("\x1b[32m✓ File is already valid, no recovery needed\x1b[0m");
        return Ok(());
    }
    if !result.needs_recovery() {
        return Err("No recoverable data found".into());
    }

    println!(
        "  Found {} recoverable blocks ({} words)",
        result.recoverable_blocks, result.recoverable_words
    );

    let output = output_path.unwrap_or_else(|| {
        let stem = input_path.file_stem().unwrap_or_default().to_string_lossy();
        let parent = input_path.parent().unwrap_or(Path::new("."));
        parent.join(format!("{}_recovered.{}", stem, RAW_EXTENSION))
    });
    println!("  Output: {}", output.display());

    let header = result.header.clone().ok_or("No header found")?;
    let mut writer = RawFileWriter::create(&output, &header)?;

    for (index, record) in reader.data_blocks().enumerate() {
        match record {
            Ok(words) => writer.write_block(&words)?,
            Err(e) => {
                println!("  \x1b[33mStopped at block {}: {}\x1b[0m", index, e);
                break;
            }
        }
    }
    let footer = writer.finish()?;

    println!();
    println!("\x1b[32m✓ Recovery complete\x1b[0m");
    println!("  Blocks written: {}", footer.total_blocks);
    println!("  Output size:    {} bytes", std::fs::metadata(&output)?.len());

    Ok(())
}

fn reduce_file(input_path: &Path, output_path: Option<PathBuf>) -> ToolResult<()> {
    println!("Reducing: {}", input_path.display());

    let mut reader = open_raw_file(input_path)?;
    let header = reader.header().cloned().ok_or("No header found")?;

    let output = output_path.unwrap_or_else(|| {
        let stem = input_path.file_stem().unwrap_or_default().to_string_lossy();
        let parent = input_path.parent().unwrap_or(Path::new("."));
        parent.join(format!("{}_reduced.{}", stem, RAW_EXTENSION))
    });
    println!("  Output: {}", output.display());

    let mut writer = RawFileWriter::create(&output, &header)?;
    let mut words_in = 0u64;
    let mut words_out = 0u64;
    let mut skipped = 0u64;
    let mut reduced = Vec::new();
    for (index, record) in reader.data_blocks().enumerate() {
        let words = match record {
            Ok(words) => words,
            Err(e) => {
                println!("  \x1b[33mStopped at block {}: {}\x1b[0m", index, e);
                break;
            }
        };
        reduced.clear();
        match CopperBlock::new(&words).and_then(|block| copy_reduced(&block, &mut reduced)) {
            Ok(n) => {
                words_in += words.len() as u64;
                words_out += n as u64;
                writer.write_block(&reduced)?;
            }
            Err(e) => {
                println!("  \x1b[33mSkipped block {}: {}\x1b[0m", index, e);
                skipped += 1;
            }
        }
    }
    let footer = writer.finish()?;

    println!();
    println!("\x1b[32m✓ Reduction complete\x1b[0m");
    println!("  Blocks written: {}", footer.total_blocks);
    println!("  Blocks skipped: {}", skipped);
    if words_in > 0 {
        println!(
            "  Words:          {} -> {} ({:.1}%)",
            words_in,
            words_out,
            100.0 * words_out as f64 / words_in as f64
        );
    }

    Ok(())
}

fn list_files(directory: &Path, recursive: bool) -> ToolResult<()> {
    println!("Scanning: {}", directory.display());
    println!();

    let mut files = Vec::new();
    collect_raw_files(directory, recursive, &mut files)?;

    if files.is_empty() {
        println!("No .{} files found", RAW_EXTENSION);
        return Ok(());
    }

    println!(
        "{:<50} {:>12} {:>10} {:>8}",
        "File", "Blocks", "Size (MB)", "Status"
    );
    println!("{}", "-".repeat(84));

    let mut total_blocks = 0u64;
    let mut total_size = 0u64;
    let mut valid_count = 0;
    let mut needs_recovery_count = 0;
    let mut corrupted_count = 0;

    for path in &files {
        let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        total_size += size;

        let (blocks, status) = match open_raw_file(path) {
            Ok(mut reader) => {
                let result = reader.validate();
                let blocks = result.recoverable_blocks as u64;
                let status = if result.is_valid {
                    valid_count += 1;
                    total_blocks += blocks;
                    "\x1b[32m✓ Valid\x1b[0m"
                } else if result.needs_recovery() {
                    needs_recovery_count += 1;
                    total_blocks += blocks;
                    "\x1b[33m⚠ Needs recovery\x1b[0m"
                } else {
                    corrupted_count += 1;
                    "\x1b[31m✗ Corrupted\x1b[0m"
                };
                (blocks, status)
            }
            Err(_) => {
                corrupted_count += 1;
                (0, "\x1b[31m✗ Unreadable\x1b[0m")
            }
        };

        let filename = path.file_name().unwrap_or_default().to_string_lossy();
        let filename_display = if filename.len() > 48 {
            format!("...{}", &filename[filename.len() - 45..])
        } else {
            filename.to_string()
        };

        println!(
            "{:<50} {:>12} {:>10.2} {}",
            filename_display,
            blocks,
            size as f64 / 1_000_000.0,
            status
        );
    }

    println!("{}", "-".repeat(84));
    println!(
        "Total: {} files, {} blocks, {:.2} MB",
        files.len(),
        total_blocks,
        total_size as f64 / 1_000_000.0
    );
    println!(
        "Status: {} valid, {} needs recovery, {} corrupted",
        valid_count, needs_recovery_count, corrupted_count
    );

    Ok(())
}

fn collect_raw_files(
    dir: &Path,
    recursive: bool,
    files: &mut Vec<PathBuf>,
) -> Result<(), std::io::Error> {
    if !dir.is_dir() {
        return Ok(());
    }

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            if path.extension().is_some_and(|ext| ext == RAW_EXTENSION) {
                files.push(path);
            }
        } else if recursive && path.is_dir() {
            collect_raw_files(&path, recursive, files)?;
        }
    }

    files.sort();
    Ok(())
}

fn print_validation_result(result: &FileValidationResult) {
    println!("=== Validation Result ===");
    println!("  Valid:              {}", result.is_valid);
    println!("  Recoverable blocks: {}", result.recoverable_blocks);
    println!("  Recoverable words:  {}", result.recoverable_words);

    if !result.errors.is_empty() {
        println!("  Errors:");
        for error in &result.errors {
            println!("    - {}", error);
        }
    }
}
