//! dylink - a shared library cache link editor.
//!
//! Merge a set of dylibs into a single prelinked cache image.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use memmap2::Mmap;
use rayon::prelude::*;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use dylink::{BuilderConfig, CacheBuilder, CacheVMAddress, MachImage, PointerFormat};

/// A shared library cache link editor.
#[derive(Parser, Debug)]
#[command(name = "dylink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbosity (-v = info, -vv = debug, -vvv = trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build a cache image from a set of dylibs
    Build {
        /// Input dylibs, in placement order
        inputs: Vec<PathBuf>,

        /// Output path for the cache image
        #[arg(short, long)]
        output: PathBuf,

        /// Base VM address of the cache
        #[arg(long, default_value = "0x180000000", value_parser = parse_hex)]
        base: u64,

        /// Emit 32-bit cache offsets instead of 64-bit packed pointers
        #[arg(long)]
        pointers32: bool,
    },

    /// List the segments of an input dylib
    Segments {
        /// The dylib to inspect
        input: PathBuf,
    },
}

fn parse_hex(value: &str) -> std::result::Result<u64, String> {
    let trimmed = value.trim_start_matches("0x");
    u64::from_str_radix(trimmed, 16).map_err(|err| err.to_string())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Build {
            inputs,
            output,
            base,
            pointers32,
        } => build(inputs, output, base, pointers32),
        Commands::Segments { input } => segments(input),
    }
}

fn read_input(path: &PathBuf) -> Result<MachImage> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open '{}'", path.display()))?;
    // Inputs are read once and copied into the cache; mapping avoids
    // paying for files the build later rejects
    let mapped = unsafe { Mmap::map(&file) }
        .with_context(|| format!("failed to map '{}'", path.display()))?;
    MachImage::parse(mapped.to_vec())
        .with_context(|| format!("failed to parse '{}'", path.display()))
}

fn build(inputs: Vec<PathBuf>, output: PathBuf, base: u64, pointers32: bool) -> Result<()> {
    if inputs.is_empty() {
        bail!("no input dylibs given");
    }

    let start = Instant::now();

    let progress = ProgressBar::new(inputs.len() as u64);
    progress.set_style(
        ProgressStyle::with_template("{spinner} [{bar:40}] {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("=> "),
    );
    progress.set_message("parsing inputs");

    // Parsing is per-file and embarrassingly parallel; the build itself
    // writes shared regions and runs on one thread
    let images: Vec<MachImage> = inputs
        .par_iter()
        .map(|path| {
            let image = read_input(path);
            progress.inc(1);
            image
        })
        .collect::<Result<_>>()?;
    progress.finish_and_clear();

    let mut config = BuilderConfig {
        cache_base_address: CacheVMAddress::new(base),
        ..BuilderConfig::default()
    };
    if pointers32 {
        config.pointer_format = PointerFormat::Cache32;
    }

    let mut builder = CacheBuilder::new(config);
    for image in images {
        builder.add_parsed_dylib(image);
    }

    let cache = builder.build()?;
    for warning in &cache.warnings {
        eprintln!("warning: {warning}");
    }

    let bytes = cache.serialize();
    std::fs::write(&output, &bytes)
        .with_context(|| format!("failed to write '{}'", output.display()))?;

    info!(
        "wrote {} ({} dylibs, {} fixups, {:.2}s)",
        output.display(),
        cache.dylibs.len(),
        cache.fixup_count(),
        start.elapsed().as_secs_f64()
    );
    println!(
        "{}: {} bytes, {} dylibs, {} tracked fixups",
        output.display(),
        bytes.len(),
        cache.dylibs.len(),
        cache.fixup_count()
    );

    Ok(())
}

fn segments(input: PathBuf) -> Result<()> {
    let image = read_input(&input)?;
    println!("{}", image.header);
    if let Some(name) = image.install_name() {
        println!("install name: {name}");
    }
    for segment in image.segments() {
        println!("  {}", segment.command);
        for section in &segment.sections {
            println!(
                "    {},{} addr={:#x} size={:#x}",
                section.section.segment_name(),
                section.section.name(),
                section.section.addr,
                section.section.size
            );
        }
    }
    Ok(())
}
