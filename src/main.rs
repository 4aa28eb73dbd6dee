//! fingermatch CLI - Convert VerifyNet weights to the Candle backend

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use fingermatch::backend::candle::CandleVerifyNet;
use fingermatch::backend::reference::ReferenceVerifyNet;
use fingermatch::convert::convert;
use fingermatch::{available_backends, parse_precision, InputShape, DEFAULT_FEATURES, VERSION};

/// Convert reference VerifyNet weights into the Candle backend format
#[derive(Parser, Debug)]
#[command(name = "fingermatch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the reference VerifyNet weights (safetensors)
    source_weights: PathBuf,

    /// Destination for the converted Candle weights
    output: PathBuf,

    /// Architecture precision variant (e.g. "float32" or a row count)
    #[arg(long, default_value = "float32")]
    precision: String,

    /// Use CPU even when an accelerator is available
    #[arg(long)]
    cpu: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

fn create_progress_bar(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap(),
    );
    pb.set_message(msg.to_string());
    pb
}

fn pick_device(force_cpu: bool) -> candle_core::Device {
    if force_cpu {
        return candle_core::Device::Cpu;
    }
    candle_core::Device::cuda_if_available(0).unwrap_or(candle_core::Device::Cpu)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    info!("fingermatch v{}", VERSION);
    info!("Registered backends: {:?}", available_backends());

    let rows = parse_precision(&cli.precision)?;
    let shape = InputShape::new(rows, DEFAULT_FEATURES);
    let device = pick_device(cli.cpu);

    let pb = create_progress_bar("Converting weights...");

    let source = ReferenceVerifyNet::from_safetensors(&cli.source_weights, shape)
        .with_context(|| format!("Loading source weights from {:?}", cli.source_weights))?;
    let destination = CandleVerifyNet::new_random(shape, &device)?;
    convert(&source, &destination)?;
    destination.save(&cli.output)?;

    pb.finish_with_message("Conversion complete");

    println!("Candle weights saved to {}", cli.output.display());
    Ok(())
}
