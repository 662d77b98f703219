//! CLI wiring for the `coprun` binary: drives the engine end to end against
//! the software device model.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use log::info;

use crate::config::types::{EngineConfig, RunOutcome};
use crate::exec::bootstrap::LoaderImage;
use crate::exec::run_loop::Engine;
use crate::hw::resource::CoprocessorOps;
use crate::hw::sim::SimCoprocessor;
use crate::observability::trace::MemoryTraceSink;
use crate::sched::context::{Context, ContextFlags};
use crate::sched::wait::CancelToken;

/// Local store size of the simulated unit driven by the CLI.
const SIM_LOCAL_STORE: u32 = 256 * 1024;

fn parse_u32(s: &str) -> std::result::Result<u32, String> {
    let s = s.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|e| format!("invalid number {s:?}: {e}"))
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a flat program image on a simulated coprocessor
    Run {
        /// Program image loaded at local-store offset 0
        image: PathBuf,
        /// Entry program counter
        #[arg(long, value_parser = parse_u32, default_value = "0")]
        entry: u32,
        /// Bootstrap isolated mode before running (registers the image as
        /// the trusted loader)
        #[arg(long)]
        isolated: bool,
        /// Execute one instruction per arming
        #[arg(long)]
        single_step: bool,
        /// Print the structured run trace as JSON
        #[arg(long)]
        trace: bool,
    },
    /// Print the default engine configuration as JSON
    Probe,
}

pub fn run_cli() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            image,
            entry,
            isolated,
            single_step,
            trace,
        } => cmd_run(&image, entry, isolated, single_step, trace),
        Commands::Probe => {
            println!("{}", serde_json::to_string_pretty(&EngineConfig::default())?);
            Ok(())
        }
    }
}

fn cmd_run(
    image_path: &PathBuf,
    entry: u32,
    isolated: bool,
    single_step: bool,
    trace: bool,
) -> Result<()> {
    let image = std::fs::read(image_path)
        .with_context(|| format!("reading program image {}", image_path.display()))?;
    if image.len() > SIM_LOCAL_STORE as usize {
        anyhow::bail!(
            "image of {} bytes does not fit the {}-byte local store",
            image.len(),
            SIM_LOCAL_STORE
        );
    }

    let mut engine = Engine::new(EngineConfig::default());
    let sink = Arc::new(MemoryTraceSink::new());
    if trace {
        engine.set_trace_sink(sink.clone());
    }

    let unit = Arc::new(SimCoprocessor::new(0, SIM_LOCAL_STORE));
    unit.write_local(0, &image)
        .context("loading image into local store")?;
    engine
        .add_coprocessor(unit)
        .context("registering simulated coprocessor")?;

    if isolated {
        engine
            .register_isolated_loader(LoaderImage::new(image, 0))
            .context("registering isolated loader")?;
    }

    let ctx = Context::new(ContextFlags {
        isolated,
        single_step,
    });
    info!("running image {} from {entry:#x}", image_path.display());

    let outcome = engine.run(&ctx, entry, &CancelToken::new())?;
    match outcome {
        RunOutcome::Stopped {
            status,
            npc,
            events,
        } => {
            println!(
                "stopped: status {:#010x} (code {:#06x}) pc {npc:#x} events {events:#x}",
                status.raw(),
                status.stop_code(),
            );
        }
        RunOutcome::Interrupted { npc, events } => {
            println!("interrupted: pc {npc:#x} events {events:#x}");
        }
    }
    println!(
        "metrics: {}",
        serde_json::to_string(&engine.metrics().snapshot())?
    );

    if trace {
        println!("{}", serde_json::to_string_pretty(&sink.snapshot())?);
    }
    Ok(())
}
