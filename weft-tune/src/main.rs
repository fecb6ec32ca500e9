//! weft-tune: autotuner for the runtime sizes of weft programs
//!
//! Usage:
//!   weft-tune <bench.json> [--weft <path>] [--trials <n>] [--save <file>]
//!
//! The sizes to tune are discovered with `weft run --print-sizes`. Every
//! trial re-runs the benchmark datasets with a different `--size`
//! assignment; the objective is the summed mean runtime.

mod bench;
mod tuner;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use std::path::PathBuf;

use bench::{Bench, Manifest};
use tuner::{Tuner, parse_sizes, reproduction_command, save_config};

#[derive(Parser, Debug)]
#[command(name = "weft-tune")]
#[command(about = "Tune the runtime sizes of a weft program")]
struct Args {
    /// Benchmark manifest (JSON)
    manifest: PathBuf,

    /// The weft driver to benchmark with
    #[arg(long, default_value = "weft")]
    weft: PathBuf,

    /// Number of configurations to try
    #[arg(short = 'n', long, default_value = "50")]
    trials: usize,

    /// Runs per dataset and configuration
    #[arg(short, long, default_value = "3")]
    runs: usize,

    /// Seed of the random search
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Write the best configuration as `name=value` lines to this file
    #[arg(short, long)]
    save: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let manifest = Manifest::load(&args.manifest)?;
    let bench = Bench {
        weft: args.weft.clone(),
        manifest: &manifest,
        runs: args.runs,
    };

    let params = parse_sizes(&bench.print_sizes()?).context("Failed to discover tunable sizes")?;
    eprintln!("Program: {:?}", manifest.program);
    eprintln!("  Datasets: {}", manifest.datasets.iter().filter(|ds| !ds.excluded()).count());
    eprintln!("  Tunable sizes: {}", params.len());
    for p in &params {
        info!("tuning {} ({}) over {:?}", p.name, p.class, p.space);
    }

    let trials = if params.is_empty() { 1 } else { args.trials.max(1) };
    let mut tuner = Tuner {
        params,
        bench,
        rng: SmallRng::seed_from_u64(args.seed),
    };
    let Some(best) = tuner.tune(trials)? else {
        anyhow::bail!("every configuration failed");
    };

    println!("Best cost: {:.0}us", best.result.cost);
    println!("{}", reproduction_command(&args.weft, &manifest.program, &best.config));
    if let Some(path) = args.save {
        save_config(&path, &best.config)?;
        eprintln!("Wrote {:?}", path);
    }

    Ok(())
}
