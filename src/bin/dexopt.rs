use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use log::{error, info};

use dexopt::config::RunConfig;
use dexopt::error::Result;
use dexopt::pass_manager::{DexProgram, PassManager};

/// Optimizes Android DEX files with a configurable list of passes.
#[derive(Parser, Debug)]
#[command(name = "dexopt", version)]
struct Cli {
    /// Input DEX files, written back in the same order.
    #[arg(value_name = "DEX", required = true)]
    inputs: Vec<PathBuf>,
    /// Library JARs used to resolve references. May be repeated.
    #[arg(long = "jarpath", value_name = "PATH")]
    jarpaths: Vec<PathBuf>,
    /// Output directory.
    #[arg(short, long, value_name = "DIR")]
    output: PathBuf,
    /// JSON run configuration.
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Passes to run, replacing the configured list. May be repeated.
    #[arg(long = "pass", value_name = "NAME")]
    passes: Vec<String>,
    /// Where to write pass metrics as JSON.
    #[arg(long, value_name = "PATH")]
    metrics: Option<PathBuf>,
    #[arg(short = 'j', long, value_name = "N")]
    threads: Option<usize>,
}

fn run(cli: Cli) -> Result<()> {
    let started_at = Instant::now();
    let mut config = match &cli.config {
        Some(path) => RunConfig::from_file(path)?,
        None => RunConfig::default(),
    };
    if !cli.passes.is_empty() {
        config.redex.passes = cli.passes.clone();
    }
    if cli.threads.is_some() {
        config.num_threads = cli.threads;
    }

    let mut program = DexProgram::load(&cli.inputs, &cli.jarpaths, &config.loader)?;
    let mut pm = PassManager::new(config)?;
    pm.run(&mut program)?;
    let written = program.write(&cli.output)?;
    if let Some(path) = &cli.metrics {
        pm.write_metrics(path)?;
    }
    info!(
        "[dexopt] ran {} passes, wrote {} dex files in {} ms",
        pm.pass_names().len(),
        written.len(),
        started_at.elapsed().as_millis()
    );
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e.report());
            ExitCode::from(e.kind().code() as u8)
        }
    }
}
