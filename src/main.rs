use std::io::{self, Write};

use anyhow::{bail, ensure, Context, Result};
use iocmd::config::Config;
use iocmd::geometry::DeviceInfo;
use iocmd::pipeline::{self, RunOptions};
use iocmd_bdev::{Bdev, BdevRegistry, MallocBdev};
use itertools::Itertools;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, DeviceArgs, InfoCmd, RunCmd};

mod cli;

fn main() -> Result<()> {
    // Progress goes to stdout. Keep logs out of it.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();
    let cli = <Cli as clap::Parser>::parse();
    match cli {
        Cli::Run(cmd) => run_main(&cmd),
        Cli::Info(cmd) => info_main(&cmd),
    }
}

fn load_config(args: &DeviceArgs) -> Result<Config> {
    let mut config = Config::load(args.config_file.as_deref())?;
    if let Some(bdev) = &args.bdev {
        config.run.bdev.clone_from(bdev);
    }
    // Fail fast.
    config.validate().context("invalid config")?;
    Ok(config)
}

fn lookup<'r>(registry: &'r BdevRegistry, name: &str) -> Result<&'r MallocBdev> {
    match registry.get(name) {
        Some(bdev) => Ok(bdev),
        None => bail!(
            "bdev {name:?} not found, available: {}",
            registry.iter().map(Bdev::name).join(", "),
        ),
    }
}

/// Run the pipeline against the selected bdev.
fn run_main(cmd: &RunCmd) -> Result<()> {
    let mut config = load_config(&cmd.device)?;
    if let Some(timeout) = cmd.stage_timeout {
        config.run.stage_timeout = Some(timeout.into());
    }
    if let Some(runs) = cmd.runs {
        config.run.runs = runs;
    }
    let registry = config.build_registry()?;
    let bdev = lookup(&registry, &config.run.bdev)?;
    let options = RunOptions {
        stage_timeout: config.run.stage_timeout,
    };

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let runs = config.run.runs.get();
    let mut first_geometry = None;
    for i in 1..=runs {
        tracing::info!(bdev = bdev.name(), run = i, runs, "starting run");
        let outcome = rt.block_on(pipeline::run(bdev, options, io::stdout().lock()));
        if let Err(err) = outcome.result {
            let stage = err.stage().map_or("setup".to_owned(), |s| s.to_string());
            return Err(err).with_context(|| format!("run {i}/{runs} failed in {stage}"));
        }
        if let Some(first) = &first_geometry {
            ensure!(
                *first == outcome.geometry,
                "run {i}/{runs} reported zone geometry {:?}, differing from {first:?}",
                outcome.geometry,
            );
        } else {
            first_geometry = Some(outcome.geometry);
        }
    }
    println!("Run complete");
    Ok(())
}

fn info_main(cmd: &InfoCmd) -> Result<()> {
    let config = load_config(&cmd.device)?;
    let registry = config.build_registry()?;
    let info = DeviceInfo::query(lookup(&registry, &config.run.bdev)?);
    let mut out = io::stdout().lock();
    if cmd.json {
        serde_json::to_writer_pretty(&mut out, &info).context("failed to serialize")?;
        writeln!(out)?;
    } else {
        writeln!(out, "{info}")?;
    }
    Ok(())
}
