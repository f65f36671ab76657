use std::env;
use std::env::consts::{ARCH, FAMILY, OS};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Error, bail};
use chrono::Local;
use tracing::{info, trace, warn};
use uuid::Uuid;

use crate::dataset::config_loader::CONFIG_NAME;
use crate::dataset::{ConfigManager, init_logger};
use crate::program::{Program, Stage, parse_stage};

mod dataset;
mod program;

const USAGE: &str = "usage: booru_dataset [--config <path>] <crawl|caption|score|detect|wash>";

/// Command line arguments.
#[derive(Debug, PartialEq, Eq)]
struct Args {
    config_path: PathBuf,
    stage: Option<Stage>,
}

fn main() -> Result<ExitCode, Error> {
    let args = parse_args(env::args().skip(1))?;

    let manager = ConfigManager::load(&args.config_path)
        .with_context(|| format!("Failed to load {}", args.config_path.display()))?;

    // Keeps the file writer alive until exit.
    let _log_guard =
        init_logger(&manager.app_config().logging).context("Failed to initialize logging")?;
    if manager.created_default() {
        warn!(
            "Config file not found, created {} with default values",
            manager.config_path().display()
        );
    } else {
        info!("Loaded config from {}", manager.config_path().display());
    }
    let config = manager.into_app_config();

    let run_id = Uuid::new_v4();
    let started = Local::now();
    info!(run_id = %run_id, started = %started.to_rfc3339(), "Run started");
    log_system_information();

    let stage = match args.stage {
        Some(stage) => stage,
        None if Program::is_interactive_terminal() => Program::choose_stage()?,
        None => bail!("no stage given\n{}", USAGE),
    };

    let strict_exit = config.strict_exit;
    let program = Program::new(config);
    let summary = program.run(stage)?;

    let elapsed = Local::now() - started;
    info!(
        run_id = %run_id,
        elapsed_secs = elapsed.num_seconds(),
        %summary,
        "Run finished"
    );

    if strict_exit && summary.has_failures() {
        warn!("{} item(s) failed, exiting with an error status", summary.failed);
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<Args, Error> {
    let mut config_path = PathBuf::from(CONFIG_NAME);
    let mut stage = None;
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                let Some(path) = args.next() else {
                    bail!("--config needs a path\n{}", USAGE);
                };
                config_path = PathBuf::from(path);
            }
            "-h" | "--help" => bail!("{}", USAGE),
            other if stage.is_none() => stage = Some(parse_stage(other)?),
            other => bail!("unexpected argument `{}`\n{}", other, USAGE),
        }
    }

    Ok(Args { config_path, stage })
}

/// Logs important information about the system being used.
fn log_system_information() {
    trace!("ARCH:           \"{}\"", ARCH);
    trace!("FAMILY:         \"{}\"", FAMILY);
    trace!("OS:             \"{}\"", OS);
}
