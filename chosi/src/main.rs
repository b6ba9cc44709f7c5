#![allow(clippy::multiple_crate_versions)]
#![doc = include_str!("../../README.md")]

use std::{path::PathBuf, process::ExitCode};

use clap::{CommandFactory as _, Parser};
use log::{debug, error, info};
use nix::unistd::Uid;
use types::{Architecture, ChosiError};

mod bootloader;
mod config;
mod convert;
mod customize;
mod download;
mod guest;
mod host;
mod loopdev;
mod mount;
mod pipeline;
mod report;
mod unwind;

use crate::{
    config::Config,
    download::HttpFetcher,
    host::SystemHost,
    pipeline::{Pipeline, PipelineOutcome},
    report::Reporter,
};

const EXIT_PRIVILEGE: u8 = 1;
const EXIT_USAGE: u8 = 2;
const EXIT_CONFIG: u8 = 3;

#[derive(Parser)]
#[command(version, about = "Cloud Image Customization Utility")]
struct Cli {
    #[arg(short, long, help = "Configuration File")]
    config: Option<PathBuf>,

    #[arg(short, long, default_value_t, help = "Guest Architecture")]
    arch: Architecture,

    #[arg(
        short,
        long,
        default_value = ".",
        help = "Directory holding the base and customized images"
    )]
    work_dir: PathBuf,
}

fn report(context: &str, err: ChosiError) {
    error!("{context}: {:#}", anyhow::Error::from(err));
}

fn main() -> ExitCode {
    env_logger::init();

    let cli = Cli::parse();

    info!(
        "Running {} {}",
        env!("CARGO_CRATE_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    if !Uid::effective().is_root() {
        report(
            "Can't customize images",
            ChosiError::Privilege(String::from("Attaching and mounting images requires root")),
        );
        return ExitCode::from(EXIT_PRIVILEGE);
    }

    let Some(config_path) = cli.config else {
        error!("Missing configuration file");
        error!("{}", Cli::command().render_usage());
        return ExitCode::from(EXIT_USAGE);
    };

    let settings = match Config::from_path(&config_path)
        .and_then(|cfg| cfg.into_settings(cli.arch, &cli.work_dir))
    {
        Ok(settings) => settings,
        Err(e) => {
            report(
                &format!("Failed to parse config file {}", config_path.display()),
                e,
            );
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    info!(
        "Customizing {} for {} in {}",
        settings.image_url,
        settings.arch,
        cli.work_dir.display()
    );

    let mut host = SystemHost;
    let fetcher = HttpFetcher::new();
    let mut pipeline = Pipeline::new(&settings, Reporter::new());

    let outcome = pipeline.run(&mut host, &fetcher);
    let code = outcome.exit_code();

    debug!(
        "Pipeline ended in state {:?} after {:?}",
        pipeline.state(),
        pipeline.history()
    );

    match outcome {
        PipelineOutcome::Success => {
            if let Some((output, _)) = &settings.output {
                info!("Image ready: {}", output.display());
            } else {
                info!("Image ready: {}", settings.raw_image.display());
            }
        }
        PipelineOutcome::Failed { failure, secondary } => {
            report(&format!("{} failed", failure.stage), failure.error);

            for other in secondary {
                report(&format!("{} also failed", other.stage), other.error);
            }
        }
    }

    ExitCode::from(code)
}
