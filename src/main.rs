use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::watch;

use ostree_image_compose::builder::create_builder;
use ostree_image_compose::orchestrator::{ImagePipeline, PipelineServices};
use ostree_image_compose::system::{OstreeCli, QemuImg, TrivialHttpd};
use ostree_image_compose::template::Ksflatten;
use ostree_image_compose::{
    init_global_logger, parse_image_types, BuildTask, FormatTag, LogSettings, PipelineError,
    TaskConfig,
};

/// Use ImageFactory to create disk images from an OSTree commit
#[derive(Parser, Debug)]
#[command(name = "ostree-image-compose")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.ini")]
    config: PathBuf,

    /// Output image format; repeat for several (kvm, raw, vsphere, rhevm)
    #[arg(short, long, action = clap::ArgAction::Append)]
    images: Option<Vec<String>>,

    /// Image name
    #[arg(long)]
    name: String,

    /// TDL template file
    #[arg(long)]
    tdl: PathBuf,

    /// Path to image output directory
    #[arg(short, long)]
    outputdir: PathBuf,

    /// Path to kickstart
    #[arg(short, long)]
    kickstart: PathBuf,

    /// Release to compose (references a config file section)
    #[arg(short, long, default_value = "rawhide")]
    release: String,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Also append log output to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let logging = LogSettings {
        verbose: cli.verbose,
        log_file: cli.log_file.clone(),
    };
    let collector = match init_global_logger(&logging) {
        Ok(collector) => collector,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let code = match parse_image_types(cli.images.as_deref()) {
        Err(e) => {
            log::error!("{}", e);
            ExitCode::from(1)
        }
        Ok(formats) => match compose(cli, formats, &logging).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                let message = match e.downcast_ref::<PipelineError>() {
                    Some(pipeline_error) => pipeline_error.user_message(),
                    None => format!("{:#}", e),
                };
                log::error!("{}", message);
                ExitCode::FAILURE
            }
        },
    };

    if let Err(e) = collector.wait_for_empty() {
        eprintln!("error: {}", e);
    }
    code
}

async fn compose(cli: Cli, formats: Vec<FormatTag>, logging: &LogSettings) -> Result<()> {
    let config = TaskConfig::load(&cli.config, &cli.release).map_err(PipelineError::from)?;
    config.show_config();

    tokio::fs::create_dir_all(&cli.outputdir)
        .await
        .with_context(|| format!("Failed to create output directory {}", cli.outputdir.display()))?;

    let mut workdir = tempfile::Builder::new();
    workdir.prefix("ostree-image-compose-");
    let workdir = match config.workdir {
        Some(ref parent) => workdir.tempdir_in(parent),
        None => workdir.tempdir(),
    }
    .context("Failed to create work directory")?;
    log::debug!("[Main] Work directory: {}", workdir.path().display());

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("[Main] Interrupt received, cancelling");
            let _ = cancel_tx.send(true);
        }
    });

    let builder = create_builder(
        config.builder,
        &config.engine,
        config.workdir.as_deref(),
        logging,
        cancel_rx.clone(),
    )
    .map_err(PipelineError::from)?;

    let services = PipelineServices {
        content_server: Box::new(TrivialHttpd::new()),
        repository: Box::new(OstreeCli::new()),
        flattener: Box::new(Ksflatten),
        converter: Box::new(QemuImg),
        builder,
    };

    let task = BuildTask::new(cli.name, cli.tdl, cli.kickstart, cli.outputdir, formats);
    let mut pipeline = ImagePipeline::new(task, &config, services, workdir, cancel_rx);
    let report = pipeline.run().await?;
    report.log_summary();
    Ok(())
}
