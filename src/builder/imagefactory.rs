//! Direct ImageFactory backend.
//!
//! Runs the `imagefactory` CLI on this host. At construction the engine's
//! JSON configuration is loaded, merged with the plugin directory, timeout
//! and rhevm disk format, and written into a private scratch directory that
//! every invocation points `--config` at.
//!
//! Each call ends with a details block the build report is read from:
//!
//! ```text
//! ============ Final Image Details ============
//! UUID: 0e0f6bb1-5a8f-4bd0-8f7f-2b8e7d1c52f1
//! Type: base_image
//! Image filename: /var/lib/imagefactory/storage/0e0f6bb1-....body
//! Image build completed SUCCESSFULLY!
//! ```

use super::{require_complete, BuilderKind, ImageBuilder};
use crate::config::loader::load_json_object;
use crate::config::EngineSettings;
use crate::error::{ArtifactError, BuildError, CommandError, ConfigError};
use crate::log_collector::LogSettings;
use crate::models::{ArtifactStatus, BuildArtifact, ImageTarget, ParameterBag};
use crate::orchestrator::executor::{run_command, RunOptions};
use crate::system::place_file;
use futures::future::BoxFuture;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;
use tokio::process::Command;
use tokio::sync::watch;

/// Parameter values longer than this are passed through a file.
const INLINE_PARAMETER_LIMIT: usize = 256;

const ENGINE_CONFIG_NAME: &str = "imagefactory.conf";

/// Merge the run-specific settings into the engine's JSON configuration.
pub fn merge_engine_config(
    config: &mut serde_json::Map<String, serde_json::Value>,
    settings: &EngineSettings,
) {
    config.insert(
        "plugins".to_string(),
        settings.plugins_dir.display().to_string().into(),
    );
    config.insert("timeout".to_string(), settings.timeout.as_secs().into());
    config.insert(
        "rhevm_image_format".to_string(),
        settings.rhevm_image_format.clone().into(),
    );
}

/// Read the final details block of an engine run.
pub fn parse_build_report(lines: &[String]) -> Option<BuildArtifact> {
    let mut identifier = None;
    let mut data_path = PathBuf::new();
    let mut status = None;
    let mut detail = None;

    for line in lines.iter().map(|l| l.trim()) {
        if let Some(uuid) = line.strip_prefix("UUID:") {
            identifier = Some(uuid.trim().to_string());
        } else if let Some(path) = line.strip_prefix("Image filename:") {
            data_path = PathBuf::from(path.trim());
        } else if line.starts_with("Image build completed SUCCESSFULLY") {
            status = Some(ArtifactStatus::Complete);
        } else if let Some(reported) = line.strip_prefix("Image build FAILED with status:") {
            status = Some(ArtifactStatus::Failed);
            detail = Some(reported.trim().to_string());
        } else if let Some(reported) = line.strip_prefix("Status:") {
            if status.is_none() {
                status = reported.trim().parse().ok();
            }
        }
    }

    let mut artifact = BuildArtifact::new(
        identifier?,
        status.unwrap_or(ArtifactStatus::Failed),
        &data_path,
    );
    if let Some(detail) = detail {
        artifact = artifact.with_detail(detail);
    } else if status.is_none() {
        artifact = artifact.with_detail("no completion status reported");
    }
    Some(artifact)
}

fn parameter_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Builds images by invoking the ImageFactory CLI.
pub struct DirectEngineBuilder {
    settings: EngineSettings,
    verbose: bool,
    output_level: log::Level,
    cancel: Option<watch::Receiver<bool>>,
    command: Vec<String>,
    scratch: TempDir,
    engine_config: PathBuf,
    file_counter: AtomicUsize,
}

impl DirectEngineBuilder {
    pub fn new(
        settings: EngineSettings,
        scratch_parent: Option<&Path>,
        logging: &LogSettings,
    ) -> Result<Self, ConfigError> {
        let mut config = load_json_object(&settings.config_path)?;
        merge_engine_config(&mut config, &settings);

        let mut scratch = tempfile::Builder::new();
        scratch.prefix("imagefactory-");
        let scratch = match scratch_parent {
            Some(parent) => scratch.tempdir_in(parent)?,
            None => scratch.tempdir()?,
        };

        let engine_config = scratch.path().join(ENGINE_CONFIG_NAME);
        std::fs::write(
            &engine_config,
            serde_json::to_string_pretty(&serde_json::Value::Object(config))?,
        )?;
        log::debug!(
            "[Builder] Merged engine configuration written to {}",
            engine_config.display()
        );

        Ok(DirectEngineBuilder {
            settings,
            verbose: logging.verbose,
            output_level: logging.tool_output_level(),
            cancel: None,
            command: vec!["imagefactory".to_string()],
            scratch,
            engine_config,
            file_counter: AtomicUsize::new(0),
        })
    }

    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Replace the `imagefactory` invocation (program plus leading arguments).
    pub fn with_command(mut self, command: Vec<String>) -> Self {
        if !command.is_empty() {
            self.command = command;
        }
        self
    }

    pub fn engine_config_path(&self) -> &Path {
        &self.engine_config
    }

    fn global_args(&self) -> Vec<String> {
        let mut args = vec![
            "--config".to_string(),
            self.engine_config.display().to_string(),
            "--plugins".to_string(),
            self.settings.plugins_dir.display().to_string(),
            "--timeout".to_string(),
            self.settings.timeout.as_secs().to_string(),
        ];
        if self.verbose {
            args.push("--debug".to_string());
        }
        args
    }

    fn scratch_file(&self, stem: &str, content: &str) -> Result<PathBuf, BuildError> {
        let n = self.file_counter.fetch_add(1, Ordering::SeqCst);
        let path = self.scratch.path().join(format!("{:03}-{}", n, stem));
        std::fs::write(&path, content).map_err(|e| {
            BuildError::Engine(format!("cannot write {}: {}", path.display(), e))
        })?;
        Ok(path)
    }

    /// `--parameter` for short single-line values, `--file-parameter` otherwise.
    fn parameter_args(&self, parameters: &ParameterBag) -> Result<Vec<String>, BuildError> {
        let mut args = Vec::new();
        for (key, value) in parameters {
            let text = parameter_text(value);
            if text.contains('\n') || text.len() > INLINE_PARAMETER_LIMIT {
                let path = self.scratch_file(key, &text)?;
                args.push("--file-parameter".to_string());
                args.push(key.clone());
                args.push(path.display().to_string());
            } else {
                args.push("--parameter".to_string());
                args.push(key.clone());
                args.push(text);
            }
        }
        Ok(args)
    }

    fn base_args(&self, template_file: &Path, parameters: &ParameterBag) -> Result<Vec<String>, BuildError> {
        let mut args = self.global_args();
        args.push("base_image".to_string());
        args.extend(self.parameter_args(parameters)?);
        args.push(template_file.display().to_string());
        Ok(args)
    }

    fn target_args(
        &self,
        target: ImageTarget,
        base_id: &str,
        parameters: &ParameterBag,
    ) -> Result<Vec<String>, BuildError> {
        let mut args = self.global_args();
        args.push("target_image".to_string());
        args.push("--id".to_string());
        args.push(base_id.to_string());
        args.extend(self.parameter_args(parameters)?);
        args.push(target.as_str().to_string());
        Ok(args)
    }

    async fn run_engine(&self, target: &str, args: Vec<String>) -> Result<BuildArtifact, BuildError> {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]).args(&args);

        let mut opts = RunOptions::labelled("imagefactory")
            .with_level(self.output_level)
            .with_timeout(self.settings.timeout);
        opts.cancel = self.cancel.clone();

        let output = run_command(cmd, opts).await.map_err(|e| match e {
            CommandError::TimedOut(limit) => BuildError::TimedOut {
                target: target.to_string(),
                limit,
            },
            CommandError::Cancelled => BuildError::Cancelled,
            other => BuildError::Engine(other.to_string()),
        })?;

        let mut lines = output.stdout.clone();
        lines.extend(output.stderr.iter().cloned());
        match parse_build_report(&lines) {
            Some(artifact) => {
                log::info!(
                    "[Builder] {} image {} finished with status {}",
                    target,
                    artifact.identifier,
                    artifact.status_text()
                );
                // A report still PENDING or RUNNING when the engine exits is a failure.
                require_complete(artifact, target)
            }
            None => Err(BuildError::Engine(format!(
                "imagefactory exited with {} without reporting an image: {}",
                output.status,
                output.last_error_line().unwrap_or("no error output")
            ))),
        }
    }

    async fn build_inner(&self, template: &str, parameters: &ParameterBag) -> Result<BuildArtifact, BuildError> {
        let template_file = self.scratch_file("template.tdl", template)?;
        let args = self.base_args(&template_file, parameters)?;
        log::info!("[Builder] Starting base image build");
        self.run_engine("base", args).await
    }

    async fn build_image_type_inner(
        &self,
        target: ImageTarget,
        base_id: &str,
        parameters: &ParameterBag,
    ) -> Result<BuildArtifact, BuildError> {
        let args = self.target_args(target, base_id, parameters)?;
        log::info!("[Builder] Working on a {} for {}", target, base_id);
        self.run_engine(target.as_str(), args).await
    }
}

impl ImageBuilder for DirectEngineBuilder {
    fn kind(&self) -> BuilderKind {
        BuilderKind::ImageFactory
    }

    fn build<'a>(
        &'a self,
        template: &'a str,
        parameters: &'a ParameterBag,
    ) -> BoxFuture<'a, Result<BuildArtifact, BuildError>> {
        Box::pin(self.build_inner(template, parameters))
    }

    fn build_image_type<'a>(
        &'a self,
        target: ImageTarget,
        base_id: &'a str,
        parameters: &'a ParameterBag,
    ) -> BoxFuture<'a, Result<BuildArtifact, BuildError>> {
        Box::pin(self.build_image_type_inner(target, base_id, parameters))
    }

    fn download<'a>(
        &'a self,
        artifact: &'a BuildArtifact,
        dest: &'a Path,
    ) -> BoxFuture<'a, Result<(), ArtifactError>> {
        Box::pin(async move {
            place_file(&artifact.data_path, dest).await?;
            Ok(())
        })
    }
}
