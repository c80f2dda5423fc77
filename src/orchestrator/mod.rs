//! Compose orchestration: OSTree commit -> served repo -> base image -> formats.
//!
//! [`ImagePipeline::run`] walks the states in [`state`] strictly in order.
//! Formats are processed one at a time in request order and the first
//! failure aborts the run. Whatever the outcome, cleanup (content server
//! stop, work directory removal) runs exactly once before `run` returns.

pub mod executor;
pub mod phases;
pub mod state;

pub use state::{OrchestrationState, PipelineState};

use crate::builder::{require_complete, ImageBuilder};
use crate::config::{BuildOverrides, TaskConfig};
use crate::error::{BuildError, PipelineError, Result};
use crate::models::{
    BuildArtifact, BuildTask, CommitInfo, FormatPlan, FormatTag, ImageTarget, ParameterBag,
    RepoSource,
};
use crate::system::{CommitResolver, ContentServer, ImageConverter};
use crate::template::{KickstartFlattener, TemplateResolver};
use serde::Serialize;
use std::path::PathBuf;
use tempfile::TempDir;
use tokio::sync::watch;

/// External collaborators of a pipeline run.
pub struct PipelineServices {
    pub content_server: Box<dyn ContentServer>,
    pub repository: Box<dyn CommitResolver>,
    pub flattener: Box<dyn KickstartFlattener>,
    pub converter: Box<dyn ImageConverter>,
    pub builder: Box<dyn ImageBuilder>,
}

/// What a run produced.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineReport {
    pub commit: Option<CommitInfo>,
    pub port: Option<u16>,
    pub base_id: Option<String>,
    pub target_ids: Vec<(FormatTag, String)>,
    pub ova_ids: Vec<(FormatTag, String)>,
    /// Files placed in the output directory, in creation order
    pub artifacts: Vec<PathBuf>,
    pub states: Vec<PipelineState>,
}

impl PipelineReport {
    pub fn log_summary(&self) {
        if let Some(ref commit) = self.commit {
            log::info!("[Report] Composed {} at {}", commit.ostree_ref, commit.revision);
        }
        if let Some(ref id) = self.base_id {
            log::info!("[Report] Base image: {}", id);
        }
        for (format, id) in &self.target_ids {
            log::info!("[Report] {} image: {}", format, id);
        }
        for (format, id) in &self.ova_ids {
            log::info!("[Report] {} OVA: {}", format, id);
        }
        for path in &self.artifacts {
            log::info!("[Report] Artifact: {}", path.display());
        }
    }
}

/// One compose run.
pub struct ImagePipeline {
    task: BuildTask,
    source: RepoSource,
    overrides_path: PathBuf,
    resolver: TemplateResolver,
    content_server: Box<dyn ContentServer>,
    repository: Box<dyn CommitResolver>,
    converter: Box<dyn ImageConverter>,
    builder: Box<dyn ImageBuilder>,
    workdir: Option<TempDir>,
    state: OrchestrationState,
    cancel_rx: watch::Receiver<bool>,
    report: PipelineReport,
}

impl ImagePipeline {
    /// The pipeline owns `workdir` and removes it during cleanup.
    pub fn new(
        task: BuildTask,
        config: &TaskConfig,
        services: PipelineServices,
        workdir: TempDir,
        cancel_rx: watch::Receiver<bool>,
    ) -> Self {
        ImagePipeline {
            task,
            source: config.source.clone(),
            overrides_path: config.engine.overrides_path.clone(),
            resolver: TemplateResolver::new(config.kickstart_versions.clone(), services.flattener),
            content_server: services.content_server,
            repository: services.repository,
            converter: services.converter,
            builder: services.builder,
            workdir: Some(workdir),
            state: OrchestrationState::new(),
            cancel_rx,
            report: PipelineReport::default(),
        }
    }

    pub fn state(&self) -> &OrchestrationState {
        &self.state
    }

    pub fn report(&self) -> PipelineReport {
        let mut report = self.report.clone();
        report.states = self.state.history.clone();
        report
    }

    /// Execute the whole run, then clean up.
    pub async fn run(&mut self) -> Result<PipelineReport> {
        log::info!(
            "[Pipeline] Composing {} ({}) into {}",
            self.task.name,
            self.task
                .formats
                .iter()
                .map(FormatTag::as_str)
                .collect::<Vec<_>>()
                .join(", "),
            self.task.output_dir.display()
        );

        let outcome = self.execute().await;
        if let Err(ref e) = outcome {
            log::error!("[Pipeline] Failed in state {}: {}", self.state.state, e);
            self.state.record_error(e.to_string());
        }

        self.cleanup().await;
        outcome.map(|()| self.report())
    }

    async fn execute(&mut self) -> Result<()> {
        self.check_cancelled()?;

        // Serving
        self.state.transition_to(PipelineState::Serving)?;
        let commit = self
            .repository
            .resolve(&self.source.repo_path, &self.source.ostree_ref)
            .await?;
        log::info!(
            "[Serve] {} is at {}, committed {}",
            commit.ostree_ref,
            commit.revision,
            commit.timestamp.format("%c")
        );
        self.report.commit = Some(commit);

        let workdir = self.workdir_path()?;
        let port = self
            .content_server
            .start(&self.source.repo_path, &workdir)
            .await?;
        log::info!("[Serve] trivial httpd port={}", port);
        self.report.port = Some(port);

        // Templating
        self.state.transition_to(PipelineState::Templating)?;
        let map = phases::substitution_map(&self.source, port);
        let install_script =
            phases::render_kickstart(&self.resolver, &self.task.kickstart_path, &workdir, &map)
                .await?;
        let overrides = BuildOverrides::load(&self.overrides_path)?;
        let parameters = phases::assemble_parameters(install_script, &overrides);
        let template = phases::read_template(&self.task.template_path).await?;

        // Base image
        self.state.transition_to(PipelineState::BaseBuilding)?;
        self.check_cancelled()?;
        log::info!("[Build] Starting base image build");
        let base = self.builder.build(&template, &parameters).await?;
        let base = require_complete(base, "base")?;
        self.state.transition_to(PipelineState::BaseDone)?;
        self.report.base_id = Some(base.identifier.clone());

        let placed = phases::place_base(self.builder.as_ref(), &base, &self.task).await?;
        self.report.artifacts.push(placed);

        if self.task.wants(FormatTag::Raw) {
            self.state.transition_to(PipelineState::Converting)?;
            self.check_cancelled()?;
            log::info!("[Convert] Processing image from qcow2 to raw");
            let raw = phases::convert_raw(self.converter.as_ref(), &self.task).await?;
            self.report.artifacts.push(raw);
        }

        for format in self.task.formats.clone() {
            match format.plan() {
                FormatPlan::BaseImage => {
                    log::info!(
                        "[Build] {} is satisfied by {}",
                        format,
                        self.task.base_output().display()
                    );
                }
                FormatPlan::Converted => {}
                FormatPlan::Target { packaged } => {
                    self.build_target(format, packaged, &base).await?;
                }
            }
        }
        self.state.set_format(None);

        self.state.transition_to(PipelineState::ArtifactsPlaced)?;
        Ok(())
    }

    /// Target build for one format, plus its OVA when packaged.
    async fn build_target(
        &mut self,
        format: FormatTag,
        packaged: bool,
        base: &BuildArtifact,
    ) -> Result<()> {
        // Derived builds take no extra parameters.
        let parameters = ParameterBag::new();

        self.state.set_format(Some(format));
        self.state.transition_to(PipelineState::TargetBuilding)?;
        self.check_cancelled()?;
        log::info!("[Build] Creating {} image", format);
        let target = self
            .builder
            .build_image_type(ImageTarget::Format(format), &base.identifier, &parameters)
            .await?;
        let target = require_complete(target, format.as_str())?;
        self.state.transition_to(PipelineState::TargetDone)?;
        self.report
            .target_ids
            .push((format, target.identifier.clone()));

        if !packaged {
            return Ok(());
        }

        self.state.transition_to(PipelineState::OvaBuilding)?;
        self.check_cancelled()?;
        log::info!("[Build] Creating OVA for {}", format);
        let ova = self
            .builder
            .build_image_type(ImageTarget::Ova, &target.identifier, &parameters)
            .await?;
        let ova = require_complete(ova, &format!("{} ova", format))?;
        self.state.transition_to(PipelineState::OvaDone)?;
        self.report.ova_ids.push((format, ova.identifier.clone()));

        let placed = phases::place_ova(self.builder.as_ref(), &ova, &self.task, format).await?;
        self.report.artifacts.push(placed);
        Ok(())
    }

    fn check_cancelled(&self) -> Result<()> {
        if *self.cancel_rx.borrow() {
            return Err(BuildError::Cancelled.into());
        }
        Ok(())
    }

    fn workdir_path(&self) -> Result<PathBuf> {
        self.workdir
            .as_ref()
            .map(|dir| dir.path().to_path_buf())
            .ok_or_else(|| PipelineError::InvalidTransition("work directory already removed".to_string()))
    }

    /// Stop the server and remove the work directory. Runs at most once.
    async fn cleanup(&mut self) {
        if self.state.state.is_terminal() {
            return;
        }

        self.content_server.stop().await;

        if let Some(dir) = self.workdir.take() {
            let path = dir.path().to_path_buf();
            match dir.close() {
                Ok(()) => log::debug!("[Pipeline] Removed work directory {}", path.display()),
                Err(e) => log::warn!(
                    "[Pipeline] Failed to remove work directory {}: {}",
                    path.display(),
                    e
                ),
            }
        }

        if let Err(e) = self.state.transition_to(PipelineState::CleanedUp) {
            log::error!("[Pipeline] {}", e);
        }
        log::info!(
            "[Pipeline] Cleaned up after {:.1}s",
            self.state.elapsed_since_start().as_secs_f32()
        );
    }
}
