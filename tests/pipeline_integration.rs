//! Integration tests for ImagePipeline
//!
//! Every external collaborator (content server, commit lookup, flattener,
//! converter, image builder) is replaced by an in-memory fake that records
//! its calls into one shared event log, so the tests can check call order,
//! fail-fast behavior and cleanup on every exit path.

use chrono::{TimeZone, Utc};
use futures::future::BoxFuture;
use ostree_image_compose::builder::{BuilderKind, ImageBuilder};
use ostree_image_compose::config::{EngineSettings, TaskConfig};
use ostree_image_compose::error::{
    ArtifactError, BuildError, ConfigError, PipelineError, ServiceError, TemplateError,
};
use ostree_image_compose::models::{
    parse_image_types, ArtifactStatus, BuildArtifact, BuildTask, CommitInfo, FormatTag,
    ImageTarget, ParameterBag, RepoSource,
};
use ostree_image_compose::orchestrator::{ImagePipeline, PipelineServices, PipelineState};
use ostree_image_compose::system::{CommitResolver, ContentServer, DiskFormat, ImageConverter};
use ostree_image_compose::template::{KickstartFlattener, VariantProfiles};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::watch;

type EventLog = Arc<Mutex<Vec<String>>>;

const KICKSTART: &str = "\
ostreesetup --nogpg --osname=@OSTREE_OSNAME@ --remote=@OSTREE_OSNAME@ \
--url=http://192.168.122.1:@OSTREE_PORT@/ --ref=@OSTREE_REF@
%packages
@core
%end
";

const TEMPLATE: &str = "<template><name>fedora-atomic</name></template>";

fn events(log: &EventLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

fn count(log: &EventLog, event: &str) -> usize {
    events(log).iter().filter(|e| *e == event).count()
}

// ============================================================================
// FAKES
// ============================================================================

struct FakeServer {
    log: EventLog,
    fail: bool,
    port: Option<u16>,
}

impl ContentServer for FakeServer {
    fn start<'a>(
        &'a mut self,
        _repo: &'a Path,
        workdir: &'a Path,
    ) -> BoxFuture<'a, Result<u16, ServiceError>> {
        Box::pin(async move {
            self.log.lock().unwrap().push("server:start".to_string());
            assert!(workdir.is_dir(), "work directory must exist while serving");
            if self.fail {
                return Err(ServiceError::Bind("address in use".to_string()));
            }
            self.port = Some(8080);
            Ok(8080)
        })
    }

    fn stop(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.log.lock().unwrap().push("server:stop".to_string());
            self.port = None;
        })
    }

    fn port(&self) -> Option<u16> {
        self.port
    }
}

struct FakeResolver;

impl CommitResolver for FakeResolver {
    fn resolve<'a>(
        &'a self,
        _repo: &'a Path,
        reference: &'a str,
    ) -> BoxFuture<'a, Result<CommitInfo, ServiceError>> {
        Box::pin(async move {
            Ok(CommitInfo {
                ostree_ref: reference.to_string(),
                revision: "3c1f5e3f4b0d".to_string(),
                timestamp: Utc.with_ymd_and_hms(2015, 1, 21, 18, 3, 14).unwrap(),
            })
        })
    }
}

struct CopyFlattener {
    log: EventLog,
}

impl KickstartFlattener for CopyFlattener {
    fn flatten<'a>(
        &'a self,
        kickstart: &'a Path,
        version: &'a str,
        output: &'a Path,
    ) -> BoxFuture<'a, Result<(), TemplateError>> {
        Box::pin(async move {
            self.log.lock().unwrap().push(format!("flatten:{}", version));
            std::fs::copy(kickstart, output).map_err(|source| TemplateError::Unreadable {
                path: kickstart.to_path_buf(),
                source,
            })?;
            Ok(())
        })
    }
}

struct FakeConverter {
    log: EventLog,
}

impl ImageConverter for FakeConverter {
    fn convert<'a>(
        &'a self,
        source: &'a Path,
        from: DiskFormat,
        dest: &'a Path,
        to: DiskFormat,
    ) -> BoxFuture<'a, Result<(), ArtifactError>> {
        Box::pin(async move {
            self.log
                .lock()
                .unwrap()
                .push(format!("convert:{}->{}", from, to));
            std::fs::copy(source, dest).map_err(|e| ArtifactError::Convert(e.to_string()))?;
            Ok(())
        })
    }
}

/// Scripted image builder.
///
/// Artifacts complete unless a status is scripted for their target name
/// (`"base"`, a format name, or `"<format>-ova"`).
struct FakeBuilder {
    log: EventLog,
    data_dir: PathBuf,
    statuses: HashMap<String, ArtifactStatus>,
    base_parameters: Arc<Mutex<Option<ParameterBag>>>,
    cancel_after_base: Option<watch::Sender<bool>>,
}

impl FakeBuilder {
    fn artifact(&self, name: &str) -> BuildArtifact {
        let data_path = self.data_dir.join(format!("{}.body", name));
        std::fs::write(&data_path, name.as_bytes()).unwrap();
        let status = self
            .statuses
            .get(name)
            .copied()
            .unwrap_or(ArtifactStatus::Complete);
        let artifact = BuildArtifact::new(format!("{}-id", name), status, &data_path);
        if status == ArtifactStatus::Failed {
            artifact.with_detail("FAILED")
        } else {
            artifact
        }
    }
}

impl ImageBuilder for FakeBuilder {
    fn kind(&self) -> BuilderKind {
        BuilderKind::ImageFactory
    }

    fn build<'a>(
        &'a self,
        _template: &'a str,
        parameters: &'a ParameterBag,
    ) -> BoxFuture<'a, Result<BuildArtifact, BuildError>> {
        Box::pin(async move {
            self.log.lock().unwrap().push("build:base".to_string());
            *self.base_parameters.lock().unwrap() = Some(parameters.clone());
            if let Some(ref tx) = self.cancel_after_base {
                let _ = tx.send(true);
            }
            Ok(self.artifact("base"))
        })
    }

    fn build_image_type<'a>(
        &'a self,
        target: ImageTarget,
        base_id: &'a str,
        _parameters: &'a ParameterBag,
    ) -> BoxFuture<'a, Result<BuildArtifact, BuildError>> {
        Box::pin(async move {
            self.log
                .lock()
                .unwrap()
                .push(format!("target:{}:{}", target, base_id));
            let name = match target {
                ImageTarget::Format(format) => format.as_str().to_string(),
                ImageTarget::Ova => format!("{}-ova", base_id.trim_end_matches("-id")),
            };
            Ok(self.artifact(&name))
        })
    }

    fn download<'a>(
        &'a self,
        artifact: &'a BuildArtifact,
        dest: &'a Path,
    ) -> BoxFuture<'a, Result<(), ArtifactError>> {
        Box::pin(async move {
            std::fs::copy(&artifact.data_path, dest).map_err(|source| ArtifactError::Copy {
                from: artifact.data_path.clone(),
                to: dest.to_path_buf(),
                source,
            })?;
            Ok(())
        })
    }
}

// ============================================================================
// FIXTURE
// ============================================================================

struct Fixture {
    root: TempDir,
    log: EventLog,
    statuses: HashMap<String, ArtifactStatus>,
    server_fails: bool,
    kickstart: String,
    base_parameters: Arc<Mutex<Option<ParameterBag>>>,
    cancel_after_base: Option<watch::Sender<bool>>,
}

impl Fixture {
    fn new() -> Self {
        Fixture {
            root: TempDir::new().unwrap(),
            log: Arc::new(Mutex::new(Vec::new())),
            statuses: HashMap::new(),
            server_fails: false,
            kickstart: KICKSTART.to_string(),
            base_parameters: Arc::new(Mutex::new(None)),
            cancel_after_base: None,
        }
    }

    fn with_status(mut self, name: &str, status: ArtifactStatus) -> Self {
        self.statuses.insert(name.to_string(), status);
        self
    }

    fn output_dir(&self) -> PathBuf {
        self.root.path().join("out")
    }

    fn output(&self, file: &str) -> PathBuf {
        self.output_dir().join(file)
    }

    fn config(&self) -> TaskConfig {
        let oz_cfg = self.root.path().join("oz.cfg");
        std::fs::write(&oz_cfg, "[libvirt]\nmemory = 1024\nimage_type = raw\n").unwrap();

        TaskConfig {
            release: "f21".to_string(),
            source: RepoSource {
                repo_path: self.root.path().join("repo"),
                ostree_ref: "fedora-atomic/f21/x86_64/docker-host".to_string(),
                os_name: "fedora-atomic".to_string(),
            },
            workdir: None,
            builder: BuilderKind::ImageFactory,
            engine: EngineSettings {
                overrides_path: oz_cfg,
                ..EngineSettings::default()
            },
            kickstart_versions: VariantProfiles::default(),
        }
    }

    /// Build a pipeline; returns it with the path of its work directory.
    fn pipeline(
        &mut self,
        formats: Vec<FormatTag>,
        cancel_rx: watch::Receiver<bool>,
    ) -> (ImagePipeline, PathBuf) {
        let ks = self.root.path().join("fedora-atomic.ks");
        std::fs::write(&ks, &self.kickstart).unwrap();
        let tdl = self.root.path().join("atomic.tdl");
        std::fs::write(&tdl, TEMPLATE).unwrap();
        let data_dir = self.root.path().join("storage");
        std::fs::create_dir_all(&data_dir).unwrap();
        std::fs::create_dir_all(self.output_dir()).unwrap();
        std::fs::create_dir_all(self.root.path().join("repo")).unwrap();

        let workdir = tempfile::Builder::new()
            .prefix("work-")
            .tempdir_in(self.root.path())
            .unwrap();
        let workdir_path = workdir.path().to_path_buf();

        let services = PipelineServices {
            content_server: Box::new(FakeServer {
                log: self.log.clone(),
                fail: self.server_fails,
                port: None,
            }),
            repository: Box::new(FakeResolver),
            flattener: Box::new(CopyFlattener {
                log: self.log.clone(),
            }),
            converter: Box::new(FakeConverter {
                log: self.log.clone(),
            }),
            builder: Box::new(FakeBuilder {
                log: self.log.clone(),
                data_dir,
                statuses: self.statuses.clone(),
                base_parameters: self.base_parameters.clone(),
                cancel_after_base: self.cancel_after_base.take(),
            }),
        };

        let task = BuildTask::new("fedora-atomic", tdl, ks, self.output_dir(), formats);
        let pipeline = ImagePipeline::new(task, &self.config(), services, workdir, cancel_rx);
        (pipeline, workdir_path)
    }

    fn build_calls(&self) -> Vec<String> {
        events(&self.log)
            .into_iter()
            .filter(|e| e.starts_with("build:") || e.starts_with("target:"))
            .collect()
    }
}

fn no_cancel() -> watch::Receiver<bool> {
    let (_tx, rx) = watch::channel(false);
    rx
}

fn assert_cleaned_up(fixture: &Fixture, pipeline: &ImagePipeline, workdir: &Path) {
    assert_eq!(count(&fixture.log, "server:stop"), 1, "server stopped exactly once");
    assert!(!workdir.exists(), "work directory removed");
    assert_eq!(pipeline.state().state, PipelineState::CleanedUp);
    let cleanups = pipeline
        .state()
        .history
        .iter()
        .filter(|s| **s == PipelineState::CleanedUp)
        .count();
    assert_eq!(cleanups, 1);
}

// ============================================================================
// TESTS
// ============================================================================

#[tokio::test]
async fn test_kvm_and_raw_end_to_end() {
    let mut fixture = Fixture::new();
    let (mut pipeline, workdir) =
        fixture.pipeline(vec![FormatTag::Kvm, FormatTag::Raw], no_cancel());

    let report = pipeline.run().await.unwrap();

    assert!(fixture.output("fedora-atomic.qcow2").exists());
    assert!(fixture.output("fedora-atomic.raw").exists());
    assert!(!fixture.output("fedora-atomic-vsphere.ova").exists());
    assert!(!fixture.output("fedora-atomic-rhevm.ova").exists());

    assert_eq!(fixture.build_calls(), vec!["build:base".to_string()]);
    assert_eq!(count(&fixture.log, "convert:qcow2->raw"), 1);
    assert_eq!(count(&fixture.log, "flatten:F21"), 1);
    assert_eq!(report.port, Some(8080));
    assert_eq!(report.base_id.as_deref(), Some("base-id"));
    assert_eq!(
        report.artifacts,
        vec![fixture.output("fedora-atomic.qcow2"), fixture.output("fedora-atomic.raw")]
    );
    assert!(report.states.contains(&PipelineState::Converting));
    assert!(!report.states.contains(&PipelineState::TargetBuilding));

    assert_cleaned_up(&fixture, &pipeline, &workdir);
}

#[tokio::test]
async fn test_base_parameters_are_rendered() {
    let mut fixture = Fixture::new();
    let (mut pipeline, _workdir) = fixture.pipeline(vec![FormatTag::Kvm], no_cancel());
    pipeline.run().await.unwrap();

    let params = fixture.base_parameters.lock().unwrap().clone().unwrap();
    let script = params["install_script"].as_str().unwrap();
    assert!(script.contains("--url=http://192.168.122.1:8080/"));
    assert!(script.contains("--ref=fedora-atomic/f21/x86_64/docker-host"));
    assert!(script.contains("--osname=fedora-atomic"));
    assert!(script.contains("@core"));
    assert!(!script.contains("@OSTREE_"));

    assert_eq!(params["generate_icicle"], serde_json::json!(false));
    let overrides: serde_json::Value =
        serde_json::from_str(params["oz_overrides"].as_str().unwrap()).unwrap();
    assert_eq!(
        overrides,
        serde_json::json!({"libvirt": {"image_type": "qcow2", "memory": 2048}})
    );
}

#[tokio::test]
async fn test_raw_never_builds_a_target() {
    let mut fixture = Fixture::new();
    let (mut pipeline, _workdir) = fixture.pipeline(vec![FormatTag::Raw], no_cancel());
    pipeline.run().await.unwrap();

    assert!(fixture
        .build_calls()
        .iter()
        .all(|call| !call.starts_with("target:")));
    assert!(fixture.output("fedora-atomic.raw").exists());
}

#[tokio::test]
async fn test_packaged_formats_build_ova_after_target() {
    let mut fixture = Fixture::new();
    let (mut pipeline, workdir) =
        fixture.pipeline(vec![FormatTag::Vsphere, FormatTag::Rhevm], no_cancel());

    let report = pipeline.run().await.unwrap();

    assert_eq!(
        fixture.build_calls(),
        vec![
            "build:base".to_string(),
            "target:vsphere:base-id".to_string(),
            "target:ova:vsphere-id".to_string(),
            "target:rhevm:base-id".to_string(),
            "target:ova:rhevm-id".to_string(),
        ]
    );
    assert!(fixture.output("fedora-atomic-vsphere.ova").exists());
    assert!(fixture.output("fedora-atomic-rhevm.ova").exists());
    assert_eq!(report.ova_ids.len(), 2);
    assert_eq!(count(&fixture.log, "convert:qcow2->raw"), 0);

    assert_cleaned_up(&fixture, &pipeline, &workdir);
}

#[tokio::test]
async fn test_failed_ova_places_nothing() {
    let mut fixture = Fixture::new().with_status("rhevm-ova", ArtifactStatus::Failed);
    let (mut pipeline, workdir) = fixture.pipeline(vec![FormatTag::Rhevm], no_cancel());

    let result = pipeline.run().await;

    match result {
        Err(PipelineError::Build(BuildError::Failed { status, .. })) => {
            assert_eq!(status, "FAILED");
        }
        other => panic!("expected build failure, got {:?}", other.map(|_| ())),
    }
    assert!(!fixture.output("fedora-atomic-rhevm.ova").exists());
    assert!(fixture.output("fedora-atomic.qcow2").exists());
    assert!(pipeline.state().visited(PipelineState::Failed));
    assert_cleaned_up(&fixture, &pipeline, &workdir);
}

#[tokio::test]
async fn test_failed_target_stops_remaining_formats() {
    let mut fixture = Fixture::new().with_status("vsphere", ArtifactStatus::Failed);
    let (mut pipeline, workdir) =
        fixture.pipeline(vec![FormatTag::Vsphere, FormatTag::Rhevm], no_cancel());

    let result = pipeline.run().await;

    assert!(matches!(
        result,
        Err(PipelineError::Build(BuildError::Failed { ref target, .. })) if target == "vsphere"
    ));
    assert_eq!(
        fixture.build_calls(),
        vec!["build:base".to_string(), "target:vsphere:base-id".to_string()]
    );
    assert!(!fixture.output("fedora-atomic-vsphere.ova").exists());
    assert_cleaned_up(&fixture, &pipeline, &workdir);
}

#[tokio::test]
async fn test_failed_base_builds_nothing_else() {
    let mut fixture = Fixture::new().with_status("base", ArtifactStatus::Failed);
    let (mut pipeline, workdir) = fixture.pipeline(FormatTag::ALL.to_vec(), no_cancel());

    let result = pipeline.run().await;

    assert!(matches!(result, Err(PipelineError::Build(BuildError::Failed { .. }))));
    assert_eq!(fixture.build_calls(), vec!["build:base".to_string()]);
    assert!(!fixture.output("fedora-atomic.qcow2").exists());
    assert_cleaned_up(&fixture, &pipeline, &workdir);
}

#[tokio::test]
async fn test_server_start_failure_cleans_up() {
    let mut fixture = Fixture::new();
    fixture.server_fails = true;
    let (mut pipeline, workdir) = fixture.pipeline(vec![FormatTag::Kvm], no_cancel());

    let result = pipeline.run().await;

    assert!(matches!(result, Err(PipelineError::Service(ServiceError::Bind(_)))));
    assert!(fixture.build_calls().is_empty());
    assert_cleaned_up(&fixture, &pipeline, &workdir);
}

#[tokio::test]
async fn test_templating_error_cleans_up() {
    let mut fixture = Fixture::new();
    fixture.kickstart = format!("{}\nrepo --baseurl=@OSTREE_MIRROR@\n", KICKSTART);
    let (mut pipeline, workdir) = fixture.pipeline(vec![FormatTag::Kvm], no_cancel());

    let result = pipeline.run().await;

    match result {
        Err(PipelineError::Template(TemplateError::UnresolvedPlaceholders(keys))) => {
            assert_eq!(keys, vec!["OSTREE_MIRROR".to_string()]);
        }
        other => panic!("expected templating error, got {:?}", other.map(|_| ())),
    }
    assert!(fixture.build_calls().is_empty());
    assert_cleaned_up(&fixture, &pipeline, &workdir);
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let mut fixture = Fixture::new();
    let (tx, rx) = watch::channel(true);
    let (mut pipeline, workdir) = fixture.pipeline(vec![FormatTag::Kvm], rx);

    let result = pipeline.run().await;
    drop(tx);

    assert!(matches!(result, Err(PipelineError::Build(BuildError::Cancelled))));
    assert!(fixture.build_calls().is_empty());
    assert_eq!(count(&fixture.log, "server:start"), 0);
    assert_cleaned_up(&fixture, &pipeline, &workdir);
}

#[tokio::test]
async fn test_cancelled_between_builds() {
    let mut fixture = Fixture::new();
    let (tx, rx) = watch::channel(false);
    fixture.cancel_after_base = Some(tx);
    let (mut pipeline, workdir) =
        fixture.pipeline(vec![FormatTag::Vsphere, FormatTag::Rhevm], rx);

    let result = pipeline.run().await;

    assert!(matches!(result, Err(PipelineError::Build(BuildError::Cancelled))));
    assert_eq!(fixture.build_calls(), vec!["build:base".to_string()]);
    assert_cleaned_up(&fixture, &pipeline, &workdir);
}

#[tokio::test]
async fn test_second_run_is_rejected_without_second_cleanup() {
    let mut fixture = Fixture::new();
    let (mut pipeline, _workdir) = fixture.pipeline(vec![FormatTag::Kvm], no_cancel());
    pipeline.run().await.unwrap();

    let second = pipeline.run().await;

    assert!(matches!(second, Err(PipelineError::InvalidTransition(_))));
    assert_eq!(count(&fixture.log, "server:stop"), 1);
    assert_eq!(count(&fixture.log, "build:base"), 1);
}

#[test]
fn test_bogus_format_rejected_before_any_build() {
    let requested = vec!["kvm".to_string(), "bogus".to_string()];
    match parse_image_types(Some(&requested)) {
        Err(ConfigError::UnknownFormat { given, valid }) => {
            assert_eq!(given, "bogus");
            assert_eq!(valid, "[kvm, raw, vsphere, rhevm]");
        }
        other => panic!("expected unknown format, got {:?}", other),
    }
}
