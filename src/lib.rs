//! OSTree image compose
//!
//! Turns a commit in an OSTree repository into bootable disk images. The
//! repository is served over HTTP to an installer driven by an image build
//! engine; the resulting base image is then converted or re-targeted into
//! the requested output formats.
//!
//! The crate is organized into functional modules:
//! - **error**: Error types per concern plus the top-level `PipelineError`
//! - **models**: Formats, tasks, artifacts, substitution data
//! - **config**: Task configuration (`config.ini`) and engine overrides
//! - **template**: Kickstart flattening and placeholder substitution
//! - **builder**: Image builder backends (ImageFactory, koji)
//! - **system**: Content server, commit lookup, image conversion
//! - **orchestrator**: The compose state machine and command execution
//! - **log_collector**: Channel-backed `log` implementation

pub mod error;
pub mod models;

pub mod config;
pub mod template;

pub mod builder;
pub mod system;

pub mod log_collector;
pub mod orchestrator;

// Re-export the log crate for macro usage
pub use log;

pub use log_collector::{init_global_logger, LogCollector, LogLine, LogSettings};

// ============================================================================
// PUBLIC RE-EXPORTS FOR CONVENIENCE
// ============================================================================

pub use error::{
    ArtifactError, BuildError, CommandError, ConfigError, PipelineError, Result, ServiceError,
    TemplateError,
};

pub use models::{
    parse_image_types, ArtifactStatus, BuildArtifact, BuildTask, CommitInfo, FormatPlan,
    FormatTag, ImageTarget, ParameterBag, RepoSource, SubstitutionMap,
};

pub use builder::{create_builder, BuilderKind, ImageBuilder};
pub use config::{BuildOverrides, EngineSettings, OverrideMap, TaskConfig};
pub use orchestrator::{ImagePipeline, OrchestrationState, PipelineReport, PipelineServices, PipelineState};
pub use system::{CommitResolver, ContentServer, DiskFormat, ImageConverter};
pub use template::{substitute, KickstartFlattener, TemplateResolver, VariantProfiles};
