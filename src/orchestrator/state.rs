//! Pipeline state tracking.
//!
//! A compose run moves through a fixed set of states:
//!
//! ```text
//! Init -> Serving -> Templating -> BaseBuilding -> BaseDone
//!      -> [Converting]
//!      -> [TargetBuilding -> TargetDone -> [OvaBuilding -> OvaDone]]*
//!      -> ArtifactsPlaced -> CleanedUp
//! ```
//!
//! `Failed` is reachable from every state before `ArtifactsPlaced` and only
//! leads to `CleanedUp`. Every transition is validated.

use crate::error::PipelineError;
use crate::models::FormatTag;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineState {
    Init,
    /// Commit resolved, content server starting
    Serving,
    /// Kickstart flattening, substitution, override computation
    Templating,
    BaseBuilding,
    BaseDone,
    /// Local qcow2 -> raw conversion
    Converting,
    TargetBuilding,
    TargetDone,
    OvaBuilding,
    OvaDone,
    ArtifactsPlaced,
    Failed,
    /// Server stopped, work directory removed
    CleanedUp,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Init => "init",
            PipelineState::Serving => "serving",
            PipelineState::Templating => "templating",
            PipelineState::BaseBuilding => "base_building",
            PipelineState::BaseDone => "base_done",
            PipelineState::Converting => "converting",
            PipelineState::TargetBuilding => "target_building",
            PipelineState::TargetDone => "target_done",
            PipelineState::OvaBuilding => "ova_building",
            PipelineState::OvaDone => "ova_done",
            PipelineState::ArtifactsPlaced => "artifacts_placed",
            PipelineState::Failed => "failed",
            PipelineState::CleanedUp => "cleaned_up",
        }
    }

    /// All valid states reachable FROM this state.
    pub fn valid_next_states(&self) -> Vec<PipelineState> {
        use PipelineState::*;
        match self {
            Init => vec![Serving, Failed],
            Serving => vec![Templating, Failed],
            Templating => vec![BaseBuilding, Failed],
            BaseBuilding => vec![BaseDone, Failed],
            BaseDone => vec![Converting, TargetBuilding, ArtifactsPlaced, Failed],
            Converting => vec![TargetBuilding, ArtifactsPlaced, Failed],
            TargetBuilding => vec![TargetDone, Failed],
            TargetDone => vec![OvaBuilding, TargetBuilding, ArtifactsPlaced, Failed],
            OvaBuilding => vec![OvaDone, Failed],
            OvaDone => vec![TargetBuilding, ArtifactsPlaced, Failed],
            ArtifactsPlaced => vec![CleanedUp],
            Failed => vec![CleanedUp],
            CleanedUp => vec![],
        }
    }

    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        self.valid_next_states().contains(&next)
    }

    pub fn is_terminal(&self) -> bool {
        *self == PipelineState::CleanedUp
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of one compose run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationState {
    pub state: PipelineState,
    /// Format whose target or OVA build is in progress
    pub current_format: Option<FormatTag>,
    pub error: Option<String>,
    /// Every state entered, in order, starting with `Init`
    pub history: Vec<PipelineState>,
    pub start_time: SystemTime,
    pub last_update_time: SystemTime,
}

impl Default for OrchestrationState {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestrationState {
    pub fn new() -> Self {
        let now = SystemTime::now();
        OrchestrationState {
            state: PipelineState::Init,
            current_format: None,
            error: None,
            history: vec![PipelineState::Init],
            start_time: now,
            last_update_time: now,
        }
    }

    pub fn transition_to(&mut self, next: PipelineState) -> Result<(), PipelineError> {
        if !self.state.can_transition_to(next) {
            return Err(PipelineError::InvalidTransition(format!(
                "{} -> {}",
                self.state, next
            )));
        }
        log::debug!("[Pipeline] {} -> {}", self.state, next);
        self.enter(next);
        Ok(())
    }

    /// Record an error and move to `Failed`, whatever the current state.
    ///
    /// No effect once the run is already failed or cleaned up.
    pub fn record_error(&mut self, error: String) {
        if matches!(self.state, PipelineState::Failed | PipelineState::CleanedUp) {
            return;
        }
        self.error = Some(error);
        self.enter(PipelineState::Failed);
    }

    pub fn set_format(&mut self, format: Option<FormatTag>) {
        self.current_format = format;
    }

    pub fn visited(&self, state: PipelineState) -> bool {
        self.history.contains(&state)
    }

    pub fn elapsed_since_start(&self) -> Duration {
        self.start_time.elapsed().unwrap_or_default()
    }

    fn enter(&mut self, next: PipelineState) {
        self.state = next;
        self.history.push(next);
        self.last_update_time = SystemTime::now();
    }
}
