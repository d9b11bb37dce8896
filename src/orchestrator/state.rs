//! Pipeline state machines.
//!
//! Capture:
//!
//! ```text
//! Idle ─▶ SourceSelected ─▶ FilesystemCopying ─▶ ConfigParsed ─▶ AwaitingUserAdjustment ─┐
//!                                                                  ▲         │            │
//!                                                                  └─────────┘ (invalid)  │
//!      Done ◀─ Archived ◀─ Packaged ◀─ Validated ◀──────────────────────────────────────┘
//! ```
//!
//! Deploy:
//!
//! ```text
//! Idle ─▶ Unarchived ─▶ ConfigParsed ─▶ CollisionChecked ─▶ AwaitingUserAdjustment ─▶ Reconciled
//!      ─▶ FilesystemPlaced ─▶ NativeConfigGenerated ─▶ Defined ─▶ Done
//! ```
//!
//! Any non-terminal state may move to `Failed`, which is always followed by
//! `Cleanup` and then `Idle`.

use crate::descriptor::InstanceId;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

/// A state of one of the pipeline state machines
pub trait PipelineState: Copy + Eq + fmt::Debug + fmt::Display + Send + 'static {
    const IDLE: Self;
    const FAILED: Self;
    const CLEANUP: Self;

    /// Whether `next` is a legal successor of `self`
    fn can_transition_to(self, next: Self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaptureState {
    Idle,
    SourceSelected,
    FilesystemCopying,
    ConfigParsed,
    AwaitingUserAdjustment,
    Validated,
    Packaged,
    Archived,
    Done,
    Failed,
    Cleanup,
}

impl CaptureState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureState::Idle => "idle",
            CaptureState::SourceSelected => "source-selected",
            CaptureState::FilesystemCopying => "filesystem-copying",
            CaptureState::ConfigParsed => "config-parsed",
            CaptureState::AwaitingUserAdjustment => "awaiting-user-adjustment",
            CaptureState::Validated => "validated",
            CaptureState::Packaged => "packaged",
            CaptureState::Archived => "archived",
            CaptureState::Done => "done",
            CaptureState::Failed => "failed",
            CaptureState::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PipelineState for CaptureState {
    const IDLE: Self = CaptureState::Idle;
    const FAILED: Self = CaptureState::Failed;
    const CLEANUP: Self = CaptureState::Cleanup;

    fn can_transition_to(self, next: Self) -> bool {
        use CaptureState::*;
        match (self, next) {
            (Done | Failed | Cleanup, Failed) => false,
            (_, Failed) => true,
            (Failed, Cleanup) | (Cleanup, Idle) => true,
            (Idle, SourceSelected)
            | (SourceSelected, FilesystemCopying)
            | (FilesystemCopying, ConfigParsed)
            | (ConfigParsed, AwaitingUserAdjustment)
            | (AwaitingUserAdjustment, AwaitingUserAdjustment)
            | (AwaitingUserAdjustment, Validated)
            | (Validated, Packaged)
            | (Packaged, Archived)
            | (Archived, Done) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeployState {
    Idle,
    Unarchived,
    ConfigParsed,
    CollisionChecked,
    AwaitingUserAdjustment,
    Reconciled,
    FilesystemPlaced,
    NativeConfigGenerated,
    Defined,
    Done,
    Failed,
    Cleanup,
}

impl DeployState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployState::Idle => "idle",
            DeployState::Unarchived => "unarchived",
            DeployState::ConfigParsed => "config-parsed",
            DeployState::CollisionChecked => "collision-checked",
            DeployState::AwaitingUserAdjustment => "awaiting-user-adjustment",
            DeployState::Reconciled => "reconciled",
            DeployState::FilesystemPlaced => "filesystem-placed",
            DeployState::NativeConfigGenerated => "native-config-generated",
            DeployState::Defined => "defined",
            DeployState::Done => "done",
            DeployState::Failed => "failed",
            DeployState::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for DeployState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PipelineState for DeployState {
    const IDLE: Self = DeployState::Idle;
    const FAILED: Self = DeployState::Failed;
    const CLEANUP: Self = DeployState::Cleanup;

    fn can_transition_to(self, next: Self) -> bool {
        use DeployState::*;
        match (self, next) {
            (Done | Failed | Cleanup, Failed) => false,
            (_, Failed) => true,
            (Failed, Cleanup) | (Cleanup, Idle) => true,
            (Idle, Unarchived)
            | (Unarchived, ConfigParsed)
            | (ConfigParsed, CollisionChecked)
            | (CollisionChecked, AwaitingUserAdjustment)
            | (AwaitingUserAdjustment, AwaitingUserAdjustment)
            | (AwaitingUserAdjustment, Reconciled)
            | (Reconciled, FilesystemPlaced)
            | (FilesystemPlaced, NativeConfigGenerated)
            | (NativeConfigGenerated, Defined)
            | (Defined, Done) => true,
            _ => false,
        }
    }
}

/// Ordered record of the states one run visited
#[derive(Debug, Clone)]
pub struct StateLog<S: PipelineState> {
    pipeline: &'static str,
    template_name: String,
    states: Vec<S>,
}

impl<S: PipelineState> StateLog<S> {
    pub fn new(pipeline: &'static str, template_name: impl Into<String>) -> Self {
        Self {
            pipeline,
            template_name: template_name.into(),
            states: vec![S::IDLE],
        }
    }

    pub fn current(&self) -> S {
        self.states.last().copied().unwrap_or(S::IDLE)
    }

    pub fn states(&self) -> &[S] {
        &self.states
    }

    /// Move to `next`. Illegal transitions are logged and still recorded.
    pub fn enter(&mut self, next: S) {
        let current = self.current();
        if !current.can_transition_to(next) {
            warn!(
                "{} '{}': unexpected transition {} -> {}",
                self.pipeline, self.template_name, current, next
            );
        }
        debug!(
            "{} '{}': {} -> {}",
            self.pipeline, self.template_name, current, next
        );
        self.states.push(next);
    }

    /// Record `Failed -> Cleanup`; the caller runs cleanup then calls
    /// [`finish_failure`](Self::finish_failure)
    pub fn begin_failure(&mut self) {
        self.enter(S::FAILED);
        self.enter(S::CLEANUP);
    }

    pub fn finish_failure(&mut self) {
        self.enter(S::IDLE);
    }

    pub fn into_report(self, instance: Option<InstanceId>, adjustment_rounds: u32) -> RunReport<S> {
        info!(
            "{} '{}' finished in state {}",
            self.pipeline,
            self.template_name,
            self.current()
        );
        RunReport {
            template_name: self.template_name,
            instance,
            states: self.states,
            adjustment_rounds,
        }
    }
}

/// Summary of a successful pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport<S> {
    pub template_name: String,
    /// Source instance on capture, created instance on deploy
    pub instance: Option<InstanceId>,
    pub states: Vec<S>,
    /// Number of times the adjuster was consulted
    pub adjustment_rounds: u32,
}

pub type CaptureReport = RunReport<CaptureState>;
pub type DeployReport = RunReport<DeployState>;
