//! Media pipeline engine contract
//!
//! The capture/encode pipeline itself is an external collaborator. This
//! module pins down the three operations the air unit consumes it
//! through: construct-from-description, bounded state get/set, and
//! pull-one-buffer-with-timeout. Everything here is bounded-time so a
//! wedged engine can never hang the caller indefinitely.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use raiju_core::FrameFragment;

/// Gross pipeline state as tracked by the media engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Fully torn down, no resources held
    Null,
    /// Constructed but not producing samples
    Paused,
    /// Producing samples
    Playing,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Null => write!(f, "null"),
            PipelineState::Paused => write!(f, "paused"),
            PipelineState::Playing => write!(f, "playing"),
        }
    }
}

/// Outcome of a state change or bounded state query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    /// The engine reached the requested state
    Success,
    /// The engine is still transitioning
    Async,
    /// The engine failed or is wedged
    Failure,
}

/// Snapshot returned by a bounded state query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateQuery {
    pub result: StateChange,
    pub current: PipelineState,
    pub pending: Option<PipelineState>,
}

impl StateQuery {
    /// True when the engine reported failure; this is the health check's
    /// restart trigger.
    pub fn is_failed(&self) -> bool {
        matches!(self.result, StateChange::Failure)
    }
}

impl fmt::Display for StateQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ret:{:?} state:{}", self.result, self.current)?;
        match self.pending {
            Some(pending) => write!(f, " pending:{pending}"),
            None => write!(f, " pending:-"),
        }
    }
}

/// One constructed media pipeline.
///
/// All operations are bounded by the given timeout; `try_pull` returning
/// `None` means "nothing within the timeout", which callers treat the
/// same as a pull failure.
pub trait Pipeline: Send + Sync {
    /// Drive the pipeline towards `target`, waiting at most `timeout`.
    fn set_state(&self, target: PipelineState, timeout: Duration) -> Result<()>;

    /// Query the current state, waiting at most `timeout` for a pending
    /// transition to settle.
    fn query_state(&self, timeout: Duration) -> StateQuery;

    /// Pull one encoded buffer, waiting at most `timeout`.
    fn try_pull(&self, timeout: Duration) -> Option<FrameFragment>;
}

/// Constructs pipelines from a textual description.
pub trait PipelineEngine: Send + Sync {
    /// Build a pipeline. Fails with a descriptive error when the
    /// description cannot be parsed or the engine cannot start.
    fn build(&self, description: &str) -> Result<Arc<dyn Pipeline>>;
}
