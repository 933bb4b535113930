//! Run state machine.
//!
//! Every status change a run goes through is one row of [`TRANSITIONS`].
//! Stores call [`plan_transition`] to compute the next record and then apply it
//! with a conditional write against the observed status.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::traits::{Run, RunId, RunnerId, SessionStatus, TransitionRequest};

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Queued, waiting for a runner to claim it.
    Pending,
    /// Claimed by a runner that has not reported start yet.
    Claimed,
    /// Executing on its owning runner.
    Running,
    /// A stop was requested; the owner has not acted on it yet.
    Stopping,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled before or during execution.
    Stopped,
}

impl RunStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [Self; 7] = [
        Self::Pending,
        Self::Claimed,
        Self::Running,
        Self::Stopping,
        Self::Completed,
        Self::Failed,
        Self::Stopped,
    ];

    /// Terminal statuses absorb every transition.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    /// Owned by a runner and not yet terminal.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Claimed | Self::Running | Self::Stopping)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    /// Status reached by applying `transition`, if the table allows it.
    #[must_use]
    pub fn next(self, transition: RunTransition) -> Option<Self> {
        TRANSITIONS
            .iter()
            .find(|(from, label, _)| *from == self && *label == transition)
            .map(|(_, _, to)| *to)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown status string.
#[derive(Debug, Error)]
#[error("unknown status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for RunStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// Labeled edge of the run state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTransition {
    /// A runner takes a pending run.
    Claim,
    /// The owner reports execution started.
    Start,
    /// The owner reports success.
    Complete,
    /// The owner reports failure.
    Fail,
    /// The owner reports it stopped the run.
    Stop,
    /// An operator asks the owner to stop.
    RequestStop,
    /// An operator cancels a run nobody owns yet.
    Cancel,
    /// The reaper hands an orphaned claim back to the queue.
    Requeue,
    /// The reaper gives up on a run whose owner went away.
    Abandon,
}

impl RunTransition {
    /// Reports that only the owning runner may make.
    #[must_use]
    pub const fn requires_owner(self) -> bool {
        matches!(self, Self::Start | Self::Complete | Self::Fail | Self::Stop)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Claim => "claim",
            Self::Start => "start",
            Self::Complete => "complete",
            Self::Fail => "fail",
            Self::Stop => "stop",
            Self::RequestStop => "request_stop",
            Self::Cancel => "cancel",
            Self::Requeue => "requeue",
            Self::Abandon => "abandon",
        }
    }
}

impl fmt::Display for RunTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The complete transition table: `(from, label, to)`.
pub const TRANSITIONS: &[(RunStatus, RunTransition, RunStatus)] = &[
    (RunStatus::Pending, RunTransition::Claim, RunStatus::Claimed),
    (RunStatus::Pending, RunTransition::Cancel, RunStatus::Stopped),
    (RunStatus::Claimed, RunTransition::Start, RunStatus::Running),
    (RunStatus::Claimed, RunTransition::RequestStop, RunStatus::Stopping),
    (RunStatus::Claimed, RunTransition::Requeue, RunStatus::Pending),
    (RunStatus::Claimed, RunTransition::Abandon, RunStatus::Failed),
    (RunStatus::Running, RunTransition::Complete, RunStatus::Completed),
    (RunStatus::Running, RunTransition::Fail, RunStatus::Failed),
    (RunStatus::Running, RunTransition::Stop, RunStatus::Stopped),
    (RunStatus::Running, RunTransition::RequestStop, RunStatus::Stopping),
    (RunStatus::Running, RunTransition::Abandon, RunStatus::Failed),
    (RunStatus::Stopping, RunTransition::Complete, RunStatus::Completed),
    (RunStatus::Stopping, RunTransition::Fail, RunStatus::Failed),
    (RunStatus::Stopping, RunTransition::Stop, RunStatus::Stopped),
    (RunStatus::Stopping, RunTransition::Abandon, RunStatus::Stopped),
];

/// Rejected transition.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("run {run_id}: cannot {transition} from {from}")]
    Illegal {
        run_id: RunId,
        from: RunStatus,
        transition: RunTransition,
    },
    #[error("run {run_id} is owned by {owner:?}, not {runner_id}")]
    NotOwner {
        run_id: RunId,
        runner_id: RunnerId,
        owner: Option<RunnerId>,
    },
    #[error("run {run_id}: {transition} requires a runner id")]
    MissingRunner {
        run_id: RunId,
        transition: RunTransition,
    },
}

/// Compute the record that results from applying `req` to `run`.
///
/// Pure: the caller persists the result with a write conditioned on
/// `run.status` still being current.
///
/// # Errors
/// Returns [`TransitionError`] when the edge is not in [`TRANSITIONS`] or the
/// caller does not own the run.
pub fn plan_transition(run: &Run, req: &TransitionRequest) -> Result<Run, TransitionError> {
    let next = run
        .status
        .next(req.transition)
        .ok_or(TransitionError::Illegal {
            run_id: run.id,
            from: run.status,
            transition: req.transition,
        })?;

    if req.transition.requires_owner() {
        let runner_id = req
            .runner_id
            .as_ref()
            .ok_or(TransitionError::MissingRunner {
                run_id: run.id,
                transition: req.transition,
            })?;
        if run.runner_id.as_ref() != Some(runner_id) {
            return Err(TransitionError::NotOwner {
                run_id: run.id,
                runner_id: runner_id.clone(),
                owner: run.runner_id.clone(),
            });
        }
    }

    let mut updated = run.clone();
    updated.status = next;
    updated.updated_at = req.at;

    match req.transition {
        RunTransition::Claim => {
            let runner_id = req.runner_id.clone().ok_or(TransitionError::MissingRunner {
                run_id: run.id,
                transition: req.transition,
            })?;
            updated.runner_id = Some(runner_id);
            updated.claimed_at = Some(req.at);
        }
        RunTransition::Start => updated.started_at = Some(req.at),
        RunTransition::RequestStop => updated.stop_requested_at = Some(req.at),
        RunTransition::Requeue => {
            updated.runner_id = None;
            updated.claimed_at = None;
            updated.started_at = None;
        }
        RunTransition::Complete => updated.result.clone_from(&req.result),
        RunTransition::Fail
        | RunTransition::Stop
        | RunTransition::Cancel
        | RunTransition::Abandon => {}
    }

    if next.is_terminal() {
        updated.completed_at = Some(req.at);
        if req.error.is_some() {
            updated.error.clone_from(&req.error);
        }
    }

    Ok(updated)
}

/// Derive a session's status from its runs, given as
/// `(created_at, run id, status)`.
///
/// Any active run makes the session `running`; otherwise any queued run makes
/// it `pending`; otherwise it takes the status of its most recent run.
#[must_use]
pub fn derive_session_status<I>(runs: I) -> SessionStatus
where
    I: IntoIterator<Item = (i64, RunId, RunStatus)>,
{
    let mut any_pending = false;
    let mut latest: Option<(i64, RunId, RunStatus)> = None;

    for entry in runs {
        let (_, _, status) = entry;
        if status.is_active() {
            return SessionStatus::Running;
        }
        if status == RunStatus::Pending {
            any_pending = true;
        }
        if latest.is_none_or(|(at, id, _)| (entry.0, entry.1) > (at, id)) {
            latest = Some(entry);
        }
    }

    if any_pending {
        return SessionStatus::Pending;
    }

    match latest.map(|(_, _, status)| status) {
        Some(RunStatus::Completed) => SessionStatus::Completed,
        Some(RunStatus::Failed) => SessionStatus::Failed,
        Some(RunStatus::Stopped) => SessionStatus::Stopped,
        _ => SessionStatus::Pending,
    }
}
