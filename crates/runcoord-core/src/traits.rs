//! Core records and the storage trait.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    SessionContext,
    event::{Event, EventQuery, NewEvent},
    state::{RunStatus, RunTransition, TransitionError},
};

/// Session identifier, chosen by the caller that creates the first run.
pub type SessionId = String;

/// Run identifier (UUIDv7, so ids sort in creation order).
pub type RunId = Uuid;

/// Runner identifier, chosen by the runner process.
pub type RunnerId = String;

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Session status, derived from the session's runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// No runs yet, or only queued runs.
    Pending,
    /// At least one run is claimed, running or stopping.
    Running,
    /// The latest run completed.
    Completed,
    /// The latest run failed.
    Failed,
    /// The latest run was stopped.
    Stopped,
}

impl SessionStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        [
            Self::Pending,
            Self::Running,
            Self::Completed,
            Self::Failed,
            Self::Stopped,
        ]
        .into_iter()
        .find(|status| status.as_str() == s)
    }
}

/// Whether a run starts a fresh executor session or resumes one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    #[default]
    Start,
    Resume,
}

impl RunKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Resume => "resume",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "start" => Some(Self::Start),
            "resume" => Some(Self::Resume),
            _ => None,
        }
    }
}

/// How the runner's executor reports back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Sync,
    AsyncPoll,
    AsyncCallback,
}

impl ExecutionMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::AsyncPoll => "async_poll",
            Self::AsyncCallback => "async_callback",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sync" => Some(Self::Sync),
            "async_poll" => Some(Self::AsyncPoll),
            "async_callback" => Some(Self::AsyncCallback),
            _ => None,
        }
    }
}

/// Persisted session data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    /// Display name.
    pub name: String,
    pub status: SessionStatus,
    pub context: SessionContext,
    /// Id the executor assigned to its own session (for resume).
    pub executor_session_id: Option<String>,
    /// Host the session was created for.
    pub host: String,
    /// Creation timestamp (ms).
    pub created_at: i64,
    /// Last modification timestamp (ms).
    pub updated_at: i64,
}

/// One unit of queued work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub session_id: SessionId,
    pub kind: RunKind,
    pub status: RunStatus,
    pub prompt: String,
    pub mode: ExecutionMode,
    /// Capability labels a runner must advertise to claim this run.
    #[serde(default)]
    pub requires: Vec<String>,
    /// Owning runner, set on claim.
    pub runner_id: Option<RunnerId>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: i64,
    pub claimed_at: Option<i64>,
    pub started_at: Option<i64>,
    pub stop_requested_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub updated_at: i64,
}

impl Run {
    /// Whether a runner advertising `capabilities` may claim this run.
    #[must_use]
    pub fn matches(&self, capabilities: &[String]) -> bool {
        self.requires.iter().all(|label| capabilities.contains(label))
    }

    /// FIFO key: creation time, then id.
    #[must_use]
    pub const fn queue_key(&self) -> (i64, RunId) {
        (self.created_at, self.id)
    }

    /// Whether `runner_id` may attach progress events to this run: it must
    /// own the run and the run must not be terminal.
    ///
    /// # Errors
    /// `Conflict` naming the reason.
    pub fn accepts_progress_from(&self, runner_id: &str) -> Result<(), StoreError> {
        if self.runner_id.as_deref() != Some(runner_id) {
            return Err(StoreError::Conflict(format!(
                "run {} is not owned by {runner_id}",
                self.id
            )));
        }
        if self.status.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "run {} is already {}",
                self.id, self.status
            )));
        }
        Ok(())
    }
}

/// Input for creating a run (and, on first use, its session).
#[derive(Debug, Clone)]
pub struct NewRun {
    pub session_id: SessionId,
    pub name: Option<String>,
    pub context: SessionContext,
    pub host: String,
    pub kind: RunKind,
    pub prompt: String,
    pub mode: ExecutionMode,
    pub requires: Vec<String>,
}

impl NewRun {
    /// Display name for a new session: the explicit name, else the first
    /// prompt line cut to 80 characters.
    #[must_use]
    pub fn display_name(&self) -> String {
        if let Some(name) = self.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            return name.to_string();
        }
        let first = self.prompt.lines().next().unwrap_or_default().trim();
        if first.is_empty() {
            self.session_id.clone()
        } else {
            first.chars().take(80).collect()
        }
    }
}

/// A requested state change.
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub run_id: RunId,
    pub transition: RunTransition,
    /// Acting runner; required for claims and owner reports.
    pub runner_id: Option<RunnerId>,
    pub result: Option<String>,
    pub error: Option<String>,
    /// Executor-assigned session id, recorded on the session on start.
    pub executor_session_id: Option<String>,
    pub at: i64,
}

impl TransitionRequest {
    #[must_use]
    pub fn new(run_id: RunId, transition: RunTransition) -> Self {
        Self {
            run_id,
            transition,
            runner_id: None,
            result: None,
            error: None,
            executor_session_id: None,
            at: now_millis(),
        }
    }

    #[must_use]
    pub fn by_runner(mut self, runner_id: impl Into<RunnerId>) -> Self {
        self.runner_id = Some(runner_id.into());
        self
    }

    #[must_use]
    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    #[must_use]
    pub fn with_executor_session_id(mut self, id: Option<String>) -> Self {
        self.executor_session_id = id;
        self
    }
}

/// A persisted state change together with its event.
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub run: Run,
    pub previous: RunStatus,
    pub event: Event,
}

/// A newly created run together with its event.
#[derive(Debug, Clone)]
pub struct CreatedRun {
    pub run: Run,
    pub session: Session,
    pub event: Event,
}

/// Run filter for queries.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub session_id: Option<SessionId>,
    pub runner_id: Option<RunnerId>,
    /// Only claimed, running or stopping runs.
    pub active_only: bool,
    pub limit: Option<usize>,
}

impl RunFilter {
    #[must_use]
    pub fn matches(&self, run: &Run) -> bool {
        self.status.is_none_or(|s| run.status == s)
            && self.session_id.as_ref().is_none_or(|s| &run.session_id == s)
            && self
                .runner_id
                .as_ref()
                .is_none_or(|r| run.runner_id.as_ref() == Some(r))
            && (!self.active_only || run.status.is_active())
    }
}

/// Session filter for queries.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub status: Option<SessionStatus>,
    pub agent: Option<String>,
    pub limit: Option<usize>,
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Storage error: {0}")]
    Internal(String),
}

impl StoreError {
    #[must_use]
    pub fn run_not_found(id: RunId) -> Self {
        Self::NotFound {
            kind: "run",
            id: id.to_string(),
        }
    }

    #[must_use]
    pub fn session_not_found(id: &str) -> Self {
        Self::NotFound {
            kind: "session",
            id: id.to_string(),
        }
    }
}

impl From<TransitionError> for StoreError {
    fn from(e: TransitionError) -> Self {
        Self::Conflict(e.to_string())
    }
}

/// Durable run, session and event store.
///
/// Every state change goes through a conditional write so that concurrent
/// callers racing on the same run produce exactly one winner.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Persist a pending run, creating its session on first use.
    ///
    /// A `resume` run for an unknown session is `NotFound`.
    async fn create_run(&self, new: NewRun) -> Result<CreatedRun, StoreError>;

    /// Get a run by id.
    async fn get_run(&self, id: RunId) -> Result<Option<Run>, StoreError>;

    /// List runs in queue order (oldest first).
    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<Run>, StoreError>;

    /// Atomically claim the oldest pending run whose requirements are covered
    /// by `capabilities`. Losing every race yields `Ok(None)`.
    async fn claim_next(
        &self,
        runner_id: &str,
        capabilities: &[String],
        at: i64,
    ) -> Result<Option<TransitionOutcome>, StoreError>;

    /// Apply a transition from the table, conditioned on the observed status.
    async fn transition(&self, req: TransitionRequest) -> Result<TransitionOutcome, StoreError>;

    /// Get a session by id.
    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError>;

    /// List sessions, newest first.
    async fn list_sessions(&self, filter: SessionFilter) -> Result<Vec<Session>, StoreError>;

    /// Delete a session with its runs and events. `Conflict` while any run
    /// is not terminal.
    async fn delete_session(&self, id: &str) -> Result<(), StoreError>;

    /// Append a progress event.
    async fn append_event(&self, event: NewEvent) -> Result<Event, StoreError>;

    /// Append a progress event for `run_id` on behalf of `runner_id`.
    ///
    /// The ownership and non-terminal check happens in the same write as the
    /// insert, so no event lands after the run's terminal transition. The
    /// event's session and run ids are taken from the stored run.
    async fn append_run_event(
        &self,
        run_id: RunId,
        runner_id: &str,
        event: NewEvent,
    ) -> Result<Event, StoreError>;

    /// Session events ordered by (timestamp, id).
    async fn list_events(&self, session_id: &str, query: EventQuery)
    -> Result<Vec<Event>, StoreError>;
}
