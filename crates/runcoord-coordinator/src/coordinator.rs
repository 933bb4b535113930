//! Run coordinator.
//!
//! Composes the run store, runner registry, stop channel and event
//! broadcaster. One `Coordinator` is created at startup and shared by the
//! API; dropping it drops all process-local state.

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use runcoord_core::{
    Event, EventBroadcaster, EventQuery, EventType, NewEvent, Run, RunId, RunStatus, RunStore,
    RunTransition, Session, SessionContext, SessionId, StoreError, now_millis,
    traits::{
        CreatedRun, ExecutionMode, NewRun, RunFilter, RunKind, SessionFilter, TransitionOutcome,
        TransitionRequest,
    },
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use uuid::Uuid;

use crate::{
    config::{CoordinatorConfig, ReaperPolicy},
    registry::{Initiator, Registration, RegistryError, RunnerEntry, RunnerRegistry, RunnerView},
    stops::StopChannel,
};

/// Attempts at a stop before giving up on a run that keeps changing.
const STOP_ATTEMPTS: usize = 3;

/// Coordinator error.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("Validation error: {0}")]
    Validation(String),
}

impl From<RegistryError> for CoordinatorError {
    fn from(e: RegistryError) -> Self {
        Self::Conflict(e.to_string())
    }
}

/// Request to queue a run.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RunRequest {
    /// Existing or new session; generated when omitted.
    pub session_id: Option<SessionId>,
    pub name: Option<String>,
    pub agent: String,
    pub working_dir: Option<PathBuf>,
    pub parent_session_id: Option<SessionId>,
    pub metadata: HashMap<String, Value>,
    /// Defaults to the coordinator's host id.
    pub host: Option<String>,
    pub kind: RunKind,
    pub prompt: String,
    pub mode: ExecutionMode,
    pub requires: Vec<String>,
}

/// A runner's status report for one of its runs.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RunnerReport {
    pub runner_id: String,
    pub result: Option<String>,
    pub error: Option<String>,
    pub executor_session_id: Option<String>,
}

/// A progress event posted by the owning runner.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressEvent {
    pub runner_id: String,
    pub event_type: EventType,
    #[serde(default)]
    pub payload: Value,
}

/// Runner registration request.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRunner {
    pub runner_id: String,
    pub host: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Instruction handed to a runner on poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Directive {
    /// Stop the given run and report `stopped`.
    Stop { run_id: RunId },
    /// Finish up and deregister.
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollResult {
    pub run: Option<Run>,
    pub directives: Vec<Directive>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterOutcome {
    #[serde(flatten)]
    pub runner: RunnerEntry,
    pub registration: Registration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub runner_id: String,
    pub was_stale: bool,
    pub shutdown: bool,
}

/// Registry entry with the runs it currently owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerInfo {
    #[serde(flatten)]
    pub view: RunnerView,
    pub active_runs: Vec<RunId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deregistration {
    pub runner_id: String,
    pub initiated_by: Initiator,
    pub removed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopOutcome {
    pub run: Run,
    pub already_stopping: bool,
    pub directive_enqueued: bool,
}

/// What one maintenance pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub retired: Vec<String>,
    pub reaped: Vec<RunId>,
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn require(field: &str, value: &str) -> Result<(), CoordinatorError> {
    if value.trim().is_empty() {
        return Err(CoordinatorError::Validation(format!(
            "{field} must not be empty"
        )));
    }
    Ok(())
}

fn require_labels(labels: &[String]) -> Result<(), CoordinatorError> {
    if labels.iter().any(|label| label.trim().is_empty()) {
        return Err(CoordinatorError::Validation(
            "capability labels must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Run coordinator.
pub struct Coordinator<S: RunStore> {
    store: S,
    registry: RunnerRegistry,
    stops: StopChannel,
    broadcaster: EventBroadcaster,
    config: CoordinatorConfig,
}

impl<S: RunStore> Coordinator<S> {
    #[must_use]
    pub fn new(store: S, config: CoordinatorConfig) -> Self {
        Self {
            registry: RunnerRegistry::new(config.heartbeat_timeout),
            stops: StopChannel::new(),
            broadcaster: EventBroadcaster::new(config.stream_buffer)
                .with_disconnect_on_lag(config.disconnect_on_lag),
            store,
            config,
        }
    }

    pub const fn store(&self) -> &S {
        &self.store
    }

    pub const fn registry(&self) -> &RunnerRegistry {
        &self.registry
    }

    pub const fn broadcaster(&self) -> &EventBroadcaster {
        &self.broadcaster
    }

    pub const fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    fn publish(&self, event: &Event) {
        let receivers = self.broadcaster.publish(event);
        tracing::trace!(event_id = event.id, session_id = %event.session_id, receivers, "Event broadcast");
    }

    /// Log, drop stale stop commands and broadcast after a persisted transition.
    async fn settle(&self, outcome: &TransitionOutcome) {
        let run = &outcome.run;
        if run.status.is_terminal() {
            if let Some(cmd) = self.stops.discard(run.id).await {
                if !cmd.acknowledged {
                    tracing::debug!(run_id = %run.id, "Run finished before its stop directive was observed");
                }
            }
        }
        tracing::info!(
            run_id = %run.id,
            session_id = %run.session_id,
            runner_id = run.runner_id.as_deref().unwrap_or("-"),
            from = %outcome.previous,
            to = %run.status,
            "Run transition"
        );
        self.publish(&outcome.event);
    }

    // ---- Run queue ----

    fn new_run(&self, req: RunRequest) -> Result<NewRun, CoordinatorError> {
        require("prompt", &req.prompt)?;
        require_labels(&req.requires)?;

        let session_id = match req.session_id {
            Some(id) => {
                require("session_id", &id)?;
                id
            }
            None if req.kind == RunKind::Resume => {
                return Err(CoordinatorError::Validation(
                    "resume runs need a session_id".to_string(),
                ));
            }
            None => Uuid::new_v4().to_string(),
        };
        if req.kind == RunKind::Start {
            require("agent", &req.agent)?;
        }

        let mut context = SessionContext::new(req.agent);
        context.working_dir = req.working_dir;
        context.parent_session_id = req.parent_session_id;
        context.metadata = req.metadata;

        Ok(NewRun {
            session_id,
            name: req.name,
            context,
            host: req
                .host
                .filter(|h| !h.trim().is_empty())
                .unwrap_or_else(|| self.config.host_id.clone()),
            kind: req.kind,
            prompt: req.prompt,
            mode: req.mode,
            requires: req.requires,
        })
    }

    /// Queue a pending run, creating its session on first use.
    ///
    /// # Errors
    /// `Validation` for malformed requests; `NotFound` when resuming an
    /// unknown session.
    pub async fn create_run(&self, req: RunRequest) -> Result<CreatedRun, CoordinatorError> {
        let created = self.store.create_run(self.new_run(req)?).await?;
        tracing::info!(
            run_id = %created.run.id,
            session_id = %created.run.session_id,
            kind = created.run.kind.as_str(),
            "Run queued"
        );
        self.publish(&created.event);
        Ok(created)
    }

    /// Hand the next matching run to `runner_id`, along with any stop or
    /// shutdown directives waiting for it.
    ///
    /// Capabilities default to the registered ones. A poll is a heartbeat.
    ///
    /// # Errors
    /// `Validation` for an empty runner id, or a storage failure.
    pub async fn poll(
        &self,
        runner_id: &str,
        capabilities: Option<Vec<String>>,
    ) -> Result<PollResult, CoordinatorError> {
        require("runner_id", runner_id)?;
        let now = now_millis();
        let registered = self.registry.touch(runner_id, now).await;
        let retiring = registered.as_ref().is_some_and(RunnerEntry::is_retiring);

        // Claim before taking stop commands so a failed claim leaves them queued.
        let run = if retiring {
            None
        } else {
            let capabilities = capabilities
                .or_else(|| registered.map(|entry| entry.capabilities))
                .unwrap_or_default();
            match self.store.claim_next(runner_id, &capabilities, now).await? {
                Some(outcome) => {
                    self.settle(&outcome).await;
                    Some(outcome.run)
                }
                None => None,
            }
        };

        let mut directives: Vec<Directive> = self
            .stops
            .take_for_runner(runner_id)
            .await
            .into_iter()
            .map(|cmd| {
                tracing::info!(run_id = %cmd.run_id, runner_id, "Stop directive delivered");
                Directive::Stop { run_id: cmd.run_id }
            })
            .collect();
        if retiring {
            directives.push(Directive::Shutdown);
        }

        Ok(PollResult { run, directives })
    }

    async fn report(
        &self,
        run_id: RunId,
        transition: RunTransition,
        report: RunnerReport,
    ) -> Result<Run, CoordinatorError> {
        require("runner_id", &report.runner_id)?;
        let runner_id = report.runner_id;
        self.registry.touch(&runner_id, now_millis()).await;

        let mut req = TransitionRequest::new(run_id, transition)
            .by_runner(runner_id.clone())
            .with_executor_session_id(report.executor_session_id);
        req.result = report.result;
        req.error = report.error;

        match self.store.transition(req).await {
            Ok(outcome) => {
                self.settle(&outcome).await;
                Ok(outcome.run)
            }
            Err(e) => {
                tracing::debug!(%run_id, %runner_id, %transition, error = %e, "Report rejected");
                Err(e.into())
            }
        }
    }

    /// `claimed -> running`.
    ///
    /// # Errors
    /// `Conflict` for non-owners and out-of-order reports.
    pub async fn report_started(
        &self,
        run_id: RunId,
        report: RunnerReport,
    ) -> Result<Run, CoordinatorError> {
        self.report(run_id, RunTransition::Start, report).await
    }

    /// `running|stopping -> completed`.
    ///
    /// # Errors
    /// `Conflict` for non-owners and out-of-order reports.
    pub async fn report_completed(
        &self,
        run_id: RunId,
        report: RunnerReport,
    ) -> Result<Run, CoordinatorError> {
        self.report(run_id, RunTransition::Complete, report).await
    }

    /// `running|stopping -> failed`.
    ///
    /// # Errors
    /// `Conflict` for non-owners and out-of-order reports.
    pub async fn report_failed(
        &self,
        run_id: RunId,
        report: RunnerReport,
    ) -> Result<Run, CoordinatorError> {
        self.report(run_id, RunTransition::Fail, report).await
    }

    /// `running|stopping -> stopped`.
    ///
    /// # Errors
    /// `Conflict` for non-owners and out-of-order reports.
    pub async fn report_stopped(
        &self,
        run_id: RunId,
        report: RunnerReport,
    ) -> Result<Run, CoordinatorError> {
        self.report(run_id, RunTransition::Stop, report).await
    }

    /// Persist and broadcast a progress event from the owning runner.
    ///
    /// # Errors
    /// `Validation` for `run_status` events, `NotFound` for unknown runs,
    /// `Conflict` for non-owners or terminal runs.
    pub async fn record_event(
        &self,
        run_id: RunId,
        event: ProgressEvent,
    ) -> Result<Event, CoordinatorError> {
        require("runner_id", &event.runner_id)?;
        if !event.event_type.is_progress() {
            return Err(CoordinatorError::Validation(format!(
                "{} events are recorded by run transitions",
                event.event_type
            )));
        }

        let stored = self
            .store
            .append_run_event(
                run_id,
                &event.runner_id,
                NewEvent {
                    session_id: SessionId::new(),
                    run_id: Some(run_id),
                    event_type: event.event_type,
                    timestamp: now_millis(),
                    payload: event.payload,
                },
            )
            .await?;
        self.publish(&stored);
        Ok(stored)
    }

    // ---- Stop channel ----

    /// Ask a run to stop.
    ///
    /// Claimed and running runs move to `stopping` and a directive is queued
    /// for the owner. Pending runs are cancelled. A run already `stopping`
    /// is left alone.
    ///
    /// # Errors
    /// `NotFound` for unknown runs, `Conflict` for terminal runs.
    pub async fn request_stop(&self, run_id: RunId) -> Result<StopOutcome, CoordinatorError> {
        for _ in 0..STOP_ATTEMPTS {
            let run = self.get_run(run_id).await?;
            let transition = match run.status {
                RunStatus::Stopping => {
                    tracing::debug!(%run_id, "Stop already requested");
                    return Ok(StopOutcome {
                        run,
                        already_stopping: true,
                        directive_enqueued: false,
                    });
                }
                RunStatus::Pending => RunTransition::Cancel,
                RunStatus::Claimed | RunStatus::Running => RunTransition::RequestStop,
                RunStatus::Completed | RunStatus::Failed | RunStatus::Stopped => {
                    return Err(CoordinatorError::Conflict(format!(
                        "run {run_id} is already {}",
                        run.status
                    )));
                }
            };

            match self
                .store
                .transition(TransitionRequest::new(run_id, transition))
                .await
            {
                Ok(outcome) => return self.finish_stop(outcome).await,
                Err(StoreError::Conflict(reason)) => {
                    tracing::debug!(%run_id, %reason, "Stop raced another transition");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(CoordinatorError::Conflict(format!(
            "run {run_id} kept changing while stopping"
        )))
    }

    async fn finish_stop(&self, outcome: TransitionOutcome) -> Result<StopOutcome, CoordinatorError> {
        self.settle(&outcome).await;
        let run = outcome.run;

        let mut directive_enqueued = false;
        if let (RunStatus::Stopping, Some(owner)) = (run.status, run.runner_id.as_deref()) {
            directive_enqueued = self.stops.enqueue(run.id, owner, run.updated_at).await;
            // The owner may have finished between the transition and the enqueue.
            if self
                .store
                .get_run(run.id)
                .await?
                .is_some_and(|current| current.status.is_terminal())
            {
                self.stops.discard(run.id).await;
                directive_enqueued = false;
            }
        }

        Ok(StopOutcome {
            run,
            already_stopping: false,
            directive_enqueued,
        })
    }

    // ---- Runner registry ----

    /// Register or refresh a runner.
    ///
    /// # Errors
    /// `Validation` for empty fields, `Conflict` if a live runner holds the
    /// id from another host.
    pub async fn register(&self, req: RegisterRunner) -> Result<RegisterOutcome, CoordinatorError> {
        require("runner_id", &req.runner_id)?;
        require("host", &req.host)?;
        require_labels(&req.capabilities)?;

        let (runner, registration) = self
            .registry
            .register(&req.runner_id, &req.host, req.capabilities, now_millis())
            .await?;
        tracing::info!(
            runner_id = %runner.runner_id,
            host = %runner.host,
            capabilities = ?runner.capabilities,
            ?registration,
            "Runner registered"
        );
        Ok(RegisterOutcome {
            runner,
            registration,
        })
    }

    /// # Errors
    /// `Conflict` for runners that never registered.
    pub async fn heartbeat(&self, runner_id: &str) -> Result<HeartbeatAck, CoordinatorError> {
        require("runner_id", runner_id)?;
        let beat = self.registry.heartbeat(runner_id, now_millis()).await?;
        if beat.was_stale {
            tracing::warn!(runner_id, "Stale runner resumed heartbeating");
        }
        Ok(HeartbeatAck {
            runner_id: runner_id.to_string(),
            was_stale: beat.was_stale,
            shutdown: beat.retiring,
        })
    }

    /// All registered runners with liveness and owned active runs.
    ///
    /// # Errors
    /// Returns error if the store cannot be read.
    pub async fn list_runners(&self) -> Result<Vec<RunnerInfo>, CoordinatorError> {
        let views = self.registry.list(now_millis()).await;
        let active = self
            .store
            .list_runs(RunFilter {
                active_only: true,
                ..RunFilter::default()
            })
            .await?;

        let mut owned: HashMap<&str, Vec<RunId>> = HashMap::new();
        for run in &active {
            if let Some(owner) = run.runner_id.as_deref() {
                owned.entry(owner).or_default().push(run.id);
            }
        }

        Ok(views
            .into_iter()
            .map(|view| RunnerInfo {
                active_runs: owned
                    .get(view.entry.runner_id.as_str())
                    .cloned()
                    .unwrap_or_default(),
                view,
            })
            .collect())
    }

    /// Remove a runner. Self-initiated removal is immediate; external
    /// removal tells the runner to shut down and drops it once it
    /// deregisters itself or the grace period runs out.
    ///
    /// # Errors
    /// `NotFound` for unknown runners.
    pub async fn deregister(
        &self,
        runner_id: &str,
        initiated_by: Initiator,
    ) -> Result<Deregistration, CoordinatorError> {
        require("runner_id", runner_id)?;
        let not_found = || CoordinatorError::NotFound(format!("runner not found: {runner_id}"));

        let removed = match initiated_by {
            Initiator::SelfInitiated => {
                if !self.registry.remove(runner_id).await {
                    return Err(not_found());
                }
                tracing::info!(runner_id, "Runner deregistered");
                true
            }
            Initiator::External => match self.registry.retire(runner_id, now_millis()).await {
                Ok(newly) => {
                    if newly {
                        tracing::info!(runner_id, "Runner retirement requested");
                    }
                    false
                }
                Err(RegistryError::NotRegistered(_)) => return Err(not_found()),
                Err(e) => return Err(e.into()),
            },
        };

        Ok(Deregistration {
            runner_id: runner_id.to_string(),
            initiated_by,
            removed,
        })
    }

    // ---- Queries ----

    /// # Errors
    /// `NotFound` for unknown runs.
    pub async fn get_run(&self, run_id: RunId) -> Result<Run, CoordinatorError> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| StoreError::run_not_found(run_id).into())
    }

    /// # Errors
    /// Returns error if the store cannot be read.
    pub async fn list_runs(&self, filter: RunFilter) -> Result<Vec<Run>, CoordinatorError> {
        Ok(self.store.list_runs(filter).await?)
    }

    /// # Errors
    /// `NotFound` for unknown sessions.
    pub async fn get_session(&self, session_id: &str) -> Result<Session, CoordinatorError> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or_else(|| StoreError::session_not_found(session_id).into())
    }

    /// # Errors
    /// Returns error if the store cannot be read.
    pub async fn list_sessions(
        &self,
        filter: SessionFilter,
    ) -> Result<Vec<Session>, CoordinatorError> {
        Ok(self.store.list_sessions(filter).await?)
    }

    /// # Errors
    /// `NotFound` for unknown sessions.
    pub async fn session_runs(&self, session_id: &str) -> Result<Vec<Run>, CoordinatorError> {
        self.get_session(session_id).await?;
        self.list_runs(RunFilter {
            session_id: Some(session_id.to_string()),
            ..RunFilter::default()
        })
        .await
    }

    /// # Errors
    /// `NotFound` for unknown sessions.
    pub async fn session_events(
        &self,
        session_id: &str,
        query: EventQuery,
    ) -> Result<Vec<Event>, CoordinatorError> {
        Ok(self.store.list_events(session_id, query).await?)
    }

    /// # Errors
    /// `NotFound` for unknown sessions, `Conflict` while any run is live.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), CoordinatorError> {
        self.store.delete_session(session_id).await?;
        tracing::info!(session_id, "Session deleted");
        Ok(())
    }

    // ---- Maintenance ----

    /// One maintenance pass: drop retired runners past their grace period,
    /// log newly stale runners and apply the reaper policy.
    ///
    /// # Errors
    /// Returns error if the store fails.
    pub async fn run_maintenance(&self, now: i64) -> Result<MaintenanceReport, CoordinatorError> {
        let mut report = MaintenanceReport::default();

        for runner_id in self.registry.sweep_retired(self.config.retire_grace, now).await {
            tracing::info!(%runner_id, "Retired runner removed after grace period");
            report.retired.push(runner_id);
        }

        let pruned = self.broadcaster.prune_idle();
        if pruned > 0 {
            tracing::debug!(pruned, "Dropped idle session streams");
        }

        let active = self
            .store
            .list_runs(RunFilter {
                active_only: true,
                ..RunFilter::default()
            })
            .await?;

        for entry in self.registry.newly_stale(now).await {
            let owned = active
                .iter()
                .filter(|run| run.runner_id.as_deref() == Some(entry.runner_id.as_str()))
                .count();
            tracing::warn!(
                runner_id = %entry.runner_id,
                host = %entry.host,
                active_runs = owned,
                "Runner heartbeat expired"
            );
        }

        if self.config.reaper_policy == ReaperPolicy::Disabled {
            return Ok(report);
        }

        let reap_after = millis(self.config.reap_after);
        for run in active {
            let Some(owner) = run.runner_id.as_deref() else {
                continue;
            };
            let silent_for = match self.registry.heartbeat_age(owner, now).await {
                Some(age) => age,
                None => now - run.updated_at,
            };
            if silent_for < reap_after {
                continue;
            }

            let mut req = match (self.config.reaper_policy, run.status) {
                (ReaperPolicy::Requeue, RunStatus::Claimed) => {
                    TransitionRequest::new(run.id, RunTransition::Requeue)
                }
                _ => TransitionRequest::new(run.id, RunTransition::Abandon)
                    .with_error(format!("runner {owner} lost: heartbeat expired")),
            };
            req.at = now;

            match self.store.transition(req).await {
                Ok(outcome) => {
                    tracing::warn!(
                        run_id = %run.id,
                        runner_id = owner,
                        to = %outcome.run.status,
                        policy = %self.config.reaper_policy,
                        "Reaped orphaned run"
                    );
                    self.settle(&outcome).await;
                    report.reaped.push(run.id);
                }
                Err(StoreError::Conflict(reason)) => {
                    tracing::debug!(run_id = %run.id, %reason, "Run moved before it could be reaped");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(report)
    }

    /// Run maintenance every `maintenance_interval` until `shutdown` flips
    /// to `true` or its sender is dropped.
    pub fn spawn_maintenance(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()>
    where
        S: 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.maintenance_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_maintenance(now_millis()).await {
                            tracing::error!(error = %e, "Maintenance pass failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Maintenance task stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use runcoord_core::{SessionStatus, StreamScope};
    use serde_json::json;

    use super::*;
    use crate::{registry::Liveness, storage::MemoryStore};

    fn coordinator_with(config: CoordinatorConfig) -> Coordinator<MemoryStore> {
        Coordinator::new(MemoryStore::new(), config)
    }

    fn coordinator() -> Coordinator<MemoryStore> {
        coordinator_with(
            CoordinatorConfig::builder()
                .host_id("coord-host")
                .build()
                .unwrap(),
        )
    }

    fn run_request(session_id: &str, prompt: &str) -> RunRequest {
        RunRequest {
            session_id: Some(session_id.to_string()),
            agent: "claude".into(),
            prompt: prompt.into(),
            ..RunRequest::default()
        }
    }

    fn by(runner_id: &str) -> RunnerReport {
        RunnerReport {
            runner_id: runner_id.into(),
            ..RunnerReport::default()
        }
    }

    async fn register(c: &Coordinator<MemoryStore>, runner_id: &str, capabilities: &[&str]) {
        c.register(RegisterRunner {
            runner_id: runner_id.into(),
            host: "host-1".into(),
            capabilities: capabilities.iter().map(ToString::to_string).collect(),
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn claim_start_complete_scenario() {
        let c = coordinator();
        register(&c, "A", &[]).await;
        register(&c, "B", &[]).await;

        let r1 = c.create_run(run_request("S", "compute")).await.unwrap().run;
        assert_eq!(r1.status, RunStatus::Pending);

        let polled = c.poll("A", None).await.unwrap();
        assert_eq!(polled.run.as_ref().map(|r| r.id), Some(r1.id));
        assert!(polled.directives.is_empty());

        c.report_started(r1.id, by("A")).await.unwrap();
        assert!(c.poll("B", None).await.unwrap().run.is_none());

        let done = c
            .report_completed(
                r1.id,
                RunnerReport {
                    result: Some("42".into()),
                    ..by("A")
                },
            )
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.result.as_deref(), Some("42"));
        assert!(done.error.is_none());

        let session = c.get_session("S").await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.host, "coord-host");
    }

    #[tokio::test]
    async fn out_of_order_and_foreign_reports_conflict() {
        let c = coordinator();
        let run = c.create_run(run_request("S", "x")).await.unwrap().run;

        let err = c.report_completed(run.id, by("A")).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Storage(StoreError::Conflict(_))));

        c.poll("A", None).await.unwrap();
        let err = c.report_started(run.id, by("B")).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Storage(StoreError::Conflict(_))));
        assert_eq!(c.get_run(run.id).await.unwrap().status, RunStatus::Claimed);

        let err = c.report_started(Uuid::now_v7(), by("A")).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Storage(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn stop_twice_yields_one_directive() {
        let c = coordinator();
        let run = c.create_run(run_request("S", "long job")).await.unwrap().run;
        c.poll("A", None).await.unwrap();
        c.report_started(run.id, by("A")).await.unwrap();

        let first = c.request_stop(run.id).await.unwrap();
        assert_eq!(first.run.status, RunStatus::Stopping);
        assert!(first.directive_enqueued);
        assert!(!first.already_stopping);

        let second = c.request_stop(run.id).await.unwrap();
        assert!(second.already_stopping);
        assert!(!second.directive_enqueued);

        let polled = c.poll("A", None).await.unwrap();
        assert_eq!(polled.directives, vec![Directive::Stop { run_id: run.id }]);
        assert!(c.poll("A", None).await.unwrap().directives.is_empty());

        // Starting is no longer allowed once stopping.
        let err = c.report_started(run.id, by("A")).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Storage(StoreError::Conflict(_))));

        let stopped = c.report_stopped(run.id, by("A")).await.unwrap();
        assert_eq!(stopped.status, RunStatus::Stopped);
        assert_eq!(c.get_session("S").await.unwrap().status, SessionStatus::Stopped);
    }

    #[tokio::test]
    async fn completion_before_observation_wins() {
        let c = coordinator();
        let run = c.create_run(run_request("S", "race")).await.unwrap().run;
        c.poll("A", None).await.unwrap();
        c.report_started(run.id, by("A")).await.unwrap();
        c.request_stop(run.id).await.unwrap();

        let done = c.report_completed(run.id, by("A")).await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert!(c.stops.get(run.id).await.is_none());
        assert!(c.poll("A", None).await.unwrap().directives.is_empty());
        assert_eq!(c.get_run(run.id).await.unwrap().status, RunStatus::Completed);
    }

    /// Memory store whose next claim fails once when armed.
    #[derive(Default)]
    struct FlakyClaims {
        inner: MemoryStore,
        fail_next_claim: std::sync::atomic::AtomicBool,
    }

    impl FlakyClaims {
        fn arm(&self) {
            self.fail_next_claim
                .store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl RunStore for FlakyClaims {
        async fn create_run(&self, new: NewRun) -> Result<CreatedRun, StoreError> {
            self.inner.create_run(new).await
        }
        async fn get_run(&self, id: RunId) -> Result<Option<Run>, StoreError> {
            self.inner.get_run(id).await
        }
        async fn list_runs(&self, filter: RunFilter) -> Result<Vec<Run>, StoreError> {
            self.inner.list_runs(filter).await
        }
        async fn claim_next(
            &self,
            runner_id: &str,
            capabilities: &[String],
            at: i64,
        ) -> Result<Option<TransitionOutcome>, StoreError> {
            if self
                .fail_next_claim
                .swap(false, std::sync::atomic::Ordering::SeqCst)
            {
                return Err(StoreError::Internal("db busy".into()));
            }
            self.inner.claim_next(runner_id, capabilities, at).await
        }
        async fn transition(
            &self,
            req: TransitionRequest,
        ) -> Result<TransitionOutcome, StoreError> {
            self.inner.transition(req).await
        }
        async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
            self.inner.get_session(id).await
        }
        async fn list_sessions(&self, filter: SessionFilter) -> Result<Vec<Session>, StoreError> {
            self.inner.list_sessions(filter).await
        }
        async fn delete_session(&self, id: &str) -> Result<(), StoreError> {
            self.inner.delete_session(id).await
        }
        async fn append_event(&self, event: NewEvent) -> Result<Event, StoreError> {
            self.inner.append_event(event).await
        }
        async fn append_run_event(
            &self,
            run_id: RunId,
            runner_id: &str,
            event: NewEvent,
        ) -> Result<Event, StoreError> {
            self.inner.append_run_event(run_id, runner_id, event).await
        }
        async fn list_events(
            &self,
            session_id: &str,
            query: EventQuery,
        ) -> Result<Vec<Event>, StoreError> {
            self.inner.list_events(session_id, query).await
        }
    }

    #[tokio::test]
    async fn failed_claim_keeps_stop_directive_queued() {
        let c = Coordinator::new(
            FlakyClaims::default(),
            CoordinatorConfig::builder().build().unwrap(),
        );
        let run = c.create_run(run_request("S", "long job")).await.unwrap().run;
        c.poll("A", None).await.unwrap();
        c.request_stop(run.id).await.unwrap();

        c.store().arm();
        let err = c.poll("A", None).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Storage(StoreError::Internal(_))));

        let polled = c.poll("A", None).await.unwrap();
        assert_eq!(polled.directives, vec![Directive::Stop { run_id: run.id }]);
        assert_eq!(c.get_run(run.id).await.unwrap().status, RunStatus::Stopping);
    }

    #[tokio::test]
    async fn stop_pending_cancels_and_terminal_conflicts() {
        let c = coordinator();
        let run = c.create_run(run_request("S", "queued")).await.unwrap().run;

        let outcome = c.request_stop(run.id).await.unwrap();
        assert_eq!(outcome.run.status, RunStatus::Stopped);
        assert!(!outcome.directive_enqueued);

        let err = c.request_stop(run.id).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Conflict(_)));
        assert!(c.poll("A", None).await.unwrap().run.is_none());
    }

    #[tokio::test]
    async fn silent_runner_is_stale_and_runs_untouched() {
        let c = coordinator();
        let long_ago = now_millis() - 3_600_000;
        c.registry()
            .register("A", "host-1", vec![], long_ago)
            .await
            .unwrap();
        let run = c.create_run(run_request("S", "x")).await.unwrap().run;
        c.store().claim_next("A", &[], long_ago).await.unwrap().unwrap();

        let runners = c.list_runners().await.unwrap();
        assert_eq!(runners.len(), 1);
        assert_eq!(runners[0].view.liveness, Liveness::Stale);
        assert_eq!(runners[0].active_runs, vec![run.id]);

        let report = c.run_maintenance(now_millis()).await.unwrap();
        assert!(report.reaped.is_empty());
        assert_eq!(c.get_run(run.id).await.unwrap().status, RunStatus::Claimed);

        let ack = c.heartbeat("A").await.unwrap();
        assert!(ack.was_stale);
        assert_eq!(
            c.list_runners().await.unwrap()[0].view.liveness,
            Liveness::Alive
        );
    }

    #[tokio::test]
    async fn requeue_reaper() {
        let c = coordinator_with(
            CoordinatorConfig::builder()
                .reaper_policy(ReaperPolicy::Requeue)
                .build()
                .unwrap(),
        );
        let long_ago = now_millis() - 3_600_000;
        c.registry()
            .register("A", "host-1", vec![], long_ago)
            .await
            .unwrap();
        let claimed = c.create_run(run_request("S1", "a")).await.unwrap().run;
        let running = c.create_run(run_request("S2", "b")).await.unwrap().run;
        c.store().claim_next("A", &[], long_ago).await.unwrap();
        c.store().claim_next("A", &[], long_ago).await.unwrap();
        c.store()
            .transition(TransitionRequest::new(running.id, RunTransition::Start).by_runner("A"))
            .await
            .unwrap();

        let report = c.run_maintenance(now_millis()).await.unwrap();
        assert_eq!(report.reaped.len(), 2);

        let requeued = c.get_run(claimed.id).await.unwrap();
        assert_eq!(requeued.status, RunStatus::Pending);
        assert!(requeued.runner_id.is_none());

        let failed = c.get_run(running.id).await.unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        assert_eq!(
            failed.error.as_deref(),
            Some("runner A lost: heartbeat expired")
        );

        // The requeued run can be claimed by a healthy runner.
        let polled = c.poll("B", None).await.unwrap();
        assert_eq!(polled.run.map(|r| r.id), Some(claimed.id));
    }

    #[tokio::test]
    async fn fail_reaper_handles_unknown_owner() {
        let c = coordinator_with(
            CoordinatorConfig::builder()
                .reaper_policy(ReaperPolicy::Fail)
                .build()
                .unwrap(),
        );
        let run = c.create_run(run_request("S", "x")).await.unwrap().run;
        c.poll("ghost", None).await.unwrap();

        let report = c.run_maintenance(now_millis()).await.unwrap();
        assert!(report.reaped.is_empty(), "recent claims are left alone");

        let later = now_millis() + 200_000;
        let report = c.run_maintenance(later).await.unwrap();
        assert_eq!(report.reaped, vec![run.id]);
        assert_eq!(c.get_run(run.id).await.unwrap().status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn external_deregistration_sends_shutdown() {
        let c = coordinator();
        register(&c, "A", &[]).await;
        c.create_run(run_request("S", "x")).await.unwrap();

        let dereg = c.deregister("A", Initiator::External).await.unwrap();
        assert_eq!(dereg.initiated_by, Initiator::External);
        assert!(!dereg.removed);

        let polled = c.poll("A", None).await.unwrap();
        assert!(polled.run.is_none());
        assert_eq!(polled.directives, vec![Directive::Shutdown]);
        assert!(c.heartbeat("A").await.unwrap().shutdown);

        let report = c.run_maintenance(now_millis() + 61_000).await.unwrap();
        assert_eq!(report.retired, vec!["A".to_string()]);
        assert!(c.registry().get("A").await.is_none());

        let err = c.deregister("A", Initiator::SelfInitiated).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::NotFound(_)));
    }

    #[tokio::test]
    async fn re_registration_does_not_cancel_retirement() {
        let c = coordinator();
        register(&c, "A", &[]).await;
        c.create_run(run_request("S", "queued")).await.unwrap();
        c.deregister("A", Initiator::External).await.unwrap();

        register(&c, "A", &[]).await;
        let polled = c.poll("A", None).await.unwrap();
        assert!(polled.run.is_none());
        assert_eq!(polled.directives, vec![Directive::Shutdown]);
        assert!(c.heartbeat("A").await.unwrap().shutdown);

        let report = c.run_maintenance(now_millis() + 3_600_000).await.unwrap();
        assert_eq!(report.retired, vec!["A".to_string()]);
    }

    #[tokio::test]
    async fn self_deregistration_is_immediate() {
        let c = coordinator();
        register(&c, "A", &[]).await;
        let dereg = c.deregister("A", Initiator::SelfInitiated).await.unwrap();
        assert!(dereg.removed);
        assert!(c.list_runners().await.unwrap().is_empty());

        let err = c.heartbeat("A").await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Conflict(_)));
    }

    #[tokio::test]
    async fn poll_uses_registered_capabilities() {
        let c = coordinator();
        register(&c, "gpu-box", &["gpu"]).await;
        let mut req = run_request("S", "render");
        req.requires = vec!["gpu".into()];
        let run = c.create_run(req).await.unwrap().run;

        assert!(c.poll("cpu-box", None).await.unwrap().run.is_none());
        assert!(
            c.poll("gpu-box", Some(vec![]))
                .await
                .unwrap()
                .run
                .is_none(),
            "explicit capabilities override registration"
        );
        assert_eq!(
            c.poll("gpu-box", None).await.unwrap().run.map(|r| r.id),
            Some(run.id)
        );
    }

    #[tokio::test]
    async fn events_are_broadcast_after_persisting() {
        let c = coordinator();
        let mut session_rx = c.broadcaster().subscribe(&StreamScope::Session("S".into()));
        let mut global_rx = c.broadcaster().subscribe(&StreamScope::All);

        let run = c.create_run(run_request("S", "chat")).await.unwrap().run;
        c.poll("A", None).await.unwrap();

        let created = session_rx.recv().await.unwrap();
        assert_eq!(created.payload["to"], "pending");
        let claimed = session_rx.recv().await.unwrap();
        assert_eq!(claimed.payload["to"], "claimed");
        assert_eq!(global_rx.recv().await.unwrap().id, created.id);

        let event = c
            .record_event(
                run.id,
                ProgressEvent {
                    runner_id: "A".into(),
                    event_type: EventType::Message,
                    payload: json!({ "text": "hi" }),
                },
            )
            .await
            .unwrap();
        assert_eq!(session_rx.recv().await.unwrap(), event);

        let history = c.session_events("S", EventQuery::default()).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].id, event.id);
    }

    #[tokio::test]
    async fn progress_events_are_owner_only() {
        let c = coordinator();
        let run = c.create_run(run_request("S", "x")).await.unwrap().run;
        c.poll("A", None).await.unwrap();

        let event = |runner_id: &str, event_type| ProgressEvent {
            runner_id: runner_id.into(),
            event_type,
            payload: Value::Null,
        };

        let err = c
            .record_event(run.id, event("B", EventType::Notification))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Storage(StoreError::Conflict(_))));

        let err = c
            .record_event(run.id, event("A", EventType::RunStatus))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Validation(_)));

        c.report_started(run.id, by("A")).await.unwrap();
        c.report_failed(
            run.id,
            RunnerReport {
                error: Some("boom".into()),
                ..by("A")
            },
        )
        .await
        .unwrap();
        let err = c
            .record_event(run.id, event("A", EventType::Message))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Storage(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn create_run_validation() {
        let c = coordinator();

        let err = c.create_run(run_request("S", "   ")).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Validation(_)));

        let mut no_agent = run_request("S", "x");
        no_agent.agent = String::new();
        assert!(matches!(
            c.create_run(no_agent).await.unwrap_err(),
            CoordinatorError::Validation(_)
        ));

        let resume = RunRequest {
            kind: RunKind::Resume,
            prompt: "continue".into(),
            ..RunRequest::default()
        };
        assert!(matches!(
            c.create_run(resume).await.unwrap_err(),
            CoordinatorError::Validation(_)
        ));

        let generated = c
            .create_run(RunRequest {
                agent: "claude".into(),
                prompt: "fresh".into(),
                ..RunRequest::default()
            })
            .await
            .unwrap();
        assert!(!generated.session.id.is_empty());
        assert_eq!(generated.session.name, "fresh");
    }

    #[tokio::test]
    async fn maintenance_task_stops_on_shutdown() {
        let c = Arc::new(coordinator_with(
            CoordinatorConfig::builder()
                .maintenance_interval_secs(1)
                .build()
                .unwrap(),
        ));
        let (tx, rx) = watch::channel(false);
        let handle = Arc::clone(&c).spawn_maintenance(rx);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
