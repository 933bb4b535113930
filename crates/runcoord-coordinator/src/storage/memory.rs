//! In-memory run store.

use std::{
    collections::HashMap,
    sync::{RwLock, RwLockWriteGuard},
};

use async_trait::async_trait;
use runcoord_core::{
    Event, EventQuery, NewEvent, Run, RunId, RunStatus, RunStore, RunTransition, Session,
    SessionStatus, StoreError,
    now_millis,
    state::{derive_session_status, plan_transition},
    traits::{
        CreatedRun, NewRun, RunFilter, RunKind, SessionFilter, TransitionOutcome,
        TransitionRequest,
    },
};
use uuid::Uuid;

/// In-memory storage implementation.
///
/// Useful for development and single-process deployments.
/// Data is lost on restart.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    runs: HashMap<RunId, Run>,
    events: Vec<Event>,
    next_event_id: i64,
}

impl MemoryStore {
    /// Create a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, StoreError> {
        self.inner
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))
    }

    fn read<T>(&self, f: impl FnOnce(&Inner) -> T) -> Result<T, StoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(f(&inner))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn push_event(&mut self, event: NewEvent) -> Event {
        self.next_event_id += 1;
        let event = event.into_event(self.next_event_id);
        self.events.push(event.clone());
        event
    }

    fn refresh_session(&mut self, session_id: &str, at: i64) {
        let status = derive_session_status(
            self.runs
                .values()
                .filter(|r| r.session_id == session_id)
                .map(|r| (r.created_at, r.id, r.status)),
        );
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.status = status;
            session.updated_at = at;
        }
    }

    fn apply(&mut self, req: &TransitionRequest) -> Result<TransitionOutcome, StoreError> {
        let current = self
            .runs
            .get(&req.run_id)
            .ok_or_else(|| StoreError::run_not_found(req.run_id))?;
        let previous = current.status;
        let run = plan_transition(current, req)?;

        self.runs.insert(run.id, run.clone());
        if let Some(executor_session_id) = &req.executor_session_id {
            if let Some(session) = self.sessions.get_mut(&run.session_id) {
                session.executor_session_id = Some(executor_session_id.clone());
            }
        }
        let event = self.push_event(NewEvent::status_change(&run, Some(previous)));
        self.refresh_session(&run.session_id, req.at);

        Ok(TransitionOutcome {
            run,
            previous,
            event,
        })
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn create_run(&self, new: NewRun) -> Result<CreatedRun, StoreError> {
        let mut inner = self.write()?;
        let timestamp = now_millis();

        if !inner.sessions.contains_key(&new.session_id) {
            if new.kind == RunKind::Resume {
                return Err(StoreError::session_not_found(&new.session_id));
            }
            let session = Session {
                id: new.session_id.clone(),
                name: new.display_name(),
                status: SessionStatus::Pending,
                context: new.context.clone(),
                executor_session_id: None,
                host: new.host.clone(),
                created_at: timestamp,
                updated_at: timestamp,
            };
            inner.sessions.insert(session.id.clone(), session);
        }

        let run = Run {
            id: Uuid::now_v7(),
            session_id: new.session_id,
            kind: new.kind,
            status: RunStatus::Pending,
            prompt: new.prompt,
            mode: new.mode,
            requires: new.requires,
            runner_id: None,
            result: None,
            error: None,
            created_at: timestamp,
            claimed_at: None,
            started_at: None,
            stop_requested_at: None,
            completed_at: None,
            updated_at: timestamp,
        };
        inner.runs.insert(run.id, run.clone());
        let event = inner.push_event(NewEvent::status_change(&run, None));
        inner.refresh_session(&run.session_id, timestamp);

        let session = inner
            .sessions
            .get(&run.session_id)
            .cloned()
            .ok_or_else(|| StoreError::session_not_found(&run.session_id))?;

        Ok(CreatedRun {
            run,
            session,
            event,
        })
    }

    async fn get_run(&self, id: RunId) -> Result<Option<Run>, StoreError> {
        self.read(|inner| inner.runs.get(&id).cloned())
    }

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<Run>, StoreError> {
        self.read(|inner| {
            let mut runs: Vec<Run> = inner
                .runs
                .values()
                .filter(|r| filter.matches(r))
                .cloned()
                .collect();
            runs.sort_by_key(Run::queue_key);
            if let Some(limit) = filter.limit {
                runs.truncate(limit);
            }
            runs
        })
    }

    async fn claim_next(
        &self,
        runner_id: &str,
        capabilities: &[String],
        at: i64,
    ) -> Result<Option<TransitionOutcome>, StoreError> {
        let mut inner = self.write()?;

        let candidate = inner
            .runs
            .values()
            .filter(|r| r.status == RunStatus::Pending && r.matches(capabilities))
            .min_by_key(|r| r.queue_key())
            .map(|r| r.id);

        let Some(run_id) = candidate else {
            return Ok(None);
        };

        let mut req = TransitionRequest::new(run_id, RunTransition::Claim).by_runner(runner_id);
        req.at = at;
        inner.apply(&req).map(Some)
    }

    async fn transition(&self, req: TransitionRequest) -> Result<TransitionOutcome, StoreError> {
        self.write()?.apply(&req)
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        self.read(|inner| inner.sessions.get(id).cloned())
    }

    async fn list_sessions(&self, filter: SessionFilter) -> Result<Vec<Session>, StoreError> {
        self.read(|inner| {
            let mut result: Vec<Session> = inner
                .sessions
                .values()
                .filter(|s| {
                    filter.status.is_none_or(|status| s.status == status)
                        && filter.agent.as_ref().is_none_or(|a| &s.context.agent == a)
                })
                .cloned()
                .collect();

            // Sort by created_at descending
            result.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

            if let Some(limit) = filter.limit {
                result.truncate(limit);
            }
            result
        })
    }

    async fn delete_session(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        if !inner.sessions.contains_key(id) {
            return Err(StoreError::session_not_found(id));
        }
        if let Some(run) = inner
            .runs
            .values()
            .find(|r| r.session_id == id && !r.status.is_terminal())
        {
            return Err(StoreError::Conflict(format!(
                "session {id} has run {} in status {}",
                run.id, run.status
            )));
        }

        inner.runs.retain(|_, r| r.session_id != id);
        inner.events.retain(|e| e.session_id != id);
        inner.sessions.remove(id);
        Ok(())
    }

    async fn append_event(&self, event: NewEvent) -> Result<Event, StoreError> {
        let mut inner = self.write()?;
        if !inner.sessions.contains_key(&event.session_id) {
            return Err(StoreError::session_not_found(&event.session_id));
        }
        Ok(inner.push_event(event))
    }

    async fn append_run_event(
        &self,
        run_id: RunId,
        runner_id: &str,
        event: NewEvent,
    ) -> Result<Event, StoreError> {
        let mut inner = self.write()?;
        let run = inner
            .runs
            .get(&run_id)
            .ok_or_else(|| StoreError::run_not_found(run_id))?;
        run.accepts_progress_from(runner_id)?;
        let event = NewEvent {
            session_id: run.session_id.clone(),
            run_id: Some(run_id),
            ..event
        };
        Ok(inner.push_event(event))
    }

    async fn list_events(
        &self,
        session_id: &str,
        query: EventQuery,
    ) -> Result<Vec<Event>, StoreError> {
        self.read(|inner| {
            if !inner.sessions.contains_key(session_id) {
                return Err(StoreError::session_not_found(session_id));
            }
            let mut events: Vec<Event> = inner
                .events
                .iter()
                .filter(|e| e.session_id == session_id && query.matches(e))
                .cloned()
                .collect();
            events.sort_by_key(Event::order_key);
            if let Some(limit) = query.limit {
                events.truncate(limit);
            }
            Ok(events)
        })?
    }
}
