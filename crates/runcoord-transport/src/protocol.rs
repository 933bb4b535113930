//! Wire protocol for runners, observers and stream clients.

use runcoord_coordinator::Initiator;
use runcoord_core::{
    Event, EventQuery, EventType, Run, RunStatus, Session, SessionStatus,
    traits::{RunFilter, SessionFilter},
};
use serde::{Deserialize, Serialize};

/// Message from a stream client to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Follow one session, or every session when `session_id` is omitted.
    Subscribe {
        #[serde(default)]
        session_id: Option<String>,
    },
    /// Stop following a scope.
    Unsubscribe {
        #[serde(default)]
        session_id: Option<String>,
    },
    /// Ping for keepalive.
    Ping,
}

/// Message from the server to a stream client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Subscribed { session_id: Option<String> },
    Unsubscribed { session_id: Option<String> },
    /// A live event.
    Event { event: Event },
    /// Events were dropped because the client fell behind; refetch history.
    Lagged {
        session_id: Option<String>,
        skipped: u64,
    },
    /// Error message.
    Error { message: String },
    /// Pong response.
    Pong,
}

/// `POST /runs` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRunResponse {
    pub run: Run,
    pub session: Session,
}

/// `GET /runner/runs` query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PollQuery {
    pub runner_id: String,
    /// Comma-separated labels; overrides the registered capabilities.
    pub capabilities: Option<String>,
}

impl PollQuery {
    #[must_use]
    pub fn capability_list(&self) -> Option<Vec<String>> {
        self.capabilities.as_deref().map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|label| !label.is_empty())
                .map(ToString::to_string)
                .collect()
        })
    }
}

/// Body of the runner lifecycle calls that only name the runner.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerIdBody {
    pub runner_id: String,
}

/// `DELETE /runners/{id}` query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeregisterQuery {
    #[serde(default)]
    pub initiated_by: Initiator,
}

/// `GET /runs` query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunListQuery {
    pub status: Option<RunStatus>,
    pub session_id: Option<String>,
    pub runner_id: Option<String>,
    #[serde(default)]
    pub active: bool,
    pub limit: Option<usize>,
}

impl From<RunListQuery> for RunFilter {
    fn from(q: RunListQuery) -> Self {
        Self {
            status: q.status,
            session_id: q.session_id,
            runner_id: q.runner_id,
            active_only: q.active,
            limit: q.limit,
        }
    }
}

/// `GET /sessions` query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionListQuery {
    pub status: Option<SessionStatus>,
    pub agent: Option<String>,
    pub limit: Option<usize>,
}

impl From<SessionListQuery> for SessionFilter {
    fn from(q: SessionListQuery) -> Self {
        Self {
            status: q.status,
            agent: q.agent,
            limit: q.limit,
        }
    }
}

/// `GET /sessions/{id}/events` query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventHistoryQuery {
    /// Only events at or after this timestamp (ms).
    pub since: Option<i64>,
    pub event_type: Option<EventType>,
    pub limit: Option<usize>,
}

impl From<EventHistoryQuery> for EventQuery {
    fn from(q: EventHistoryQuery) -> Self {
        Self {
            since: q.since,
            event_type: q.event_type,
            limit: q.limit,
        }
    }
}

/// `GET /health` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub runners: usize,
    pub stream_subscribers: usize,
}
