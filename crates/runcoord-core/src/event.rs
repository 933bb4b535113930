//! Append-only session events.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{
    state::{RunStatus, UnknownStatus},
    traits::{Run, RunId, SessionId},
};

/// Event identifier, assigned by the store in insertion order.
pub type EventId = i64;

/// Kind of fact an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A run changed status (including creation).
    RunStatus,
    /// The executor started its session.
    SessionStart,
    /// The executor stopped its session.
    SessionStop,
    /// A tool is about to be invoked.
    PreToolUse,
    /// A tool invocation returned.
    PostToolUse,
    /// Assistant or user message.
    Message,
    /// Free-form notification from the executor.
    Notification,
}

impl EventType {
    pub const ALL: [Self; 7] = [
        Self::RunStatus,
        Self::SessionStart,
        Self::SessionStop,
        Self::PreToolUse,
        Self::PostToolUse,
        Self::Message,
        Self::Notification,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RunStatus => "run_status",
            Self::SessionStart => "session_start",
            Self::SessionStop => "session_stop",
            Self::PreToolUse => "pre_tool_use",
            Self::PostToolUse => "post_tool_use",
            Self::Message => "message",
            Self::Notification => "notification",
        }
    }

    /// Types a runner may post explicitly. Status events come only from
    /// transitions.
    #[must_use]
    pub const fn is_progress(self) -> bool {
        !matches!(self, Self::RunStatus)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// A persisted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub session_id: SessionId,
    pub run_id: Option<RunId>,
    pub event_type: EventType,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub payload: Value,
}

impl Event {
    /// Ordering within a session: timestamp, then id.
    #[must_use]
    pub const fn order_key(&self) -> (i64, EventId) {
        (self.timestamp, self.id)
    }

    /// SSE event (requires `sse` feature).
    #[cfg(feature = "sse")]
    #[must_use]
    pub fn to_sse_event(&self) -> axum::response::sse::Event {
        let event = axum::response::sse::Event::default()
            .id(self.id.to_string())
            .event(self.event_type.as_str());
        match serde_json::to_string(self) {
            Ok(data) => event.data(data),
            Err(e) => {
                tracing::warn!(event_id = self.id, "Failed to serialize event: {e}");
                event.data("{}")
            }
        }
    }
}

/// An event not yet persisted.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub session_id: SessionId,
    pub run_id: Option<RunId>,
    pub event_type: EventType,
    pub timestamp: i64,
    pub payload: Value,
}

impl NewEvent {
    /// Status-change event for `run`, which has just left `previous`
    /// (`None` for creation).
    #[must_use]
    pub fn status_change(run: &Run, previous: Option<RunStatus>) -> Self {
        Self {
            session_id: run.session_id.clone(),
            run_id: Some(run.id),
            event_type: EventType::RunStatus,
            timestamp: run.updated_at,
            payload: json!({
                "run_id": run.id,
                "from": previous,
                "to": run.status,
                "runner_id": run.runner_id,
                "result": run.result,
                "error": run.error,
            }),
        }
    }

    /// Attach the id the store assigned.
    #[must_use]
    pub fn into_event(self, id: EventId) -> Event {
        Event {
            id,
            session_id: self.session_id,
            run_id: self.run_id,
            event_type: self.event_type,
            timestamp: self.timestamp,
            payload: self.payload,
        }
    }
}

/// Event history query.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    /// Only events at or after this timestamp (ms).
    pub since: Option<i64>,
    pub event_type: Option<EventType>,
    pub limit: Option<usize>,
}

impl EventQuery {
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        self.since.is_none_or(|since| event.timestamp >= since)
            && self.event_type.is_none_or(|t| event.event_type == t)
    }
}
