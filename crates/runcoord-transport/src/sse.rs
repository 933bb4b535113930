//! Server-sent event streams.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, KeepAliveStream, Sse},
};
use futures::stream::BoxStream;
use runcoord_coordinator::Coordinator;
use runcoord_core::{RunStore, StreamScope};

use crate::{error::ApiError, extract::ApiPath};

type EventStream = Sse<KeepAliveStream<BoxStream<'static, Result<Event, Infallible>>>>;

fn open<S: RunStore>(c: &Coordinator<S>, scope: &StreamScope) -> EventStream {
    tracing::debug!(?scope, "SSE subscriber attached");
    Sse::new(c.broadcaster().sse_stream(scope)).keep_alive(KeepAlive::default())
}

/// Live tail of one session. History comes from `GET /sessions/{id}/events`.
pub async fn session_stream<S: RunStore + 'static>(
    State(c): State<Arc<Coordinator<S>>>,
    ApiPath(session_id): ApiPath<String>,
) -> Result<EventStream, ApiError> {
    c.get_session(&session_id).await?;
    Ok(open(&c, &StreamScope::Session(session_id)))
}

/// Live tail of every session.
pub async fn global_stream<S: RunStore + 'static>(
    State(c): State<Arc<Coordinator<S>>>,
) -> EventStream {
    open(&c, &StreamScope::All)
}
