//! REST routes.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{delete, get, post},
};
use runcoord_coordinator::{
    Coordinator, Deregistration, HeartbeatAck, Initiator, PollResult, ProgressEvent,
    RegisterOutcome, RegisterRunner, RunRequest, RunnerInfo, RunnerReport, StopOutcome,
};
use runcoord_core::{Event, Run, RunId, RunStore, Session, StreamScope, now_millis};

use crate::{
    error::ApiError,
    extract::{ApiJson, ApiPath, ApiQuery},
    protocol::{
        CreateRunResponse, DeregisterQuery, EventHistoryQuery, HealthResponse, PollQuery,
        RunListQuery, RunnerIdBody, SessionListQuery,
    },
    sse,
};

type Shared<S> = Arc<Coordinator<S>>;
type ApiResult<T> = Result<Json<T>, ApiError>;

/// Build the coordinator's HTTP router.
///
/// # Example
/// ```ignore
/// let app = router(Arc::new(Coordinator::new(MemoryStore::new(), config)))
///     .layer(TraceLayer::new_for_http());
/// ```
pub fn router<S>(coordinator: Shared<S>) -> Router
where
    S: RunStore + 'static,
{
    let router = Router::new()
        .route("/health", get(health::<S>))
        .route("/runs", post(create_run::<S>).get(list_runs::<S>))
        .route("/runs/{id}", get(get_run::<S>))
        .route("/runs/{id}/stop", post(request_stop::<S>))
        .route("/runner/runs", get(poll::<S>))
        .route("/runner/runs/{id}/started", post(report_started::<S>))
        .route("/runner/runs/{id}/completed", post(report_completed::<S>))
        .route("/runner/runs/{id}/failed", post(report_failed::<S>))
        .route("/runner/runs/{id}/stopped", post(report_stopped::<S>))
        .route("/runner/runs/{id}/events", post(record_event::<S>))
        .route("/runner/register", post(register::<S>))
        .route("/runner/heartbeat", post(heartbeat::<S>))
        .route("/runner/deregister", post(deregister_self::<S>))
        .route("/runners", get(list_runners::<S>))
        .route("/runners/{id}", delete(deregister::<S>))
        .route("/sessions", get(list_sessions::<S>))
        .route(
            "/sessions/{id}",
            get(get_session::<S>).delete(delete_session::<S>),
        )
        .route("/sessions/{id}/runs", get(session_runs::<S>))
        .route("/sessions/{id}/events", get(session_events::<S>))
        .route("/sessions/{id}/stream", get(sse::session_stream::<S>))
        .route("/events/stream", get(sse::global_stream::<S>));

    #[cfg(feature = "websocket")]
    let router = router.route("/ws", get(crate::websocket::ws_handler::<S>));

    router.with_state(coordinator)
}

async fn health<S: RunStore + 'static>(State(c): State<Shared<S>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        runners: c.registry().list(now_millis()).await.len(),
        stream_subscribers: c.broadcaster().subscriber_count(&StreamScope::All),
    })
}

// ---- Runs ----

async fn create_run<S: RunStore + 'static>(
    State(c): State<Shared<S>>,
    ApiJson(req): ApiJson<RunRequest>,
) -> Result<(StatusCode, Json<CreateRunResponse>), ApiError> {
    let created = c.create_run(req).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateRunResponse {
            run: created.run,
            session: created.session,
        }),
    ))
}

async fn list_runs<S: RunStore + 'static>(
    State(c): State<Shared<S>>,
    ApiQuery(query): ApiQuery<RunListQuery>,
) -> ApiResult<Vec<Run>> {
    Ok(Json(c.list_runs(query.into()).await?))
}

async fn get_run<S: RunStore + 'static>(
    State(c): State<Shared<S>>,
    ApiPath(id): ApiPath<RunId>,
) -> ApiResult<Run> {
    Ok(Json(c.get_run(id).await?))
}

async fn request_stop<S: RunStore + 'static>(
    State(c): State<Shared<S>>,
    ApiPath(id): ApiPath<RunId>,
) -> ApiResult<StopOutcome> {
    Ok(Json(c.request_stop(id).await?))
}

// ---- Runner-facing ----

async fn poll<S: RunStore + 'static>(
    State(c): State<Shared<S>>,
    ApiQuery(query): ApiQuery<PollQuery>,
) -> ApiResult<PollResult> {
    let capabilities = query.capability_list();
    Ok(Json(c.poll(&query.runner_id, capabilities).await?))
}

async fn report_started<S: RunStore + 'static>(
    State(c): State<Shared<S>>,
    ApiPath(id): ApiPath<RunId>,
    ApiJson(report): ApiJson<RunnerReport>,
) -> ApiResult<Run> {
    Ok(Json(c.report_started(id, report).await?))
}

async fn report_completed<S: RunStore + 'static>(
    State(c): State<Shared<S>>,
    ApiPath(id): ApiPath<RunId>,
    ApiJson(report): ApiJson<RunnerReport>,
) -> ApiResult<Run> {
    Ok(Json(c.report_completed(id, report).await?))
}

async fn report_failed<S: RunStore + 'static>(
    State(c): State<Shared<S>>,
    ApiPath(id): ApiPath<RunId>,
    ApiJson(report): ApiJson<RunnerReport>,
) -> ApiResult<Run> {
    Ok(Json(c.report_failed(id, report).await?))
}

async fn report_stopped<S: RunStore + 'static>(
    State(c): State<Shared<S>>,
    ApiPath(id): ApiPath<RunId>,
    ApiJson(report): ApiJson<RunnerReport>,
) -> ApiResult<Run> {
    Ok(Json(c.report_stopped(id, report).await?))
}

async fn record_event<S: RunStore + 'static>(
    State(c): State<Shared<S>>,
    ApiPath(id): ApiPath<RunId>,
    ApiJson(event): ApiJson<ProgressEvent>,
) -> Result<(StatusCode, Json<Event>), ApiError> {
    let event = c.record_event(id, event).await?;
    Ok((StatusCode::CREATED, Json(event)))
}

async fn register<S: RunStore + 'static>(
    State(c): State<Shared<S>>,
    ApiJson(req): ApiJson<RegisterRunner>,
) -> ApiResult<RegisterOutcome> {
    Ok(Json(c.register(req).await?))
}

async fn heartbeat<S: RunStore + 'static>(
    State(c): State<Shared<S>>,
    ApiJson(body): ApiJson<RunnerIdBody>,
) -> ApiResult<HeartbeatAck> {
    Ok(Json(c.heartbeat(&body.runner_id).await?))
}

async fn deregister_self<S: RunStore + 'static>(
    State(c): State<Shared<S>>,
    ApiJson(body): ApiJson<RunnerIdBody>,
) -> ApiResult<Deregistration> {
    Ok(Json(
        c.deregister(&body.runner_id, Initiator::SelfInitiated)
            .await?,
    ))
}

// ---- Observers ----

async fn list_runners<S: RunStore + 'static>(
    State(c): State<Shared<S>>,
) -> ApiResult<Vec<RunnerInfo>> {
    Ok(Json(c.list_runners().await?))
}

async fn deregister<S: RunStore + 'static>(
    State(c): State<Shared<S>>,
    ApiPath(runner_id): ApiPath<String>,
    ApiQuery(query): ApiQuery<DeregisterQuery>,
) -> ApiResult<Deregistration> {
    Ok(Json(c.deregister(&runner_id, query.initiated_by).await?))
}

async fn list_sessions<S: RunStore + 'static>(
    State(c): State<Shared<S>>,
    ApiQuery(query): ApiQuery<SessionListQuery>,
) -> ApiResult<Vec<Session>> {
    Ok(Json(c.list_sessions(query.into()).await?))
}

async fn get_session<S: RunStore + 'static>(
    State(c): State<Shared<S>>,
    ApiPath(id): ApiPath<String>,
) -> ApiResult<Session> {
    Ok(Json(c.get_session(&id).await?))
}

async fn delete_session<S: RunStore + 'static>(
    State(c): State<Shared<S>>,
    ApiPath(id): ApiPath<String>,
) -> Result<StatusCode, ApiError> {
    c.delete_session(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn session_runs<S: RunStore + 'static>(
    State(c): State<Shared<S>>,
    ApiPath(id): ApiPath<String>,
) -> ApiResult<Vec<Run>> {
    Ok(Json(c.session_runs(&id).await?))
}

async fn session_events<S: RunStore + 'static>(
    State(c): State<Shared<S>>,
    ApiPath(id): ApiPath<String>,
    ApiQuery(query): ApiQuery<EventHistoryQuery>,
) -> ApiResult<Vec<Event>> {
    Ok(Json(c.session_events(&id, query.into()).await?))
}
