//! SQLite run store (feature-gated).
//!
//! Claims and reports are conditional `UPDATE`s guarded by the status, owner
//! and `updated_at` the writer observed. Each write transaction opens with
//! that `UPDATE`, so it takes the write lock before reading anything.

use std::{path::PathBuf, str::FromStr, time::Duration};

use async_trait::async_trait;
use runcoord_core::{
    Event, EventQuery, NewEvent, Run, RunId, RunStatus, RunStore, RunTransition, Session,
    SessionContext, SessionStatus, StoreError,
    now_millis,
    state::{derive_session_status, plan_transition},
    traits::{
        CreatedRun, ExecutionMode, NewRun, RunFilter, RunKind, SessionFilter, TransitionOutcome,
        TransitionRequest,
    },
};
use sqlx::{
    QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
};
use uuid::Uuid;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

const RUN_COLUMNS: &str = "id, session_id, kind, status, prompt, mode, requires, runner_id, \
    result, error, created_at, claimed_at, started_at, stop_requested_at, completed_at, updated_at";

const SESSION_COLUMNS: &str = "id, name, status, agent, working_dir, parent_session_id, metadata, \
    executor_session_id, host, created_at, updated_at";

const EVENT_COLUMNS: &str = "id, session_id, run_id, event_type, timestamp, payload";

/// Attempts at a conditional write before giving up on a contended run.
const MAX_WRITE_ATTEMPTS: usize = 3;

/// Pending runs read per round trip while looking for a claimable one.
const CLAIM_PAGE_SIZE: usize = 32;

/// SQLite storage implementation.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

fn db_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Internal(e.to_string())
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

impl SqliteStore {
    /// Open (or create) the database and apply migrations.
    ///
    /// `sqlite::memory:` gives a private in-memory database held by a single
    /// connection.
    ///
    /// # Errors
    /// Returns error if the URL is invalid, the connection fails or a
    /// migration fails.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let in_memory = database_url.contains(":memory:");

        let mut options = SqliteConnectOptions::from_str(database_url)
            .map_err(db_err)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(8)
        };
        let pool = pool_options.connect_with(options).await.map_err(db_err)?;

        MIGRATOR.run(&pool).await.map_err(db_err)?;
        tracing::info!(database_url, "SQLite run store ready");

        Ok(Self { pool })
    }

    /// Pending runs in queue order strictly after the `(created_at, id)` key.
    async fn pending_page(
        &self,
        after: Option<&(i64, String)>,
        unlabelled_only: bool,
    ) -> Result<Vec<Run>, StoreError> {
        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new(format!("SELECT {RUN_COLUMNS} FROM runs WHERE status = "));
        qb.push_bind(RunStatus::Pending.as_str());
        if unlabelled_only {
            qb.push(" AND requires = '[]'");
        }
        if let Some((created_at, id)) = after {
            qb.push(" AND (created_at, id) > (")
                .push_bind(*created_at)
                .push(", ")
                .push_bind(id.clone())
                .push(")");
        }
        qb.push(" ORDER BY created_at, id LIMIT ")
            .push_bind(to_i64(CLAIM_PAGE_SIZE));

        qb.build()
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?
            .iter()
            .map(run_from_row)
            .collect()
    }

    async fn fetch_run(&self, id: RunId) -> Result<Option<Run>, StoreError> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?");
        sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(|row| run_from_row(&row))
            .transpose()
    }

    /// Persist `planned` if the row still matches `observed`, and record the
    /// event and session side effects in the same transaction.
    ///
    /// Returns `Ok(None)` when another writer got there first.
    async fn commit_transition(
        &self,
        observed: &Run,
        planned: Run,
        executor_session_id: Option<&str>,
    ) -> Result<Option<TransitionOutcome>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let updated = sqlx::query(
            "UPDATE runs SET status = ?, runner_id = ?, result = ?, error = ?, claimed_at = ?, \
             started_at = ?, stop_requested_at = ?, completed_at = ?, updated_at = ? \
             WHERE id = ? AND status = ? AND runner_id IS ? AND updated_at = ?",
        )
        .bind(planned.status.as_str())
        .bind(planned.runner_id.as_deref())
        .bind(planned.result.as_deref())
        .bind(planned.error.as_deref())
        .bind(planned.claimed_at)
        .bind(planned.started_at)
        .bind(planned.stop_requested_at)
        .bind(planned.completed_at)
        .bind(planned.updated_at)
        .bind(observed.id.to_string())
        .bind(observed.status.as_str())
        .bind(observed.runner_id.as_deref())
        .bind(observed.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await.map_err(db_err)?;
            return Ok(None);
        }

        if let Some(executor_session_id) = executor_session_id {
            sqlx::query("UPDATE sessions SET executor_session_id = ? WHERE id = ?")
                .bind(executor_session_id)
                .bind(&planned.session_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        let event = insert_event(&mut tx, NewEvent::status_change(&planned, Some(observed.status)))
            .await?;
        refresh_session(&mut tx, &planned.session_id, planned.updated_at).await?;
        tx.commit().await.map_err(db_err)?;

        Ok(Some(TransitionOutcome {
            run: planned,
            previous: observed.status,
            event,
        }))
    }
}

async fn insert_event(conn: &mut SqliteConnection, event: NewEvent) -> Result<Event, StoreError> {
    let payload = serde_json::to_string(&event.payload).map_err(db_err)?;
    let id = sqlx::query(
        "INSERT INTO events (session_id, run_id, event_type, timestamp, payload) \
         SELECT ?, ?, ?, ?, ? WHERE EXISTS (SELECT 1 FROM sessions WHERE id = ?)",
    )
    .bind(&event.session_id)
    .bind(event.run_id.map(|id| id.to_string()))
    .bind(event.event_type.as_str())
    .bind(event.timestamp)
    .bind(payload)
    .bind(&event.session_id)
    .execute(&mut *conn)
    .await
    .map_err(db_err)
    .and_then(|res| {
        if res.rows_affected() == 0 {
            Err(StoreError::session_not_found(&event.session_id))
        } else {
            Ok(res.last_insert_rowid())
        }
    })?;
    Ok(event.into_event(id))
}

async fn refresh_session(
    conn: &mut SqliteConnection,
    session_id: &str,
    at: i64,
) -> Result<(), StoreError> {
    let rows = sqlx::query("SELECT created_at, id, status FROM runs WHERE session_id = ?")
        .bind(session_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err)?;

    let mut runs = Vec::with_capacity(rows.len());
    for row in &rows {
        let created_at: i64 = row.try_get("created_at").map_err(db_err)?;
        let id: String = row.try_get("id").map_err(db_err)?;
        let status: String = row.try_get("status").map_err(db_err)?;
        runs.push((
            created_at,
            Uuid::parse_str(&id).map_err(db_err)?,
            RunStatus::from_str(&status).map_err(db_err)?,
        ));
    }

    sqlx::query("UPDATE sessions SET status = ?, updated_at = ? WHERE id = ?")
        .bind(derive_session_status(runs).as_str())
        .bind(at)
        .bind(session_id)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    Ok(())
}

fn run_from_row(row: &SqliteRow) -> Result<Run, StoreError> {
    let id: String = row.try_get("id").map_err(db_err)?;
    let kind: String = row.try_get("kind").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    let mode: String = row.try_get("mode").map_err(db_err)?;
    let requires: String = row.try_get("requires").map_err(db_err)?;

    Ok(Run {
        id: Uuid::parse_str(&id).map_err(db_err)?,
        session_id: row.try_get("session_id").map_err(db_err)?,
        kind: RunKind::parse(&kind).ok_or_else(|| db_err(format!("bad run kind {kind}")))?,
        status: RunStatus::from_str(&status).map_err(db_err)?,
        prompt: row.try_get("prompt").map_err(db_err)?,
        mode: ExecutionMode::parse(&mode).ok_or_else(|| db_err(format!("bad mode {mode}")))?,
        requires: serde_json::from_str(&requires).map_err(db_err)?,
        runner_id: row.try_get("runner_id").map_err(db_err)?,
        result: row.try_get("result").map_err(db_err)?,
        error: row.try_get("error").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        claimed_at: row.try_get("claimed_at").map_err(db_err)?,
        started_at: row.try_get("started_at").map_err(db_err)?,
        stop_requested_at: row.try_get("stop_requested_at").map_err(db_err)?,
        completed_at: row.try_get("completed_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn session_from_row(row: &SqliteRow) -> Result<Session, StoreError> {
    let status: String = row.try_get("status").map_err(db_err)?;
    let working_dir: Option<String> = row.try_get("working_dir").map_err(db_err)?;
    let metadata: String = row.try_get("metadata").map_err(db_err)?;

    Ok(Session {
        id: row.try_get("id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        status: SessionStatus::parse(&status)
            .ok_or_else(|| db_err(format!("bad session status {status}")))?,
        context: SessionContext {
            agent: row.try_get("agent").map_err(db_err)?,
            working_dir: working_dir.map(PathBuf::from),
            parent_session_id: row.try_get("parent_session_id").map_err(db_err)?,
            metadata: serde_json::from_str(&metadata).map_err(db_err)?,
        },
        executor_session_id: row.try_get("executor_session_id").map_err(db_err)?,
        host: row.try_get("host").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn event_from_row(row: &SqliteRow) -> Result<Event, StoreError> {
    let run_id: Option<String> = row.try_get("run_id").map_err(db_err)?;
    let event_type: String = row.try_get("event_type").map_err(db_err)?;
    let payload: String = row.try_get("payload").map_err(db_err)?;

    Ok(Event {
        id: row.try_get("id").map_err(db_err)?,
        session_id: row.try_get("session_id").map_err(db_err)?,
        run_id: run_id
            .map(|id| Uuid::parse_str(&id))
            .transpose()
            .map_err(db_err)?,
        event_type: event_type.parse().map_err(db_err)?,
        timestamp: row.try_get("timestamp").map_err(db_err)?,
        payload: serde_json::from_str(&payload).map_err(db_err)?,
    })
}

#[async_trait]
impl RunStore for SqliteStore {
    async fn create_run(&self, new: NewRun) -> Result<CreatedRun, StoreError> {
        let timestamp = now_millis();
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        if new.kind == RunKind::Resume {
            let touched = sqlx::query("UPDATE sessions SET updated_at = ? WHERE id = ?")
                .bind(timestamp)
                .bind(&new.session_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?
                .rows_affected();
            if touched == 0 {
                tx.rollback().await.map_err(db_err)?;
                return Err(StoreError::session_not_found(&new.session_id));
            }
        } else {
            let metadata = serde_json::to_string(&new.context.metadata).map_err(db_err)?;
            sqlx::query(
                "INSERT INTO sessions (id, name, status, agent, working_dir, parent_session_id, \
                 metadata, executor_session_id, host, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, NULL, ?, ?, ?) ON CONFLICT (id) DO NOTHING",
            )
            .bind(&new.session_id)
            .bind(new.display_name())
            .bind(SessionStatus::Pending.as_str())
            .bind(&new.context.agent)
            .bind(
                new.context
                    .working_dir
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
            )
            .bind(new.context.parent_session_id.as_deref())
            .bind(metadata)
            .bind(&new.host)
            .bind(timestamp)
            .bind(timestamp)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
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

        sqlx::query(
            "INSERT INTO runs (id, session_id, kind, status, prompt, mode, requires, created_at, \
             updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(run.id.to_string())
        .bind(&run.session_id)
        .bind(run.kind.as_str())
        .bind(run.status.as_str())
        .bind(&run.prompt)
        .bind(run.mode.as_str())
        .bind(serde_json::to_string(&run.requires).map_err(db_err)?)
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let event = insert_event(&mut tx, NewEvent::status_change(&run, None)).await?;
        refresh_session(&mut tx, &run.session_id, timestamp).await?;

        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(&run.session_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
        let session = session_from_row(&row)?;

        tx.commit().await.map_err(db_err)?;

        Ok(CreatedRun {
            run,
            session,
            event,
        })
    }

    async fn get_run(&self, id: RunId) -> Result<Option<Run>, StoreError> {
        self.fetch_run(id).await
    }

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<Run>, StoreError> {
        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new(format!("SELECT {RUN_COLUMNS} FROM runs WHERE 1 = 1"));
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(session_id) = &filter.session_id {
            qb.push(" AND session_id = ").push_bind(session_id.clone());
        }
        if let Some(runner_id) = &filter.runner_id {
            qb.push(" AND runner_id = ").push_bind(runner_id.clone());
        }
        if filter.active_only {
            qb.push(" AND status IN ('claimed', 'running', 'stopping')");
        }
        qb.push(" ORDER BY created_at, id");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(to_i64(limit));
        }

        qb.build()
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?
            .iter()
            .map(run_from_row)
            .collect()
    }

    async fn claim_next(
        &self,
        runner_id: &str,
        capabilities: &[String],
        at: i64,
    ) -> Result<Option<TransitionOutcome>, StoreError> {
        // A runner without labels can only take unlabelled runs.
        let unlabelled_only = capabilities.is_empty();
        let mut after: Option<(i64, String)> = None;

        loop {
            let page = self.pending_page(after.as_ref(), unlabelled_only).await?;
            let Some(last) = page.last() else {
                return Ok(None);
            };
            after = Some((last.created_at, last.id.to_string()));

            for candidate in page.iter().filter(|r| r.matches(capabilities)) {
                let mut req =
                    TransitionRequest::new(candidate.id, RunTransition::Claim).by_runner(runner_id);
                req.at = at;
                let planned = plan_transition(candidate, &req)?;

                if let Some(outcome) = self.commit_transition(candidate, planned, None).await? {
                    return Ok(Some(outcome));
                }
                tracing::debug!(run_id = %candidate.id, runner_id, "Lost claim race");
            }

            if page.len() < CLAIM_PAGE_SIZE {
                return Ok(None);
            }
        }
    }

    async fn transition(&self, req: TransitionRequest) -> Result<TransitionOutcome, StoreError> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let observed = self
                .fetch_run(req.run_id)
                .await?
                .ok_or_else(|| StoreError::run_not_found(req.run_id))?;
            let planned = plan_transition(&observed, &req)?;

            if let Some(outcome) = self
                .commit_transition(&observed, planned, req.executor_session_id.as_deref())
                .await?
            {
                return Ok(outcome);
            }
            tracing::debug!(run_id = %req.run_id, "Run changed underneath transition, retrying");
        }

        Err(StoreError::Conflict(format!(
            "run {} is being modified concurrently",
            req.run_id
        )))
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?");
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(|row| session_from_row(&row))
            .transpose()
    }

    async fn list_sessions(&self, filter: SessionFilter) -> Result<Vec<Session>, StoreError> {
        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new(format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE 1 = 1"));
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(agent) = &filter.agent {
            qb.push(" AND agent = ").push_bind(agent.clone());
        }
        qb.push(" ORDER BY created_at DESC, id DESC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(to_i64(limit));
        }

        qb.build()
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?
            .iter()
            .map(session_from_row)
            .collect()
    }

    async fn delete_session(&self, id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let deleted = sqlx::query(
            "DELETE FROM sessions WHERE id = ? AND NOT EXISTS (SELECT 1 FROM runs \
             WHERE session_id = ? AND status NOT IN ('completed', 'failed', 'stopped'))",
        )
        .bind(id)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?
        .rows_affected();

        if deleted == 0 {
            let exists = sqlx::query("SELECT 1 FROM sessions WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?
                .is_some();
            tx.rollback().await.map_err(db_err)?;
            return Err(if exists {
                StoreError::Conflict(format!("session {id} has runs that are not terminal"))
            } else {
                StoreError::session_not_found(id)
            });
        }

        for sql in [
            "DELETE FROM events WHERE session_id = ?",
            "DELETE FROM runs WHERE session_id = ?",
        ] {
            sqlx::query(sql)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)
    }

    async fn append_event(&self, event: NewEvent) -> Result<Event, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        insert_event(&mut conn, event).await
    }

    async fn append_run_event(
        &self,
        run_id: RunId,
        runner_id: &str,
        event: NewEvent,
    ) -> Result<Event, StoreError> {
        let payload = serde_json::to_string(&event.payload).map_err(db_err)?;
        let inserted = sqlx::query(
            "INSERT INTO events (session_id, run_id, event_type, timestamp, payload) \
             SELECT session_id, id, ?, ?, ? FROM runs \
             WHERE id = ? AND runner_id = ? AND status NOT IN (?, ?, ?) \
             RETURNING id, session_id",
        )
        .bind(event.event_type.as_str())
        .bind(event.timestamp)
        .bind(payload)
        .bind(run_id.to_string())
        .bind(runner_id)
        .bind(RunStatus::Completed.as_str())
        .bind(RunStatus::Failed.as_str())
        .bind(RunStatus::Stopped.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let Some(row) = inserted else {
            let run = self
                .fetch_run(run_id)
                .await?
                .ok_or_else(|| StoreError::run_not_found(run_id))?;
            run.accepts_progress_from(runner_id)?;
            return Err(StoreError::Conflict(format!(
                "run {run_id} changed while recording an event"
            )));
        };

        let id: i64 = row.try_get("id").map_err(db_err)?;
        let session_id: String = row.try_get("session_id").map_err(db_err)?;
        Ok(NewEvent {
            session_id,
            run_id: Some(run_id),
            ..event
        }
        .into_event(id))
    }

    async fn list_events(
        &self,
        session_id: &str,
        query: EventQuery,
    ) -> Result<Vec<Event>, StoreError> {
        if self.get_session(session_id).await?.is_none() {
            return Err(StoreError::session_not_found(session_id));
        }

        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new(format!("SELECT {EVENT_COLUMNS} FROM events WHERE session_id = "));
        qb.push_bind(session_id.to_string());
        if let Some(since) = query.since {
            qb.push(" AND timestamp >= ").push_bind(since);
        }
        if let Some(event_type) = query.event_type {
            qb.push(" AND event_type = ").push_bind(event_type.as_str());
        }
        qb.push(" ORDER BY timestamp, id");
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ").push_bind(to_i64(limit));
        }

        qb.build()
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?
            .iter()
            .map(event_from_row)
            .collect()
    }
}
