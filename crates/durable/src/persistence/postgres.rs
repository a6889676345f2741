//! PostgreSQL implementation of SystemDatabase
//!
//! Production persistence with:
//! - Guarded upserts on (workflow, function) for idempotent replay
//! - FIFO notification consumption under row locks
//! - Cross-process wakeups via LISTEN/NOTIFY
//! - Queue admission with SKIP LOCKED and per-queue advisory locks

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use sqlx::postgres::PgListener;
use sqlx::{PgPool, Row};
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use super::store::*;
use super::wakeup::{event_key, notification_key, WakeupHub};
use crate::serialization::ErrorEnvelope;

/// LISTEN channel for workflow notifications
pub const NOTIFICATIONS_CHANNEL: &str = "granite_notifications_channel";
/// LISTEN channel for workflow events
pub const EVENTS_CHANNEL: &str = "granite_workflow_events_channel";

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

/// PostgreSQL-backed system database
///
/// Holds a connection pool plus one background task that owns the LISTEN
/// connection and fans notifications out to in-process waiters.
pub struct PostgresSystemDatabase {
    pool: PgPool,
    hub: Arc<WakeupHub>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl PostgresSystemDatabase {
    /// Create the gateway, run migrations, and start the LISTEN task
    pub async fn connect(pool: PgPool) -> Result<Self, StoreError> {
        super::migrations::run_system_migrations(&pool).await?;

        let hub = Arc::new(WakeupHub::new());
        let listener = tokio::spawn(run_listener(pool.clone(), Arc::clone(&hub)));

        Ok(Self {
            pool,
            hub,
            listener: Mutex::new(Some(listener)),
        })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_status(row: &sqlx::postgres::PgRow) -> Result<WorkflowStatusRow, StoreError> {
        let status: String = row.try_get("status").map_err(db_err)?;
        Ok(WorkflowStatusRow {
            workflow_id: row.try_get("workflow_uuid").map_err(db_err)?,
            status: WorkflowState::parse(&status)?,
            name: row
                .try_get::<Option<String>, _>("name")
                .map_err(db_err)?
                .unwrap_or_default(),
            inputs: row
                .try_get::<Option<String>, _>("inputs")
                .map_err(db_err)?
                .unwrap_or_default(),
            authenticated_user: row.try_get("authenticated_user").map_err(db_err)?,
            assumed_role: row.try_get("assumed_role").map_err(db_err)?,
            authenticated_roles: row.try_get("authenticated_roles").map_err(db_err)?,
            request: row.try_get("request").map_err(db_err)?,
            output: row.try_get("output").map_err(db_err)?,
            error: row.try_get("error").map_err(db_err)?,
            executor_id: row.try_get("executor_id").map_err(db_err)?,
            created_at: row
                .try_get::<Option<i64>, _>("created_at")
                .map_err(db_err)?
                .unwrap_or_default(),
            updated_at: row
                .try_get::<Option<i64>, _>("updated_at")
                .map_err(db_err)?
                .unwrap_or_default(),
            application_version: row.try_get("application_version").map_err(db_err)?,
            queue_name: row.try_get("queue_name").map_err(db_err)?,
            queued_at: row.try_get("queued_at").map_err(db_err)?,
            started_at: row.try_get("started_at").map_err(db_err)?,
            completed_at: row.try_get("completed_at").map_err(db_err)?,
        })
    }

    /// Look up a recorded operation row, distinguishing a recorded null
    /// outcome (e.g. a `recv` timeout) from no record at all
    async fn fetch_operation_row(
        &self,
        workflow_id: &str,
        function_id: u32,
    ) -> Result<Option<(Option<String>, Option<String>)>, StoreError> {
        let row = sqlx::query(
            "SELECT output, error FROM granite.operation_outputs \
             WHERE workflow_uuid = $1 AND function_id = $2",
        )
        .bind(workflow_id)
        .bind(function_id as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(match row {
            Some(row) => Some((
                row.try_get("output").map_err(db_err)?,
                row.try_get("error").map_err(db_err)?,
            )),
            None => None,
        })
    }
}

impl Drop for PostgresSystemDatabase {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
    }
}

/// Own the LISTEN connection; reconnect with backoff on failure
async fn run_listener(pool: PgPool, hub: Arc<WakeupHub>) {
    loop {
        let mut listener = match PgListener::connect_with(&pool).await {
            Ok(l) => l,
            Err(e) => {
                warn!("notification listener connect failed: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        if let Err(e) = listener
            .listen_all([NOTIFICATIONS_CHANNEL, EVENTS_CHANNEL])
            .await
        {
            warn!("LISTEN failed: {}", e);
            tokio::time::sleep(Duration::from_secs(1)).await;
            continue;
        }

        debug!("notification listener established");

        loop {
            match listener.recv().await {
                Ok(notification) => {
                    let prefix = if notification.channel() == NOTIFICATIONS_CHANNEL {
                        'n'
                    } else {
                        'e'
                    };
                    hub.wake(&format!("{prefix}:{}", notification.payload()));
                }
                Err(e) => {
                    warn!("notification listener lost connection: {}", e);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl SystemDatabase for PostgresSystemDatabase {
    #[instrument(skip(self, row), fields(workflow_id = %row.workflow_id))]
    async fn insert_workflow_status(
        &self,
        row: &WorkflowStatusRow,
    ) -> Result<(WorkflowStatusRow, bool), StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO granite.workflow_status (
                workflow_uuid, status, name, inputs,
                authenticated_user, assumed_role, authenticated_roles, request,
                output, error, executor_id, created_at, updated_at,
                application_version, queue_name, queued_at, started_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            ON CONFLICT (workflow_uuid) DO NOTHING
            "#,
        )
        .bind(&row.workflow_id)
        .bind(row.status.as_str())
        .bind(&row.name)
        .bind(&row.inputs)
        .bind(&row.authenticated_user)
        .bind(&row.assumed_role)
        .bind(&row.authenticated_roles)
        .bind(&row.request)
        .bind(&row.output)
        .bind(&row.error)
        .bind(&row.executor_id)
        .bind(row.created_at)
        .bind(row.updated_at)
        .bind(&row.application_version)
        .bind(&row.queue_name)
        .bind(row.queued_at)
        .bind(row.started_at)
        .bind(row.completed_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if inserted.rows_affected() == 1 {
            debug!(workflow_id = %row.workflow_id, "registered workflow");
            return Ok((row.clone(), true));
        }

        let existing = self
            .get_workflow_status(&row.workflow_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(row.workflow_id.clone()))?;

        if existing.name != row.name {
            return Err(StoreError::ConflictingWorkflow {
                workflow_id: row.workflow_id.clone(),
                existing_name: existing.name,
            });
        }

        Ok((existing, false))
    }

    #[instrument(skip(self, update), fields(workflow_id = %update.workflow_id))]
    async fn update_workflow_status(&self, update: &StatusUpdate) -> Result<(), StoreError> {
        let now = now_ms();
        let terminal = update.status.is_terminal();

        let result = sqlx::query(
            r#"
            UPDATE granite.workflow_status
            SET status = $2,
                output = COALESCE($3, output),
                error = COALESCE($4, error),
                updated_at = $5,
                completed_at = CASE WHEN $6 THEN $5 ELSE completed_at END
            WHERE workflow_uuid = $1 AND status = 'PENDING'
            "#,
        )
        .bind(&update.workflow_id)
        .bind(update.status.as_str())
        .bind(&update.output)
        .bind(&update.error)
        .bind(now)
        .bind(terminal)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            // Either missing or already terminal; terminal rows are immutable
            let existing = self.get_workflow_status(&update.workflow_id).await?;
            if existing.is_none() {
                return Err(StoreError::NotFound(update.workflow_id.clone()));
            }
        }

        Ok(())
    }

    async fn flush_status_batch(&self, updates: &[StatusUpdate]) -> Result<(), StoreError> {
        if updates.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let now = now_ms();

        for update in updates {
            sqlx::query(
                r#"
                UPDATE granite.workflow_status
                SET status = $2,
                    output = COALESCE($3, output),
                    error = COALESCE($4, error),
                    updated_at = $5,
                    completed_at = CASE WHEN $6 THEN $5 ELSE completed_at END
                WHERE workflow_uuid = $1 AND status = 'PENDING'
                "#,
            )
            .bind(&update.workflow_id)
            .bind(update.status.as_str())
            .bind(&update.output)
            .bind(&update.error)
            .bind(now)
            .bind(update.status.is_terminal())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        debug!(count = updates.len(), "flushed workflow status batch");
        Ok(())
    }

    async fn get_workflow_status(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowStatusRow>, StoreError> {
        let row = sqlx::query("SELECT * FROM granite.workflow_status WHERE workflow_uuid = $1")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.as_ref().map(Self::row_to_status).transpose()
    }

    async fn await_workflow_result(
        &self,
        workflow_id: &str,
        poll_interval: Duration,
    ) -> Result<String, StoreError> {
        loop {
            let row = self
                .get_workflow_status(workflow_id)
                .await?
                .ok_or_else(|| StoreError::NotFound(workflow_id.to_string()))?;

            match row.status {
                WorkflowState::Pending => tokio::time::sleep(poll_interval).await,
                WorkflowState::Success => {
                    return Ok(row.output.unwrap_or_else(|| "null".to_string()));
                }
                WorkflowState::Error | WorkflowState::RetriesExceeded => {
                    let envelope = row
                        .error
                        .as_deref()
                        .map(ErrorEnvelope::from_json)
                        .unwrap_or_else(|| ErrorEnvelope::new("Unknown", "workflow failed"));
                    return Err(StoreError::WorkflowFailed(envelope));
                }
                WorkflowState::Cancelled => {
                    return Err(StoreError::WorkflowCancelled(workflow_id.to_string()));
                }
            }
        }
    }

    async fn list_pending_workflows(&self) -> Result<Vec<WorkflowStatusRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM granite.workflow_status WHERE status = 'PENDING' ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(Self::row_to_status).collect()
    }

    async fn latest_creation_with_prefix(
        &self,
        id_prefix: &str,
    ) -> Result<Option<i64>, StoreError> {
        let row = sqlx::query(
            "SELECT MAX(created_at) AS latest FROM granite.workflow_status \
             WHERE workflow_uuid LIKE $1 || '%'",
        )
        .bind(id_prefix)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        row.try_get("latest").map_err(db_err)
    }

    async fn check_operation_output(
        &self,
        workflow_id: &str,
        function_id: u32,
    ) -> Result<Option<OperationOutcome>, StoreError> {
        Ok(self
            .fetch_operation_row(workflow_id, function_id)
            .await?
            .map(|(output, error)| match error {
                Some(error) => OperationOutcome::Error(error),
                None => OperationOutcome::Output(output.unwrap_or_else(|| "null".to_string())),
            }))
    }

    #[instrument(skip(self, output))]
    async fn record_operation_output(
        &self,
        workflow_id: &str,
        function_id: u32,
        output: &str,
    ) -> Result<(), StoreError> {
        let inserted = sqlx::query(
            "INSERT INTO granite.operation_outputs (workflow_uuid, function_id, output, created_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (workflow_uuid, function_id) DO NOTHING",
        )
        .bind(workflow_id)
        .bind(function_id as i32)
        .bind(output)
        .bind(now_ms())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if inserted.rows_affected() == 1 {
            return Ok(());
        }

        match self.fetch_operation_row(workflow_id, function_id).await? {
            Some((Some(existing), None)) if existing == output => Ok(()),
            _ => Err(StoreError::ConflictingRecord {
                workflow_id: workflow_id.to_string(),
                function_id,
            }),
        }
    }

    #[instrument(skip(self, error))]
    async fn record_operation_error(
        &self,
        workflow_id: &str,
        function_id: u32,
        error: &str,
    ) -> Result<(), StoreError> {
        let inserted = sqlx::query(
            "INSERT INTO granite.operation_outputs (workflow_uuid, function_id, error, created_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (workflow_uuid, function_id) DO NOTHING",
        )
        .bind(workflow_id)
        .bind(function_id as i32)
        .bind(error)
        .bind(now_ms())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if inserted.rows_affected() == 1 {
            return Ok(());
        }

        match self.fetch_operation_row(workflow_id, function_id).await? {
            Some((None, Some(existing))) if existing == error => Ok(()),
            _ => Err(StoreError::ConflictingRecord {
                workflow_id: workflow_id.to_string(),
                function_id,
            }),
        }
    }

    #[instrument(skip(self, message))]
    async fn send(
        &self,
        source_workflow_id: &str,
        function_id: u32,
        destination_workflow_id: &str,
        topic: &str,
        message: &str,
    ) -> Result<(), StoreError> {
        // A recorded send is a replay; skip without touching the destination.
        if self
            .fetch_operation_row(source_workflow_id, function_id)
            .await?
            .is_some()
        {
            debug!(%source_workflow_id, function_id, "send already recorded, skipping");
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let destination_exists =
            sqlx::query("SELECT 1 FROM granite.workflow_status WHERE workflow_uuid = $1")
                .bind(destination_workflow_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?
                .is_some();

        if !destination_exists {
            return Err(StoreError::DestinationNotFound(
                destination_workflow_id.to_string(),
            ));
        }

        sqlx::query(
            "INSERT INTO granite.notifications \
             (destination_uuid, topic, message, created_at, message_uuid) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(destination_workflow_id)
        .bind(topic)
        .bind(message)
        .bind(now_ms())
        .bind(Uuid::new_v4().to_string())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let guarded = sqlx::query(
            "INSERT INTO granite.operation_outputs (workflow_uuid, function_id, output, created_at) \
             VALUES ($1, $2, 'null', $3) \
             ON CONFLICT (workflow_uuid, function_id) DO NOTHING",
        )
        .bind(source_workflow_id)
        .bind(function_id as i32)
        .bind(now_ms())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if guarded.rows_affected() == 0 {
            // A concurrent duplicate won the guard; its message stands.
            return Ok(());
        }

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(NOTIFICATIONS_CHANNEL)
            .bind(format!("{destination_workflow_id}::{topic}"))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        debug!(%destination_workflow_id, topic, "sent notification");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn recv(
        &self,
        workflow_id: &str,
        function_id: u32,
        topic: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        // Replay: return the recorded outcome, message or timeout alike.
        if let Some((output, error)) = self.fetch_operation_row(workflow_id, function_id).await? {
            if let Some(error) = error {
                return Err(StoreError::WorkflowFailed(ErrorEnvelope::from_json(&error)));
            }
            return Ok(output);
        }

        let subscription = self
            .hub
            .subscribe(notification_key(workflow_id, topic));
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = subscription.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.consume_message(workflow_id, function_id, topic).await? {
                return Ok(Some(message));
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    // Record the timeout so replays observe the same outcome.
                    sqlx::query(
                        "INSERT INTO granite.operation_outputs \
                         (workflow_uuid, function_id, created_at) VALUES ($1, $2, $3) \
                         ON CONFLICT (workflow_uuid, function_id) DO NOTHING",
                    )
                    .bind(workflow_id)
                    .bind(function_id as i32)
                    .bind(now_ms())
                    .execute(&self.pool)
                    .await
                    .map_err(db_err)?;

                    let (output, _) = self
                        .fetch_operation_row(workflow_id, function_id)
                        .await?
                        .unwrap_or((None, None));
                    return Ok(output);
                }
            }
        }
    }

    #[instrument(skip(self, value))]
    async fn set_event(
        &self,
        workflow_id: &str,
        function_id: u32,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        if let Some((output, _)) = self.fetch_operation_row(workflow_id, function_id).await? {
            if output.as_deref() == Some(value) {
                return Ok(());
            }
            return Err(StoreError::ConflictingRecord {
                workflow_id: workflow_id.to_string(),
                function_id,
            });
        }

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let inserted = sqlx::query(
            "INSERT INTO granite.workflow_events (workflow_uuid, key, value) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (workflow_uuid, key) DO NOTHING",
        )
        .bind(workflow_id)
        .bind(key)
        .bind(value)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if inserted.rows_affected() == 0 {
            let existing: Option<String> = sqlx::query(
                "SELECT value FROM granite.workflow_events WHERE workflow_uuid = $1 AND key = $2",
            )
            .bind(workflow_id)
            .bind(key)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?
            .try_get("value")
            .map_err(db_err)?;

            if existing.as_deref() != Some(value) {
                return Err(StoreError::EventAlreadySet {
                    workflow_id: workflow_id.to_string(),
                    key: key.to_string(),
                });
            }
        }

        sqlx::query(
            "INSERT INTO granite.operation_outputs (workflow_uuid, function_id, output, created_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (workflow_uuid, function_id) DO NOTHING",
        )
        .bind(workflow_id)
        .bind(function_id as i32)
        .bind(value)
        .bind(now_ms())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(EVENTS_CHANNEL)
            .bind(format!("{workflow_id}::{key}"))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        debug!(%workflow_id, key, "event set");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_event(
        &self,
        target_workflow_id: &str,
        key: &str,
        timeout: Duration,
        caller: Option<&CallerContext>,
    ) -> Result<Option<String>, StoreError> {
        if let Some(caller) = caller {
            if let Some((output, error)) = self
                .fetch_operation_row(&caller.workflow_id, caller.function_id)
                .await?
            {
                if let Some(error) = error {
                    return Err(StoreError::WorkflowFailed(ErrorEnvelope::from_json(&error)));
                }
                return Ok(output);
            }
        }

        let subscription = self.hub.subscribe(event_key(target_workflow_id, key));
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = subscription.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let value: Option<String> = sqlx::query(
                "SELECT value FROM granite.workflow_events WHERE workflow_uuid = $1 AND key = $2",
            )
            .bind(target_workflow_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(|row| row.try_get::<Option<String>, _>("value").map_err(db_err))
            .transpose()?
            .flatten();

            if let Some(value) = value {
                if let Some(caller) = caller {
                    self.record_operation_output(&caller.workflow_id, caller.function_id, &value)
                        .await?;
                }
                return Ok(Some(value));
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    if let Some(caller) = caller {
                        sqlx::query(
                            "INSERT INTO granite.operation_outputs \
                             (workflow_uuid, function_id, created_at) VALUES ($1, $2, $3) \
                             ON CONFLICT (workflow_uuid, function_id) DO NOTHING",
                        )
                        .bind(&caller.workflow_id)
                        .bind(caller.function_id as i32)
                        .bind(now_ms())
                        .execute(&self.pool)
                        .await
                        .map_err(db_err)?;
                    }
                    return Ok(None);
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn enqueue_workflow(&self, queue: &str, workflow_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO granite.workflow_queue (workflow_uuid, queue_name, created_at) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (workflow_uuid) DO NOTHING",
        )
        .bind(workflow_id)
        .bind(queue)
        .bind(now_ms())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        debug!(%workflow_id, queue, "enqueued workflow");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn start_queued_workflows(
        &self,
        queue: &str,
        concurrency_limit: u32,
    ) -> Result<Vec<String>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Serialize pumps for this queue across processes.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1)::bigint)")
            .bind(queue)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let running: i64 = sqlx::query(
            "SELECT COUNT(*) AS running FROM granite.workflow_queue \
             WHERE queue_name = $1 AND started_at IS NOT NULL AND completed_at IS NULL",
        )
        .bind(queue)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?
        .try_get("running")
        .map_err(db_err)?;

        let available = (concurrency_limit as i64 - running).max(0);
        if available == 0 {
            return Ok(vec![]);
        }

        let now = now_ms();
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT workflow_uuid
                FROM granite.workflow_queue
                WHERE queue_name = $1 AND started_at IS NULL AND completed_at IS NULL
                ORDER BY created_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE granite.workflow_queue q
            SET started_at = $3
            FROM claimable c
            WHERE q.workflow_uuid = c.workflow_uuid
            RETURNING q.workflow_uuid
            "#,
        )
        .bind(queue)
        .bind(available)
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        let started: Vec<String> = rows
            .iter()
            .map(|row| row.try_get("workflow_uuid").map_err(db_err))
            .collect::<Result<_, _>>()?;

        // Stamp the status rows in the same transaction: recovery keys off
        // workflow_status.started_at to tell admitted entries (its job to
        // resume) from unadmitted ones (still the pump's)
        if !started.is_empty() {
            sqlx::query(
                "UPDATE granite.workflow_status SET started_at = $2 \
                 WHERE workflow_uuid = ANY($1)",
            )
            .bind(&started)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;

        if !started.is_empty() {
            debug!(queue, count = started.len(), "admitted queued workflows");
        }

        Ok(started)
    }

    async fn mark_queue_entry_completed(&self, workflow_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE granite.workflow_queue SET completed_at = $2 \
             WHERE workflow_uuid = $1 AND completed_at IS NULL",
        )
        .bind(workflow_id)
        .bind(now_ms())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn record_executor_heartbeat(
        &self,
        executor_id: &str,
        now_ms: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO granite.executor_heartbeats (executor_id, last_seen) VALUES ($1, $2) \
             ON CONFLICT (executor_id) DO UPDATE SET last_seen = EXCLUDED.last_seen",
        )
        .bind(executor_id)
        .bind(now_ms)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn list_dead_executors(
        &self,
        threshold_ms: i64,
        now_ms: i64,
    ) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT executor_id FROM granite.executor_heartbeats WHERE last_seen < $1",
        )
        .bind(now_ms - threshold_ms)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| row.try_get("executor_id").map_err(db_err))
            .collect()
    }
}

impl PostgresSystemDatabase {
    /// Consume the oldest message for (workflow, topic), recording the
    /// receipt in the same transaction as the delete
    ///
    /// On a guard collision the transaction rolls back, leaving the message
    /// in place, and the recorded outcome is replayed instead.
    async fn consume_message(
        &self,
        workflow_id: &str,
        function_id: u32,
        topic: &str,
    ) -> Result<Option<String>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(
            r#"
            DELETE FROM granite.notifications
            WHERE message_uuid = (
                SELECT message_uuid FROM granite.notifications
                WHERE destination_uuid = $1 AND topic = $2
                ORDER BY created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING message
            "#,
        )
        .bind(workflow_id)
        .bind(topic)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let message: Option<String> = row.try_get("message").map_err(db_err)?;
        let message = message.unwrap_or_else(|| "null".to_string());

        let recorded = sqlx::query(
            "INSERT INTO granite.operation_outputs (workflow_uuid, function_id, output, created_at) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(workflow_id)
        .bind(function_id as i32)
        .bind(&message)
        .bind(now_ms())
        .execute(&mut *tx)
        .await;

        match recorded {
            Ok(_) => {
                tx.commit().await.map_err(db_err)?;
                Ok(Some(message))
            }
            Err(e) if is_unique_violation(&e) => {
                // A concurrent duplicate already consumed for this step; put
                // the message back and replay its outcome.
                drop(tx);
                let (output, _) = self
                    .fetch_operation_row(workflow_id, function_id)
                    .await?
                    .unwrap_or((None, None));
                Ok(output)
            }
            Err(e) => {
                error!("failed to record receive: {}", e);
                Err(db_err(e))
            }
        }
    }
}
