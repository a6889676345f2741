//! Operation log and idempotency engine
//!
//! Sits between workflow execution and the databases. Assigns monotonic step
//! ids, implements the guarded-write protocol for transactional steps, and
//! buffers read-only outputs so they can be flushed in batches instead of
//! paying a durability write per step.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::Utc;
use parking_lot::Mutex;
use sqlx::{PgConnection, QueryBuilder, Row};
use tracing::debug;

use crate::appdb::is_key_conflict_error;
use crate::error::DurableError;
use crate::persistence::{BufferedOutput, OperationOutcome};

/// Monotonic 0-based step counter for one workflow execution
///
/// Incremented once per step entry, in the order the workflow code issues
/// step calls. Replays assign the same id to the same call site as long as
/// the workflow is deterministic between suspension points; that ordering is
/// a documented contract of workflow authorship, not an enforced property.
#[derive(Debug, Default)]
pub struct StepCounter(AtomicU32);

impl StepCounter {
    pub fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Claim the next function id
    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    /// Ids assigned so far
    pub fn assigned(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Buffered read-only transaction outputs, keyed by (workflow, function)
///
/// The lock is held only to move entries in and out, never across awaits.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    inner: Mutex<HashMap<String, BTreeMap<u32, BufferedOutput>>>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer one read-only output
    pub fn push(&self, output: BufferedOutput) {
        self.inner
            .lock()
            .entry(output.workflow_id.clone())
            .or_default()
            .insert(output.function_id, output);
    }

    /// Look up a buffered output, for replays that race the flush loop
    pub fn get(&self, workflow_id: &str, function_id: u32) -> Option<BufferedOutput> {
        self.inner
            .lock()
            .get(workflow_id)
            .and_then(|entries| entries.get(&function_id))
            .cloned()
    }

    /// Take everything buffered for one workflow, oldest step first
    ///
    /// Called before a read-write transactional step so ancestors commit
    /// atomically with (or before) the ensuing write.
    pub fn drain_workflow(&self, workflow_id: &str) -> Vec<BufferedOutput> {
        self.inner
            .lock()
            .remove(workflow_id)
            .map(|entries| entries.into_values().collect())
            .unwrap_or_default()
    }

    /// Take everything buffered across all workflows
    pub fn drain_all(&self) -> Vec<BufferedOutput> {
        let mut drained = self.inner.lock();
        let all: Vec<BufferedOutput> = drained
            .drain()
            .flat_map(|(_, entries)| entries.into_values())
            .collect();
        all
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Result of the guarded lookup at transactional step entry
#[derive(Debug)]
pub struct TransactionCheck {
    /// `pg_current_snapshot()` captured in the same statement as the lookup
    pub snapshot: String,
    /// Recorded outcome, when this step already ran
    pub recorded: Option<OperationOutcome>,
}

/// Guarded SELECT: fetch the current snapshot token and any recorded row in
/// one statement
pub async fn check_transaction_outcome(
    conn: &mut PgConnection,
    workflow_id: &str,
    function_id: u32,
) -> Result<TransactionCheck, DurableError> {
    let row = sqlx::query(
        r#"
        (SELECT output, error, pg_current_snapshot()::text AS snapshot, TRUE AS recorded
           FROM granite.transaction_outputs
          WHERE workflow_uuid = $1 AND function_id = $2)
        UNION ALL
        (SELECT NULL, NULL, pg_current_snapshot()::text, FALSE)
        ORDER BY recorded DESC
        LIMIT 1
        "#,
    )
    .bind(workflow_id)
    .bind(function_id as i32)
    .fetch_one(&mut *conn)
    .await?;

    let snapshot: String = row.try_get("snapshot")?;
    let recorded: bool = row.try_get("recorded")?;

    if !recorded {
        return Ok(TransactionCheck {
            snapshot,
            recorded: None,
        });
    }

    let output: Option<String> = row.try_get("output")?;
    let error: Option<String> = row.try_get("error")?;
    let outcome = match error {
        Some(error) => OperationOutcome::Error(error),
        None => OperationOutcome::Output(output.unwrap_or_else(|| "null".to_string())),
    };

    Ok(TransactionCheck {
        snapshot,
        recorded: Some(outcome),
    })
}

/// Write the guard row that anchors this step's idempotency
///
/// A concurrent duplicate with the same (workflow, function) collides on the
/// primary key here; its whole transaction aborts and the caller replays the
/// winner's committed outcome instead.
pub async fn insert_guard(
    conn: &mut PgConnection,
    workflow_id: &str,
    function_id: u32,
    snapshot: &str,
) -> Result<(), DurableError> {
    let result = sqlx::query(
        "INSERT INTO granite.transaction_outputs \
         (workflow_uuid, function_id, txn_snapshot, created_at) \
         VALUES ($1, $2, $3, $4)",
    )
    .bind(workflow_id)
    .bind(function_id as i32)
    .bind(snapshot)
    .bind(Utc::now().timestamp_millis())
    .execute(&mut *conn)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(e) if is_key_conflict_error(&e) => Err(DurableError::Conflict {
            workflow_id: workflow_id.to_string(),
            function_id,
        }),
        Err(e) => Err(e.into()),
    }
}

/// Complete the guard row with the step's real output and, once assigned,
/// the transaction id
pub async fn finalize_guard(
    conn: &mut PgConnection,
    workflow_id: &str,
    function_id: u32,
    output: &str,
) -> Result<(), DurableError> {
    sqlx::query(
        "UPDATE granite.transaction_outputs \
         SET output = $3, txn_id = pg_current_xact_id_if_assigned()::text \
         WHERE workflow_uuid = $1 AND function_id = $2",
    )
    .bind(workflow_id)
    .bind(function_id as i32)
    .bind(output)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Record a transactional step error
///
/// Runs in its own transaction: the failing step's transaction has rolled
/// back, taking its guard row with it.
pub async fn record_transaction_error(
    conn: &mut PgConnection,
    workflow_id: &str,
    function_id: u32,
    error: &str,
) -> Result<(), DurableError> {
    let result = sqlx::query(
        "INSERT INTO granite.transaction_outputs \
         (workflow_uuid, function_id, error, created_at) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (workflow_uuid, function_id) DO NOTHING",
    )
    .bind(workflow_id)
    .bind(function_id as i32)
    .bind(error)
    .bind(Utc::now().timestamp_millis())
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 1 {
        return Ok(());
    }

    let existing: Option<String> = sqlx::query(
        "SELECT error FROM granite.transaction_outputs \
         WHERE workflow_uuid = $1 AND function_id = $2",
    )
    .bind(workflow_id)
    .bind(function_id as i32)
    .fetch_one(&mut *conn)
    .await?
    .try_get("error")?;

    if existing.as_deref() == Some(error) {
        Ok(())
    } else {
        Err(DurableError::Conflict {
            workflow_id: workflow_id.to_string(),
            function_id,
        })
    }
}

/// Flush buffered read-only outputs in one multi-row insert
///
/// Replayed rows may already exist; the conflict target makes the flush
/// idempotent.
pub async fn flush_buffered(
    conn: &mut PgConnection,
    rows: &[BufferedOutput],
) -> Result<(), DurableError> {
    if rows.is_empty() {
        return Ok(());
    }

    let mut builder = QueryBuilder::new(
        "INSERT INTO granite.transaction_outputs \
         (workflow_uuid, function_id, output, txn_snapshot, created_at) ",
    );
    builder.push_values(rows, |mut b, row| {
        b.push_bind(&row.workflow_id)
            .push_bind(row.function_id as i32)
            .push_bind(&row.output)
            .push_bind(&row.txn_snapshot)
            .push_bind(row.created_at);
    });
    builder.push(" ON CONFLICT (workflow_uuid, function_id) DO NOTHING");

    builder.build().execute(&mut *conn).await?;

    debug!(count = rows.len(), "flushed buffered outputs");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffered(workflow_id: &str, function_id: u32) -> BufferedOutput {
        BufferedOutput {
            workflow_id: workflow_id.to_string(),
            function_id,
            output: format!("{function_id}"),
            txn_snapshot: None,
            created_at: 0,
        }
    }

    #[test]
    fn test_counter_is_monotonic() {
        let counter = StepCounter::new();
        assert_eq!(counter.next(), 0);
        assert_eq!(counter.next(), 1);
        assert_eq!(counter.next(), 2);
        assert_eq!(counter.assigned(), 3);
    }

    #[test]
    fn test_buffer_drains_in_step_order() {
        let buffer = OutputBuffer::new();
        buffer.push(buffered("wf-1", 2));
        buffer.push(buffered("wf-1", 0));
        buffer.push(buffered("wf-1", 1));
        buffer.push(buffered("wf-2", 0));

        let drained = buffer.drain_workflow("wf-1");
        let ids: Vec<u32> = drained.iter().map(|row| row.function_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);

        // wf-2 is untouched
        assert!(!buffer.is_empty());
        assert_eq!(buffer.drain_all().len(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_buffer_replay_lookup() {
        let buffer = OutputBuffer::new();
        buffer.push(buffered("wf-1", 0));

        assert_eq!(buffer.get("wf-1", 0).map(|row| row.output), Some("0".to_string()));
        assert!(buffer.get("wf-1", 1).is_none());
        assert!(buffer.get("wf-2", 0).is_none());
    }

    #[test]
    fn test_buffer_overwrites_same_step() {
        let buffer = OutputBuffer::new();
        buffer.push(buffered("wf-1", 0));
        let mut replacement = buffered("wf-1", 0);
        replacement.output = "replayed".to_string();
        buffer.push(replacement);

        let drained = buffer.drain_workflow("wf-1");
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].output, "replayed");
    }
}
