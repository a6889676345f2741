//! In-memory implementation of SystemDatabase for testing
//!
//! Same semantics as the PostgreSQL implementation, including recorded
//! timeouts and in-process wakeups, so executor behavior can be exercised
//! without a database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use super::store::*;
use super::wakeup::{event_key, notification_key, WakeupHub};
use crate::serialization::ErrorEnvelope;

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// A recorded (output, error) pair; (None, None) is a recorded null outcome
/// such as a receive timeout
type OperationRow = (Option<String>, Option<String>);

struct NotificationRow {
    sequence: u64,
    destination: String,
    topic: String,
    message: String,
}

struct QueueEntry {
    queue: String,
    sequence: u64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
}

/// In-memory system database
pub struct InMemorySystemDatabase {
    workflows: RwLock<HashMap<String, WorkflowStatusRow>>,
    operations: RwLock<HashMap<(String, u32), OperationRow>>,
    notifications: RwLock<Vec<NotificationRow>>,
    events: RwLock<HashMap<(String, String), String>>,
    queue: RwLock<HashMap<String, QueueEntry>>,
    heartbeats: RwLock<HashMap<String, i64>>,
    hub: Arc<WakeupHub>,
    sequence: AtomicU64,
}

impl InMemorySystemDatabase {
    /// Create a new empty store
    pub fn new() -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
            operations: RwLock::new(HashMap::new()),
            notifications: RwLock::new(Vec::new()),
            events: RwLock::new(HashMap::new()),
            queue: RwLock::new(HashMap::new()),
            heartbeats: RwLock::new(HashMap::new()),
            hub: Arc::new(WakeupHub::new()),
            sequence: AtomicU64::new(0),
        }
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Number of recorded operations for a workflow
    pub fn operation_count(&self, workflow_id: &str) -> usize {
        self.operations
            .read()
            .keys()
            .filter(|(wf, _)| wf == workflow_id)
            .count()
    }

    /// Number of undelivered messages
    pub fn pending_notification_count(&self) -> usize {
        self.notifications.read().len()
    }

    /// All registered workflow ids
    pub fn workflow_ids(&self) -> Vec<String> {
        self.workflows.read().keys().cloned().collect()
    }

    fn record(&self, workflow_id: &str, function_id: u32, row: OperationRow) -> Result<(), StoreError> {
        let mut operations = self.operations.write();
        match operations.get(&(workflow_id.to_string(), function_id)) {
            None => {
                operations.insert((workflow_id.to_string(), function_id), row);
                Ok(())
            }
            Some(existing) if *existing == row => Ok(()),
            Some(_) => Err(StoreError::ConflictingRecord {
                workflow_id: workflow_id.to_string(),
                function_id,
            }),
        }
    }

    fn recorded(&self, workflow_id: &str, function_id: u32) -> Option<OperationRow> {
        self.operations
            .read()
            .get(&(workflow_id.to_string(), function_id))
            .cloned()
    }
}

impl Default for InMemorySystemDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SystemDatabase for InMemorySystemDatabase {
    async fn insert_workflow_status(
        &self,
        row: &WorkflowStatusRow,
    ) -> Result<(WorkflowStatusRow, bool), StoreError> {
        let mut workflows = self.workflows.write();
        match workflows.get(&row.workflow_id) {
            None => {
                workflows.insert(row.workflow_id.clone(), row.clone());
                Ok((row.clone(), true))
            }
            Some(existing) if existing.name == row.name => Ok((existing.clone(), false)),
            Some(existing) => Err(StoreError::ConflictingWorkflow {
                workflow_id: row.workflow_id.clone(),
                existing_name: existing.name.clone(),
            }),
        }
    }

    async fn update_workflow_status(&self, update: &StatusUpdate) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        let row = workflows
            .get_mut(&update.workflow_id)
            .ok_or_else(|| StoreError::NotFound(update.workflow_id.clone()))?;

        // Terminal rows are immutable
        if row.status.is_terminal() {
            return Ok(());
        }

        let now = now_ms();
        row.status = update.status;
        if update.output.is_some() {
            row.output = update.output.clone();
        }
        if update.error.is_some() {
            row.error = update.error.clone();
        }
        row.updated_at = now;
        if update.status.is_terminal() {
            row.completed_at = Some(now);
        }
        Ok(())
    }

    async fn flush_status_batch(&self, updates: &[StatusUpdate]) -> Result<(), StoreError> {
        for update in updates {
            self.update_workflow_status(update).await?;
        }
        Ok(())
    }

    async fn get_workflow_status(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowStatusRow>, StoreError> {
        Ok(self.workflows.read().get(workflow_id).cloned())
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
        let mut rows: Vec<_> = self
            .workflows
            .read()
            .values()
            .filter(|row| row.status == WorkflowState::Pending)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.created_at);
        Ok(rows)
    }

    async fn latest_creation_with_prefix(
        &self,
        id_prefix: &str,
    ) -> Result<Option<i64>, StoreError> {
        Ok(self
            .workflows
            .read()
            .values()
            .filter(|row| row.workflow_id.starts_with(id_prefix))
            .map(|row| row.created_at)
            .max())
    }

    async fn check_operation_output(
        &self,
        workflow_id: &str,
        function_id: u32,
    ) -> Result<Option<OperationOutcome>, StoreError> {
        Ok(self
            .recorded(workflow_id, function_id)
            .map(|(output, error)| match error {
                Some(error) => OperationOutcome::Error(error),
                None => OperationOutcome::Output(output.unwrap_or_else(|| "null".to_string())),
            }))
    }

    async fn record_operation_output(
        &self,
        workflow_id: &str,
        function_id: u32,
        output: &str,
    ) -> Result<(), StoreError> {
        self.record(workflow_id, function_id, (Some(output.to_string()), None))
    }

    async fn record_operation_error(
        &self,
        workflow_id: &str,
        function_id: u32,
        error: &str,
    ) -> Result<(), StoreError> {
        self.record(workflow_id, function_id, (None, Some(error.to_string())))
    }

    async fn send(
        &self,
        source_workflow_id: &str,
        function_id: u32,
        destination_workflow_id: &str,
        topic: &str,
        message: &str,
    ) -> Result<(), StoreError> {
        if self.recorded(source_workflow_id, function_id).is_some() {
            return Ok(());
        }

        if !self
            .workflows
            .read()
            .contains_key(destination_workflow_id)
        {
            return Err(StoreError::DestinationNotFound(
                destination_workflow_id.to_string(),
            ));
        }

        self.notifications.write().push(NotificationRow {
            sequence: self.next_sequence(),
            destination: destination_workflow_id.to_string(),
            topic: topic.to_string(),
            message: message.to_string(),
        });
        self.record(source_workflow_id, function_id, (Some("null".to_string()), None))?;
        self.hub
            .wake(&notification_key(destination_workflow_id, topic));
        Ok(())
    }

    async fn recv(
        &self,
        workflow_id: &str,
        function_id: u32,
        topic: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        if let Some((output, error)) = self.recorded(workflow_id, function_id) {
            if let Some(error) = error {
                return Err(StoreError::WorkflowFailed(ErrorEnvelope::from_json(&error)));
            }
            return Ok(output);
        }

        let subscription = self.hub.subscribe(notification_key(workflow_id, topic));
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = subscription.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let consumed = {
                let mut notifications = self.notifications.write();
                let oldest = notifications
                    .iter()
                    .enumerate()
                    .filter(|(_, n)| n.destination == workflow_id && n.topic == topic)
                    .min_by_key(|(_, n)| n.sequence)
                    .map(|(index, _)| index);
                oldest.map(|index| notifications.remove(index).message)
            };

            if let Some(message) = consumed {
                self.record(workflow_id, function_id, (Some(message.clone()), None))?;
                return Ok(Some(message));
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    self.record(workflow_id, function_id, (None, None))?;
                    return Ok(None);
                }
            }
        }
    }

    async fn set_event(
        &self,
        workflow_id: &str,
        function_id: u32,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        if let Some((output, _)) = self.recorded(workflow_id, function_id) {
            if output.as_deref() == Some(value) {
                return Ok(());
            }
            return Err(StoreError::ConflictingRecord {
                workflow_id: workflow_id.to_string(),
                function_id,
            });
        }

        {
            let mut events = self.events.write();
            match events.get(&(workflow_id.to_string(), key.to_string())) {
                None => {
                    events.insert(
                        (workflow_id.to_string(), key.to_string()),
                        value.to_string(),
                    );
                }
                Some(existing) if existing == value => {}
                Some(_) => {
                    return Err(StoreError::EventAlreadySet {
                        workflow_id: workflow_id.to_string(),
                        key: key.to_string(),
                    });
                }
            }
        }

        self.record(workflow_id, function_id, (Some(value.to_string()), None))?;
        self.hub.wake(&event_key(workflow_id, key));
        Ok(())
    }

    async fn get_event(
        &self,
        target_workflow_id: &str,
        key: &str,
        timeout: Duration,
        caller: Option<&CallerContext>,
    ) -> Result<Option<String>, StoreError> {
        if let Some(caller) = caller {
            if let Some((output, error)) = self.recorded(&caller.workflow_id, caller.function_id) {
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

            let value = self
                .events
                .read()
                .get(&(target_workflow_id.to_string(), key.to_string()))
                .cloned();

            if let Some(value) = value {
                if let Some(caller) = caller {
                    self.record(
                        &caller.workflow_id,
                        caller.function_id,
                        (Some(value.clone()), None),
                    )?;
                }
                return Ok(Some(value));
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    if let Some(caller) = caller {
                        self.record(&caller.workflow_id, caller.function_id, (None, None))?;
                    }
                    return Ok(None);
                }
            }
        }
    }

    async fn enqueue_workflow(&self, queue: &str, workflow_id: &str) -> Result<(), StoreError> {
        let sequence = self.next_sequence();
        self.queue
            .write()
            .entry(workflow_id.to_string())
            .or_insert(QueueEntry {
                queue: queue.to_string(),
                sequence,
                started_at: None,
                completed_at: None,
            });
        Ok(())
    }

    async fn start_queued_workflows(
        &self,
        queue: &str,
        concurrency_limit: u32,
    ) -> Result<Vec<String>, StoreError> {
        let claimed = {
            let mut entries = self.queue.write();

            let running = entries
                .values()
                .filter(|e| e.queue == queue && e.started_at.is_some() && e.completed_at.is_none())
                .count();
            let available = (concurrency_limit as usize).saturating_sub(running);
            if available == 0 {
                return Ok(vec![]);
            }

            let mut ready: Vec<(&String, u64)> = entries
                .iter()
                .filter(|(_, e)| {
                    e.queue == queue && e.started_at.is_none() && e.completed_at.is_none()
                })
                .map(|(id, e)| (id, e.sequence))
                .collect();
            ready.sort_by_key(|(_, sequence)| *sequence);

            let claimed: Vec<String> = ready
                .into_iter()
                .take(available)
                .map(|(id, _)| id.clone())
                .collect();

            let now = now_ms();
            for id in &claimed {
                if let Some(entry) = entries.get_mut(id) {
                    entry.started_at = Some(now);
                }
            }
            claimed
        };

        // Recovery distinguishes admitted entries by workflow_status.started_at
        let now = now_ms();
        let mut workflows = self.workflows.write();
        for id in &claimed {
            if let Some(row) = workflows.get_mut(id) {
                row.started_at = Some(now);
            }
        }

        Ok(claimed)
    }

    async fn mark_queue_entry_completed(&self, workflow_id: &str) -> Result<(), StoreError> {
        if let Some(entry) = self.queue.write().get_mut(workflow_id) {
            if entry.completed_at.is_none() {
                entry.completed_at = Some(now_ms());
            }
        }
        Ok(())
    }

    async fn record_executor_heartbeat(
        &self,
        executor_id: &str,
        now_ms: i64,
    ) -> Result<(), StoreError> {
        self.heartbeats
            .write()
            .insert(executor_id.to_string(), now_ms);
        Ok(())
    }

    async fn list_dead_executors(
        &self,
        threshold_ms: i64,
        now_ms: i64,
    ) -> Result<Vec<String>, StoreError> {
        Ok(self
            .heartbeats
            .read()
            .iter()
            .filter(|(_, last_seen)| **last_seen < now_ms - threshold_ms)
            .map(|(id, _)| id.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_row(id: &str) -> WorkflowStatusRow {
        WorkflowStatusRow::pending(id, "noop", "null", "exec-test", now_ms())
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let store = InMemorySystemDatabase::new();
        let row = pending_row("wf-1");

        let (_, created) = store.insert_workflow_status(&row).await.unwrap();
        assert!(created);

        let (existing, created) = store.insert_workflow_status(&row).await.unwrap();
        assert!(!created);
        assert_eq!(existing.workflow_id, "wf-1");
    }

    #[tokio::test]
    async fn test_insert_conflicts_on_different_name() {
        let store = InMemorySystemDatabase::new();
        store
            .insert_workflow_status(&pending_row("wf-1"))
            .await
            .unwrap();

        let mut other = pending_row("wf-1");
        other.name = "different".to_string();
        let result = store.insert_workflow_status(&other).await;
        assert!(matches!(
            result,
            Err(StoreError::ConflictingWorkflow { .. })
        ));
    }

    #[tokio::test]
    async fn test_terminal_status_is_immutable() {
        let store = InMemorySystemDatabase::new();
        store
            .insert_workflow_status(&pending_row("wf-1"))
            .await
            .unwrap();

        store
            .update_workflow_status(&StatusUpdate {
                workflow_id: "wf-1".to_string(),
                status: WorkflowState::Success,
                output: Some("1".to_string()),
                error: None,
            })
            .await
            .unwrap();

        store
            .update_workflow_status(&StatusUpdate {
                workflow_id: "wf-1".to_string(),
                status: WorkflowState::Error,
                output: None,
                error: Some("late".to_string()),
            })
            .await
            .unwrap();

        let row = store.get_workflow_status("wf-1").await.unwrap().unwrap();
        assert_eq!(row.status, WorkflowState::Success);
        assert_eq!(row.output.as_deref(), Some("1"));
        assert!(row.error.is_none());
    }

    #[tokio::test]
    async fn test_record_equality_check() {
        let store = InMemorySystemDatabase::new();

        store.record_operation_output("wf-1", 0, "42").await.unwrap();
        // Same payload replays silently
        store.record_operation_output("wf-1", 0, "42").await.unwrap();
        // Divergent payload conflicts
        let result = store.record_operation_output("wf-1", 0, "43").await;
        assert!(matches!(result, Err(StoreError::ConflictingRecord { .. })));
    }

    #[tokio::test]
    async fn test_send_requires_destination() {
        let store = InMemorySystemDatabase::new();
        store
            .insert_workflow_status(&pending_row("sender"))
            .await
            .unwrap();

        let result = store.send("sender", 0, "ghost", "chan", "\"hi\"").await;
        assert!(matches!(result, Err(StoreError::DestinationNotFound(_))));
    }

    #[tokio::test]
    async fn test_fifo_per_topic() {
        let store = InMemorySystemDatabase::new();
        store
            .insert_workflow_status(&pending_row("a"))
            .await
            .unwrap();
        store
            .insert_workflow_status(&pending_row("b"))
            .await
            .unwrap();

        for (i, msg) in ["\"one\"", "\"two\"", "\"three\""].iter().enumerate() {
            store.send("a", i as u32, "b", "chan", msg).await.unwrap();
        }

        for (i, expected) in ["\"one\"", "\"two\"", "\"three\""].iter().enumerate() {
            let got = store
                .recv("b", i as u32, "chan", Duration::from_millis(100))
                .await
                .unwrap();
            assert_eq!(got.as_deref(), Some(*expected));
        }
    }

    #[tokio::test]
    async fn test_recv_timeout_is_recorded() {
        let store = InMemorySystemDatabase::new();
        store
            .insert_workflow_status(&pending_row("b"))
            .await
            .unwrap();

        let got = store
            .recv("b", 0, "chan", Duration::from_millis(10))
            .await
            .unwrap();
        assert!(got.is_none());

        // Replay observes the recorded timeout even though a message is now
        // available.
        store
            .insert_workflow_status(&pending_row("a"))
            .await
            .unwrap();
        store.send("a", 0, "b", "chan", "\"late\"").await.unwrap();
        let replay = store
            .recv("b", 0, "chan", Duration::from_millis(10))
            .await
            .unwrap();
        assert!(replay.is_none());
    }

    #[tokio::test]
    async fn test_recv_wakes_on_send() {
        let store = Arc::new(InMemorySystemDatabase::new());
        store
            .insert_workflow_status(&pending_row("a"))
            .await
            .unwrap();
        store
            .insert_workflow_status(&pending_row("b"))
            .await
            .unwrap();

        let receiver = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store.recv("b", 0, "chan", Duration::from_secs(5)).await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        store.send("a", 0, "b", "chan", "\"ping\"").await.unwrap();

        let got = receiver.await.unwrap().unwrap();
        assert_eq!(got.as_deref(), Some("\"ping\""));
    }

    #[tokio::test]
    async fn test_event_write_once() {
        let store = InMemorySystemDatabase::new();
        store
            .insert_workflow_status(&pending_row("wf-1"))
            .await
            .unwrap();

        store.set_event("wf-1", 0, "status", "\"ok\"").await.unwrap();
        // Identical value from a replay is fine
        store.set_event("wf-1", 0, "status", "\"ok\"").await.unwrap();
        // A different value from a later step is rejected
        let result = store.set_event("wf-1", 1, "status", "\"changed\"").await;
        assert!(matches!(result, Err(StoreError::EventAlreadySet { .. })));

        let got = store
            .get_event("wf-1", "status", Duration::from_millis(10), None)
            .await
            .unwrap();
        assert_eq!(got.as_deref(), Some("\"ok\""));
    }

    #[tokio::test]
    async fn test_queue_concurrency_limit() {
        let store = InMemorySystemDatabase::new();
        for id in ["q1", "q2", "q3"] {
            store.insert_workflow_status(&pending_row(id)).await.unwrap();
            store.enqueue_workflow("lane", id).await.unwrap();
        }

        let first = store.start_queued_workflows("lane", 2).await.unwrap();
        assert_eq!(first, vec!["q1".to_string(), "q2".to_string()]);

        // Limit reached: nothing more is admitted
        let second = store.start_queued_workflows("lane", 2).await.unwrap();
        assert!(second.is_empty());

        store.mark_queue_entry_completed("q1").await.unwrap();
        let third = store.start_queued_workflows("lane", 2).await.unwrap();
        assert_eq!(third, vec!["q3".to_string()]);
    }

    #[tokio::test]
    async fn test_dead_executor_listing() {
        let store = InMemorySystemDatabase::new();
        store.record_executor_heartbeat("old", 1_000).await.unwrap();
        store.record_executor_heartbeat("fresh", 9_500).await.unwrap();

        let dead = store.list_dead_executors(5_000, 10_000).await.unwrap();
        assert_eq!(dead, vec!["old".to_string()]);
    }
}
