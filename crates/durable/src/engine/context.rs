//! Workflow context: the step surface handed to workflow functions
//!
//! Every method that touches the outside world claims a function id from the
//! workflow's monotonic counter, consults the operation log, and records its
//! outcome, so a replay of the same workflow observes identical results
//! without re-running completed effects. Workflow code must issue these calls
//! in a stable order between suspension points; that determinism is a
//! documented contract of workflow authorship.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use crate::appdb::TransactionConfig;
use crate::engine::executor::{RuntimeInner, StartOptions, WorkflowHandle};
use crate::engine::registry::{StepRef, TransactionRef, WorkflowRef};
use crate::error::DurableError;
use crate::oplog::{self, StepCounter};
use crate::persistence::{BufferedOutput, CallerContext, OperationOutcome};
use crate::serialization::ErrorEnvelope;

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Decode a recorded outcome into the step's typed result
fn decode_outcome<O: DeserializeOwned>(outcome: OperationOutcome) -> Result<O, DurableError> {
    match outcome {
        OperationOutcome::Output(output) => Ok(serde_json::from_str(&output)?),
        OperationOutcome::Error(error) => {
            Err(DurableError::Recorded(ErrorEnvelope::from_json(&error)))
        }
    }
}

enum TransactionAttempt {
    Replayed(OperationOutcome),
    Executed(Value),
    ExecutedReadOnly {
        value: Value,
        serialized: String,
        snapshot: String,
    },
}

/// Per-execution context bound to one workflow id
///
/// Cloned cheaply into child futures; the step counter is shared so ids stay
/// monotonic across the whole execution.
#[derive(Clone)]
pub struct WorkflowContext {
    inner: Arc<RuntimeInner>,
    workflow_id: Arc<str>,
    counter: Arc<StepCounter>,
    cancel: watch::Receiver<bool>,
    replay_only: bool,
}

impl WorkflowContext {
    pub(crate) fn new(
        inner: Arc<RuntimeInner>,
        workflow_id: Arc<str>,
        cancel: watch::Receiver<bool>,
        replay_only: bool,
    ) -> Self {
        Self {
            inner,
            workflow_id,
            counter: Arc::new(StepCounter::new()),
            cancel,
            replay_only,
        }
    }

    /// The id of the running workflow
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Whether this execution is a replay-only debug run
    pub fn is_replay(&self) -> bool {
        self.replay_only
    }

    fn ensure_active(&self) -> Result<(), DurableError> {
        if *self.cancel.borrow() {
            return Err(DurableError::Cancelled);
        }
        Ok(())
    }

    /// Resolves when the workflow is cancelled; pends forever otherwise
    async fn cancelled(&self) {
        let mut cancel = self.cancel.clone();
        loop {
            if *cancel.borrow() {
                return;
            }
            if cancel.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }

    // =========================================================================
    // Steps
    // =========================================================================

    /// Run a non-transactional step with its registered retry policy
    ///
    /// The step body runs at least once and at most `max_attempts` times;
    /// once an outcome is recorded, replays return it without invoking the
    /// body again.
    pub async fn step<I, O>(&self, step: &StepRef<I, O>, input: I) -> Result<O, DurableError>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        self.ensure_active()?;
        let function_id = self.counter.next();

        if let Some(outcome) = self
            .inner
            .sysdb
            .check_operation_output(&self.workflow_id, function_id)
            .await?
        {
            return decode_outcome(outcome);
        }

        if self.replay_only {
            return Err(DurableError::Debugger {
                workflow_id: self.workflow_id.to_string(),
                function_id,
            });
        }

        let registered = self.inner.registry.step(step.name())?;
        let config = registered.config.clone();
        let function = Arc::clone(&registered.function);
        let input_value = serde_json::to_value(input)?;

        let max_attempts = if config.retries_allowed {
            config.max_attempts.max(1)
        } else {
            1
        };

        let mut last_failure: Option<DurableError> = None;
        for attempt in 0..max_attempts {
            if attempt > 0 {
                let delay = config.delay_after_failure(attempt - 1);
                debug!(
                    step = step.name(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying step"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.cancelled() => return Err(DurableError::Cancelled),
                }
            }
            self.ensure_active()?;

            match function(input_value.clone()).await {
                Ok(value) => {
                    let serialized = serde_json::to_string(&value)?;
                    return self
                        .record_step_output(function_id, serialized, value)
                        .await;
                }
                Err(e) if e.is_unrecordable() => return Err(e),
                Err(e) => last_failure = Some(e),
            }
        }

        let cause = last_failure.unwrap_or_else(|| DurableError::application("step never ran"));
        let error = if config.retries_allowed {
            DurableError::RetriesExceeded {
                step: step.name().to_string(),
                max_attempts,
                cause: Box::new(cause),
            }
        } else {
            cause
        };

        let envelope = ErrorEnvelope::capture(&error);
        self.record_step_error(function_id, &envelope).await?;
        Err(error)
    }

    async fn record_step_output<O: DeserializeOwned>(
        &self,
        function_id: u32,
        serialized: String,
        value: Value,
    ) -> Result<O, DurableError> {
        match self
            .inner
            .sysdb
            .record_operation_output(&self.workflow_id, function_id, &serialized)
            .await
        {
            Ok(()) => Ok(serde_json::from_value(value)?),
            Err(crate::persistence::StoreError::ConflictingRecord { .. }) => {
                // A duplicate execution won; its outcome stands
                let outcome = self
                    .inner
                    .sysdb
                    .check_operation_output(&self.workflow_id, function_id)
                    .await?
                    .ok_or(DurableError::Conflict {
                        workflow_id: self.workflow_id.to_string(),
                        function_id,
                    })?;
                decode_outcome(outcome)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn record_step_error(
        &self,
        function_id: u32,
        envelope: &ErrorEnvelope,
    ) -> Result<(), DurableError> {
        match self
            .inner
            .sysdb
            .record_operation_error(&self.workflow_id, function_id, &envelope.to_json())
            .await
        {
            Ok(()) | Err(crate::persistence::StoreError::ConflictingRecord { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Run a transactional step with at-most-once effect
    ///
    /// The guard row, any buffered read-only ancestors, the user callback,
    /// and the recorded output all commit in one database transaction.
    pub async fn transaction<I, O>(
        &self,
        transaction: &TransactionRef<I, O>,
        input: I,
    ) -> Result<O, DurableError>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        self.ensure_active()?;
        let function_id = self.counter.next();
        let workflow_id = Arc::clone(&self.workflow_id);

        // A buffered read-only output may not have been flushed yet
        if let Some(buffered) = self.inner.buffer.get(&workflow_id, function_id) {
            return Ok(serde_json::from_str(&buffered.output)?);
        }

        let userdb = self.inner.user_database()?;
        let registered = self.inner.registry.transaction(transaction.name())?;
        let config = registered.config;
        let function = Arc::clone(&registered.function);
        let input_value = serde_json::to_value(input)?;

        if self.replay_only {
            let check = self.check_recorded_transaction(function_id).await?;
            return match check {
                Some(outcome) => decode_outcome(outcome),
                None => Err(DurableError::Debugger {
                    workflow_id: workflow_id.to_string(),
                    function_id,
                }),
            };
        }

        let buffer = Arc::clone(&self.inner.buffer);
        let attempt = {
            let workflow_id = Arc::clone(&workflow_id);
            userdb
                .transaction(&config, move |conn| {
                    let workflow_id = Arc::clone(&workflow_id);
                    let function = Arc::clone(&function);
                    let input = input_value.clone();
                    let buffer = Arc::clone(&buffer);
                    Box::pin(async move {
                        let check =
                            oplog::check_transaction_outcome(conn, &workflow_id, function_id)
                                .await?;
                        if let Some(outcome) = check.recorded {
                            return Ok(TransactionAttempt::Replayed(outcome));
                        }

                        if !config.read_only {
                            oplog::insert_guard(conn, &workflow_id, function_id, &check.snapshot)
                                .await?;
                            // Buffered ancestors must not become visible
                            // after this step's write
                            let pending = buffer.drain_workflow(&workflow_id);
                            oplog::flush_buffered(conn, &pending).await?;
                        }

                        let value = function(conn, input).await?;
                        let serialized = serde_json::to_string(&value)?;

                        if config.read_only {
                            Ok(TransactionAttempt::ExecutedReadOnly {
                                value,
                                serialized,
                                snapshot: check.snapshot,
                            })
                        } else {
                            oplog::finalize_guard(conn, &workflow_id, function_id, &serialized)
                                .await?;
                            Ok(TransactionAttempt::Executed(value))
                        }
                    })
                })
                .await
        };

        match attempt {
            Ok(TransactionAttempt::Replayed(outcome)) => decode_outcome(outcome),
            Ok(TransactionAttempt::Executed(value)) => Ok(serde_json::from_value(value)?),
            Ok(TransactionAttempt::ExecutedReadOnly {
                value,
                serialized,
                snapshot,
            }) => {
                self.inner.buffer.push(BufferedOutput {
                    workflow_id: workflow_id.to_string(),
                    function_id,
                    output: serialized,
                    txn_snapshot: Some(snapshot),
                    created_at: now_ms(),
                });
                Ok(serde_json::from_value(value)?)
            }
            Err(DurableError::Conflict { .. }) => {
                // Lost the guard race; the winner's transaction has committed
                match self.check_recorded_transaction(function_id).await? {
                    Some(outcome) => decode_outcome(outcome),
                    None => Err(DurableError::Conflict {
                        workflow_id: workflow_id.to_string(),
                        function_id,
                    }),
                }
            }
            Err(e) if e.is_unrecordable() => Err(e),
            Err(e) => {
                // The failing transaction rolled back its guard row; record
                // the error in a transaction of its own
                let envelope = ErrorEnvelope::capture(&e);
                let workflow_id = Arc::clone(&workflow_id);
                userdb
                    .transaction(&TransactionConfig::default(), move |conn| {
                        let workflow_id = Arc::clone(&workflow_id);
                        let error = envelope.to_json();
                        Box::pin(async move {
                            oplog::record_transaction_error(
                                conn,
                                &workflow_id,
                                function_id,
                                &error,
                            )
                            .await
                        })
                    })
                    .await?;
                Err(e)
            }
        }
    }

    async fn check_recorded_transaction(
        &self,
        function_id: u32,
    ) -> Result<Option<OperationOutcome>, DurableError> {
        let userdb = self.inner.user_database()?;
        let workflow_id = Arc::clone(&self.workflow_id);
        let config = TransactionConfig {
            read_only: true,
            ..Default::default()
        };
        userdb
            .transaction(&config, move |conn| {
                let workflow_id = Arc::clone(&workflow_id);
                Box::pin(async move {
                    let check =
                        oplog::check_transaction_outcome(conn, &workflow_id, function_id).await?;
                    Ok(check.recorded)
                })
            })
            .await
    }

    // =========================================================================
    // Messaging and events
    // =========================================================================

    /// Send a message to another workflow's (destination, topic) queue
    pub async fn send<T: Serialize>(
        &self,
        destination: &str,
        topic: &str,
        message: &T,
    ) -> Result<(), DurableError> {
        self.ensure_active()?;
        let function_id = self.counter.next();

        if self.replay_only {
            return match self
                .inner
                .sysdb
                .check_operation_output(&self.workflow_id, function_id)
                .await?
            {
                Some(_) => Ok(()),
                None => Err(DurableError::Debugger {
                    workflow_id: self.workflow_id.to_string(),
                    function_id,
                }),
            };
        }

        let payload = serde_json::to_string(message)?;
        self.inner
            .sysdb
            .send(&self.workflow_id, function_id, destination, topic, &payload)
            .await?;
        Ok(())
    }

    /// Receive the oldest message on a topic, waiting up to `timeout`
    pub async fn recv<T: DeserializeOwned>(
        &self,
        topic: &str,
        timeout: Duration,
    ) -> Result<Option<T>, DurableError> {
        self.ensure_active()?;
        let function_id = self.counter.next();

        if self.replay_only
            && self
                .inner
                .sysdb
                .check_operation_output(&self.workflow_id, function_id)
                .await?
                .is_none()
        {
            return Err(DurableError::Debugger {
                workflow_id: self.workflow_id.to_string(),
                function_id,
            });
        }

        let received = tokio::select! {
            result = self.inner.sysdb.recv(&self.workflow_id, function_id, topic, timeout) => result?,
            _ = self.cancelled() => return Err(DurableError::Cancelled),
        };

        received
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(Into::into)
    }

    /// Publish a write-once key for this workflow
    pub async fn set_event<T: Serialize>(&self, key: &str, value: &T) -> Result<(), DurableError> {
        self.ensure_active()?;
        let function_id = self.counter.next();

        if self.replay_only {
            return match self
                .inner
                .sysdb
                .check_operation_output(&self.workflow_id, function_id)
                .await?
            {
                Some(_) => Ok(()),
                None => Err(DurableError::Debugger {
                    workflow_id: self.workflow_id.to_string(),
                    function_id,
                }),
            };
        }

        let serialized = serde_json::to_string(value)?;
        self.inner
            .sysdb
            .set_event(&self.workflow_id, function_id, key, &serialized)
            .await?;
        Ok(())
    }

    /// Read a key published by another workflow, waiting up to `timeout`
    pub async fn get_event<T: DeserializeOwned>(
        &self,
        target_workflow_id: &str,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<T>, DurableError> {
        self.ensure_active()?;
        let function_id = self.counter.next();

        if self.replay_only
            && self
                .inner
                .sysdb
                .check_operation_output(&self.workflow_id, function_id)
                .await?
                .is_none()
        {
            return Err(DurableError::Debugger {
                workflow_id: self.workflow_id.to_string(),
                function_id,
            });
        }

        let caller = CallerContext {
            workflow_id: self.workflow_id.to_string(),
            function_id,
        };

        let value = tokio::select! {
            result = self.inner.sysdb.get_event(target_workflow_id, key, timeout, Some(&caller)) => result?,
            _ = self.cancelled() => return Err(DurableError::Cancelled),
        };

        value
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(Into::into)
    }

    // =========================================================================
    // Time and children
    // =========================================================================

    /// Durable sleep: the wakeup deadline is recorded, so a replay sleeps
    /// only for the remainder
    pub async fn sleep(&self, duration: Duration) -> Result<(), DurableError> {
        self.ensure_active()?;
        let function_id = self.counter.next();

        let deadline_ms = match self
            .inner
            .sysdb
            .check_operation_output(&self.workflow_id, function_id)
            .await?
        {
            Some(outcome) => decode_outcome::<i64>(outcome)?,
            None => {
                if self.replay_only {
                    return Err(DurableError::Debugger {
                        workflow_id: self.workflow_id.to_string(),
                        function_id,
                    });
                }
                let deadline = now_ms() + duration.as_millis() as i64;
                self.inner
                    .sysdb
                    .record_operation_output(
                        &self.workflow_id,
                        function_id,
                        &deadline.to_string(),
                    )
                    .await?;
                deadline
            }
        };

        let remaining = (deadline_ms - now_ms()).max(0) as u64;
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(remaining)) => Ok(()),
            _ = self.cancelled() => Err(DurableError::Cancelled),
        }
    }

    /// Launch a child workflow with the deterministic id
    /// `"{parent_id}-{parent_func_id}"`
    ///
    /// The id is derived before scheduling, so a parent replay adopts the
    /// already-running (or completed) child instead of launching another.
    pub async fn start_child_workflow<I, O>(
        &self,
        workflow: &WorkflowRef<I, O>,
        input: I,
    ) -> Result<WorkflowHandle<O>, DurableError>
    where
        I: Serialize,
        O: DeserializeOwned + Send + 'static,
    {
        self.ensure_active()?;
        let function_id = self.counter.next();
        let child_id = format!("{}-{}", self.workflow_id, function_id);
        let inputs = serde_json::to_string(&serde_json::to_value(input)?)?;

        self.inner
            .start_by_name(
                workflow.name(),
                child_id,
                StartOptions::default(),
                inputs,
                self.replay_only,
            )
            .await
    }
}
