//! Workflow executor and runtime lifecycle
//!
//! [`Durable`] is the long-lived runtime value: build it with registered
//! functions, `launch()` it, start workflows, and `shutdown()` when done.
//! There is no process-wide global; anything that needs the runtime holds a
//! handle to it.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::appdb::UserDatabase;
use crate::config::RuntimeConfig;
use crate::engine::context::WorkflowContext;
use crate::engine::registry::{Registry, WorkflowRef};
use crate::engine::{flush, recovery};
use crate::error::DurableError;
use crate::oplog::OutputBuffer;
use crate::persistence::{
    StatusUpdate, StoreError, SystemDatabase, WorkflowState, WorkflowStatusRow,
};
use crate::queue::{self, WorkflowQueue};
use crate::scheduler::{self, ScheduleEntry, ScheduledInvocation};
use crate::serialization::ErrorEnvelope;

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Options for starting a workflow
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Caller-supplied workflow id; generated when absent
    pub id: Option<String>,
    /// Named queue to run under instead of starting immediately
    pub queue: Option<String>,
    /// Authenticated caller recorded on the workflow row
    pub authenticated_user: Option<String>,
    /// Role the caller assumed for this workflow
    pub assumed_role: Option<String>,
    /// All roles the caller holds
    pub authenticated_roles: Option<Vec<String>>,
    /// Opaque request metadata from the calling surface
    pub request: Option<serde_json::Value>,
}

impl StartOptions {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn on_queue(queue: impl Into<String>) -> Self {
        Self {
            queue: Some(queue.into()),
            ..Default::default()
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn authenticated(mut self, user: impl Into<String>, role: impl Into<String>) -> Self {
        self.authenticated_user = Some(user.into());
        self.assumed_role = Some(role.into());
        self
    }
}

/// Shared state behind the runtime and every context
pub(crate) struct RuntimeInner {
    pub(crate) sysdb: Arc<dyn SystemDatabase>,
    pub(crate) user_db: Option<Arc<UserDatabase>>,
    pub(crate) registry: Registry,
    pub(crate) config: RuntimeConfig,
    pub(crate) buffer: Arc<OutputBuffer>,
    pub(crate) status_buffer: Mutex<Vec<StatusUpdate>>,
    pub(crate) active: Mutex<HashMap<String, watch::Sender<bool>>>,
    pub(crate) queues: Vec<WorkflowQueue>,
}

impl RuntimeInner {
    pub(crate) fn user_database(&self) -> Result<&Arc<UserDatabase>, DurableError> {
        self.user_db
            .as_ref()
            .ok_or_else(|| DurableError::Configuration("no user database configured".to_string()))
    }

    pub(crate) fn push_status(
        &self,
        workflow_id: &str,
        status: WorkflowState,
        output: Option<String>,
        error: Option<String>,
    ) {
        self.status_buffer.lock().push(StatusUpdate {
            workflow_id: workflow_id.to_string(),
            status,
            output,
            error,
        });
    }

    /// Register (or adopt) the workflow row and hand back a handle
    ///
    /// `replay_only` suppresses execution, for child launches under a
    /// replay-mode parent.
    pub(crate) async fn start_by_name<O>(
        self: &Arc<Self>,
        name: &str,
        workflow_id: String,
        options: StartOptions,
        inputs: String,
        replay_only: bool,
    ) -> Result<WorkflowHandle<O>, DurableError>
    where
        O: DeserializeOwned + Send + 'static,
    {
        if !self.registry.contains_workflow(name) {
            return Err(DurableError::NotRegistered(name.to_string()));
        }

        let queue = options.queue.clone();
        let now = now_ms();
        let mut row = WorkflowStatusRow::pending(
            workflow_id.clone(),
            name,
            inputs,
            self.config.executor_id.clone(),
            now,
        );
        row.authenticated_user = options.authenticated_user;
        row.assumed_role = options.assumed_role;
        row.authenticated_roles = options
            .authenticated_roles
            .map(|roles| serde_json::to_string(&roles))
            .transpose()?;
        row.request = options
            .request
            .map(|request| serde_json::to_string(&request))
            .transpose()?;
        row.application_version = self.config.application_version.clone();
        if let Some(queue_name) = &queue {
            // started_at stays unset until the pump admits the entry
            row.queue_name = Some(queue_name.clone());
            row.queued_at = Some(now);
        } else {
            row.started_at = Some(now);
        }

        let (stored, created) = self.sysdb.insert_workflow_status(&row).await?;
        if created {
            debug!(%workflow_id, name, "registered workflow");
        }

        if stored.status.is_terminal() {
            return Ok(WorkflowHandle::polling(Arc::clone(self), workflow_id));
        }

        if let Some(queue_name) = stored.queue_name.clone().or(queue) {
            // Idempotent: a crash between insert and enqueue re-runs this
            self.sysdb.enqueue_workflow(&queue_name, &workflow_id).await?;
            return Ok(WorkflowHandle::polling(Arc::clone(self), workflow_id));
        }

        if replay_only || self.active.lock().contains_key(&workflow_id) {
            return Ok(WorkflowHandle::polling(Arc::clone(self), workflow_id));
        }

        let task = self.spawn_execution(
            stored.name.clone(),
            workflow_id.clone(),
            stored.inputs.clone(),
        );
        Ok(WorkflowHandle::task(Arc::clone(self), workflow_id, task))
    }

    pub(crate) fn spawn_execution(
        self: &Arc<Self>,
        name: String,
        workflow_id: String,
        inputs: String,
    ) -> JoinHandle<Result<String, DurableError>> {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.execute_workflow(&name, &workflow_id, &inputs).await })
    }

    /// Drive a workflow function to a terminal outcome
    #[instrument(skip(self, inputs), fields(workflow = name))]
    pub(crate) async fn execute_workflow(
        self: Arc<Self>,
        name: &str,
        workflow_id: &str,
        inputs: &str,
    ) -> Result<String, DurableError> {
        let function = self.registry.workflow(name)?;
        let input_value: serde_json::Value = serde_json::from_str(inputs)?;

        // Concurrent executions of one id share a cancellation signal
        let cancel_rx = {
            let mut active = self.active.lock();
            match active.get(workflow_id) {
                Some(cancel) => cancel.subscribe(),
                None => {
                    let (cancel_tx, cancel_rx) = watch::channel(false);
                    active.insert(workflow_id.to_string(), cancel_tx);
                    cancel_rx
                }
            }
        };

        let ctx = WorkflowContext::new(
            Arc::clone(&self),
            Arc::from(workflow_id),
            cancel_rx,
            false,
        );

        let result = function(ctx, input_value).await;
        self.active.lock().remove(workflow_id);

        let outcome = match result {
            Ok(value) => {
                let output = serde_json::to_string(&value)?;
                self.push_status(
                    workflow_id,
                    WorkflowState::Success,
                    Some(output.clone()),
                    None,
                );
                debug!(%workflow_id, "workflow succeeded");
                Ok(output)
            }
            Err(DurableError::Cancelled) => {
                let envelope = ErrorEnvelope::new("Cancelled", "workflow cancelled");
                self.push_status(
                    workflow_id,
                    WorkflowState::Cancelled,
                    None,
                    Some(envelope.to_json()),
                );
                info!(%workflow_id, "workflow cancelled");
                Err(DurableError::Cancelled)
            }
            Err(e @ DurableError::SystemDatabase(_)) => {
                // Fatal to this execution; the row stays PENDING for recovery
                error!(%workflow_id, "workflow aborted on system database error: {}", e);
                Err(e)
            }
            Err(e @ DurableError::Debugger { .. }) => Err(e),
            Err(e) => {
                let status = match &e {
                    DurableError::RetriesExceeded { .. } => WorkflowState::RetriesExceeded,
                    _ => WorkflowState::Error,
                };
                let envelope = ErrorEnvelope::capture(&e);
                self.push_status(workflow_id, status, None, Some(envelope.to_json()));
                warn!(%workflow_id, "workflow failed: {}", e);
                Err(e)
            }
        };

        // Release the queue slot, if any; a no-op for unqueued workflows
        if let Err(e) = self.sysdb.mark_queue_entry_completed(workflow_id).await {
            error!(%workflow_id, "failed to release queue entry: {}", e);
        }

        outcome
    }
}

/// Handle to a started (or retrieved) workflow
pub struct WorkflowHandle<O> {
    workflow_id: String,
    inner: Arc<RuntimeInner>,
    mode: HandleMode,
    _marker: PhantomData<fn() -> O>,
}

impl<O> std::fmt::Debug for WorkflowHandle<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowHandle")
            .field("workflow_id", &self.workflow_id)
            .finish_non_exhaustive()
    }
}

enum HandleMode {
    /// The execution runs in this process; await its task directly
    Task(JoinHandle<Result<String, DurableError>>),
    /// Await the recorded result through the system database
    Polling,
}

impl<O: DeserializeOwned> WorkflowHandle<O> {
    fn task(
        inner: Arc<RuntimeInner>,
        workflow_id: String,
        task: JoinHandle<Result<String, DurableError>>,
    ) -> Self {
        Self {
            workflow_id,
            inner,
            mode: HandleMode::Task(task),
            _marker: PhantomData,
        }
    }

    fn polling(inner: Arc<RuntimeInner>, workflow_id: String) -> Self {
        Self {
            workflow_id,
            inner,
            mode: HandleMode::Polling,
            _marker: PhantomData,
        }
    }

    /// The workflow's id
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Current status row, if the workflow is registered
    pub async fn status(&self) -> Result<Option<WorkflowStatusRow>, DurableError> {
        Ok(self.inner.sysdb.get_workflow_status(&self.workflow_id).await?)
    }

    /// Await the terminal outcome
    ///
    /// A recorded error is rehydrated and returned with its original message.
    pub async fn result(self) -> Result<O, DurableError> {
        let output = match self.mode {
            HandleMode::Task(task) => match task.await {
                Ok(result) => result?,
                Err(join_error) => {
                    return Err(DurableError::application(format!(
                        "workflow task failed: {join_error}"
                    )));
                }
            },
            HandleMode::Polling => {
                let poll = Duration::from_millis(self.inner.config.result_poll_interval_ms);
                match self
                    .inner
                    .sysdb
                    .await_workflow_result(&self.workflow_id, poll)
                    .await
                {
                    Ok(output) => output,
                    Err(StoreError::WorkflowFailed(envelope)) => {
                        return Err(DurableError::Recorded(envelope));
                    }
                    Err(StoreError::WorkflowCancelled(_)) => {
                        return Err(DurableError::Cancelled);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        Ok(serde_json::from_str(&output)?)
    }
}

/// Builder for [`Durable`]
pub struct DurableBuilder {
    sysdb: Option<Arc<dyn SystemDatabase>>,
    user_db: Option<Arc<UserDatabase>>,
    registry: Option<Registry>,
    config: RuntimeConfig,
    queues: Vec<WorkflowQueue>,
    schedules: Vec<ScheduleEntry>,
}

impl Default for DurableBuilder {
    fn default() -> Self {
        Self {
            sysdb: None,
            user_db: None,
            registry: None,
            config: RuntimeConfig::default(),
            queues: Vec::new(),
            schedules: Vec::new(),
        }
    }
}

impl DurableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the system database (required)
    pub fn system_database(mut self, sysdb: Arc<dyn SystemDatabase>) -> Self {
        self.sysdb = Some(sysdb);
        self
    }

    /// Set the application database, enabling transactional steps
    pub fn user_database(mut self, user_db: Arc<UserDatabase>) -> Self {
        self.user_db = Some(user_db);
        self
    }

    /// Set the function registry (required)
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Override runtime tuning
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Register an admission-controlled queue
    pub fn queue(mut self, queue: WorkflowQueue) -> Self {
        self.queues.push(queue);
        self
    }

    /// Run a workflow on a cron schedule
    ///
    /// The workflow receives a [`ScheduledInvocation`] carrying both the
    /// nominal firing time and the actual start time.
    pub fn scheduled<O>(
        mut self,
        cron_expression: &str,
        workflow: &WorkflowRef<ScheduledInvocation, O>,
    ) -> Result<Self, DurableError> {
        self.schedules
            .push(ScheduleEntry::parse(workflow.name(), cron_expression)?);
        Ok(self)
    }

    /// Assemble the runtime; call [`Durable::launch`] to start it
    pub fn build(self) -> Result<Durable, DurableError> {
        let sysdb = self
            .sysdb
            .ok_or_else(|| DurableError::Configuration("system database is required".to_string()))?;
        let registry = self
            .registry
            .ok_or_else(|| DurableError::Configuration("registry is required".to_string()))?;

        let inner = Arc::new(RuntimeInner {
            sysdb,
            user_db: self.user_db,
            registry,
            config: self.config,
            buffer: Arc::new(OutputBuffer::new()),
            status_buffer: Mutex::new(Vec::new()),
            active: Mutex::new(HashMap::new()),
            queues: self.queues,
        });

        Ok(Durable {
            inner,
            schedules: Mutex::new(Some(self.schedules)),
            shutdown_tx: watch::channel(false).0,
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// The durable-execution runtime
///
/// Lifecycle: `Durable::builder() … .build()? → launch() → … → shutdown()`.
pub struct Durable {
    inner: Arc<RuntimeInner>,
    schedules: Mutex<Option<Vec<ScheduleEntry>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Durable {
    /// Create a new builder
    pub fn builder() -> DurableBuilder {
        DurableBuilder::new()
    }

    /// Start background loops and recover interrupted workflows
    #[instrument(skip(self))]
    pub async fn launch(&self) -> Result<(), DurableError> {
        let recovered = recovery::recover_pending(&self.inner).await?;
        if recovered > 0 {
            info!(count = recovered, "recovered pending workflows");
        }

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(flush::run_flush_loop(
            Arc::clone(&self.inner),
            self.shutdown_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(recovery::run_heartbeat_loop(
            Arc::clone(&self.inner),
            self.shutdown_tx.subscribe(),
        )));
        if !self.inner.queues.is_empty() {
            tasks.push(tokio::spawn(queue::run_queue_pump(
                Arc::clone(&self.inner),
                self.shutdown_tx.subscribe(),
            )));
        }
        if let Some(schedules) = self.schedules.lock().take() {
            if !schedules.is_empty() {
                tasks.push(tokio::spawn(scheduler::run_scheduler(
                    Arc::clone(&self.inner),
                    schedules,
                    self.shutdown_tx.subscribe(),
                )));
            }
        }

        info!(executor_id = %self.inner.config.executor_id, "durable runtime launched");
        Ok(())
    }

    /// Stop background loops, flushing buffered writes first
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!("background task failed during shutdown: {}", e);
                }
            }
        }

        // Loops flush on their way out, but a runtime that was never
        // launched still owes its buffered writes
        if let Err(e) = flush::flush_once(&self.inner).await {
            error!("final flush failed: {}", e);
        }

        info!("durable runtime stopped");
    }

    /// Start a workflow, or adopt the existing one under the same id
    pub async fn start_workflow<I, O>(
        &self,
        workflow: &WorkflowRef<I, O>,
        mut options: StartOptions,
        input: I,
    ) -> Result<WorkflowHandle<O>, DurableError>
    where
        I: Serialize,
        O: DeserializeOwned + Send + 'static,
    {
        let workflow_id = options
            .id
            .take()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let inputs = serde_json::to_string(&serde_json::to_value(input)?)?;
        self.inner
            .start_by_name(workflow.name(), workflow_id, options, inputs, false)
            .await
    }

    /// Handle to a workflow started elsewhere
    pub fn retrieve_workflow<O: DeserializeOwned>(&self, workflow_id: &str) -> WorkflowHandle<O> {
        WorkflowHandle::polling(Arc::clone(&self.inner), workflow_id.to_string())
    }

    /// Request cancellation of a running workflow
    ///
    /// The signal is observed at the workflow's next step boundary or wait.
    pub async fn cancel_workflow(&self, workflow_id: &str) -> Result<(), DurableError> {
        let signalled = {
            let active = self.inner.active.lock();
            match active.get(workflow_id) {
                Some(cancel) => cancel.send(true).is_ok(),
                None => false,
            }
        };

        if signalled {
            info!(%workflow_id, "cancellation signalled");
            return Ok(());
        }

        // Not running in this process; flip the durable status directly
        let envelope = ErrorEnvelope::new("Cancelled", "workflow cancelled");
        self.inner
            .sysdb
            .update_workflow_status(&StatusUpdate {
                workflow_id: workflow_id.to_string(),
                status: WorkflowState::Cancelled,
                output: None,
                error: Some(envelope.to_json()),
            })
            .await?;

        // A queued entry would otherwise hold its admission slot forever
        self.inner
            .sysdb
            .mark_queue_entry_completed(workflow_id)
            .await?;
        Ok(())
    }

    /// Replay a workflow from its recorded history without running any step
    /// bodies
    ///
    /// Every step must find a recorded outcome; a miss fails the replay with
    /// a [`DurableError::Debugger`] error. Workflow status is not modified.
    pub async fn debug_workflow<I, O>(
        &self,
        workflow: &WorkflowRef<I, O>,
        workflow_id: &str,
        input: I,
    ) -> Result<O, DurableError>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        self.inner
            .sysdb
            .get_workflow_status(workflow_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(workflow_id.to_string()))?;

        let function = self.inner.registry.workflow(workflow.name())?;
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let ctx = WorkflowContext::new(
            Arc::clone(&self.inner),
            Arc::from(workflow_id),
            cancel_rx,
            true,
        );

        let value = function(ctx, serde_json::to_value(input)?).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Re-run recovery on demand
    pub async fn recover_pending_workflows(&self) -> Result<usize, DurableError> {
        recovery::recover_pending(&self.inner).await
    }

    /// Flush buffered outputs and status updates immediately
    pub async fn flush(&self) -> Result<(), DurableError> {
        flush::flush_once(&self.inner).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::engine::registry::StepConfig;
    use crate::persistence::InMemorySystemDatabase;
    use crate::scheduler::ScheduledInvocation;

    fn test_config() -> RuntimeConfig {
        RuntimeConfig {
            executor_id: "exec-test".to_string(),
            flush_interval_ms: 20,
            heartbeat_interval_ms: 50,
            dead_executor_threshold_ms: 100,
            queue_poll_interval_ms: 20,
            result_poll_interval_ms: 10,
            ..Default::default()
        }
    }

    fn runtime(registry: Registry) -> (Durable, Arc<InMemorySystemDatabase>) {
        let sysdb = Arc::new(InMemorySystemDatabase::new());
        let durable = Durable::builder()
            .system_database(Arc::clone(&sysdb) as Arc<dyn SystemDatabase>)
            .registry(registry)
            .config(test_config())
            .build()
            .expect("should build runtime");
        (durable, sysdb)
    }

    async fn wait_terminal(
        durable: &Durable,
        sysdb: &InMemorySystemDatabase,
        workflow_id: &str,
    ) -> WorkflowStatusRow {
        for _ in 0..200 {
            durable.flush().await.expect("should flush");
            if let Some(row) = sysdb.get_workflow_status(workflow_id).await.unwrap() {
                if row.status.is_terminal() {
                    return row;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("workflow {workflow_id} never reached a terminal state");
    }

    #[tokio::test]
    async fn test_workflow_runs_steps_in_order() {
        let mut registry = Registry::new();
        let double = registry.register_step("double", StepConfig::default(), |n: i64| async move {
            Ok::<i64, DurableError>(n * 2)
        });
        let workflow = {
            let double = double.clone();
            registry.register_workflow("pipeline", move |ctx, n: i64| {
                let double = double.clone();
                async move {
                    let once: i64 = ctx.step(&double, n).await?;
                    let twice: i64 = ctx.step(&double, once).await?;
                    Ok(twice)
                }
            })
        };

        let (durable, sysdb) = runtime(registry);
        let handle = durable
            .start_workflow(&workflow, StartOptions::with_id("wf-pipeline"), 3)
            .await
            .expect("should start");

        let result: i64 = handle.result().await.expect("should succeed");
        assert_eq!(result, 12);

        let row = wait_terminal(&durable, &sysdb, "wf-pipeline").await;
        assert_eq!(row.status, WorkflowState::Success);
        assert_eq!(row.output.as_deref(), Some("12"));
        // Two steps recorded under function ids 0 and 1
        assert_eq!(sysdb.operation_count("wf-pipeline"), 2);
    }

    #[tokio::test]
    async fn test_duplicate_start_yields_same_result_once() {
        let executions = Arc::new(AtomicU32::new(0));
        let mut registry = Registry::new();
        let step = {
            let executions = Arc::clone(&executions);
            registry.register_step("effect", StepConfig::default(), move |n: i64| {
                let executions = Arc::clone(&executions);
                async move {
                    executions.fetch_add(1, Ordering::SeqCst);
                    Ok::<i64, DurableError>(n)
                }
            })
        };
        let workflow = {
            let step = step.clone();
            registry.register_workflow("oaoo", move |ctx, n: i64| {
                let step = step.clone();
                async move { ctx.step(&step, n).await }
            })
        };

        let (durable, sysdb) = runtime(registry);

        let first = durable
            .start_workflow(&workflow, StartOptions::with_id("wf-1"), 42)
            .await
            .expect("should start");
        let first_result: i64 = first.result().await.expect("should succeed");
        assert_eq!(first_result, 42);

        durable.flush().await.expect("should flush");

        // Second start with the same id adopts the recorded outcome
        let second = durable
            .start_workflow(&workflow, StartOptions::with_id("wf-1"), 42)
            .await
            .expect("should adopt");
        let second_result: i64 = second.result().await.expect("should replay");
        assert_eq!(second_result, first_result);
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        let _ = sysdb;
    }

    #[tokio::test]
    async fn test_step_retry_exhaustion_is_recorded() {
        let attempts = Arc::new(AtomicU32::new(0));
        let mut registry = Registry::new();
        let flaky = {
            let attempts = Arc::clone(&attempts);
            registry.register_step(
                "flaky",
                StepConfig::default()
                    .with_max_attempts(3)
                    .with_interval(0.001)
                    .with_backoff_rate(2.0),
                move |_: ()| {
                    let attempts = Arc::clone(&attempts);
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(DurableError::application("downstream down"))
                    }
                },
            )
        };
        let workflow = {
            let flaky = flaky.clone();
            registry.register_workflow("exhausts", move |ctx, _: ()| {
                let flaky = flaky.clone();
                async move { ctx.step(&flaky, ()).await }
            })
        };

        let (durable, sysdb) = runtime(registry);
        let handle = durable
            .start_workflow(&workflow, StartOptions::with_id("wf-retry"), ())
            .await
            .expect("should start");

        let error = handle.result().await.expect_err("should exhaust");
        assert!(matches!(error, DurableError::RetriesExceeded { max_attempts: 3, .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        let row = wait_terminal(&durable, &sysdb, "wf-retry").await;
        assert_eq!(row.status, WorkflowState::RetriesExceeded);

        // Re-running the same id replays the recorded error without new
        // attempts
        let replay = durable
            .start_workflow(&workflow, StartOptions::with_id("wf-retry"), ())
            .await
            .expect("should adopt");
        let replayed = replay.result().await.expect_err("should fail again");
        match replayed {
            DurableError::Recorded(envelope) => {
                assert_eq!(envelope.name, "RetriesExceeded");
                let cause = envelope.cause.expect("should keep the last cause");
                assert!(cause.message.contains("downstream down"));
            }
            other => panic!("expected recorded error, got {other:?}"),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_step_without_retries_records_original_error() {
        let attempts = Arc::new(AtomicU32::new(0));
        let mut registry = Registry::new();
        let once = {
            let attempts = Arc::clone(&attempts);
            registry.register_step("once", StepConfig::no_retries(), move |_: ()| {
                let attempts = Arc::clone(&attempts);
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(DurableError::application("fatal"))
                }
            })
        };
        let workflow = {
            let once = once.clone();
            registry.register_workflow("one-shot", move |ctx, _: ()| {
                let once = once.clone();
                async move { ctx.step(&once, ()).await }
            })
        };

        let (durable, sysdb) = runtime(registry);
        let handle = durable
            .start_workflow(&workflow, StartOptions::with_id("wf-once"), ())
            .await
            .expect("should start");

        let error = handle.result().await.expect_err("should fail");
        assert!(matches!(error, DurableError::Application(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        let row = wait_terminal(&durable, &sysdb, "wf-once").await;
        assert_eq!(row.status, WorkflowState::Error);
        let envelope = crate::serialization::ErrorEnvelope::from_json(row.error.as_deref().unwrap());
        assert_eq!(envelope.name, "Application");
        assert_eq!(envelope.message, "fatal");
    }

    #[tokio::test]
    async fn test_messaging_round_trip_and_replay() {
        let mut registry = Registry::new();
        let receiver = registry.register_workflow("receiver", |ctx, _: ()| async move {
            ctx.recv::<String>("chan", Duration::from_secs(5)).await
        });
        let sender = registry.register_workflow("sender", |ctx, destination: String| async move {
            ctx.send(&destination, "chan", &"hello".to_string()).await?;
            Ok(())
        });

        let (durable, sysdb) = runtime(registry);

        let receive = durable
            .start_workflow(&receiver, StartOptions::with_id("B"), ())
            .await
            .expect("should start receiver");
        tokio::time::sleep(Duration::from_millis(50)).await;
        let send = durable
            .start_workflow(&sender, StartOptions::with_id("A"), "B".to_string())
            .await
            .expect("should start sender");

        send.result().await.expect("send should succeed");
        let received: Option<String> = receive.result().await.expect("recv should succeed");
        assert_eq!(received.as_deref(), Some("hello"));
        assert_eq!(sysdb.pending_notification_count(), 0);

        // Re-executing the receiver replays the recorded message without
        // consuming anything
        let output = Arc::clone(&durable.inner)
            .execute_workflow("receiver", "B", "null")
            .await
            .expect("replay should succeed");
        let replayed: Option<String> = serde_json::from_str(&output).unwrap();
        assert_eq!(replayed.as_deref(), Some("hello"));
        assert_eq!(sysdb.pending_notification_count(), 0);
    }

    #[tokio::test]
    async fn test_recv_timeout_yields_none() {
        let mut registry = Registry::new();
        let receiver = registry.register_workflow("impatient", |ctx, _: ()| async move {
            ctx.recv::<String>("quiet", Duration::from_millis(20)).await
        });

        let (durable, _sysdb) = runtime(registry);
        let handle = durable
            .start_workflow(&receiver, StartOptions::with_id("wf-timeout"), ())
            .await
            .expect("should start");

        let received: Option<String> = handle.result().await.expect("should time out cleanly");
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn test_events_are_write_once_and_observable() {
        let mut registry = Registry::new();
        let publisher = registry.register_workflow("publisher", |ctx, value: String| async move {
            ctx.set_event("status", &value).await?;
            Ok(())
        });
        let observer = registry.register_workflow("observer", |ctx, target: String| async move {
            ctx.get_event::<String>(&target, "status", Duration::from_secs(5))
                .await
        });

        let (durable, _sysdb) = runtime(registry);

        let observe = durable
            .start_workflow(&observer, StartOptions::with_id("obs"), "pub".to_string())
            .await
            .expect("should start observer");
        tokio::time::sleep(Duration::from_millis(50)).await;
        let publish = durable
            .start_workflow(&publisher, StartOptions::with_id("pub"), "ready".to_string())
            .await
            .expect("should start publisher");

        publish.result().await.expect("publish should succeed");
        let observed: Option<String> = observe.result().await.expect("observe should succeed");
        assert_eq!(observed.as_deref(), Some("ready"));
    }

    #[tokio::test]
    async fn test_child_workflows_get_deterministic_ids() {
        let child_executions = Arc::new(AtomicU32::new(0));
        let mut registry = Registry::new();
        let child = {
            let child_executions = Arc::clone(&child_executions);
            registry.register_workflow("child", move |_ctx, n: i64| {
                let child_executions = Arc::clone(&child_executions);
                async move {
                    child_executions.fetch_add(1, Ordering::SeqCst);
                    Ok(n * 2)
                }
            })
        };
        let parent = {
            let child = child.clone();
            registry.register_workflow("parent", move |ctx, n: i64| {
                let child = child.clone();
                async move {
                    let first = ctx.start_child_workflow(&child, n).await?;
                    let a: i64 = first.result().await?;
                    let second = ctx.start_child_workflow(&child, n + 1).await?;
                    let b: i64 = second.result().await?;
                    Ok(a + b)
                }
            })
        };

        let (durable, sysdb) = runtime(registry);
        let handle = durable
            .start_workflow(&parent, StartOptions::with_id("P"), 5)
            .await
            .expect("should start parent");
        let total: i64 = handle.result().await.expect("parent should succeed");
        assert_eq!(total, 10 + 12);

        // Children derive ids from the parent's step positions
        assert!(sysdb.get_workflow_status("P-0").await.unwrap().is_some());
        assert!(sysdb.get_workflow_status("P-1").await.unwrap().is_some());
        assert_eq!(child_executions.load(Ordering::SeqCst), 2);

        // Once the children's outcomes are durable, a parent re-execution
        // adopts them instead of launching more
        wait_terminal(&durable, &sysdb, "P-0").await;
        wait_terminal(&durable, &sysdb, "P-1").await;
        let output = Arc::clone(&durable.inner)
            .execute_workflow("parent", "P", "5")
            .await
            .expect("replay should succeed");
        assert_eq!(output, "22");
        assert_eq!(child_executions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_waits() {
        let mut registry = Registry::new();
        let sleeper = registry.register_workflow("sleeper", |ctx, _: ()| async move {
            ctx.sleep(Duration::from_secs(30)).await?;
            Ok(())
        });

        let (durable, sysdb) = runtime(registry);
        let handle = durable
            .start_workflow(&sleeper, StartOptions::with_id("wf-sleep"), ())
            .await
            .expect("should start");

        tokio::time::sleep(Duration::from_millis(50)).await;
        durable
            .cancel_workflow("wf-sleep")
            .await
            .expect("should cancel");

        let error = handle.result().await.expect_err("should be cancelled");
        assert!(matches!(error, DurableError::Cancelled));

        let row = wait_terminal(&durable, &sysdb, "wf-sleep").await;
        assert_eq!(row.status, WorkflowState::Cancelled);
    }

    #[tokio::test]
    async fn test_recovery_resumes_pending_workflows() {
        let mut registry = Registry::new();
        registry.register_workflow("recoverable", |_ctx, n: i64| async move { Ok(n + 1) });

        let (durable, sysdb) = runtime(registry);

        // A workflow left PENDING by an executor that stopped heartbeating
        let row = WorkflowStatusRow {
            executor_id: Some("dead-exec".to_string()),
            ..WorkflowStatusRow::pending("wf-orphan", "recoverable", "41", "dead-exec", 0)
        };
        sysdb.insert_workflow_status(&row).await.unwrap();
        sysdb.record_executor_heartbeat("dead-exec", 0).await.unwrap();

        let recovered = durable
            .recover_pending_workflows()
            .await
            .expect("should recover");
        assert_eq!(recovered, 1);

        let terminal = wait_terminal(&durable, &sysdb, "wf-orphan").await;
        assert_eq!(terminal.status, WorkflowState::Success);
        assert_eq!(terminal.output.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn test_recovery_resumes_admitted_queued_workflows() {
        let mut registry = Registry::new();
        registry.register_workflow("laned", |_ctx, n: i64| async move { Ok(n * 10) });

        let sysdb = Arc::new(InMemorySystemDatabase::new());
        let durable = Durable::builder()
            .system_database(Arc::clone(&sysdb) as Arc<dyn SystemDatabase>)
            .registry(registry)
            .config(test_config())
            .queue(WorkflowQueue::new("lane", 1))
            .build()
            .expect("should build");

        // An entry the pump admitted, then its executor died mid-run
        let mut row = WorkflowStatusRow::pending("wf-lane", "laned", "4", "dead-exec", 0);
        row.queue_name = Some("lane".to_string());
        row.queued_at = Some(0);
        sysdb.insert_workflow_status(&row).await.unwrap();
        sysdb.enqueue_workflow("lane", "wf-lane").await.unwrap();
        let admitted = sysdb.start_queued_workflows("lane", 1).await.unwrap();
        assert_eq!(admitted, vec!["wf-lane".to_string()]);
        sysdb.record_executor_heartbeat("dead-exec", 0).await.unwrap();

        let recovered = durable
            .recover_pending_workflows()
            .await
            .expect("should recover");
        assert_eq!(recovered, 1);

        let terminal = wait_terminal(&durable, &sysdb, "wf-lane").await;
        assert_eq!(terminal.status, WorkflowState::Success);
        assert_eq!(terminal.output.as_deref(), Some("40"));

        // The terminal write released the admission slot for the next entry
        let mut next = WorkflowStatusRow::pending("wf-lane-2", "laned", "5", "exec-test", 0);
        next.queue_name = Some("lane".to_string());
        next.queued_at = Some(0);
        sysdb.insert_workflow_status(&next).await.unwrap();
        sysdb.enqueue_workflow("lane", "wf-lane-2").await.unwrap();
        let admitted = sysdb.start_queued_workflows("lane", 1).await.unwrap();
        assert_eq!(admitted, vec!["wf-lane-2".to_string()]);
    }

    #[tokio::test]
    async fn test_cancelled_queued_workflow_is_never_admitted() {
        let executions = Arc::new(AtomicU32::new(0));
        let mut registry = Registry::new();
        let queued = {
            let executions = Arc::clone(&executions);
            registry.register_workflow("queued", move |_ctx, _: ()| {
                let executions = Arc::clone(&executions);
                async move {
                    executions.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };

        let sysdb = Arc::new(InMemorySystemDatabase::new());
        let durable = Durable::builder()
            .system_database(Arc::clone(&sysdb) as Arc<dyn SystemDatabase>)
            .registry(registry)
            .config(test_config())
            .queue(WorkflowQueue::new("lane", 1))
            .build()
            .expect("should build");

        // Enqueued but cancelled before the pump ever runs
        let _handle = durable
            .start_workflow(&queued, StartOptions::with_id("wf-q").queue("lane"), ())
            .await
            .expect("should enqueue");
        durable
            .cancel_workflow("wf-q")
            .await
            .expect("should cancel");

        crate::queue::pump_once(&durable.inner).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The body never ran and the terminal state survived
        assert_eq!(executions.load(Ordering::SeqCst), 0);
        let row = sysdb.get_workflow_status("wf-q").await.unwrap().unwrap();
        assert_eq!(row.status, WorkflowState::Cancelled);
    }

    #[tokio::test]
    async fn test_recovery_marks_unregistered_functions() {
        let (durable, sysdb) = runtime(Registry::new());

        let row = WorkflowStatusRow::pending("wf-ghost", "vanished", "null", "exec-test", 0);
        sysdb.insert_workflow_status(&row).await.unwrap();

        durable
            .recover_pending_workflows()
            .await
            .expect("recovery should not fail");

        let row = sysdb.get_workflow_status("wf-ghost").await.unwrap().unwrap();
        assert_eq!(row.status, WorkflowState::Error);
        let envelope = crate::serialization::ErrorEnvelope::from_json(row.error.as_deref().unwrap());
        assert_eq!(envelope.name, "NotRegistered");
    }

    #[tokio::test]
    async fn test_queue_respects_concurrency_limit() {
        let gauge = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let mut registry = Registry::new();
        let queued = {
            let gauge = Arc::clone(&gauge);
            let peak = Arc::clone(&peak);
            registry.register_workflow("queued", move |_ctx, n: i64| {
                let gauge = Arc::clone(&gauge);
                let peak = Arc::clone(&peak);
                async move {
                    let current = gauge.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(current, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    gauge.fetch_sub(1, Ordering::SeqCst);
                    Ok(n)
                }
            })
        };

        let sysdb = Arc::new(InMemorySystemDatabase::new());
        let durable = Durable::builder()
            .system_database(Arc::clone(&sysdb) as Arc<dyn SystemDatabase>)
            .registry(registry)
            .config(test_config())
            .queue(WorkflowQueue::new("lane", 1))
            .build()
            .expect("should build");
        durable.launch().await.expect("should launch");

        let mut handles = Vec::new();
        for n in 0..3 {
            let handle = durable
                .start_workflow(
                    &queued,
                    StartOptions::with_id(format!("q-{n}")).queue("lane"),
                    n,
                )
                .await
                .expect("should enqueue");
            handles.push(handle);
        }

        for (n, handle) in handles.into_iter().enumerate() {
            let result: i64 = handle.result().await.expect("should run");
            assert_eq!(result, n as i64);
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);

        durable.shutdown().await;
    }

    #[tokio::test]
    async fn test_scheduler_fires_with_unique_ids() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut registry = Registry::new();
        let tick = {
            let fired = Arc::clone(&fired);
            registry.register_workflow("tick", move |_ctx, inv: ScheduledInvocation| {
                let fired = Arc::clone(&fired);
                async move {
                    assert!(inv.actual_start_time >= inv.scheduled_time);
                    fired.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };

        let sysdb = Arc::new(InMemorySystemDatabase::new());
        let durable = Durable::builder()
            .system_database(Arc::clone(&sysdb) as Arc<dyn SystemDatabase>)
            .registry(registry)
            .config(test_config())
            .scheduled("* * * * * *", &tick)
            .expect("cron should parse")
            .build()
            .expect("should build");
        durable.launch().await.expect("should launch");

        tokio::time::sleep(Duration::from_millis(2_200)).await;
        durable.shutdown().await;
        // Let any firing admitted just before shutdown finish its run
        tokio::time::sleep(Duration::from_millis(100)).await;

        let count = fired.load(Ordering::SeqCst);
        assert!((1..=3).contains(&count), "fired {count} times");

        let firing_ids: Vec<String> = sysdb
            .workflow_ids()
            .into_iter()
            .filter(|id| id.starts_with("sched-tick-"))
            .collect();
        assert_eq!(firing_ids.len() as u32, count);
    }

    #[tokio::test]
    async fn test_debug_replay_never_runs_step_bodies() {
        let executions = Arc::new(AtomicU32::new(0));
        let mut registry = Registry::new();
        let step = {
            let executions = Arc::clone(&executions);
            registry.register_step("observed", StepConfig::default(), move |n: i64| {
                let executions = Arc::clone(&executions);
                async move {
                    executions.fetch_add(1, Ordering::SeqCst);
                    Ok::<i64, DurableError>(n + 7)
                }
            })
        };
        let workflow = {
            let step = step.clone();
            registry.register_workflow("debuggable", move |ctx, n: i64| {
                let step = step.clone();
                async move { ctx.step(&step, n).await }
            })
        };

        let (durable, sysdb) = runtime(registry);
        let handle = durable
            .start_workflow(&workflow, StartOptions::with_id("wf-dbg"), 1)
            .await
            .expect("should start");
        let live: i64 = handle.result().await.expect("should succeed");
        assert_eq!(live, 8);
        assert_eq!(executions.load(Ordering::SeqCst), 1);

        let replayed: i64 = durable
            .debug_workflow(&workflow, "wf-dbg", 1)
            .await
            .expect("replay should succeed");
        assert_eq!(replayed, live);
        assert_eq!(executions.load(Ordering::SeqCst), 1);

        // A workflow with no recorded history cannot be replayed
        let fresh = WorkflowStatusRow::pending("wf-fresh", "debuggable", "1", "exec-test", 0);
        sysdb.insert_workflow_status(&fresh).await.unwrap();
        let error = durable
            .debug_workflow(&workflow, "wf-fresh", 1)
            .await
            .expect_err("should refuse");
        assert!(matches!(error, DurableError::Debugger { .. }));
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_unregistered_workflow_fails_synchronously() {
        let (durable, _sysdb) = runtime(Registry::new());
        let mut other = Registry::new();
        let workflow = other.register_workflow("elsewhere", |_ctx, _: ()| async move { Ok(()) });

        let error = durable
            .start_workflow(&workflow, StartOptions::default(), ())
            .await
            .expect_err("should reject");
        assert!(matches!(error, DurableError::NotRegistered(_)));
    }

    #[tokio::test]
    async fn test_durable_sleep_records_deadline() {
        let mut registry = Registry::new();
        let napper = registry.register_workflow("napper", |ctx, _: ()| async move {
            ctx.sleep(Duration::from_millis(30)).await?;
            Ok(())
        });

        let (durable, sysdb) = runtime(registry);
        let handle = durable
            .start_workflow(&napper, StartOptions::with_id("wf-nap"), ())
            .await
            .expect("should start");
        handle.result().await.expect("should wake");

        // The deadline is the recorded outcome of step 0; a replay sleeps
        // only for the remainder, which has already elapsed
        assert_eq!(sysdb.operation_count("wf-nap"), 1);
        let started = std::time::Instant::now();
        Arc::clone(&durable.inner)
            .execute_workflow("napper", "wf-nap", "null")
            .await
            .expect("replay should succeed");
        assert!(started.elapsed() < Duration::from_millis(25));
    }
}
