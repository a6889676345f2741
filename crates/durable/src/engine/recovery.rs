//! Recovery coordinator and executor heartbeats
//!
//! On launch (and on demand) every PENDING workflow owned by this executor,
//! by a dead executor, or by nobody is re-invoked with its original function
//! and arguments. The operation log makes the re-invocation safe: completed
//! steps replay, uncompleted steps resume.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::engine::executor::RuntimeInner;
use crate::error::DurableError;
use crate::persistence::{StatusUpdate, WorkflowState};
use crate::serialization::ErrorEnvelope;

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Re-enumerate PENDING workflows and resume the ones this executor may own
pub(crate) async fn recover_pending(inner: &Arc<RuntimeInner>) -> Result<usize, DurableError> {
    let dead = inner
        .sysdb
        .list_dead_executors(inner.config.dead_executor_threshold_ms as i64, now_ms())
        .await?;
    let pending = inner.sysdb.list_pending_workflows().await?;

    let mut recovered = 0;
    for row in pending {
        let owner_is_claimable = match &row.executor_id {
            None => true,
            Some(owner) => *owner == inner.config.executor_id || dead.contains(owner),
        };
        if !owner_is_claimable {
            continue;
        }

        // Queued workflows are split by admission: entries the pump has not
        // admitted yet have no started_at and stay the pump's to launch;
        // admitted ones whose executor died are resumed here, and their
        // terminal write releases the queue slot.
        if row.queue_name.is_some() && row.started_at.is_none() {
            continue;
        }

        if inner.active.lock().contains_key(&row.workflow_id) {
            continue;
        }

        if !inner.registry.contains_workflow(&row.name) {
            warn!(
                workflow_id = %row.workflow_id,
                name = %row.name,
                "cannot recover workflow: function unregistered"
            );
            let envelope = ErrorEnvelope::new(
                "NotRegistered",
                format!("function {} is no longer registered", row.name),
            );
            inner
                .sysdb
                .update_workflow_status(&StatusUpdate {
                    workflow_id: row.workflow_id.clone(),
                    status: WorkflowState::Error,
                    output: None,
                    error: Some(envelope.to_json()),
                })
                .await?;
            continue;
        }

        debug!(workflow_id = %row.workflow_id, name = %row.name, "recovering workflow");
        inner.spawn_execution(row.name, row.workflow_id, row.inputs);
        recovered += 1;
    }

    Ok(recovered)
}

/// Keep this executor's liveness row fresh while the runtime is up
pub(crate) async fn run_heartbeat_loop(
    inner: Arc<RuntimeInner>,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = Duration::from_millis(inner.config.heartbeat_interval_ms);
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = inner
                    .sysdb
                    .record_executor_heartbeat(&inner.config.executor_id, now_ms())
                    .await
                {
                    error!("heartbeat failed: {}", e);
                }
            }
            _ = shutdown.changed() => {
                debug!("heartbeat loop: shutdown requested");
                break;
            }
        }
    }

    info!("heartbeat loop exited");
}
