//! Workflow queues: named admission-controlled lanes
//!
//! Enqueued workflows sit in `workflow_queue` until the pump admits them
//! under the queue's concurrency limit. The limit counts entries that have
//! started but not completed; terminal workflows release their slot.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::engine::executor::RuntimeInner;

/// A named queue with a concurrency bound
#[derive(Debug, Clone)]
pub struct WorkflowQueue {
    pub name: String,
    pub concurrency_limit: u32,
}

impl WorkflowQueue {
    pub fn new(name: impl Into<String>, concurrency_limit: u32) -> Self {
        Self {
            name: name.into(),
            concurrency_limit: concurrency_limit.max(1),
        }
    }
}

/// Claim ready entries for every registered queue and launch them
pub(crate) async fn run_queue_pump(inner: Arc<RuntimeInner>, mut shutdown: watch::Receiver<bool>) {
    let interval = Duration::from_millis(inner.config.queue_poll_interval_ms);
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                pump_once(&inner).await;
            }
            _ = shutdown.changed() => {
                debug!("queue pump: shutdown requested");
                break;
            }
        }
    }

    info!("queue pump exited");
}

pub(crate) async fn pump_once(inner: &Arc<RuntimeInner>) {
    for queue in &inner.queues {
        let admitted = match inner
            .sysdb
            .start_queued_workflows(&queue.name, queue.concurrency_limit)
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                error!(queue = %queue.name, "queue claim failed: {}", e);
                continue;
            }
        };

        for workflow_id in admitted {
            if inner.active.lock().contains_key(&workflow_id) {
                continue;
            }

            match inner.sysdb.get_workflow_status(&workflow_id).await {
                Ok(Some(row)) => {
                    // Cancelled (or otherwise finished) between enqueue and
                    // admission; release the slot instead of running it
                    if row.status.is_terminal() {
                        debug!(%workflow_id, status = %row.status, "skipping terminal queued workflow");
                        if let Err(e) =
                            inner.sysdb.mark_queue_entry_completed(&workflow_id).await
                        {
                            error!(%workflow_id, "failed to release queue entry: {}", e);
                        }
                        continue;
                    }
                    debug!(%workflow_id, queue = %queue.name, "launching queued workflow");
                    inner.spawn_execution(row.name, row.workflow_id, row.inputs);
                }
                Ok(None) => {
                    error!(%workflow_id, "queued workflow has no status row");
                }
                Err(e) => {
                    error!(%workflow_id, "failed to load queued workflow: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_enforces_minimum_limit() {
        let queue = WorkflowQueue::new("lane", 0);
        assert_eq!(queue.concurrency_limit, 1);

        let queue = WorkflowQueue::new("lane", 8);
        assert_eq!(queue.concurrency_limit, 8);
    }
}
