//! Background flush loop
//!
//! One periodic task persists the two in-memory buffers: read-only
//! transaction outputs (into the application database, one multi-row insert)
//! and workflow status advances (into the system database). Each batch runs
//! in its own READ COMMITTED transaction. Failed batches are put back so the
//! next tick retries them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::appdb::{IsolationLevel, TransactionConfig};
use crate::engine::executor::RuntimeInner;
use crate::error::DurableError;
use crate::oplog;

pub(crate) async fn run_flush_loop(inner: Arc<RuntimeInner>, mut shutdown: watch::Receiver<bool>) {
    let interval = Duration::from_millis(inner.config.flush_interval_ms);
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = flush_once(&inner).await {
                    error!("flush failed: {}", e);
                }
            }
            _ = shutdown.changed() => {
                if let Err(e) = flush_once(&inner).await {
                    error!("final flush failed: {}", e);
                }
                break;
            }
        }
    }

    info!("flush loop exited");
}

/// Persist everything currently buffered
pub(crate) async fn flush_once(inner: &Arc<RuntimeInner>) -> Result<(), DurableError> {
    flush_buffered_outputs(inner).await?;
    flush_status_updates(inner).await
}

async fn flush_buffered_outputs(inner: &Arc<RuntimeInner>) -> Result<(), DurableError> {
    let rows = inner.buffer.drain_all();
    if rows.is_empty() {
        return Ok(());
    }

    let Some(user_db) = inner.user_db.as_ref() else {
        // Buffered outputs only come from transactional steps, which require
        // a user database; nothing to do without one.
        return Ok(());
    };

    let config = TransactionConfig {
        isolation: IsolationLevel::ReadCommitted,
        read_only: false,
    };

    let batch = Arc::new(rows);
    let result = {
        let batch = Arc::clone(&batch);
        user_db
            .transaction(&config, move |conn| {
                let batch = Arc::clone(&batch);
                Box::pin(async move { oplog::flush_buffered(conn, &batch).await })
            })
            .await
    };

    match result {
        Ok(()) => {
            debug!(count = batch.len(), "flushed read-only outputs");
            Ok(())
        }
        Err(e) => {
            // Put the batch back for the next tick
            for row in batch.iter() {
                inner.buffer.push(row.clone());
            }
            Err(e)
        }
    }
}

async fn flush_status_updates(inner: &Arc<RuntimeInner>) -> Result<(), DurableError> {
    let updates: Vec<_> = std::mem::take(&mut *inner.status_buffer.lock());
    if updates.is_empty() {
        return Ok(());
    }

    match inner.sysdb.flush_status_batch(&updates).await {
        Ok(()) => {
            debug!(count = updates.len(), "flushed status updates");
            Ok(())
        }
        Err(e) => {
            let mut buffer = inner.status_buffer.lock();
            for update in updates {
                buffer.push(update);
            }
            Err(e.into())
        }
    }
}
