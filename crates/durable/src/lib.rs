//! # Granite
//!
//! A PostgreSQL-backed durable-execution runtime: ordinary async functions
//! become reliably resumable workflows whose steps run with exactly-once
//! effect across crashes.
//!
//! ## Features
//!
//! - **Durable operation log**: every step records its outcome under a
//!   monotonic (workflow, function) key; replays return recorded outcomes
//!   instead of re-running effects
//! - **Transactional steps**: user transactions commit atomically with their
//!   log record, guarded against concurrent duplicates by a unique key
//! - **Messaging and events**: FIFO send/recv per (destination, topic) and
//!   write-once keyed events, with LISTEN/NOTIFY cross-process wakeups
//! - **Cron scheduling**: deterministic firing ids make restarts
//!   duplicate-free
//! - **Queues**: named lanes with database-enforced concurrency bounds
//! - **Recovery**: interrupted workflows resume from their logs on relaunch
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Durable runtime                      │
//! │   (executor, registry, scheduler, queue pump, flush loop)   │
//! └─────────────────────────────────────────────────────────────┘
//!                │                                │
//!                ▼                                ▼
//! ┌──────────────────────────────┐ ┌──────────────────────────────┐
//! │        SystemDatabase        │ │         UserDatabase         │
//! │ (workflow status, operation  │ │ (application transactions +  │
//! │  log, notifications, events, │ │  transaction_outputs guard   │
//! │  queues, heartbeats)         │ │  rows, committed atomically) │
//! └──────────────────────────────┘ └──────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use granite_durable::prelude::*;
//!
//! let mut registry = Registry::new();
//! let fetch = registry.register_step("fetch", StepConfig::default(), |url: String| async move {
//!     Ok(reqwest_like_call(&url).await)
//! });
//! let checkout = registry.register_workflow("checkout", move |ctx, url: String| {
//!     let fetch = fetch.clone();
//!     async move {
//!         let body: String = ctx.step(&fetch, url).await?;
//!         Ok(body.len())
//!     }
//! });
//!
//! let sysdb = Arc::new(PostgresSystemDatabase::connect(pool).await?);
//! let runtime = Durable::builder()
//!     .system_database(sysdb)
//!     .registry(registry)
//!     .build()?;
//! runtime.launch().await?;
//!
//! let handle = runtime.start_workflow(&checkout, StartOptions::default(), url).await?;
//! let length: usize = handle.result().await?;
//! ```

pub mod appdb;
pub mod config;
pub mod engine;
pub mod error;
pub mod oplog;
pub mod persistence;
pub mod queue;
pub mod scheduler;
pub mod serialization;

/// Prelude for common imports
pub mod prelude {
    pub use crate::appdb::{IsolationLevel, TransactionConfig, UserDatabase};
    pub use crate::config::{DatabaseConfig, GraniteConfig, RuntimeConfig};
    pub use crate::engine::{
        Durable, DurableBuilder, Registry, StartOptions, StepConfig, StepRef, TransactionRef,
        WorkflowContext, WorkflowHandle, WorkflowRef,
    };
    pub use crate::error::DurableError;
    pub use crate::persistence::{
        InMemorySystemDatabase, PostgresSystemDatabase, SystemDatabase, WorkflowState,
    };
    pub use crate::queue::WorkflowQueue;
    pub use crate::scheduler::ScheduledInvocation;
    pub use crate::serialization::ErrorEnvelope;
}

// Re-export key types at crate root
pub use appdb::{IsolationLevel, TransactionConfig, UserDatabase};
pub use config::{DatabaseConfig, GraniteConfig, RuntimeConfig};
pub use engine::{
    Durable, DurableBuilder, Registry, StartOptions, StepConfig, StepRef, TransactionRef,
    WorkflowContext, WorkflowHandle, WorkflowRef,
};
pub use error::DurableError;
pub use persistence::{
    InMemorySystemDatabase, PostgresSystemDatabase, StoreError, SystemDatabase, WorkflowState,
};
pub use queue::WorkflowQueue;
pub use scheduler::ScheduledInvocation;
pub use serialization::ErrorEnvelope;
