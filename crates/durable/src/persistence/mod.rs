//! Persistence layer: the system database and its implementations
//!
//! The [`SystemDatabase`] trait is the executor's single durability surface.
//! [`PostgresSystemDatabase`] is the production implementation;
//! [`InMemorySystemDatabase`] backs unit tests.

pub mod memory;
pub mod migrations;
pub mod postgres;
pub mod store;
pub(crate) mod wakeup;

pub use memory::InMemorySystemDatabase;
pub use postgres::{PostgresSystemDatabase, EVENTS_CHANNEL, NOTIFICATIONS_CHANNEL};
pub use store::{
    BufferedOutput, CallerContext, OperationOutcome, StatusUpdate, StoreError, SystemDatabase,
    WorkflowState, WorkflowStatusRow,
};
