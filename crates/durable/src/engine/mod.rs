//! Workflow executor, registry, and context

pub mod context;
pub mod executor;
pub(crate) mod flush;
pub(crate) mod recovery;
pub mod registry;

pub use context::WorkflowContext;
pub use executor::{Durable, DurableBuilder, StartOptions, WorkflowHandle};
pub use registry::{
    IsolationLevel, Registry, StepConfig, StepRef, TransactionConfig, TransactionRef, WorkflowRef,
};
