//! Workflow, step, and transaction registry
//!
//! Applications register their functions by name at startup; the executor
//! resolves names back to type-erased callables at run and recovery time.
//! Registration hands back a cheap typed handle (`WorkflowRef`, `StepRef`,
//! `TransactionRef`) that carries the name plus the input/output types, so
//! invocation needs no reflection and no proxies.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::PgConnection;

pub use crate::appdb::{IsolationLevel, TransactionConfig};
use crate::engine::context::WorkflowContext;
use crate::error::DurableError;

/// Retry options for a non-transactional step
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StepConfig {
    /// When false the step runs exactly once and any error is recorded
    pub retries_allowed: bool,

    /// Maximum attempts, including the first
    pub max_attempts: u32,

    /// Delay before the first retry, seconds
    pub interval_sec: f64,

    /// Multiplier applied to the delay after each failure
    pub backoff_rate: f64,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            retries_allowed: true,
            max_attempts: 3,
            interval_sec: 1.0,
            backoff_rate: 2.0,
        }
    }
}

impl StepConfig {
    /// A step that runs exactly once
    pub fn no_retries() -> Self {
        Self {
            retries_allowed: false,
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_interval(mut self, interval_sec: f64) -> Self {
        self.interval_sec = interval_sec;
        self
    }

    pub fn with_backoff_rate(mut self, backoff_rate: f64) -> Self {
        self.backoff_rate = backoff_rate;
        self
    }

    /// Sleep between failure number `failure_index` (0-based) and the next
    /// attempt: `interval * backoff^failure_index`
    pub fn delay_after_failure(&self, failure_index: u32) -> Duration {
        let seconds = self.interval_sec * self.backoff_rate.powi(failure_index as i32);
        Duration::from_secs_f64(seconds.max(0.0))
    }
}

/// Typed handle to a registered workflow
pub struct WorkflowRef<I, O> {
    name: Arc<str>,
    _marker: PhantomData<fn(I) -> O>,
}

/// Typed handle to a registered step
pub struct StepRef<I, O> {
    name: Arc<str>,
    _marker: PhantomData<fn(I) -> O>,
}

/// Typed handle to a registered transaction
pub struct TransactionRef<I, O> {
    name: Arc<str>,
    _marker: PhantomData<fn(I) -> O>,
}

macro_rules! impl_ref {
    ($ref_type:ident) => {
        impl<I, O> $ref_type<I, O> {
            fn new(name: &str) -> Self {
                Self {
                    name: Arc::from(name),
                    _marker: PhantomData,
                }
            }

            /// Registered name
            pub fn name(&self) -> &str {
                &self.name
            }
        }

        impl<I, O> Clone for $ref_type<I, O> {
            fn clone(&self) -> Self {
                Self {
                    name: Arc::clone(&self.name),
                    _marker: PhantomData,
                }
            }
        }

        impl<I, O> std::fmt::Debug for $ref_type<I, O> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_tuple(stringify!($ref_type)).field(&self.name).finish()
            }
        }
    };
}

impl_ref!(WorkflowRef);
impl_ref!(StepRef);
impl_ref!(TransactionRef);

/// Type-erased workflow function
pub(crate) type WorkflowFn =
    Arc<dyn Fn(WorkflowContext, Value) -> BoxFuture<'static, Result<Value, DurableError>> + Send + Sync>;

/// Type-erased step function
pub(crate) type StepFn =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, DurableError>> + Send + Sync>;

/// Type-erased transaction function, generic over the borrowed connection
pub(crate) type TransactionFn = Arc<
    dyn for<'c> Fn(&'c mut PgConnection, Value) -> BoxFuture<'c, Result<Value, DurableError>>
        + Send
        + Sync,
>;

pub(crate) struct RegisteredStep {
    pub(crate) function: StepFn,
    pub(crate) config: StepConfig,
}

pub(crate) struct RegisteredTransaction {
    pub(crate) function: TransactionFn,
    pub(crate) config: TransactionConfig,
}

/// Registry of durable functions, built once at startup
#[derive(Default)]
pub struct Registry {
    workflows: HashMap<String, WorkflowFn>,
    steps: HashMap<String, RegisteredStep>,
    transactions: HashMap<String, RegisteredTransaction>,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow function
    pub fn register_workflow<I, O, F, Fut>(&mut self, name: &str, function: F) -> WorkflowRef<I, O>
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(WorkflowContext, I) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<O, DurableError>> + Send + 'static,
    {
        let erased: WorkflowFn = Arc::new(move |ctx, value| {
            let input: Result<I, _> = serde_json::from_value(value);
            match input {
                Ok(input) => {
                    let fut = function(ctx, input);
                    async move {
                        let output = fut.await?;
                        Ok(serde_json::to_value(output)?)
                    }
                    .boxed()
                }
                Err(e) => futures::future::ready(Err(DurableError::Serialization(e))).boxed(),
            }
        });

        self.workflows.insert(name.to_string(), erased);
        WorkflowRef::new(name)
    }

    /// Register a non-transactional step
    pub fn register_step<I, O, F, Fut>(
        &mut self,
        name: &str,
        config: StepConfig,
        function: F,
    ) -> StepRef<I, O>
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<O, DurableError>> + Send + 'static,
    {
        let erased: StepFn = Arc::new(move |value| {
            let input: Result<I, _> = serde_json::from_value(value);
            match input {
                Ok(input) => {
                    let fut = function(input);
                    async move {
                        let output = fut.await?;
                        Ok(serde_json::to_value(output)?)
                    }
                    .boxed()
                }
                Err(e) => futures::future::ready(Err(DurableError::Serialization(e))).boxed(),
            }
        });

        self.steps.insert(
            name.to_string(),
            RegisteredStep {
                function: erased,
                config,
            },
        );
        StepRef::new(name)
    }

    /// Register a transactional step
    ///
    /// The callback borrows the transaction's connection, so it is written
    /// with an explicit boxed future:
    ///
    /// ```ignore
    /// registry.register_transaction("insert_row", TransactionConfig::default(),
    ///     |conn, id: String| Box::pin(async move {
    ///         sqlx::query("INSERT INTO kv (id) VALUES ($1)")
    ///             .bind(&id)
    ///             .execute(&mut *conn)
    ///             .await?;
    ///         Ok(id)
    ///     }));
    /// ```
    pub fn register_transaction<I, O, F>(
        &mut self,
        name: &str,
        config: TransactionConfig,
        function: F,
    ) -> TransactionRef<I, O>
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: for<'c> Fn(&'c mut PgConnection, I) -> BoxFuture<'c, Result<O, DurableError>>
            + Send
            + Sync
            + 'static,
    {
        let erased: TransactionFn = Arc::new(move |conn, value| {
            let input: Result<I, _> = serde_json::from_value(value);
            match input {
                Ok(input) => {
                    let fut = function(conn, input);
                    async move {
                        let output = fut.await?;
                        Ok(serde_json::to_value(output)?)
                    }
                    .boxed()
                }
                Err(e) => futures::future::ready(Err(DurableError::Serialization(e))).boxed(),
            }
        });

        self.transactions.insert(
            name.to_string(),
            RegisteredTransaction {
                function: erased,
                config,
            },
        );
        TransactionRef::new(name)
    }

    /// Whether a workflow name is registered
    pub fn contains_workflow(&self, name: &str) -> bool {
        self.workflows.contains_key(name)
    }

    /// Registered workflow names
    pub fn workflow_names(&self) -> impl Iterator<Item = &str> {
        self.workflows.keys().map(|s| s.as_str())
    }

    pub(crate) fn workflow(&self, name: &str) -> Result<WorkflowFn, DurableError> {
        self.workflows
            .get(name)
            .cloned()
            .ok_or_else(|| DurableError::NotRegistered(name.to_string()))
    }

    pub(crate) fn step(&self, name: &str) -> Result<&RegisteredStep, DurableError> {
        self.steps
            .get(name)
            .ok_or_else(|| DurableError::NotRegistered(name.to_string()))
    }

    pub(crate) fn transaction(&self, name: &str) -> Result<&RegisteredTransaction, DurableError> {
        self.transactions
            .get(name)
            .ok_or_else(|| DurableError::NotRegistered(name.to_string()))
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("workflows", &self.workflows.keys().collect::<Vec<_>>())
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .field("transactions", &self.transactions.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let mut registry = Registry::new();
        let wf = registry.register_workflow("greet", |_ctx, name: String| async move {
            Ok(format!("hello {name}"))
        });

        assert_eq!(wf.name(), "greet");
        assert!(registry.contains_workflow("greet"));
        assert!(!registry.contains_workflow("other"));
        assert!(registry.workflow("greet").is_ok());
        assert!(matches!(
            registry.workflow("other"),
            Err(DurableError::NotRegistered(_))
        ));
    }

    #[test]
    fn test_step_config_defaults() {
        let config = StepConfig::default();
        assert!(config.retries_allowed);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.interval_sec, 1.0);
        assert_eq!(config.backoff_rate, 2.0);

        let once = StepConfig::no_retries();
        assert!(!once.retries_allowed);
        assert_eq!(once.max_attempts, 1);
    }

    #[test]
    fn test_delay_after_failure() {
        let config = StepConfig::default()
            .with_interval(1.0)
            .with_backoff_rate(2.0);

        assert_eq!(config.delay_after_failure(0), Duration::from_secs(1));
        assert_eq!(config.delay_after_failure(1), Duration::from_secs(2));
        assert_eq!(config.delay_after_failure(2), Duration::from_secs(4));
    }

    #[test]
    fn test_refs_are_cheap_and_cloneable() {
        let mut registry = Registry::new();
        let step: StepRef<u32, u32> =
            registry.register_step("double", StepConfig::default(), |n: u32| async move {
                Ok(n * 2)
            });

        let cloned = step.clone();
        assert_eq!(cloned.name(), "double");
        assert!(format!("{cloned:?}").contains("double"));
    }

    #[test]
    fn test_registry_debug_lists_names() {
        let mut registry = Registry::new();
        registry.register_workflow("checkout", |_ctx, (): ()| async move { Ok(()) });
        let debug = format!("{registry:?}");
        assert!(debug.contains("checkout"));
    }
}
