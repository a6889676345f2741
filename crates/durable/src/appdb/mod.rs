//! User database adapter
//!
//! A thin capability over the application's PostgreSQL database: run a
//! callback inside a transaction at a requested isolation level, retry
//! serialization failures, and classify errors. No business logic lives here.

use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use sqlx::{PgConnection, PgPool};
use tracing::{debug, warn};

use crate::error::DurableError;
use crate::persistence::migrations;

/// Transaction isolation levels recognized by transactional steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    #[default]
    Serializable,
}

impl IsolationLevel {
    fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

/// Options for a transactional step
#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionConfig {
    pub isolation: IsolationLevel,
    pub read_only: bool,
}

/// SQLSTATE 40001: the transaction should be retried as-is
pub fn is_retriable_transaction_error(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.code().as_deref() == Some("40001"))
}

/// SQLSTATE 23505: a unique constraint rejected the write
pub fn is_key_conflict_error(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn set_transaction_statement(config: &TransactionConfig) -> String {
    let mut statement = format!(
        "SET TRANSACTION ISOLATION LEVEL {}",
        config.isolation.as_sql()
    );
    if config.read_only {
        statement.push_str(" READ ONLY");
    }
    statement
}

/// Application-database handle shared among workflows
///
/// The pool is shared; each transactional step acquires a connection for the
/// duration of its transaction only.
pub struct UserDatabase {
    pool: PgPool,
    max_retries: u32,
    base_backoff: Duration,
}

impl UserDatabase {
    /// Wrap a pool and ensure the transaction-output table exists
    pub async fn connect(pool: PgPool) -> Result<Self, DurableError> {
        migrations::run_application_migrations(&pool).await?;
        Ok(Self {
            pool,
            max_retries: 10,
            base_backoff: Duration::from_millis(10),
        })
    }

    /// Override the serialization-failure retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run `callback` inside a transaction at the configured isolation level
    ///
    /// Serialization failures (SQLSTATE 40001) are retried with exponential
    /// backoff up to the retry budget; every other error rolls back and
    /// surfaces unchanged. The callback may run more than once and must not
    /// hold state across attempts.
    pub async fn transaction<T, F>(
        &self,
        config: &TransactionConfig,
        mut callback: F,
    ) -> Result<T, DurableError>
    where
        F: for<'c> FnMut(&'c mut PgConnection) -> BoxFuture<'c, Result<T, DurableError>> + Send,
        T: Send,
    {
        let mut attempt = 0u32;

        loop {
            let result = self.try_once(config, &mut callback).await;

            match result {
                Err(DurableError::UserDatabase(e))
                    if is_retriable_transaction_error(&e) && attempt < self.max_retries =>
                {
                    let delay = self.retry_delay(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "serialization failure, retrying transaction"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn try_once<T, F>(
        &self,
        config: &TransactionConfig,
        callback: &mut F,
    ) -> Result<T, DurableError>
    where
        F: for<'c> FnMut(&'c mut PgConnection) -> BoxFuture<'c, Result<T, DurableError>> + Send,
        T: Send,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(DurableError::UserDatabase)?;

        sqlx::query(&set_transaction_statement(config))
            .execute(&mut *tx)
            .await
            .map_err(DurableError::UserDatabase)?;

        match callback(&mut *tx).await {
            Ok(value) => {
                tx.commit().await.map_err(DurableError::UserDatabase)?;
                Ok(value)
            }
            Err(error) => {
                // Dropping the transaction rolls it back
                drop(tx);
                debug!("transaction rolled back: {}", error);
                Err(error)
            }
        }
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self.base_backoff.as_secs_f64() * 2f64.powi(attempt as i32);
        let capped = base.min(1.0);
        let jittered = capped * rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_sql() {
        assert_eq!(IsolationLevel::Serializable.as_sql(), "SERIALIZABLE");
        assert_eq!(IsolationLevel::ReadCommitted.as_sql(), "READ COMMITTED");
    }

    #[test]
    fn test_set_transaction_statement() {
        let config = TransactionConfig {
            isolation: IsolationLevel::RepeatableRead,
            read_only: false,
        };
        assert_eq!(
            set_transaction_statement(&config),
            "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ"
        );

        let config = TransactionConfig {
            isolation: IsolationLevel::Serializable,
            read_only: true,
        };
        assert_eq!(
            set_transaction_statement(&config),
            "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE READ ONLY"
        );
    }

    #[test]
    fn test_default_isolation_is_serializable() {
        assert_eq!(TransactionConfig::default().isolation, IsolationLevel::Serializable);
        assert!(!TransactionConfig::default().read_only);
    }
}
