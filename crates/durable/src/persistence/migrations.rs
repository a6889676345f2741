//! Embedded schema migrations
//!
//! Applied idempotently at launch. The system database holds everything
//! except `transaction_outputs`, which lives in the application database so
//! transactional step records commit atomically with user writes.

use sqlx::PgPool;

use super::StoreError;

const SYSTEM_DDL: &[&str] = &[
    "CREATE SCHEMA IF NOT EXISTS granite",
    r#"
    CREATE TABLE IF NOT EXISTS granite.workflow_status (
        workflow_uuid TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        name TEXT,
        inputs TEXT,
        authenticated_user TEXT,
        assumed_role TEXT,
        authenticated_roles TEXT,
        request TEXT,
        output TEXT,
        error TEXT,
        executor_id TEXT,
        created_at BIGINT,
        updated_at BIGINT,
        application_version TEXT,
        queue_name TEXT,
        queued_at BIGINT,
        started_at BIGINT,
        completed_at BIGINT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS granite.operation_outputs (
        workflow_uuid TEXT NOT NULL,
        function_id INT NOT NULL,
        output TEXT,
        error TEXT,
        txn_id TEXT,
        txn_snapshot TEXT,
        created_at BIGINT,
        PRIMARY KEY (workflow_uuid, function_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS granite.notifications (
        destination_uuid TEXT NOT NULL,
        topic TEXT NOT NULL,
        message TEXT,
        created_at BIGINT NOT NULL,
        message_uuid TEXT PRIMARY KEY
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_notifications_dest_topic
        ON granite.notifications (destination_uuid, topic, created_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS granite.workflow_events (
        workflow_uuid TEXT NOT NULL,
        key TEXT NOT NULL,
        value TEXT,
        PRIMARY KEY (workflow_uuid, key)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS granite.workflow_queue (
        workflow_uuid TEXT PRIMARY KEY,
        queue_name TEXT NOT NULL,
        created_at BIGINT NOT NULL,
        started_at BIGINT,
        completed_at BIGINT
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_workflow_queue_name_created
        ON granite.workflow_queue (queue_name, created_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS granite.executor_heartbeats (
        executor_id TEXT PRIMARY KEY,
        last_seen BIGINT NOT NULL
    )
    "#,
];

const APPLICATION_DDL: &[&str] = &[
    "CREATE SCHEMA IF NOT EXISTS granite",
    r#"
    CREATE TABLE IF NOT EXISTS granite.transaction_outputs (
        workflow_uuid TEXT NOT NULL,
        function_id INT NOT NULL,
        output TEXT,
        error TEXT,
        txn_id TEXT,
        txn_snapshot TEXT,
        created_at BIGINT,
        PRIMARY KEY (workflow_uuid, function_id)
    )
    "#,
];

/// Create the system-database schema
pub async fn run_system_migrations(pool: &PgPool) -> Result<(), StoreError> {
    apply(pool, SYSTEM_DDL).await
}

/// Create the `transaction_outputs` table in the application database
pub async fn run_application_migrations(pool: &PgPool) -> Result<(), StoreError> {
    apply(pool, APPLICATION_DDL).await
}

async fn apply(pool: &PgPool, statements: &[&str]) -> Result<(), StoreError> {
    for statement in statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
    }
    Ok(())
}
