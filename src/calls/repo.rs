use std::time::Duration;

use anyhow::Context;
use axum::async_trait;
use serde_json::{Map, Value};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    PgPool,
};
use tracing::{debug, info};

/// One row of `"call summary"`, keyed by column name.
pub type CallSummaryRow = Map<String, Value>;

/// Read side of the tabular store.
#[async_trait]
pub trait CallSummaryStore: Send + Sync {
    async fn fetch_all(&self) -> anyhow::Result<Vec<CallSummaryRow>>;
    async fn ping(&self) -> anyhow::Result<()>;
    async fn close(&self) {}
}

#[derive(Clone)]
pub struct PgCallSummaryStore {
    db: PgPool,
}

impl PgCallSummaryStore {
    pub async fn connect(options: PgConnectOptions, max_connections: u32) -> anyhow::Result<Self> {
        let db = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await
            .context("connect to database")?;
        info!(max_connections, "PostgreSQL connected");
        Ok(Self { db })
    }
}

#[async_trait]
impl CallSummaryStore for PgCallSummaryStore {
    async fn fetch_all(&self) -> anyhow::Result<Vec<CallSummaryRow>> {
        // row_to_json keeps column names and values as the table has them.
        let rows = sqlx::query_scalar::<_, Value>(
            r#"
            SELECT row_to_json(t)
            FROM "call summary" AS t
            "#,
        )
        .fetch_all(&self.db)
        .await
        .context("select from \"call summary\"")?;

        debug!(rows = rows.len(), "call summary fetched");
        rows.into_iter()
            .map(|row| match row {
                Value::Object(map) => Ok(map),
                other => anyhow::bail!("unexpected row shape: {other}"),
            })
            .collect()
    }

    async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.db)
            .await
            .context("PostgreSQL ping")?;
        Ok(())
    }

    async fn close(&self) {
        self.db.close().await;
    }
}
