//! Traced access to the migration store database.
//!
//! Every store statement runs inside a `store.sql` span carrying the
//! operation, the SQL text and, once it completes, the number of rows
//! touched.

use std::ops::Deref;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Error, Row};
use tracing::{Instrument, Span};

type Params<'a> = &'a [&'a (dyn ToSql + Sync)];

fn sql_span(op: &'static str, sql: &str, params: usize) -> Span {
    tracing::debug_span!(
        "store.sql",
        op,
        sql = %sql,
        params,
        rows = tracing::field::Empty,
    )
}

/// The store's connection pool.
#[derive(Clone)]
pub(crate) struct TracedPool {
    inner: deadpool_postgres::Pool,
}

impl TracedPool {
    pub(crate) fn new(pool: deadpool_postgres::Pool) -> Self {
        Self { inner: pool }
    }

    pub(crate) async fn get(&self) -> Result<TracedClient, deadpool_postgres::PoolError> {
        Ok(TracedClient {
            inner: self.inner.get().await?,
        })
    }
}

/// A pooled connection; returned to the pool on drop.
pub(crate) struct TracedClient {
    inner: deadpool_postgres::Object,
}

impl TracedClient {
    fn client(&self) -> &tokio_postgres::Client {
        self.inner.deref()
    }

    /// Schema setup and transaction control; no parameters, no rows.
    pub(crate) async fn batch_execute(&self, sql: &str) -> Result<(), Error> {
        let span = sql_span("batch", sql, 0);
        self.client().batch_execute(sql).instrument(span).await
    }

    /// Rows affected.
    pub(crate) async fn execute(&self, sql: &str, params: Params<'_>) -> Result<u64, Error> {
        let span = sql_span("execute", sql, params.len());
        let affected = self
            .client()
            .execute(sql, params)
            .instrument(span.clone())
            .await?;
        span.record("rows", affected);
        Ok(affected)
    }

    pub(crate) async fn query(&self, sql: &str, params: Params<'_>) -> Result<Vec<Row>, Error> {
        let span = sql_span("query", sql, params.len());
        let rows = self
            .client()
            .query(sql, params)
            .instrument(span.clone())
            .await?;
        span.record("rows", rows.len());
        Ok(rows)
    }

    pub(crate) async fn query_opt(&self, sql: &str, params: Params<'_>) -> Result<Option<Row>, Error> {
        let span = sql_span("query_opt", sql, params.len());
        let row = self
            .client()
            .query_opt(sql, params)
            .instrument(span.clone())
            .await?;
        span.record("rows", u64::from(row.is_some()));
        Ok(row)
    }

    /// Fails unless the statement returns exactly one row.
    pub(crate) async fn query_one(&self, sql: &str, params: Params<'_>) -> Result<Row, Error> {
        let span = sql_span("query_one", sql, params.len());
        let row = self
            .client()
            .query_one(sql, params)
            .instrument(span.clone())
            .await?;
        span.record("rows", 1u64);
        Ok(row)
    }
}
