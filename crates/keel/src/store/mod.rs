//! Persistence for identity records and migrations.
//!
//! Two stores are involved: the [`IdentityStore`] keeps the [`Metadata`]
//! record of every schema object keel has ever planned, and the
//! [`MigrationStore`] keeps migrations and their steps. Both are implemented
//! by [`MemoryStore`] (tests, sandboxes) and [`PostgresStore`].

use crate::migration::{Migration, MigrationStatus, Step};
use keel_schema::{Metadata, PropertyId};
use std::future::Future;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Errors raised by a store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("failed to build connection pool: {0}")]
    BuildPool(#[from] deadpool_postgres::BuildError),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("corrupt {entity} record {id}: {message}")]
    Corrupt {
        entity: &'static str,
        id: i64,
        message: String,
    },
}

/// Storage of [`Metadata`] identity records.
pub trait IdentityStore: Send + Sync {
    fn get(&self, id: i64) -> impl Future<Output = Result<Option<Metadata>, StoreError>> + Send;

    /// Persist a new record, returning its assigned id.
    fn insert(&self, metadata: &Metadata) -> impl Future<Output = Result<i64, StoreError>> + Send;

    fn update(&self, metadata: &Metadata) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn delete(&self, id: i64) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// The table record with the given name.
    fn find_table(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<Metadata>, StoreError>> + Send;

    /// Child records (columns and indexes) of `parent` with the given name.
    fn find_child(
        &self,
        parent: &PropertyId,
        name: &str,
    ) -> impl Future<Output = Result<Vec<Metadata>, StoreError>> + Send;

    /// The table record for `table` followed by all of its children.
    fn list_for_table(
        &self,
        table: &PropertyId,
    ) -> impl Future<Output = Result<Vec<Metadata>, StoreError>> + Send;
}

/// Storage of migrations and their steps.
pub trait MigrationStore: Send + Sync {
    /// Persist a migration header and its steps, returning the migration with
    /// ids filled in.
    fn create_migration(
        &self,
        migration: Migration,
    ) -> impl Future<Output = Result<Migration, StoreError>> + Send;

    /// A migration with its steps, in execution order.
    fn get_migration(
        &self,
        id: i64,
    ) -> impl Future<Output = Result<Option<Migration>, StoreError>> + Send;

    /// The migration of `project` with the greatest version timestamp.
    fn latest_migration(
        &self,
        project: &str,
    ) -> impl Future<Output = Result<Option<Migration>, StoreError>> + Send;

    fn find_version(
        &self,
        project: &str,
        version: &str,
    ) -> impl Future<Output = Result<Option<Migration>, StoreError>> + Send;

    fn count(&self, project: &str) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Migration headers of `project`, oldest version first.
    fn list(
        &self,
        project: &str,
    ) -> impl Future<Output = Result<Vec<Migration>, StoreError>> + Send;

    /// Migration headers in the given status, across all projects.
    fn with_status(
        &self,
        status: MigrationStatus,
    ) -> impl Future<Output = Result<Vec<Migration>, StoreError>> + Send;

    fn update_migration_status(
        &self,
        id: i64,
        status: MigrationStatus,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Persist a step's status and output.
    fn update_step(&self, step: &Step) -> impl Future<Output = Result<(), StoreError>> + Send;
}
