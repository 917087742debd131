//! Schema migrations for MySQL, keyed by stable identity.
//!
//! keel compares a desired schema snapshot against the live one, matching
//! tables, columns and indexes by [`PropertyId`](keel_schema::PropertyId)
//! rather than by name. The result is an ordered list of statements with
//! their inverses, persisted as a [`Migration`] that has to be approved
//! before [`MigrationRunner`] will run it.
//!
//! ```ignore
//! let plan = Planner::new(&store, database_id).plan(desired, actual).await?;
//! let request = plan.into_request(database_id, "shop", "v2", Utc::now(), "add address");
//! let migration = new_migration(&store, &store, request).await?;
//! approve(&store, migration.id).await?;
//!
//! let runner = MigrationRunner::new(&store, &store, Arc::new(DirectExecutor::from_url(url)?));
//! runner.run(&ExecOptions::new(migration.id)).await?;
//! ```

pub mod diff;
mod error;
pub mod exec;
pub mod executor;
pub mod identity;
pub mod logging;
pub mod migration;
pub mod order;
pub mod plan;
mod sql;
pub mod store;
mod traced;

pub use diff::{Change, Diff, Operation, SchemaDiff, TableDiff, diff_tables};
pub use error::Error;
pub use exec::{ExecError, ExecOptions, MigrationRunner};
pub use executor::{
    DirectExecutor, ExecutorError, OnlineSchemaChangeExecutor, PrintExecutor, StatementExecutor,
};
pub use identity::{ValidationError, sync_metadata, validate_tables};
pub use migration::{
    BuildError, Migration, MigrationRequest, MigrationStatus, Step, StepStatus, approve,
    new_migration,
};
pub use order::{OrderError, order_schema_diff};
pub use plan::{Plan, PlannedOp, Planner, StaticReader, TableReader};
pub use store::{IdentityStore, MemoryStore, MigrationStore, PostgresStore, StoreError};

pub use keel_schema as schema;

/// Result type for keel operations.
pub type Result<T> = std::result::Result<T, Error>;
