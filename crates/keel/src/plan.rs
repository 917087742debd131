//! Planning: from two snapshots to forward and backward operations.

use crate::diff::{Change, Diff, Operation, SchemaDiff, diff_tables};
use crate::identity::{check_identity_stable, sync_metadata, validate_tables};
use crate::migration::MigrationRequest;
use crate::order::order_schema_diff;
use crate::store::IdentityStore;
use chrono::{DateTime, Utc};
use keel_schema::{Metadata, Table};
use std::future::Future;

/// Failure to produce a snapshot.
#[derive(Debug, thiserror::Error)]
#[error("failed to read tables from {origin}: {message}")]
pub struct ReadError {
    pub origin: String,
    pub message: String,
}

/// Produces a schema snapshot, e.g. from definition files or a live
/// database.
pub trait TableReader: Send + Sync {
    fn read_tables(&self) -> impl Future<Output = Result<Vec<Table>, ReadError>> + Send;
}

/// A reader over tables already in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticReader {
    tables: Vec<Table>,
}

impl StaticReader {
    pub fn new(tables: Vec<Table>) -> Self {
        Self { tables }
    }
}

impl TableReader for StaticReader {
    async fn read_tables(&self) -> Result<Vec<Table>, ReadError> {
        Ok(self.tables.clone())
    }
}

/// One statement the builder will turn into a step.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedOp {
    pub operation: Operation,
    pub table: String,
    /// Name of the target object after the operation.
    pub name: String,
    pub statement: String,
    /// Identity of the target object.
    pub metadata: Metadata,
    /// Identities of the columns and indexes of a whole-table operation.
    pub children: Vec<Metadata>,
}

impl PlannedOp {
    pub fn from_diff(diff: &Diff) -> Self {
        let children = match &diff.change {
            Change::AddTable(t) | Change::DropTable(t) => {
                t.all_metadata().into_iter().skip(1).cloned().collect()
            }
            _ => Vec::new(),
        };
        Self {
            operation: diff.operation(),
            table: diff.table.clone(),
            name: diff.target_name().to_string(),
            statement: diff.to_sql(),
            metadata: diff.metadata.clone(),
            children,
        }
    }
}

/// The outcome of planning.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Ordered diffs turning the actual schema into the desired one.
    pub diff: SchemaDiff,
    pub forward: Vec<PlannedOp>,
    /// `forward[i]` undone, for every `i`.
    pub backward: Vec<PlannedOp>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Package the plan for [`crate::migration::new_migration`].
    pub fn into_request(
        self,
        database_id: i64,
        project: impl Into<String>,
        version: impl Into<String>,
        version_timestamp: DateTime<Utc>,
        description: impl Into<String>,
    ) -> MigrationRequest {
        MigrationRequest {
            database_id,
            project: project.into(),
            version: version.into(),
            version_timestamp,
            description: description.into(),
            forward: self.forward,
            backward: self.backward,
            rollback: false,
            sandbox: false,
        }
    }
}

/// Computes plans against an identity store.
pub struct Planner<'a, I> {
    identity: &'a I,
    database_id: i64,
}

impl<'a, I: IdentityStore> Planner<'a, I> {
    pub fn new(identity: &'a I, database_id: i64) -> Self {
        Self {
            identity,
            database_id,
        }
    }

    /// Validate both snapshots, hydrate their identities, then diff and
    /// order. An object that keeps its name in `desired` but carries a new
    /// property id is rejected rather than diffed.
    pub async fn plan(&self, mut desired: Vec<Table>, mut actual: Vec<Table>) -> crate::Result<Plan> {
        validate_tables(&desired)?;
        validate_tables(&actual)?;
        check_identity_stable(&actual, &desired)?;
        sync_metadata(self.identity, self.database_id, &mut desired).await?;
        sync_metadata(self.identity, self.database_id, &mut actual).await?;

        let diff = order_schema_diff(diff_tables(&desired, &actual, true))?;
        let forward: Vec<PlannedOp> = diff.iter().map(PlannedOp::from_diff).collect();
        let backward: Vec<PlannedOp> = diff
            .iter()
            .map(|d| PlannedOp::from_diff(&d.invert()))
            .collect();

        tracing::info!(
            tables = diff.table_diffs.len(),
            operations = forward.len(),
            "planned schema changes"
        );
        Ok(Plan {
            diff,
            forward,
            backward,
        })
    }

    pub async fn plan_from_readers<D, A>(&self, desired: &D, actual: &A) -> crate::Result<Plan>
    where
        D: TableReader,
        A: TableReader,
    {
        let desired = desired.read_tables().await?;
        let actual = actual.read_tables().await?;
        self.plan(desired, actual).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ValidationError;
    use crate::store::MemoryStore;
    use keel_schema::{Column, Index};

    fn dogs() -> Table {
        Table::new("t-dogs", "dogs")
            .with_column(Column::new("c-id", "id", "int").auto_increment())
            .with_primary_key(Index::primary("pk-dogs", &["id"]))
    }

    #[tokio::test]
    async fn test_plan_new_table_carries_children() {
        let store = MemoryStore::new();
        let plan = Planner::new(&store, 1).plan(vec![dogs()], vec![]).await.unwrap();

        assert_eq!(plan.forward.len(), 1);
        let op = &plan.forward[0];
        assert_eq!(op.operation, Operation::Add);
        assert_eq!(op.name, "dogs");
        assert_eq!(op.children.len(), 2);
        assert_eq!(op.metadata.database_id, 1);
        assert_eq!(plan.backward[0].statement, "DROP TABLE `dogs`");
    }

    #[tokio::test]
    async fn test_plan_identical_snapshots_is_empty() {
        let store = MemoryStore::new();
        let plan = Planner::new(&store, 1)
            .plan(vec![dogs()], vec![dogs()])
            .await
            .unwrap();
        assert!(plan.is_empty());
        assert!(plan.diff.is_empty());
    }

    #[tokio::test]
    async fn test_plan_rejects_invalid_snapshot() {
        let store = MemoryStore::new();
        let broken = dogs().with_index(Index::secondary("i", "idx", &["missing"]));
        let err = Planner::new(&store, 1)
            .plan(vec![broken], vec![dogs()])
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::Validation(_)), "{err}");
    }

    #[tokio::test]
    async fn test_plan_rejects_reassigned_property_id() {
        let store = MemoryStore::new();
        let reassigned = Table::new("t-dogs", "dogs")
            .with_column(Column::new("c-id-2", "id", "int").auto_increment())
            .with_primary_key(Index::primary("pk-dogs", &["id"]));
        let desired = StaticReader::new(vec![reassigned]);
        let actual = StaticReader::new(vec![dogs()]);
        let err = Planner::new(&store, 1)
            .plan_from_readers(&desired, &actual)
            .await
            .unwrap_err();
        assert!(
            matches!(
                &err,
                crate::Error::Validation(ValidationError::IdentityChanged { name, .. }) if name == "id"
            ),
            "{err}"
        );
    }

    #[tokio::test]
    async fn test_plan_from_readers() {
        let store = MemoryStore::new();
        let desired = StaticReader::new(vec![dogs().with_column(Column::new("c-age", "age", "int"))]);
        let actual = StaticReader::new(vec![dogs()]);
        let plan = Planner::new(&store, 1)
            .plan_from_readers(&desired, &actual)
            .await
            .unwrap();
        assert_eq!(plan.forward.len(), 1);
        assert_eq!(plan.forward[0].name, "age");
        assert_eq!(
            plan.backward[0].statement,
            "ALTER TABLE `dogs` DROP COLUMN `age`"
        );
    }
}
