use chrono::{DateTime, TimeZone, Utc};
use keel::executor::BoxFuture;
use keel::schema::{Column, ColumnDefault, Index, Table};
use keel::{
    BuildError, ExecOptions, ExecutorError, IdentityStore, MemoryStore, MigrationRunner,
    MigrationStatus, MigrationStore, Operation, Plan, Planner, StatementExecutor, StepStatus,
    approve, new_migration,
};
use std::sync::{Arc, Mutex};

const PROJECT: &str = "kennel";

fn ts(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, day, 8, 30, 0).unwrap()
}

fn dogs() -> Table {
    Table::new("t-dogs", "dogs")
        .with_column(Column::new("c-id", "id", "int").size(&[11]).auto_increment())
        .with_primary_key(Index::primary("pk-dogs", &["id"]))
}

fn dogs_with_address() -> Table {
    dogs().with_column(
        Column::new("c-address", "address", "varchar")
            .size(&[255])
            .nullable()
            .default_value(ColumnDefault::Null),
    )
}

/// Keeps every statement it is handed.
#[derive(Default)]
struct Recorder {
    statements: Mutex<Vec<String>>,
}

impl Recorder {
    fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }
}

impl StatementExecutor for Recorder {
    fn name(&self) -> &'static str {
        "recorder"
    }

    fn execute<'a>(
        &'a self,
        statement: &'a str,
        _dry_run: bool,
    ) -> BoxFuture<'a, Result<String, ExecutorError>> {
        self.statements.lock().unwrap().push(statement.to_string());
        Box::pin(std::future::ready(Ok("0 rows affected".to_string())))
    }
}

/// Records the migration's persisted status at the moment each statement
/// runs.
struct StatusWatcher {
    store: Arc<MemoryStore>,
    migration_id: i64,
    seen: Mutex<Vec<MigrationStatus>>,
}

impl StatementExecutor for StatusWatcher {
    fn name(&self) -> &'static str {
        "watcher"
    }

    fn execute<'a>(
        &'a self,
        _statement: &'a str,
        _dry_run: bool,
    ) -> BoxFuture<'a, Result<String, ExecutorError>> {
        Box::pin(async move {
            let migration = self.store.get_migration(self.migration_id).await.unwrap();
            if let Some(migration) = migration {
                self.seen.lock().unwrap().push(migration.status);
            }
            Ok::<_, ExecutorError>("1 rows affected".to_string())
        })
    }
}

#[tokio::test]
async fn test_add_column_end_to_end() {
    let store = Arc::new(MemoryStore::new());

    let plan = Planner::new(&*store, 1)
        .plan(vec![dogs_with_address()], vec![dogs()])
        .await
        .unwrap();
    assert_eq!(plan.diff.len(), 1);
    let diff = plan.diff.iter().next().unwrap();
    assert_eq!(diff.operation(), Operation::Add);
    assert_eq!(diff.property(), "address");

    assert_eq!(plan.forward.len(), 1);
    assert_eq!(
        plan.forward[0].statement,
        "ALTER TABLE `dogs` ADD COLUMN `address` varchar(255) DEFAULT NULL"
    );
    assert_eq!(
        plan.backward[0].statement,
        "ALTER TABLE `dogs` DROP COLUMN `address`"
    );

    let request = plan.into_request(1, PROJECT, "v1", ts(1), "add address");
    let migration = new_migration(&*store, &*store, request).await.unwrap();
    assert_eq!(migration.status, MigrationStatus::Unapproved);
    assert_eq!(migration.steps.len(), 1);
    let step = &migration.steps[0];
    assert_eq!(step.name, "address");
    assert!(step.forward.contains("ADD COLUMN `address`"));
    assert_eq!(step.backward, "ALTER TABLE `dogs` DROP COLUMN `address`");

    let record = store.get(step.metadata_id).await.unwrap().unwrap();
    assert!(!record.exists);

    approve(&*store, migration.id).await.unwrap();
    assert_eq!(
        store.get_migration(migration.id).await.unwrap().unwrap().status,
        MigrationStatus::Approved
    );

    let watcher = Arc::new(StatusWatcher {
        store: store.clone(),
        migration_id: migration.id,
        seen: Mutex::new(Vec::new()),
    });
    let runner = MigrationRunner::new(&*store, &*store, watcher.clone());
    let done = runner.run(&ExecOptions::new(migration.id)).await.unwrap();

    assert_eq!(*watcher.seen.lock().unwrap(), vec![MigrationStatus::InProgress]);
    assert_eq!(done.status, MigrationStatus::Complete);
    assert_eq!(done.steps[0].status, StepStatus::Complete);
    assert_eq!(done.steps[0].output, "1 rows affected");
    assert!(store.get(step.metadata_id).await.unwrap().unwrap().exists);

    let replan = Planner::new(&*store, 1)
        .plan(vec![dogs_with_address()], vec![dogs_with_address()])
        .await
        .unwrap();
    assert!(replan.is_empty());
    let err = new_migration(
        &*store,
        &*store,
        replan.into_request(1, PROJECT, "v2", ts(2), "nothing"),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, BuildError::Empty { .. }));
}

async fn drop_address(store: &MemoryStore) -> Plan {
    Planner::new(store, 1)
        .plan(vec![dogs()], vec![dogs_with_address()])
        .await
        .unwrap()
}

#[tokio::test]
async fn test_drop_column_needs_allow_destructive() {
    let store = MemoryStore::new();

    let plan = Planner::new(&store, 1)
        .plan(vec![dogs_with_address()], vec![dogs()])
        .await
        .unwrap();
    let first = new_migration(&store, &store, plan.into_request(1, PROJECT, "v1", ts(1), "add"))
        .await
        .unwrap();
    approve(&store, first.id).await.unwrap();
    let direct = Arc::new(Recorder::default());
    let runner = MigrationRunner::new(&store, &store, direct.clone());
    runner.run(&ExecOptions::new(first.id)).await.unwrap();
    let address_id = first.steps[0].metadata_id;

    let plan = drop_address(&store).await;
    assert_eq!(plan.forward[0].operation, Operation::Delete);
    assert_eq!(plan.forward[0].metadata.id, address_id);
    let second = new_migration(&store, &store, plan.into_request(1, PROJECT, "v2", ts(2), "drop"))
        .await
        .unwrap();
    approve(&store, second.id).await.unwrap();

    let done = runner.run(&ExecOptions::new(second.id)).await.unwrap();
    assert_eq!(done.status, MigrationStatus::Complete);
    assert_eq!(done.steps[0].status, StepStatus::Skipped);
    assert_eq!(direct.statements().len(), 1);
    assert!(store.get(address_id).await.unwrap().unwrap().exists);

    let plan = drop_address(&store).await;
    let third = new_migration(&store, &store, plan.into_request(1, PROJECT, "v3", ts(3), "drop"))
        .await
        .unwrap();
    approve(&store, third.id).await.unwrap();
    let options = ExecOptions {
        allow_destructive: true,
        ..ExecOptions::new(third.id)
    };
    runner.run(&options).await.unwrap();
    assert_eq!(
        direct.statements().last().map(String::as_str),
        Some("ALTER TABLE `dogs` DROP COLUMN `address`")
    );
    assert!(store.get(address_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_versions_must_move_forward() {
    let store = MemoryStore::new();
    let plan = Planner::new(&store, 1)
        .plan(vec![dogs_with_address()], vec![dogs()])
        .await
        .unwrap();

    new_migration(
        &store,
        &store,
        plan.clone().into_request(1, PROJECT, "v2", ts(2), "add"),
    )
    .await
    .unwrap();

    let duplicate = new_migration(
        &store,
        &store,
        plan.clone().into_request(1, PROJECT, "v2", ts(3), "again"),
    )
    .await
    .unwrap_err();
    assert!(matches!(duplicate, BuildError::DuplicateVersion { .. }));

    let stale = new_migration(
        &store,
        &store,
        plan.clone().into_request(1, PROJECT, "v1", ts(1), "older"),
    )
    .await
    .unwrap_err();
    assert!(matches!(stale, BuildError::StaleVersion { .. }));

    let mut rollback = plan.into_request(1, PROJECT, "v1", ts(1), "rollback");
    rollback.rollback = true;
    new_migration(&store, &store, rollback).await.unwrap();
    assert_eq!(store.count(PROJECT).await.unwrap(), 2);
}

#[tokio::test]
async fn test_only_latest_migration_runs() {
    let store = MemoryStore::new();
    let plan = Planner::new(&store, 1)
        .plan(vec![dogs_with_address()], vec![dogs()])
        .await
        .unwrap();
    let old = new_migration(
        &store,
        &store,
        plan.clone().into_request(1, PROJECT, "v1", ts(1), "old"),
    )
    .await
    .unwrap();
    let new = new_migration(&store, &store, plan.into_request(1, PROJECT, "v2", ts(2), "new"))
        .await
        .unwrap();
    approve(&store, old.id).await.unwrap();
    approve(&store, new.id).await.unwrap();

    let direct = Arc::new(Recorder::default());
    let runner = MigrationRunner::new(&store, &store, direct.clone());
    assert!(runner.run(&ExecOptions::new(old.id)).await.is_err());
    assert_eq!(
        store.get_migration(old.id).await.unwrap().unwrap().status,
        MigrationStatus::Depreciated
    );
    assert!(direct.statements().is_empty());

    let done = runner.run(&ExecOptions::new(new.id)).await.unwrap();
    assert_eq!(done.status, MigrationStatus::Complete);
    let listed: Vec<MigrationStatus> = store
        .list(PROJECT)
        .await
        .unwrap()
        .iter()
        .map(|m| m.status)
        .collect();
    assert_eq!(
        listed,
        vec![MigrationStatus::Depreciated, MigrationStatus::Complete]
    );
}
