//! Snapshot validation and identity synchronization.
//!
//! Before two snapshots are diffed, each is checked for identity problems
//! (missing or duplicated property ids, names that collide) and its metadata
//! is hydrated from the identity store so diffs and steps can refer to stable
//! numeric ids.

use crate::store::{IdentityStore, StoreError};
use keel_schema::{EntityKind, Metadata, PropertyId, Table};
use std::collections::{HashMap, HashSet};

/// A snapshot that can't be diffed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{kind} {name:?} has an empty property id")]
    EmptyPropertyId { kind: EntityKind, name: String },

    #[error("property id {property_id} is used by both {first} and {second}")]
    DuplicatePropertyId {
        property_id: PropertyId,
        first: String,
        second: String,
    },

    #[error("{kind} name {name:?} is used twice in {scope}")]
    DuplicateName {
        kind: EntityKind,
        name: String,
        scope: String,
    },

    #[error("{kind} {name:?} in table {table} is parented to {parent} instead of {expected}")]
    WrongParent {
        kind: EntityKind,
        name: String,
        table: String,
        parent: PropertyId,
        expected: PropertyId,
    },

    #[error("column {table}.{column} has {count} size parameters, at most 2 are allowed")]
    InvalidSize {
        table: String,
        column: String,
        count: usize,
    },

    #[error("index {table}.{index} references unknown column {column}")]
    UnknownIndexColumn {
        table: String,
        index: String,
        column: String,
    },

    #[error("{kind} {name:?} was {previous} and is now {current}; property ids must not change")]
    IdentityChanged {
        kind: EntityKind,
        name: String,
        previous: PropertyId,
        current: PropertyId,
    },
}

/// Check a snapshot for identity and structural problems.
pub fn validate_tables(tables: &[Table]) -> Result<(), ValidationError> {
    let mut owners: HashMap<&PropertyId, String> = HashMap::new();
    let mut table_names: HashSet<&str> = HashSet::new();

    for table in tables {
        for meta in table.all_metadata() {
            if meta.property_id.is_empty() {
                return Err(ValidationError::EmptyPropertyId {
                    kind: meta.kind,
                    name: meta.name.clone(),
                });
            }
            let label = if meta.kind == EntityKind::Table {
                format!("table {}", meta.name)
            } else {
                format!("{} {}.{}", meta.kind, table.name, meta.name)
            };
            if let Some(first) = owners.insert(&meta.property_id, label.clone()) {
                return Err(ValidationError::DuplicatePropertyId {
                    property_id: meta.property_id.clone(),
                    first,
                    second: label,
                });
            }
            if meta.kind != EntityKind::Table && &meta.parent_id != table.property_id() {
                return Err(ValidationError::WrongParent {
                    kind: meta.kind,
                    name: meta.name.clone(),
                    table: table.name.clone(),
                    parent: meta.parent_id.clone(),
                    expected: table.property_id().clone(),
                });
            }
        }

        if !table_names.insert(&table.name) {
            return Err(ValidationError::DuplicateName {
                kind: EntityKind::Table,
                name: table.name.clone(),
                scope: "the schema".to_string(),
            });
        }
        validate_table(table)?;
    }

    Ok(())
}

fn validate_table(table: &Table) -> Result<(), ValidationError> {
    let scope = || format!("table {}", table.name);

    let mut columns: HashSet<&str> = HashSet::new();
    for col in &table.columns {
        if !columns.insert(&col.name) {
            return Err(ValidationError::DuplicateName {
                kind: EntityKind::Column,
                name: col.name.clone(),
                scope: scope(),
            });
        }
        if col.size.len() > 2 {
            return Err(ValidationError::InvalidSize {
                table: table.name.clone(),
                column: col.name.clone(),
                count: col.size.len(),
            });
        }
    }

    let mut indexes: HashSet<&str> = HashSet::new();
    for idx in table.indexes() {
        if !indexes.insert(&idx.name) {
            return Err(ValidationError::DuplicateName {
                kind: idx.metadata.kind,
                name: idx.name.clone(),
                scope: scope(),
            });
        }
        if let Some(missing) = idx.column_names().find(|c| !columns.contains(c)) {
            return Err(ValidationError::UnknownIndexColumn {
                table: table.name.clone(),
                index: idx.name.clone(),
                column: missing.to_string(),
            });
        }
    }

    Ok(())
}

/// Compare two reads of the same source: an object that kept its name and
/// kind but whose property id changed, while the old id vanished, has had its
/// identity silently reassigned.
pub fn check_identity_stable(previous: &[Table], current: &[Table]) -> Result<(), ValidationError> {
    let current_tables: HashSet<&PropertyId> = current.iter().map(|t| t.property_id()).collect();

    for before in previous {
        if let Some(after) = current.iter().find(|t| t.name == before.name) {
            if after.property_id() != before.property_id()
                && !current_tables.contains(before.property_id())
            {
                return Err(ValidationError::IdentityChanged {
                    kind: EntityKind::Table,
                    name: before.name.clone(),
                    previous: before.property_id().clone(),
                    current: after.property_id().clone(),
                });
            }
        }

        let Some(after) = current.iter().find(|t| t.property_id() == before.property_id()) else {
            continue;
        };
        let after_children = named_children(after);
        let after_ids: HashSet<&PropertyId> = after_children.iter().map(|(_, _, id)| *id).collect();

        for (kind, name, old_id) in named_children(before) {
            let reused = after_children
                .iter()
                .find(|(k, n, _)| *k == kind && *n == name);
            if let Some((_, _, new_id)) = reused {
                if *new_id != old_id && !after_ids.contains(old_id) {
                    return Err(ValidationError::IdentityChanged {
                        kind,
                        name: name.to_string(),
                        previous: old_id.clone(),
                        current: (*new_id).clone(),
                    });
                }
            }
        }
    }

    Ok(())
}

/// Kind, current name and property id of every column and index.
fn named_children(table: &Table) -> Vec<(EntityKind, &str, &PropertyId)> {
    let columns = table
        .columns
        .iter()
        .map(|c| (c.metadata.kind, c.name.as_str(), c.property_id()));
    let indexes = table
        .indexes()
        .map(|i| (i.metadata.kind, i.name.as_str(), i.property_id()));
    columns.chain(indexes).collect()
}

/// Errors from [`sync_metadata`].
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Hydrate every metadata record in `tables` from the identity store.
///
/// Known objects get their numeric id and existence flag. Unknown objects
/// stay provisional (id 0, not existing) and are stamped with
/// `database_id`. An unknown object whose name is held in the store by a
/// live record with a different property id, where that property id no
/// longer appears in the snapshot, is reported as an identity change.
pub async fn sync_metadata<I: IdentityStore>(
    identity: &I,
    database_id: i64,
    tables: &mut [Table],
) -> Result<(), SyncError> {
    let snapshot_ids: HashSet<PropertyId> = tables
        .iter()
        .flat_map(|t| t.all_metadata())
        .map(|m| m.property_id.clone())
        .collect();

    for table in tables.iter_mut() {
        table.sync_metadata_names();
        let table_id = table.property_id().clone();
        let known: HashMap<PropertyId, Metadata> = identity
            .list_for_table(&table_id)
            .await?
            .into_iter()
            .map(|m| (m.property_id.clone(), m))
            .collect();

        for meta in table.all_metadata_mut() {
            if let Some(record) = known.get(&meta.property_id) {
                meta.id = record.id;
                meta.database_id = record.database_id;
                meta.exists = record.exists;
                continue;
            }

            let holders: Vec<Metadata> = if meta.kind == EntityKind::Table {
                identity.find_table(&meta.name).await?.into_iter().collect()
            } else {
                identity.find_child(&table_id, &meta.name).await?
            };
            let stolen = holders.into_iter().find(|m| {
                m.kind == meta.kind
                    && m.exists
                    && m.property_id != meta.property_id
                    && !snapshot_ids.contains(&m.property_id)
            });
            if let Some(previous) = stolen {
                return Err(ValidationError::IdentityChanged {
                    kind: meta.kind,
                    name: meta.name.clone(),
                    previous: previous.property_id,
                    current: meta.property_id.clone(),
                }
                .into());
            }

            meta.id = 0;
            meta.database_id = database_id;
            meta.exists = false;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use keel_schema::{Column, Index};

    fn dogs() -> Table {
        Table::new("t-dogs", "dogs")
            .with_column(Column::new("c-id", "id", "int").auto_increment())
            .with_column(Column::new("c-name", "name", "varchar").size(&[64]))
            .with_primary_key(Index::primary("pk-dogs", &["id"]))
    }

    #[test]
    fn test_valid_snapshot() {
        validate_tables(&[dogs(), Table::new("t-cats", "cats")]).unwrap();
    }

    #[test]
    fn test_empty_property_id() {
        let table = dogs().with_column(Column::new("", "age", "int"));
        assert_eq!(
            validate_tables(&[table]),
            Err(ValidationError::EmptyPropertyId {
                kind: EntityKind::Column,
                name: "age".into()
            })
        );
    }

    #[test]
    fn test_duplicate_property_id_across_tables() {
        let cats = Table::new("t-cats", "cats").with_column(Column::new("c-id", "id", "int"));
        let err = validate_tables(&[dogs(), cats]).unwrap_err();
        assert!(
            matches!(&err, ValidationError::DuplicatePropertyId { property_id, .. } if property_id.as_str() == "c-id"),
            "{err}"
        );
    }

    #[test]
    fn test_duplicate_names() {
        let table = dogs().with_column(Column::new("c-name2", "name", "text"));
        assert!(matches!(
            validate_tables(&[table]),
            Err(ValidationError::DuplicateName {
                kind: EntityKind::Column,
                ..
            })
        ));

        let err = validate_tables(&[dogs(), Table::new("t-dogs2", "dogs")]).unwrap_err();
        assert!(matches!(err, ValidationError::DuplicateName { kind: EntityKind::Table, .. }));
    }

    #[test]
    fn test_size_arity() {
        let table = dogs().with_column(Column::new("c-x", "x", "decimal").size(&[1, 2, 3]));
        assert!(matches!(
            validate_tables(&[table]),
            Err(ValidationError::InvalidSize { count: 3, .. })
        ));
    }

    #[test]
    fn test_unknown_index_column() {
        let table = dogs().with_index(Index::secondary("i-x", "idx_x", &["nope"]));
        assert!(matches!(
            validate_tables(&[table]),
            Err(ValidationError::UnknownIndexColumn { .. })
        ));
    }

    #[test]
    fn test_wrong_parent() {
        let mut table = dogs();
        table.columns[0].metadata.parent_id = PropertyId::new("t-cats");
        assert!(matches!(
            validate_tables(&[table]),
            Err(ValidationError::WrongParent { .. })
        ));
    }

    #[test]
    fn test_identity_stable_allows_rename() {
        let mut renamed = dogs();
        renamed.name = "hounds".into();
        renamed.columns[1].name = "title".into();
        check_identity_stable(&[dogs()], &[renamed]).unwrap();
    }

    #[test]
    fn test_identity_stable_detects_reassigned_column() {
        let mut changed = dogs();
        changed.columns[1].metadata.property_id = PropertyId::new("c-name-v2");
        let err = check_identity_stable(&[dogs()], &[changed]).unwrap_err();
        assert_eq!(
            err,
            ValidationError::IdentityChanged {
                kind: EntityKind::Column,
                name: "name".into(),
                previous: PropertyId::new("c-name"),
                current: PropertyId::new("c-name-v2"),
            }
        );
    }

    #[test]
    fn test_identity_stable_detects_reassigned_table() {
        let changed = Table::new("t-dogs-v2", "dogs");
        assert!(matches!(
            check_identity_stable(&[dogs()], &[changed]),
            Err(ValidationError::IdentityChanged { kind: EntityKind::Table, .. })
        ));
    }

    async fn seed(store: &MemoryStore, table: &Table) {
        for meta in table.all_metadata() {
            let mut record = meta.clone();
            record.database_id = 7;
            record.exists = true;
            store.insert(&record).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_sync_hydrates_known_and_marks_new_provisional() {
        let store = MemoryStore::new();
        seed(&store, &dogs()).await;

        let mut tables = vec![dogs().with_column(Column::new("c-age", "age", "int"))];
        sync_metadata(&store, 7, &mut tables).await.unwrap();

        let table = &tables[0];
        assert!(table.metadata.is_persisted());
        assert!(table.metadata.exists);
        assert!(table.columns[0].metadata.is_persisted());
        let age = &table.columns[2].metadata;
        assert_eq!(age.id, 0);
        assert_eq!(age.database_id, 7);
        assert!(!age.exists);
    }

    #[tokio::test]
    async fn test_sync_rejects_reassigned_property_id() {
        let store = MemoryStore::new();
        seed(&store, &dogs()).await;

        let mut changed = dogs();
        changed.columns[1].metadata.property_id = PropertyId::new("c-name-v2");
        let err = sync_metadata(&store, 7, &mut [changed]).await.unwrap_err();
        assert!(
            matches!(err, SyncError::Validation(ValidationError::IdentityChanged { .. })),
            "{err}"
        );
    }

    #[tokio::test]
    async fn test_sync_allows_name_reuse_after_rename() {
        let store = MemoryStore::new();
        seed(&store, &dogs()).await;

        let mut table = dogs();
        table.columns[1].name = "title".into();
        let mut tables = vec![table.with_column(Column::new("c-name-new", "name", "text"))];
        sync_metadata(&store, 7, &mut tables).await.unwrap();
        assert_eq!(tables[0].columns[2].metadata.id, 0);
    }
}
