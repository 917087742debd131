use super::*;
use crate::sql::*;

fn dogs() -> Table {
    Table::new("t-dogs", "dogs")
        .with_column(Column::new("c-id", "id", "int").size(&[11]).auto_increment())
        .with_column(
            Column::new("c-name", "name", "varchar")
                .size(&[255])
                .collation("utf8mb4_bin")
                .default_value(ColumnDefault::Value("rex".into())),
        )
        .with_primary_key(Index::primary("pk-dogs", &["id"]))
        .with_index(Index::secondary("i-name", "idx_name", &["name"]).unique())
}

#[test]
fn test_children_are_parented_to_table() {
    let table = dogs();
    for meta in table.all_metadata().into_iter().skip(1) {
        assert_eq!(meta.parent_id.as_str(), "t-dogs", "{:?}", meta);
    }
    assert!(table.metadata.parent_id.is_empty());
}

#[test]
fn test_all_metadata_order() {
    let table = dogs();
    let kinds: Vec<EntityKind> = table.all_metadata().iter().map(|m| m.kind).collect();
    assert_eq!(
        kinds,
        vec![
            EntityKind::Table,
            EntityKind::Column,
            EntityKind::Column,
            EntityKind::PrimaryKey,
            EntityKind::Index,
        ]
    );
}

#[test]
fn test_entity_kind_parse_roundtrip_names() {
    assert_eq!(EntityKind::parse("primary_key"), Some(EntityKind::PrimaryKey));
    assert_eq!(EntityKind::parse("column"), Some(EntityKind::Column));
    assert_eq!(EntityKind::parse("view"), None);
}

#[test]
fn test_primary_key_uses_reserved_name() {
    let pk = Index::primary("pk", &["a", "b"]);
    assert_eq!(pk.name, PRIMARY_KEY_NAME);
    assert!(pk.is_primary && pk.is_unique);
    assert!(pk.references("b"));
    assert!(!pk.references("c"));
}

#[test]
fn test_new_metadata_is_provisional() {
    let col = Column::new("c-1", "a", "int");
    assert!(!col.metadata.is_persisted());
    assert!(!col.metadata.exists);
}

#[test]
fn test_quote_ident_escapes_backticks() {
    assert_eq!(quote_ident("weird`name"), "`weird``name`");
}

#[test]
fn test_lit_escapes_backslash() {
    assert_eq!(format!("{}", Lit("a\\b")), "'a\\\\b'");
}

#[test]
fn test_column_type_sql() {
    let col = Column::new("c", "price", "decimal").size(&[10, 2]).unsigned();
    assert_eq!(column_type_sql(&col), "decimal(10,2) unsigned");

    let col = Column::new("c", "body", "text");
    assert_eq!(column_type_sql(&col), "text");
}

#[test]
fn test_column_definition_default_null() {
    let col = Column::new("c", "note", "varchar")
        .size(&[64])
        .nullable()
        .default_value(ColumnDefault::Null);
    insta::assert_snapshot!(column_definition_sql(&col), @"`note` varchar(64) DEFAULT NULL");
}

#[test]
fn test_column_definition_timestamp_default_unquoted() {
    let col = Column::new("c", "created_at", "timestamp")
        .default_value(ColumnDefault::Value("CURRENT_TIMESTAMP".into()));
    insta::assert_snapshot!(
        column_definition_sql(&col),
        @"`created_at` timestamp NOT NULL DEFAULT CURRENT_TIMESTAMP"
    );
}

#[test]
fn test_index_definition_with_prefix_length() {
    let idx = Index::secondary("i", "idx_title", &[])
        .with_columns(vec![IndexColumn::prefix("title", 32), IndexColumn::new("id")]);
    insta::assert_snapshot!(index_definition_sql(&idx), @"KEY `idx_title` (`title`(32), `id`)");
}

#[test]
fn test_create_table_sql() {
    let sql = create_table_sql(&dogs());
    let expected = "CREATE TABLE `dogs` (\n  \
        `id` int(11) NOT NULL AUTO_INCREMENT,\n  \
        `name` varchar(255) COLLATE utf8mb4_bin NOT NULL DEFAULT 'rex',\n  \
        PRIMARY KEY (`id`),\n  \
        UNIQUE KEY `idx_name` (`name`)\n) ENGINE=InnoDB";
    assert_eq!(sql, expected);
}

#[test]
fn test_table_options_sql() {
    let mut table = Table::new("t", "t");
    table.charset = Some("utf8mb4".into());
    table.row_format = Some("DYNAMIC".into());
    table.auto_increment = Some(42);
    insta::assert_snapshot!(
        table_options_sql(&table),
        @"ENGINE=InnoDB AUTO_INCREMENT=42 DEFAULT CHARSET=utf8mb4 ROW_FORMAT=DYNAMIC"
    );
}

#[test]
fn test_drop_table_sql() {
    assert_eq!(drop_table_sql("dogs"), "DROP TABLE `dogs`");
}

#[test]
fn test_sync_metadata_names() {
    let mut table = dogs();
    table.name = "hounds".into();
    table.columns[1].name = "title".into();
    table.sync_metadata_names();
    assert_eq!(table.metadata.name, "hounds");
    assert_eq!(table.columns[1].metadata.name, "title");
    assert_eq!(table.secondary_indexes[0].metadata.name, "idx_name");
}
