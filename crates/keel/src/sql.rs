//! MySQL statements for individual diffs.

use crate::diff::{Change, ColumnProperty, Diff, SchemaDiff, TableProperty};
use keel_schema::Index;
use keel_schema::sql::{column_definition_sql, create_table_sql, drop_table_sql, index_columns_sql};
use keel_schema::quote_ident;

impl Diff {
    /// The statement that applies this diff.
    pub fn to_sql(&self) -> String {
        let table = quote_ident(&self.table);
        match &self.change {
            Change::AddTable(t) => create_table_sql(t),
            Change::DropTable(t) => drop_table_sql(&t.name),
            Change::AlterTable { property, from, to } => {
                alter_table_sql(&table, *property, from.as_deref(), to.as_deref())
            }
            Change::AddColumn(col) => {
                format!("ALTER TABLE {} ADD COLUMN {}", table, column_definition_sql(col))
            }
            Change::DropColumn(col) => {
                format!("ALTER TABLE {} DROP COLUMN {}", table, quote_ident(&col.name))
            }
            Change::AlterColumn {
                property: ColumnProperty::Name,
                from,
                to,
            } => format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                table,
                quote_ident(&from.name),
                quote_ident(&to.name)
            ),
            Change::AlterColumn { to, .. } => {
                format!("ALTER TABLE {} MODIFY COLUMN {}", table, column_definition_sql(to))
            }
            Change::AddIndex(idx) => format!("ALTER TABLE {} {}", table, add_index_clause(idx)),
            Change::DropIndex(idx) if idx.is_primary => {
                format!("ALTER TABLE {} DROP PRIMARY KEY", table)
            }
            Change::DropIndex(idx) => {
                format!("ALTER TABLE {} DROP INDEX {}", table, quote_ident(&idx.name))
            }
            Change::RenameIndex { from, to } => format!(
                "ALTER TABLE {} RENAME INDEX {} TO {}",
                table,
                quote_ident(&from.name),
                quote_ident(&to.name)
            ),
        }
    }
}

fn add_index_clause(idx: &Index) -> String {
    if idx.is_primary {
        format!("ADD PRIMARY KEY {}", index_columns_sql(idx))
    } else if idx.is_unique {
        format!(
            "ADD UNIQUE INDEX {} {}",
            quote_ident(&idx.name),
            index_columns_sql(idx)
        )
    } else {
        format!("ADD INDEX {} {}", quote_ident(&idx.name), index_columns_sql(idx))
    }
}

/// Table options that can't be unset fall back to the server default.
fn alter_table_sql(
    table: &str,
    property: TableProperty,
    from: Option<&str>,
    to: Option<&str>,
) -> String {
    match property {
        TableProperty::Name => format!(
            "ALTER TABLE {} RENAME TO {}",
            quote_ident(from.unwrap_or_default()),
            quote_ident(to.unwrap_or_default())
        ),
        TableProperty::Engine => {
            format!("ALTER TABLE {} ENGINE={}", table, to.unwrap_or("DEFAULT"))
        }
        TableProperty::CharSet => format!(
            "ALTER TABLE {} DEFAULT CHARACTER SET {}",
            table,
            to.unwrap_or("DEFAULT")
        ),
        TableProperty::Collation => {
            format!("ALTER TABLE {} COLLATE {}", table, to.unwrap_or("DEFAULT"))
        }
        TableProperty::RowFormat => {
            format!("ALTER TABLE {} ROW_FORMAT={}", table, to.unwrap_or("DEFAULT"))
        }
        TableProperty::AutoIncrement => {
            format!("ALTER TABLE {} AUTO_INCREMENT={}", table, to.unwrap_or("1"))
        }
    }
}

impl SchemaDiff {
    /// One statement per diff, in order.
    pub fn to_sql(&self) -> Vec<String> {
        self.iter().map(Diff::to_sql).collect()
    }
}
