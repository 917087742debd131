//! Schema diffing.
//!
//! Compares a desired snapshot against an actual one and produces the
//! [`Diff`]s that would turn the actual schema into the desired one. Objects
//! are matched by [`PropertyId`], never by name, so a name change shows up as
//! a modification rather than a drop and re-create.

use keel_schema::{Column, EntityKind, Index, Metadata, PropertyId, Table};
use std::collections::HashSet;
use std::fmt;

/// What a diff does to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Add,
    Delete,
    Modify,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Add => "add",
            Operation::Delete => "delete",
            Operation::Modify => "modify",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "add" => Some(Operation::Add),
            "delete" => Some(Operation::Delete),
            "modify" => Some(Operation::Modify),
            _ => None,
        }
    }

    pub fn invert(self) -> Self {
        match self {
            Operation::Add => Operation::Delete,
            Operation::Delete => Operation::Add,
            Operation::Modify => Operation::Modify,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which part of a table a diff touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    /// The table as a whole.
    Table,
    Name,
    Engine,
    CharSet,
    Collation,
    RowFormat,
    AutoIncrement,
    Columns,
    PrimaryKey,
    SecondaryIndexes,
}

/// Scalar table properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableProperty {
    Name,
    Engine,
    CharSet,
    AutoIncrement,
    RowFormat,
    Collation,
}

impl TableProperty {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableProperty::Name => "Name",
            TableProperty::Engine => "Engine",
            TableProperty::CharSet => "CharSet",
            TableProperty::AutoIncrement => "AutoIncrement",
            TableProperty::RowFormat => "RowFormat",
            TableProperty::Collation => "Collation",
        }
    }

    fn field(&self) -> Field {
        match self {
            TableProperty::Name => Field::Name,
            TableProperty::Engine => Field::Engine,
            TableProperty::CharSet => Field::CharSet,
            TableProperty::AutoIncrement => Field::AutoIncrement,
            TableProperty::RowFormat => Field::RowFormat,
            TableProperty::Collation => Field::Collation,
        }
    }
}

/// Column properties, in the order modifications are emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnProperty {
    Name,
    /// Base type and signedness.
    Type,
    Size,
    Nullable,
    AutoIncrement,
    Default,
    Collation,
}

impl ColumnProperty {
    pub const ALL: [ColumnProperty; 7] = [
        ColumnProperty::Name,
        ColumnProperty::Type,
        ColumnProperty::Size,
        ColumnProperty::Nullable,
        ColumnProperty::AutoIncrement,
        ColumnProperty::Default,
        ColumnProperty::Collation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnProperty::Name => "Name",
            ColumnProperty::Type => "Type",
            ColumnProperty::Size => "Size",
            ColumnProperty::Nullable => "Nullable",
            ColumnProperty::AutoIncrement => "AutoIncrement",
            ColumnProperty::Default => "Default",
            ColumnProperty::Collation => "Collation",
        }
    }

    fn differs(&self, a: &Column, b: &Column) -> bool {
        match self {
            ColumnProperty::Name => a.name != b.name,
            ColumnProperty::Type => a.data_type != b.data_type || a.unsigned != b.unsigned,
            ColumnProperty::Size => a.size != b.size,
            ColumnProperty::Nullable => a.nullable != b.nullable,
            ColumnProperty::AutoIncrement => a.auto_increment != b.auto_increment,
            ColumnProperty::Default => a.default != b.default,
            ColumnProperty::Collation => a.collation != b.collation,
        }
    }

    /// Copy this property from `src` into `dst`.
    fn apply(&self, dst: &mut Column, src: &Column) {
        match self {
            ColumnProperty::Name => {
                dst.name = src.name.clone();
                dst.metadata.name = src.name.clone();
            }
            ColumnProperty::Type => {
                dst.data_type = src.data_type.clone();
                dst.unsigned = src.unsigned;
            }
            ColumnProperty::Size => dst.size = src.size.clone(),
            ColumnProperty::Nullable => dst.nullable = src.nullable,
            ColumnProperty::AutoIncrement => dst.auto_increment = src.auto_increment,
            ColumnProperty::Default => dst.default = src.default.clone(),
            ColumnProperty::Collation => dst.collation = src.collation.clone(),
        }
    }
}

/// The change carried by a [`Diff`].
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Create a table with its columns and indexes.
    AddTable(Box<Table>),
    /// Drop an existing table.
    DropTable(Box<Table>),
    /// Change one scalar table property.
    AlterTable {
        property: TableProperty,
        from: Option<String>,
        to: Option<String>,
    },
    /// Add a new column.
    AddColumn(Column),
    /// Drop an existing column.
    DropColumn(Column),
    /// Change one column property.
    ///
    /// `from` is the column before this modification and `to` after it.
    /// Successive modifications of one column chain: each `from` is the
    /// previous `to`.
    AlterColumn {
        property: ColumnProperty,
        from: Column,
        to: Column,
    },
    /// Add an index or primary key.
    AddIndex(Index),
    /// Drop an index or primary key.
    DropIndex(Index),
    /// Rename an index whose definition is otherwise unchanged.
    RenameIndex {
        from: Index,
        to: Index,
    },
}

/// A single schema change.
#[derive(Debug, Clone, PartialEq)]
pub struct Diff {
    /// Name of the table the change applies to, as it is named once every
    /// table-level change has been applied.
    pub table: String,
    /// Identity of the changed object.
    pub metadata: Metadata,
    pub change: Change,
}

impl Diff {
    pub fn operation(&self) -> Operation {
        match &self.change {
            Change::AddTable(_) | Change::AddColumn(_) | Change::AddIndex(_) => Operation::Add,
            Change::DropTable(_) | Change::DropColumn(_) | Change::DropIndex(_) => {
                Operation::Delete
            }
            Change::AlterTable { .. } | Change::AlterColumn { .. } | Change::RenameIndex { .. } => {
                Operation::Modify
            }
        }
    }

    pub fn field(&self) -> Field {
        match &self.change {
            Change::AddTable(_) | Change::DropTable(_) => Field::Table,
            Change::AlterTable { property, .. } => property.field(),
            Change::AddColumn(_) | Change::DropColumn(_) | Change::AlterColumn { .. } => {
                Field::Columns
            }
            Change::AddIndex(idx) | Change::DropIndex(idx) | Change::RenameIndex { to: idx, .. } => {
                if idx.is_primary {
                    Field::PrimaryKey
                } else {
                    Field::SecondaryIndexes
                }
            }
        }
    }

    /// The changed sub-object or property.
    pub fn property(&self) -> &str {
        match &self.change {
            Change::AddTable(t) | Change::DropTable(t) => &t.name,
            Change::AlterTable { property, .. } => property.as_str(),
            Change::AddColumn(c) | Change::DropColumn(c) => &c.name,
            Change::AlterColumn { property, .. } => property.as_str(),
            Change::AddIndex(i) | Change::DropIndex(i) => &i.name,
            Change::RenameIndex { .. } => "Name",
        }
    }

    /// Name of the target object once this diff has been applied.
    pub fn target_name(&self) -> &str {
        match &self.change {
            Change::AddTable(t) | Change::DropTable(t) => &t.name,
            Change::AlterTable {
                property: TableProperty::Name,
                to: Some(name),
                ..
            } => name,
            Change::AlterTable { .. } => &self.table,
            Change::AddColumn(c) | Change::DropColumn(c) => &c.name,
            Change::AlterColumn { to, .. } => &to.name,
            Change::AddIndex(i) | Change::DropIndex(i) => &i.name,
            Change::RenameIndex { to, .. } => &to.name,
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.metadata.kind
    }

    pub fn is_column(&self) -> bool {
        matches!(
            self.change,
            Change::AddColumn(_) | Change::DropColumn(_) | Change::AlterColumn { .. }
        )
    }

    pub fn is_index(&self) -> bool {
        matches!(
            self.change,
            Change::AddIndex(_) | Change::DropIndex(_) | Change::RenameIndex { .. }
        )
    }

    /// Column names this diff touches: both the old and the new name for a
    /// modification, and every referenced column for an index.
    pub fn column_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = match &self.change {
            Change::AddColumn(c) | Change::DropColumn(c) => vec![c.name.as_str()],
            Change::AlterColumn { from, to, .. } => vec![from.name.as_str(), to.name.as_str()],
            Change::AddIndex(i) | Change::DropIndex(i) => i.column_names().collect(),
            Change::RenameIndex { from, to } => {
                from.column_names().chain(to.column_names()).collect()
            }
            _ => Vec::new(),
        };
        names.sort_unstable();
        names.dedup();
        names
    }

    /// The diff that undoes this one.
    pub fn invert(&self) -> Diff {
        let change = match &self.change {
            Change::AddTable(t) => Change::DropTable(t.clone()),
            Change::DropTable(t) => Change::AddTable(t.clone()),
            Change::AlterTable { property, from, to } => Change::AlterTable {
                property: *property,
                from: to.clone(),
                to: from.clone(),
            },
            Change::AddColumn(c) => Change::DropColumn(c.clone()),
            Change::DropColumn(c) => Change::AddColumn(c.clone()),
            Change::AlterColumn { property, from, to } => Change::AlterColumn {
                property: *property,
                from: to.clone(),
                to: from.clone(),
            },
            Change::AddIndex(i) => Change::DropIndex(i.clone()),
            Change::DropIndex(i) => Change::AddIndex(i.clone()),
            Change::RenameIndex { from, to } => Change::RenameIndex {
                from: to.clone(),
                to: from.clone(),
            },
        };
        Diff {
            table: self.table.clone(),
            metadata: self.metadata.clone(),
            change,
        }
    }
}

impl fmt::Display for Diff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.change {
            Change::AddTable(_) => write!(f, "+ table {}", self.table),
            Change::DropTable(_) => write!(f, "- table {}", self.table),
            Change::AlterTable { property, from, to } => write!(
                f,
                "~ {}.{}: {} -> {}",
                self.table,
                property.as_str(),
                from.as_deref().unwrap_or("(none)"),
                to.as_deref().unwrap_or("(none)")
            ),
            Change::AddColumn(c) => write!(f, "+ column {}.{}", self.table, c.name),
            Change::DropColumn(c) => write!(f, "- column {}.{}", self.table, c.name),
            Change::AlterColumn { property, to, .. } => {
                write!(f, "~ column {}.{} {}", self.table, to.name, property.as_str())
            }
            Change::AddIndex(i) => write!(f, "+ index {}.{}", self.table, i.name),
            Change::DropIndex(i) => write!(f, "- index {}.{}", self.table, i.name),
            Change::RenameIndex { from, to } => {
                write!(f, "~ index {}.{} -> {}", self.table, from.name, to.name)
            }
        }
    }
}

/// All diffs for one table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDiff {
    pub table: String,
    pub table_id: PropertyId,
    pub diffs: Vec<Diff>,
}

/// The diffs for a whole schema, grouped by table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaDiff {
    pub table_diffs: Vec<TableDiff>,
}

impl SchemaDiff {
    pub fn is_empty(&self) -> bool {
        self.table_diffs.iter().all(|t| t.diffs.is_empty())
    }

    pub fn len(&self) -> usize {
        self.table_diffs.iter().map(|t| t.diffs.len()).sum()
    }

    /// Every diff, table by table.
    pub fn iter(&self) -> impl Iterator<Item = &Diff> {
        self.table_diffs.iter().flat_map(|t| t.diffs.iter())
    }

    /// The same diffs, each inverted, in the same order.
    pub fn invert(&self) -> SchemaDiff {
        SchemaDiff {
            table_diffs: self
                .table_diffs
                .iter()
                .map(|t| TableDiff {
                    table: t.table.clone(),
                    table_id: t.table_id.clone(),
                    diffs: t.diffs.iter().map(Diff::invert).collect(),
                })
                .collect(),
        }
    }
}

impl fmt::Display for SchemaDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return writeln!(f, "No changes detected.");
        }
        for table in &self.table_diffs {
            writeln!(f, "{}:", table.table)?;
            for diff in &table.diffs {
                writeln!(f, "  {}", diff)?;
            }
        }
        Ok(())
    }
}

/// Compute the diffs that turn `actual` into `desired`.
///
/// With `forward` unset the roles are swapped and the result turns `desired`
/// back into `actual`.
pub fn diff_tables(desired: &[Table], actual: &[Table], forward: bool) -> SchemaDiff {
    let (desired, actual) = if forward {
        (desired, actual)
    } else {
        (actual, desired)
    };

    let mut table_diffs = Vec::new();

    for want in desired {
        let have = actual.iter().find(|t| t.property_id() == want.property_id());
        let diffs = match have {
            Some(have) => diff_table(want, have),
            None => vec![Diff {
                table: want.name.clone(),
                metadata: want.metadata.clone(),
                change: Change::AddTable(Box::new(want.clone())),
            }],
        };
        if !diffs.is_empty() {
            table_diffs.push(TableDiff {
                table: want.name.clone(),
                table_id: want.property_id().clone(),
                diffs,
            });
        }
    }

    let desired_ids: HashSet<&PropertyId> = desired.iter().map(|t| t.property_id()).collect();
    for have in actual {
        if !desired_ids.contains(have.property_id()) {
            table_diffs.push(TableDiff {
                table: have.name.clone(),
                table_id: have.property_id().clone(),
                diffs: vec![Diff {
                    table: have.name.clone(),
                    metadata: have.metadata.clone(),
                    change: Change::DropTable(Box::new(have.clone())),
                }],
            });
        }
    }

    SchemaDiff { table_diffs }
}

/// Diffs between two versions of the same table.
///
/// Emitted in this order: table properties, column additions, column
/// modifications and drops in column order, AUTO_INCREMENT releases, index
/// changes, AUTO_INCREMENT restores.
pub fn diff_table(want: &Table, have: &Table) -> Vec<Diff> {
    let mut diffs = Vec::new();
    let table = want.name.clone();
    let alter = |property: TableProperty, from: Option<String>, to: Option<String>| Diff {
        table: table.clone(),
        metadata: want.metadata.clone(),
        change: Change::AlterTable { property, from, to },
    };

    if want.name != have.name {
        diffs.push(alter(
            TableProperty::Name,
            Some(have.name.clone()),
            Some(want.name.clone()),
        ));
    }
    if want.engine != have.engine {
        diffs.push(alter(
            TableProperty::Engine,
            Some(have.engine.clone()),
            Some(want.engine.clone()),
        ));
    }
    if want.charset != have.charset {
        diffs.push(alter(
            TableProperty::CharSet,
            have.charset.clone(),
            want.charset.clone(),
        ));
    }
    if want.auto_increment.is_some() && want.auto_increment != have.auto_increment {
        diffs.push(alter(
            TableProperty::AutoIncrement,
            have.auto_increment.map(|v| v.to_string()),
            want.auto_increment.map(|v| v.to_string()),
        ));
    }
    if want.row_format != have.row_format {
        diffs.push(alter(
            TableProperty::RowFormat,
            have.row_format.clone(),
            want.row_format.clone(),
        ));
    }
    if want.collation != have.collation {
        diffs.push(alter(
            TableProperty::Collation,
            have.collation.clone(),
            want.collation.clone(),
        ));
    }

    let have_columns = have.columns_by_property();
    let want_columns = want.columns_by_property();

    for col in &want.columns {
        if !have_columns.contains_key(col.property_id()) {
            diffs.push(Diff {
                table: table.clone(),
                metadata: col.metadata.clone(),
                change: Change::AddColumn(col.clone()),
            });
        }
    }

    for col in &have.columns {
        match want_columns.get(col.property_id()).copied() {
            Some(target) => diffs.extend(diff_column(&table, target, col)),
            None => diffs.push(Diff {
                table: table.clone(),
                metadata: col.metadata.clone(),
                change: Change::DropColumn(col.clone()),
            }),
        }
    }

    let mut index_diffs = Vec::new();
    let mut rebuilt: Vec<(&Index, &Index)> = Vec::new();
    let have_indexes = have.indexes_by_property();
    let want_indexes = want.indexes_by_property();

    for idx in have.indexes() {
        match want_indexes.get(idx.property_id()).copied() {
            None => index_diffs.push(Diff {
                table: table.clone(),
                metadata: idx.metadata.clone(),
                change: Change::DropIndex(idx.clone()),
            }),
            Some(target) if index_needs_rebuild(target, want, idx, have) => {
                rebuilt.push((idx, target));
                index_diffs.push(Diff {
                    table: table.clone(),
                    metadata: idx.metadata.clone(),
                    change: Change::DropIndex(idx.clone()),
                });
                index_diffs.push(Diff {
                    table: table.clone(),
                    metadata: target.metadata.clone(),
                    change: Change::AddIndex(target.clone()),
                });
            }
            Some(target) if target.name != idx.name => index_diffs.push(Diff {
                table: table.clone(),
                metadata: target.metadata.clone(),
                change: Change::RenameIndex {
                    from: idx.clone(),
                    to: target.clone(),
                },
            }),
            Some(_) => {}
        }
    }

    for idx in want.indexes() {
        if !have_indexes.contains_key(idx.property_id()) {
            index_diffs.push(Diff {
                table: table.clone(),
                metadata: idx.metadata.clone(),
                change: Change::AddIndex(idx.clone()),
            });
        }
    }

    let (releases, restores) = auto_increment_brackets(&table, want, have, &rebuilt);
    diffs.extend(releases);
    diffs.extend(index_diffs);
    diffs.extend(restores);
    diffs
}

/// Index columns identified by the property id of the column they name, so
/// that renaming a column doesn't count as a change to its indexes.
fn index_signature<'a>(idx: &'a Index, table: &'a Table) -> Vec<(&'a str, Option<u32>)> {
    idx.columns
        .iter()
        .map(|ic| match table.column(&ic.name) {
            Some(col) => (col.property_id().as_str(), ic.length),
            None => (ic.name.as_str(), ic.length),
        })
        .collect()
}

fn index_needs_rebuild(want: &Index, want_table: &Table, have: &Index, have_table: &Table) -> bool {
    want.is_unique != have.is_unique
        || want.is_primary != have.is_primary
        || index_signature(want, want_table) != index_signature(have, have_table)
}

/// Cumulative modifications turning `have` into `want`.
fn diff_column(table: &str, want: &Column, have: &Column) -> Vec<Diff> {
    let mut diffs = Vec::new();
    let mut current = have.clone();
    for property in ColumnProperty::ALL {
        if !property.differs(&current, want) {
            continue;
        }
        let mut next = current.clone();
        property.apply(&mut next, want);
        diffs.push(Diff {
            table: table.to_string(),
            metadata: want.metadata.clone(),
            change: Change::AlterColumn {
                property,
                from: current,
                to: next.clone(),
            },
        });
        current = next;
    }
    diffs
}

/// An index over an AUTO_INCREMENT column can't be dropped while the column
/// keeps the attribute. For every such column covered by either definition
/// of a rebuilt index, emit a modification clearing AUTO_INCREMENT (run
/// before the index changes) and one restoring it (run after). Looking at
/// both definitions keeps the brackets the same in either diff direction.
fn auto_increment_brackets(
    table: &str,
    want: &Table,
    have: &Table,
    rebuilt: &[(&Index, &Index)],
) -> (Vec<Diff>, Vec<Diff>) {
    let want_columns = want.columns_by_property();
    let have_columns = have.columns_by_property();
    let mut seen: HashSet<&PropertyId> = HashSet::new();
    let mut releases = Vec::new();
    let mut restores = Vec::new();

    for (old, new) in rebuilt {
        let from_old = old.column_names().filter_map(|name| have.column(name));
        let from_new = new
            .column_names()
            .filter_map(|name| want.column(name))
            .filter_map(|col| have_columns.get(col.property_id()).copied());
        for have_col in from_old.chain(from_new) {
            let Some(want_col) = want_columns.get(have_col.property_id()).copied() else {
                continue;
            };
            if !have_col.auto_increment || !want_col.auto_increment {
                continue;
            }
            if !seen.insert(have_col.property_id()) {
                continue;
            }

            let mut released = have_col.clone();
            released.auto_increment = false;
            releases.push(Diff {
                table: table.to_string(),
                metadata: want_col.metadata.clone(),
                change: Change::AlterColumn {
                    property: ColumnProperty::AutoIncrement,
                    from: have_col.clone(),
                    to: released,
                },
            });

            let mut unreleased = want_col.clone();
            unreleased.auto_increment = false;
            restores.push(Diff {
                table: table.to_string(),
                metadata: want_col.metadata.clone(),
                change: Change::AlterColumn {
                    property: ColumnProperty::AutoIncrement,
                    from: unreleased,
                    to: want_col.clone(),
                },
            });
        }
    }

    (releases, restores)
}
