//! Schema entity types for keel.
//!
//! Tables, columns and indexes are plain values rebuilt on every snapshot
//! read. The only thing that ties two snapshots together is the
//! [`PropertyId`] carried in each entity's [`Metadata`]: names may change,
//! property ids may not.

use indexmap::IndexMap;
use std::fmt;

pub mod sql;

pub use sql::{Ident, Lit, quote_ident};

/// Reserved name of a table's primary key.
pub const PRIMARY_KEY_NAME: &str = "PrimaryKey";

/// Stable, caller-assigned identity of a schema object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropertyId(String);

impl PropertyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PropertyId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PropertyId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The kind of object a [`Metadata`] record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EntityKind {
    #[default]
    Table,
    Column,
    Index,
    PrimaryKey,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Table => "table",
            EntityKind::Column => "column",
            EntityKind::Index => "index",
            EntityKind::PrimaryKey => "primary_key",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "table" => Some(EntityKind::Table),
            "column" => Some(EntityKind::Column),
            "index" => Some(EntityKind::Index),
            "primary_key" => Some(EntityKind::PrimaryKey),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity record attached to every schema object.
///
/// `id` is the numeric identity assigned by the identity store and is `0`
/// until the record has been persisted. `exists` is a soft-delete flag: a
/// record for an object that a pending migration will create is stored with
/// `exists = false` and flipped once the creating step has run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub id: i64,
    pub database_id: i64,
    pub property_id: PropertyId,
    /// Property id of the owning table; empty for tables.
    pub parent_id: PropertyId,
    pub kind: EntityKind,
    pub name: String,
    pub exists: bool,
}

impl Metadata {
    pub fn new(kind: EntityKind, property_id: impl Into<PropertyId>, name: impl Into<String>) -> Self {
        Self {
            id: 0,
            database_id: 0,
            property_id: property_id.into(),
            parent_id: PropertyId::default(),
            kind,
            name: name.into(),
            exists: false,
        }
    }

    /// Whether the identity store has assigned a numeric id.
    pub fn is_persisted(&self) -> bool {
        self.id != 0
    }
}

/// Column default value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum ColumnDefault {
    /// No DEFAULT clause.
    #[default]
    Unset,
    /// `DEFAULT NULL`
    Null,
    /// `DEFAULT <value>`
    Value(String),
}

/// A table column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    /// Base type name, e.g. `int`, `varchar`, `decimal`.
    pub data_type: String,
    /// Zero, one or two size parameters: `varchar(255)`, `decimal(10,2)`.
    pub size: Vec<u32>,
    pub nullable: bool,
    pub auto_increment: bool,
    pub unsigned: bool,
    pub default: ColumnDefault,
    pub collation: Option<String>,
    pub metadata: Metadata,
}

impl Column {
    pub fn new(
        property_id: impl Into<PropertyId>,
        name: impl Into<String>,
        data_type: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            metadata: Metadata::new(EntityKind::Column, property_id, name.clone()),
            name,
            data_type: data_type.into(),
            size: Vec::new(),
            nullable: false,
            auto_increment: false,
            unsigned: false,
            default: ColumnDefault::Unset,
            collation: None,
        }
    }

    pub fn size(mut self, size: &[u32]) -> Self {
        self.size = size.to_vec();
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn unsigned(mut self) -> Self {
        self.unsigned = true;
        self
    }

    pub fn default_value(mut self, default: ColumnDefault) -> Self {
        self.default = default;
        self
    }

    pub fn collation(mut self, collation: impl Into<String>) -> Self {
        self.collation = Some(collation.into());
        self
    }

    pub fn property_id(&self) -> &PropertyId {
        &self.metadata.property_id
    }
}

/// A column reference inside an index, with an optional prefix length.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexColumn {
    pub name: String,
    pub length: Option<u32>,
}

impl IndexColumn {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            length: None,
        }
    }

    pub fn prefix(name: impl Into<String>, length: u32) -> Self {
        Self {
            name: name.into(),
            length: Some(length),
        }
    }
}

/// A primary key or secondary index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    pub name: String,
    pub columns: Vec<IndexColumn>,
    pub is_primary: bool,
    pub is_unique: bool,
    pub metadata: Metadata,
}

impl Index {
    /// A primary key over the given columns.
    pub fn primary(property_id: impl Into<PropertyId>, columns: &[&str]) -> Self {
        Self {
            name: PRIMARY_KEY_NAME.to_string(),
            columns: columns.iter().map(|c| IndexColumn::new(*c)).collect(),
            is_primary: true,
            is_unique: true,
            metadata: Metadata::new(EntityKind::PrimaryKey, property_id, PRIMARY_KEY_NAME),
        }
    }

    /// A non-unique secondary index over the given columns.
    pub fn secondary(
        property_id: impl Into<PropertyId>,
        name: impl Into<String>,
        columns: &[&str],
    ) -> Self {
        let name = name.into();
        Self {
            metadata: Metadata::new(EntityKind::Index, property_id, name.clone()),
            name,
            columns: columns.iter().map(|c| IndexColumn::new(*c)).collect(),
            is_primary: false,
            is_unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.is_unique = true;
        self
    }

    pub fn with_columns(mut self, columns: Vec<IndexColumn>) -> Self {
        self.columns = columns;
        self
    }

    pub fn property_id(&self) -> &PropertyId {
        &self.metadata.property_id
    }

    /// Names of the referenced columns, in index order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn references(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c.name == column)
    }
}

/// Grouping of tables into a prefix and/or subfolder of the schema
/// repository. Purely organisational; never diffed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Namespace {
    pub prefix: String,
    pub folder: String,
}

/// A table definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub name: String,
    pub engine: String,
    pub charset: Option<String>,
    pub collation: Option<String>,
    pub row_format: Option<String>,
    /// Next AUTO_INCREMENT value; `None` when the definition doesn't pin it.
    pub auto_increment: Option<u64>,
    pub columns: Vec<Column>,
    pub primary_key: Option<Index>,
    pub secondary_indexes: Vec<Index>,
    pub namespace: Namespace,
    pub metadata: Metadata,
}

impl Table {
    pub fn new(property_id: impl Into<PropertyId>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            metadata: Metadata::new(EntityKind::Table, property_id, name.clone()),
            name,
            engine: "InnoDB".to_string(),
            charset: None,
            collation: None,
            row_format: None,
            auto_increment: None,
            columns: Vec::new(),
            primary_key: None,
            secondary_indexes: Vec::new(),
            namespace: Namespace::default(),
        }
    }

    /// Append a column, parenting its metadata to this table.
    pub fn with_column(mut self, mut column: Column) -> Self {
        column.metadata.parent_id = self.metadata.property_id.clone();
        self.columns.push(column);
        self
    }

    /// Set the primary key, parenting its metadata to this table.
    pub fn with_primary_key(mut self, mut index: Index) -> Self {
        index.metadata.parent_id = self.metadata.property_id.clone();
        self.primary_key = Some(index);
        self
    }

    /// Append a secondary index, parenting its metadata to this table.
    pub fn with_index(mut self, mut index: Index) -> Self {
        index.metadata.parent_id = self.metadata.property_id.clone();
        self.secondary_indexes.push(index);
        self
    }

    pub fn property_id(&self) -> &PropertyId {
        &self.metadata.property_id
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Columns keyed by property id, in definition order.
    pub fn columns_by_property(&self) -> IndexMap<&PropertyId, &Column> {
        self.columns.iter().map(|c| (c.property_id(), c)).collect()
    }

    /// The primary key followed by the secondary indexes.
    pub fn indexes(&self) -> impl Iterator<Item = &Index> {
        self.primary_key.iter().chain(self.secondary_indexes.iter())
    }

    /// Indexes keyed by property id, primary key first.
    pub fn indexes_by_property(&self) -> IndexMap<&PropertyId, &Index> {
        self.indexes().map(|i| (i.property_id(), i)).collect()
    }

    /// All metadata records owned by this table, the table's own first.
    pub fn all_metadata(&self) -> Vec<&Metadata> {
        std::iter::once(&self.metadata)
            .chain(self.columns.iter().map(|c| &c.metadata))
            .chain(self.indexes().map(|i| &i.metadata))
            .collect()
    }

    /// Copy each object's current name into its metadata.
    pub fn sync_metadata_names(&mut self) {
        self.metadata.name = self.name.clone();
        for col in &mut self.columns {
            col.metadata.name = col.name.clone();
        }
        for idx in self.primary_key.iter_mut().chain(self.secondary_indexes.iter_mut()) {
            idx.metadata.name = idx.name.clone();
        }
    }

    /// Mutable access to every metadata record owned by this table.
    pub fn all_metadata_mut(&mut self) -> Vec<&mut Metadata> {
        let mut out = vec![&mut self.metadata];
        out.extend(self.columns.iter_mut().map(|c| &mut c.metadata));
        out.extend(self.primary_key.iter_mut().map(|i| &mut i.metadata));
        out.extend(self.secondary_indexes.iter_mut().map(|i| &mut i.metadata));
        out
    }
}

#[cfg(test)]
mod tests;
