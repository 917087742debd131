//! MySQL rendering of whole schema objects.
//!
//! Statement-level rendering (ALTER TABLE for a single change) lives with the
//! diff types in `keel`; this module only knows how to spell tables, columns
//! and indexes.

use crate::{Column, ColumnDefault, Index, Table};
use std::fmt;

/// A MySQL string literal wrapper.
///
/// Display writes the value escaped and quoted with single quotes.
///
/// # Example
/// ```
/// use keel_schema::Lit;
/// assert_eq!(format!("{}", Lit("foo")), "'foo'");
/// assert_eq!(format!("{}", Lit("it's")), "'it''s'");
/// ```
pub struct Lit<T: AsRef<str>>(pub T);

impl<T: AsRef<str>> fmt::Display for Lit<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'")?;
        for c in self.0.as_ref().chars() {
            match c {
                '\'' => write!(f, "''")?,
                '\\' => write!(f, "\\\\")?,
                _ => write!(f, "{}", c)?,
            }
        }
        write!(f, "'")
    }
}

/// A MySQL identifier wrapper.
///
/// Display writes the value quoted with backticks, doubling embedded ones.
///
/// # Example
/// ```
/// use keel_schema::Ident;
/// assert_eq!(format!("{}", Ident("order")), "`order`");
/// assert_eq!(format!("{}", Ident("a`b")), "`a``b`");
/// ```
pub struct Ident<T: AsRef<str>>(pub T);

impl<T: AsRef<str>> fmt::Display for Ident<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`")?;
        for c in self.0.as_ref().chars() {
            if c == '`' {
                write!(f, "``")?;
            } else {
                write!(f, "{}", c)?;
            }
        }
        write!(f, "`")
    }
}

/// Quote a MySQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("{}", Ident(name))
}

/// Render a column's type, e.g. `varchar(255)` or `int(10) unsigned`.
pub fn column_type_sql(col: &Column) -> String {
    let mut out = col.data_type.clone();
    if !col.size.is_empty() {
        let parts: Vec<String> = col.size.iter().map(|s| s.to_string()).collect();
        out.push_str(&format!("({})", parts.join(",")));
    }
    if col.unsigned {
        out.push_str(" unsigned");
    }
    out
}

/// Render a DEFAULT clause value. Temporal keywords stay unquoted.
fn default_sql(value: &str) -> String {
    let upper = value.to_ascii_uppercase();
    if upper.starts_with("CURRENT_TIMESTAMP") || upper == "NOW()" {
        value.to_string()
    } else {
        format!("{}", Lit(value))
    }
}

/// Render a full column definition as used in CREATE TABLE, ADD COLUMN and
/// MODIFY COLUMN.
pub fn column_definition_sql(col: &Column) -> String {
    let mut def = format!("{} {}", quote_ident(&col.name), column_type_sql(col));

    if let Some(collation) = &col.collation {
        def.push_str(&format!(" COLLATE {}", collation));
    }

    if !col.nullable {
        def.push_str(" NOT NULL");
    }

    match &col.default {
        ColumnDefault::Unset => {}
        ColumnDefault::Null => def.push_str(" DEFAULT NULL"),
        ColumnDefault::Value(v) => def.push_str(&format!(" DEFAULT {}", default_sql(v))),
    }

    if col.auto_increment {
        def.push_str(" AUTO_INCREMENT");
    }

    def
}

/// Render the parenthesised column list of an index: `(`a`, `b`(10))`.
pub fn index_columns_sql(idx: &Index) -> String {
    let cols: Vec<String> = idx
        .columns
        .iter()
        .map(|c| match c.length {
            Some(len) => format!("{}({})", quote_ident(&c.name), len),
            None => quote_ident(&c.name),
        })
        .collect();
    format!("({})", cols.join(", "))
}

/// Render an index as it appears inside a CREATE TABLE body.
pub fn index_definition_sql(idx: &Index) -> String {
    if idx.is_primary {
        format!("PRIMARY KEY {}", index_columns_sql(idx))
    } else if idx.is_unique {
        format!("UNIQUE KEY {} {}", quote_ident(&idx.name), index_columns_sql(idx))
    } else {
        format!("KEY {} {}", quote_ident(&idx.name), index_columns_sql(idx))
    }
}

/// Render the table options that follow the closing parenthesis of a
/// CREATE TABLE.
pub fn table_options_sql(table: &Table) -> String {
    let mut opts = format!("ENGINE={}", table.engine);
    if let Some(ai) = table.auto_increment {
        opts.push_str(&format!(" AUTO_INCREMENT={}", ai));
    }
    if let Some(charset) = &table.charset {
        opts.push_str(&format!(" DEFAULT CHARSET={}", charset));
    }
    if let Some(collation) = &table.collation {
        opts.push_str(&format!(" COLLATE={}", collation));
    }
    if let Some(row_format) = &table.row_format {
        opts.push_str(&format!(" ROW_FORMAT={}", row_format));
    }
    opts
}

/// Generate a CREATE TABLE statement including all indexes.
pub fn create_table_sql(table: &Table) -> String {
    let mut parts: Vec<String> = table
        .columns
        .iter()
        .map(|col| format!("  {}", column_definition_sql(col)))
        .collect();

    for idx in table.indexes() {
        parts.push(format!("  {}", index_definition_sql(idx)));
    }

    format!(
        "CREATE TABLE {} (\n{}\n) {}",
        quote_ident(&table.name),
        parts.join(",\n"),
        table_options_sql(table)
    )
}

/// Generate a DROP TABLE statement.
pub fn drop_table_sql(name: &str) -> String {
    format!("DROP TABLE {}", quote_ident(name))
}
