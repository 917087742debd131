//! Ordering of diffs within a table.
//!
//! MySQL refuses some changes unless others have happened first: an index
//! can't be built on a column that doesn't exist yet, a column can't be
//! dropped while an index still references it, and an index covering an
//! AUTO_INCREMENT column can't be dropped while the column keeps the
//! attribute. This module reorders each table's diffs so those constraints
//! hold.
//!
//! ```text
//! -- This fails:
//! ALTER TABLE `dogs` DROP COLUMN `owner`;      -- idx_owner still uses it
//! ALTER TABLE `dogs` DROP INDEX `idx_owner`;
//!
//! -- This works:
//! ALTER TABLE `dogs` DROP INDEX `idx_owner`;
//! ALTER TABLE `dogs` DROP COLUMN `owner`;
//! ```

use crate::diff::{Change, ColumnProperty, Diff, Operation, SchemaDiff, TableDiff};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

/// Diffs that can't be ordered.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("dependency cycle between changes to {table}: {}", .diffs.join(", "))]
pub struct OrderError {
    pub table: String,
    /// The diffs left unordered when the cycle was found.
    pub diffs: Vec<String>,
}

/// A dependency graph over positions `0..len`.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    dependents: Vec<Vec<usize>>,
    in_degree: Vec<usize>,
    edges: HashSet<(usize, usize)>,
}

impl DependencyGraph {
    pub fn new(len: usize) -> Self {
        Self {
            dependents: vec![Vec::new(); len],
            in_degree: vec![0; len],
            edges: HashSet::new(),
        }
    }

    /// Record that `after` must come after `before`.
    pub fn add_dependency(&mut self, after: usize, before: usize) {
        if after == before || !self.edges.insert((before, after)) {
            return;
        }
        self.dependents[before].push(after);
        self.in_degree[after] += 1;
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Kahn's algorithm. Among nodes that are ready at the same time the
    /// lowest position goes first, so an unconstrained graph keeps its
    /// original order. On a cycle, returns the positions that could not be
    /// placed.
    pub fn topological_order(&self) -> Result<Vec<usize>, Vec<usize>> {
        let mut in_degree = self.in_degree.clone();
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(in_degree.len());
        while let Some(Reverse(node)) = ready.pop() {
            order.push(node);
            for &next in &self.dependents[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }

        if order.len() == in_degree.len() {
            Ok(order)
        } else {
            let placed: HashSet<usize> = order.into_iter().collect();
            Err((0..in_degree.len()).filter(|i| !placed.contains(i)).collect())
        }
    }
}

/// Whether this column diff clears AUTO_INCREMENT. Such a change has to run
/// before the index work on that column, not after it.
fn releases_auto_increment(diff: &Diff) -> bool {
    matches!(
        &diff.change,
        Change::AlterColumn {
            property: ColumnProperty::AutoIncrement,
            from,
            to,
        } if from.auto_increment && !to.auto_increment
    )
}

fn shares_column(a: &[&str], b: &[&str]) -> bool {
    a.iter().any(|name| b.contains(name))
}

/// Column names an index diff's statement references, split into the side
/// that goes away and the side that is built.
fn index_sides(diff: &Diff) -> (Vec<&str>, Vec<&str>) {
    match &diff.change {
        Change::DropIndex(i) => (i.column_names().collect(), Vec::new()),
        Change::AddIndex(i) => (Vec::new(), i.column_names().collect()),
        Change::RenameIndex { from, to } => {
            (from.column_names().collect(), to.column_names().collect())
        }
        _ => (Vec::new(), Vec::new()),
    }
}

/// Order an index diff against a column rename. Indexes being dropped still
/// name the old column, so they go first; indexes being built name the new
/// column, so they wait for the rename.
fn order_against_rename(
    graph: &mut DependencyGraph,
    index: (usize, &Diff),
    rename: usize,
    from: &str,
    to: &str,
) {
    let (i, diff) = index;
    let (old_side, new_side) = index_sides(diff);
    if new_side.contains(&to) {
        graph.add_dependency(i, rename);
    } else if diff.operation() == Operation::Delete && old_side.contains(&from) {
        graph.add_dependency(rename, i);
    }
}

/// Build the dependency graph for one table's diffs.
pub fn build_graph(diffs: &[Diff]) -> DependencyGraph {
    let mut graph = DependencyGraph::new(diffs.len());
    let columns: Vec<Vec<&str>> = diffs.iter().map(Diff::column_names).collect();

    // Modifications of one column chain, so they keep their emission order.
    for (c, column) in diffs.iter().enumerate().filter(|(_, d)| d.is_column()) {
        let previous = diffs[..c]
            .iter()
            .rposition(|d| d.is_column() && d.metadata.property_id == column.metadata.property_id);
        if let Some(p) = previous {
            graph.add_dependency(c, p);
        }
    }

    for (i, index) in diffs.iter().enumerate().filter(|(_, d)| d.is_index()) {
        for (c, column) in diffs.iter().enumerate().filter(|(_, d)| d.is_column()) {
            if !shares_column(&columns[i], &columns[c]) {
                continue;
            }
            if let Change::AlterColumn {
                property: ColumnProperty::Name,
                from,
                to,
            } = &column.change
            {
                order_against_rename(&mut graph, (i, index), c, &from.name, &to.name);
            } else if releases_auto_increment(column) {
                graph.add_dependency(i, c);
            } else if index.operation() != Operation::Delete
                && column.operation() != Operation::Modify
            {
                graph.add_dependency(i, c);
            } else if column.operation() != Operation::Add {
                graph.add_dependency(c, i);
            }
        }

        if let Change::AddIndex(added) = &index.change {
            for (d, other) in diffs.iter().enumerate() {
                if let Change::DropIndex(dropped) = &other.change {
                    if dropped.property_id() == added.property_id() || dropped.name == added.name {
                        graph.add_dependency(i, d);
                    }
                }
            }
        }
    }

    graph
}

/// Whether any index diff shares a column with any column diff.
fn needs_ordering(diffs: &[Diff]) -> bool {
    let index_columns: HashSet<&str> = diffs
        .iter()
        .filter(|d| d.is_index())
        .flat_map(Diff::column_names)
        .collect();
    diffs
        .iter()
        .filter(|d| d.is_column())
        .flat_map(Diff::column_names)
        .any(|name| index_columns.contains(name))
}

/// Reorder one table's diffs so every dependency runs first.
pub fn order_table(table: TableDiff) -> Result<TableDiff, OrderError> {
    if table.diffs.len() < 2 || !needs_ordering(&table.diffs) {
        return Ok(table);
    }

    let graph = build_graph(&table.diffs);
    tracing::trace!(table = %table.table, edges = graph.edge_count(), "ordering diffs");

    match graph.topological_order() {
        Ok(order) => {
            let mut slots: Vec<Option<Diff>> = table.diffs.into_iter().map(Some).collect();
            let diffs = order.into_iter().filter_map(|i| slots[i].take()).collect();
            Ok(TableDiff {
                table: table.table,
                table_id: table.table_id,
                diffs,
            })
        }
        Err(stuck) => Err(OrderError {
            diffs: stuck.iter().map(|i| table.diffs[*i].to_string()).collect(),
            table: table.table,
        }),
    }
}

/// Reorder every table's diffs. Tables keep their relative order.
pub fn order_schema_diff(diff: SchemaDiff) -> Result<SchemaDiff, OrderError> {
    let table_diffs = diff
        .table_diffs
        .into_iter()
        .map(order_table)
        .collect::<Result<_, _>>()?;
    Ok(SchemaDiff { table_diffs })
}
