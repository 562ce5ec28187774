//! Key extraction and grouping shared by dedupe, join and aggregation.

use std::collections::HashMap;

use crate::error::{StageError, StageOutcome};
use crate::types::{KeyPart, Schema, Value};

/// Hashable identity of a row under a set of key columns.
pub type RowKey = Vec<KeyPart>;

/// Resolve column names to indices, failing on the first unknown name.
pub fn resolve_columns(schema: &Schema, names: &[String]) -> StageOutcome<Vec<usize>> {
    names
        .iter()
        .map(|name| resolve_column(schema, name))
        .collect()
}

pub fn resolve_column(schema: &Schema, name: &str) -> StageOutcome<usize> {
    schema.index_of(name).ok_or_else(|| StageError::MissingColumn {
        column: name.to_string(),
        available: schema.field_names().map(str::to_owned).collect(),
    })
}

pub fn row_key(row: &[Value], cols: &[usize]) -> RowKey {
    cols.iter()
        .map(|&i| row.get(i).map(Value::key_part).unwrap_or(KeyPart::Null))
        .collect()
}

/// Key as shown in diagnostics: `S004`, or `S004|2024-04-01` for composite keys.
pub fn display_key(row: &[Value], cols: &[usize]) -> String {
    cols.iter()
        .map(|&i| row.get(i).map(Value::to_string).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("|")
}

/// Whether any component of the key is null.
pub fn key_has_null(key: &RowKey) -> bool {
    key.iter().any(KeyPart::is_null)
}

/// Group row indices by key, groups ordered by first appearance, members in input order.
///
/// Rows whose key contains a null are not grouped; they are returned separately.
pub fn group_rows(rows: &[Vec<Value>], cols: &[usize]) -> (Vec<(RowKey, Vec<usize>)>, Vec<usize>) {
    let mut slots: HashMap<RowKey, usize> = HashMap::new();
    let mut groups: Vec<(RowKey, Vec<usize>)> = Vec::new();
    let mut null_keyed = Vec::new();

    for (idx, row) in rows.iter().enumerate() {
        let key = row_key(row, cols);
        if key_has_null(&key) {
            null_keyed.push(idx);
            continue;
        }
        match slots.get(&key) {
            Some(&slot) => groups[slot].1.push(idx),
            None => {
                slots.insert(key.clone(), groups.len());
                groups.push((key, vec![idx]));
            }
        }
    }
    (groups, null_keyed)
}

/// First repeated key under `cols`, rendered for diagnostics. Null keys are ignored.
pub fn first_duplicate(rows: &[Vec<Value>], cols: &[usize]) -> Option<String> {
    let mut seen: HashMap<RowKey, ()> = HashMap::with_capacity(rows.len());
    rows.iter().find_map(|row| {
        let key = row_key(row, cols);
        if key_has_null(&key) {
            return None;
        }
        seen.insert(key, ()).map(|_| display_key(row, cols))
    })
}
