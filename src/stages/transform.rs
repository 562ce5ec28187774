//! Transform stage: date rendering and categorical normalization.

use std::collections::{BTreeMap, HashMap};

use chrono::format::{Item, StrftimeItems};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigResult, StageOutcome};
use crate::processing::group::resolve_column;
use crate::types::{DataType, RowSet, Value};

use super::registry::invalid;
use super::{ChangeRecord, StageContext, StageDiagnostics, StageKind, StageOutput};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct TransformConfig {
    /// strftime pattern every date column is rendered with, e.g. `%Y/%m/%d`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_format: Option<String>,
    /// column -> canonical label -> known spelling variants.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub category_normalization: BTreeMap<String, BTreeMap<String, Vec<String>>>,
}

impl TransformConfig {
    pub(crate) fn validate(&self) -> ConfigResult<()> {
        if let Some(format) = &self.date_format {
            if format.trim().is_empty() {
                return Err(invalid(StageKind::Transform, "dateFormat", "format is empty"));
            }
            if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
                return Err(invalid(
                    StageKind::Transform,
                    "dateFormat",
                    format!("'{format}' is not a valid strftime pattern"),
                ));
            }
        }
        for (column, table) in &self.category_normalization {
            if let (_, Some(variant)) = lookup_table(table) {
                return Err(invalid(
                    StageKind::Transform,
                    "categoryNormalization",
                    format!("variant '{variant}' of column '{column}' maps to more than one label"),
                ));
            }
        }
        Ok(())
    }
}

/// Case- and whitespace-insensitive variant -> canonical lookup, plus the first variant claimed by
/// two labels. The first label wins.
fn lookup_table(table: &BTreeMap<String, Vec<String>>) -> (HashMap<String, &str>, Option<String>) {
    let mut lookup: HashMap<String, &str> = HashMap::new();
    let mut ambiguous = None;
    for (canonical, variants) in table {
        for variant in std::iter::once(canonical).chain(variants) {
            let norm = normalize(variant);
            match lookup.get(&norm).copied() {
                Some(existing) if existing != canonical.as_str() => {
                    ambiguous.get_or_insert_with(|| variant.clone());
                }
                Some(_) => {}
                None => {
                    lookup.insert(norm, canonical.as_str());
                }
            }
        }
    }
    (lookup, ambiguous)
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

pub fn apply(config: &TransformConfig, input: &RowSet, ctx: &StageContext) -> StageOutcome<StageOutput> {
    let mut diagnostics = StageDiagnostics::new(input.row_count());

    let mut targets = Vec::with_capacity(config.category_normalization.len());
    for (column, table) in &config.category_normalization {
        let idx = resolve_column(&input.schema, column)?;
        targets.push((idx, lookup_table(table).0));
    }

    let mut rows = input.clone();

    if let Some(format) = &config.date_format {
        let mut touched = Vec::new();
        for field in rows.schema.fields.iter_mut().filter(|f| f.data_type == DataType::Date) {
            if field.format.as_deref() != Some(format.as_str()) {
                field.format = Some(format.clone());
                touched.push(field.name.clone());
            }
        }
        if !touched.is_empty() {
            diagnostics.record(ChangeRecord::new(
                "dateFormat",
                format!("dates in {} rendered as {format}", touched.join(", ")),
            ));
        }
    }

    if !targets.is_empty() {
        let normalized = ctx.executor.map_parallel(&rows, |row| {
            let mut out = row.to_vec();
            for (idx, lookup) in &targets {
                if let Value::Utf8(s) = &row[*idx] {
                    if let Some(canonical) = lookup.get(&normalize(s)) {
                        if s != canonical {
                            out[*idx] = Value::Utf8((*canonical).to_string());
                        }
                    }
                }
            }
            out
        });
        for (idx, _) in &targets {
            let changed = rows
                .rows
                .iter()
                .zip(&normalized.rows)
                .filter(|(a, b)| a[*idx] != b[*idx])
                .count();
            if changed > 0 {
                diagnostics.record(ChangeRecord::new(
                    "categoryNormalization",
                    format!("normalized {changed} value(s) in '{}'", rows.schema.fields[*idx].name),
                ));
            }
        }
        rows = normalized;
    }

    diagnostics.rows_out = rows.row_count();
    Ok(StageOutput { rows, diagnostics })
}
