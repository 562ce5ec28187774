//! Aggregate stage: collapses rows to one row per entity key.
//!
//! - `first-by-key`: the row with the earliest event (ties keep the earlier row)
//! - `last-by-key`: the row with the latest event (ties keep the later row)
//! - `all-events-grouped`: the first row of each key, with the event column replaced by the sorted
//!   list of its events and an `eventCount` column appended
//!
//! Output rows follow the first appearance of each key in the input. Rows with a null key are
//! dropped and reported.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigResult, StageOutcome};
use crate::processing::group::{display_key, group_rows, resolve_column};
use crate::types::{DataType, Field, RowSet, Schema, Value};

use super::registry::invalid;
use super::{rows_phrase, ChangeRecord, StageContext, StageDiagnostics, StageKind, StageOutput};

/// Name of the column appended by [`AggregationMethod::AllEventsGrouped`].
pub const EVENT_COUNT_COLUMN: &str = "eventCount";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AggregationMethod {
    #[default]
    FirstByKey,
    LastByKey,
    AllEventsGrouped,
}

impl AggregationMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FirstByKey => "first-by-key",
            Self::LastByKey => "last-by-key",
            Self::AllEventsGrouped => "all-events-grouped",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct AggregateConfig {
    /// Entity key column.
    pub key: String,
    /// Event-date column the method applies to.
    pub event_column: String,
    pub aggregation_method: AggregationMethod,
    pub resolve_canonical_names: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name_column: Option<String>,
    /// Name as written (or, failing that, the entity key as displayed) -> canonical name.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub canonical_names: BTreeMap<String, String>,
}

impl AggregateConfig {
    pub fn new(key: impl Into<String>, event_column: impl Into<String>, method: AggregationMethod) -> Self {
        Self {
            key: key.into(),
            event_column: event_column.into(),
            aggregation_method: method,
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> ConfigResult<()> {
        if self.key.trim().is_empty() {
            return Err(invalid(StageKind::Aggregate, "key", "key column is empty"));
        }
        if self.event_column.trim().is_empty() {
            return Err(invalid(StageKind::Aggregate, "eventColumn", "event column is empty"));
        }
        if self.resolve_canonical_names && self.name_column.as_deref().is_none_or(|c| c.trim().is_empty()) {
            return Err(invalid(
                StageKind::Aggregate,
                "nameColumn",
                "required when resolveCanonicalNames is true",
            ));
        }
        Ok(())
    }
}

pub fn apply(config: &AggregateConfig, input: &RowSet, _ctx: &StageContext) -> StageOutcome<StageOutput> {
    let key = resolve_column(&input.schema, &config.key)?;
    let event = resolve_column(&input.schema, &config.event_column)?;
    let name = match (&config.name_column, config.resolve_canonical_names) {
        (Some(column), true) => Some(resolve_column(&input.schema, column)?),
        _ => None,
    };

    let mut diagnostics = StageDiagnostics::new(input.row_count());
    let (groups, null_keyed) = group_rows(&input.rows, &[key]);

    if !null_keyed.is_empty() {
        diagnostics.record(ChangeRecord::new(
            "key",
            format!("{} with an empty '{}' dropped", rows_phrase(null_keyed.len()), config.key),
        ));
    }

    let mut schema = input.schema.clone();
    let mut rows: Vec<Vec<Value>> = Vec::with_capacity(groups.len());

    match config.aggregation_method {
        AggregationMethod::FirstByKey | AggregationMethod::LastByKey => {
            let latest = config.aggregation_method == AggregationMethod::LastByKey;
            for (_, members) in &groups {
                let pick = pick_event_row(&input.rows, members, event, latest);
                rows.push(input.rows[pick].clone());
            }
        }
        AggregationMethod::AllEventsGrouped => {
            let format = input.schema.fields[event].format.clone();
            schema.fields[event] = Field::new(config.event_column.clone(), DataType::Utf8);
            let mut count_name = EVENT_COUNT_COLUMN.to_string();
            while schema.index_of(&count_name).is_some() {
                count_name.push('_');
            }
            schema.fields.push(Field::new(count_name, DataType::Int64));

            for (_, members) in &groups {
                let mut events: Vec<&Value> = members
                    .iter()
                    .map(|&i| &input.rows[i][event])
                    .filter(|v| !v.is_null())
                    .collect();
                events.sort_by(|a, b| a.compare(b).unwrap_or(Ordering::Equal));
                let listed = events
                    .iter()
                    .map(|v| v.render(format.as_deref()))
                    .collect::<Vec<_>>()
                    .join(", ");

                let mut out = input.rows[members[0]].clone();
                out[event] = if listed.is_empty() { Value::Null } else { Value::Utf8(listed) };
                out.push(Value::Int64(events.len() as i64));
                rows.push(out);
            }
        }
    }

    let collapsed = groups.iter().filter(|(_, m)| m.len() > 1).count();
    if collapsed > 0 {
        let sample = groups
            .iter()
            .find(|(_, m)| m.len() > 1)
            .map(|(_, m)| display_key(&input.rows[m[0]], &[key]))
            .unwrap_or_default();
        let merged: usize = groups.iter().map(|(_, m)| m.len() - 1).sum();
        diagnostics.record(
            ChangeRecord::new(
                "aggregationMethod",
                format!(
                    "{} collapsed to {collapsed} row(s) by {} on '{}'",
                    rows_phrase(merged + collapsed),
                    config.aggregation_method.as_str(),
                    config.event_column
                ),
            )
            .with_sample_key(sample),
        );
    }

    if let Some(name) = name {
        resolve_names(config, key, name, &mut schema, &mut rows, &mut diagnostics);
    }

    let rows = RowSet::new(schema, rows);
    diagnostics.rows_out = rows.row_count();
    Ok(StageOutput { rows, diagnostics })
}

/// Index of the member with the earliest (or latest) non-null event.
fn pick_event_row(rows: &[Vec<Value>], members: &[usize], event: usize, latest: bool) -> usize {
    let mut best = members[0];
    for &idx in members {
        let candidate = &rows[idx][event];
        if candidate.is_null() {
            continue;
        }
        let current = &rows[best][event];
        let better = match candidate.compare(current) {
            None => current.is_null(),
            Some(Ordering::Less) => !latest,
            Some(Ordering::Greater) => latest,
            // Equal events: the earlier row for first-by-key, the later one for last-by-key.
            Some(Ordering::Equal) => latest,
        };
        if better {
            best = idx;
        }
    }
    best
}

fn resolve_names(
    config: &AggregateConfig,
    key: usize,
    name: usize,
    schema: &mut Schema,
    rows: &mut [Vec<Value>],
    diagnostics: &mut StageDiagnostics,
) {
    let retype = schema.fields[name].data_type != DataType::Utf8;
    if retype {
        let format = schema.fields[name].format.take();
        schema.fields[name].data_type = DataType::Utf8;
        for row in rows.iter_mut() {
            if !row[name].is_null() {
                row[name] = Value::Utf8(row[name].render(format.as_deref()));
            }
        }
    }

    let mut resolved = 0usize;
    for row in rows.iter_mut() {
        let by_name = match &row[name] {
            Value::Utf8(shown) => config.canonical_names.get(shown.trim()),
            _ => None,
        };
        let canonical = by_name
            .or_else(|| config.canonical_names.get(&display_key(&row[..], &[key])))
            .cloned();
        if let Some(canonical) = canonical {
            if row[name] != Value::Utf8(canonical.clone()) {
                row[name] = Value::Utf8(canonical);
                resolved += 1;
            }
        }
    }
    if resolved > 0 {
        diagnostics.record(ChangeRecord::new(
            "resolveCanonicalNames",
            format!("replaced {resolved} name(s) in '{}' with canonical names", schema.fields[name].name),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::RowExecutor;
    use chrono::NaiveDate;
    use std::sync::Arc;

    fn ctx() -> StageContext {
        StageContext::new(Arc::new(RowExecutor::default()))
    }

    fn date(day: u32) -> Value {
        Value::Date(NaiveDate::from_ymd_opt(2024, 4, day).unwrap())
    }

    fn events() -> RowSet {
        let schema = Schema::new(vec![
            Field::new("id", DataType::Utf8),
            Field::new("firstEventDate", DataType::Date),
            Field::new("schoolName", DataType::Utf8),
        ]);
        let row = |id: &str, d: Value, s: &str| vec![Value::Utf8(id.into()), d, Value::Utf8(s.into())];
        RowSet::new(
            schema,
            vec![
                row("S002", date(20), "north"),
                row("S001", date(15), "South High"),
                row("S002", date(3), "North High"),
                row("S002", Value::Null, "N. High"),
                row("S003", date(9), "East"),
            ],
        )
    }

    #[test]
    fn first_by_key_takes_the_earliest_event() {
        let config = AggregateConfig::new("id", "firstEventDate", AggregationMethod::FirstByKey);
        let out = apply(&config, &events(), &ctx()).unwrap();
        let ids: Vec<_> = out.rows.rows.iter().map(|r| r[0].to_string()).collect();
        assert_eq!(ids, vec!["S002", "S001", "S003"]);
        assert_eq!(out.rows.rows[0][1], date(3));
        assert_eq!(out.diagnostics.changes[0].sample_key.as_deref(), Some("S002"));
        assert_eq!(
            out.diagnostics.messages().collect::<Vec<_>>(),
            vec!["3 rows collapsed to 1 row(s) by first-by-key on 'firstEventDate'"]
        );
    }

    #[test]
    fn last_by_key_takes_the_latest_event() {
        let config = AggregateConfig::new("id", "firstEventDate", AggregationMethod::LastByKey);
        let out = apply(&config, &events(), &ctx()).unwrap();
        assert_eq!(out.rows.rows[0][1], date(20));
        assert_eq!(out.rows.rows[0][2], Value::Utf8("north".into()));
    }

    #[test]
    fn all_events_grouped_lists_sorted_events_and_counts() {
        let config = AggregateConfig::new("id", "firstEventDate", AggregationMethod::AllEventsGrouped);
        let out = apply(&config, &events(), &ctx()).unwrap();
        assert_eq!(out.rows.columns(), vec!["id", "firstEventDate", "schoolName", "eventCount"]);
        assert_eq!(out.rows.rows[0][1], Value::Utf8("2024-04-03, 2024-04-20".into()));
        assert_eq!(out.rows.rows[0][3], Value::Int64(2));
        assert_eq!(out.rows.rows[1][3], Value::Int64(1));
    }

    #[test]
    fn canonical_names_replace_display_names() {
        let config = AggregateConfig {
            resolve_canonical_names: true,
            name_column: Some("schoolName".into()),
            canonical_names: BTreeMap::from([
                ("North High".to_string(), "North High School".to_string()),
                ("East".to_string(), "East Academy".to_string()),
            ]),
            ..AggregateConfig::new("id", "firstEventDate", AggregationMethod::FirstByKey)
        };
        let out = apply(&config, &events(), &ctx()).unwrap();
        assert_eq!(out.rows.rows[0][2], Value::Utf8("North High School".into()));
        assert_eq!(out.rows.rows[1][2], Value::Utf8("South High".into()));
        assert_eq!(out.rows.rows[2][2], Value::Utf8("East Academy".into()));
        assert!(out
            .diagnostics
            .messages()
            .any(|m| m == "replaced 2 name(s) in 'schoolName' with canonical names"));
    }

    #[test]
    fn spelling_variants_share_one_canonical_name() {
        let variants = BTreeMap::from([
            ("north".to_string(), "North High School".to_string()),
            ("N. High".to_string(), "North High School".to_string()),
            ("S001".to_string(), "South High School".to_string()),
        ]);
        let config = AggregateConfig {
            resolve_canonical_names: true,
            name_column: Some("schoolName".into()),
            canonical_names: variants,
            ..AggregateConfig::new("id", "firstEventDate", AggregationMethod::LastByKey)
        };
        let out = apply(&config, &events(), &ctx()).unwrap();
        // S002's latest event is the "north" row; S001 has no name entry and falls back to its id.
        assert_eq!(out.rows.rows[0][2], Value::Utf8("North High School".into()));
        assert_eq!(out.rows.rows[1][2], Value::Utf8("South High School".into()));
        assert_eq!(out.rows.rows[2][2], Value::Utf8("East".into()));
    }

    #[test]
    fn null_keys_are_dropped_and_reported() {
        let mut input = events();
        input.rows[4][0] = Value::Null;
        let config = AggregateConfig::new("id", "firstEventDate", AggregationMethod::FirstByKey);
        let out = apply(&config, &input, &ctx()).unwrap();
        assert_eq!(out.rows.row_count(), 2);
        assert_eq!(out.diagnostics.messages().next(), Some("1 row with an empty 'id' dropped"));
    }

    #[test]
    fn canonical_resolution_requires_a_name_column() {
        let config = AggregateConfig {
            resolve_canonical_names: true,
            ..AggregateConfig::new("id", "firstEventDate", AggregationMethod::FirstByKey)
        };
        assert!(config.validate().is_err());
    }
}
