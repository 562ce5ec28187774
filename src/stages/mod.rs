//! Stage registry and the four stage transformations.
//!
//! Every stage is a pure function `(RowSet, config) -> (RowSet, diagnostics)`. Configuration is
//! built (and validated) through [`StageRegistry::build_config`] before any row is touched; the
//! resulting [`StageConfig`] is then handed to [`apply`].
//!
//! | Kind | Options |
//! |---|---|
//! | `clean` | `dedupeBy`, `keepPolicy`, `missingValuePolicy`, `trimWhitespace` |
//! | `transform` | `dateFormat`, `categoryNormalization` |
//! | `join` | `joinType`, `right`, `on`, `consistencyCheck` |
//! | `aggregate` | `key`, `eventColumn`, `aggregationMethod`, `resolveCanonicalNames`, `nameColumn`, `canonicalNames` |

pub mod aggregate;
pub mod clean;
pub mod join;
pub mod registry;
pub mod transform;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;

use crate::error::{ConfigError, StageError, StageOutcome};
use crate::execution::RowExecutor;
use crate::types::RowSet;

pub use aggregate::{AggregateConfig, AggregationMethod};
pub use clean::{CleanConfig, KeepPolicy, KeyColumns, MissingValuePolicy};
pub use join::{JoinConfig, JoinType};
pub use registry::{OptionSpec, StageDescriptor, StageRegistry};
pub use transform::TransformConfig;

/// The four stage kinds of the default catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Clean,
    Transform,
    Join,
    Aggregate,
}

impl StageKind {
    pub const ALL: [StageKind; 4] = [Self::Clean, Self::Transform, Self::Join, Self::Aggregate];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::Transform => "transform",
            Self::Join => "join",
            Self::Aggregate => "aggregate",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ConfigError::UnknownStageKind { kind: s.to_string() })
    }
}

/// Validated configuration of one stage.
///
/// Serialization is structural and deterministic (maps are ordered); the pipeline fingerprints it
/// for memoization.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "options", rename_all = "lowercase")]
pub enum StageConfig {
    Clean(CleanConfig),
    Transform(TransformConfig),
    Join(JoinConfig),
    Aggregate(AggregateConfig),
}

impl StageConfig {
    pub fn kind(&self) -> StageKind {
        match self {
            Self::Clean(_) => StageKind::Clean,
            Self::Transform(_) => StageKind::Transform,
            Self::Join(_) => StageKind::Join,
            Self::Aggregate(_) => StageKind::Aggregate,
        }
    }

    /// Name of the secondary table this stage reads, if any.
    pub fn right_table(&self) -> Option<&str> {
        match self {
            Self::Join(join) => Some(join.right.as_str()),
            _ => None,
        }
    }

    /// The options of this config as a JSON object, in the shape the registry accepts.
    pub fn options_json(&self) -> serde_json::Map<String, serde_json::Value> {
        let value = match self {
            Self::Clean(c) => serde_json::to_value(c),
            Self::Transform(c) => serde_json::to_value(c),
            Self::Join(c) => serde_json::to_value(c),
            Self::Aggregate(c) => serde_json::to_value(c),
        };
        match value {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }
}

/// Shared resources a stage may read while it runs.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub executor: Arc<RowExecutor>,
    /// Secondary tables of the dataset, by name (join inputs).
    pub tables: Arc<BTreeMap<String, Arc<RowSet>>>,
}

impl StageContext {
    pub fn new(executor: Arc<RowExecutor>) -> Self {
        Self {
            executor,
            tables: Arc::new(BTreeMap::new()),
        }
    }

    pub fn with_tables(mut self, tables: Arc<BTreeMap<String, Arc<RowSet>>>) -> Self {
        self.tables = tables;
        self
    }

    pub fn table(&self, name: &str) -> StageOutcome<&RowSet> {
        self.tables
            .get(name)
            .map(|t| t.as_ref())
            .ok_or_else(|| StageError::MissingTable { name: name.to_string() })
    }
}

/// One human-readable change made by a stage, attributed to the option that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeRecord {
    pub option: &'static str,
    pub message: String,
    /// Key of a sample affected row, when the change is keyed (dedupe, aggregation).
    pub sample_key: Option<String>,
}

impl ChangeRecord {
    pub fn new(option: &'static str, message: impl Into<String>) -> Self {
        Self {
            option,
            message: message.into(),
            sample_key: None,
        }
    }

    pub fn with_sample_key(mut self, key: impl Into<String>) -> Self {
        self.sample_key = Some(key.into());
        self
    }
}

impl fmt::Display for ChangeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.option)
    }
}

/// What a stage did to its input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageDiagnostics {
    pub rows_in: usize,
    pub rows_out: usize,
    pub changes: Vec<ChangeRecord>,
}

impl StageDiagnostics {
    pub fn new(rows_in: usize) -> Self {
        Self {
            rows_in,
            rows_out: rows_in,
            changes: Vec::new(),
        }
    }

    pub fn rows_removed(&self) -> usize {
        self.rows_in.saturating_sub(self.rows_out)
    }

    pub fn record(&mut self, change: ChangeRecord) {
        self.changes.push(change);
    }

    /// Change messages in the order they happened.
    pub fn messages(&self) -> impl Iterator<Item = &str> {
        self.changes.iter().map(|c| c.message.as_str())
    }
}

impl fmt::Display for StageDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} rows in, {} rows out", self.rows_in, self.rows_out)?;
        for change in &self.changes {
            write!(f, "; {change}")?;
        }
        Ok(())
    }
}

/// Output of a single stage invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutput {
    pub rows: RowSet,
    pub diagnostics: StageDiagnostics,
}

/// Run one stage over `input`.
pub fn apply(config: &StageConfig, input: &RowSet, ctx: &StageContext) -> StageOutcome<StageOutput> {
    let mut output = match config {
        StageConfig::Clean(c) => clean::apply(c, input, ctx)?,
        StageConfig::Transform(c) => transform::apply(c, input, ctx)?,
        StageConfig::Join(c) => join::apply(c, input, ctx)?,
        StageConfig::Aggregate(c) => aggregate::apply(c, input, ctx)?,
    };
    if let Some((row, found)) = output.rows.check_shape() {
        return Err(StageError::ShapeMismatch {
            row,
            expected: output.rows.schema.len(),
            found,
        });
    }
    output.diagnostics.rows_out = output.rows.row_count();
    Ok(output)
}

/// `"1 row"`, `"3 rows"`.
pub(crate) fn rows_phrase(n: usize) -> String {
    if n == 1 { "1 row".to_string() } else { format!("{n} rows") }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_parse_case_insensitively() {
        assert_eq!("Clean".parse::<StageKind>(), Ok(StageKind::Clean));
        assert_eq!(" aggregate ".parse::<StageKind>(), Ok(StageKind::Aggregate));
        assert_eq!(
            "pivot".parse::<StageKind>(),
            Err(ConfigError::UnknownStageKind { kind: "pivot".into() })
        );
    }

    #[test]
    fn diagnostics_display_lists_changes() {
        let mut d = StageDiagnostics::new(16);
        d.rows_out = 15;
        d.record(ChangeRecord::new("dedupeBy", "1 row removed, key S004").with_sample_key("S004"));
        assert_eq!(d.rows_removed(), 1);
        assert_eq!(d.to_string(), "16 rows in, 15 rows out; 1 row removed, key S004 (dedupeBy)");
    }

    #[test]
    fn missing_table_is_reported_by_name() {
        let ctx = StageContext::new(Arc::new(RowExecutor::default()));
        assert_eq!(
            ctx.table("schools").unwrap_err(),
            StageError::MissingTable { name: "schools".into() }
        );
    }
}
