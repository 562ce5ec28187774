use std::collections::HashSet;

use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};

use crate::error::{ConfigError, ConfigResult};
use crate::stages::{StageConfig, StageKind, StageRegistry};

use super::StageId;

/// One configured stage of a plan.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedStage {
    pub id: StageId,
    pub config: StageConfig,
    /// Options as supplied (after merges), the base for later overrides.
    options: Map<String, JsonValue>,
}

impl PlannedStage {
    /// Stage from an already-typed config.
    pub fn new(id: impl Into<StageId>, config: StageConfig) -> Self {
        let options = config.options_json();
        Self {
            id: id.into(),
            config,
            options,
        }
    }

    /// Validate raw `options` for `kind` through the registry.
    pub fn from_options(
        registry: &StageRegistry,
        id: impl Into<StageId>,
        kind: StageKind,
        options: Map<String, JsonValue>,
    ) -> ConfigResult<Self> {
        let config = registry.build_config(kind, &options)?;
        Ok(Self {
            id: id.into(),
            config,
            options,
        })
    }

    pub fn kind(&self) -> StageKind {
        self.config.kind()
    }

    /// Options as supplied, after any merged overrides.
    pub fn options(&self) -> &Map<String, JsonValue> {
        &self.options
    }

    /// A copy of this stage with `overrides` merged into its options. Nothing changes on error.
    pub fn with_overrides(&self, registry: &StageRegistry, overrides: &Map<String, JsonValue>) -> ConfigResult<Self> {
        let (config, options) = registry.rebuild_config(self.kind(), &self.options, overrides)?;
        Ok(Self {
            id: self.id.clone(),
            config,
            options,
        })
    }
}

/// Ordered stage list with unique ids.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelinePlan {
    stages: Vec<PlannedStage>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPlan {
    stages: Vec<RawStage>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStage {
    id: Option<String>,
    kind: String,
    #[serde(default)]
    options: Map<String, JsonValue>,
}

impl PipelinePlan {
    /// Plan over `stages` in order.
    ///
    /// Fails when two stages share an id.
    pub fn new(stages: Vec<PlannedStage>) -> ConfigResult<Self> {
        let mut seen = HashSet::new();
        if let Some(dup) = stages.iter().find(|s| !seen.insert(s.id.clone())) {
            return Err(ConfigError::DuplicateStageId { id: dup.id.to_string() });
        }
        Ok(Self { stages })
    }

    /// Load a plan document:
    ///
    /// ```json
    /// {"stages": [{"id": "clean", "kind": "clean", "options": {"dedupeBy": "id"}}]}
    /// ```
    ///
    /// `id` defaults to the kind name. Every stage config is validated before the plan is returned.
    pub fn from_json(json: &str, registry: &StageRegistry) -> ConfigResult<Self> {
        let raw: RawPlan = serde_json::from_str(json).map_err(|e| ConfigError::Plan { message: e.to_string() })?;
        let stages = raw
            .stages
            .into_iter()
            .map(|s| {
                let kind = registry.kind(&s.kind)?;
                let id = s.id.unwrap_or_else(|| kind.as_str().to_string());
                PlannedStage::from_options(registry, id, kind, s.options)
            })
            .collect::<ConfigResult<Vec<_>>>()?;
        Self::new(stages)
    }

    pub fn stages(&self) -> &[PlannedStage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &StageId> {
        self.stages.iter().map(|s| &s.id)
    }

    /// Index of the stage named `id`.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.id.as_str() == id)
    }

    pub fn stage(&self, id: &str) -> Option<&PlannedStage> {
        self.position(id).map(|i| &self.stages[i])
    }

    pub(crate) fn replace(&mut self, idx: usize, stage: PlannedStage) {
        self.stages[idx] = stage;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::CleanConfig;

    const PLAN: &str = r#"{
        "stages": [
            {"id": "clean", "kind": "clean", "options": {"dedupeBy": "id", "keepPolicy": "last"}},
            {"kind": "Transform", "options": {"dateFormat": "%Y/%m/%d"}},
            {"id": "aggregate", "kind": "aggregate", "options": {"key": "id", "eventColumn": "firstEventDate"}}
        ]
    }"#;

    #[test]
    fn loads_plan_and_defaults_ids_to_kind() {
        let plan = PipelinePlan::from_json(PLAN, &StageRegistry::default()).unwrap();
        let ids: Vec<&str> = plan.ids().map(StageId::as_str).collect();
        assert_eq!(ids, vec!["clean", "transform", "aggregate"]);
        assert_eq!(plan.stage("transform").map(PlannedStage::kind), Some(StageKind::Transform));
    }

    #[test]
    fn plan_with_unknown_option_fails_fast() {
        let json = r#"{"stages": [{"kind": "clean", "options": {"dedupe": "id"}}]}"#;
        let err = PipelinePlan::from_json(json, &StageRegistry::default()).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownOption { option, .. } if option == "dedupe"));
    }

    #[test]
    fn malformed_and_duplicate_plans_are_rejected() {
        let reg = StageRegistry::default();
        assert!(matches!(
            PipelinePlan::from_json("{\"stages\": 3}", &reg),
            Err(ConfigError::Plan { .. })
        ));
        let dup = r#"{"stages": [{"kind": "clean"}, {"kind": "clean"}]}"#;
        assert_eq!(
            PipelinePlan::from_json(dup, &reg).unwrap_err(),
            ConfigError::DuplicateStageId { id: "clean".into() }
        );
    }

    #[test]
    fn overrides_leave_the_original_untouched() {
        let reg = StageRegistry::default();
        let stage = PlannedStage::new("clean", StageConfig::Clean(CleanConfig::dedupe_by("id")));
        let bad: Map<String, JsonValue> = serde_json::from_str(r#"{"keepPolicy": "middle"}"#).unwrap();
        assert!(stage.with_overrides(&reg, &bad).is_err());

        let good: Map<String, JsonValue> = serde_json::from_str(r#"{"keepPolicy": "first"}"#).unwrap();
        let changed = stage.with_overrides(&reg, &good).unwrap();
        assert_ne!(changed.config, stage.config);
        assert_eq!(stage.options().get("keepPolicy"), Some(&JsonValue::from("last")));
    }
}
