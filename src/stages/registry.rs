use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};

use crate::error::{ConfigError, ConfigResult};

use super::{AggregateConfig, CleanConfig, JoinConfig, StageConfig, StageKind, TransformConfig};

/// One recognized option of a stage kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionSpec {
    pub name: &'static str,
    pub required: bool,
    pub description: &'static str,
}

const fn opt(name: &'static str, description: &'static str) -> OptionSpec {
    OptionSpec {
        name,
        required: false,
        description,
    }
}

const fn required(name: &'static str, description: &'static str) -> OptionSpec {
    OptionSpec {
        name,
        required: true,
        description,
    }
}

/// Declared configuration schema of a stage kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageDescriptor {
    pub kind: StageKind,
    pub title: &'static str,
    pub options: &'static [OptionSpec],
}

impl StageDescriptor {
    pub fn option_names(&self) -> Vec<&'static str> {
        self.options.iter().map(|o| o.name).collect()
    }

    pub fn recognizes(&self, name: &str) -> bool {
        self.options.iter().any(|o| o.name == name)
    }
}

const CLEAN: StageDescriptor = StageDescriptor {
    kind: StageKind::Clean,
    title: "Data cleaning",
    options: &[
        opt("dedupeBy", "key column (or columns) whose repeated values are removed"),
        opt("keepPolicy", "which occurrence survives dedupe: first | last (default last)"),
        opt("missingValuePolicy", "drop | meanFill | forwardFill"),
        opt("trimWhitespace", "trim leading/trailing whitespace on string cells"),
    ],
};

const TRANSFORM: StageDescriptor = StageDescriptor {
    kind: StageKind::Transform,
    title: "Data transformation",
    options: &[
        opt("dateFormat", "strftime pattern applied to every date column"),
        opt("categoryNormalization", "column -> canonical label -> spelling variants"),
    ],
};

const JOIN: StageDescriptor = StageDescriptor {
    kind: StageKind::Join,
    title: "Data join",
    options: &[
        opt("joinType", "inner | left | full (default inner)"),
        required("right", "name of the table joined onto the stage input"),
        required("on", "key column shared by both tables"),
        opt("consistencyCheck", "fail when the join output has a null key"),
    ],
};

const AGGREGATE: StageDescriptor = StageDescriptor {
    kind: StageKind::Aggregate,
    title: "Data aggregation",
    options: &[
        required("key", "entity key column"),
        required("eventColumn", "event-date column the method applies to"),
        opt("aggregationMethod", "first-by-key | last-by-key | all-events-grouped"),
        opt("resolveCanonicalNames", "replace the name column with canonical names"),
        opt("nameColumn", "display-name column rewritten by resolveCanonicalNames"),
        opt("canonicalNames", "name variant (or entity key) -> canonical display name"),
    ],
};

/// Catalogue of stage kinds and their recognized options.
#[derive(Debug, Clone)]
pub struct StageRegistry {
    descriptors: Vec<StageDescriptor>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self {
            descriptors: vec![CLEAN, TRANSFORM, JOIN, AGGREGATE],
        }
    }
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn descriptors(&self) -> &[StageDescriptor] {
        &self.descriptors
    }

    pub fn descriptor(&self, kind: StageKind) -> Option<&StageDescriptor> {
        self.descriptors.iter().find(|d| d.kind == kind)
    }

    /// Resolve a stage kind by name, as found in plan documents.
    pub fn kind(&self, name: &str) -> ConfigResult<StageKind> {
        let kind: StageKind = name.parse()?;
        match self.descriptor(kind) {
            Some(_) => Ok(kind),
            None => Err(ConfigError::UnknownStageKind { kind: name.to_string() }),
        }
    }

    /// Validate `options` against the declared schema of `kind` and build a typed config.
    ///
    /// Checks run in this order, each failing fast: unknown option keys, missing required
    /// options, per-option value shape, then cross-option constraints.
    pub fn build_config(&self, kind: StageKind, options: &Map<String, JsonValue>) -> ConfigResult<StageConfig> {
        let descriptor = self
            .descriptor(kind)
            .ok_or_else(|| ConfigError::UnknownStageKind { kind: kind.to_string() })?;

        if let Some(unknown) = options.keys().find(|k| !descriptor.recognizes(k)) {
            return Err(ConfigError::UnknownOption {
                stage: kind,
                option: unknown.clone(),
                recognized: descriptor.option_names(),
            });
        }
        if let Some(missing) = descriptor
            .options
            .iter()
            .find(|o| o.required && options.get(o.name).is_none_or(JsonValue::is_null))
        {
            return Err(ConfigError::MissingOption {
                stage: kind,
                option: missing.name,
            });
        }

        let config = match kind {
            StageKind::Clean => StageConfig::Clean(deserialize_options::<CleanConfig>(kind, options)?),
            StageKind::Transform => StageConfig::Transform(deserialize_options::<TransformConfig>(kind, options)?),
            StageKind::Join => StageConfig::Join(deserialize_options::<JoinConfig>(kind, options)?),
            StageKind::Aggregate => StageConfig::Aggregate(deserialize_options::<AggregateConfig>(kind, options)?),
        };

        match &config {
            StageConfig::Clean(c) => c.validate()?,
            StageConfig::Transform(c) => c.validate()?,
            StageConfig::Join(c) => c.validate()?,
            StageConfig::Aggregate(c) => c.validate()?,
        }
        Ok(config)
    }

    /// Merge `overrides` over `base` and rebuild. `null` overrides reset an option to its default.
    pub fn rebuild_config(
        &self,
        kind: StageKind,
        base: &Map<String, JsonValue>,
        overrides: &Map<String, JsonValue>,
    ) -> ConfigResult<(StageConfig, Map<String, JsonValue>)> {
        let mut merged = base.clone();
        for (key, value) in overrides {
            if value.is_null() {
                merged.remove(key);
                if let Some(d) = self.descriptor(kind).filter(|d| !d.recognizes(key)) {
                    return Err(ConfigError::UnknownOption {
                        stage: kind,
                        option: key.clone(),
                        recognized: d.option_names(),
                    });
                }
            } else {
                merged.insert(key.clone(), value.clone());
            }
        }
        let config = self.build_config(kind, &merged)?;
        Ok((config, merged))
    }
}

/// Deserialize one option at a time first so the error names the offending option.
fn deserialize_options<T: DeserializeOwned>(kind: StageKind, options: &Map<String, JsonValue>) -> ConfigResult<T> {
    for (key, value) in options {
        let single: Map<String, JsonValue> = std::iter::once((key.clone(), value.clone())).collect();
        if let Err(err) = serde_json::from_value::<T>(JsonValue::Object(single)) {
            return Err(ConfigError::InvalidValue {
                stage: kind,
                option: key.clone(),
                message: err.to_string(),
            });
        }
    }
    serde_json::from_value(JsonValue::Object(options.clone())).map_err(|err| ConfigError::InvalidValue {
        stage: kind,
        option: options.keys().cloned().collect::<Vec<_>>().join(", "),
        message: err.to_string(),
    })
}

pub(crate) fn invalid(kind: StageKind, option: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        stage: kind,
        option: option.to_string(),
        message: message.into(),
    }
}
