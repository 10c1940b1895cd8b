//! Execution context for one pipeline run

use crate::error::{PipelineError, PipelineResult};
use extraction_storage::StagingLayout;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Merged key/value run configuration
pub type ConfigMap = Map<String, Value>;

pub const MAX_CONCURRENCY: &str = "max_concurrency";
pub const TOLERATED_FAILURE_PERCENTAGE: &str = "tolerated_failure_percentage";
pub const SIMILARITY_SEARCH_MAX_RESULTS: &str = "similarity_search_max_results";

pub const DEFAULT_MAX_CONCURRENCY: u64 = 10;
pub const DEFAULT_TOLERATED_FAILURE_PERCENTAGE: f64 = 0.0;
pub const DEFAULT_SIMILARITY_SEARCH_MAX_RESULTS: u64 = 5;

/// Older inputs name the query this way
const QUERY_ALIAS: &str = "similarity_search_query";

const MAX_EXECUTION_ID_LEN: usize = 128;

/// Built-in defaults applied under caller input
#[must_use]
pub fn default_config() -> ConfigMap {
    let mut defaults = ConfigMap::new();
    defaults.insert(MAX_CONCURRENCY.to_string(), DEFAULT_MAX_CONCURRENCY.into());
    defaults.insert(
        TOLERATED_FAILURE_PERCENTAGE.to_string(),
        DEFAULT_TOLERATED_FAILURE_PERCENTAGE.into(),
    );
    defaults.insert(
        SIMILARITY_SEARCH_MAX_RESULTS.to_string(),
        DEFAULT_SIMILARITY_SEARCH_MAX_RESULTS.into(),
    );
    defaults
}

/// Shallow merge: defaults first, caller input on top (caller wins)
#[must_use]
pub fn merge_defaults(defaults: &ConfigMap, input: &ConfigMap) -> ConfigMap {
    let mut merged = defaults.clone();
    for (key, value) in input {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Require the caller's execution input to be a JSON object
pub fn config_from_input(input: Value) -> PipelineResult<ConfigMap> {
    match input {
        Value::Object(map) => Ok(map),
        other => Err(PipelineError::Configuration(format!(
            "execution input must be a JSON object, got {}",
            json_type(&other)
        ))),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Typed view of a merged configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    pub max_concurrency: usize,
    pub tolerated_failure_percentage: f64,
    pub similarity_search_max_results: u32,
    pub query: String,
    pub model: String,
    pub schema: Value,
    pub instructions: String,
}

impl PipelineSettings {
    /// Validate a merged configuration
    pub fn from_config(config: &ConfigMap) -> PipelineResult<Self> {
        let max_concurrency = positive_int(config, MAX_CONCURRENCY)?;
        let max_results = positive_int(config, SIMILARITY_SEARCH_MAX_RESULTS)?;

        let tolerated = match config.get(TOLERATED_FAILURE_PERCENTAGE) {
            Some(value) => value.as_f64().ok_or_else(|| {
                invalid(TOLERATED_FAILURE_PERCENTAGE, "must be a number")
            })?,
            None => return Err(missing(TOLERATED_FAILURE_PERCENTAGE)),
        };
        if !(0.0..=100.0).contains(&tolerated) {
            return Err(invalid(
                TOLERATED_FAILURE_PERCENTAGE,
                "must be between 0 and 100",
            ));
        }

        let query = match config.get("query") {
            Some(_) => required_str(config, "query")?,
            None if config.contains_key(QUERY_ALIAS) => required_str(config, QUERY_ALIAS)?,
            None => return Err(missing("query")),
        };

        let schema = match config.get("schema") {
            Some(Value::Object(schema)) => Value::Object(schema.clone()),
            Some(_) => return Err(invalid("schema", "must be a JSON object")),
            None => return Err(missing("schema")),
        };

        Ok(Self {
            max_concurrency: usize::try_from(max_concurrency)
                .map_err(|_| invalid(MAX_CONCURRENCY, "is too large"))?,
            tolerated_failure_percentage: tolerated,
            similarity_search_max_results: u32::try_from(max_results)
                .map_err(|_| invalid(SIMILARITY_SEARCH_MAX_RESULTS, "is too large"))?,
            query,
            model: required_str(config, "model")?,
            schema,
            instructions: required_str(config, "instructions")?,
        })
    }
}

fn missing(key: &str) -> PipelineError {
    PipelineError::Configuration(format!("missing required input '{key}'"))
}

fn invalid(key: &str, problem: &str) -> PipelineError {
    PipelineError::Configuration(format!("'{key}' {problem}"))
}

fn positive_int(config: &ConfigMap, key: &str) -> PipelineResult<u64> {
    match config.get(key) {
        Some(value) => match value.as_u64() {
            Some(n) if n >= 1 => Ok(n),
            _ => Err(invalid(key, "must be an integer >= 1")),
        },
        None => Err(missing(key)),
    }
}

fn required_str(config: &ConfigMap, key: &str) -> PipelineResult<String> {
    match config.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(invalid(key, "must be a string")),
        None => Err(missing(key)),
    }
}

/// Check that an execution id is usable as a single staging key segment
pub fn validate_execution_id(execution_id: &str) -> PipelineResult<()> {
    let well_formed = !execution_id.is_empty()
        && execution_id.len() <= MAX_EXECUTION_ID_LEN
        && execution_id != "."
        && execution_id != ".."
        && execution_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if well_formed {
        Ok(())
    } else {
        Err(PipelineError::Configuration(format!(
            "invalid execution id '{execution_id}'"
        )))
    }
}

/// Generate a fresh execution id
#[must_use]
pub fn new_execution_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Per-run state owned by the coordinator.
///
/// The identifier and configuration are fixed at creation; stage outputs
/// accumulate as the run advances.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    execution_id: String,
    config: ConfigMap,
    settings: PipelineSettings,
    layout: StagingLayout,

    /// Prefix the split stage wrote chunks under
    pub split_prefix: Option<String>,

    /// Key of the embedding stage manifest
    pub embedding_manifest: Option<String>,

    /// Key of the search stage's selected candidates
    pub search_results: Option<String>,

    /// Key of the extraction stage manifest
    pub extraction_manifest: Option<String>,
}

impl ExecutionContext {
    /// Apply defaults to `input`, validate, and place the run under today's
    /// staging partition
    pub fn new(execution_id: impl Into<String>, input: ConfigMap) -> PipelineResult<Self> {
        let execution_id = execution_id.into();
        validate_execution_id(&execution_id)?;
        let layout = StagingLayout::today(&execution_id);
        Self::with_layout(execution_id, input, layout)
    }

    /// Like [`new`](Self::new) with an explicit staging layout
    pub fn with_layout(
        execution_id: impl Into<String>,
        input: ConfigMap,
        layout: StagingLayout,
    ) -> PipelineResult<Self> {
        let execution_id = execution_id.into();
        validate_execution_id(&execution_id)?;

        let config = merge_defaults(&default_config(), &input);
        let settings = PipelineSettings::from_config(&config)?;

        Ok(Self {
            execution_id,
            config,
            settings,
            layout,
            split_prefix: None,
            embedding_manifest: None,
            search_results: None,
            extraction_manifest: None,
        })
    }

    #[must_use]
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    #[must_use]
    pub fn config(&self) -> &ConfigMap {
        &self.config
    }

    #[must_use]
    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    #[must_use]
    pub fn layout(&self) -> &StagingLayout {
        &self.layout
    }

    /// Namespace for every object written during this run
    #[must_use]
    pub fn staging_prefix(&self) -> &str {
        self.layout.prefix()
    }
}
