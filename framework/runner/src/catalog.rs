//! Loading and validation of the ordered list of benchmark scenarios.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use spark_tunnel_summary_model::ScenarioParameters;

/// A single benchmark configuration.
///
/// A scenario can only be created through validation, so every scenario handed to the rest of
/// the runner has a usable name and strictly positive resources.
#[derive(Debug, Clone, PartialEq)]
pub struct Scenario {
    name: String,
    parameters: ScenarioParameters,
    remark: Option<String>,
}

impl Scenario {
    pub fn new(
        name: impl Into<String>,
        parameters: ScenarioParameters,
    ) -> Result<Self, ScenarioError> {
        let name = name.into();
        validate_name(&name)?;
        validate_parameters(&parameters)?;

        Ok(Self {
            name,
            parameters,
            remark: None,
        })
    }

    pub fn with_remark(mut self, remark: impl Into<String>) -> Self {
        self.remark = Some(remark.into());
        self
    }

    /// Unique within a batch, ignoring case, and safe to use as a single path segment.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameters(&self) -> &ScenarioParameters {
        &self.parameters
    }

    pub fn worker_count(&self) -> u32 {
        self.parameters.num_workers
    }

    /// Memory per worker, in GB
    pub fn memory_per_worker(&self) -> f64 {
        self.parameters.mem_per_worker
    }

    pub fn cores_per_worker(&self) -> u32 {
        self.parameters.cores_per_worker
    }

    pub fn dataset_scale(&self) -> f64 {
        self.parameters.dataset_scale
    }

    pub fn remark(&self) -> Option<&str> {
        self.remark.as_deref()
    }
}

/// Why a single scenario entry was rejected.
#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("{0}")]
    Malformed(#[source] serde_json::Error),
    #[error("field `{field}` must be positive, got {value}")]
    NonPositive { field: &'static str, value: String },
    #[error("name '{name}' {reason}")]
    InvalidName { name: String, reason: &'static str },
}

/// The scenario configuration could not be used. No scenario is run when this is returned.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read scenario configuration '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid JSON: {0}")]
    Json(#[source] serde_json::Error),
    #[error("Configuration must be a JSON array (list)")]
    NotAnArray,
    #[error("No configurations to run")]
    Empty,
    #[error("Configuration {index} is invalid: {source}")]
    Entry {
        index: usize,
        #[source]
        source: ScenarioError,
    },
    #[error("Configuration {second} reuses the name '{name}' of configuration {first} (names are compared ignoring case)")]
    DuplicateName {
        name: String,
        first: usize,
        second: usize,
    },
}

/// One entry of the configuration file, as written by users.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScenarioEntry {
    name: String,
    num_workers: i64,
    mem_per_worker: f64,
    cores_per_worker: i64,
    dataset_scale: f64,
    #[serde(default)]
    remark: Option<String>,
    /// Accepted so that existing configuration files still load. Results are always written under
    /// the results root instead.
    #[serde(default)]
    log_dir: Option<String>,
}

/// Read and validate the scenario configuration file at `path`.
pub fn load_scenarios(path: impl AsRef<Path>) -> Result<Vec<Scenario>, ConfigError> {
    let path = path.as_ref();
    log::debug!("Loading scenarios from {}", path.display());

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    parse_scenarios(&content)
}

/// Validate a scenario configuration document.
///
/// The first violation found is returned and no scenarios are returned with it.
pub fn parse_scenarios(content: &str) -> Result<Vec<Scenario>, ConfigError> {
    let document: serde_json::Value = serde_json::from_str(content).map_err(ConfigError::Json)?;
    let serde_json::Value::Array(entries) = document else {
        return Err(ConfigError::NotAnArray);
    };

    if entries.is_empty() {
        return Err(ConfigError::Empty);
    }

    // Keyed by lowercase name, result directories may share a case-insensitive filesystem
    let mut seen = HashMap::with_capacity(entries.len());
    let mut scenarios = Vec::with_capacity(entries.len());
    for (index, value) in entries.into_iter().enumerate() {
        let scenario = parse_entry(value).map_err(|source| ConfigError::Entry { index, source })?;

        if let Some(first) = seen.insert(scenario.name.to_lowercase(), index) {
            return Err(ConfigError::DuplicateName {
                name: scenario.name,
                first,
                second: index,
            });
        }

        scenarios.push(scenario);
    }

    log::info!("{} configuration(s) ready to run", scenarios.len());

    Ok(scenarios)
}

fn parse_entry(value: serde_json::Value) -> Result<Scenario, ScenarioError> {
    let entry: ScenarioEntry = serde_json::from_value(value).map_err(ScenarioError::Malformed)?;

    if let Some(log_dir) = &entry.log_dir {
        log::warn!(
            "Ignoring log_dir '{log_dir}' for scenario '{}', results are written under the results root",
            entry.name
        );
    }

    let parameters = ScenarioParameters {
        num_workers: positive_count("num_workers", entry.num_workers)?,
        mem_per_worker: entry.mem_per_worker,
        cores_per_worker: positive_count("cores_per_worker", entry.cores_per_worker)?,
        dataset_scale: entry.dataset_scale,
    };

    let scenario = Scenario::new(entry.name, parameters)?;
    Ok(match entry.remark {
        Some(remark) => scenario.with_remark(remark),
        None => scenario,
    })
}

fn positive_count(field: &'static str, value: i64) -> Result<u32, ScenarioError> {
    u32::try_from(value)
        .ok()
        .filter(|v| *v >= 1)
        .ok_or(ScenarioError::NonPositive {
            field,
            value: value.to_string(),
        })
}

fn validate_parameters(parameters: &ScenarioParameters) -> Result<(), ScenarioError> {
    if parameters.num_workers == 0 {
        return Err(ScenarioError::NonPositive {
            field: "num_workers",
            value: "0".to_string(),
        });
    }
    if parameters.cores_per_worker == 0 {
        return Err(ScenarioError::NonPositive {
            field: "cores_per_worker",
            value: "0".to_string(),
        });
    }
    for (field, value) in [
        ("mem_per_worker", parameters.mem_per_worker),
        ("dataset_scale", parameters.dataset_scale),
    ] {
        if !(value.is_finite() && value > 0.0) {
            return Err(ScenarioError::NonPositive {
                field,
                value: value.to_string(),
            });
        }
    }

    Ok(())
}

fn validate_name(name: &str) -> Result<(), ScenarioError> {
    let reason = if name.trim().is_empty() {
        Some("must not be empty")
    } else if name == "." || name == ".." {
        Some("must not be a relative path component")
    } else if name.contains(['/', '\\']) {
        Some("must not contain path separators")
    } else if name.chars().any(char::is_control) {
        Some("must not contain control characters")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(ScenarioError::InvalidName {
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}
