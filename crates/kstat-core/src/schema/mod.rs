//! Declarative kstat schema.
//!
//! The schema describes which kernel statistics are collected: a list of
//! kstat modules, each with named groups (`kstat_names`), each with the
//! individual counters (`kstat_stats`) to read. Defaults are applied once at
//! load time so the rest of the pipeline never has to care about missing
//! fields.
//!
//! ```yaml
//! kstat_modules:
//!   - id: cpu
//!     kstat_names:
//!       - id: sys
//!         label_string: cpu
//!         kstat_stats:
//!           - id: syscall
//!             help: "System calls."
//! ```

mod pattern;

use std::path::Path;

use serde::Deserialize;

pub use pattern::GroupPattern;

/// Label name used when a group does not configure one.
pub const DEFAULT_LABEL: &str = "instance";

/// Output suffix used when a counter does not configure one.
pub const DEFAULT_SUFFIX: &str = "total";

/// Error type for schema loading failures.
#[derive(Debug)]
pub enum SchemaError {
    /// Schema file could not be read.
    Io(std::io::Error),
    /// Document is not valid YAML or does not have the expected shape.
    Parse(serde_yaml::Error),
    /// Group id is not a valid regular expression.
    Pattern { module: String, group: String, source: regex::Error },
    /// Document parsed but contains an unusable value.
    Invalid(String),
}

impl std::fmt::Display for SchemaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaError::Io(e) => write!(f, "cannot read kstat schema: {}", e),
            SchemaError::Parse(e) => write!(f, "malformed kstat schema: {}", e),
            SchemaError::Pattern {
                module,
                group,
                source,
            } => write!(f, "invalid group pattern {}::{}: {}", module, group, source),
            SchemaError::Invalid(msg) => write!(f, "invalid kstat schema: {}", msg),
        }
    }
}

impl std::error::Error for SchemaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SchemaError::Io(e) => Some(e),
            SchemaError::Parse(e) => Some(e),
            SchemaError::Pattern { source, .. } => Some(source),
            SchemaError::Invalid(_) => None,
        }
    }
}

impl From<std::io::Error> for SchemaError {
    fn from(e: std::io::Error) -> Self {
        SchemaError::Io(e)
    }
}

impl From<serde_yaml::Error> for SchemaError {
    fn from(e: serde_yaml::Error) -> Self {
        SchemaError::Parse(e)
    }
}

/// A fully defaulted kstat schema.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    pub modules: Vec<Module>,
}

/// A kstat module (e.g. `cpu`, `unix`, `zfs`).
#[derive(Debug, Clone)]
pub struct Module {
    pub id: String,
    pub groups: Vec<Group>,
}

/// A kstat name inside a module, matched exactly or by pattern.
#[derive(Debug, Clone)]
pub struct Group {
    pub pattern: GroupPattern,
    /// Label name carrying the instance number.
    pub label: String,
    pub counters: Vec<Counter>,
}

/// A single named kstat statistic.
#[derive(Debug, Clone, PartialEq)]
pub struct Counter {
    /// Raw kstat statistic key.
    pub id: String,
    pub help: String,
    pub suffix: String,
    /// Multiplier applied to the raw value before truncation.
    pub scale: f64,
}

impl Group {
    /// Returns the configured group id (the pattern source).
    pub fn id(&self) -> &str {
        self.pattern.as_str()
    }
}

// Raw document shape. Field names follow the deployed configuration files.

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSchema {
    #[serde(default)]
    kstat_modules: Vec<RawModule>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawModule {
    id: String,
    #[serde(default)]
    kstat_names: Vec<RawGroup>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGroup {
    id: String,
    #[serde(default)]
    label_string: Option<String>,
    #[serde(default)]
    kstat_stats: Vec<RawCounter>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCounter {
    id: String,
    #[serde(default)]
    help: Option<String>,
    #[serde(default)]
    suffix: Option<String>,
    #[serde(default)]
    scale_factor: Option<f64>,
}

impl Schema {
    /// Loads and validates a schema file.
    ///
    /// # Arguments
    /// * `path` - Path to the YAML schema document
    ///
    /// # Returns
    /// The defaulted schema, or an error if the file cannot be read, is
    /// malformed, or contains an invalid group pattern.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    /// Parses and validates a schema from YAML text.
    pub fn from_yaml_str(content: &str) -> Result<Self, SchemaError> {
        let raw: RawSchema = serde_yaml::from_str(content)?;

        let mut modules = Vec::with_capacity(raw.kstat_modules.len());
        for raw_module in raw.kstat_modules {
            modules.push(build_module(raw_module)?);
        }

        Ok(Schema { modules })
    }

    /// Total number of configured counters across all groups.
    pub fn counter_count(&self) -> usize {
        self.modules
            .iter()
            .flat_map(|m| &m.groups)
            .map(|g| g.counters.len())
            .sum()
    }
}

fn build_module(raw: RawModule) -> Result<Module, SchemaError> {
    if is_blank(&raw.id) {
        return Err(SchemaError::Invalid("module with empty id".into()));
    }

    let mut groups = Vec::with_capacity(raw.kstat_names.len());
    for raw_group in raw.kstat_names {
        groups.push(build_group(&raw.id, raw_group)?);
    }

    Ok(Module {
        id: raw.id,
        groups,
    })
}

fn build_group(module: &str, raw: RawGroup) -> Result<Group, SchemaError> {
    if is_blank(&raw.id) {
        return Err(SchemaError::Invalid(format!(
            "group with empty id in module {}",
            module
        )));
    }

    let pattern = GroupPattern::new(&raw.id).map_err(|source| SchemaError::Pattern {
        module: module.to_string(),
        group: raw.id.clone(),
        source,
    })?;

    let label = non_empty(raw.label_string).unwrap_or_else(|| DEFAULT_LABEL.to_string());

    let mut counters = Vec::with_capacity(raw.kstat_stats.len());
    for stat in raw.kstat_stats {
        if is_blank(&stat.id) {
            return Err(SchemaError::Invalid(format!(
                "counter with empty id in {}::{}",
                module, raw.id
            )));
        }

        let help = non_empty(stat.help)
            .unwrap_or_else(|| format!("{}::{}:{}", module, raw.id, stat.id));
        let suffix = non_empty(stat.suffix).unwrap_or_else(|| DEFAULT_SUFFIX.to_string());
        // Zero is what an absent field used to deserialize to, so it means "unset".
        let scale = match stat.scale_factor {
            Some(s) if s != 0.0 => s,
            _ => 1.0,
        };

        if !scale.is_finite() {
            return Err(SchemaError::Invalid(format!(
                "non-finite scale_factor for {}::{}:{}",
                module, raw.id, stat.id
            )));
        }

        counters.push(Counter {
            id: stat.id,
            help,
            suffix,
            scale,
        });
    }

    Ok(Group {
        pattern,
        label,
        counters,
    })
}

fn is_blank(id: &str) -> bool {
    id.trim().is_empty()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}
