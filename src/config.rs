use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::models::{Destination, StepDefinition};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FunnelConfig {
    pub funnel_name: String,
    pub source: SourceBindings,
    pub destination: Destination,
    #[serde(default)]
    pub time_period_days: Option<i64>,
    #[serde(default)]
    pub filters: Vec<String>,
    pub steps: Vec<StepDefinition>,
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub dimension_lookup: Option<DimensionLookup>,
    #[serde(default)]
    pub conversion_mode: ConversionMode,
    #[serde(default)]
    pub backfill_skipped_steps: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SourceBindings {
    pub table: String,
    pub user_id_column: String,
    /// Without a session column every user is treated as a single session.
    #[serde(default)]
    pub session_id_column: Option<String>,
    pub event_column: String,
    pub timestamp_column: String,
    #[serde(default)]
    pub properties_column: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DimensionLookup {
    pub table: String,
    pub user_id_column: String,
    #[serde(default)]
    pub session_id_column: Option<String>,
    pub observed_at_column: String,
    /// JSON column holding the attributes by dimension name. Without it each
    /// dimension is read from the column of the same name.
    #[serde(default)]
    pub attributes_column: Option<String>,
    #[serde(default)]
    pub selection: SelectionRule,
}

/// Which attribute record wins when the lookup source has several for a key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionRule {
    #[default]
    Latest,
    Earliest,
}

/// What `converted` means for a funnel row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionMode {
    /// Any later event in the session counts, including a return to an
    /// earlier step.
    #[default]
    AnyLaterEvent,
    /// Only a later event with a strictly greater step rank counts.
    HigherRank,
}

impl fmt::Display for ConversionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversionMode::AnyLaterEvent => write!(f, "any_later_event"),
            ConversionMode::HigherRank => write!(f, "higher_rank"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    AmbiguousEventType {
        event_type: String,
        winning_rank: u32,
        shadowed_ranks: Vec<u32>,
    },
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigWarning::AmbiguousEventType {
                event_type,
                winning_rank,
                shadowed_ranks,
            } => write!(
                f,
                "event type {event_type:?} is claimed by ranks {winning_rank} and {shadowed_ranks:?}; rank {winning_rank} wins"
            ),
        }
    }
}

impl FunnelConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Sorts steps by rank but never renumbers them.
    pub fn from_json(contents: &str) -> Result<Self, ConfigError> {
        let mut config: FunnelConfig = serde_json::from_str(contents)?;
        config.steps.sort_by_key(|step| step.rank);
        Ok(config)
    }

    pub fn max_step(&self) -> u32 {
        self.steps.iter().map(|step| step.rank).max().unwrap_or(0)
    }

    /// Checks everything that must hold before any transformation runs and
    /// returns the non-fatal findings.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, ConfigError> {
        if self.funnel_name.trim().is_empty() {
            return Err(ConfigError::MissingBinding("funnel_name"));
        }
        self.validate_bindings()?;
        self.validate_steps()?;
        self.validate_dimensions()?;

        if let Some(days) = self.time_period_days {
            if days <= 0 {
                return Err(ConfigError::InvalidValue {
                    field: "time_period_days",
                    reason: format!("must be positive, got {days}"),
                });
            }
        }
        if self.filters.iter().any(|filter| filter.trim().is_empty()) {
            return Err(ConfigError::InvalidValue {
                field: "filters",
                reason: "filter predicates must not be empty".to_string(),
            });
        }

        Ok(self.ambiguous_event_types())
    }

    fn validate_bindings(&self) -> Result<(), ConfigError> {
        let source = &self.source;
        required_identifier("source.table", &source.table)?;
        required_identifier("source.user_id_column", &source.user_id_column)?;
        required_identifier("source.event_column", &source.event_column)?;
        required_identifier("source.timestamp_column", &source.timestamp_column)?;
        optional_identifier("source.session_id_column", source.session_id_column.as_deref())?;
        optional_identifier("source.properties_column", source.properties_column.as_deref())?;

        required_identifier("destination.schema", &self.destination.schema)?;
        required_identifier("destination.prefix", &self.destination.prefix)?;
        if self.destination.prefix.contains('.') {
            return Err(ConfigError::InvalidIdentifier {
                field: "destination.prefix",
                value: self.destination.prefix.clone(),
            });
        }

        if let Some(lookup) = &self.dimension_lookup {
            required_identifier("dimension_lookup.table", &lookup.table)?;
            required_identifier("dimension_lookup.user_id_column", &lookup.user_id_column)?;
            required_identifier(
                "dimension_lookup.observed_at_column",
                &lookup.observed_at_column,
            )?;
            optional_identifier(
                "dimension_lookup.session_id_column",
                lookup.session_id_column.as_deref(),
            )?;
            optional_identifier(
                "dimension_lookup.attributes_column",
                lookup.attributes_column.as_deref(),
            )?;
        }
        Ok(())
    }

    fn validate_steps(&self) -> Result<(), ConfigError> {
        if self.steps.is_empty() {
            return Err(ConfigError::NoSteps);
        }

        let mut seen = BTreeSet::new();
        for step in &self.steps {
            if step.rank == 0 {
                return Err(ConfigError::RankGap {
                    missing: 1,
                    max_step: self.max_step(),
                });
            }
            if !seen.insert(step.rank) {
                return Err(ConfigError::DuplicateRank { rank: step.rank });
            }
            if step.name.trim().is_empty() {
                return Err(ConfigError::IncompleteStep {
                    rank: step.rank,
                    field: "name",
                });
            }
            if step.matching_event_types.is_empty()
                || step
                    .matching_event_types
                    .iter()
                    .any(|event_type| event_type.trim().is_empty())
            {
                return Err(ConfigError::IncompleteStep {
                    rank: step.rank,
                    field: "matching event types",
                });
            }
        }

        let max_step = self.max_step();
        if let Some(missing) = (1..=max_step).find(|rank| !seen.contains(rank)) {
            return Err(ConfigError::RankGap { missing, max_step });
        }
        Ok(())
    }

    fn validate_dimensions(&self) -> Result<(), ConfigError> {
        let mut seen = BTreeSet::new();
        for name in &self.dimensions {
            if !is_identifier(name) || name.contains('.') {
                return Err(ConfigError::InvalidIdentifier {
                    field: "dimensions",
                    value: name.clone(),
                });
            }
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::DuplicateDimension(name.clone()));
            }
        }
        if self.dimension_lookup.is_some() && self.dimensions.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "dimension_lookup",
                reason: "a lookup source needs at least one declared dimension".to_string(),
            });
        }
        Ok(())
    }

    fn ambiguous_event_types(&self) -> Vec<ConfigWarning> {
        let mut claims: BTreeMap<&str, Vec<u32>> = BTreeMap::new();
        for step in &self.steps {
            for event_type in &step.matching_event_types {
                claims.entry(event_type.as_str()).or_default().push(step.rank);
            }
        }

        claims
            .into_iter()
            .filter(|(_, ranks)| ranks.len() > 1)
            .map(|(event_type, mut ranks)| {
                ranks.sort_unstable();
                let winning_rank = ranks.remove(0);
                ConfigWarning::AmbiguousEventType {
                    event_type: event_type.to_string(),
                    winning_rank,
                    shadowed_ranks: ranks,
                }
            })
            .collect()
    }
}

/// Plain or schema-qualified SQL identifier: `name` or `schema.name`.
pub fn is_identifier(value: &str) -> bool {
    let parts: Vec<&str> = value.split('.').collect();
    parts.len() <= 2
        && parts.iter().all(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) if first.is_ascii_alphabetic() || first == '_' => {
                    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
                }
                _ => false,
            }
        })
}

fn required_identifier(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingBinding(field));
    }
    if !is_identifier(value) {
        return Err(ConfigError::InvalidIdentifier {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

fn optional_identifier(field: &'static str, value: Option<&str>) -> Result<(), ConfigError> {
    match value {
        Some(value) => required_identifier(field, value),
        None => Ok(()),
    }
}
