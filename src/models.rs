use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Declared dimension name to value. Every entity carries the full declared
/// key set; a missing value is `None`, never an absent key.
pub type DimensionValues = BTreeMap<String, Option<String>>;

/// Builds a map holding every declared dimension, all unset.
pub fn empty_dimensions(names: &[String]) -> DimensionValues {
    names.iter().map(|name| (name.clone(), None)).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub user_id: String,
    pub session_id: String,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub dimension_values: DimensionValues,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub rank: u32,
    #[serde(alias = "screen_name")]
    pub name: String,
    #[serde(alias = "loaded_events")]
    pub matching_event_types: BTreeSet<String>,
}

/// An event after classification. `step_rank` is `None` for events that match
/// no step; their `step_name` is the raw event type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedEvent {
    pub user_id: String,
    pub session_id: String,
    pub event_type: String,
    pub step_name: String,
    pub step_rank: Option<u32>,
    pub occurred_at: DateTime<Utc>,
    pub dimension_values: DimensionValues,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunnelRow {
    pub user_id: String,
    pub session_id: String,
    pub step_name: String,
    pub step_rank: u32,
    pub entered_at: DateTime<Utc>,
    pub previous_step_name: Option<String>,
    pub next_entered_at: Option<DateTime<Utc>>,
    pub converted: bool,
    pub time_to_convert_seconds: Option<i64>,
    pub backfilled: bool,
    pub dimension_values: DimensionValues,
}

impl FunnelRow {
    /// A row with no sequencing signals yet.
    pub fn unsequenced(
        user_id: String,
        session_id: String,
        step_name: String,
        step_rank: u32,
        entered_at: DateTime<Utc>,
        dimension_values: DimensionValues,
    ) -> Self {
        FunnelRow {
            user_id,
            session_id,
            step_name,
            step_rank,
            entered_at,
            previous_step_name: None,
            next_entered_at: None,
            converted: false,
            time_to_convert_seconds: None,
            backfilled: false,
            dimension_values,
        }
    }

    pub fn session_key(&self) -> (String, String) {
        (self.user_id.clone(), self.session_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JourneySummary {
    pub user_id: String,
    /// `None` for user-granularity summaries.
    pub session_id: Option<String>,
    pub dimension_values: DimensionValues,
    pub first_step_reached: u32,
    pub last_step_reached: u32,
    pub distinct_steps_count: usize,
    pub first_entered_at: DateTime<Utc>,
    pub last_entered_at: DateTime<Utc>,
    pub total_elapsed_seconds: i64,
    pub session_count: usize,
}

/// One row of the external attribute source used by the dimension attacher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimensionRecord {
    pub user_id: String,
    pub session_id: Option<String>,
    pub observed_at: DateTime<Utc>,
    pub values: DimensionValues,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisLevel {
    Stage,
    E2e,
}

impl AnalysisLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisLevel::Stage => "stage",
            AnalysisLevel::E2e => "e2e",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "stage" => Some(AnalysisLevel::Stage),
            "e2e" => Some(AnalysisLevel::E2e),
            _ => None,
        }
    }
}

/// Step-level and end-to-end metrics share one shape; end-to-end rows have no
/// step rank or name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricRow {
    pub analysis_level: AnalysisLevel,
    pub step_rank: Option<u32>,
    pub step_name: Option<String>,
    pub dimension_values: DimensionValues,
    pub starters_count: u64,
    pub completers_count: u64,
    pub dropoffs_count: u64,
    pub conversion_rate_pct: Option<f64>,
    pub dropoff_rate_pct: Option<f64>,
    pub avg_time_to_reach_seconds: Option<f64>,
    pub avg_time_to_convert_seconds: Option<f64>,
    pub avg_sessions_to_reach: Option<f64>,
    pub avg_sessions_to_convert: Option<f64>,
}

/// Identity of the two output relations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub schema: String,
    pub prefix: String,
}

impl Destination {
    pub fn funnel_table(&self) -> String {
        format!("{}.{}_funnel", self.schema, self.prefix)
    }

    pub fn metrics_table(&self) -> String {
        format!("{}.{}_metrics", self.schema, self.prefix)
    }
}

/// Passed through every stage in place of ambient "current run" state.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub run_at: DateTime<Utc>,
    pub destination: Destination,
}

impl RunContext {
    pub fn new(destination: Destination) -> Self {
        RunContext {
            run_id: Uuid::new_v4(),
            run_at: Utc::now(),
            destination,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub raw_events: usize,
    pub matched_events: usize,
    pub unmapped_by_type: BTreeMap<String, usize>,
    pub duplicates_removed: usize,
    pub backfilled_rows: usize,
    pub funnel_rows: usize,
    pub sessions: usize,
    pub users: usize,
    pub metric_rows: usize,
}

impl RunStats {
    pub fn unmapped_events(&self) -> usize {
        self.unmapped_by_type.values().sum()
    }
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub funnel_rows: Vec<FunnelRow>,
    pub metrics: Vec<MetricRow>,
    pub stats: RunStats,
}
