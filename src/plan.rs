//! Funnel config to ordered stages, and their in-memory execution.

use std::fmt::Write;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::backfill::backfill_skipped_steps;
use crate::classify::StepClassifier;
use crate::config::{ConfigWarning, ConversionMode, FunnelConfig, SelectionRule};
use crate::dedup::deduplicate;
use crate::dimensions::{normalize, DimensionAttacher};
use crate::error::{ConfigError, FunnelError, FunnelResult};
use crate::journey::{summarize_sessions, summarize_users};
use crate::metrics::MetricsAggregator;
use crate::models::{
    ClassifiedEvent, DimensionRecord, FunnelRow, JourneySummary, MetricRow, RawEvent, RunContext,
    RunOutput, RunStats, StepDefinition,
};
use crate::sequence::sequence;

#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Classify {
        event_column: String,
        steps: Vec<StepDefinition>,
    },
    Deduplicate {
        user_id_column: String,
        session_id_column: Option<String>,
    },
    Backfill,
    Sequence {
        user_id_column: String,
        session_id_column: Option<String>,
        timestamp_column: String,
        mode: ConversionMode,
    },
    AttachDimensions {
        dimensions: Vec<String>,
        lookup_table: Option<String>,
        selection: SelectionRule,
    },
    Summarize,
    Aggregate {
        max_step: u32,
        dimensions: Vec<String>,
    },
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Classify { .. } => "classify",
            Stage::Deduplicate { .. } => "deduplicate",
            Stage::Backfill => "backfill",
            Stage::Sequence { .. } => "sequence",
            Stage::AttachDimensions { .. } => "attach_dimensions",
            Stage::Summarize => "summarize",
            Stage::Aggregate { .. } => "aggregate",
        }
    }
}

pub struct PlanBuilder {
    config: FunnelConfig,
}

#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub funnel_name: String,
    pub stages: Vec<Stage>,
    pub steps: Vec<StepDefinition>,
    pub dimensions: Vec<String>,
    pub time_period_days: Option<i64>,
    pub warnings: Vec<ConfigWarning>,
}

impl PlanBuilder {
    pub fn new(config: FunnelConfig) -> Self {
        PlanBuilder { config }
    }

    pub fn build(self) -> Result<ExecutionPlan, ConfigError> {
        let warnings = self.config.validate()?;
        for warning in &warnings {
            warn!(funnel = %self.config.funnel_name, "{warning}");
        }

        let config = self.config;
        let source = &config.source;
        let mut stages = vec![
            Stage::Classify {
                event_column: source.event_column.clone(),
                steps: config.steps.clone(),
            },
            Stage::Deduplicate {
                user_id_column: source.user_id_column.clone(),
                session_id_column: source.session_id_column.clone(),
            },
        ];
        if config.backfill_skipped_steps {
            stages.push(Stage::Backfill);
        }
        stages.push(Stage::Sequence {
            user_id_column: source.user_id_column.clone(),
            session_id_column: source.session_id_column.clone(),
            timestamp_column: source.timestamp_column.clone(),
            mode: config.conversion_mode,
        });
        if !config.dimensions.is_empty() {
            stages.push(Stage::AttachDimensions {
                dimensions: config.dimensions.clone(),
                lookup_table: config
                    .dimension_lookup
                    .as_ref()
                    .map(|lookup| lookup.table.clone()),
                selection: config
                    .dimension_lookup
                    .as_ref()
                    .map(|lookup| lookup.selection)
                    .unwrap_or_default(),
            });
        }
        stages.push(Stage::Summarize);
        stages.push(Stage::Aggregate {
            max_step: config.max_step(),
            dimensions: config.dimensions.clone(),
        });

        Ok(ExecutionPlan {
            funnel_name: config.funnel_name,
            stages,
            steps: config.steps,
            dimensions: config.dimensions,
            time_period_days: config.time_period_days,
            warnings,
        })
    }
}

/// Intermediate relations handed from stage to stage.
#[derive(Default)]
struct PipelineState {
    classified: Vec<ClassifiedEvent>,
    rows: Vec<FunnelRow>,
    sessions: Vec<JourneySummary>,
    users: Vec<JourneySummary>,
    metrics: Vec<MetricRow>,
    stats: RunStats,
}

impl ExecutionPlan {
    /// Earliest event time included in a run, if the plan has a window.
    pub fn window_start(&self, ctx: &RunContext) -> Option<DateTime<Utc>> {
        self.time_period_days
            .map(|days| ctx.run_at - Duration::days(days))
    }

    pub fn describe(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "Plan for {}", self.funnel_name);
        for (index, stage) in self.stages.iter().enumerate() {
            let detail = match stage {
                Stage::Classify { event_column, steps } => {
                    format!("{} steps matched on {event_column}", steps.len())
                }
                Stage::Deduplicate {
                    user_id_column,
                    session_id_column,
                } => format!(
                    "one row per ({user_id_column}, {}, step)",
                    session_id_column.as_deref().unwrap_or(user_id_column)
                ),
                Stage::Backfill => "fill skipped lower steps".to_string(),
                Stage::Sequence {
                    timestamp_column,
                    mode,
                    ..
                } => format!("order by {timestamp_column}, conversion {mode}"),
                Stage::AttachDimensions {
                    dimensions,
                    lookup_table,
                    ..
                } => format!(
                    "[{}] from {}",
                    dimensions.join(", "),
                    lookup_table.as_deref().unwrap_or("event properties")
                ),
                Stage::Summarize => "session and user journeys".to_string(),
                Stage::Aggregate { max_step, .. } => {
                    format!("{max_step} stage rows + 1 e2e row per combination")
                }
            };
            let _ = writeln!(output, "{}. {}: {}", index + 1, stage.name(), detail);
        }
        output
    }

    /// Runs every stage over the given inputs.
    ///
    /// Inputs must satisfy the source contract: non-empty user id, session id
    /// and event type. Violations abort the run instead of flowing into the
    /// sequencer.
    pub fn execute(
        &self,
        ctx: &RunContext,
        events: &[RawEvent],
        records: Vec<DimensionRecord>,
    ) -> FunnelResult<RunOutput> {
        check_preconditions(events)?;
        info!(
            run_id = %ctx.run_id,
            funnel = %self.funnel_name,
            events = events.len(),
            "executing funnel plan"
        );

        let events: Vec<RawEvent> = events
            .iter()
            .cloned()
            .map(|mut event| {
                event.dimension_values = normalize(&event.dimension_values, &self.dimensions);
                event
            })
            .collect();

        let mut state = PipelineState::default();
        state.stats.raw_events = events.len();
        let mut records = Some(records);

        for stage in &self.stages {
            match stage {
                Stage::Classify { steps, .. } => {
                    let (classified, coverage) = StepClassifier::new(steps).classify_events(&events);
                    state.stats.matched_events = coverage.matched_by_rank.values().sum();
                    state.stats.unmapped_by_type = coverage.unmapped_by_type;
                    state.classified = classified;
                }
                Stage::Deduplicate { .. } => {
                    let output = deduplicate(std::mem::take(&mut state.classified));
                    state.stats.duplicates_removed = output.duplicates_removed;
                    state.rows = output.rows;
                }
                Stage::Backfill => {
                    state.stats.backfilled_rows = backfill_skipped_steps(&mut state.rows, &self.steps);
                }
                Stage::Sequence { mode, .. } => {
                    state.rows = sequence(std::mem::take(&mut state.rows), *mode);
                }
                Stage::AttachDimensions {
                    dimensions,
                    selection,
                    ..
                } => {
                    let attacher =
                        DimensionAttacher::new(dimensions, records.take().unwrap_or_default(), *selection);
                    attacher.attach(&mut state.rows);
                }
                Stage::Summarize => {
                    state.sessions = summarize_sessions(&state.rows);
                    state.users = summarize_users(&state.rows);
                }
                Stage::Aggregate { dimensions, .. } => {
                    state.metrics = MetricsAggregator::new(&self.steps, dimensions).aggregate(
                        &state.rows,
                        &state.sessions,
                        &state.users,
                    );
                }
            }
        }

        state.stats.funnel_rows = state.rows.len();
        state.stats.sessions = state.sessions.len();
        state.stats.users = state.users.len();
        state.stats.metric_rows = state.metrics.len();

        let stats = &state.stats;
        if stats.unmapped_events() > 0 {
            warn!(
                run_id = %ctx.run_id,
                unmapped = stats.unmapped_events(),
                event_types = stats.unmapped_by_type.len(),
                "events matched no step and were left out of the funnel"
            );
        }
        info!(
            run_id = %ctx.run_id,
            funnel_rows = stats.funnel_rows,
            duplicates_removed = stats.duplicates_removed,
            backfilled = stats.backfilled_rows,
            metric_rows = stats.metric_rows,
            "funnel plan finished"
        );

        Ok(RunOutput {
            funnel_rows: state.rows,
            metrics: state.metrics,
            stats: state.stats,
        })
    }
}

fn check_preconditions(events: &[RawEvent]) -> FunnelResult<()> {
    for (index, event) in events.iter().enumerate() {
        let missing = if event.user_id.is_empty() {
            Some("user_id")
        } else if event.session_id.is_empty() {
            Some("session_id")
        } else if event.event_type.is_empty() {
            Some("event_type")
        } else {
            None
        };
        if let Some(field) = missing {
            return Err(FunnelError::InvalidInput(format!(
                "event {index} has an empty {field}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnalysisLevel, Destination, DimensionValues};
    use crate::testing::{at, checkout_config, event, sample_config_json, with_dimension};

    fn context() -> RunContext {
        RunContext::new(Destination {
            schema: "funnel_out".to_string(),
            prefix: "checkout".to_string(),
        })
    }

    fn scenario_events() -> Vec<RawEvent> {
        vec![
            event("a", "a1", "LoadedHome", 0),
            event("a", "a1", "ViewedCart", 2),
            event("a", "a1", "PaymentSucceeded", 5),
            event("b", "b1", "LoadedHome", 0),
            event("c", "c1", "LoadedHome", 1),
            event("c", "c1", "ViewedCart", 3),
            event("c", "c1", "ViewedCart", 8),
            event("c", "c1", "Heartbeat", 9),
        ]
    }

    fn stage<'a>(metrics: &'a [MetricRow], rank: u32) -> &'a MetricRow {
        metrics
            .iter()
            .find(|m| m.step_rank == Some(rank))
            .unwrap()
    }

    #[test]
    fn builds_stages_in_pipeline_order() {
        let plan = PlanBuilder::new(checkout_config()).build().unwrap();
        let names: Vec<&str> = plan.stages.iter().map(Stage::name).collect();
        assert_eq!(
            names,
            vec!["classify", "deduplicate", "sequence", "summarize", "aggregate"]
        );

        let mut config = FunnelConfig::from_json(&sample_config_json()).unwrap();
        config.backfill_skipped_steps = true;
        let plan = PlanBuilder::new(config).build().unwrap();
        let names: Vec<&str> = plan.stages.iter().map(Stage::name).collect();
        assert_eq!(
            names,
            vec![
                "classify",
                "deduplicate",
                "backfill",
                "sequence",
                "attach_dimensions",
                "summarize",
                "aggregate"
            ]
        );
        assert!(plan.describe().contains("order by occurred_at"));
    }

    #[test]
    fn invalid_config_fails_before_any_stage() {
        let mut config = checkout_config();
        config.steps[1].rank = 5;
        assert!(matches!(
            PlanBuilder::new(config).build(),
            Err(ConfigError::RankGap { .. })
        ));
    }

    #[test]
    fn window_is_relative_to_the_run() {
        let plan = PlanBuilder::new(checkout_config()).build().unwrap();
        let mut ctx = context();
        ctx.run_at = at(0);
        assert_eq!(plan.window_start(&ctx), Some(at(-30 * 24 * 60)));
    }

    #[test]
    fn checkout_scenario_end_to_end() {
        let plan = PlanBuilder::new(checkout_config()).build().unwrap();
        let output = plan.execute(&context(), &scenario_events(), Vec::new()).unwrap();

        let a_rows: Vec<&FunnelRow> = output.funnel_rows.iter().filter(|r| r.user_id == "a").collect();
        assert_eq!(a_rows.len(), 3);
        assert!(a_rows[0].converted && a_rows[1].converted);
        assert!(!a_rows[2].converted);

        let b_rows: Vec<&FunnelRow> = output.funnel_rows.iter().filter(|r| r.user_id == "b").collect();
        assert_eq!(b_rows.len(), 1);
        assert!(!b_rows[0].converted);

        let c_carts: Vec<&FunnelRow> = output
            .funnel_rows
            .iter()
            .filter(|r| r.user_id == "c" && r.step_name == "Cart")
            .collect();
        assert_eq!(c_carts.len(), 1);
        assert_eq!(c_carts[0].entered_at, at(8));

        let home = stage(&output.metrics, 1);
        assert_eq!(home.starters_count, 3);
        assert_eq!(home.completers_count, 2);
        assert_eq!(home.dropoffs_count, 1);

        let overall = output
            .metrics
            .iter()
            .find(|m| m.analysis_level == AnalysisLevel::E2e)
            .unwrap();
        assert_eq!(overall.starters_count, 3);
        assert_eq!(overall.completers_count, 1);

        assert_eq!(output.stats.raw_events, 8);
        assert_eq!(output.stats.duplicates_removed, 1);
        assert_eq!(output.stats.unmapped_by_type.get("Heartbeat"), Some(&1));
        assert_eq!(output.stats.funnel_rows, 6);
    }

    #[test]
    fn reruns_are_identical() {
        let plan = PlanBuilder::new(checkout_config()).build().unwrap();
        let first = plan.execute(&context(), &scenario_events(), Vec::new()).unwrap();
        let mut shuffled = scenario_events();
        shuffled.reverse();
        let second = plan.execute(&context(), &shuffled, Vec::new()).unwrap();

        assert_eq!(first.funnel_rows, second.funnel_rows);
        assert_eq!(first.metrics, second.metrics);
    }

    #[test]
    fn dimensions_from_events_and_lookup_slice_metrics() {
        let mut config = FunnelConfig::from_json(&sample_config_json()).unwrap();
        config.dimensions.push("tier".to_string());
        let plan = PlanBuilder::new(config).build().unwrap();

        let events = vec![
            with_dimension(event("a", "a1", "LoadedHome", 0), "app_version", Some("2.1")),
            with_dimension(event("a", "a1", "ViewedCart", 1), "app_version", Some("2.1")),
            with_dimension(event("b", "b1", "LoadedHome", 0), "app_version", Some("2.1")),
        ];
        let mut values = DimensionValues::new();
        values.insert("tier".to_string(), Some("gold".to_string()));
        let records = vec![DimensionRecord {
            user_id: "a".to_string(),
            session_id: None,
            observed_at: at(0),
            values,
        }];

        let output = plan.execute(&context(), &events, records).unwrap();
        let a_home = &output.funnel_rows[0];
        assert_eq!(a_home.dimension_values.get("tier"), Some(&Some("gold".to_string())));
        assert_eq!(
            a_home.dimension_values.get("app_version"),
            Some(&Some("2.1".to_string()))
        );

        // a (gold) and b (no tier) land in separate combinations
        assert_eq!(output.metrics.len(), 8);
    }

    #[test]
    fn mid_session_dimension_changes_keep_the_journey_whole() {
        let plan = PlanBuilder::new(FunnelConfig::from_json(&sample_config_json()).unwrap())
            .build()
            .unwrap();
        let events = vec![
            event("a", "a1", "LoadedHome", 0),
            with_dimension(event("a", "a1", "ViewedCart", 1), "app_version", Some("2.1")),
            with_dimension(event("a", "a1", "PaymentSucceeded", 2), "app_version", Some("2.2")),
        ];
        let output = plan.execute(&context(), &events, Vec::new()).unwrap();

        assert!(output
            .funnel_rows
            .iter()
            .all(|r| r.dimension_values.get("app_version") == Some(&Some("2.1".to_string()))));
        let e2e_rows: Vec<&MetricRow> = output
            .metrics
            .iter()
            .filter(|m| m.analysis_level == AnalysisLevel::E2e)
            .collect();
        assert_eq!(e2e_rows.len(), 1);
        assert_eq!(e2e_rows[0].starters_count, 1);
        assert_eq!(e2e_rows[0].completers_count, 1);
        assert_eq!(stage(&output.metrics, 3).avg_time_to_reach_seconds, Some(120.0));
    }

    #[test]
    fn empty_identifiers_abort_the_run() {
        let plan = PlanBuilder::new(checkout_config()).build().unwrap();
        let events = vec![event("", "s1", "LoadedHome", 0)];
        assert!(matches!(
            plan.execute(&context(), &events, Vec::new()),
            Err(FunnelError::InvalidInput(_))
        ));
    }
}
