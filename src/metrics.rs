use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use tracing::debug;

use crate::models::{
    empty_dimensions, AnalysisLevel, DimensionValues, FunnelRow, JourneySummary, MetricRow,
    StepDefinition,
};

/// Counts are distinct users; rates and averages are `None` over an empty subset.
pub struct MetricsAggregator<'a> {
    steps: &'a [StepDefinition],
    dimensions: &'a [String],
}

/// Everything belonging to one dimension combination.
struct Slice<'a> {
    rows: Vec<&'a FunnelRow>,
    sessions: Vec<&'a JourneySummary>,
    users: Vec<&'a JourneySummary>,
}

impl<'a> Slice<'a> {
    fn new() -> Self {
        Slice {
            rows: Vec::new(),
            sessions: Vec::new(),
            users: Vec::new(),
        }
    }
}

impl<'a> MetricsAggregator<'a> {
    pub fn new(steps: &'a [StepDefinition], dimensions: &'a [String]) -> Self {
        MetricsAggregator { steps, dimensions }
    }

    fn max_step(&self) -> u32 {
        self.steps.iter().map(|step| step.rank).max().unwrap_or(0)
    }

    /// `sessions` and `users` are the session- and user-granularity journey
    /// summaries of `rows`.
    pub fn aggregate(
        &self,
        rows: &[FunnelRow],
        sessions: &[JourneySummary],
        users: &[JourneySummary],
    ) -> Vec<MetricRow> {
        let unsliced = empty_dimensions(self.dimensions);
        let mut slices: BTreeMap<&DimensionValues, Slice> = BTreeMap::new();
        for row in rows {
            slices
                .entry(&row.dimension_values)
                .or_insert_with(Slice::new)
                .rows
                .push(row);
        }
        for journey in sessions {
            slices
                .entry(&journey.dimension_values)
                .or_insert_with(Slice::new)
                .sessions
                .push(journey);
        }
        for journey in users {
            slices
                .entry(&journey.dimension_values)
                .or_insert_with(Slice::new)
                .users
                .push(journey);
        }

        if slices.is_empty() {
            slices.insert(&unsliced, Slice::new());
        }

        let mut metrics = Vec::new();
        for (dimensions, slice) in &slices {
            let ordinals = session_ordinals(&slice.sessions);
            for step in self.ordered_steps() {
                metrics.push(self.step_metric(step, dimensions, slice, &ordinals));
            }
            metrics.push(self.end_to_end_metric(dimensions, slice));
        }

        debug!(
            combinations = slices.len(),
            rows = metrics.len(),
            "aggregated funnel metrics"
        );
        metrics
    }

    fn ordered_steps(&self) -> Vec<&StepDefinition> {
        let mut steps: Vec<&StepDefinition> = self.steps.iter().collect();
        steps.sort_by_key(|step| step.rank);
        steps
    }

    fn step_metric(
        &self,
        step: &StepDefinition,
        dimensions: &DimensionValues,
        slice: &Slice,
        ordinals: &HashMap<(&str, &str), usize>,
    ) -> MetricRow {
        let at_step: Vec<&FunnelRow> = slice
            .rows
            .iter()
            .copied()
            .filter(|row| row.step_rank == step.rank)
            .collect();

        let session_start: HashMap<(&str, &str), DateTime<Utc>> = slice
            .sessions
            .iter()
            .filter_map(|journey| {
                journey
                    .session_id
                    .as_deref()
                    .map(|session| ((journey.user_id.as_str(), session), journey.first_entered_at))
            })
            .collect();

        // user -> earliest session ordinal reaching / converting at this step
        let mut reached: BTreeMap<&str, usize> = BTreeMap::new();
        let mut converted: BTreeMap<&str, usize> = BTreeMap::new();
        let mut convert_times: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
        for row in &at_step {
            let ordinal = ordinals
                .get(&(row.user_id.as_str(), row.session_id.as_str()))
                .copied()
                .unwrap_or(1);
            keep_min(&mut reached, &row.user_id, ordinal);
            if row.converted {
                keep_min(&mut converted, &row.user_id, ordinal);
                if let Some(seconds) = row.time_to_convert_seconds {
                    convert_times
                        .entry(row.user_id.as_str())
                        .or_default()
                        .push(seconds as f64);
                }
            }
        }

        let time_to_reach = mean(at_step.iter().filter_map(|row| {
            session_start
                .get(&(row.user_id.as_str(), row.session_id.as_str()))
                .map(|start| (row.entered_at - *start).num_seconds() as f64)
        }));
        // mean per converting user, then across users
        let time_to_convert = mean(
            convert_times
                .values()
                .filter_map(|times| mean(times.iter().copied())),
        );

        build_row(
            AnalysisLevel::Stage,
            Some(step),
            dimensions,
            reached.len() as u64,
            converted.len() as u64,
            Averages {
                time_to_reach,
                time_to_convert,
                sessions_to_reach: mean(reached.values().map(|&n| n as f64)),
                sessions_to_convert: mean(converted.values().map(|&n| n as f64)),
            },
        )
    }

    fn end_to_end_metric(&self, dimensions: &DimensionValues, slice: &Slice) -> MetricRow {
        let max_step = self.max_step();
        let starting: Vec<&JourneySummary> = slice
            .sessions
            .iter()
            .copied()
            .filter(|journey| journey.first_step_reached == 1)
            .collect();
        let completing: Vec<&JourneySummary> = starting
            .iter()
            .copied()
            .filter(|journey| journey.last_step_reached == max_step)
            .collect();

        let starters: BTreeSet<&str> = starting.iter().map(|j| j.user_id.as_str()).collect();
        let completers: BTreeSet<&str> = completing.iter().map(|j| j.user_id.as_str()).collect();
        let sessions_per_user: HashMap<&str, usize> = slice
            .users
            .iter()
            .map(|journey| (journey.user_id.as_str(), journey.session_count))
            .collect();
        let user_sessions = |users: &BTreeSet<&str>| {
            mean(
                users
                    .iter()
                    .filter_map(|user| sessions_per_user.get(user))
                    .map(|&count| count as f64),
            )
        };

        build_row(
            AnalysisLevel::E2e,
            None,
            dimensions,
            starters.len() as u64,
            completers.len() as u64,
            Averages {
                time_to_reach: mean(starting.iter().map(|j| j.total_elapsed_seconds as f64)),
                time_to_convert: mean(completing.iter().map(|j| j.total_elapsed_seconds as f64)),
                sessions_to_reach: user_sessions(&starters),
                sessions_to_convert: user_sessions(&completers),
            },
        )
    }
}

struct Averages {
    time_to_reach: Option<f64>,
    time_to_convert: Option<f64>,
    sessions_to_reach: Option<f64>,
    sessions_to_convert: Option<f64>,
}

fn build_row(
    level: AnalysisLevel,
    step: Option<&StepDefinition>,
    dimensions: &DimensionValues,
    starters_count: u64,
    completers_count: u64,
    averages: Averages,
) -> MetricRow {
    let dropoffs_count = starters_count.saturating_sub(completers_count);
    MetricRow {
        analysis_level: level,
        step_rank: step.map(|s| s.rank),
        step_name: step.map(|s| s.name.clone()),
        dimension_values: dimensions.clone(),
        starters_count,
        completers_count,
        dropoffs_count,
        conversion_rate_pct: rate_pct(completers_count, starters_count),
        dropoff_rate_pct: rate_pct(dropoffs_count, starters_count),
        avg_time_to_reach_seconds: averages.time_to_reach,
        avg_time_to_convert_seconds: averages.time_to_convert,
        avg_sessions_to_reach: averages.sessions_to_reach,
        avg_sessions_to_convert: averages.sessions_to_convert,
    }
}

/// 1-based position of each session among its user's sessions, ordered by
/// first entry then session id.
fn session_ordinals<'a>(sessions: &[&'a JourneySummary]) -> HashMap<(&'a str, &'a str), usize> {
    let mut by_user: BTreeMap<&str, Vec<(&DateTime<Utc>, &str)>> = BTreeMap::new();
    for journey in sessions {
        if let Some(session_id) = journey.session_id.as_deref() {
            by_user
                .entry(journey.user_id.as_str())
                .or_default()
                .push((&journey.first_entered_at, session_id));
        }
    }

    let mut ordinals = HashMap::new();
    for (user_id, mut user_sessions) in by_user {
        user_sessions.sort();
        user_sessions.dedup_by_key(|(_, session_id)| *session_id);
        for (index, (_, session_id)) in user_sessions.into_iter().enumerate() {
            ordinals.entry((user_id, session_id)).or_insert(index + 1);
        }
    }
    ordinals
}

fn keep_min<'a>(map: &mut BTreeMap<&'a str, usize>, key: &'a str, value: usize) {
    let entry = map.entry(key).or_insert(value);
    if value < *entry {
        *entry = value;
    }
}

pub fn rate_pct(numerator: u64, denominator: u64) -> Option<f64> {
    if denominator == 0 {
        None
    } else {
        Some(100.0 * numerator as f64 / denominator as f64)
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}
