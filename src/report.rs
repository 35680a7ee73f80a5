use std::collections::BTreeMap;
use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::models::{AnalysisLevel, DimensionValues, MetricRow};

pub fn dimension_label(values: &DimensionValues) -> String {
    if values.is_empty() {
        return "all users".to_string();
    }
    values
        .iter()
        .map(|(name, value)| format!("{name}={}", value.as_deref().unwrap_or("(none)")))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn format_pct(value: Option<f64>) -> String {
    value
        .map(|pct| format!("{pct:.1}%"))
        .unwrap_or_else(|| "n/a".to_string())
}

pub fn format_duration(seconds: Option<f64>) -> String {
    let Some(seconds) = seconds else {
        return "n/a".to_string();
    };
    if seconds < 60.0 {
        format!("{seconds:.0}s")
    } else if seconds < 3600.0 {
        format!("{:.1}m", seconds / 60.0)
    } else if seconds < 86_400.0 {
        format!("{:.1}h", seconds / 3600.0)
    } else {
        format!("{:.1}d", seconds / 86_400.0)
    }
}

fn format_sessions(value: Option<f64>) -> String {
    value
        .map(|sessions| format!("{sessions:.2}"))
        .unwrap_or_else(|| "n/a".to_string())
}

pub fn build_report(
    funnel_name: &str,
    run_at: Option<DateTime<Utc>>,
    metrics: &[MetricRow],
) -> String {
    let mut groups: BTreeMap<&DimensionValues, Vec<&MetricRow>> = BTreeMap::new();
    for metric in metrics {
        groups.entry(&metric.dimension_values).or_default().push(metric);
    }

    let mut output = String::new();
    let _ = writeln!(output, "# Funnel Report: {funnel_name}");
    match run_at {
        Some(run_at) => {
            let _ = writeln!(output, "Computed at {}", run_at.format("%Y-%m-%d %H:%M UTC"));
        }
        None => {
            let _ = writeln!(output, "No published run found.");
        }
    }

    if groups.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "No metrics recorded for this funnel.");
        return output;
    }

    for (dimensions, rows) in groups {
        let _ = writeln!(output);
        let _ = writeln!(output, "## {}", dimension_label(dimensions));

        if let Some(e2e) = rows
            .iter()
            .find(|row| row.analysis_level == AnalysisLevel::E2e)
        {
            let _ = writeln!(
                output,
                "{} of {} starters completed the funnel ({}), averaging {} and {} sessions to convert.",
                e2e.completers_count,
                e2e.starters_count,
                format_pct(e2e.conversion_rate_pct),
                format_duration(e2e.avg_time_to_convert_seconds),
                format_sessions(e2e.avg_sessions_to_convert)
            );
        }

        let mut stages: Vec<&MetricRow> = rows
            .into_iter()
            .filter(|row| row.analysis_level == AnalysisLevel::Stage)
            .collect();
        stages.sort_by_key(|row| row.step_rank);

        let _ = writeln!(output);
        let _ = writeln!(
            output,
            "| # | Step | Starters | Completers | Dropoffs | Conversion | Avg time to convert |"
        );
        let _ = writeln!(output, "|---|---|---|---|---|---|---|");
        for stage in stages {
            let _ = writeln!(
                output,
                "| {} | {} | {} | {} | {} | {} | {} |",
                stage
                    .step_rank
                    .map(|rank| rank.to_string())
                    .unwrap_or_default(),
                stage.step_name.as_deref().unwrap_or(""),
                stage.starters_count,
                stage.completers_count,
                stage.dropoffs_count,
                format_pct(stage.conversion_rate_pct),
                format_duration(stage.avg_time_to_convert_seconds)
            );
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::base_time;

    fn metric(level: AnalysisLevel, rank: Option<u32>, starters: u64, completers: u64) -> MetricRow {
        MetricRow {
            analysis_level: level,
            step_rank: rank,
            step_name: rank.map(|rank| format!("Step {rank}")),
            dimension_values: DimensionValues::new(),
            starters_count: starters,
            completers_count: completers,
            dropoffs_count: starters - completers,
            conversion_rate_pct: crate::metrics::rate_pct(completers, starters),
            dropoff_rate_pct: crate::metrics::rate_pct(starters - completers, starters),
            avg_time_to_reach_seconds: None,
            avg_time_to_convert_seconds: Some(90.0),
            avg_sessions_to_reach: None,
            avg_sessions_to_convert: Some(1.5),
        }
    }

    #[test]
    fn report_lists_steps_in_rank_order() {
        let metrics = vec![
            metric(AnalysisLevel::Stage, Some(2), 3, 1),
            metric(AnalysisLevel::E2e, None, 4, 1),
            metric(AnalysisLevel::Stage, Some(1), 4, 3),
        ];
        let report = build_report("checkout", Some(base_time()), &metrics);

        assert!(report.contains("# Funnel Report: checkout"));
        assert!(report.contains("Computed at 2026-03-02 09:00 UTC"));
        assert!(report.contains("## all users"));
        assert!(report.contains("1 of 4 starters completed the funnel (25.0%)"));
        let first = report.find("| 1 | Step 1 | 4 | 3 | 1 | 75.0% | 1.5m |");
        let second = report.find("| 2 | Step 2 | 3 | 1 | 2 | 33.3% | 1.5m |");
        assert!(first.is_some() && second.is_some());
        assert!(first < second);
    }

    #[test]
    fn zero_starters_render_as_not_available() {
        let metrics = vec![metric(AnalysisLevel::Stage, Some(1), 0, 0)];
        let report = build_report("checkout", None, &metrics);
        assert!(report.contains("No published run found."));
        assert!(report.contains("| 1 | Step 1 | 0 | 0 | 0 | n/a | 1.5m |"));
    }

    #[test]
    fn empty_metrics_still_render_a_header() {
        let report = build_report("checkout", None, &[]);
        assert!(report.contains("No metrics recorded for this funnel."));
    }

    #[test]
    fn dimension_labels_show_missing_values() {
        let mut values = DimensionValues::new();
        values.insert("app_version".to_string(), Some("5.2.0".to_string()));
        values.insert("tier".to_string(), None);
        assert_eq!(dimension_label(&values), "app_version=5.2.0, tier=(none)");
        assert_eq!(format_duration(Some(7200.0)), "2.0h");
        assert_eq!(format_duration(None), "n/a");
    }
}
