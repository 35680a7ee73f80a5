//! Per-session ordering and conversion signals.

use std::collections::BTreeMap;

use rayon::prelude::*;

use crate::config::ConversionMode;
use crate::models::FunnelRow;

/// Sequences every session and returns rows ordered by user, session and
/// position within the session.
pub fn sequence(rows: Vec<FunnelRow>, mode: ConversionMode) -> Vec<FunnelRow> {
    let mut partitions: BTreeMap<(String, String), Vec<FunnelRow>> = BTreeMap::new();
    for row in rows {
        partitions.entry(row.session_key()).or_default().push(row);
    }

    partitions
        .into_values()
        .collect::<Vec<_>>()
        .into_par_iter()
        .map(|partition| sequence_partition(partition, mode))
        .collect::<Vec<_>>()
        .into_iter()
        .flatten()
        .collect()
}

/// Sequences the rows of a single session.
pub fn sequence_partition(mut rows: Vec<FunnelRow>, mode: ConversionMode) -> Vec<FunnelRow> {
    rows.sort_by(|a, b| {
        a.entered_at
            .cmp(&b.entered_at)
            .then(a.step_rank.cmp(&b.step_rank))
            .then_with(|| a.step_name.cmp(&b.step_name))
    });

    let successors = match mode {
        ConversionMode::AnyLaterEvent => (0..rows.len())
            .map(|index| (index + 1 < rows.len()).then_some(index + 1))
            .collect(),
        ConversionMode::HigherRank => next_higher_rank(&rows),
    };

    let previous_names: Vec<Option<String>> = (0..rows.len())
        .map(|index| index.checked_sub(1).map(|prev| rows[prev].step_name.clone()))
        .collect();
    let entered: Vec<_> = rows.iter().map(|row| row.entered_at).collect();

    for (index, row) in rows.iter_mut().enumerate() {
        row.previous_step_name = previous_names[index].clone();
        row.next_entered_at = successors[index].map(|next| entered[next]);
        row.converted = row.next_entered_at.is_some();
        row.time_to_convert_seconds = row
            .next_entered_at
            .map(|next| (next - row.entered_at).num_seconds());
    }
    rows
}

/// For each position, the first later position with a strictly greater rank.
fn next_higher_rank(rows: &[FunnelRow]) -> Vec<Option<usize>> {
    let mut result = vec![None; rows.len()];
    let mut stack: Vec<usize> = Vec::new();

    for index in (0..rows.len()).rev() {
        while let Some(&top) = stack.last() {
            if rows[top].step_rank > rows[index].step_rank {
                break;
            }
            stack.pop();
        }
        result[index] = stack.last().copied();
        stack.push(index);
    }
    result
}
