use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::models::{FunnelRow, StepDefinition};

/// Fills in steps a session skipped on its way to a higher rank, so that
/// reaching step N implies having passed steps 1..N-1.
///
/// A synthesized row borrows `entered_at` and dimensions from the earliest
/// row in the same session whose rank is above the missing one. Returns the
/// number of rows added.
pub fn backfill_skipped_steps(rows: &mut Vec<FunnelRow>, steps: &[StepDefinition]) -> usize {
    let names: BTreeMap<u32, &str> = steps
        .iter()
        .map(|step| (step.rank, step.name.as_str()))
        .collect();

    let mut sessions: BTreeMap<(String, String), Vec<usize>> = BTreeMap::new();
    for (index, row) in rows.iter().enumerate() {
        sessions.entry(row.session_key()).or_default().push(index);
    }

    let mut synthesized = Vec::new();
    for indices in sessions.values() {
        let present: BTreeSet<u32> = indices.iter().map(|&i| rows[i].step_rank).collect();
        let Some(&highest) = present.iter().next_back() else {
            continue;
        };

        for rank in (1..highest).filter(|rank| !present.contains(rank)) {
            let Some(name) = names.get(&rank) else {
                continue;
            };
            let anchor = indices
                .iter()
                .map(|&i| &rows[i])
                .filter(|row| row.step_rank > rank)
                .min_by(|a, b| {
                    a.entered_at
                        .cmp(&b.entered_at)
                        .then(a.step_rank.cmp(&b.step_rank))
                });
            if let Some(anchor) = anchor {
                let mut row = FunnelRow::unsequenced(
                    anchor.user_id.clone(),
                    anchor.session_id.clone(),
                    name.to_string(),
                    rank,
                    anchor.entered_at,
                    anchor.dimension_values.clone(),
                );
                row.backfilled = true;
                synthesized.push(row);
            }
        }
    }

    let added = synthesized.len();
    rows.extend(synthesized);
    debug!(added, "backfilled skipped steps");
    added
}
