use std::collections::{BTreeMap, BTreeSet};

use rayon::prelude::*;

use crate::models::{DimensionValues, FunnelRow, JourneySummary};

/// One summary per (user, session, dimension combination).
pub fn summarize_sessions(rows: &[FunnelRow]) -> Vec<JourneySummary> {
    let mut groups: BTreeMap<(&str, &str, &DimensionValues), Vec<&FunnelRow>> = BTreeMap::new();
    for row in rows {
        groups
            .entry((row.user_id.as_str(), row.session_id.as_str(), &row.dimension_values))
            .or_default()
            .push(row);
    }

    groups
        .into_iter()
        .collect::<Vec<_>>()
        .into_par_iter()
        .filter_map(|((user_id, session_id, dimensions), members)| {
            summarize(user_id, Some(session_id.to_string()), dimensions, &members)
        })
        .collect()
}

/// One summary per (user, dimension combination) spanning all of the user's
/// sessions. Only here is `session_count` more than 1.
pub fn summarize_users(rows: &[FunnelRow]) -> Vec<JourneySummary> {
    let mut groups: BTreeMap<(&str, &DimensionValues), Vec<&FunnelRow>> = BTreeMap::new();
    for row in rows {
        groups
            .entry((row.user_id.as_str(), &row.dimension_values))
            .or_default()
            .push(row);
    }

    groups
        .into_iter()
        .collect::<Vec<_>>()
        .into_par_iter()
        .filter_map(|((user_id, dimensions), members)| {
            summarize(user_id, None, dimensions, &members)
        })
        .collect()
}

fn summarize(
    user_id: &str,
    session_id: Option<String>,
    dimensions: &DimensionValues,
    members: &[&FunnelRow],
) -> Option<JourneySummary> {
    let ranks: BTreeSet<u32> = members.iter().map(|row| row.step_rank).collect();
    let sessions: BTreeSet<&str> = members.iter().map(|row| row.session_id.as_str()).collect();
    let first_entered_at = members.iter().map(|row| row.entered_at).min()?;
    let last_entered_at = members.iter().map(|row| row.entered_at).max()?;

    Some(JourneySummary {
        user_id: user_id.to_string(),
        session_id,
        dimension_values: dimensions.clone(),
        first_step_reached: *ranks.first()?,
        last_step_reached: *ranks.last()?,
        distinct_steps_count: ranks.len(),
        first_entered_at,
        last_entered_at,
        total_elapsed_seconds: (last_entered_at - first_entered_at).num_seconds(),
        session_count: sessions.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{at, row};

    #[test]
    fn session_summary_spans_first_to_last_rank() {
        let rows = vec![
            row("a", "s1", 2, "Cart", 4),
            row("a", "s1", 1, "Home", 0),
            row("a", "s1", 3, "Purchase", 9),
        ];
        let summaries = summarize_sessions(&rows);

        assert_eq!(summaries.len(), 1);
        let journey = &summaries[0];
        assert_eq!(journey.session_id.as_deref(), Some("s1"));
        assert_eq!(journey.first_step_reached, 1);
        assert_eq!(journey.last_step_reached, 3);
        assert_eq!(journey.distinct_steps_count, 3);
        assert_eq!(journey.first_entered_at, at(0));
        assert_eq!(journey.last_entered_at, at(9));
        assert_eq!(journey.total_elapsed_seconds, 540);
        assert_eq!(journey.session_count, 1);
    }

    #[test]
    fn user_summary_counts_sessions() {
        let rows = vec![
            row("a", "s1", 1, "Home", 0),
            row("a", "s2", 1, "Home", 60),
            row("a", "s2", 2, "Cart", 62),
            row("b", "s3", 1, "Home", 5),
        ];
        let sessions = summarize_sessions(&rows);
        assert_eq!(sessions.len(), 3);
        assert!(sessions.iter().all(|journey| journey.session_count == 1));

        let users = summarize_users(&rows);
        assert_eq!(users.len(), 2);
        let a = users.iter().find(|journey| journey.user_id == "a").unwrap();
        assert_eq!(a.session_id, None);
        assert_eq!(a.session_count, 2);
        assert_eq!(a.last_step_reached, 2);
        assert_eq!(a.total_elapsed_seconds, 62 * 60);
    }

    #[test]
    fn dimension_combinations_split_journeys() {
        let mut ios = row("a", "s1", 1, "Home", 0);
        ios.dimension_values
            .insert("os".to_string(), Some("ios".to_string()));
        let mut android = row("a", "s1", 2, "Cart", 1);
        android
            .dimension_values
            .insert("os".to_string(), Some("android".to_string()));

        let summaries = summarize_sessions(&[ios, android]);
        assert_eq!(summaries.len(), 2);
    }
}
