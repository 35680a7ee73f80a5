use std::collections::HashMap;

use tracing::debug;

use crate::config::SelectionRule;
use crate::models::{empty_dimensions, DimensionRecord, DimensionValues, FunnelRow};

/// Lookup join from funnel rows to at most one attribute record each.
///
/// A record keyed by the row's session is preferred over a user-level record.
/// Among records with the same key the selection rule decides, with the value
/// maps as a final tie-break.
pub struct DimensionAttacher {
    dimensions: Vec<String>,
    by_session: HashMap<(String, String), DimensionRecord>,
    by_user: HashMap<String, DimensionRecord>,
}

impl DimensionAttacher {
    pub fn new(dimensions: &[String], records: Vec<DimensionRecord>, rule: SelectionRule) -> Self {
        let mut by_session: HashMap<(String, String), DimensionRecord> = HashMap::new();
        let mut by_user: HashMap<String, DimensionRecord> = HashMap::new();

        for record in records {
            match record.session_id.clone() {
                Some(session_id) => {
                    let key = (record.user_id.clone(), session_id);
                    keep_selected(by_session.entry(key).or_insert_with(|| record.clone()), record, rule);
                }
                None => {
                    let key = record.user_id.clone();
                    keep_selected(by_user.entry(key).or_insert_with(|| record.clone()), record, rule);
                }
            }
        }

        DimensionAttacher {
            dimensions: dimensions.to_vec(),
            by_session,
            by_user,
        }
    }

    fn lookup(&self, user_id: &str, session_id: &str) -> Option<&DimensionRecord> {
        self.by_session
            .get(&(user_id.to_string(), session_id.to_string()))
            .or_else(|| self.by_user.get(user_id))
    }

    /// Gives every row of a session the same dimension map. Each dimension
    /// takes the first value the session's events carry, in entry order; the
    /// lookup only fills dimensions no event set.
    pub fn attach(&self, rows: &mut [FunnelRow]) {
        let mut ordered: Vec<&FunnelRow> = rows.iter().collect();
        ordered.sort_by(|a, b| {
            a.entered_at
                .cmp(&b.entered_at)
                .then(a.step_rank.cmp(&b.step_rank))
                .then_with(|| a.step_name.cmp(&b.step_name))
        });

        let mut sessions: HashMap<(String, String), DimensionValues> = HashMap::new();
        for row in ordered {
            let values = sessions
                .entry(row.session_key())
                .or_insert_with(|| empty_dimensions(&self.dimensions));
            for (name, slot) in values.iter_mut() {
                if slot.is_none() {
                    *slot = row.dimension_values.get(name).cloned().flatten();
                }
            }
        }

        let mut filled = 0usize;
        for ((user_id, session_id), values) in sessions.iter_mut() {
            let Some(record) = self.lookup(user_id, session_id) else {
                continue;
            };
            for (name, slot) in values.iter_mut() {
                if slot.is_none() {
                    if let Some(value) = record.values.get(name).cloned().flatten() {
                        *slot = Some(value);
                        filled += 1;
                    }
                }
            }
        }

        for row in rows.iter_mut() {
            row.dimension_values = sessions
                .get(&(row.user_id.clone(), row.session_id.clone()))
                .cloned()
                .unwrap_or_else(|| empty_dimensions(&self.dimensions));
        }
        debug!(
            rows = rows.len(),
            sessions = sessions.len(),
            filled,
            "attached dimensions"
        );
    }
}

fn keep_selected(current: &mut DimensionRecord, candidate: DimensionRecord, rule: SelectionRule) {
    let replace = match rule {
        SelectionRule::Latest => {
            (candidate.observed_at, &candidate.values) > (current.observed_at, &current.values)
        }
        SelectionRule::Earliest => {
            (candidate.observed_at, &candidate.values) < (current.observed_at, &current.values)
        }
    };
    if replace {
        *current = candidate;
    }
}

/// Restricts a dimension map to the declared names, adding missing ones unset.
pub fn normalize(values: &DimensionValues, names: &[String]) -> DimensionValues {
    names
        .iter()
        .map(|name| (name.clone(), values.get(name).cloned().flatten()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{at, row};

    fn record(user: &str, session: Option<&str>, minutes: i64, tier: &str) -> DimensionRecord {
        let mut values = DimensionValues::new();
        values.insert("tier".to_string(), Some(tier.to_string()));
        DimensionRecord {
            user_id: user.to_string(),
            session_id: session.map(str::to_string),
            observed_at: at(minutes),
            values,
        }
    }

    fn tier(row: &FunnelRow) -> Option<&str> {
        row.dimension_values.get("tier").and_then(|v| v.as_deref())
    }

    #[test]
    fn never_duplicates_rows_and_picks_latest() {
        let attacher = DimensionAttacher::new(
            &["tier".to_string()],
            vec![
                record("a", None, 0, "silver"),
                record("a", None, 10, "gold"),
                record("a", None, 5, "bronze"),
            ],
            SelectionRule::Latest,
        );
        let mut rows = vec![row("a", "s1", 1, "Home", 0), row("a", "s1", 2, "Cart", 1)];
        attacher.attach(&mut rows);

        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| tier(r) == Some("gold")));
    }

    #[test]
    fn earliest_rule_picks_first_observation() {
        let attacher = DimensionAttacher::new(
            &["tier".to_string()],
            vec![record("a", None, 10, "gold"), record("a", None, 0, "silver")],
            SelectionRule::Earliest,
        );
        let mut rows = vec![row("a", "s1", 1, "Home", 0)];
        attacher.attach(&mut rows);
        assert_eq!(tier(&rows[0]), Some("silver"));
    }

    #[test]
    fn session_record_beats_user_record() {
        let attacher = DimensionAttacher::new(
            &["tier".to_string()],
            vec![record("a", None, 50, "gold"), record("a", Some("s2"), 0, "trial")],
            SelectionRule::Latest,
        );
        let mut rows = vec![row("a", "s1", 1, "Home", 0), row("a", "s2", 1, "Home", 0)];
        attacher.attach(&mut rows);
        assert_eq!(tier(&rows[0]), Some("gold"));
        assert_eq!(tier(&rows[1]), Some("trial"));
    }

    #[test]
    fn event_values_win_and_unknown_users_stay_unset() {
        let attacher = DimensionAttacher::new(
            &["tier".to_string(), "app_version".to_string()],
            vec![record("a", None, 0, "gold")],
            SelectionRule::Latest,
        );
        let mut from_event = row("a", "s1", 1, "Home", 0);
        from_event
            .dimension_values
            .insert("tier".to_string(), Some("platinum".to_string()));
        let mut rows = vec![from_event, row("z", "s9", 1, "Home", 0)];
        attacher.attach(&mut rows);

        assert_eq!(tier(&rows[0]), Some("platinum"));
        assert_eq!(rows[1].dimension_values.get("tier"), Some(&None));
        assert_eq!(rows[1].dimension_values.get("app_version"), Some(&None));
    }

    #[test]
    fn one_dimension_set_per_session() {
        let attacher =
            DimensionAttacher::new(&["app_version".to_string()], Vec::new(), SelectionRule::Latest);
        let version = |mut row: FunnelRow, value: &str| {
            row.dimension_values
                .insert("app_version".to_string(), Some(value.to_string()));
            row
        };
        let mut rows = vec![
            row("a", "s1", 1, "Home", 0),
            version(row("a", "s1", 2, "Cart", 1), "2.1"),
            version(row("a", "s1", 3, "Purchase", 2), "2.2"),
            version(row("b", "s2", 1, "Home", 0), "2.0"),
        ];
        attacher.attach(&mut rows);

        let versions: Vec<Option<&str>> = rows
            .iter()
            .map(|r| r.dimension_values.get("app_version").and_then(|v| v.as_deref()))
            .collect();
        assert_eq!(versions, vec![Some("2.1"), Some("2.1"), Some("2.1"), Some("2.0")]);
    }

    #[test]
    fn normalize_keeps_declared_keys_only() {
        let mut values = DimensionValues::new();
        values.insert("os".to_string(), Some("ios".to_string()));
        values.insert("stray".to_string(), Some("x".to_string()));
        let normalized = normalize(&values, &["os".to_string(), "tier".to_string()]);
        assert_eq!(normalized.len(), 2);
        assert_eq!(normalized.get("os"), Some(&Some("ios".to_string())));
        assert_eq!(normalized.get("tier"), Some(&None));
    }
}
