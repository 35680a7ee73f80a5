use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use tracing::debug;

use crate::models::{ClassifiedEvent, FunnelRow};

type DedupKey = (String, String, String, Option<u32>);

#[derive(Debug, Clone, Default)]
pub struct DedupOutput {
    /// One row per (user, session, step name, step rank), ready for sequencing.
    pub rows: Vec<FunnelRow>,
    /// Canonical events that matched no step. They stop here.
    pub unmapped: Vec<ClassifiedEvent>,
    pub duplicates_removed: usize,
}

/// Collapses classified events sharing (user, session, step name, step rank)
/// into one canonical event: highest rank, then latest timestamp, then the
/// greatest raw event type.
pub fn deduplicate(events: Vec<ClassifiedEvent>) -> DedupOutput {
    let total = events.len();
    let mut canonical: BTreeMap<DedupKey, ClassifiedEvent> = BTreeMap::new();

    for event in events {
        let key = (
            event.user_id.clone(),
            event.session_id.clone(),
            event.step_name.clone(),
            event.step_rank,
        );
        match canonical.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(event);
            }
            Entry::Occupied(mut slot) => {
                if precedence(&event) > precedence(slot.get()) {
                    slot.insert(event);
                }
            }
        }
    }

    let duplicates_removed = total - canonical.len();
    let mut output = DedupOutput {
        duplicates_removed,
        ..DedupOutput::default()
    };

    for event in canonical.into_values() {
        match event.step_rank {
            Some(rank) => output.rows.push(FunnelRow::unsequenced(
                event.user_id,
                event.session_id,
                event.step_name,
                rank,
                event.occurred_at,
                event.dimension_values,
            )),
            None => output.unmapped.push(event),
        }
    }

    debug!(
        kept = output.rows.len(),
        unmapped = output.unmapped.len(),
        duplicates_removed,
        "deduplicated classified events"
    );
    output
}

fn precedence(event: &ClassifiedEvent) -> (Option<u32>, chrono::DateTime<chrono::Utc>, &str) {
    (event.step_rank, event.occurred_at, event.event_type.as_str())
}
