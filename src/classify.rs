use std::collections::{BTreeMap, HashMap};

use tracing::warn;

use crate::models::{ClassifiedEvent, RawEvent, StepDefinition};

/// Resolves event types to funnel steps. Built once per run from the ordered
/// step list; the lowest rank wins when an event type is claimed twice.
#[derive(Debug, Clone)]
pub struct StepClassifier {
    by_event_type: HashMap<String, (u32, String)>,
    steps: Vec<(u32, String)>,
}

/// Matched-event counts per step plus counts of event types no step claims.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepCoverage {
    pub matched_by_rank: BTreeMap<u32, usize>,
    pub unmapped_by_type: BTreeMap<String, usize>,
}

impl StepCoverage {
    pub fn empty_steps(&self) -> Vec<u32> {
        self.matched_by_rank
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(rank, _)| *rank)
            .collect()
    }
}

impl StepClassifier {
    pub fn new(steps: &[StepDefinition]) -> Self {
        let mut ordered: Vec<&StepDefinition> = steps.iter().collect();
        ordered.sort_by_key(|step| step.rank);

        let mut by_event_type = HashMap::new();
        for step in &ordered {
            for event_type in &step.matching_event_types {
                by_event_type
                    .entry(event_type.clone())
                    .or_insert_with(|| (step.rank, step.name.clone()));
            }
        }

        StepClassifier {
            by_event_type,
            steps: ordered
                .iter()
                .map(|step| (step.rank, step.name.clone()))
                .collect(),
        }
    }

    /// Returns `(Some(rank), step name)` for a matching event type, or
    /// `(None, event_type)` when nothing matches.
    pub fn classify(&self, event_type: &str) -> (Option<u32>, String) {
        match self.by_event_type.get(event_type) {
            Some((rank, name)) => (Some(*rank), name.clone()),
            None => (None, event_type.to_string()),
        }
    }

    pub fn classify_events(&self, events: &[RawEvent]) -> (Vec<ClassifiedEvent>, StepCoverage) {
        let mut coverage = StepCoverage {
            matched_by_rank: self.steps.iter().map(|(rank, _)| (*rank, 0)).collect(),
            unmapped_by_type: BTreeMap::new(),
        };

        let classified = events
            .iter()
            .map(|event| {
                let (step_rank, step_name) = self.classify(&event.event_type);
                match step_rank {
                    Some(rank) => *coverage.matched_by_rank.entry(rank).or_insert(0) += 1,
                    None => {
                        *coverage
                            .unmapped_by_type
                            .entry(event.event_type.clone())
                            .or_insert(0) += 1
                    }
                }
                ClassifiedEvent {
                    user_id: event.user_id.clone(),
                    session_id: event.session_id.clone(),
                    event_type: event.event_type.clone(),
                    step_name,
                    step_rank,
                    occurred_at: event.occurred_at,
                    dimension_values: event.dimension_values.clone(),
                }
            })
            .collect();

        for rank in coverage.empty_steps() {
            let name = self
                .steps
                .iter()
                .find(|(step_rank, _)| *step_rank == rank)
                .map(|(_, name)| name.as_str())
                .unwrap_or_default();
            warn!(rank, step = name, "no events matched this step in the window");
        }

        (classified, coverage)
    }
}
