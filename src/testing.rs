//! Builders shared by the unit tests.

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::config::FunnelConfig;
use crate::models::{DimensionValues, FunnelRow, RawEvent, StepDefinition};

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

/// `base_time()` shifted by whole minutes.
pub fn at(minutes: i64) -> DateTime<Utc> {
    base_time() + Duration::minutes(minutes)
}

pub fn step(rank: u32, name: &str, event_types: &[&str]) -> StepDefinition {
    StepDefinition {
        rank,
        name: name.to_string(),
        matching_event_types: event_types.iter().map(|value| value.to_string()).collect(),
    }
}

/// Home=1, Cart=2, Purchase=3.
pub fn checkout_steps() -> Vec<StepDefinition> {
    vec![
        step(1, "Home", &["LoadedHome"]),
        step(2, "Cart", &["ViewedCart"]),
        step(3, "Purchase", &["PaymentSucceeded"]),
    ]
}

pub fn event(user_id: &str, session_id: &str, event_type: &str, minutes: i64) -> RawEvent {
    RawEvent {
        user_id: user_id.to_string(),
        session_id: session_id.to_string(),
        event_type: event_type.to_string(),
        occurred_at: at(minutes),
        dimension_values: DimensionValues::new(),
    }
}

pub fn with_dimension(mut event: RawEvent, name: &str, value: Option<&str>) -> RawEvent {
    event
        .dimension_values
        .insert(name.to_string(), value.map(str::to_string));
    event
}

pub fn row(user_id: &str, session_id: &str, rank: u32, name: &str, minutes: i64) -> FunnelRow {
    FunnelRow::unsequenced(
        user_id.to_string(),
        session_id.to_string(),
        name.to_string(),
        rank,
        at(minutes),
        DimensionValues::new(),
    )
}

pub fn sample_config_json() -> String {
    r#"{
  "funnel_name": "Checkout Funnel",
  "source": {
    "table": "funnel.events",
    "user_id_column": "user_id",
    "session_id_column": "session_id",
    "event_column": "event_type",
    "timestamp_column": "occurred_at",
    "properties_column": "properties"
  },
  "destination": { "schema": "funnel_out", "prefix": "checkout" },
  "time_period_days": 30,
  "filters": [],
  "steps": [
    { "rank": 1, "screen_name": "Home", "loaded_events": ["LoadedHome"] },
    { "rank": 2, "screen_name": "Cart", "loaded_events": ["ViewedCart"] },
    { "rank": 3, "screen_name": "Purchase", "loaded_events": ["PaymentSucceeded"] }
  ],
  "dimensions": ["app_version"]
}"#
    .to_string()
}

/// The sample configuration without dimensions.
pub fn checkout_config() -> FunnelConfig {
    let mut config = FunnelConfig::from_json(&sample_config_json()).unwrap();
    config.dimensions.clear();
    config
}
