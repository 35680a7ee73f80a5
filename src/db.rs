use anyhow::Context;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::info;
use uuid::Uuid;

use crate::config::{DimensionLookup, FunnelConfig};
use crate::models::{
    empty_dimensions, AnalysisLevel, Destination, DimensionRecord, DimensionValues, MetricRow,
    RawEvent, RunContext, RunOutput,
};

const INSERT_CHUNK_ROWS: usize = 1000;

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<usize> {
    let start = Utc
        .with_ymd_and_hms(2026, 2, 2, 9, 0, 0)
        .single()
        .context("invalid seed timestamp")?;

    // (user, session, event, minutes after start, app_version)
    let events = vec![
        ("u-avery", "s-100", "LoadedHome", 0, "5.2.0"),
        ("u-avery", "s-100", "ViewedCart", 3, "5.2.0"),
        ("u-avery", "s-100", "PaymentSucceeded", 7, "5.2.0"),
        ("u-jules", "s-200", "LoadedHome", 10, "5.1.4"),
        ("u-jules", "s-200", "ViewedCart", 15, "5.1.4"),
        ("u-jules", "s-200", "ViewedCart", 16, "5.1.4"),
        ("u-jules", "s-201", "LoadedHome", 1440, "5.1.4"),
        ("u-jules", "s-201", "ViewedCart", 1443, "5.1.4"),
        ("u-jules", "s-201", "PaymentSucceeded", 1450, "5.1.4"),
        ("u-kiara", "s-300", "LoadedHome", 30, "5.2.0"),
        ("u-kiara", "s-300", "Heartbeat", 31, "5.2.0"),
    ];

    let mut inserted = 0usize;
    for (index, (user_id, session_id, event_type, minutes, app_version)) in
        events.into_iter().enumerate()
    {
        let result = sqlx::query(
            r#"
            INSERT INTO funnel.events
            (id, user_id, session_id, event_type, occurred_at, properties, source_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (source_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(session_id)
        .bind(event_type)
        .bind(start + Duration::minutes(minutes))
        .bind(serde_json::json!({ "app_version": app_version }))
        .bind(format!("seed-{:03}", index + 1))
        .execute(pool)
        .await?;
        inserted += result.rows_affected() as usize;
    }

    let tiers = vec![("u-avery", "gold"), ("u-jules", "silver"), ("u-kiara", "silver")];
    for (user_id, tier) in tiers {
        sqlx::query(
            r#"
            INSERT INTO funnel.user_attributes (user_id, session_id, observed_at, attributes)
            VALUES ($1, NULL, $2, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(start)
        .bind(serde_json::json!({ "tier": tier }))
        .execute(pool)
        .await?;
    }

    Ok(inserted)
}

pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        user_id: String,
        session_id: Option<String>,
        event_type: String,
        occurred_at: DateTime<Utc>,
        properties: Option<String>,
        source_key: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut inserted = 0usize;

    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result?;
        let properties: Value = match row.properties.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw)
                .with_context(|| format!("invalid properties JSON on row {}", line + 1))?,
            _ => Value::Object(Default::default()),
        };
        let source_key = row
            .source_key
            .unwrap_or_else(|| format!("import-{}", Uuid::new_v4()));

        let result = sqlx::query(
            r#"
            INSERT INTO funnel.events
            (id, user_id, session_id, event_type, occurred_at, properties, source_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (source_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&row.user_id)
        .bind(&row.session_id)
        .bind(&row.event_type)
        .bind(row.occurred_at)
        .bind(properties)
        .bind(source_key)
        .execute(pool)
        .await?;

        if result.rows_affected() > 0 {
            inserted += 1;
        }
    }

    Ok(inserted)
}

/// Reads the source table through the configured bindings. Rows with a null
/// user, event or timestamp (or session, when one is bound) never leave the
/// database.
pub async fn fetch_events(
    pool: &PgPool,
    config: &FunnelConfig,
    since: Option<DateTime<Utc>>,
) -> anyhow::Result<Vec<RawEvent>> {
    let source = &config.source;
    let query = events_query(config, since.is_some());

    let mut rows = sqlx::query(&query);
    if let Some(value) = since {
        rows = rows.bind(value);
    }

    let records = rows
        .fetch_all(pool)
        .await
        .with_context(|| format!("failed to read events from {}", source.table))?;
    let mut events = Vec::with_capacity(records.len());

    for row in records {
        let properties: Option<Value> = row.try_get("properties")?;
        events.push(RawEvent {
            user_id: row.try_get("user_id")?,
            session_id: row.try_get("session_id")?,
            event_type: row.try_get("event_type")?,
            occurred_at: row
                .try_get::<DateTime<Utc>, _>("occurred_at")
                .with_context(|| format!("{} is not a timestamp", source.timestamp_column))?,
            dimension_values: dimensions_from_json(properties.as_ref(), &config.dimensions),
        });
    }

    info!(events = events.len(), table = %source.table, "fetched raw events");
    Ok(events)
}

fn events_query(config: &FunnelConfig, windowed: bool) -> String {
    let source = &config.source;
    let session_column = source
        .session_id_column
        .as_deref()
        .unwrap_or(&source.user_id_column);
    let properties = source
        .properties_column
        .as_deref()
        .map(|column| format!("{column}::jsonb"))
        .unwrap_or_else(|| "NULL::jsonb".to_string());

    let mut query = format!(
        "SELECT {user}::text AS user_id, {session}::text AS session_id, \
         {event}::text AS event_type, {ts}::timestamptz AS occurred_at, {properties} AS properties \
         FROM {table} \
         WHERE {user} IS NOT NULL AND {session} IS NOT NULL \
         AND {event} IS NOT NULL AND {ts} IS NOT NULL",
        user = source.user_id_column,
        session = session_column,
        event = source.event_column,
        ts = source.timestamp_column,
        table = source.table,
    );

    if windowed {
        query.push_str(&format!(
            " AND {}::timestamptz >= $1",
            source.timestamp_column
        ));
    }
    for filter in &config.filters {
        query.push_str(&format!(" AND ({filter})"));
    }
    query
}

pub async fn fetch_dimension_records(
    pool: &PgPool,
    lookup: &DimensionLookup,
    dimensions: &[String],
) -> anyhow::Result<Vec<DimensionRecord>> {
    let query = lookup_query(lookup, dimensions);
    let rows = sqlx::query(&query)
        .fetch_all(pool)
        .await
        .with_context(|| format!("failed to read dimension lookup {}", lookup.table))?;

    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let mut values = DimensionValues::new();
        for name in dimensions {
            values.insert(name.clone(), row.try_get::<Option<String>, _>(name.as_str())?);
        }
        records.push(DimensionRecord {
            user_id: row.try_get("user_id")?,
            session_id: row.try_get("session_id")?,
            observed_at: row
                .try_get::<DateTime<Utc>, _>("observed_at")
                .with_context(|| format!("{} is not a timestamp", lookup.observed_at_column))?,
            values,
        });
    }
    Ok(records)
}

fn lookup_query(lookup: &DimensionLookup, dimensions: &[String]) -> String {
    let session = lookup
        .session_id_column
        .as_deref()
        .map(|column| format!("{column}::text"))
        .unwrap_or_else(|| "NULL::text".to_string());
    let columns: Vec<String> = dimensions
        .iter()
        .map(|name| match lookup.attributes_column.as_deref() {
            Some(attributes) => format!("{attributes}::jsonb ->> '{name}' AS {name}"),
            None => format!("{name}::text AS {name}"),
        })
        .collect();

    format!(
        "SELECT {user}::text AS user_id, {session} AS session_id, \
         {observed}::timestamptz AS observed_at, {columns} \
         FROM {table} WHERE {user} IS NOT NULL AND {observed} IS NOT NULL",
        user = lookup.user_id_column,
        observed = lookup.observed_at_column,
        columns = columns.join(", "),
        table = lookup.table,
    )
}

fn dimensions_from_json(properties: Option<&Value>, names: &[String]) -> DimensionValues {
    let mut values = empty_dimensions(names);
    if let Some(Value::Object(map)) = properties {
        for (name, slot) in values.iter_mut() {
            *slot = match map.get(name) {
                None | Some(Value::Null) => None,
                Some(Value::String(text)) => Some(text.clone()),
                Some(other) => Some(other.to_string()),
            };
        }
    }
    values
}

/// Replaces both output relations with this run's results in one transaction.
/// Nothing is visible to readers until the commit; an error drops the
/// transaction and leaves the previous run in place.
pub async fn publish(pool: &PgPool, ctx: &RunContext, output: &RunOutput) -> anyhow::Result<()> {
    let destination = &ctx.destination;
    let funnel_table = destination.funnel_table();
    let metrics_table = destination.metrics_table();
    let mut tx = pool.begin().await.context("failed to open publish transaction")?;

    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", destination.schema))
        .execute(&mut *tx)
        .await?;
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {funnel_table} (
            run_id UUID NOT NULL,
            run_at TIMESTAMPTZ NOT NULL,
            user_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            step_name TEXT NOT NULL,
            step_rank INTEGER NOT NULL,
            entered_at TIMESTAMPTZ NOT NULL,
            previous_step_name TEXT,
            next_entered_at TIMESTAMPTZ,
            converted BOOLEAN NOT NULL,
            time_to_convert_seconds BIGINT,
            backfilled BOOLEAN NOT NULL,
            dimension_values JSONB NOT NULL
        )"
    ))
    .execute(&mut *tx)
    .await?;
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {metrics_table} (
            run_id UUID NOT NULL,
            run_at TIMESTAMPTZ NOT NULL,
            analysis_level TEXT NOT NULL,
            step_rank INTEGER,
            step_name TEXT,
            dimension_values JSONB NOT NULL,
            starters_count BIGINT NOT NULL,
            completers_count BIGINT NOT NULL,
            dropoffs_count BIGINT NOT NULL,
            conversion_rate_pct DOUBLE PRECISION,
            dropoff_rate_pct DOUBLE PRECISION,
            avg_time_to_reach_seconds DOUBLE PRECISION,
            avg_time_to_convert_seconds DOUBLE PRECISION,
            avg_sessions_to_reach DOUBLE PRECISION,
            avg_sessions_to_convert DOUBLE PRECISION
        )"
    ))
    .execute(&mut *tx)
    .await?;

    sqlx::query(&format!("DELETE FROM {funnel_table}"))
        .execute(&mut *tx)
        .await?;
    sqlx::query(&format!("DELETE FROM {metrics_table}"))
        .execute(&mut *tx)
        .await?;

    for chunk in output.funnel_rows.chunks(INSERT_CHUNK_ROWS) {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {funnel_table} (run_id, run_at, user_id, session_id, step_name, step_rank, \
             entered_at, previous_step_name, next_entered_at, converted, time_to_convert_seconds, \
             backfilled, dimension_values) "
        ));
        builder.push_values(chunk, |mut b, row| {
            b.push_bind(ctx.run_id)
                .push_bind(ctx.run_at)
                .push_bind(row.user_id.clone())
                .push_bind(row.session_id.clone())
                .push_bind(row.step_name.clone())
                .push_bind(row.step_rank as i32)
                .push_bind(row.entered_at)
                .push_bind(row.previous_step_name.clone())
                .push_bind(row.next_entered_at)
                .push_bind(row.converted)
                .push_bind(row.time_to_convert_seconds)
                .push_bind(row.backfilled)
                .push_bind(dimensions_to_json(&row.dimension_values));
        });
        builder.build().execute(&mut *tx).await?;
    }

    for chunk in output.metrics.chunks(INSERT_CHUNK_ROWS) {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {metrics_table} (run_id, run_at, analysis_level, step_rank, step_name, \
             dimension_values, starters_count, completers_count, dropoffs_count, \
             conversion_rate_pct, dropoff_rate_pct, avg_time_to_reach_seconds, \
             avg_time_to_convert_seconds, avg_sessions_to_reach, avg_sessions_to_convert) "
        ));
        builder.push_values(chunk, |mut b, metric| {
            b.push_bind(ctx.run_id)
                .push_bind(ctx.run_at)
                .push_bind(metric.analysis_level.as_str())
                .push_bind(metric.step_rank.map(|rank| rank as i32))
                .push_bind(metric.step_name.clone())
                .push_bind(dimensions_to_json(&metric.dimension_values))
                .push_bind(metric.starters_count as i64)
                .push_bind(metric.completers_count as i64)
                .push_bind(metric.dropoffs_count as i64)
                .push_bind(metric.conversion_rate_pct)
                .push_bind(metric.dropoff_rate_pct)
                .push_bind(metric.avg_time_to_reach_seconds)
                .push_bind(metric.avg_time_to_convert_seconds)
                .push_bind(metric.avg_sessions_to_reach)
                .push_bind(metric.avg_sessions_to_convert);
        });
        builder.build().execute(&mut *tx).await?;
    }

    tx.commit().await.context("failed to commit funnel outputs")?;
    info!(
        run_id = %ctx.run_id,
        funnel_table = %funnel_table,
        metrics_table = %metrics_table,
        "published funnel run"
    );
    Ok(())
}

fn dimensions_to_json(values: &DimensionValues) -> Value {
    Value::Object(
        values
            .iter()
            .map(|(name, value)| {
                let value = value.clone().map(Value::String).unwrap_or(Value::Null);
                (name.clone(), value)
            })
            .collect(),
    )
}

pub async fn fetch_metrics(
    pool: &PgPool,
    destination: &Destination,
) -> anyhow::Result<(Option<DateTime<Utc>>, Vec<MetricRow>)> {
    let query = format!(
        "SELECT run_at, analysis_level, step_rank, step_name, dimension_values, starters_count, \
         completers_count, dropoffs_count, conversion_rate_pct, dropoff_rate_pct, \
         avg_time_to_reach_seconds, avg_time_to_convert_seconds, avg_sessions_to_reach, \
         avg_sessions_to_convert FROM {}",
        destination.metrics_table()
    );
    let records = sqlx::query(&query)
        .fetch_all(pool)
        .await
        .with_context(|| format!("failed to read {}", destination.metrics_table()))?;

    let mut run_at = None;
    let mut metrics = Vec::with_capacity(records.len());
    for row in records {
        run_at = Some(row.get::<DateTime<Utc>, _>("run_at"));
        let level: String = row.get("analysis_level");
        let dimensions: Value = row.get("dimension_values");
        metrics.push(MetricRow {
            analysis_level: AnalysisLevel::parse(&level)
                .with_context(|| format!("unknown analysis level {level:?}"))?,
            step_rank: row.get::<Option<i32>, _>("step_rank").map(|rank| rank as u32),
            step_name: row.get("step_name"),
            dimension_values: serde_json::from_value(dimensions)?,
            starters_count: row.get::<i64, _>("starters_count") as u64,
            completers_count: row.get::<i64, _>("completers_count") as u64,
            dropoffs_count: row.get::<i64, _>("dropoffs_count") as u64,
            conversion_rate_pct: row.get("conversion_rate_pct"),
            dropoff_rate_pct: row.get("dropoff_rate_pct"),
            avg_time_to_reach_seconds: row.get("avg_time_to_reach_seconds"),
            avg_time_to_convert_seconds: row.get("avg_time_to_convert_seconds"),
            avg_sessions_to_reach: row.get("avg_sessions_to_reach"),
            avg_sessions_to_convert: row.get("avg_sessions_to_convert"),
        });
    }

    metrics.sort_by(|a, b| {
        a.dimension_values
            .cmp(&b.dimension_values)
            .then(a.analysis_level.cmp(&b.analysis_level))
            .then(a.step_rank.cmp(&b.step_rank))
    });
    Ok((run_at, metrics))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SelectionRule;
    use crate::testing::checkout_config;

    #[test]
    fn event_query_reads_timestamps_as_timestamptz() {
        let mut config = checkout_config();
        config.filters = vec!["event_type <> 'Heartbeat'".to_string()];
        let query = events_query(&config, true);

        assert!(query.contains("occurred_at::timestamptz AS occurred_at"));
        assert!(query.contains("AND occurred_at::timestamptz >= $1"));
        assert!(query.ends_with("AND (event_type <> 'Heartbeat')"));
        assert!(!events_query(&config, false).contains("$1"));
    }

    #[test]
    fn event_query_falls_back_to_the_user_as_session() {
        let mut config = checkout_config();
        config.source.session_id_column = None;
        config.source.properties_column = None;
        let query = events_query(&config, false);

        assert!(query.contains("user_id::text AS session_id"));
        assert!(query.contains("NULL::jsonb AS properties"));
    }

    #[test]
    fn lookup_query_reads_attributes_by_key() {
        let lookup = DimensionLookup {
            table: "funnel.user_attributes".to_string(),
            user_id_column: "user_id".to_string(),
            session_id_column: None,
            observed_at_column: "seen_at".to_string(),
            attributes_column: Some("attributes".to_string()),
            selection: SelectionRule::Latest,
        };
        let query = lookup_query(&lookup, &["tier".to_string()]);

        assert!(query.contains("seen_at::timestamptz AS observed_at"));
        assert!(query.contains("NULL::text AS session_id"));
        assert!(query.contains("attributes::jsonb ->> 'tier' AS tier"));
    }

    #[test]
    fn dimensions_are_read_from_event_properties() {
        let names = vec!["app_version".to_string(), "build".to_string(), "os".to_string()];
        let properties = serde_json::json!({ "app_version": "5.2.0", "build": 1204, "os": null });
        let values = dimensions_from_json(Some(&properties), &names);

        assert_eq!(values.get("app_version"), Some(&Some("5.2.0".to_string())));
        assert_eq!(values.get("build"), Some(&Some("1204".to_string())));
        assert_eq!(values.get("os"), Some(&None));
        assert_eq!(dimensions_from_json(None, &names).len(), 3);
    }

    #[test]
    fn dimension_json_keeps_nulls() {
        let mut values = DimensionValues::new();
        values.insert("tier".to_string(), None);
        values.insert("os".to_string(), Some("ios".to_string()));
        assert_eq!(
            dimensions_to_json(&values),
            serde_json::json!({ "os": "ios", "tier": null })
        );
    }
}
