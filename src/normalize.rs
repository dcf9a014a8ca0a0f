//! Normalization of heterogeneous cold-tier rows into canonical readings

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{json, Map, Value};

use crate::config::{SourceSchema, TimestampFormat};
use crate::error::{EngineError, EngineResult};
use crate::types::{from_ms, Metric, Provenance, Reading};

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn as_flag(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |v| v != 0.0),
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "t"),
        _ => false,
    }
}

/// Parse a timestamp cell in the source's declared encoding
pub fn parse_timestamp(value: &Value, format: TimestampFormat) -> EngineResult<DateTime<Utc>> {
    let bad = || EngineError::DataIntegrity(format!("unparseable timestamp {}", value));
    match format {
        TimestampFormat::Rfc3339 => {
            let s = value.as_str().ok_or_else(bad)?.trim();
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Ok(ts.with_timezone(&Utc));
            }
            // Naive wall-clock strings are taken as UTC
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
                .map(|naive| Utc.from_utc_datetime(&naive))
                .map_err(|_| bad())
        }
        TimestampFormat::EpochSeconds => {
            let secs = as_number(value).ok_or_else(bad)?;
            Ok(from_ms((secs * 1000.0).round() as i64))
        }
        TimestampFormat::EpochMillis => {
            let ms = as_number(value).ok_or_else(bad)?;
            Ok(from_ms(ms.round() as i64))
        }
    }
}

/// Map one source row onto the canonical reading shape.
///
/// Missing metric columns stay `None`; a missing quality column falls back to
/// the source's `default_quality`; a missing interpolation flag means `false`.
/// A `received_at`/`provenance` pair present on the row (canonical table) is
/// carried through, otherwise `received_at` is `fallback_received` and the
/// provenance is `provenance`.
pub fn normalize_row(
    schema: &SourceSchema,
    row: &Value,
    provenance: Provenance,
    fallback_received: DateTime<Utc>,
) -> EngineResult<Reading> {
    let obj = row.as_object().ok_or_else(|| {
        EngineError::DataIntegrity(format!("row in source '{}' is not an object", schema.name))
    })?;

    let node_id = match obj.get(&schema.node_column) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => {
            return Err(EngineError::DataIntegrity(format!(
                "row in source '{}' has no '{}' column",
                schema.name, schema.node_column
            )))
        }
    };

    let ts_cell = obj.get(&schema.timestamp_column).ok_or_else(|| {
        EngineError::DataIntegrity(format!(
            "row in source '{}' has no '{}' column",
            schema.name, schema.timestamp_column
        ))
    })?;
    let timestamp = parse_timestamp(ts_cell, schema.timestamp_format)?;

    let mut reading = Reading::new(node_id, timestamp).with_provenance(provenance);
    reading.received_at = fallback_received;

    for (metric, column) in schema.metric_mapping() {
        let value = obj.get(column).and_then(as_number);
        match metric {
            Metric::Flow => reading.flow = value,
            Metric::Pressure => reading.pressure = value,
            Metric::Temperature => reading.temperature = value,
            Metric::Volume => reading.volume = value,
        }
    }

    reading.quality_score = schema
        .quality_column
        .as_ref()
        .and_then(|c| obj.get(c))
        .and_then(as_number)
        .unwrap_or(schema.default_quality);

    reading.is_interpolated = schema
        .interpolated_column
        .as_ref()
        .and_then(|c| obj.get(c))
        .map_or(false, as_flag);

    if let Some(p) = obj.get("provenance").and_then(Value::as_str) {
        reading.provenance = Provenance::parse(p);
    }
    if let Some(received) = obj.get("received_at") {
        if let Ok(ts) = parse_timestamp(received, TimestampFormat::Rfc3339) {
            reading.received_at = ts;
        }
    }

    Ok(reading)
}

/// Row written to the canonical cold table
pub fn canonical_row(reading: &Reading) -> Value {
    let mut row = Map::new();
    row.insert("node_id".into(), json!(reading.node_id));
    row.insert("timestamp".into(), json!(reading.timestamp.to_rfc3339()));
    for metric in Metric::ALL {
        if let Some(v) = reading.value(metric) {
            row.insert(metric.column().into(), json!(v));
        }
    }
    row.insert("quality_score".into(), json!(reading.quality_score));
    row.insert("is_interpolated".into(), json!(reading.is_interpolated));
    row.insert("provenance".into(), json!(reading.provenance.as_str()));
    row.insert("received_at".into(), json!(reading.received_at.to_rfc3339()));
    Value::Object(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn scada_schema() -> SourceSchema {
        let mut metric_columns = HashMap::new();
        metric_columns.insert("flow".to_string(), "q_lps".to_string());
        metric_columns.insert("pressure".to_string(), "p_bar".to_string());
        SourceSchema {
            name: "scada".into(),
            node_column: "tag".into(),
            timestamp_column: "epoch".into(),
            timestamp_format: TimestampFormat::EpochSeconds,
            metric_columns,
            quality_column: None,
            default_quality: 0.5,
            interpolated_column: None,
        }
    }

    #[test]
    fn test_missing_quality_uses_conservative_default() {
        let row = json!({"tag": "N7", "epoch": 1714557600, "q_lps": "12.5", "p_bar": 3.1});
        let r = normalize_row(&scada_schema(), &row, Provenance::Backfill, Utc::now()).unwrap();
        assert_eq!(r.node_id, "N7");
        assert_eq!(r.flow, Some(12.5));
        assert_eq!(r.pressure, Some(3.1));
        assert_eq!(r.temperature, None);
        assert_eq!(r.quality_score, 0.5);
        assert!(!r.is_interpolated);
        assert_eq!(r.provenance, Provenance::Backfill);
        assert_eq!(r.timestamp, Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap());
    }

    #[test]
    fn test_canonical_row_round_trips() {
        let schema = SourceSchema::canonical("readings");
        let original = Reading::new("N1", Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap())
            .with_flow(4.0)
            .with_quality(0.9);
        let back = normalize_row(&schema, &canonical_row(&original), Provenance::ColdSync, Utc::now()).unwrap();
        assert_eq!(back.flow, Some(4.0));
        assert_eq!(back.quality_score, 0.9);
        assert_eq!(back.provenance, Provenance::Live);
        assert_eq!(back.received_at.timestamp(), original.received_at.timestamp());
    }

    #[test]
    fn test_rejects_rows_without_keys() {
        let row = json!({"epoch": 1714557600, "q_lps": 1.0});
        assert!(normalize_row(&scada_schema(), &row, Provenance::ColdSync, Utc::now()).is_err());
        let row = json!({"tag": "N1", "epoch": "yesterday"});
        assert!(normalize_row(&scada_schema(), &row, Provenance::ColdSync, Utc::now()).is_err());
    }

    #[test]
    fn test_naive_timestamps_are_utc() {
        let ts = parse_timestamp(&json!("2024-05-01 10:00:00"), TimestampFormat::Rfc3339).unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap());
    }
}
