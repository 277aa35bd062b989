//! Shape-agnostic telemetry decoding.
//!
//! Upstream payloads arrive in three shapes: a bare scalar, a single
//! `{value, ts}` object, or a list of such objects. Time-series queries
//! return newest-first, so the first list element is canonical; a
//! newest-last producer still yields a usable event from its first element.
//! Nothing in here may panic or error: malformed input degrades to
//! `{value: None, timestamp: fallback}`.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::models::{EventKind, NormalizedEvent};

/// Epoch values above this are interpreted as milliseconds, below as seconds.
const EPOCH_MILLIS_CUTOVER: f64 = 1e11;

/// Pull the payload value out of any accepted shape.
pub fn resolve_value(raw: &Value) -> Option<Value> {
    match raw {
        Value::Null => None,
        Value::Array(items) => items.first().and_then(resolve_value),
        Value::Object(map) => map.get("value").filter(|v| !v.is_null()).cloned(),
        scalar => Some(scalar.clone()),
    }
}

/// Pull the device-reported timestamp out of any accepted shape, falling
/// back to `fallback` (the caller's processing time) when none resolves.
pub fn resolve_timestamp(raw: &Value, fallback: DateTime<Utc>) -> DateTime<Utc> {
    match raw {
        Value::Array(items) => items
            .first()
            .map(|first| resolve_timestamp(first, fallback))
            .unwrap_or(fallback),
        Value::Object(map) => map
            .get("ts")
            .and_then(parse_timestamp)
            .unwrap_or(fallback),
        _ => fallback,
    }
}

/// Decode one raw payload into a typed event for `device_id`.
pub fn normalize(device_id: &str, raw: &Value, fallback: DateTime<Utc>) -> NormalizedEvent {
    let value = resolve_value(raw);
    let kind = value
        .as_ref()
        .map(EventKind::from_value)
        .unwrap_or(EventKind::Other);

    NormalizedEvent {
        device_id: device_id.to_string(),
        kind,
        value,
        timestamp: resolve_timestamp(raw, fallback),
    }
}

fn parse_timestamp(ts: &Value) -> Option<DateTime<Utc>> {
    match ts {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => {
            let n = n.as_f64()?;
            if !n.is_finite() || n < 0.0 {
                return None;
            }
            if n >= EPOCH_MILLIS_CUTOVER {
                Utc.timestamp_millis_opt(n as i64).single()
            } else {
                Utc.timestamp_millis_opt((n * 1000.0) as i64).single()
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fallback() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn bare_scalar_uses_fallback_timestamp() {
        let event = normalize("t1", &json!("hit"), fallback());
        assert_eq!(event.kind, EventKind::Hit);
        assert_eq!(event.timestamp, fallback());
    }

    #[test]
    fn keyed_object_resolves_value_and_timestamp() {
        let raw = json!({"value": "hit", "ts": "2024-06-01T12:00:05Z"});
        let event = normalize("t1", &raw, fallback());
        assert_eq!(event.kind, EventKind::Hit);
        assert_eq!(
            event.timestamp,
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 5).unwrap()
        );
    }

    #[test]
    fn series_takes_first_element_as_canonical() {
        let raw = json!([
            {"value": "hit", "ts": "2024-06-01T12:00:09Z"},
            {"value": "start", "ts": "2024-06-01T11:59:00Z"}
        ]);
        let event = normalize("t1", &raw, fallback());
        assert_eq!(event.kind, EventKind::Hit);
        assert_eq!(
            event.timestamp,
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 9).unwrap()
        );
    }

    #[test]
    fn epoch_millis_and_seconds_both_parse() {
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 5).unwrap();
        let millis = json!({"value": "hit", "ts": at.timestamp_millis()});
        let secs = json!({"value": "hit", "ts": at.timestamp()});
        assert_eq!(normalize("t1", &millis, fallback()).timestamp, at);
        assert_eq!(normalize("t1", &secs, fallback()).timestamp, at);
    }

    #[test]
    fn malformed_input_never_panics() {
        for raw in [
            json!(null),
            json!([]),
            json!({}),
            json!({"ts": "not-a-date"}),
            json!({"value": null, "ts": -5}),
            json!([[]]),
        ] {
            let event = normalize("t1", &raw, fallback());
            assert_eq!(event.kind, EventKind::Other);
            assert_eq!(event.timestamp, fallback());
        }
    }

    #[test]
    fn unrecognized_markers_classify_as_other() {
        assert_eq!(
            normalize("t1", &json!("rebooting"), fallback()).kind,
            EventKind::Other
        );
        assert_eq!(normalize("t1", &json!(42), fallback()).kind, EventKind::Other);
        assert_eq!(
            normalize("t1", &json!("BUSY"), fallback()).kind,
            EventKind::Busy
        );
    }
}
