//! Field-level merge strategies

use super::policy::MergeStrategy;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use migration_storage::canonical_json;
use serde_json::Value;

/// Naive formats tried after RFC 3339
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Keys searched, in order, for a timestamp inside structured values
pub const TIMESTAMP_KEYS: &[&str] = &[
    "updated_at",
    "updatedAt",
    "updated",
    "modified_at",
    "modifiedAt",
    "timestamp",
    "created_at",
    "createdAt",
];

/// Fields whose text is merged under an attributed heading by `Custom`
pub const FREE_TEXT_FIELDS: &[&str] = &["description", "body", "comment", "notes", "text"];

/// Fields whose lists are unioned by `Custom`
pub const LIST_FIELDS: &[&str] = &["labels", "tags", "watchers", "components"];

pub const CONCATENATE_MARKER: &str = "merged from source: ";
pub const CUSTOM_HEADING: &str = "--- merged from source ---";

/// Null, empty string, empty array or empty object
pub fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, DATE_FORMAT)
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Timestamp carried by a value: a timestamp string, or an object with one
/// of `TIMESTAMP_KEYS`
pub fn extract_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp(s),
        Value::Object(map) => TIMESTAMP_KEYS
            .iter()
            .filter_map(|key| map.get(*key))
            .find_map(|v| v.as_str().and_then(parse_timestamp)),
        _ => None,
    }
}

fn value_len(value: &Value) -> usize {
    match value {
        Value::String(s) => s.chars().count(),
        other => canonical_json(other).chars().count(),
    }
}

/// Merge one conflicted field
///
/// An empty side always yields the other side. Whenever a strategy cannot
/// decide, the destination value is kept.
pub fn merge_field(field: &str, source: &Value, destination: &Value, strategy: MergeStrategy) -> Value {
    if is_empty(source) {
        return destination.clone();
    }
    if is_empty(destination) {
        return source.clone();
    }

    match strategy {
        MergeStrategy::LatestTimestamp => {
            match (extract_timestamp(source), extract_timestamp(destination)) {
                (Some(src_ts), Some(dest_ts)) if src_ts > dest_ts => source.clone(),
                _ => destination.clone(),
            }
        }
        MergeStrategy::LongestValue => {
            if value_len(source) > value_len(destination) {
                source.clone()
            } else {
                destination.clone()
            }
        }
        MergeStrategy::Concatenate => match (destination, source) {
            (Value::String(dest), Value::String(src)) => {
                Value::String(format!("{}\n\n{}{}", dest, CONCATENATE_MARKER, src))
            }
            _ => destination.clone(),
        },
        MergeStrategy::Custom => merge_custom(field, source, destination),
    }
}

fn merge_custom(field: &str, source: &Value, destination: &Value) -> Value {
    if FREE_TEXT_FIELDS.contains(&field) {
        if let (Value::String(dest), Value::String(src)) = (destination, source) {
            return Value::String(format!("{}\n\n{}\n{}", dest, CUSTOM_HEADING, src));
        }
    }

    if LIST_FIELDS.contains(&field) {
        if let (Value::Array(dest), Value::Array(src)) = (destination, source) {
            let mut union = dest.clone();
            for item in src {
                if !union.contains(item) {
                    union.push(item.clone());
                }
            }
            return Value::Array(union);
        }
    }

    destination.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_side_yields_other() {
        for strategy in [
            MergeStrategy::LatestTimestamp,
            MergeStrategy::LongestValue,
            MergeStrategy::Concatenate,
            MergeStrategy::Custom,
        ] {
            assert_eq!(merge_field("name", &json!(""), &json!("B"), strategy), json!("B"));
            assert_eq!(merge_field("name", &json!("C"), &Value::Null, strategy), json!("C"));
            assert_eq!(merge_field("tags", &json!([]), &json!(["x"]), strategy), json!(["x"]));
        }
    }

    #[test]
    fn test_latest_timestamp_without_timestamps_keeps_destination() {
        let merged = merge_field("name", &json!("C"), &json!("B"), MergeStrategy::LatestTimestamp);
        assert_eq!(merged, json!("B"));
    }

    #[test]
    fn test_latest_timestamp_picks_newer() {
        let older = json!({"value": "old", "updated_at": "2024-01-01T10:00:00Z"});
        let newer = json!({"value": "new", "updatedAt": "2024-03-01 09:00:00"});

        assert_eq!(
            merge_field("status", &newer, &older, MergeStrategy::LatestTimestamp),
            newer
        );
        assert_eq!(
            merge_field("status", &older, &newer, MergeStrategy::LatestTimestamp),
            newer
        );
    }

    #[test]
    fn test_latest_timestamp_tie_keeps_destination() {
        let merged = merge_field(
            "due_date",
            &json!("2024-05-01"),
            &json!("2024-05-01T00:00:00Z"),
            MergeStrategy::LatestTimestamp,
        );
        assert_eq!(merged, json!("2024-05-01T00:00:00Z"));
    }

    #[test]
    fn test_timestamp_formats() {
        assert!(parse_timestamp("2024-01-15T08:30:00+02:00").is_some());
        assert!(parse_timestamp("2024-01-15T08:30:00.123").is_some());
        assert!(parse_timestamp("2024-01-15 08:30:00").is_some());
        assert!(parse_timestamp("2024-01-15").is_some());
        assert!(parse_timestamp("last tuesday").is_none());
        assert!(extract_timestamp(&json!({"modified_at": 12})).is_none());
    }

    #[test]
    fn test_longest_value() {
        assert_eq!(
            merge_field("subject", &json!("longer text"), &json!("short"), MergeStrategy::LongestValue),
            json!("longer text")
        );
        assert_eq!(
            merge_field("subject", &json!("abc"), &json!("xyz"), MergeStrategy::LongestValue),
            json!("xyz")
        );
    }

    #[test]
    fn test_concatenate_law() {
        let merged = merge_field("description", &json!("s"), &json!("d"), MergeStrategy::Concatenate);
        let text = merged.as_str().unwrap();

        let d_pos = text.find('d').unwrap();
        let attributed = text.find("merged from source: s").unwrap();
        assert!(d_pos < attributed);
        assert_eq!(text, "d\n\nmerged from source: s");
    }

    #[test]
    fn test_concatenate_non_string_keeps_destination() {
        assert_eq!(
            merge_field("estimate", &json!(5), &json!(3), MergeStrategy::Concatenate),
            json!(3)
        );
    }

    #[test]
    fn test_custom_free_text_and_lists() {
        let text = merge_field("description", &json!("from jira"), &json!("edited"), MergeStrategy::Custom);
        assert_eq!(text, json!("edited\n\n--- merged from source ---\nfrom jira"));

        let labels = merge_field(
            "labels",
            &json!(["bug", "ui", "backend"]),
            &json!(["ui", "triaged"]),
            MergeStrategy::Custom,
        );
        assert_eq!(labels, json!(["ui", "triaged", "bug", "backend"]));

        let other = merge_field("priority", &json!("High"), &json!("Low"), MergeStrategy::Custom);
        assert_eq!(other, json!("Low"));
    }
}
