//! Helpers for normalizing record fields before storage.

use super::types::{ID_FIELD, NormalizeError, Record, Value};

/// Fields that may arrive as a single comma-joined string.
pub const MULTI_VALUED_FIELDS: [&str; 2] = ["actors", "director"];

/// Outcome of the normalization stage for a single record.
pub type NormalizeResult = Result<Record, NormalizeError>;

/// Split comma-joined multi-valued fields into trimmed lists.
///
/// Only text values containing a comma are split; a single name stays a plain string and
/// values that already arrive as lists are left untouched. Absent fields are fine. The record
/// must carry a usable `id`; a text id is stored trimmed so it matches the document key.
pub fn normalize(mut record: Record) -> NormalizeResult {
    let doc_id = record.doc_id()?;
    if let Some(Value::Text(id)) = record.get(ID_FIELD)
        && *id != doc_id
    {
        record.insert(ID_FIELD, Value::Text(doc_id));
    }

    for field in MULTI_VALUED_FIELDS {
        let Some(Value::Text(joined)) = record.get(field) else {
            continue;
        };
        if !joined.contains(',') {
            continue;
        }
        let items = split_joined(joined);
        record.insert(field, Value::List(items));
    }

    Ok(record)
}

fn split_joined(joined: &str) -> Vec<String> {
    joined
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        Record::from_raw(value.as_object().expect("object")).expect("record")
    }

    #[test]
    fn splits_comma_joined_fields_and_keeps_single_values() {
        let normalized =
            normalize(record(json!({"id": "1", "actors": "A, B", "director": "C"}))).expect("ok");
        assert_eq!(
            normalized.get("actors"),
            Some(&Value::List(vec!["A".into(), "B".into()]))
        );
        assert_eq!(normalized.get("director"), Some(&Value::Text("C".into())));
    }

    #[test]
    fn trims_whitespace_and_drops_empty_segments() {
        let normalized =
            normalize(record(json!({"id": "1", "director": " X ,Y,  , Z "}))).expect("ok");
        assert_eq!(
            normalized.get("director"),
            Some(&Value::List(vec!["X".into(), "Y".into(), "Z".into()]))
        );
    }

    #[test]
    fn leaves_other_fields_and_existing_lists_alone() {
        let normalized = normalize(record(json!({
            "id": "1",
            "title": "Heat, Again",
            "actors": ["A", "B, C"]
        })))
        .expect("ok");
        assert_eq!(
            normalized.get("title"),
            Some(&Value::Text("Heat, Again".into()))
        );
        assert_eq!(
            normalized.get("actors"),
            Some(&Value::List(vec!["A".into(), "B, C".into()]))
        );
    }

    #[test]
    fn tolerates_missing_multi_valued_fields() {
        let normalized = normalize(record(json!({"id": 3, "title": "Up"}))).expect("ok");
        assert_eq!(normalized.len(), 2);
    }

    #[test]
    fn requires_record_id() {
        assert_eq!(
            normalize(record(json!({"actors": "A, B"}))),
            Err(NormalizeError::MissingId)
        );
    }

    #[test]
    fn stored_id_matches_trimmed_document_key() {
        let normalized = normalize(record(json!({"id": " 1 ", "title": "Up"}))).expect("ok");
        assert_eq!(normalized.get("id"), Some(&Value::Text("1".into())));
        assert_eq!(normalized.doc_id().expect("id"), "1");

        let numeric = normalize(record(json!({"id": 7}))).expect("ok");
        assert_eq!(numeric.doc_id().expect("id"), "7");
    }

    #[test]
    fn normalization_is_idempotent() {
        let once = normalize(record(json!({"id": "1", "actors": "A, B"}))).expect("ok");
        let twice = normalize(once.clone()).expect("ok");
        assert_eq!(once, twice);
    }
}
