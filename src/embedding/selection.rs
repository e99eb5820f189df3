//! Field-selection policy applied to records before they are embedded.
//!
//! The policy is a pure function of the record's shape: the `id` field is dropped, and so is
//! any text field whose value is a syntactically valid URL. What remains is serialized as JSON
//! with sorted keys, so two records holding the same fields produce the same text regardless of
//! the order the fields arrived in.

use crate::ingest::{ID_FIELD, Record, Value};
use reqwest::Url;

const URL_SCHEMES: [&str; 4] = ["http", "https", "ftp", "ftps"];

/// Text handed to the encoder together with the names of the fields left out of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedText {
    /// Canonical serialization of the selected fields.
    pub text: String,
    /// Fields dropped by the policy, in sorted order.
    pub excluded: Vec<String>,
}

/// Select the embeddable fields of `record` and serialize them canonically.
pub fn prepare_text(record: &Record) -> PreparedText {
    let mut selected = record.clone();
    let mut excluded = Vec::new();
    selected.retain(|name, value| {
        let keep = name != ID_FIELD && !is_url_value(value);
        if !keep {
            excluded.push(name.to_string());
        }
        keep
    });

    let text = serde_json::to_string(&selected).unwrap_or_else(|_| String::from("{}"));
    PreparedText { text, excluded }
}

fn is_url_value(value: &Value) -> bool {
    value.as_text().is_some_and(is_url)
}

/// Whether `candidate` is an absolute web URL with a host.
pub fn is_url(candidate: &str) -> bool {
    let trimmed = candidate.trim();
    if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
        return false;
    }
    match Url::parse(trimmed) {
        Ok(url) => {
            URL_SCHEMES.contains(&url.scheme())
                && url.host_str().is_some_and(|host| !host.is_empty())
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        Record::from_raw(value.as_object().expect("object")).expect("record")
    }

    #[test]
    fn excludes_id_and_url_fields() {
        let prepared = prepare_text(&record(json!({
            "id": "1",
            "poster_url": "http://x/y.png",
            "title": "Inception"
        })));
        assert!(prepared.text.contains("title"));
        assert!(prepared.text.contains("Inception"));
        assert!(!prepared.text.contains("poster_url"));
        assert!(!prepared.text.contains("http://x/y.png"));
        assert!(!prepared.text.contains("\"id\""));
        assert_eq!(prepared.excluded, vec!["id".to_string(), "poster_url".to_string()]);
    }

    #[test]
    fn serialization_is_independent_of_field_order() {
        let a = prepare_text(&record(json!({"title": "Dune", "year": 2021, "id": "1"})));
        let b = prepare_text(&record(json!({"id": "9", "year": 2021, "title": "Dune"})));
        assert_eq!(a.text, b.text);
    }

    #[test]
    fn url_detection_requires_scheme_and_host() {
        assert!(is_url("http://x/y.png"));
        assert!(is_url("https://image.tmdb.org/t/p/w500/poster.jpg"));
        assert!(is_url("ftp://files.example.org/a"));
        assert!(!is_url("Inception"));
        assert!(!is_url("mailto:someone@example.org"));
        assert!(!is_url("www.example.org"));
        assert!(!is_url("http://has space.org"));
        assert!(!is_url("Action: Thriller"));
        assert!(!is_url(""));
    }

    #[test]
    fn non_text_values_are_never_treated_as_urls() {
        let prepared = prepare_text(&record(json!({
            "id": "1",
            "links": ["http://a.org", "http://b.org"],
            "year": 1999
        })));
        assert!(prepared.text.contains("links"));
        assert!(prepared.text.contains("year"));
        assert_eq!(prepared.excluded, vec!["id".to_string()]);
    }
}
