//! Dynamic JSON shape accessors
//!
//! The wire format is ad-hoc: a field may be a string, an object with
//! an `id`, an array of either, or absent. These helpers define the
//! three shapes once so the normalizer never scatters
//! `if array else if object` checks.

use serde_json::Value;

/// First string under `key`, looking through a singleton array.
pub fn first_of_many<'a>(obj: &'a Value, key: &str) -> Option<&'a str> {
    match obj.get(key)? {
        Value::String(s) => Some(s.as_str()),
        Value::Array(items) => items.iter().find_map(|item| item.as_str()),
        _ => None,
    }
}

/// A string, or an object's `id`; how `object` and `inReplyTo` arrive.
pub fn string_or_id<'a>(obj: &'a Value, key: &str) -> Option<&'a str> {
    match obj.get(key)? {
        Value::String(s) => Some(s.as_str()),
        Value::Object(map) => map.get("id").and_then(Value::as_str),
        _ => None,
    }
}

/// Treat `key` as a list whether it holds a map, a string, or an array.
pub fn one_for_all<'a>(obj: &'a Value, key: &str) -> Vec<&'a Value> {
    match obj.get(key) {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(value @ (Value::Object(_) | Value::String(_))) => vec![value],
        _ => Vec::new(),
    }
}

/// Plain string access.
pub fn get_string<'a>(obj: &'a Value, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

/// Nested map access.
pub fn get_map<'a>(obj: &'a Value, key: &str) -> Option<&'a Value> {
    obj.get(key).filter(|v| v.is_object())
}

/// The author of an object: a bare string, or the id of the first
/// Person-typed (or untyped) entry in `attributedTo`.
pub fn extract_attributed_to(obj: &Value) -> Option<String> {
    for entry in one_for_all(obj, "attributedTo") {
        match entry {
            Value::String(s) => return Some(s.clone()),
            Value::Object(map) => {
                let kind = map.get("type").and_then(Value::as_str).unwrap_or("");
                if kind == "Person" || kind.is_empty() {
                    if let Some(id) = map.get("id").and_then(Value::as_str) {
                        return Some(id.to_string());
                    }
                }
            }
            _ => {}
        }
    }
    None
}

/// Gather every address in `to`, `cc`, and `attributedTo`.
pub fn collect_addresses(obj: &Value, into: &mut Vec<String>) {
    for key in ["to", "cc", "attributedTo"] {
        match obj.get(key) {
            Some(Value::String(s)) => into.push(s.clone()),
            Some(Value::Array(items)) => {
                for item in items {
                    if let Value::String(s) = item {
                        into.push(s.clone());
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_of_many_handles_all_shapes() {
        assert_eq!(first_of_many(&json!({"type": "Note"}), "type"), Some("Note"));
        assert_eq!(
            first_of_many(&json!({"type": ["Note", "Article"]}), "type"),
            Some("Note")
        );
        assert_eq!(first_of_many(&json!({"type": 7}), "type"), None);
        assert_eq!(first_of_many(&json!({}), "type"), None);
    }

    #[test]
    fn string_or_id_reads_nested_objects() {
        assert_eq!(
            string_or_id(&json!({"inReplyTo": "https://x/1"}), "inReplyTo"),
            Some("https://x/1")
        );
        assert_eq!(
            string_or_id(&json!({"inReplyTo": {"id": "https://x/2"}}), "inReplyTo"),
            Some("https://x/2")
        );
        assert_eq!(string_or_id(&json!({"inReplyTo": []}), "inReplyTo"), None);
    }

    #[test]
    fn extract_attributed_to_prefers_person_objects() {
        assert_eq!(
            extract_attributed_to(&json!({"attributedTo": "https://x/u/a"})),
            Some("https://x/u/a".to_string())
        );
        assert_eq!(
            extract_attributed_to(&json!({"attributedTo": [
                {"type": "Link", "id": "https://x/link"},
                {"type": "Person", "id": "https://x/u/b"}
            ]})),
            Some("https://x/u/b".to_string())
        );
        assert_eq!(extract_attributed_to(&json!({})), None);
    }

    #[test]
    fn collect_addresses_merges_to_cc_attribution() {
        let mut addresses = Vec::new();
        collect_addresses(
            &json!({
                "to": ["https://a", "https://b"],
                "cc": "https://c",
                "attributedTo": "https://d"
            }),
            &mut addresses,
        );
        assert_eq!(addresses, vec!["https://a", "https://b", "https://c", "https://d"]);
    }
}
