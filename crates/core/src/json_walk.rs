//! Bounded traversal and sanitisation helpers over loosely-typed JSON.
//!
//! The render engine's output records have no fixed schema; these helpers let
//! the telemetry extractor poke around in them without risking unbounded
//! recursion or unbounded memory when an engine node nests large structures.

use serde_json::{Map, Value};

/// Lowercases a key and collapses every run of non-alphanumeric characters to
/// a single underscore, e.g. `"Prompt Tokens"` -> `"prompt_tokens"`.
pub fn normalize_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut last_was_sep = false;
    for ch in key.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    out.trim_matches('_').to_string()
}

/// Depth-first search for the first object whose own keys (after
/// normalisation) contain any of `candidates`, returning that key's value.
///
/// `max_depth` bounds recursion into nested objects/arrays; `max_breadth`
/// bounds how many sibling entries are visited per object/array.
pub fn find_first_numeric(
    value: &Value,
    candidates: &[&str],
    max_depth: usize,
    max_breadth: usize,
) -> Option<f64> {
    find_first_numeric_inner(value, candidates, max_depth, max_breadth)
}

fn find_first_numeric_inner(
    value: &Value,
    candidates: &[&str],
    depth_remaining: usize,
    max_breadth: usize,
) -> Option<f64> {
    match value {
        Value::Object(map) => {
            for (k, v) in map.iter().take(max_breadth) {
                let normalized = normalize_key(k);
                if candidates.contains(&normalized.as_str()) {
                    if let Some(n) = v.as_f64() {
                        return Some(n);
                    }
                    if let Some(n) = v.as_str().and_then(parse_numeric_str) {
                        return Some(n);
                    }
                }
            }
            if depth_remaining == 0 {
                return None;
            }
            for (_, v) in map.iter().take(max_breadth) {
                if let Some(found) =
                    find_first_numeric_inner(v, candidates, depth_remaining - 1, max_breadth)
                {
                    return Some(found);
                }
            }
            None
        }
        Value::Array(items) => {
            if depth_remaining == 0 {
                return None;
            }
            for item in items.iter().take(max_breadth) {
                if let Some(found) =
                    find_first_numeric_inner(item, candidates, depth_remaining - 1, max_breadth)
                {
                    return Some(found);
                }
            }
            None
        }
        _ => None,
    }
}

/// Parses a numeric string that may carry thousands separators (`"12,345"`).
pub fn parse_numeric_str(s: &str) -> Option<f64> {
    let cleaned: String = s.chars().filter(|c| *c != ',').collect();
    let n: f64 = cleaned.trim().parse().ok()?;
    n.is_finite().then_some(n)
}

/// Finds the first object value, among `candidates`, that is itself a JSON
/// object (used to locate a node's usage payload among several alias keys).
pub fn find_first_object<'a>(value: &'a Value, candidates: &[&str]) -> Option<&'a Value> {
    let map = value.as_object()?;
    for key in candidates {
        if let Some(v) = map.get(*key) {
            if v.is_object() {
                return Some(v);
            }
        }
    }
    None
}

/// Breadth-limited search for the first descendant object containing any key
/// (after normalisation) in `hint_keys`.
pub fn find_descendant_object_with_any_key<'a>(
    value: &'a Value,
    hint_keys: &[&str],
    max_depth: usize,
    max_breadth: usize,
) -> Option<&'a Value> {
    find_descendant_inner(value, hint_keys, max_depth, max_breadth)
}

fn find_descendant_inner<'a>(
    value: &'a Value,
    hint_keys: &[&str],
    depth_remaining: usize,
    max_breadth: usize,
) -> Option<&'a Value> {
    let map = value.as_object()?;
    if map
        .keys()
        .take(max_breadth)
        .any(|k| hint_keys.contains(&normalize_key(k).as_str()))
    {
        return Some(value);
    }
    if depth_remaining == 0 {
        return None;
    }
    for (_, v) in map.iter().take(max_breadth) {
        if let Some(found) = find_descendant_inner(v, hint_keys, depth_remaining - 1, max_breadth)
        {
            return Some(found);
        }
    }
    None
}

/// Collects up to `max_leaves` string leaves from `value`, depth- and
/// breadth-bounded, for regex scraping of free-form `ui` payloads.
pub fn collect_string_leaves(value: &Value, max_leaves: usize, max_depth: usize) -> Vec<String> {
    let mut out = Vec::new();
    collect_string_leaves_inner(value, max_leaves, max_depth, &mut out);
    out
}

fn collect_string_leaves_inner(
    value: &Value,
    max_leaves: usize,
    depth_remaining: usize,
    out: &mut Vec<String>,
) {
    if out.len() >= max_leaves {
        return;
    }
    match value {
        Value::String(s) => out.push(s.clone()),
        Value::Array(items) => {
            if depth_remaining == 0 {
                return;
            }
            for item in items {
                if out.len() >= max_leaves {
                    break;
                }
                collect_string_leaves_inner(item, max_leaves, depth_remaining - 1, out);
            }
        }
        Value::Object(map) => {
            if depth_remaining == 0 {
                return;
            }
            for (_, v) in map {
                if out.len() >= max_leaves {
                    break;
                }
                collect_string_leaves_inner(v, max_leaves, depth_remaining - 1, out);
            }
        }
        _ => {}
    }
}

/// Size/shape limits applied when copying a JSON value for attachment to an
/// outgoing report, so a misbehaving engine node can't inflate the payload.
#[derive(Debug, Clone, Copy)]
pub struct SanitizeLimits {
    pub max_depth: usize,
    pub max_map_entries: usize,
    pub max_list_items: usize,
    pub max_string_len: usize,
    pub max_key_len: usize,
    pub max_fallback_len: usize,
}

impl Default for SanitizeLimits {
    fn default() -> Self {
        Self {
            max_depth: 4,
            max_map_entries: 30,
            max_list_items: 30,
            max_string_len: 800,
            max_key_len: 80,
            max_fallback_len: 200,
        }
    }
}

const TRUNCATION_SENTINEL: &str = "__truncated__";

/// Produces a depth/breadth/length-bounded copy of `value`, suitable for
/// attaching to a report sent off-box.
pub fn sanitize(value: &Value, limits: &SanitizeLimits) -> Value {
    sanitize_inner(value, limits, limits.max_depth)
}

fn sanitize_inner(value: &Value, limits: &SanitizeLimits, depth_remaining: usize) -> Value {
    match value {
        Value::String(s) => Value::String(truncate_str(s, limits.max_string_len)),
        Value::Object(map) => {
            if depth_remaining == 0 {
                return Value::String(TRUNCATION_SENTINEL.to_string());
            }
            let mut out = Map::new();
            for (k, v) in map.iter().take(limits.max_map_entries) {
                let key = truncate_str(k, limits.max_key_len);
                out.insert(key, sanitize_inner(v, limits, depth_remaining - 1));
            }
            if map.len() > limits.max_map_entries {
                out.insert(
                    TRUNCATION_SENTINEL.to_string(),
                    Value::from(map.len() - limits.max_map_entries),
                );
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            if depth_remaining == 0 {
                return Value::String(TRUNCATION_SENTINEL.to_string());
            }
            let mut out: Vec<Value> = items
                .iter()
                .take(limits.max_list_items)
                .map(|v| sanitize_inner(v, limits, depth_remaining - 1))
                .collect();
            if items.len() > limits.max_list_items {
                out.push(Value::String(TRUNCATION_SENTINEL.to_string()));
            }
            Value::Array(out)
        }
        other => other.clone(),
    }
}

fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let mut truncated: String = s.chars().take(max_len).collect();
        truncated.push_str("...");
        truncated
    }
}

/// Best-effort string coercion for values that should be strings but might
/// arrive as numbers/bools from a loosely-typed source, falling back to a
/// truncated debug rendering.
pub fn coerce_string(value: &Value, max_fallback_len: usize) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => None,
        other => Some(truncate_str(&other.to_string(), max_fallback_len)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_key_collapses_separators() {
        assert_eq!(normalize_key("Prompt Tokens"), "prompt_tokens");
        assert_eq!(normalize_key("prompt-token-count"), "prompt_token_count");
        assert_eq!(normalize_key("__weird__key__"), "weird_key");
    }

    #[test]
    fn find_first_numeric_matches_normalized_keys() {
        let v = json!({ "Prompt Tokens": 120 });
        assert_eq!(
            find_first_numeric(&v, &["prompt_tokens"], 4, 30),
            Some(120.0)
        );
    }

    #[test]
    fn find_first_numeric_parses_comma_strings() {
        let v = json!({ "total_tokens": "1,234" });
        assert_eq!(
            find_first_numeric(&v, &["total_tokens"], 4, 30),
            Some(1234.0)
        );
    }

    #[test]
    fn sanitize_truncates_oversized_collections() {
        let big_list: Vec<Value> = (0..50).map(Value::from).collect();
        let v = json!({ "items": big_list });
        let out = sanitize(&v, &SanitizeLimits::default());
        let items = out["items"].as_array().unwrap();
        assert_eq!(items.len(), 31); // 30 kept + sentinel
    }

    #[test]
    fn sanitize_caps_depth() {
        let v = json!({ "a": { "b": { "c": { "d": { "e": 1 } } } } });
        let out = sanitize(
            &v,
            &SanitizeLimits {
                max_depth: 2,
                ..Default::default()
            },
        );
        // depth 2 allows a -> b, but b's child c is replaced by the sentinel.
        assert_eq!(out["a"]["b"], Value::String(TRUNCATION_SENTINEL.to_string()));
    }
}
