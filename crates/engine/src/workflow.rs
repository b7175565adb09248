//! Workflow materialisation: substituting asset/input placeholders into a
//! render-engine graph before submission.
//!
//! The graph is treated as an opaque JSON value except for the specific
//! mutations below; substitution goes through a serialize-replace-reparse
//! round trip so the worker never needs to understand the graph's shape.

use serde_json::Value;

/// How a textual input reference should be rewritten into the workflow,
/// mirroring the three mutually exclusive policies keyed by
/// `input_reference_prefix`.
#[derive(Debug, Clone)]
pub(crate) enum PrefixPolicy<'a> {
    /// `input_reference_prefix` was a non-empty string.
    Explicit(&'a str),
    /// `input_reference_prefix` was present but empty.
    Empty,
    /// `input_reference_prefix` was absent; the reference is classified as a
    /// local file (exists on disk) or an asset id (does not).
    Absent { reference_exists_on_disk: bool },
}

/// Replaces every `placeholder -> filename` occurrence textually in the
/// serialized workflow, then re-parses it.
pub(crate) fn substitute_asset_placeholders(
    workflow: &Value,
    replacements: &[(String, String)],
) -> anyhow::Result<Value> {
    if replacements.is_empty() {
        return Ok(workflow.clone());
    }
    let mut text = serde_json::to_string(workflow)?;
    for (placeholder, filename) in replacements {
        text = text.replace(placeholder.as_str(), filename.as_str());
    }
    Ok(serde_json::from_str(&text)?)
}

/// Applies the input-reference substitution policy to the serialized
/// workflow for the given `placeholder` and `reference` (a local path or an
/// asset id/URL, depending on policy).
pub(crate) fn substitute_input_reference(
    workflow: &Value,
    placeholder: &str,
    reference: &str,
    policy: &PrefixPolicy<'_>,
) -> anyhow::Result<Value> {
    let mut text = serde_json::to_string(workflow)?;
    match policy {
        PrefixPolicy::Explicit(prefix) => {
            let prefixed_placeholder = format!("{prefix}{placeholder}");
            let prefixed_reference = format!("{prefix}{reference}");
            text = text.replace(&prefixed_placeholder, &prefixed_reference);
            text = text.replace(placeholder, &prefixed_reference);
        }
        PrefixPolicy::Empty => {
            let asset_uri_placeholder = format!("asset://{placeholder}");
            text = text.replace(&asset_uri_placeholder, reference);
            text = text.replace(placeholder, reference);
        }
        PrefixPolicy::Absent {
            reference_exists_on_disk,
        } => {
            if *reference_exists_on_disk {
                text = text.replace(placeholder, reference);
            } else {
                let asset_uri_placeholder = format!("asset://{placeholder}");
                let asset_uri_reference = format!("asset://{reference}");
                text = text.replace(&asset_uri_placeholder, &asset_uri_reference);
                text = text.replace(placeholder, &asset_uri_reference);
            }
        }
    }
    Ok(serde_json::from_str(&text)?)
}

/// Rewrites the reference the same way `substitute_input_reference` would,
/// for writing directly into a targeted `inputs[field]` slot rather than via
/// textual placeholder replacement.
pub(crate) fn qualify_reference_for_direct_write(reference: &str, policy: &PrefixPolicy<'_>) -> String {
    match policy {
        PrefixPolicy::Explicit(prefix) => format!("{prefix}{reference}"),
        PrefixPolicy::Empty => reference.to_string(),
        PrefixPolicy::Absent {
            reference_exists_on_disk,
        } => {
            if *reference_exists_on_disk {
                reference.to_string()
            } else {
                format!("asset://{reference}")
            }
        }
    }
}

/// Writes `value` into `workflow[node_id].inputs[field]`, if the node and its
/// `inputs` mapping exist.
pub(crate) fn set_node_input(workflow: &mut Value, node_id: &str, field: &str, value: Value) -> bool {
    workflow
        .get_mut(node_id)
        .and_then(|node| node.get_mut("inputs"))
        .and_then(Value::as_object_mut)
        .map(|inputs| {
            inputs.insert(field.to_string(), value);
        })
        .is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn no_placeholders_round_trips_unchanged() {
        let workflow = json!({ "1": { "class_type": "Save", "inputs": {} } });
        let out = substitute_asset_placeholders(&workflow, &[]).unwrap();
        assert_eq!(out, workflow);
    }

    #[test]
    fn asset_placeholder_is_replaced_everywhere() {
        let workflow = json!({ "1": { "inputs": { "image": "__IMG__" } } });
        let out = substitute_asset_placeholders(
            &workflow,
            &[("__IMG__".to_string(), "uploaded42.png".to_string())],
        )
        .unwrap();
        assert_eq!(out["1"]["inputs"]["image"], json!("uploaded42.png"));
    }

    #[test]
    fn explicit_prefix_rewrites_bare_and_prefixed_occurrences() {
        let workflow = json!({
            "1": { "inputs": { "a": "__INPUT_PATH__", "b": "asset://__INPUT_PATH__" } }
        });
        let policy = PrefixPolicy::Explicit("asset://");
        let out =
            substitute_input_reference(&workflow, "__INPUT_PATH__", "abc123", &policy).unwrap();
        assert_eq!(out["1"]["inputs"]["a"], json!("asset://abc123"));
        assert_eq!(out["1"]["inputs"]["b"], json!("asset://abc123"));
    }

    #[test]
    fn empty_prefix_strips_asset_scheme() {
        let workflow = json!({ "1": { "inputs": { "a": "asset://__INPUT_PATH__" } } });
        let policy = PrefixPolicy::Empty;
        let out =
            substitute_input_reference(&workflow, "__INPUT_PATH__", "abc123", &policy).unwrap();
        assert_eq!(out["1"]["inputs"]["a"], json!("abc123"));
    }

    #[test]
    fn absent_prefix_treats_nonexistent_reference_as_asset_id() {
        let workflow = json!({ "1": { "inputs": { "a": "__INPUT_PATH__" } } });
        let policy = PrefixPolicy::Absent {
            reference_exists_on_disk: false,
        };
        let out =
            substitute_input_reference(&workflow, "__INPUT_PATH__", "abc123", &policy).unwrap();
        assert_eq!(out["1"]["inputs"]["a"], json!("asset://abc123"));
    }

    #[test]
    fn absent_prefix_treats_local_file_as_plain_path() {
        let workflow = json!({ "1": { "inputs": { "a": "__INPUT_PATH__" } } });
        let policy = PrefixPolicy::Absent {
            reference_exists_on_disk: true,
        };
        let out =
            substitute_input_reference(&workflow, "__INPUT_PATH__", "/tmp/x.mp4", &policy)
                .unwrap();
        assert_eq!(out["1"]["inputs"]["a"], json!("/tmp/x.mp4"));
    }

    #[test]
    fn set_node_input_writes_into_existing_inputs_map() {
        let mut workflow = json!({ "5": { "inputs": { "video": "old" } } });
        assert!(set_node_input(&mut workflow, "5", "video", json!("new")));
        assert_eq!(workflow["5"]["inputs"]["video"], json!("new"));
    }

    #[test]
    fn set_node_input_fails_gracefully_on_missing_node() {
        let mut workflow = json!({ "5": { "inputs": {} } });
        assert!(!set_node_input(&mut workflow, "9", "video", json!("new")));
    }
}
