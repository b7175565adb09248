//! Best-effort recovery of per-node usage/billing telemetry from the render
//! engine's output records.
//!
//! The render engine embeds third-party usage information (tokens, credits,
//! cost) in whatever shape the node author chose. Nothing here can fail the
//! job: every error is swallowed and simply yields no event for that node.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use forgeworker_core::json_walk::{
    coerce_string, collect_string_leaves, find_descendant_object_with_any_key, find_first_numeric,
    find_first_object, parse_numeric_str, sanitize, SanitizeLimits,
};
use forgeworker_core::model::UsageEvent;

const MAX_WALK_DEPTH: usize = 5;
const MAX_WALK_BREADTH: usize = 30;
const MAX_SCRAPE_LEAVES: usize = 25;
const MAX_SCRAPE_TEXT_LEN: usize = 4000;

const USAGE_PAYLOAD_KEYS: &[&str] = &[
    "usage",
    "token_usage",
    "usage_data",
    "usage_metadata",
    "billing",
    "cost_breakdown",
];

const INPUT_TOKEN_KEYS: &[&str] = &[
    "prompt_tokens",
    "input_tokens",
    "tokens_in",
    "prompt_token_count",
    "input_token_count",
];
const OUTPUT_TOKEN_KEYS: &[&str] = &[
    "completion_tokens",
    "output_tokens",
    "tokens_out",
    "completion_token_count",
    "output_token_count",
];
const TOTAL_TOKEN_KEYS: &[&str] = &["total_tokens", "token_count", "total_token_count"];
const CREDIT_KEYS: &[&str] = &["credits", "credit", "credits_used", "token_cost", "partner_tokens"];
const COST_KEYS: &[&str] = &["cost", "usd_cost", "cost_usd", "price_usd", "cost_in_usd"];
const MODEL_KEYS: &[&str] = &[
    "model",
    "model_name",
    "model_id",
    "engine",
    "provider_model",
    "llm_model",
    "chat_model",
];

const PROVIDER_DICTIONARY: &[(&str, &str)] = &[
    ("openai", "openai"),
    ("gemini", "google"),
    ("google", "google"),
    ("anthropic", "anthropic"),
    ("claude", "anthropic"),
    ("kling", "kling"),
    ("runway", "runway"),
    ("stability", "stability"),
    ("vidu", "vidu"),
    ("tripo", "tripo"),
    ("luma", "luma"),
    ("minimax", "minimax"),
    ("ideogram", "ideogram"),
    ("pixverse", "pixverse"),
    ("recraft", "recraft"),
];

static INPUT_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:input|prompt)\s*tokens?\D+([0-9][0-9,]*)").unwrap());
static OUTPUT_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:output|completion)\s*tokens?\D+([0-9][0-9,]*)").unwrap());
static TOTAL_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)total\s*tokens?\D+([0-9][0-9,]*)").unwrap());
static CREDITS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)credits?\D+([0-9]+(?:\.[0-9]+)?)").unwrap());
static COST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:cost|price)\D+\$?\s*([0-9]+(?:\.[0-9]+)?)").unwrap());

/// Workflow-side context about a node, used to seed provider/model detection.
#[derive(Debug, Clone, Default)]
pub(crate) struct NodeContext<'a> {
    pub(crate) class_type: &'a str,
    pub(crate) display_name: Option<&'a str>,
    pub(crate) declared_provider: Option<&'a str>,
    /// The node's workflow-graph `inputs` mapping, if the node is still
    /// present in the workflow the job submitted. Models are most often
    /// declared here (e.g. `model_name: "gemini-2.5-pro"`) rather than in the
    /// engine's output record.
    pub(crate) node_inputs: Option<&'a Value>,
}

/// Extracts a usage event from one node's output record, or `None` if no
/// usage signal could be found. Never panics or propagates an error; any
/// internal failure degrades to `None`.
pub(crate) fn extract_node_usage(node_id: &str, node_output: &Value, ctx: &NodeContext<'_>) -> Option<UsageEvent> {
    let usage_payload = find_first_object(node_output, USAGE_PAYLOAD_KEYS).or_else(|| {
        find_descendant_object_with_any_key(
            node_output,
            &all_metric_key_hints(),
            MAX_WALK_DEPTH,
            MAX_WALK_BREADTH,
        )
    });

    let search_root = usage_payload.unwrap_or(node_output);

    let input_tokens = find_first_numeric(search_root, INPUT_TOKEN_KEYS, MAX_WALK_DEPTH, MAX_WALK_BREADTH);
    let output_tokens =
        find_first_numeric(search_root, OUTPUT_TOKEN_KEYS, MAX_WALK_DEPTH, MAX_WALK_BREADTH);
    let mut total_tokens =
        find_first_numeric(search_root, TOTAL_TOKEN_KEYS, MAX_WALK_DEPTH, MAX_WALK_BREADTH);
    let mut credits = find_first_numeric(search_root, CREDIT_KEYS, MAX_WALK_DEPTH, MAX_WALK_BREADTH);
    let mut cost = find_first_numeric(search_root, COST_KEYS, MAX_WALK_DEPTH, MAX_WALK_BREADTH);
    let model = ctx
        .node_inputs
        .and_then(|inputs| find_first_string(inputs, MODEL_KEYS))
        .or_else(|| find_first_string(search_root, MODEL_KEYS));

    let ui_payload = node_output.get("ui");

    let mut input_tokens_u = input_tokens;
    let mut output_tokens_u = output_tokens;

    if input_tokens_u.is_none() || output_tokens_u.is_none() || total_tokens.is_none() || credits.is_none() || cost.is_none() {
        if let Some(ui) = ui_payload {
            let leaves = collect_string_leaves(ui, MAX_SCRAPE_LEAVES, MAX_WALK_DEPTH);
            let mut joined = leaves.join("\n");
            if joined.chars().count() > MAX_SCRAPE_TEXT_LEN {
                joined = joined.chars().take(MAX_SCRAPE_TEXT_LEN).collect();
            }
            if input_tokens_u.is_none() {
                input_tokens_u = scrape(&INPUT_TOKEN_RE, &joined);
            }
            if output_tokens_u.is_none() {
                output_tokens_u = scrape(&OUTPUT_TOKEN_RE, &joined);
            }
            if total_tokens.is_none() {
                total_tokens = scrape(&TOTAL_TOKEN_RE, &joined);
            }
            if credits.is_none() {
                credits = scrape(&CREDITS_RE, &joined);
            }
            if cost.is_none() {
                cost = scrape(&COST_RE, &joined);
            }
        }
    }

    if total_tokens.is_none() {
        if let (Some(i), Some(o)) = (input_tokens_u, output_tokens_u) {
            total_tokens = Some(i + o);
        }
    }

    let has_any_metric = input_tokens_u.is_some()
        || output_tokens_u.is_some()
        || total_tokens.is_some()
        || credits.is_some()
        || cost.is_some();

    if !has_any_metric && usage_payload.is_none() && ui_payload.is_none() {
        return None;
    }

    let provider = detect_provider(ctx.class_type, ctx.declared_provider);
    let limits = SanitizeLimits::default();

    Some(UsageEvent {
        node_id: node_id.to_string(),
        node_class_type: ctx.class_type.to_string(),
        node_display_name: ctx.display_name.map(str::to_string),
        provider,
        model,
        input_tokens: input_tokens_u.map(round_to_u64),
        output_tokens: output_tokens_u.map(round_to_u64),
        total_tokens: total_tokens.map(round_to_u64),
        credits: credits.map(|v| round_to(v, 6)),
        cost_usd_reported: cost.map(|v| round_to(v, 8)),
        usage_json: usage_payload.map(|v| sanitize(v, &limits)),
        ui_json: ui_payload.map(|v| sanitize(v, &limits)),
    })
}

fn all_metric_key_hints() -> Vec<&'static str> {
    INPUT_TOKEN_KEYS
        .iter()
        .chain(OUTPUT_TOKEN_KEYS)
        .chain(TOTAL_TOKEN_KEYS)
        .chain(CREDIT_KEYS)
        .chain(COST_KEYS)
        .copied()
        .collect()
}

fn find_first_string(value: &Value, candidates: &[&str]) -> Option<String> {
    let map = value.as_object()?;
    let limits = SanitizeLimits::default();
    for (k, v) in map {
        let normalized = forgeworker_core::json_walk::normalize_key(k);
        if candidates.contains(&normalized.as_str()) {
            if let Some(s) = coerce_string(v, limits.max_fallback_len) {
                return Some(s);
            }
        }
    }
    None
}

fn scrape(re: &Regex, haystack: &str) -> Option<f64> {
    let captures = re.captures(haystack)?;
    let raw = captures.get(1)?.as_str();
    parse_numeric_str(raw)
}

fn round_to_u64(v: f64) -> u64 {
    v.max(0.0).round() as u64
}

fn round_to(v: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (v * factor).round() / factor
}

fn detect_provider(class_type: &str, declared: Option<&str>) -> String {
    let haystack = format!("{class_type} {}", declared.unwrap_or_default()).to_lowercase();
    for (needle, provider) in PROVIDER_DICTIONARY {
        if haystack.contains(needle) {
            return provider.to_string();
        }
    }
    if haystack.contains("api") {
        "comfy_partner".to_string()
    } else {
        "unknown".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn structured_usage_payload_is_extracted() {
        let node_output = json!({
            "usage": { "prompt_tokens": 120, "completion_tokens": 45, "total_tokens": 165 }
        });
        let node_inputs = json!({ "model": "gpt-4o-mini" });
        let ctx = NodeContext {
            class_type: "OpenAIChat",
            display_name: Some("OpenAI Chat"),
            declared_provider: None,
            node_inputs: Some(&node_inputs),
        };
        let event = extract_node_usage("18", &node_output, &ctx).unwrap();
        assert_eq!(event.provider, "openai");
        assert_eq!(event.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(event.input_tokens, Some(120));
        assert_eq!(event.output_tokens, Some(45));
        assert_eq!(event.total_tokens, Some(165));
        assert_eq!(event.node_display_name.as_deref(), Some("OpenAI Chat"));
    }

    #[test]
    fn zero_values_still_emit_an_event() {
        let node_output = json!({ "usage": { "prompt_tokens": 0, "completion_tokens": 0 } });
        let ctx = NodeContext {
            class_type: "SomeApiNode",
            ..Default::default()
        };
        let event = extract_node_usage("1", &node_output, &ctx).unwrap();
        assert_eq!(event.total_tokens, Some(0));
    }

    #[test]
    fn ui_text_scraping_recovers_all_fields() {
        let node_output = json!({
            "ui": {
                "text": [
                    "Prompt tokens: 210",
                    "Completion tokens: 88",
                    "Total tokens: 298",
                    "Credits: 3.5",
                    "Cost: $0.0245"
                ]
            }
        });
        let node_inputs = json!({ "model_name": "gemini-2.5-pro" });
        let ctx = NodeContext {
            class_type: "GoogleGemini",
            declared_provider: None,
            display_name: None,
            node_inputs: Some(&node_inputs),
        };
        let event = extract_node_usage("1", &node_output, &ctx).unwrap();
        assert_eq!(event.provider, "google");
        assert_eq!(event.model.as_deref(), Some("gemini-2.5-pro"));
        assert_eq!(event.input_tokens, Some(210));
        assert_eq!(event.output_tokens, Some(88));
        assert_eq!(event.total_tokens, Some(298));
        assert_eq!(event.credits, Some(3.5));
        assert_eq!(event.cost_usd_reported, Some(0.0245));
    }

    #[test]
    fn no_signal_yields_no_event() {
        let node_output = json!({ "images": [{ "filename": "a.png" }] });
        let ctx = NodeContext {
            class_type: "SaveImage",
            ..Default::default()
        };
        assert!(extract_node_usage("1", &node_output, &ctx).is_none());
    }

    #[test]
    fn unknown_provider_falls_back_to_comfy_partner_or_unknown() {
        assert_eq!(detect_provider("SomeVendorApiNode", None), "comfy_partner");
        assert_eq!(detect_provider("SaveImage", None), "unknown");
    }
}
