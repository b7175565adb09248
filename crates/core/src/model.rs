//! Wire-level data types shared between the dispatch client, the render-engine
//! client, and the job executor.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A leased unit of work handed to this worker by the dispatch service.
#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    pub dispatch_id: i64,
    pub lease_token: String,
    #[serde(default)]
    pub input_url: Option<String>,
    pub output_url: String,
    #[serde(default)]
    pub output_headers: BTreeMap<String, Value>,
    pub input_payload: InputPayload,
    #[serde(default)]
    pub provider: Option<String>,
}

/// Job-scoped description of how to materialise a render-engine workflow.
#[derive(Debug, Clone, Deserialize)]
pub struct InputPayload {
    #[serde(default)]
    pub workflow: Option<Value>,
    #[serde(default, rename = "comfyui_workflow")]
    pub comfyui_workflow: Option<Value>,
    #[serde(default = "default_input_path_placeholder")]
    pub input_path_placeholder: String,
    #[serde(default)]
    pub input_reference_prefix: Option<String>,
    #[serde(default)]
    pub input_node_id: Option<String>,
    #[serde(default)]
    pub input_field: Option<String>,
    #[serde(default)]
    pub output_node_id: Option<String>,
    #[serde(default)]
    pub extra_data: Option<Value>,
    #[serde(default)]
    pub assets: Vec<AssetDescriptor>,
}

impl InputPayload {
    /// Returns whichever of `workflow` / `comfyui_workflow` was supplied.
    pub fn workflow_value(&self) -> Option<&Value> {
        self.workflow.as_ref().or(self.comfyui_workflow.as_ref())
    }
}

fn default_input_path_placeholder() -> String {
    "__INPUT_PATH__".to_string()
}

/// One asset that must be uploaded to the render engine before the workflow runs.
#[derive(Debug, Clone, Deserialize)]
pub struct AssetDescriptor {
    pub placeholder: String,
    pub download_url: String,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub is_primary_input: bool,
}

/// The subset of a render-engine `/history/<id>` response the worker cares about.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineHistoryEntry {
    #[serde(default)]
    pub status: Option<EngineStatus>,
    #[serde(default)]
    pub outputs: EngineOutputs,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineStatus {
    #[serde(default)]
    pub status_str: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Node id -> arbitrary output record (artifact lists, `ui`, `usage`, ...).
pub type EngineOutputs = BTreeMap<String, Value>;

/// A recovered usage/billing observation for one output node.
#[derive(Debug, Clone, Serialize)]
pub struct UsageEvent {
    pub node_id: String,
    pub node_class_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_display_name: Option<String>,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credits: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd_reported: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_json: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ui_json: Option<Value>,
}
