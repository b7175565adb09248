//! HTTP client for the render engine's `/prompt`, `/history`, `/upload/image`,
//! and `/view` endpoints, plus output-artifact selection.

use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;

use forgeworker_core::model::{EngineHistoryEntry, EngineOutputs};

#[derive(Debug, thiserror::Error)]
pub(crate) enum RenderEngineError {
    #[error("render engine returned http {status}: {body}")]
    Http {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("render engine submit response was missing `prompt_id`")]
    MissingPromptId,
    #[error("render engine upload response was missing `name`")]
    MissingUploadName,
    #[error("render engine reported an error: {0}")]
    EngineReportedError(String),
    #[error("no output artifact found in any node")]
    NoOutputArtifact,
}

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);
const VIEW_TIMEOUT: Duration = Duration::from_secs(300);

/// Artifact kinds that a node's output record may carry, in the priority
/// order the executor searches them.
pub(crate) const ARTIFACT_KIND_PRIORITY: &[&str] = &["videos", "gifs", "images", "files", "video"];

#[derive(Debug, Clone)]
pub(crate) struct SelectedOutput {
    pub(crate) node_id: String,
    pub(crate) filename: String,
    pub(crate) subfolder: String,
    pub(crate) artifact_type: String,
}

#[derive(Debug, Clone)]
pub(crate) struct RenderEngineClient {
    http: reqwest::Client,
    base_url: Url,
}

#[derive(Debug, Serialize)]
struct SubmitRequest<'a> {
    prompt: &'a Value,
    client_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    extra_data: Option<&'a Value>,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    prompt_id: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ArtifactRecord {
    filename: String,
    #[serde(default)]
    subfolder: String,
    #[serde(default = "default_artifact_type")]
    #[serde(rename = "type")]
    artifact_type: String,
}

fn default_artifact_type() -> String {
    "output".to_string()
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    name: Option<String>,
}

impl RenderEngineClient {
    pub(crate) fn new(http: reqwest::Client, base_url: Url) -> Self {
        Self { http, base_url }
    }

    pub(crate) fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub(crate) async fn submit_prompt(
        &self,
        workflow: &Value,
        client_id: &str,
        extra_data: Option<&Value>,
    ) -> anyhow::Result<String> {
        let url = self.base_url.join("prompt")?;
        let res = self
            .http
            .post(url)
            .json(&SubmitRequest {
                prompt: workflow,
                client_id,
                extra_data,
            })
            .send()
            .await?;
        let body = check_status(res).await?;
        let parsed: SubmitResponse = serde_json::from_str(&body)?;
        let prompt_id = parsed.prompt_id.ok_or(RenderEngineError::MissingPromptId)?;
        Ok(value_to_id_string(&prompt_id))
    }

    /// Fetches `/history/<prompt_id>` and returns the entry if present,
    /// accepting either the literal `prompt_id` or its string form as the
    /// response's top-level key.
    pub(crate) async fn poll_history(&self, prompt_id: &str) -> anyhow::Result<Option<EngineHistoryEntry>> {
        let url = self.base_url.join(&format!("history/{prompt_id}"))?;
        let res = self.http.get(url).send().await?;
        let body = check_status(res).await?;
        let raw: serde_json::Map<String, Value> = serde_json::from_str(&body)?;
        let entry_value = raw
            .get(prompt_id)
            .or_else(|| raw.values().next().filter(|_| raw.len() == 1));
        match entry_value {
            None => Ok(None),
            Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
        }
    }

    pub(crate) async fn upload_image(&self, local_path: &Path, mime: &str) -> anyhow::Result<String> {
        let filename = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload.bin")
            .to_string();
        let len = tokio::fs::metadata(local_path).await?.len();
        let file = tokio::fs::File::open(local_path).await?;
        let stream_body = reqwest::Body::wrap_stream(tokio_util::io::ReaderStream::new(file));
        let part = reqwest::multipart::Part::stream_with_length(stream_body, len)
            .file_name(filename)
            .mime_str(mime)?;
        let form = reqwest::multipart::Form::new()
            .part("image", part)
            .text("type", "input")
            .text("overwrite", "true");

        let url = self.base_url.join("upload/image")?;
        let res = self
            .http
            .post(url)
            .timeout(UPLOAD_TIMEOUT)
            .multipart(form)
            .send()
            .await?;
        let body = check_status(res).await?;
        let parsed: UploadResponse = serde_json::from_str(&body)?;
        parsed.name.ok_or_else(|| RenderEngineError::MissingUploadName.into())
    }

    /// Streams `/view?filename=&subfolder=&type=` to `dest`, returning the
    /// number of bytes written.
    pub(crate) async fn download_view(
        &self,
        filename: &str,
        subfolder: &str,
        artifact_type: &str,
        dest: &Path,
    ) -> anyhow::Result<u64> {
        let mut url = self.base_url.join("view")?;
        url.query_pairs_mut()
            .append_pair("filename", filename)
            .append_pair("subfolder", subfolder)
            .append_pair("type", artifact_type);

        let res = self.http.get(url).timeout(VIEW_TIMEOUT).send().await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(RenderEngineError::Http { status, body }.into());
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = res.bytes_stream();
        let mut total: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            total += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(total)
    }
}

fn value_to_id_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

async fn check_status(res: reqwest::Response) -> anyhow::Result<String> {
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(RenderEngineError::Http { status, body }.into());
    }
    Ok(body)
}

/// Searches a node's output record for the first non-empty artifact kind, in
/// `ARTIFACT_KIND_PRIORITY` order.
fn first_artifact_in_node(node_id: &str, record: &Value) -> Option<SelectedOutput> {
    let obj = record.as_object()?;
    for kind in ARTIFACT_KIND_PRIORITY {
        if let Some(list) = obj.get(*kind).and_then(Value::as_array) {
            if let Some(first) = list.first() {
                if let Ok(artifact) = serde_json::from_value::<ArtifactRecord>(first.clone()) {
                    return Some(SelectedOutput {
                        node_id: node_id.to_string(),
                        filename: artifact.filename,
                        subfolder: artifact.subfolder,
                        artifact_type: artifact.artifact_type,
                    });
                }
            }
        }
    }
    None
}

/// Picks the output artifact to download: prefers `output_node_id` when it is
/// set and present in `outputs`, otherwise scans all nodes in iteration
/// order and returns the first match.
pub(crate) fn select_output(outputs: &EngineOutputs, output_node_id: Option<&str>) -> Option<SelectedOutput> {
    if let Some(node_id) = output_node_id {
        if let Some(record) = outputs.get(node_id) {
            if let Some(found) = first_artifact_in_node(node_id, record) {
                return Some(found);
            }
        }
    }
    for (node_id, record) in outputs {
        if let Some(found) = first_artifact_in_node(node_id, record) {
            return Some(found);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs_from(json: Value) -> EngineOutputs {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn prefers_output_node_id_when_present() {
        let outputs = outputs_from(json!({
            "1": { "images": [{ "filename": "a.png", "subfolder": "", "type": "output" }] },
            "2": { "videos": [{ "filename": "b.mp4", "subfolder": "", "type": "output" }] },
        }));
        let selected = select_output(&outputs, Some("2")).unwrap();
        assert_eq!(selected.filename, "b.mp4");
    }

    #[test]
    fn falls_back_to_scan_when_node_id_absent_or_empty() {
        let outputs = outputs_from(json!({
            "1": { "files": [{ "filename": "a.bin", "subfolder": "", "type": "output" }] },
        }));
        let selected = select_output(&outputs, Some("missing")).unwrap();
        assert_eq!(selected.filename, "a.bin");
    }

    #[test]
    fn videos_beat_images_within_a_node() {
        let outputs = outputs_from(json!({
            "1": {
                "images": [{ "filename": "a.png", "subfolder": "", "type": "output" }],
                "videos": [{ "filename": "a.mp4", "subfolder": "", "type": "output" }],
            },
        }));
        let selected = select_output(&outputs, None).unwrap();
        assert_eq!(selected.filename, "a.mp4");
    }

    #[test]
    fn none_when_no_artifacts_anywhere() {
        let outputs = outputs_from(json!({ "1": { "ui": { "text": ["hi"] } } }));
        assert!(select_output(&outputs, None).is_none());
    }
}
