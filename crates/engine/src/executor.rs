//! The per-job pipeline: materialise assets, prepare the workflow, drive the
//! render engine to completion, extract telemetry, and report the outcome.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tempfile::Builder as TempFileBuilder;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use forgeworker_core::model::{Job, UsageEvent};
use forgeworker_core::shutdown::ShutdownLatch;

use crate::api::{JobOutcome, ENGINE_HARD_TIMEOUT, ENGINE_POLL_INTERVAL};
use crate::asset_cache::AssetCache;
use crate::dispatch::{normalize_headers, DispatchClient};
use crate::render_engine::{select_output, RenderEngineClient};
use crate::scale_in::ScaleInProtection;
use crate::telemetry::{extract_node_usage, NodeContext};
use crate::workflow::{
    qualify_reference_for_direct_write, set_node_input, substitute_asset_placeholders,
    substitute_input_reference, PrefixPolicy,
};

/// Shared, read-only-after-construction context every job slot executes
/// against.
pub(crate) struct ExecutorContext {
    pub(crate) http: reqwest::Client,
    pub(crate) dispatch: DispatchClient,
    pub(crate) render_engine: RenderEngineClient,
    pub(crate) asset_cache: Arc<AssetCache>,
    pub(crate) worker_id: String,
    pub(crate) shutdown: Arc<ShutdownLatch>,
    pub(crate) scale_in: Option<Arc<ScaleInProtection>>,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) declared_providers: Option<Vec<String>>,
}

struct TempGuard {
    path: PathBuf,
}

impl TempGuard {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Runs one job end to end, returning the outcome that was (attempted to be)
/// reported to the dispatch service.
pub(crate) async fn execute_job(ctx: &ExecutorContext, job: Job) -> JobOutcome {
    info!(dispatch_id = job.dispatch_id, "job started");

    if job.output_url.trim().is_empty() {
        report_fail(ctx, &job, "job has no output_url").await;
        return JobOutcome::Failed;
    }

    if let Some(provider) = job.provider.as_deref() {
        if let Some(allowed) = ctx.declared_providers.as_ref() {
            if !allowed.iter().any(|p| p == provider) {
                report_fail(
                    ctx,
                    &job,
                    &format!("job requires provider {provider:?} which this worker does not advertise"),
                )
                .await;
                return JobOutcome::Failed;
            }
        }
    }

    if let Some(scale_in) = &ctx.scale_in {
        scale_in.protect().await;
    }

    let (stop_heartbeat_tx, stop_heartbeat_rx) = tokio::sync::oneshot::channel();
    let heartbeat_task = tokio::spawn(heartbeat_loop(
        ctx.dispatch.clone(),
        job.dispatch_id,
        job.lease_token.clone(),
        ctx.worker_id.clone(),
        ctx.heartbeat_interval,
        stop_heartbeat_rx,
    ));

    let outcome = run_pipeline(ctx, &job).await;

    let _ = stop_heartbeat_tx.send(());
    let _ = heartbeat_task.await;

    if let Some(scale_in) = &ctx.scale_in {
        scale_in.unprotect().await;
    }

    let job_outcome = match outcome {
        Ok((provider_job_id, size, mime_type, events)) => {
            let metadata = usage_metadata(&events);
            match ctx
                .dispatch
                .complete(
                    job.dispatch_id,
                    &job.lease_token,
                    &ctx.worker_id,
                    &provider_job_id,
                    size,
                    &mime_type,
                    metadata,
                )
                .await
            {
                Ok(()) => JobOutcome::Completed,
                Err(err) => {
                    warn!(dispatch_id = job.dispatch_id, error = %err, "complete report failed");
                    JobOutcome::Completed
                }
            }
        }
        Err(PipelineError::Preempted) => {
            let reason = ctx
                .shutdown
                .reason()
                .map(|r| r.as_wire_str())
                .unwrap_or("sigterm");
            if let Err(err) = ctx
                .dispatch
                .requeue(job.dispatch_id, &job.lease_token, reason)
                .await
            {
                warn!(dispatch_id = job.dispatch_id, error = %err, "requeue report failed");
            }
            JobOutcome::Requeued
        }
        Err(PipelineError::Failed(message)) => {
            report_fail(ctx, &job, &message).await;
            JobOutcome::Failed
        }
    };

    info!(dispatch_id = job.dispatch_id, outcome = ?job_outcome, "job finished");
    job_outcome
}

async fn report_fail(ctx: &ExecutorContext, job: &Job, message: &str) {
    if let Err(err) = ctx
        .dispatch
        .fail(job.dispatch_id, &job.lease_token, &ctx.worker_id, message)
        .await
    {
        warn!(dispatch_id = job.dispatch_id, error = %err, "fail report failed");
    }
}

enum PipelineError {
    Preempted,
    Failed(String),
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Failed(format!("{err:#}"))
    }
}

type PipelineOutput = (String, u64, String, Vec<UsageEvent>);

async fn run_pipeline(ctx: &ExecutorContext, job: &Job) -> Result<PipelineOutput, PipelineError> {
    let asset_map = materialize_assets(ctx, job)
        .await
        .map_err(|e| anyhow::anyhow!("asset materialization: {e:#}"))?;

    check_preemption(ctx)?;

    let input_guard = download_input(ctx, job)
        .await
        .map_err(|e| anyhow::anyhow!("input download: {e:#}"))?;

    let workflow = prepare_workflow(job, &asset_map, input_guard.as_ref().map(|g| g.path.as_path()))
        .map_err(|e| anyhow::anyhow!("workflow preparation: {e:#}"))?;

    check_preemption(ctx)?;

    let prompt_id = ctx
        .render_engine
        .submit_prompt(
            &workflow,
            &ctx.worker_id,
            job.input_payload.extra_data.as_ref(),
        )
        .await
        .map_err(|e| anyhow::anyhow!("engine submission: {e:#}"))?;

    let history = poll_engine_until_done(ctx, &prompt_id).await?;

    let status_str = history
        .status
        .as_ref()
        .and_then(|s| s.status_str.as_deref());
    if status_str == Some("error") {
        let message = history
            .status
            .as_ref()
            .and_then(|s| s.message.clone())
            .unwrap_or_else(|| "render engine reported an error".to_string());
        return Err(PipelineError::Failed(message));
    }

    let selected = select_output(&history.outputs, job.input_payload.output_node_id.as_deref())
        .ok_or_else(|| anyhow::anyhow!("output selection: no artifact found in any node"))?;

    check_preemption(ctx)?;

    let download_suffix = Path::new(&selected.filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_else(|| ".bin".to_string());
    let output_file = TempFileBuilder::new()
        .suffix(&download_suffix)
        .tempfile()
        .map_err(|e| anyhow::anyhow!("output download: {e}"))?;
    let output_path = output_file.path().to_path_buf();
    let _output_guard = TempGuard::new(output_path.clone());
    let size = ctx
        .render_engine
        .download_view(
            &selected.filename,
            &selected.subfolder,
            &selected.artifact_type,
            &output_path,
        )
        .await
        .map_err(|e| anyhow::anyhow!("output download: {e:#}"))?;

    let events = extract_telemetry(job, &history.outputs);

    let mime_type = mime_guess::from_path(&selected.filename)
        .first()
        .map(|m| m.essence_str().to_string())
        .unwrap_or_else(|| "video/mp4".to_string());

    let output_headers = normalize_headers(&job.output_headers);
    upload_output(ctx, job, &output_path, size, &output_headers)
        .await
        .map_err(|e| anyhow::anyhow!("artifact upload: {e:#}"))?;

    Ok((prompt_id, size, mime_type, events))
}

fn check_preemption(ctx: &ExecutorContext) -> Result<(), PipelineError> {
    if ctx.shutdown.is_preemption() {
        return Err(PipelineError::Preempted);
    }
    Ok(())
}

struct DownloadedInput {
    path: PathBuf,
    // Keeps the underlying temp file alive (and unlinked on drop) for the
    // lifetime of the pipeline run; `NamedTempFile` deletes on drop, so the
    // path above would otherwise dangle the moment `download_input` returns.
    _temp: tempfile::TempPath,
}

async fn download_input(
    ctx: &ExecutorContext,
    job: &Job,
) -> anyhow::Result<Option<DownloadedInput>> {
    let Some(url) = job.input_url.as_deref() else {
        return Ok(None);
    };
    let suffix = suffix_from_url(url);
    let temp = TempFileBuilder::new().suffix(&suffix).tempfile()?;
    let path = temp.path().to_path_buf();
    stream_download(&ctx.http, url, &path).await?;
    Ok(Some(DownloadedInput {
        path,
        _temp: temp.into_temp_path(),
    }))
}

fn suffix_from_url(url: &str) -> String {
    let without_query = url.split('?').next().unwrap_or(url);
    Path::new(without_query)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_else(|| ".bin".to_string())
}

async fn stream_download(http: &reqwest::Client, url: &str, dest: &Path) -> anyhow::Result<()> {
    use futures_util::StreamExt;
    let res = http.get(url).send().await?;
    if !res.status().is_success() {
        anyhow::bail!("http {}: {}", res.status(), res.text().await.unwrap_or_default());
    }
    let mut file = tokio::fs::File::create(dest).await?;
    let mut stream = res.bytes_stream();
    while let Some(chunk) = stream.next().await {
        file.write_all(&chunk?).await?;
    }
    file.flush().await?;
    Ok(())
}

async fn materialize_assets(
    ctx: &ExecutorContext,
    job: &Job,
) -> anyhow::Result<Vec<(String, String)>> {
    let mut replacements = Vec::with_capacity(job.input_payload.assets.len());
    for asset in &job.input_payload.assets {
        let cache_key = (!asset.is_primary_input)
            .then_some(asset.content_hash.as_deref())
            .flatten();

        if let Some(hash) = cache_key {
            if let Some(filename) = ctx
                .asset_cache
                .get(ctx.render_engine.base_url().as_str(), hash)
            {
                replacements.push((asset.placeholder.clone(), filename));
                continue;
            }
        }

        let temp = TempFileBuilder::new().tempfile()?;
        let path = temp.path().to_path_buf();
        stream_download(&ctx.http, &asset.download_url, &path).await?;
        let _guard = TempGuard::new(path.clone());

        let mime = mime_guess::from_path(&asset.download_url)
            .first()
            .map(|m| m.essence_str().to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let filename = ctx.render_engine.upload_image(&path, &mime).await?;

        let resolved = if let Some(hash) = cache_key {
            ctx.asset_cache
                .insert(ctx.render_engine.base_url().as_str(), hash, filename)
        } else {
            filename
        };
        replacements.push((asset.placeholder.clone(), resolved));
    }
    Ok(replacements)
}

fn prepare_workflow(
    job: &Job,
    asset_map: &[(String, String)],
    input_path: Option<&Path>,
) -> anyhow::Result<Value> {
    let workflow = job
        .input_payload
        .workflow_value()
        .ok_or_else(|| anyhow::anyhow!("input_payload has neither `workflow` nor `comfyui_workflow`"))?;

    let mut workflow = substitute_asset_placeholders(workflow, asset_map)?;

    if let Some(path) = input_path {
        let placeholder = &job.input_payload.input_path_placeholder;
        let reference = path.to_string_lossy().to_string();
        let policy = match job.input_payload.input_reference_prefix.as_deref() {
            Some("") => PrefixPolicy::Empty,
            Some(prefix) => PrefixPolicy::Explicit(prefix),
            None => PrefixPolicy::Absent {
                reference_exists_on_disk: path.exists(),
            },
        };

        workflow = substitute_input_reference(&workflow, placeholder, &reference, &policy)?;

        if let (Some(node_id), Some(field)) = (
            job.input_payload.input_node_id.as_deref(),
            job.input_payload.input_field.as_deref(),
        ) {
            let qualified = qualify_reference_for_direct_write(&reference, &policy);
            set_node_input(&mut workflow, node_id, field, Value::String(qualified));
        }
    }

    Ok(workflow)
}

async fn poll_engine_until_done(
    ctx: &ExecutorContext,
    prompt_id: &str,
) -> Result<forgeworker_core::model::EngineHistoryEntry, PipelineError> {
    let started = Instant::now();
    loop {
        if started.elapsed() > ENGINE_HARD_TIMEOUT {
            return Err(PipelineError::Failed(format!(
                "render engine did not finish prompt {prompt_id} within {:?}",
                ENGINE_HARD_TIMEOUT
            )));
        }
        check_preemption(ctx)?;

        match ctx.render_engine.poll_history(prompt_id).await {
            Ok(Some(entry)) => {
                let errored = entry
                    .status
                    .as_ref()
                    .and_then(|s| s.status_str.as_deref())
                    == Some("error");
                if errored || !entry.outputs.is_empty() {
                    return Ok(entry);
                }
            }
            Ok(None) => {}
            Err(err) => {
                debug!(prompt_id, error = %err, "transient error polling engine history");
            }
        }

        tokio::time::sleep(ENGINE_POLL_INTERVAL).await;
    }
}

fn extract_telemetry(job: &Job, outputs: &forgeworker_core::model::EngineOutputs) -> Vec<UsageEvent> {
    let workflow = job.input_payload.workflow_value();
    let mut events = Vec::new();
    for (node_id, record) in outputs {
        let node_def = workflow.and_then(|w| w.get(node_id));
        let class_type = node_def
            .and_then(|n| n.get("class_type"))
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let display_name = node_def
            .and_then(|n| n.get("_meta"))
            .and_then(|m| m.get("title"))
            .and_then(Value::as_str);
        let node_inputs = node_def.and_then(|n| n.get("inputs"));
        let declared_provider = node_inputs
            .and_then(|inputs| {
                inputs
                    .get("provider")
                    .or_else(|| inputs.get("vendor"))
                    .or_else(|| inputs.get("service"))
            })
            .and_then(Value::as_str);

        let ctx = NodeContext {
            class_type,
            display_name,
            declared_provider,
            node_inputs,
        };
        if let Some(event) = extract_node_usage(node_id, record, &ctx) {
            events.push(event);
        }
    }
    events
}

fn usage_metadata(events: &[UsageEvent]) -> Option<Value> {
    if events.is_empty() {
        return None;
    }
    Some(serde_json::json!({ "partner_usage_events": events }))
}

async fn upload_output(
    ctx: &ExecutorContext,
    job: &Job,
    local_path: &Path,
    size: u64,
    headers: &std::collections::BTreeMap<String, String>,
) -> anyhow::Result<()> {
    let file = tokio::fs::File::open(local_path).await?;
    let body = reqwest::Body::wrap_stream(tokio_util::io::ReaderStream::new(file));
    let mut req = ctx
        .http
        .put(&job.output_url)
        .timeout(Duration::from_secs(300))
        .header(reqwest::header::CONTENT_LENGTH, size)
        .body(body);
    for (k, v) in headers {
        req = req.header(k.as_str(), v.as_str());
    }
    let res = req.send().await?;
    if !res.status().is_success() {
        anyhow::bail!(
            "http {}: {}",
            res.status(),
            res.text().await.unwrap_or_default()
        );
    }
    Ok(())
}

async fn heartbeat_loop(
    dispatch: DispatchClient,
    dispatch_id: i64,
    lease_token: String,
    worker_id: String,
    interval: Duration,
    mut stop: tokio::sync::oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut stop => return,
            _ = tokio::time::sleep(interval) => {
                if let Err(err) = dispatch.heartbeat(dispatch_id, &lease_token, &worker_id).await {
                    warn!(dispatch_id, error = %err, "heartbeat failed");
                }
            }
        }
    }
}

/// End-to-end pipeline tests against a small in-process mock of both the
/// dispatch service and the render engine, covering the happy-path,
/// asset-cache-hit, engine-reported-error, and mid-pipeline spot-preemption
/// scenarios without a real network.
#[cfg(test)]
mod e2e_tests {
    use super::*;
    use axum::extract::{Path as AxumPath, State};
    use axum::http::StatusCode;
    use axum::routing::{get, post, put};
    use axum::{Json, Router};
    use forgeworker_core::model::{AssetDescriptor, InputPayload};
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use tokio::net::TcpListener;

    #[derive(Debug, Default)]
    struct Recorder {
        completes: Vec<Value>,
        fails: Vec<Value>,
        requeues: Vec<Value>,
        submitted_prompt: Option<Value>,
        uploaded_output_bytes: Vec<u8>,
        upload_image_calls: usize,
    }

    #[derive(Clone)]
    struct MockState {
        recorder: Arc<StdMutex<Recorder>>,
        prompt_id: &'static str,
        history: Arc<StdMutex<Value>>,
        view_bytes: &'static [u8],
        input_bytes: &'static [u8],
    }

    async fn handle_prompt(State(state): State<MockState>, Json(body): Json<Value>) -> Json<Value> {
        state.recorder.lock().unwrap().submitted_prompt = Some(body);
        Json(json!({ "prompt_id": state.prompt_id }))
    }

    async fn handle_history(
        State(state): State<MockState>,
        AxumPath(id): AxumPath<String>,
    ) -> Json<Value> {
        let entry = state.history.lock().unwrap().clone();
        Json(json!({ id: entry }))
    }

    async fn handle_view(State(state): State<MockState>) -> Vec<u8> {
        state.view_bytes.to_vec()
    }

    async fn handle_input(State(state): State<MockState>) -> Vec<u8> {
        state.input_bytes.to_vec()
    }

    async fn handle_upload_image(State(state): State<MockState>) -> Json<Value> {
        state.recorder.lock().unwrap().upload_image_calls += 1;
        Json(json!({ "name": "engine-uploaded.bin" }))
    }

    async fn handle_storage_put(
        State(state): State<MockState>,
        body: axum::body::Bytes,
    ) -> StatusCode {
        state.recorder.lock().unwrap().uploaded_output_bytes = body.to_vec();
        StatusCode::OK
    }

    async fn handle_heartbeat() -> StatusCode {
        StatusCode::OK
    }

    async fn handle_complete(State(state): State<MockState>, Json(body): Json<Value>) -> StatusCode {
        state.recorder.lock().unwrap().completes.push(body);
        StatusCode::OK
    }

    async fn handle_fail(State(state): State<MockState>, Json(body): Json<Value>) -> StatusCode {
        state.recorder.lock().unwrap().fails.push(body);
        StatusCode::OK
    }

    async fn handle_requeue(State(state): State<MockState>, Json(body): Json<Value>) -> StatusCode {
        state.recorder.lock().unwrap().requeues.push(body);
        StatusCode::OK
    }

    /// Starts a single mock HTTP hub that plays the part of both the
    /// dispatch service and the render engine (and the presigned-URL blob
    /// store), and returns its base URL (trailing slash, so `Url::join`
    /// appends rather than replaces the last segment).
    async fn spawn_mock_hub(state: MockState) -> String {
        let app = Router::new()
            .route("/prompt", post(handle_prompt))
            .route("/history/:id", get(handle_history))
            .route("/view", get(handle_view))
            .route("/input", get(handle_input))
            .route("/upload/image", post(handle_upload_image))
            .route("/out", put(handle_storage_put))
            .route("/api/worker/heartbeat", post(handle_heartbeat))
            .route("/api/worker/complete", post(handle_complete))
            .route("/api/worker/fail", post(handle_fail))
            .route("/api/worker/requeue", post(handle_requeue))
            .with_state(state);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    fn make_ctx(base: &str) -> (ExecutorContext, Arc<ShutdownLatch>) {
        let http = reqwest::Client::new();
        let base_url: reqwest::Url = base.parse().unwrap();
        let dispatch = DispatchClient::new(http.clone(), base_url.clone());
        let render_engine = RenderEngineClient::new(http.clone(), base_url);
        let shutdown = Arc::new(ShutdownLatch::new());
        let ctx = ExecutorContext {
            http,
            dispatch,
            render_engine,
            asset_cache: Arc::new(AssetCache::new()),
            worker_id: "test-worker".to_string(),
            shutdown: shutdown.clone(),
            scale_in: None,
            heartbeat_interval: Duration::from_secs(30),
            declared_providers: None,
        };
        (ctx, shutdown)
    }

    fn base_job(output_url: String) -> Job {
        Job {
            dispatch_id: 42,
            lease_token: "lease-abc".to_string(),
            input_url: None,
            output_url,
            output_headers: Default::default(),
            input_payload: InputPayload {
                workflow: Some(json!({
                    "1": { "class_type": "SaveVideo", "inputs": {} }
                })),
                comfyui_workflow: None,
                input_path_placeholder: "__INPUT_PATH__".to_string(),
                input_reference_prefix: None,
                input_node_id: None,
                input_field: None,
                output_node_id: None,
                extra_data: None,
                assets: Vec::new(),
            },
            provider: None,
        }
    }

    #[tokio::test]
    async fn happy_path_direct_input_completes_and_uploads() {
        const VIEW_BYTES: &[u8] = b"fake-rendered-video-bytes";
        const INPUT_BYTES: &[u8] = b"fake-source-video-bytes";

        let recorder = Arc::new(StdMutex::new(Recorder::default()));
        let history = Arc::new(StdMutex::new(json!({
            "status": { "status_str": "success" },
            "outputs": {
                "1": { "videos": [{ "filename": "out.mp4", "subfolder": "", "type": "output" }] }
            }
        })));
        let state = MockState {
            recorder: recorder.clone(),
            prompt_id: "p1",
            history,
            view_bytes: VIEW_BYTES,
            input_bytes: INPUT_BYTES,
        };
        let base = spawn_mock_hub(state).await;

        let (ctx, _shutdown) = make_ctx(&base);

        let mut job = base_job(format!("{base}out"));
        job.input_url = Some(format!("{base}input"));
        job.input_payload.workflow = Some(json!({
            "1": { "class_type": "SaveVideo", "inputs": { "video": "__INPUT_PATH__" } }
        }));
        job.input_payload.output_node_id = Some("1".to_string());

        let outcome = execute_job(&ctx, job).await;
        assert_eq!(outcome, JobOutcome::Completed);

        let recorded = recorder.lock().unwrap();
        assert_eq!(recorded.completes.len(), 1);
        assert!(recorded.fails.is_empty());
        assert!(recorded.requeues.is_empty());

        let complete = &recorded.completes[0];
        assert_eq!(complete["provider_job_id"], json!("p1"));
        assert_eq!(complete["output"]["mime_type"], json!("video/mp4"));
        assert_eq!(complete["output"]["size"], json!(VIEW_BYTES.len()));
        assert!(complete["output"].get("metadata").is_none());

        assert_eq!(recorded.uploaded_output_bytes, VIEW_BYTES);

        // The placeholder must have been rewritten to the downloaded input's
        // local path, not left as the literal token.
        let submitted = recorded.submitted_prompt.as_ref().unwrap();
        let rewritten = submitted["prompt"]["1"]["inputs"]["video"]
            .as_str()
            .unwrap()
            .to_string();
        assert_ne!(rewritten, "__INPUT_PATH__");
        assert!(!rewritten.contains("__INPUT_PATH__"));
    }

    #[tokio::test]
    async fn engine_reported_error_fails_the_job() {
        let recorder = Arc::new(StdMutex::new(Recorder::default()));
        let history = Arc::new(StdMutex::new(json!({
            "status": { "status_str": "error", "message": "OOM" },
            "outputs": {}
        })));
        let state = MockState {
            recorder: recorder.clone(),
            prompt_id: "p1",
            history,
            view_bytes: b"unused",
            input_bytes: b"unused",
        };
        let base = spawn_mock_hub(state).await;
        let (ctx, _shutdown) = make_ctx(&base);
        let job = base_job(format!("{base}out"));

        let outcome = execute_job(&ctx, job).await;
        assert_eq!(outcome, JobOutcome::Failed);

        let recorded = recorder.lock().unwrap();
        assert!(recorded.completes.is_empty());
        assert_eq!(recorded.requeues.len(), 0);
        assert_eq!(recorded.fails.len(), 1);
        assert!(recorded.fails[0]["error_message"]
            .as_str()
            .unwrap()
            .contains("OOM"));
    }

    #[tokio::test]
    async fn asset_with_matching_content_hash_uploads_only_once() {
        let recorder = Arc::new(StdMutex::new(Recorder::default()));
        let history = Arc::new(StdMutex::new(json!({
            "status": { "status_str": "success" },
            "outputs": {
                "1": { "videos": [{ "filename": "out.mp4", "subfolder": "", "type": "output" }] }
            }
        })));
        let state = MockState {
            recorder: recorder.clone(),
            prompt_id: "p1",
            history,
            view_bytes: b"fake-video",
            input_bytes: b"unused",
        };
        let base = spawn_mock_hub(state).await;
        let (ctx, _shutdown) = make_ctx(&base);
        let asset_cache = ctx.asset_cache.clone();

        let asset = AssetDescriptor {
            placeholder: "__IMG__".to_string(),
            download_url: format!("{base}input"),
            content_hash: Some("hash-123".to_string()),
            is_primary_input: false,
        };

        let mut job_one = base_job(format!("{base}out"));
        job_one.input_payload.assets = vec![asset.clone()];
        job_one.input_payload.workflow = Some(json!({
            "1": { "class_type": "SaveVideo", "inputs": { "image": "__IMG__" } }
        }));
        assert_eq!(execute_job(&ctx, job_one).await, JobOutcome::Completed);

        let mut job_two = base_job(format!("{base}out"));
        job_two.dispatch_id = 43;
        job_two.input_payload.assets = vec![asset];
        job_two.input_payload.workflow = Some(json!({
            "1": { "class_type": "SaveVideo", "inputs": { "image": "__IMG__" } }
        }));
        assert_eq!(execute_job(&ctx, job_two).await, JobOutcome::Completed);

        assert_eq!(recorder.lock().unwrap().upload_image_calls, 1);
        assert_eq!(
            asset_cache.get(ctx.render_engine.base_url().as_str(), "hash-123"),
            Some("engine-uploaded.bin".to_string())
        );
    }

    #[tokio::test]
    async fn preemption_before_submission_requeues_instead_of_failing() {
        let recorder = Arc::new(StdMutex::new(Recorder::default()));
        let history = Arc::new(StdMutex::new(json!({
            "status": { "status_str": null },
            "outputs": {}
        })));
        let state = MockState {
            recorder: recorder.clone(),
            prompt_id: "p1",
            history,
            view_bytes: b"unused",
            input_bytes: b"unused",
        };
        let base = spawn_mock_hub(state).await;
        let (ctx, shutdown) = make_ctx(&base);
        assert!(shutdown.set(forgeworker_core::shutdown::ShutdownReason::SpotInterruption));

        let job = base_job(format!("{base}out"));
        let outcome = execute_job(&ctx, job).await;
        assert_eq!(outcome, JobOutcome::Requeued);

        let recorded = recorder.lock().unwrap();
        assert!(recorded.completes.is_empty());
        assert!(recorded.fails.is_empty());
        assert_eq!(recorded.requeues.len(), 1);
        assert_eq!(
            recorded.requeues[0]["reason"],
            json!("spot_interruption")
        );
    }
}
