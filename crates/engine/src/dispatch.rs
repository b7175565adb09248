//! HTTP client for the dispatch service: register, poll, heartbeat, and the
//! three terminal reports (complete, fail, requeue).

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub(crate) enum DispatchError {
    #[error("dispatch service returned http {status}: {body}")]
    Http {
        status: reqwest::StatusCode,
        body: String,
    },
}

const POLL_TIMEOUT: Duration = Duration::from_secs(30);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);
const COMPLETE_TIMEOUT: Duration = Duration::from_secs(30);
const FAIL_TIMEOUT: Duration = Duration::from_secs(30);
const REGISTER_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEUE_TIMEOUT: Duration = Duration::from_secs(10);
const DEREGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Thin wrapper around a `reqwest::Client` plus the dispatch base URL and the
/// bearer token once one has been issued.
#[derive(Debug, Clone)]
pub(crate) struct DispatchClient {
    http: reqwest::Client,
    base_url: Url,
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    worker_id: &'a str,
    display_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    capabilities: Option<&'a Value>,
    max_concurrency: usize,
    fleet_slug: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    capacity_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instance_type: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct RegisterResponseEnvelope {
    data: RegisterResponseData,
}

#[derive(Debug, Deserialize)]
struct RegisterResponseData {
    worker_id: String,
    token: String,
}

#[derive(Debug, Serialize)]
struct PollRequest<'a> {
    worker_id: &'a str,
    current_load: usize,
    max_concurrency: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    capabilities: Option<&'a Value>,
}

#[derive(Debug, Deserialize, Default)]
struct PollResponseEnvelope {
    #[serde(default)]
    data: PollResponseData,
}

#[derive(Debug, Deserialize, Default)]
struct PollResponseData {
    #[serde(default)]
    job: Option<forgeworker_core::Job>,
}

#[derive(Debug, Serialize)]
struct HeartbeatRequest<'a> {
    dispatch_id: i64,
    lease_token: &'a str,
    worker_id: &'a str,
}

#[derive(Debug, Serialize)]
struct CompleteOutput<'a> {
    size: u64,
    mime_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<Value>,
}

#[derive(Debug, Serialize)]
struct CompleteRequest<'a> {
    dispatch_id: i64,
    lease_token: &'a str,
    worker_id: &'a str,
    provider_job_id: &'a str,
    output: CompleteOutput<'a>,
}

#[derive(Debug, Serialize)]
struct FailRequest<'a> {
    dispatch_id: i64,
    lease_token: &'a str,
    worker_id: &'a str,
    error_message: &'a str,
}

#[derive(Debug, Serialize)]
struct RequeueRequest<'a> {
    dispatch_id: i64,
    lease_token: &'a str,
    reason: &'a str,
}

#[derive(Debug, Serialize)]
struct DeregisterRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
}

impl DispatchClient {
    pub(crate) fn new(http: reqwest::Client, base_url: Url) -> Self {
        Self {
            http,
            base_url,
            token: None,
        }
    }

    pub(crate) fn set_token(&mut self, token: String) {
        self.token = Some(token);
    }

    pub(crate) fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    fn url(&self, path: &str) -> anyhow::Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    fn auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(tok) => builder.bearer_auth(tok),
            None => builder,
        }
    }

    pub(crate) async fn register(
        &self,
        worker_id: &str,
        display_name: &str,
        capabilities: Option<&Value>,
        max_concurrency: usize,
        fleet_slug: &str,
        stage: Option<&str>,
        capacity_type: Option<&str>,
        instance_type: Option<&str>,
        fleet_secret: &str,
    ) -> anyhow::Result<(String, String)> {
        let url = self.url("/api/worker/register")?;
        let res = self
            .http
            .post(url)
            .timeout(REGISTER_TIMEOUT)
            .header("X-Fleet-Secret", fleet_secret)
            .json(&RegisterRequest {
                worker_id,
                display_name,
                capabilities,
                max_concurrency,
                fleet_slug,
                stage,
                capacity_type,
                instance_type,
            })
            .send()
            .await?;
        let body = check_status(res).await?;
        let envelope: RegisterResponseEnvelope = serde_json::from_str(&body)?;
        Ok((envelope.data.worker_id, envelope.data.token))
    }

    pub(crate) async fn deregister(&self, reason: Option<&str>) -> anyhow::Result<()> {
        let url = self.url("/api/worker/deregister")?;
        let res = self
            .auth(self.http.post(url))
            .timeout(DEREGISTER_TIMEOUT)
            .json(&DeregisterRequest { reason })
            .send()
            .await?;
        check_status(res).await?;
        Ok(())
    }

    pub(crate) async fn poll(
        &self,
        worker_id: &str,
        current_load: usize,
        max_concurrency: usize,
        capabilities: Option<&Value>,
    ) -> anyhow::Result<Option<forgeworker_core::Job>> {
        let url = self.url("/api/worker/poll")?;
        let res = self
            .auth(self.http.post(url))
            .timeout(POLL_TIMEOUT)
            .json(&PollRequest {
                worker_id,
                current_load,
                max_concurrency,
                capabilities,
            })
            .send()
            .await?;
        let body = check_status(res).await?;
        let envelope: PollResponseEnvelope = serde_json::from_str(&body).unwrap_or_default();
        Ok(envelope.data.job)
    }

    pub(crate) async fn heartbeat(
        &self,
        dispatch_id: i64,
        lease_token: &str,
        worker_id: &str,
    ) -> anyhow::Result<()> {
        let url = self.url("/api/worker/heartbeat")?;
        let res = self
            .auth(self.http.post(url))
            .timeout(HEARTBEAT_TIMEOUT)
            .json(&HeartbeatRequest {
                dispatch_id,
                lease_token,
                worker_id,
            })
            .send()
            .await?;
        check_status(res).await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn complete(
        &self,
        dispatch_id: i64,
        lease_token: &str,
        worker_id: &str,
        provider_job_id: &str,
        size: u64,
        mime_type: &str,
        metadata: Option<Value>,
    ) -> anyhow::Result<()> {
        let url = self.url("/api/worker/complete")?;
        let res = self
            .auth(self.http.post(url))
            .timeout(COMPLETE_TIMEOUT)
            .json(&CompleteRequest {
                dispatch_id,
                lease_token,
                worker_id,
                provider_job_id,
                output: CompleteOutput {
                    size,
                    mime_type,
                    metadata,
                },
            })
            .send()
            .await?;
        check_status(res).await?;
        Ok(())
    }

    pub(crate) async fn fail(
        &self,
        dispatch_id: i64,
        lease_token: &str,
        worker_id: &str,
        error_message: &str,
    ) -> anyhow::Result<()> {
        let url = self.url("/api/worker/fail")?;
        let res = self
            .auth(self.http.post(url))
            .timeout(FAIL_TIMEOUT)
            .json(&FailRequest {
                dispatch_id,
                lease_token,
                worker_id,
                error_message,
            })
            .send()
            .await?;
        check_status(res).await?;
        Ok(())
    }

    pub(crate) async fn requeue(
        &self,
        dispatch_id: i64,
        lease_token: &str,
        reason: &str,
    ) -> anyhow::Result<()> {
        let url = self.url("/api/worker/requeue")?;
        let res = self
            .auth(self.http.post(url))
            .timeout(REQUEUE_TIMEOUT)
            .json(&RequeueRequest {
                dispatch_id,
                lease_token,
                reason,
            })
            .send()
            .await?;
        check_status(res).await?;
        Ok(())
    }
}

async fn check_status(res: reqwest::Response) -> anyhow::Result<String> {
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(DispatchError::Http { status, body }.into());
    }
    Ok(body)
}

/// Collapses a header value that may be a JSON string or a list of strings
/// down to a single value, taking the first element of a list.
pub(crate) fn normalize_header_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items.first().and_then(|v| v.as_str()).map(str::to_string),
        _ => None,
    }
}

/// Collapses a header mapping for use on an outgoing HTTP request.
pub(crate) fn normalize_headers(headers: &BTreeMap<String, Value>) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(k, v)| normalize_header_value(v).map(|v| (k.clone(), v)))
        .collect()
}
