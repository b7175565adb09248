//! Public configuration and event types for the worker runtime.

use std::num::NonZeroUsize;
use std::time::Duration;

use forgeworker_core::ConfigError;
use reqwest::Url;
use serde_json::Value;

/// Runtime configuration loaded once at startup from the environment table
/// documented for this worker. Every field has a sensible default except
/// `fleet_slug`, which is only required when `fleet_secret` is set.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Base URL of the dispatch service.
    pub api_base_url: Url,
    /// This worker's id; either `WORKER_ID` or a generated `worker-<uuid>`,
    /// replaced by the id the dispatch service returns on fleet registration.
    pub worker_id: String,
    /// Bearer token for the dispatch service, if issued out of band rather
    /// than obtained via fleet registration.
    pub worker_token: Option<String>,
    /// Shared secret presented to `POST /api/worker/register`.
    pub fleet_secret: Option<String>,
    /// Fleet slug; required when `fleet_secret` is set.
    pub fleet_slug: Option<String>,
    /// Optional deployment stage reported at registration.
    pub fleet_stage: Option<String>,
    /// Base URL of the render engine.
    pub comfyui_base_url: Url,
    /// How often to poll the dispatch service for work when idle.
    pub poll_interval: Duration,
    /// How often to heartbeat a job while it is in flight.
    pub heartbeat_interval: Duration,
    /// Maximum number of jobs this worker will run concurrently.
    pub max_concurrency: NonZeroUsize,
    /// Free-form capabilities/provider hints reported at registration and on
    /// every poll.
    pub capabilities: Option<Value>,
    /// Auto-scaling group name; enables the termination monitor and scale-in
    /// protection when set.
    pub asg_name: Option<String>,
}

pub(crate) const DEFAULT_API_BASE_URL: &str = "http://localhost";
pub(crate) const DEFAULT_COMFYUI_BASE_URL: &str = "http://localhost:8188";
pub(crate) const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 3;
pub(crate) const DEFAULT_HEARTBEAT_INTERVAL_SECONDS: u64 = 30;
pub(crate) const DEFAULT_MAX_CONCURRENCY: usize = 1;
pub(crate) const ENGINE_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub(crate) const ENGINE_HARD_TIMEOUT: Duration = Duration::from_secs(3600);

impl RuntimeConfig {
    /// Loads configuration from process environment variables, per the
    /// documented env var table. Fails fast only on malformed values or on
    /// `FLEET_SECRET` being set without `FLEET_SLUG`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_base_url = parse_url_env("API_BASE_URL", DEFAULT_API_BASE_URL)?;
        let comfyui_base_url = parse_url_env("COMFYUI_BASE_URL", DEFAULT_COMFYUI_BASE_URL)?;

        let worker_id = std::env::var("WORKER_ID")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4()));

        let worker_token = non_empty_env("WORKER_TOKEN");
        let fleet_secret = non_empty_env("FLEET_SECRET");
        let fleet_slug = non_empty_env("FLEET_SLUG");
        let fleet_stage = non_empty_env("FLEET_STAGE");

        if fleet_secret.is_some() && fleet_slug.is_none() {
            return Err(ConfigError::MissingFleetSlug);
        }

        let poll_interval =
            parse_duration_env("POLL_INTERVAL_SECONDS", DEFAULT_POLL_INTERVAL_SECONDS)?;
        let heartbeat_interval = parse_duration_env(
            "HEARTBEAT_INTERVAL_SECONDS",
            DEFAULT_HEARTBEAT_INTERVAL_SECONDS,
        )?;

        let max_concurrency = std::env::var("MAX_CONCURRENCY")
            .ok()
            .map(|s| {
                s.parse::<usize>().map_err(|_| ConfigError::InvalidInteger {
                    var: "MAX_CONCURRENCY",
                    value: s,
                })
            })
            .transpose()?
            .and_then(NonZeroUsize::new)
            .unwrap_or_else(|| NonZeroUsize::new(DEFAULT_MAX_CONCURRENCY).unwrap());

        let capabilities =
            non_empty_env("CAPABILITIES").map(|raw| crate::lifecycle::parse_capabilities(&raw));

        let asg_name = non_empty_env("ASG_NAME");

        Ok(Self {
            api_base_url,
            worker_id,
            worker_token,
            fleet_secret,
            fleet_slug,
            fleet_stage,
            comfyui_base_url,
            poll_interval,
            heartbeat_interval,
            max_concurrency,
            capabilities,
            asg_name,
        })
    }

    /// The `providers` capability list, if the worker declared one. A job
    /// whose hinted provider isn't in this list is failed immediately rather
    /// than attempted.
    pub fn declared_providers(&self) -> Option<Vec<String>> {
        let providers = self.capabilities.as_ref()?.get("providers")?.as_array()?;
        Some(
            providers
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        )
    }
}

fn non_empty_env(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|s| !s.is_empty())
}

fn parse_url_env(var: &'static str, default: &str) -> Result<Url, ConfigError> {
    let raw = std::env::var(var).ok().filter(|s| !s.is_empty());
    let raw = raw.as_deref().unwrap_or(default);
    Url::parse(raw).map_err(|e| ConfigError::InvalidUrl {
        var,
        reason: e.to_string(),
    })
}

fn parse_duration_env(var: &'static str, default_secs: u64) -> Result<Duration, ConfigError> {
    match std::env::var(var).ok().filter(|s| !s.is_empty()) {
        None => Ok(Duration::from_secs(default_secs)),
        Some(s) => s
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::InvalidInteger { var, value: s }),
    }
}

/// Outcome of one job's pipeline run, used for logging and test assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The job ran to completion and `complete` was reported (best-effort).
    Completed,
    /// The job failed and `fail` was reported (best-effort).
    Failed,
    /// The job was preempted mid-flight and `requeue` was reported.
    Requeued,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        assert_eq!(DEFAULT_POLL_INTERVAL_SECONDS, 3);
        assert_eq!(DEFAULT_HEARTBEAT_INTERVAL_SECONDS, 30);
        assert_eq!(DEFAULT_MAX_CONCURRENCY, 1);
    }

    #[test]
    fn declared_providers_reads_capabilities_json() {
        let mut cfg = RuntimeConfig {
            api_base_url: Url::parse("http://localhost").unwrap(),
            worker_id: "w1".to_string(),
            worker_token: None,
            fleet_secret: None,
            fleet_slug: None,
            fleet_stage: None,
            comfyui_base_url: Url::parse("http://localhost:8188").unwrap(),
            poll_interval: Duration::from_secs(3),
            heartbeat_interval: Duration::from_secs(30),
            max_concurrency: NonZeroUsize::new(1).unwrap(),
            capabilities: None,
            asg_name: None,
        };
        assert_eq!(cfg.declared_providers(), None);
        cfg.capabilities = Some(serde_json::json!({ "providers": ["openai", "google"] }));
        assert_eq!(
            cfg.declared_providers(),
            Some(vec!["openai".to_string(), "google".to_string()])
        );
    }
}
