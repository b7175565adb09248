//! One-time fleet registration and deregistration.

use serde_json::Value;
use tracing::{info, warn};

use crate::dispatch::DispatchClient;
use crate::imds::ImdsClient;

/// Capacity-type/instance-type metadata resolved once at startup, best
/// effort. `None` fields simply mean IMDS was unreachable (e.g. not running
/// on the target cloud) or the field wasn't present.
#[derive(Debug, Clone, Default)]
pub(crate) struct CapacityMetadata {
    pub(crate) capacity_type: Option<String>,
    pub(crate) instance_type: Option<String>,
}

/// Resolves `capacity_type` (`spot` | `on-demand`) and `instance_type` via
/// IMDS. Never fails; missing data just means `None`.
pub(crate) async fn resolve_capacity_metadata(imds: &ImdsClient) -> CapacityMetadata {
    let life_cycle = imds.get("meta-data/instance-life-cycle").await;
    let capacity_type = life_cycle.map(|v| match v.trim() {
        "spot" => "spot".to_string(),
        other => other.to_string(),
    });
    let instance_type = imds
        .get("meta-data/instance-type")
        .await
        .map(|v| v.trim().to_string());
    CapacityMetadata {
        capacity_type,
        instance_type,
    }
}

/// Parses `CAPABILITIES` as JSON; on parse failure, wraps the raw string
/// under a single-key envelope rather than failing startup.
pub(crate) fn parse_capabilities(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(v) => v,
        Err(_) => serde_json::json!({ "raw": raw }),
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn register_with_fleet(
    dispatch: &mut DispatchClient,
    worker_id: &str,
    capabilities: Option<&Value>,
    max_concurrency: usize,
    fleet_slug: &str,
    stage: Option<&str>,
    capacity: &CapacityMetadata,
    fleet_secret: &str,
) -> anyhow::Result<String> {
    let (returned_worker_id, token) = dispatch
        .register(
            worker_id,
            worker_id,
            capabilities,
            max_concurrency,
            fleet_slug,
            stage,
            capacity.capacity_type.as_deref(),
            capacity.instance_type.as_deref(),
            fleet_secret,
        )
        .await?;
    dispatch.set_token(token);
    info!(worker_id = %returned_worker_id, "registered with fleet");
    Ok(returned_worker_id)
}

/// Best-effort deregistration; logs and swallows any failure.
pub(crate) async fn deregister_best_effort(dispatch: &DispatchClient, reason: Option<&str>) {
    if let Err(err) = dispatch.deregister(reason).await {
        warn!(error = %err, "deregister failed, continuing shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_capabilities_accepts_valid_json() {
        let v = parse_capabilities(r#"{"providers":["openai"]}"#);
        assert_eq!(v["providers"][0], "openai");
    }

    #[test]
    fn parse_capabilities_wraps_invalid_json() {
        let v = parse_capabilities("not json");
        assert_eq!(v["raw"], "not json");
    }
}
