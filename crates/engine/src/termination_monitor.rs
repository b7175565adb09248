//! Periodic probing of cloud capacity-reclaim signals.
//!
//! Runs only when an auto-scaling-group name is configured; sets the shared
//! shutdown latch on the first positive signal from any of the three probes.

use std::sync::Arc;
use std::time::Duration;

use forgeworker_core::shutdown::{ShutdownLatch, ShutdownReason};
use tracing::{info, warn};

use crate::imds::ImdsClient;

const PROBE_INTERVAL: Duration = Duration::from_secs(5);

const SPOT_INSTANCE_ACTION_PATH: &str = "meta-data/spot/instance-action";
const SPOT_REBALANCE_PATH: &str = "meta-data/events/recommendations/rebalance";
const ASG_LIFECYCLE_PATH: &str = "meta-data/autoscaling/target-lifecycle-state";

/// Runs the termination-monitor loop until the shutdown latch is set by
/// anyone (including this task). Intended to be spawned as its own task.
pub(crate) async fn run(imds: Arc<ImdsClient>, latch: Arc<ShutdownLatch>, asg_name: String) {
    info!(asg_name, "termination monitor started");
    let mut interval = tokio::time::interval(PROBE_INTERVAL);
    loop {
        interval.tick().await;
        if latch.is_set() {
            return;
        }

        if let Some(reason) = probe_once(&imds).await {
            if latch.set(reason) {
                warn!(reason = reason.as_wire_str(), "shutdown latch set by termination monitor");
            }
            return;
        }
    }
}

async fn probe_once(imds: &ImdsClient) -> Option<ShutdownReason> {
    if imds.get(SPOT_INSTANCE_ACTION_PATH).await.is_some() {
        return Some(ShutdownReason::SpotInterruption);
    }
    if imds.get(SPOT_REBALANCE_PATH).await.is_some() {
        return Some(ShutdownReason::SpotRebalance);
    }
    if let Some(body) = imds.get(ASG_LIFECYCLE_PATH).await {
        let trimmed = body.trim();
        if !trimmed.is_empty() && trimmed != "InService" {
            return Some(ShutdownReason::AsgTermination);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_paths_are_the_documented_imds_paths() {
        assert_eq!(SPOT_INSTANCE_ACTION_PATH, "meta-data/spot/instance-action");
        assert_eq!(
            SPOT_REBALANCE_PATH,
            "meta-data/events/recommendations/rebalance"
        );
        assert_eq!(
            ASG_LIFECYCLE_PATH,
            "meta-data/autoscaling/target-lifecycle-state"
        );
    }
}
