//! Scale-in protection: tells the auto-scaling group not to terminate this
//! instance while it holds a job, using the region-default credential chain.
//!
//! Best-effort throughout: a failure here never fails a job. It is only
//! exercised when `ASG_NAME` is configured, the same condition that enables
//! the termination monitor. Under `MAX_CONCURRENCY > 1` several job slots
//! share one instance, so protection is reference-counted: the API call only
//! fires on the 0-to-1 and 1-to-0 transitions, letting the last job finishing
//! be the one that actually clears protection.

use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::warn;

/// Thin wrapper around the AWS Auto Scaling client, scoped to one instance
/// and one auto-scaling group for the life of the process.
pub(crate) struct ScaleInProtection {
    client: aws_sdk_autoscaling::Client,
    instance_id: String,
    asg_name: String,
    active_jobs: AtomicUsize,
}

impl ScaleInProtection {
    pub(crate) async fn new(instance_id: String, asg_name: String) -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let client = aws_sdk_autoscaling::Client::new(&config);
        Self {
            client,
            instance_id,
            asg_name,
            active_jobs: AtomicUsize::new(0),
        }
    }

    async fn set_protection(&self, protected: bool) {
        let result = self
            .client
            .set_instance_protection()
            .instance_ids(self.instance_id.clone())
            .auto_scaling_group_name(self.asg_name.clone())
            .protected_from_scale_in(protected)
            .send()
            .await;
        if let Err(err) = result {
            warn!(
                instance_id = %self.instance_id,
                asg_name = %self.asg_name,
                protected,
                error = %err,
                "SetInstanceProtection call failed"
            );
        }
    }

    /// Marks this instance protected from scale-in, if it isn't already.
    /// Call before starting a job.
    pub(crate) async fn protect(&self) {
        if self.active_jobs.fetch_add(1, Ordering::SeqCst) == 0 {
            self.set_protection(true).await;
        }
    }

    /// Releases this job's hold on scale-in protection; only clears
    /// protection once no other job slot still holds it. Call after a job's
    /// terminal report, and once more at process shutdown to guarantee
    /// protection is cleared even if the count is already zero.
    pub(crate) async fn unprotect(&self) {
        let previous = self.active_jobs.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            Some(n.saturating_sub(1))
        });
        if previous == Ok(1) || previous == Ok(0) {
            self.set_protection(false).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_jobs_counter_never_underflows() {
        let counter = AtomicUsize::new(0);
        let previous = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            Some(n.saturating_sub(1))
        });
        assert_eq!(previous, Ok(0));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
