//! Wires the lifecycle manager, termination monitor, dispatch client, and job
//! executor into the process's main loop: lease a job slot, run the
//! executor, report the outcome, repeat — until the shutdown latch is set
//! and every slot has drained.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};

use forgeworker_core::shutdown::{ShutdownLatch, ShutdownReason};

use crate::api::{JobOutcome, RuntimeConfig};
use crate::asset_cache::AssetCache;
use crate::dispatch::DispatchClient;
use crate::executor::{execute_job, ExecutorContext};
use crate::imds::ImdsClient;
use crate::lifecycle;
use crate::render_engine::RenderEngineClient;
use crate::scale_in::ScaleInProtection;
use crate::termination_monitor;

/// Runs the worker process end to end: registers with the fleet if
/// configured, starts the termination monitor if an auto-scaling group is
/// configured, then drives the poll/lease/execute/report loop until the
/// shutdown latch is set and every job slot is idle.
///
/// Returns `Ok(())` on a graceful shutdown; the only errors returned are
/// fleet-registration failures, which the caller should treat as a startup
/// failure (non-zero exit), per the documented exit-code contract.
pub async fn run(mut config: RuntimeConfig) -> anyhow::Result<()> {
    let http = reqwest::Client::new();
    let shutdown = Arc::new(ShutdownLatch::new());
    let imds = Arc::new(ImdsClient::new(http.clone()));

    let mut dispatch = DispatchClient::new(http.clone(), config.api_base_url.clone());
    if let Some(token) = &config.worker_token {
        dispatch.set_token(token.clone());
    }

    let mut fleet_registered = false;
    if config.worker_token.is_none() {
        if let Some(fleet_secret) = config.fleet_secret.clone() {
            // `RuntimeConfig::from_env` already rejected a missing
            // `fleet_slug` when `fleet_secret` is set.
            let fleet_slug = config.fleet_slug.clone().unwrap_or_default();
            let capacity = lifecycle::resolve_capacity_metadata(&imds).await;
            let worker_id = lifecycle::register_with_fleet(
                &mut dispatch,
                &config.worker_id,
                config.capabilities.as_ref(),
                config.max_concurrency.get(),
                &fleet_slug,
                config.fleet_stage.as_deref(),
                &capacity,
                &fleet_secret,
            )
            .await?;
            config.worker_id = worker_id;
            fleet_registered = true;
        }
    }

    spawn_signal_handler(shutdown.clone());

    let termination_monitor_handle = config.asg_name.clone().map(|asg_name| {
        tokio::spawn(termination_monitor::run(
            imds.clone(),
            shutdown.clone(),
            asg_name,
        ))
    });

    let scale_in = match &config.asg_name {
        Some(asg_name) => Some(Arc::new(
            ScaleInProtection::new(config.worker_id.clone(), asg_name.clone()).await,
        )),
        None => None,
    };

    let render_engine = RenderEngineClient::new(http.clone(), config.comfyui_base_url.clone());
    let asset_cache = Arc::new(AssetCache::new());
    let declared_providers = config.declared_providers();
    let max_concurrency = config.max_concurrency.get();

    let ctx = Arc::new(ExecutorContext {
        http: http.clone(),
        dispatch: dispatch.clone(),
        render_engine,
        asset_cache,
        worker_id: config.worker_id.clone(),
        shutdown: shutdown.clone(),
        scale_in: scale_in.clone(),
        heartbeat_interval: config.heartbeat_interval,
        declared_providers,
    });

    let mut slots: JoinSet<JobOutcome> = JoinSet::new();

    loop {
        if shutdown.is_set() && slots.is_empty() {
            break;
        }

        if !shutdown.is_set() && slots.len() < max_concurrency {
            let current_load = slots.len();
            match dispatch
                .poll(
                    &config.worker_id,
                    current_load,
                    max_concurrency,
                    config.capabilities.as_ref(),
                )
                .await
            {
                Ok(Some(job)) => {
                    let ctx = ctx.clone();
                    let dispatch_id = job.dispatch_id;
                    slots.spawn(
                        async move { execute_job(&ctx, job).await }
                            .instrument(info_span!("job", dispatch_id)),
                    );
                    continue;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, "poll failed, retrying after the poll interval");
                }
            }
        }

        if slots.is_empty() {
            tokio::time::sleep(config.poll_interval).await;
            continue;
        }

        tokio::select! {
            Some(result) = slots.join_next() => {
                if let Err(join_err) = result {
                    error!(error = %join_err, "job task panicked");
                }
            }
            _ = tokio::time::sleep(config.poll_interval) => {}
        }
    }

    if let Some(scale_in) = &scale_in {
        scale_in.unprotect().await;
    }

    if let Some(handle) = termination_monitor_handle {
        handle.abort();
    }

    if fleet_registered {
        let reason = shutdown.reason().map(ShutdownReason::as_wire_str);
        lifecycle::deregister_best_effort(&dispatch, reason).await;
    }

    info!("worker shut down gracefully");
    Ok(())
}

fn spawn_signal_handler(shutdown: Arc<ShutdownLatch>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(err) => {
                    warn!(error = %err, "failed to install SIGTERM handler");
                    return;
                }
            };
            term.recv().await;
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        if shutdown.set(ShutdownReason::Sigterm) {
            warn!("shutdown latch set by signal handler");
        }
    });
}
