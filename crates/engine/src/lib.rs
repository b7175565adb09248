#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! The job-execution worker's runtime core: dispatch/render-engine clients,
//! the per-job pipeline, the termination monitor, and the main loop that
//! wires them together.
//!
//! Consumers outside this crate should generally only need [`api::RuntimeConfig`]
//! and [`runtime::run`]; the rest of the modules are public so each seam
//! (dispatch client, workflow substitution, telemetry extraction, ...) can be
//! exercised directly in tests without spinning up the whole process.

/// Runtime configuration and the types shared across the crate's public surface.
pub mod api;
/// Process-wide cache of already-uploaded render-engine input assets.
pub mod asset_cache;
/// HTTP client for the dispatch service.
pub mod dispatch;
/// The per-job pipeline.
pub mod executor;
/// Minimal IMDSv2 client used by the termination monitor and lifecycle manager.
pub mod imds;
/// One-time fleet registration and deregistration.
pub mod lifecycle;
/// HTTP client for the render engine, plus output-artifact selection.
pub mod render_engine;
/// The main loop wiring every component together.
pub mod runtime;
/// Auto-scaling scale-in protection.
pub mod scale_in;
/// Heuristic recovery of per-node usage/billing telemetry.
pub mod telemetry;
/// Periodic probing of cloud capacity-reclaim signals.
pub mod termination_monitor;
/// Workflow placeholder substitution.
pub mod workflow;

pub use api::{JobOutcome, RuntimeConfig};
pub use runtime::run;
