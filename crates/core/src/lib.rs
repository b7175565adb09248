#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Shared data model and primitives for the forgeworker job-execution worker.

pub mod error;
pub mod json_walk;
pub mod model;
pub mod shutdown;

pub use error::ConfigError;
pub use model::{
    AssetDescriptor, EngineHistoryEntry, EngineOutputs, EngineStatus, Job, InputPayload,
    UsageEvent,
};
pub use shutdown::{ShutdownLatch, ShutdownReason};
