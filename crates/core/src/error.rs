//! Fatal, startup-time configuration errors.

use thiserror::Error;

/// Errors that prevent the worker from starting at all. Distinct from the
/// per-job and best-effort error paths in the engine crate, which never abort
/// the process.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An env var holding a URL failed to parse.
    #[error("{var} is not a valid URL: {reason}")]
    InvalidUrl { var: &'static str, reason: String },

    /// An env var holding an integer failed to parse.
    #[error("{var} is not a valid integer: {value:?}")]
    InvalidInteger { var: &'static str, value: String },

    /// `FLEET_SECRET` was set without the `FLEET_SLUG` it requires.
    #[error("FLEET_SECRET is set but FLEET_SLUG is missing; fleet registration requires a slug")]
    MissingFleetSlug,
}
