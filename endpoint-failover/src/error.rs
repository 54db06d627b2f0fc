//! Errors that can occur when managing endpoints.

use thiserror::Error;

use crate::probe::ProbeError;

/// An error that occurred when configuring or operating the connection manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FailoverError {
    /// The manager or an endpoint was configured in a way that can't work.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Two values describing the same entity could not be merged.
    #[error(
        "Cannot reconcile values {left} and {right} with config: \
         [{resolve_defined:?}, {resolve_true_over_false:?}, {resolve_max:?}]"
    )]
    ReconciliationConflict {
        /// Debug rendering of the first value.
        left: String,
        /// Debug rendering of the second value.
        right: String,
        /// See [`ReconcileOptions::resolve_defined`](crate::ReconcileOptions::resolve_defined).
        resolve_defined: Option<bool>,
        /// See `resolve_true_over_false` in [`ReconcileOptions`](crate::ReconcileOptions).
        resolve_true_over_false: Option<bool>,
        /// See [`ReconcileOptions::resolve_max`](crate::ReconcileOptions::resolve_max).
        resolve_max: Option<bool>,
    },

    /// A single health check failed. Always recovered locally by marking the endpoint offline.
    #[error("Probe failed: {0}")]
    ProbeFailure(#[from] ProbeError),

    /// The requested operation is intentionally not available in this build.
    #[error("Not supported: {0}")]
    NotSupported(String),
}
