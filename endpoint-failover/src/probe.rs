//! Health check of a single endpoint.

use std::{
    fmt::Debug,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, trace};

use crate::{endpoint::Health, Endpoint, FailoverError};

const PROBER: &str = "Prober";

/// Coarse classification of a failed probe, mirroring the HTTP status codes that matter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProbeErrorKind {
    /// The endpoint rejected the credentials (401).
    Unauthorized,
    /// The endpoint doesn't know the probe method (404). Older deployments answer like this.
    NotFound,
    /// Network error, timeout, malformed response or any other status.
    Other,
}

/// An error returned by a [`Probe`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct ProbeError {
    kind: ProbeErrorKind,
    message: String,
}

impl ProbeError {
    /// Creates a new `ProbeError` instance.
    pub fn new(kind: ProbeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Creates an error for a rejected authentication.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ProbeErrorKind::Unauthorized, message)
    }

    /// Creates an error for an unknown probe method.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ProbeErrorKind::NotFound, message)
    }

    /// Creates an error for any other failure.
    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ProbeErrorKind::Other, message)
    }

    /// Returns the classification of the error.
    pub fn kind(&self) -> ProbeErrorKind {
        self.kind
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Sends one minimal, side-effect-free request to an endpoint.
///
/// Implementations should honour `timeout`; the prober additionally bounds the wait, so a
/// hanging implementation is reported as a timeout.
#[async_trait]
pub trait Probe: Debug + Send + Sync {
    /// Probes the endpoint, returning `Ok(())` when it answered successfully.
    async fn probe(&self, endpoint: &Endpoint, timeout: Duration) -> Result<(), ProbeError>;
}

/// Runs the probe under a bounded wait and measures its round trip.
pub async fn measure(
    probe: &dyn Probe,
    endpoint: &Endpoint,
    timeout: Duration,
) -> Result<Duration, FailoverError> {
    let start = Instant::now();
    let result = tokio::time::timeout(timeout, probe.probe(endpoint, timeout)).await;
    let elapsed = start.elapsed();
    match result {
        Ok(Ok(())) => Ok(elapsed),
        Ok(Err(err)) => Err(FailoverError::ProbeFailure(err)),
        Err(_) => Err(FailoverError::ProbeFailure(ProbeError::other(format!(
            "no response within {timeout:?}"
        )))),
    }
}

/// Maps the outcome of [`measure`] to the health it implies.
pub fn classify(outcome: &Result<Duration, FailoverError>) -> Health {
    match outcome {
        Ok(latency) => Health::responsive(*latency),
        Err(FailoverError::ProbeFailure(err)) => match err.kind() {
            ProbeErrorKind::Unauthorized => Health {
                online: Some(true),
                authenticated: Some(false),
                last_response_time: None,
            },
            // Answered, but the probe semantics differ, so the latency isn't comparable.
            ProbeErrorKind::NotFound => Health {
                online: Some(true),
                authenticated: Some(true),
                last_response_time: None,
            },
            ProbeErrorKind::Other => Health::offline(),
        },
        Err(_) => Health::offline(),
    }
}

/// Checks the endpoint and stores the resulting health on it.
///
/// Failures never escape: they become offline state. Returns `true` if `online` or
/// `authenticated` changed.
pub async fn check_endpoint(probe: &dyn Probe, endpoint: &Endpoint, timeout: Duration) -> bool {
    let outcome = measure(probe, endpoint, timeout).await;
    match &outcome {
        Ok(latency) => trace!(
            "{PROBER}: {} answered in {latency:?}",
            endpoint.address()
        ),
        Err(err) => debug!("{PROBER}: {} failed: {err}", endpoint.address()),
    }
    endpoint.apply_health(classify(&outcome))
}
