//! The `endpoint-failover` crate keeps a client pointed at a healthy remote endpoint.
//!
//! ## Overview
//! A [`ConnectionManager`] owns a set of [`Endpoint`]s, each with a priority tier, optional
//! proxy, credentials and timeout. It probes them, periodically or on demand, through a
//! [`Probe`] and keeps exactly one of them "current":
//!
//! - Endpoints with a higher priority always win over lower ones while they are online.
//!   Priority `0` means "no explicit priority" and ranks below every positive priority.
//! - Within a tier, the fastest online endpoint is preferred, but the current endpoint is only
//!   replaced by one that answered faster in each of the last few rounds.
//! - Listeners are called whenever the current endpoint changes, or its status does.
//!
//! The default [`HttpProbe`] calls a cheap JSON-RPC method over HTTP. Any other health check
//! can be plugged in by implementing [`Probe`].
//!
//! ## Example
//!
//! ```rust,no_run
//!use std::{sync::Arc, time::Duration};
//!
//!use endpoint_failover::{ConnectionManager, Endpoint, HttpProbe};
//!
//!#[tokio::main]
//!async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!    let manager = ConnectionManager::builder(HttpProbe::new())
//!        .with_endpoint(Endpoint::new("node1.example.com:18081").with_priority(1))
//!        .with_endpoint(Endpoint::new("node2.example.com:18081").with_priority(1))
//!        .with_endpoint(Endpoint::new("localhost:18081"))
//!        .with_poll_period(Duration::from_secs(10))
//!        .build()?;
//!
//!    manager.add_listener(Arc::new(|endpoint: Option<&Arc<Endpoint>>| match endpoint {
//!        Some(endpoint) => println!("now using {}", endpoint.address()),
//!        None => println!("disconnected"),
//!    }));
//!
//!    manager.check_all().await;
//!    manager.start_polling()?;
//!    tokio::time::sleep(Duration::from_secs(60)).await;
//!    manager.stop_polling();
//!    Ok(())
//!}
//! ```

#![warn(
    missing_docs,
    rustdoc::broken_intra_doc_links,
    rustdoc::private_intra_doc_links
)]
#![warn(clippy::future_not_send)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

/// Manager configuration and its builder.
pub mod config;
/// Endpoints and their health.
pub mod endpoint;
pub mod error;
/// Per-endpoint windows of recent response times.
pub mod history;
#[cfg(feature = "reqwest")]
pub mod http_probe;
pub mod manager;
pub mod poller;
pub mod probe;
pub mod reconcile;
pub mod selector;
mod util;

#[cfg(test)]
mod test_utils;

#[doc(inline)]
pub use config::{ConnectionManagerBuilder, ManagerConfig, PollType};
#[doc(inline)]
pub use endpoint::{Credentials, Endpoint, EndpointSnapshot, Health};
#[doc(inline)]
pub use error::FailoverError;
#[doc(inline)]
pub use history::LatencyHistory;
#[cfg(feature = "reqwest")]
#[doc(inline)]
pub use http_probe::HttpProbe;
#[doc(inline)]
pub use manager::{ConnectionManager, Listener};
#[doc(inline)]
pub use poller::{Poller, TimingMode};
#[doc(inline)]
pub use probe::{Probe, ProbeError, ProbeErrorKind};
#[doc(inline)]
pub use reconcile::{reconcile, ReconcileOptions, Reconcilable};
#[doc(inline)]
pub use selector::Selection;
