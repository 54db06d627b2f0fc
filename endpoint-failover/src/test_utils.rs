use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, Once,
    },
    time::Duration,
};

use async_trait::async_trait;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use crate::{
    probe::{Probe, ProbeError, ProbeErrorKind},
    Endpoint,
};

static TRACING_INIT: Once = Once::new();

pub(crate) fn setup_tracing() {
    TRACING_INIT.call_once(|| {
        FmtSubscriber::builder().with_max_level(Level::TRACE).init();
    });
}

/// How the mock answers probes for one address.
#[derive(Clone, Debug)]
pub(crate) enum ProbeScript {
    /// Sleeps for the given duration, then succeeds.
    Respond(Duration),
    /// Fails immediately with the given kind.
    Fail(ProbeErrorKind),
    /// Never answers.
    Hang,
}

/// A scripted [`Probe`]. Unknown addresses fail with [`ProbeErrorKind::Other`].
#[derive(Debug, Clone, Default)]
pub(crate) struct MockProbe {
    scripts: Arc<Mutex<HashMap<String, ProbeScript>>>,
    calls: Arc<Mutex<HashMap<String, usize>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockProbe {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set(&self, address: &str, script: ProbeScript) {
        self.scripts
            .lock()
            .unwrap()
            .insert(address.to_string(), script);
    }

    pub(crate) fn respond(&self, address: &str, millis: u64) {
        self.set(address, ProbeScript::Respond(Duration::from_millis(millis)));
    }

    pub(crate) fn fail(&self, address: &str) {
        self.set(address, ProbeScript::Fail(ProbeErrorKind::Other));
    }

    pub(crate) fn calls(&self, address: &str) -> usize {
        self.calls.lock().unwrap().get(address).copied().unwrap_or(0)
    }

    pub(crate) fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Probe for MockProbe {
    async fn probe(&self, endpoint: &Endpoint, _timeout: Duration) -> Result<(), ProbeError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(endpoint.address().to_string())
            .or_insert(0) += 1;
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(endpoint.address())
            .cloned()
            .unwrap_or(ProbeScript::Fail(ProbeErrorKind::Other));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let result = match script {
            ProbeScript::Respond(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            ProbeScript::Fail(kind) => Err(ProbeError::new(kind, "scripted failure")),
            ProbeScript::Hang => std::future::pending().await,
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
