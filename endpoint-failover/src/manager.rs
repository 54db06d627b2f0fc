//! The registry of endpoints and the current-endpoint pointer.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use arc_swap::ArcSwapOption;
use futures_util::{future::join_all, FutureExt};
use tracing::{debug, info, warn};

use crate::{
    config::{ConnectionManagerBuilder, ManagerConfig, PollType},
    history::LatencyHistory,
    poller::{CycleTask, Poller, TimingMode},
    probe::{check_endpoint, Probe},
    selector::{self, Selection},
    Endpoint, FailoverError,
};

const CONNECTION_MANAGER: &str = "ConnectionManager";

/// A callback invoked with the new current endpoint, or `None` when it was cleared.
pub type Listener = Arc<dyn Fn(Option<&Arc<Endpoint>>) + Send + Sync>;

fn same_listener(a: &Listener, b: &Listener) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// Everything that has to change together lives behind one lock.
#[derive(Debug)]
struct Registry {
    endpoints: Vec<Arc<Endpoint>>,
    current: Option<Arc<Endpoint>>,
    history: LatencyHistory,
    auto_switch: bool,
    timeout: Duration,
    poll_type: PollType,
}

impl Registry {
    fn new(config: &ManagerConfig) -> Self {
        Self {
            endpoints: Vec::new(),
            current: None,
            history: LatencyHistory::new(config.min_better_responses),
            auto_switch: config.auto_switch,
            timeout: config.timeout,
            poll_type: config.poll_type,
        }
    }

    fn position(&self, address: &str) -> Option<usize> {
        self.endpoints.iter().position(|e| e.address() == address)
    }

    fn find(&self, address: &str) -> Option<Arc<Endpoint>> {
        self.position(address).map(|i| Arc::clone(&self.endpoints[i]))
    }

    fn contains(&self, endpoint: &Arc<Endpoint>) -> bool {
        self.endpoints.iter().any(|e| Arc::ptr_eq(e, endpoint))
    }

    fn is_current(&self, endpoint: &Arc<Endpoint>) -> bool {
        self.current
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, endpoint))
    }

    fn snapshots(&self) -> Vec<crate::EndpointSnapshot> {
        self.endpoints.iter().map(|e| e.snapshot()).collect()
    }

    fn timeout_for(&self, endpoint: &Endpoint) -> Duration {
        endpoint.timeout().unwrap_or(self.timeout)
    }

    // Adds one round to every member's window so windows stay aligned. Members that weren't
    // probed in this round get `None`.
    fn record_round<'a>(&mut self, probed: impl IntoIterator<Item = &'a Arc<Endpoint>>) {
        let probed: Vec<_> = probed.into_iter().collect();
        for endpoint in &self.endpoints {
            let sample = if probed.iter().any(|p| Arc::ptr_eq(p, endpoint)) {
                endpoint.last_response_time()
            } else {
                None
            };
            self.history.record(endpoint.address(), sample);
        }
    }
}

struct Inner {
    probe: Arc<dyn Probe>,
    defaults: ManagerConfig,
    registry: Mutex<Registry>,
    // Lock-free copy of `Registry::current`, only written while the registry lock is held.
    current: ArcSwapOption<Endpoint>,
    listeners: Mutex<Vec<Listener>>,
    watch_sender: async_watch::Sender<Option<Arc<Endpoint>>>,
    watch_receiver: async_watch::Receiver<Option<Arc<Endpoint>>>,
    poller: Poller,
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        lock(&self.registry)
    }

    // Must be called with the registry lock held so the published value can't go stale.
    fn publish(&self, current: &Option<Arc<Endpoint>>) {
        self.current.store(current.clone());
        // The manager keeps a receiver alive, so sending can't fail.
        let _ = self.watch_sender.send(current.clone());
    }
}

/// Keeps track of a set of endpoints and which of them is current.
///
/// Cloning is cheap and yields a handle to the same manager. Background polling stops when the
/// last handle is dropped.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.inner.registry();
        f.debug_struct("ConnectionManager")
            .field("endpoints", &registry.endpoints.len())
            .field("current", &registry.current.as_ref().map(|e| e.address()))
            .field("auto_switch", &registry.auto_switch)
            .field("poller", &self.inner.poller)
            .finish()
    }
}

impl ConnectionManager {
    /// Creates a builder for a manager probing endpoints with `probe`.
    pub fn builder(probe: impl Probe + 'static) -> ConnectionManagerBuilder {
        ConnectionManagerBuilder::new(probe)
    }

    pub(crate) fn new(probe: Arc<dyn Probe>, config: ManagerConfig) -> Self {
        let (watch_sender, watch_receiver) = async_watch::channel(None);
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let weak = weak.clone();
            let task: CycleTask = Arc::new(move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        ConnectionManager { inner }.poll_cycle().await;
                    }
                    Ok::<(), FailoverError>(())
                }
                .boxed()
            });
            Inner {
                probe,
                registry: Mutex::new(Registry::new(&config)),
                current: ArcSwapOption::empty(),
                listeners: Mutex::new(Vec::new()),
                watch_sender,
                watch_receiver,
                poller: Poller::new(task, config.poll_period, config.timing_mode),
                defaults: config,
            }
        });
        Self { inner }
    }

    /// Registers an endpoint. An endpoint with the same address that is already registered is
    /// kept and `false` is returned. Never changes the current endpoint.
    pub fn add_endpoint(&self, endpoint: Arc<Endpoint>) -> Result<bool, FailoverError> {
        if !endpoint.has_address() {
            return Err(FailoverError::InvalidConfiguration(
                "an endpoint needs an address to be registered".to_string(),
            ));
        }
        let mut registry = self.inner.registry();
        if registry.position(endpoint.address()).is_some() {
            return Ok(false);
        }
        debug!("{CONNECTION_MANAGER}: adding {}", endpoint.address());
        registry.endpoints.push(endpoint);
        Ok(true)
    }

    /// Unregisters the endpoint with the given address and forgets its latency history.
    ///
    /// If it was current, current becomes `None` and listeners are notified.
    pub fn remove_endpoint(&self, address: &str) -> Option<Arc<Endpoint>> {
        let (removed, was_current) = {
            let mut registry = self.inner.registry();
            let index = registry.position(address)?;
            let removed = registry.endpoints.remove(index);
            registry.history.forget(address);
            let was_current = registry.is_current(&removed);
            if was_current {
                registry.current = None;
                self.inner.publish(&None);
            }
            (removed, was_current)
        };
        debug!("{CONNECTION_MANAGER}: removed {address}");
        if was_current {
            self.notify(None);
        }
        Some(removed)
    }

    /// Makes `endpoint` current, or clears current with `None`.
    ///
    /// The endpoint is registered if its address is unknown. If the address is registered under
    /// a different instance, that instance (and its latency history) is replaced. Listeners are
    /// notified unless `endpoint` is the very instance that is already current.
    pub fn set_current(&self, endpoint: Option<Arc<Endpoint>>) -> Result<(), FailoverError> {
        if let Some(endpoint) = &endpoint {
            if !endpoint.has_address() {
                return Err(FailoverError::InvalidConfiguration(
                    "the current endpoint must have an address".to_string(),
                ));
            }
        }
        {
            let mut registry = self.inner.registry();
            let unchanged = match (&registry.current, &endpoint) {
                (None, None) => true,
                (Some(current), Some(endpoint)) => Arc::ptr_eq(current, endpoint),
                _ => false,
            };
            if unchanged {
                return Ok(());
            }
            if let Some(endpoint) = &endpoint {
                match registry.position(endpoint.address()) {
                    Some(index) if !Arc::ptr_eq(&registry.endpoints[index], endpoint) => {
                        registry.endpoints[index] = Arc::clone(endpoint);
                        registry.history.forget(endpoint.address());
                    }
                    Some(_) => {}
                    None => registry.endpoints.push(Arc::clone(endpoint)),
                }
            }
            registry.current = endpoint.clone();
            self.inner.publish(&endpoint);
        }
        info!(
            "{CONNECTION_MANAGER}: current endpoint set to {:?}",
            endpoint.as_ref().map(|e| e.address())
        );
        self.notify(endpoint.as_ref());
        Ok(())
    }

    /// Makes the endpoint with `address` current, registering a new endpoint if needed.
    pub fn set_current_address(&self, address: &str) -> Result<Arc<Endpoint>, FailoverError> {
        let endpoint = self
            .endpoint(address)
            .unwrap_or_else(|| Arc::new(Endpoint::new(address)));
        self.set_current(Some(Arc::clone(&endpoint)))?;
        Ok(endpoint)
    }

    /// Clears the current endpoint.
    pub fn disconnect(&self) {
        // Clearing can't fail validation.
        let _ = self.set_current(None);
    }

    /// Unregisters every endpoint and clears current.
    pub fn clear(&self) {
        let had_current = {
            let mut registry = self.inner.registry();
            registry.endpoints.clear();
            registry.history.clear();
            let had_current = registry.current.take().is_some();
            if had_current {
                self.inner.publish(&None);
            }
            had_current
        };
        if had_current {
            self.notify(None);
        }
    }

    /// Stops polling, removes every endpoint and listener and restores the configuration the
    /// manager was built with.
    pub fn reset(&self) {
        self.stop_polling();
        self.clear();
        self.remove_listeners();
        let defaults = &self.inner.defaults;
        {
            let mut registry = self.inner.registry();
            registry.auto_switch = defaults.auto_switch;
            registry.timeout = defaults.timeout;
            registry.poll_type = defaults.poll_type;
            registry.history = LatencyHistory::new(defaults.min_better_responses);
        }
        self.inner.poller.set_period(defaults.poll_period);
        self.inner.poller.set_timing_mode(defaults.timing_mode);
    }

    /// Returns the current endpoint.
    pub fn current(&self) -> Option<Arc<Endpoint>> {
        self.inner.current.load_full()
    }

    /// Returns a receiver that always holds the current endpoint.
    pub fn subscribe(&self) -> async_watch::Receiver<Option<Arc<Endpoint>>> {
        self.inner.watch_receiver.clone()
    }

    /// Checks if the current endpoint answered its last probe and accepted the credentials.
    ///
    /// A current endpoint can be set and still be down; this is the only reliable check.
    pub fn is_connected(&self) -> bool {
        self.current()
            .is_some_and(|current| current.is_connected() == Some(true))
    }

    /// Returns the endpoint registered under `address`.
    pub fn endpoint(&self, address: &str) -> Option<Arc<Endpoint>> {
        self.inner.registry().find(address)
    }

    /// Checks if an endpoint is registered under `address`.
    pub fn has_endpoint(&self, address: &str) -> bool {
        self.inner.registry().position(address).is_some()
    }

    /// Returns the registered endpoints in registration order.
    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.inner.registry().endpoints.clone()
    }

    /// Returns the registered endpoints, current first, then online ones, then by priority
    /// tier and address.
    pub fn connections(&self) -> Vec<Arc<Endpoint>> {
        let registry = self.inner.registry();
        let current = registry.current.as_ref().map(|e| e.address().to_string());
        let mut ranked: Vec<_> = registry
            .endpoints
            .iter()
            .map(|e| (e.snapshot(), Arc::clone(e)))
            .collect();
        ranked.sort_by(|(a, _), (b, _)| selector::listing_order(a, b, current.as_deref()));
        ranked.into_iter().map(|(_, e)| e).collect()
    }

    /// Returns the latency samples kept for `address`, oldest first.
    pub fn latency_history(&self, address: &str) -> Vec<Option<Duration>> {
        self.inner.registry().history.samples(address)
    }

    /// Adds a listener. Returns `false` if this very listener is already registered.
    pub fn add_listener(&self, listener: Listener) -> bool {
        let mut listeners = lock(&self.inner.listeners);
        if listeners.iter().any(|l| same_listener(l, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    /// Removes a listener. Returns `false` if it wasn't registered.
    pub fn remove_listener(&self, listener: &Listener) -> bool {
        let mut listeners = lock(&self.inner.listeners);
        let before = listeners.len();
        listeners.retain(|l| !same_listener(l, listener));
        listeners.len() != before
    }

    /// Removes every listener.
    pub fn remove_listeners(&self) {
        lock(&self.inner.listeners).clear();
    }

    /// Returns the registered listeners in notification order.
    pub fn listeners(&self) -> Vec<Listener> {
        lock(&self.inner.listeners).clone()
    }

    // Called without the registry lock, so listeners may call back into the manager.
    fn notify(&self, endpoint: Option<&Arc<Endpoint>>) {
        let listeners = self.listeners();
        for listener in listeners {
            listener(endpoint);
        }
    }

    /// Checks whether check cycles may change the current endpoint.
    pub fn auto_switch(&self) -> bool {
        self.inner.registry().auto_switch
    }

    /// Enables or disables automatic switching.
    pub fn set_auto_switch(&self, auto_switch: bool) {
        self.inner.registry().auto_switch = auto_switch;
    }

    /// Returns the default probe timeout.
    pub fn timeout(&self) -> Duration {
        self.inner.registry().timeout
    }

    /// Sets the default probe timeout.
    pub fn set_timeout(&self, timeout: Duration) {
        self.inner.registry().timeout = timeout;
    }

    /// Returns which endpoints a polling cycle probes.
    pub fn poll_type(&self) -> PollType {
        self.inner.registry().poll_type
    }

    /// Sets which endpoints a polling cycle probes.
    pub fn set_poll_type(&self, poll_type: PollType) {
        self.inner.registry().poll_type = poll_type;
    }

    /// Returns the polling period.
    pub fn poll_period(&self) -> Duration {
        self.inner.poller.period()
    }

    /// Sets the polling period, effective from the next wait.
    pub fn set_poll_period(&self, period: Duration) -> Result<(), FailoverError> {
        if period.is_zero() {
            return Err(FailoverError::InvalidConfiguration(
                "the poll period must be positive".to_string(),
            ));
        }
        self.inner.poller.set_period(period);
        Ok(())
    }

    /// Returns how the polling period is measured.
    pub fn timing_mode(&self) -> TimingMode {
        self.inner.poller.timing_mode()
    }

    /// Sets how the polling period is measured.
    pub fn set_timing_mode(&self, timing_mode: TimingMode) {
        self.inner.poller.set_timing_mode(timing_mode);
    }

    /// Starts polling in the background. Returns `false` if already polling.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_polling(&self) -> Result<bool, FailoverError> {
        if self.inner.poller.period().is_zero() {
            return Err(FailoverError::InvalidConfiguration(
                "the poll period must be positive".to_string(),
            ));
        }
        Ok(self.inner.poller.start())
    }

    /// Stops polling. Returns `false` if it wasn't polling.
    pub fn stop_polling(&self) -> bool {
        self.inner.poller.stop()
    }

    /// Checks if the manager is polling.
    pub fn is_polling(&self) -> bool {
        self.inner.poller.is_running()
    }

    async fn poll_cycle(&self) {
        match self.poll_type() {
            PollType::Current => self.check_current().await,
            PollType::All => self.check_all().await,
            PollType::Prioritized => self.check_prioritized().await,
        }
    }

    // Probes concurrently, returning whether each endpoint's status changed.
    async fn probe_endpoints(
        &self,
        endpoints: Vec<(Arc<Endpoint>, Duration)>,
    ) -> Vec<(Arc<Endpoint>, bool)> {
        let probe = &*self.inner.probe;
        join_all(endpoints.into_iter().map(|(endpoint, timeout)| async move {
            let changed = check_endpoint(probe, &endpoint, timeout).await;
            (endpoint, changed)
        }))
        .await
    }

    /// Probes the current endpoint.
    ///
    /// If auto-switch is on and the current endpoint (or the lack of one) leaves the manager
    /// disconnected, a full [`check_all`](Self::check_all) follows to find a replacement.
    pub async fn check_current(&self) {
        let (current, timeout, auto_switch) = {
            let registry = self.inner.registry();
            let timeout = registry
                .current
                .as_ref()
                .map(|current| registry.timeout_for(current));
            (registry.current.clone(), timeout, registry.auto_switch)
        };
        let (Some(current), Some(timeout)) = (current, timeout) else {
            if auto_switch {
                self.check_all().await;
            }
            return;
        };

        let changed = check_endpoint(&*self.inner.probe, &current, timeout).await;
        {
            let mut registry = self.inner.registry();
            if registry.contains(&current) {
                registry.record_round([&current]);
            }
        }
        if changed && self.current().is_some_and(|c| Arc::ptr_eq(&c, &current)) {
            debug!(
                "{CONNECTION_MANAGER}: status of current endpoint {} changed",
                current.address()
            );
            self.notify(Some(&current));
        }
        if auto_switch && current.is_connected() != Some(true) {
            warn!(
                "{CONNECTION_MANAGER}: current endpoint {} is not connected, looking for a \
                 replacement",
                current.address()
            );
            self.check_all().await;
        }
    }

    /// Probes every registered endpoint concurrently, records their latencies and, if
    /// auto-switch is on, switches to the endpoint picked by the selector.
    pub async fn check_all(&self) {
        let targets: Vec<_> = {
            let registry = self.inner.registry();
            registry
                .endpoints
                .iter()
                .map(|e| (Arc::clone(e), registry.timeout_for(e)))
                .collect()
        };
        let probed = self.probe_endpoints(targets).await;
        self.record_and_select(&probed);
    }

    /// Probes the current endpoint and every endpoint of a tier that outranks it, then selects.
    ///
    /// Without a current endpoint every endpoint is probed. A current endpoint that is down
    /// triggers a full [`check_all`](Self::check_all) when auto-switch is on.
    pub async fn check_prioritized(&self) {
        let (targets, auto_switch) = {
            let registry = self.inner.registry();
            let current_priority = registry.current.as_ref().map(|c| c.priority());
            let targets: Vec<_> = registry
                .endpoints
                .iter()
                .filter(|e| match current_priority {
                    None => true,
                    Some(priority) => {
                        registry.is_current(e)
                            || selector::tier_order(e.priority(), priority).is_lt()
                    }
                })
                .map(|e| (Arc::clone(e), registry.timeout_for(e)))
                .collect();
            (targets, registry.auto_switch)
        };
        let probed = self.probe_endpoints(targets).await;
        self.record_and_select(&probed);
        if auto_switch && !self.is_connected() {
            self.check_all().await;
        }
    }

    // Records one round of samples for every member, runs the selector and applies its
    // result. Listeners hear about a switch, or else about a status change of the current
    // endpoint.
    fn record_and_select(&self, probed: &[(Arc<Endpoint>, bool)]) {
        let (switched, current_changed) = {
            let mut registry = self.inner.registry();
            registry.record_round(probed.iter().map(|(endpoint, _)| endpoint));
            let current_changed = probed
                .iter()
                .find(|(endpoint, _)| registry.is_current(endpoint))
                .map(|(endpoint, changed)| (Arc::clone(endpoint), *changed))
                .filter(|(_, changed)| *changed)
                .map(|(endpoint, _)| endpoint);

            let mut switched = None;
            if registry.auto_switch {
                let snapshots = registry.snapshots();
                let current = registry.current.as_ref().map(|c| c.address().to_string());
                let selection = selector::select(&snapshots, current.as_deref(), &registry.history);
                if let Selection::Switch(address) = selection {
                    if let Some(next) = registry.find(&address) {
                        if !registry.is_current(&next) {
                            registry.current = Some(Arc::clone(&next));
                            self.inner.publish(&registry.current);
                            switched = Some(next);
                        }
                    }
                }
            }
            (switched, current_changed)
        };

        if let Some(next) = switched {
            info!(
                "{CONNECTION_MANAGER}: switched current endpoint to {}",
                next.address()
            );
            self.notify(Some(&next));
        } else if let Some(current) = current_changed {
            debug!(
                "{CONNECTION_MANAGER}: status of current endpoint {} changed",
                current.address()
            );
            self.notify(Some(&current));
        }
    }

    /// Probes endpoints tier by tier and returns the fastest online endpoint of the first tier
    /// that has one, skipping `excluded` addresses. Doesn't change current.
    pub async fn best_available(&self, excluded: &[&str]) -> Option<Arc<Endpoint>> {
        let tiers: Vec<Vec<(Arc<Endpoint>, Duration)>> = {
            let registry = self.inner.registry();
            let eligible: Vec<_> = registry
                .snapshots()
                .into_iter()
                .filter(|e| !excluded.contains(&e.address.as_str()))
                .collect();
            selector::tiers(&eligible)
                .into_iter()
                .map(|(_, tier)| {
                    tier.into_iter()
                        .filter_map(|snapshot| registry.find(&snapshot.address))
                        .map(|e| {
                            let timeout = registry.timeout_for(&e);
                            (e, timeout)
                        })
                        .collect()
                })
                .collect()
        };
        for tier in tiers {
            let probed = self.probe_endpoints(tier).await;
            let snapshots: Vec<_> = probed.iter().map(|(e, _)| e.snapshot()).collect();
            if let Some(best) = selector::best_available(&snapshots, &[]) {
                return probed
                    .into_iter()
                    .map(|(e, _)| e)
                    .find(|e| e.address() == best.address);
            }
        }
        None
    }
}
