use std::{
    collections::BTreeMap,
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use url::Url;

use crate::FailoverError;

/// Username and password presented to an endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    /// Creates a new `Credentials` instance.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Returns the username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Returns the password.
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Health of an endpoint as observed by the most recent probe.
///
/// `online` and `authenticated` are tri-states: `None` means the endpoint was never checked
/// (or its credentials changed since), which is not the same as a failed check.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Health {
    /// Whether the endpoint responded at all.
    pub online: Option<bool>,
    /// Whether the endpoint accepted the credentials. `Some(true)` implies `online == Some(true)`.
    pub authenticated: Option<bool>,
    /// Round trip of the last successful probe.
    pub last_response_time: Option<Duration>,
}

impl Health {
    /// Health of an endpoint that answered a probe successfully after `latency`.
    pub fn responsive(latency: Duration) -> Self {
        Self {
            online: Some(true),
            authenticated: Some(true),
            last_response_time: Some(latency),
        }
    }

    /// Health of an endpoint that could not be reached.
    pub fn offline() -> Self {
        Self {
            online: Some(false),
            authenticated: None,
            last_response_time: None,
        }
    }

    /// `None` while the endpoint is unchecked, otherwise whether it is usable.
    pub fn is_connected(&self) -> Option<bool> {
        self.online
            .map(|online| online && self.authenticated != Some(false))
    }
}

/// A point-in-time copy of the fields used for ranking an endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointSnapshot {
    /// Address of the endpoint.
    pub address: String,
    /// Priority tier; 0 ranks after every positive priority.
    pub priority: u32,
    /// Health at the time of the snapshot.
    pub health: Health,
}

impl EndpointSnapshot {
    /// Creates a new `EndpointSnapshot` instance.
    pub fn new(address: impl Into<String>, priority: u32, health: Health) -> Self {
        Self {
            address: address.into(),
            priority,
            health,
        }
    }

    /// Checks if the endpoint answered its last probe.
    pub fn is_online(&self) -> bool {
        self.health.online == Some(true)
    }
}

#[derive(Debug, Default)]
struct EndpointState {
    proxy: Option<String>,
    priority: u32,
    timeout: Option<Duration>,
    credentials: Option<Credentials>,
    attributes: BTreeMap<String, String>,
    health: Health,
}

/// A remote service instance, identified by its address.
///
/// The address is fixed for the lifetime of the value; everything else can change while the
/// endpoint is shared with a [`ConnectionManager`](crate::ConnectionManager).
#[derive(Debug)]
pub struct Endpoint {
    address: String,
    state: Mutex<EndpointState>,
}

impl Endpoint {
    /// Creates a new `Endpoint` with no priority, no credentials and unknown health.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            state: Mutex::new(EndpointState::default()),
        }
    }

    /// Sets the priority tier.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.state_mut().priority = priority;
        self
    }

    /// Routes probes through the given proxy.
    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.state_mut().proxy = Some(proxy.into());
        self
    }

    /// Overrides the manager's probe timeout for this endpoint.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.state_mut().timeout = Some(timeout);
        self
    }

    /// Sets the credentials presented on every probe.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.state_mut().credentials = Some(Credentials::new(username, password));
        self
    }

    /// Adds a free-form attribute, replacing any previous value for the key.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.state_mut().attributes.insert(key.into(), value.into());
        self
    }

    fn state_mut(&mut self) -> &mut EndpointState {
        self.state.get_mut().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> MutexGuard<'_, EndpointState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the address of the endpoint.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Returns `false` for a blank address, which can never become current.
    pub fn has_address(&self) -> bool {
        !self.address.trim().is_empty()
    }

    /// Converts the address to a URL, assuming `http` when no scheme is given.
    pub fn url(&self) -> Result<Url, FailoverError> {
        let address = self.address.trim();
        let parsed = if address.contains("://") {
            Url::parse(address)
        } else {
            Url::parse(&format!("http://{address}"))
        };
        parsed.map_err(|err| {
            FailoverError::InvalidConfiguration(format!(
                "endpoint address {:?} is not a valid url: {err}",
                self.address
            ))
        })
    }

    /// Returns the priority tier.
    pub fn priority(&self) -> u32 {
        self.state().priority
    }

    /// Sets the priority tier.
    pub fn set_priority(&self, priority: u32) {
        self.state().priority = priority;
    }

    /// Returns the proxy, if any.
    pub fn proxy(&self) -> Option<String> {
        self.state().proxy.clone()
    }

    /// Sets or clears the proxy.
    pub fn set_proxy(&self, proxy: Option<String>) {
        self.state().proxy = proxy;
    }

    /// Returns the per-endpoint probe timeout, if overridden.
    pub fn timeout(&self) -> Option<Duration> {
        self.state().timeout
    }

    /// Sets or clears the per-endpoint probe timeout.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.state().timeout = timeout;
    }

    /// Returns the credentials, if any.
    pub fn credentials(&self) -> Option<Credentials> {
        self.state().credentials.clone()
    }

    /// Replaces the credentials.
    ///
    /// Health observed with the old credentials no longer applies, so changing them resets
    /// `online` and `authenticated` to unknown. Returns `true` if the credentials changed.
    pub fn set_credentials(&self, credentials: Option<Credentials>) -> bool {
        let mut state = self.state();
        if state.credentials == credentials {
            return false;
        }
        state.credentials = credentials;
        state.health = Health::default();
        true
    }

    /// Returns the value of an attribute.
    pub fn attribute(&self, key: &str) -> Option<String> {
        self.state().attributes.get(key).cloned()
    }

    /// Returns a copy of all attributes.
    pub fn attributes(&self) -> BTreeMap<String, String> {
        self.state().attributes.clone()
    }

    /// Sets an attribute, returning the previous value.
    pub fn set_attribute(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Option<String> {
        self.state().attributes.insert(key.into(), value.into())
    }

    /// Returns the health observed by the last probe.
    pub fn health(&self) -> Health {
        self.state().health
    }

    /// Whether the endpoint answered its last probe, `None` if never checked.
    pub fn is_online(&self) -> Option<bool> {
        self.state().health.online
    }

    /// Whether the endpoint accepted the credentials, `None` if unknown.
    pub fn is_authenticated(&self) -> Option<bool> {
        self.state().health.authenticated
    }

    /// `None` while unchecked, otherwise online and not rejecting the credentials.
    pub fn is_connected(&self) -> Option<bool> {
        self.state().health.is_connected()
    }

    /// Returns the round trip of the last successful probe.
    pub fn last_response_time(&self) -> Option<Duration> {
        self.state().health.last_response_time
    }

    /// Stores the outcome of a probe, returning `true` if `online` or `authenticated` changed.
    pub(crate) fn apply_health(&self, health: Health) -> bool {
        debug_assert!(
            health.authenticated != Some(true) || health.online == Some(true),
            "an authenticated endpoint must be online"
        );
        let mut state = self.state();
        let changed = state.health.online != health.online
            || state.health.authenticated != health.authenticated;
        state.health = health;
        changed
    }

    /// Takes a snapshot of the ranking fields.
    pub fn snapshot(&self) -> EndpointSnapshot {
        let state = self.state();
        EndpointSnapshot::new(self.address.clone(), state.priority, state.health)
    }
}
