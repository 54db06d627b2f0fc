use std::{sync::Arc, time::Duration};

use crate::{poller::TimingMode, probe::Probe, ConnectionManager, Endpoint, FailoverError};

/// Default for [`ManagerConfig::auto_switch`].
pub const DEFAULT_AUTO_SWITCH: bool = true;
/// Default for [`ManagerConfig::timeout`].
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default for [`ManagerConfig::poll_period`].
pub const DEFAULT_POLL_PERIOD: Duration = Duration::from_secs(20);
/// Default for [`ManagerConfig::min_better_responses`].
pub const DEFAULT_MIN_BETTER_RESPONSES: usize = 3;

/// Which endpoints a polling cycle probes.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub enum PollType {
    /// The current endpoint, plus every endpoint of a tier that outranks it.
    Prioritized,
    /// Only the current endpoint. Other endpoints are probed when it goes down.
    Current,
    /// Every registered endpoint.
    #[default]
    All,
}

/// A configuration for a [`ConnectionManager`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Whether check cycles may change the current endpoint.
    pub auto_switch: bool,
    /// Probe timeout for endpoints without their own.
    pub timeout: Duration,
    /// Period of the polling cycle.
    pub poll_period: Duration,
    /// Number of consecutive faster rounds needed to switch within a tier. Also the size of each
    /// latency window.
    pub min_better_responses: usize,
    /// Endpoints probed by a polling cycle.
    pub poll_type: PollType,
    /// How the poll period is measured.
    pub timing_mode: TimingMode,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            auto_switch: DEFAULT_AUTO_SWITCH,
            timeout: DEFAULT_TIMEOUT,
            poll_period: DEFAULT_POLL_PERIOD,
            min_better_responses: DEFAULT_MIN_BETTER_RESPONSES,
            poll_type: PollType::default(),
            timing_mode: TimingMode::default(),
        }
    }
}

/// A builder for the [`ConnectionManager`].
#[derive(Debug)]
pub struct ConnectionManagerBuilder {
    probe: Arc<dyn Probe>,
    config: ManagerConfig,
    endpoints: Vec<Endpoint>,
}

impl ConnectionManagerBuilder {
    /// Creates a new instance of the builder with the default configuration.
    pub fn new(probe: impl Probe + 'static) -> Self {
        Self::with_arc_probe(Arc::new(probe))
    }

    /// Same as [`new`](Self::new), but with a shared probe.
    pub fn with_arc_probe(probe: Arc<dyn Probe>) -> Self {
        Self {
            probe,
            config: ManagerConfig::default(),
            endpoints: Vec::new(),
        }
    }

    /// Replaces the whole configuration.
    pub fn with_config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Enables or disables automatic switching.
    pub fn with_auto_switch(mut self, auto_switch: bool) -> Self {
        self.config.auto_switch = auto_switch;
        self
    }

    /// Sets the default probe timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Sets the polling period.
    pub fn with_poll_period(mut self, period: Duration) -> Self {
        self.config.poll_period = period;
        self
    }

    /// Sets how many consecutive faster rounds are needed to switch within a tier.
    pub fn with_min_better_responses(mut self, count: usize) -> Self {
        self.config.min_better_responses = count;
        self
    }

    /// Sets which endpoints a polling cycle probes.
    pub fn with_poll_type(mut self, poll_type: PollType) -> Self {
        self.config.poll_type = poll_type;
        self
    }

    /// Sets how the polling period is measured.
    pub fn with_timing_mode(mut self, timing_mode: TimingMode) -> Self {
        self.config.timing_mode = timing_mode;
        self
    }

    /// Registers an endpoint. Later endpoints with an already registered address are ignored.
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    /// Registers several endpoints.
    pub fn with_endpoints(mut self, endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        self.endpoints.extend(endpoints);
        self
    }

    /// Builds an instance of the `ConnectionManager`. No endpoint is current yet.
    pub fn build(self) -> Result<ConnectionManager, FailoverError> {
        if self.config.poll_period.is_zero() {
            return Err(FailoverError::InvalidConfiguration(
                "the poll period must be positive".to_string(),
            ));
        }
        let manager = ConnectionManager::new(self.probe, self.config);
        for endpoint in self.endpoints {
            manager.add_endpoint(Arc::new(endpoint))?;
        }
        Ok(manager)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{
        config::{ConnectionManagerBuilder, ManagerConfig, PollType},
        poller::TimingMode,
        test_utils::MockProbe,
        Endpoint, FailoverError,
    };

    #[test]
    fn test_defaults() {
        let config = ManagerConfig::default();
        assert!(config.auto_switch);
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.poll_period, Duration::from_secs(20));
        assert_eq!(config.min_better_responses, 3);
        assert_eq!(config.poll_type, PollType::All);
        assert_eq!(config.timing_mode, TimingMode::FixedDelay);
    }

    #[test]
    fn test_builder_applies_settings() {
        let manager = ConnectionManagerBuilder::new(MockProbe::new())
            .with_auto_switch(false)
            .with_timeout(Duration::from_millis(250))
            .with_poll_period(Duration::from_secs(1))
            .with_min_better_responses(2)
            .with_poll_type(PollType::Current)
            .with_timing_mode(TimingMode::FixedRate)
            .with_endpoints([Endpoint::new("n1.localhost"), Endpoint::new("n2.localhost")])
            .with_endpoint(Endpoint::new("n1.localhost").with_priority(9))
            .build()
            .unwrap();
        assert!(!manager.auto_switch());
        assert_eq!(manager.timeout(), Duration::from_millis(250));
        assert_eq!(manager.poll_period(), Duration::from_secs(1));
        assert_eq!(manager.poll_type(), PollType::Current);
        assert_eq!(manager.endpoints().len(), 2);
        // The first registration of an address wins.
        assert_eq!(manager.endpoint("n1.localhost").unwrap().priority(), 0);
        assert!(manager.current().is_none());
    }

    #[test]
    fn test_builder_rejects_invalid_settings() {
        let err = ConnectionManagerBuilder::new(MockProbe::new())
            .with_poll_period(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(matches!(err, FailoverError::InvalidConfiguration(_)));

        let err = ConnectionManagerBuilder::new(MockProbe::new())
            .with_endpoint(Endpoint::new(""))
            .build()
            .unwrap_err();
        assert!(matches!(err, FailoverError::InvalidConfiguration(_)));
    }
}
