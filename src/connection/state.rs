//! Connection state, reconnection policy and connect options
//!
//! Pure data: nothing here touches the broker.

use crate::engine::TruncationPolicy;
use crate::error::ConnectError;
use crate::transport::{Credentials, Endpoint, WaitTimeout};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle state of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Initial state while the first session is established
    Connecting,
    /// Session healthy, operations allowed
    Connected,
    /// Link lost; reconnecting with the given attempt number
    Reconnecting { attempt: u32 },
    /// Link lost for good; operations fail with `ConnectionLost`
    Broken(String),
    /// Closed by the application
    Disconnected,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Broken(_) | ConnectionState::Disconnected)
    }
}

/// What happens when a session's link is lost
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectPolicy {
    /// The connection becomes `Broken`
    #[default]
    Disabled,
    /// Reconnect to the primary or any alternate endpoint
    Reconnect,
    /// Reconnect only to the same queue manager
    ReconnectQueueManager,
}

impl ReconnectPolicy {
    pub fn is_enabled(self) -> bool {
        !matches!(self, ReconnectPolicy::Disabled)
    }
}

/// Reconnection backoff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Delays in milliseconds for the first attempts
    pub backoff_pattern: Vec<u64>,
    /// Delay once the pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![100, 250, 500, 1000, 2000],
            sustained_delay: 5000,
        }
    }
}

impl ReconnectConfig {
    /// Delay before the given (1-based) attempt
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// Behaviour of get and put while the connection is reconnecting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    /// Block until reconnected, failing after `timeout`
    Queue { timeout: Duration },
    /// Fail immediately with `Reconnecting`
    Reject,
}

impl Default for Backpressure {
    fn default() -> Self {
        Backpressure::Queue {
            timeout: Duration::from_secs(30),
        }
    }
}

/// Defaults applied to get and put calls that do not override them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationDefaults {
    pub wait: WaitTimeout,
    pub truncation: TruncationPolicy,
    pub buffer_capacity: Option<usize>,
    /// Capacity of the async put queue
    pub async_put_queue: usize,
}

impl Default for OperationDefaults {
    fn default() -> Self {
        Self {
            wait: WaitTimeout::NoWait,
            truncation: TruncationPolicy::Fail,
            buffer_capacity: None,
            async_put_queue: 1024,
        }
    }
}

/// Everything `connect` needs
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub endpoint: Endpoint,
    pub alternate_endpoints: Vec<Endpoint>,
    pub credentials: Option<Credentials>,
    /// Connections registered under the same id are shared by a `Connector`
    pub client_id: Option<String>,
    pub reconnect: ReconnectPolicy,
    pub reconnect_config: ReconnectConfig,
    pub backpressure: Backpressure,
    pub connect_timeout: Duration,
    pub defaults: OperationDefaults,
}

impl ConnectOptions {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            alternate_endpoints: Vec::new(),
            credentials: None,
            client_id: None,
            reconnect: ReconnectPolicy::Disabled,
            reconnect_config: ReconnectConfig::default(),
            backpressure: Backpressure::default(),
            connect_timeout: Duration::from_secs(30),
            defaults: OperationDefaults::default(),
        }
    }

    /// Options for an endpoint given as a URL
    pub fn parse(endpoint: &str) -> Result<Self, ConnectError> {
        Ok(Self::new(Endpoint::parse(endpoint)?))
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn reconnect_config(mut self, config: ReconnectConfig) -> Self {
        self.reconnect_config = config;
        self
    }

    pub fn alternate(mut self, endpoint: Endpoint) -> Self {
        self.alternate_endpoints.push(endpoint);
        self
    }

    pub fn backpressure(mut self, backpressure: Backpressure) -> Self {
        self.backpressure = backpressure;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn defaults(mut self, defaults: OperationDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Credentials given explicitly, else those embedded in the endpoint URL
    pub fn effective_credentials(&self) -> Option<Credentials> {
        self.credentials
            .clone()
            .or_else(|| self.endpoint.credentials().cloned())
    }
}
