//! Pure health monitoring and reconnection logic
//!
//! Decisions the reconnection supervisor makes (whether to try again, how long
//! to wait, which endpoint to dial, what state follows an event) live here as
//! functions without side effects beyond logging.

use super::state::{ConnectOptions, ConnectionState, ReconnectConfig, ReconnectPolicy};
use crate::transport::Endpoint;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Determine if reconnection should be attempted
    /// Supports unlimited retries when max_attempts is None
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = config.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        let backoff_delay = config.calculate_backoff_delay(current_attempts + 1);
        ReconnectionDecision::Proceed {
            attempt: current_attempts + 1,
            delay_ms: backoff_delay,
        }
    }

    /// Endpoint to dial for a (1-based) reconnection attempt
    ///
    /// `Reconnect` cycles through the primary and the alternates;
    /// `ReconnectQueueManager` only ever dials the primary.
    pub fn select_endpoint(options: &ConnectOptions, attempt: u32) -> &Endpoint {
        if options.reconnect != ReconnectPolicy::Reconnect || options.alternate_endpoints.is_empty()
        {
            return &options.endpoint;
        }
        let candidates = options.alternate_endpoints.len() + 1;
        match attempt.saturating_sub(1) as usize % candidates {
            0 => &options.endpoint,
            n => &options.alternate_endpoints[n - 1],
        }
    }

    /// Whether a reestablished session may be accepted
    pub fn accepts_queue_manager(
        policy: ReconnectPolicy,
        original: &str,
        reconnected: &str,
    ) -> bool {
        match policy {
            ReconnectPolicy::ReconnectQueueManager => original == reconnected,
            ReconnectPolicy::Reconnect | ReconnectPolicy::Disabled => true,
        }
    }

    /// Determine next state after a link event
    pub fn determine_next_state(
        current_state: &ConnectionState,
        event: LinkEvent,
    ) -> ConnectionState {
        match event {
            LinkEvent::SessionEstablished => ConnectionState::Connected,
            LinkEvent::LinkLost { reason, reconnect } => {
                if current_state.is_terminal() {
                    current_state.clone()
                } else if reconnect {
                    ConnectionState::Reconnecting { attempt: 0 }
                } else {
                    ConnectionState::Broken(reason)
                }
            }
            LinkEvent::ReconnectionStarted(attempt) => ConnectionState::Reconnecting { attempt },
            LinkEvent::PermanentFailure(reason) => ConnectionState::Broken(reason),
            LinkEvent::Closed => ConnectionState::Disconnected,
        }
    }

    /// Check if the connection state allows broker calls
    pub fn can_operate(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Calculate health metrics for a connection
    pub fn calculate_health_metrics(
        connect_time: Option<Instant>,
        last_activity: Option<Instant>,
        reconnect_count: u32,
    ) -> HealthMetrics {
        let now = Instant::now();

        let uptime = connect_time.map(|t| now.duration_since(t));
        let time_since_last_activity = last_activity.map(|t| now.duration_since(t));

        HealthMetrics {
            uptime,
            time_since_last_activity,
            reconnect_count,
            is_healthy: Self::determine_health_status(uptime, time_since_last_activity),
        }
    }

    fn determine_health_status(
        uptime: Option<Duration>,
        time_since_last_activity: Option<Duration>,
    ) -> bool {
        match (uptime, time_since_last_activity) {
            (Some(_), None) => true,
            (Some(_), Some(idle)) => idle < Duration::from_secs(300),
            _ => false,
        }
    }

    /// Log a connection state transition
    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!(target: "mq_connection", "session established");
            }
            (ConnectionState::Connected, ConnectionState::Reconnecting { .. }) => {
                warn!(target: "mq_connection", "session link lost, reconnecting");
            }
            (ConnectionState::Reconnecting { attempt }, ConnectionState::Connected) => {
                info!(target: "mq_connection", attempt, "reconnection successful");
            }
            (_, ConnectionState::Broken(reason)) => {
                error!(target: "mq_connection", %reason, "connection broken");
            }
            _ => {
                info!(target: "mq_connection", "connection state: {:?} -> {:?}", from, to);
            }
        }
    }

    /// Validate reconnection configuration
    pub fn validate_reconnect_config(config: &ReconnectConfig) -> Result<(), String> {
        if let Some(max_attempts) = config.max_attempts {
            if max_attempts == 0 {
                return Err("max_attempts must be greater than 0 or None for unlimited".to_string());
            }
        }

        if config.sustained_delay == 0 {
            return Err("sustained_delay must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay_ms: u64 },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
}

/// Session events that drive state transitions
#[derive(Debug, Clone)]
pub enum LinkEvent {
    SessionEstablished,
    /// The broker reported the link down
    LinkLost { reason: String, reconnect: bool },
    ReconnectionStarted(u32),
    /// No more retries
    PermanentFailure(String),
    /// The application disconnected
    Closed,
}

/// Health metrics for connection monitoring
#[derive(Debug, Clone)]
pub struct HealthMetrics {
    /// Time since the current session was established
    pub uptime: Option<Duration>,
    /// Time since the last successful broker call
    pub time_since_last_activity: Option<Duration>,
    /// Number of successful reconnections
    pub reconnect_count: u32,
    pub is_healthy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ReconnectConfig {
        ReconnectConfig {
            max_attempts: None,
            backoff_pattern: vec![25, 50, 100, 250],
            sustained_delay: 250,
        }
    }

    #[test]
    fn test_should_attempt_reconnection() {
        let config = config();

        let decision = HealthMonitor::should_attempt_reconnection(0, &config, false);
        assert_eq!(
            decision,
            ReconnectionDecision::Proceed {
                attempt: 1,
                delay_ms: 25
            }
        );

        let decision = HealthMonitor::should_attempt_reconnection(0, &config, true);
        assert_eq!(decision, ReconnectionDecision::AbortShutdownRequested);

        let decision = HealthMonitor::should_attempt_reconnection(5, &config, false);
        assert_eq!(
            decision,
            ReconnectionDecision::Proceed {
                attempt: 6,
                delay_ms: 250
            }
        );

        let limited = ReconnectConfig {
            max_attempts: Some(5),
            ..config
        };
        let decision = HealthMonitor::should_attempt_reconnection(5, &limited, false);
        assert_eq!(decision, ReconnectionDecision::AbortMaxAttemptsExceeded);
    }

    #[test]
    fn test_select_endpoint_cycles_alternates() {
        let options = ConnectOptions::new(Endpoint::parse("mq://a/QM1").unwrap())
            .alternate(Endpoint::parse("mq://b/QM1").unwrap())
            .reconnect(ReconnectPolicy::Reconnect);

        assert_eq!(HealthMonitor::select_endpoint(&options, 1).host(), "a");
        assert_eq!(HealthMonitor::select_endpoint(&options, 2).host(), "b");
        assert_eq!(HealthMonitor::select_endpoint(&options, 3).host(), "a");

        let pinned = options.reconnect(ReconnectPolicy::ReconnectQueueManager);
        assert_eq!(HealthMonitor::select_endpoint(&pinned, 2).host(), "a");
    }

    #[test]
    fn test_accepts_queue_manager() {
        assert!(HealthMonitor::accepts_queue_manager(
            ReconnectPolicy::Reconnect,
            "QM1",
            "QM2"
        ));
        assert!(!HealthMonitor::accepts_queue_manager(
            ReconnectPolicy::ReconnectQueueManager,
            "QM1",
            "QM2"
        ));
        assert!(HealthMonitor::accepts_queue_manager(
            ReconnectPolicy::ReconnectQueueManager,
            "QM1",
            "QM1"
        ));
    }

    #[test]
    fn test_determine_next_state() {
        let connected = ConnectionState::Connected;

        let next = HealthMonitor::determine_next_state(
            &ConnectionState::Connecting,
            LinkEvent::SessionEstablished,
        );
        assert_eq!(next, ConnectionState::Connected);

        let next = HealthMonitor::determine_next_state(
            &connected,
            LinkEvent::LinkLost {
                reason: "reset".to_string(),
                reconnect: false,
            },
        );
        assert_eq!(next, ConnectionState::Broken("reset".to_string()));

        let next = HealthMonitor::determine_next_state(
            &connected,
            LinkEvent::LinkLost {
                reason: "reset".to_string(),
                reconnect: true,
            },
        );
        assert_eq!(next, ConnectionState::Reconnecting { attempt: 0 });

        let next =
            HealthMonitor::determine_next_state(&next, LinkEvent::ReconnectionStarted(2));
        assert_eq!(next, ConnectionState::Reconnecting { attempt: 2 });

        let next = HealthMonitor::determine_next_state(
            &next,
            LinkEvent::PermanentFailure("exhausted".to_string()),
        );
        assert_eq!(next, ConnectionState::Broken("exhausted".to_string()));

        let next = HealthMonitor::determine_next_state(&connected, LinkEvent::Closed);
        assert_eq!(next, ConnectionState::Disconnected);
    }

    #[test]
    fn test_link_loss_after_disconnect_keeps_terminal_state() {
        let next = HealthMonitor::determine_next_state(
            &ConnectionState::Disconnected,
            LinkEvent::LinkLost {
                reason: "ended".to_string(),
                reconnect: true,
            },
        );
        assert_eq!(next, ConnectionState::Disconnected);
    }

    #[test]
    fn test_can_operate() {
        assert!(HealthMonitor::can_operate(&ConnectionState::Connected));
        assert!(!HealthMonitor::can_operate(&ConnectionState::Connecting));
        assert!(!HealthMonitor::can_operate(&ConnectionState::Reconnecting {
            attempt: 1
        }));
        assert!(!HealthMonitor::can_operate(&ConnectionState::Broken(
            "x".to_string()
        )));
        assert!(!HealthMonitor::can_operate(&ConnectionState::Disconnected));
    }

    #[test]
    fn test_calculate_health_metrics() {
        let now = Instant::now();
        let metrics = HealthMonitor::calculate_health_metrics(Some(now), None, 0);
        assert!(metrics.uptime.is_some());
        assert!(metrics.is_healthy);

        let metrics = HealthMonitor::calculate_health_metrics(None, None, 0);
        assert!(!metrics.is_healthy);

        let idle = now.checked_sub(Duration::from_secs(600));
        let metrics = HealthMonitor::calculate_health_metrics(Some(now), idle, 2);
        if idle.is_some() {
            assert!(!metrics.is_healthy);
        }
        assert_eq!(metrics.reconnect_count, 2);
    }

    #[test]
    fn test_validate_reconnect_config() {
        assert!(HealthMonitor::validate_reconnect_config(&config()).is_ok());
        let zero = ReconnectConfig {
            max_attempts: Some(0),
            ..config()
        };
        assert!(HealthMonitor::validate_reconnect_config(&zero).is_err());
        let no_delay = ReconnectConfig {
            sustained_delay: 0,
            ..config()
        };
        assert!(HealthMonitor::validate_reconnect_config(&no_delay).is_err());
    }
}
