//! Connection events published to the application
//!
//! Events go out on a broadcast channel. Applications drain them from an
//! [`EventStream`]; nothing is delivered through callbacks.

use std::time::Duration;
use tokio::sync::broadcast;
use tracing::warn;

/// Capacity of the per-connection event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Something that happened to a connection's session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The session link went down
    Broken { reason: String },
    /// A reconnection attempt is about to start after `delay`
    Reconnecting { attempt: u32, delay: Duration },
    /// The session was reestablished and destinations reopened
    Reconnected { attempt: u32 },
    /// Reconnection gave up; the connection is now broken for good
    ReconnectFailed { reason: String },
}

impl ConnectionEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionEvent::ReconnectFailed { .. })
    }
}

/// Receiving side of a connection's events
#[derive(Debug)]
pub struct EventStream {
    receiver: broadcast::Receiver<ConnectionEvent>,
}

impl EventStream {
    pub(crate) fn new(receiver: broadcast::Receiver<ConnectionEvent>) -> Self {
        Self { receiver }
    }

    /// Next event; `None` once the connection is gone
    ///
    /// A slow reader that falls behind skips the events it missed.
    pub async fn next(&mut self) -> Option<ConnectionEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(target: "mq_connection", skipped, "event reader lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is already queued
    pub fn try_next(&mut self) -> Option<ConnectionEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(target: "mq_connection", skipped, "event reader lagged");
                }
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_delivers_in_order() {
        let (tx, rx) = broadcast::channel(8);
        let mut stream = EventStream::new(rx);
        tx.send(ConnectionEvent::Broken {
            reason: "reset".to_string(),
        })
        .unwrap();
        tx.send(ConnectionEvent::Reconnected { attempt: 1 }).unwrap();

        assert!(matches!(
            stream.next().await,
            Some(ConnectionEvent::Broken { .. })
        ));
        assert_eq!(
            stream.next().await,
            Some(ConnectionEvent::Reconnected { attempt: 1 })
        );
        assert_eq!(stream.try_next(), None);
    }

    #[tokio::test]
    async fn test_lagged_reader_skips_ahead() {
        let (tx, rx) = broadcast::channel(2);
        let mut stream = EventStream::new(rx);
        for attempt in 1..=5 {
            tx.send(ConnectionEvent::Reconnected { attempt }).unwrap();
        }
        assert_eq!(
            stream.try_next(),
            Some(ConnectionEvent::Reconnected { attempt: 4 })
        );
    }

    #[tokio::test]
    async fn test_closed_channel_ends_stream() {
        let (tx, rx) = broadcast::channel::<ConnectionEvent>(2);
        let mut stream = EventStream::new(rx);
        drop(tx);
        assert_eq!(stream.next().await, None);
    }

    #[test]
    fn test_terminal_event() {
        assert!(ConnectionEvent::ReconnectFailed {
            reason: "x".to_string()
        }
        .is_terminal());
        assert!(!ConnectionEvent::Reconnected { attempt: 1 }.is_terminal());
    }
}
