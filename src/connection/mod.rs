//! Connections to a queue manager
//!
//! [`Connector::connect`] (or the free [`connect`]) establishes a session and
//! returns a [`Connection`]. The connection's supervisor watches the session
//! link and, when a [`ReconnectPolicy`] allows, reestablishes the session and
//! reopens destinations. Applications follow along through
//! [`Connection::events`].

pub mod client;
pub mod events;
pub mod health_monitor;
pub mod state;

pub use client::{connect, Connection, Connector};
pub use events::{ConnectionEvent, EventStream};
pub use health_monitor::{HealthMetrics, HealthMonitor};
pub use state::{
    Backpressure, ConnectOptions, ConnectionState, OperationDefaults, ReconnectConfig,
    ReconnectPolicy,
};
