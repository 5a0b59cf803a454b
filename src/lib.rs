//! mqclient - message-queuing client library
//!
//! Sessions with a queue manager, destination handles, synchronous and
//! asynchronous message transfer, transactions and administrative commands.
//!
//! # Overview
//!
//! - [`Connection`]: one session with a queue manager, with optional automatic
//!   reconnection and an event stream reporting link loss and recovery
//! - [`Destination`]: an open queue or topic bound to its connection
//! - get/put with wait timeouts, correlation filters, truncation policies and
//!   fire-and-forget async puts
//! - [`Transaction`]: syncpoint units of work with commit and rollback
//! - [`AdminEngine`]: structured admin requests to the command server
//!
//! The queue manager is reached through the [`Broker`](transport::Broker)
//! trait. [`MemoryBroker`] is an in-process queue manager implementing it.
//!
//! # Quick Start
//!
//! ```rust
//! use mqclient::{connect, ConnectOptions, Endpoint, GetOptions, MemoryBroker, Message,
//!     OpenMode, PutOptions};
//! use mqclient::transport::{memory::QueueDefinition, BrokerPtr};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! tokio_test::block_on(async {
//!     let broker = MemoryBroker::new("QM1");
//!     broker.define_queue(QueueDefinition::local("APP.REQUESTS"));
//!     let broker: BrokerPtr = Arc::new(broker);
//!
//!     let connection = connect(broker, ConnectOptions::new(Endpoint::memory("QM1")))
//!         .await
//!         .unwrap();
//!     let out = connection.open_queue("APP.REQUESTS", OpenMode::Output).await.unwrap();
//!     let input = connection.open_queue("APP.REQUESTS", OpenMode::Input).await.unwrap();
//!
//!     out.put(Message::text("hello"), PutOptions::default()).await.unwrap();
//!     let received = input
//!         .get(GetOptions::new().wait_for(Duration::from_secs(5)))
//!         .await
//!         .unwrap();
//!     assert_eq!(received.message.payload_str(), Some("hello"));
//!
//!     connection.disconnect().await.unwrap();
//! });
//! ```

pub mod admin;
pub mod config;
pub mod connection;
pub mod destination;
pub mod engine;
pub mod error;
pub mod message;
pub mod observability;
pub mod testing;
pub mod transaction;
pub mod transport;

pub use admin::{AdminEngine, AdminOptions, AdminResult, AttributeSet, CommandCode};
pub use config::{ClientConfig, ConfigError};
pub use connection::{
    connect, Backpressure, ConnectOptions, Connection, ConnectionEvent, ConnectionState,
    Connector, EventStream, ReconnectConfig, ReconnectPolicy,
};
pub use destination::{CloseOptions, Destination, DestinationKind, OpenMode, OpenOptions};
pub use engine::{
    AsyncPutStatus, GetOptions, PutOptions, PutOutcome, Received, TruncationPolicy,
};
pub use error::{reason, CompletionCode, MqError, MqResult, Warning};
pub use message::{CorrelationId, Message, MessageId, MessageType, Persistence};
pub use transaction::{Transaction, TransactionState};
pub use transport::{Credentials, Endpoint, MatchFilter, MemoryBroker, WaitTimeout};
