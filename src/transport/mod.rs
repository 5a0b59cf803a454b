//! Broker seam
//!
//! The client library never talks to a queue manager directly. Everything goes
//! through the [`Broker`] trait so that sessions, destinations and transactions
//! can be driven against any implementation. [`memory::MemoryBroker`] is the
//! in-process queue manager shipped with the crate.

use crate::destination::{DestinationKind, OpenMode};
use crate::error::{MqResult, Warning};
use crate::message::{CorrelationId, Message, MessageId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub mod endpoint;
pub mod memory;

pub use endpoint::{Credentials, Endpoint, DEFAULT_PORT};
pub use memory::MemoryBroker;

/// Broker-assigned session identifier
pub type SessionId = u64;

/// Broker-assigned identifier of an open object within a session
pub type ObjectId = u64;

/// Request to establish a session
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub endpoint: Endpoint,
    pub credentials: Option<Credentials>,
    pub client_id: Option<String>,
}

/// An established session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session: SessionId,
    pub queue_manager: String,
}

/// Health of a session's link, observed by the reconnection supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    Up,
    Down(String),
}

/// Lifetime of a queue created from a model queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DynamicLifetime {
    /// Deleted when the creating handle closes or the session ends
    Temporary,
    /// Survives until explicitly deleted
    Permanent,
}

/// What to open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSpec {
    /// Object name; the model queue name when `dynamic_prefix` is set
    pub name: String,
    pub kind: DestinationKind,
    pub mode: OpenMode,
    /// Create a dynamic queue from the model `name`, named with this prefix
    pub dynamic_prefix: Option<String>,
}

/// Result of a successful open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedObject {
    pub object: ObjectId,
    /// Name actually opened; generated for dynamic queues
    pub resolved_name: String,
    pub dynamic: Option<DynamicLifetime>,
}

/// Close behaviour for permanent dynamic queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CloseRequest {
    pub delete: bool,
    pub purge: bool,
}

/// How long a get may wait for a message to arrive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitTimeout {
    #[default]
    NoWait,
    Bounded(Duration),
    Unlimited,
}

/// Selects which message a get returns; empty matches the next available
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MatchFilter {
    pub message_id: Option<MessageId>,
    pub correlation_id: Option<CorrelationId>,
}

impl MatchFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn message_id(id: MessageId) -> Self {
        Self {
            message_id: Some(id),
            correlation_id: None,
        }
    }

    pub fn correlation_id(id: CorrelationId) -> Self {
        Self {
            message_id: None,
            correlation_id: Some(id),
        }
    }

    pub fn matches(&self, message: &Message) -> bool {
        self.message_id.map_or(true, |id| id == message.message_id())
            && self
                .correlation_id
                .map_or(true, |id| id == message.correlation_id())
    }
}

/// Parameters of a put
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PutRequest {
    pub syncpoint: bool,
}

/// Broker acknowledgement of a put
#[derive(Debug, Clone, PartialEq)]
pub struct PutReceipt {
    pub message_id: MessageId,
    pub put_timestamp: DateTime<Utc>,
    pub warning: Option<Warning>,
}

/// Where a browse resumes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowsePosition {
    First,
    /// The first message with a sequence number greater than this one
    After(u64),
}

/// Parameters of a get
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GetRequest {
    pub filter: MatchFilter,
    pub wait: WaitTimeout,
    pub syncpoint: bool,
    /// Browse instead of removing
    pub browse: Option<BrowsePosition>,
    /// Largest payload the caller can accept; `None` is unbounded
    pub buffer_capacity: Option<usize>,
    /// Remove an oversized message anyway instead of leaving it queued
    pub accept_truncated: bool,
}

/// A message handed to the client
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Message,
    /// Position of the message on its queue, used as a browse cursor
    pub sequence: u64,
}

/// Point-in-time status of a queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatus {
    pub name: String,
    pub depth: usize,
    pub open_input_count: usize,
    pub open_output_count: usize,
}

/// Operations a queue manager offers a client session
///
/// Implementations must remove a message atomically: a get that is cancelled
/// while waiting never consumes a message.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Establish a session
    async fn connect(&self, request: SessionRequest) -> MqResult<SessionInfo>;

    /// End a session, backing out uncommitted work and closing its objects
    async fn disconnect(&self, session: SessionId) -> MqResult<()>;

    /// Watch the health of a session's link
    async fn link(&self, session: SessionId) -> MqResult<watch::Receiver<LinkStatus>>;

    async fn open(&self, session: SessionId, spec: ObjectSpec) -> MqResult<OpenedObject>;

    async fn close(&self, session: SessionId, object: ObjectId, request: CloseRequest)
        -> MqResult<()>;

    async fn put(
        &self,
        session: SessionId,
        object: ObjectId,
        message: Message,
        request: PutRequest,
    ) -> MqResult<PutReceipt>;

    /// Retrieve a message, waiting as the request allows
    async fn get(&self, session: SessionId, object: ObjectId, request: GetRequest)
        -> MqResult<Delivery>;

    /// Make the session's staged work visible
    async fn commit(&self, session: SessionId) -> MqResult<()>;

    /// Discard the session's staged work
    async fn backout(&self, session: SessionId) -> MqResult<()>;

    async fn inquire_queue(&self, session: SessionId, name: &str) -> MqResult<QueueStatus>;
}

/// Shared broker handle
pub type BrokerPtr = Arc<dyn Broker>;
