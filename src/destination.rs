//! Destination handles
//!
//! A [`Destination`] is a queue or topic opened on a connection in one mode.
//! It holds only a weak reference to its connection and is closed exactly
//! once: [`Destination::close`] consumes it, and a handle dropped without
//! closing is closed in the background.

use crate::admin::catalog::MAX_OBJECT_NAME;
use crate::connection::client::ConnectionInner;
use crate::connection::Connection;
use crate::error::{MqError, MqResult, OpenError};
use crate::transport::{BrowsePosition, CloseRequest, DynamicLifetime, ObjectSpec};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    Queue,
    Topic,
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationKind::Queue => f.write_str("queue"),
            DestinationKind::Topic => f.write_str("topic"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenMode {
    /// Destructive gets, shared with other input openers
    Input,
    /// Destructive gets, no other input openers allowed
    InputExclusive,
    Output,
    /// Non-destructive gets walking a cursor
    Browse,
}

impl OpenMode {
    pub fn is_input(self) -> bool {
        matches!(self, OpenMode::Input | OpenMode::InputExclusive)
    }
}

/// Options for [`Connection::open`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenOptions {
    dynamic_prefix: Option<String>,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a dynamic queue from the model queue being opened
    ///
    /// The new queue is named with `prefix` (a trailing `*` is allowed) and
    /// inherits its lifetime from the model: temporary queues vanish when
    /// closed, permanent ones remain until deleted.
    pub fn dynamic(prefix: impl Into<String>) -> Self {
        Self {
            dynamic_prefix: Some(prefix.into()),
        }
    }

    pub fn dynamic_prefix(&self) -> Option<&str> {
        self.dynamic_prefix.as_deref()
    }
}

/// Options for [`Destination::close`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CloseOptions {
    /// Delete a permanent dynamic queue
    pub delete: bool,
    /// With `delete`, discard any messages still on it
    pub purge: bool,
}

impl CloseOptions {
    pub fn delete() -> Self {
        Self {
            delete: true,
            purge: false,
        }
    }

    pub fn delete_purge() -> Self {
        Self {
            delete: true,
            purge: true,
        }
    }
}

/// An open queue or topic
pub struct Destination {
    connection: Weak<ConnectionInner>,
    connection_id: u64,
    key: u64,
    name: String,
    kind: DestinationKind,
    mode: OpenMode,
    dynamic: Option<DynamicLifetime>,
    browse_cursor: Mutex<Option<u64>>,
    closed: bool,
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destination")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("mode", &self.mode)
            .field("connection", &self.connection_id)
            .finish()
    }
}

impl Destination {
    /// Resolved name; for a temporary dynamic queue this changes if a reconnect recreated it
    pub fn name(&self) -> String {
        self.connection
            .upgrade()
            .and_then(|inner| inner.resolved_name(self.key))
            .unwrap_or_else(|| self.name.clone())
    }

    pub fn kind(&self) -> DestinationKind {
        self.kind
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Lifetime of a dynamic queue created by this open
    pub fn dynamic(&self) -> Option<DynamicLifetime> {
        self.dynamic
    }

    pub(crate) fn key(&self) -> u64 {
        self.key
    }

    pub(crate) fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// The owning connection, if it still exists
    pub(crate) fn connection(&self) -> MqResult<Arc<ConnectionInner>> {
        self.connection.upgrade().ok_or(MqError::NotConnected)
    }

    pub(crate) fn browse_position(&self, restart: bool) -> BrowsePosition {
        let mut cursor = self
            .browse_cursor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if restart {
            *cursor = None;
        }
        match *cursor {
            Some(seq) => BrowsePosition::After(seq),
            None => BrowsePosition::First,
        }
    }

    pub(crate) fn advance_browse_cursor(&self, sequence: u64) {
        *self
            .browse_cursor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(sequence);
    }

    /// Close the handle
    ///
    /// Temporary dynamic queues are always deleted. `options.delete` deletes a
    /// permanent dynamic queue, failing with `QueueNotEmpty` unless it is empty
    /// or `options.purge` is set. The handle is invalidated even when closing
    /// fails, including on a broken connection.
    pub async fn close(mut self, options: CloseOptions) -> MqResult<()> {
        let inner = self.connection()?;
        let name = self.name();
        let request = CloseRequest {
            delete: options.delete,
            purge: options.purge,
        };
        let result = inner.close_object(self.key, &name, request).await;
        self.closed = true;
        debug!(target: "mq_engine", connection = self.connection_id, %name, ok = result.is_ok(), "destination closed");
        result
    }
}

impl Drop for Destination {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let Some(inner) = self.connection.upgrade() else {
            return;
        };
        // disconnect already took every record
        if inner.is_shutting_down() || !inner.holds_object(self.key) {
            return;
        }

        let key = self.key;
        let output = self.mode == OpenMode::Output;
        let name = inner
            .resolved_name(key)
            .unwrap_or_else(|| self.name.clone());
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    // async puts already queued on this handle go out first
                    if output {
                        crate::engine::async_put::settle(&inner).await;
                    }
                    let result = inner.close_object(key, &name, CloseRequest::default()).await;
                    debug!(target: "mq_engine", connection = inner.id, %name, ok = result.is_ok(), "dropped destination closed");
                });
            }
            // no runtime to reach the broker; the session end releases the object
            Err(_) => inner.forget_object(key),
        }
    }
}

fn validate_open(name: &str, kind: DestinationKind, options: &OpenOptions) -> MqResult<()> {
    if name.is_empty() {
        return Err(OpenError::InvalidOptions("destination name is empty".to_string()).into());
    }
    match kind {
        DestinationKind::Queue if name.len() > MAX_OBJECT_NAME => {
            Err(OpenError::InvalidOptions(format!(
                "queue name exceeds {MAX_OBJECT_NAME} characters"
            ))
            .into())
        }
        DestinationKind::Topic if options.dynamic_prefix.is_some() => Err(
            OpenError::InvalidOptions("dynamic queues are created from model queues".to_string())
                .into(),
        ),
        _ => Ok(()),
    }
}

impl Connection {
    /// Open a queue or topic
    ///
    /// Opening a topic for input creates a non-durable subscription that ends
    /// when the handle closes; wildcards `+` (one level) and `#` (any remaining
    /// levels) are accepted there. Opening a topic for output publishes to every
    /// matching subscription.
    pub async fn open(
        &self,
        name: &str,
        kind: DestinationKind,
        mode: OpenMode,
        options: OpenOptions,
    ) -> MqResult<Destination> {
        validate_open(name, kind, &options)?;
        let inner = self.inner();
        let spec = ObjectSpec {
            name: name.to_string(),
            kind,
            mode,
            dynamic_prefix: options.dynamic_prefix,
        };
        let (key, opened) = inner.open_object(spec).await?;
        debug!(target: "mq_engine", connection = inner.id, name = %opened.resolved_name, %kind, ?mode, "destination opened");

        Ok(Destination {
            connection: Arc::downgrade(inner),
            connection_id: inner.id,
            key,
            name: opened.resolved_name,
            kind,
            mode,
            dynamic: opened.dynamic,
            browse_cursor: Mutex::new(None),
            closed: false,
        })
    }

    /// Open a queue with default options
    pub async fn open_queue(&self, name: &str, mode: OpenMode) -> MqResult<Destination> {
        self.open(name, DestinationKind::Queue, mode, OpenOptions::default())
            .await
    }

    /// Open a topic with default options
    pub async fn open_topic(&self, topic: &str, mode: OpenMode) -> MqResult<Destination> {
        self.open(topic, DestinationKind::Topic, mode, OpenOptions::default())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::{DEFAULT_MODEL_QUEUE, DURABLE_MODEL_QUEUE};
    use crate::connection::{connect, ConnectOptions};
    use crate::message::Message;
    use crate::transport::memory::QueueDefinition;
    use crate::transport::{BrokerPtr, Endpoint, MemoryBroker};

    async fn setup() -> (MemoryBroker, Connection) {
        let memory = MemoryBroker::new("QM1");
        memory.define_queue(QueueDefinition::local("APP.IN"));
        let broker: BrokerPtr = Arc::new(memory.clone());
        let connection = connect(broker, ConnectOptions::new(Endpoint::memory("QM1")))
            .await
            .unwrap();
        (memory, connection)
    }

    #[test]
    fn test_validate_open() {
        let ok = OpenOptions::default();
        assert!(validate_open("Q", DestinationKind::Queue, &ok).is_ok());
        assert!(validate_open("", DestinationKind::Queue, &ok).is_err());
        assert!(validate_open(&"Q".repeat(49), DestinationKind::Queue, &ok).is_err());
        assert!(validate_open("a/b", DestinationKind::Topic, &OpenOptions::dynamic("X")).is_err());
    }

    #[tokio::test]
    async fn test_open_unknown_queue() {
        let (_memory, connection) = setup().await;
        let err = connection
            .open_queue("NO.SUCH.QUEUE", OpenMode::Input)
            .await
            .unwrap_err();
        assert!(matches!(err, MqError::Open(OpenError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_open_and_close() {
        let (memory, connection) = setup().await;
        let destination = connection
            .open_queue("APP.IN", OpenMode::Output)
            .await
            .unwrap();
        assert_eq!(destination.name(), "APP.IN");
        assert_eq!(destination.kind(), DestinationKind::Queue);
        assert_eq!(connection.inquire_queue("APP.IN").await.unwrap().open_output_count, 1);

        destination.close(CloseOptions::default()).await.unwrap();
        assert_eq!(connection.inquire_queue("APP.IN").await.unwrap().open_output_count, 0);
        assert!(memory.queue_exists("APP.IN"));
    }

    #[tokio::test]
    async fn test_temporary_dynamic_queue_removed_on_close() {
        let (memory, connection) = setup().await;
        let reply = connection
            .open(
                DEFAULT_MODEL_QUEUE,
                DestinationKind::Queue,
                OpenMode::Input,
                OpenOptions::dynamic("APP.REPLY.*"),
            )
            .await
            .unwrap();
        let name = reply.name();
        assert!(name.starts_with("APP.REPLY."));
        assert_eq!(reply.dynamic(), Some(DynamicLifetime::Temporary));
        assert!(memory.queue_exists(&name));

        reply.close(CloseOptions::default()).await.unwrap();
        assert!(!memory.queue_exists(&name));
    }

    #[tokio::test]
    async fn test_permanent_dynamic_queue_delete_requires_empty_or_purge() {
        let (memory, connection) = setup().await;
        let open_durable = || {
            connection.open(
                DURABLE_MODEL_QUEUE,
                DestinationKind::Queue,
                OpenMode::Input,
                OpenOptions::dynamic("APP.DURABLE.*"),
            )
        };

        let kept = open_durable().await.unwrap();
        let name = kept.name();
        kept.close(CloseOptions::default()).await.unwrap();
        assert!(memory.queue_exists(&name));

        let second = open_durable().await.unwrap();
        let second_name = second.name();
        memory.inject(&second_name, Message::text("left over")).unwrap();
        let err = second.close(CloseOptions::delete()).await.unwrap_err();
        assert!(matches!(err, MqError::QueueNotEmpty { .. }));

        let third = open_durable().await.unwrap();
        let third_name = third.name();
        memory.inject(&third_name, Message::text("left over")).unwrap();
        third.close(CloseOptions::delete_purge()).await.unwrap();
        assert!(!memory.queue_exists(&third_name));
    }

    #[tokio::test]
    async fn test_close_after_disconnect_is_not_connected() {
        let (_memory, connection) = setup().await;
        let destination = connection
            .open_queue("APP.IN", OpenMode::Input)
            .await
            .unwrap();
        connection.clone().disconnect().await.unwrap();
        let err = destination.close(CloseOptions::default()).await.unwrap_err();
        assert_eq!(err, MqError::NotConnected);
    }

    #[tokio::test]
    async fn test_close_on_broken_connection_invalidates_handle() {
        let (memory, connection) = setup().await;
        let destination = connection
            .open_queue("APP.IN", OpenMode::Input)
            .await
            .unwrap();
        let key = destination.key();
        let mut states = connection.state_changes();

        memory.sever_links();
        states
            .wait_for(|s| matches!(s, crate::ConnectionState::Broken(_)))
            .await
            .unwrap();

        let err = destination.close(CloseOptions::default()).await.unwrap_err();
        assert!(matches!(err, MqError::ConnectionLost(_)));
        assert!(!connection.inner().holds_object(key));
    }

    #[tokio::test]
    async fn test_dropped_handle_releases_exclusive_input() {
        let (_memory, connection) = setup().await;
        let exclusive = connection
            .open_queue("APP.IN", OpenMode::InputExclusive)
            .await
            .unwrap();
        let key = exclusive.key();
        drop(exclusive);

        for _ in 0..50 {
            if !connection.inner().holds_object(key) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(!connection.inner().holds_object(key));
        assert_eq!(connection.inquire_queue("APP.IN").await.unwrap().open_input_count, 0);

        let reopened = connection
            .open_queue("APP.IN", OpenMode::InputExclusive)
            .await
            .unwrap();
        reopened.close(CloseOptions::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_handle_is_not_closed_again_on_drop() {
        let (_memory, connection) = setup().await;
        let first = connection
            .open_queue("APP.IN", OpenMode::Input)
            .await
            .unwrap();
        let second = connection
            .open_queue("APP.IN", OpenMode::Input)
            .await
            .unwrap();
        first.close(CloseOptions::default()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(connection.inner().holds_object(second.key()));
        assert_eq!(connection.inquire_queue("APP.IN").await.unwrap().open_input_count, 1);
    }

    #[tokio::test]
    async fn test_exclusive_input() {
        let (_memory, connection) = setup().await;
        let _exclusive = connection
            .open_queue("APP.IN", OpenMode::InputExclusive)
            .await
            .unwrap();
        let err = connection
            .open_queue("APP.IN", OpenMode::Input)
            .await
            .unwrap_err();
        assert!(matches!(err, MqError::Open(OpenError::InUse { .. })));
    }
}
