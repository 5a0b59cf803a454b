//! Get and put
//!
//! Puts and gets run on a [`Destination`] outside any unit of work; the
//! transaction coordinator routes the same calls under syncpoint.

pub mod async_put;

pub use async_put::AsyncPutStatus;

use crate::connection::client::Interruption;
use crate::connection::Connection;
use crate::destination::{Destination, OpenMode};
use crate::error::{MqError, MqResult, PutError, Warning};
use crate::message::{BoundedBuffer, CorrelationId, Message, MessageId, FORMAT_STRING};
use crate::transport::{GetRequest, MatchFilter, PutRequest, WaitTimeout};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// What a get does with a message larger than the caller's buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TruncationPolicy {
    /// Leave the message queued and fail with `GetError::Truncated`
    #[default]
    Fail,
    /// Remove the message and return the part that fits
    Accept,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOptions {
    /// Return once the message is queued locally; see [`Connection::drain_async_status`]
    pub asynchronous: bool,
    /// Assign a fresh message id
    pub new_message_id: bool,
    /// Assign a fresh correlation id
    pub new_correlation_id: bool,
}

impl Default for PutOptions {
    fn default() -> Self {
        Self {
            asynchronous: false,
            new_message_id: true,
            new_correlation_id: false,
        }
    }
}

impl PutOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn asynchronous(mut self) -> Self {
        self.asynchronous = true;
        self
    }

    /// Keep the message id already set on the message
    pub fn keep_message_id(mut self) -> Self {
        self.new_message_id = false;
        self
    }

    pub fn new_correlation_id(mut self) -> Self {
        self.new_correlation_id = true;
        self
    }
}

/// Result of a put
#[derive(Debug, Clone, PartialEq)]
pub struct PutOutcome {
    pub message_id: MessageId,
    pub correlation_id: CorrelationId,
    /// Set by the broker; absent for async puts
    pub put_timestamp: Option<DateTime<Utc>>,
    pub warning: Option<Warning>,
    /// Queued for the async worker rather than sent
    pub queued: bool,
}

/// Options for a get; unset fields take the connection's defaults
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetOptions {
    pub wait: Option<WaitTimeout>,
    pub filter: MatchFilter,
    pub truncation: Option<TruncationPolicy>,
    pub buffer_capacity: Option<usize>,
    /// Browse from the start of the queue again
    pub restart_browse: bool,
    /// Check that string payloads are valid text
    pub convert: bool,
}

impl GetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn no_wait() -> Self {
        Self::default().wait(WaitTimeout::NoWait)
    }

    pub fn wait(mut self, wait: WaitTimeout) -> Self {
        self.wait = Some(wait);
        self
    }

    pub fn wait_for(self, wait: Duration) -> Self {
        self.wait(WaitTimeout::Bounded(wait))
    }

    pub fn filter(mut self, filter: MatchFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn truncation(mut self, truncation: TruncationPolicy) -> Self {
        self.truncation = Some(truncation);
        self
    }

    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = Some(capacity);
        self
    }

    pub fn restart_browse(mut self) -> Self {
        self.restart_browse = true;
        self
    }

    pub fn convert(mut self) -> Self {
        self.convert = true;
        self
    }
}

/// A retrieved message
#[derive(Debug, Clone)]
pub struct Received {
    pub message: Message,
    /// The payload was cut to the buffer capacity
    pub truncated: bool,
    /// Payload length before truncation
    pub original_length: usize,
    pub warning: Option<Warning>,
}

fn prepare_put(message: &mut Message, options: &PutOptions) {
    if options.new_message_id || message.headers.message_id.is_none() {
        message.headers.message_id = MessageId::generate();
    }
    if options.new_correlation_id {
        message.headers.correlation_id = CorrelationId::generate();
    }
}

/// Put on a destination; `syncpoint` is the session generation of the enclosing unit of work
pub(crate) async fn put_message(
    destination: &Destination,
    mut message: Message,
    options: PutOptions,
    syncpoint: Option<u64>,
) -> MqResult<PutOutcome> {
    if destination.mode() != OpenMode::Output {
        return Err(PutError::NotOpenForOutput {
            name: destination.name(),
        }
        .into());
    }
    let inner = destination.connection()?;
    let name = destination.name();
    prepare_put(&mut message, &options);
    let message_id = message.message_id();
    let correlation_id = message.correlation_id();

    if options.asynchronous {
        if syncpoint.is_some() {
            return Err(MqError::invalid_argument(
                "asynchronous puts cannot join a transaction",
            ));
        }
        async_put::submit(&inner, destination.key(), name, message).await?;
        return Ok(PutOutcome {
            message_id,
            correlation_id,
            put_timestamp: None,
            warning: None,
            queued: true,
        });
    }

    let interruption = match syncpoint {
        Some(_) => Interruption::PutBackedOut,
        None => Interruption::PutInterrupted,
    };
    let request = PutRequest {
        syncpoint: syncpoint.is_some(),
    };
    let receipt = inner
        .with_object(
            destination.key(),
            &name,
            interruption,
            syncpoint,
            |broker, session, object| {
                let message = message.clone();
                async move { broker.put(session, object, message, request).await }
            },
        )
        .await?;
    trace!(target: "mq_engine", %name, message_id = %receipt.message_id, syncpoint = request.syncpoint, "message put");

    Ok(PutOutcome {
        message_id: receipt.message_id,
        correlation_id,
        put_timestamp: Some(receipt.put_timestamp),
        warning: receipt.warning,
        queued: false,
    })
}

/// Get from a destination; `syncpoint` as for [`put_message`]
pub(crate) async fn get_message(
    destination: &Destination,
    options: GetOptions,
    syncpoint: Option<u64>,
) -> MqResult<Received> {
    let inner = destination.connection()?;
    let name = destination.name();
    let defaults = &inner.options.defaults;
    let wait = options.wait.unwrap_or(defaults.wait);
    let truncation = options.truncation.unwrap_or(defaults.truncation);
    let capacity = options.buffer_capacity.or(defaults.buffer_capacity);

    let browse = match destination.mode() {
        OpenMode::Browse if syncpoint.is_some() => {
            return Err(MqError::invalid_argument(
                "browsing cannot join a transaction",
            ))
        }
        OpenMode::Browse => Some(destination.browse_position(options.restart_browse)),
        _ => None,
    };

    let deadline = match wait {
        WaitTimeout::Bounded(wait) => Some(Instant::now() + wait),
        WaitTimeout::NoWait | WaitTimeout::Unlimited => None,
    };
    let interruption = match syncpoint {
        Some(_) => Interruption::GetBackedOut,
        None => Interruption::Retry,
    };

    let call = inner.with_object(
        destination.key(),
        &name,
        interruption,
        syncpoint,
        |broker, session, object| {
            // a retry after reconnect only waits out what is left
            let wait = match deadline {
                Some(deadline) => {
                    WaitTimeout::Bounded(deadline.saturating_duration_since(Instant::now()))
                }
                None => wait,
            };
            let request = GetRequest {
                filter: options.filter,
                wait,
                syncpoint: syncpoint.is_some(),
                browse,
                buffer_capacity: capacity,
                accept_truncated: truncation == TruncationPolicy::Accept,
            };
            async move { broker.get(session, object, request).await }
        },
    );
    let delivery = inner.until_shutdown(call).await?;

    if browse.is_some() {
        destination.advance_browse_cursor(delivery.sequence);
    }
    let received = finish_delivery(delivery.message, capacity, options.convert);
    debug!(target: "mq_engine", %name, message_id = %received.message.message_id(), truncated = received.truncated, "message received");
    Ok(received)
}

/// Apply the caller's buffer and conversion checks to a delivered message
fn finish_delivery(mut message: Message, capacity: Option<usize>, convert: bool) -> Received {
    let original_length = message.payload.len();
    let mut warning = None;
    let mut truncated = false;

    if let Some(capacity) = capacity {
        let mut buffer = BoundedBuffer::with_capacity(capacity);
        buffer.fill(&message.payload);
        if buffer.is_truncated() {
            truncated = true;
            warning = Some(Warning::TruncatedMessageAccepted);
            message.payload = buffer.freeze();
        }
    }

    if convert && warning.is_none() && message.headers.format == FORMAT_STRING {
        // an incomplete trailing character left by truncation is not an error
        if let Err(err) = std::str::from_utf8(&message.payload) {
            if err.error_len().is_some() {
                warning = Some(Warning::NotConverted);
            }
        }
    }

    Received {
        message,
        truncated,
        original_length,
        warning,
    }
}

impl Destination {
    /// Put a message outside any transaction
    pub async fn put(&self, message: Message, options: PutOptions) -> MqResult<PutOutcome> {
        put_message(self, message, options, None).await
    }

    /// Get a message outside any transaction
    ///
    /// In browse mode the message stays on the queue and the handle's cursor
    /// moves past it.
    pub async fn get(&self, options: GetOptions) -> MqResult<Received> {
        get_message(self, options, None).await
    }
}

impl Connection {
    /// Wait for outstanding async puts and return their tally, resetting it
    pub async fn drain_async_status(&self) -> AsyncPutStatus {
        async_put::drain(self.inner()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Persistence;

    #[test]
    fn test_put_options_default() {
        let options = PutOptions::default();
        assert!(options.new_message_id);
        assert!(!options.asynchronous);
        assert!(!options.new_correlation_id);
        assert!(!PutOptions::new().keep_message_id().new_message_id);
    }

    #[test]
    fn test_prepare_put_assigns_ids() {
        let fixed = MessageId::generate();
        let mut message = Message::text("x").with_message_id(fixed);
        prepare_put(&mut message, &PutOptions::new());
        assert_ne!(message.message_id(), fixed);

        let mut kept = Message::text("x").with_message_id(fixed);
        prepare_put(&mut kept, &PutOptions::new().keep_message_id());
        assert_eq!(kept.message_id(), fixed);

        let mut blank = Message::text("x");
        prepare_put(&mut blank, &PutOptions::new().keep_message_id().new_correlation_id());
        assert!(!blank.message_id().is_none());
        assert!(!blank.correlation_id().is_none());
    }

    #[test]
    fn test_finish_delivery_truncates() {
        let message = Message::text("0123456789").with_persistence(Persistence::Persistent);
        let received = finish_delivery(message, Some(4), false);
        assert!(received.truncated);
        assert_eq!(received.original_length, 10);
        assert_eq!(&received.message.payload[..], b"0123");
        assert_eq!(received.warning, Some(Warning::TruncatedMessageAccepted));
        assert!(received.message.is_persistent());
    }

    #[test]
    fn test_finish_delivery_fits() {
        let received = finish_delivery(Message::text("hello"), Some(5), true);
        assert!(!received.truncated);
        assert_eq!(received.warning, None);
    }

    #[test]
    fn test_convert_flags_invalid_text() {
        let mut message = Message::new(vec![0x66, 0xff, 0x6f]);
        message.headers.format = FORMAT_STRING.to_string();
        let received = finish_delivery(message.clone(), None, true);
        assert_eq!(received.warning, Some(Warning::NotConverted));

        let unchecked = finish_delivery(message, None, false);
        assert_eq!(unchecked.warning, None);
    }

    #[test]
    fn test_convert_tolerates_cut_character() {
        // "é" is two bytes; cutting after the first leaves an incomplete sequence
        let received = finish_delivery(Message::text("aé"), Some(2), true);
        assert!(received.truncated);
        assert_eq!(received.warning, Some(Warning::TruncatedMessageAccepted));

        let mut cut = Message::new(vec![b'a', 0xc3]);
        cut.headers.format = FORMAT_STRING.to_string();
        assert_eq!(finish_delivery(cut, None, true).warning, None);
    }

    #[test]
    fn test_get_options_builder() {
        let options = GetOptions::new()
            .wait_for(Duration::from_secs(5))
            .truncation(TruncationPolicy::Accept)
            .buffer_capacity(16)
            .convert();
        assert_eq!(
            options.wait,
            Some(WaitTimeout::Bounded(Duration::from_secs(5)))
        );
        assert_eq!(options.truncation, Some(TruncationPolicy::Accept));
        assert_eq!(options.buffer_capacity, Some(16));
        assert!(options.convert);
        assert_eq!(GetOptions::no_wait().wait, Some(WaitTimeout::NoWait));
    }
}
