//! Message headers and the envelope type
//!
//! A [`Message`] is plain data. Identity is carried by [`MessageId`] and
//! [`CorrelationId`]; two messages are never compared as a whole.

use super::properties::Properties;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use std::ops::BitOr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// Length in bytes of message and correlation identifiers
pub const ID_LENGTH: usize = 24;

/// Highest message priority
pub const MAX_PRIORITY: u8 = 9;

/// Payload has no declared format
pub const FORMAT_NONE: &str = "";
/// Payload is character data
pub const FORMAT_STRING: &str = "MQSTR";
/// Payload is an administrative command or reply
pub const FORMAT_ADMIN: &str = "MQADMIN";

static ID_SEQUENCE: AtomicU64 = AtomicU64::new(1);

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name([u8; ID_LENGTH]);

        impl $name {
            /// The all-zero identifier, meaning "not set"
            pub const NONE: Self = Self([0u8; ID_LENGTH]);

            /// Generate a fresh identifier: a random UUID followed by a process-wide sequence
            pub fn generate() -> Self {
                let mut bytes = [0u8; ID_LENGTH];
                bytes[..16].copy_from_slice(Uuid::new_v4().as_bytes());
                let seq = ID_SEQUENCE.fetch_add(1, Ordering::Relaxed);
                bytes[16..].copy_from_slice(&seq.to_be_bytes());
                Self(bytes)
            }

            pub const fn from_bytes(bytes: [u8; ID_LENGTH]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
                &self.0
            }

            pub fn is_none(&self) -> bool {
                self.0 == [0u8; ID_LENGTH]
            }

            pub fn to_hex(&self) -> String {
                self.0.iter().map(|b| format!("{b:02x}")).collect()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }
    };
}

define_id!(
    /// Broker-unique identifier of a message
    MessageId
);

define_id!(
    /// Application-chosen identifier linking a reply to its request
    CorrelationId
);

impl From<MessageId> for CorrelationId {
    fn from(id: MessageId) -> Self {
        CorrelationId(id.0)
    }
}

/// Whether a message survives a queue manager restart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Persistence {
    #[default]
    NotPersistent,
    Persistent,
}

/// Kind of message, used by request/reply patterns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageType {
    Request,
    Reply,
    Report,
    #[default]
    Datagram,
}

impl MessageType {
    pub(crate) fn code(self) -> u8 {
        match self {
            MessageType::Request => 1,
            MessageType::Reply => 2,
            MessageType::Report => 4,
            MessageType::Datagram => 8,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(MessageType::Request),
            2 => Some(MessageType::Reply),
            4 => Some(MessageType::Report),
            8 => Some(MessageType::Datagram),
            _ => None,
        }
    }
}

/// Report messages requested by the sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReportOptions(u32);

impl ReportOptions {
    pub const NONE: Self = Self(0);
    pub const EXCEPTION: Self = Self(0x0100_0000);
    pub const EXPIRATION: Self = Self(0x0020_0000);
    pub const CONFIRM_ON_ARRIVAL: Self = Self(0x0000_0100);
    pub const CONFIRM_ON_DELIVERY: Self = Self(0x0000_0800);
    pub const PASS_MSG_ID: Self = Self(0x0000_0080);
    pub const PASS_CORREL_ID: Self = Self(0x0000_0040);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ReportOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Fixed header fields of a message
#[derive(Debug, Clone, Default)]
pub struct Headers {
    pub message_id: MessageId,
    pub correlation_id: CorrelationId,
    pub format: String,
    pub persistence: Persistence,
    pub report: ReportOptions,
    pub message_type: MessageType,
    pub priority: u8,
    /// Time the message may live on a queue; `None` never expires
    pub expiry: Option<Duration>,
    pub reply_to: Option<String>,
    /// Set by the broker when the message is accepted
    pub put_timestamp: Option<DateTime<Utc>>,
    /// Number of times a transactional get of this message was backed out
    pub backout_count: u32,
}

/// A message: headers, properties and an opaque payload
///
/// The payload may contain zero bytes and is never interpreted except by the
/// `convert` get option for [`FORMAT_STRING`] messages.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub headers: Headers,
    pub properties: Properties,
    pub payload: Bytes,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }

    /// Character-data message with the string format tag
    pub fn text(text: impl Into<String>) -> Self {
        let mut message = Self::new(Bytes::from(text.into()));
        message.headers.format = FORMAT_STRING.to_string();
        message
    }

    pub fn with_persistence(mut self, persistence: Persistence) -> Self {
        self.headers.persistence = persistence;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.headers.correlation_id = correlation_id;
        self
    }

    pub fn with_message_id(mut self, message_id: MessageId) -> Self {
        self.headers.message_id = message_id;
        self
    }

    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.headers.reply_to = Some(queue.into());
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.headers.format = format.into();
        self
    }

    pub fn with_type(mut self, message_type: MessageType) -> Self {
        self.headers.message_type = message_type;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.headers.priority = priority;
        self
    }

    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.headers.expiry = Some(expiry);
        self
    }

    pub fn with_report(mut self, report: ReportOptions) -> Self {
        self.headers.report = report;
        self
    }

    pub fn message_id(&self) -> MessageId {
        self.headers.message_id
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.headers.correlation_id
    }

    pub fn is_persistent(&self) -> bool {
        self.headers.persistence == Persistence::Persistent
    }

    /// Payload as UTF-8 text, if it is valid UTF-8
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
