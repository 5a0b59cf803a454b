//! Message envelope: headers, typed properties, opaque payload and the binary codec

pub mod buffer;
pub mod codec;
pub mod envelope;
pub mod properties;

pub use buffer::{BoundedBuffer, Fill};
pub use codec::FormatError;
pub use envelope::{
    CorrelationId, Headers, Message, MessageId, MessageType, Persistence, ReportOptions,
    FORMAT_ADMIN, FORMAT_NONE, FORMAT_STRING, ID_LENGTH, MAX_PRIORITY,
};
pub use properties::{Properties, PropertyValue};
