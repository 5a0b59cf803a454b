//! Administrative commands
//!
//! Admin requests are messages: a structured request goes to the queue
//! manager's command queue with a temporary reply queue named in its reply-to
//! field, and the command server answers with one or more correlated replies.

pub mod catalog;
pub mod command;
pub mod engine;

pub use catalog::{ParamDef, ParamKind, ParameterCatalog, MAX_OBJECT_NAME};
pub use command::{
    AdminFailure, AdminReply, AdminRequest, AdminResult, AttrValue, AttributeSet, CommandCode,
    ReplyError,
};
pub use engine::{AdminEngine, AdminOptions, AdminPhase};

/// Queue the command server reads requests from
pub const COMMAND_QUEUE: &str = "SYSTEM.ADMIN.COMMAND.QUEUE";

/// Model for temporary dynamic queues
pub const DEFAULT_MODEL_QUEUE: &str = "SYSTEM.DEFAULT.MODEL.QUEUE";

/// Model for permanent dynamic queues
pub const DURABLE_MODEL_QUEUE: &str = "SYSTEM.DURABLE.MODEL.QUEUE";
