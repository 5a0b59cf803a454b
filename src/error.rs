//! Error and warning types for queue-manager client operations
//!
//! Every failure maps to a numeric reason code (see [`reason`]) so that callers can
//! log outcomes uniformly and command-line wrappers can derive exit statuses.
//! Informational outcomes such as an accepted truncation are [`Warning`] values
//! returned alongside a successful result, never errors.

use crate::message::FormatError;
use crate::transaction::TransactionState;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Numeric reason codes reported by the broker and by the client library
pub mod reason {
    pub const NONE: i32 = 0;
    pub const ALREADY_CONNECTED: i32 = 2002;
    pub const BACKED_OUT: i32 = 2003;
    pub const CONNECTION_BROKEN: i32 = 2009;
    pub const GET_INHIBITED: i32 = 2016;
    pub const HCONN_ERROR: i32 = 2018;
    pub const HOBJ_ERROR: i32 = 2019;
    pub const MSG_TOO_BIG_FOR_Q: i32 = 2030;
    pub const NO_MSG_AVAILABLE: i32 = 2033;
    pub const NOT_AUTHORIZED: i32 = 2035;
    pub const OBJECT_IN_USE: i32 = 2042;
    pub const OPTIONS_ERROR: i32 = 2046;
    pub const PUT_INHIBITED: i32 = 2051;
    pub const Q_FULL: i32 = 2053;
    pub const Q_NOT_EMPTY: i32 = 2055;
    pub const Q_MGR_NOT_AVAILABLE: i32 = 2059;
    pub const TRUNCATED_MSG_ACCEPTED: i32 = 2079;
    pub const TRUNCATED_MSG_FAILED: i32 = 2080;
    pub const UNKNOWN_OBJECT_NAME: i32 = 2085;
    pub const FORMAT_ERROR: i32 = 2110;
    pub const NOT_CONVERTED: i32 = 2119;
    pub const UOW_IN_PROGRESS: i32 = 2128;
    pub const Q_MGR_QUIESCING: i32 = 2161;
    pub const UOW_NOT_AVAILABLE: i32 = 2255;
    pub const CMD_SERVER_NOT_AVAILABLE: i32 = 2402;
    pub const ENDPOINT_ERROR: i32 = 2538;
    pub const RECONNECTING: i32 = 2544;
    pub const RECONNECT_FAILED: i32 = 2548;
    pub const CALL_INTERRUPTED: i32 = 2549;
    pub const NO_SUBS_MATCHED: i32 = 2550;
    pub const COMMAND_FAILED: i32 = 3008;
    pub const PARAMETER_ERROR: i32 = 3014;
    pub const UNKNOWN_COMMAND: i32 = 3007;
    pub const OBJECT_ALREADY_EXISTS: i32 = 4001;
}

/// Completion code accompanying every reason code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionCode {
    Ok,
    Warning,
    Failed,
}

/// Informational outcome attached to an otherwise successful call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Warning {
    /// `connect` reused a live connection registered under the same client id
    AlreadyConnected,
    /// `get` returned a truncated prefix because the caller accepted truncation
    TruncatedMessageAccepted,
    /// A publication matched no subscription
    NoSubscribersMatched,
    /// A string payload could not be converted and was delivered as-is
    NotConverted,
}

impl Warning {
    pub fn reason_code(&self) -> i32 {
        match self {
            Warning::AlreadyConnected => reason::ALREADY_CONNECTED,
            Warning::TruncatedMessageAccepted => reason::TRUNCATED_MSG_ACCEPTED,
            Warning::NoSubscribersMatched => reason::NO_SUBS_MATCHED,
            Warning::NotConverted => reason::NOT_CONVERTED,
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Warning::AlreadyConnected => "already connected",
            Warning::TruncatedMessageAccepted => "truncated message accepted",
            Warning::NoSubscribersMatched => "no subscribers matched",
            Warning::NotConverted => "message data not converted",
        };
        write!(f, "{text} ({})", self.reason_code())
    }
}

/// Failures establishing a session
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConnectError {
    #[error("not authorized to connect as '{user}'")]
    Auth { user: String },
    #[error("endpoint {endpoint} unavailable: {reason}")]
    EndpointUnavailable { endpoint: String, reason: String },
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Failures opening a destination
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OpenError {
    #[error("destination '{name}' not found")]
    NotFound { name: String },
    #[error("access to '{name}' denied for user '{user}'")]
    AccessDenied { name: String, user: String },
    #[error("queue manager is quiescing")]
    Quiescing,
    #[error("destination '{name}' is in use by an exclusive opener")]
    InUse { name: String },
    #[error("invalid open options: {0}")]
    InvalidOptions(String),
}

/// Failures retrieving a message
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GetError {
    #[error("no message available")]
    NoMessageAvailable,
    #[error("message of {message_length} bytes does not fit buffer of {buffer_capacity} bytes")]
    Truncated {
        message_length: usize,
        buffer_capacity: usize,
    },
    #[error("unit of work was backed out")]
    BackedOut,
    #[error("get inhibited on '{name}'")]
    Inhibited { name: String },
    #[error("'{name}' is not open for input")]
    NotOpenForInput { name: String },
}

/// Failures sending a message
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PutError {
    #[error("unit of work was backed out")]
    BackedOut,
    #[error("call interrupted by connection loss; the message may or may not have been delivered")]
    CallInterrupted,
    #[error("put inhibited on '{name}'")]
    Inhibited { name: String },
    #[error("queue '{name}' is full (max depth {max_depth})")]
    QueueFull { name: String, max_depth: usize },
    #[error("message of {length} bytes exceeds maximum of {max} bytes")]
    MessageTooBig { length: usize, max: usize },
    #[error("'{name}' is not open for output")]
    NotOpenForOutput { name: String },
}

/// Main error type for client operations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MqError {
    #[error("connect failed: {0}")]
    Connect(#[from] ConnectError),

    #[error("open failed: {0}")]
    Open(#[from] OpenError),

    #[error("get failed: {0}")]
    Get(#[from] GetError),

    #[error("put failed: {0}")]
    Put(#[from] PutError),

    #[error("commit failed ({code}): {reason}")]
    CommitFailed { code: i32, reason: String },

    #[error("a transaction is already open on this connection")]
    TransactionAlreadyOpen,

    #[error("transaction is no longer open (state {state:?})")]
    TransactionFinished { state: TransactionState },

    #[error("transaction belongs to a different connection")]
    ForeignTransaction,

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("connection is reconnecting (waited {waited:?})")]
    Reconnecting { waited: Duration },

    #[error("not connected")]
    NotConnected,

    #[error("destination handle '{name}' is closed")]
    HandleClosed { name: String },

    #[error("queue '{name}' is not empty")]
    QueueNotEmpty { name: String },

    #[error("command server not available on '{queue}'")]
    CommandServerUnavailable { queue: String },

    #[error("admin command timed out after {0:?}")]
    AdminTimeout(Duration),

    #[error("invalid admin attribute '{name}': {reason}")]
    InvalidAttribute { name: String, reason: String },

    #[error("format error: {0}")]
    Format(#[from] FormatError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl MqError {
    /// Reason code for this failure
    pub fn reason_code(&self) -> i32 {
        match self {
            MqError::Connect(e) => match e {
                ConnectError::Auth { .. } => reason::NOT_AUTHORIZED,
                ConnectError::EndpointUnavailable { .. } => reason::Q_MGR_NOT_AVAILABLE,
                ConnectError::InvalidEndpoint(_) => reason::ENDPOINT_ERROR,
            },
            MqError::Open(e) => match e {
                OpenError::NotFound { .. } => reason::UNKNOWN_OBJECT_NAME,
                OpenError::AccessDenied { .. } => reason::NOT_AUTHORIZED,
                OpenError::Quiescing => reason::Q_MGR_QUIESCING,
                OpenError::InUse { .. } => reason::OBJECT_IN_USE,
                OpenError::InvalidOptions(_) => reason::OPTIONS_ERROR,
            },
            MqError::Get(e) => match e {
                GetError::NoMessageAvailable => reason::NO_MSG_AVAILABLE,
                GetError::Truncated { .. } => reason::TRUNCATED_MSG_FAILED,
                GetError::BackedOut => reason::BACKED_OUT,
                GetError::Inhibited { .. } => reason::GET_INHIBITED,
                GetError::NotOpenForInput { .. } => reason::HOBJ_ERROR,
            },
            MqError::Put(e) => match e {
                PutError::BackedOut => reason::BACKED_OUT,
                PutError::CallInterrupted => reason::CALL_INTERRUPTED,
                PutError::Inhibited { .. } => reason::PUT_INHIBITED,
                PutError::QueueFull { .. } => reason::Q_FULL,
                PutError::MessageTooBig { .. } => reason::MSG_TOO_BIG_FOR_Q,
                PutError::NotOpenForOutput { .. } => reason::HOBJ_ERROR,
            },
            MqError::CommitFailed { code, .. } => *code,
            MqError::TransactionAlreadyOpen => reason::UOW_IN_PROGRESS,
            MqError::TransactionFinished { .. } => reason::UOW_NOT_AVAILABLE,
            MqError::ForeignTransaction => reason::UOW_NOT_AVAILABLE,
            MqError::ConnectionLost(_) => reason::CONNECTION_BROKEN,
            MqError::Reconnecting { .. } => reason::RECONNECTING,
            MqError::NotConnected => reason::HCONN_ERROR,
            MqError::HandleClosed { .. } => reason::HOBJ_ERROR,
            MqError::QueueNotEmpty { .. } => reason::Q_NOT_EMPTY,
            MqError::CommandServerUnavailable { .. } => reason::CMD_SERVER_NOT_AVAILABLE,
            MqError::AdminTimeout(_) => reason::NO_MSG_AVAILABLE,
            MqError::InvalidAttribute { .. } => reason::PARAMETER_ERROR,
            MqError::Format(_) => reason::FORMAT_ERROR,
            MqError::InvalidArgument(_) => reason::OPTIONS_ERROR,
        }
    }

    /// Every error carries a failed completion code; warnings travel separately
    pub fn completion_code(&self) -> CompletionCode {
        CompletionCode::Failed
    }

    /// Fatal errors leave the connection unusable
    pub fn is_fatal(&self) -> bool {
        matches!(self, MqError::ConnectionLost(_) | MqError::NotConnected)
    }

    /// Everything that is not fatal may be retried by the caller
    pub fn is_retryable(&self) -> bool {
        !self.is_fatal()
    }

    /// Outcomes where the effect at the broker is unknown and a retry may duplicate
    pub fn is_ambiguous(&self) -> bool {
        matches!(
            self,
            MqError::Put(PutError::CallInterrupted) | MqError::CommitFailed { .. }
        )
    }

    /// Whether this is the plain "queue was empty" outcome of a get
    pub fn is_no_message(&self) -> bool {
        matches!(self, MqError::Get(GetError::NoMessageAvailable))
    }

    /// Process exit status for command-line callers: never zero for an error
    pub fn exit_code(&self) -> i32 {
        match self.reason_code() & 0xff {
            0 => 1,
            code => code,
        }
    }

    pub fn connection_lost<S: Into<String>>(reason: S) -> Self {
        Self::ConnectionLost(sanitize_error_message(&reason.into()))
    }

    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument(message.into())
    }
}

/// Result type for client operations
pub type MqResult<T> = Result<T, MqError>;

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|passwd|token|secret)[=:]\s*\S+").expect("secret pattern is valid")
});

static URL_USERINFO_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"://([^:/@\s]+):[^@/\s]+@").expect("userinfo pattern is valid")
});

const MAX_ERROR_TEXT: usize = 500;

/// Redact credentials from broker-supplied or endpoint text before it reaches
/// errors and logs, and cap its length
pub fn sanitize_error_message(message: &str) -> String {
    let sanitized = SECRET_PATTERN.replace_all(message, "${1}=***");
    let mut sanitized = URL_USERINFO_PATTERN
        .replace_all(&sanitized, "://${1}:***@")
        .to_string();

    if sanitized.len() > MAX_ERROR_TEXT {
        let suffix = "...[truncated]";
        let mut cut = MAX_ERROR_TEXT - suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], suffix);
    }

    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes_for_taxonomy() {
        assert_eq!(
            MqError::from(ConnectError::Auth {
                user: "app".into()
            })
            .reason_code(),
            reason::NOT_AUTHORIZED
        );
        assert_eq!(
            MqError::from(GetError::NoMessageAvailable).reason_code(),
            reason::NO_MSG_AVAILABLE
        );
        assert_eq!(
            MqError::from(PutError::CallInterrupted).reason_code(),
            reason::CALL_INTERRUPTED
        );
        assert_eq!(
            MqError::CommandServerUnavailable {
                queue: "SYSTEM.ADMIN.COMMAND.QUEUE".into()
            }
            .reason_code(),
            reason::CMD_SERVER_NOT_AVAILABLE
        );
        assert_eq!(
            MqError::TransactionAlreadyOpen.reason_code(),
            reason::UOW_IN_PROGRESS
        );
    }

    #[test]
    fn test_fatal_and_retryable_classification() {
        let lost = MqError::connection_lost("link down");
        assert!(lost.is_fatal());
        assert!(!lost.is_retryable());

        let interrupted = MqError::from(PutError::CallInterrupted);
        assert!(interrupted.is_retryable());
        assert!(interrupted.is_ambiguous());

        let empty = MqError::from(GetError::NoMessageAvailable);
        assert!(empty.is_retryable());
        assert!(!empty.is_ambiguous());
        assert!(empty.is_no_message());
    }

    #[test]
    fn test_exit_code_is_never_zero() {
        for err in [
            MqError::NotConnected,
            MqError::from(GetError::NoMessageAvailable),
            MqError::CommitFailed {
                code: 0,
                reason: "unknown".into(),
            },
        ] {
            assert_ne!(err.exit_code(), 0, "{err}");
        }
        assert_eq!(
            MqError::from(GetError::NoMessageAvailable).exit_code(),
            reason::NO_MSG_AVAILABLE & 0xff
        );
    }

    #[test]
    fn test_warning_reason_codes() {
        assert_eq!(
            Warning::AlreadyConnected.reason_code(),
            reason::ALREADY_CONNECTED
        );
        assert_eq!(
            Warning::TruncatedMessageAccepted.reason_code(),
            reason::TRUNCATED_MSG_ACCEPTED
        );
        assert!(Warning::NoSubscribersMatched.to_string().contains("2550"));
    }

    #[test]
    fn test_sanitize_redacts_secrets() {
        let sanitized = sanitize_error_message("auth failed: password=hunter2 token: abc");
        assert!(!sanitized.contains("hunter2"));
        assert!(!sanitized.contains("abc"));
        assert!(sanitized.contains("password=***"));
    }

    #[test]
    fn test_sanitize_redacts_url_userinfo() {
        let sanitized = sanitize_error_message("cannot reach mq://app:s3cret@broker:1414/QM1");
        assert!(!sanitized.contains("s3cret"));
        assert!(sanitized.contains("mq://app:***@broker:1414/QM1"));
    }

    #[test]
    fn test_sanitize_truncates_long_text() {
        let sanitized = sanitize_error_message(&"x".repeat(900));
        assert!(sanitized.len() <= MAX_ERROR_TEXT);
        assert!(sanitized.ends_with("...[truncated]"));

        let exact = "y".repeat(MAX_ERROR_TEXT);
        assert_eq!(sanitize_error_message(&exact), exact);
    }

    #[test]
    fn test_connection_lost_constructor_sanitizes() {
        let err = MqError::connection_lost("session dropped secret=xyz");
        assert!(!err.to_string().contains("xyz"));
    }
}
