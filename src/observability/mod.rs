//! Observability
//!
//! Structured logging setup and the span macros used across the client.

pub mod logging;

pub use logging::{init, init_from_env, LogFormat, LogLevel, LogSettings};

pub use logging::{admin_span, session_span, transaction_span};
