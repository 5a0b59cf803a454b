//! Logging setup for the client and its command-line tool
//!
//! Settings come from the `[logging]` section of the client configuration.
//! `LOG_LEVEL`, `LOG_FORMAT` and `LOG_SPANS` override that section for one
//! run, and `RUST_LOG` replaces the whole filter.
//!
//! The client logs under `mq_connection`, `mq_engine` and `mq_admin`. The
//! in-process queue manager logs under `mq_broker` at its own level, so that
//! turning the client up to `debug` does not also turn up every queue
//! operation the broker performs.
//!
//! ```bash
//! LOG_FORMAT=pretty LOG_LEVEL=debug mqclient smoke
//! RUST_LOG=mq_connection=trace,mq_broker=debug mqclient admin ping
//! ```

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt as stdfmt;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(format!("unknown log level '{s}'")),
        }
    }
}

impl stdfmt::Display for LogLevel {
    fn fmt(&self, f: &mut stdfmt::Formatter<'_>) -> stdfmt::Result {
        f.write_str(self.directive())
    }
}

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per event
    #[default]
    Json,
    Pretty,
    /// Single line per event, for terminals
    Compact,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            _ => Err(format!("unknown log format '{s}'")),
        }
    }
}

/// The `[logging]` configuration section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub format: LogFormat,
    /// Log span open and close events
    #[serde(default)]
    pub spans: bool,
    /// Level for the `mq_broker` target
    #[serde(default = "default_broker_level")]
    pub broker_level: LogLevel,
}

fn default_broker_level() -> LogLevel {
    LogLevel::Warn
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            format: LogFormat::default(),
            spans: false,
            broker_level: default_broker_level(),
        }
    }
}

impl LogSettings {
    /// Apply `LOG_LEVEL`, `LOG_FORMAT` and `LOG_SPANS` from the environment
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|name| env::var(name).ok())
    }

    /// Unparsable values leave the configured setting in place
    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(level) = lookup("LOG_LEVEL").and_then(|v| v.parse().ok()) {
            self.level = level;
        }
        if let Some(format) = lookup("LOG_FORMAT").and_then(|v| v.parse().ok()) {
            self.format = format;
        }
        if let Some(spans) = lookup("LOG_SPANS") {
            self.spans = spans.eq_ignore_ascii_case("true");
        }
        self
    }

    /// Filter directives used when `RUST_LOG` is not set
    pub fn directives(&self) -> String {
        format!("{},mq_broker={},tokio=warn", self.level, self.broker_level)
    }

    fn span_events(&self) -> FmtSpan {
        if self.spans {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

/// Install the global subscriber
///
/// Only the first call in a process takes effect.
pub fn init(settings: &LogSettings) {
    let filter = match env::var("RUST_LOG") {
        Ok(directives) => EnvFilter::new(directives),
        Err(_) => EnvFilter::new(settings.directives()),
    };
    let registry = tracing_subscriber::registry().with(filter);
    let spans = settings.span_events();

    let result = match settings.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_span_events(spans))
            .try_init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty().with_ansi(true).with_span_events(spans))
            .try_init(),
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_ansi(true).with_span_events(spans))
            .try_init(),
    };
    if let Err(err) = result {
        tracing::debug!(error = %err, "logging already initialized");
    }
}

/// [`init`] with default settings and environment overrides, for callers without a config file
pub fn init_from_env() {
    init(&LogSettings::default().with_env_overrides());
}

/// Span covering one connection's session and its reconnect supervisor
#[macro_export]
macro_rules! session_span {
    ($($field:tt)*) => {
        tracing::info_span!("mq_session", $($field)*)
    };
}

/// Span covering a commit or rollback
#[macro_export]
macro_rules! transaction_span {
    ($($field:tt)*) => {
        tracing::info_span!("mq_transaction", $($field)*)
    };
}

/// Span covering one admin command from request to parsed reply
#[macro_export]
macro_rules! admin_span {
    ($($field:tt)*) => {
        tracing::info_span!("mq_admin_command", $($field)*)
    };
}

pub use {admin_span, session_span, transaction_span};

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn overrides(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_default_directives_quiet_the_broker() {
        assert_eq!(
            LogSettings::default().directives(),
            "info,mq_broker=warn,tokio=warn"
        );
        let settings = LogSettings {
            level: LogLevel::Debug,
            broker_level: LogLevel::Trace,
            ..LogSettings::default()
        };
        assert_eq!(settings.directives(), "debug,mq_broker=trace,tokio=warn");
    }

    #[test]
    fn test_environment_overrides_configured_settings() {
        let configured = LogSettings {
            level: LogLevel::Warn,
            format: LogFormat::Compact,
            spans: false,
            broker_level: LogLevel::Error,
        };
        let settings = configured.with_overrides(overrides(&[
            ("LOG_LEVEL", "DEBUG"),
            ("LOG_FORMAT", "pretty"),
            ("LOG_SPANS", "True"),
        ]));
        assert_eq!(settings.level, LogLevel::Debug);
        assert_eq!(settings.format, LogFormat::Pretty);
        assert!(settings.spans);
        // no environment knob for the broker target
        assert_eq!(settings.broker_level, LogLevel::Error);
    }

    #[test]
    fn test_bad_overrides_keep_configured_values() {
        let configured = LogSettings {
            level: LogLevel::Trace,
            format: LogFormat::Pretty,
            spans: true,
            ..LogSettings::default()
        };
        let settings = configured.clone().with_overrides(overrides(&[
            ("LOG_LEVEL", "loud"),
            ("LOG_FORMAT", "xml"),
        ]));
        assert_eq!(settings, configured);

        let settings = configured.with_overrides(overrides(&[("LOG_SPANS", "yes")]));
        assert!(!settings.spans);
    }

    #[test]
    fn test_level_maps_to_tracing_level() {
        assert_eq!(Level::from(LogLevel::Warn), Level::WARN);
        assert_eq!("warning".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert_eq!(LogLevel::Trace.to_string(), "trace");
    }

    #[test]
    fn test_span_events_follow_setting() {
        assert_eq!(LogSettings::default().span_events(), FmtSpan::NONE);
        let spans = LogSettings {
            spans: true,
            ..LogSettings::default()
        };
        assert_eq!(spans.span_events(), FmtSpan::NEW | FmtSpan::CLOSE);
    }
}
