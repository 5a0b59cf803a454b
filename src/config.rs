//! Client configuration
//!
//! A TOML file with `[connection]`, `[reconnect]`, `[operations]`, `[admin]`,
//! `[logging]` and `[embedded]` sections. Only the endpoint is required. Credentials are
//! never stored in the file: it names the environment variables holding them.

use crate::admin::{AdminOptions, COMMAND_QUEUE, DEFAULT_MODEL_QUEUE};
use crate::connection::{
    Backpressure, ConnectOptions, OperationDefaults, ReconnectConfig, ReconnectPolicy,
};
use crate::engine::TruncationPolicy;
use crate::observability::LogSettings;
use crate::transport::memory::QueueDefinition;
use crate::transport::{Credentials, Endpoint, WaitTimeout};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    pub connection: ConnectionSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub operations: OperationsSection,
    #[serde(default)]
    pub admin: AdminSection,
    #[serde(default)]
    pub logging: LogSettings,
    /// Queue manager to run in-process for the command-line tool
    #[serde(default)]
    pub embedded: Option<EmbeddedSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionSection {
    /// `mq://host[:port]/QMGR` or `memory://QMGR`
    pub endpoint: String,
    #[serde(default)]
    pub alternate_endpoints: Vec<String>,
    /// Environment variable containing the user name
    pub username_env: Option<String>,
    /// Environment variable containing the password
    pub password_env: Option<String>,
    pub client_id: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackpressureMode {
    #[default]
    Queue,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default)]
    pub policy: ReconnectPolicy,
    /// Unlimited when absent
    pub max_attempts: Option<u32>,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: Vec<u64>,
    #[serde(default = "default_sustained_delay")]
    pub sustained_delay_ms: u64,
    #[serde(default)]
    pub backpressure: BackpressureMode,
    /// How long a queued operation waits for the reconnect
    #[serde(default = "default_backpressure_timeout")]
    pub backpressure_timeout_secs: u64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            policy: ReconnectPolicy::Disabled,
            max_attempts: None,
            backoff_ms: default_backoff_ms(),
            sustained_delay_ms: default_sustained_delay(),
            backpressure: BackpressureMode::Queue,
            backpressure_timeout_secs: default_backpressure_timeout(),
        }
    }
}

fn default_backoff_ms() -> Vec<u64> {
    ReconnectConfig::default().backoff_pattern
}

fn default_sustained_delay() -> u64 {
    ReconnectConfig::default().sustained_delay
}

fn default_backpressure_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationsSection {
    /// Default get wait in milliseconds; 0 returns at once
    #[serde(default)]
    pub wait_ms: u64,
    /// Wait without limit when the caller does not say otherwise
    #[serde(default)]
    pub wait_unlimited: bool,
    #[serde(default)]
    pub truncation: TruncationPolicy,
    pub buffer_capacity: Option<usize>,
    #[serde(default = "default_async_put_queue")]
    pub async_put_queue: usize,
}

impl Default for OperationsSection {
    fn default() -> Self {
        Self {
            wait_ms: 0,
            wait_unlimited: false,
            truncation: TruncationPolicy::Fail,
            buffer_capacity: None,
            async_put_queue: default_async_put_queue(),
        }
    }
}

fn default_async_put_queue() -> usize {
    OperationDefaults::default().async_put_queue
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdminSection {
    #[serde(default = "default_command_queue")]
    pub command_queue: String,
    #[serde(default = "default_model_queue")]
    pub model_queue: String,
    #[serde(default = "default_reply_prefix")]
    pub reply_prefix: String,
    #[serde(default = "default_admin_timeout")]
    pub timeout_secs: u64,
}

impl Default for AdminSection {
    fn default() -> Self {
        Self {
            command_queue: default_command_queue(),
            model_queue: default_model_queue(),
            reply_prefix: default_reply_prefix(),
            timeout_secs: default_admin_timeout(),
        }
    }
}

fn default_command_queue() -> String {
    COMMAND_QUEUE.to_string()
}

fn default_model_queue() -> String {
    DEFAULT_MODEL_QUEUE.to_string()
}

fn default_reply_prefix() -> String {
    crate::admin::engine::DEFAULT_REPLY_PREFIX.to_string()
}

fn default_admin_timeout() -> u64 {
    crate::admin::engine::DEFAULT_ADMIN_TIMEOUT.as_secs()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddedSection {
    pub queue_manager: String,
    #[serde(default)]
    pub queues: Vec<EmbeddedQueue>,
}

/// A local queue defined when the embedded queue manager starts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddedQueue {
    pub name: String,
    pub max_depth: Option<usize>,
    pub max_message_length: Option<usize>,
    pub backout_threshold: Option<u32>,
    pub backout_requeue: Option<String>,
}

impl EmbeddedQueue {
    pub fn definition(&self) -> QueueDefinition {
        let mut definition = QueueDefinition::local(&self.name);
        if let Some(depth) = self.max_depth {
            definition = definition.with_max_depth(depth);
        }
        if let Some(length) = self.max_message_length {
            definition = definition.with_max_message_length(length);
        }
        if let (Some(threshold), Some(requeue)) = (self.backout_threshold, &self.backout_requeue) {
            definition = definition.with_backout(threshold, requeue.as_str());
        }
        definition
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check endpoints, backoff and embedded queue names
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.endpoints()?;

        if self.connection.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "connect_timeout_secs must be positive".to_string(),
            ));
        }
        if self.reconnect.policy.is_enabled() {
            if self.reconnect.max_attempts == Some(0) {
                return Err(ConfigError::InvalidConfig(
                    "max_attempts must be positive when reconnecting".to_string(),
                ));
            }
            if self.reconnect.sustained_delay_ms == 0 {
                return Err(ConfigError::InvalidConfig(
                    "sustained_delay_ms must be positive when reconnecting".to_string(),
                ));
            }
        }
        if self.operations.buffer_capacity == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "buffer_capacity must be positive".to_string(),
            ));
        }
        if self.admin.timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "admin timeout_secs must be positive".to_string(),
            ));
        }

        if let Some(embedded) = &self.embedded {
            if embedded.queue_manager.is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "embedded queue_manager must not be empty".to_string(),
                ));
            }
            if let Some(queue) = embedded
                .queues
                .iter()
                .find(|q| q.name.is_empty() || q.name.len() > crate::admin::MAX_OBJECT_NAME)
            {
                return Err(ConfigError::InvalidConfig(format!(
                    "invalid embedded queue name '{}'",
                    queue.name
                )));
            }
        }
        Ok(())
    }

    fn endpoints(&self) -> Result<(Endpoint, Vec<Endpoint>), ConfigError> {
        let parse = |raw: &str| {
            Endpoint::parse(raw).map_err(|e| ConfigError::InvalidEndpoint(e.to_string()))
        };
        let primary = parse(&self.connection.endpoint)?;
        let alternates = self
            .connection
            .alternate_endpoints
            .iter()
            .map(|raw| parse(raw))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((primary, alternates))
    }

    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Credentials from the environment variables named in `[connection]`
    ///
    /// A named user variable that is unset is an error; the password defaults to empty.
    pub fn credentials(&self) -> Result<Option<Credentials>, ConfigError> {
        let Some(user_env) = &self.connection.username_env else {
            return Ok(None);
        };
        let user = std::env::var(user_env)
            .map_err(|_| ConfigError::EnvVarNotFound(user_env.clone()))?;
        let password =
            Self::get_env_var_optional(self.connection.password_env.as_ref()).unwrap_or_default();
        Ok(Some(Credentials::new(user, password)))
    }

    fn backpressure(&self) -> Backpressure {
        match self.reconnect.backpressure {
            BackpressureMode::Queue => Backpressure::Queue {
                timeout: Duration::from_secs(self.reconnect.backpressure_timeout_secs),
            },
            BackpressureMode::Reject => Backpressure::Reject,
        }
    }

    fn operation_defaults(&self) -> OperationDefaults {
        let ops = &self.operations;
        let wait = if ops.wait_unlimited {
            WaitTimeout::Unlimited
        } else if ops.wait_ms == 0 {
            WaitTimeout::NoWait
        } else {
            WaitTimeout::Bounded(Duration::from_millis(ops.wait_ms))
        };
        OperationDefaults {
            wait,
            truncation: ops.truncation,
            buffer_capacity: ops.buffer_capacity,
            async_put_queue: ops.async_put_queue,
        }
    }

    /// Everything `connect` needs, with credentials resolved from the environment
    pub fn to_connect_options(&self) -> Result<ConnectOptions, ConfigError> {
        let (primary, alternates) = self.endpoints()?;
        let mut options = ConnectOptions::new(primary)
            .reconnect(self.reconnect.policy)
            .reconnect_config(ReconnectConfig {
                max_attempts: self.reconnect.max_attempts,
                backoff_pattern: self.reconnect.backoff_ms.clone(),
                sustained_delay: self.reconnect.sustained_delay_ms,
            })
            .backpressure(self.backpressure())
            .connect_timeout(Duration::from_secs(self.connection.connect_timeout_secs))
            .defaults(self.operation_defaults());
        for alternate in alternates {
            options = options.alternate(alternate);
        }
        if let Some(client_id) = &self.connection.client_id {
            options = options.client_id(client_id.as_str());
        }
        if let Some(credentials) = self.credentials()? {
            options = options.credentials(credentials);
        }
        Ok(options)
    }

    pub fn admin_options(&self) -> AdminOptions {
        AdminOptions {
            command_queue: self.admin.command_queue.clone(),
            model_queue: self.admin.model_queue.clone(),
            reply_prefix: self.admin.reply_prefix.clone(),
            timeout: Duration::from_secs(self.admin.timeout_secs),
            ..AdminOptions::default()
        }
    }

    /// Queue manager name for the embedded broker: `[embedded]`, else the endpoint's
    pub fn embedded_queue_manager(&self) -> Result<String, ConfigError> {
        match &self.embedded {
            Some(embedded) => Ok(embedded.queue_manager.clone()),
            None => Ok(self.endpoints()?.0.queue_manager().to_string()),
        }
    }

    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[connection]
endpoint = "memory://QM1"

[embedded]
queue_manager = "QM1"
queues = [{ name = "APP.IN" }]
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}
