//! Admin command execution
//!
//! `execute` walks `Building -> Sent -> AwaitingReply` and ends in `Parsed`,
//! `TimedOut` or `CommandServerUnavailable`. A command server counts as
//! available while something holds the command queue open for input; a
//! timeout with the queue still held open is reported as `AdminTimeout`.

use super::catalog::ParameterCatalog;
use super::command::{AdminReply, AdminRequest, AdminResult, AttributeSet, CommandCode};
use super::{COMMAND_QUEUE, DEFAULT_MODEL_QUEUE};
use crate::connection::Connection;
use crate::destination::{CloseOptions, Destination, DestinationKind, OpenMode, OpenOptions};
use crate::engine::{GetOptions, PutOptions};
use crate::error::{MqError, MqResult, OpenError};
use crate::message::{CorrelationId, Message, MessageType, FORMAT_ADMIN};
use crate::transport::MatchFilter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace, warn, Instrument};

pub const DEFAULT_ADMIN_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_REPLY_PREFIX: &str = "MQCLIENT.REPLY.*";

/// Where admin requests go and how long to wait for replies
#[derive(Debug, Clone)]
pub struct AdminOptions {
    pub command_queue: String,
    /// Model for the temporary reply queue
    pub model_queue: String,
    pub reply_prefix: String,
    pub timeout: Duration,
    pub catalog: Arc<ParameterCatalog>,
}

impl Default for AdminOptions {
    fn default() -> Self {
        Self {
            command_queue: COMMAND_QUEUE.to_string(),
            model_queue: DEFAULT_MODEL_QUEUE.to_string(),
            reply_prefix: DEFAULT_REPLY_PREFIX.to_string(),
            timeout: DEFAULT_ADMIN_TIMEOUT,
            catalog: ParameterCatalog::standard(),
        }
    }
}

/// Progress of one admin command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminPhase {
    Building,
    Sent,
    AwaitingReply,
    Parsed,
    TimedOut,
    CommandServerUnavailable,
}

impl AdminPhase {
    pub fn is_final(self) -> bool {
        matches!(
            self,
            AdminPhase::Parsed | AdminPhase::TimedOut | AdminPhase::CommandServerUnavailable
        )
    }
}

/// Runs admin commands over a connection
///
/// Clones share one phase channel, which follows whichever command ran last.
#[derive(Debug, Clone)]
pub struct AdminEngine {
    connection: Connection,
    options: AdminOptions,
    phase_tx: Arc<watch::Sender<AdminPhase>>,
}

/// How collecting replies ended
enum Collected {
    Complete(Vec<AdminReply>),
    TimedOut,
}

impl AdminEngine {
    pub fn new(connection: Connection) -> Self {
        Self::with_options(connection, AdminOptions::default())
    }

    pub fn with_options(connection: Connection, options: AdminOptions) -> Self {
        let (phase_tx, _) = watch::channel(AdminPhase::Building);
        Self {
            connection,
            options,
            phase_tx: Arc::new(phase_tx),
        }
    }

    pub fn options(&self) -> &AdminOptions {
        &self.options
    }

    /// Phase of the most recent command
    pub fn phase(&self) -> AdminPhase {
        *self.phase_tx.borrow()
    }

    /// Watch commands move through their phases
    pub fn phase_changes(&self) -> watch::Receiver<AdminPhase> {
        self.phase_tx.subscribe()
    }

    fn advance(&self, to: AdminPhase) {
        let from = self.phase_tx.send_replace(to);
        trace!(target: "mq_admin", ?from, ?to, "admin phase");
    }

    /// Run a command with the default timeout
    pub async fn execute(
        &self,
        command: CommandCode,
        attributes: AttributeSet,
    ) -> MqResult<AdminResult> {
        self.execute_with_timeout(command, attributes, self.options.timeout)
            .await
    }

    /// Run a command, waiting at most `timeout` for its replies
    pub async fn execute_with_timeout(
        &self,
        command: CommandCode,
        attributes: AttributeSet,
        timeout: Duration,
    ) -> MqResult<AdminResult> {
        let span = crate::admin_span!(%command, connection = self.connection.id());
        self.run(command, attributes, timeout).instrument(span).await
    }

    async fn run(
        &self,
        command: CommandCode,
        attributes: AttributeSet,
        timeout: Duration,
    ) -> MqResult<AdminResult> {
        self.advance(AdminPhase::Building);
        self.options.catalog.validate(command, &attributes)?;
        if let Err(err) = self.ensure_command_server().await {
            if matches!(err, MqError::CommandServerUnavailable { .. }) {
                self.advance(AdminPhase::CommandServerUnavailable);
            }
            return Err(err);
        }
        let request = AdminRequest::new(command, attributes);
        let payload = request.to_payload()?;

        let reply_queue = self
            .connection
            .open(
                &self.options.model_queue,
                DestinationKind::Queue,
                OpenMode::Input,
                OpenOptions::dynamic(&self.options.reply_prefix),
            )
            .await?;
        let command_queue = match self
            .connection
            .open_queue(&self.options.command_queue, OpenMode::Output)
            .await
        {
            Ok(queue) => queue,
            Err(err) => {
                close_quietly(reply_queue).await;
                return Err(err);
            }
        };

        let exchanged = self
            .exchange(&command_queue, &reply_queue, payload, timeout)
            .await;
        close_quietly(command_queue).await;
        close_quietly(reply_queue).await;

        let outcome = match exchanged? {
            Collected::Complete(replies) => {
                self.advance(AdminPhase::Parsed);
                Ok(AdminResult::from_replies(&replies))
            }
            Collected::TimedOut => {
                // distinguish a missing command server from a slow one
                match self.ensure_command_server().await {
                    Err(err @ MqError::CommandServerUnavailable { .. }) => {
                        self.advance(AdminPhase::CommandServerUnavailable);
                        Err(err)
                    }
                    _ => {
                        self.advance(AdminPhase::TimedOut);
                        Err(MqError::AdminTimeout(timeout))
                    }
                }
            }
        };
        debug!(target: "mq_admin", %command, phase = ?self.phase(), ok = outcome.is_ok(), "admin command finished");
        outcome
    }

    async fn exchange(
        &self,
        command_queue: &Destination,
        reply_queue: &Destination,
        payload: bytes::Bytes,
        timeout: Duration,
    ) -> MqResult<Collected> {
        let message = Message::new(payload)
            .with_format(FORMAT_ADMIN)
            .with_type(MessageType::Request)
            .with_reply_to(reply_queue.name())
            .with_expiry(timeout);
        let sent = command_queue.put(message, PutOptions::default()).await?;
        self.advance(AdminPhase::Sent);

        let correlation = CorrelationId::from(sent.message_id);
        let deadline = Instant::now() + timeout;
        let mut replies = Vec::new();
        self.advance(AdminPhase::AwaitingReply);

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Collected::TimedOut);
            }
            let options = GetOptions::new()
                .wait_for(remaining)
                .filter(MatchFilter::correlation_id(correlation));
            let received = match reply_queue.get(options).await {
                Ok(received) => received,
                Err(err) if err.is_no_message() => return Ok(Collected::TimedOut),
                Err(err) => return Err(err),
            };

            let reply = AdminReply::from_payload(&received.message.payload)?;
            trace!(target: "mq_admin", command = %reply.command, last = reply.last, "admin reply received");
            let last = reply.last;
            replies.push(reply);
            if last {
                return Ok(Collected::Complete(replies));
            }
        }
    }

    /// Fail with `CommandServerUnavailable` unless something reads the command queue
    async fn ensure_command_server(&self) -> MqResult<()> {
        let unavailable = || MqError::CommandServerUnavailable {
            queue: self.options.command_queue.clone(),
        };
        match self
            .connection
            .inquire_queue(&self.options.command_queue)
            .await
        {
            Ok(status) if status.open_input_count > 0 => Ok(()),
            Ok(_) | Err(MqError::Open(OpenError::NotFound { .. })) => Err(unavailable()),
            Err(err) => Err(err),
        }
    }

    pub async fn ping(&self) -> MqResult<AdminResult> {
        self.execute(CommandCode::Ping, AttributeSet::new()).await
    }

    /// Define a local queue; `attributes` may add any create parameter
    pub async fn create_queue(&self, name: &str, attributes: AttributeSet) -> MqResult<AdminResult> {
        self.execute(CommandCode::CreateQueue, attributes.with("Q_NAME", name))
            .await
    }

    pub async fn delete_queue(&self, name: &str, purge: bool) -> MqResult<AdminResult> {
        let mut attributes = AttributeSet::new().with("Q_NAME", name);
        if purge {
            attributes.insert("PURGE", "YES");
        }
        self.execute(CommandCode::DeleteQueue, attributes).await
    }

    /// Names of queues matching `pattern`, where a trailing `*` is a wildcard
    pub async fn inquire_queue_names(&self, pattern: &str) -> MqResult<AdminResult> {
        self.execute(
            CommandCode::InquireQueueNames,
            AttributeSet::new().with("Q_NAME", pattern),
        )
        .await
    }
}

async fn close_quietly(destination: Destination) {
    let name = destination.name();
    if let Err(err) = destination.close(CloseOptions::default()).await {
        warn!(target: "mq_admin", %name, error = %err, "closing admin destination failed");
    }
}

impl Connection {
    /// Run an admin command with default admin options
    pub async fn execute(
        &self,
        command: CommandCode,
        attributes: AttributeSet,
    ) -> MqResult<AdminResult> {
        AdminEngine::new(self.clone())
            .execute(command, attributes)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{connect, ConnectOptions};
    use crate::error::reason;
    use crate::transport::{BrokerPtr, Endpoint, MemoryBroker};

    async fn setup() -> (MemoryBroker, Connection) {
        let memory = MemoryBroker::new("QM1");
        let broker: BrokerPtr = Arc::new(memory.clone());
        let connection = connect(broker, ConnectOptions::new(Endpoint::memory("QM1")))
            .await
            .unwrap();
        (memory, connection)
    }

    #[test]
    fn test_final_phases() {
        assert!(AdminPhase::Parsed.is_final());
        assert!(AdminPhase::TimedOut.is_final());
        assert!(AdminPhase::CommandServerUnavailable.is_final());
        assert!(!AdminPhase::AwaitingReply.is_final());
    }

    #[tokio::test]
    async fn test_ping() {
        let (_memory, connection) = setup().await;
        let admin = AdminEngine::new(connection);
        let result = admin.ping().await.unwrap();
        assert!(result.is_success());
        assert_eq!(admin.phase(), AdminPhase::Parsed);
    }

    #[tokio::test]
    async fn test_create_then_inquire() {
        let (memory, connection) = setup().await;
        let admin = AdminEngine::new(connection);
        let created = admin
            .create_queue("APP.ORDERS", AttributeSet::new().with("MAX_Q_DEPTH", 10i64))
            .await
            .unwrap();
        assert!(created.is_success());
        assert!(memory.queue_exists("APP.ORDERS"));

        let inquired = admin
            .execute(
                CommandCode::InquireQueue,
                AttributeSet::new().with("Q_NAME", "APP.ORDERS"),
            )
            .await
            .unwrap();
        assert_eq!(inquired.attributes().len(), 1);
        assert_eq!(inquired.attributes()[0].get_int("MAX_Q_DEPTH"), Some(10));
    }

    #[tokio::test]
    async fn test_duplicate_create_reports_nested_reason() {
        let (_memory, connection) = setup().await;
        let admin = AdminEngine::new(connection);
        admin
            .create_queue("APP.DUP", AttributeSet::new())
            .await
            .unwrap();
        let again = admin
            .create_queue("APP.DUP", AttributeSet::new())
            .await
            .unwrap();
        let failure = again.failure().unwrap();
        assert_eq!(failure.reason, reason::COMMAND_FAILED);
        assert_eq!(failure.root_reason(), reason::OBJECT_ALREADY_EXISTS);
    }

    #[tokio::test]
    async fn test_invalid_attribute_rejected_before_sending() {
        let (_memory, connection) = setup().await;
        let err = connection
            .execute(
                CommandCode::CreateQueue,
                AttributeSet::new().with("Q_NAME", "X").with("COLOUR", "RED"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MqError::InvalidAttribute { .. }));
    }

    #[tokio::test]
    async fn test_stopped_command_server_is_unavailable() {
        let (memory, connection) = setup().await;
        memory.stop_command_server();
        let err = connection
            .execute(CommandCode::Ping, AttributeSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MqError::CommandServerUnavailable { .. }));
        assert_eq!(err.reason_code(), reason::CMD_SERVER_NOT_AVAILABLE);

        let admin = AdminEngine::new(connection);
        assert!(admin.ping().await.is_err());
        assert_eq!(admin.phase(), AdminPhase::CommandServerUnavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_phase_changes_follow_the_command() {
        let (memory, connection) = setup().await;
        memory.hang_command_server();
        let admin = AdminEngine::new(connection);
        let mut phases = admin.phase_changes();

        let running = {
            let admin = admin.clone();
            tokio::spawn(async move {
                admin
                    .execute_with_timeout(CommandCode::Ping, AttributeSet::new(), Duration::from_secs(5))
                    .await
            })
        };
        phases
            .wait_for(|phase| *phase == AdminPhase::AwaitingReply)
            .await
            .unwrap();
        assert!(!running.is_finished());

        assert!(running.await.unwrap().is_err());
        assert_eq!(admin.phase(), AdminPhase::TimedOut);
        assert!(admin.phase().is_final());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_command_server_times_out() {
        let (memory, connection) = setup().await;
        memory.hang_command_server();
        let admin = AdminEngine::new(connection.clone());
        let err = admin
            .execute_with_timeout(CommandCode::Ping, AttributeSet::new(), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err, MqError::AdminTimeout(Duration::from_secs(2)));
        assert_eq!(admin.phase(), AdminPhase::TimedOut);

        // the timed out command's reply queue is gone; only the inquiry's own remains
        memory.start_command_server();
        let names = admin.inquire_queue_names("MQCLIENT.REPLY.*").await.unwrap();
        let listed = names.attributes()[0]
            .get_str_list("Q_NAMES")
            .map(|names| names.len())
            .unwrap_or(0);
        assert_eq!(listed, 1);
    }
}
