//! Command server of the in-process queue manager
//!
//! While running, the command server holds the command queue open for input
//! and services each request as soon as it is committed to that queue. Replies
//! go to the request's reply-to queue, correlated by the request's message id.

use super::queue::{Queue, QueueDefinition, QueueType, Stored};
use super::state::QmState;
use crate::admin::catalog::ParameterCatalog;
use crate::admin::command::{AdminReply, AdminRequest, AttributeSet, CommandCode};
use crate::admin::COMMAND_QUEUE;
use crate::error::{reason, MqError};
use crate::message::{CorrelationId, Message, MessageId, MessageType, FORMAT_ADMIN};
use crate::transport::DynamicLifetime;
use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Whether the command server is servicing the command queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandServerState {
    Running,
    /// Holds the command queue open but never replies
    Unresponsive,
    Stopped,
}

impl CommandServerState {
    pub fn holds_queue_open(self) -> bool {
        !matches!(self, CommandServerState::Stopped)
    }
}

/// Change the command server state, adjusting its hold on the command queue
pub(crate) fn set_state(state: &mut QmState, next: CommandServerState) {
    let previous = state.command_server;
    state.command_server = next;
    if let Some(queue) = state.queues.get_mut(COMMAND_QUEUE) {
        match (previous.holds_queue_open(), next.holds_queue_open()) {
            (false, true) => queue.open_input += 1,
            (true, false) => queue.open_input = queue.open_input.saturating_sub(1),
            _ => {}
        }
    }
    debug!(target: "mq_broker", ?previous, ?next, "command server state changed");
    service(state);
}

/// Process every request waiting on the command queue
pub(crate) fn service(state: &mut QmState) {
    if state.command_server != CommandServerState::Running {
        return;
    }

    let now = Instant::now();
    while let Some(stored) = state
        .queues
        .get_mut(COMMAND_QUEUE)
        .and_then(|q| q.messages.pop_front())
    {
        if stored.is_expired(now) {
            continue;
        }
        let message = stored.message;

        let request = match AdminRequest::from_payload(&message.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(target: "mq_broker", error = %e, "discarding malformed admin request");
                continue;
            }
        };
        let Some(reply_to) = message.headers.reply_to.clone() else {
            warn!(target: "mq_broker", command = %request.command, "admin request without reply-to queue discarded");
            continue;
        };

        let replies = execute(state, &request);
        debug!(target: "mq_broker", command = %request.command, replies = replies.len(), "admin request processed");

        let correlation = CorrelationId::from(message.message_id());
        for reply in replies {
            deliver_reply(state, &reply_to, correlation, &reply);
        }
    }
}

fn deliver_reply(state: &mut QmState, reply_to: &str, correlation: CorrelationId, reply: &AdminReply) {
    let payload = match reply.to_payload() {
        Ok(payload) => payload,
        Err(e) => {
            warn!(target: "mq_broker", error = %e, "failed to encode admin reply");
            return;
        }
    };
    let mut message = Message::new(payload)
        .with_format(FORMAT_ADMIN)
        .with_type(MessageType::Reply)
        .with_message_id(MessageId::generate())
        .with_correlation_id(correlation);
    message.headers.put_timestamp = Some(Utc::now());

    let seq = state.next_sequence();
    match state.queues.get_mut(reply_to) {
        Some(queue) if queue.depth() < queue.definition.max_depth => queue.insert(Stored {
            seq,
            message,
            expires_at: None,
        }),
        Some(_) => warn!(target: "mq_broker", queue = %reply_to, "reply queue full, admin reply dropped"),
        None => warn!(target: "mq_broker", queue = %reply_to, "reply queue missing, admin reply dropped"),
    }
}

/// Run one admin request against the queue manager
pub(crate) fn execute(state: &mut QmState, request: &AdminRequest) -> Vec<AdminReply> {
    let command = request.command;
    let attrs = &request.parameters;

    if let Err(MqError::InvalidAttribute { name, .. }) =
        ParameterCatalog::standard().validate(command, attrs)
    {
        return vec![AdminReply::command_failed(
            command,
            reason::PARAMETER_ERROR,
            Some(name),
        )];
    }

    let name = attrs.get_str("Q_NAME").unwrap_or("*").to_string();
    let unknown = || {
        vec![AdminReply::command_failed(
            command,
            reason::UNKNOWN_OBJECT_NAME,
            Some("Q_NAME".into()),
        )]
    };

    match command {
        CommandCode::Ping => vec![AdminReply::success(command, AttributeSet::new())],

        CommandCode::CreateQueue => {
            let replace = attrs.get_str("REPLACE") == Some("YES");
            if let Some(existing) = state.queues.get_mut(&name) {
                if !replace || existing.managed {
                    return vec![AdminReply::command_failed(
                        command,
                        reason::OBJECT_ALREADY_EXISTS,
                        Some("Q_NAME".into()),
                    )];
                }
                apply_attributes(&mut existing.definition, attrs);
            } else {
                let mut definition = match attrs.get_str("Q_TYPE") {
                    Some("MODEL") => QueueDefinition::model(&name, DynamicLifetime::Temporary),
                    _ => QueueDefinition::local(&name),
                };
                apply_attributes(&mut definition, attrs);
                state.queues.insert(name, Queue::new(definition));
            }
            vec![AdminReply::success(command, AttributeSet::new())]
        }

        CommandCode::ChangeQueue => match state.queues.get_mut(&name).filter(|q| !q.managed) {
            Some(queue) => {
                apply_attributes(&mut queue.definition, attrs);
                queue.notify.notify_waiters();
                vec![AdminReply::success(command, AttributeSet::new())]
            }
            None => unknown(),
        },

        CommandCode::DeleteQueue => {
            let Some(queue) = state.queues.get(&name).filter(|q| !q.managed) else {
                return unknown();
            };
            if queue.is_in_use() {
                return vec![AdminReply::command_failed(command, reason::OBJECT_IN_USE, None)];
            }
            let purge = attrs.get_str("PURGE") == Some("YES");
            if queue.depth() + queue.staged_puts > 0 && !purge {
                return vec![AdminReply::command_failed(command, reason::Q_NOT_EMPTY, None)];
            }
            state.remove_queue(&name);
            vec![AdminReply::success(command, AttributeSet::new())]
        }

        CommandCode::ClearQueue => match state.queues.get_mut(&name).filter(|q| !q.managed) {
            Some(queue) if queue.is_in_use() => {
                vec![AdminReply::command_failed(command, reason::OBJECT_IN_USE, None)]
            }
            Some(queue) => {
                queue.messages.clear();
                vec![AdminReply::success(command, AttributeSet::new())]
            }
            None => unknown(),
        },

        CommandCode::InquireQueue => {
            let wanted_type = attrs.get_str("Q_TYPE");
            let mut matches: Vec<&Queue> = state
                .queues
                .values()
                .filter(|q| !q.managed && name_matches(&name, q.name()))
                .filter(|q| wanted_type.map_or(true, |t| t == queue_type_name(q)))
                .collect();
            if matches.is_empty() {
                return unknown();
            }
            matches.sort_by(|a, b| a.name().cmp(b.name()));

            let count = matches.len();
            matches
                .into_iter()
                .enumerate()
                .map(|(i, q)| {
                    let mut reply = AdminReply::success(command, queue_attributes(q));
                    reply.last = i + 1 == count;
                    reply
                })
                .collect()
        }

        CommandCode::InquireQueueNames => {
            let wanted_type = attrs.get_str("Q_TYPE");
            let mut names: Vec<String> = state
                .queues
                .values()
                .filter(|q| !q.managed && name_matches(&name, q.name()))
                .filter(|q| wanted_type.map_or(true, |t| t == queue_type_name(q)))
                .map(|q| q.name().to_string())
                .collect();
            names.sort();
            vec![AdminReply::success(
                command,
                AttributeSet::new().with("Q_NAMES", names),
            )]
        }
    }
}

/// Exact names, or generic names ending in `*`
fn name_matches(pattern: &str, name: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => pattern == name,
    }
}

fn queue_type_name(queue: &Queue) -> &'static str {
    match queue.definition.queue_type {
        QueueType::Local => "LOCAL",
        QueueType::Model(_) => "MODEL",
    }
}

fn enabled(inhibited: bool) -> &'static str {
    if inhibited {
        "INHIBITED"
    } else {
        "ENABLED"
    }
}

fn apply_attributes(definition: &mut QueueDefinition, attrs: &AttributeSet) {
    if let QueueType::Model(_) = definition.queue_type {
        match attrs.get_str("DEF_TYPE") {
            Some("PERMDYN") => definition.queue_type = QueueType::Model(DynamicLifetime::Permanent),
            Some("TEMPDYN") => definition.queue_type = QueueType::Model(DynamicLifetime::Temporary),
            _ => {}
        }
    }
    if let Some(v) = attrs.get_int("MAX_Q_DEPTH") {
        definition.max_depth = v as usize;
    }
    if let Some(v) = attrs.get_int("MAX_MSG_LENGTH") {
        definition.max_message_length = v as usize;
    }
    if let Some(v) = attrs.get_str("INHIBIT_GET") {
        definition.get_inhibited = v == "INHIBITED";
    }
    if let Some(v) = attrs.get_str("INHIBIT_PUT") {
        definition.put_inhibited = v == "INHIBITED";
    }
    if let Some(v) = attrs.get_int("BACKOUT_THRESHOLD") {
        definition.backout_threshold = v as u32;
    }
    if let Some(v) = attrs.get_str("BACKOUT_REQ_Q_NAME") {
        definition.backout_requeue = Some(v.to_string());
    }
    if let Some(v) = attrs.get_str("Q_DESC") {
        definition.description = v.to_string();
    }
}

fn queue_attributes(queue: &Queue) -> AttributeSet {
    let d = &queue.definition;
    let mut attrs = AttributeSet::new()
        .with("Q_NAME", d.name.as_str())
        .with("Q_TYPE", queue_type_name(queue))
        .with("MAX_Q_DEPTH", d.max_depth as i64)
        .with("MAX_MSG_LENGTH", d.max_message_length as i64)
        .with("INHIBIT_GET", enabled(d.get_inhibited))
        .with("INHIBIT_PUT", enabled(d.put_inhibited))
        .with("BACKOUT_THRESHOLD", i64::from(d.backout_threshold))
        .with("Q_DESC", d.description.as_str())
        .with("CURRENT_Q_DEPTH", queue.depth() as i64)
        .with("OPEN_INPUT_COUNT", queue.open_input as i64)
        .with("OPEN_OUTPUT_COUNT", queue.open_output as i64);
    if let Some(requeue) = &d.backout_requeue {
        attrs.insert("BACKOUT_REQ_Q_NAME", requeue.as_str());
    }
    if let QueueType::Model(lifetime) = d.queue_type {
        let def_type = match lifetime {
            DynamicLifetime::Temporary => "TEMPDYN",
            DynamicLifetime::Permanent => "PERMDYN",
        };
        attrs.insert("DEF_TYPE", def_type);
    }
    attrs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompletionCode;

    fn state() -> QmState {
        let mut state = QmState::new("QM1");
        state.define(QueueDefinition::local(COMMAND_QUEUE));
        state.define(QueueDefinition::local("APP.A"));
        state.define(QueueDefinition::local("APP.B"));
        state.define(QueueDefinition::local("OTHER"));
        state
    }

    fn request(command: CommandCode, attrs: AttributeSet) -> AdminRequest {
        AdminRequest::new(command, attrs)
    }

    #[test]
    fn test_generic_name_matching() {
        assert!(name_matches("APP.*", "APP.A"));
        assert!(name_matches("*", "ANY"));
        assert!(name_matches("APP.A", "APP.A"));
        assert!(!name_matches("APP.A", "APP.AB"));
    }

    #[test]
    fn test_create_then_duplicate() {
        let mut state = state();
        let create = request(
            CommandCode::CreateQueue,
            AttributeSet::new()
                .with("Q_NAME", "NEW.Q")
                .with("MAX_Q_DEPTH", 10i64),
        );
        let replies = execute(&mut state, &create);
        assert_eq!(replies[0].completion, CompletionCode::Ok);
        assert_eq!(state.queues["NEW.Q"].definition.max_depth, 10);

        let replies = execute(&mut state, &create);
        assert_eq!(replies[0].reason, reason::COMMAND_FAILED);
        assert_eq!(
            replies[0].error.as_ref().unwrap().reason,
            reason::OBJECT_ALREADY_EXISTS
        );
    }

    #[test]
    fn test_create_model_queue() {
        let mut state = state();
        execute(
            &mut state,
            &request(
                CommandCode::CreateQueue,
                AttributeSet::new()
                    .with("Q_NAME", "APP.MODEL")
                    .with("Q_TYPE", "MODEL")
                    .with("DEF_TYPE", "PERMDYN"),
            ),
        );
        assert_eq!(
            state.queues["APP.MODEL"].definition.queue_type,
            QueueType::Model(DynamicLifetime::Permanent)
        );
    }

    #[test]
    fn test_inquire_generic_returns_one_reply_per_queue() {
        let mut state = state();
        let replies = execute(
            &mut state,
            &request(
                CommandCode::InquireQueue,
                AttributeSet::new().with("Q_NAME", "APP.*"),
            ),
        );
        assert_eq!(replies.len(), 2);
        assert!(!replies[0].last);
        assert!(replies[1].last);
        assert_eq!(replies[0].parameters.get_str("Q_NAME"), Some("APP.A"));
        assert_eq!(replies[1].parameters.get_int("CURRENT_Q_DEPTH"), Some(0));
    }

    #[test]
    fn test_inquire_unknown_queue_fails() {
        let mut state = state();
        let replies = execute(
            &mut state,
            &request(
                CommandCode::InquireQueue,
                AttributeSet::new().with("Q_NAME", "MISSING"),
            ),
        );
        assert_eq!(
            replies[0].error.as_ref().unwrap().reason,
            reason::UNKNOWN_OBJECT_NAME
        );
    }

    #[test]
    fn test_delete_requires_purge_when_not_empty() {
        let mut state = state();
        state.queues.get_mut("APP.A").unwrap().insert(Stored {
            seq: 1,
            message: Message::text("x"),
            expires_at: None,
        });

        let delete = AttributeSet::new().with("Q_NAME", "APP.A");
        let replies = execute(&mut state, &request(CommandCode::DeleteQueue, delete.clone()));
        assert_eq!(
            replies[0].error.as_ref().unwrap().reason,
            reason::Q_NOT_EMPTY
        );

        let replies = execute(
            &mut state,
            &request(CommandCode::DeleteQueue, delete.with("PURGE", "YES")),
        );
        assert_eq!(replies[0].completion, CompletionCode::Ok);
        assert!(!state.queues.contains_key("APP.A"));
    }

    #[test]
    fn test_queue_names_listing() {
        let mut state = state();
        let replies = execute(
            &mut state,
            &request(CommandCode::InquireQueueNames, AttributeSet::new()),
        );
        let names = replies[0].parameters.get_str_list("Q_NAMES").unwrap();
        assert_eq!(names.len(), 4);
        assert!(names.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_invalid_parameter_is_rejected() {
        let mut state = state();
        let replies = execute(
            &mut state,
            &request(
                CommandCode::ChangeQueue,
                AttributeSet::new()
                    .with("Q_NAME", "APP.A")
                    .with("INHIBIT_PUT", "MAYBE"),
            ),
        );
        let error = replies[0].error.as_ref().unwrap();
        assert_eq!(error.reason, reason::PARAMETER_ERROR);
        assert_eq!(error.parameter.as_deref(), Some("INHIBIT_PUT"));
    }

    #[test]
    fn test_command_server_hold_on_queue() {
        let mut state = state();
        set_state(&mut state, CommandServerState::Running);
        assert_eq!(state.queues[COMMAND_QUEUE].open_input, 1);
        set_state(&mut state, CommandServerState::Unresponsive);
        assert_eq!(state.queues[COMMAND_QUEUE].open_input, 1);
        set_state(&mut state, CommandServerState::Stopped);
        assert_eq!(state.queues[COMMAND_QUEUE].open_input, 0);
    }
}
