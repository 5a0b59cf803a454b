//! Queue manager state and the synchronous operations on it
//!
//! Every method runs under the broker's mutex and never awaits, so each
//! operation is atomic with respect to every other session.

use super::command_server::{self, CommandServerState};
use super::queue::{Queue, QueueDefinition, QueueType, Stored};
use super::topic::{canonicalize_topic, topic_matches, validate_topic};
use crate::admin::COMMAND_QUEUE;
use crate::destination::{DestinationKind, OpenMode};
use crate::error::{ConnectError, GetError, MqError, MqResult, OpenError, PutError, Warning};
use crate::message::MessageId;
use crate::transport::{
    BrowsePosition, CloseRequest, Delivery, DynamicLifetime, GetRequest, LinkStatus, ObjectId,
    ObjectSpec, OpenedObject, PutReceipt, PutRequest, QueueStatus, SessionId, SessionInfo,
    SessionRequest,
};
use crate::message::Message;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const DEFAULT_DYNAMIC_PREFIX: &str = "AMQ.";
const MANAGED_QUEUE_PREFIX: &str = "SYSTEM.MANAGED.NDURABLE.";
const ANONYMOUS_USER: &str = "anonymous";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Target {
    Queue(String),
    Publish(String),
    Subscription { filter: String, queue: String },
}

#[derive(Debug)]
pub(crate) struct OpenObject {
    pub target: Target,
    pub mode: OpenMode,
    /// Lifetime of the dynamic queue this handle created, if any
    pub created: Option<DynamicLifetime>,
}

/// Work staged under syncpoint, keyed by queue name
#[derive(Debug, Default)]
pub(crate) struct UnitOfWork {
    pub puts: Vec<(String, Stored)>,
    pub gets: Vec<(String, Stored)>,
}

impl UnitOfWork {
    pub fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.gets.is_empty()
    }
}

#[derive(Debug)]
pub(crate) struct Session {
    pub user: String,
    pub link: watch::Sender<LinkStatus>,
    pub objects: HashMap<ObjectId, OpenObject>,
    pub uow: UnitOfWork,
}

#[derive(Debug)]
pub(crate) struct QmState {
    pub name: String,
    pub quiescing: bool,
    pub reachable: bool,
    pub unreachable_hosts: HashSet<String>,
    pub users: HashMap<String, String>,
    pub denied: HashSet<(String, String)>,
    pub command_server: CommandServerState,
    pub queues: HashMap<String, Queue>,
    pub sessions: HashMap<SessionId, Session>,
    next_session: u64,
    next_object: u64,
    next_seq: u64,
}

fn session_ended() -> MqError {
    MqError::connection_lost("session ended")
}

impl QmState {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            quiescing: false,
            reachable: true,
            unreachable_hosts: HashSet::new(),
            users: HashMap::new(),
            denied: HashSet::new(),
            command_server: CommandServerState::Stopped,
            queues: HashMap::new(),
            sessions: HashMap::new(),
            next_session: 1,
            next_object: 1,
            next_seq: 1,
        }
    }

    pub fn next_sequence(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    pub fn define(&mut self, definition: QueueDefinition) {
        let name = definition.name.clone();
        match self.queues.get_mut(&name) {
            Some(queue) => queue.definition = definition,
            None => {
                self.queues.insert(name, Queue::new(definition));
            }
        }
    }

    /// Remove a queue, waking anything waiting on it
    pub fn remove_queue(&mut self, name: &str) -> Option<Queue> {
        let queue = self.queues.remove(name)?;
        queue.notify.notify_waiters();
        Some(queue)
    }

    pub fn connect(&mut self, request: &SessionRequest) -> MqResult<SessionInfo> {
        let endpoint = &request.endpoint;
        let unavailable = |reason: &str| {
            MqError::from(ConnectError::EndpointUnavailable {
                endpoint: endpoint.to_string(),
                reason: reason.to_string(),
            })
        };

        if !self.reachable || self.unreachable_hosts.contains(endpoint.host()) {
            return Err(unavailable("connection refused"));
        }
        if endpoint.queue_manager() != self.name {
            return Err(unavailable(&format!(
                "queue manager '{}' is not hosted here",
                endpoint.queue_manager()
            )));
        }
        if self.quiescing {
            return Err(unavailable("queue manager is quiescing"));
        }

        let credentials = request
            .credentials
            .as_ref()
            .or_else(|| endpoint.credentials());
        let user = if self.users.is_empty() {
            credentials
                .map(|c| c.user().to_string())
                .unwrap_or_else(|| ANONYMOUS_USER.to_string())
        } else {
            match credentials {
                Some(c) if self.users.get(c.user()).map(String::as_str) == Some(c.password()) => {
                    c.user().to_string()
                }
                Some(c) => {
                    return Err(ConnectError::Auth {
                        user: c.user().to_string(),
                    }
                    .into())
                }
                None => {
                    return Err(ConnectError::Auth {
                        user: ANONYMOUS_USER.to_string(),
                    }
                    .into())
                }
            }
        };

        let session = self.next_session;
        self.next_session += 1;
        let (link, _) = watch::channel(LinkStatus::Up);
        self.sessions.insert(
            session,
            Session {
                user: user.clone(),
                link,
                objects: HashMap::new(),
                uow: UnitOfWork::default(),
            },
        );
        debug!(target: "mq_broker", session, user = %user, client_id = ?request.client_id, "session established");

        Ok(SessionInfo {
            session,
            queue_manager: self.name.clone(),
        })
    }

    pub fn link(&self, session: SessionId) -> MqResult<watch::Receiver<LinkStatus>> {
        self.sessions
            .get(&session)
            .map(|s| s.link.subscribe())
            .ok_or_else(session_ended)
    }

    /// End a session: back out its work, close its objects and mark its link down
    pub fn end_session(&mut self, session: SessionId, reason: &str) -> bool {
        let Some(mut ended) = self.sessions.remove(&session) else {
            return false;
        };

        let uow = std::mem::take(&mut ended.uow);
        self.apply_backout(uow);

        for (object, open) in ended.objects.drain() {
            self.release(session, object, &open);
            if open.created == Some(DynamicLifetime::Temporary) {
                if let Target::Queue(name) = &open.target {
                    self.remove_queue(name);
                }
            }
        }

        ended.link.send_replace(LinkStatus::Down(reason.to_string()));
        debug!(target: "mq_broker", session, reason, "session ended");
        true
    }

    pub fn sever_all(&mut self, reason: &str) -> usize {
        let sessions: Vec<_> = self.sessions.keys().copied().collect();
        for session in &sessions {
            self.end_session(*session, reason);
        }
        sessions.len()
    }

    /// Restart the queue manager: sessions end and non-persistent messages are lost
    pub fn restart(&mut self) {
        let ended = self.sever_all("queue manager restarted");
        self.queues.retain(|_, q| q.dynamic != Some(DynamicLifetime::Temporary) && !q.managed);
        let mut lost = 0;
        for queue in self.queues.values_mut() {
            let before = queue.messages.len();
            queue.messages.retain(|m| m.message.is_persistent());
            queue.staged_puts = 0;
            lost += before - queue.messages.len();
        }
        info!(target: "mq_broker", queue_manager = %self.name, sessions = ended, non_persistent_lost = lost, "queue manager restarted");
    }

    pub fn open(&mut self, session: SessionId, spec: ObjectSpec) -> MqResult<OpenedObject> {
        let user = self
            .sessions
            .get(&session)
            .map(|s| s.user.clone())
            .ok_or_else(session_ended)?;

        if self.quiescing {
            return Err(OpenError::Quiescing.into());
        }
        if self.denied.contains(&(user.clone(), spec.name.clone())) {
            return Err(OpenError::AccessDenied {
                name: spec.name,
                user,
            }
            .into());
        }

        let object = self.next_object;
        self.next_object += 1;

        let (open, resolved_name) = match spec.kind {
            DestinationKind::Topic => self.open_topic(object, &spec)?,
            DestinationKind::Queue => self.open_queue(session, object, &spec)?,
        };
        let dynamic = open.created;

        if let Some(s) = self.sessions.get_mut(&session) {
            s.objects.insert(object, open);
        }
        debug!(target: "mq_broker", session, object, name = %resolved_name, mode = ?spec.mode, "object opened");

        Ok(OpenedObject {
            object,
            resolved_name,
            dynamic,
        })
    }

    fn open_topic(&mut self, object: ObjectId, spec: &ObjectSpec) -> MqResult<(OpenObject, String)> {
        if spec.dynamic_prefix.is_some() {
            return Err(
                OpenError::InvalidOptions("dynamic creation applies only to queues".into()).into(),
            );
        }
        let topic = canonicalize_topic(&spec.name);

        let target = match spec.mode {
            OpenMode::Input => {
                validate_topic(&topic, true).map_err(OpenError::InvalidOptions)?;
                let queue_name = format!("{MANAGED_QUEUE_PREFIX}{object:016X}");
                let mut queue = Queue::new(QueueDefinition::local(&queue_name));
                queue.managed = true;
                queue.open_input = 1;
                self.queues.insert(queue_name.clone(), queue);
                Target::Subscription {
                    filter: topic.clone(),
                    queue: queue_name,
                }
            }
            OpenMode::Output => {
                validate_topic(&topic, false).map_err(OpenError::InvalidOptions)?;
                Target::Publish(topic.clone())
            }
            mode => {
                return Err(OpenError::InvalidOptions(format!(
                    "topics cannot be opened for {mode:?}"
                ))
                .into())
            }
        };

        Ok((
            OpenObject {
                target,
                mode: spec.mode,
                created: None,
            },
            topic,
        ))
    }

    fn open_queue(
        &mut self,
        session: SessionId,
        object: ObjectId,
        spec: &ObjectSpec,
    ) -> MqResult<(OpenObject, String)> {
        let not_found = || OpenError::NotFound {
            name: spec.name.clone(),
        };
        let template = self
            .queues
            .get(&spec.name)
            .filter(|q| !q.managed)
            .ok_or_else(not_found)?;

        let (name, created) = match template.definition.queue_type {
            QueueType::Model(lifetime) => {
                let prefix = spec
                    .dynamic_prefix
                    .as_deref()
                    .unwrap_or(DEFAULT_DYNAMIC_PREFIX);
                let name = dynamic_queue_name(prefix, object);
                let mut definition = template.definition.clone();
                definition.name = name.clone();
                definition.queue_type = QueueType::Local;
                let mut queue = Queue::new(definition);
                queue.dynamic = Some(lifetime);
                self.queues.insert(name.clone(), queue);
                (name, Some(lifetime))
            }
            QueueType::Local if spec.dynamic_prefix.is_some() => {
                return Err(OpenError::InvalidOptions(format!(
                    "'{}' is not a model queue",
                    spec.name
                ))
                .into())
            }
            QueueType::Local => (spec.name.clone(), None),
        };

        let queue = self.queues.get_mut(&name).ok_or_else(not_found)?;
        let in_use = || OpenError::InUse { name: name.clone() };
        match spec.mode {
            OpenMode::Input => {
                if queue.exclusive.is_some() {
                    return Err(in_use().into());
                }
                queue.open_input += 1;
            }
            OpenMode::InputExclusive => {
                if queue.open_input > 0 {
                    return Err(in_use().into());
                }
                queue.exclusive = Some((session, object));
                queue.open_input += 1;
            }
            OpenMode::Output => queue.open_output += 1,
            OpenMode::Browse => {}
        }

        Ok((
            OpenObject {
                target: Target::Queue(name.clone()),
                mode: spec.mode,
                created,
            },
            name,
        ))
    }

    /// Undo the open counts an object holds
    fn release(&mut self, session: SessionId, object: ObjectId, open: &OpenObject) {
        match &open.target {
            Target::Queue(name) => {
                if let Some(queue) = self.queues.get_mut(name) {
                    match open.mode {
                        OpenMode::Input | OpenMode::InputExclusive => {
                            queue.open_input = queue.open_input.saturating_sub(1)
                        }
                        OpenMode::Output => queue.open_output = queue.open_output.saturating_sub(1),
                        OpenMode::Browse => {}
                    }
                    if queue.exclusive == Some((session, object)) {
                        queue.exclusive = None;
                    }
                }
            }
            Target::Subscription { queue, .. } => {
                self.remove_queue(queue);
            }
            Target::Publish(_) => {}
        }
    }

    pub fn close(
        &mut self,
        session: SessionId,
        object: ObjectId,
        request: CloseRequest,
    ) -> MqResult<()> {
        let open = self
            .sessions
            .get_mut(&session)
            .ok_or_else(session_ended)?
            .objects
            .remove(&object)
            .ok_or_else(|| MqError::HandleClosed {
                name: format!("object {object}"),
            })?;
        self.release(session, object, &open);

        let Target::Queue(name) = &open.target else {
            return Ok(());
        };

        if open.created == Some(DynamicLifetime::Temporary) {
            self.remove_queue(name);
            debug!(target: "mq_broker", queue = %name, "temporary dynamic queue deleted");
            return Ok(());
        }

        if !request.delete {
            return Ok(());
        }

        let Some(queue) = self.queues.get_mut(name) else {
            return Ok(());
        };
        if queue.dynamic != Some(DynamicLifetime::Permanent) {
            return Err(MqError::invalid_argument(format!(
                "'{name}' is not a permanent dynamic queue"
            )));
        }
        if queue.depth() + queue.staged_puts > 0 && !request.purge {
            return Err(MqError::QueueNotEmpty { name: name.clone() });
        }
        if queue.is_in_use() {
            return Err(OpenError::InUse { name: name.clone() }.into());
        }
        self.remove_queue(name);
        debug!(target: "mq_broker", queue = %name, "permanent dynamic queue deleted");
        Ok(())
    }

    pub fn put(
        &mut self,
        session: SessionId,
        object: ObjectId,
        mut message: Message,
        request: PutRequest,
    ) -> MqResult<PutReceipt> {
        let open = self
            .sessions
            .get(&session)
            .ok_or_else(session_ended)?
            .objects
            .get(&object)
            .ok_or_else(|| MqError::HandleClosed {
                name: format!("object {object}"),
            })?;
        let target = match (&open.target, open.mode) {
            (target, OpenMode::Output) => target.clone(),
            (Target::Queue(name) | Target::Publish(name), _)
            | (Target::Subscription { filter: name, .. }, _) => {
                return Err(PutError::NotOpenForOutput { name: name.clone() }.into())
            }
        };

        let put_timestamp = Utc::now();
        if message.headers.message_id.is_none() {
            message.headers.message_id = MessageId::generate();
        }
        message.headers.put_timestamp = Some(put_timestamp);
        message.headers.backout_count = 0;
        let message_id = message.headers.message_id;
        let receipt = |warning| PutReceipt {
            message_id,
            put_timestamp,
            warning,
        };

        match target {
            Target::Queue(name) => {
                self.enqueue(session, &name, message, request.syncpoint)?;
                Ok(receipt(None))
            }
            Target::Publish(topic) => {
                let subscribers: Vec<String> = self
                    .sessions
                    .values()
                    .flat_map(|s| s.objects.values())
                    .filter_map(|o| match &o.target {
                        Target::Subscription { filter, queue } if topic_matches(filter, &topic) => {
                            Some(queue.clone())
                        }
                        _ => None,
                    })
                    .collect();
                if subscribers.is_empty() {
                    return Ok(receipt(Some(Warning::NoSubscribersMatched)));
                }
                for queue in subscribers {
                    self.enqueue(session, &queue, message.clone(), request.syncpoint)?;
                }
                Ok(receipt(None))
            }
            Target::Subscription { filter, .. } => {
                Err(PutError::NotOpenForOutput { name: filter }.into())
            }
        }
    }

    fn enqueue(
        &mut self,
        session: SessionId,
        name: &str,
        message: Message,
        syncpoint: bool,
    ) -> MqResult<()> {
        let queue = self
            .queues
            .get_mut(name)
            .ok_or_else(|| OpenError::NotFound {
                name: name.to_string(),
            })?;
        let definition = &queue.definition;
        if definition.put_inhibited {
            return Err(PutError::Inhibited {
                name: name.to_string(),
            }
            .into());
        }
        if message.len() > definition.max_message_length {
            return Err(PutError::MessageTooBig {
                length: message.len(),
                max: definition.max_message_length,
            }
            .into());
        }
        if queue.depth() + queue.staged_puts >= definition.max_depth {
            return Err(PutError::QueueFull {
                name: name.to_string(),
                max_depth: definition.max_depth,
            }
            .into());
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let stored = Stored {
            seq,
            expires_at: message.headers.expiry.and_then(|d| Instant::now().checked_add(d)),
            message,
        };

        if syncpoint {
            queue.staged_puts += 1;
            if let Some(s) = self.sessions.get_mut(&session) {
                s.uow.puts.push((name.to_string(), stored));
            }
        } else {
            queue.insert(stored);
            if name == COMMAND_QUEUE {
                command_server::service(self);
            }
        }
        Ok(())
    }

    /// Notify and link receiver a waiting get blocks on
    pub fn wait_handles(
        &self,
        session: SessionId,
        object: ObjectId,
    ) -> MqResult<(Arc<Notify>, watch::Receiver<LinkStatus>)> {
        let s = self.sessions.get(&session).ok_or_else(session_ended)?;
        let open = s.objects.get(&object).ok_or_else(|| MqError::HandleClosed {
            name: format!("object {object}"),
        })?;
        let name = match &open.target {
            Target::Queue(name) | Target::Subscription { queue: name, .. } => name,
            Target::Publish(topic) => {
                return Err(GetError::NotOpenForInput {
                    name: topic.clone(),
                }
                .into())
            }
        };
        let queue = self.queues.get(name).ok_or_else(|| OpenError::NotFound {
            name: name.clone(),
        })?;
        Ok((Arc::clone(&queue.notify), s.link.subscribe()))
    }

    /// One attempt at retrieving a message; `None` when nothing matches yet
    pub fn try_get(
        &mut self,
        session: SessionId,
        object: ObjectId,
        request: &GetRequest,
    ) -> MqResult<Option<Delivery>> {
        let s = self.sessions.get_mut(&session).ok_or_else(session_ended)?;
        let open = s.objects.get(&object).ok_or_else(|| MqError::HandleClosed {
            name: format!("object {object}"),
        })?;

        let name = match &open.target {
            Target::Queue(name) | Target::Subscription { queue: name, .. } => name.clone(),
            Target::Publish(topic) => {
                return Err(GetError::NotOpenForInput {
                    name: topic.clone(),
                }
                .into())
            }
        };
        let browsing = request.browse.is_some();
        let permitted = match open.mode {
            OpenMode::Browse => browsing,
            OpenMode::Input | OpenMode::InputExclusive => !browsing,
            OpenMode::Output => false,
        };
        if !permitted {
            return Err(GetError::NotOpenForInput { name }.into());
        }

        let queue = self
            .queues
            .get_mut(&name)
            .ok_or_else(|| OpenError::NotFound { name: name.clone() })?;
        if queue.definition.get_inhibited {
            return Err(GetError::Inhibited { name }.into());
        }

        let expired = queue.expire(Instant::now());
        if expired > 0 {
            debug!(target: "mq_broker", queue = %name, expired, "expired messages discarded");
        }

        let after = match request.browse {
            Some(BrowsePosition::After(seq)) => Some(seq),
            _ => None,
        };
        let Some(index) = queue.find(after, |m| request.filter.matches(m)) else {
            return Ok(None);
        };

        let length = queue.messages[index].message.len();
        if let Some(capacity) = request.buffer_capacity {
            if length > capacity && !request.accept_truncated {
                return Err(GetError::Truncated {
                    message_length: length,
                    buffer_capacity: capacity,
                }
                .into());
            }
        }

        if browsing {
            let stored = &queue.messages[index];
            return Ok(Some(Delivery {
                message: stored.message.clone(),
                sequence: stored.seq,
            }));
        }

        let Some(stored) = queue.messages.remove(index) else {
            return Ok(None);
        };
        let delivery = Delivery {
            message: stored.message.clone(),
            sequence: stored.seq,
        };
        if request.syncpoint {
            s.uow.gets.push((name, stored));
        }
        Ok(Some(delivery))
    }

    pub fn commit(&mut self, session: SessionId) -> MqResult<()> {
        let uow = std::mem::take(&mut self.sessions.get_mut(&session).ok_or_else(session_ended)?.uow);
        if uow.is_empty() {
            return Ok(());
        }

        let mut command_queue_touched = false;
        let (puts, gets) = (uow.puts.len(), uow.gets.len());
        for (name, stored) in uow.puts {
            if let Some(queue) = self.queues.get_mut(&name) {
                queue.staged_puts = queue.staged_puts.saturating_sub(1);
                queue.insert(stored);
                command_queue_touched |= name == COMMAND_QUEUE;
            }
        }
        debug!(target: "mq_broker", session, puts, gets, "unit of work committed");

        if command_queue_touched {
            command_server::service(self);
        }
        Ok(())
    }

    pub fn backout(&mut self, session: SessionId) -> MqResult<()> {
        let uow = std::mem::take(&mut self.sessions.get_mut(&session).ok_or_else(session_ended)?.uow);
        let (puts, gets) = (uow.puts.len(), uow.gets.len());
        self.apply_backout(uow);
        debug!(target: "mq_broker", session, puts, gets, "unit of work backed out");
        Ok(())
    }

    /// Discard staged puts and return gotten messages, requeueing any whose
    /// backout count reached the queue's threshold
    fn apply_backout(&mut self, uow: UnitOfWork) {
        for (name, _) in &uow.puts {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.staged_puts = queue.staged_puts.saturating_sub(1);
            }
        }

        for (name, mut stored) in uow.gets {
            stored.message.headers.backout_count += 1;
            let Some(queue) = self.queues.get(&name) else {
                continue;
            };

            let threshold = queue.definition.backout_threshold;
            let destination = match &queue.definition.backout_requeue {
                Some(requeue)
                    if threshold > 0
                        && stored.message.headers.backout_count >= threshold
                        && self.queues.contains_key(requeue) =>
                {
                    warn!(
                        target: "mq_broker",
                        queue = %name,
                        requeue = %requeue,
                        backout_count = stored.message.headers.backout_count,
                        "backout threshold reached, requeueing message"
                    );
                    requeue.clone()
                }
                _ => name,
            };

            if let Some(queue) = self.queues.get_mut(&destination) {
                queue.insert(stored);
            }
        }
    }

    pub fn inquire(&self, session: SessionId, name: &str) -> MqResult<QueueStatus> {
        if !self.sessions.contains_key(&session) {
            return Err(session_ended());
        }
        let queue = self
            .queues
            .get(name)
            .filter(|q| !q.managed)
            .ok_or_else(|| OpenError::NotFound {
                name: name.to_string(),
            })?;
        Ok(QueueStatus {
            name: name.to_string(),
            depth: queue.depth(),
            open_input_count: queue.open_input,
            open_output_count: queue.open_output,
        })
    }
}

/// `PREFIX.*` style prefixes have the trailing `*` replaced by a unique suffix
fn dynamic_queue_name(prefix: &str, object: ObjectId) -> String {
    let prefix = prefix.trim_end_matches('*');
    let prefix: String = prefix.chars().take(32).collect();
    format!("{prefix}{object:016X}")
}
