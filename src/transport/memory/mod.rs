//! In-process queue manager
//!
//! `MemoryBroker` implements [`Broker`] entirely in memory. It provides local
//! and model queues, dynamic queues, syncpoint staging, non-durable topic
//! subscriptions, message expiry, backout requeueing and a command server for
//! admin requests.
//!
//! It also exposes fault injection used to exercise reconnection and admin
//! failure paths: severing session links, making endpoints unreachable,
//! restarting (losing non-persistent messages), stopping or hanging the
//! command server, quiescing, and denying authority.
//!
//! All state sits behind one mutex that is never held across an await.

mod command_server;
pub mod queue;
mod state;
pub mod topic;

pub use command_server::CommandServerState;
pub use queue::{QueueDefinition, QueueType, DEFAULT_MAX_DEPTH, DEFAULT_MAX_MESSAGE_LENGTH};

use self::state::QmState;
use super::{
    Broker, CloseRequest, Delivery, DynamicLifetime, GetRequest, LinkStatus, ObjectId, ObjectSpec,
    OpenedObject, PutReceipt, PutRequest, QueueStatus, SessionId, SessionInfo, SessionRequest,
    WaitTimeout,
};
use crate::admin::{COMMAND_QUEUE, DEFAULT_MODEL_QUEUE, DURABLE_MODEL_QUEUE};
use crate::error::{GetError, MqError, MqResult};
use crate::message::Message;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::info;

/// In-process queue manager; clones share the same queue manager
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<QmState>>,
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryBroker")
            .field("queue_manager", &state.name)
            .field("sessions", &state.sessions.len())
            .field("queues", &state.queues.len())
            .finish()
    }
}

impl MemoryBroker {
    /// A running queue manager with the system queues defined and the command server started
    pub fn new(queue_manager: &str) -> Self {
        let mut state = QmState::new(queue_manager);
        state.define(QueueDefinition::local(COMMAND_QUEUE));
        state.define(QueueDefinition::model(
            DEFAULT_MODEL_QUEUE,
            DynamicLifetime::Temporary,
        ));
        state.define(QueueDefinition::model(
            DURABLE_MODEL_QUEUE,
            DynamicLifetime::Permanent,
        ));
        command_server::set_state(&mut state, CommandServerState::Running);

        info!(target: "mq_broker", queue_manager, "in-process queue manager started");
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QmState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn queue_manager(&self) -> String {
        self.lock().name.clone()
    }

    /// Define a queue, replacing the attributes of an existing one
    pub fn define_queue(&self, definition: QueueDefinition) {
        self.lock().define(definition);
    }

    /// Committed depth of a queue
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        self.lock().queues.get(name).map(|q| q.depth())
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Break every session's link, as a network failure would
    pub fn sever_links(&self) -> usize {
        let severed = self.lock().sever_all("connection broken");
        info!(target: "mq_broker", severed, "session links severed");
        severed
    }

    /// Accept or refuse new sessions on every host
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Accept or refuse new sessions addressed to one host
    pub fn set_host_reachable(&self, host: &str, reachable: bool) {
        let mut state = self.lock();
        if reachable {
            state.unreachable_hosts.remove(host);
        } else {
            state.unreachable_hosts.insert(host.to_string());
        }
    }

    /// End all sessions and drop non-persistent messages
    pub fn restart(&self) {
        self.lock().restart();
    }

    pub fn quiesce(&self) {
        self.lock().quiescing = true;
    }

    pub fn resume(&self) {
        self.lock().quiescing = false;
    }

    pub fn command_server_state(&self) -> CommandServerState {
        self.lock().command_server
    }

    pub fn start_command_server(&self) {
        command_server::set_state(&mut self.lock(), CommandServerState::Running);
    }

    pub fn stop_command_server(&self) {
        command_server::set_state(&mut self.lock(), CommandServerState::Stopped);
    }

    /// Keep the command queue open but stop answering requests
    pub fn hang_command_server(&self) {
        command_server::set_state(&mut self.lock(), CommandServerState::Unresponsive);
    }

    /// Require credentials and register a user
    pub fn add_user(&self, user: &str, password: &str) {
        self.lock()
            .users
            .insert(user.to_string(), password.to_string());
    }

    /// Refuse `user` authority to open `object`
    pub fn deny(&self, user: &str, object: &str) {
        self.lock()
            .denied
            .insert((user.to_string(), object.to_string()));
    }

    /// Put a message directly onto a queue, outside any session
    pub fn inject(&self, queue: &str, message: Message) -> MqResult<()> {
        let mut state = self.lock();
        let seq = state.next_sequence();
        let queue_ref = state.queues.get_mut(queue).ok_or_else(|| {
            MqError::from(crate::error::OpenError::NotFound {
                name: queue.to_string(),
            })
        })?;
        queue_ref.insert(queue::Stored {
            seq,
            expires_at: message.headers.expiry.and_then(|d| Instant::now().checked_add(d)),
            message,
        });
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, request: SessionRequest) -> MqResult<SessionInfo> {
        self.lock().connect(&request)
    }

    async fn disconnect(&self, session: SessionId) -> MqResult<()> {
        if self.lock().end_session(session, "disconnected") {
            Ok(())
        } else {
            Err(MqError::connection_lost("session ended"))
        }
    }

    async fn link(&self, session: SessionId) -> MqResult<watch::Receiver<LinkStatus>> {
        self.lock().link(session)
    }

    async fn open(&self, session: SessionId, spec: ObjectSpec) -> MqResult<OpenedObject> {
        self.lock().open(session, spec)
    }

    async fn close(
        &self,
        session: SessionId,
        object: ObjectId,
        request: CloseRequest,
    ) -> MqResult<()> {
        self.lock().close(session, object, request)
    }

    async fn put(
        &self,
        session: SessionId,
        object: ObjectId,
        message: Message,
        request: PutRequest,
    ) -> MqResult<PutReceipt> {
        self.lock().put(session, object, message, request)
    }

    async fn get(
        &self,
        session: SessionId,
        object: ObjectId,
        request: GetRequest,
    ) -> MqResult<Delivery> {
        let deadline = match request.wait {
            WaitTimeout::Bounded(wait) => Some(Instant::now() + wait),
            WaitTimeout::NoWait | WaitTimeout::Unlimited => None,
        };
        let handles = self.lock().wait_handles(session, object);
        let (notify, mut link) = handles?;

        loop {
            // Register for wake-ups before looking, so a put between the
            // look and the wait is not missed
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let found = self.lock().try_get(session, object, &request);
            if let Some(delivery) = found? {
                return Ok(delivery);
            }
            if request.wait == WaitTimeout::NoWait {
                return Err(GetError::NoMessageAvailable.into());
            }

            let down = match &*link.borrow() {
                LinkStatus::Down(reason) => Some(reason.clone()),
                LinkStatus::Up => None,
            };
            if let Some(reason) = down {
                return Err(MqError::connection_lost(reason));
            }

            let expired = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = expired => return Err(GetError::NoMessageAvailable.into()),
                changed = link.changed() => {
                    if changed.is_err() {
                        return Err(MqError::connection_lost("session ended"));
                    }
                }
            }
        }
    }

    async fn commit(&self, session: SessionId) -> MqResult<()> {
        self.lock().commit(session)
    }

    async fn backout(&self, session: SessionId) -> MqResult<()> {
        self.lock().backout(session)
    }

    async fn inquire_queue(&self, session: SessionId, name: &str) -> MqResult<QueueStatus> {
        self.lock().inquire(session, name)
    }
}
