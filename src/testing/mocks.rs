//! Mock broker for testing
//!
//! `MockBroker` forwards every call to a [`MemoryBroker`] but can be scripted
//! to fail chosen calls, and records how often each call was made.

use crate::error::{MqError, MqResult};
use crate::message::Message;
use crate::transport::memory::MemoryBroker;
use crate::transport::{
    Broker, CloseRequest, Delivery, GetRequest, LinkStatus, ObjectId, ObjectSpec, OpenedObject,
    PutReceipt, PutRequest, QueueStatus, SessionId, SessionInfo, SessionRequest,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Broker operations that can be scripted to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerCall {
    Connect,
    Disconnect,
    Link,
    Open,
    Close,
    Put,
    Get,
    Commit,
    Backout,
    InquireQueue,
}

#[derive(Debug, Default)]
struct Script {
    failures: HashMap<BrokerCall, VecDeque<MqError>>,
    calls: HashMap<BrokerCall, usize>,
}

/// Scriptable broker backed by an in-process queue manager
#[derive(Debug, Clone)]
pub struct MockBroker {
    inner: MemoryBroker,
    script: Arc<Mutex<Script>>,
}

impl MockBroker {
    pub fn new(queue_manager: &str) -> Self {
        Self::wrap(MemoryBroker::new(queue_manager))
    }

    pub fn wrap(inner: MemoryBroker) -> Self {
        Self {
            inner,
            script: Arc::new(Mutex::new(Script::default())),
        }
    }

    /// The queue manager behind the mock, for setup and fault injection
    pub fn memory(&self) -> &MemoryBroker {
        &self.inner
    }

    /// Fail the next `call` with `error`; repeated calls queue further failures
    pub fn fail_next(&self, call: BrokerCall, error: MqError) {
        self.lock()
            .failures
            .entry(call)
            .or_default()
            .push_back(error);
    }

    /// How many times `call` reached the broker, failed or not
    pub fn call_count(&self, call: BrokerCall) -> usize {
        self.lock().calls.get(&call).copied().unwrap_or(0)
    }

    pub fn reset(&self) {
        *self.lock() = Script::default();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(&self, call: BrokerCall) -> MqResult<()> {
        let mut script = self.lock();
        *script.calls.entry(call).or_default() += 1;
        match script.failures.get_mut(&call).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn connect(&self, request: SessionRequest) -> MqResult<SessionInfo> {
        self.check(BrokerCall::Connect)?;
        self.inner.connect(request).await
    }

    async fn disconnect(&self, session: SessionId) -> MqResult<()> {
        self.check(BrokerCall::Disconnect)?;
        self.inner.disconnect(session).await
    }

    async fn link(&self, session: SessionId) -> MqResult<watch::Receiver<LinkStatus>> {
        self.check(BrokerCall::Link)?;
        self.inner.link(session).await
    }

    async fn open(&self, session: SessionId, spec: ObjectSpec) -> MqResult<OpenedObject> {
        self.check(BrokerCall::Open)?;
        self.inner.open(session, spec).await
    }

    async fn close(
        &self,
        session: SessionId,
        object: ObjectId,
        request: CloseRequest,
    ) -> MqResult<()> {
        self.check(BrokerCall::Close)?;
        self.inner.close(session, object, request).await
    }

    async fn put(
        &self,
        session: SessionId,
        object: ObjectId,
        message: Message,
        request: PutRequest,
    ) -> MqResult<PutReceipt> {
        self.check(BrokerCall::Put)?;
        self.inner.put(session, object, message, request).await
    }

    async fn get(
        &self,
        session: SessionId,
        object: ObjectId,
        request: GetRequest,
    ) -> MqResult<Delivery> {
        self.check(BrokerCall::Get)?;
        self.inner.get(session, object, request).await
    }

    async fn commit(&self, session: SessionId) -> MqResult<()> {
        self.check(BrokerCall::Commit)?;
        self.inner.commit(session).await
    }

    async fn backout(&self, session: SessionId) -> MqResult<()> {
        self.check(BrokerCall::Backout)?;
        self.inner.backout(session).await
    }

    async fn inquire_queue(&self, session: SessionId, name: &str) -> MqResult<QueueStatus> {
        self.check(BrokerCall::InquireQueue)?;
        self.inner.inquire_queue(session, name).await
    }
}
