//! Connection handle, session supervisor and reconnection
//!
//! A [`Connection`] owns one broker session. Broker calls on a connection are
//! serialized by an async call lock held for the whole call, waiting gets
//! included. A background supervisor watches the session's link; when it goes
//! down the connection either becomes `Broken` or, with a reconnect policy,
//! reestablishes the session and reopens every destination still open.

use super::events::{ConnectionEvent, EventStream, EVENT_CHANNEL_CAPACITY};
use super::health_monitor::{HealthMetrics, HealthMonitor, LinkEvent, ReconnectionDecision};
use super::state::{Backpressure, ConnectOptions, ConnectionState};
use crate::engine::async_put::AsyncPutQueue;
use crate::error::{ConnectError, GetError, MqError, MqResult, PutError, Warning};
use crate::transport::{
    BrokerPtr, CloseRequest, DynamicLifetime, LinkStatus, ObjectId, ObjectSpec, OpenedObject,
    QueueStatus, SessionId, SessionInfo, SessionRequest,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

const SUPERVISOR_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What a broker call turns into when the session link drops underneath it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interruption {
    /// Safe to repeat on the reestablished session
    Retry,
    /// A put outside syncpoint may or may not have landed
    PutInterrupted,
    /// Syncpoint work was backed out with the session
    PutBackedOut,
    GetBackedOut,
    CommitFailed,
}

impl Interruption {
    fn into_error(self, reason: &str) -> Option<MqError> {
        match self {
            Interruption::Retry => None,
            Interruption::PutInterrupted => Some(PutError::CallInterrupted.into()),
            Interruption::PutBackedOut => Some(PutError::BackedOut.into()),
            Interruption::GetBackedOut => Some(GetError::BackedOut.into()),
            Interruption::CommitFailed => Some(MqError::CommitFailed {
                code: crate::error::reason::BACKED_OUT,
                reason: format!("session lost before commit: {reason}"),
            }),
        }
    }
}

#[derive(Debug, Clone)]
struct SessionSlot {
    session: SessionId,
    queue_manager: String,
    /// Bumped on every reestablished session
    generation: u64,
}

/// An open object the supervisor replays after a reconnect
#[derive(Debug, Clone)]
struct ObjectRecord {
    spec: ObjectSpec,
    object: ObjectId,
    resolved_name: String,
    dynamic: Option<DynamicLifetime>,
    /// False once a reopen failed; the handle can only be closed
    valid: bool,
}

impl ObjectRecord {
    /// Spec that recreates this object on a new session
    fn reopen_spec(&self) -> ObjectSpec {
        match self.dynamic {
            // the queue outlived the session; open it by name
            Some(DynamicLifetime::Permanent) => ObjectSpec {
                name: self.resolved_name.clone(),
                dynamic_prefix: None,
                ..self.spec.clone()
            },
            // recreated from the model under a new name
            Some(DynamicLifetime::Temporary) | None => self.spec.clone(),
        }
    }
}

/// Open unit of work on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TransactionSlot {
    pub id: u64,
    pub generation: u64,
}

#[derive(Debug, Default)]
struct HealthStamps {
    connected_at: Option<Instant>,
    last_activity: Option<Instant>,
    reconnect_count: u32,
}

pub(crate) struct ConnectionInner {
    pub(crate) id: u64,
    pub(crate) broker: BrokerPtr,
    pub(crate) options: ConnectOptions,
    call_lock: tokio::sync::Mutex<()>,
    session: Mutex<Option<SessionSlot>>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<ConnectionEvent>,
    shutdown_tx: watch::Sender<bool>,
    records: Mutex<HashMap<u64, ObjectRecord>>,
    next_key: AtomicU64,
    transaction: Mutex<Option<TransactionSlot>>,
    async_puts: Mutex<Option<AsyncPutQueue>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    stamps: Mutex<HealthStamps>,
}

impl std::fmt::Debug for ConnectionInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionInner")
            .field("id", &self.id)
            .field("endpoint", &self.options.endpoint)
            .field("state", &*self.state_tx.borrow())
            .finish()
    }
}

impl ConnectionInner {
    pub(crate) fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    fn transition(&self, event: LinkEvent) {
        let current = self.state();
        let next = HealthMonitor::determine_next_state(&current, event);
        if next != current {
            HealthMonitor::log_state_transition(&current, &next);
            self.state_tx.send_replace(next);
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        // No receivers is fine; events are informational
        let _ = self.events_tx.send(event);
    }

    fn touch(&self) {
        lock(&self.stamps).last_activity = Some(Instant::now());
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub(crate) fn current_generation(&self) -> Option<u64> {
        lock(&self.session).as_ref().map(|slot| slot.generation)
    }

    pub(crate) fn queue_manager(&self) -> Option<String> {
        lock(&self.session)
            .as_ref()
            .map(|slot| slot.queue_manager.clone())
    }

    pub(crate) fn transaction_slot(&self) -> MutexGuard<'_, Option<TransactionSlot>> {
        lock(&self.transaction)
    }

    pub(crate) fn async_puts(&self) -> MutexGuard<'_, Option<AsyncPutQueue>> {
        lock(&self.async_puts)
    }

    /// Wait until the connection is usable on a session newer than `after`
    ///
    /// While reconnecting the caller is held back as the backpressure setting
    /// says: queued up to its timeout, or rejected at once.
    pub(crate) async fn await_session(&self, after: Option<u64>) -> MqResult<u64> {
        let mut state_rx = self.state_tx.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let started = tokio::time::Instant::now();
        let limit = match self.options.backpressure {
            Backpressure::Queue { timeout } => timeout,
            Backpressure::Reject => self.options.connect_timeout,
        };

        loop {
            let state = state_rx.borrow_and_update().clone();
            match state {
                ConnectionState::Connected => {
                    if let Some(generation) = self.current_generation() {
                        if Some(generation) != after {
                            return Ok(generation);
                        }
                    }
                }
                ConnectionState::Reconnecting { .. } => {
                    if self.options.backpressure == Backpressure::Reject {
                        return Err(MqError::Reconnecting {
                            waited: started.elapsed(),
                        });
                    }
                    // the supervisor stops reconnecting once shutdown is signalled
                    if *shutdown_rx.borrow() {
                        return Err(MqError::NotConnected);
                    }
                }
                ConnectionState::Broken(reason) => return Err(MqError::connection_lost(reason)),
                ConnectionState::Disconnected => return Err(MqError::NotConnected),
                ConnectionState::Connecting => {}
            }

            let Some(remaining) = limit.checked_sub(started.elapsed()) else {
                return Err(MqError::Reconnecting {
                    waited: started.elapsed(),
                });
            };
            let changed = async {
                tokio::select! {
                    changed = state_rx.changed() => changed.is_ok(),
                    _ = shutdown_rx.wait_for(|shutdown| *shutdown) => false,
                }
            };
            match tokio::time::timeout(remaining, changed).await {
                Ok(true) => continue,
                Ok(false) => return Err(MqError::NotConnected),
                Err(_) => {
                    return Err(MqError::Reconnecting {
                        waited: started.elapsed(),
                    })
                }
            }
        }
    }

    /// Run a broker call on the current session under the call lock
    ///
    /// `pinned` ties the call to one session generation: once the session has
    /// been replaced the call fails with its interruption error instead of
    /// running. Link loss during the call is classified by `interruption`.
    pub(crate) async fn with_session<T, F, Fut>(
        &self,
        interruption: Interruption,
        pinned: Option<u64>,
        mut op: F,
    ) -> MqResult<T>
    where
        F: FnMut(BrokerPtr, SessionId) -> Fut,
        Fut: Future<Output = MqResult<T>>,
    {
        let mut after = None;
        loop {
            self.await_session(after).await?;

            let guard = self.call_lock.lock().await;
            let Some(slot) = lock(&self.session).clone() else {
                return Err(MqError::NotConnected);
            };
            if let Some(pinned) = pinned {
                if pinned != slot.generation {
                    return Err(interruption
                        .into_error("session replaced")
                        .unwrap_or_else(|| MqError::connection_lost("session replaced")));
                }
            }

            let result = op(self.broker.clone(), slot.session).await;
            drop(guard);

            match result {
                Ok(value) => {
                    self.touch();
                    return Ok(value);
                }
                Err(MqError::ConnectionLost(reason)) => {
                    if !self.options.reconnect.is_enabled() || self.is_shutting_down() {
                        return Err(MqError::ConnectionLost(reason));
                    }
                    if let Some(err) = interruption.into_error(&reason) {
                        debug!(target: "mq_connection", connection = self.id, %reason, "call interrupted by link loss");
                        return Err(err);
                    }
                    debug!(target: "mq_connection", connection = self.id, %reason, "retrying call after reconnect");
                    after = Some(slot.generation);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Like [`with_session`](Self::with_session) for a call on an open object
    pub(crate) async fn with_object<T, F, Fut>(
        &self,
        key: u64,
        name: &str,
        interruption: Interruption,
        pinned: Option<u64>,
        mut op: F,
    ) -> MqResult<T>
    where
        F: FnMut(BrokerPtr, SessionId, ObjectId) -> Fut,
        Fut: Future<Output = MqResult<T>>,
    {
        self.with_session(interruption, pinned, |broker, session| {
            let call = self
                .object_id(key, name)
                .map(|object| op(broker, session, object));
            async move { call?.await }
        })
        .await
    }

    fn object_id(&self, key: u64, name: &str) -> MqResult<ObjectId> {
        match lock(&self.records).get(&key) {
            Some(record) if record.valid => Ok(record.object),
            _ => Err(MqError::HandleClosed {
                name: name.to_string(),
            }),
        }
    }

    /// Open an object and register it for replay after reconnects
    pub(crate) async fn open_object(&self, spec: ObjectSpec) -> MqResult<(u64, OpenedObject)> {
        self.with_session(Interruption::Retry, None, |broker, session| {
            let spec = spec.clone();
            async move {
                let opened = broker.open(session, spec.clone()).await?;
                // registered under the call lock so a reconnect cannot miss it
                let key = self.next_key.fetch_add(1, Ordering::Relaxed);
                lock(&self.records).insert(
                    key,
                    ObjectRecord {
                        spec,
                        object: opened.object,
                        resolved_name: opened.resolved_name.clone(),
                        dynamic: opened.dynamic,
                        valid: true,
                    },
                );
                Ok((key, opened))
            }
        })
        .await
    }

    /// Whether `key` is still registered on this connection
    pub(crate) fn holds_object(&self, key: u64) -> bool {
        lock(&self.records).contains_key(&key)
    }

    /// Drop the local record of an object without a broker call
    pub(crate) fn forget_object(&self, key: u64) {
        lock(&self.records).remove(&key);
    }

    /// Name an object currently has; temporary dynamic queues are renamed by reconnects
    pub(crate) fn resolved_name(&self, key: u64) -> Option<String> {
        lock(&self.records)
            .get(&key)
            .map(|record| record.resolved_name.clone())
    }

    /// Close an object; the handle is gone afterwards whatever the outcome
    pub(crate) async fn close_object(
        &self,
        key: u64,
        name: &str,
        request: CloseRequest,
    ) -> MqResult<()> {
        let result = self
            .with_object(key, name, Interruption::Retry, None, |broker, session, object| {
                async move { broker.close(session, object, request).await }
            })
            .await;
        lock(&self.records).remove(&key);
        result
    }

    pub(crate) async fn inquire_queue(&self, name: &str) -> MqResult<QueueStatus> {
        self.with_session(Interruption::Retry, None, |broker, session| {
            let name = name.to_string();
            async move { broker.inquire_queue(session, &name).await }
        })
        .await
    }

    /// Run `fut` unless the connection shuts down first
    pub(crate) async fn until_shutdown<T>(
        &self,
        fut: impl Future<Output = MqResult<T>>,
    ) -> MqResult<T> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow() {
            return Err(MqError::NotConnected);
        }
        tokio::select! {
            result = fut => result,
            _ = shutdown_rx.wait_for(|shutdown| *shutdown) => Err(MqError::NotConnected),
        }
    }

    /// Reestablish the session and replay opens; holds the call lock throughout
    async fn reestablish(&self, attempt: u32) -> MqResult<watch::Receiver<LinkStatus>> {
        let _guard = self.call_lock.lock().await;
        let endpoint = HealthMonitor::select_endpoint(&self.options, attempt).clone();
        let info = establish_session(&self.broker, &self.options, &endpoint).await?;

        let original = self.queue_manager().unwrap_or_default();
        if !HealthMonitor::accepts_queue_manager(
            self.options.reconnect,
            &original,
            &info.queue_manager,
        ) {
            let _ = self.broker.disconnect(info.session).await;
            return Err(ConnectError::EndpointUnavailable {
                endpoint: endpoint.to_string(),
                reason: format!(
                    "reached queue manager '{}' instead of '{}'",
                    info.queue_manager, original
                ),
            }
            .into());
        }

        let snapshot: Vec<(u64, ObjectSpec)> = lock(&self.records)
            .iter()
            .filter(|(_, record)| record.valid)
            .map(|(key, record)| (*key, record.reopen_spec()))
            .collect();

        let mut reopened = Vec::with_capacity(snapshot.len());
        for (key, spec) in snapshot {
            match self.broker.open(info.session, spec.clone()).await {
                Ok(opened) => reopened.push((key, Some(opened))),
                Err(err @ MqError::ConnectionLost(_)) => return Err(err),
                Err(err) => {
                    warn!(target: "mq_connection", connection = self.id, name = %spec.name, error = %err, "destination could not be reopened");
                    reopened.push((key, None));
                }
            }
        }
        let link = self.broker.link(info.session).await?;

        {
            let mut records = lock(&self.records);
            for (key, opened) in reopened {
                let Some(record) = records.get_mut(&key) else {
                    continue;
                };
                match opened {
                    Some(opened) => {
                        record.object = opened.object;
                        record.resolved_name = opened.resolved_name;
                    }
                    None => record.valid = false,
                }
            }
        }
        {
            let mut slot = lock(&self.session);
            let generation = slot.as_ref().map_or(0, |s| s.generation) + 1;
            *slot = Some(SessionSlot {
                session: info.session,
                queue_manager: info.queue_manager,
                generation,
            });
        }
        {
            let mut stamps = lock(&self.stamps);
            stamps.connected_at = Some(Instant::now());
            stamps.reconnect_count += 1;
        }
        self.transition(LinkEvent::SessionEstablished);
        Ok(link)
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
        if let Some(handle) = lock(&self.supervisor).take() {
            handle.abort();
        }
        // Async operations are not possible in Drop; end the session in the background
        let session = lock(&self.session).take();
        if let (Some(slot), Ok(runtime)) = (session, tokio::runtime::Handle::try_current()) {
            let broker = self.broker.clone();
            runtime.spawn(async move {
                let _ = broker.disconnect(slot.session).await;
            });
        }
    }
}

async fn establish_session(
    broker: &BrokerPtr,
    options: &ConnectOptions,
    endpoint: &crate::transport::Endpoint,
) -> MqResult<SessionInfo> {
    let request = SessionRequest {
        endpoint: endpoint.clone(),
        credentials: options.effective_credentials(),
        client_id: options.client_id.clone(),
    };
    match tokio::time::timeout(options.connect_timeout, broker.connect(request)).await {
        Ok(result) => result,
        Err(_) => Err(ConnectError::EndpointUnavailable {
            endpoint: endpoint.to_string(),
            reason: format!("no response within {:?}", options.connect_timeout),
        }
        .into()),
    }
}

/// Sleep unless shutdown is signalled first; returns false when interrupted
async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
    if *shutdown_rx.borrow_and_update() {
        return false;
    }
    tokio::select! {
        _ = shutdown_rx.wait_for(|shutdown| *shutdown) => {
            info!(target: "mq_connection", "shutdown signalled during reconnection delay, stopping");
            false
        }
        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
    }
}

/// Resolve once the link reports down, with the reason
async fn link_down(link: &mut watch::Receiver<LinkStatus>) -> String {
    loop {
        if let LinkStatus::Down(reason) = &*link.borrow_and_update() {
            return reason.clone();
        }
        if link.changed().await.is_err() {
            return "session ended".to_string();
        }
    }
}

/// Background task watching a connection's link
async fn supervise(
    weak: Weak<ConnectionInner>,
    mut link: watch::Receiver<LinkStatus>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let reason = tokio::select! {
            _ = shutdown_rx.wait_for(|shutdown| *shutdown) => return,
            reason = link_down(&mut link) => reason,
        };
        if *shutdown_rx.borrow() {
            return;
        }
        let Some(inner) = weak.upgrade() else {
            return;
        };

        let reconnect = inner.options.reconnect.is_enabled();
        warn!(target: "mq_connection", connection = inner.id, %reason, reconnect, "session link lost");
        inner.emit(ConnectionEvent::Broken {
            reason: reason.clone(),
        });
        inner.transition(LinkEvent::LinkLost {
            reason: reason.clone(),
            reconnect,
        });
        if !reconnect {
            return;
        }
        let config = inner.options.reconnect_config.clone();
        drop(inner);

        match reconnect_loop(&weak, &config, &shutdown_rx, &reason).await {
            Some(new_link) => link = new_link,
            None => return,
        }
    }
}

async fn reconnect_loop(
    weak: &Weak<ConnectionInner>,
    config: &super::state::ReconnectConfig,
    shutdown_rx: &watch::Receiver<bool>,
    lost_reason: &str,
) -> Option<watch::Receiver<LinkStatus>> {
    let mut attempts = 0;
    let mut last_error = lost_reason.to_string();

    loop {
        let shutdown = *shutdown_rx.borrow();
        match HealthMonitor::should_attempt_reconnection(attempts, config, shutdown) {
            ReconnectionDecision::AbortShutdownRequested => return None,
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let inner = weak.upgrade()?;
                let reason = format!("reconnection failed after {attempts} attempts: {last_error}");
                error!(target: "mq_connection", connection = inner.id, %reason, "giving up on reconnection");
                inner.transition(LinkEvent::PermanentFailure(reason.clone()));
                inner.emit(ConnectionEvent::ReconnectFailed { reason });
                return None;
            }
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                attempts = attempt;
                {
                    let inner = weak.upgrade()?;
                    inner.transition(LinkEvent::ReconnectionStarted(attempt));
                    inner.emit(ConnectionEvent::Reconnecting {
                        attempt,
                        delay: Duration::from_millis(delay_ms),
                    });
                }

                if !interruptible_sleep(shutdown_rx.clone(), delay_ms).await {
                    return None;
                }

                let inner = weak.upgrade()?;
                match inner.reestablish(attempt).await {
                    Ok(link) => {
                        info!(target: "mq_connection", connection = inner.id, attempt, "session reestablished");
                        inner.emit(ConnectionEvent::Reconnected { attempt });
                        return Some(link);
                    }
                    Err(err) => {
                        warn!(target: "mq_connection", connection = inner.id, attempt, error = %err, "reconnection attempt failed");
                        last_error = err.to_string();
                    }
                }
            }
        }
    }
}

/// A client connection to a queue manager
///
/// Clones share the same session. Every broker call made through a connection
/// (or a destination or transaction it created) is serialized; one call is in
/// flight at a time, and a waiting get holds the connection until it returns.
#[derive(Debug, Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
    warning: Option<Warning>,
}

impl Connection {
    pub(crate) fn inner(&self) -> &Arc<ConnectionInner> {
        &self.inner
    }

    pub(crate) fn from_inner(inner: Arc<ConnectionInner>) -> Self {
        Self {
            inner,
            warning: None,
        }
    }

    async fn establish(broker: BrokerPtr, options: ConnectOptions) -> MqResult<Self> {
        if options.reconnect.is_enabled() {
            HealthMonitor::validate_reconnect_config(&options.reconnect_config)
                .map_err(MqError::InvalidArgument)?;
        }

        let mut candidates = vec![options.endpoint.clone()];
        candidates.extend(options.alternate_endpoints.iter().cloned());

        let mut last_error = None;
        let mut established = None;
        for endpoint in &candidates {
            match establish_session(&broker, &options, endpoint).await {
                Ok(info) => {
                    established = Some(info);
                    break;
                }
                Err(err @ MqError::Connect(ConnectError::Auth { .. })) => return Err(err),
                Err(err) => {
                    debug!(target: "mq_connection", endpoint = %endpoint, error = %err, "endpoint unavailable");
                    last_error = Some(err);
                }
            }
        }
        let Some(info) = established else {
            return Err(last_error.unwrap_or(MqError::NotConnected));
        };
        let link = broker.link(info.session).await?;

        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let span = crate::session_span!(connection = id, queue_manager = %info.queue_manager);
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(ConnectionInner {
            id,
            broker,
            options,
            call_lock: tokio::sync::Mutex::new(()),
            session: Mutex::new(Some(SessionSlot {
                session: info.session,
                queue_manager: info.queue_manager.clone(),
                generation: 0,
            })),
            state_tx,
            events_tx,
            shutdown_tx,
            records: Mutex::new(HashMap::new()),
            next_key: AtomicU64::new(1),
            transaction: Mutex::new(None),
            async_puts: Mutex::new(None),
            supervisor: Mutex::new(None),
            stamps: Mutex::new(HealthStamps {
                connected_at: Some(Instant::now()),
                ..Default::default()
            }),
        });

        let handle = tokio::spawn(
            supervise(Arc::downgrade(&inner), link, shutdown_rx).instrument(span),
        );
        *lock(&inner.supervisor) = Some(handle);
        inner.transition(LinkEvent::SessionEstablished);

        Ok(Self::from_inner(inner))
    }

    /// Identifier of this connection, shared by its clones
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Informational outcome of the connect that produced this handle
    pub fn warning(&self) -> Option<Warning> {
        self.warning
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        HealthMonitor::can_operate(&self.inner.state())
    }

    /// Watch state changes
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribe to session events from now on
    pub fn events(&self) -> EventStream {
        EventStream::new(self.inner.events_tx.subscribe())
    }

    /// Name of the queue manager the current session is on
    pub fn queue_manager(&self) -> Option<String> {
        self.inner.queue_manager()
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.inner.options
    }

    pub fn health_metrics(&self) -> HealthMetrics {
        let stamps = lock(&self.inner.stamps);
        let connected_at = if self.is_connected() {
            stamps.connected_at
        } else {
            None
        };
        HealthMonitor::calculate_health_metrics(
            connected_at,
            stamps.last_activity,
            stamps.reconnect_count,
        )
    }

    /// Current status of a queue
    pub async fn inquire_queue(&self, name: &str) -> MqResult<QueueStatus> {
        self.inner.inquire_queue(name).await
    }

    /// End the session
    ///
    /// Rolls back an open transaction, closes destinations still open, ends the
    /// broker session and stops the supervisor. A broken connection is cleaned
    /// up locally and reported as `ConnectionLost`.
    pub async fn disconnect(self) -> MqResult<()> {
        let inner = self.inner;
        let state = inner.state();
        let broken = match &state {
            ConnectionState::Disconnected => return Err(MqError::NotConnected),
            ConnectionState::Broken(reason) => Some(reason.clone()),
            _ => None,
        };
        // the session in hand is already gone at the broker
        let session_lost = matches!(state, ConnectionState::Reconnecting { .. });

        // cancels waiting gets first: they hold the call lock async puts need
        inner.shutdown_tx.send_replace(true);

        let pending = inner.async_puts().take();
        if let Some(queue) = pending {
            if broken.is_none() && !session_lost {
                let limit = inner.options.connect_timeout;
                if tokio::time::timeout(limit, queue.flush()).await.is_err() {
                    warn!(target: "mq_connection", connection = inner.id, "async puts not flushed in {:?}", limit);
                }
            }
            queue.shutdown().await;
        }

        let guard = inner.call_lock.lock().await;
        let slot = lock(&inner.session).take();
        let transaction = inner.transaction_slot().take();
        let records: Vec<ObjectRecord> = lock(&inner.records).drain().map(|(_, r)| r).collect();

        let mut result = Ok(());
        match (&slot, &broken) {
            (Some(_), None) if session_lost => {}
            (Some(slot), None) => {
                if transaction.is_some() {
                    if let Err(err) = inner.broker.backout(slot.session).await {
                        warn!(target: "mq_connection", connection = inner.id, error = %err, "backout during disconnect failed");
                    }
                }
                for record in records.iter().filter(|r| r.valid) {
                    if let Err(err) = inner
                        .broker
                        .close(slot.session, record.object, CloseRequest::default())
                        .await
                    {
                        debug!(target: "mq_connection", connection = inner.id, name = %record.resolved_name, error = %err, "close during disconnect failed");
                    }
                }
                result = inner.broker.disconnect(slot.session).await;
            }
            (_, Some(reason)) => result = Err(MqError::connection_lost(reason.clone())),
            (None, None) => {}
        }
        drop(guard);

        inner.transition(LinkEvent::Closed);
        let handle = lock(&inner.supervisor).take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(SUPERVISOR_JOIN_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                warn!(target: "mq_connection", connection = inner.id, "supervisor did not stop in time, aborting");
                handle.abort();
            }
        }
        info!(target: "mq_connection", connection = inner.id, closed = records.len(), "disconnected");
        result
    }
}

/// Creates connections against one broker, sharing live connections by client id
pub struct Connector {
    broker: BrokerPtr,
    registry: Mutex<HashMap<String, Weak<ConnectionInner>>>,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("registered", &lock(&self.registry).len())
            .finish()
    }
}

impl Connector {
    pub fn new(broker: BrokerPtr) -> Self {
        Self {
            broker,
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// Connect, or hand back the live connection registered under the same client id
    ///
    /// A shared connection carries [`Warning::AlreadyConnected`].
    pub async fn connect(&self, options: ConnectOptions) -> MqResult<Connection> {
        if let Some(client_id) = &options.client_id {
            let existing = lock(&self.registry).get(client_id).and_then(Weak::upgrade);
            if let Some(inner) = existing {
                if !inner.state().is_terminal() {
                    debug!(target: "mq_connection", connection = inner.id, %client_id, "reusing live connection");
                    return Ok(Connection {
                        inner,
                        warning: Some(Warning::AlreadyConnected),
                    });
                }
            }
        }

        let client_id = options.client_id.clone();
        let connection = Connection::establish(self.broker.clone(), options).await?;
        if let Some(client_id) = client_id {
            let mut registry = lock(&self.registry);
            registry.retain(|_, weak| weak.strong_count() > 0);
            registry.insert(client_id, Arc::downgrade(connection.inner()));
        }
        Ok(connection)
    }
}

/// Connect without connection sharing
pub async fn connect(broker: BrokerPtr, options: ConnectOptions) -> MqResult<Connection> {
    Connection::establish(broker, options).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::state::{ReconnectConfig, ReconnectPolicy};
    use crate::transport::{Endpoint, MemoryBroker};

    fn broker() -> (MemoryBroker, BrokerPtr) {
        let memory = MemoryBroker::new("QM1");
        let ptr: BrokerPtr = Arc::new(memory.clone());
        (memory, ptr)
    }

    fn options() -> ConnectOptions {
        ConnectOptions::new(Endpoint::memory("QM1"))
    }

    fn fast_reconnect() -> ReconnectConfig {
        ReconnectConfig {
            max_attempts: Some(3),
            backoff_pattern: vec![10, 10, 10],
            sustained_delay: 10,
        }
    }

    #[tokio::test]
    async fn test_interruptible_sleep_completes() {
        let (_tx, rx) = watch::channel(false);
        assert!(interruptible_sleep(rx, 10).await);
    }

    #[tokio::test]
    async fn test_interruptible_sleep_interrupted() {
        let (tx, rx) = watch::channel(false);
        let sleeper = tokio::spawn(interruptible_sleep(rx, 10_000));
        tokio::task::yield_now().await;
        tx.send(true).unwrap();
        assert!(!sleeper.await.unwrap());
    }

    #[tokio::test]
    async fn test_interruptible_sleep_already_shut_down() {
        let (_tx, rx) = watch::channel(true);
        assert!(!interruptible_sleep(rx, 10_000).await);
    }

    #[tokio::test]
    async fn test_connect_reaches_connected() {
        let (memory, broker) = broker();
        let connection = connect(broker, options()).await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Connected);
        assert_eq!(connection.queue_manager().as_deref(), Some("QM1"));
        assert_eq!(connection.warning(), None);
        assert_eq!(memory.session_count(), 1);
        assert!(connection.health_metrics().is_healthy);

        connection.disconnect().await.unwrap();
        assert_eq!(memory.session_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_unreachable() {
        let (memory, broker) = broker();
        memory.set_reachable(false);
        let err = connect(broker, options()).await.unwrap_err();
        assert!(matches!(
            err,
            MqError::Connect(ConnectError::EndpointUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_connect_falls_back_to_alternate() {
        let (memory, broker) = broker();
        memory.set_host_reachable("primary", false);
        let options = ConnectOptions::new(Endpoint::parse("mq://primary/QM1").unwrap())
            .alternate(Endpoint::parse("mq://backup/QM1").unwrap());
        let connection = connect(broker, options).await.unwrap();
        assert!(connection.is_connected());
    }

    #[tokio::test]
    async fn test_link_loss_without_reconnect_breaks() {
        let (memory, broker) = broker();
        let connection = connect(broker, options()).await.unwrap();
        let mut events = connection.events();
        let mut states = connection.state_changes();

        memory.sever_links();
        states
            .wait_for(|s| matches!(s, ConnectionState::Broken(_)))
            .await
            .unwrap();
        assert!(matches!(
            events.next().await,
            Some(ConnectionEvent::Broken { .. })
        ));

        let err = connection.inquire_queue("SYSTEM.ADMIN.COMMAND.QUEUE").await.unwrap_err();
        assert!(matches!(err, MqError::ConnectionLost(_)));
        assert!(err.is_fatal());

        let err = connection.disconnect().await.unwrap_err();
        assert!(matches!(err, MqError::ConnectionLost(_)));
    }

    #[tokio::test]
    async fn test_reconnect_after_link_loss() {
        let (memory, broker) = broker();
        let connection = connect(
            broker,
            options()
                .reconnect(ReconnectPolicy::Reconnect)
                .reconnect_config(fast_reconnect()),
        )
        .await
        .unwrap();
        let mut events = connection.events();

        memory.sever_links();
        let mut seen = Vec::new();
        while let Some(event) = events.next().await {
            let done = matches!(event, ConnectionEvent::Reconnected { .. });
            seen.push(event);
            if done {
                break;
            }
        }
        assert!(matches!(seen[0], ConnectionEvent::Broken { .. }));
        assert!(matches!(
            seen[1],
            ConnectionEvent::Reconnecting { attempt: 1, .. }
        ));
        assert_eq!(
            seen.last(),
            Some(&ConnectionEvent::Reconnected { attempt: 1 })
        );
        assert!(connection.is_connected());
        assert_eq!(connection.health_metrics().reconnect_count, 1);
        assert!(connection.inquire_queue("SYSTEM.ADMIN.COMMAND.QUEUE").await.is_ok());
    }

    #[tokio::test]
    async fn test_reconnect_gives_up_after_max_attempts() {
        let (memory, broker) = broker();
        let connection = connect(
            broker,
            options()
                .reconnect(ReconnectPolicy::Reconnect)
                .reconnect_config(fast_reconnect()),
        )
        .await
        .unwrap();
        let mut events = connection.events();

        memory.set_reachable(false);
        memory.sever_links();

        let mut failed = None;
        while let Some(event) = events.next().await {
            if let ConnectionEvent::ReconnectFailed { reason } = event {
                failed = Some(reason);
                break;
            }
        }
        assert!(failed.unwrap().contains("3 attempts"));
        assert!(matches!(connection.state(), ConnectionState::Broken(_)));

        let err = connection.inquire_queue("ANY").await.unwrap_err();
        assert!(matches!(err, MqError::ConnectionLost(_)));
    }

    #[tokio::test]
    async fn test_reject_backpressure_while_reconnecting() {
        let (memory, broker) = broker();
        let connection = connect(
            broker,
            options()
                .reconnect(ReconnectPolicy::Reconnect)
                .reconnect_config(ReconnectConfig {
                    max_attempts: None,
                    backoff_pattern: vec![],
                    sustained_delay: 60_000,
                })
                .backpressure(Backpressure::Reject),
        )
        .await
        .unwrap();
        let mut states = connection.state_changes();

        memory.sever_links();
        states
            .wait_for(|s| matches!(s, ConnectionState::Reconnecting { .. }))
            .await
            .unwrap();

        let err = connection.inquire_queue("ANY").await.unwrap_err();
        assert!(matches!(err, MqError::Reconnecting { .. }));
        connection.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_connector_shares_live_connection() {
        let (memory, broker) = broker();
        let connector = Connector::new(broker);

        let first = connector
            .connect(options().client_id("app-1"))
            .await
            .unwrap();
        let second = connector
            .connect(options().client_id("app-1"))
            .await
            .unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(second.warning(), Some(Warning::AlreadyConnected));
        assert_eq!(memory.session_count(), 1);

        let other = connector
            .connect(options().client_id("app-2"))
            .await
            .unwrap();
        assert_ne!(other.id(), first.id());
    }

    #[tokio::test]
    async fn test_disconnect_twice_is_not_connected() {
        let (_memory, broker) = broker();
        let connection = connect(broker, options()).await.unwrap();
        let clone = connection.clone();
        connection.disconnect().await.unwrap();
        assert_eq!(clone.state(), ConnectionState::Disconnected);
        assert_eq!(clone.disconnect().await, Err(MqError::NotConnected));
    }

    #[tokio::test]
    async fn test_dropping_last_handle_ends_session() {
        let (memory, broker) = broker();
        let connection = connect(broker, options()).await.unwrap();
        drop(connection);
        for _ in 0..50 {
            if memory.session_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(memory.session_count(), 0);
    }
}
