//! Asynchronous puts
//!
//! Async puts return to the caller as soon as the message is queued locally.
//! A per-connection worker sends them in order and tallies the outcomes until
//! the application drains the status.

use crate::connection::client::{ConnectionInner, Interruption};
use crate::error::{MqError, MqResult};
use crate::message::Message;
use crate::transport::{PutReceipt, PutRequest};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Outcome of the async puts since the last drain
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AsyncPutStatus {
    pub succeeded: u64,
    /// Delivered with a warning, such as a publish nobody subscribed to
    pub warned: u64,
    pub failed: u64,
    pub first_error: Option<MqError>,
}

impl AsyncPutStatus {
    pub fn total(&self) -> u64 {
        self.succeeded + self.warned + self.failed
    }

    fn record(&mut self, result: MqResult<PutReceipt>) {
        match result {
            Ok(receipt) if receipt.warning.is_some() => self.warned += 1,
            Ok(_) => self.succeeded += 1,
            Err(err) => {
                self.failed += 1;
                self.first_error.get_or_insert(err);
            }
        }
    }
}

#[derive(Debug)]
enum Job {
    Put {
        key: u64,
        name: String,
        message: Message,
    },
    /// Answered once every job queued before it has finished
    Flush(oneshot::Sender<()>),
}

/// The async put worker of one connection
#[derive(Debug)]
pub(crate) struct AsyncPutQueue {
    tx: mpsc::Sender<Job>,
    status: Arc<Mutex<AsyncPutStatus>>,
    worker: JoinHandle<()>,
}

impl AsyncPutQueue {
    fn start(inner: &Arc<ConnectionInner>) -> Self {
        let (tx, rx) = mpsc::channel(inner.options.defaults.async_put_queue.max(1));
        let status = Arc::new(Mutex::new(AsyncPutStatus::default()));
        let worker = tokio::spawn(run_worker(
            Arc::downgrade(inner),
            rx,
            Arc::clone(&status),
        ));
        Self { tx, status, worker }
    }

    /// Wait until everything queued so far has been sent
    pub(crate) async fn flush(&self) {
        flush(&self.tx).await;
    }

    /// Stop the worker once it has drained its queue
    pub(crate) async fn shutdown(self) {
        let Self { tx, worker, .. } = self;
        drop(tx);
        let mut worker = worker;
        if tokio::time::timeout(WORKER_STOP_TIMEOUT, &mut worker)
            .await
            .is_err()
        {
            warn!(target: "mq_engine", "async put worker did not stop in time, aborting");
            worker.abort();
        }
    }
}

async fn flush(tx: &mpsc::Sender<Job>) {
    let (done_tx, done_rx) = oneshot::channel();
    if tx.send(Job::Flush(done_tx)).await.is_ok() {
        let _ = done_rx.await;
    }
}

async fn run_worker(
    connection: Weak<ConnectionInner>,
    mut rx: mpsc::Receiver<Job>,
    status: Arc<Mutex<AsyncPutStatus>>,
) {
    while let Some(job) = rx.recv().await {
        match job {
            Job::Put { key, name, message } => {
                let result = match connection.upgrade() {
                    Some(inner) => send(&inner, key, &name, message).await,
                    None => Err(MqError::NotConnected),
                };
                if let Err(err) = &result {
                    debug!(target: "mq_engine", %name, error = %err, "async put failed");
                }
                status
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .record(result);
            }
            Job::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

async fn send(
    inner: &ConnectionInner,
    key: u64,
    name: &str,
    message: Message,
) -> MqResult<PutReceipt> {
    inner
        .with_object(
            key,
            name,
            Interruption::PutInterrupted,
            None,
            |broker, session, object| {
                let message = message.clone();
                async move {
                    broker
                        .put(session, object, message, PutRequest::default())
                        .await
                }
            },
        )
        .await
}

/// Queue a put on the connection's worker, starting it on first use
pub(crate) async fn submit(
    inner: &Arc<ConnectionInner>,
    key: u64,
    name: String,
    message: Message,
) -> MqResult<()> {
    if inner.is_shutting_down() {
        return Err(MqError::NotConnected);
    }
    let tx = {
        let mut slot = inner.async_puts();
        slot.get_or_insert_with(|| AsyncPutQueue::start(inner))
            .tx
            .clone()
    };
    tx.send(Job::Put { key, name, message })
        .await
        .map_err(|_| MqError::NotConnected)
}

/// Wait for the async puts queued so far, leaving the tally alone
pub(crate) async fn settle(inner: &ConnectionInner) {
    let tx = inner.async_puts().as_ref().map(|queue| queue.tx.clone());
    if let Some(tx) = tx {
        flush(&tx).await;
    }
}

/// Wait for outstanding async puts, then take and reset the tally
pub(crate) async fn drain(inner: &ConnectionInner) -> AsyncPutStatus {
    let handles = inner
        .async_puts()
        .as_ref()
        .map(|queue| (queue.tx.clone(), Arc::clone(&queue.status)));
    let Some((tx, status)) = handles else {
        return AsyncPutStatus::default();
    };

    flush(&tx).await;
    let mut tally = status.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    std::mem::take(&mut *tally)
}
