//! Transaction coordinator
//!
//! A [`Transaction`] is the unit of work of one connection. Puts and gets made
//! through it are staged at the broker under syncpoint and become visible only
//! on commit. At most one transaction is open per connection, and a finished
//! transaction cannot be used again.
//!
//! A commit that fails is reported as `CommitFailed` and the coordinator then
//! backs the work out, so callers should treat delivery as at-least-once.

use crate::connection::client::{ConnectionInner, Interruption, TransactionSlot};
use crate::connection::Connection;
use crate::destination::Destination;
use crate::engine::{get_message, put_message, GetOptions, PutOptions, PutOutcome, Received};
use crate::error::{GetError, MqError, MqResult, PutError};
use crate::message::Message;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Open,
    Committed,
    RolledBack,
}

/// An open unit of work
#[derive(Debug)]
pub struct Transaction {
    connection: Arc<ConnectionInner>,
    id: u64,
    /// Session generation the work is staged on
    generation: u64,
    state: TransactionState,
    staged: usize,
}

impl Connection {
    /// Begin a transaction; fails with `TransactionAlreadyOpen` while another is open
    pub async fn begin(&self) -> MqResult<Transaction> {
        let inner = self.inner();
        let generation = inner.await_session(None).await?;
        let id = NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed);
        {
            let mut slot = inner.transaction_slot();
            if slot.is_some() {
                return Err(MqError::TransactionAlreadyOpen);
            }
            *slot = Some(TransactionSlot { id, generation });
        }
        debug!(target: "mq_engine", connection = inner.id, transaction = id, "transaction started");

        Ok(Transaction {
            connection: Arc::clone(inner),
            id,
            generation,
            state: TransactionState::Open,
            staged: 0,
        })
    }
}

impl Transaction {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == TransactionState::Open
    }

    /// Number of puts and gets staged so far
    pub fn staged(&self) -> usize {
        self.staged
    }

    fn ensure_open(&self) -> MqResult<()> {
        match self.state {
            TransactionState::Open => Ok(()),
            state => Err(MqError::TransactionFinished { state }),
        }
    }

    fn ensure_member(&self, destination: &Destination) -> MqResult<()> {
        if destination.connection_id() == self.connection.id {
            Ok(())
        } else {
            Err(MqError::ForeignTransaction)
        }
    }

    fn finish(&mut self, state: TransactionState) {
        self.state = state;
        let mut slot = self.connection.transaction_slot();
        if slot.is_some_and(|s| s.id == self.id) {
            *slot = None;
        }
    }

    /// Work already discarded by the broker leaves the transaction rolled back
    fn observe(&mut self, err: &MqError) {
        if matches!(
            err,
            MqError::Put(PutError::BackedOut) | MqError::Get(GetError::BackedOut)
        ) {
            warn!(target: "mq_engine", transaction = self.id, "unit of work backed out by session loss");
            self.finish(TransactionState::RolledBack);
        }
    }

    /// Stage a put; the message is visible to others only after commit
    pub async fn put(
        &mut self,
        destination: &Destination,
        message: Message,
        options: PutOptions,
    ) -> MqResult<PutOutcome> {
        self.ensure_open()?;
        self.ensure_member(destination)?;
        match put_message(destination, message, options, Some(self.generation)).await {
            Ok(outcome) => {
                self.staged += 1;
                Ok(outcome)
            }
            Err(err) => {
                self.observe(&err);
                Err(err)
            }
        }
    }

    /// Stage a get; rollback returns the message to its queue
    pub async fn get(
        &mut self,
        destination: &Destination,
        options: GetOptions,
    ) -> MqResult<Received> {
        self.ensure_open()?;
        self.ensure_member(destination)?;
        match get_message(destination, options, Some(self.generation)).await {
            Ok(received) => {
                self.staged += 1;
                Ok(received)
            }
            Err(err) => {
                self.observe(&err);
                Err(err)
            }
        }
    }

    /// Make the staged work visible
    ///
    /// An empty transaction commits without a broker round trip. Any failure
    /// is `CommitFailed`, after which the work is backed out.
    pub async fn commit(&mut self) -> MqResult<()> {
        self.ensure_open()?;
        if self.staged == 0 {
            self.finish(TransactionState::Committed);
            return Ok(());
        }

        let span = crate::transaction_span!(transaction = self.id, staged = self.staged);
        let result = self
            .connection
            .with_session(
                Interruption::CommitFailed,
                Some(self.generation),
                |broker, session| async move { broker.commit(session).await },
            )
            .instrument(span.clone())
            .await;

        match result {
            Ok(()) => {
                info!(target: "mq_engine", transaction = self.id, staged = self.staged, "transaction committed");
                self.finish(TransactionState::Committed);
                Ok(())
            }
            Err(err) => {
                let err = match err {
                    failed @ MqError::CommitFailed { .. } => failed,
                    other => MqError::CommitFailed {
                        code: other.reason_code(),
                        reason: other.to_string(),
                    },
                };
                warn!(target: "mq_engine", transaction = self.id, error = %err, "commit failed, backing out");
                if let Err(backout) = self.backout_at_broker().instrument(span).await {
                    debug!(target: "mq_engine", transaction = self.id, error = %backout, "backout after failed commit did not complete");
                }
                self.finish(TransactionState::RolledBack);
                Err(err)
            }
        }
    }

    /// Discard the staged work; gotten messages return with their backout count raised
    pub async fn rollback(&mut self) -> MqResult<()> {
        self.ensure_open()?;
        let result = if self.staged == 0 {
            Ok(())
        } else {
            self.backout_at_broker()
                .instrument(crate::transaction_span!(transaction = self.id))
                .await
        };
        self.finish(TransactionState::RolledBack);
        debug!(target: "mq_engine", transaction = self.id, ok = result.is_ok(), "transaction rolled back");
        result
    }

    async fn backout_at_broker(&self) -> MqResult<()> {
        if self.connection.current_generation() != Some(self.generation) {
            // the session holding the work is gone, and its work with it
            return Ok(());
        }
        let result = self
            .connection
            .with_session(
                Interruption::Retry,
                Some(self.generation),
                |broker, session| async move { broker.backout(session).await },
            )
            .await;
        match result {
            Err(MqError::ConnectionLost(_)) => Ok(()),
            other => other,
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state != TransactionState::Open {
            return;
        }
        warn!(target: "mq_engine", transaction = self.id, staged = self.staged, "open transaction dropped, rolling back");

        let connection = Arc::clone(&self.connection);
        let id = self.id;
        let generation = self.generation;
        let staged = self.staged;
        let release = move |inner: &ConnectionInner| {
            let mut slot = inner.transaction_slot();
            if slot.is_some_and(|s| s.id == id) {
                *slot = None;
            }
        };

        match tokio::runtime::Handle::try_current() {
            // the slot stays taken until the backout lands so a new
            // transaction cannot have its work rolled back with this one
            Ok(runtime) if staged > 0 => {
                runtime.spawn(async move {
                    if connection.current_generation() == Some(generation) {
                        let _ = connection
                            .with_session(Interruption::Retry, Some(generation), |broker, session| {
                                async move { broker.backout(session).await }
                            })
                            .await;
                    }
                    release(&connection);
                });
            }
            _ => release(&connection),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{connect, ConnectOptions};
    use crate::destination::OpenMode;
    use crate::transport::memory::QueueDefinition;
    use crate::transport::{BrokerPtr, Endpoint, MemoryBroker};

    async fn setup() -> (MemoryBroker, Connection) {
        let memory = MemoryBroker::new("QM1");
        memory.define_queue(QueueDefinition::local("Q"));
        let broker: BrokerPtr = Arc::new(memory.clone());
        let connection = connect(broker, ConnectOptions::new(Endpoint::memory("QM1")))
            .await
            .unwrap();
        (memory, connection)
    }

    #[tokio::test]
    async fn test_second_begin_is_rejected() {
        let (_memory, connection) = setup().await;
        let mut first = connection.begin().await.unwrap();
        assert_eq!(
            connection.begin().await.unwrap_err(),
            MqError::TransactionAlreadyOpen
        );
        first.commit().await.unwrap();
        assert!(connection.begin().await.is_ok());
    }

    #[tokio::test]
    async fn test_finished_transaction_cannot_be_reused() {
        let (_memory, connection) = setup().await;
        let out = connection.open_queue("Q", OpenMode::Output).await.unwrap();
        let mut tx = connection.begin().await.unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(tx.state(), TransactionState::RolledBack);

        let err = tx
            .put(&out, Message::text("late"), PutOptions::default())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            MqError::TransactionFinished {
                state: TransactionState::RolledBack
            }
        );
        assert!(tx.commit().await.is_err());
    }

    #[tokio::test]
    async fn test_commit_makes_puts_visible() {
        let (memory, connection) = setup().await;
        let out = connection.open_queue("Q", OpenMode::Output).await.unwrap();
        let mut tx = connection.begin().await.unwrap();
        tx.put(&out, Message::text("a"), PutOptions::default())
            .await
            .unwrap();
        assert_eq!(memory.queue_depth("Q"), Some(0));

        tx.commit().await.unwrap();
        assert_eq!(tx.state(), TransactionState::Committed);
        assert_eq!(memory.queue_depth("Q"), Some(1));
    }

    #[tokio::test]
    async fn test_foreign_destination_rejected() {
        let (memory, connection) = setup().await;
        let broker: BrokerPtr = Arc::new(memory.clone());
        let other = connect(broker, ConnectOptions::new(Endpoint::memory("QM1")))
            .await
            .unwrap();
        let foreign = other.open_queue("Q", OpenMode::Output).await.unwrap();

        let mut tx = connection.begin().await.unwrap();
        let err = tx
            .put(&foreign, Message::text("x"), PutOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, MqError::ForeignTransaction);
    }

    #[tokio::test]
    async fn test_async_put_cannot_join_transaction() {
        let (_memory, connection) = setup().await;
        let out = connection.open_queue("Q", OpenMode::Output).await.unwrap();
        let mut tx = connection.begin().await.unwrap();
        let err = tx
            .put(&out, Message::text("x"), PutOptions::new().asynchronous())
            .await
            .unwrap_err();
        assert!(matches!(err, MqError::InvalidArgument(_)));
        assert!(tx.is_open());
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let (memory, connection) = setup().await;
        let out = connection.open_queue("Q", OpenMode::Output).await.unwrap();
        {
            let mut tx = connection.begin().await.unwrap();
            tx.put(&out, Message::text("never"), PutOptions::default())
                .await
                .unwrap();
        }

        let mut next = None;
        for _ in 0..50 {
            match connection.begin().await {
                Ok(tx) => {
                    next = Some(tx);
                    break;
                }
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
            }
        }
        let mut next = next.expect("slot released after background rollback");
        next.commit().await.unwrap();
        assert_eq!(memory.queue_depth("Q"), Some(0));
    }
}
