//! Local queues held by the in-process queue manager

use crate::message::Message;
use crate::transport::{DynamicLifetime, ObjectId, SessionId};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Default maximum number of messages on a queue
pub const DEFAULT_MAX_DEPTH: usize = 5000;

/// Default maximum payload length in bytes
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 4 * 1024 * 1024;

/// Whether a queue holds messages or serves as a template for dynamic queues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueType {
    Local,
    Model(DynamicLifetime),
}

/// Attributes of a queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDefinition {
    pub name: String,
    pub queue_type: QueueType,
    pub max_depth: usize,
    pub max_message_length: usize,
    pub get_inhibited: bool,
    pub put_inhibited: bool,
    /// Backout count at which a message is moved to `backout_requeue`; 0 disables
    pub backout_threshold: u32,
    pub backout_requeue: Option<String>,
    pub description: String,
}

impl QueueDefinition {
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue_type: QueueType::Local,
            max_depth: DEFAULT_MAX_DEPTH,
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            get_inhibited: false,
            put_inhibited: false,
            backout_threshold: 0,
            backout_requeue: None,
            description: String::new(),
        }
    }

    pub fn model(name: impl Into<String>, lifetime: DynamicLifetime) -> Self {
        Self {
            queue_type: QueueType::Model(lifetime),
            ..Self::local(name)
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_max_message_length(mut self, max_message_length: usize) -> Self {
        self.max_message_length = max_message_length;
        self
    }

    pub fn with_backout(mut self, threshold: u32, requeue: impl Into<String>) -> Self {
        self.backout_threshold = threshold;
        self.backout_requeue = Some(requeue.into());
        self
    }
}

/// A message resting on a queue
#[derive(Debug, Clone)]
pub(crate) struct Stored {
    pub seq: u64,
    pub message: Message,
    pub expires_at: Option<Instant>,
}

impl Stored {
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug)]
pub(crate) struct Queue {
    pub definition: QueueDefinition,
    pub messages: VecDeque<Stored>,
    /// Puts staged under syncpoint, counted against the depth limit
    pub staged_puts: usize,
    pub open_input: usize,
    pub open_output: usize,
    pub exclusive: Option<(SessionId, ObjectId)>,
    pub dynamic: Option<DynamicLifetime>,
    /// Internal queue backing a managed subscription
    pub managed: bool,
    pub notify: Arc<Notify>,
}

impl Queue {
    pub fn new(definition: QueueDefinition) -> Self {
        Self {
            definition,
            messages: VecDeque::new(),
            staged_puts: 0,
            open_input: 0,
            open_output: 0,
            exclusive: None,
            dynamic: None,
            managed: false,
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn depth(&self) -> usize {
        self.messages.len()
    }

    pub fn is_in_use(&self) -> bool {
        self.open_input > 0 || self.open_output > 0
    }

    /// Insert keeping sequence order, so backed-out messages return to their place
    pub fn insert(&mut self, stored: Stored) {
        let at = self.messages.partition_point(|m| m.seq < stored.seq);
        self.messages.insert(at, stored);
        self.notify.notify_waiters();
    }

    /// Drop expired messages
    pub fn expire(&mut self, now: Instant) -> usize {
        let before = self.messages.len();
        self.messages.retain(|m| !m.is_expired(now));
        before - self.messages.len()
    }

    /// Index of the first live message matching `accept`, skipping browse positions
    pub fn find(&self, after: Option<u64>, accept: impl Fn(&Message) -> bool) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| after.map_or(true, |seq| m.seq > seq) && accept(&m.message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn stored(seq: u64) -> Stored {
        Stored {
            seq,
            message: Message::text(format!("m{seq}")),
            expires_at: None,
        }
    }

    #[test]
    fn test_insert_keeps_sequence_order() {
        let mut queue = Queue::new(QueueDefinition::local("Q"));
        queue.insert(stored(1));
        queue.insert(stored(3));
        queue.insert(stored(2));
        let seqs: Vec<_> = queue.messages.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_find_after_browse_position() {
        let mut queue = Queue::new(QueueDefinition::local("Q"));
        for seq in 1..=3 {
            queue.insert(stored(seq));
        }
        assert_eq!(queue.find(None, |_| true), Some(0));
        assert_eq!(queue.find(Some(1), |_| true), Some(1));
        assert_eq!(queue.find(Some(3), |_| true), None);
    }

    #[tokio::test]
    async fn test_expire_drops_only_expired() {
        let mut queue = Queue::new(QueueDefinition::local("Q"));
        let now = Instant::now();
        let mut old = stored(1);
        old.expires_at = Some(now);
        let mut fresh = stored(2);
        fresh.expires_at = Some(now + Duration::from_secs(60));
        queue.insert(old);
        queue.insert(fresh);
        queue.insert(stored(3));

        assert_eq!(queue.expire(now), 1);
        assert_eq!(queue.depth(), 2);
    }

    #[test]
    fn test_model_definition_inherits_defaults() {
        let model = QueueDefinition::model("MODEL", DynamicLifetime::Permanent);
        assert_eq!(model.queue_type, QueueType::Model(DynamicLifetime::Permanent));
        assert_eq!(model.max_depth, DEFAULT_MAX_DEPTH);
    }
}
