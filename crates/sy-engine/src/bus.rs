use std::collections::{BTreeMap, VecDeque};

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use serde_json::json;
use sy_core::config::BusConfig;
use sy_core::events::EventType;
use sy_core::messages::{Endpoint, Message, MessagePriority};
use tracing::debug;
use uuid::Uuid;

use crate::events::EventBus;

const SOURCE: &str = "message-bus";

type QueueKey = (MessagePriority, u64);

/// Result of one [`MessageBus::tick`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BusTick {
    /// Messages dropped from the live queue because they expired.
    pub expired: Vec<Uuid>,
    /// Urgent messages still queued, oldest first, for reprocessing.
    pub urgent: Vec<Uuid>,
}

/// Priority-ordered live queue, bounded history and per-endpoint mailboxes.
///
/// The bus only stores and delivers. Routing of system-addressed messages
/// happens in the [`Engine`](crate::Engine).
#[derive(Debug)]
pub struct MessageBus {
    config: BusConfig,
    queue: BTreeMap<QueueKey, Message>,
    index: AHashMap<Uuid, QueueKey>,
    next_seq: u64,
    /// Newest first.
    history: VecDeque<Message>,
    mailboxes: AHashMap<Endpoint, Vec<flume::Sender<Message>>>,
    events: EventBus,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusConfig::default(), EventBus::new())
    }
}

impl MessageBus {
    pub fn new(config: BusConfig, events: EventBus) -> Self {
        Self {
            history: VecDeque::with_capacity(config.history_capacity),
            config,
            queue: BTreeMap::new(),
            index: AHashMap::new(),
            next_seq: 0,
            mailboxes: AHashMap::new(),
            events,
        }
    }

    /// Stamp a fresh id and timestamp on `message` and queue it.
    pub fn send(&mut self, mut message: Message) -> Uuid {
        message.id = Uuid::new_v4();
        message.timestamp = Utc::now();
        let id = message.id;

        self.history.push_front(message.clone());
        self.history.truncate(self.config.history_capacity);

        debug!(
            message_id = %id,
            message_type = message.message_type.as_str(),
            sender = %message.sender,
            recipient = %message.recipient,
            priority = ?message.priority,
            "message sent"
        );
        self.events.emit(
            EventType::MessageSent,
            SOURCE,
            json!({
                "messageId": id,
                "type": message.message_type,
                "sender": message.sender.to_string(),
                "recipient": message.recipient.to_string(),
                "priority": message.priority,
            }),
        );

        let key = (message.priority, self.next_seq);
        self.next_seq += 1;
        self.index.insert(id, key);
        self.queue.insert(key, message);
        id
    }

    /// Remove a message from the live queue.
    pub fn take(&mut self, id: Uuid) -> Option<Message> {
        let key = self.index.remove(&id)?;
        self.queue.remove(&key)
    }

    /// Remove the most urgent, oldest message.
    pub fn pop_next(&mut self) -> Option<Message> {
        let (_, message) = self.queue.pop_first()?;
        self.index.remove(&message.id);
        Some(message)
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.index.contains_key(&id)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Sent messages, newest first.
    pub fn history(&self) -> impl Iterator<Item = &Message> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Open a mailbox for `endpoint`. Subscribing to
    /// [`Endpoint::Broadcast`] only receives broadcasts.
    pub fn subscribe(&mut self, endpoint: Endpoint) -> flume::Receiver<Message> {
        let (tx, rx) = flume::unbounded();
        self.mailboxes.entry(endpoint).or_default().push(tx);
        rx
    }

    /// Push `message` into the mailboxes of its recipient. Broadcasts reach
    /// every open mailbox. Returns the number of receivers reached.
    pub fn deliver(&mut self, message: &Message) -> usize {
        let mut reached = 0;
        let targets: Vec<Endpoint> = match &message.recipient {
            Endpoint::Broadcast => self.mailboxes.keys().cloned().collect(),
            recipient => vec![recipient.clone()],
        };
        for endpoint in targets {
            if let Some(senders) = self.mailboxes.get_mut(&endpoint) {
                senders.retain(|tx| tx.send(message.clone()).is_ok());
                reached += senders.len();
                if senders.is_empty() {
                    self.mailboxes.remove(&endpoint);
                }
            }
        }
        if reached == 0 {
            debug!(message_id = %message.id, recipient = %message.recipient, "no mailbox for recipient");
        }
        reached
    }

    /// Drop expired messages and list the urgent ones still waiting.
    pub fn tick(&mut self, now: DateTime<Utc>) -> BusTick {
        let expired: Vec<Uuid> = self
            .queue
            .values()
            .filter(|m| m.is_expired(now))
            .map(|m| m.id)
            .collect();
        for id in &expired {
            self.take(*id);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "expired queued messages");
        }

        let urgent = self
            .queue
            .iter()
            .take_while(|((priority, _), _)| *priority == MessagePriority::Urgent)
            .take(self.config.urgent_batch)
            .map(|(_, m)| m.id)
            .collect();
        BusTick { expired, urgent }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
