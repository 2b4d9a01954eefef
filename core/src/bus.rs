//! Inter-agent message bus
//!
//! Topic-based publish/subscribe plus direct messaging. Every recipient keeps
//! an unacknowledged queue; the global log is append-only and a message is
//! never mutated after publish except for its acknowledged flag.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Topic used for direct (agent-to-agent) messages
pub const DIRECT_TOPIC: &str = "direct";

/// Message priority, highest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub from: String,
    /// Direct recipient, None for topic broadcasts
    pub to: Option<String>,
    pub topic: String,
    pub content: String,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
}

#[derive(Default)]
struct BusInner {
    log: Vec<Message>,
    topics: HashMap<String, HashSet<String>>,
    /// Per-recipient unacknowledged queues, in publish order
    queues: HashMap<String, Vec<Message>>,
}

/// Topic-based message bus shared by all running agents
#[derive(Default)]
pub struct MessageBus {
    inner: Mutex<BusInner>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an agent to a topic's subscriber set, creating the topic if absent.
    /// Idempotent.
    pub fn subscribe(&self, agent_id: &str, topic: &str) {
        let mut inner = self.inner.lock();
        inner
            .topics
            .entry(topic.to_string())
            .or_default()
            .insert(agent_id.to_string());
    }

    /// Remove an agent from a topic's subscriber set. Idempotent.
    pub fn unsubscribe(&self, agent_id: &str, topic: &str) {
        let mut inner = self.inner.lock();
        if let Some(subscribers) = inner.topics.get_mut(topic) {
            subscribers.remove(agent_id);
        }
    }

    /// Publish to a topic: append to the global log and enqueue a copy for
    /// every subscriber except the sender. Subscribers added later do not
    /// retroactively receive the message.
    pub fn publish(&self, from: &str, topic: &str, content: &str, priority: Priority) -> Message {
        let message = Message {
            id: Uuid::new_v4().to_string(),
            from: from.to_string(),
            to: None,
            topic: topic.to_string(),
            content: content.to_string(),
            priority,
            timestamp: Utc::now(),
            acknowledged: false,
        };

        let mut inner = self.inner.lock();
        inner.topics.entry(topic.to_string()).or_default();

        let recipients: Vec<String> = inner
            .topics
            .get(topic)
            .map(|subs| subs.iter().filter(|id| id.as_str() != from).cloned().collect())
            .unwrap_or_default();

        for recipient in recipients {
            inner
                .queues
                .entry(recipient)
                .or_default()
                .push(message.clone());
        }
        inner.log.push(message.clone());

        tracing::debug!(from, topic, "published message");
        message
    }

    /// Send directly to one agent, bypassing topics
    pub fn direct_message(
        &self,
        from: &str,
        to: &str,
        content: &str,
        priority: Priority,
    ) -> Message {
        let message = Message {
            id: Uuid::new_v4().to_string(),
            from: from.to_string(),
            to: Some(to.to_string()),
            topic: DIRECT_TOPIC.to_string(),
            content: content.to_string(),
            priority,
            timestamp: Utc::now(),
            acknowledged: false,
        };

        let mut inner = self.inner.lock();
        if to != from {
            inner
                .queues
                .entry(to.to_string())
                .or_default()
                .push(message.clone());
        }
        inner.log.push(message.clone());
        message
    }

    /// Remove a message from the agent's queue and flip the global copy's
    /// acknowledged flag. Idempotent.
    pub fn acknowledge(&self, agent_id: &str, message_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(queue) = inner.queues.get_mut(agent_id) {
            queue.retain(|m| m.id != message_id);
        }
        if let Some(message) = inner.log.iter_mut().find(|m| m.id == message_id) {
            message.acknowledged = true;
        }
    }

    /// Unacknowledged messages for an agent, in publish order
    pub fn unread(&self, agent_id: &str) -> Vec<Message> {
        self.inner
            .lock()
            .queues
            .get(agent_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn unread_count(&self, agent_id: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(agent_id)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Total messages ever published
    pub fn log_len(&self) -> usize {
        self.inner.lock().log.len()
    }

    /// Most recent `n` messages from the global log, for observers
    pub fn recent(&self, n: usize) -> Vec<Message> {
        let inner = self.inner.lock();
        inner.log.iter().rev().take(n).rev().cloned().collect()
    }
}
