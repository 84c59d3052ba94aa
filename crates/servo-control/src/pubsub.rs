//! Topic-based publish/subscribe between components.

use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::broadcast;

use crate::messages::{Message, TopicPath};

const TOPIC_CAPACITY: usize = 256;

#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub robot: String,
    pub topic: TopicPath,
    pub message: Message,
}

pub trait MessageBus: Send + Sync {
    fn publish(&self, robot: &str, topic: &TopicPath, message: Message);

    fn subscribe(&self, robot: &str, topic: &TopicPath) -> broadcast::Receiver<Message>;
}

/// In-process bus backed by one broadcast channel per topic. Publishing to
/// a topic nobody listens on drops the message.
pub struct LocalBus {
    topics: Mutex<HashMap<(String, TopicPath), broadcast::Sender<Message>>>,
    tap: broadcast::Sender<Envelope>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBus {
    pub fn new() -> Self {
        let (tap, _) = broadcast::channel(TOPIC_CAPACITY);
        Self {
            topics: Mutex::new(HashMap::new()),
            tap,
        }
    }

    /// Observe every message published on any topic.
    pub fn tap(&self) -> broadcast::Receiver<Envelope> {
        self.tap.subscribe()
    }
}

impl MessageBus for LocalBus {
    fn publish(&self, robot: &str, topic: &TopicPath, message: Message) {
        let sender = self
            .topics
            .lock()
            .get(&(robot.to_string(), topic.clone()))
            .cloned();
        if self.tap.receiver_count() > 0 {
            let _ = self.tap.send(Envelope {
                robot: robot.to_string(),
                topic: topic.clone(),
                message: message.clone(),
            });
        }
        if let Some(sender) = sender {
            if sender.send(message).is_err() {
                tracing::trace!("no live subscribers on {}", topic);
            }
        }
    }

    fn subscribe(&self, robot: &str, topic: &TopicPath) -> broadcast::Receiver<Message> {
        self.topics
            .lock()
            .entry((robot.to_string(), topic.clone()))
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }
}
