use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

pub const DEFAULT_LOG_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Sent,
    Received,
    System,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MessageKind::Sent => write!(f, "sent"),
            MessageKind::Received => write!(f, "received"),
            MessageKind::System => write!(f, "system"),
        }
    }
}

/// One entry of the message log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: String,
    pub timestamp: DateTime<Local>,
    pub kind: MessageKind,
}

impl fmt::Display for MqttMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = self.payload.chars().take(60).collect();
        write!(
            f,
            "{} [{}] {} {}",
            self.timestamp.format("%H:%M:%S"),
            self.kind,
            self.topic,
            preview
        )
    }
}

impl MqttMessage {
    pub fn new(kind: MessageKind, topic: impl Into<String>, payload: impl Into<String>) -> Self {
        MqttMessage {
            topic: topic.into(),
            payload: payload.into(),
            timestamp: Local::now(),
            kind,
        }
    }

    pub fn sent(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::new(MessageKind::Sent, topic, payload)
    }

    pub fn received(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::new(MessageKind::Received, topic, payload)
    }

    /// System entries carry no topic; the text goes into the payload.
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(MessageKind::System, "", text)
    }
}

/// Bounded, arrival-ordered record of inbound, outbound and system events.
///
/// Once `capacity` is reached the oldest entry is dropped for every new one.
#[derive(Debug, Clone)]
pub struct MessageLog {
    entries: VecDeque<MqttMessage>,
    capacity: usize,
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAPACITY)
    }
}

impl MessageLog {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, message: MqttMessage) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(message);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &MqttMessage> {
        self.entries.iter()
    }

    pub fn to_vec(&self) -> Vec<MqttMessage> {
        self.entries.iter().cloned().collect()
    }
}
