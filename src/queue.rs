//! Bounded FIFO shared by both ingress protocols and the dispatcher.
//!
//! Producers never block: a full queue hands the message back as
//! backpressure. The single consumer blocks on a condition variable with a
//! timeout, so a `put` wakes it immediately without polling.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

/// Default queue capacity.
pub const DEFAULT_CAPACITY: usize = 100;

/// Requested voice gender for one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoicePreference {
    #[default]
    Default,
    Male,
    Female,
}

impl VoicePreference {
    /// Lenient parse: anything unrecognized maps to `Default`.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "male" | "m" => Self::Male,
            "female" | "f" => Self::Female,
            _ => Self::Default,
        }
    }
}

impl fmt::Display for VoicePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Male => write!(f, "male"),
            Self::Female => write!(f, "female"),
        }
    }
}

/// Where a message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSource {
    Tcp(SocketAddr),
    Http(SocketAddr),
}

impl fmt::Display for MessageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "TCP {addr}"),
            Self::Http(addr) => write!(f, "HTTP {addr}"),
        }
    }
}

/// One sanitized message waiting to be spoken. Immutable once built.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    text: String,
    source: MessageSource,
    voice_preference: VoicePreference,
    received_at: DateTime<Local>,
}

impl QueuedMessage {
    pub fn new(
        text: String,
        source: MessageSource,
        voice_preference: VoicePreference,
        received_at: DateTime<Local>,
    ) -> Self {
        Self {
            text,
            source,
            voice_preference,
            received_at,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn source(&self) -> MessageSource {
        self.source
    }

    pub fn voice_preference(&self) -> VoicePreference {
        self.voice_preference
    }

    pub fn received_at(&self) -> DateTime<Local> {
        self.received_at
    }
}

/// Returned by [`MessageQueue::put`] when the queue is at capacity.
/// Carries the rejected message back to the producer.
#[derive(Debug)]
pub struct QueueFull(pub QueuedMessage);

impl fmt::Display for QueueFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue full, rejected message from {}", self.0.source)
    }
}

impl std::error::Error for QueueFull {}

pub struct MessageQueue {
    items: Mutex<VecDeque<QueuedMessage>>,
    available: Condvar,
    capacity: usize,
}

impl MessageQueue {
    /// Create a queue holding at most `capacity` messages. 0 means unbounded.
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a message and wake one waiter. Never blocks on a full queue.
    pub fn put(&self, msg: QueuedMessage) -> Result<usize, QueueFull> {
        let mut items = self.items.lock();
        if self.capacity != 0 && items.len() >= self.capacity {
            return Err(QueueFull(msg));
        }
        items.push_back(msg);
        let len = items.len();
        drop(items);
        self.available.notify_one();
        Ok(len)
    }

    /// Wait up to `timeout` for the oldest message.
    pub fn get_wait(&self, timeout: Duration) -> Option<QueuedMessage> {
        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock();
        loop {
            if let Some(msg) = items.pop_front() {
                return Some(msg);
            }
            if self.available.wait_until(&mut items, deadline).timed_out() {
                return items.pop_front();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Wake every waiter so it can re-check shutdown state.
    pub fn wake_all(&self) {
        self.available.notify_all();
    }
}
