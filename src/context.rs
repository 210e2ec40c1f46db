//! Process-scoped state shared by every component.
//!
//! Built once in `main` and cloned into each listener, the dispatcher and the
//! control console. Each piece carries its own lock.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::engine::EngineInventory;
use crate::ingress::{PrintableSanitizer, TextSanitizer};
use crate::queue::MessageQueue;
use crate::runtime_config::{ConfigController, RuntimeConfig};

/// Global shutdown flag, observable from blocking threads and async tasks.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
    token: CancellationToken,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub async fn triggered(&self) {
        self.token.cancelled().await;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    pub message_counter: u64,
    pub processed_counter: u64,
}

/// Monotonic counters behind their own lock.
#[derive(Default)]
pub struct Stats {
    inner: Mutex<StatsSnapshot>,
}

impl Stats {
    /// Record an accepted message, returning the new count.
    pub fn record_received(&self) -> u64 {
        let mut s = self.inner.lock();
        s.message_counter += 1;
        s.message_counter
    }

    /// Record a finished render, returning the new count.
    pub fn record_processed(&self) -> u64 {
        let mut s = self.inner.lock();
        s.processed_counter += 1;
        s.processed_counter
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        *self.inner.lock()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerStatus {
    Starting,
    Ready(u16),
    PortInUse(u16),
    Failed,
    Stopped,
}

impl fmt::Display for ListenerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "Starting"),
            Self::Ready(port) => write!(f, "Ready on port {port}"),
            Self::PortInUse(port) => write!(f, "Port {port} in use, not running"),
            Self::Failed => write!(f, "Failed"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

#[derive(Clone)]
pub struct ServerContext {
    pub config: Arc<ConfigController>,
    pub queue: Arc<MessageQueue>,
    pub stats: Arc<Stats>,
    pub shutdown: ShutdownSignal,
    pub sanitizer: Arc<dyn TextSanitizer>,
    pub tcp_status: Arc<Mutex<ListenerStatus>>,
    pub http_status: Arc<Mutex<ListenerStatus>>,
    pub inventory: Arc<Mutex<EngineInventory>>,
}

impl ServerContext {
    pub fn new(runtime: RuntimeConfig, queue_capacity: usize) -> Self {
        Self {
            config: Arc::new(ConfigController::new(runtime)),
            queue: Arc::new(MessageQueue::new(queue_capacity)),
            stats: Arc::new(Stats::default()),
            shutdown: ShutdownSignal::new(),
            sanitizer: Arc::new(PrintableSanitizer),
            tcp_status: Arc::new(Mutex::new(ListenerStatus::Starting)),
            http_status: Arc::new(Mutex::new(ListenerStatus::Starting)),
            inventory: Arc::new(Mutex::new(EngineInventory::default())),
        }
    }

    pub fn with_sanitizer(mut self, sanitizer: Arc<dyn TextSanitizer>) -> Self {
        self.sanitizer = sanitizer;
        self
    }
}
