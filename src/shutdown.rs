//! Ordered shutdown of every long-lived unit.
//!
//! Order: shutdown flag, HTTP server, TCP accept loop, dispatcher, log
//! writer, instance lock. Every join is bounded; a unit that misses its
//! deadline is logged and left behind (async tasks are also aborted).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::context::{ServerContext, ShutdownSignal};
use crate::instance_lock::InstanceLock;
use crate::logging::LoggingGuard;
use crate::queue::MessageQueue;

const DISPATCHER_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    TimedOut,
    NotRunning,
}

impl fmt::Display for JoinOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Joined => write!(f, "joined"),
            Self::TimedOut => write!(f, "timed out"),
            Self::NotRunning => write!(f, "not running"),
        }
    }
}

/// Outcome per unit, in shutdown order. Empty after a repeated call.
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    pub units: Vec<(&'static str, JoinOutcome)>,
    pub lock_released: bool,
}

impl ShutdownReport {
    pub fn outcome(&self, unit: &str) -> Option<JoinOutcome> {
        self.units
            .iter()
            .find(|(name, _)| *name == unit)
            .map(|(_, outcome)| *outcome)
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty() && !self.lock_released
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ShutdownTimeouts {
    pub http: Duration,
    pub tcp: Duration,
    pub dispatcher: Duration,
}

impl Default for ShutdownTimeouts {
    fn default() -> Self {
        Self {
            http: Duration::from_millis(5000),
            tcp: Duration::from_millis(2000),
            dispatcher: Duration::from_millis(3000),
        }
    }
}

pub struct ShutdownCoordinator {
    signal: ShutdownSignal,
    queue: Arc<MessageQueue>,
    timeouts: ShutdownTimeouts,
    http: Option<JoinHandle<()>>,
    tcp: Option<JoinHandle<()>>,
    dispatcher: Option<std::thread::JoinHandle<()>>,
    logging: Option<LoggingGuard>,
    lock: Option<InstanceLock>,
    done: bool,
}

impl ShutdownCoordinator {
    pub fn new(ctx: &ServerContext, timeouts: ShutdownTimeouts) -> Self {
        Self {
            signal: ctx.shutdown.clone(),
            queue: ctx.queue.clone(),
            timeouts,
            http: None,
            tcp: None,
            dispatcher: None,
            logging: None,
            lock: None,
            done: false,
        }
    }

    pub fn with_http(mut self, handle: Option<JoinHandle<()>>) -> Self {
        self.http = handle;
        self
    }

    pub fn with_tcp(mut self, handle: Option<JoinHandle<()>>) -> Self {
        self.tcp = handle;
        self
    }

    pub fn with_dispatcher(mut self, handle: Option<std::thread::JoinHandle<()>>) -> Self {
        self.dispatcher = handle;
        self
    }

    pub fn with_logging(mut self, guard: LoggingGuard) -> Self {
        self.logging = Some(guard);
        self
    }

    pub fn with_lock(mut self, lock: InstanceLock) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Run the sequence once. Later calls return an empty report.
    pub async fn shutdown(&mut self) -> ShutdownReport {
        if self.done {
            return ShutdownReport::default();
        }
        self.done = true;

        info!("Shutting down...");
        self.signal.trigger();
        self.queue.wake_all();

        let mut report = ShutdownReport::default();

        let http = join_task("HTTP server", self.http.take(), self.timeouts.http).await;
        report.units.push(("http", http));

        let tcp = join_task("TCP server", self.tcp.take(), self.timeouts.tcp).await;
        report.units.push(("tcp", tcp));

        let dispatcher = join_thread(self.dispatcher.take(), self.timeouts.dispatcher).await;
        report.units.push(("dispatcher", dispatcher));

        let writer = match self.logging.take() {
            Some(guard) => {
                info!("Shutdown complete");
                // Flushes pending lines and joins the writer thread.
                drop(guard);
                JoinOutcome::Joined
            }
            None => JoinOutcome::NotRunning,
        };
        report.units.push(("log_writer", writer));

        if let Some(mut lock) = self.lock.take() {
            lock.release();
            report.lock_released = true;
        }

        report
    }
}

async fn join_task(name: &str, handle: Option<JoinHandle<()>>, timeout: Duration) -> JoinOutcome {
    let Some(mut handle) = handle else {
        return JoinOutcome::NotRunning;
    };
    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(())) => {
            info!("{name} stopped");
            JoinOutcome::Joined
        }
        Ok(Err(e)) => {
            warn!("{name} task ended abnormally: {e}");
            JoinOutcome::Joined
        }
        Err(_) => {
            warn!("{name} did not stop within {}ms, forcing close", timeout.as_millis());
            handle.abort();
            JoinOutcome::TimedOut
        }
    }
}

async fn join_thread(handle: Option<std::thread::JoinHandle<()>>, timeout: Duration) -> JoinOutcome {
    let Some(handle) = handle else {
        return JoinOutcome::NotRunning;
    };
    let deadline = tokio::time::Instant::now() + timeout;
    while !handle.is_finished() {
        if tokio::time::Instant::now() >= deadline {
            warn!("Dispatcher did not stop within {}ms", timeout.as_millis());
            return JoinOutcome::TimedOut;
        }
        tokio::time::sleep(DISPATCHER_POLL).await;
    }
    match handle.join() {
        Ok(()) => info!("Dispatcher stopped"),
        Err(_) => warn!("Dispatcher thread panicked"),
    }
    JoinOutcome::Joined
}
