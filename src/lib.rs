//! tts-server-rs: accepts short text messages over TCP and HTTP and speaks
//! them one at a time through a local voice engine.
//!
//! Ingress listeners feed one bounded FIFO [`queue::MessageQueue`]; a single
//! [`dispatcher::Dispatcher`] thread drains it. Settings changed at runtime
//! through the [`control`] console reach the dispatcher via a restart signal.

pub mod config;
pub mod context;
pub mod control;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod ingress;
pub mod instance_lock;
pub mod logging;
pub mod queue;
pub mod runtime_config;
pub mod shutdown;
