//! Shared ingress plumbing: payload decoding, sanitizing, access control,
//! port probing and admission into the queue.
//!
//! Both listeners decode bodies the same way: a JSON object
//! `{"text": ..., "voice_gender": ...}` when it parses, plain text otherwise.

pub mod http;
pub mod tcp;

use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Local};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{info, warn};

use crate::context::ServerContext;
use crate::error::{DecodeError, ServerError};
use crate::logging::MESSAGE_LOG_TARGET;
use crate::queue::{MessageSource, QueueFull, QueuedMessage, VoicePreference};

/// Pluggable character filter applied to every payload.
pub trait TextSanitizer: Send + Sync {
    fn sanitize(&self, text: &str) -> String;
}

/// Drops control characters (keeping tab, CR and LF) and trims whitespace.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrintableSanitizer;

impl TextSanitizer for PrintableSanitizer {
    fn sanitize(&self, text: &str) -> String {
        text.chars()
            .filter(|c| !c.is_control() || matches!(c, '\t' | '\n' | '\r'))
            .collect::<String>()
            .trim()
            .to_string()
    }
}

/// Structured message body, shared with the `tts-send` client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub text: String,
    #[serde(default, deserialize_with = "lenient_preference")]
    pub voice_gender: VoicePreference,
}

fn lenient_preference<'de, D>(deserializer: D) -> Result<VoicePreference, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.map(|s| VoicePreference::parse_lenient(&s)).unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPayload {
    pub text: String,
    pub voice: VoicePreference,
}

/// Decode one payload: structured first, plain text as fallback.
pub fn decode_payload(
    bytes: &[u8],
    sanitizer: &dyn TextSanitizer,
) -> Result<DecodedPayload, DecodeError> {
    let raw = std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)?;

    let (text, voice) = match serde_json::from_str::<WireMessage>(raw.trim()) {
        Ok(wire) => (wire.text, wire.voice_gender),
        Err(_) => (raw.to_string(), VoicePreference::Default),
    };

    let text = sanitizer.sanitize(&text);
    if text.is_empty() {
        return Err(DecodeError::Empty);
    }
    Ok(DecodedPayload { text, voice })
}

/// Loopback and the RFC 1918 private ranges.
pub fn is_allowed(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private(),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.is_loopback() || v4.is_private(),
            None => v6.is_loopback(),
        },
    }
}

/// A bound listener and its serving task.
#[derive(Debug)]
pub struct RunningListener {
    pub local_addr: SocketAddr,
    pub handle: tokio::task::JoinHandle<()>,
}

/// Bind `addr` without blocking. Fails with `PortUnavailable` when taken.
pub fn bind_probe(
    protocol: &'static str,
    addr: SocketAddr,
) -> Result<tokio::net::TcpListener, ServerError> {
    let unavailable = |source| ServerError::PortUnavailable {
        protocol,
        addr,
        source,
    };
    let listener = std::net::TcpListener::bind(addr).map_err(unavailable)?;
    listener.set_nonblocking(true)?;
    Ok(tokio::net::TcpListener::from_std(listener)?)
}

/// Build a message and offer it to the queue.
pub(crate) fn admit(
    ctx: &ServerContext,
    payload: DecodedPayload,
    source: MessageSource,
    received_at: DateTime<Local>,
) -> Result<(), QueueFull> {
    let voice = payload.voice;
    let msg = QueuedMessage::new(payload.text, source, voice, received_at);
    let shown = preview(msg.text());
    match ctx.queue.put(msg) {
        Ok(queued) => {
            let total = ctx.stats.record_received();
            info!(target: MESSAGE_LOG_TARGET, "{source} [{voice}]: {shown}");
            info!("Messages in queue: {queued} (received {total})");
            Ok(())
        }
        Err(full) => {
            warn!(
                "Queue full ({} messages), dropped message from {source}",
                ctx.queue.capacity()
            );
            Err(full)
        }
    }
}

pub(crate) fn preview(text: &str) -> String {
    let mut shown: String = text.chars().take(80).collect::<String>().replace('\n', " ");
    if text.chars().count() > 80 {
        shown.push_str("...");
    }
    shown
}
