//! Raw TCP ingress.
//!
//! Newline-delimited framing: every line is one payload, and unterminated
//! bytes left when the peer closes form a final payload. No reply is sent.
//! The accept loop wakes every [`ACCEPT_POLL_INTERVAL`] to observe shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::{admit, bind_probe, decode_payload, is_allowed, RunningListener};
use crate::context::{ListenerStatus, ServerContext};
use crate::error::{DecodeError, ServerError};
use crate::queue::MessageSource;

pub const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct TcpSettings {
    pub addr: SocketAddr,
    /// Worker pool size. Connections beyond it are closed immediately.
    pub max_connections: usize,
    pub max_frame_bytes: usize,
}

/// Bind and spawn the accept loop.
///
/// A taken port is reported through the TCP listener status and returned as
/// `PortUnavailable`; nothing is spawned in that case.
pub async fn start_tcp_ingress(
    ctx: ServerContext,
    settings: TcpSettings,
) -> Result<RunningListener, ServerError> {
    let listener = match bind_probe("TCP", settings.addr) {
        Ok(l) => l,
        Err(e) => {
            *ctx.tcp_status.lock() = ListenerStatus::PortInUse(settings.addr.port());
            return Err(e);
        }
    };
    let local_addr = listener.local_addr()?;
    *ctx.tcp_status.lock() = ListenerStatus::Ready(local_addr.port());
    info!("TCP Server Ready on {local_addr}");

    let handle = tokio::spawn(accept_loop(listener, ctx, settings));
    Ok(RunningListener { local_addr, handle })
}

async fn accept_loop(listener: TcpListener, ctx: ServerContext, settings: TcpSettings) {
    let workers = Arc::new(Semaphore::new(settings.max_connections.max(1)));

    while !ctx.shutdown.is_triggered() {
        let (stream, peer) =
            match tokio::time::timeout(ACCEPT_POLL_INTERVAL, listener.accept()).await {
                Err(_) => continue,
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => {
                    warn!("TCP accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };

        let Ok(permit) = workers.clone().try_acquire_owned() else {
            warn!(
                "Connection limit ({}) reached, closing {peer}",
                settings.max_connections
            );
            continue;
        };

        let ctx = ctx.clone();
        let max_frame = settings.max_frame_bytes;
        tokio::spawn(async move {
            handle_connection(stream, peer, ctx, max_frame).await;
            drop(permit);
        });
    }

    drop(listener);
    *ctx.tcp_status.lock() = ListenerStatus::Stopped;
    info!("TCP Server socket closed");
}

/// Serve one connection. Returns the number of messages enqueued.
///
/// Peers outside the allow-list are closed before anything is read.
pub async fn handle_connection<S>(
    stream: S,
    peer: SocketAddr,
    ctx: ServerContext,
    max_frame_bytes: usize,
) -> usize
where
    S: AsyncRead + Unpin,
{
    if !is_allowed(peer.ip()) {
        warn!("Rejected connection from unauthorized IP: {}", peer.ip());
        return 0;
    }
    debug!("Accepted connection from {peer}");

    let shutdown = ctx.shutdown.clone();
    let mut accepted = 0;
    tokio::select! {
        _ = read_frames(stream, peer, &ctx, max_frame_bytes, &mut accepted) => {}
        _ = shutdown.triggered() => debug!("Closing {peer} for shutdown"),
    }
    debug!("Connection from {peer} closed ({accepted} messages)");
    accepted
}

async fn read_frames<S>(
    stream: S,
    peer: SocketAddr,
    ctx: &ServerContext,
    max_frame_bytes: usize,
    accepted: &mut usize,
) where
    S: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut frame = Vec::new();
    let limit = max_frame_bytes as u64 + 1;

    loop {
        frame.clear();
        let n = match (&mut reader).take(limit).read_until(b'\n', &mut frame).await {
            Ok(n) => n,
            Err(e) => {
                warn!("Error reading from {peer}: {e}");
                return;
            }
        };
        if n == 0 {
            return;
        }

        let terminated = frame.last() == Some(&b'\n');
        if !terminated && frame.len() > max_frame_bytes {
            warn!(
                "Closing {peer}: {}",
                DecodeError::TooLong {
                    limit: max_frame_bytes
                }
            );
            return;
        }
        while matches!(frame.last(), Some(b'\n' | b'\r')) {
            frame.pop();
        }

        if handle_frame(&frame, peer, ctx) {
            *accepted += 1;
        }

        if !terminated {
            // Peer closed mid-line; that remainder was the last frame.
            return;
        }
    }
}

fn handle_frame(frame: &[u8], peer: SocketAddr, ctx: &ServerContext) -> bool {
    let received_at = Local::now();
    match decode_payload(frame, ctx.sanitizer.as_ref()) {
        Ok(payload) => admit(ctx, payload, MessageSource::Tcp(peer), received_at).is_ok(),
        Err(DecodeError::Empty) => {
            debug!("Received empty or invalid message from {}", peer.ip());
            false
        }
        Err(e) => {
            warn!("Discarded payload from {peer}: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::VoicePreference;
    use crate::runtime_config::RuntimeConfig;
    use tokio::io::AsyncWriteExt;

    fn ctx(capacity: usize) -> ServerContext {
        ServerContext::new(RuntimeConfig::default(), capacity)
    }

    async fn feed(ctx: &ServerContext, peer: &str, bytes: &[u8], max_frame: usize) -> usize {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        client.write_all(bytes).await.unwrap();
        drop(client);
        handle_connection(server, peer.parse().unwrap(), ctx.clone(), max_frame).await
    }

    #[tokio::test]
    async fn public_peer_never_enqueues() {
        let ctx = ctx(10);
        let n = feed(&ctx, "203.0.113.5:40000", b"hello\n", 1024).await;
        assert_eq!(n, 0);
        assert_eq!(ctx.queue.len(), 0);
        assert_eq!(ctx.stats.snapshot().message_counter, 0);
    }

    #[tokio::test]
    async fn loopback_json_produces_one_message() {
        let ctx = ctx(10);
        let n = feed(
            &ctx,
            "127.0.0.1:40000",
            br#"{"text":"hello","voice_gender":"male"}"#,
            1024,
        )
        .await;
        assert_eq!(n, 1);
        assert_eq!(ctx.queue.len(), 1);

        let msg = ctx.queue.get_wait(Duration::ZERO).unwrap();
        assert_eq!(msg.text(), "hello");
        assert_eq!(msg.voice_preference(), VoicePreference::Male);
        assert_eq!(
            msg.source(),
            MessageSource::Tcp("127.0.0.1:40000".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn each_line_is_one_message_in_order() {
        let ctx = ctx(10);
        let n = feed(
            &ctx,
            "192.168.1.20:5050",
            b"first\r\n\n   \nsecond\n{\"text\":\"third\"}",
            1024,
        )
        .await;
        assert_eq!(n, 3);
        let texts: Vec<String> = std::iter::from_fn(|| ctx.queue.get_wait(Duration::ZERO))
            .map(|m| m.text().to_string())
            .collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn invalid_utf8_line_is_skipped() {
        let ctx = ctx(10);
        let n = feed(&ctx, "10.0.0.7:1", b"\xff\xfe\nok\n", 1024).await;
        assert_eq!(n, 1);
        assert_eq!(ctx.queue.get_wait(Duration::ZERO).unwrap().text(), "ok");
    }

    #[tokio::test]
    async fn oversized_frame_closes_connection() {
        let ctx = ctx(10);
        let mut bytes = b"short\n".to_vec();
        bytes.extend(std::iter::repeat(b'a').take(100));
        bytes.extend(b"\nafter\n");
        let n = feed(&ctx, "127.0.0.1:1", &bytes, 32).await;
        assert_eq!(n, 1);
        assert_eq!(ctx.queue.len(), 1);
    }

    #[tokio::test]
    async fn full_queue_drops_extra_messages() {
        let ctx = ctx(2);
        let n = feed(&ctx, "127.0.0.1:1", b"a\nb\nc\nd\n", 1024).await;
        assert_eq!(n, 2);
        assert_eq!(ctx.queue.len(), 2);
    }

    #[tokio::test]
    async fn taken_port_reports_status() {
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = holder.local_addr().unwrap();
        let ctx = ctx(10);
        let result = start_tcp_ingress(
            ctx.clone(),
            TcpSettings {
                addr,
                max_connections: 4,
                max_frame_bytes: 1024,
            },
        )
        .await;
        assert!(matches!(result, Err(ServerError::PortUnavailable { .. })));
        assert_eq!(*ctx.tcp_status.lock(), ListenerStatus::PortInUse(addr.port()));
    }

    #[tokio::test]
    async fn accept_loop_stops_on_shutdown() {
        let ctx = ctx(10);
        let running = start_tcp_ingress(
            ctx.clone(),
            TcpSettings {
                addr: "127.0.0.1:0".parse().unwrap(),
                max_connections: 4,
                max_frame_bytes: 1024,
            },
        )
        .await
        .unwrap();

        let mut client = tokio::net::TcpStream::connect(running.local_addr).await.unwrap();
        client.write_all(b"over the wire\n").await.unwrap();
        client.shutdown().await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while ctx.queue.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(ctx.queue.get_wait(Duration::ZERO).unwrap().text(), "over the wire");

        ctx.shutdown.trigger();
        tokio::time::timeout(ACCEPT_POLL_INTERVAL * 4, running.handle)
            .await
            .expect("accept loop did not stop")
            .unwrap();
        assert_eq!(*ctx.tcp_status.lock(), ListenerStatus::Stopped);
    }
}
