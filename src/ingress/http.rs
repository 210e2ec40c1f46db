//! HTTP ingress: one `POST /tts` endpoint on its own port.
//!
//! Bodies decode exactly like TCP frames. Replies are short plain text so
//! simple clients (curl, shell hooks) can read them.

use std::net::SocketAddr;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use chrono::{DateTime, Local};
use tracing::{info, warn};

use super::{admit, bind_probe, decode_payload, is_allowed, RunningListener};
use crate::context::{ListenerStatus, ServerContext};
use crate::error::ServerError;
use crate::queue::MessageSource;

pub const TTS_PATH: &str = "/tts";

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub addr: SocketAddr,
    /// Larger bodies are refused with 413 before the handler runs.
    pub max_body_bytes: usize,
}

type Reply = (StatusCode, &'static str);

/// Build the axum router.
pub fn router(ctx: ServerContext, max_body_bytes: usize) -> Router {
    Router::new()
        .route(
            TTS_PATH,
            post(handle_tts).fallback(|| async {
                (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
            }),
        )
        .fallback(|| async { (StatusCode::NOT_FOUND, "Not found") })
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(ctx)
}

/// Bind and spawn the HTTP server. It stops gracefully once shutdown is
/// triggered.
pub async fn start_http_ingress(
    ctx: ServerContext,
    settings: HttpSettings,
) -> Result<RunningListener, ServerError> {
    let listener = match bind_probe("HTTP", settings.addr) {
        Ok(l) => l,
        Err(e) => {
            *ctx.http_status.lock() = ListenerStatus::PortInUse(settings.addr.port());
            return Err(e);
        }
    };
    let local_addr = listener.local_addr()?;
    *ctx.http_status.lock() = ListenerStatus::Ready(local_addr.port());
    info!("HTTP Server Ready on {local_addr}");

    let app = router(ctx.clone(), settings.max_body_bytes);
    let shutdown = ctx.shutdown.clone();
    let status = ctx.http_status.clone();
    let handle = tokio::spawn(async move {
        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.triggered().await })
        .await;

        match served {
            Ok(()) => {
                *status.lock() = ListenerStatus::Stopped;
                info!("HTTP Server stopped");
            }
            Err(e) => {
                *status.lock() = ListenerStatus::Failed;
                warn!("HTTP Server error: {e}");
            }
        }
    });

    Ok(RunningListener { local_addr, handle })
}

async fn handle_tts(
    State(ctx): State<ServerContext>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Reply {
    // The body extractor has finished reading by the time we get here.
    respond(&ctx, peer, &body, Local::now())
}

fn respond(ctx: &ServerContext, peer: SocketAddr, body: &[u8], received_at: DateTime<Local>) -> Reply {
    if !is_allowed(peer.ip()) {
        warn!("Rejected HTTP request from unauthorized IP: {}", peer.ip());
        return (StatusCode::FORBIDDEN, "Forbidden");
    }

    let payload = match decode_payload(body, ctx.sanitizer.as_ref()) {
        Ok(p) => p,
        Err(e) => {
            info!("Received empty or invalid message from {}: {e}", peer.ip());
            return (StatusCode::BAD_REQUEST, "Empty or invalid message");
        }
    };

    match admit(ctx, payload, MessageSource::Http(peer), received_at) {
        Ok(()) => (StatusCode::OK, "OK"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "Queue full"),
    }
}
