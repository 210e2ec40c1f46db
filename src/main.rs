//! tts-server-rs: speaks text messages received over TCP and HTTP.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use tts_server::config::{Config, ConfigOrigin};
use tts_server::context::ServerContext;
use tts_server::control::spawn_console;
use tts_server::dispatcher::Dispatcher;
use tts_server::engine::espeak::EspeakFactory;
use tts_server::engine::EngineFactory;
use tts_server::error::LockError;
use tts_server::ingress::http::start_http_ingress;
use tts_server::ingress::tcp::start_tcp_ingress;
use tts_server::instance_lock::{default_lock_path, InstanceLock};
use tts_server::logging::{self, LoggingOptions};
use tts_server::shutdown::ShutdownCoordinator;

#[derive(Parser, Debug)]
#[command(name = "tts-server-rs", about = "Text-to-speech message server")]
struct Args {
    /// Path to config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP port (overrides config)
    #[arg(long)]
    tcp_port: Option<u16>,

    /// HTTP port (overrides config)
    #[arg(long)]
    http_port: Option<u16>,

    /// Also write daily log files
    #[arg(long)]
    log_to_file: bool,

    /// Disable the interactive control console
    #[arg(long)]
    no_console: bool,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args = Args::parse();

    let (mut config, origin) = Config::load(args.config.as_deref());
    if let Some(port) = args.tcp_port {
        config.server.tcp_port = port;
    }
    if let Some(port) = args.http_port {
        config.server.http_port = port;
    }
    let file_dir = (config.logging.file_logging || args.log_to_file)
        .then(|| config.logging.directory.clone());

    let logging = logging::init(&LoggingOptions {
        verbose: args.verbose,
        console: true,
        file_dir,
    })?;

    info!("tts-server-rs starting");
    match &origin {
        ConfigOrigin::Defaults => info!("No config file found, using defaults"),
        ConfigOrigin::File(path) => info!("Loaded config from {}", path.display()),
        ConfigOrigin::Invalid { path, error } => {
            warn!("Failed to load {}: {error}, using defaults", path.display());
        }
    }
    if let Some(dir) = logging.log_dir() {
        info!("Logging to files in {}", dir.display());
    }

    // Checked before any socket is opened.
    let lock_path = config.lock.path.clone().unwrap_or_else(default_lock_path);
    let lock = match InstanceLock::acquire(&lock_path) {
        Ok(lock) => lock,
        Err(LockError::AlreadyRunning { pid, path }) => {
            error!("TTS Server is already running (pid {pid}, lock {path})");
            return Ok(ExitCode::FAILURE);
        }
        Err(e) => return Err(e.into()),
    };

    let ctx = ServerContext::new(config.runtime_config(), config.server.queue_capacity);

    let factory: Arc<dyn EngineFactory> = Arc::new(EspeakFactory::new(config.espeak_settings()));
    let dispatcher = Dispatcher::new(ctx.clone(), factory, config.init_backoff()).spawn()?;

    let tcp = match start_tcp_ingress(ctx.clone(), config.tcp_settings()).await {
        Ok(running) => Some(running.handle),
        Err(e) => {
            warn!("TCP Server not started: {e}");
            None
        }
    };
    let http = match start_http_ingress(ctx.clone(), config.http_settings()).await {
        Ok(running) => Some(running.handle),
        Err(e) => {
            warn!("HTTP Server not started: {e}");
            None
        }
    };
    if tcp.is_none() && http.is_none() {
        warn!("No listener is running; only queued messages can be spoken");
    }

    if !args.no_console {
        spawn_console(ctx.clone())?;
        info!("Control console ready, type 'help' for commands");
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Interrupt received"),
            Err(e) => {
                warn!("Failed to listen for Ctrl-C: {e}");
                ctx.shutdown.triggered().await;
            }
        },
        () = ctx.shutdown.triggered() => {}
    }

    let mut coordinator = ShutdownCoordinator::new(&ctx, config.shutdown_timeouts())
        .with_http(http)
        .with_tcp(tcp)
        .with_dispatcher(Some(dispatcher))
        .with_logging(logging)
        .with_lock(lock);
    let report = coordinator.shutdown().await;

    for (unit, outcome) in &report.units {
        info!("{unit}: {outcome}");
    }
    let stats = ctx.stats.snapshot();
    info!(
        "Received {} messages, processed {}",
        stats.message_counter, stats.processed_counter
    );

    Ok(ExitCode::SUCCESS)
}
