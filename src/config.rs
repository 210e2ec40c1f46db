//! Configuration for tts-server-rs.
//!
//! Loads config from YAML files in standard locations. Every section and
//! field is optional; anything missing takes its default.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::engine::espeak::EspeakSettings;
use crate::ingress::http::HttpSettings;
use crate::ingress::tcp::TcpSettings;
use crate::queue::DEFAULT_CAPACITY;
use crate::runtime_config::RuntimeConfig;
use crate::shutdown::ShutdownTimeouts;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: IpAddr,
    pub tcp_port: u16,
    pub http_port: u16,
    /// 0 means unbounded.
    pub queue_capacity: usize,
    pub max_connections: usize,
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            tcp_port: 5000,
            http_port: 5001,
            queue_capacity: DEFAULT_CAPACITY,
            max_connections: 64,
            max_frame_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub voice_index: usize,
    pub audio_device_index: Option<usize>,
    pub speech_rate: f32,
    pub volume: u8,
    pub espeak_binary: String,
    pub base_words_per_minute: u32,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            voice_index: 0,
            audio_device_index: None,
            speech_rate: 1.0,
            volume: 100,
            espeak_binary: "espeak-ng".into(),
            base_words_per_minute: 175,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub init_backoff_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            init_backoff_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub http_timeout_ms: u64,
    pub tcp_timeout_ms: u64,
    pub dispatcher_timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            http_timeout_ms: 5000,
            tcp_timeout_ms: 2000,
            dispatcher_timeout_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub file_logging: bool,
    pub directory: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file_logging: false,
            directory: PathBuf::from("server_logs"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Overrides the default PID file location.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub voice: VoiceConfig,
    pub dispatcher: DispatcherConfig,
    pub shutdown: ShutdownConfig,
    pub logging: LoggingConfig,
    pub lock: LockConfig,
}

/// Where the loaded configuration came from. Reported once logging is up.
#[derive(Debug, Clone)]
pub enum ConfigOrigin {
    Defaults,
    File(PathBuf),
    /// The file existed but could not be used; defaults were applied.
    Invalid { path: PathBuf, error: String },
}

impl Config {
    /// Load configuration from YAML file.
    ///
    /// Searches standard locations if no path is provided:
    /// 1. ./config.yaml
    /// 2. ~/.config/tts-server/config.yaml
    /// 3. /etc/tts-server/config.yaml
    pub fn load(path: Option<&Path>) -> (Self, ConfigOrigin) {
        let resolved = path.map(PathBuf::from).or_else(|| {
            let candidates = [
                std::env::current_dir().ok().map(|d| d.join("config.yaml")),
                dirs::home_dir().map(|h| h.join(".config/tts-server/config.yaml")),
                Some(PathBuf::from("/etc/tts-server/config.yaml")),
            ];
            candidates.into_iter().flatten().find(|p| p.exists())
        });

        let Some(config_path) = resolved else {
            return (Self::default(), ConfigOrigin::Defaults);
        };

        let parsed = std::fs::read_to_string(&config_path)
            .map_err(|e| e.to_string())
            .and_then(|contents| Self::from_yaml(&contents));
        match parsed {
            Ok(config) => (config, ConfigOrigin::File(config_path)),
            Err(error) => (
                Self::default(),
                ConfigOrigin::Invalid {
                    path: config_path,
                    error,
                },
            ),
        }
    }

    pub fn from_yaml(contents: &str) -> Result<Self, String> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yml::from_str(contents).map_err(|e| e.to_string())
    }

    /// Initial runtime values, clamped into range.
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            voice_index: self.voice.voice_index,
            audio_device_index: self.voice.audio_device_index,
            speech_rate: self.voice.speech_rate,
            volume: self.voice.volume,
        }
        .clamped()
    }

    pub fn espeak_settings(&self) -> EspeakSettings {
        EspeakSettings {
            binary: self.voice.espeak_binary.clone(),
            base_words_per_minute: self.voice.base_words_per_minute,
        }
    }

    pub fn tcp_settings(&self) -> TcpSettings {
        TcpSettings {
            addr: SocketAddr::new(self.server.bind_address, self.server.tcp_port),
            max_connections: self.server.max_connections,
            max_frame_bytes: self.server.max_frame_bytes,
        }
    }

    pub fn http_settings(&self) -> HttpSettings {
        HttpSettings {
            addr: SocketAddr::new(self.server.bind_address, self.server.http_port),
            max_body_bytes: self.server.max_frame_bytes,
        }
    }

    pub fn init_backoff(&self) -> Duration {
        Duration::from_millis(self.dispatcher.init_backoff_ms)
    }

    pub fn shutdown_timeouts(&self) -> ShutdownTimeouts {
        ShutdownTimeouts {
            http: Duration::from_millis(self.shutdown.http_timeout_ms),
            tcp: Duration::from_millis(self.shutdown.tcp_timeout_ms),
            dispatcher: Duration::from_millis(self.shutdown.dispatcher_timeout_ms),
        }
    }
}
