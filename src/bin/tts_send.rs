//! tts-send: send text to a running tts-server-rs.
//!
//! With TEXT arguments, sends them as one message. Without, reads stdin and
//! sends one message per non-empty line: over a single TCP connection as
//! newline-framed JSON, or as one `POST /tts` per line with `--http`.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use reqwest::Client;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use tts_server::ingress::http::TTS_PATH;
use tts_server::ingress::WireMessage;
use tts_server::queue::VoicePreference;

const DEFAULT_TCP_PORT: u16 = 5000;
const DEFAULT_HTTP_PORT: u16 = 5001;

#[derive(Parser, Debug)]
#[command(name = "tts-send", about = "Send text to a tts-server-rs instance")]
struct Args {
    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port (default 5000 for TCP, 5001 with --http)
    #[arg(short, long)]
    port: Option<u16>,

    /// Send over HTTP instead of raw TCP
    #[arg(long)]
    http: bool,

    /// Voice preference: default, male or female
    #[arg(long, default_value = "default")]
    voice: String,

    /// Text to speak; read from stdin when omitted
    text: Vec<String>,
}

enum Transport {
    Tcp(TcpStream),
    Http { client: Client, url: String },
}

impl Transport {
    async fn connect(args: &Args) -> Result<Self, Box<dyn std::error::Error>> {
        if args.http {
            let port = args.port.unwrap_or(DEFAULT_HTTP_PORT);
            let client = Client::builder()
                .connect_timeout(Duration::from_secs(2))
                .timeout(Duration::from_secs(5))
                .build()?;
            Ok(Self::Http {
                client,
                url: format!("http://{}:{port}{TTS_PATH}", args.host),
            })
        } else {
            let port = args.port.unwrap_or(DEFAULT_TCP_PORT);
            let stream = TcpStream::connect((args.host.as_str(), port)).await?;
            Ok(Self::Tcp(stream))
        }
    }

    async fn send(&mut self, message: &WireMessage) -> Result<(), Box<dyn std::error::Error>> {
        match self {
            Self::Tcp(stream) => {
                let mut frame = serde_json::to_vec(message)?;
                frame.push(b'\n');
                stream.write_all(&frame).await?;
            }
            Self::Http { client, url } => {
                let resp = client.post(url.as_str()).json(message).send().await?;
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                println!("{} {}", status.as_u16(), body.trim());
            }
        }
        Ok(())
    }

    async fn finish(self) -> Result<(), Box<dyn std::error::Error>> {
        if let Self::Tcp(mut stream) = self {
            stream.shutdown().await?;
        }
        Ok(())
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let voice_gender = VoicePreference::parse_lenient(&args.voice);
    let mut transport = Transport::connect(&args).await?;

    if args.text.is_empty() {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            let text = line.trim();
            if text.is_empty() {
                continue;
            }
            transport
                .send(&WireMessage {
                    text: text.to_string(),
                    voice_gender,
                })
                .await?;
        }
    } else {
        transport
            .send(&WireMessage {
                text: args.text.join(" "),
                voice_gender,
            })
            .await?;
    }

    transport.finish().await
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("tts-send: {e}");
            ExitCode::FAILURE
        }
    }
}
