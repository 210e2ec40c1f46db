//! Interactive control console on stdin.
//!
//! Mutations go through the [`ConfigController`](crate::runtime_config::ConfigController),
//! so the dispatcher picks them up on its next loop iteration.

use std::io::{self, BufRead, Write};
use std::str::FromStr;
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::debug;

use crate::context::ServerContext;
use crate::engine::VoiceGender;

pub const HELP: &str = "\
Commands:
  status              listener status, queue size, counters, settings
  voices              list available voices
  devices             list audio outputs
  voice <index>       set the default voice
  device <index>      set the audio output ('default' for system default)
  rate <0..3>         set the speech rate (1.0 is normal)
  volume <0..100>     set the volume
  help                show this help
  quit                shut the server down";

#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    Status,
    Voices,
    Devices,
    Voice(usize),
    Device(Option<usize>),
    Rate(f32),
    Volume(u32),
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq)]
pub enum ControlParseError {
    #[error("unknown command '{0}' (type 'help')")]
    Unknown(String),

    #[error("'{command}' needs {expected}")]
    MissingArgument {
        command: &'static str,
        expected: &'static str,
    },

    #[error("invalid value '{value}' for '{command}'")]
    InvalidValue { command: &'static str, value: String },
}

impl FromStr for ControlCommand {
    type Err = ControlParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let command = words.next().unwrap_or_default().to_lowercase();
        let arg = words.next();

        fn parse_arg<T: FromStr>(
            command: &'static str,
            expected: &'static str,
            arg: Option<&str>,
        ) -> Result<T, ControlParseError> {
            let value = arg.ok_or(ControlParseError::MissingArgument { command, expected })?;
            value.parse().map_err(|_| ControlParseError::InvalidValue {
                command,
                value: value.to_string(),
            })
        }

        match command.as_str() {
            "status" => Ok(Self::Status),
            "voices" => Ok(Self::Voices),
            "devices" => Ok(Self::Devices),
            "voice" => parse_arg("voice", "a voice index", arg).map(Self::Voice),
            "device" => match arg {
                Some(a) if a.eq_ignore_ascii_case("default") => Ok(Self::Device(None)),
                _ => parse_arg("device", "an output index or 'default'", arg)
                    .map(|i| Self::Device(Some(i))),
            },
            "rate" => parse_arg("rate", "a rate between 0 and 3", arg).map(Self::Rate),
            "volume" => parse_arg("volume", "a volume between 0 and 100", arg).map(Self::Volume),
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" => Ok(Self::Quit),
            other => Err(ControlParseError::Unknown(other.to_string())),
        }
    }
}

/// Apply one command and return the text to show.
pub fn execute(ctx: &ServerContext, command: &ControlCommand) -> String {
    match command {
        ControlCommand::Status => status_report(ctx),
        ControlCommand::Voices => {
            let inventory = ctx.inventory.lock();
            if inventory.voices.is_empty() {
                return "No voices available (engine not ready)".into();
            }
            let current = ctx.config.snapshot().voice_index;
            inventory
                .voices
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    let marker = if i == current { '*' } else { ' ' };
                    let gender = match v.gender {
                        VoiceGender::Male => "male",
                        VoiceGender::Female => "female",
                        VoiceGender::Unknown => "unknown",
                    };
                    format!("{marker} {i:>3}  {} ({}, {gender})", v.name, v.id)
                })
                .collect::<Vec<_>>()
                .join("\n")
        }
        ControlCommand::Devices => {
            let inventory = ctx.inventory.lock();
            let current = ctx.config.snapshot().audio_device_index;
            let mut lines = vec![format!(
                "{} default  System default",
                if current.is_none() { '*' } else { ' ' }
            )];
            lines.extend(inventory.outputs.iter().enumerate().map(|(i, name)| {
                let marker = if current == Some(i) { '*' } else { ' ' };
                format!("{marker} {i:>7}  {name}")
            }));
            lines.join("\n")
        }
        ControlCommand::Voice(index) => {
            let available = ctx.inventory.lock().voices.len();
            if available > 0 && *index >= available {
                return format!("Voice index {index} out of range (0..{available})");
            }
            ctx.config.set_voice(*index);
            format!("Voice set to {index}")
        }
        ControlCommand::Device(index) => {
            let available = ctx.inventory.lock().outputs.len();
            if let Some(i) = index {
                if available > 0 && *i >= available {
                    return format!("Output index {i} out of range (0..{available})");
                }
            }
            ctx.config.set_audio_device(*index);
            match index {
                Some(i) => format!("Audio output set to {i}"),
                None => "Audio output set to system default".into(),
            }
        }
        ControlCommand::Rate(rate) => match ctx.config.set_rate(*rate) {
            Ok(()) => format!("Speech rate set to {rate:.2}"),
            Err(e) => format!("Rejected: {e}"),
        },
        ControlCommand::Volume(volume) => match ctx.config.set_volume(*volume) {
            Ok(()) => format!("Volume set to {volume}"),
            Err(e) => format!("Rejected: {e}"),
        },
        ControlCommand::Help => HELP.into(),
        ControlCommand::Quit => {
            ctx.shutdown.trigger();
            "Shutting down...".into()
        }
    }
}

fn status_report(ctx: &ServerContext) -> String {
    let stats = ctx.stats.snapshot();
    let config = ctx.config.snapshot();
    let device = config
        .audio_device_index
        .map_or_else(|| "default".to_string(), |i| i.to_string());
    format!(
        "TCP:  {}\nHTTP: {}\nMessages in queue: {}\nReceived: {}  Processed: {}\n\
         Voice: {}  Device: {device}  Rate: {:.2}  Volume: {}",
        *ctx.tcp_status.lock(),
        *ctx.http_status.lock(),
        ctx.queue.len(),
        stats.message_counter,
        stats.processed_counter,
        config.voice_index,
        config.speech_rate,
        config.volume,
    )
}

/// Read commands until EOF, `quit`, or shutdown.
pub fn run_console<R: BufRead, W: Write>(ctx: &ServerContext, input: R, mut output: W) -> io::Result<()> {
    for line in input.lines() {
        let line = line?;
        if ctx.shutdown.is_triggered() {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        match line.parse::<ControlCommand>() {
            Ok(command) => {
                writeln!(output, "{}", execute(ctx, &command))?;
                if command == ControlCommand::Quit {
                    break;
                }
            }
            Err(e) => writeln!(output, "{e}")?,
        }
    }
    debug!("Control console closed");
    Ok(())
}

/// Start the console on its own thread, reading the process stdin.
pub fn spawn_console(ctx: ServerContext) -> io::Result<JoinHandle<()>> {
    thread::Builder::new().name("console".into()).spawn(move || {
        let stdin = io::stdin();
        if let Err(e) = run_console(&ctx, stdin.lock(), io::stdout()) {
            debug!("Control console stopped: {e}");
        }
    })
}
