//! espeak-ng voice engine: text → WAV via the espeak-ng CLI → rodio playback.
//!
//! Pipeline:
//! 1. `espeak-ng --voices` → voice list with gender from the Age/Gender column
//! 2. `espeak-ng --stdout -v <voice> -s <wpm>` with text on stdin → WAV bytes
//! 3. WAV → rodio `Sink` on the selected output device
//! 4. `poll_status` reports Speaking until the sink drains

use std::io::{self, Cursor, Write};
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::Instant;

use rodio::cpal::traits::{DeviceTrait, HostTrait};
use rodio::{Decoder, OutputStream, OutputStreamBuilder, Sink};
use tracing::{debug, info};

use super::{infer_gender, EngineFactory, EngineStatus, VoiceEngine, VoiceGender, VoiceInfo};
use crate::error::EngineError;

const MIN_WPM: u32 = 80;
const MAX_WPM: u32 = 450;

#[derive(Debug, Clone)]
pub struct EspeakSettings {
    pub binary: String,
    /// Words per minute at speech rate 1.0.
    pub base_words_per_minute: u32,
}

impl Default for EspeakSettings {
    fn default() -> Self {
        Self {
            binary: "espeak-ng".into(),
            base_words_per_minute: 175,
        }
    }
}

pub struct EspeakFactory {
    settings: EspeakSettings,
}

impl EspeakFactory {
    pub fn new(settings: EspeakSettings) -> Self {
        Self { settings }
    }
}

impl EngineFactory for EspeakFactory {
    fn attach(&self) -> Result<Box<dyn VoiceEngine>, EngineError> {
        Ok(Box::new(EspeakEngine::attach(self.settings.clone())?))
    }
}

pub struct EspeakEngine {
    settings: EspeakSettings,
    voices: Vec<VoiceInfo>,
    voice: usize,
    rate: f32,
    volume: u8,

    // Opened by `select_output` and kept alive while the engine is attached.
    stream: Option<OutputStream>,
    sink: Option<Sink>,
}

impl EspeakEngine {
    pub fn attach(settings: EspeakSettings) -> Result<Self, EngineError> {
        let t0 = Instant::now();

        let output = Command::new(&settings.binary)
            .arg("--voices")
            .output()
            .map_err(|e| EngineError::Init(format!("failed to run {}: {e}", settings.binary)))?;
        if !output.status.success() {
            return Err(EngineError::Init(format!(
                "{} --voices exited with {}",
                settings.binary, output.status
            )));
        }
        let voices = parse_voice_list(&String::from_utf8_lossy(&output.stdout));
        if voices.is_empty() {
            return Err(EngineError::Init("espeak-ng reported no voices".into()));
        }

        info!(
            "espeak-ng attached: {} voices in {}ms",
            voices.len(),
            t0.elapsed().as_millis()
        );

        Ok(Self {
            settings,
            voices,
            voice: 0,
            rate: 1.0,
            volume: 100,
            stream: None,
            sink: None,
        })
    }

    /// Run espeak-ng and collect the WAV it writes to stdout.
    fn synthesize(&self, text: &str) -> Result<Vec<u8>, EngineError> {
        let voice = self
            .voices
            .get(self.voice)
            .map(|v| v.id.as_str())
            .unwrap_or("en");
        let wpm = words_per_minute(self.rate, self.settings.base_words_per_minute);

        let mut command = Command::new(&self.settings.binary);
        command.args(["--stdout", "-v", voice, "-s", &wpm.to_string()]);
        let output = run_with_input(&mut command, text.as_bytes())
            .map_err(|e| EngineError::Render(format!("failed to run espeak-ng: {e}")))?;
        if !output.status.success() {
            return Err(EngineError::Render(format!(
                "espeak-ng exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        debug!("Synthesized {} WAV bytes ({voice}, {wpm} wpm)", output.stdout.len());
        Ok(output.stdout)
    }
}

impl VoiceEngine for EspeakEngine {
    fn voices(&self) -> Result<Vec<VoiceInfo>, EngineError> {
        Ok(self.voices.clone())
    }

    fn audio_outputs(&self) -> Result<Vec<String>, EngineError> {
        let host = rodio::cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| EngineError::Init(format!("failed to list outputs: {e}")))?;
        Ok(devices
            .map(|d| d.name().unwrap_or_else(|_| "Unknown".to_string()))
            .collect())
    }

    fn select_voice(&mut self, index: usize) -> Result<(), EngineError> {
        if index >= self.voices.len() {
            return Err(EngineError::NotFound {
                kind: "voice",
                index,
                available: self.voices.len(),
            });
        }
        self.voice = index;
        Ok(())
    }

    fn select_output(&mut self, index: Option<usize>) -> Result<(), EngineError> {
        let stream = match index {
            None => OutputStreamBuilder::open_default_stream()
                .map_err(|e| EngineError::Init(format!("failed to open default output: {e}")))?,
            Some(i) => {
                let host = rodio::cpal::default_host();
                let mut devices = host
                    .output_devices()
                    .map_err(|e| EngineError::Init(format!("failed to list outputs: {e}")))?
                    .collect::<Vec<_>>();
                let available = devices.len();
                if i >= available {
                    return Err(EngineError::NotFound {
                        kind: "audio output",
                        index: i,
                        available,
                    });
                }
                let device = devices.swap_remove(i);
                let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
                let stream = OutputStreamBuilder::from_device(device)
                    .and_then(|b| b.open_stream())
                    .map_err(|e| EngineError::Init(format!("failed to open output '{name}': {e}")))?;
                info!("Audio output: {name}");
                stream
            }
        };
        self.sink = None;
        self.stream = Some(stream);
        Ok(())
    }

    fn set_rate(&mut self, rate: f32) -> Result<(), EngineError> {
        self.rate = rate;
        Ok(())
    }

    fn set_volume(&mut self, volume: u8) -> Result<(), EngineError> {
        self.volume = volume;
        if let Some(sink) = &self.sink {
            sink.set_volume(f32::from(volume) / 100.0);
        }
        Ok(())
    }

    fn start_speak(&mut self, text: &str) -> Result<(), EngineError> {
        let Some(stream) = &self.stream else {
            return Err(EngineError::Render("no audio output selected".into()));
        };
        let mixer = stream.mixer().clone();
        let wav = self.synthesize(text)?;
        let source = Decoder::new(Cursor::new(wav))
            .map_err(|e| EngineError::Render(format!("failed to decode espeak-ng output: {e}")))?;

        let sink = Sink::connect_new(&mixer);
        sink.set_volume(f32::from(self.volume) / 100.0);
        sink.append(source);
        self.sink = Some(sink);
        Ok(())
    }

    fn poll_status(&mut self) -> Result<EngineStatus, EngineError> {
        let speaking = self.sink.as_ref().is_some_and(|s| !s.empty());
        if speaking {
            Ok(EngineStatus::Speaking)
        } else {
            self.sink = None;
            Ok(EngineStatus::Idle)
        }
    }
}

/// Run `command` with `input` on stdin and collect its output.
///
/// stdin is fed from a helper thread so a child that fills its stdout pipe
/// before reading all input cannot deadlock against us.
fn run_with_input(command: &mut Command, input: &[u8]) -> io::Result<Output> {
    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let writer = child.stdin.take().map(|mut stdin| {
        let input = input.to_vec();
        thread::spawn(move || stdin.write_all(&input))
    });

    let output = child.wait_with_output()?;
    if let Some(writer) = writer {
        match writer.join() {
            Ok(Ok(())) => {}
            // The child may exit without reading everything; its status says more.
            Ok(Err(e)) if e.kind() == io::ErrorKind::BrokenPipe => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(io::Error::other("stdin writer panicked")),
        }
    }
    Ok(output)
}

/// Map a speed multiplier onto espeak-ng's words-per-minute range.
fn words_per_minute(rate: f32, base: u32) -> u32 {
    let wpm = (rate.max(0.0) * base as f32).round() as u32;
    wpm.clamp(MIN_WPM, MAX_WPM)
}

/// Parse the table printed by `espeak-ng --voices`.
///
/// ```text
/// Pty Language       Age/Gender VoiceName          File                 Other Languages
///  5  en-us           --/M      English_(America)  gmw/en-US            (en 3)
/// ```
fn parse_voice_list(table: &str) -> Vec<VoiceInfo> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let _priority = cols.next()?;
            let language = cols.next()?;
            let age_gender = cols.next()?;
            let name = cols.next()?.replace('_', " ");
            let gender = match age_gender.rsplit('/').next() {
                Some("M") => VoiceGender::Male,
                Some("F") => VoiceGender::Female,
                _ => infer_gender(&name),
            };
            Some(VoiceInfo {
                id: language.to_string(),
                name,
                gender,
            })
        })
        .collect()
}
