//! Voice rendering engine capability.
//!
//! The dispatcher only talks to [`VoiceEngine`]. Engines are created on the
//! dispatcher thread by an [`EngineFactory`], so an engine itself need not be
//! `Send` (audio output streams usually are not).

pub mod espeak;

use std::fmt;

use crate::error::EngineError;
use crate::queue::VoicePreference;

/// Gender inferred from the engine's voice metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceGender {
    Male,
    Female,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceInfo {
    pub id: String,
    pub name: String,
    pub gender: VoiceGender,
}

/// Result of sampling the engine while a render is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Idle,
    Speaking,
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Speaking => write!(f, "speaking"),
        }
    }
}

pub trait VoiceEngine {
    fn voices(&self) -> Result<Vec<VoiceInfo>, EngineError>;

    fn audio_outputs(&self) -> Result<Vec<String>, EngineError>;

    fn select_voice(&mut self, index: usize) -> Result<(), EngineError>;

    /// `None` selects the system default output.
    fn select_output(&mut self, index: Option<usize>) -> Result<(), EngineError>;

    fn set_rate(&mut self, rate: f32) -> Result<(), EngineError>;

    fn set_volume(&mut self, volume: u8) -> Result<(), EngineError>;

    /// Begin rendering `text`. Returns once playback has started.
    fn start_speak(&mut self, text: &str) -> Result<(), EngineError>;

    fn poll_status(&mut self) -> Result<EngineStatus, EngineError>;
}

/// Attaches to the external engine. Called on every (re)initialization.
pub trait EngineFactory: Send + Sync {
    fn attach(&self) -> Result<Box<dyn VoiceEngine>, EngineError>;
}

impl<F> EngineFactory for F
where
    F: Fn() -> Result<Box<dyn VoiceEngine>, EngineError> + Send + Sync,
{
    fn attach(&self) -> Result<Box<dyn VoiceEngine>, EngineError> {
        self()
    }
}

/// Voices and outputs published after a successful initialization.
#[derive(Debug, Clone, Default)]
pub struct EngineInventory {
    pub voices: Vec<VoiceInfo>,
    pub outputs: Vec<String>,
}

/// Pick the voice for one message.
///
/// An explicit male/female preference wins only when a voice of that gender
/// exists; otherwise the configured default index is used.
pub fn resolve_voice(
    voices: &[VoiceInfo],
    preference: VoicePreference,
    default_index: usize,
) -> usize {
    let wanted = match preference {
        VoicePreference::Male => Some(VoiceGender::Male),
        VoicePreference::Female => Some(VoiceGender::Female),
        VoicePreference::Default => None,
    };
    wanted
        .and_then(|gender| voices.iter().position(|v| v.gender == gender))
        .unwrap_or(default_index)
}

/// Infer gender from a voice name when the engine reports none.
pub fn infer_gender(name: &str) -> VoiceGender {
    let lower = name.to_lowercase();
    if ["female", "woman", "zira"].iter().any(|k| lower.contains(k)) {
        VoiceGender::Female
    } else if ["male", "david"].iter().any(|k| lower.contains(k)) {
        VoiceGender::Male
    } else {
        VoiceGender::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voice(name: &str, gender: VoiceGender) -> VoiceInfo {
        VoiceInfo {
            id: name.to_lowercase(),
            name: name.into(),
            gender,
        }
    }

    #[test]
    fn preference_overrides_default_when_available() {
        let voices = vec![
            voice("Alpha", VoiceGender::Unknown),
            voice("Bert", VoiceGender::Male),
            voice("Cara", VoiceGender::Female),
        ];
        assert_eq!(resolve_voice(&voices, VoicePreference::Male, 0), 1);
        assert_eq!(resolve_voice(&voices, VoicePreference::Female, 0), 2);
        assert_eq!(resolve_voice(&voices, VoicePreference::Default, 2), 2);
    }

    #[test]
    fn missing_gender_falls_back_to_default() {
        let voices = vec![voice("Bert", VoiceGender::Male)];
        assert_eq!(resolve_voice(&voices, VoicePreference::Female, 0), 0);
        assert_eq!(resolve_voice(&[], VoicePreference::Male, 3), 3);
    }

    #[test]
    fn gender_inference_checks_female_first() {
        assert_eq!(infer_gender("Microsoft Zira Desktop"), VoiceGender::Female);
        assert_eq!(infer_gender("english-female"), VoiceGender::Female);
        assert_eq!(infer_gender("english-male"), VoiceGender::Male);
        assert_eq!(infer_gender("en-us"), VoiceGender::Unknown);
    }
}
