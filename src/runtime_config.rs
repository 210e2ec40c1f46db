//! Live rendering parameters and the restart signal.
//!
//! Every mutation raises the restart signal; the dispatcher clears it when it
//! reinitializes the engine, so the next message renders with the new values.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::info;

use crate::error::ConfigError;

pub const MAX_SPEECH_RATE: f32 = 3.0;
pub const MAX_VOLUME: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuntimeConfig {
    /// Index into the engine's voice list used when no preference applies.
    pub voice_index: usize,
    /// Audio output index; `None` selects the system default output.
    pub audio_device_index: Option<usize>,
    /// Speed multiplier in `[0, 3]`, 1.0 is normal.
    pub speech_rate: f32,
    /// Percentage in `[0, 100]`.
    pub volume: u8,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            voice_index: 0,
            audio_device_index: None,
            speech_rate: 1.0,
            volume: MAX_VOLUME,
        }
    }
}

impl RuntimeConfig {
    /// Clamp file-provided values into range.
    pub fn clamped(self) -> Self {
        Self {
            speech_rate: if self.speech_rate.is_finite() {
                self.speech_rate.clamp(0.0, MAX_SPEECH_RATE)
            } else {
                1.0
            },
            volume: self.volume.min(MAX_VOLUME),
            ..self
        }
    }
}

pub fn validate_rate(rate: f32) -> Result<f32, ConfigError> {
    if rate.is_finite() && (0.0..=MAX_SPEECH_RATE).contains(&rate) {
        Ok(rate)
    } else {
        Err(ConfigError::RateOutOfRange(rate))
    }
}

pub fn validate_volume(volume: u32) -> Result<u8, ConfigError> {
    u8::try_from(volume)
        .ok()
        .filter(|v| *v <= MAX_VOLUME)
        .ok_or(ConfigError::VolumeOutOfRange(volume))
}

/// Owner of the mutable [`RuntimeConfig`] and its restart signal.
pub struct ConfigController {
    config: Mutex<RuntimeConfig>,
    restart: AtomicBool,
}

impl ConfigController {
    pub fn new(initial: RuntimeConfig) -> Self {
        Self {
            config: Mutex::new(initial.clamped()),
            restart: AtomicBool::new(false),
        }
    }

    pub fn snapshot(&self) -> RuntimeConfig {
        *self.config.lock()
    }

    pub fn set_voice(&self, voice_index: usize) {
        self.update(|c| c.voice_index = voice_index);
        info!("Voice set to index {voice_index}");
    }

    pub fn set_audio_device(&self, device: Option<usize>) {
        self.update(|c| c.audio_device_index = device);
        match device {
            Some(i) => info!("Audio output set to index {i}"),
            None => info!("Audio output set to system default"),
        }
    }

    pub fn set_rate(&self, rate: f32) -> Result<(), ConfigError> {
        let rate = validate_rate(rate)?;
        self.update(|c| c.speech_rate = rate);
        info!("Speech rate set to {rate:.2}");
        Ok(())
    }

    pub fn set_volume(&self, volume: u32) -> Result<(), ConfigError> {
        let volume = validate_volume(volume)?;
        self.update(|c| c.volume = volume);
        info!("Volume set to {volume}");
        Ok(())
    }

    fn update(&self, apply: impl FnOnce(&mut RuntimeConfig)) {
        let mut config = self.config.lock();
        apply(&mut config);
        // Raised while the config lock is held so a reinit never sees the
        // flag without the value that raised it.
        self.restart.store(true, Ordering::SeqCst);
    }

    pub fn restart_requested(&self) -> bool {
        self.restart.load(Ordering::SeqCst)
    }

    /// Clear the restart signal, returning whether it was set.
    pub fn take_restart(&self) -> bool {
        self.restart.swap(false, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutation_raises_restart_signal() {
        let controller = ConfigController::new(RuntimeConfig::default());
        assert!(!controller.restart_requested());

        controller.set_rate(1.5).unwrap();
        assert!(controller.restart_requested());
        assert!(controller.take_restart());
        assert!(!controller.restart_requested());

        controller.set_voice(2);
        controller.set_audio_device(Some(1));
        assert!(controller.take_restart());

        let snap = controller.snapshot();
        assert_eq!(snap.voice_index, 2);
        assert_eq!(snap.audio_device_index, Some(1));
        assert_eq!(snap.speech_rate, 1.5);
    }

    #[test]
    fn out_of_range_values_are_rejected_without_signal() {
        let controller = ConfigController::new(RuntimeConfig::default());
        assert_eq!(
            controller.set_rate(3.5),
            Err(ConfigError::RateOutOfRange(3.5))
        );
        assert!(controller.set_rate(f32::NAN).is_err());
        assert_eq!(
            controller.set_volume(101),
            Err(ConfigError::VolumeOutOfRange(101))
        );
        assert!(!controller.restart_requested());
        assert_eq!(controller.snapshot(), RuntimeConfig::default());
    }

    #[test]
    fn initial_values_are_clamped() {
        let controller = ConfigController::new(RuntimeConfig {
            speech_rate: 9.0,
            volume: 250,
            ..RuntimeConfig::default()
        });
        let snap = controller.snapshot();
        assert_eq!(snap.speech_rate, MAX_SPEECH_RATE);
        assert_eq!(snap.volume, MAX_VOLUME);
    }
}
