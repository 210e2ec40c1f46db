//! Single consumer that turns queued messages into speech.
//!
//! INITIALIZING → DRAINING → (restart signal | init failure) → INITIALIZING
//!
//! Runs on its own OS thread: the engine and its audio stream block and are
//! not `Send`. The restart signal is checked once per loop
//! iteration, so a render in progress always finishes first.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::context::ServerContext;
use crate::engine::{resolve_voice, EngineFactory, EngineInventory, EngineStatus, VoiceEngine, VoiceInfo};
use crate::error::EngineError;
use crate::ingress::preview;
use crate::queue::QueuedMessage;

/// How long one queue wait blocks before re-checking shutdown and restart.
pub const QUEUE_WAIT: Duration = Duration::from_millis(200);
pub const RENDER_POLL_INTERVAL: Duration = Duration::from_millis(50);
const BACKOFF_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Initializing,
    Draining,
    Stopped,
}

impl fmt::Display for DispatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "INITIALIZING"),
            Self::Draining => write!(f, "DRAINING"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}

pub struct Dispatcher {
    ctx: ServerContext,
    factory: Arc<dyn EngineFactory>,
    init_backoff: Duration,
    state: DispatcherState,
    voices: Vec<VoiceInfo>,
    /// Configured voice index, clamped to the inventory at init.
    default_voice: usize,
}

impl Dispatcher {
    pub fn new(ctx: ServerContext, factory: Arc<dyn EngineFactory>, init_backoff: Duration) -> Self {
        Self {
            ctx,
            factory,
            init_backoff,
            state: DispatcherState::Initializing,
            voices: Vec::new(),
            default_voice: 0,
        }
    }

    /// Start the dispatcher on a named thread.
    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("dispatcher".into())
            .spawn(move || self.run())
    }

    pub fn run(mut self) {
        info!("Dispatcher started");
        let mut engine: Option<Box<dyn VoiceEngine>> = None;

        while !self.ctx.shutdown.is_triggered() {
            if engine.is_some() && self.ctx.config.restart_requested() {
                info!("Configuration changed, reinitializing voice engine");
                // Dropping the engine releases its audio output.
                engine = None;
            }

            if engine.is_none() {
                self.transition(DispatcherState::Initializing);
                match self.initialize() {
                    Ok(e) => {
                        engine = Some(e);
                        self.transition(DispatcherState::Draining);
                    }
                    Err(e) => {
                        error!(
                            "Voice engine initialization failed: {e}; retrying in {}ms",
                            self.init_backoff.as_millis()
                        );
                        self.backoff();
                    }
                }
                continue;
            }

            if let (Some(active), Some(msg)) =
                (engine.as_mut(), self.ctx.queue.get_wait(QUEUE_WAIT))
            {
                self.dispatch(active.as_mut(), &msg);
            }
        }

        drop(engine);
        self.transition(DispatcherState::Stopped);
    }

    fn transition(&mut self, next: DispatcherState) {
        if self.state != next {
            info!("Dispatcher: {} → {next}", self.state);
            self.state = next;
        }
    }

    /// Attach and apply the current configuration snapshot.
    fn initialize(&mut self) -> Result<Box<dyn VoiceEngine>, EngineError> {
        // Cleared before the snapshot: a change made during init raises it again.
        self.ctx.config.take_restart();
        let config = self.ctx.config.snapshot();

        let mut engine = self.factory.attach()?;
        engine.select_output(config.audio_device_index)?;

        let voices = engine.voices()?;
        let outputs = engine.audio_outputs().unwrap_or_else(|e| {
            warn!("Could not list audio outputs: {e}");
            Vec::new()
        });

        let voice_index = clamp_voice(config.voice_index, voices.len());
        if !voices.is_empty() {
            engine.select_voice(voice_index)?;
        }
        engine.set_rate(config.speech_rate)?;
        engine.set_volume(config.volume)?;

        info!(
            "Voice engine ready: {} voices, {} outputs (voice {voice_index}, rate {:.2}, volume {})",
            voices.len(),
            outputs.len(),
            config.speech_rate,
            config.volume
        );
        self.voices = voices.clone();
        self.default_voice = voice_index;
        *self.ctx.inventory.lock() = EngineInventory { voices, outputs };
        Ok(engine)
    }

    fn backoff(&self) {
        let deadline = Instant::now() + self.init_backoff;
        while !self.ctx.shutdown.is_triggered() && Instant::now() < deadline {
            thread::sleep(BACKOFF_SLICE.min(deadline.saturating_duration_since(Instant::now())));
        }
    }

    fn dispatch(&self, engine: &mut dyn VoiceEngine, msg: &QueuedMessage) {
        let started = Instant::now();
        match self.render(engine, msg) {
            Ok(()) => {
                let processed = self.ctx.stats.record_processed();
                debug!(
                    "Spoke message from {} in {}ms (processed {processed})",
                    msg.source(),
                    started.elapsed().as_millis()
                );
            }
            Err(e) => error!("Error processing message from {}: {e}", msg.source()),
        }
    }

    fn render(&self, engine: &mut dyn VoiceEngine, msg: &QueuedMessage) -> Result<(), EngineError> {
        let config = self.ctx.config.snapshot();
        let voice = resolve_voice(&self.voices, msg.voice_preference(), self.default_voice);

        if !self.voices.is_empty() {
            engine.select_voice(voice)?;
        }
        engine.set_rate(config.speech_rate)?;
        engine.set_volume(config.volume)?;

        info!("Speaking [{}]: {}", msg.voice_preference(), preview(msg.text()));
        engine.start_speak(msg.text())?;

        // Shutdown is not checked here: a started render always plays out.
        while engine.poll_status()? == EngineStatus::Speaking {
            thread::sleep(RENDER_POLL_INTERVAL);
        }
        Ok(())
    }
}

/// Fall back to voice 0 when the configured index is past the inventory.
fn clamp_voice(configured: usize, available: usize) -> usize {
    if configured < available || available == 0 {
        configured
    } else {
        warn!("Voice index {configured} out of range ({available} voices), using 0");
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::VoiceGender;
    use crate::queue::{MessageSource, VoicePreference};
    use crate::runtime_config::RuntimeConfig;
    use chrono::Local;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Attach,
        Output(Option<usize>),
        Voice(usize),
        Rate(f32),
        Volume(u8),
        Speak(String),
        Finished(String),
    }

    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<Call>>>,
        failed_attaches: Arc<AtomicUsize>,
    }

    impl Recorder {
        fn spoken(&self) -> Vec<String> {
            self.calls
                .lock()
                .iter()
                .filter_map(|c| match c {
                    Call::Speak(t) => Some(t.clone()),
                    _ => None,
                })
                .collect()
        }

        fn count(&self, wanted: &Call) -> usize {
            self.calls.lock().iter().filter(|c| *c == wanted).count()
        }
    }

    struct MockEngine {
        rec: Recorder,
        polls_left: u32,
        speaking: Option<String>,
    }

    impl VoiceEngine for MockEngine {
        fn voices(&self) -> Result<Vec<VoiceInfo>, EngineError> {
            Ok(vec![
                VoiceInfo { id: "a".into(), name: "Alpha".into(), gender: VoiceGender::Unknown },
                VoiceInfo { id: "b".into(), name: "Bert".into(), gender: VoiceGender::Male },
                VoiceInfo { id: "c".into(), name: "Cara".into(), gender: VoiceGender::Female },
            ])
        }

        fn audio_outputs(&self) -> Result<Vec<String>, EngineError> {
            Ok(vec!["Speakers".into()])
        }

        fn select_voice(&mut self, index: usize) -> Result<(), EngineError> {
            self.rec.calls.lock().push(Call::Voice(index));
            Ok(())
        }

        fn select_output(&mut self, index: Option<usize>) -> Result<(), EngineError> {
            self.rec.calls.lock().push(Call::Output(index));
            Ok(())
        }

        fn set_rate(&mut self, rate: f32) -> Result<(), EngineError> {
            self.rec.calls.lock().push(Call::Rate(rate));
            Ok(())
        }

        fn set_volume(&mut self, volume: u8) -> Result<(), EngineError> {
            self.rec.calls.lock().push(Call::Volume(volume));
            Ok(())
        }

        fn start_speak(&mut self, text: &str) -> Result<(), EngineError> {
            if text == "boom" {
                return Err(EngineError::Render("synthetic failure".into()));
            }
            self.rec.calls.lock().push(Call::Speak(text.into()));
            self.polls_left = if text == "long" { 20 } else { 2 };
            self.speaking = Some(text.into());
            Ok(())
        }

        fn poll_status(&mut self) -> Result<EngineStatus, EngineError> {
            if self.polls_left == 0 {
                if let Some(text) = self.speaking.take() {
                    self.rec.calls.lock().push(Call::Finished(text));
                }
                Ok(EngineStatus::Idle)
            } else {
                self.polls_left -= 1;
                Ok(EngineStatus::Speaking)
            }
        }
    }

    /// Factory whose first `fail_first` attaches fail.
    fn factory(rec: &Recorder, fail_first: usize) -> Arc<dyn EngineFactory> {
        let rec = rec.clone();
        Arc::new(move || -> Result<Box<dyn VoiceEngine>, EngineError> {
            rec.calls.lock().push(Call::Attach);
            if rec.failed_attaches.load(Ordering::SeqCst) < fail_first {
                rec.failed_attaches.fetch_add(1, Ordering::SeqCst);
                return Err(EngineError::Init("engine unavailable".into()));
            }
            Ok(Box::new(MockEngine {
                rec: rec.clone(),
                polls_left: 0,
                speaking: None,
            }))
        })
    }

    fn put(ctx: &ServerContext, text: &str, voice: VoicePreference) {
        ctx.queue
            .put(QueuedMessage::new(
                text.into(),
                MessageSource::Tcp("127.0.0.1:9".parse().unwrap()),
                voice,
                Local::now(),
            ))
            .unwrap();
    }

    fn wait_for(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn start(ctx: &ServerContext, factory: Arc<dyn EngineFactory>) -> JoinHandle<()> {
        Dispatcher::new(ctx.clone(), factory, Duration::from_millis(100))
            .spawn()
            .unwrap()
    }

    fn stop(ctx: &ServerContext, handle: JoinHandle<()>) {
        ctx.shutdown.trigger();
        handle.join().unwrap();
    }

    #[test]
    fn renders_in_fifo_order() {
        let ctx = ServerContext::new(RuntimeConfig::default(), 10);
        let rec = Recorder::default();
        for text in ["one", "two", "three"] {
            put(&ctx, text, VoicePreference::Default);
        }
        let handle = start(&ctx, factory(&rec, 0));

        wait_for("three renders", || ctx.stats.snapshot().processed_counter == 3);
        stop(&ctx, handle);

        assert_eq!(rec.spoken(), vec!["one", "two", "three"]);
        assert_eq!(rec.count(&Call::Attach), 1);
        assert_eq!(ctx.inventory.lock().voices.len(), 3);
    }

    #[test]
    fn preference_selects_matching_voice() {
        let ctx = ServerContext::new(
            RuntimeConfig { voice_index: 0, ..RuntimeConfig::default() },
            10,
        );
        let rec = Recorder::default();
        let handle = start(&ctx, factory(&rec, 0));
        wait_for("engine ready", || !ctx.inventory.lock().voices.is_empty());

        put(&ctx, "deep", VoicePreference::Male);
        wait_for("first render", || ctx.stats.snapshot().processed_counter == 1);
        put(&ctx, "bright", VoicePreference::Female);
        wait_for("second render", || ctx.stats.snapshot().processed_counter == 2);
        stop(&ctx, handle);

        let calls = rec.calls.lock().clone();
        let voice_before = |text: &str| {
            let at = calls.iter().position(|c| *c == Call::Speak(text.into())).unwrap();
            calls[..at]
                .iter()
                .rev()
                .find_map(|c| match c {
                    Call::Voice(i) => Some(*i),
                    _ => None,
                })
                .unwrap()
        };
        assert_eq!(voice_before("deep"), 1);
        assert_eq!(voice_before("bright"), 2);
    }

    #[test]
    fn render_failure_does_not_stall_queue() {
        let ctx = ServerContext::new(RuntimeConfig::default(), 10);
        let rec = Recorder::default();
        put(&ctx, "before", VoicePreference::Default);
        put(&ctx, "boom", VoicePreference::Default);
        put(&ctx, "after", VoicePreference::Default);
        let handle = start(&ctx, factory(&rec, 0));

        wait_for("two renders", || ctx.stats.snapshot().processed_counter == 2);
        wait_for("queue drained", || ctx.queue.is_empty());
        stop(&ctx, handle);

        assert_eq!(rec.spoken(), vec!["before", "after"]);
    }

    #[test]
    fn init_failure_is_retried() {
        let ctx = ServerContext::new(RuntimeConfig::default(), 10);
        let rec = Recorder::default();
        put(&ctx, "eventually", VoicePreference::Default);
        let handle = start(&ctx, factory(&rec, 2));

        wait_for("render after retries", || ctx.stats.snapshot().processed_counter == 1);
        stop(&ctx, handle);

        assert_eq!(rec.count(&Call::Attach), 3);
        assert_eq!(rec.spoken(), vec!["eventually"]);
    }

    #[test]
    fn restart_applies_new_settings_without_losing_messages() {
        let ctx = ServerContext::new(RuntimeConfig::default(), 10);
        let rec = Recorder::default();
        let handle = start(&ctx, factory(&rec, 0));
        wait_for("engine ready", || rec.count(&Call::Attach) == 1);

        ctx.config.set_rate(2.0).unwrap();
        ctx.config.set_volume(40).unwrap();
        put(&ctx, "after change", VoicePreference::Default);

        wait_for("render", || ctx.stats.snapshot().processed_counter == 1);
        stop(&ctx, handle);

        // One reinit per observed change; both may coalesce into one.
        assert!(rec.count(&Call::Attach) >= 2);
        assert!(!ctx.config.restart_requested());
        assert_eq!(rec.spoken(), vec!["after change"]);

        let calls = rec.calls.lock().clone();
        let second_attach = calls.iter().rposition(|c| *c == Call::Attach).unwrap();
        let reinit = &calls[second_attach..];
        assert!(reinit.contains(&Call::Output(None)));
        assert!(reinit.contains(&Call::Rate(2.0)));
        assert!(reinit.contains(&Call::Volume(40)));
    }

    #[test]
    fn shutdown_stops_idle_dispatcher_promptly() {
        let ctx = ServerContext::new(RuntimeConfig::default(), 10);
        let rec = Recorder::default();
        let handle = start(&ctx, factory(&rec, 0));
        wait_for("engine ready", || rec.count(&Call::Attach) == 1);

        let started = Instant::now();
        stop(&ctx, handle);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn shutdown_lets_inflight_render_finish() {
        let ctx = ServerContext::new(RuntimeConfig::default(), 10);
        let rec = Recorder::default();
        let handle = start(&ctx, factory(&rec, 0));
        wait_for("engine ready", || rec.count(&Call::Attach) == 1);

        put(&ctx, "long", VoicePreference::Default);
        put(&ctx, "never", VoicePreference::Default);
        wait_for("render started", || rec.count(&Call::Speak("long".into())) == 1);
        stop(&ctx, handle);

        assert_eq!(rec.count(&Call::Finished("long".into())), 1);
        assert_eq!(rec.spoken(), vec!["long"]);
        assert_eq!(ctx.stats.snapshot().processed_counter, 1);
        assert_eq!(ctx.queue.len(), 1);
    }

    #[test]
    fn out_of_range_voice_falls_back_to_first() {
        let ctx = ServerContext::new(
            RuntimeConfig { voice_index: 7, ..RuntimeConfig::default() },
            10,
        );
        let rec = Recorder::default();
        put(&ctx, "one", VoicePreference::Default);
        put(&ctx, "two", VoicePreference::Default);
        let handle = start(&ctx, factory(&rec, 0));

        wait_for("two renders", || ctx.stats.snapshot().processed_counter == 2);
        stop(&ctx, handle);

        assert_eq!(rec.count(&Call::Voice(7)), 0);
        assert_eq!(rec.count(&Call::Voice(0)), 3);
    }

    #[test]
    fn clamp_keeps_valid_index() {
        assert_eq!(clamp_voice(2, 3), 2);
        assert_eq!(clamp_voice(3, 3), 0);
        assert_eq!(clamp_voice(5, 0), 5);
    }

    #[test]
    fn shutdown_interrupts_backoff() {
        let ctx = ServerContext::new(RuntimeConfig::default(), 10);
        let rec = Recorder::default();
        let handle = Dispatcher::new(ctx.clone(), factory(&rec, usize::MAX), Duration::from_secs(60))
            .spawn()
            .unwrap();
        wait_for("first attach", || rec.count(&Call::Attach) == 1);

        let started = Instant::now();
        stop(&ctx, handle);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
