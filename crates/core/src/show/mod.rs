//! Lifecycle of the whole light show: the audio intake loop, the light
//! sequencing loop, and the output channel they feed.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, RwLock,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    analysis::BandAnalyzer,
    audio::AudioSource,
    config::AppConfig,
    detect::{Cues, EventDetector},
    hue::BulbBridge,
    link::{OutputChannel, PhysicalLink},
    pixels::{render_volume_meter, GridLayout, PixelSurface},
    sequencer::{Action, LightSequencer},
    BeatlightError, Result,
};

/// Longest uninterrupted sleep inside a worker, so stop requests are seen
/// promptly.
const STOP_POLL: Duration = Duration::from_millis(10);

struct Intake {
    analyzer: BandAnalyzer,
    detector: EventDetector,
}

impl Intake {
    fn new(config: &AppConfig) -> Self {
        let analyzer = BandAnalyzer::new(&config.analysis);
        let detector = EventDetector::new(config.thresholds.clone(), analyzer.tracker());
        Self { analyzer, detector }
    }
}

struct Shared {
    config: RwLock<AppConfig>,
    source: Mutex<Box<dyn AudioSource>>,
    intake: Mutex<Intake>,
    cues: Mutex<Cues>,
    sequencer: Mutex<LightSequencer>,
    bridge: Arc<dyn BulbBridge>,
    channel: Arc<OutputChannel>,
    surface: PixelSurface,
    fault: Mutex<Option<BeatlightError>>,
}

struct Workers {
    stop: Arc<AtomicBool>,
    audio: JoinHandle<()>,
    lights: JoinHandle<()>,
}

/// Owns the two worker loops and their start/stop semantics.
///
/// The output channel is started before the workers and stopped only after
/// both have finished their current tick, so EXIT never races a frame.
/// A failed light tick ends the show from inside: the workers wind down,
/// the link is closed and the error waits in [`LightShow::take_fault`].
pub struct LightShow {
    shared: Arc<Shared>,
    workers: Mutex<Option<Workers>>,
}

impl LightShow {
    pub fn new(
        config: AppConfig,
        source: impl AudioSource + 'static,
        bridge: Arc<dyn BulbBridge>,
        link: impl PhysicalLink + 'static,
    ) -> Result<Self> {
        Self::with_sequencer(config, source, bridge, link, LightSequencer::new())
    }

    pub fn with_sequencer(
        config: AppConfig,
        source: impl AudioSource + 'static,
        bridge: Arc<dyn BulbBridge>,
        link: impl PhysicalLink + 'static,
        sequencer: LightSequencer,
    ) -> Result<Self> {
        config.validate()?;
        let channel = Arc::new(OutputChannel::new(
            link,
            config.leds_output_in_separate_thread,
        ));
        let shared = Shared {
            intake: Mutex::new(Intake::new(&config)),
            config: RwLock::new(config),
            source: Mutex::new(Box::new(source)),
            cues: Mutex::new(Cues::default()),
            sequencer: Mutex::new(sequencer),
            bridge,
            surface: PixelSurface::new(Arc::clone(&channel)),
            channel,
            fault: Mutex::new(None),
        };
        Ok(Self {
            shared: Arc::new(shared),
            workers: Mutex::new(None),
        })
    }

    pub fn channel(&self) -> &Arc<OutputChannel> {
        &self.shared.channel
    }

    pub fn config(&self) -> Result<AppConfig> {
        self.shared.config_snapshot()
    }

    /// Cues gathered since the last light tick.
    pub fn cues(&self) -> Result<Cues> {
        Ok(*self.shared.lock_cues()?)
    }

    pub fn silent_mode(&self) -> Result<bool> {
        Ok(self.shared.lock_sequencer()?.silent_mode())
    }

    /// True while both workers run. A link failure ends the show on its
    /// own, after which this reports false until the next `enable`.
    pub fn is_enabled(&self) -> bool {
        self.lock_workers()
            .map(|workers| {
                workers
                    .as_ref()
                    .is_some_and(|running| !running.stop.load(Ordering::Acquire))
            })
            .unwrap_or(false)
    }

    /// Opens the output and starts both workers. Does nothing when already
    /// enabled. Workers left behind by a failed session are reaped first.
    pub fn enable(&self) -> Result<()> {
        let mut workers = self.lock_workers()?;
        if let Some(running) = workers.as_ref() {
            if !running.stop.load(Ordering::Acquire) {
                return Ok(());
            }
        }
        if let Some(stale) = workers.take() {
            if let Err(err) = self.shut_down(stale) {
                tracing::warn!(%err, "previous session did not shut down cleanly");
            }
        }

        self.shared.channel.start()?;
        let stop = Arc::new(AtomicBool::new(false));
        let audio = spawn_worker("audio-intake", &self.shared, &stop, audio_loop)?;
        let lights = match spawn_worker("light-sequencer", &self.shared, &stop, light_loop) {
            Ok(handle) => handle,
            Err(err) => {
                stop.store(true, Ordering::Release);
                if audio.join().is_err() {
                    tracing::warn!("audio worker panicked during start-up");
                }
                if let Err(stop_err) = self.shared.channel.stop() {
                    tracing::warn!(%stop_err, "output channel did not stop cleanly");
                }
                return Err(err);
            }
        };
        *workers = Some(Workers {
            stop,
            audio,
            lights,
        });
        tracing::info!("light show enabled");
        Ok(())
    }

    /// Stops both workers, waits for their current tick, then sends EXIT and
    /// closes the link. Does nothing when already disabled.
    pub fn disable(&self) -> Result<()> {
        let mut workers = self.lock_workers()?;
        match workers.take() {
            Some(running) => self.shut_down(running),
            None => Ok(()),
        }
    }

    fn shut_down(&self, running: Workers) -> Result<()> {
        running.stop.store(true, Ordering::Release);
        let audio = running.audio.join();
        let lights = running.lights.join();
        let stopped = self.shared.channel.stop();
        tracing::info!("light show disabled");

        if audio.is_err() || lights.is_err() {
            return Err(BeatlightError::msg("a light show worker panicked"));
        }
        stopped
    }

    /// Swaps in a new configuration. Analysis state is rebuilt when the band
    /// layout changes, and every bulb is owed one update so override colours
    /// take effect.
    pub fn update_config(&self, config: AppConfig) -> Result<()> {
        config.validate()?;
        {
            let mut intake = self.shared.lock_intake()?;
            let current = self.shared.config_snapshot()?;
            if current.analysis != config.analysis {
                *intake = Intake::new(&config);
            } else {
                intake.detector.set_thresholds(config.thresholds.clone());
            }
        }
        let owed = config.sequencer.light_count as u32;
        *self
            .shared
            .config
            .write()
            .map_err(|_| BeatlightError::msg("configuration has been poisoned"))? = config;
        self.shared.lock_sequencer()?.request_updates(owed);
        Ok(())
    }

    /// Takes the error that stopped a worker or the drain thread, if any.
    pub fn take_fault(&self) -> Option<BeatlightError> {
        let own = self
            .shared
            .fault
            .lock()
            .ok()
            .and_then(|mut fault| fault.take());
        own.or_else(|| self.shared.channel.take_fault())
    }

    /// Runs one audio tick on the calling thread.
    pub fn tick_audio(&self) -> Result<()> {
        self.shared.tick_audio()
    }

    /// Runs one light tick on the calling thread.
    pub fn tick_lights(&self) -> Result<Action> {
        self.shared.tick_lights()
    }

    fn lock_workers(&self) -> Result<MutexGuard<'_, Option<Workers>>> {
        self.workers
            .lock()
            .map_err(|_| BeatlightError::msg("light show toggle has been poisoned"))
    }
}

impl Drop for LightShow {
    fn drop(&mut self) {
        if let Err(err) = self.disable() {
            tracing::warn!(%err, "light show did not shut down cleanly");
        }
    }
}

impl fmt::Debug for LightShow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LightShow")
            .field("enabled", &self.is_enabled())
            .field("channel", &self.shared.channel)
            .finish()
    }
}

impl Shared {
    fn tick_audio(&self) -> Result<()> {
        let config = self.config_snapshot()?;
        let mut source = self.lock_source()?;
        if !config.audio_input_in_separate_thread {
            source.update()?;
        }
        if !config.reacts_to_audio() {
            return Ok(());
        }

        let mut intake = self.lock_intake()?;
        let stats = intake.analyzer.process(source.spectrum());
        let volume = source.volume();
        drop(source);
        let mut cues = self.lock_cues()?;
        intake.detector.detect(&stats, volume, &mut cues);
        Ok(())
    }

    fn tick_lights(&self) -> Result<Action> {
        if let Some(fault) = self.channel.take_fault() {
            return Err(fault);
        }
        let config = self.config_snapshot()?;
        let (action, volume) = {
            let mut sequencer = self.lock_sequencer()?;
            let mut cues = self.lock_cues()?;
            let action = sequencer.tick(&mut cues, &config, self.bridge.as_ref());
            (action, cues.volume)
        };

        if self.channel.is_running() {
            let layout = GridLayout::new(config.sequencer.grid_width, config.sequencer.grid_height);
            render_volume_meter(&self.surface, &layout, volume)?;
            self.surface.flush();
        }
        if !config.hue_output_in_separate_thread {
            self.bridge.update();
        }
        if !config.leds_output_in_separate_thread && self.channel.is_running() {
            self.channel.drain()?;
        }
        Ok(action)
    }

    fn record_fault(&self, err: BeatlightError) {
        if let Ok(mut fault) = self.fault.lock() {
            *fault = Some(err);
        }
    }

    fn config_snapshot(&self) -> Result<AppConfig> {
        self.config
            .read()
            .map(|config| config.clone())
            .map_err(|_| BeatlightError::msg("configuration has been poisoned"))
    }

    fn lock_source(&self) -> Result<MutexGuard<'_, Box<dyn AudioSource>>> {
        self.source
            .lock()
            .map_err(|_| BeatlightError::msg("audio source has been poisoned"))
    }

    fn lock_intake(&self) -> Result<MutexGuard<'_, Intake>> {
        self.intake
            .lock()
            .map_err(|_| BeatlightError::msg("audio analysis has been poisoned"))
    }

    fn lock_cues(&self) -> Result<MutexGuard<'_, Cues>> {
        self.cues
            .lock()
            .map_err(|_| BeatlightError::msg("event cues have been poisoned"))
    }

    fn lock_sequencer(&self) -> Result<MutexGuard<'_, LightSequencer>> {
        self.sequencer
            .lock()
            .map_err(|_| BeatlightError::msg("light sequencer has been poisoned"))
    }
}

fn spawn_worker(
    name: &str,
    shared: &Arc<Shared>,
    stop: &Arc<AtomicBool>,
    body: fn(&Shared, &AtomicBool),
) -> Result<JoinHandle<()>> {
    let shared = Arc::clone(shared);
    let stop = Arc::clone(stop);
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || body(&shared, &stop))?;
    Ok(handle)
}

fn audio_loop(shared: &Shared, stop: &AtomicBool) {
    while !stop.load(Ordering::Acquire) {
        if let Err(err) = shared.tick_audio() {
            tracing::warn!(%err, "audio tick failed");
        }
        let interval = shared
            .config_snapshot()
            .map(|config| config.timing.audio_interval())
            .unwrap_or(STOP_POLL);
        if interval.is_zero() {
            thread::yield_now();
        } else {
            sleep_unless_stopped(stop, interval);
        }
    }
}

fn light_loop(shared: &Shared, stop: &AtomicBool) {
    let mut next_tick = Instant::now();
    loop {
        let interval = shared
            .config_snapshot()
            .map(|config| config.timing.light_interval())
            .unwrap_or(Duration::from_millis(100));
        next_tick = (next_tick + interval).max(Instant::now());
        sleep_unless_stopped(stop, next_tick.saturating_duration_since(Instant::now()));
        if stop.load(Ordering::Acquire) {
            break;
        }
        if let Err(err) = shared.tick_lights() {
            tracing::error!(%err, "light tick failed; stopping the show");
            shared.record_fault(err);
            stop.store(true, Ordering::Release);
            if let Err(err) = shared.channel.stop() {
                tracing::warn!(%err, "output channel did not stop cleanly");
            }
            break;
        }
    }
}

fn sleep_unless_stopped(stop: &AtomicBool, duration: Duration) {
    let deadline = Instant::now() + duration;
    loop {
        if stop.load(Ordering::Acquire) {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep((deadline - now).min(STOP_POLL));
    }
}
