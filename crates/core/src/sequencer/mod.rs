//! Turns detected events into bulb commands, one light tick at a time.

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    config::AppConfig,
    detect::Cues,
    hue::{BulbBridge, LightCommand},
};

const FULL: u8 = 254;
const HUE_STEP: u32 = 10_000;
const HUE_WRAP: u32 = 65_535;
const SATURATION_LOW: i32 = 127;
const SATURATION_HIGH: i32 = 380;

/// Which onset a flash answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashProfile {
    Kick,
    Snare,
}

impl FlashProfile {
    pub fn hue(self) -> u16 {
        match self {
            Self::Kick => 300,
            Self::Snare => 43_000,
        }
    }

    fn attack(self) -> LightCommand {
        LightCommand::new()
            .on(true)
            .brightness(FULL)
            .hue(self.hue())
            .saturation(FULL)
            .transition(1)
            .alert("none")
    }

    fn decay(self) -> LightCommand {
        LightCommand::new()
            .on(true)
            .brightness(1)
            .hue(self.hue())
            .saturation(FULL)
            .transition(2)
            .alert("none")
    }
}

/// A flash whose attack has been sent and whose decay is owed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flash {
    pub target: usize,
    pub profile: FlashProfile,
}

/// Pending-event state of the sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Ready,
    Flash(Flash),
    /// Drop effect running; `duration` is the drop tick about to run. A
    /// flash cut short by the drop finishes once the drop ends.
    Dropping { duration: u32, resume: Option<Flash> },
}

/// What a light tick did with the bulbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Override or silent mode; `light` is the bulb that got a command.
    Ambient { light: Option<usize> },
    Drop { duration: u32 },
    FlashAttack(Flash),
    FlashDecay(Flash),
    Idle { switched_off: bool },
}

/// Sequencer context. Every counter that survives between ticks lives here.
#[derive(Debug)]
pub struct LightSequencer {
    rng: StdRng,
    phase: Phase,
    target: usize,
    idle_counter: u32,
    silent_counter: u32,
    silent_mode: bool,
    alternating: bool,
    ambient_hue: u32,
    ambient_light: usize,
    saturation: i32,
    saturation_falling: bool,
    owed_updates: u32,
}

impl Default for LightSequencer {
    fn default() -> Self {
        Self::with_rng(StdRng::from_os_rng())
    }
}

impl LightSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deterministic target selection.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            rng,
            phase: Phase::Ready,
            target: 0,
            idle_counter: 0,
            silent_counter: 0,
            silent_mode: true,
            alternating: false,
            ambient_hue: 0,
            ambient_light: 0,
            saturation: 254,
            saturation_falling: false,
            owed_updates: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn silent_mode(&self) -> bool {
        self.silent_mode
    }

    pub fn silent_counter(&self) -> u32 {
        self.silent_counter
    }

    pub fn saturation(&self) -> i32 {
        self.saturation
    }

    pub fn owed_updates(&self) -> u32 {
        self.owed_updates
    }

    /// Duration of the drop tick about to run, if a drop is active.
    pub fn drop_duration(&self) -> Option<u32> {
        match self.phase {
            Phase::Dropping { duration, .. } => Some(duration),
            _ => None,
        }
    }

    /// Owes `count` ambient updates so that override colours reach the
    /// bulbs even outside silent mode.
    pub fn request_updates(&mut self, count: u32) {
        self.owed_updates = count;
    }

    fn flash_in_flight(&self) -> Option<Flash> {
        match self.phase {
            Phase::Flash(flash) => Some(flash),
            Phase::Dropping { resume, .. } => resume,
            Phase::Ready => None,
        }
    }

    /// Runs one light tick against the cues gathered since the last one and
    /// opens the next accumulation window.
    pub fn tick(&mut self, cues: &mut Cues, config: &AppConfig, bridge: &dyn BulbBridge) -> Action {
        let light_count = config.sequencer.light_count.max(1);
        if self.flash_in_flight().is_none() {
            cues.kick_pending = cues.kick_pending && cues.total_max;
            cues.snare_pending = cues.snare_pending && cues.total_max;
            self.target = self.rng.random_range(0..light_count);
        }

        let action = if self.silent_mode || !config.reacts_to_audio() {
            self.ambient(config, light_count, bridge)
        } else if cues.drop || matches!(self.phase, Phase::Dropping { .. }) {
            self.drop_step(cues, config, bridge)
        } else if let Phase::Flash(flash) = self.phase {
            bridge.send_light_command(flash.target, &flash.profile.decay());
            match flash.profile {
                FlashProfile::Kick => cues.kick_pending = false,
                FlashProfile::Snare => cues.snare_pending = false,
            }
            self.phase = Phase::Ready;
            Action::FlashDecay(flash)
        } else if cues.kick_pending {
            self.attack(FlashProfile::Kick, bridge)
        } else if cues.snare_pending {
            self.attack(FlashProfile::Snare, bridge)
        } else {
            self.idle(config.sequencer.idle_threshold, bridge)
        };

        self.post_update(cues, config);
        action
    }

    fn ambient(&mut self, config: &AppConfig, light_count: usize, bridge: &dyn BulbBridge) -> Action {
        if !(self.silent_mode || self.owed_updates > 0) {
            return Action::Ambient { light: None };
        }
        self.alternating = !self.alternating;
        if self.silent_mode && !self.alternating {
            return Action::Ambient { light: None };
        }

        self.ambient_hue = (self.ambient_hue + HUE_STEP) % HUE_WRAP;
        self.ambient_light = (self.ambient_light + 1) % light_count;
        bridge.send_light_command(self.ambient_light, &self.ambient_command(config));
        self.owed_updates = self.owed_updates.saturating_sub(1);
        tracing::trace!(
            owed = self.owed_updates,
            silent = self.silent_mode,
            "ambient update"
        );
        Action::Ambient {
            light: Some(self.ambient_light),
        }
    }

    fn ambient_command(&self, config: &AppConfig) -> LightCommand {
        if config.lights_off {
            return LightCommand::new().on(false);
        }
        if config.red_alert {
            return LightCommand::new()
                .on(true)
                .brightness(1)
                .hue(1)
                .saturation(FULL)
                .effect("none");
        }
        if config.control_lights {
            return LightCommand::new()
                .on(true)
                .brightness(1)
                .hue((self.ambient_hue + 1) as u16)
                .saturation(self.saturation.clamp(0, FULL as i32) as u8)
                .transition(12)
                .effect("none");
        }

        let manual = &config.manual;
        let brightness = (254 + 64 * i64::from(manual.brighten)).clamp(1, 254);
        let saturation = (126 + 63 * i64::from(manual.saturation)).clamp(0, 254);
        let hue = (16_384 + 4_096 * i64::from(manual.color_slide)).clamp(0, 65_535);
        LightCommand::new()
            .on(true)
            .brightness(brightness as u8)
            .hue(hue as u16)
            .saturation(saturation as u8)
            .effect("none")
    }

    fn drop_step(&mut self, cues: &mut Cues, config: &AppConfig, bridge: &dyn BulbBridge) -> Action {
        cues.drop = false;
        let (duration, resume) = match self.phase {
            Phase::Dropping { duration, resume } => (duration, resume),
            Phase::Flash(flash) => (0, Some(flash)),
            Phase::Ready => (0, None),
        };

        if duration == 0 {
            tracing::info!("drop on");
            bridge.send_group_command(0, &LightCommand::new().alert("select"));
        }
        self.phase = if duration > config.sequencer.drop_hold_ticks {
            tracing::info!("drop off");
            resume.map_or(Phase::Ready, Phase::Flash)
        } else {
            Phase::Dropping {
                duration: duration + 1,
                resume,
            }
        };
        Action::Drop { duration }
    }

    fn attack(&mut self, profile: FlashProfile, bridge: &dyn BulbBridge) -> Action {
        let flash = Flash {
            target: self.target,
            profile,
        };
        tracing::debug!(?profile, target = flash.target, "flash on");
        bridge.send_light_command(flash.target, &profile.attack());
        self.phase = Phase::Flash(flash);
        Action::FlashAttack(flash)
    }

    fn idle(&mut self, threshold: u32, bridge: &dyn BulbBridge) -> Action {
        self.idle_counter += 1;
        if self.idle_counter <= threshold {
            return Action::Idle {
                switched_off: false,
            };
        }
        bridge.send_light_command(
            self.target,
            &LightCommand::new()
                .on(false)
                .brightness(0)
                .saturation(FULL)
                .transition(20)
                .alert("none")
                .effect("colorloop"),
        );
        self.idle_counter = 0;
        Action::Idle { switched_off: true }
    }

    fn post_update(&mut self, cues: &mut Cues, config: &AppConfig) {
        if cues.silence {
            self.silent_counter = self.silent_counter.saturating_add(1);
            if config.control_lights
                && !self.silent_mode
                && self.silent_counter > config.sequencer.silent_run_length
            {
                tracing::info!(intervals = self.silent_counter, "silence detected");
                self.silent_mode = true;
            }
        } else {
            if self.silent_mode {
                tracing::info!("sound resumed");
            }
            self.silent_counter = 0;
            self.silent_mode = false;
        }

        if self.alternating {
            if self.saturation < SATURATION_LOW {
                self.saturation_falling = false;
            }
            if self.saturation > SATURATION_HIGH {
                self.saturation_falling = true;
            }
            self.saturation += if self.saturation_falling { -1 } else { 1 };
        }

        cues.reset_window();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Sent {
        Light(usize, LightCommand),
        Group(u8, LightCommand),
    }

    #[derive(Default)]
    struct RecordingBridge {
        sent: Mutex<Vec<Sent>>,
    }

    impl RecordingBridge {
        fn take(&self) -> Vec<Sent> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    impl BulbBridge for RecordingBridge {
        fn send_light_command(&self, target: usize, command: &LightCommand) {
            self.sent.lock().unwrap().push(Sent::Light(target, command.clone()));
        }

        fn send_group_command(&self, group: u8, command: &LightCommand) {
            self.sent.lock().unwrap().push(Sent::Group(group, command.clone()));
        }
    }

    fn loud() -> Cues {
        Cues {
            silence: false,
            volume: 0.5,
            ..Default::default()
        }
    }

    /// A sequencer that has already heard sound, so it is out of silent mode.
    fn awake(config: &AppConfig, bridge: &RecordingBridge) -> LightSequencer {
        let mut sequencer = LightSequencer::with_seed(7);
        let mut cues = loud();
        sequencer.tick(&mut cues, config, bridge);
        assert!(!sequencer.silent_mode());
        bridge.take();
        sequencer
    }

    #[test]
    fn starts_in_silent_mode() {
        assert!(LightSequencer::with_seed(1).silent_mode());
    }

    #[test]
    fn onsets_without_total_peak_are_dropped() {
        let config = AppConfig::default();
        let bridge = RecordingBridge::default();
        let mut sequencer = awake(&config, &bridge);

        let mut cues = Cues {
            kick_pending: true,
            snare_pending: true,
            ..loud()
        };
        let action = sequencer.tick(&mut cues, &config, &bridge);

        assert!(matches!(action, Action::Idle { .. }));
        assert!(!cues.kick_pending);
        assert!(!cues.snare_pending);
        assert!(bridge.take().is_empty());
    }

    #[test]
    fn kick_flashes_then_decays_on_same_bulb() {
        let config = AppConfig::default();
        let bridge = RecordingBridge::default();
        let mut sequencer = awake(&config, &bridge);

        let mut cues = Cues {
            kick_pending: true,
            total_max: true,
            ..loud()
        };
        let Action::FlashAttack(flash) = sequencer.tick(&mut cues, &config, &bridge) else {
            panic!("expected a flash");
        };
        assert_eq!(flash.profile, FlashProfile::Kick);
        assert!(cues.kick_pending);
        assert!(!cues.total_max);

        cues.silence = false;
        let action = sequencer.tick(&mut cues, &config, &bridge);
        assert_eq!(action, Action::FlashDecay(flash));
        assert!(!cues.kick_pending);
        assert_eq!(sequencer.phase(), Phase::Ready);

        let sent = bridge.take();
        assert_eq!(
            sent,
            vec![
                Sent::Light(flash.target, FlashProfile::Kick.attack()),
                Sent::Light(flash.target, FlashProfile::Kick.decay()),
            ]
        );
        if let Sent::Light(_, attack) = &sent[0] {
            assert_eq!(attack.brightness, Some(254));
            assert_eq!(attack.hue, Some(300));
        }
    }

    #[test]
    fn snare_uses_its_own_hue() {
        let config = AppConfig::default();
        let bridge = RecordingBridge::default();
        let mut sequencer = awake(&config, &bridge);

        let mut cues = Cues {
            snare_pending: true,
            total_max: true,
            ..loud()
        };
        let action = sequencer.tick(&mut cues, &config, &bridge);
        assert!(matches!(
            action,
            Action::FlashAttack(Flash {
                profile: FlashProfile::Snare,
                ..
            })
        ));
        match &bridge.take()[0] {
            Sent::Light(_, command) => assert_eq!(command.hue, Some(43_000)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn drop_runs_its_course_once() {
        let config = AppConfig::default();
        let bridge = RecordingBridge::default();
        let mut sequencer = awake(&config, &bridge);

        let mut cues = Cues { drop: true, ..loud() };
        let mut durations = Vec::new();
        loop {
            cues.silence = false;
            match sequencer.tick(&mut cues, &config, &bridge) {
                Action::Drop { duration } => durations.push(duration),
                _ => break,
            }
        }

        assert_eq!(durations, (0..=9).collect::<Vec<_>>());
        assert!(durations.windows(2).all(|pair| pair[1] > pair[0]));
        assert_eq!(sequencer.drop_duration(), None);
        let sent = bridge.take();
        assert_eq!(sent[0], Sent::Group(0, LightCommand::new().alert("select")));
        assert!(sent[1..].iter().all(|sent| matches!(sent, Sent::Light(..))));
    }

    #[test]
    fn drop_postpones_a_flash_decay() {
        let config = AppConfig::default();
        let bridge = RecordingBridge::default();
        let mut sequencer = awake(&config, &bridge);

        let mut cues = Cues {
            kick_pending: true,
            total_max: true,
            ..loud()
        };
        let Action::FlashAttack(flash) = sequencer.tick(&mut cues, &config, &bridge) else {
            panic!("expected a flash");
        };

        cues.drop = true;
        for _ in 0..10 {
            cues.silence = false;
            assert!(matches!(
                sequencer.tick(&mut cues, &config, &bridge),
                Action::Drop { .. }
            ));
            assert_eq!(sequencer.target(), flash.target);
        }
        cues.silence = false;
        assert_eq!(
            sequencer.tick(&mut cues, &config, &bridge),
            Action::FlashDecay(flash)
        );
    }

    #[test]
    fn idle_switches_target_off_every_third_tick() {
        let config = AppConfig::default();
        let bridge = RecordingBridge::default();
        let mut sequencer = awake(&config, &bridge);

        let mut switched = Vec::new();
        for _ in 0..6 {
            let mut cues = loud();
            if let Action::Idle { switched_off } = sequencer.tick(&mut cues, &config, &bridge) {
                switched.push(switched_off);
            }
        }
        assert_eq!(switched, vec![false, false, true, false, false, true]);
        for sent in bridge.take() {
            match sent {
                Sent::Light(_, command) => {
                    assert_eq!(command.on, Some(false));
                    assert_eq!(command.effect_name.as_deref(), Some("colorloop"));
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn silent_mode_follows_the_run_length() {
        let config = AppConfig::default();
        let bridge = RecordingBridge::default();
        let mut sequencer = awake(&config, &bridge);

        let mut cues = Cues::default();
        for _ in 0..40 {
            sequencer.tick(&mut cues, &config, &bridge);
        }
        assert!(!sequencer.silent_mode());
        sequencer.tick(&mut cues, &config, &bridge);
        assert!(sequencer.silent_mode());

        let mut cues = loud();
        sequencer.tick(&mut cues, &config, &bridge);
        assert!(!sequencer.silent_mode());
        assert_eq!(sequencer.silent_counter(), 0);
    }

    #[test]
    fn silent_mode_breathes_on_alternate_ticks() {
        let config = AppConfig::default();
        let bridge = RecordingBridge::default();
        let mut sequencer = LightSequencer::with_seed(3);

        let mut lights = Vec::new();
        let (mut lowest, mut highest) = (i32::MAX, i32::MIN);
        for _ in 0..1_200 {
            let mut cues = Cues::default();
            if let Action::Ambient { light } = sequencer.tick(&mut cues, &config, &bridge) {
                lights.push(light);
            }
            lowest = lowest.min(sequencer.saturation());
            highest = highest.max(sequencer.saturation());
        }

        assert_eq!(&lights[..4], &[Some(1), None, Some(2), None]);
        assert_eq!((lowest, highest), (126, 381));
        for sent in bridge.take() {
            let Sent::Light(_, command) = sent else {
                panic!("unexpected group command");
            };
            assert_eq!(command.brightness, Some(1));
            assert!(command.saturation.unwrap() <= 254);
        }
    }

    #[test]
    fn override_pays_owed_updates_then_holds() {
        let config = AppConfig {
            lights_off: true,
            ..AppConfig::default()
        };
        let bridge = RecordingBridge::default();
        let mut sequencer = awake(&config, &bridge);
        sequencer.request_updates(2);

        let mut cues = Cues {
            kick_pending: true,
            total_max: true,
            drop: true,
            ..loud()
        };
        for _ in 0..4 {
            cues.silence = false;
            sequencer.tick(&mut cues, &config, &bridge);
        }

        let sent = bridge.take();
        assert_eq!(sent.len(), 2);
        assert!(sent
            .iter()
            .all(|sent| matches!(sent, Sent::Light(_, command) if *command == LightCommand::new().on(false))));
        assert_eq!(sequencer.owed_updates(), 0);
        assert!(cues.drop);
    }

    #[test]
    fn manual_colour_is_clamped() {
        let mut config = AppConfig {
            control_lights: false,
            ..AppConfig::default()
        };
        config.manual.brighten = -10;
        config.manual.saturation = 1;
        config.manual.color_slide = 20;

        let command = LightSequencer::with_seed(0).ambient_command(&config);
        assert_eq!(command.brightness, Some(1));
        assert_eq!(command.saturation, Some(189));
        assert_eq!(command.hue, Some(65_535));
    }
}
