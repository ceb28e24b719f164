use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{link::MAX_PIXEL_INDEX, BeatlightError, Result};

/// Top-level configuration structure for the application.
///
/// Every section falls back to its defaults when missing from a file, so a
/// config only needs to spell out what it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Let detected events drive the bulbs. When false the bulbs hold the
    /// manual colour.
    pub control_lights: bool,
    pub lights_off: bool,
    pub red_alert: bool,
    pub audio_input_in_separate_thread: bool,
    pub hue_output_in_separate_thread: bool,
    pub leds_output_in_separate_thread: bool,
    pub analysis: AnalysisConfig,
    pub thresholds: Thresholds,
    pub sequencer: SequencerConfig,
    pub manual: ManualColor,
    pub timing: TimingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            control_lights: true,
            lights_off: false,
            red_alert: false,
            audio_input_in_separate_thread: false,
            hue_output_in_separate_thread: false,
            leds_output_in_separate_thread: false,
            analysis: AnalysisConfig::default(),
            thresholds: Thresholds::default(),
            sequencer: SequencerConfig::default(),
            manual: ManualColor::default(),
            timing: TimingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Reads and validates a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(path, raw)?;
        Ok(())
    }

    /// True when detected events should reach the bulbs at all.
    pub fn reacts_to_audio(&self) -> bool {
        self.control_lights && !self.lights_off && !self.red_alert
    }

    pub fn validate(&self) -> Result<()> {
        let analysis = &self.analysis;
        if !(analysis.bin_hz.is_finite() && analysis.bin_hz > 0.0) {
            return Err(BeatlightError::InvalidConfig(format!(
                "bin_hz must be positive, got {}",
                analysis.bin_hz
            )));
        }
        if analysis.history_length == 0 {
            return Err(BeatlightError::InvalidConfig(
                "history_length must be at least 1".to_string(),
            ));
        }
        for band in &analysis.bands {
            if !(band.low_hz.is_finite() && band.high_hz.is_finite()) || band.low_hz > band.high_hz
            {
                return Err(BeatlightError::InvalidConfig(format!(
                    "band `{}` has an invalid frequency window",
                    band.name
                )));
            }
        }
        if self.sequencer.light_count == 0 {
            return Err(BeatlightError::InvalidConfig(
                "light_count must be at least 1".to_string(),
            ));
        }
        let (width, height) = (self.sequencer.grid_width, self.sequencer.grid_height);
        if width == 0 || height == 0 {
            return Err(BeatlightError::InvalidConfig(
                "pixel grid must not be empty".to_string(),
            ));
        }
        match width.checked_mul(height) {
            Some(pixels) if pixels <= MAX_PIXEL_INDEX + 1 => {}
            _ => {
                return Err(BeatlightError::InvalidConfig(format!(
                    "a {width}x{height} pixel grid exceeds the {} addressable pixels",
                    MAX_PIXEL_INDEX + 1
                )))
            }
        }
        self.thresholds.validate()
    }
}

/// One named frequency window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandSpec {
    pub name: String,
    pub low_hz: f64,
    pub high_hz: f64,
    pub activation_delta: f32,
}

impl BandSpec {
    pub fn new(name: impl Into<String>, low_hz: f64, high_hz: f64, activation_delta: f32) -> Self {
        Self {
            name: name.into(),
            low_hz,
            high_hz,
            activation_delta,
        }
    }
}

/// Spectrum layout and band definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Width of one FFT bin in Hz, as produced by the audio front end.
    pub bin_hz: f64,
    pub history_length: usize,
    pub bands: Vec<BandSpec>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            bin_hz: 2.69,
            history_length: 16,
            bands: vec![
                BandSpec::new(crate::analysis::MIDRANGE, 250.0, 2000.0, 0.025),
                BandSpec::new(crate::analysis::TOTAL, 60.0, 2000.0, 0.05),
                BandSpec::new(crate::analysis::KICK, 40.0, 50.0, 0.001),
                BandSpec::new(crate::analysis::SNARE_ATTACK, 1500.0, 2500.0, 0.001),
            ],
        }
    }
}

/// Detection multipliers and ceilings applied to band mean/stddev.
///
/// These values were tuned by ear and should be re-checked against real
/// program material before being trusted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub peak_c: f32,
    pub drop_q: f32,
    pub drop_t: f32,
    pub kick_t: f32,
    pub kick_q: f32,
    pub snare_t: f32,
    pub snare_q: f32,
    /// Minimum total energy for a drop candidate.
    pub drop_floor: f32,
    /// Minimum band energy for a kick or snare onset.
    pub onset_floor: f32,
    /// Volume under which an audio sample counts as silent.
    pub silence_volume: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            peak_c: 1.5,
            drop_q: 0.03,
            drop_t: 0.1,
            kick_t: 1.5,
            kick_q: 0.1,
            snare_t: 1.5,
            snare_q: 0.1,
            drop_floor: 0.26,
            onset_floor: 0.001,
            silence_volume: 0.01,
        }
    }
}

impl Thresholds {
    fn validate(&self) -> Result<()> {
        let values = [
            ("peak_c", self.peak_c),
            ("drop_q", self.drop_q),
            ("drop_t", self.drop_t),
            ("kick_t", self.kick_t),
            ("kick_q", self.kick_q),
            ("snare_t", self.snare_t),
            ("snare_q", self.snare_q),
            ("drop_floor", self.drop_floor),
            ("onset_floor", self.onset_floor),
            ("silence_volume", self.silence_volume),
        ];
        match values.iter().find(|(_, value)| !value.is_finite()) {
            Some((name, value)) => Err(BeatlightError::InvalidConfig(format!(
                "threshold `{name}` must be finite, got {value}"
            ))),
            None => Ok(()),
        }
    }
}

/// Light sequencing constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// Number of bulbs addressable by index.
    pub light_count: usize,
    /// Idle ticks tolerated before the target bulb is switched off.
    pub idle_threshold: u32,
    /// Consecutive silent intervals before silent mode engages.
    pub silent_run_length: u32,
    /// Drop ticks after the alert before the drop sequence ends.
    pub drop_hold_ticks: u32,
    pub grid_width: usize,
    pub grid_height: usize,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            light_count: 5,
            idle_threshold: 2,
            silent_run_length: 40,
            drop_hold_ticks: 8,
            grid_width: 30,
            grid_height: 40,
        }
    }
}

/// Colour nudges used when the bulbs are not under audio control.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManualColor {
    pub brighten: i32,
    pub saturation: i32,
    pub color_slide: i32,
}

/// Worker loop cadences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Pause between audio ticks; zero only yields.
    pub audio_interval_ms: u64,
    /// Light tick period. Hue bridges accept about ten changes per second.
    pub light_interval_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            audio_interval_ms: 5,
            light_interval_ms: 100,
        }
    }
}

impl TimingConfig {
    pub fn audio_interval(&self) -> Duration {
        Duration::from_millis(self.audio_interval_ms)
    }

    pub fn light_interval(&self) -> Duration {
        Duration::from_millis(self.light_interval_ms)
    }
}
