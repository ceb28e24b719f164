//! Core library for Beatlight.
//!
//! Audio arrives as a magnitude spectrum per tick and flows through band
//! energy tracking, rolling statistics and event detection. A slower light
//! tick turns the detected events into smart bulb commands and LED matrix
//! frames, which an output channel streams to the microcontroller.

pub mod analysis;
pub mod audio;
pub mod config;
pub mod detect;
pub mod error;
pub mod hue;
pub mod link;
pub mod pixels;
pub mod sequencer;
pub mod show;

pub use analysis::{BandAnalyzer, BandEnergyTracker, BandStats, RollingHistory};
pub use audio::{AudioSource, SpectrumAnalyser, SyntheticSource};
pub use config::{AppConfig, Thresholds};
pub use detect::{Cues, EventDetector};
pub use error::{BeatlightError, Result};
pub use hue::{BulbBridge, LightCommand, LoggingBridge};
pub use link::{MemoryLink, OutputChannel, OutputFrame, PhysicalLink, SerialLink};
pub use pixels::{GridLayout, PixelSurface};
pub use sequencer::{Action, LightSequencer, Phase};
pub use show::LightShow;
