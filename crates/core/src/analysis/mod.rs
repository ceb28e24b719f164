//! Per-band energy extraction and rolling statistics.

pub mod history;

use serde::{Deserialize, Serialize};

use crate::{config::AnalysisConfig, BeatlightError, Result};

pub use history::{BandHistory, BandStats, RollingHistory};

pub const MIDRANGE: &str = "midrange";
pub const TOTAL: &str = "total";
pub const KICK: &str = "kick";
pub const SNARE_ATTACK: &str = "snareattack";

/// A named frequency window resolved to FFT bin indices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub name: String,
    pub low_bin: usize,
    pub high_bin: usize,
    pub activation_delta: f32,
}

impl Band {
    pub fn contains(&self, bin: usize) -> bool {
        self.low_bin <= bin && bin <= self.high_bin
    }
}

/// Maps a frequency to the FFT bin that holds it.
pub fn freq_to_bin(freq_hz: f64, bin_hz: f64) -> usize {
    (freq_hz / bin_hz).floor().max(0.0) as usize
}

/// Sums squared magnitudes per band over one spectrum frame.
#[derive(Debug, Clone)]
pub struct BandEnergyTracker {
    bands: Vec<Band>,
    energy: Vec<f32>,
}

impl BandEnergyTracker {
    pub fn new(config: &AnalysisConfig) -> Self {
        let bands: Vec<Band> = config
            .bands
            .iter()
            .map(|spec| Band {
                name: spec.name.clone(),
                low_bin: freq_to_bin(spec.low_hz, config.bin_hz),
                high_bin: freq_to_bin(spec.high_hz, config.bin_hz),
                activation_delta: spec.activation_delta,
            })
            .collect();
        let energy = vec![0.0; bands.len()];
        Self { bands, energy }
    }

    pub fn bands(&self) -> &[Band] {
        &self.bands
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.bands.iter().position(|band| band.name == name)
    }

    /// Energy accumulated since the last commit.
    pub fn energy(&self) -> &[f32] {
        &self.energy
    }

    /// Adds `spectrum[i]^2` to every band containing bin `i`, for bins in
    /// `[1, len / 2)`. Bin 0 (DC) is ignored.
    ///
    /// Rejects empty spectra and non-finite magnitudes without touching the
    /// accumulators.
    pub fn accumulate(&mut self, spectrum: &[f32]) -> Result<()> {
        if spectrum.is_empty() {
            return Err(BeatlightError::InvalidInput("spectrum frame is empty"));
        }
        let usable = &spectrum[..spectrum.len() / 2];
        if usable.iter().any(|value| !value.is_finite()) {
            return Err(BeatlightError::InvalidInput(
                "spectrum frame contains non-finite magnitudes",
            ));
        }

        for (bin, magnitude) in usable.iter().enumerate().skip(1) {
            let power = magnitude * magnitude;
            for (band, energy) in self.bands.iter().zip(self.energy.iter_mut()) {
                if band.contains(bin) {
                    *energy += power;
                }
            }
        }
        Ok(())
    }

    /// Pushes the accumulated energies into `store` and clears them.
    pub fn commit(&mut self, store: &mut RollingHistory) -> Vec<BandStats> {
        let stats = store.commit(&self.energy);
        self.energy.iter_mut().for_each(|energy| *energy = 0.0);
        stats
    }
}

/// Tracker and history pair driven once per audio tick.
#[derive(Debug)]
pub struct BandAnalyzer {
    tracker: BandEnergyTracker,
    history: RollingHistory,
}

impl BandAnalyzer {
    pub fn new(config: &AnalysisConfig) -> Self {
        let tracker = BandEnergyTracker::new(config);
        let history = RollingHistory::new(tracker.bands().len(), config.history_length);
        Self { tracker, history }
    }

    pub fn tracker(&self) -> &BandEnergyTracker {
        &self.tracker
    }

    pub fn history(&self) -> &RollingHistory {
        &self.history
    }

    /// Runs accumulate then commit for one spectrum frame. Invalid frames
    /// are committed as zero energy so every band still advances.
    pub fn process(&mut self, spectrum: &[f32]) -> Vec<BandStats> {
        if let Err(err) = self.tracker.accumulate(spectrum) {
            tracing::warn!(%err, "skipping audio tick");
        }
        self.tracker.commit(&mut self.history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BandSpec;

    fn config(bands: Vec<BandSpec>) -> AnalysisConfig {
        AnalysisConfig {
            bin_hz: 10.0,
            history_length: 4,
            bands,
        }
    }

    #[test]
    fn resolves_bins_from_frequencies() {
        let tracker = BandEnergyTracker::new(&AnalysisConfig::default());
        let kick = &tracker.bands()[tracker.index_of(KICK).unwrap()];
        assert_eq!(kick.low_bin, 14);
        assert_eq!(kick.high_bin, 18);
        assert_eq!(tracker.index_of("missing"), None);
    }

    #[test]
    fn accumulates_squares_inside_windows_only() {
        let mut tracker = BandEnergyTracker::new(&config(vec![
            BandSpec::new("low", 10.0, 20.0, 0.0),
            BandSpec::new("wide", 0.0, 1000.0, 0.0),
        ]));
        let mut spectrum = vec![0.0_f32; 16];
        spectrum[0] = 100.0; // DC is ignored
        spectrum[1] = 1.0;
        spectrum[2] = 2.0;
        spectrum[3] = 3.0;
        spectrum[9] = 50.0; // upper half is ignored

        tracker.accumulate(&spectrum).unwrap();
        assert_eq!(tracker.energy(), &[5.0, 14.0]);

        let mut store = RollingHistory::new(2, 4);
        let stats = tracker.commit(&mut store);
        assert_eq!(stats[0].current, 5.0);
        assert_eq!(tracker.energy(), &[0.0, 0.0]);
        assert_eq!(store.band(1).unwrap().last(), 14.0);
    }

    #[test]
    fn invalid_frames_commit_zero_energy() {
        let mut analyzer = BandAnalyzer::new(&config(vec![BandSpec::new("all", 0.0, 1000.0, 0.0)]));
        analyzer.process(&[0.0, 1.0, 0.0, 0.0]);
        let stats = analyzer.process(&[]);
        assert_eq!(stats[0].current, 0.0);
        assert_eq!(stats[0].previous, 1.0);

        let stats = analyzer.process(&[0.0, f32::NAN, 0.0, 0.0]);
        assert_eq!(stats[0].current, 0.0);
        assert_eq!(analyzer.history().band(0).unwrap().last(), 0.0);
    }
}
