//! Edge-triggered musical event detection over band statistics.

use serde::{Deserialize, Serialize};

use crate::{
    analysis::{self, BandEnergyTracker, BandStats},
    config::Thresholds,
};

/// Event flags raised by the detector and consumed by the light sequencer.
///
/// Flags accumulate across however many audio ticks happen between two
/// light ticks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cues {
    /// Total energy peaked and started falling. Lasts one light tick.
    pub total_max: bool,
    pub drop: bool,
    pub kick_pending: bool,
    pub snare_pending: bool,
    /// Every audio sample since the last light tick was below the silence
    /// volume.
    pub silence: bool,
    /// Most recent overall volume.
    pub volume: f32,
}

impl Default for Cues {
    fn default() -> Self {
        Self {
            total_max: false,
            drop: false,
            kick_pending: false,
            snare_pending: false,
            silence: true,
            volume: 0.0,
        }
    }
}

impl Cues {
    /// Opens the next accumulation window.
    pub fn reset_window(&mut self) {
        self.silence = true;
        self.total_max = false;
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct BandSlots {
    total: Option<usize>,
    kick: Option<usize>,
    snare: Option<usize>,
}

/// Threshold/hysteresis state machine run once per audio tick.
#[derive(Debug, Clone)]
pub struct EventDetector {
    thresholds: Thresholds,
    slots: BandSlots,
    total_max_possible: bool,
    drop_possible: bool,
}

impl EventDetector {
    /// Resolves the `total`, `kick` and `snareattack` bands by name. Bands
    /// that are not configured never raise events.
    pub fn new(thresholds: Thresholds, tracker: &BandEnergyTracker) -> Self {
        Self {
            thresholds,
            slots: BandSlots {
                total: tracker.index_of(analysis::TOTAL),
                kick: tracker.index_of(analysis::KICK),
                snare: tracker.index_of(analysis::SNARE_ATTACK),
            },
            total_max_possible: false,
            drop_possible: false,
        }
    }

    pub fn set_thresholds(&mut self, thresholds: Thresholds) {
        self.thresholds = thresholds;
    }

    pub fn total_max_possible(&self) -> bool {
        self.total_max_possible
    }

    pub fn drop_possible(&self) -> bool {
        self.drop_possible
    }

    /// Applies one tick of band statistics and the tick's volume to `cues`.
    pub fn detect(&mut self, stats: &[BandStats], volume: f32, cues: &mut Cues) {
        if let Some(total) = self.slots.total.and_then(|slot| stats.get(slot)) {
            self.detect_total(total, cues);
        }
        if let Some(kick) = self.slots.kick.and_then(|slot| stats.get(slot)) {
            if self.onset(kick, self.thresholds.kick_t, self.thresholds.kick_q) {
                if !cues.kick_pending {
                    probe(analysis::KICK, kick);
                }
                cues.kick_pending = true;
            }
        }
        if let Some(snare) = self.slots.snare.and_then(|slot| stats.get(slot)) {
            if self.onset(snare, self.thresholds.snare_t, self.thresholds.snare_q) {
                if !cues.snare_pending {
                    probe(analysis::SNARE_ATTACK, snare);
                }
                cues.snare_pending = true;
            }
        }

        let volume = if volume.is_finite() { volume } else { 0.0 };
        cues.volume = volume;
        cues.silence = cues.silence && volume < self.thresholds.silence_volume;
    }

    fn detect_total(&mut self, stats: &BandStats, cues: &mut Cues) {
        let t = &self.thresholds;

        if self.total_max_possible && stats.delta < 0.0 {
            cues.total_max = true;
            self.total_max_possible = false;
            if self.drop_possible {
                tracing::debug!("drop confirmed");
                cues.drop = true;
                self.drop_possible = false;
            }
        }

        if stats.current >= stats.max && stats.current > stats.mean + t.peak_c * stats.stddev {
            if stats.current > 3.0 * stats.mean
                && stats.mean < t.drop_q
                && stats.delta > t.drop_t
                && stats.current > t.drop_floor
            {
                probe(analysis::TOTAL, stats);
                self.drop_possible = true;
            }
            self.total_max_possible = true;
        } else {
            self.drop_possible = false;
            self.total_max_possible = false;
        }
    }

    fn onset(&self, stats: &BandStats, spread: f32, ceiling: f32) -> bool {
        stats.current > stats.mean + spread * stats.stddev
            && stats.mean < ceiling
            && stats.current > self.thresholds.onset_floor
    }
}

fn probe(band: &str, stats: &BandStats) {
    tracing::debug!(
        band,
        current = stats.current,
        mean = stats.mean,
        stddev = stats.stddev,
        delta = stats.delta,
        "band onset"
    );
}
