use serde::{Deserialize, Serialize};

/// Statistics for one band on one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BandStats {
    pub current: f32,
    /// Value recorded on the tick before `current`.
    pub previous: f32,
    pub delta: f32,
    pub mean: f32,
    /// Population standard deviation, never negative.
    pub stddev: f32,
    /// Largest value in the window.
    pub max: f32,
}

/// Fixed-length circular history of per-tick energies for a single band.
#[derive(Debug, Clone)]
pub struct BandHistory {
    values: Vec<f32>,
    write_index: usize,
}

impl BandHistory {
    /// Creates a zero-filled history. A zero length is bumped to one.
    pub fn new(len: usize) -> Self {
        Self {
            values: vec![0.0; len.max(1)],
            write_index: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn write_index(&self) -> usize {
        self.write_index
    }

    /// Overwrites the oldest slot and advances the write index.
    pub fn push(&mut self, value: f32) {
        self.values[self.write_index] = value;
        self.write_index = (self.write_index + 1) % self.values.len();
    }

    /// Value most recently pushed.
    pub fn last(&self) -> f32 {
        self.values[self.offset_back(1)]
    }

    /// Scores `candidate` against the window as it stands, before it is
    /// pushed. `previous` is the last pushed value.
    pub fn evaluate(&self, candidate: f32) -> BandStats {
        let (mean, stddev, max) = self.moments();
        let previous = self.last();
        BandStats {
            current: candidate,
            previous,
            delta: candidate - previous,
            mean,
            stddev,
            max,
        }
    }

    /// Statistics of the most recently pushed value over the full window,
    /// including that value.
    pub fn stats(&self) -> BandStats {
        let (mean, stddev, max) = self.moments();
        let current = self.last();
        let previous = self.values[self.offset_back(2)];
        BandStats {
            current,
            previous,
            delta: current - previous,
            mean,
            stddev,
            max,
        }
    }

    fn offset_back(&self, steps: usize) -> usize {
        let len = self.values.len();
        (self.write_index + len - steps % len) % len
    }

    fn moments(&self) -> (f32, f32, f32) {
        let len = self.values.len() as f32;
        let mean = self.values.iter().sum::<f32>() / len;
        let ssd: f32 = self
            .values
            .iter()
            .map(|value| (value - mean) * (value - mean))
            .sum();
        let variance = ssd / len;
        let stddev = if variance.is_finite() && variance > 0.0 {
            variance.sqrt()
        } else {
            0.0
        };
        let max = self
            .values
            .iter()
            .copied()
            .fold(f32::NEG_INFINITY, f32::max);
        (mean, stddev, max)
    }
}

/// Histories for every tracked band, updated in lockstep.
#[derive(Debug, Clone)]
pub struct RollingHistory {
    bands: Vec<BandHistory>,
}

impl RollingHistory {
    pub fn new(band_count: usize, history_length: usize) -> Self {
        Self {
            bands: (0..band_count)
                .map(|_| BandHistory::new(history_length))
                .collect(),
        }
    }

    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    pub fn band(&self, band: usize) -> Option<&BandHistory> {
        self.bands.get(band)
    }

    pub fn push(&mut self, band: usize, value: f32) {
        if let Some(history) = self.bands.get_mut(band) {
            history.push(value);
        }
    }

    pub fn stats(&self, band: usize) -> Option<BandStats> {
        self.bands.get(band).map(BandHistory::stats)
    }

    /// Evaluates one value per band against the current windows and then
    /// pushes all of them.
    pub fn commit(&mut self, values: &[f32]) -> Vec<BandStats> {
        debug_assert_eq!(values.len(), self.bands.len());
        self.bands
            .iter_mut()
            .zip(values)
            .map(|(history, value)| {
                let stats = history.evaluate(*value);
                history.push(*value);
                stats
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_and_keeps_fixed_length() {
        let mut history = BandHistory::new(4);
        for value in 1..=10 {
            history.push(value as f32);
            assert_eq!(history.len(), 4);
        }

        assert_eq!(history.write_index(), 10 % 4);
        assert_eq!(history.last(), 10.0);
        let mut values = history.values().to_vec();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(values, vec![7.0, 8.0, 9.0, 10.0]);
    }

    #[test]
    fn population_statistics() {
        let mut history = BandHistory::new(4);
        for value in [2.0, 4.0, 4.0, 6.0] {
            history.push(value);
        }

        let stats = history.stats();
        assert_eq!(stats.current, 6.0);
        assert_eq!(stats.previous, 4.0);
        assert_eq!(stats.delta, 2.0);
        assert!((stats.mean - 4.0).abs() < 1e-6);
        assert!((stats.stddev - 2.0_f32.sqrt()).abs() < 1e-6);
        assert_eq!(stats.max, 6.0);
    }

    #[test]
    fn evaluates_candidate_against_prior_window() {
        let mut history = BandHistory::new(3);
        history.push(1.0);
        history.push(1.0);
        history.push(1.0);

        let stats = history.evaluate(4.0);
        assert_eq!(stats.previous, 1.0);
        assert_eq!(stats.delta, 3.0);
        assert_eq!(stats.mean, 1.0);
        assert_eq!(stats.stddev, 0.0);
        assert_eq!(stats.max, 1.0);
    }

    #[test]
    fn stddev_never_negative_or_nan() {
        let mut store = RollingHistory::new(2, 16);
        for tick in 0..40 {
            let value = if tick % 3 == 0 { 1e-7 } else { 0.0 };
            for stats in store.commit(&[value, 1e30]) {
                assert!(stats.stddev >= 0.0);
                assert!(!stats.stddev.is_nan());
            }
        }
        for band in 0..2 {
            assert_eq!(store.band(band).unwrap().len(), 16);
            assert!(store.stats(band).unwrap().stddev >= 0.0);
        }
    }
}
