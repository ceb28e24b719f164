//! Audio intake: the source seam the show polls, a PCM-to-spectrum front
//! end, and a synthetic source for running without a capture device.

use std::{f32::consts::PI, fmt, sync::Arc, time::Instant};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};

use crate::{BeatlightError, Result};

/// Supplies one spectrum frame and overall volume per audio tick.
pub trait AudioSource: Send {
    /// Pulls fresh audio. Sources that capture on their own thread make this
    /// a no-op.
    fn update(&mut self) -> Result<()>;

    /// Magnitudes for a full FFT frame (even length, bin 0 is DC).
    fn spectrum(&self) -> &[f32];

    /// Overall level in `[0, 1]`.
    fn volume(&self) -> f32;
}

/// Turns blocks of mono PCM into the magnitude spectrum and volume an
/// [`AudioSource`] exposes.
pub struct SpectrumAnalyser {
    sample_rate: u32,
    fft: FftResources,
    window: Vec<f32>,
    spectrum: Vec<f32>,
    volume: f32,
}

impl SpectrumAnalyser {
    pub fn new(sample_rate: u32, fft_size: usize) -> Result<Self> {
        if fft_size < 2 || fft_size % 2 != 0 {
            return Err(BeatlightError::InvalidInput(
                "fft size must be even and at least two",
            ));
        }
        let mut planner = RealFftPlanner::<f32>::new();
        let plan = planner.plan_fft_forward(fft_size);
        let fft = FftResources {
            scratch: plan.make_scratch_vec(),
            output: plan.make_output_vec(),
            input: plan.make_input_vec(),
            plan,
        };
        Ok(Self {
            sample_rate,
            fft,
            window: (0..fft_size).map(|i| hann_value(i, fft_size)).collect(),
            spectrum: vec![0.0; fft_size],
            volume: 0.0,
        })
    }

    pub fn fft_size(&self) -> usize {
        self.window.len()
    }

    /// Frequency covered by one bin. Feed this to the analysis config.
    pub fn bin_hz(&self) -> f64 {
        f64::from(self.sample_rate) / self.fft_size() as f64
    }

    pub fn spectrum(&self) -> &[f32] {
        &self.spectrum
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Analyses exactly one FFT frame of samples. The upper half of the
    /// output mirrors the lower half, as a complex FFT would.
    pub fn process(&mut self, samples: &[f32]) -> Result<()> {
        let size = self.fft_size();
        if samples.len() != size {
            return Err(BeatlightError::InvalidInput(
                "analysis block must match the fft size",
            ));
        }

        for ((input, sample), weight) in self.fft.input.iter_mut().zip(samples).zip(&self.window) {
            *input = sample * weight;
        }
        self.fft.plan.process_with_scratch(
            &mut self.fft.input,
            &mut self.fft.output,
            &mut self.fft.scratch,
        )?;

        let scale = 2.0 / size as f32;
        for (bin, value) in self.fft.output.iter().enumerate() {
            let magnitude = value.norm() * scale;
            self.spectrum[bin] = magnitude;
            if bin > 0 && bin < size / 2 {
                self.spectrum[size - bin] = magnitude;
            }
        }
        self.volume = samples
            .iter()
            .fold(0.0_f32, |peak, sample| peak.max(sample.abs()))
            .min(1.0);
        Ok(())
    }
}

impl fmt::Debug for SpectrumAnalyser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectrumAnalyser")
            .field("sample_rate", &self.sample_rate)
            .field("fft_size", &self.fft_size())
            .field("volume", &self.volume)
            .finish()
    }
}

struct FftResources {
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    output: Vec<Complex32>,
    input: Vec<f32>,
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}

/// Drum-machine style test signal: a low kick on every beat, a bright snare
/// on beats two and four, and a soft pad underneath. Renders as much audio
/// as wall-clock time has passed since the previous update.
pub struct SyntheticSource {
    analyser: SpectrumAnalyser,
    sample_rate: u32,
    tempo_bpm: f32,
    /// Sliding window of the most recent `fft_size` samples.
    ring: Vec<f32>,
    rendered: u64,
    last_update: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(sample_rate: u32, fft_size: usize, tempo_bpm: f32) -> Result<Self> {
        Ok(Self {
            analyser: SpectrumAnalyser::new(sample_rate, fft_size)?,
            sample_rate,
            tempo_bpm: tempo_bpm.max(1.0),
            ring: vec![0.0; fft_size],
            rendered: 0,
            last_update: None,
        })
    }

    pub fn bin_hz(&self) -> f64 {
        self.analyser.bin_hz()
    }

    /// Renders `samples` more samples and re-analyses the window.
    pub fn advance(&mut self, samples: usize) -> Result<()> {
        let samples = samples.min(self.ring.len());
        self.ring.rotate_left(samples);
        let start = self.ring.len() - samples;
        for offset in 0..samples {
            self.ring[start + offset] = self.sample_at(self.rendered + offset as u64);
        }
        self.rendered += samples as u64;
        self.analyser.process(&self.ring)
    }

    fn sample_at(&self, index: u64) -> f32 {
        let rate = self.sample_rate as f32;
        let t = index as f32 / rate;
        let beat_len = 60.0 / self.tempo_bpm;
        let beat = (t / beat_len).floor();
        let since_beat = t - beat * beat_len;

        let kick = (2.0 * PI * 45.0 * since_beat).sin() * (-since_beat * 12.0).exp();
        let snare = if beat as u64 % 2 == 1 {
            (2.0 * PI * 1_900.0 * since_beat).sin() * (-since_beat * 30.0).exp()
        } else {
            0.0
        };
        let pad = 0.05 * (2.0 * PI * 220.0 * t).sin();
        (0.6 * kick + 0.3 * snare + pad).clamp(-1.0, 1.0)
    }
}

impl AudioSource for SyntheticSource {
    fn update(&mut self) -> Result<()> {
        let now = Instant::now();
        let elapsed = self
            .last_update
            .map(|last| now.duration_since(last).as_secs_f64())
            .unwrap_or(0.0);
        self.last_update = Some(now);
        let samples = (elapsed * f64::from(self.sample_rate)) as usize;
        self.advance(samples.max(1))
    }

    fn spectrum(&self) -> &[f32] {
        self.analyser.spectrum()
    }

    fn volume(&self) -> f32 {
        self.analyser.volume()
    }
}

impl fmt::Debug for SyntheticSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyntheticSource")
            .field("tempo_bpm", &self.tempo_bpm)
            .field("rendered", &self.rendered)
            .finish()
    }
}
