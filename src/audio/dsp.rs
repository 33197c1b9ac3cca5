//! Playback enhancement chain
//!
//! High-pass, presence/clarity peaking bands, low-pass, a soft-knee
//! compressor and an output gain, in that order. A chain is built fresh for
//! every chunk so no filter state leaks from one chunk into the next.

use std::f32::consts::PI;

use crate::config::{CompressorConfig, DspConfig, PeakingBand};

// =============================================================================
// Biquad
// =============================================================================

/// RBJ cookbook biquad, direct form I
#[derive(Debug, Clone)]
pub struct Biquad {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl Biquad {
    fn from_coefficients(b0: f32, b1: f32, b2: f32, a0: f32, a1: f32, a2: f32) -> Self {
        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        }
    }

    pub fn highpass(sample_rate: u32, frequency: f32, q: f32) -> Self {
        let (cos_w, alpha) = omega(sample_rate, frequency, q);
        Self::from_coefficients(
            (1.0 + cos_w) / 2.0,
            -(1.0 + cos_w),
            (1.0 + cos_w) / 2.0,
            1.0 + alpha,
            -2.0 * cos_w,
            1.0 - alpha,
        )
    }

    pub fn lowpass(sample_rate: u32, frequency: f32, q: f32) -> Self {
        let (cos_w, alpha) = omega(sample_rate, frequency, q);
        Self::from_coefficients(
            (1.0 - cos_w) / 2.0,
            1.0 - cos_w,
            (1.0 - cos_w) / 2.0,
            1.0 + alpha,
            -2.0 * cos_w,
            1.0 - alpha,
        )
    }

    pub fn peaking(sample_rate: u32, frequency: f32, gain_db: f32, q: f32) -> Self {
        let (cos_w, alpha) = omega(sample_rate, frequency, q);
        let a = 10f32.powf(gain_db / 40.0);
        Self::from_coefficients(
            1.0 + alpha * a,
            -2.0 * cos_w,
            1.0 - alpha * a,
            1.0 + alpha / a,
            -2.0 * cos_w,
            1.0 - alpha / a,
        )
    }

    #[inline]
    pub fn process(&mut self, x: f32) -> f32 {
        let y = self.b0 * x + self.b1 * self.x1 + self.b2 * self.x2
            - self.a1 * self.y1
            - self.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }
}

fn omega(sample_rate: u32, frequency: f32, q: f32) -> (f32, f32) {
    let w0 = 2.0 * PI * frequency / sample_rate as f32;
    let alpha = w0.sin() / (2.0 * q.max(0.01));
    (w0.cos(), alpha)
}

// =============================================================================
// Compressor
// =============================================================================

/// Feed-forward compressor with a soft knee and a dB-domain envelope
#[derive(Debug, Clone)]
pub struct Compressor {
    threshold_db: f32,
    knee_db: f32,
    ratio: f32,
    attack_coef: f32,
    release_coef: f32,
    envelope_db: f32,
}

impl Compressor {
    pub fn new(config: &CompressorConfig, sample_rate: u32) -> Self {
        Self {
            threshold_db: config.threshold_db,
            knee_db: config.knee_db.max(0.0),
            ratio: config.ratio.max(1.0),
            attack_coef: time_coefficient(config.attack_ms, sample_rate),
            release_coef: time_coefficient(config.release_ms, sample_rate),
            envelope_db: SILENCE_DB,
        }
    }

    /// Gain change in dB for a given input level
    fn gain_db(&self, level_db: f32) -> f32 {
        let over = level_db - self.threshold_db;
        let slope = 1.0 / self.ratio - 1.0;

        if 2.0 * over < -self.knee_db {
            0.0
        } else if self.knee_db > 0.0 && 2.0 * over.abs() <= self.knee_db {
            slope * (over + self.knee_db / 2.0).powi(2) / (2.0 * self.knee_db)
        } else {
            slope * over
        }
    }

    #[inline]
    pub fn process(&mut self, x: f32) -> f32 {
        let level_db = 20.0 * x.abs().max(1e-6).log10();
        let coef = if level_db > self.envelope_db {
            self.attack_coef
        } else {
            self.release_coef
        };
        self.envelope_db = coef * self.envelope_db + (1.0 - coef) * level_db;
        x * db_to_linear(self.gain_db(self.envelope_db))
    }
}

const SILENCE_DB: f32 = -120.0;

fn time_coefficient(ms: f32, sample_rate: u32) -> f32 {
    let samples = ms.max(0.01) / 1000.0 * sample_rate as f32;
    (-1.0 / samples).exp()
}

fn db_to_linear(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

// =============================================================================
// Chain
// =============================================================================

/// One chunk's worth of enhancement
pub struct EnhancementChain {
    filters: Vec<Biquad>,
    compressor: Compressor,
    gain: f32,
}

impl EnhancementChain {
    pub fn new(config: &DspConfig, sample_rate: u32) -> Self {
        let nyquist = sample_rate as f32 / 2.0;
        let mut filters = Vec::with_capacity(4);

        if config.highpass_hz > 0.0 && config.highpass_hz < nyquist {
            filters.push(Biquad::highpass(
                sample_rate,
                config.highpass_hz,
                std::f32::consts::FRAC_1_SQRT_2,
            ));
        }

        let bands = std::iter::once(&config.presence).chain(config.clarity.as_ref());
        for band in bands {
            if let Some(filter) = peaking_stage(band, sample_rate, nyquist) {
                filters.push(filter);
            }
        }

        // keep the corner below Nyquist so low sample rates stay stable
        let lowpass = config.lowpass_hz.min(nyquist * 0.95);
        if lowpass > 0.0 {
            filters.push(Biquad::lowpass(
                sample_rate,
                lowpass,
                std::f32::consts::FRAC_1_SQRT_2,
            ));
        }

        Self {
            filters,
            compressor: Compressor::new(&config.compressor, sample_rate),
            gain: config.gain,
        }
    }

    pub fn stages(&self) -> usize {
        // filters + compressor + gain
        self.filters.len() + 2
    }

    pub fn process(&mut self, samples: &mut [f32]) {
        for sample in samples.iter_mut() {
            let mut y = *sample;
            for filter in self.filters.iter_mut() {
                y = filter.process(y);
            }
            y = self.compressor.process(y) * self.gain;
            *sample = y.clamp(-1.0, 1.0);
        }
    }
}

fn peaking_stage(band: &PeakingBand, sample_rate: u32, nyquist: f32) -> Option<Biquad> {
    if band.frequency_hz <= 0.0 || band.frequency_hz >= nyquist {
        return None;
    }
    Some(Biquad::peaking(
        sample_rate,
        band.frequency_hz,
        band.gain_db,
        band.q,
    ))
}

/// Run `samples` through a fresh chain, or return them untouched when the
/// chunk opted out of enhancement or the chain is disabled.
pub fn enhance(
    config: &DspConfig,
    mut samples: Vec<f32>,
    sample_rate: u32,
    preserve_quality: bool,
) -> Vec<f32> {
    if !preserve_quality || !config.enabled {
        return samples;
    }
    EnhancementChain::new(config, sample_rate).process(&mut samples);
    samples
}
