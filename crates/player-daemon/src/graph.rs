//! Per-channel signal graph.
//!
//! ```text
//!   source → normalization gain → band[0] → … → band[9] → output
//!                                                   └──→ analysis tap
//! ```
//!
//! A graph is bound to one channel index.  When the active channel changes the
//! graph is rebuilt, never rebound.  Band gain/Q stay mutable in place.
//!
//! The graph can run in-process on PCM blocks (`process_block`) and renders
//! itself as an mpv `lavfi` chain for the mpv backend (`to_lavfi`).

use std::f64::consts::PI;
use std::sync::Arc;

use player_proto::settings::{
    clamp_finite, EQ_BANDS, EQ_GAIN_MAX_DB, EQ_GAIN_MIN_DB, EQ_Q_DEFAULT, EQ_Q_MAX, EQ_Q_MIN,
};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::equalizer::{EqualizerState, BAND_FREQUENCIES};

pub const DEFAULT_SAMPLE_RATE: f32 = 48_000.0;

/// Samples kept by the analysis tap; also the FFT size.
pub const TAP_FFT_SIZE: usize = 2048;

// ── Biquad ────────────────────────────────────────────────────────────────────

/// Normalised biquad coefficients (a0 = 1).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiquadCoeffs {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl BiquadCoeffs {
    /// RBJ peaking EQ.
    pub fn peaking(freq: f64, q: f64, gain_db: f64, sample_rate: f64) -> Self {
        let a = 10.0_f64.powf(gain_db / 40.0);
        let omega = 2.0 * PI * freq / sample_rate;
        let sin_omega = omega.sin();
        let cos_omega = omega.cos();
        let alpha = sin_omega / (2.0 * q);

        let b0 = 1.0 + alpha * a;
        let b1 = -2.0 * cos_omega;
        let b2 = 1.0 - alpha * a;
        let a0 = 1.0 + alpha / a;
        let a1 = -2.0 * cos_omega;
        let a2 = 1.0 - alpha / a;

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }
}

/// One equalizer band: fixed centre frequency, mutable gain and Q.
#[derive(Debug, Clone)]
pub struct BandFilter {
    frequency: f32,
    gain_db: f32,
    q: f32,
    sample_rate: f32,
    coeffs: BiquadCoeffs,
    z1: f64,
    z2: f64,
}

impl BandFilter {
    pub fn new(frequency: f32, sample_rate: f32) -> Self {
        let mut band = Self {
            frequency,
            gain_db: 0.0,
            q: EQ_Q_DEFAULT,
            sample_rate,
            coeffs: BiquadCoeffs::peaking(frequency as f64, EQ_Q_DEFAULT as f64, 0.0, sample_rate as f64),
            z1: 0.0,
            z2: 0.0,
        };
        band.recompute();
        band
    }

    pub fn frequency(&self) -> f32 {
        self.frequency
    }

    pub fn gain_db(&self) -> f32 {
        self.gain_db
    }

    pub fn q(&self) -> f32 {
        self.q
    }

    pub fn coeffs(&self) -> BiquadCoeffs {
        self.coeffs
    }

    pub fn set_gain_db(&mut self, gain_db: f32) {
        self.gain_db = clamp_finite(gain_db, EQ_GAIN_MIN_DB, EQ_GAIN_MAX_DB, 0.0);
        self.recompute();
    }

    pub fn set_q(&mut self, q: f32) {
        self.q = clamp_finite(q, EQ_Q_MIN, EQ_Q_MAX, EQ_Q_DEFAULT);
        self.recompute();
    }

    fn recompute(&mut self) {
        // bands above Nyquist (low sample rates) are left as a flat pass
        let nyquist = self.sample_rate as f64 / 2.0;
        let freq = (self.frequency as f64).min(nyquist * 0.95);
        self.coeffs =
            BiquadCoeffs::peaking(freq, self.q as f64, self.gain_db as f64, self.sample_rate as f64);
    }

    #[inline]
    pub fn process_sample(&mut self, input: f32) -> f32 {
        let x = input as f64;
        let c = self.coeffs;
        let y = c.b0 * x + self.z1;
        self.z1 = c.b1 * x - c.a1 * y + self.z2;
        self.z2 = c.b2 * x - c.a2 * y;
        y as f32
    }
}

// ── Analysis tap ──────────────────────────────────────────────────────────────

/// Observes the post-EQ signal and exposes frequency-domain magnitudes.
/// Never writes to the audible path.
pub struct AnalysisTap {
    ring: Vec<f32>,
    write_pos: usize,
    window: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
}

impl AnalysisTap {
    pub fn new() -> Self {
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(TAP_FFT_SIZE);
        let window = (0..TAP_FFT_SIZE)
            .map(|i| {
                let phase = 2.0 * std::f32::consts::PI * i as f32 / TAP_FFT_SIZE as f32;
                0.5 * (1.0 - phase.cos())
            })
            .collect();
        Self {
            ring: vec![0.0; TAP_FFT_SIZE],
            write_pos: 0,
            window,
            fft,
        }
    }

    pub fn observe(&mut self, samples: &[f32]) {
        for &s in samples {
            self.ring[self.write_pos] = s;
            self.write_pos = (self.write_pos + 1) % TAP_FFT_SIZE;
        }
    }

    /// Magnitudes of the first `TAP_FFT_SIZE / 2` bins, oldest sample first.
    pub fn magnitudes(&self) -> Vec<f32> {
        let mut buf: Vec<Complex<f32>> = (0..TAP_FFT_SIZE)
            .map(|i| {
                let s = self.ring[(self.write_pos + i) % TAP_FFT_SIZE];
                Complex::new(s * self.window[i], 0.0)
            })
            .collect();
        self.fft.process(&mut buf);
        let scale = 2.0 / TAP_FFT_SIZE as f32;
        buf[..TAP_FFT_SIZE / 2]
            .iter()
            .map(|c| c.norm() * scale)
            .collect()
    }
}

impl Default for AnalysisTap {
    fn default() -> Self {
        Self::new()
    }
}

// ── Graph ─────────────────────────────────────────────────────────────────────

pub struct SignalGraph {
    channel: usize,
    sample_rate: f32,
    normalization_gain: f32,
    bands: [BandFilter; EQ_BANDS],
    tap: AnalysisTap,
}

impl SignalGraph {
    /// Build a fresh graph bound to `channel`, with the equalizer's effective
    /// gains (zero when disabled) and Q values applied.
    pub fn build(
        channel: usize,
        sample_rate: f32,
        normalization_gain: f32,
        eq: &EqualizerState,
    ) -> Self {
        let mut graph = Self {
            channel,
            sample_rate,
            normalization_gain,
            bands: std::array::from_fn(|i| BandFilter::new(BAND_FREQUENCIES[i], sample_rate)),
            tap: AnalysisTap::new(),
        };
        graph.apply_equalizer(eq);
        graph
    }

    pub fn channel(&self) -> usize {
        self.channel
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    pub fn normalization_gain(&self) -> f32 {
        self.normalization_gain
    }

    pub fn set_normalization_gain(&mut self, gain: f32) {
        self.normalization_gain = if gain.is_finite() && gain >= 0.0 {
            gain
        } else {
            1.0
        };
    }

    pub fn bands(&self) -> &[BandFilter; EQ_BANDS] {
        &self.bands
    }

    pub fn apply_equalizer(&mut self, eq: &EqualizerState) {
        let gains = eq.effective_gains();
        for ((band, gain), q) in self.bands.iter_mut().zip(gains).zip(eq.q()) {
            band.q = clamp_finite(*q, EQ_Q_MIN, EQ_Q_MAX, EQ_Q_DEFAULT);
            band.set_gain_db(gain);
        }
    }

    /// Run a mono block through gain and bands in place, feeding the tap.
    pub fn process_block(&mut self, block: &mut [f32]) {
        for s in block.iter_mut() {
            let mut v = *s * self.normalization_gain;
            for band in self.bands.iter_mut() {
                v = band.process_sample(v);
            }
            *s = v;
        }
        self.tap.observe(block);
    }

    pub fn spectrum(&self) -> Vec<f32> {
        self.tap.magnitudes()
    }

    /// mpv `lavfi` graph equivalent of this chain.  The tap becomes an
    /// `astats` meter, which observes without altering the signal.
    pub fn to_lavfi(&self) -> String {
        let mut parts = Vec::with_capacity(EQ_BANDS + 2);
        parts.push(format!("volume={:.6}", self.normalization_gain));
        for band in &self.bands {
            parts.push(format!(
                "equalizer=f={}:t=q:w={:.3}:g={:.2}",
                band.frequency, band.q, band.gain_db
            ));
        }
        parts.push("astats=metadata=1:reset=1".to_string());
        parts.join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, sample_rate: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|n| (2.0 * std::f32::consts::PI * freq * n as f32 / sample_rate).sin() * 0.5)
            .collect()
    }

    #[test]
    fn test_flat_bands_are_transparent() {
        let eq = EqualizerState::default();
        let mut graph = SignalGraph::build(0, DEFAULT_SAMPLE_RATE, 1.0, &eq);
        let input = sine(440.0, DEFAULT_SAMPLE_RATE, 512);
        let mut block = input.clone();
        graph.process_block(&mut block);
        for (a, b) in input.iter().zip(&block) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_normalization_gain_scales_output() {
        let eq = EqualizerState::default();
        let mut graph = SignalGraph::build(1, DEFAULT_SAMPLE_RATE, 2.0, &eq);
        let mut block = vec![0.25_f32; 64];
        graph.process_block(&mut block);
        assert!(block.iter().all(|s| (s - 0.5).abs() < 1e-5));
        assert_eq!(graph.channel(), 1);
    }

    #[test]
    fn test_disabled_equalizer_forces_zero_db() {
        let mut eq = EqualizerState::default();
        eq.apply_preset("Bass Boost").unwrap();
        eq.enabled = false;
        let graph = SignalGraph::build(0, DEFAULT_SAMPLE_RATE, 1.0, &eq);
        assert!(graph.bands().iter().all(|b| b.gain_db() == 0.0));

        eq.enabled = true;
        let graph = SignalGraph::build(0, DEFAULT_SAMPLE_RATE, 1.0, &eq);
        assert_eq!(graph.bands()[0].gain_db(), 6.0);
        assert_eq!(graph.bands()[0].frequency(), 31.0);
        assert_eq!(graph.bands()[9].frequency(), 16000.0);
    }

    #[test]
    fn test_boosted_band_raises_its_frequency() {
        let mut eq = EqualizerState::default();
        eq.enabled = true;
        eq.set_band(5, 12.0).unwrap();
        let mut graph = SignalGraph::build(0, DEFAULT_SAMPLE_RATE, 1.0, &eq);
        let mut block = sine(1000.0, DEFAULT_SAMPLE_RATE, 9600);
        graph.process_block(&mut block);
        let tail_peak = block[4800..].iter().fold(0.0_f32, |m, s| m.max(s.abs()));
        // +12 dB ≈ ×3.98 on a 0.5 amplitude sine
        assert!(tail_peak > 1.8, "peak = {}", tail_peak);
    }

    #[test]
    fn test_tap_reports_peak_bin_without_altering_signal() {
        let eq = EqualizerState::default();
        let mut graph = SignalGraph::build(0, DEFAULT_SAMPLE_RATE, 1.0, &eq);
        let bin = 64;
        let freq = bin as f32 * DEFAULT_SAMPLE_RATE / TAP_FFT_SIZE as f32;
        let input = sine(freq, DEFAULT_SAMPLE_RATE, TAP_FFT_SIZE);
        let mut block = input.clone();
        graph.process_block(&mut block);

        let spectrum = graph.spectrum();
        assert_eq!(spectrum.len(), TAP_FFT_SIZE / 2);
        let (peak, _) = spectrum
            .iter()
            .enumerate()
            .fold((0, 0.0_f32), |(bi, bm), (i, m)| if *m > bm { (i, *m) } else { (bi, bm) });
        assert_eq!(peak, bin);
        for (a, b) in input.iter().zip(&block) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_lavfi_rendering() {
        let mut eq = EqualizerState::default();
        eq.enabled = true;
        eq.set_band(0, -3.0).unwrap();
        let graph = SignalGraph::build(0, DEFAULT_SAMPLE_RATE, 1.5, &eq);
        let chain = graph.to_lavfi();
        assert!(chain.starts_with("volume=1.500000,"));
        assert_eq!(chain.matches("equalizer=").count(), 10);
        assert!(chain.contains("equalizer=f=31:t=q:w=1.100:g=-3.00"));
        assert!(chain.ends_with("astats=metadata=1:reset=1"));
    }

    #[test]
    fn test_zero_db_peaking_is_identity() {
        let c = BiquadCoeffs::peaking(1000.0, 1.1, 0.0, 48_000.0);
        assert!((c.b0 - 1.0).abs() < 1e-12);
        assert!((c.b1 - c.a1).abs() < 1e-12);
        assert!((c.b2 - c.a2).abs() < 1e-12);
    }
}
