//! Persisted player settings.
//!
//! These are the only values the engine reads back across restarts.  The key
//! names are part of the on-disk format and use kebab-case.

use serde::{Deserialize, Serialize};

/// Number of equalizer bands.  Every gain/Q array has exactly this length.
pub const EQ_BANDS: usize = 10;

pub const EQ_GAIN_MIN_DB: f32 = -12.0;
pub const EQ_GAIN_MAX_DB: f32 = 12.0;
pub const EQ_Q_MIN: f32 = 0.1;
pub const EQ_Q_MAX: f32 = 3.0;
pub const EQ_Q_DEFAULT: f32 = 1.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PlayerSettings {
    #[serde(default = "default_true")]
    pub crossfade_enabled: bool,
    #[serde(default = "default_crossfade_duration_ms")]
    pub crossfade_duration_ms: u64,
    #[serde(default = "default_true")]
    pub gapless_enabled: bool,
    #[serde(default = "default_true")]
    pub normalize_enabled: bool,
    #[serde(default = "default_target_lufs")]
    pub target_lufs: f64,
    #[serde(default)]
    pub eq_enabled: bool,
    #[serde(default = "default_eq_gains")]
    pub eq_gains: Vec<f32>,
    #[serde(default = "default_eq_q")]
    pub eq_q: Vec<f32>,
    #[serde(default = "default_eq_preset")]
    pub eq_preset: String,
    #[serde(default = "default_true")]
    pub radio_enabled: bool,
    #[serde(default = "default_true")]
    pub lyrics_enabled: bool,
    #[serde(default = "default_volume")]
    pub volume: f32,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            crossfade_enabled: true,
            crossfade_duration_ms: default_crossfade_duration_ms(),
            gapless_enabled: true,
            normalize_enabled: true,
            target_lufs: default_target_lufs(),
            eq_enabled: false,
            eq_gains: default_eq_gains(),
            eq_q: default_eq_q(),
            eq_preset: default_eq_preset(),
            radio_enabled: true,
            lyrics_enabled: true,
            volume: default_volume(),
        }
    }
}

impl PlayerSettings {
    /// Repair values read from disk: wrong-length EQ arrays are replaced by
    /// defaults and everything else is clamped into range.
    pub fn sanitized(mut self) -> Self {
        if self.eq_gains.len() != EQ_BANDS {
            tracing::warn!(
                "settings: eq-gains has {} entries, resetting",
                self.eq_gains.len()
            );
            self.eq_gains = default_eq_gains();
        }
        if self.eq_q.len() != EQ_BANDS {
            tracing::warn!("settings: eq-q has {} entries, resetting", self.eq_q.len());
            self.eq_q = default_eq_q();
        }
        for g in &mut self.eq_gains {
            *g = clamp_finite(*g, EQ_GAIN_MIN_DB, EQ_GAIN_MAX_DB, 0.0);
        }
        for q in &mut self.eq_q {
            *q = clamp_finite(*q, EQ_Q_MIN, EQ_Q_MAX, EQ_Q_DEFAULT);
        }
        self.volume = clamp_finite(self.volume, 0.0, 1.0, default_volume());
        if !self.target_lufs.is_finite() {
            self.target_lufs = default_target_lufs();
        }
        self
    }
}

/// Clamp into `[min, max]`, mapping NaN/inf to `fallback`.
pub fn clamp_finite(value: f32, min: f32, max: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value.clamp(min, max)
    } else {
        fallback
    }
}

fn default_true() -> bool {
    true
}

fn default_crossfade_duration_ms() -> u64 {
    4000
}

fn default_target_lufs() -> f64 {
    -14.0
}

fn default_eq_gains() -> Vec<f32> {
    vec![0.0; EQ_BANDS]
}

fn default_eq_q() -> Vec<f32> {
    vec![EQ_Q_DEFAULT; EQ_BANDS]
}

fn default_eq_preset() -> String {
    "Flat".to_string()
}

fn default_volume() -> f32 {
    0.8
}
