//! Loudness normalization: `gain_db = target - measured`, applied as a linear
//! multiplier on the graph's normalization stage.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Measured loudness of one track as reported by the analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoudnessProfile {
    pub integrated_lufs: f64,
    #[serde(default)]
    pub peak_db: Option<f64>,
}

pub fn db_to_linear(db: f64) -> f64 {
    10.0_f64.powf(db / 20.0)
}

/// Linear gain that brings `measured_lufs` to `target_lufs`.  Unclamped.
pub fn gain_for(target_lufs: f64, measured_lufs: f64) -> f32 {
    let linear = db_to_linear(target_lufs - measured_lufs);
    if linear.is_finite() {
        linear as f32
    } else {
        1.0
    }
}

/// Per-`platform:id` cache of analyzer results plus the session target.
#[derive(Debug, Clone)]
pub struct LoudnessNormalizer {
    pub enabled: bool,
    pub target_lufs: f64,
    cache: HashMap<String, LoudnessProfile>,
}

impl LoudnessNormalizer {
    pub fn new(enabled: bool, target_lufs: f64) -> Self {
        Self {
            enabled,
            target_lufs,
            cache: HashMap::new(),
        }
    }

    pub fn cached(&self, key: &str) -> Option<LoudnessProfile> {
        self.cache.get(key).copied()
    }

    pub fn store(&mut self, key: &str, profile: LoudnessProfile) {
        self.cache.insert(key.to_string(), profile);
    }

    pub fn forget(&mut self, key: &str) {
        self.cache.remove(key);
    }

    /// Gain for a track given its profile; unity when disabled or unknown.
    pub fn gain(&self, profile: Option<&LoudnessProfile>) -> f32 {
        match (self.enabled, profile) {
            (true, Some(p)) => gain_for(self.target_lufs, p.integrated_lufs),
            _ => 1.0,
        }
    }

    pub fn gain_for_key(&self, key: &str) -> f32 {
        self.gain(self.cache.get(key))
    }
}
