//! Equalizer state: enabled toggle, 10 gains, 10 Q values, preset name.
//!
//! The arrays are fixed-size so the band count can never drift; writes that
//! arrive as slices of the wrong length are rejected outright.

use player_proto::settings::{
    clamp_finite, PlayerSettings, EQ_BANDS, EQ_GAIN_MAX_DB, EQ_GAIN_MIN_DB, EQ_Q_DEFAULT,
    EQ_Q_MAX, EQ_Q_MIN,
};

use crate::error::{EngineError, EngineResult};

/// Centre frequencies of the bands, Hz.
pub const BAND_FREQUENCIES: [f32; EQ_BANDS] = [
    31.0, 62.0, 125.0, 250.0, 500.0, 1000.0, 2000.0, 4000.0, 8000.0, 16000.0,
];

pub const CUSTOM_PRESET: &str = "Custom";

const PRESETS: &[(&str, [f32; EQ_BANDS])] = &[
    ("Flat", [0.0; EQ_BANDS]),
    ("Bass Boost", [6.0, 5.0, 4.0, 2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]),
    ("Treble Boost", [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 2.0, 4.0, 5.0, 6.0]),
    ("Vocal", [-2.0, -1.0, 0.0, 2.0, 4.0, 4.0, 3.0, 1.0, 0.0, -1.0]),
    ("Rock", [5.0, 4.0, 2.0, -1.0, -2.0, -1.0, 2.0, 3.0, 4.0, 4.0]),
    ("Electronic", [5.0, 4.0, 1.0, 0.0, -2.0, 1.0, 0.0, 2.0, 4.0, 5.0]),
    ("Acoustic", [3.0, 3.0, 2.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 1.0]),
];

pub fn preset_names() -> impl Iterator<Item = &'static str> {
    PRESETS.iter().map(|(name, _)| *name)
}

pub fn preset_gains(name: &str) -> Option<[f32; EQ_BANDS]> {
    PRESETS
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, gains)| *gains)
}

#[derive(Debug, Clone, PartialEq)]
pub struct EqualizerState {
    pub enabled: bool,
    gains: [f32; EQ_BANDS],
    q: [f32; EQ_BANDS],
    preset: String,
}

impl Default for EqualizerState {
    fn default() -> Self {
        Self {
            enabled: false,
            gains: [0.0; EQ_BANDS],
            q: [EQ_Q_DEFAULT; EQ_BANDS],
            preset: "Flat".to_string(),
        }
    }
}

impl EqualizerState {
    pub fn from_settings(settings: &PlayerSettings) -> Self {
        let mut eq = Self {
            enabled: settings.eq_enabled,
            preset: settings.eq_preset.clone(),
            ..Self::default()
        };
        // settings are sanitized on load; a bad array just keeps defaults
        let _ = eq.set_gains(&settings.eq_gains);
        let _ = eq.set_q(&settings.eq_q);
        eq.preset = settings.eq_preset.clone();
        eq
    }

    pub fn write_settings(&self, settings: &mut PlayerSettings) {
        settings.eq_enabled = self.enabled;
        settings.eq_gains = self.gains.to_vec();
        settings.eq_q = self.q.to_vec();
        settings.eq_preset = self.preset.clone();
    }

    pub fn gains(&self) -> &[f32; EQ_BANDS] {
        &self.gains
    }

    pub fn q(&self) -> &[f32; EQ_BANDS] {
        &self.q
    }

    pub fn preset(&self) -> &str {
        &self.preset
    }

    /// Gains the graph should actually apply: stored values when enabled,
    /// all zero otherwise.  Stored values are never touched by the toggle.
    pub fn effective_gains(&self) -> [f32; EQ_BANDS] {
        if self.enabled {
            self.gains
        } else {
            [0.0; EQ_BANDS]
        }
    }

    pub fn set_gains(&mut self, gains: &[f32]) -> EngineResult<()> {
        let gains = check_len(gains)?;
        for (slot, g) in self.gains.iter_mut().zip(gains) {
            *slot = clamp_finite(*g, EQ_GAIN_MIN_DB, EQ_GAIN_MAX_DB, 0.0);
        }
        self.preset = CUSTOM_PRESET.to_string();
        Ok(())
    }

    pub fn set_q(&mut self, q: &[f32]) -> EngineResult<()> {
        let q = check_len(q)?;
        for (slot, v) in self.q.iter_mut().zip(q) {
            *slot = clamp_finite(*v, EQ_Q_MIN, EQ_Q_MAX, EQ_Q_DEFAULT);
        }
        Ok(())
    }

    pub fn set_band(&mut self, index: usize, gain_db: f32) -> EngineResult<()> {
        let slot = self
            .gains
            .get_mut(index)
            .ok_or(EngineError::BandIndex(index))?;
        *slot = clamp_finite(gain_db, EQ_GAIN_MIN_DB, EQ_GAIN_MAX_DB, 0.0);
        self.preset = CUSTOM_PRESET.to_string();
        Ok(())
    }

    pub fn apply_preset(&mut self, name: &str) -> EngineResult<()> {
        let gains =
            preset_gains(name).ok_or_else(|| EngineError::UnknownPreset(name.to_string()))?;
        self.gains = gains;
        self.preset = PRESETS
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(n, _)| n.to_string())
            .unwrap_or_else(|| name.to_string());
        Ok(())
    }
}

fn check_len(values: &[f32]) -> EngineResult<&[f32]> {
    if values.len() != EQ_BANDS {
        return Err(EngineError::BandCount {
            expected: EQ_BANDS,
            got: values.len(),
        });
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrong_length_writes_are_rejected() {
        let mut eq = EqualizerState::default();
        let before = eq.clone();
        assert!(matches!(
            eq.set_gains(&[1.0; 9]),
            Err(EngineError::BandCount { expected: 10, got: 9 })
        ));
        assert!(eq.set_q(&[1.0; 11]).is_err());
        assert!(eq.set_gains(&[]).is_err());
        assert_eq!(eq, before);
    }

    #[test]
    fn test_values_are_clamped_into_range() {
        let mut eq = EqualizerState::default();
        eq.set_gains(&[20.0, -20.0, 3.5, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, f32::NAN])
            .unwrap();
        assert_eq!(eq.gains()[0], 12.0);
        assert_eq!(eq.gains()[1], -12.0);
        assert_eq!(eq.gains()[2], 3.5);
        assert_eq!(eq.gains()[9], 0.0);

        eq.set_q(&[0.0, 5.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0])
            .unwrap();
        assert_eq!(eq.q()[0], 0.1);
        assert_eq!(eq.q()[1], 3.0);
        assert!(eq.gains().iter().all(|g| (-12.0..=12.0).contains(g)));
    }

    #[test]
    fn test_disable_zeroes_effective_but_keeps_stored() {
        let mut eq = EqualizerState::default();
        eq.apply_preset("bass boost").unwrap();
        assert_eq!(eq.preset(), "Bass Boost");
        eq.enabled = false;
        assert_eq!(eq.effective_gains(), [0.0; EQ_BANDS]);
        assert_eq!(eq.gains()[0], 6.0);
        eq.enabled = true;
        assert_eq!(eq.effective_gains()[0], 6.0);
    }

    #[test]
    fn test_band_write_marks_custom() {
        let mut eq = EqualizerState::default();
        eq.set_band(4, -3.0).unwrap();
        assert_eq!(eq.preset(), CUSTOM_PRESET);
        assert!(matches!(eq.set_band(10, 1.0), Err(EngineError::BandIndex(10))));
        assert!(eq.apply_preset("Nope").is_err());
    }

    #[test]
    fn test_settings_round_trip() {
        let mut settings = PlayerSettings::default();
        let mut eq = EqualizerState::from_settings(&settings);
        eq.enabled = true;
        eq.apply_preset("Rock").unwrap();
        eq.write_settings(&mut settings);
        assert!(settings.eq_enabled);
        assert_eq!(settings.eq_gains.len(), EQ_BANDS);
        assert_eq!(EqualizerState::from_settings(&settings), eq);
        assert_eq!(preset_names().count(), 7);
    }
}
