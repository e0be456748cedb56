use serde::{Deserialize, Serialize};

use crate::settings::PlayerSettings;

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check this on connect.
pub const PROTOCOL_VERSION: u32 = 1;

/// A playable track reference as supplied by clients and by the recommender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub id: String,
    /// Source platform tag, e.g. "yt", "sc".
    pub platform: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub duration_secs: Option<f64>,
}

impl Track {
    /// Identity used for dedup and cache lookups: `platform:id`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.platform, self.id)
    }

    /// "Artist – Title" for log lines.
    pub fn label(&self) -> String {
        if self.artist.is_empty() {
            self.title.clone()
        } else {
            format!("{} – {}", self.artist, self.title)
        }
    }
}

/// Messages sent from clients to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    /// Start a transition to `track`.  `fade_ms` overrides the configured
    /// crossfade duration for this transition only.
    Play {
        track: Track,
        #[serde(default)]
        fade_ms: Option<u64>,
    },
    Enqueue { track: Track },
    ClearQueue,
    /// Advance to the head of the queue.
    Next,
    TogglePause,
    Stop,
    Seek { seconds: f64 },
    Volume { value: f32 },
    SetCrossfade {
        enabled: bool,
        #[serde(default)]
        duration_ms: Option<u64>,
    },
    SetGapless { enabled: bool },
    SetNormalize { enabled: bool },
    SetTargetLufs { value: f64 },
    /// Re-run loudness normalization; `force` asks the analyzer to re-measure.
    Renormalize {
        #[serde(default)]
        force: bool,
    },
    SetEqEnabled { enabled: bool },
    SetEqGains { gains: Vec<f32> },
    SetEqQ { q: Vec<f32> },
    SetEqBand { index: usize, gain_db: f32 },
    ApplyEqPreset { name: String },
    SetRadio { enabled: bool },
    SetLyrics { enabled: bool },
    GetState,
}

/// Messages sent from the daemon to clients (broadcasts)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: protocol version + full state snapshot.
    Hello {
        protocol_version: u32,
        rev: u64,
        state: PlayerState,
    },
    State {
        data: PlayerState,
    },
    /// Active lyric line changed.
    Lyric {
        index: Option<usize>,
        text: Option<String>,
    },
    Log {
        message: String,
    },
    Error {
        message: String,
    },
}

/// Snapshot of the engine published to clients.  `rev` increases on every
/// published change.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlayerState {
    #[serde(default)]
    pub rev: u64,
    pub current_track: Option<Track>,
    pub queue: Vec<Track>,
    pub active_channel: usize,
    pub crossfade_generation: u64,
    pub is_playing: bool,
    pub volume: f32,
    pub progress_secs: f64,
    pub duration_secs: f64,
    /// Linear gain currently applied by the normalization stage.
    pub normalization_gain: f32,
    pub settings: PlayerSettings,
    #[serde(default)]
    pub lyric_index: Option<usize>,
    #[serde(default)]
    pub lyric_text: Option<String>,
    #[serde(default)]
    pub radio_in_flight: bool,
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}
