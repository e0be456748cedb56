//! Synced lyric parsing and playback-time lookup.
//!
//! Line grammar: `[mm:ss(.fff)?]text` with `mm` 1–2 digits, `ss` exactly 2,
//! optional fraction of 1–3 digits right-padded to milliseconds.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Lyrics payload returned by the lyrics collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LyricsPayload {
    #[serde(default)]
    pub synced_lyrics: Option<String>,
    #[serde(default)]
    pub plain_lyrics: Option<String>,
    #[serde(default)]
    pub source: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LyricLine {
    pub time: f64,
    pub text: String,
}

fn line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\[(\d{1,2}):(\d{2})(?:\.(\d{1,3}))?\](.*)$").expect("static lyric regex")
    })
}

/// Parse synced lyric text into lines sorted by time.  Non-matching lines
/// and lines with empty text are dropped.
pub fn parse_synced_lyrics(raw: &str) -> Vec<LyricLine> {
    let re = line_regex();
    let mut lines: Vec<LyricLine> = raw
        .lines()
        .filter_map(|line| {
            let caps = re.captures(line.trim())?;
            let minutes: f64 = caps[1].parse().ok()?;
            let seconds: f64 = caps[2].parse().ok()?;
            let millis: f64 = match caps.get(3) {
                Some(frac) => format!("{:0<3}", frac.as_str()).parse().ok()?,
                None => 0.0,
            };
            let text = caps[4].trim();
            if text.is_empty() {
                return None;
            }
            Some(LyricLine {
                time: minutes * 60.0 + seconds + millis / 1000.0,
                text: text.to_string(),
            })
        })
        .collect();
    lines.sort_by(|a, b| a.time.total_cmp(&b.time));
    lines
}

/// Parsed lyrics for the current track plus the active line.
#[derive(Debug, Clone, Default)]
pub struct LyricTrack {
    lines: Vec<LyricLine>,
    active: Option<usize>,
}

impl LyricTrack {
    pub fn new(lines: Vec<LyricLine>) -> Self {
        Self {
            lines,
            active: None,
        }
    }

    pub fn lines(&self) -> &[LyricLine] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn active_index(&self) -> Option<usize> {
        self.active
    }

    pub fn active_line(&self) -> Option<&LyricLine> {
        self.active.and_then(|i| self.lines.get(i))
    }

    /// Greatest index whose time is `<= time`, by binary search.
    pub fn index_at(&self, time: f64) -> Option<usize> {
        let after = self.lines.partition_point(|l| l.time <= time);
        after.checked_sub(1)
    }

    /// Move to `time`.  Returns the new index only when it changed.
    pub fn sync(&mut self, time: f64) -> Option<Option<usize>> {
        let idx = self.index_at(time);
        if idx == self.active {
            return None;
        }
        self.active = idx;
        Some(idx)
    }
}
