pub mod channel;
pub mod core;
pub mod equalizer;
pub mod error;
pub mod fade;
pub mod graph;
pub mod loudness;
pub mod lyrics;
pub mod mpv;
pub mod radio;
pub mod resolver;
pub mod socket;

/// Fan-out from the core loop to connected clients.
#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    StateUpdated,
    /// Active lyric line changed; `None` clears the display.
    Lyric {
        index: Option<usize>,
        text: Option<String>,
    },
    Log(String),
}
