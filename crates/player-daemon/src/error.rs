use thiserror::Error;

/// Errors surfaced by engine components, channel backends and resolvers.
///
/// None of these escape the core loop: command handlers log them and the
/// session invariants are left intact.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("expected {expected} equalizer values, got {got}")]
    BandCount { expected: usize, got: usize },

    #[error("equalizer band {0} out of range")]
    BandIndex(usize),

    #[error("unknown equalizer preset '{0}'")]
    UnknownPreset(String),

    #[error("channel {0} is unavailable")]
    ChannelUnavailable(usize),

    #[error("channel backend: {0}")]
    Backend(String),

    #[error("resolver: {0}")]
    Resolver(String),

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("decode: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    TaskFailed(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
