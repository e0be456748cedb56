//! External collaborators: stream URL resolution, search, recommendations,
//! loudness analysis and lyrics.
//!
//! The engine only sees the `Resolver` trait.  `HttpResolver` is the
//! production implementation talking JSON to the resolver service.

use async_trait::async_trait;
use player_proto::protocol::Track;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::loudness::LoudnessProfile;
use crate::lyrics::LyricsPayload;

/// A playable URL for a track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedStream {
    pub stream_url: String,
    pub platform: String,
}

#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve_stream_url(
        &self,
        track_id: &str,
        platform: &str,
    ) -> EngineResult<Option<ResolvedStream>>;

    /// Title/artist re-query used when a track id no longer resolves.
    async fn search_track(
        &self,
        title: &str,
        artist: &str,
        platform: &str,
    ) -> EngineResult<Option<Track>>;

    async fn similar_tracks(
        &self,
        track_id: &str,
        platform: &str,
        limit: usize,
    ) -> EngineResult<Vec<Track>>;

    async fn loudness(
        &self,
        track_id: &str,
        platform: &str,
        force: bool,
    ) -> EngineResult<LoudnessProfile>;

    async fn lyrics(
        &self,
        artist: &str,
        title: &str,
        duration_secs: Option<f64>,
    ) -> EngineResult<Option<LyricsPayload>>;
}

/// Resolve `track`, retrying once through a title/artist search.  `None`
/// means the play request should be dropped.
pub async fn resolve_with_fallback(resolver: &dyn Resolver, track: &Track) -> Option<ResolvedStream> {
    match resolver.resolve_stream_url(&track.id, &track.platform).await {
        Ok(Some(stream)) => return Some(stream),
        Ok(None) => debug!("resolver: no stream for {}", track.key()),
        Err(e) => warn!("resolver: stream lookup for {} failed: {}", track.key(), e),
    }

    if track.title.is_empty() {
        return None;
    }

    info!("resolver: re-querying '{}' by title/artist", track.label());
    let hit = match resolver
        .search_track(&track.title, &track.artist, &track.platform)
        .await
    {
        Ok(Some(hit)) => hit,
        Ok(None) => {
            warn!("resolver: no search hit for '{}'", track.label());
            return None;
        }
        Err(e) => {
            warn!("resolver: search for '{}' failed: {}", track.label(), e);
            return None;
        }
    };

    match resolver.resolve_stream_url(&hit.id, &hit.platform).await {
        Ok(Some(stream)) => Some(stream),
        Ok(None) => {
            warn!("resolver: fallback {} did not resolve either", hit.key());
            None
        }
        Err(e) => {
            warn!("resolver: fallback {} failed: {}", hit.key(), e);
            None
        }
    }
}

/// Route `url` through the media-transport proxy when one is configured.
pub fn proxied_url(proxy_base: Option<&str>, url: &str) -> String {
    let Some(base) = proxy_base else {
        return url.to_string();
    };
    match reqwest::Url::parse_with_params(base, &[("url", url)]) {
        Ok(u) => u.to_string(),
        Err(e) => {
            warn!("resolver: bad proxy base '{}': {}", base, e);
            url.to_string()
        }
    }
}

// ── HTTP implementation ──────────────────────────────────────────────────────

pub struct HttpResolver {
    client: Client,
    base_url: String,
}

impl HttpResolver {
    pub fn new(base_url: impl Into<String>) -> EngineResult<Self> {
        let client = Client::builder()
            .user_agent(concat!("player-daemon/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// GET a JSON body; 404 and `null` bodies both map to `None`.
    async fn get_optional<T>(&self, path: &str, query: &[(&str, String)]) -> EngineResult<Option<T>>
    where
        T: serde::de::DeserializeOwned,
    {
        let resp = self
            .client
            .get(self.endpoint(path))
            .query(query)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = resp.error_for_status()?;
        let bytes = resp.bytes().await?;
        Ok(serde_json::from_slice::<Option<T>>(&bytes)?)
    }
}

#[async_trait]
impl Resolver for HttpResolver {
    async fn resolve_stream_url(
        &self,
        track_id: &str,
        platform: &str,
    ) -> EngineResult<Option<ResolvedStream>> {
        self.get_optional(
            "stream",
            &[("id", track_id.to_string()), ("platform", platform.to_string())],
        )
        .await
    }

    async fn search_track(
        &self,
        title: &str,
        artist: &str,
        platform: &str,
    ) -> EngineResult<Option<Track>> {
        let query = format!("{} {}", title, artist).trim().to_string();
        let hits: Option<Vec<Track>> = self
            .get_optional(
                "search",
                &[("q", query), ("platform", platform.to_string()), ("limit", "1".to_string())],
            )
            .await?;
        Ok(hits.and_then(|h| h.into_iter().next()))
    }

    async fn similar_tracks(
        &self,
        track_id: &str,
        platform: &str,
        limit: usize,
    ) -> EngineResult<Vec<Track>> {
        let tracks: Option<Vec<Track>> = self
            .get_optional(
                "similar",
                &[
                    ("id", track_id.to_string()),
                    ("platform", platform.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        Ok(tracks.unwrap_or_default())
    }

    async fn loudness(
        &self,
        track_id: &str,
        platform: &str,
        force: bool,
    ) -> EngineResult<LoudnessProfile> {
        self.get_optional(
            "loudness",
            &[
                ("id", track_id.to_string()),
                ("platform", platform.to_string()),
                ("force", force.to_string()),
            ],
        )
        .await?
        .ok_or_else(|| EngineError::Resolver(format!("no loudness data for {}:{}", platform, track_id)))
    }

    async fn lyrics(
        &self,
        artist: &str,
        title: &str,
        duration_secs: Option<f64>,
    ) -> EngineResult<Option<LyricsPayload>> {
        let mut query = vec![("artist", artist.to_string()), ("title", title.to_string())];
        if let Some(d) = duration_secs {
            query.push(("duration", format!("{}", d.round() as i64)));
        }
        self.get_optional("lyrics", &query).await
    }
}
