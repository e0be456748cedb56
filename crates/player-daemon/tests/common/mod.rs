#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use player_daemon::channel::{ChannelBackend, ChannelPool};
use player_daemon::core::{CoreEvent, PlayerCore};
use player_daemon::error::{EngineError, EngineResult};
use player_daemon::graph::SignalGraph;
use player_daemon::loudness::LoudnessProfile;
use player_daemon::lyrics::LyricsPayload;
use player_daemon::resolver::{ResolvedStream, Resolver};
use player_daemon::BroadcastMessage;
use player_proto::protocol::{Command, Track};
use player_proto::settings::PlayerSettings;
use player_proto::state::StateManager;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

pub fn track(id: &str) -> Track {
    Track {
        id: id.to_string(),
        platform: "yt".to_string(),
        title: format!("Song {}", id),
        artist: "Band".to_string(),
        ..Default::default()
    }
}

pub fn url_for(track: &Track) -> String {
    format!("https://cdn.test/{}/{}", track.platform, track.id)
}

/// Settings with every background lookup switched off; tests opt back in.
pub fn quiet_settings() -> PlayerSettings {
    PlayerSettings {
        crossfade_enabled: true,
        crossfade_duration_ms: 1000,
        gapless_enabled: false,
        normalize_enabled: false,
        radio_enabled: false,
        lyrics_enabled: false,
        volume: 1.0,
        ..PlayerSettings::default()
    }
}

// ── channels ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Load(String),
    Play,
    Pause,
    Reset,
    Volume(f32),
    Seek(f64),
    Graph(String),
}

#[derive(Debug, Default, Clone)]
struct Mirror {
    source: Option<String>,
    playing: bool,
    volume: f32,
}

impl Mirror {
    fn audible(&self) -> bool {
        self.source.is_some() && self.playing && self.volume > 0.0
    }
}

/// Shared view of both mock channels, as a listener would hear them.
#[derive(Default)]
pub struct Mixer {
    state: Mutex<MixerState>,
}

#[derive(Default)]
struct MixerState {
    channels: [Mirror; 2],
    calls: Vec<(usize, Call)>,
    double_audible: usize,
}

impl Mixer {
    fn record(&self, index: usize, call: Call) {
        let mut st = self.state.lock().unwrap();
        {
            let ch = &mut st.channels[index];
            match &call {
                Call::Load(url) => {
                    ch.source = Some(url.clone());
                    ch.playing = false;
                }
                Call::Play => ch.playing = true,
                Call::Pause => ch.playing = false,
                Call::Reset => {
                    ch.source = None;
                    ch.playing = false;
                }
                Call::Volume(v) => ch.volume = *v,
                Call::Seek(_) | Call::Graph(_) => {}
            }
        }
        if st.channels[0].audible() && st.channels[1].audible() {
            st.double_audible += 1;
        }
        st.calls.push((index, call));
    }

    pub fn calls(&self) -> Vec<(usize, Call)> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_for(&self, index: usize) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|(i, _)| *i == index)
            .map(|(_, c)| c)
            .collect()
    }

    pub fn double_audible(&self) -> usize {
        self.state.lock().unwrap().double_audible
    }

    pub fn loaded(&self, url: &str) -> bool {
        self.calls()
            .iter()
            .any(|(_, c)| matches!(c, Call::Load(u) if u == url))
    }

    pub fn last_graph(&self, index: usize) -> Option<String> {
        self.calls_for(index).into_iter().rev().find_map(|c| match c {
            Call::Graph(g) => Some(g),
            _ => None,
        })
    }
}

pub struct MockChannel {
    index: usize,
    mixer: Arc<Mixer>,
    available: bool,
    pub fail_play: AtomicBool,
}

impl MockChannel {
    pub fn new(index: usize, mixer: Arc<Mixer>, available: bool) -> Arc<Self> {
        Arc::new(Self {
            index,
            mixer,
            available,
            fail_play: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl ChannelBackend for MockChannel {
    fn is_available(&self) -> bool {
        self.available
    }

    async fn load(&self, url: &str) -> EngineResult<()> {
        if !self.available {
            return Err(EngineError::ChannelUnavailable(self.index));
        }
        self.mixer.record(self.index, Call::Load(url.to_string()));
        Ok(())
    }

    async fn play(&self) -> EngineResult<()> {
        if self.fail_play.load(Ordering::SeqCst) {
            return Err(EngineError::Backend("autoplay rejected".to_string()));
        }
        self.mixer.record(self.index, Call::Play);
        Ok(())
    }

    async fn pause(&self) -> EngineResult<()> {
        self.mixer.record(self.index, Call::Pause);
        Ok(())
    }

    async fn reset(&self) -> EngineResult<()> {
        self.mixer.record(self.index, Call::Reset);
        Ok(())
    }

    async fn set_volume(&self, volume: f32) -> EngineResult<()> {
        self.mixer.record(self.index, Call::Volume(volume));
        Ok(())
    }

    async fn seek(&self, seconds: f64) -> EngineResult<()> {
        self.mixer.record(self.index, Call::Seek(seconds));
        Ok(())
    }

    async fn install_graph(&self, graph: &SignalGraph) -> EngineResult<()> {
        self.mixer.record(self.index, Call::Graph(graph.to_lavfi()));
        Ok(())
    }
}

// ── resolver ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum SimilarReply {
    Tracks(Vec<Track>),
    Fail,
    Panic,
}

pub struct MockResolver {
    /// Per-key resolve delay; default 10 ms.
    delays: Mutex<HashMap<String, Duration>>,
    unresolvable: Mutex<Vec<String>>,
    search_hits: Mutex<HashMap<String, Track>>,
    similar: Mutex<SimilarReply>,
    loudness: Mutex<HashMap<String, f64>>,
    lyrics: Mutex<HashMap<String, String>>,
    pub resolve_calls: Mutex<Vec<String>>,
    pub similar_calls: AtomicUsize,
    pub lyric_calls: AtomicUsize,
}

impl Default for MockResolver {
    fn default() -> Self {
        Self {
            delays: Mutex::new(HashMap::new()),
            unresolvable: Mutex::new(Vec::new()),
            search_hits: Mutex::new(HashMap::new()),
            similar: Mutex::new(SimilarReply::Tracks(Vec::new())),
            loudness: Mutex::new(HashMap::new()),
            lyrics: Mutex::new(HashMap::new()),
            resolve_calls: Mutex::new(Vec::new()),
            similar_calls: AtomicUsize::new(0),
            lyric_calls: AtomicUsize::new(0),
        }
    }
}

impl MockResolver {
    pub fn delay(&self, track: &Track, delay: Duration) {
        self.delays.lock().unwrap().insert(track.key(), delay);
    }

    pub fn unresolvable(&self, track: &Track) {
        self.unresolvable.lock().unwrap().push(track.key());
    }

    pub fn search_hit(&self, for_track: &Track, hit: Track) {
        self.search_hits
            .lock()
            .unwrap()
            .insert(format!("{} {}", for_track.title, for_track.artist), hit);
    }

    pub fn similar(&self, reply: SimilarReply) {
        *self.similar.lock().unwrap() = reply;
    }

    pub fn loudness(&self, track: &Track, lufs: f64) {
        self.loudness.lock().unwrap().insert(track.key(), lufs);
    }

    pub fn lyrics(&self, track: &Track, synced: &str) {
        self.lyrics
            .lock()
            .unwrap()
            .insert(track.title.clone(), synced.to_string());
    }

    pub fn resolve_count(&self, track: &Track) -> usize {
        let key = track.key();
        self.resolve_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|k| **k == key)
            .count()
    }
}

#[async_trait]
impl Resolver for MockResolver {
    async fn resolve_stream_url(
        &self,
        track_id: &str,
        platform: &str,
    ) -> EngineResult<Option<ResolvedStream>> {
        let key = format!("{}:{}", platform, track_id);
        self.resolve_calls.lock().unwrap().push(key.clone());
        let delay = self
            .delays
            .lock()
            .unwrap()
            .get(&key)
            .copied()
            .unwrap_or(Duration::from_millis(10));
        tokio::time::sleep(delay).await;
        if self.unresolvable.lock().unwrap().contains(&key) {
            return Ok(None);
        }
        Ok(Some(ResolvedStream {
            stream_url: format!("https://cdn.test/{}/{}", platform, track_id),
            platform: platform.to_string(),
        }))
    }

    async fn search_track(
        &self,
        title: &str,
        artist: &str,
        _platform: &str,
    ) -> EngineResult<Option<Track>> {
        Ok(self
            .search_hits
            .lock()
            .unwrap()
            .get(&format!("{} {}", title, artist))
            .cloned())
    }

    async fn similar_tracks(
        &self,
        _track_id: &str,
        _platform: &str,
        _limit: usize,
    ) -> EngineResult<Vec<Track>> {
        self.similar_calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.similar.lock().unwrap().clone();
        tokio::time::sleep(Duration::from_millis(20)).await;
        match reply {
            SimilarReply::Tracks(tracks) => Ok(tracks),
            SimilarReply::Fail => Err(EngineError::Resolver("recommender offline".to_string())),
            SimilarReply::Panic => panic!("recommender blew up"),
        }
    }

    async fn loudness(
        &self,
        track_id: &str,
        platform: &str,
        _force: bool,
    ) -> EngineResult<LoudnessProfile> {
        let key = format!("{}:{}", platform, track_id);
        tokio::time::sleep(Duration::from_millis(15)).await;
        self.loudness
            .lock()
            .unwrap()
            .get(&key)
            .map(|lufs| LoudnessProfile {
                integrated_lufs: *lufs,
                peak_db: None,
            })
            .ok_or_else(|| EngineError::Resolver(format!("no analysis for {}", key)))
    }

    async fn lyrics(
        &self,
        _artist: &str,
        title: &str,
        _duration_secs: Option<f64>,
    ) -> EngineResult<Option<LyricsPayload>> {
        self.lyric_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .lyrics
            .lock()
            .unwrap()
            .get(title)
            .map(|synced| LyricsPayload {
                synced_lyrics: Some(synced.clone()),
                plain_lyrics: None,
                source: "mock".to_string(),
            }))
    }
}

// ── harness ───────────────────────────────────────────────────────────────────

pub struct Harness {
    pub core: PlayerCore,
    pub rx: mpsc::Receiver<CoreEvent>,
    pub mixer: Arc<Mixer>,
    pub channels: [Arc<MockChannel>; 2],
    pub resolver: Arc<MockResolver>,
    pub broadcasts: broadcast::Receiver<BroadcastMessage>,
    pub dir: TempDir,
}

impl Harness {
    pub async fn new(settings: PlayerSettings) -> Self {
        Self::with_channels(settings, true).await
    }

    pub async fn with_channels(settings: PlayerSettings, second_available: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let settings_file = dir.path().join("settings.json");
        std::fs::write(&settings_file, serde_json::to_string(&settings).unwrap()).unwrap();
        let state_manager = Arc::new(StateManager::new(settings_file));

        let mixer = Arc::new(Mixer::default());
        let a = MockChannel::new(0, mixer.clone(), true);
        let b = MockChannel::new(1, mixer.clone(), second_available);
        let pool = ChannelPool::new(a.clone(), b.clone());

        let resolver = Arc::new(MockResolver::default());
        let (event_tx, rx) = mpsc::channel(1024);
        let (broadcast_tx, broadcasts) = broadcast::channel(4096);

        let core = PlayerCore::new(
            pool,
            resolver.clone(),
            state_manager,
            None,
            event_tx,
            broadcast_tx,
        )
        .await;

        Self {
            core,
            rx,
            mixer,
            channels: [a, b],
            resolver,
            broadcasts,
            dir,
        }
    }

    pub async fn send(&mut self, cmd: Command) {
        self.core.handle_event(CoreEvent::Command(cmd)).await;
    }

    pub async fn play(&mut self, track: &Track) {
        self.send(Command::Play {
            track: track.clone(),
            fade_ms: None,
        })
        .await;
    }

    /// Feed every event the core's background tasks produce for `dur` of
    /// (paused) tokio time.
    pub async fn pump_for(&mut self, dur: Duration) {
        let deadline = Instant::now() + dur;
        while let Ok(Some(evt)) = tokio::time::timeout_at(deadline, self.rx.recv()).await {
            self.core.handle_event(evt).await;
        }
    }

    pub async fn pump(&mut self) {
        self.pump_for(Duration::from_secs(3)).await;
    }

    pub fn lyric_broadcasts(&mut self) -> Vec<Option<usize>> {
        let mut out = Vec::new();
        loop {
            match self.broadcasts.try_recv() {
                Ok(BroadcastMessage::Lyric { index, .. }) => out.push(index),
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        out
    }

    pub fn current_key(&self) -> Option<String> {
        self.core.session().current_track.as_ref().map(Track::key)
    }
}
