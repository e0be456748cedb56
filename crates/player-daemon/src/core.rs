/// Single-owner event loop for the playback session.
///
/// Every mutation of the session, the channel pool and the signal graph
/// happens on this loop.  Background work (stream resolution, fade timing,
/// loudness and lyric lookups, radio recommendations) runs in spawned tasks
/// that report back as `CoreEvent`s; nothing else touches engine state.
///
/// Transitions are guarded by `crossfade_generation`.  Each request bumps it
/// before doing anything else; any resolver result or fade tick carrying an
/// older generation is dropped without side effects.
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use player_proto::protocol::{Command, PlayerState, Track};
use player_proto::settings::{clamp_finite, PlayerSettings};
use player_proto::state::StateManager;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelEvent, ChannelPool};
use crate::equalizer::EqualizerState;
use crate::error::{EngineError, EngineResult};
use crate::fade::{spawn_fade_ticker, FadePlan, MAX_FADE_MS};
use crate::graph::{SignalGraph, DEFAULT_SAMPLE_RATE};
use crate::loudness::{LoudnessNormalizer, LoudnessProfile};
use crate::lyrics::{parse_synced_lyrics, LyricTrack, LyricsPayload};
use crate::radio::{pick_candidate, RadioGuard, RADIO_FETCH_LIMIT};
use crate::resolver::{proxied_url, resolve_with_fallback, ResolvedStream, Resolver};
use crate::BroadcastMessage;

pub const LYRIC_TICK: Duration = Duration::from_millis(16);

/// Minimum progress change before a position report is re-published.
const PROGRESS_PUBLISH_STEP: f64 = 0.5;

// ── CoreEvent ─────────────────────────────────────────────────────────────────

/// All inputs into the PlayerCore loop.
#[derive(Debug)]
pub enum CoreEvent {
    /// A command from a control client.
    Command(Command),
    /// Stream resolution finished for the transition tagged `generation`.
    Resolved {
        generation: u64,
        track: Track,
        fade_ms: Option<u64>,
        stream: Option<ResolvedStream>,
    },
    FadeTick { generation: u64, step: u32 },
    /// Unsolicited report from a channel backend.
    Channel { index: usize, event: ChannelEvent },
    LoudnessResolved {
        key: String,
        result: EngineResult<LoudnessProfile>,
    },
    LyricsResolved {
        key: String,
        result: EngineResult<Option<LyricsPayload>>,
    },
    LyricTick,
    RadioResolved { result: EngineResult<Vec<Track>> },
    Prefetched {
        key: String,
        stream: Option<ResolvedStream>,
    },
    Shutdown,
}

// ── Session ───────────────────────────────────────────────────────────────────

/// A queued track plus its speculatively resolved stream, if any.
#[derive(Debug, Clone)]
pub struct QueuedTrack {
    pub track: Track,
    pub prefetched: Option<ResolvedStream>,
}

impl QueuedTrack {
    pub fn new(track: Track) -> Self {
        Self {
            track,
            prefetched: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct PlaybackSession {
    pub current_track: Option<Track>,
    pub queue: VecDeque<QueuedTrack>,
    pub crossfade_generation: u64,
    pub is_playing: bool,
    pub volume: f32,
    pub progress: f64,
    pub duration: f64,
}

impl PlaybackSession {
    fn bump_generation(&mut self) -> u64 {
        self.crossfade_generation += 1;
        self.crossfade_generation
    }

    fn current_key(&self) -> Option<String> {
        self.current_track.as_ref().map(Track::key)
    }
}

/// A crossfade in progress: ramps `from` down and `to` up.
#[derive(Debug, Clone, Copy)]
struct ActiveFade {
    generation: u64,
    plan: FadePlan,
    from: usize,
    to: usize,
    /// Ramp of the outgoing channel when the fade began; below 1.0 when
    /// this fade cut another one short.
    from_start: f32,
}

// ── PlayerCore ────────────────────────────────────────────────────────────────

pub struct PlayerCore {
    settings: PlayerSettings,
    state_manager: Arc<StateManager>,
    resolver: Arc<dyn Resolver>,
    proxy_base: Option<String>,
    pool: ChannelPool,
    session: PlaybackSession,
    graph: Option<SignalGraph>,
    equalizer: EqualizerState,
    normalizer: LoudnessNormalizer,
    lyrics: Option<LyricTrack>,
    radio: RadioGuard,
    fade: Option<ActiveFade>,
    fade_ticker: Option<JoinHandle<()>>,
    lyric_ticker: Option<JoinHandle<()>>,
    /// Track whose transition is being resolved right now.
    pending: Option<Track>,
    /// Queue head whose stream is being prefetched.
    prefetching: Option<String>,
    /// Track key for which the early gapless advance already fired.
    early_advance_for: Option<String>,
    last_published_progress: f64,
    event_tx: mpsc::Sender<CoreEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
}

impl PlayerCore {
    pub async fn new(
        pool: ChannelPool,
        resolver: Arc<dyn Resolver>,
        state_manager: Arc<StateManager>,
        proxy_base: Option<String>,
        event_tx: mpsc::Sender<CoreEvent>,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
    ) -> Self {
        let settings = state_manager.settings().await;
        let equalizer = EqualizerState::from_settings(&settings);
        let normalizer = LoudnessNormalizer::new(settings.normalize_enabled, settings.target_lufs);
        let session = PlaybackSession {
            volume: settings.volume,
            ..PlaybackSession::default()
        };

        Self {
            settings,
            state_manager,
            resolver,
            proxy_base,
            pool,
            session,
            graph: None,
            equalizer,
            normalizer,
            lyrics: None,
            radio: RadioGuard::default(),
            fade: None,
            fade_ticker: None,
            lyric_ticker: None,
            pending: None,
            prefetching: None,
            early_advance_for: None,
            last_published_progress: 0.0,
            event_tx,
            broadcast_tx,
        }
    }

    pub fn state_manager(&self) -> Arc<StateManager> {
        Arc::clone(&self.state_manager)
    }

    pub fn session(&self) -> &PlaybackSession {
        &self.session
    }

    pub fn pool(&self) -> &ChannelPool {
        &self.pool
    }

    pub fn graph(&self) -> Option<&SignalGraph> {
        self.graph.as_ref()
    }

    pub fn equalizer(&self) -> &EqualizerState {
        &self.equalizer
    }

    pub fn settings(&self) -> &PlayerSettings {
        &self.settings
    }

    pub fn radio(&self) -> &RadioGuard {
        &self.radio
    }

    pub fn lyrics(&self) -> Option<&LyricTrack> {
        self.lyrics.as_ref()
    }

    pub fn is_fading(&self) -> bool {
        self.fade.is_some()
    }

    /// Run the core event loop.  Returns on `Shutdown` or when every sender
    /// has been dropped.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<CoreEvent>) -> anyhow::Result<()> {
        info!("PlayerCore: starting event loop");
        self.publish().await;

        loop {
            match event_rx.recv().await {
                None => {
                    info!("PlayerCore: event channel closed, shutting down");
                    break;
                }
                Some(CoreEvent::Shutdown) => {
                    info!("PlayerCore: shutdown requested");
                    break;
                }
                Some(evt) => self.handle_event(evt).await,
            }
        }

        self.cleanup().await;
        Ok(())
    }

    /// Process one event.  Errors are logged; none of them leave the loop.
    pub async fn handle_event(&mut self, evt: CoreEvent) {
        match evt {
            CoreEvent::Command(cmd) => {
                debug!("PlayerCore: command {:?}", cmd);
                if let Err(e) = self.handle_command(cmd).await {
                    error!("PlayerCore: command error: {}", e);
                }
            }
            CoreEvent::Resolved {
                generation,
                track,
                fade_ms,
                stream,
            } => self.on_resolved(generation, track, fade_ms, stream).await,
            CoreEvent::FadeTick { generation, step } => self.on_fade_tick(generation, step).await,
            CoreEvent::Channel { index, event } => self.on_channel_event(index, event).await,
            CoreEvent::LoudnessResolved { key, result } => {
                self.on_loudness_resolved(key, result).await
            }
            CoreEvent::LyricsResolved { key, result } => self.on_lyrics_resolved(key, result).await,
            CoreEvent::LyricTick => self.on_lyric_tick().await,
            CoreEvent::RadioResolved { result } => self.on_radio_resolved(result).await,
            CoreEvent::Prefetched { key, stream } => self.on_prefetched(key, stream),
            CoreEvent::Shutdown => {}
        }
    }

    // ── command handlers ──────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) -> EngineResult<()> {
        match cmd {
            Command::Play { track, fade_ms } => {
                self.request_transition(QueuedTrack::new(track), fade_ms)
                    .await
            }
            Command::Enqueue { track } => {
                info!("queue: + {}", track.label());
                self.session.queue.push_back(QueuedTrack::new(track));
                self.prefetch_head();
                self.publish().await;
            }
            Command::ClearQueue => {
                self.session.queue.clear();
                self.prefetching = None;
                self.publish().await;
                self.maybe_autofill();
            }
            Command::Next => self.advance_queue().await,
            Command::TogglePause => self.toggle_pause().await,
            Command::Stop => self.stop().await,
            Command::Seek { seconds } => self.seek(seconds).await?,
            Command::Volume { value } => self.set_volume(value).await,
            Command::SetCrossfade {
                enabled,
                duration_ms,
            } => {
                self.settings.crossfade_enabled = enabled;
                if let Some(ms) = duration_ms {
                    self.settings.crossfade_duration_ms = ms.min(MAX_FADE_MS);
                }
                self.persist_settings().await;
            }
            Command::SetGapless { enabled } => {
                self.settings.gapless_enabled = enabled;
                self.persist_settings().await;
                self.prefetch_head();
            }
            Command::SetNormalize { enabled } => {
                self.settings.normalize_enabled = enabled;
                self.normalizer.enabled = enabled;
                self.persist_settings().await;
                self.refresh_normalization(false).await;
            }
            Command::SetTargetLufs { value } => {
                let target = if value.is_finite() {
                    value.clamp(-60.0, 0.0)
                } else {
                    self.settings.target_lufs
                };
                self.settings.target_lufs = target;
                self.normalizer.target_lufs = target;
                self.persist_settings().await;
                self.refresh_normalization(false).await;
            }
            Command::Renormalize { force } => {
                if force {
                    if let Some(key) = self.session.current_key() {
                        self.normalizer.forget(&key);
                    }
                }
                self.refresh_normalization(force).await;
            }
            Command::SetEqEnabled { enabled } => {
                self.equalizer.enabled = enabled;
                self.apply_equalizer().await;
            }
            Command::SetEqGains { gains } => {
                self.equalizer.set_gains(&gains)?;
                self.apply_equalizer().await;
            }
            Command::SetEqQ { q } => {
                self.equalizer.set_q(&q)?;
                self.apply_equalizer().await;
            }
            Command::SetEqBand { index, gain_db } => {
                self.equalizer.set_band(index, gain_db)?;
                self.apply_equalizer().await;
            }
            Command::ApplyEqPreset { name } => {
                self.equalizer.apply_preset(&name)?;
                self.apply_equalizer().await;
            }
            Command::SetRadio { enabled } => {
                self.settings.radio_enabled = enabled;
                self.persist_settings().await;
                self.maybe_autofill();
            }
            Command::SetLyrics { enabled } => {
                self.settings.lyrics_enabled = enabled;
                self.persist_settings().await;
                self.refresh_lyrics();
                self.publish().await;
            }
            Command::GetState => self.publish().await,
        }
        Ok(())
    }

    async fn toggle_pause(&mut self) {
        if self.session.current_track.is_none() {
            return;
        }
        // pausing mid-fade completes the fade first so only one channel
        // is left holding the session
        if let Some(fade) = self.fade.take() {
            debug!("transition: settling fade {} early", fade.generation);
            self.settle(fade).await;
        }

        let master = self.session.volume;
        let ch = self.pool.active_mut();
        if ch.is_paused() {
            if let Err(e) = ch.set_volume(1.0, master).await {
                warn!("channel {}: volume failed: {}", ch.index(), e);
            }
            match ch.play().await {
                Ok(()) => self.session.is_playing = true,
                Err(e) => {
                    warn!("playback: resume failed: {}", e);
                    self.session.is_playing = false;
                }
            }
        } else {
            if let Err(e) = ch.pause().await {
                warn!("playback: pause failed: {}", e);
            }
            self.session.is_playing = false;
        }
        self.update_lyric_ticker();
        self.publish().await;
    }

    async fn stop(&mut self) {
        info!("playback: stop");
        self.session.bump_generation();
        self.cancel_fade();
        self.pending = None;
        let master = self.session.volume;
        for index in 0..2 {
            let ch = self.pool.channel_mut(index);
            if let Err(e) = ch.reset().await {
                warn!("channel {}: reset failed: {}", index, e);
            }
            if let Err(e) = ch.set_volume(1.0, master).await {
                warn!("channel {}: volume failed: {}", index, e);
            }
        }
        self.session.current_track = None;
        self.session.is_playing = false;
        self.session.progress = 0.0;
        self.session.duration = 0.0;
        self.clear_lyrics();
        self.publish().await;
    }

    async fn seek(&mut self, seconds: f64) -> EngineResult<()> {
        if self.session.current_track.is_none() || !seconds.is_finite() {
            return Ok(());
        }
        self.pool.active_mut().seek(seconds).await?;
        self.session.progress = seconds.max(0.0);
        // a seek back must be able to re-arm the early advance
        self.early_advance_for = None;
        self.sync_lyrics();
        self.publish().await;
        Ok(())
    }

    async fn set_volume(&mut self, value: f32) {
        let volume = clamp_finite(value, 0.0, 1.0, self.session.volume);
        self.session.volume = volume;
        self.settings.volume = volume;
        // ramps are reapplied with the new master on every fade tick
        if let Err(e) = self.pool.sync_master_volume(volume).await {
            warn!("playback: volume update failed: {}", e);
        }
        self.persist_settings().await;
        self.publish().await;
    }

    // ── transitions ───────────────────────────────────────────────────────────

    /// Start a transition to `item`.  The generation is bumped before
    /// anything else so every older resolve or fade becomes stale.
    async fn request_transition(&mut self, item: QueuedTrack, fade_ms: Option<u64>) {
        let generation = self.session.bump_generation();
        info!(
            "transition: request {} (generation {})",
            item.track.label(),
            generation
        );
        self.pending = Some(item.track.clone());

        if let Some(stream) = item.prefetched {
            debug!("transition: using prefetched stream for {}", item.track.key());
            self.arm(item.track, stream, fade_ms).await;
            return;
        }

        let resolver = Arc::clone(&self.resolver);
        let tx = self.event_tx.clone();
        let track = item.track;
        tokio::spawn(async move {
            let stream = resolve_with_fallback(resolver.as_ref(), &track).await;
            let _ = tx
                .send(CoreEvent::Resolved {
                    generation,
                    track,
                    fade_ms,
                    stream,
                })
                .await;
        });
    }

    async fn on_resolved(
        &mut self,
        generation: u64,
        track: Track,
        fade_ms: Option<u64>,
        stream: Option<ResolvedStream>,
    ) {
        if generation != self.session.crossfade_generation {
            debug!(
                "transition: dropping stale resolve for {} ({} != {})",
                track.key(),
                generation,
                self.session.crossfade_generation
            );
            return;
        }
        self.pending = None;
        match stream {
            Some(stream) => self.arm(track, stream, fade_ms).await,
            None => {
                warn!("transition: could not resolve {}, abandoning", track.label());
                // a fade cut short by this request would otherwise stay frozen
                if let Some(fade) = self.fade.take() {
                    self.settle(fade).await;
                    self.publish().await;
                }
            }
        }
    }

    /// Put a resolved stream on air, by crossfade when possible.
    async fn arm(&mut self, track: Track, stream: ResolvedStream, fade_ms: Option<u64>) {
        self.pending = None;
        let url = proxied_url(self.proxy_base.as_deref(), &stream.stream_url);
        let crossfade = self.settings.crossfade_enabled
            && self.pool.inactive().is_available()
            && !self.pool.active().is_paused();

        let started = if crossfade {
            self.start_crossfade(&track, &url, fade_ms).await
        } else {
            self.switch_immediately(&track, &url).await
        };
        if !started {
            // a fade this request cut short would otherwise stay frozen
            if let Some(fade) = self.fade.take() {
                self.settle(fade).await;
                self.publish().await;
            }
            return;
        }

        self.session.current_track = Some(track);
        self.on_track_changed().await;
    }

    /// Replace playback on the active channel with nothing else audible.
    async fn switch_immediately(&mut self, track: &Track, url: &str) -> bool {
        let interrupted = self.fade.take();
        self.cancel_fade_ticker();
        let master = self.session.volume;

        let idle = self.pool.inactive_mut();
        if idle.has_source() || !idle.is_paused() {
            if let Err(e) = idle.reset().await {
                warn!("channel {}: reset failed: {}", idle.index(), e);
            }
        }
        if let Err(e) = idle.set_volume(1.0, master).await {
            warn!("channel {}: volume failed: {}", idle.index(), e);
        }

        let ch = self.pool.active_mut();
        let index = ch.index();
        if let Err(e) = ch.load(url).await {
            warn!("channel {}: load of {} failed: {}", index, track.key(), e);
            self.fade = interrupted;
            return false;
        }
        if let Err(e) = ch.set_volume(1.0, master).await {
            warn!("channel {}: volume failed: {}", index, e);
        }
        match ch.play().await {
            Ok(()) => self.session.is_playing = true,
            Err(e) => {
                warn!("channel {}: play of {} rejected: {}", index, track.key(), e);
                self.session.is_playing = false;
            }
        }
        info!("transition: {} on channel {} (immediate)", track.label(), index);

        if self.graph.as_ref().map(SignalGraph::channel) != Some(index) {
            self.rebuild_graph().await;
        }
        true
    }

    async fn start_crossfade(&mut self, track: &Track, url: &str, fade_ms: Option<u64>) -> bool {
        self.cancel_fade_ticker();
        let master = self.session.volume;

        let incoming = self.pool.inactive_mut();
        let to = incoming.index();
        if let Err(e) = incoming.load(url).await {
            warn!("channel {}: load of {} failed: {}", to, track.key(), e);
            return false;
        }
        if let Err(e) = incoming.set_volume(0.0, master).await {
            warn!("channel {}: volume failed: {}", to, e);
        }
        if let Err(e) = incoming.play().await {
            warn!("channel {}: play of {} rejected: {}", to, track.key(), e);
            if let Err(e) = incoming.reset().await {
                warn!("channel {}: reset failed: {}", to, e);
            }
            if let Err(e) = incoming.set_volume(1.0, master).await {
                warn!("channel {}: volume failed: {}", to, e);
            }
            return false;
        }

        let from = self.pool.active_index();
        let from_start = self.pool.channel(from).volume();
        self.pool.swap_active();
        self.session.is_playing = true;

        let generation = self.session.bump_generation();
        let plan = FadePlan::new(fade_ms.unwrap_or(self.settings.crossfade_duration_ms));
        info!(
            "transition: {} crossfading {} -> {} over {:?} ({} steps, generation {})",
            track.label(),
            from,
            to,
            plan.duration,
            plan.steps,
            generation
        );
        self.fade = Some(ActiveFade {
            generation,
            plan,
            from,
            to,
            from_start,
        });
        self.fade_ticker = Some(spawn_fade_ticker(plan, generation, self.event_tx.clone()));
        true
    }

    async fn on_fade_tick(&mut self, generation: u64, step: u32) {
        if generation != self.session.crossfade_generation {
            debug!("transition: stale fade tick {} (generation {})", step, generation);
            return;
        }
        let Some(fade) = self.fade else {
            return;
        };
        if fade.generation != generation {
            return;
        }
        if self.pool.channel(fade.to).is_paused() {
            debug!("transition: incoming channel paused, fade halted at step {}", step);
            self.cancel_fade_ticker();
            return;
        }

        let master = self.session.volume;
        let (out, inc) = fade.plan.volumes(step);
        let out = out * fade.from_start;
        if let Err(e) = self.pool.channel_mut(fade.from).set_volume(out, master).await {
            warn!("channel {}: fade volume failed: {}", fade.from, e);
        }
        if let Err(e) = self.pool.channel_mut(fade.to).set_volume(inc, master).await {
            warn!("channel {}: fade volume failed: {}", fade.to, e);
        }

        if step >= fade.plan.steps {
            self.fade = None;
            self.settle(fade).await;
            self.publish().await;
        }
    }

    /// Final cleanup of a fade: silence and clear the outgoing channel,
    /// restore ramps and rebind the graph to the now-active channel.
    async fn settle(&mut self, fade: ActiveFade) {
        self.cancel_fade_ticker();
        let master = self.session.volume;
        let old = self.pool.channel_mut(fade.from);
        if let Err(e) = old.pause().await {
            debug!("channel {}: pause on settle failed: {}", fade.from, e);
        }
        if let Err(e) = old.reset().await {
            warn!("channel {}: reset on settle failed: {}", fade.from, e);
        }
        if let Err(e) = old.set_volume(1.0, master).await {
            warn!("channel {}: volume failed: {}", fade.from, e);
        }
        if let Err(e) = self.pool.channel_mut(fade.to).set_volume(1.0, master).await {
            warn!("channel {}: volume failed: {}", fade.to, e);
        }
        self.rebuild_graph().await;
        info!("transition: fade {} complete on channel {}", fade.generation, fade.to);
    }

    fn cancel_fade_ticker(&mut self) {
        if let Some(handle) = self.fade_ticker.take() {
            handle.abort();
        }
    }

    fn cancel_fade(&mut self) {
        self.fade = None;
        self.cancel_fade_ticker();
    }

    async fn advance_queue(&mut self) {
        let Some(next) = self.session.queue.pop_front() else {
            debug!("queue: empty, nothing to advance to");
            return;
        };
        if self.prefetching.as_deref() == Some(next.track.key().as_str()) {
            self.prefetching = None;
        }
        self.request_transition(next, None).await;
        self.publish().await;
        self.maybe_autofill();
    }

    /// Follow-up work for a track that just went on air.
    async fn on_track_changed(&mut self) {
        let duration = self.session.current_track.as_ref().and_then(|t| t.duration_secs);
        self.session.progress = 0.0;
        self.session.duration = duration.unwrap_or(0.0);
        self.last_published_progress = 0.0;
        self.early_advance_for = None;

        self.refresh_normalization(false).await;
        self.refresh_lyrics();
        self.maybe_autofill();
        self.prefetch_head();
        self.publish().await;
    }

    // ── channel events ────────────────────────────────────────────────────────

    async fn on_channel_event(&mut self, index: usize, event: ChannelEvent) {
        if index > 1 {
            warn!("channel event for unknown channel {}", index);
            return;
        }
        self.pool.channel_mut(index).apply_event(&event);
        if index != self.pool.active_index() {
            return;
        }

        match event {
            ChannelEvent::Position(secs) => {
                self.session.progress = secs;
                self.maybe_early_advance().await;
                if (secs - self.last_published_progress).abs() >= PROGRESS_PUBLISH_STEP {
                    self.last_published_progress = secs;
                    self.publish().await;
                }
            }
            ChannelEvent::Duration(secs) => {
                self.session.duration = secs;
                self.publish().await;
            }
            ChannelEvent::Paused(paused) => {
                if self.session.current_track.is_some() {
                    self.session.is_playing = !paused;
                    self.update_lyric_ticker();
                    self.publish().await;
                }
            }
            ChannelEvent::Ended => {
                if self.session.current_track.is_none() || self.fade.is_some() {
                    return;
                }
                info!("playback: track ended on channel {}", index);
                self.session.is_playing = false;
                self.update_lyric_ticker();
                if self.session.queue.is_empty() {
                    self.publish().await;
                } else {
                    self.advance_queue().await;
                }
            }
        }
    }

    /// Start the next transition early enough for the crossfade to finish
    /// as the current track ends.  Fires once per track.
    async fn maybe_early_advance(&mut self) {
        if !(self.settings.crossfade_enabled && self.settings.gapless_enabled)
            || self.session.queue.is_empty()
            || self.fade.is_some()
            || self.pending.is_some()
            || !self.session.is_playing
        {
            return;
        }
        let Some(key) = self.session.current_key() else {
            return;
        };
        if self.early_advance_for.as_deref() == Some(key.as_str()) {
            return;
        }
        let active = self.pool.active();
        let duration = active.duration();
        if duration <= 0.0 {
            return;
        }
        let remaining = duration - active.current_time(Instant::now());
        let window = self.settings.crossfade_duration_ms as f64 / 1000.0;
        if remaining <= window {
            info!("transition: {:.2}s left, advancing early", remaining);
            self.early_advance_for = Some(key);
            self.advance_queue().await;
        }
    }

    // ── signal graph / normalization ──────────────────────────────────────────

    fn current_gain(&self) -> f32 {
        match self.session.current_key() {
            Some(key) => self.normalizer.gain_for_key(&key),
            None => 1.0,
        }
    }

    /// Build a fresh graph for the active channel and install it.
    async fn rebuild_graph(&mut self) {
        let graph = SignalGraph::build(
            self.pool.active_index(),
            DEFAULT_SAMPLE_RATE,
            self.current_gain(),
            &self.equalizer,
        );
        if let Err(e) = self.pool.active().install_graph(&graph).await {
            warn!("graph: install on channel {} failed: {}", graph.channel(), e);
        }
        debug!("graph: bound to channel {}", graph.channel());
        self.graph = Some(graph);
    }

    /// Push a new normalization gain into the live graph.  While a fade is
    /// running the graph still belongs to the outgoing channel, so the gain
    /// is left for the settle-time rebuild.
    async fn apply_gain(&mut self, gain: f32) {
        let active = self.pool.active_index();
        match self.graph.as_ref().map(SignalGraph::channel) {
            Some(bound) if bound == active => {
                if let Some(graph) = self.graph.as_mut() {
                    graph.set_normalization_gain(gain);
                    info!("normalize: gain {:.3} on channel {}", graph.normalization_gain(), active);
                    if let Err(e) = self.pool.channel(active).install_graph(graph).await {
                        warn!("graph: install on channel {} failed: {}", active, e);
                    }
                }
            }
            Some(_) => debug!("normalize: graph busy with fade, deferring gain {:.3}", gain),
            None => self.rebuild_graph().await,
        }
        self.publish().await;
    }

    async fn refresh_normalization(&mut self, force: bool) {
        let Some(track) = self.session.current_track.clone() else {
            return;
        };
        let key = track.key();
        if !self.normalizer.enabled {
            self.apply_gain(1.0).await;
            return;
        }
        if !force {
            if let Some(profile) = self.normalizer.cached(&key) {
                let gain = self.normalizer.gain(Some(&profile));
                self.apply_gain(gain).await;
                return;
            }
        }

        let resolver = Arc::clone(&self.resolver);
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = resolver.loudness(&track.id, &track.platform, force).await;
            let _ = tx.send(CoreEvent::LoudnessResolved { key, result }).await;
        });
    }

    async fn on_loudness_resolved(&mut self, key: String, result: EngineResult<LoudnessProfile>) {
        let is_current = self.session.current_key().as_deref() == Some(key.as_str());
        match result {
            Ok(profile) => {
                debug!("normalize: {} measured {:.1} LUFS", key, profile.integrated_lufs);
                self.normalizer.store(&key, profile);
                if is_current {
                    let gain = self.normalizer.gain_for_key(&key);
                    self.apply_gain(gain).await;
                }
            }
            Err(e) => {
                warn!("normalize: analysis of {} failed: {}", key, e);
                if is_current {
                    self.apply_gain(1.0).await;
                }
            }
        }
    }

    async fn apply_equalizer(&mut self) {
        if let Some(graph) = self.graph.as_mut() {
            graph.apply_equalizer(&self.equalizer);
            let index = graph.channel();
            if let Err(e) = self.pool.channel(index).install_graph(graph).await {
                warn!("graph: install on channel {} failed: {}", index, e);
            }
        }
        self.persist_settings().await;
        self.publish().await;
    }

    // ── lyrics ────────────────────────────────────────────────────────────────

    fn clear_lyrics(&mut self) {
        if let Some(handle) = self.lyric_ticker.take() {
            handle.abort();
        }
        let had_line = self
            .lyrics
            .take()
            .map(|l| l.active_index().is_some())
            .unwrap_or(false);
        if had_line {
            let _ = self.broadcast_tx.send(BroadcastMessage::Lyric {
                index: None,
                text: None,
            });
        }
    }

    fn refresh_lyrics(&mut self) {
        self.clear_lyrics();
        if !self.settings.lyrics_enabled {
            return;
        }
        let Some(track) = self.session.current_track.clone() else {
            return;
        };
        let key = track.key();
        let resolver = Arc::clone(&self.resolver);
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = resolver
                .lyrics(&track.artist, &track.title, track.duration_secs)
                .await;
            let _ = tx.send(CoreEvent::LyricsResolved { key, result }).await;
        });
    }

    async fn on_lyrics_resolved(&mut self, key: String, result: EngineResult<Option<LyricsPayload>>) {
        if !self.settings.lyrics_enabled || self.session.current_key().as_deref() != Some(key.as_str())
        {
            debug!("lyrics: dropping late result for {}", key);
            return;
        }
        let payload = match result {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                debug!("lyrics: none for {}", key);
                return;
            }
            Err(e) => {
                warn!("lyrics: lookup for {} failed: {}", key, e);
                return;
            }
        };
        let lines = payload
            .synced_lyrics
            .as_deref()
            .map(parse_synced_lyrics)
            .unwrap_or_default();
        if lines.is_empty() {
            debug!("lyrics: no synced lines for {} ({})", key, payload.source);
            return;
        }
        info!("lyrics: {} synced lines for {}", lines.len(), key);
        self.lyrics = Some(LyricTrack::new(lines));
        self.sync_lyrics();
        self.update_lyric_ticker();
        self.publish().await;
    }

    /// Run the lyric ticker exactly while something is playing with lyrics.
    fn update_lyric_ticker(&mut self) {
        let wanted = self.session.is_playing && self.lyrics.is_some();
        match (wanted, self.lyric_ticker.is_some()) {
            (true, false) => {
                let tx = self.event_tx.clone();
                self.lyric_ticker = Some(tokio::spawn(async move {
                    loop {
                        tokio::time::sleep(LYRIC_TICK).await;
                        if tx.send(CoreEvent::LyricTick).await.is_err() {
                            break;
                        }
                    }
                }));
            }
            (false, true) => {
                if let Some(handle) = self.lyric_ticker.take() {
                    handle.abort();
                }
            }
            _ => {}
        }
    }

    async fn on_lyric_tick(&mut self) {
        if !self.session.is_playing || self.lyrics.is_none() {
            self.update_lyric_ticker();
            return;
        }
        if self.sync_lyrics() {
            self.publish().await;
        }
    }

    /// Re-evaluate the active line; notifies listeners only on change.
    fn sync_lyrics(&mut self) -> bool {
        let now = self.pool.active().current_time(Instant::now());
        let Some(lyrics) = self.lyrics.as_mut() else {
            return false;
        };
        let Some(index) = lyrics.sync(now) else {
            return false;
        };
        let text = lyrics.active_line().map(|l| l.text.clone());
        debug!("lyrics: line {:?} at {:.2}s", index, now);
        let _ = self
            .broadcast_tx
            .send(BroadcastMessage::Lyric { index, text });
        true
    }

    // ── radio / prefetch ──────────────────────────────────────────────────────

    fn maybe_autofill(&mut self) {
        if !self.radio.try_begin(
            Instant::now(),
            self.settings.radio_enabled,
            self.session.current_track.is_some(),
            self.session.queue.len(),
        ) {
            return;
        }
        let Some(seed) = self.session.current_track.clone() else {
            return;
        };
        info!("radio: fetching recommendations for {}", seed.label());
        let resolver = Arc::clone(&self.resolver);
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            // inner task so a panicking resolver still reports back
            let fetch = tokio::spawn(async move {
                resolver
                    .similar_tracks(&seed.id, &seed.platform, RADIO_FETCH_LIMIT)
                    .await
            });
            let result = match fetch.await {
                Ok(result) => result,
                Err(e) => Err(EngineError::TaskFailed(e.to_string())),
            };
            let _ = tx.send(CoreEvent::RadioResolved { result }).await;
        });
    }

    async fn on_radio_resolved(&mut self, result: EngineResult<Vec<Track>>) {
        self.radio.finish(Instant::now(), result.is_ok());
        match result {
            Ok(candidates) => {
                let queued = self
                    .session
                    .queue
                    .iter()
                    .map(|q| &q.track)
                    .chain(self.pending.iter());
                match pick_candidate(candidates, self.session.current_track.as_ref(), queued) {
                    Some(track) => {
                        info!("radio: queued {}", track.label());
                        self.session.queue.push_back(QueuedTrack::new(track));
                        self.prefetch_head();
                    }
                    None => debug!("radio: no new candidates"),
                }
            }
            Err(e) => warn!("radio: recommendation fetch failed: {}", e),
        }
        self.publish().await;
    }

    /// Resolve the queue head ahead of time when gapless playback is on.
    fn prefetch_head(&mut self) {
        if !self.settings.gapless_enabled || self.session.current_track.is_none() {
            return;
        }
        let Some(head) = self.session.queue.front() else {
            return;
        };
        let key = head.track.key();
        if head.prefetched.is_some() || self.prefetching.as_deref() == Some(key.as_str()) {
            return;
        }
        debug!("prefetch: resolving {}", key);
        self.prefetching = Some(key.clone());
        let track = head.track.clone();
        let resolver = Arc::clone(&self.resolver);
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let stream = resolve_with_fallback(resolver.as_ref(), &track).await;
            let _ = tx.send(CoreEvent::Prefetched { key, stream }).await;
        });
    }

    fn on_prefetched(&mut self, key: String, stream: Option<ResolvedStream>) {
        if self.prefetching.as_deref() == Some(key.as_str()) {
            self.prefetching = None;
        }
        let Some(stream) = stream else {
            debug!("prefetch: {} did not resolve", key);
            return;
        };
        match self.session.queue.front_mut() {
            Some(head) if head.track.key() == key => {
                debug!("prefetch: {} ready", key);
                head.prefetched = Some(stream);
            }
            _ => debug!("prefetch: {} is no longer the queue head", key),
        }
    }

    // ── state publication ─────────────────────────────────────────────────────

    fn snapshot(&self) -> PlayerState {
        let lyric = self.lyrics.as_ref();
        PlayerState {
            rev: 0,
            current_track: self.session.current_track.clone(),
            queue: self.session.queue.iter().map(|q| q.track.clone()).collect(),
            active_channel: self.pool.active_index(),
            crossfade_generation: self.session.crossfade_generation,
            is_playing: self.session.is_playing,
            volume: self.session.volume,
            progress_secs: self.session.progress,
            duration_secs: self.session.duration,
            normalization_gain: self
                .graph
                .as_ref()
                .map(SignalGraph::normalization_gain)
                .unwrap_or(1.0),
            settings: self.settings.clone(),
            lyric_index: lyric.and_then(LyricTrack::active_index),
            lyric_text: lyric.and_then(|l| l.active_line()).map(|l| l.text.clone()),
            radio_in_flight: self.radio.in_flight(),
        }
    }

    async fn publish(&mut self) {
        let snapshot = self.snapshot();
        self.state_manager.publish(snapshot).await;
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
    }

    async fn persist_settings(&mut self) {
        self.equalizer.write_settings(&mut self.settings);
        self.settings.volume = self.session.volume;
        if let Err(e) = self.state_manager.save_settings(&self.settings).await {
            warn!("settings: save failed: {}", e);
        }
    }

    async fn cleanup(&mut self) {
        self.cancel_fade();
        if let Some(handle) = self.lyric_ticker.take() {
            handle.abort();
        }
        for index in 0..2 {
            if let Err(e) = self.pool.channel_mut(index).reset().await {
                debug!("channel {}: reset on shutdown failed: {}", index, e);
            }
        }
    }
}
