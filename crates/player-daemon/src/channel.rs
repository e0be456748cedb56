//! Fixed two-channel pool.
//!
//! Channels are allocated once at startup and never dropped.  Loading a
//! track means handing a new source to an existing channel's backend; a
//! channel swap is only a flip of `active`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::EngineResult;
use crate::graph::SignalGraph;

/// Decode/render handle behind a channel.
#[async_trait]
pub trait ChannelBackend: Send + Sync {
    /// False when the backend could not be started or has died.
    fn is_available(&self) -> bool;

    /// Replace the current source.  Playback stays paused until `play`.
    async fn load(&self, url: &str) -> EngineResult<()>;

    async fn play(&self) -> EngineResult<()>;

    async fn pause(&self) -> EngineResult<()>;

    /// Stop and drop the current source, rewinding to zero.
    async fn reset(&self) -> EngineResult<()>;

    /// Effective output volume, 0..1.
    async fn set_volume(&self, volume: f32) -> EngineResult<()>;

    async fn seek(&self, seconds: f64) -> EngineResult<()>;

    /// Bind this channel's render path to `graph`.
    async fn install_graph(&self, graph: &SignalGraph) -> EngineResult<()>;
}

/// Unsolicited state reported by a backend.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Position(f64),
    Duration(f64),
    Paused(bool),
    Ended,
}

pub struct Channel {
    index: usize,
    backend: Arc<dyn ChannelBackend>,
    source: Option<String>,
    /// Ramp volume; the backend receives `volume * master`.
    volume: f32,
    position: f64,
    position_at: Instant,
    duration: f64,
    paused: bool,
}

impl Channel {
    pub fn new(index: usize, backend: Arc<dyn ChannelBackend>) -> Self {
        Self {
            index,
            backend,
            source: None,
            volume: 1.0,
            position: 0.0,
            position_at: Instant::now(),
            duration: 0.0,
            paused: true,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_available(&self) -> bool {
        self.backend.is_available()
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    /// Playback position now, extrapolated from the last report while playing.
    pub fn current_time(&self, now: Instant) -> f64 {
        let mut t = self.position;
        if !self.paused {
            t += now.saturating_duration_since(self.position_at).as_secs_f64();
        }
        if self.duration > 0.0 {
            t = t.min(self.duration);
        }
        t
    }

    pub async fn load(&mut self, url: &str) -> EngineResult<()> {
        self.backend.load(url).await?;
        self.source = Some(url.to_string());
        self.position = 0.0;
        self.position_at = Instant::now();
        self.duration = 0.0;
        self.paused = true;
        Ok(())
    }

    pub async fn play(&mut self) -> EngineResult<()> {
        self.backend.play().await?;
        self.paused = false;
        self.position_at = Instant::now();
        Ok(())
    }

    pub async fn pause(&mut self) -> EngineResult<()> {
        let now = Instant::now();
        self.position = self.current_time(now);
        self.position_at = now;
        self.paused = true;
        self.backend.pause().await
    }

    pub async fn reset(&mut self) -> EngineResult<()> {
        self.paused = true;
        self.source = None;
        self.position = 0.0;
        self.duration = 0.0;
        self.backend.reset().await
    }

    pub async fn seek(&mut self, seconds: f64) -> EngineResult<()> {
        self.backend.seek(seconds).await?;
        self.position = seconds.max(0.0);
        self.position_at = Instant::now();
        Ok(())
    }

    pub async fn set_volume(&mut self, volume: f32, master: f32) -> EngineResult<()> {
        self.volume = volume.clamp(0.0, 1.0);
        self.backend.set_volume(self.volume * master).await
    }

    pub async fn install_graph(&self, graph: &SignalGraph) -> EngineResult<()> {
        self.backend.install_graph(graph).await
    }

    /// Fold a backend report into the mirrored state.
    pub fn apply_event(&mut self, event: &ChannelEvent) {
        match event {
            ChannelEvent::Position(secs) => {
                self.position = *secs;
                self.position_at = Instant::now();
            }
            ChannelEvent::Duration(secs) => self.duration = *secs,
            ChannelEvent::Paused(paused) => {
                self.position = self.current_time(Instant::now());
                self.position_at = Instant::now();
                self.paused = *paused;
            }
            ChannelEvent::Ended => {
                self.paused = true;
                if self.duration > 0.0 {
                    self.position = self.duration;
                }
            }
        }
    }
}

pub struct ChannelPool {
    channels: [Channel; 2],
    active: usize,
}

impl ChannelPool {
    pub fn new(a: Arc<dyn ChannelBackend>, b: Arc<dyn ChannelBackend>) -> Self {
        Self {
            channels: [Channel::new(0, a), Channel::new(1, b)],
            active: 0,
        }
    }

    pub fn active_index(&self) -> usize {
        self.active
    }

    pub fn inactive_index(&self) -> usize {
        1 - self.active
    }

    pub fn active(&self) -> &Channel {
        &self.channels[self.active]
    }

    pub fn active_mut(&mut self) -> &mut Channel {
        &mut self.channels[self.active]
    }

    pub fn inactive(&self) -> &Channel {
        &self.channels[1 - self.active]
    }

    pub fn inactive_mut(&mut self) -> &mut Channel {
        &mut self.channels[1 - self.active]
    }

    pub fn channel(&self, index: usize) -> &Channel {
        &self.channels[index]
    }

    pub fn channel_mut(&mut self, index: usize) -> &mut Channel {
        &mut self.channels[index]
    }

    /// Hand the "active" designation to the other channel.
    pub fn swap_active(&mut self) {
        self.active = 1 - self.active;
    }

    /// Push `ramp * master` to both backends.
    pub async fn sync_master_volume(&mut self, master: f32) -> EngineResult<()> {
        for ch in self.channels.iter_mut() {
            let ramp = ch.volume;
            ch.set_volume(ramp, master).await?;
        }
        Ok(())
    }
}
