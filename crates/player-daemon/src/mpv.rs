/// mpv IPC driver with separated reader/writer tasks, one mpv process per
/// playback channel.
///
/// ```text
///   MpvDriver::spawn_and_connect()
///         │
///         ├── writer_task   ← receives PendingRequest via mpsc, serialises → socket
///         └── reader_task   ← reads JSON lines from socket
///                                ├── response (has request_id) → matched oneshot::Sender
///                                └── event / property-change   → event_tx channel
/// ```
///
/// `MpvChannel` wraps one driver as a `ChannelBackend` and forwards the
/// observed properties to the core as `CoreEvent::Channel`.
///
/// Platform notes:
/// - Unix:   Unix domain sockets
/// - Windows: Named pipes  \\.\pipe\<name>
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use player_proto::platform;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

use crate::channel::{ChannelBackend, ChannelEvent};
use crate::core::CoreEvent;
use crate::error::{EngineError, EngineResult};
use crate::graph::SignalGraph;

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

/// Fixed observe_property IDs.
pub const OBS_PAUSE: u64 = 1;
pub const OBS_TIME_POS: u64 = 2;
pub const OBS_DURATION: u64 = 3;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct PendingRequest {
    req_id: u64,
    payload: String,
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// An mpv event / property-change that arrived unsolicited (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// Returns `Some((obs_id, data))` if this is a property-change event.
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.raw.get("event")?.as_str()? == "property-change" {
            let id = self.raw.get("id")?.as_u64()?;
            let data = self.raw.get("data").unwrap_or(&Value::Null);
            Some((id, data))
        } else {
            None
        }
    }

    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    /// Map to the channel-level event the core cares about.  Only a natural
    /// end of file counts as `Ended`; `stop` and `redirect` come from our own
    /// load/reset calls.
    pub fn to_channel_event(&self) -> Option<ChannelEvent> {
        if let Some((id, data)) = self.as_property_change() {
            return match id {
                OBS_PAUSE => data.as_bool().map(ChannelEvent::Paused),
                OBS_TIME_POS => data.as_f64().map(ChannelEvent::Position),
                OBS_DURATION => data.as_f64().map(ChannelEvent::Duration),
                _ => None,
            };
        }
        match self.event_name() {
            Some("end-file") => {
                let reason = self.raw.get("reason").and_then(|v| v.as_str());
                if reason == Some("eof") {
                    Some(ChannelEvent::Ended)
                } else {
                    debug!("mpv: end-file reason={:?}", reason);
                    None
                }
            }
            _ => None,
        }
    }
}

// ── public handle ─────────────────────────────────────────────────────────────

/// Cloneable handle to the mpv writer task.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(tokio::time::Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    pub async fn set_property(&self, name: &str, value: Value) -> anyhow::Result<()> {
        self.send(json!(["set_property", name, value])).await?;
        Ok(())
    }

    /// Register observe_property for everything the channel mirrors.
    pub async fn observe_all_properties(&self) {
        let props = [
            (OBS_PAUSE, "pause"),
            (OBS_TIME_POS, "time-pos"),
            (OBS_DURATION, "duration"),
        ];
        for (id, name) in &props {
            match self.send(json!(["observe_property", id, name])).await {
                Ok(_) => debug!("mpv: observe_property id={} name={}", id, name),
                Err(e) => warn!("mpv: observe_property {} failed: {}", name, e),
            }
        }
    }
}

// ── driver ────────────────────────────────────────────────────────────────────

/// Owns one mpv child process.
pub struct MpvDriver {
    channel: usize,
    socket_name: String,
    binary: Option<PathBuf>,
    process: Option<tokio::process::Child>,
}

impl MpvDriver {
    pub fn new(channel: usize, binary: Option<PathBuf>) -> Self {
        Self {
            channel,
            socket_name: platform::mpv_socket_name(channel),
            binary,
            process: None,
        }
    }

    fn command(&self) -> anyhow::Result<tokio::process::Command> {
        let mpv_binary = platform::find_mpv_binary(self.binary.as_deref())
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;
        let mut cmd = tokio::process::Command::new(mpv_binary);
        cmd.arg("--no-video")
            .arg("--idle=yes")
            .arg(platform::mpv_socket_arg(self.channel))
            .arg("--quiet")
            .arg("--volume=0")
            .arg("--keep-open=no")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        Ok(cmd)
    }

    #[cfg(unix)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }

        let socket_path = PathBuf::from(&self.socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;

        info!("mpv[{}]: spawning new process", platform::channel_label(self.channel));
        self.process = Some(self.command()?.spawn()?);

        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            anyhow::bail!("mpv IPC socket {} did not appear", self.socket_name);
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;

        let stream = UnixStream::connect(&socket_path).await?;
        info!("mpv[{}]: connected to IPC socket", platform::channel_label(self.channel));
        let (read_half, write_half) = stream.into_split();
        Ok(start_io_tasks(BufReader::new(read_half), write_half, event_tx))
    }

    #[cfg(windows)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }

        info!("mpv[{}]: spawning new process", platform::channel_label(self.channel));
        self.process = Some(self.command()?.spawn()?);

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                info!("mpv[{}]: connected to named pipe", platform::channel_label(self.channel));
                let (read_half, write_half) = tokio::io::split(client);
                return Ok(start_io_tasks(BufReader::new(read_half), write_half, event_tx));
            }
        }
        anyhow::bail!("mpv named pipe {} did not appear", pipe_path)
    }
}

fn start_io_tasks<R, W>(
    reader: BufReader<R>,
    writer: W,
    event_tx: mpsc::Sender<MpvEvent>,
) -> MpvHandle
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    // req_id → reply channel, shared between writer (inserts) and reader (resolves)
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(writer, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(reader, pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

// ── reader task ───────────────────────────────────────────────────────────────

async fn reader_task<R>(mut reader: BufReader<R>, pending: PendingMap, event_tx: mpsc::Sender<MpvEvent>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                let mut map = pending.lock().await;
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(anyhow::anyhow!("mpv IPC connection closed")));
                }
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err = val["error"]
                                .as_str()
                                .unwrap_or("unknown error")
                                .to_string();
                            debug!("mpv reader: response req={} err={}", req_id, err);
                            Err(anyhow::anyhow!("mpv error: {}", err))
                        };
                        let _ = tx.send(result);
                    } else {
                        debug!("mpv reader: response for unknown req={}", req_id);
                    }
                } else if event_tx.send(MpvEvent { raw: val }).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                let mut map = pending.lock().await;
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(anyhow::anyhow!("mpv IPC read error: {}", e)));
                }
                break;
            }
        }
    }
}

// ── writer task ───────────────────────────────────────────────────────────────

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // register before writing so the reader can match the reply
        {
            let mut map = pending.lock().await;
            map.insert(req.req_id, req.reply);
        }
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            let mut map = pending.lock().await;
            if let Some(tx) = map.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

// ── channel backend ───────────────────────────────────────────────────────────

fn backend_err(e: anyhow::Error) -> EngineError {
    EngineError::Backend(e.to_string())
}

/// One playback channel rendered by its own mpv process.
pub struct MpvChannel {
    index: usize,
    handle: Option<MpvHandle>,
    /// Keeps the child alive; dropped (and killed) with the channel.
    _driver: Mutex<MpvDriver>,
}

impl MpvChannel {
    /// Spawn mpv for channel `index`.  A failed start yields a channel that
    /// reports itself unavailable rather than an error, so the pool always
    /// has two slots.
    pub async fn start(
        index: usize,
        binary: Option<PathBuf>,
        core_tx: mpsc::Sender<CoreEvent>,
    ) -> Arc<Self> {
        let mut driver = MpvDriver::new(index, binary);
        let (event_tx, mut event_rx) = mpsc::channel::<MpvEvent>(64);

        let handle = match driver.spawn_and_connect(event_tx).await {
            Ok(h) => {
                h.observe_all_properties().await;
                Some(h)
            }
            Err(e) => {
                warn!("mpv[{}]: unavailable: {}", platform::channel_label(index), e);
                None
            }
        };

        tokio::spawn(async move {
            while let Some(evt) = event_rx.recv().await {
                let Some(event) = evt.to_channel_event() else {
                    continue;
                };
                if core_tx.send(CoreEvent::Channel { index, event }).await.is_err() {
                    break;
                }
            }
        });

        Arc::new(Self {
            index,
            handle,
            _driver: Mutex::new(driver),
        })
    }

    fn handle(&self) -> EngineResult<&MpvHandle> {
        self.handle
            .as_ref()
            .filter(|h| h.is_connected())
            .ok_or(EngineError::ChannelUnavailable(self.index))
    }
}

#[async_trait]
impl ChannelBackend for MpvChannel {
    fn is_available(&self) -> bool {
        self.handle.as_ref().map(MpvHandle::is_connected).unwrap_or(false)
    }

    async fn load(&self, url: &str) -> EngineResult<()> {
        let h = self.handle()?;
        h.set_property("pause", json!(true)).await.map_err(backend_err)?;
        h.send(json!(["loadfile", url, "replace"]))
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn play(&self) -> EngineResult<()> {
        self.handle()?
            .set_property("pause", json!(false))
            .await
            .map_err(backend_err)
    }

    async fn pause(&self) -> EngineResult<()> {
        self.handle()?
            .set_property("pause", json!(true))
            .await
            .map_err(backend_err)
    }

    async fn reset(&self) -> EngineResult<()> {
        self.handle()?
            .send(json!(["stop"]))
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn set_volume(&self, volume: f32) -> EngineResult<()> {
        let pct = (volume * 100.0).clamp(0.0, 100.0);
        self.handle()?
            .set_property("volume", json!(pct))
            .await
            .map_err(backend_err)
    }

    async fn seek(&self, seconds: f64) -> EngineResult<()> {
        self.handle()?
            .set_property("time-pos", json!(seconds.max(0.0)))
            .await
            .map_err(backend_err)
    }

    async fn install_graph(&self, graph: &SignalGraph) -> EngineResult<()> {
        let filter = json!([{
            "name": "lavfi",
            "label": "chain",
            "params": { "graph": graph.to_lavfi() }
        }]);
        self.handle()?
            .set_property("af", filter)
            .await
            .map_err(backend_err)?;
        debug!("mpv[{}]: filter chain installed", platform::channel_label(self.index));
        Ok(())
    }
}
