use std::fmt::Write;
use std::sync::Arc;

use player_daemon::channel::{ChannelBackend, ChannelPool};
use player_daemon::core::{CoreEvent, PlayerCore};
use player_daemon::mpv::MpvChannel;
use player_daemon::resolver::HttpResolver;
use player_daemon::{socket, BroadcastMessage};
use player_proto::config::Config;
use player_proto::state::StateManager;
use tokio::sync::{broadcast, mpsc};
use tracing::field::Field;
use tracing::{info, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Mirrors WARN and ERROR events to connected clients as `Log` lines.
struct ClientLogLayer {
    tx: broadcast::Sender<BroadcastMessage>,
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for ClientLogLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() > Level::WARN {
            return;
        }
        // no receivers is fine
        let _ = self.tx.send(BroadcastMessage::Log(client_log_line(event)));
    }
}

/// `HH:MM:SS LEVEL module: message key=value ...`
fn client_log_line(event: &tracing::Event<'_>) -> String {
    let meta = event.metadata();
    let module = meta.target().rsplit("::").next().unwrap_or_default();
    let mut line = String::new();
    let _ = write!(
        line,
        "{} {} {}: ",
        chrono::Local::now().format("%H:%M:%S"),
        meta.level(),
        module
    );
    event.record(&mut LineFields(&mut line));
    line
}

struct LineFields<'a>(&'a mut String);

impl tracing::field::Visit for LineFields<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.0.push_str(value);
        } else {
            let _ = write!(self.0, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.0, "{:?}", value);
        } else {
            let _ = write!(self.0, " {}={:?}", field.name(), value);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(256);

    let data_dir = player_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("player.log");
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(ClientLogLayer {
            tx: broadcast_tx.clone(),
        })
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,player_daemon=debug")),
        )
        .init();

    let config = Config::load()?;
    info!(log = ?log_path, config = ?Config::config_path(), "player daemon starting");

    // all external inputs funnel into PlayerCore
    let (event_tx, event_rx) = mpsc::channel::<CoreEvent>(256);

    let state_manager = Arc::new(StateManager::new(config.daemon.settings_file.clone()));
    let resolver = Arc::new(HttpResolver::new(config.resolver.base_url.clone())?);

    let a = MpvChannel::start(0, config.mpv.binary.clone(), event_tx.clone()).await;
    let b = MpvChannel::start(1, config.mpv.binary.clone(), event_tx.clone()).await;
    if !a.is_available() {
        anyhow::bail!("primary playback channel could not be started");
    }
    let pool = ChannelPool::new(a, b);

    let core = PlayerCore::new(
        pool,
        resolver,
        state_manager.clone(),
        config.resolver.proxy_base.clone(),
        event_tx.clone(),
        broadcast_tx.clone(),
    )
    .await;

    let _socket_handle = socket::start_server(
        config.control.bind_address.clone(),
        config.control.port,
        state_manager,
        event_tx.clone(),
        broadcast_tx,
    );

    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            let _ = shutdown_tx.send(CoreEvent::Shutdown).await;
        }
    });

    info!("Player daemon initialised, running event loop");
    core.run(event_rx).await?;

    Ok(())
}
