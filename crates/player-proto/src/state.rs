use crate::protocol::PlayerState;
use crate::settings::PlayerSettings;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Holds the published state snapshot and owns settings persistence.
///
/// The engine core is the only writer; socket clients read snapshots.
pub struct StateManager {
    state: Arc<RwLock<PlayerState>>,
    settings_file: PathBuf,
}

impl StateManager {
    pub fn new(settings_file: PathBuf) -> Self {
        let settings = Self::load_settings(&settings_file);
        let state = PlayerState {
            rev: 1,
            volume: settings.volume,
            normalization_gain: 1.0,
            settings,
            ..PlayerState::default()
        };

        Self {
            state: Arc::new(RwLock::new(state)),
            settings_file,
        }
    }

    pub async fn get_state(&self) -> PlayerState {
        self.state.read().await.clone()
    }

    pub async fn settings(&self) -> PlayerSettings {
        self.state.read().await.settings.clone()
    }

    /// Replace the snapshot, keeping the revision counter monotonic.
    pub async fn publish(&self, mut next: PlayerState) -> u64 {
        let mut state = self.state.write().await;
        next.rev = state.rev + 1;
        *state = next;
        state.rev
    }

    /// Store new settings in the snapshot and write them to disk.
    pub async fn save_settings(&self, settings: &PlayerSettings) -> anyhow::Result<()> {
        {
            let mut state = self.state.write().await;
            state.settings = settings.clone();
            state.rev += 1;
        }

        if let Some(parent) = self.settings_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(settings)?;
        tokio::fs::write(&self.settings_file, json).await?;
        Ok(())
    }

    pub fn load_settings(settings_file: &Path) -> PlayerSettings {
        if let Ok(content) = std::fs::read_to_string(settings_file) {
            match serde_json::from_str::<PlayerSettings>(&content) {
                Ok(settings) => return settings.sanitized(),
                Err(e) => tracing::warn!(
                    "settings: could not parse {}: {}",
                    settings_file.display(),
                    e
                ),
            }
        }
        PlayerSettings::default()
    }
}
