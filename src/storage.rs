use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serenity::model::id::{ChannelId, GuildId, MessageId};
use std::{collections::HashMap, path::PathBuf};
use tokio::fs;
use tracing::{info, warn};

use crate::error::{PlaybackError, Result};

/// Ajustes persistidos por guild
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuildSettings {
    /// Canal de voz vinculado a la cola
    pub voice_channel: Option<ChannelId>,
    /// Canal de texto donde vive el panel
    pub music_channel: Option<ChannelId>,
    /// Mensaje del panel "now playing"
    pub panel_message: Option<MessageId>,
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Settings for `guild`, defaults when none were saved.
    async fn get(&self, guild: GuildId) -> Result<GuildSettings>;

    async fn set(&self, guild: GuildId, settings: GuildSettings) -> Result<()>;
}

/// Manager de almacenamiento basado en archivos JSON, uno por guild
pub struct JsonSettingsStore {
    dir: PathBuf,
    cache: Mutex<HashMap<GuildId, GuildSettings>>,
}

impl JsonSettingsStore {
    pub async fn new(data_dir: PathBuf) -> Result<Self> {
        let dir = data_dir.join("guilds");
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| PlaybackError::Storage(format!("creating {}: {e}", dir.display())))?;

        info!("📁 Storage inicializado en: {}", dir.display());

        let store = Self {
            dir,
            cache: Mutex::new(HashMap::new()),
        };
        store.load_all().await?;
        Ok(store)
    }

    pub fn guilds(&self) -> Vec<GuildId> {
        self.cache.lock().keys().copied().collect()
    }

    fn path_for(&self, guild: GuildId) -> PathBuf {
        self.dir.join(format!("guild_{guild}.json"))
    }

    async fn load_all(&self) -> Result<()> {
        let mut files = fs::read_dir(&self.dir)
            .await
            .map_err(|e| PlaybackError::Storage(e.to_string()))?;
        let mut loaded = 0;

        while let Some(entry) = files
            .next_entry()
            .await
            .map_err(|e| PlaybackError::Storage(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let Some(guild) = path
                .file_stem()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("guild_"))
                .and_then(|id| id.parse::<u64>().ok())
                .filter(|id| *id != 0)
                .map(GuildId::new)
            else {
                continue;
            };

            match read_settings(&path).await {
                Ok(settings) => {
                    self.cache.lock().insert(guild, settings);
                    loaded += 1;
                }
                Err(e) => warn!("Error cargando ajustes para guild {}: {}", guild, e),
            }
        }

        if loaded > 0 {
            info!("📂 Cargados ajustes de {} guilds", loaded);
        }
        Ok(())
    }
}

async fn read_settings(path: &std::path::Path) -> Result<GuildSettings> {
    let content = fs::read_to_string(path)
        .await
        .map_err(|e| PlaybackError::Storage(e.to_string()))?;
    Ok(serde_json::from_str(&content)?)
}

#[async_trait]
impl SettingsStore for JsonSettingsStore {
    async fn get(&self, guild: GuildId) -> Result<GuildSettings> {
        Ok(self.cache.lock().get(&guild).cloned().unwrap_or_default())
    }

    async fn set(&self, guild: GuildId, settings: GuildSettings) -> Result<()> {
        let content = serde_json::to_string_pretty(&settings)?;
        fs::write(self.path_for(guild), content)
            .await
            .map_err(|e| PlaybackError::Storage(e.to_string()))?;
        self.cache.lock().insert(guild, settings);
        Ok(())
    }
}
