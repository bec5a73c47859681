use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

use crate::audio::frame::FrameDuration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Discord (opcional: sin token las notificaciones van solo al log)
    pub discord_token: Option<String>,
    pub notify_channel_id: Option<u64>,
    pub guild_id: Option<u64>,
    pub voice_channel_id: Option<u64>,

    // Audio
    pub default_volume: f64,
    pub opus_bitrate: u32,
    pub frame_duration_ms: u64,
    pub buffer_ms: u64,
    pub compression_level: u8,

    // Tiempos
    pub send_timeout_ms: u64,
    pub idle_timeout_secs: u64,
    pub error_notice_secs: u64,
    pub panel_refresh_secs: u64,

    // Límites
    pub max_queue_size: usize,

    // Binarios externos
    pub ffmpeg_path: String,
    pub ytdlp_path: String,

    // Paths
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            // Discord
            discord_token: std::env::var("DISCORD_TOKEN")
                .ok()
                .filter(|token| !token.trim().is_empty()),
            notify_channel_id: std::env::var("NOTIFY_CHANNEL_ID")
                .ok()
                .and_then(|s| s.parse().ok()),
            guild_id: std::env::var("GUILD_ID").ok().and_then(|s| s.parse().ok()),
            voice_channel_id: std::env::var("VOICE_CHANNEL_ID")
                .ok()
                .and_then(|s| s.parse().ok()),

            // Audio
            default_volume: std::env::var("DEFAULT_VOLUME")
                .unwrap_or_else(|_| "1.0".to_string())
                .parse()?,
            opus_bitrate: std::env::var("OPUS_BITRATE")
                .unwrap_or_else(|_| "64000".to_string())
                .parse()?,
            frame_duration_ms: std::env::var("FRAME_DURATION_MS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()?,
            buffer_ms: std::env::var("BUFFER_MS")
                .unwrap_or_else(|_| "15000".to_string()) // ~15s de jitter
                .parse()?,
            compression_level: std::env::var("COMPRESSION_LEVEL")
                .unwrap_or_else(|_| "10".to_string())
                .parse()?,

            // Tiempos
            send_timeout_ms: std::env::var("SEND_TIMEOUT_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()?,
            idle_timeout_secs: std::env::var("IDLE_TIMEOUT_SECS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()?,
            error_notice_secs: std::env::var("ERROR_NOTICE_SECS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()?,
            panel_refresh_secs: std::env::var("PANEL_REFRESH_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()?,

            // Límites
            max_queue_size: std::env::var("MAX_QUEUE_SIZE")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()?,

            // Binarios externos
            ffmpeg_path: std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
            ytdlp_path: std::env::var("YTDLP_PATH").unwrap_or_else(|_| "yt-dlp".to_string()),

            // Paths
            data_dir: std::env::var("DATA_DIR")
                .unwrap_or_else(|_| "./data".to_string())
                .into(),
            output_dir: std::env::var("OUTPUT_DIR")
                .unwrap_or_else(|_| "./out".to_string())
                .into(),
        };

        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(&config.output_dir)?;

        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Volume must be between 0.1 and 1.5
    /// - Opus bitrate must lie within 8kbps..=510kbps (Discord limit)
    /// - Frame duration must be one Opus accepts for voice: 20, 40 or 60 ms
    /// - Buffer and timeouts must be non-zero
    /// - With a Discord token, the guild and voice channel to play in
    pub fn validate(&self) -> Result<()> {
        if !(0.1..=1.5).contains(&self.default_volume) {
            anyhow::bail!("Default volume must be between 0.1 and 1.5, got: {}", self.default_volume);
        }

        if self.opus_bitrate > 510_000 {
            anyhow::bail!("Opus bitrate cannot exceed 510kbps, got: {}", self.opus_bitrate);
        }

        if self.opus_bitrate < 8_000 {
            anyhow::bail!("Opus bitrate too low, minimum 8kbps, got: {}", self.opus_bitrate);
        }

        FrameDuration::from_millis(self.frame_duration_ms)?;

        if self.compression_level > 10 {
            anyhow::bail!("Compression level must be 0-10, got: {}", self.compression_level);
        }

        if self.buffer_ms == 0 {
            anyhow::bail!("Buffer size must be greater than 0");
        }

        if self.send_timeout_ms == 0 {
            anyhow::bail!("Send timeout must be greater than 0");
        }

        if self.panel_refresh_secs == 0 {
            anyhow::bail!("Panel refresh interval must be greater than 0");
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if self.discord_token.is_some() && (self.guild_id.is_none() || self.voice_channel_id.is_none()) {
            anyhow::bail!("GUILD_ID and VOICE_CHANNEL_ID are required when DISCORD_TOKEN is set");
        }

        Ok(())
    }

    pub fn frame_duration(&self) -> FrameDuration {
        FrameDuration::from_millis(self.frame_duration_ms).unwrap_or_default()
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn error_notice_ttl(&self) -> Duration {
        Duration::from_secs(self.error_notice_secs)
    }

    pub fn panel_refresh(&self) -> Duration {
        Duration::from_secs(self.panel_refresh_secs)
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Excludes the Discord token.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Discord: {} (guild: {}, voice: {}, notify channel: {})\n  \
            Audio: {}% vol, {}kbps, {}ms frames, {}ms buffer\n  \
            Timing: {}ms send timeout, {}s idle disconnect\n  \
            Binaries: {} / {}",
            if self.discord_token.is_some() { "gateway enabled" } else { "log only" },
            self.guild_id.map_or("none".to_string(), |id| id.to_string()),
            self.voice_channel_id.map_or("none".to_string(), |id| id.to_string()),
            self.notify_channel_id.map_or("none".to_string(), |id| id.to_string()),
            (self.default_volume * 100.0) as u32,
            self.opus_bitrate / 1000,
            self.frame_duration_ms,
            self.buffer_ms,
            self.send_timeout_ms,
            self.idle_timeout_secs,
            self.ffmpeg_path,
            self.ytdlp_path,
        )
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            discord_token: None,
            notify_channel_id: None,
            guild_id: None,
            voice_channel_id: None,

            default_volume: 1.0,
            opus_bitrate: 64_000,
            frame_duration_ms: 20,
            buffer_ms: 15_000,
            compression_level: 10,

            send_timeout_ms: 1_000,
            idle_timeout_secs: 300, // 5 minutos
            error_notice_secs: 5,
            panel_refresh_secs: 10,

            max_queue_size: 1000,

            ffmpeg_path: "ffmpeg".to_string(),
            ytdlp_path: "yt-dlp".to_string(),

            data_dir: "./data".into(),
            output_dir: "./out".into(),
        }
    }
}
