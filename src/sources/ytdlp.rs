use async_trait::async_trait;
use serde::Deserialize;
use std::{process::Stdio, time::Duration};
use tracing::{debug, error, info};

use super::{link_seek, normalize_link, ResolvedTrack, TrackResolver};
use crate::error::{PlaybackError, Result};

/// Discord no emite por encima de 96 kbps, no hace falta más
const PREFERRED_ABR: f64 = 96.0;

#[derive(Debug, Deserialize)]
struct VideoInfo {
    title: String,
    thumbnail: Option<String>,
    duration: Option<f64>,
    #[serde(default)]
    formats: Vec<Format>,
}

#[derive(Debug, Clone, Deserialize)]
struct Format {
    url: String,
    protocol: Option<String>,
    vcodec: Option<String>,
    abr: Option<f64>,
}

impl Format {
    fn abr(&self) -> f64 {
        self.abr.unwrap_or(0.0)
    }

    fn is_audio_only(&self) -> bool {
        self.vcodec.as_deref() == Some("none")
    }
}

/// Picks the stream: no rtmp, an audio-only format of at least 96 kbps if
/// there is one, else the highest bitrate of all.
fn choose_format(formats: &[Format]) -> Option<&Format> {
    let mut candidates: Vec<&Format> = formats
        .iter()
        .filter(|f| !f.protocol.as_deref().is_some_and(|p| p.starts_with("rtmp")))
        .collect();
    candidates.sort_by(|a, b| b.abr().total_cmp(&a.abr()));

    candidates
        .iter()
        .find(|f| f.is_audio_only() && f.abr() >= PREFERRED_ABR)
        .or_else(|| candidates.first())
        .copied()
}

fn parse_info(json: &[u8], source_url: String, seek: Duration) -> Result<ResolvedTrack> {
    let info: VideoInfo = serde_json::from_slice(json)
        .map_err(|e| PlaybackError::Resolve(format!("error parsing yt-dlp json: {e}")))?;

    let format = choose_format(&info.formats)
        .ok_or_else(|| PlaybackError::Resolve("no playable stream found".into()))?;

    Ok(ResolvedTrack {
        source_url,
        title: info.title,
        thumbnail: info.thumbnail,
        duration: info
            .duration
            .filter(|d| d.is_finite() && *d > 0.0)
            .map(Duration::from_secs_f64),
        stream_url: format.url.clone(),
        seek,
    })
}

/// Resolver que invoca `yt-dlp -J`
pub struct YtDlpResolver {
    binary: String,
}

impl YtDlpResolver {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Verifica que yt-dlp esté disponible
    pub async fn verify(&self) -> anyhow::Result<()> {
        let output = tokio::process::Command::new(&self.binary)
            .arg("--version")
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                info!("✅ yt-dlp versión: {}", version.trim());
                Ok(())
            }
            _ => {
                error!("❌ yt-dlp no encontrado. Instala con: pip install yt-dlp");
                anyhow::bail!("yt-dlp no disponible");
            }
        }
    }
}

#[async_trait]
impl TrackResolver for YtDlpResolver {
    async fn resolve(&self, url: &str) -> Result<ResolvedTrack> {
        let link = normalize_link(url)?;
        let seek = link_seek(&link);
        debug!("🔍 Resolviendo {}", link);

        let output = tokio::process::Command::new(&self.binary)
            .args([
                link.as_str(),
                "-J",
                "--no-playlist",
                "--geo-bypass",
                "--socket-timeout",
                "30",
                "-4",
            ])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| PlaybackError::Resolve(format!("error starting yt-dlp process: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PlaybackError::Resolve(
                stderr.lines().last().unwrap_or("yt-dlp failed").to_string(),
            ));
        }

        let track = parse_info(&output.stdout, link.to_string(), seek)?;
        info!("🎵 Resuelto: {} ({:?})", track.title, track.duration);
        Ok(track)
    }
}
