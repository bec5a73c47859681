//! Outbound voice transport.
//!
//! The playback engine only needs a sink that accepts one encoded frame at a
//! time; who carries those frames to listeners is the transport's business.
//! [`discord::DiscordVoiceTransport`] hands them to a songbird call;
//! [`DcaFileTransport`] records them for offline runs.

pub mod discord;

pub use discord::DiscordVoiceTransport;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use serenity::model::id::{ChannelId, GuildId};
use std::path::PathBuf;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt, BufWriter},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{PlaybackError, Result};

/// Accepts one Opus frame per send, in playback order.
pub type FrameSink = flume::Sender<Bytes>;

/// A joined voice channel.
#[derive(Debug, Clone)]
pub struct VoiceLink {
    pub guild: GuildId,
    pub channel: ChannelId,
    pub sink: FrameSink,
    /// Bitrate the channel is configured for, in bits per second.
    pub bitrate: u32,
}

impl VoiceLink {
    /// False once the transport dropped the receiving side.
    pub fn is_connected(&self) -> bool {
        !self.sink.is_disconnected()
    }
}

#[async_trait]
pub trait VoiceTransport: Send + Sync {
    async fn join(&self, guild: GuildId, channel: ChannelId) -> Result<VoiceLink>;

    /// Leaves the guild's voice channel. Leaving when not joined is a no-op.
    async fn disconnect(&self, guild: GuildId) -> Result<()>;
}

/// Where [`DcaFileTransport`] writes frames.
#[derive(Debug, Clone)]
pub enum DcaTarget {
    /// One `guild_{id}.dca` file per guild inside the directory.
    Directory(PathBuf),
    Stdout,
}

struct Writer {
    channel: ChannelId,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Transport that records frames as DCA: every frame is a little-endian
/// `u16` length followed by the raw Opus payload.
pub struct DcaFileTransport {
    target: DcaTarget,
    bitrate: u32,
    queue_frames: usize,
    writers: DashMap<GuildId, Writer>,
}

impl DcaFileTransport {
    pub fn new(target: DcaTarget, bitrate: u32) -> Self {
        Self {
            target,
            bitrate,
            queue_frames: 50,
            writers: DashMap::new(),
        }
    }

    async fn open(&self, guild: GuildId) -> Result<Box<dyn AsyncWrite + Send + Unpin>> {
        match &self.target {
            DcaTarget::Stdout => Ok(Box::new(tokio::io::stdout())),
            DcaTarget::Directory(dir) => {
                tokio::fs::create_dir_all(dir)
                    .await
                    .map_err(|e| PlaybackError::Voice(format!("creating {}: {e}", dir.display())))?;
                let path = dir.join(format!("guild_{guild}.dca"));
                let file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .await
                    .map_err(|e| PlaybackError::Voice(format!("opening {}: {e}", path.display())))?;
                info!("📼 Grabando audio de guild {} en {}", guild, path.display());
                Ok(Box::new(file))
            }
        }
    }
}

/// Encodes one DCA record.
pub fn dca_record(frame: &[u8]) -> Result<Bytes> {
    let len = u16::try_from(frame.len())
        .map_err(|_| PlaybackError::Stream(format!("frame too large for DCA: {} bytes", frame.len())))?;
    let mut record = BytesMut::with_capacity(2 + frame.len());
    record.put_u16_le(len);
    record.put_slice(frame);
    Ok(record.freeze())
}

async fn write_frames(
    output: Box<dyn AsyncWrite + Send + Unpin>,
    frames: flume::Receiver<Bytes>,
    cancel: CancellationToken,
) {
    let mut output = BufWriter::new(output);
    let mut written = 0u64;

    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = frames.recv_async() => match frame {
                Ok(frame) => frame,
                Err(_) => break,
            },
        };

        let record = match dca_record(&frame) {
            Ok(record) => record,
            Err(e) => {
                warn!("⚠️ Frame descartado: {}", e);
                continue;
            }
        };
        if let Err(e) = output.write_all(&record).await {
            error!("❌ Error escribiendo DCA: {}", e);
            break;
        }
        written += 1;

        // un flush por segundo de audio a 20ms
        if written % 50 == 0 {
            let _ = output.flush().await;
        }
    }

    let _ = output.flush().await;
    debug!("📼 Escritor DCA cerrado tras {} frames", written);
}

#[async_trait]
impl VoiceTransport for DcaFileTransport {
    async fn join(&self, guild: GuildId, channel: ChannelId) -> Result<VoiceLink> {
        self.disconnect(guild).await?;

        let output = self.open(guild).await?;
        let (sink, frames) = flume::bounded(self.queue_frames);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(write_frames(output, frames, cancel.clone()));

        self.writers.insert(
            guild,
            Writer {
                channel,
                cancel,
                task,
            },
        );
        info!("🔊 Conectado a canal {} en guild {}", channel, guild);

        Ok(VoiceLink {
            guild,
            channel,
            sink,
            bitrate: self.bitrate,
        })
    }

    async fn disconnect(&self, guild: GuildId) -> Result<()> {
        if let Some((_, writer)) = self.writers.remove(&guild) {
            writer.cancel.cancel();
            if let Err(e) = writer.task.await {
                warn!("⚠️ Escritor DCA terminó con error: {}", e);
            }
            info!("👋 Desconectado de canal {} en guild {}", writer.channel, guild);
        }
        Ok(())
    }
}
