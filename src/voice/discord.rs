//! Discord voice through songbird.
//!
//! Every join plays one live input per call: a DCA stream read from the
//! link's frame channel, so the Opus packets the pacer emits reach the
//! call without being decoded and re-encoded.

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use serenity::{
    http::Http,
    model::id::{ChannelId, GuildId},
};
use songbird::{
    driver::Bitrate,
    error::JoinError,
    input::{AudioStream, Input, LiveInput},
    Songbird,
};
use std::{
    io::{self, Read, Seek, SeekFrom},
    sync::Arc,
    time::Duration,
};
use symphonia::core::{io::MediaSource, probe::Hint};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    audio::frame::FrameDuration,
    error::{PlaybackError, Result},
    voice::{dca_record, VoiceLink, VoiceTransport},
};

const MIN_BITRATE: u32 = 8_000;
const MAX_BITRATE: u32 = 510_000;

/// Frames queued between the pacer and songbird's mixer.
const FRAME_QUEUE: usize = 50;

/// Opus packet Discord treats as silence.
const SILENCE: [u8; 3] = [0xF8, 0xFF, 0xFE];

/// Voice transport backed by a songbird manager registered on the gateway
/// client.
pub struct DiscordVoiceTransport {
    manager: Arc<Songbird>,
    http: Arc<Http>,
    default_bitrate: u32,
    frame: FrameDuration,
    streams: DashMap<GuildId, CancellationToken>,
}

impl DiscordVoiceTransport {
    pub fn new(manager: Arc<Songbird>, http: Arc<Http>, default_bitrate: u32, frame: FrameDuration) -> Self {
        Self {
            manager,
            http,
            default_bitrate,
            frame,
            streams: DashMap::new(),
        }
    }

    /// The channel's configured bitrate, or the default when Discord does not
    /// report one.
    async fn channel_bitrate(&self, channel: ChannelId) -> u32 {
        match self.http.get_channel(channel).await {
            Ok(found) => found
                .guild()
                .and_then(|channel| channel.bitrate)
                .map(|bitrate| bitrate.clamp(MIN_BITRATE, MAX_BITRATE))
                .unwrap_or(self.default_bitrate),
            Err(e) => {
                debug!("No se pudo leer el bitrate de {}: {}", channel, e);
                self.default_bitrate
            }
        }
    }
}

#[async_trait]
impl VoiceTransport for DiscordVoiceTransport {
    async fn join(&self, guild: GuildId, channel: ChannelId) -> Result<VoiceLink> {
        let call = self
            .manager
            .join(guild, channel)
            .await
            .map_err(|e| PlaybackError::Voice(format!("joining {channel}: {e}")))?;
        let bitrate = self.channel_bitrate(channel).await;

        let (sink, frames) = flume::bounded(FRAME_QUEUE);
        let closed = CancellationToken::new();
        let stream = FrameStream::new(
            frames,
            closed.clone(),
            dca_header(bitrate, self.frame)?,
            self.frame.as_duration() * 5,
        );

        let mut hint = Hint::new();
        hint.with_extension("dca");
        let input = Input::Live(
            LiveInput::Raw(AudioStream {
                input: Box::new(stream) as Box<dyn MediaSource>,
                hint: Some(hint),
            }),
            None,
        );

        {
            let mut call = call.lock().await;
            call.set_bitrate(Bitrate::BitsPerSecond(bitrate as i32));
            call.play_only_input(input);
        }
        if let Some(previous) = self.streams.insert(guild, closed) {
            previous.cancel();
        }

        info!("🔊 Conectado a canal {} en guild {} ({} bps)", channel, guild, bitrate);
        Ok(VoiceLink {
            guild,
            channel,
            sink,
            bitrate,
        })
    }

    async fn disconnect(&self, guild: GuildId) -> Result<()> {
        if let Some((_, closed)) = self.streams.remove(&guild) {
            closed.cancel();
        }
        match self.manager.remove(guild).await {
            Ok(()) => {
                info!("👋 Desconectado del canal de voz en guild {}", guild);
                Ok(())
            }
            Err(JoinError::NoCall) => Ok(()),
            Err(e) => {
                warn!("⚠️ Error al salir de voz en guild {}: {}", guild, e);
                Err(PlaybackError::Voice(e.to_string()))
            }
        }
    }
}

/// DCA1 magic, metadata length and the JSON metadata songbird's DCA reader
/// expects before the first record.
fn dca_header(bitrate: u32, frame: FrameDuration) -> Result<Bytes> {
    let metadata = serde_json::json!({
        "dca": {
            "version": 1,
            "tool": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
                "url": null,
                "author": null,
            },
        },
        "opus": {
            "mode": "music",
            "sample_rate": 48_000,
            "frame_size": 48 * frame.as_millis(),
            "abr": bitrate,
            "vbr": true,
            "channels": 2,
        },
        "info": null,
        "origin": null,
        "extra": null,
    });
    let json = serde_json::to_vec(&metadata)
        .map_err(|e| PlaybackError::Voice(format!("DCA metadata: {e}")))?;
    let len = i32::try_from(json.len())
        .map_err(|_| PlaybackError::Voice("DCA metadata too large".into()))?;

    let mut header = BytesMut::with_capacity(8 + json.len());
    header.put_slice(b"DCA1");
    header.put_i32_le(len);
    header.put_slice(&json);
    Ok(header.freeze())
}

/// Blocking reader over a link's frame channel, rendered as a DCA stream.
///
/// Read on songbird's mixer thread. When no frame arrives within `gap`
/// (paused, between tracks) a silence packet keeps the mixer moving. Ends
/// once the link is closed or every sender is gone.
struct FrameStream {
    frames: flume::Receiver<Bytes>,
    closed: CancellationToken,
    pending: Bytes,
    gap: Duration,
}

impl FrameStream {
    fn new(frames: flume::Receiver<Bytes>, closed: CancellationToken, header: Bytes, gap: Duration) -> Self {
        Self {
            frames,
            closed,
            pending: header,
            gap,
        }
    }

    fn refill(&mut self) -> io::Result<bool> {
        if self.closed.is_cancelled() {
            return Ok(false);
        }
        let frame = match self.frames.recv_timeout(self.gap) {
            Ok(frame) => frame,
            Err(flume::RecvTimeoutError::Timeout) => Bytes::from_static(&SILENCE),
            Err(flume::RecvTimeoutError::Disconnected) => return Ok(false),
        };
        self.pending = dca_record(&frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        Ok(true)
    }
}

impl Read for FrameStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pending.is_empty() && !self.refill()? {
            return Ok(0);
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        Ok(n)
    }
}

impl Seek for FrameStream {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "live frame stream"))
    }
}

impl MediaSource for FrameStream {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn stream(frames: flume::Receiver<Bytes>, closed: CancellationToken) -> FrameStream {
        let header = dca_header(64_000, FrameDuration::Ms20).unwrap();
        FrameStream::new(frames, closed, header, Duration::from_millis(10))
    }

    fn split_header(bytes: &[u8]) -> (serde_json::Value, &[u8]) {
        assert_eq!(&bytes[..4], b"DCA1");
        let len = i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        let metadata = serde_json::from_slice(&bytes[8..8 + len]).unwrap();
        (metadata, &bytes[8 + len..])
    }

    #[test]
    fn test_stream_is_header_then_records() {
        let (sink, frames) = flume::unbounded();
        sink.send(Bytes::from_static(b"ab")).unwrap();
        sink.send(Bytes::from_static(b"c")).unwrap();
        drop(sink);

        let mut out = Vec::new();
        stream(frames, CancellationToken::new()).read_to_end(&mut out).unwrap();

        let (metadata, records) = split_header(&out);
        assert_eq!(metadata["opus"]["frame_size"], 960);
        assert_eq!(metadata["opus"]["sample_rate"], 48_000);
        assert_eq!(metadata["dca"]["version"], 1);
        assert_eq!(records, &[2, 0, b'a', b'b', 1, 0, b'c']);
    }

    #[test]
    fn test_gap_is_filled_with_silence() {
        let (_sink, frames) = flume::unbounded::<Bytes>();
        let mut stream = stream(frames, CancellationToken::new());

        let mut header = vec![0u8; stream.pending.len()];
        stream.read_exact(&mut header).unwrap();
        let mut record = [0u8; 5];
        stream.read_exact(&mut record).unwrap();
        assert_eq!(record, [3, 0, 0xF8, 0xFF, 0xFE]);
    }

    #[test]
    fn test_closed_link_ends_stream() {
        let (_sink, frames) = flume::unbounded::<Bytes>();
        let closed = CancellationToken::new();
        let mut stream = stream(frames, closed.clone());

        let mut header = vec![0u8; stream.pending.len()];
        stream.read_exact(&mut header).unwrap();
        closed.cancel();
        assert_eq!(stream.read(&mut [0u8; 16]).unwrap(), 0);
        assert!(stream.seek(SeekFrom::Start(0)).is_err());
    }
}
