//! FrameSource: one transcoder process plus the two readers draining it.

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    audio::{
        ffmpeg::{EncodeArgs, ProcessExit, Transcoder},
        frame::{FrameBuffer, FrameItem},
        ogg::{OggPacketReader, OggReaderOptions},
    },
    error::{PlaybackError, Result},
};

/// Packets dropped at the start of every stream (OpusHead and OpusTags).
pub const LEADING_PACKETS: usize = 2;

/// How a FrameSource ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceOutcome {
    /// Output ended naturally and the sentinel was queued.
    Finished { frames: u64 },
    /// Torn down through [`FrameSource::cancel`].
    Cancelled,
    Failed(PlaybackError),
}

/// A running transcoder feeding a [`FrameBuffer`].
///
/// Three tasks run per source: the stdout demuxer, the stderr logger and a
/// waiter that owns the process. Cancelling the token kills the process and
/// makes both readers return; when a reader returns it drops its pipe, so a
/// read that is parked inside the demuxer is never left dangling.
pub struct FrameSource {
    cancel: CancellationToken,
    waiter: Option<JoinHandle<SourceOutcome>>,
    outcome: Option<SourceOutcome>,
}

impl FrameSource {
    pub fn start(
        transcoder: &dyn Transcoder,
        url: &str,
        args: &EncodeArgs,
        buffer: FrameBuffer,
    ) -> Result<Self> {
        let process = transcoder.spawn(url, args)?;
        let cancel = CancellationToken::new();

        let demux = tokio::spawn(demux_stdout(process.stdout, buffer, cancel.clone()));
        let logger = process
            .stderr
            .map(|stderr| tokio::spawn(log_stderr(stderr, cancel.clone())));

        let mut handle = process.handle;
        let token = cancel.clone();
        let waiter = tokio::spawn(async move {
            let status = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                status = handle.wait() => Some(status),
            };

            if status.is_none() {
                if let Err(e) = handle.kill().await {
                    warn!("⚠️ No se pudo matar el transcoder: {}", e);
                }
            }

            let demuxed = match demux.await {
                Ok(result) => result,
                Err(e) => Err(PlaybackError::Stream(format!("demux task failed: {e}"))),
            };
            if let Some(logger) = logger {
                let _ = logger.await;
            }

            if token.is_cancelled() {
                return SourceOutcome::Cancelled;
            }

            match (demuxed, status) {
                (Err(e), _) => SourceOutcome::Failed(e),
                (Ok(_), Some(Err(e))) => {
                    SourceOutcome::Failed(PlaybackError::Stream(format!("ffmpeg wait failed: {e}")))
                }
                (Ok(_), Some(Ok(ProcessExit::Failed(code)))) => {
                    SourceOutcome::Failed(PlaybackError::Stream(format!("ffmpeg error: {code}")))
                }
                (Ok(frames), _) => SourceOutcome::Finished { frames },
            }
        });

        Ok(Self {
            cancel,
            waiter: Some(waiter),
            outcome: None,
        })
    }

    /// Signals teardown. Returns immediately; pair with [`finish`](Self::finish).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some() || self.waiter.as_ref().is_some_and(|w| w.is_finished())
    }

    /// True once [`wait`](Self::wait) has observed the outcome.
    pub fn is_settled(&self) -> bool {
        self.outcome.is_some()
    }

    /// Waits until the process is reaped and both readers have exited.
    ///
    /// Cancel-safe: dropping the future leaves the source untouched, and
    /// later calls return the same outcome.
    pub async fn wait(&mut self) -> SourceOutcome {
        if let Some(waiter) = self.waiter.as_mut() {
            let outcome = match waiter.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("❌ Tarea del transcoder abortada: {}", e);
                    SourceOutcome::Failed(PlaybackError::Stream(format!("source task failed: {e}")))
                }
            };
            self.waiter = None;
            self.outcome = Some(outcome);
        }
        self.outcome.clone().unwrap_or(SourceOutcome::Cancelled)
    }

    pub async fn finish(mut self) -> SourceOutcome {
        self.wait().await
    }
}

async fn demux_stdout(
    stdout: Box<dyn AsyncRead + Send + Unpin>,
    buffer: FrameBuffer,
    cancel: CancellationToken,
) -> Result<u64> {
    let mut reader = OggPacketReader::new(stdout, OggReaderOptions::default());
    let mut skip = LEADING_PACKETS;
    let mut frames = 0u64;

    loop {
        let packet = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(frames),
            packet = reader.next_packet() => packet?,
        };

        let Some(packet) = packet else {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = buffer.push(FrameItem::End) => {}
            }
            debug!("📭 Fin de stream tras {} frames", frames);
            return Ok(frames);
        };

        if skip > 0 {
            skip -= 1;
            continue;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(frames),
            _ = buffer.push(FrameItem::Frame(packet)) => frames += 1,
        }
    }
}

async fn log_stderr(stderr: Box<dyn AsyncRead + Send + Unpin>, cancel: CancellationToken) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) if !line.trim().is_empty() => warn!("[ffmpeg] {}", line),
            Ok(Some(_)) => {}
            Ok(None) => return,
            Err(e) => {
                debug!("stderr del transcoder cerrado: {}", e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedTranscoder, StreamScript};
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[tokio::test]
    async fn test_leading_packets_are_dropped_and_sentinel_is_last() {
        let transcoder = ScriptedTranscoder::new(StreamScript::frames(3));
        let buffer = FrameBuffer::with_capacity(16);
        let source =
            FrameSource::start(&transcoder, "track", &EncodeArgs::default(), buffer.clone()).unwrap();

        assert_eq!(source.finish().await, SourceOutcome::Finished { frames: 3 });
        assert_eq!(buffer.pop().await, FrameItem::Frame(Bytes::from_static(&[0, 0, 0, 0])));
        assert_eq!(buffer.pop().await, FrameItem::Frame(Bytes::from_static(&[0, 0, 0, 1])));
        assert_eq!(buffer.pop().await, FrameItem::Frame(Bytes::from_static(&[0, 0, 0, 2])));
        assert_eq!(buffer.pop().await, FrameItem::End);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_unblocks_reader_parked_on_pipe() {
        // el proceso nunca escribe más allá de los 2 frames y nunca sale
        let transcoder = ScriptedTranscoder::new(StreamScript::frames(2).hang());
        let buffer = FrameBuffer::with_capacity(16);
        let source =
            FrameSource::start(&transcoder, "track", &EncodeArgs::default(), buffer.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!source.is_finished());
        assert_eq!(buffer.len(), 2);

        source.cancel();
        assert_eq!(source.finish().await, SourceOutcome::Cancelled);
        assert_eq!(transcoder.kills(), 1);
        assert_eq!(transcoder.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_unblocks_producer_on_full_buffer() {
        let transcoder = ScriptedTranscoder::new(StreamScript::frames(50));
        let buffer = FrameBuffer::with_capacity(4);
        let source =
            FrameSource::start(&transcoder, "track", &EncodeArgs::default(), buffer.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(buffer.len(), 4);

        source.cancel();
        assert_eq!(source.finish().await, SourceOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_failed_exit_is_stream_error() {
        let transcoder = ScriptedTranscoder::new(StreamScript::frames(0).exit_with_failure());
        let buffer = FrameBuffer::with_capacity(4);
        let source =
            FrameSource::start(&transcoder, "bad-url", &EncodeArgs::default(), buffer).unwrap();
        assert!(matches!(
            source.finish().await,
            SourceOutcome::Failed(PlaybackError::Stream(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_container_is_stream_error() {
        let transcoder = ScriptedTranscoder::new(StreamScript::frames(1).corrupt_tail());
        let buffer = FrameBuffer::with_capacity(8);
        let source =
            FrameSource::start(&transcoder, "track", &EncodeArgs::default(), buffer).unwrap();
        assert!(matches!(
            source.finish().await,
            SourceOutcome::Failed(PlaybackError::Stream(_))
        ));
    }

    #[test]
    fn test_spawn_failure_is_returned() {
        let transcoder = ScriptedTranscoder::failing_spawn();
        let buffer = FrameBuffer::with_capacity(4);
        let err = FrameSource::start(&transcoder, "x", &EncodeArgs::default(), buffer)
            .err()
            .unwrap();
        assert!(matches!(err, PlaybackError::Spawn(_)));
    }
}
