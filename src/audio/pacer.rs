//! StreamPacer: drains the frame buffer onto the voice sink at real-time rate.

use std::time::Duration;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    audio::frame::{FrameBuffer, FrameDuration, FrameItem},
    error::PlaybackError,
    voice::FrameSink,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacerConfig {
    pub frame: FrameDuration,
    /// Budget for both pulling a frame and handing it to the sink.
    pub send_timeout: Duration,
    /// Budget for the very first frame, while the transcoder is still
    /// opening the remote stream.
    pub startup_timeout: Duration,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            frame: FrameDuration::Ms20,
            send_timeout: Duration::from_secs(1),
            startup_timeout: Duration::from_secs(10),
        }
    }
}

/// Why the pacer loop returned.
#[derive(Debug, Clone, PartialEq)]
pub enum PacerExit {
    /// Pause or stop requested.
    Cancelled,
    /// The end-of-stream sentinel was read.
    EndOfStream,
    Failed(PlaybackError),
}

pub struct StreamPacer {
    buffer: FrameBuffer,
    sink: FrameSink,
    config: PacerConfig,
}

impl StreamPacer {
    pub fn new(buffer: FrameBuffer, sink: FrameSink, config: PacerConfig) -> Self {
        Self {
            buffer,
            sink,
            config,
        }
    }

    /// Emits one frame per tick until cancelled, the sentinel is read, or a
    /// budget is exceeded. `on_sent` runs after every frame the sink accepted.
    pub async fn run<F>(self, cancel: CancellationToken, mut on_sent: F) -> PacerExit
    where
        F: FnMut() + Send,
    {
        let mut ticker = interval(self.config.frame.as_duration());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut budget = self.config.startup_timeout.max(self.config.send_timeout);
        let mut sent = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return PacerExit::Cancelled,
                _ = ticker.tick() => {}
            }

            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return PacerExit::Cancelled,
                item = self.buffer.pop_timeout(budget) => item,
            };

            let frame = match item {
                Some(FrameItem::Frame(frame)) => frame,
                Some(FrameItem::End) => {
                    debug!("🏁 Pacer llegó al final tras {} frames", sent);
                    return PacerExit::EndOfStream;
                }
                None => {
                    warn!("⏳ Sin frames durante {:?}", budget);
                    return PacerExit::Failed(PlaybackError::Stall(budget));
                }
            };
            budget = self.config.send_timeout;

            // el envío no se cancela a medias: como mucho tarda send_timeout
            match timeout(self.config.send_timeout, self.sink.send_async(frame)).await {
                Ok(Ok(())) => {
                    sent += 1;
                    on_sent();
                }
                Ok(Err(_)) => {
                    return PacerExit::Failed(PlaybackError::Voice("voice sink closed".into()));
                }
                Err(_) => {
                    warn!("⏱️ El transporte de voz no aceptó el frame a tiempo");
                    return PacerExit::Failed(PlaybackError::TransportTimeout(
                        self.config.send_timeout,
                    ));
                }
            }
        }
    }
}
