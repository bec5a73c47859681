//! Opus frames and the bounded jitter buffer between the demuxer and the pacer.

use bytes::Bytes;
use std::time::Duration;

use crate::error::{PlaybackError, Result};

/// Frame lengths Opus accepts for voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameDuration {
    #[default]
    Ms20,
    Ms40,
    Ms60,
}

impl FrameDuration {
    pub fn from_millis(ms: u64) -> Result<Self> {
        match ms {
            20 => Ok(Self::Ms20),
            40 => Ok(Self::Ms40),
            60 => Ok(Self::Ms60),
            other => Err(PlaybackError::UserInput(format!(
                "frame duration must be 20, 40 or 60 ms, got {other}"
            ))),
        }
    }

    pub fn as_millis(&self) -> u64 {
        match self {
            Self::Ms20 => 20,
            Self::Ms40 => 40,
            Self::Ms60 => 60,
        }
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.as_millis())
    }

    /// Playback time covered by `frames` frames.
    pub fn elapsed(&self, frames: u64) -> Duration {
        Duration::from_millis(frames.saturating_mul(self.as_millis()))
    }

    /// Frames needed to hold `window` of audio, rounded up.
    pub fn frames_for(&self, window: Duration) -> usize {
        let ms = window.as_millis() as u64;
        ms.div_ceil(self.as_millis()).max(1) as usize
    }
}

/// One slot of the buffer: a payload, or the end-of-stream sentinel.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameItem {
    Frame(Bytes),
    End,
}

/// Bounded, ordered frame queue.
///
/// The producer blocks once `capacity` items are queued, which throttles the
/// transcoder to real-time pace; the consumer blocks while it is empty.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    tx: flume::Sender<FrameItem>,
    rx: flume::Receiver<FrameItem>,
    capacity: usize,
}

impl FrameBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = flume::bounded(capacity);
        Self { tx, rx, capacity }
    }

    /// Buffer sized for `window` worth of audio: `ceil(window / frame)`.
    pub fn for_window(window: Duration, frame: FrameDuration) -> Self {
        Self::with_capacity(frame.frames_for(window))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Waits for room, then enqueues. Both ends are held by the buffer so the
    /// channel never disconnects while the buffer is alive.
    pub async fn push(&self, item: FrameItem) {
        let _ = self.tx.send_async(item).await;
    }

    pub fn try_push(&self, item: FrameItem) -> bool {
        self.tx.try_send(item).is_ok()
    }

    /// Waits for the next item.
    pub async fn pop(&self) -> FrameItem {
        self.rx.recv_async().await.unwrap_or(FrameItem::End)
    }

    /// Like [`pop`](Self::pop) but gives up after `budget`.
    pub async fn pop_timeout(&self, budget: Duration) -> Option<FrameItem> {
        tokio::time::timeout(budget, self.pop()).await.ok()
    }

    /// Discards everything queued, returning how many items were dropped.
    pub fn drain(&self) -> usize {
        self.rx.drain().count()
    }
}
