//! # Audio Module
//!
//! Real-time Opus delivery for per-guild music queues.
//!
//! ## Architecture
//!
//! ```text
//! registry ──▶ queue ──▶ session ──▶ source (ffmpeg + ogg demux)
//!                           │            │
//!                           │            ▼
//!                           └──▶ pacer ◀── frame buffer
//!                                  │
//!                                  ▼
//!                            voice transport
//! ```
//!
//! ### [`source`] - Frame Source
//! - Spawns the transcoder through [`ffmpeg::Transcoder`]
//! - Demuxes Ogg pages into one Opus packet per frame ([`ogg`])
//! - Logs stderr, reaps the process, reports how the stream ended
//!
//! ### [`frame`] - Frame Buffer
//! - Bounded channel holding ~15s of frames; producer blocks when full
//!
//! ### [`pacer`] - Stream Pacer
//! - One frame per tick to the voice sink, with stall and send timeouts
//!
//! ### [`session`] - Encoder Session
//! - Start/stop/pause/volume state machine with a teardown barrier
//!
//! ### [`queue`] / [`registry`]
//! - Per-guild track queue with loop, restart, replay and idle disconnect
//! - One queue per guild, created lazily
//!
//! ## Audio Quality
//!
//! - **Sample Rate**: 48kHz (Discord standard)
//! - **Channels**: Stereo (2 channels)
//! - **Encoding**: Opus at 64kbps by default, 20ms frames

pub mod ffmpeg;
pub mod frame;
pub mod ogg;
pub mod pacer;
pub mod queue;
pub mod registry;
pub mod session;
pub mod source;
