//! # voice-relay
//!
//! Real-time audio delivery for a Discord music bot: resolves links with
//! yt-dlp, transcodes them with ffmpeg to Opus, buffers against jitter and
//! paces frames onto a voice transport, one queue per guild.

pub mod audio;
pub mod bot;
pub mod config;
pub mod error;
pub mod messaging;
pub mod sources;
pub mod storage;
pub mod ui;
pub mod voice;

#[cfg(test)]
mod test_support;
