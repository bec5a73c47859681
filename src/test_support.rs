//! In-memory collaborators for tests: a scripted transcoder, a recording
//! voice transport and a recording messenger.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serenity::model::{
    channel::ReactionType,
    id::{ChannelId, GuildId, MessageId, UserId},
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{io::AsyncWriteExt, sync::oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    audio::{
        ffmpeg::{EncodeArgs, ProcessExit, ProcessHandle, Transcoder, TranscoderProcess},
        ogg::encode_page,
    },
    error::{PlaybackError, Result},
    messaging::{Messenger, Notice},
    storage::{GuildSettings, SettingsStore},
    voice::{VoiceLink, VoiceTransport},
};

const SERIAL: u32 = 0x5eed;

/// What a scripted process writes and how it ends.
#[derive(Debug, Clone)]
pub struct StreamScript {
    frames: u32,
    hang: bool,
    fail_exit: bool,
    corrupt_tail: bool,
}

impl StreamScript {
    /// OpusHead, OpusTags, then `frames` packets whose payload is the
    /// big-endian frame index.
    pub fn frames(frames: u32) -> Self {
        Self {
            frames,
            hang: false,
            fail_exit: false,
            corrupt_tail: false,
        }
    }

    /// Frames of audio covering `length` at 20 ms per frame.
    pub fn lasting(length: Duration) -> Self {
        Self::frames((length.as_millis() / 20) as u32)
    }

    /// Keep stdout open and never exit until killed.
    pub fn hang(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn exit_with_failure(mut self) -> Self {
        self.fail_exit = true;
        self
    }

    pub fn corrupt_tail(mut self) -> Self {
        self.corrupt_tail = true;
        self
    }

    fn render(&self) -> Vec<u8> {
        let mut out = encode_page(SERIAL, 0, 0x02, &[b"OpusHead"]);
        out.extend(encode_page(SERIAL, 1, 0, &[b"OpusTags"]));
        for i in 0..self.frames {
            out.extend(encode_page(SERIAL, i + 2, 0, &[&i.to_be_bytes()]));
        }
        if self.corrupt_tail {
            out.extend_from_slice(b"definitely not an ogg page, just noise");
        }
        out
    }
}

#[derive(Default)]
struct Counters {
    attempts: AtomicUsize,
    spawns: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    kills: AtomicUsize,
}

impl Counters {
    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Transcoder that writes a fixed script into an in-memory pipe.
pub struct ScriptedTranscoder {
    script: Mutex<StreamScript>,
    fail_spawn: bool,
    counters: Arc<Counters>,
    calls: Mutex<Vec<(String, EncodeArgs)>>,
}

impl ScriptedTranscoder {
    pub fn new(script: StreamScript) -> Self {
        Self {
            script: Mutex::new(script),
            fail_spawn: false,
            counters: Arc::default(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_spawn() -> Self {
        Self {
            fail_spawn: true,
            ..Self::new(StreamScript::frames(0))
        }
    }

    /// Script used by subsequent spawns.
    pub fn set_script(&self, script: StreamScript) {
        *self.script.lock() = script;
    }

    /// Spawn calls, failed ones included.
    pub fn attempts(&self) -> usize {
        self.counters.attempts.load(Ordering::SeqCst)
    }

    pub fn spawns(&self) -> usize {
        self.counters.spawns.load(Ordering::SeqCst)
    }

    /// Processes spawned and not yet reaped.
    pub fn active(&self) -> usize {
        self.counters.active.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.counters.max_active.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.counters.kills.load(Ordering::SeqCst)
    }

    /// (url, args) of every spawn, oldest first.
    pub fn calls(&self) -> Vec<(String, EncodeArgs)> {
        self.calls.lock().clone()
    }

    pub fn last_seek(&self) -> Option<Duration> {
        self.calls.lock().last().map(|(_, args)| args.seek)
    }
}

impl Transcoder for ScriptedTranscoder {
    fn spawn(&self, url: &str, args: &EncodeArgs) -> Result<TranscoderProcess> {
        self.counters.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_spawn {
            return Err(PlaybackError::Spawn("no such file or directory".into()));
        }
        self.calls.lock().push((url.to_string(), args.clone()));
        self.counters.spawns.fetch_add(1, Ordering::SeqCst);
        self.counters.enter();

        let script = self.script.lock().clone();
        let bytes = script.render();
        let (mut writer, reader) = tokio::io::duplex(bytes.len() + 64);
        let killed = CancellationToken::new();
        let (exit_tx, exit_rx) = oneshot::channel();

        let token = killed.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                written = writer.write_all(&bytes) => {
                    if written.is_err() {
                        return;
                    }
                }
            }
            if script.hang {
                token.cancelled().await;
                return;
            }
            drop(writer);
            let exit = if script.fail_exit {
                ProcessExit::Failed("exit status: 1".into())
            } else {
                ProcessExit::Success
            };
            let _ = exit_tx.send(exit);
        });

        Ok(TranscoderProcess {
            stdout: Box::new(reader),
            stderr: None,
            handle: Box::new(ScriptedHandle {
                exit: Some(exit_rx),
                killed,
                counters: self.counters.clone(),
                reaped: false,
            }),
        })
    }
}

struct ScriptedHandle {
    exit: Option<oneshot::Receiver<ProcessExit>>,
    killed: CancellationToken,
    counters: Arc<Counters>,
    reaped: bool,
}

impl ScriptedHandle {
    fn reap(&mut self) {
        if !self.reaped {
            self.reaped = true;
            self.counters.leave();
        }
    }
}

#[async_trait]
impl ProcessHandle for ScriptedHandle {
    async fn wait(&mut self) -> std::io::Result<ProcessExit> {
        let exit = match self.exit.as_mut() {
            Some(exit) => tokio::select! {
                status = exit => status.unwrap_or(ProcessExit::Failed("signal: 9".into())),
                _ = self.killed.cancelled() => ProcessExit::Failed("signal: 9".into()),
            },
            None => ProcessExit::Failed("signal: 9".into()),
        };
        self.exit = None;
        self.reap();
        Ok(exit)
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        if !self.reaped {
            self.counters.kills.fetch_add(1, Ordering::SeqCst);
        }
        self.killed.cancel();
        self.exit = None;
        self.reap();
        Ok(())
    }
}

impl Drop for ScriptedHandle {
    fn drop(&mut self) {
        self.killed.cancel();
        self.reap();
    }
}

/// Voice transport that keeps every frame it is handed.
#[derive(Default)]
pub struct MemoryTransport {
    frames: Arc<Mutex<Vec<Bytes>>>,
    joins: AtomicUsize,
    disconnects: AtomicUsize,
    fail_join: bool,
    stalled: bool,
    links: Mutex<HashMap<GuildId, (flume::Receiver<Bytes>, CancellationToken)>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sinks that never accept a frame.
    pub fn stalled() -> Self {
        Self {
            stalled: true,
            ..Self::default()
        }
    }

    pub fn failing_join() -> Self {
        Self {
            fail_join: true,
            ..Self::default()
        }
    }

    pub fn joins(&self) -> usize {
        self.joins.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Frames received so far, across every join.
    pub fn frames(&self) -> Vec<Bytes> {
        self.frames.lock().clone()
    }

    /// Frame payloads decoded back to the scripted indices.
    pub fn frame_indices(&self) -> Vec<u32> {
        self.frames()
            .iter()
            .filter_map(|f| <[u8; 4]>::try_from(f.as_ref()).ok())
            .map(u32::from_be_bytes)
            .collect()
    }
}

#[async_trait]
impl VoiceTransport for MemoryTransport {
    async fn join(&self, guild: GuildId, channel: ChannelId) -> Result<VoiceLink> {
        self.joins.fetch_add(1, Ordering::SeqCst);
        if self.fail_join {
            return Err(PlaybackError::Voice("missing permissions".into()));
        }

        let (sink, rx) = if self.stalled {
            flume::bounded(0)
        } else {
            flume::unbounded()
        };

        let closed = CancellationToken::new();
        if !self.stalled {
            let frames = self.frames.clone();
            let rx = rx.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = closed.cancelled() => return,
                        frame = rx.recv_async() => match frame {
                            Ok(frame) => frames.lock().push(frame),
                            Err(_) => return,
                        },
                    }
                }
            });
        }
        if let Some((_, previous)) = self.links.lock().insert(guild, (rx, closed)) {
            previous.cancel();
        }

        Ok(VoiceLink {
            guild,
            channel,
            sink,
            bitrate: 64_000,
        })
    }

    async fn disconnect(&self, guild: GuildId) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        if let Some((_, closed)) = self.links.lock().remove(&guild) {
            closed.cancel();
        }
        Ok(())
    }
}

/// Messenger that records every call.
#[derive(Default)]
pub struct RecordingMessenger {
    next_id: AtomicUsize,
    sent: Mutex<Vec<(ChannelId, Notice)>>,
    edits: Mutex<Vec<(MessageId, Notice)>>,
    deleted: Mutex<Vec<MessageId>>,
    reactions: Mutex<Vec<ReactionCall>>,
}

/// A reaction call seen by [`RecordingMessenger`].
#[derive(Debug, Clone, PartialEq)]
pub enum ReactionCall {
    Add(MessageId, String),
    Remove(MessageId, UserId, String),
    Clear(MessageId),
}

fn unicode(emoji: ReactionType) -> String {
    match emoji {
        ReactionType::Unicode(emoji) => emoji,
        other => other.to_string(),
    }
}

impl RecordingMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(ChannelId, Notice)> {
        self.sent.lock().clone()
    }

    pub fn sent_titles(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(_, n)| n.title.clone()).collect()
    }

    pub fn edits(&self) -> Vec<(MessageId, Notice)> {
        self.edits.lock().clone()
    }

    pub fn deleted(&self) -> Vec<MessageId> {
        self.deleted.lock().clone()
    }

    pub fn reactions(&self) -> Vec<ReactionCall> {
        self.reactions.lock().clone()
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn send(&self, channel: ChannelId, notice: Notice) -> Result<MessageId> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) as u64 + 1;
        self.sent.lock().push((channel, notice));
        Ok(MessageId::new(id))
    }

    async fn edit(&self, _channel: ChannelId, message: MessageId, notice: Notice) -> Result<()> {
        self.edits.lock().push((message, notice));
        Ok(())
    }

    async fn delete(&self, _channel: ChannelId, message: MessageId) -> Result<()> {
        self.deleted.lock().push(message);
        Ok(())
    }

    async fn react(&self, _channel: ChannelId, message: MessageId, emoji: ReactionType) -> Result<()> {
        self.reactions.lock().push(ReactionCall::Add(message, unicode(emoji)));
        Ok(())
    }

    async fn unreact(
        &self,
        _channel: ChannelId,
        message: MessageId,
        user: UserId,
        emoji: ReactionType,
    ) -> Result<()> {
        self.reactions
            .lock()
            .push(ReactionCall::Remove(message, user, unicode(emoji)));
        Ok(())
    }

    async fn clear_reactions(&self, _channel: ChannelId, message: MessageId) -> Result<()> {
        self.reactions.lock().push(ReactionCall::Clear(message));
        Ok(())
    }
}

/// Settings kept in a map.
#[derive(Default)]
pub struct MemorySettings {
    guilds: Mutex<HashMap<GuildId, GuildSettings>>,
}

#[async_trait]
impl SettingsStore for MemorySettings {
    async fn get(&self, guild: GuildId) -> Result<GuildSettings> {
        Ok(self.guilds.lock().get(&guild).cloned().unwrap_or_default())
    }

    async fn set(&self, guild: GuildId, settings: GuildSettings) -> Result<()> {
        self.guilds.lock().insert(guild, settings);
        Ok(())
    }
}

/// Lets spawned tasks run without advancing a paused clock.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
