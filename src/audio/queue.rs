use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId, MessageId, UserId};
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::{
    audio::{
        registry::PlayerContext,
        session::{clamp_volume, Completion, EncoderSession, SessionConfig, StartRequest, TrackEnd},
    },
    error::{PlaybackError, Result},
    messaging::notify_temp,
    sources::ResolvedTrack,
    ui::{buttons::ButtonBoard, panel},
    voice::VoiceLink,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub source_url: String,
    pub title: String,
    pub thumbnail: Option<String>,
    pub stream_url: String,
    pub duration: Option<Duration>,
    pub requested_by: UserId,
    /// Where playback starts; overwritten by restart, replay and loop.
    pub seek: Duration,
    pub added_at: DateTime<Utc>,
}

impl Track {
    pub fn new(resolved: ResolvedTrack, requested_by: UserId) -> Self {
        Self {
            source_url: resolved.source_url,
            title: resolved.title,
            thumbnail: resolved.thumbnail,
            stream_url: resolved.stream_url,
            duration: resolved.duration,
            requested_by,
            seek: resolved.seek,
            added_at: Utc::now(),
        }
    }
}

/// Where a restart resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekRequest {
    /// Current playback position.
    Keep,
    At(Duration),
}

/// Result of a successful enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// The queue was idle and the track started.
    Started,
    /// Waiting behind the current track; 0 is the head.
    Queued { position: usize },
}

#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub current: Option<Track>,
    pub upcoming: Vec<Track>,
    pub playing: bool,
    pub paused: bool,
    pub looping: bool,
    pub position: Duration,
    pub volume: f64,
    pub total_duration: Duration,
}

#[derive(Debug, Default)]
struct QueueState {
    /// `tracks[0]` is the current track while playing.
    tracks: VecDeque<Track>,
    playing: bool,
    looping: bool,
    last_completed: Option<Track>,
    restart_pending: bool,
    seek_override: Duration,
    link: Option<VoiceLink>,
    voice_channel: Option<ChannelId>,
    text_channel: Option<ChannelId>,
    panel: Option<MessageId>,
    /// Reaction controls under `panel`.
    board: Option<ButtonBoard>,
    /// Bumped whenever playback starts or an idle timer is armed.
    idle_epoch: u64,
    /// Identifies the advance loop allowed to act; bumped on start and stop.
    generation: u64,
}

/// Per-guild queue driving one [`EncoderSession`].
///
/// Field updates happen under `state`. Operations that await (joining,
/// starting or stopping the session) are serialized by `ops`, which the
/// advance loop also takes before acting on a completion, so a command never
/// interleaves with a track change.
pub struct PlaybackQueue {
    guild: GuildId,
    ctx: PlayerContext,
    session: EncoderSession,
    state: Mutex<QueueState>,
    ops: tokio::sync::Mutex<()>,
}

impl PlaybackQueue {
    pub fn new(guild: GuildId, ctx: PlayerContext) -> Arc<Self> {
        let session = EncoderSession::new(ctx.transcoder.clone(), SessionConfig::from(&*ctx.config));
        Arc::new(Self {
            guild,
            ctx,
            session,
            state: Mutex::new(QueueState::default()),
            ops: tokio::sync::Mutex::new(()),
        })
    }

    pub fn guild(&self) -> GuildId {
        self.guild
    }

    pub fn session(&self) -> &EncoderSession {
        &self.session
    }

    /// Appends `track`. An idle queue joins `voice_channel` and starts it;
    /// a playing queue only accepts tracks for the channel it is in.
    pub async fn enqueue(
        self: &Arc<Self>,
        track: Track,
        voice_channel: ChannelId,
        text_channel: Option<ChannelId>,
    ) -> Result<Enqueued> {
        let _ops = self.ops.lock().await;
        {
            let mut st = self.state.lock();
            if st.tracks.len() >= self.ctx.config.max_queue_size {
                return Err(PlaybackError::UserInput(format!(
                    "the queue is full ({} tracks)",
                    self.ctx.config.max_queue_size
                )));
            }
            if text_channel.is_some() {
                st.text_channel = text_channel;
            }

            if st.playing {
                if st.voice_channel != Some(voice_channel) {
                    return Err(PlaybackError::UserInput(
                        "already playing in another voice channel".into(),
                    ));
                }
                info!("➕ Agregado a la cola: {}", track.title);
                st.tracks.push_back(track);
                return Ok(Enqueued::Queued {
                    position: st.tracks.len() - 1,
                });
            }

            st.tracks.clear();
            st.tracks.push_back(track);
            st.playing = true;
            st.idle_epoch += 1;
            st.voice_channel = Some(voice_channel);
        }

        // una pausa de la sesión anterior no se hereda
        self.session.set_paused(false).await;
        if let Err(e) = self.begin(voice_channel).await {
            warn!("⚠️ No se pudo iniciar la reproducción en guild {}: {}", self.guild, e);
            let mut st = self.state.lock();
            st.tracks.clear();
            st.playing = false;
            return Err(e);
        }
        Ok(Enqueued::Started)
    }

    /// Re-queues the last finished track for `requester`.
    pub async fn replay(
        self: &Arc<Self>,
        requester: UserId,
        voice_channel: ChannelId,
        text_channel: Option<ChannelId>,
    ) -> Result<Enqueued> {
        let track = self
            .state
            .lock()
            .last_completed
            .clone()
            .ok_or_else(|| PlaybackError::UserInput("nothing to replay".into()))?;

        let track = Track {
            requested_by: requester,
            seek: Duration::ZERO,
            added_at: Utc::now(),
            ..track
        };
        info!("↪️ Repitiendo {} para {}", track.title, requester);
        self.enqueue(track, voice_channel, text_channel).await
    }

    /// Ends the current track; the advance loop moves on.
    pub async fn skip(&self) -> Result<()> {
        let _ops = self.ops.lock().await;
        if !self.state.lock().playing {
            return Err(PlaybackError::NotPlaying);
        }
        info!("⏭️ Saltando pista en guild {}", self.guild);
        self.session.stop().await;
        Ok(())
    }

    /// Clears the queue, stops playback and leaves the voice channel.
    pub async fn stop(&self) -> Result<()> {
        let _ops = self.ops.lock().await;
        let link = {
            let mut st = self.state.lock();
            st.tracks.clear();
            st.playing = false;
            st.restart_pending = false;
            st.generation += 1;
            st.idle_epoch += 1;
            st.link.take()
        };

        self.session.stop().await;
        self.session.set_paused(false).await;

        if link.is_some() {
            self.ctx.transport.disconnect(self.guild).await?;
        }
        info!("⏹️ Reproducción detenida en guild {}", self.guild);
        self.publish_idle_panel().await;
        Ok(())
    }

    /// Replays the current track from `seek` without advancing the queue.
    pub async fn restart(&self, seek: SeekRequest) -> Result<()> {
        let _ops = self.ops.lock().await;
        {
            let mut st = self.state.lock();
            if !st.playing {
                return Err(PlaybackError::NotPlaying);
            }
            st.seek_override = match seek {
                SeekRequest::Keep => self.session.current_time(),
                SeekRequest::At(offset) => offset,
            };
            st.restart_pending = true;
            debug!("🔄 Reinicio pendiente en {:?}", st.seek_override);
        }
        self.session.stop().await;
        Ok(())
    }

    pub fn toggle_loop(&self) -> bool {
        let mut st = self.state.lock();
        st.looping = !st.looping;
        if st.looping {
            info!("🔁 Repetición activada");
        } else {
            info!("➡️ Repetición desactivada");
        }
        st.looping
    }

    /// Toggles pause, returning the new paused state.
    pub async fn pause(&self) -> Result<bool> {
        let paused = !self.session.is_paused();
        self.set_paused(paused).await?;
        Ok(paused)
    }

    pub async fn set_paused(&self, paused: bool) -> Result<()> {
        let _ops = self.ops.lock().await;
        if !self.state.lock().playing {
            return Err(PlaybackError::NotPlaying);
        }
        self.session.set_paused(paused).await;
        Ok(())
    }

    /// Clamped gain actually applied.
    pub async fn set_volume(&self, volume: f64) -> Result<f64> {
        clamp_volume(volume)?;
        let _ops = self.ops.lock().await;
        self.session.set_volume(volume).await
    }

    pub fn current_position(&self) -> Duration {
        if self.state.lock().playing {
            self.session.current_time()
        } else {
            Duration::ZERO
        }
    }

    pub fn is_playing(&self) -> bool {
        self.state.lock().playing
    }

    pub fn is_looping(&self) -> bool {
        self.state.lock().looping
    }

    pub fn tracks(&self) -> Vec<Track> {
        self.state.lock().tracks.iter().cloned().collect()
    }

    /// Channel the queue last played in.
    pub fn voice_channel(&self) -> Option<ChannelId> {
        self.state.lock().voice_channel
    }

    /// Message currently showing the now-playing panel.
    pub fn panel(&self) -> Option<MessageId> {
        self.state.lock().panel
    }

    pub fn last_completed(&self) -> Option<Track> {
        self.state.lock().last_completed.clone()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let st = self.state.lock();
        let current = if st.playing { st.tracks.front().cloned() } else { None };
        let upcoming: Vec<Track> = st.tracks.iter().skip(1).cloned().collect();
        let total_duration = st.tracks.iter().filter_map(|t| t.duration).sum();
        QueueSnapshot {
            current,
            upcoming,
            playing: st.playing,
            paused: self.session.is_paused(),
            looping: st.looping,
            position: if st.playing { self.session.current_time() } else { Duration::ZERO },
            volume: self.session.volume(),
            total_duration,
        }
    }

    async fn begin(self: &Arc<Self>, voice_channel: ChannelId) -> Result<()> {
        self.remember_channels(voice_channel).await;
        let link = self.connect(voice_channel).await?;
        let completion = self.start_head(&link).await?;
        let generation = {
            let mut st = self.state.lock();
            st.generation += 1;
            st.generation
        };
        tokio::spawn(self.clone().advance(completion, generation));
        self.publish_panel().await;
        Ok(())
    }

    /// Reuses a still-open link to the same channel, else joins.
    async fn connect(&self, voice_channel: ChannelId) -> Result<VoiceLink> {
        let existing = self.state.lock().link.clone();
        if let Some(link) = existing.filter(|l| l.is_connected() && l.channel == voice_channel) {
            debug!("🔗 Reutilizando conexión de voz en {}", voice_channel);
            return Ok(link);
        }

        let link = self.ctx.transport.join(self.guild, voice_channel).await?;
        self.state.lock().link = Some(link.clone());
        Ok(link)
    }

    async fn start_head(&self, link: &VoiceLink) -> Result<Completion> {
        let track = self
            .state
            .lock()
            .tracks
            .front()
            .cloned()
            .ok_or(PlaybackError::NotPlaying)?;
        info!("▶️ Reproduciendo: {} (desde {:?})", track.title, track.seek);

        self.session
            .start(
                StartRequest {
                    url: track.stream_url,
                    seek: track.seek,
                    bitrate: link.bitrate,
                },
                link.sink.clone(),
            )
            .await
    }

    /// Reacts to each completion until the queue idles or is stopped.
    async fn advance(self: Arc<Self>, mut completion: Completion, generation: u64) {
        let refresh = self.ctx.config.panel_refresh();
        let mut panel_tick = interval_at(Instant::now() + refresh, refresh);
        panel_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let result = loop {
                tokio::select! {
                    result = &mut completion => break result,
                    _ = panel_tick.tick() => self.refresh_panel().await,
                }
            };

            if let Err(e) = &result {
                self.notify_error(e);
            }

            let ops = self.ops.lock().await;
            let link = {
                let mut st = self.state.lock();
                if st.generation != generation || !st.playing {
                    debug!("Bucle de cola {} retirado", generation);
                    return;
                }

                if st.restart_pending {
                    st.restart_pending = false;
                    let seek = st.seek_override;
                    if let Some(head) = st.tracks.front_mut() {
                        head.seek = seek;
                    }
                } else if st.looping && result == Ok(TrackEnd::Finished) {
                    if let Some(head) = st.tracks.front_mut() {
                        head.seek = Duration::ZERO;
                    }
                } else if let Some(mut done) = st.tracks.pop_front() {
                    done.seek = Duration::ZERO;
                    st.last_completed = Some(done);
                }

                if st.tracks.is_empty() {
                    None
                } else {
                    st.link.clone()
                }
            };

            let Some(link) = link else {
                self.go_idle();
                drop(ops);
                self.publish_idle_panel().await;
                return;
            };

            match self.start_head(&link).await {
                Ok(next) => {
                    completion = next;
                    drop(ops);
                    self.publish_panel().await;
                }
                Err(e) => {
                    error!("❌ No se pudo iniciar la siguiente pista: {}", e);
                    self.notify_error(&e);
                    self.state.lock().tracks.clear();
                    self.go_idle();
                    drop(ops);
                    self.publish_idle_panel().await;
                    return;
                }
            }
        }
    }

    fn go_idle(self: &Arc<Self>) {
        self.state.lock().playing = false;
        info!("💤 Cola vacía en guild {}", self.guild);
        self.arm_idle_timer(self.ctx.config.idle_timeout());
    }

    /// Starts a disconnect timer that only fires if no newer timer was armed
    /// and playback did not resume meanwhile. Returns its epoch.
    fn arm_idle_timer(self: &Arc<Self>, delay: Duration) -> u64 {
        let epoch = {
            let mut st = self.state.lock();
            st.idle_epoch += 1;
            st.idle_epoch
        };

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let link = {
                let mut st = queue.state.lock();
                if st.idle_epoch != epoch || st.playing {
                    debug!("⏰ Temporizador {} obsoleto", epoch);
                    return;
                }
                st.link.take()
            };
            if link.is_some() {
                info!("👋 Desconectando por inactividad en guild {}", queue.guild);
                if let Err(e) = queue.ctx.transport.disconnect(queue.guild).await {
                    warn!("⚠️ Error al desconectar: {}", e);
                }
            }
        });

        epoch
    }

    fn notify_error(&self, err: &PlaybackError) {
        warn!("⚠️ Error de reproducción en guild {}: {}", self.guild, err);
        let Some(channel) = self.state.lock().text_channel else {
            return;
        };
        notify_temp(
            self.ctx.messenger.clone(),
            channel,
            panel::error(err),
            self.ctx.config.error_notice_ttl(),
        );
    }

    async fn remember_channels(&self, voice_channel: ChannelId) {
        let text_channel = self.state.lock().text_channel;
        let mut settings = match self.ctx.settings.get(self.guild).await {
            Ok(settings) => settings,
            Err(e) => {
                warn!("⚠️ No se pudieron leer los ajustes: {}", e);
                return;
            }
        };

        {
            let mut st = self.state.lock();
            if st.text_channel.is_none() {
                st.text_channel = settings.music_channel;
            }
            if st.panel.is_none() {
                st.panel = settings.panel_message;
            }
        }

        if settings.voice_channel == Some(voice_channel)
            && (text_channel.is_none() || settings.music_channel == text_channel)
        {
            return;
        }
        settings.voice_channel = Some(voice_channel);
        if text_channel.is_some() {
            settings.music_channel = text_channel;
        }
        if let Err(e) = self.ctx.settings.set(self.guild, settings).await {
            warn!("⚠️ No se pudieron guardar los ajustes: {}", e);
        }
    }

    /// Edits the panel in place, or posts a new one.
    async fn publish_panel(self: &Arc<Self>) {
        let (channel, panel_id) = {
            let st = self.state.lock();
            match st.text_channel {
                Some(channel) => (channel, st.panel),
                None => return,
            }
        };
        let notice = panel::now_playing(&self.snapshot());

        if let Some(id) = panel_id {
            if self.ctx.messenger.edit(channel, id, notice.clone()).await.is_ok() {
                self.attach_board(channel, id);
                return;
            }
        }

        match self.ctx.messenger.send(channel, notice).await {
            Ok(id) => {
                self.state.lock().panel = Some(id);
                self.attach_board(channel, id);
                self.save_panel(channel, id).await;
            }
            Err(e) => warn!("⚠️ No se pudo publicar el panel: {}", e),
        }
    }

    /// Keeps the reaction controls on the current panel message; a board left
    /// on an older message is dropped, which closes it.
    fn attach_board(self: &Arc<Self>, channel: ChannelId, message: MessageId) {
        let mut st = self.state.lock();
        if st.board.as_ref().map(ButtonBoard::message) == Some(message) {
            return;
        }
        debug!("🎛️ Controles abiertos en el panel {}", message);
        st.board = Some(ButtonBoard::open(
            channel,
            message,
            Arc::downgrade(self),
            self.ctx.messenger.clone(),
            self.ctx.reactions.subscribe(),
        ));
    }

    async fn refresh_panel(&self) {
        let target = {
            let st = self.state.lock();
            st.text_channel.zip(st.panel)
        };
        if let Some((channel, id)) = target {
            let notice = panel::now_playing(&self.snapshot());
            if let Err(e) = self.ctx.messenger.edit(channel, id, notice).await {
                debug!("No se pudo refrescar el panel: {}", e);
            }
        }
    }

    async fn publish_idle_panel(&self) {
        let target = {
            let st = self.state.lock();
            st.text_channel.zip(st.panel)
        };
        if let Some((channel, id)) = target {
            if let Err(e) = self.ctx.messenger.edit(channel, id, panel::idle()).await {
                debug!("No se pudo actualizar el panel: {}", e);
            }
        }
    }

    async fn save_panel(&self, channel: ChannelId, message: MessageId) {
        let result = async {
            let mut settings = self.ctx.settings.get(self.guild).await?;
            settings.music_channel = Some(channel);
            settings.panel_message = Some(message);
            self.ctx.settings.set(self.guild, settings).await
        }
        .await;
        if let Err(e) = result {
            warn!("⚠️ No se pudo guardar el panel: {}", e);
        }
    }
}
