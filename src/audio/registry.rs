use dashmap::DashMap;
use futures::future::join_all;
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{
    audio::{
        ffmpeg::Transcoder,
        queue::{Enqueued, PlaybackQueue, Track},
    },
    config::Config,
    error::Result,
    messaging::Messenger,
    sources::TrackResolver,
    storage::SettingsStore,
    ui::buttons::ReactionEvent,
    voice::VoiceTransport,
};

/// Collaborators every guild's queue is built from.
#[derive(Clone)]
pub struct PlayerContext {
    pub transcoder: Arc<dyn Transcoder>,
    pub transport: Arc<dyn VoiceTransport>,
    pub messenger: Arc<dyn Messenger>,
    pub resolver: Arc<dyn TrackResolver>,
    pub settings: Arc<dyn SettingsStore>,
    /// Reactions from the gateway; every panel's controls subscribe here.
    pub reactions: broadcast::Sender<ReactionEvent>,
    pub config: Arc<Config>,
}

/// One [`PlaybackQueue`] per guild, created on first use and never replaced.
pub struct GuildSessionRegistry {
    ctx: PlayerContext,
    queues: DashMap<GuildId, Arc<PlaybackQueue>>,
}

impl GuildSessionRegistry {
    pub fn new(ctx: PlayerContext) -> Self {
        Self {
            ctx,
            queues: DashMap::new(),
        }
    }

    pub fn context(&self) -> &PlayerContext {
        &self.ctx
    }

    pub fn get_or_create(&self, guild: GuildId) -> Arc<PlaybackQueue> {
        self.queues
            .entry(guild)
            .or_insert_with(|| {
                info!("🆕 Cola creada para guild {}", guild);
                PlaybackQueue::new(guild, self.ctx.clone())
            })
            .clone()
    }

    pub fn get(&self, guild: GuildId) -> Option<Arc<PlaybackQueue>> {
        self.queues.get(&guild).map(|q| q.clone())
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn guilds(&self) -> Vec<GuildId> {
        self.queues.iter().map(|entry| *entry.key()).collect()
    }

    /// Resolves `url` and hands the track to the guild's queue.
    pub async fn play(
        &self,
        guild: GuildId,
        url: &str,
        requester: UserId,
        voice_channel: ChannelId,
        text_channel: Option<ChannelId>,
    ) -> Result<(Track, Enqueued)> {
        let resolved = self.ctx.resolver.resolve(url).await?;
        let track = Track::new(resolved, requester);
        let queue = self.get_or_create(guild);
        let outcome = queue
            .enqueue(track.clone(), voice_channel, text_channel)
            .await?;
        Ok((track, outcome))
    }

    /// Stops every guild concurrently.
    pub async fn shutdown(&self) {
        let queues: Vec<Arc<PlaybackQueue>> =
            self.queues.iter().map(|entry| entry.value().clone()).collect();
        let results = join_all(queues.iter().map(|queue| queue.stop())).await;
        for (queue, result) in queues.iter().zip(results) {
            if let Err(e) = result {
                warn!("⚠️ Error deteniendo guild {}: {}", queue.guild(), e);
            }
        }
        info!("🛑 {} colas detenidas", queues.len());
    }
}
