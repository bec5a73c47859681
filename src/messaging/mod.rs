//! Text-channel notifications: now-playing panels and transient error notices.

use async_trait::async_trait;
use serenity::{
    all::{Colour, Timestamp},
    builder::{CreateEmbed, CreateEmbedFooter, CreateMessage, EditMessage},
    http::Http,
    model::{
        channel::ReactionType,
        id::{ChannelId, MessageId, UserId},
    },
};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{PlaybackError, Result};

/// Renderer-agnostic message body, roughly an embed.
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub title: String,
    pub description: Option<String>,
    pub url: Option<String>,
    pub thumbnail: Option<String>,
    pub footer: Option<String>,
    pub colour: Colour,
    /// (name, value, inline)
    pub fields: Vec<(String, String, bool)>,
}

impl Notice {
    pub fn new(title: impl Into<String>, colour: Colour) -> Self {
        Self {
            title: title.into(),
            description: None,
            url: None,
            thumbnail: None,
            footer: None,
            colour,
            fields: Vec::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn thumbnail(mut self, thumbnail: impl Into<String>) -> Self {
        self.thumbnail = Some(thumbnail.into());
        self
    }

    pub fn footer(mut self, footer: impl Into<String>) -> Self {
        self.footer = Some(footer.into());
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>, inline: bool) -> Self {
        self.fields.push((name.into(), value.into(), inline));
        self
    }

    fn to_embed(&self) -> CreateEmbed {
        let mut embed = CreateEmbed::default()
            .title(&self.title)
            .color(self.colour)
            .timestamp(Timestamp::now());

        if let Some(description) = &self.description {
            embed = embed.description(description);
        }
        if let Some(url) = &self.url {
            embed = embed.url(url);
        }
        if let Some(thumbnail) = &self.thumbnail {
            embed = embed.thumbnail(thumbnail);
        }
        if let Some(footer) = &self.footer {
            embed = embed.footer(CreateEmbedFooter::new(footer));
        }
        for (name, value, inline) in &self.fields {
            embed = embed.field(name, value, *inline);
        }

        embed
    }

    /// Plain-text rendering for logs and the console.
    pub fn to_plain(&self) -> String {
        let mut out = self.title.clone();
        if let Some(description) = &self.description {
            out.push_str(" | ");
            out.push_str(description);
        }
        for (name, value, _) in &self.fields {
            out.push_str(&format!(" | {name}: {value}"));
        }
        if let Some(footer) = &self.footer {
            out.push_str(&format!(" [{footer}]"));
        }
        out
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send(&self, channel: ChannelId, notice: Notice) -> Result<MessageId>;

    async fn edit(&self, channel: ChannelId, message: MessageId, notice: Notice) -> Result<()>;

    async fn delete(&self, channel: ChannelId, message: MessageId) -> Result<()>;

    /// Adds the bot's own reaction.
    async fn react(&self, channel: ChannelId, message: MessageId, emoji: ReactionType) -> Result<()>;

    /// Removes `user`'s reaction.
    async fn unreact(
        &self,
        channel: ChannelId,
        message: MessageId,
        user: UserId,
        emoji: ReactionType,
    ) -> Result<()>;

    async fn clear_reactions(&self, channel: ChannelId, message: MessageId) -> Result<()>;
}

/// Sends `notice` and deletes it after `ttl`. Failures are only logged.
pub fn notify_temp(
    messenger: Arc<dyn Messenger>,
    channel: ChannelId,
    notice: Notice,
    ttl: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let message = match messenger.send(channel, notice).await {
            Ok(message) => message,
            Err(e) => {
                warn!("⚠️ No se pudo enviar aviso a {}: {}", channel, e);
                return;
            }
        };

        tokio::time::sleep(ttl).await;

        if let Err(e) = messenger.delete(channel, message).await {
            debug!("No se pudo borrar aviso {}: {}", message, e);
        }
    })
}

/// Posts through Discord's REST API.
pub struct SerenityMessenger {
    http: Arc<Http>,
}

impl SerenityMessenger {
    pub fn from_http(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Messenger for SerenityMessenger {
    async fn send(&self, channel: ChannelId, notice: Notice) -> Result<MessageId> {
        let message = channel
            .send_message(&self.http, CreateMessage::new().embed(notice.to_embed()))
            .await
            .map_err(|e| PlaybackError::Messaging(e.to_string()))?;
        Ok(message.id)
    }

    async fn edit(&self, channel: ChannelId, message: MessageId, notice: Notice) -> Result<()> {
        channel
            .edit_message(&self.http, message, EditMessage::new().embed(notice.to_embed()))
            .await
            .map_err(|e| PlaybackError::Messaging(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, channel: ChannelId, message: MessageId) -> Result<()> {
        channel
            .delete_message(&self.http, message)
            .await
            .map_err(|e| PlaybackError::Messaging(e.to_string()))
    }

    async fn react(&self, channel: ChannelId, message: MessageId, emoji: ReactionType) -> Result<()> {
        self.http
            .create_reaction(channel, message, &emoji)
            .await
            .map_err(|e| PlaybackError::Messaging(e.to_string()))
    }

    async fn unreact(
        &self,
        channel: ChannelId,
        message: MessageId,
        user: UserId,
        emoji: ReactionType,
    ) -> Result<()> {
        self.http
            .delete_reaction(channel, message, user, &emoji)
            .await
            .map_err(|e| PlaybackError::Messaging(e.to_string()))
    }

    async fn clear_reactions(&self, channel: ChannelId, message: MessageId) -> Result<()> {
        self.http
            .delete_message_reactions(channel, message)
            .await
            .map_err(|e| PlaybackError::Messaging(e.to_string()))
    }
}

/// Messenger that only logs; used when no Discord token is configured.
#[derive(Default)]
pub struct LogMessenger {
    next_id: AtomicU64,
}

impl LogMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&self) -> MessageId {
        MessageId::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

#[async_trait]
impl Messenger for LogMessenger {
    async fn send(&self, channel: ChannelId, notice: Notice) -> Result<MessageId> {
        let id = self.allocate();
        info!("💬 [{}#{}] {}", channel, id, notice.to_plain());
        Ok(id)
    }

    async fn edit(&self, channel: ChannelId, message: MessageId, notice: Notice) -> Result<()> {
        debug!("✏️ [{}#{}] {}", channel, message, notice.to_plain());
        Ok(())
    }

    async fn delete(&self, channel: ChannelId, message: MessageId) -> Result<()> {
        debug!("🗑️ [{}#{}] borrado", channel, message);
        Ok(())
    }

    async fn react(&self, channel: ChannelId, message: MessageId, emoji: ReactionType) -> Result<()> {
        debug!("➕ [{}#{}] {}", channel, message, emoji);
        Ok(())
    }

    async fn unreact(
        &self,
        channel: ChannelId,
        message: MessageId,
        user: UserId,
        emoji: ReactionType,
    ) -> Result<()> {
        debug!("➖ [{}#{}] {} de {}", channel, message, emoji, user);
        Ok(())
    }

    async fn clear_reactions(&self, channel: ChannelId, message: MessageId) -> Result<()> {
        debug!("🧽 [{}#{}] reacciones limpiadas", channel, message);
        Ok(())
    }
}
