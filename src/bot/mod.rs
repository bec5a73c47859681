//! Gateway events the relay listens to.
//!
//! Voice state plumbing is handled by songbird once it is registered on the
//! client; this handler only learns the bot's own id and forwards panel
//! reactions onto the shared reaction bus.

use serenity::{
    all::{Context, EventHandler, Reaction, ReactionType, Ready},
    async_trait,
    model::id::{MessageId, UserId},
};
use std::sync::OnceLock;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::ui::buttons::ReactionEvent;

pub struct GatewayHandler {
    reactions: broadcast::Sender<ReactionEvent>,
    bot_user: OnceLock<UserId>,
}

impl GatewayHandler {
    pub fn new(reactions: broadcast::Sender<ReactionEvent>) -> Self {
        Self {
            reactions,
            bot_user: OnceLock::new(),
        }
    }
}

#[async_trait]
impl EventHandler for GatewayHandler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea!", ready.user.name);
        info!("📊 Conectado a {} servidores", ready.guilds.len());
        let _ = self.bot_user.set(ready.user.id);
    }

    async fn reaction_add(&self, _ctx: Context, reaction: Reaction) {
        let Some(event) = reaction_event(
            self.bot_user.get().copied(),
            reaction.user_id,
            reaction.message_id,
            &reaction.emoji,
        ) else {
            return;
        };
        // sin paneles abiertos no hay suscriptores
        if self.reactions.send(event).is_err() {
            debug!("Reacción sin controles abiertos en {}", reaction.message_id);
        }
    }
}

/// Unicode reactions by anyone but the bot itself.
fn reaction_event(
    bot: Option<UserId>,
    user: Option<UserId>,
    message: MessageId,
    emoji: &ReactionType,
) -> Option<ReactionEvent> {
    let user = user?;
    if bot == Some(user) {
        return None;
    }
    match emoji {
        ReactionType::Unicode(emoji) => Some(ReactionEvent {
            message,
            user,
            emoji: emoji.clone(),
        }),
        _ => None,
    }
}
