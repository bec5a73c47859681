use serenity::model::{
    channel::ReactionType,
    id::{ChannelId, MessageId, UserId},
};
use std::sync::{Arc, Weak};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    audio::queue::PlaybackQueue,
    error::{PlaybackError, Result},
    messaging::Messenger,
};

/// Acciones disponibles en el panel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanelAction {
    Replay,
    Stop,
    PauseToggle,
    Skip,
    ToggleLoop,
}

impl PanelAction {
    /// Order in which the reactions are offered under the panel.
    pub const ALL: [PanelAction; 5] = [
        PanelAction::Replay,
        PanelAction::Stop,
        PanelAction::PauseToggle,
        PanelAction::Skip,
        PanelAction::ToggleLoop,
    ];

    pub fn emoji(self) -> &'static str {
        match self {
            PanelAction::Replay => "↪",
            PanelAction::Stop => "⏹",
            PanelAction::PauseToggle => "⏯",
            PanelAction::Skip => "⏭",
            PanelAction::ToggleLoop => "🔄",
        }
    }

    pub fn reaction(self) -> ReactionType {
        ReactionType::Unicode(self.emoji().to_string())
    }

    /// Accepts the emoji with or without the trailing variation selector.
    pub fn from_emoji(emoji: &str) -> Option<Self> {
        let bare = emoji.trim_end_matches('\u{fe0f}');
        Self::ALL.into_iter().find(|action| action.emoji() == bare)
    }
}

/// A reaction added by a user to some message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionEvent {
    pub message: MessageId,
    pub user: UserId,
    pub emoji: String,
}

/// Reaction controls bound to one panel message.
///
/// On open the message's reactions are reset to one per [`PanelAction`].
/// Each handled reaction is removed again so the user can press it twice.
/// Listens on the shared reaction bus until [`ButtonBoard::close`] is called,
/// the board is dropped or the queue goes away.
#[derive(Debug)]
pub struct ButtonBoard {
    message: MessageId,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ButtonBoard {
    pub fn open(
        channel: ChannelId,
        message: MessageId,
        queue: Weak<PlaybackQueue>,
        messenger: Arc<dyn Messenger>,
        mut events: broadcast::Receiver<ReactionEvent>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            if let Err(e) = messenger.clear_reactions(channel, message).await {
                debug!("No se pudieron limpiar las reacciones de {}: {}", message, e);
            }
            for action in PanelAction::ALL {
                if token.is_cancelled() {
                    return;
                }
                if let Err(e) = messenger.react(channel, message, action.reaction()).await {
                    warn!("⚠️ No se pudo añadir {} al panel {}: {}", action.emoji(), message, e);
                    break;
                }
            }

            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) if event.message == message => {
                        let Some(action) = PanelAction::from_emoji(&event.emoji) else {
                            debug!("Reacción ignorada: {}", event.emoji);
                            continue;
                        };
                        let Some(queue) = queue.upgrade() else { break };
                        if let Err(e) = apply(&queue, action, event.user).await {
                            warn!("⚠️ Acción {:?} falló: {}", action, e);
                        }
                        let emoji = ReactionType::Unicode(event.emoji);
                        if let Err(e) = messenger.unreact(channel, message, event.user, emoji).await {
                            debug!("No se pudo quitar la reacción de {}: {}", event.user, e);
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("⚠️ {} reacciones perdidas en el panel {}", skipped, message);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("🔌 Panel {} cerrado", message);
        });

        Self {
            message,
            cancel,
            task: Some(task),
        }
    }

    pub fn message(&self) -> MessageId {
        self.message
    }

    /// Stops listening and waits for the listener to exit.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ButtonBoard {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn apply(queue: &Arc<PlaybackQueue>, action: PanelAction, user: UserId) -> Result<()> {
    info!("🎛️ {:?} por {}", action, user);
    match action {
        PanelAction::Replay => {
            let voice_channel = queue
                .voice_channel()
                .ok_or_else(|| PlaybackError::UserInput("no voice channel to replay into".into()))?;
            queue.replay(user, voice_channel, None).await.map(|_| ())
        }
        PanelAction::Stop => queue.stop().await,
        PanelAction::PauseToggle => queue.pause().await.map(|_| ()),
        PanelAction::Skip => queue.skip().await,
        PanelAction::ToggleLoop => {
            queue.toggle_loop();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::registry::PlayerContext,
        config::Config,
        messaging::MockMessenger,
        sources::MockTrackResolver,
        test_support::{
            settle, MemorySettings, MemoryTransport, ReactionCall, RecordingMessenger,
            ScriptedTranscoder, StreamScript,
        },
    };
    use mockall::{predicate::eq, Sequence};
    use pretty_assertions::assert_eq;
    use serenity::model::id::GuildId;

    const TEXT: ChannelId = ChannelId::new(9);
    const PANEL: MessageId = MessageId::new(42);

    fn queue() -> Arc<PlaybackQueue> {
        let ctx = PlayerContext {
            transcoder: Arc::new(ScriptedTranscoder::new(StreamScript::frames(10))),
            transport: Arc::new(MemoryTransport::new()),
            messenger: Arc::new(RecordingMessenger::new()),
            resolver: Arc::new(MockTrackResolver::new()),
            settings: Arc::new(MemorySettings::default()),
            reactions: broadcast::channel(16).0,
            config: Arc::new(Config::default()),
        };
        PlaybackQueue::new(GuildId::new(1), ctx)
    }

    fn reaction(message: MessageId, emoji: &str) -> ReactionEvent {
        ReactionEvent {
            message,
            user: UserId::new(3),
            emoji: emoji.into(),
        }
    }

    #[test]
    fn test_emoji_map() {
        for action in PanelAction::ALL {
            assert_eq!(PanelAction::from_emoji(action.emoji()), Some(action));
        }
        assert_eq!(PanelAction::from_emoji("⏯️"), Some(PanelAction::PauseToggle));
        assert_eq!(PanelAction::from_emoji("👍"), None);
    }

    #[tokio::test]
    async fn test_open_resets_reactions_in_order() {
        let mut mock = MockMessenger::new();
        let mut seq = Sequence::new();
        mock.expect_clear_reactions()
            .with(eq(TEXT), eq(PANEL))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        for action in PanelAction::ALL {
            mock.expect_react()
                .with(eq(TEXT), eq(PANEL), eq(action.reaction()))
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _, _| Ok(()));
        }
        mock.expect_unreact().never();

        let queue = queue();
        let (_bus, rx) = broadcast::channel(16);
        let board = ButtonBoard::open(TEXT, PANEL, Arc::downgrade(&queue), Arc::new(mock), rx);
        settle().await;
        board.close().await;
    }

    #[tokio::test]
    async fn test_reactions_on_panel_drive_queue() {
        let queue = queue();
        let messenger = Arc::new(RecordingMessenger::new());
        let (bus, rx) = broadcast::channel(16);
        let board = ButtonBoard::open(TEXT, PANEL, Arc::downgrade(&queue), messenger.clone(), rx);

        bus.send(reaction(MessageId::new(7), "🔄")).unwrap();
        settle().await;
        assert!(!queue.is_looping());

        bus.send(reaction(PANEL, "🔄")).unwrap();
        settle().await;
        assert!(queue.is_looping());

        // errores de la cola no tumban el panel
        bus.send(reaction(PANEL, "⏭")).unwrap();
        bus.send(reaction(PANEL, "🔄")).unwrap();
        settle().await;
        assert!(!queue.is_looping());

        let removed: Vec<_> = messenger
            .reactions()
            .into_iter()
            .filter(|call| matches!(call, ReactionCall::Remove(..)))
            .collect();
        assert_eq!(
            removed,
            vec![
                ReactionCall::Remove(PANEL, UserId::new(3), "🔄".into()),
                ReactionCall::Remove(PANEL, UserId::new(3), "⏭".into()),
                ReactionCall::Remove(PANEL, UserId::new(3), "🔄".into()),
            ]
        );

        board.close().await;
    }

    #[tokio::test]
    async fn test_closed_board_ignores_reactions() {
        let queue = queue();
        let (bus, rx) = broadcast::channel(16);
        let board = ButtonBoard::open(
            TEXT,
            PANEL,
            Arc::downgrade(&queue),
            Arc::new(RecordingMessenger::new()),
            rx,
        );
        board.close().await;

        assert!(bus.send(reaction(PANEL, "🔄")).is_err());
        settle().await;
        assert!(!queue.is_looping());
    }
}
