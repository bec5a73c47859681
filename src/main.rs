use anyhow::{Context, Result};
use serenity::{
    all::GatewayIntents,
    model::id::{ChannelId, GuildId, UserId},
    Client,
};
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast,
};
use tracing::{error, info, warn};

use voice_relay::{
    audio::{
        ffmpeg::FfmpegTranscoder,
        queue::{Enqueued, PlaybackQueue, SeekRequest},
        registry::{GuildSessionRegistry, PlayerContext},
    },
    bot::GatewayHandler,
    config::Config,
    messaging::{LogMessenger, Messenger, SerenityMessenger},
    sources::{parse_seek, YtDlpResolver},
    storage::JsonSettingsStore,
    ui::{buttons::ReactionEvent, panel},
    voice::{DcaFileTransport, DcaTarget, DiscordVoiceTransport, VoiceTransport},
};

/// Usuario con el que la consola firma sus pedidos
const CONSOLE_USER: UserId = UserId::new(1);

/// Dónde suena lo que se pide por consola
#[derive(Debug, Clone, Copy)]
struct Target {
    guild: GuildId,
    voice: ChannelId,
    text: Option<ChannelId>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("voice_relay=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando voice-relay v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;
    info!("{}", config.summary());

    let transcoder = Arc::new(FfmpegTranscoder::new(config.ffmpeg_path.clone()));
    let resolver = Arc::new(YtDlpResolver::new(config.ytdlp_path.clone()));

    // Manejar health check si es necesario
    if std::env::args().any(|arg| arg == "--health-check") {
        transcoder.verify().await?;
        resolver.verify().await?;
        println!("OK");
        return Ok(());
    }

    let settings = Arc::new(
        JsonSettingsStore::new(config.data_dir.clone())
            .await
            .context("inicializando ajustes")?,
    );
    let (reactions, _) = broadcast::channel::<ReactionEvent>(64);

    // con token: gateway + songbird; sin token todo queda en disco y en el log
    let mut shards = None;
    let (messenger, transport): (Arc<dyn Messenger>, Arc<dyn VoiceTransport>) =
        match &config.discord_token {
            Some(token) => {
                let intents = GatewayIntents::GUILDS
                    | GatewayIntents::GUILD_VOICE_STATES
                    | GatewayIntents::GUILD_MESSAGE_REACTIONS;
                let songbird = Songbird::serenity();
                let mut client = Client::builder(token, intents)
                    .event_handler(GatewayHandler::new(reactions.clone()))
                    .register_songbird_with(songbird.clone())
                    .await
                    .context("construyendo el cliente de Discord")?;
                let http = client.http.clone();
                shards = Some(client.shard_manager.clone());

                tokio::spawn(async move {
                    if let Err(why) = client.start().await {
                        error!("Error al ejecutar cliente: {:?}", why);
                    }
                });
                info!("🔌 Gateway de Discord iniciado");

                let messenger: Arc<dyn Messenger> = Arc::new(SerenityMessenger::from_http(http.clone()));
                let transport: Arc<dyn VoiceTransport> = Arc::new(DiscordVoiceTransport::new(
                    songbird,
                    http,
                    config.opus_bitrate,
                    config.frame_duration(),
                ));
                (messenger, transport)
            }
            None => {
                info!("📝 Sin DISCORD_TOKEN: audio a {} y avisos solo en el log", config.output_dir.display());
                let messenger: Arc<dyn Messenger> = Arc::new(LogMessenger::new());
                let transport: Arc<dyn VoiceTransport> = Arc::new(DcaFileTransport::new(
                    DcaTarget::Directory(config.output_dir.clone()),
                    config.opus_bitrate,
                ));
                (messenger, transport)
            }
        };

    // sin token el panel va al log con un canal ficticio
    let target = Target {
        guild: GuildId::new(config.guild_id.unwrap_or(1)),
        voice: ChannelId::new(config.voice_channel_id.unwrap_or(1)),
        text: config
            .notify_channel_id
            .map(ChannelId::new)
            .or_else(|| config.discord_token.is_none().then(|| ChannelId::new(1))),
    };

    let registry = Arc::new(GuildSessionRegistry::new(PlayerContext {
        transcoder,
        transport,
        messenger,
        resolver,
        settings,
        reactions,
        config: Arc::new(config),
    }));

    info!("🚀 Listo. Comandos: play <url>, pause, skip, stop, volume <v>, seek <t>, restart, replay, loop, np, queue, react <emoji>, quit");

    tokio::select! {
        result = console(registry.clone(), target) => {
            if let Err(e) = result {
                error!("❌ Error en la consola: {:?}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("⚠️ Señal de shutdown recibida, cerrando...");
        }
    }

    registry.shutdown().await;
    if let Some(shards) = shards {
        shards.shutdown_all().await;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Play(String),
    Pause,
    Skip,
    Stop,
    Volume(f64),
    Seek(SeekRequest),
    Replay,
    Loop,
    NowPlaying,
    Queue,
    React(String),
    Quit,
}

fn parse_command(line: &str) -> Result<Command> {
    let mut parts = line.split_whitespace();
    let verb = parts.next().unwrap_or_default().to_lowercase();
    let arg = parts.next();

    let command = match (verb.as_str(), arg) {
        ("play" | "p", Some(url)) => Command::Play(url.to_string()),
        ("pause", None) => Command::Pause,
        ("skip" | "s", None) => Command::Skip,
        ("stop", None) => Command::Stop,
        ("volume" | "vol", Some(value)) => {
            let percent: f64 = value
                .trim_end_matches('%')
                .parse()
                .with_context(|| format!("volumen inválido: {value}"))?;
            Command::Volume(percent / 100.0)
        }
        ("seek", Some(offset)) => Command::Seek(SeekRequest::At(parse_seek(offset)?)),
        ("restart", None) => Command::Seek(SeekRequest::Keep),
        ("replay", None) => Command::Replay,
        ("loop", None) => Command::Loop,
        ("np", None) => Command::NowPlaying,
        ("queue" | "q", None) => Command::Queue,
        ("react", Some(emoji)) => Command::React(emoji.to_string()),
        ("quit" | "exit", None) => Command::Quit,
        _ => anyhow::bail!("comando desconocido: {line}"),
    };
    Ok(command)
}

async fn console(registry: Arc<GuildSessionRegistry>, target: Target) -> Result<()> {
    let queue = registry.get_or_create(target.guild);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let command = match parse_command(&line) {
            Ok(command) => command,
            Err(e) => {
                warn!("⚠️ {}", e);
                continue;
            }
        };
        if command == Command::Quit {
            break;
        }

        if let Err(e) = run_command(&registry, &queue, command, target).await {
            warn!("⚠️ {}", e);
        }
    }
    Ok(())
}

async fn run_command(
    registry: &GuildSessionRegistry,
    queue: &Arc<PlaybackQueue>,
    command: Command,
    target: Target,
) -> Result<()> {
    match command {
        Command::Play(url) => {
            let (track, outcome) = registry
                .play(target.guild, &url, CONSOLE_USER, target.voice, target.text)
                .await?;
            if let Enqueued::Queued { position } = outcome {
                println!("{}", panel::queued(&track, position).to_plain());
            }
        }
        Command::Pause => {
            let paused = queue.pause().await?;
            println!("{}", if paused { "⏸️ Pausado" } else { "▶️ Reanudado" });
        }
        Command::Skip => queue.skip().await?,
        Command::Stop => queue.stop().await?,
        Command::Volume(volume) => {
            let applied = queue.set_volume(volume).await?;
            println!("🔊 Volumen: {}%", (applied * 100.0).round());
        }
        Command::Seek(request) => queue.restart(request).await?,
        Command::Replay => {
            queue.replay(CONSOLE_USER, target.voice, target.text).await?;
        }
        Command::Loop => {
            let looping = queue.toggle_loop();
            println!("{}", if looping { "🔁 Repetición activada" } else { "➡️ Repetición desactivada" });
        }
        Command::NowPlaying => println!("{}", panel::now_playing(&queue.snapshot()).to_plain()),
        Command::Queue => println!("{}", panel::queue_listing(&queue.snapshot()).to_plain()),
        Command::React(emoji) => {
            // igual que una reacción recibida por el gateway
            let message = queue.panel().context("no hay panel publicado")?;
            registry
                .context()
                .reactions
                .send(ReactionEvent {
                    message,
                    user: CONSOLE_USER,
                    emoji,
                })
                .map_err(|_| anyhow::anyhow!("no hay controles abiertos"))?;
        }
        Command::Quit => {}
    }
    Ok(())
}
