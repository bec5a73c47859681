use serenity::all::Colour;
use std::time::Duration;

use crate::{
    audio::queue::{QueueSnapshot, Track},
    error::PlaybackError,
    messaging::Notice,
};

/// Paleta de colores estandarizada
pub mod colors {
    use serenity::all::Colour;

    pub const SUCCESS_GREEN: Colour = Colour::from_rgb(67, 181, 129);
    pub const ERROR_RED: Colour = Colour::from_rgb(220, 53, 69);
    pub const WARNING_ORANGE: Colour = Colour::from_rgb(255, 193, 7);
    pub const INFO_BLUE: Colour = Colour::from_rgb(52, 144, 220);
    pub const NEUTRAL_GRAY: Colour = Colour::from_rgb(108, 117, 125);
}

/// Cuántas pistas siguientes se muestran en el panel
const PREVIEW_LEN: usize = 5;

/// `m:ss`, or `h:mm:ss` past the hour.
pub fn format_clock(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

fn progress(position: Duration, duration: Option<Duration>) -> String {
    match duration {
        Some(total) => format!("{} / {}", format_clock(position), format_clock(total)),
        None => format!("{} / 🔴 en vivo", format_clock(position)),
    }
}

/// Panel "now playing" con progreso y cola
pub fn now_playing(snapshot: &QueueSnapshot) -> Notice {
    let Some(track) = &snapshot.current else {
        return idle();
    };

    let mut state = Vec::new();
    if snapshot.paused {
        state.push("⏸️ en pausa");
    }
    if snapshot.looping {
        state.push("🔁 repetición");
    }

    let mut notice = Notice::new(format!("🎵 {}", track.title), colors::SUCCESS_GREEN)
        .url(&track.source_url)
        .field("👤 Solicitado por", format!("<@{}>", track.requested_by), true)
        .field("🔊 Volumen", format!("{}%", (snapshot.volume * 100.0).round() as u32), true)
        .footer(progress(snapshot.position, track.duration));

    if !state.is_empty() {
        notice = notice.description(state.join(" · "));
    }
    if let Some(thumbnail) = &track.thumbnail {
        notice = notice.thumbnail(thumbnail);
    }
    if !snapshot.upcoming.is_empty() {
        notice = notice.field("📋 Siguientes", upcoming_list(&snapshot.upcoming), false);
    }

    notice
}

fn upcoming_list(upcoming: &[Track]) -> String {
    let mut lines: Vec<String> = upcoming
        .iter()
        .take(PREVIEW_LEN)
        .enumerate()
        .map(|(i, track)| {
            let length = track.duration.map(format_clock).unwrap_or_else(|| "🔴".into());
            format!("`{}.` {} `[{}]`", i + 1, track.title, length)
        })
        .collect();
    if upcoming.len() > PREVIEW_LEN {
        lines.push(format!("… y {} más", upcoming.len() - PREVIEW_LEN));
    }
    lines.join("\n")
}

pub fn idle() -> Notice {
    Notice::new("⏹️ Nada en reproducción", colors::NEUTRAL_GRAY)
        .description("Usa play <url> para empezar")
}

pub fn queued(track: &Track, position: usize) -> Notice {
    Notice::new("➕ Agregado a la cola", colors::INFO_BLUE)
        .description(format!("**{}**", track.title))
        .field("📍 Posición", position.to_string(), true)
}

/// Aviso transitorio de error
pub fn error(err: &PlaybackError) -> Notice {
    let colour: Colour = if err.is_user_facing() {
        colors::WARNING_ORANGE
    } else {
        colors::ERROR_RED
    };
    Notice::new("❌ Error", colour).description(err.to_string())
}

/// Listado completo de la cola
pub fn queue_listing(snapshot: &QueueSnapshot) -> Notice {
    let mut notice = Notice::new("📋 Cola de reproducción", colors::INFO_BLUE);
    match &snapshot.current {
        Some(track) => {
            notice = notice.field(
                "▶️ Ahora",
                format!("{} `[{}]`", track.title, progress(snapshot.position, track.duration)),
                false,
            );
        }
        None => notice = notice.description("La cola está vacía"),
    }
    if !snapshot.upcoming.is_empty() {
        notice = notice.field("📋 Siguientes", upcoming_list(&snapshot.upcoming), false);
    }
    notice.footer(format!(
        "{} pistas · {} en total",
        snapshot.upcoming.len() + usize::from(snapshot.current.is_some()),
        humantime::format_duration(Duration::from_secs(snapshot.total_duration.as_secs()))
    ))
}
