//! Error taxonomy for the playback engine.

use std::time::Duration;
use thiserror::Error;

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, PlaybackError>;

/// Everything that can go wrong between a command and the voice socket.
///
/// Task-level failures (`Spawn`, `Stream`, `Stall`, `TransportTimeout`) never
/// escape as panics: they are funnelled onto the session completion and
/// consumed by the queue advance loop. Caller-level failures (`UserInput`,
/// `AlreadyEncoding`, `NotPlaying`) are returned synchronously and never
/// mutate state.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlaybackError {
    /// El transcoder no pudo arrancar (binario ausente, pipes, permisos)
    #[error("couldn't start transcoder: {0}")]
    Spawn(String),

    /// Pipe roto, demux inválido o salida anómala del proceso
    #[error("stream error: {0}")]
    Stream(String),

    /// No llegó ningún frame del buffer dentro del presupuesto
    #[error("no audio frame within {0:?}")]
    Stall(Duration),

    /// El transporte de voz no aceptó el frame dentro del presupuesto
    #[error("voice connection timed out after {0:?}")]
    TransportTimeout(Duration),

    /// Seek, volumen o URL mal formados
    #[error("{0}")]
    UserInput(String),

    /// Start llamado mientras la sesión sigue codificando
    #[error("encoder session is already running")]
    AlreadyEncoding,

    /// Operación que requiere reproducción activa
    #[error("nothing is playing")]
    NotPlaying,

    /// El resolver externo no encontró un stream reproducible
    #[error("error querying song: {0}")]
    Resolve(String),

    /// Fallo al unirse o usar el canal de voz
    #[error("voice error: {0}")]
    Voice(String),

    /// Fallo de la capa de mensajería
    #[error("messaging error: {0}")]
    Messaging(String),

    /// Fallo del almacenamiento de ajustes
    #[error("settings error: {0}")]
    Storage(String),
}

impl PlaybackError {
    /// Errors that must be reported back to the caller without touching the session.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Self::UserInput(_) | Self::AlreadyEncoding | Self::NotPlaying | Self::Resolve(_)
        )
    }
}

impl From<std::io::Error> for PlaybackError {
    fn from(err: std::io::Error) -> Self {
        Self::Stream(err.to_string())
    }
}

impl From<serde_json::Error> for PlaybackError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_facing_classification() {
        assert!(PlaybackError::UserInput("bad seek".into()).is_user_facing());
        assert!(PlaybackError::AlreadyEncoding.is_user_facing());
        assert!(!PlaybackError::Spawn("missing".into()).is_user_facing());
        assert!(!PlaybackError::TransportTimeout(Duration::from_secs(1)).is_user_facing());
    }

    #[test]
    fn test_io_errors_map_to_stream() {
        let err: PlaybackError =
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed").into();
        assert!(matches!(err, PlaybackError::Stream(_)));
    }
}
