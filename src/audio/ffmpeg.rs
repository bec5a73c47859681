//! ffmpeg transcoder: argument construction and process spawning.

use async_trait::async_trait;
use std::{process::Stdio, time::Duration};
use tokio::io::AsyncRead;
use tracing::{debug, info};

use crate::{
    audio::frame::FrameDuration,
    error::{PlaybackError, Result},
};

/// Everything the transcoder needs besides the input URL.
///
/// Kept declarative so the codec/filter flags live in one place instead of
/// being spread across the playback logic.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeArgs {
    /// Offset into the source where decoding starts.
    pub seek: Duration,
    /// Linear gain applied after loudness normalisation (1.0 = unchanged).
    pub volume: f64,
    /// Target Opus bitrate in bits per second.
    pub bitrate: u32,
    /// Output sample rate; Discord voice expects 48 kHz.
    pub sample_rate: u32,
    /// Output channel count.
    pub channels: u8,
    /// Length of every Opus frame.
    pub frame_duration: FrameDuration,
    /// libopus effort, 0 (fastest) to 10 (best).
    pub compression_level: u8,
}

impl Default for EncodeArgs {
    fn default() -> Self {
        Self {
            seek: Duration::ZERO,
            volume: 1.0,
            bitrate: 64_000,
            sample_rate: 48_000,
            channels: 2,
            frame_duration: FrameDuration::Ms20,
            compression_level: 10,
        }
    }
}

impl EncodeArgs {
    /// ffmpeg command line reading `url` and writing Ogg/Opus to stdout.
    pub fn to_ffmpeg_args(&self, url: &str) -> Vec<String> {
        let mut args: Vec<String> = Vec::with_capacity(48);

        // opciones de entrada: deben ir antes de -i
        if !self.seek.is_zero() {
            args.extend(["-ss".into(), format!("{:.3}", self.seek.as_secs_f64())]);
        }
        args.extend(
            [
                "-reconnect", "1",
                "-reconnect_streamed", "1",
                "-reconnect_delay_max", "4",
                "-analyzeduration", "0",
                "-probesize", "1000000",
                "-fflags", "+fastseek+nobuffer+flush_packets+discardcorrupt",
                "-i", url,
            ]
            .map(String::from),
        );

        // solo audio
        args.extend(["-vn", "-map", "0:a"].map(String::from));

        // filtros: normalización + ganancia
        args.extend(["-af".into(), format!("loudnorm,volume={:.2}", self.volume)]);

        args.extend([
            "-acodec".into(),
            "libopus".into(),
            "-application".into(),
            "audio".into(),
            "-frame_duration".into(),
            self.frame_duration.as_millis().to_string(),
            "-compression_level".into(),
            self.compression_level.to_string(),
            "-packet_loss".into(),
            "10".into(),
            "-ar".into(),
            self.sample_rate.to_string(),
            "-ac".into(),
            self.channels.to_string(),
            "-b:a".into(),
            self.bitrate.to_string(),
            "-flush_packets".into(),
            "1".into(),
            "-threads".into(),
            "0".into(),
            "-loglevel".into(),
            "warning".into(),
            "-f".into(),
            "opus".into(),
            "pipe:1".into(),
        ]);

        args
    }
}

/// How a transcoder process ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessExit {
    Success,
    Failed(String),
}

/// Handle to a running transcoder process.
#[async_trait]
pub trait ProcessHandle: Send {
    async fn wait(&mut self) -> std::io::Result<ProcessExit>;

    /// Kills the process and reaps it.
    async fn kill(&mut self) -> std::io::Result<()>;
}

/// A spawned transcoder with its pipes.
pub struct TranscoderProcess {
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub handle: Box<dyn ProcessHandle>,
}

/// Spawns the external encoder for one playback run.
pub trait Transcoder: Send + Sync {
    fn spawn(&self, url: &str, args: &EncodeArgs) -> Result<TranscoderProcess>;
}

pub struct FfmpegTranscoder {
    binary: String,
}

impl FfmpegTranscoder {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Verifies the binary runs at all.
    pub async fn verify(&self) -> anyhow::Result<()> {
        let output = tokio::process::Command::new(&self.binary)
            .arg("-version")
            .output()
            .await?;

        if !output.status.success() {
            anyhow::bail!("{} -version failed", self.binary);
        }

        let version = String::from_utf8_lossy(&output.stdout);
        info!(
            "✅ ffmpeg disponible: {}",
            version.lines().next().unwrap_or_default()
        );
        Ok(())
    }
}

struct ChildHandle(tokio::process::Child);

#[async_trait]
impl ProcessHandle for ChildHandle {
    async fn wait(&mut self) -> std::io::Result<ProcessExit> {
        let status = self.0.wait().await?;
        Ok(if status.success() {
            ProcessExit::Success
        } else {
            ProcessExit::Failed(status.to_string())
        })
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        match self.0.kill().await {
            Ok(()) => Ok(()),
            // ya terminó
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Transcoder for FfmpegTranscoder {
    fn spawn(&self, url: &str, args: &EncodeArgs) -> Result<TranscoderProcess> {
        let argv = args.to_ffmpeg_args(url);
        debug!("🎛️ {} {}", self.binary, argv.join(" "));

        let mut child = tokio::process::Command::new(&self.binary)
            .args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PlaybackError::Spawn(format!("error starting ffmpeg process: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PlaybackError::Spawn("error starting stdout pipe".into()))?;
        let stderr = child.stderr.take();

        Ok(TranscoderProcess {
            stdout: Box::new(stdout),
            stderr: stderr.map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>),
            handle: Box::new(ChildHandle(child)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_args_carry_every_encode_field() {
        let args = EncodeArgs {
            seek: Duration::from_millis(10_500),
            volume: 0.5,
            bitrate: 96_000,
            sample_rate: 48_000,
            channels: 2,
            frame_duration: FrameDuration::Ms40,
            compression_level: 7,
        }
        .to_ffmpeg_args("https://cdn.example/audio.webm");

        assert_eq!(value_after(&args, "-ss"), Some("10.500"));
        assert_eq!(value_after(&args, "-i"), Some("https://cdn.example/audio.webm"));
        assert_eq!(value_after(&args, "-af"), Some("loudnorm,volume=0.50"));
        assert_eq!(value_after(&args, "-b:a"), Some("96000"));
        assert_eq!(value_after(&args, "-frame_duration"), Some("40"));
        assert_eq!(value_after(&args, "-compression_level"), Some("7"));
        assert_eq!(value_after(&args, "-ar"), Some("48000"));
        assert_eq!(value_after(&args, "-ac"), Some("2"));
        assert_eq!(value_after(&args, "-f"), Some("opus"));
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
    }

    #[test]
    fn test_seek_precedes_input() {
        let args = EncodeArgs {
            seek: Duration::from_secs(30),
            ..EncodeArgs::default()
        }
        .to_ffmpeg_args("in.mp3");
        let ss = args.iter().position(|a| a == "-ss").unwrap();
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert!(ss < input);
    }

    #[test]
    fn test_zero_seek_is_omitted() {
        let args = EncodeArgs::default().to_ffmpeg_args("in.mp3");
        assert!(!args.iter().any(|a| a == "-ss"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let transcoder = FfmpegTranscoder::new("/nonexistent/ffmpeg-binary");
        let err = transcoder
            .spawn("in.mp3", &EncodeArgs::default())
            .err()
            .unwrap();
        assert!(matches!(err, PlaybackError::Spawn(_)));
    }
}
