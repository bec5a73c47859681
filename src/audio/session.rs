//! EncoderSession: lifecycle of one transcoder run, its buffer and its pacer.
//!
//! ```text
//! Idle ──start──▶ Encoding ──▶ Streaming ⇄ Paused
//!   ▲                              │
//!   └──────── Stopped ◀──stop──────┘   (or end of stream / error)
//! ```
//!
//! Each run is owned by a supervisor task. Commands reach it through the
//! shared state (stop token) or a small control channel (pause). The
//! supervisor is the only one that tears a run down, and it publishes
//! `Idle` on the phase watch only after the transcoder is reaped and both
//! readers have exited; `stop` waits on that watch instead of polling.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    audio::{
        ffmpeg::{EncodeArgs, Transcoder},
        frame::{FrameBuffer, FrameDuration},
        pacer::{PacerConfig, PacerExit, StreamPacer},
        source::{FrameSource, SourceOutcome},
    },
    config::Config,
    error::{PlaybackError, Result},
    voice::FrameSink,
};

pub const MIN_VOLUME: f64 = 0.1;
pub const MAX_VOLUME: f64 = 1.5;

/// Validates a requested gain and clamps it into the supported range.
pub fn clamp_volume(volume: f64) -> Result<f64> {
    if !volume.is_finite() {
        return Err(PlaybackError::UserInput(format!("invalid volume: {volume}")));
    }
    Ok(volume.clamp(MIN_VOLUME, MAX_VOLUME))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// Transcoder starting, no frame delivered yet.
    Encoding,
    Streaming,
    Paused,
    /// Teardown requested, waiting for the run to finish.
    Stopped,
}

/// How a track ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackEnd {
    /// Every frame was delivered.
    Finished,
    /// Cut short by `stop`.
    Stopped,
}

pub type TrackResult = Result<TrackEnd>;

/// Resolves exactly once, after the session is back to `Idle`.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<TrackResult>,
}

impl Future for Completion {
    type Output = TrackResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| {
            result.unwrap_or_else(|_| Err(PlaybackError::Stream("session dropped".into())))
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartRequest {
    pub url: String,
    pub seek: Duration,
    pub bitrate: u32,
}

/// Fixed parameters shared by every run of a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub pacer: PacerConfig,
    pub buffer_window: Duration,
    pub encode: EncodeArgs,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pacer: PacerConfig::default(),
            buffer_window: Duration::from_secs(15),
            encode: EncodeArgs::default(),
        }
    }
}

impl From<&Config> for SessionConfig {
    fn from(config: &Config) -> Self {
        let frame = config.frame_duration();
        Self {
            pacer: PacerConfig {
                frame,
                send_timeout: config.send_timeout(),
                ..PacerConfig::default()
            },
            buffer_window: Duration::from_millis(config.buffer_ms),
            encode: EncodeArgs {
                volume: config.default_volume,
                bitrate: config.opus_bitrate,
                frame_duration: frame,
                compression_level: config.compression_level,
                ..EncodeArgs::default()
            },
        }
    }
}

enum Control {
    Pause(bool, oneshot::Sender<()>),
}

struct RunHandle {
    url: String,
    bitrate: u32,
    sink: FrameSink,
    stop: CancellationToken,
    control: mpsc::Sender<Control>,
}

struct SessionState {
    phase: Phase,
    volume: f64,
    paused: bool,
    frames_sent: u64,
    seek: Duration,
    run: Option<RunHandle>,
    done: Option<oneshot::Sender<TrackResult>>,
    /// Set while `set_volume` swaps runs; the finishing run keeps `done`
    /// and leaves its result in `swapped`.
    restarting: bool,
    swapped: Option<TrackResult>,
}

struct Shared {
    state: Mutex<SessionState>,
    /// Serializes start/stop/pause/volume.
    control: tokio::sync::Mutex<()>,
    phase_tx: watch::Sender<Phase>,
    transcoder: Arc<dyn Transcoder>,
    config: SessionConfig,
}

impl Shared {
    fn frame(&self) -> FrameDuration {
        self.config.pacer.frame
    }

    /// Moves between Encoding, Streaming and Paused; never overrides Stopped.
    fn advance_phase(&self, phase: Phase) {
        let mut state = self.state.lock();
        if state.phase == Phase::Stopped || state.phase == Phase::Idle {
            return;
        }
        state.phase = phase;
        self.phase_tx.send_replace(phase);
    }

    fn finish(&self, result: TrackResult) {
        let done = {
            let mut state = self.state.lock();
            state.phase = Phase::Idle;
            state.run = None;
            if state.restarting {
                state.swapped = Some(result.clone());
                None
            } else {
                state.done.take()
            }
        };
        self.phase_tx.send_replace(Phase::Idle);
        if let Some(done) = done {
            let _ = done.send(result);
        }
    }
}

/// One transcoder + buffer + pacer at a time, restartable.
#[derive(Clone)]
pub struct EncoderSession {
    shared: Arc<Shared>,
}

impl EncoderSession {
    pub fn new(transcoder: Arc<dyn Transcoder>, config: SessionConfig) -> Self {
        let (phase_tx, _) = watch::channel(Phase::Idle);
        let volume = config.encode.volume;
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState {
                    phase: Phase::Idle,
                    volume,
                    paused: false,
                    frames_sent: 0,
                    seek: Duration::ZERO,
                    run: None,
                    done: None,
                    restarting: false,
                    swapped: None,
                }),
                control: tokio::sync::Mutex::new(()),
                phase_tx,
                transcoder,
                config,
            }),
        }
    }

    /// Starts a run. Fails with `AlreadyEncoding` unless the session is Idle;
    /// every later failure, spawn included, arrives on the [`Completion`].
    pub async fn start(&self, request: StartRequest, sink: FrameSink) -> Result<Completion> {
        let _control = self.shared.control.lock().await;
        let (tx, rx) = oneshot::channel();
        self.launch(request, sink, Some(tx))?;
        Ok(Completion { rx })
    }

    fn launch(
        &self,
        request: StartRequest,
        sink: FrameSink,
        done: Option<oneshot::Sender<TrackResult>>,
    ) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.phase != Phase::Idle {
            return Err(PlaybackError::AlreadyEncoding);
        }

        let args = EncodeArgs {
            seek: request.seek,
            volume: state.volume,
            bitrate: request.bitrate,
            ..self.shared.config.encode.clone()
        };
        let stop = CancellationToken::new();
        let (control_tx, control_rx) = mpsc::channel(4);

        state.phase = Phase::Encoding;
        state.frames_sent = 0;
        state.seek = request.seek;
        if done.is_some() {
            state.done = done;
        }
        state.run = Some(RunHandle {
            url: request.url.clone(),
            bitrate: request.bitrate,
            sink: sink.clone(),
            stop: stop.clone(),
            control: control_tx,
        });
        let paused = state.paused;
        drop(state);

        self.shared.phase_tx.send_replace(Phase::Encoding);
        info!(
            "🎬 Sesión iniciada (seek {:?}, volumen {:.2})",
            request.seek, args.volume
        );

        let run = Run {
            shared: self.shared.clone(),
            url: request.url,
            args,
            sink,
            paused,
            stop,
            control: control_rx,
        };
        tokio::spawn(run.supervise());
        Ok(())
    }

    /// Stops the current run and waits until the session is Idle. Idempotent.
    pub async fn stop(&self) {
        let _control = self.shared.control.lock().await;
        self.stop_locked().await;
    }

    async fn stop_locked(&self) {
        let mut phase = self.shared.phase_tx.subscribe();
        {
            let mut state = self.shared.state.lock();
            if let Some(run) = &state.run {
                run.stop.cancel();
                state.phase = Phase::Stopped;
                self.shared.phase_tx.send_replace(Phase::Stopped);
            }
        }
        let _ = phase.wait_for(|p| *p == Phase::Idle).await;
    }

    /// Pausing halts only the pacer; the transcoder keeps filling the buffer
    /// until backpressure stops it. Returns once the pacer has reacted.
    pub async fn set_paused(&self, paused: bool) {
        let _control = self.shared.control.lock().await;
        let control = {
            let mut state = self.shared.state.lock();
            state.paused = paused;
            match &state.run {
                Some(run) => run.control.clone(),
                None => return,
            }
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if control.send(Control::Pause(paused, ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Stores the gain and, while encoding, restarts the run at the elapsed
    /// position so the new gain applies without replaying from zero. The
    /// pending [`Completion`] keeps waiting on the new run.
    pub async fn set_volume(&self, volume: f64) -> Result<f64> {
        let volume = clamp_volume(volume)?;
        let _control = self.shared.control.lock().await;

        let resume = {
            let mut state = self.shared.state.lock();
            state.volume = volume;
            match &state.run {
                Some(run) if state.phase != Phase::Stopped => {
                    let resume = (run.url.clone(), run.bitrate, run.sink.clone());
                    state.restarting = true;
                    Some(resume)
                }
                _ => None,
            }
        };
        let Some((url, bitrate, sink)) = resume else {
            return Ok(volume);
        };

        self.stop_locked().await;
        let (seek, ended) = {
            let mut state = self.shared.state.lock();
            state.restarting = false;
            let seek = state.seek + self.shared.frame().elapsed(state.frames_sent);
            (seek, state.swapped.take())
        };

        // la ejecución terminó sola durante el cambio: su resultado manda
        if let Some(result) = ended.filter(|r| *r != Ok(TrackEnd::Stopped)) {
            debug!("🔊 La pista terminó durante el cambio de volumen: {:?}", result);
            if let Some(done) = self.shared.state.lock().done.take() {
                let _ = done.send(result);
            }
            return Ok(volume);
        }

        debug!("🔊 Reiniciando en {:?} con volumen {:.2}", seek, volume);
        self.launch(StartRequest { url, seek, bitrate }, sink, None)?;
        Ok(volume)
    }

    /// Playback position: start offset plus delivered frames.
    pub fn current_time(&self) -> Duration {
        let state = self.shared.state.lock();
        state.seek + self.shared.frame().elapsed(state.frames_sent)
    }

    pub fn phase(&self) -> Phase {
        self.shared.state.lock().phase
    }

    /// True from `start` until the run is fully torn down.
    pub fn is_encoding(&self) -> bool {
        self.phase() != Phase::Idle
    }

    pub fn is_paused(&self) -> bool {
        self.shared.state.lock().paused
    }

    pub fn volume(&self) -> f64 {
        self.shared.state.lock().volume
    }

    pub fn frames_sent(&self) -> u64 {
        self.shared.state.lock().frames_sent
    }

    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.shared.phase_tx.subscribe()
    }
}

struct PacerTask {
    cancel: CancellationToken,
    handle: JoinHandle<PacerExit>,
}

enum Event {
    Stop,
    Control(Control),
    Source(SourceOutcome),
    Pacer(PacerExit),
}

/// Everything one supervisor owns.
struct Run {
    shared: Arc<Shared>,
    url: String,
    args: EncodeArgs,
    sink: FrameSink,
    paused: bool,
    stop: CancellationToken,
    control: mpsc::Receiver<Control>,
}

impl Run {
    async fn supervise(mut self) {
        let config = &self.shared.config;
        let buffer = FrameBuffer::for_window(config.buffer_window, config.pacer.frame);

        let mut source = match FrameSource::start(
            self.shared.transcoder.as_ref(),
            &self.url,
            &self.args,
            buffer.clone(),
        ) {
            Ok(source) => source,
            Err(e) => {
                error!("❌ No se pudo iniciar el transcoder: {}", e);
                self.shared.finish(Err(e));
                return;
            }
        };

        let mut pacer = if self.paused {
            self.shared.advance_phase(Phase::Paused);
            None
        } else {
            self.shared.advance_phase(Phase::Streaming);
            Some(self.spawn_pacer(&buffer))
        };

        let result: TrackResult = loop {
            let event = tokio::select! {
                biased;
                _ = self.stop.cancelled() => Event::Stop,
                Some(command) = self.control.recv() => Event::Control(command),
                outcome = source.wait(), if !source.is_settled() => Event::Source(outcome),
                exit = wait_pacer(&mut pacer) => Event::Pacer(exit),
            };

            match event {
                Event::Stop => break Ok(TrackEnd::Stopped),
                Event::Source(SourceOutcome::Failed(e)) => break Err(e),
                // el pacer todavía tiene que leer el sentinel
                Event::Source(_) => {}
                Event::Pacer(exit) => {
                    if let Some(result) = settle_exit(exit, &self.stop, &mut source).await {
                        break result;
                    }
                }
                Event::Control(Control::Pause(true, ack)) => {
                    let exit = match pacer.take() {
                        Some(task) => {
                            task.cancel.cancel();
                            join_pacer(task).await
                        }
                        None => PacerExit::Cancelled,
                    };
                    self.shared.advance_phase(Phase::Paused);
                    let _ = ack.send(());
                    if let Some(result) = settle_exit(exit, &self.stop, &mut source).await {
                        break result;
                    }
                }
                Event::Control(Control::Pause(false, ack)) => {
                    if pacer.is_none() {
                        pacer = Some(self.spawn_pacer(&buffer));
                    }
                    self.shared.advance_phase(Phase::Streaming);
                    let _ = ack.send(());
                }
            }
        };

        // desmontaje: pacer, proceso y lectores, buffer
        if let Some(task) = pacer.take() {
            task.cancel.cancel();
            join_pacer(task).await;
        }
        source.cancel();
        let outcome = source.wait().await;
        let dropped = buffer.drain();
        debug!(
            "🧹 Sesión desmontada ({:?}, {} frames descartados)",
            outcome, dropped
        );

        match &result {
            Ok(end) => info!("⏹️ Pista terminada: {:?}", end),
            Err(e) => warn!("⚠️ Pista terminada con error: {}", e),
        }
        self.shared.finish(result);
    }

    fn spawn_pacer(&self, buffer: &FrameBuffer) -> PacerTask {
        let cancel = CancellationToken::new();
        let pacer = StreamPacer::new(buffer.clone(), self.sink.clone(), self.shared.config.pacer);
        let counter = self.shared.clone();
        let handle = tokio::spawn(pacer.run(cancel.clone(), move || {
            counter.state.lock().frames_sent += 1;
        }));
        PacerTask { cancel, handle }
    }
}

/// Turns a pacer exit into the run's result, if it ends the run.
async fn settle_exit(
    exit: PacerExit,
    stop: &CancellationToken,
    source: &mut FrameSource,
) -> Option<TrackResult> {
    match exit {
        PacerExit::Cancelled => None,
        PacerExit::Failed(e) => Some(Err(e)),
        PacerExit::EndOfStream => {
            let outcome = tokio::select! {
                biased;
                _ = stop.cancelled() => return Some(Ok(TrackEnd::Stopped)),
                outcome = source.wait() => outcome,
            };
            Some(match outcome {
                SourceOutcome::Failed(e) => Err(e),
                _ => Ok(TrackEnd::Finished),
            })
        }
    }
}

async fn join_pacer(task: PacerTask) -> PacerExit {
    task.handle
        .await
        .unwrap_or_else(|e| PacerExit::Failed(PlaybackError::Stream(format!("pacer task failed: {e}"))))
}

/// Waits for the running pacer; pending forever when there is none.
async fn wait_pacer(pacer: &mut Option<PacerTask>) -> PacerExit {
    let exit = match pacer.as_mut() {
        Some(task) => (&mut task.handle).await.unwrap_or_else(|e| {
            PacerExit::Failed(PlaybackError::Stream(format!("pacer task failed: {e}")))
        }),
        None => std::future::pending().await,
    };
    *pacer = None;
    exit
}
