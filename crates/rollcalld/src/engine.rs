use crate::roster::Roster;
use chrono::{DateTime, Utc};
use image::RgbImage;
use rollcall_core::{
    CosineMatcher, DimensionMismatch, Embedding, EmbeddingModel, MatchResult, Matcher, ModelError,
    RecognitionDebouncer, RecognitionEvent, TensorBuilder, TensorError,
};
use rollcall_hw::{CameraError, FrameError, FrameSource, RawFrame};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Startup failures. Fatal to the daemon.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Why a single frame produced no result. Logged, never propagated.
#[derive(Error, Debug)]
enum ProcessError {
    #[error("color conversion: {0}")]
    Frame(#[from] FrameError),
    #[error("tensor: {0}")]
    Tensor(#[from] TensorError),
    #[error("inference: {0}")]
    Model(#[from] ModelError),
    #[error("roster invariant violated: {0}")]
    Invariant(#[from] DimensionMismatch),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Idle,
    Processing,
}

/// Matching parameters fixed at pipeline construction.
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub threshold: f32,
    pub cooldown: Duration,
}

/// The most recent successful inference, kept for enrollment.
#[derive(Clone)]
pub struct Capture {
    pub embedding: Embedding,
    pub frame: Arc<RgbImage>,
    pub at: DateTime<Utc>,
}

pub type LatestCapture = Arc<Mutex<Option<Capture>>>;

/// What the pipeline last concluded, for status queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecognitionStatus {
    /// Matched name; `None` is Unknown.
    pub name: Option<String>,
    /// Distance to the nearest roster entry; `None` when the roster was empty.
    pub distance: Option<f32>,
    /// `1 - distance`, clamped to [0, 1].
    pub confidence: f32,
    pub frames_processed: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl RecognitionStatus {
    fn record(&mut self, result: &MatchResult, at: DateTime<Utc>) {
        let finite = result.distance.is_finite().then_some(result.distance);
        self.name = result.name.clone();
        self.distance = finite;
        self.confidence = finite.map_or(0.0, |d| (1.0 - d).clamp(0.0, 1.0));
        self.frames_processed += 1;
        self.updated_at = Some(at);
    }
}

/// Idle/Processing flag. Acquiring it is the only way into the worker.
#[derive(Clone, Default)]
struct SingleFlight(Arc<AtomicBool>);

impl SingleFlight {
    fn try_acquire(&self) -> Option<FlightPermit> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightPermit(Arc::clone(&self.0)))
    }

    fn is_busy(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Holding this means `Processing`. Dropping it, on any path, means `Idle`.
struct FlightPermit(Arc<AtomicBool>);

impl Drop for FlightPermit {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

enum Msg {
    Frame(RawFrame, FlightPermit),
    Stop,
}

/// Cheap handle for frame sources. Never blocks.
#[derive(Clone)]
pub struct PipelineHandle {
    tx: SyncSender<Msg>,
    flight: SingleFlight,
}

impl PipelineHandle {
    /// Hand a frame to the pipeline. Returns false if it was dropped
    /// because a frame is already in flight.
    pub fn offer(&self, frame: RawFrame) -> bool {
        let Some(permit) = self.flight.try_acquire() else {
            tracing::trace!(sequence = frame.sequence, "pipeline busy; dropping frame");
            return false;
        };
        match self.tx.try_send(Msg::Frame(frame, permit)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn is_processing(&self) -> bool {
        self.flight.is_busy()
    }

    pub fn state(&self) -> PipelineState {
        if self.is_processing() {
            PipelineState::Processing
        } else {
            PipelineState::Idle
        }
    }
}

/// Frame-processing worker on a dedicated OS thread.
pub struct FramePipeline {
    handle: PipelineHandle,
    worker: Option<JoinHandle<()>>,
    status: watch::Receiver<RecognitionStatus>,
    latest: LatestCapture,
}

impl FramePipeline {
    /// Spawn the worker. Debounced matches are sent on `events`; if that
    /// channel is full the event is dropped.
    pub fn spawn(
        model: Box<dyn EmbeddingModel>,
        roster: Arc<Roster>,
        settings: PipelineSettings,
        events: mpsc::Sender<RecognitionEvent>,
    ) -> Result<Self, EngineError> {
        let (tx, rx) = std_mpsc::sync_channel::<Msg>(1);
        let (status_tx, status_rx) = watch::channel(RecognitionStatus::default());
        let latest: LatestCapture = Arc::new(Mutex::new(None));

        let mut worker = Worker {
            tensors: TensorBuilder::new(model.input_size()),
            model,
            matcher: CosineMatcher,
            debouncer: RecognitionDebouncer::new(settings.cooldown),
            threshold: settings.threshold,
            roster,
            latest: Arc::clone(&latest),
            status: status_tx,
            events,
        };

        let handle = std::thread::Builder::new()
            .name("rollcall-engine".into())
            .spawn(move || {
                tracing::info!("engine thread started");
                while let Ok(msg) = rx.recv() {
                    match msg {
                        Msg::Frame(frame, _permit) => worker.run(&frame),
                        Msg::Stop => break,
                    }
                }
                tracing::info!("engine thread exiting");
            })?;

        Ok(Self {
            handle: PipelineHandle {
                tx,
                flight: SingleFlight::default(),
            },
            worker: Some(handle),
            status: status_rx,
            latest,
        })
    }

    pub fn handle(&self) -> PipelineHandle {
        self.handle.clone()
    }

    pub fn status(&self) -> watch::Receiver<RecognitionStatus> {
        self.status.clone()
    }

    pub fn latest(&self) -> LatestCapture {
        Arc::clone(&self.latest)
    }

    /// Stop the worker after any in-flight frame and release the model.
    pub fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.handle.tx.send(Msg::Stop);
            if worker.join().is_err() {
                tracing::error!("engine thread panicked");
            }
        }
    }
}

impl Drop for FramePipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    model: Box<dyn EmbeddingModel>,
    tensors: TensorBuilder,
    matcher: CosineMatcher,
    debouncer: RecognitionDebouncer,
    threshold: f32,
    roster: Arc<Roster>,
    latest: LatestCapture,
    status: watch::Sender<RecognitionStatus>,
    events: mpsc::Sender<RecognitionEvent>,
}

impl Worker {
    fn run(&mut self, frame: &RawFrame) {
        let started = Instant::now();
        match self.process(frame) {
            Ok(result) => tracing::debug!(
                sequence = frame.sequence,
                label = result.label(),
                distance = result.distance,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "frame processed"
            ),
            Err(ProcessError::Invariant(e)) => {
                tracing::error!(sequence = frame.sequence, error = %e, "discarding frame")
            }
            Err(e) => tracing::warn!(sequence = frame.sequence, error = %e, "frame failed"),
        }
    }

    fn process(&mut self, frame: &RawFrame) -> Result<MatchResult, ProcessError> {
        let rgb = frame.to_rgb()?;
        let tensor = self.tensors.build(&rgb)?;
        let embedding = self.model.infer(&tensor)?;
        let now = Utc::now();

        let roster = self.roster.snapshot();
        let result = self.matcher.compare(&embedding, &roster, self.threshold)?;

        *self.latest.lock().unwrap_or_else(|e| e.into_inner()) = Some(Capture {
            embedding,
            frame: Arc::new(rgb),
            at: now,
        });
        self.status.send_modify(|status| status.record(&result, now));

        if result.is_known() {
            // Reserve first: a recognition that cannot be queued must not
            // start the cooldown for that name.
            match self.events.try_reserve() {
                Ok(slot) if self.debouncer.should_emit(&result, Instant::now()) => {
                    let identity = result
                        .name
                        .as_deref()
                        .and_then(|name| roster.iter().find(|e| e.name == name));
                    if let Some(identity) = identity {
                        tracing::info!(name = %identity.name, distance = result.distance, "recognized");
                        slot.send(RecognitionEvent::new(identity, result.distance, now));
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(
                    name = result.label(),
                    error = %e,
                    "event queue unavailable; dropping recognition"
                ),
            }
        }

        Ok(result)
    }
}

/// Where frames come from once the scheduler has started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    Streaming,
    Fallback,
}

enum Control {
    Stop,
    StreamLost(CameraError),
}

/// Connects a frame source to the pipeline: the source's stream when it
/// has one, otherwise still captures on a fixed interval. A stream that
/// dies mid-session is replaced by still captures.
pub struct FrameScheduler {
    source: Arc<Mutex<Box<dyn FrameSource>>>,
    mode: watch::Receiver<SourceMode>,
    control: std_mpsc::Sender<Control>,
    driver: Option<JoinHandle<()>>,
}

impl FrameScheduler {
    pub fn start(
        source: Box<dyn FrameSource>,
        pipeline: PipelineHandle,
        force_still: bool,
        interval: Duration,
    ) -> Result<Self, EngineError> {
        let source = Arc::new(Mutex::new(source));
        let (control, commands) = std_mpsc::channel::<Control>();

        let mut mode = SourceMode::Fallback;
        if !force_still && lock_source(&source).supports_streaming() {
            let handle = pipeline.clone();
            let lost = control.clone();
            let started = lock_source(&source).start_streaming(
                Box::new(move |frame| {
                    handle.offer(frame);
                }),
                Box::new(move |e| {
                    let _ = lost.send(Control::StreamLost(e));
                }),
            );
            match started {
                Ok(()) => mode = SourceMode::Streaming,
                Err(e) => tracing::warn!(error = %e, "streaming failed; falling back to still capture"),
            }
        }
        let (mode_tx, mode_rx) = watch::channel(mode);

        let driver_source = Arc::clone(&source);
        let driver = std::thread::Builder::new()
            .name("rollcall-frames".into())
            .spawn(move || drive(driver_source, pipeline, commands, mode_tx, interval));
        let driver = match driver {
            Ok(driver) => driver,
            Err(e) => {
                lock_source(&source).stop_streaming();
                return Err(e.into());
            }
        };

        match mode {
            SourceMode::Streaming => tracing::info!("frame source: streaming"),
            SourceMode::Fallback => tracing::info!(
                interval_ms = interval.as_millis() as u64,
                "frame source: still capture"
            ),
        }
        Ok(Self {
            source,
            mode: mode_rx,
            control,
            driver: Some(driver),
        })
    }

    pub fn mode(&self) -> SourceMode {
        *self.mode.borrow()
    }

    /// Follows the mode as it changes after a stream is lost.
    pub fn mode_updates(&self) -> watch::Receiver<SourceMode> {
        self.mode.clone()
    }

    /// Stop frame delivery. No frame reaches the pipeline after this returns.
    pub fn stop(&mut self) {
        if let Some(driver) = self.driver.take() {
            let _ = self.control.send(Control::Stop);
            if driver.join().is_err() {
                tracing::error!("frame scheduler thread panicked");
            }
            lock_source(&self.source).stop_streaming();
        }
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Wait out a live stream, then offer a still every `interval` until stopped.
fn drive(
    source: Arc<Mutex<Box<dyn FrameSource>>>,
    pipeline: PipelineHandle,
    commands: std_mpsc::Receiver<Control>,
    mode: watch::Sender<SourceMode>,
    interval: Duration,
) {
    if *mode.borrow() == SourceMode::Streaming {
        match commands.recv() {
            Ok(Control::StreamLost(e)) => {
                tracing::warn!(error = %e, "stream lost; falling back to still capture");
                lock_source(&source).stop_streaming();
                mode.send_replace(SourceMode::Fallback);
            }
            Ok(Control::Stop) | Err(_) => return,
        }
    }

    loop {
        match commands.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) | Ok(Control::StreamLost(_)) => {}
            Ok(Control::Stop) | Err(RecvTimeoutError::Disconnected) => break,
        }
        if pipeline.is_processing() {
            tracing::trace!("previous frame still processing; skipping tick");
            continue;
        }
        match lock_source(&source).take_picture() {
            Ok(frame) => {
                pipeline.offer(frame);
            }
            Err(e) => tracing::warn!(error = %e, "still capture failed"),
        }
    }
}

fn lock_source(
    source: &Mutex<Box<dyn FrameSource>>,
) -> std::sync::MutexGuard<'_, Box<dyn FrameSource>> {
    source.lock().unwrap_or_else(|e| e.into_inner())
}

/// Run `open` up to `attempts` times, pausing `backoff` between failures.
pub fn open_with_retries<T, E: std::fmt::Display>(
    what: &str,
    attempts: u32,
    backoff: Duration,
    mut open: impl FnMut() -> Result<T, E>,
) -> Result<T, E> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match open() {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                tracing::warn!(what, attempt, attempts, error = %e, "open failed; retrying");
                std::thread::sleep(backoff);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
