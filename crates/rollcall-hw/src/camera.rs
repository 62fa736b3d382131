//! V4L2 camera capture via the `v4l` crate.
//!
//! A [`Camera`] is a [`FrameSource`]: either push-based (a capture thread
//! hands every dequeued buffer to a callback) or pull-based (one-shot
//! still captures on demand).

use crate::frame::{FrameLayout, RawFrame};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;
/// Longest wait for a frame after STREAMON, and for any single dequeue.
const FRAME_TIMEOUT: Duration = Duration::from_secs(5);
/// How often an idle capture thread looks at its stop flag.
const STOP_POLL_MS: i32 = 500;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// Called on the capture thread for every frame. Must not block.
pub type FrameCallback = Box<dyn FnMut(RawFrame) + Send>;

/// Called at most once, on the capture thread, when a running stream dies
/// on its own. No frame is delivered after it. Must not block.
pub type StreamLost = Box<dyn FnOnce(CameraError) + Send>;

/// A source of raw frames: streaming, still capture, or both.
pub trait FrameSource: Send {
    /// Whether [`start_streaming`](Self::start_streaming) can be used.
    fn supports_streaming(&self) -> bool;

    /// Begin delivering frames to `on_frame` until stopped. Returns only
    /// once the stream is actually running; a stream that cannot start is
    /// an error here, not a silent capture thread exit.
    fn start_streaming(
        &mut self,
        on_frame: FrameCallback,
        on_lost: StreamLost,
    ) -> Result<(), CameraError>;

    /// Stop delivery and wait for the capture thread to exit. After this
    /// returns, `on_frame` is never called again.
    fn stop_streaming(&mut self);

    /// Capture a single frame.
    fn take_picture(&mut self) -> Result<RawFrame, CameraError>;
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

struct StreamWorker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// V4L2 camera device handle.
pub struct Camera {
    device: Arc<Device>,
    pub device_path: String,
    pub fourcc: FourCC,
    /// Negotiated buffer layout, shared by every frame.
    pub layout: FrameLayout,
    streaming_io: bool,
    worker: Option<StreamWorker>,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0").
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::CaptureFailed(format!(
                "{device_path} is not a video capture device"
            )));
        }
        let streaming_io = caps.capabilities.contains(v4l::capability::Flags::STREAMING);

        // Ask for planar YUV 4:2:0; drivers commonly answer with NV12 or BGRA.
        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YU12");
        fmt.width = REQUESTED_WIDTH;
        fmt.height = REQUESTED_HEIGHT;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let layout = FrameLayout::from_fourcc(
            negotiated.fourcc.repr,
            negotiated.width,
            negotiated.height,
            negotiated.stride as usize,
        );
        if !layout.is_supported() {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {:?} (need YU12, YV12, NV12, NV21, or 32-bit BGRA)",
                negotiated.fourcc
            )));
        }

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            stride = negotiated.stride,
            fourcc = ?negotiated.fourcc,
            streaming_io,
            "negotiated format"
        );

        Ok(Self {
            device: Arc::new(device),
            device_path: device_path.to_string(),
            fourcc: negotiated.fourcc,
            layout,
            streaming_io,
            worker: None,
        })
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

impl FrameSource for Camera {
    fn supports_streaming(&self) -> bool {
        self.streaming_io
    }

    fn start_streaming(
        &mut self,
        mut on_frame: FrameCallback,
        on_lost: StreamLost,
    ) -> Result<(), CameraError> {
        if !self.streaming_io {
            return Err(CameraError::StreamingNotSupported);
        }
        if self.worker.is_some() {
            return Err(CameraError::DeviceBusy);
        }

        let device = Arc::clone(&self.device);
        let layout = self.layout.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), CameraError>>(1);

        let handle = std::thread::Builder::new()
            .name("rollcall-capture".into())
            .spawn(move || {
                let mut stream = match open_stream(&device, STREAM_BUFFERS) {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // The stream counts as started once it has produced a frame.
                let first = match stream.next() {
                    Ok((buf, meta)) => raw_frame(buf, meta.sequence, &layout),
                    Err(e) => {
                        let _ = ready_tx.send(Err(CameraError::CaptureFailed(format!(
                            "no frame from stream: {e}"
                        ))));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                tracing::info!("capture stream started");
                on_frame(first);

                let poller = stream.handle();
                let failure = capture_loop(
                    &thread_stop,
                    || poller.poll(libc::POLLIN, STOP_POLL_MS),
                    || {
                        stream
                            .next()
                            .map(|(buf, meta)| raw_frame(buf, meta.sequence, &layout))
                    },
                    &mut on_frame,
                );

                match failure {
                    Some(reason) => {
                        tracing::warn!(reason = %reason, "capture stream lost");
                        on_lost(CameraError::CaptureFailed(reason));
                    }
                    None => tracing::info!("capture stream stopped"),
                }
            })
            .map_err(|e| CameraError::CaptureFailed(format!("failed to spawn capture thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.worker = Some(StreamWorker { stop, handle });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(CameraError::CaptureFailed(
                    "capture thread exited before the stream started".into(),
                ))
            }
        }
    }

    fn stop_streaming(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop.store(true, Ordering::Release);
            if worker.handle.join().is_err() {
                tracing::error!("capture thread panicked");
            }
        }
    }

    fn take_picture(&mut self) -> Result<RawFrame, CameraError> {
        if self.worker.is_some() {
            return Err(CameraError::DeviceBusy);
        }

        let mut stream = open_stream(&self.device, 1)?;
        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        Ok(raw_frame(buf, meta.sequence, &self.layout))
    }
}

/// What the capture loop does after waiting on the device.
#[derive(Debug, PartialEq, Eq)]
enum Wait {
    Idle,
    Ready,
    Failed(String),
}

fn classify_wait(polled: io::Result<i32>) -> Wait {
    match polled {
        Ok(0) => Wait::Idle,
        Ok(_) => Wait::Ready,
        Err(e) if matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::TimedOut) => {
            Wait::Idle
        }
        Err(e) => Wait::Failed(format!("poll failed: {e}")),
    }
}

/// Deliver frames until `stop` is set or the device fails.
///
/// `wait` must return within a bounded time so `stop` is seen even while
/// the sensor produces nothing. Returns the failure, if any.
fn capture_loop(
    stop: &AtomicBool,
    mut wait: impl FnMut() -> io::Result<i32>,
    mut dequeue: impl FnMut() -> io::Result<RawFrame>,
    on_frame: &mut FrameCallback,
) -> Option<String> {
    while !stop.load(Ordering::Acquire) {
        match classify_wait(wait()) {
            Wait::Idle => continue,
            Wait::Ready => {}
            Wait::Failed(reason) => return Some(reason),
        }
        match dequeue() {
            Ok(frame) => on_frame(frame),
            Err(e) => return Some(format!("failed to dequeue buffer: {e}")),
        }
    }
    None
}

/// Map `count` buffers; every dequeue gives up after [`FRAME_TIMEOUT`].
fn open_stream(device: &Device, count: u32) -> Result<MmapStream<'_>, CameraError> {
    let mut stream = MmapStream::with_buffers(device, BufType::VideoCapture, count)
        .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
    stream.set_timeout(FRAME_TIMEOUT);
    Ok(stream)
}

fn raw_frame(buf: &[u8], sequence: u32, layout: &FrameLayout) -> RawFrame {
    RawFrame {
        data: buf.to_vec(),
        layout: layout.clone(),
        timestamp: Instant::now(),
        sequence,
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.stop_streaming();
    }
}
