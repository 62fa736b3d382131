//! rollcall-hw: Hardware abstraction for camera capture.
//!
//! Provides V4L2-based frame sources (continuous streaming or one-shot
//! still capture) and conversion of raw sensor buffers to RGB.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, FrameCallback, FrameSource, StreamLost};
pub use frame::{FrameError, FrameLayout, PixelFormat, PlaneLayout, RawFrame};
