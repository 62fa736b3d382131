//! Enrollment thumbnails: fixed-size PNG snapshots of the captured frame.

use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, RgbImage};
use std::io::Cursor;
use thiserror::Error;

pub const DEFAULT_THUMBNAIL_SIZE: u32 = 128;

/// File extension thumbnails are stored under.
pub const THUMBNAIL_EXTENSION: &str = "png";

#[derive(Error, Debug)]
pub enum ThumbnailError {
    #[error("cannot thumbnail a {width}x{height} frame")]
    EmptyFrame { width: u32, height: u32 },
    #[error("encode failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Resize `frame` to `size`×`size` and encode it as PNG.
pub fn encode_thumbnail(frame: &RgbImage, size: u32) -> Result<Vec<u8>, ThumbnailError> {
    let (width, height) = frame.dimensions();
    if width == 0 || height == 0 || size == 0 {
        return Err(ThumbnailError::EmptyFrame { width, height });
    }

    let thumb = imageops::resize(frame, size, size, FilterType::Triangle);
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(thumb).write_to(&mut buf, ImageFormat::Png)?;
    Ok(buf.into_inner())
}
