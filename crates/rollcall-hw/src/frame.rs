//! Raw frame types and color conversion: YUV 4:2:0 and BGRA to RGB.

use image::{Rgb, RgbImage};

/// Pixel layout of a raw sensor buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUV 4:2:0 with planes [Y, U, V]. Covers fully planar (I420,
    /// chroma pixel stride 1) and semi-planar (NV12/NV21, chroma pixel
    /// stride 2) buffers.
    Yuv420,
    /// Packed 32-bit, bytes B, G, R, A per pixel. One plane.
    Bgra8888,
    /// Anything else the driver reports, by FourCC.
    Other([u8; 4]),
}

/// Where one plane lives inside a frame's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    /// Byte offset of the plane's first sample.
    pub offset: usize,
    /// Bytes between vertically adjacent samples.
    pub row_stride: usize,
    /// Bytes between horizontally adjacent samples.
    pub pixel_stride: usize,
}

/// Buffer geometry negotiated with the driver, reused for every frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameLayout {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub planes: Vec<PlaneLayout>,
}

impl FrameLayout {
    /// Derive plane layout from a V4L2 FourCC and the driver's
    /// `bytesperline` for the first plane.
    pub fn from_fourcc(fourcc: [u8; 4], width: u32, height: u32, stride: usize) -> Self {
        let rows = height as usize;
        let chroma_rows = rows.div_ceil(2);
        let luma = PlaneLayout {
            offset: 0,
            row_stride: stride,
            pixel_stride: 1,
        };

        let (format, planes) = match &fourcc {
            b"YU12" | b"YV12" => {
                let chroma_stride = stride.div_ceil(2);
                let first = stride * rows;
                let second = first + chroma_stride * chroma_rows;
                let (u, v) = if &fourcc == b"YU12" {
                    (first, second)
                } else {
                    (second, first)
                };
                let chroma = |offset| PlaneLayout {
                    offset,
                    row_stride: chroma_stride,
                    pixel_stride: 1,
                };
                (PixelFormat::Yuv420, vec![luma, chroma(u), chroma(v)])
            }
            b"NV12" | b"NV21" => {
                let uv = stride * rows;
                let (u, v) = if &fourcc == b"NV12" {
                    (uv, uv + 1)
                } else {
                    (uv + 1, uv)
                };
                let chroma = |offset| PlaneLayout {
                    offset,
                    row_stride: stride,
                    pixel_stride: 2,
                };
                (PixelFormat::Yuv420, vec![luma, chroma(u), chroma(v)])
            }
            b"BGR4" | b"AR24" | b"XR24" => (
                PixelFormat::Bgra8888,
                vec![PlaneLayout {
                    offset: 0,
                    row_stride: stride,
                    pixel_stride: 4,
                }],
            ),
            _ => (PixelFormat::Other(fourcc), vec![luma]),
        };

        Self {
            format,
            width,
            height,
            planes,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self.format, PixelFormat::Other(_))
    }
}

/// A raw camera frame: one byte buffer plus the layout describing it.
#[derive(Clone)]
pub struct RawFrame {
    pub data: Vec<u8>,
    pub layout: FrameLayout,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl RawFrame {
    pub fn width(&self) -> u32 {
        self.layout.width
    }

    pub fn height(&self) -> u32 {
        self.layout.height
    }

    /// Decode to RGB. Stateless; see [`to_rgb`].
    pub fn to_rgb(&self) -> Result<RgbImage, FrameError> {
        to_rgb(&self.data, &self.layout)
    }
}

/// Convert a raw buffer to an RGB raster of the same width and height.
///
/// YUV uses the BT.601 full-range coefficients with 2×2 chroma
/// subsampling. BGRA is reordered without any color transform; alpha is
/// dropped.
pub fn to_rgb(data: &[u8], layout: &FrameLayout) -> Result<RgbImage, FrameError> {
    let (width, height) = (layout.width, layout.height);
    if width == 0 || height == 0 {
        return Err(FrameError::ZeroDimension { width, height });
    }

    match layout.format {
        PixelFormat::Yuv420 => {
            let [y_plane, u_plane, v_plane] = planes::<3>(layout)?;
            let (last_x, last_y) = (width as usize - 1, height as usize - 1);
            check_plane(data, "Y", y_plane, last_x, last_y)?;
            check_plane(data, "U", u_plane, last_x / 2, last_y / 2)?;
            check_plane(data, "V", v_plane, last_x / 2, last_y / 2)?;

            Ok(RgbImage::from_fn(width, height, |x, y| {
                let (x, y) = (x as usize, y as usize);
                let luma = data[y_plane.offset + y * y_plane.row_stride + x * y_plane.pixel_stride];
                let u = data[u_plane.offset + (y / 2) * u_plane.row_stride + (x / 2) * u_plane.pixel_stride];
                let v = data[v_plane.offset + (y / 2) * v_plane.row_stride + (x / 2) * v_plane.pixel_stride];
                yuv_to_rgb(luma, u, v)
            }))
        }
        PixelFormat::Bgra8888 => {
            let [plane] = planes::<1>(layout)?;
            let (last_x, last_y) = (width as usize - 1, height as usize - 1);
            // The alpha byte of the final pixel must be in bounds too.
            check_plane(data, "BGRA", PlaneLayout { offset: plane.offset + 3, ..plane }, last_x, last_y)?;

            Ok(RgbImage::from_fn(width, height, |x, y| {
                let i = plane.offset + y as usize * plane.row_stride + x as usize * plane.pixel_stride;
                Rgb([data[i + 2], data[i + 1], data[i]])
            }))
        }
        PixelFormat::Other(fourcc) => Err(FrameError::UnsupportedFormat(
            String::from_utf8_lossy(&fourcc).into_owned(),
        )),
    }
}

/// BT.601 full-range YUV → RGB for a single sample.
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> Rgb<u8> {
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;

    let r = y + 1.370705 * v;
    let g = y - 0.337633 * u - 0.698001 * v;
    let b = y + 1.732446 * u;

    Rgb([clamp_u8(r), clamp_u8(g), clamp_u8(b)])
}

fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

fn planes<const N: usize>(layout: &FrameLayout) -> Result<[PlaneLayout; N], FrameError> {
    <[PlaneLayout; N]>::try_from(layout.planes.as_slice()).map_err(|_| FrameError::PlaneCount {
        expected: N,
        actual: layout.planes.len(),
    })
}

fn check_plane(
    data: &[u8],
    name: &'static str,
    plane: PlaneLayout,
    last_x: usize,
    last_y: usize,
) -> Result<(), FrameError> {
    let needed = plane.offset + last_y * plane.row_stride + last_x * plane.pixel_stride + 1;
    if data.len() < needed {
        return Err(FrameError::PlaneTooShort {
            plane: name,
            needed,
            actual: data.len(),
        });
    }
    Ok(())
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("unsupported pixel format: {0}")]
    UnsupportedFormat(String),
    #[error("degenerate frame: {width}x{height}")]
    ZeroDimension { width: u32, height: u32 },
    #[error("expected {expected} planes, got {actual}")]
    PlaneCount { expected: usize, actual: usize },
    #[error("{plane} plane too short: need {needed} bytes, buffer has {actual}")]
    PlaneTooShort {
        plane: &'static str,
        needed: usize,
        actual: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tightly packed I420 buffer for a `w`×`h` frame.
    fn i420(w: u32, h: u32, y: impl Fn(u32, u32) -> u8, u: u8, v: u8) -> (Vec<u8>, FrameLayout) {
        let layout = FrameLayout::from_fourcc(*b"YU12", w, h, w as usize);
        let cw = (w as usize).div_ceil(2);
        let ch = (h as usize).div_ceil(2);
        let mut data = Vec::with_capacity(w as usize * h as usize + 2 * cw * ch);
        for row in 0..h {
            for col in 0..w {
                data.push(y(col, row));
            }
        }
        data.extend(std::iter::repeat(u).take(cw * ch));
        data.extend(std::iter::repeat(v).take(cw * ch));
        (data, layout)
    }

    #[test]
    fn test_neutral_chroma_is_gray() {
        let (data, layout) = i420(4, 2, |x, _| (x * 60) as u8, 128, 128);
        let rgb = to_rgb(&data, &layout).unwrap();
        for x in 0..4 {
            let g = (x * 60) as u8;
            assert_eq!(rgb.get_pixel(x, 0), &Rgb([g, g, g]));
            assert_eq!(rgb.get_pixel(x, 1), &Rgb([g, g, g]));
        }
    }

    #[test]
    fn test_bt601_coefficients() {
        // Y=100, U=150, V=90 by hand:
        // R = 100 + 1.370705*(-38)                  = 47.91  -> 48
        // G = 100 - 0.337633*22 - 0.698001*(-38)    = 119.10 -> 119
        // B = 100 + 1.732446*22                     = 138.11 -> 138
        assert_eq!(yuv_to_rgb(100, 150, 90), Rgb([48, 119, 138]));
    }

    #[test]
    fn test_output_clamped() {
        assert_eq!(yuv_to_rgb(255, 255, 255), Rgb([255, 123, 255]));
        assert_eq!(yuv_to_rgb(0, 0, 0), Rgb([0, 133, 0]));
    }

    #[test]
    fn test_all_yuv_inputs_stay_in_range_and_size() {
        for (w, h) in [(1, 1), (2, 2), (3, 5), (17, 9)] {
            let (data, layout) = i420(w, h, |x, y| ((x * 31 + y * 17) % 256) as u8, 20, 240);
            let rgb = to_rgb(&data, &layout).unwrap();
            assert_eq!(rgb.dimensions(), (w, h));
        }
    }

    #[test]
    fn test_chroma_subsampling_shared_by_2x2_block() {
        // 4x2 I420 with distinct chroma per 2x2 block.
        let mut layout = FrameLayout::from_fourcc(*b"YU12", 4, 2, 4);
        let mut data = vec![128u8; 8];
        data.extend([60, 200]); // U for blocks (0,0), (1,0)
        data.extend([200, 60]); // V
        let rgb = to_rgb(&data, &layout).unwrap();
        assert_eq!(rgb.get_pixel(0, 0), rgb.get_pixel(1, 1));
        assert_eq!(rgb.get_pixel(2, 0), rgb.get_pixel(3, 1));
        assert_ne!(rgb.get_pixel(0, 0), rgb.get_pixel(2, 0));

        // Same frame, row stride padded to 8 bytes for luma and 4 for chroma.
        layout = FrameLayout::from_fourcc(*b"YU12", 4, 2, 8);
        let mut padded = Vec::new();
        padded.extend([128, 128, 128, 128, 0, 0, 0, 0]);
        padded.extend([128, 128, 128, 128, 0, 0, 0, 0]);
        padded.extend([60, 200, 0, 0]);
        padded.extend([200, 60, 0, 0]);
        let rgb_padded = to_rgb(&padded, &layout).unwrap();
        assert_eq!(rgb, rgb_padded);
    }

    #[test]
    fn test_nv12_matches_i420() {
        let (planar, planar_layout) = i420(4, 4, |x, y| (x * 40 + y * 10) as u8, 90, 170);
        let mut semi = planar[..16].to_vec();
        for _ in 0..4 {
            semi.extend([90, 170]);
        }
        let nv12 = FrameLayout::from_fourcc(*b"NV12", 4, 4, 4);
        assert_eq!(
            to_rgb(&planar, &planar_layout).unwrap(),
            to_rgb(&semi, &nv12).unwrap()
        );

        let mut swapped = planar[..16].to_vec();
        for _ in 0..4 {
            swapped.extend([170, 90]);
        }
        let nv21 = FrameLayout::from_fourcc(*b"NV21", 4, 4, 4);
        assert_eq!(
            to_rgb(&planar, &planar_layout).unwrap(),
            to_rgb(&swapped, &nv21).unwrap()
        );
    }

    #[test]
    fn test_bgra_reorders_channels() {
        let layout = FrameLayout::from_fourcc(*b"AR24", 2, 1, 8);
        let data = vec![10, 20, 30, 255, 40, 50, 60, 0];
        let rgb = to_rgb(&data, &layout).unwrap();
        assert_eq!(rgb.get_pixel(0, 0), &Rgb([30, 20, 10]));
        assert_eq!(rgb.get_pixel(1, 0), &Rgb([60, 50, 40]));
    }

    #[test]
    fn test_bgra_respects_row_stride() {
        let layout = FrameLayout::from_fourcc(*b"BGR4", 1, 2, 8);
        let data = vec![1, 2, 3, 4, 9, 9, 9, 9, 5, 6, 7, 8];
        let rgb = to_rgb(&data, &layout).unwrap();
        assert_eq!(rgb.get_pixel(0, 1), &Rgb([7, 6, 5]));
    }

    #[test]
    fn test_unsupported_format() {
        let layout = FrameLayout::from_fourcc(*b"YUYV", 2, 2, 4);
        assert!(!layout.is_supported());
        assert_eq!(
            to_rgb(&[0; 8], &layout),
            Err(FrameError::UnsupportedFormat("YUYV".into()))
        );
    }

    #[test]
    fn test_short_buffer_rejected() {
        let (mut data, layout) = i420(4, 4, |_, _| 0, 128, 128);
        data.truncate(data.len() - 1);
        assert!(matches!(
            to_rgb(&data, &layout),
            Err(FrameError::PlaneTooShort { plane: "V", .. })
        ));

        let bgra = FrameLayout::from_fourcc(*b"AR24", 2, 1, 8);
        assert!(matches!(
            to_rgb(&[0; 7], &bgra),
            Err(FrameError::PlaneTooShort { plane: "BGRA", .. })
        ));
    }

    #[test]
    fn test_zero_dimension_rejected() {
        let layout = FrameLayout::from_fourcc(*b"YU12", 0, 4, 0);
        assert_eq!(
            to_rgb(&[], &layout),
            Err(FrameError::ZeroDimension { width: 0, height: 4 })
        );
    }
}
