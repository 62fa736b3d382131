//! Model input preparation: bilinear resize plus symmetric normalization.

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array3;
use thiserror::Error;

const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 127.5; // symmetric: maps [0, 255] onto [-1, 1]

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TensorError {
    #[error("degenerate raster: {width}x{height}")]
    Dimension { width: u32, height: u32 },
}

/// Normalized face tensor, shape (height, width, 3), values in [-1, 1].
#[derive(Debug, Clone)]
pub struct FaceTensor(pub Array3<f32>);

impl FaceTensor {
    /// Side length of the square tensor.
    pub fn size(&self) -> usize {
        self.0.shape()[0]
    }

    pub fn view(&self) -> ndarray::ArrayView3<'_, f32> {
        self.0.view()
    }
}

/// Builds fixed-size model inputs from RGB rasters.
#[derive(Debug, Clone, Copy)]
pub struct TensorBuilder {
    size: u32,
}

impl TensorBuilder {
    /// `size` is the model's square input resolution (e.g. 112).
    pub fn new(size: u32) -> Self {
        Self { size }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn build(&self, rgb: &RgbImage) -> Result<FaceTensor, TensorError> {
        let (width, height) = rgb.dimensions();
        if width == 0 || height == 0 || self.size == 0 {
            return Err(TensorError::Dimension { width, height });
        }

        let resized;
        let src = if width == self.size && height == self.size {
            rgb
        } else {
            resized = imageops::resize(rgb, self.size, self.size, FilterType::Triangle);
            &resized
        };

        let size = self.size as usize;
        let mut tensor = Array3::<f32>::zeros((size, size, 3));
        for (x, y, pixel) in src.enumerate_pixels() {
            for c in 0..3 {
                tensor[[y as usize, x as usize, c]] = (pixel[c] as f32 - PIXEL_MEAN) / PIXEL_STD;
            }
        }

        Ok(FaceTensor(tensor))
    }
}
