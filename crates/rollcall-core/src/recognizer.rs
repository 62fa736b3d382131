//! Face embedding model interface and its ONNX Runtime backend.
//!
//! The model contract (input layout, input resolution, output length) is
//! read from the model once at load time and validated; inference then
//! only checks that the produced vector has the advertised length.

use crate::tensor::FaceTensor;
use crate::types::Embedding;
use ndarray::{Array4, Axis};
use ort::session::Session;
use ort::value::{TensorRef, ValueType};
use std::path::Path;
use thiserror::Error;

/// Resolution assumed when the model leaves its spatial dims symbolic.
const DEFAULT_INPUT_SIZE: u32 = 112;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model file not found: {0}; place the embedding model in the models directory")]
    ModelNotFound(String),
    #[error("unexpected model shape: {0}")]
    ShapeMismatch(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Black-box embedding model: normalized face tensor in, fixed-length vector out.
///
/// Implementations are not required to be reentrant; the frame pipeline
/// guarantees at most one call in flight.
pub trait EmbeddingModel: Send {
    /// Square input resolution the model expects.
    fn input_size(&self) -> u32;
    /// Length of every embedding this model produces.
    fn output_len(&self) -> usize;
    fn infer(&mut self, tensor: &FaceTensor) -> Result<Embedding, ModelError>;
}

/// Memory layout of the model's image input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputLayout {
    /// [1, 3, H, W]. Typical of ArcFace exports.
    Nchw,
    /// [1, H, W, 3]. Typical of MobileFaceNet conversions.
    Nhwc,
}

/// ONNX-backed embedding model.
pub struct OnnxEmbedder {
    session: Session,
    layout: InputLayout,
    input_size: u32,
    output_len: usize,
}

impl OnnxEmbedder {
    /// Load the model and read its input/output contract.
    pub fn load(model_path: &str) -> Result<Self, ModelError> {
        if !Path::new(model_path).exists() {
            return Err(ModelError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let input_dims = session
            .inputs()
            .first()
            .and_then(|i| tensor_dims(i.dtype()))
            .ok_or_else(|| ModelError::ShapeMismatch("model has no tensor input".into()))?;
        let output_dims = session
            .outputs()
            .first()
            .and_then(|o| tensor_dims(o.dtype()))
            .ok_or_else(|| ModelError::ShapeMismatch("model has no tensor output".into()))?;

        let (layout, input_size) = parse_input_dims(&input_dims)?;
        let output_len = parse_output_dims(&output_dims)?;

        tracing::info!(
            path = model_path,
            ?layout,
            input_size,
            output_len,
            "loaded embedding model"
        );

        Ok(Self {
            session,
            layout,
            input_size,
            output_len,
        })
    }

    pub fn layout(&self) -> InputLayout {
        self.layout
    }
}

impl EmbeddingModel for OnnxEmbedder {
    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn output_len(&self) -> usize {
        self.output_len
    }

    fn infer(&mut self, tensor: &FaceTensor) -> Result<Embedding, ModelError> {
        if tensor.size() != self.input_size as usize {
            return Err(ModelError::ShapeMismatch(format!(
                "tensor is {0}x{0}, model expects {1}x{1}",
                tensor.size(),
                self.input_size
            )));
        }

        let input = to_batch(tensor, self.layout);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw_data.len() != self.output_len {
            return Err(ModelError::InferenceFailed(format!(
                "expected {}-dim embedding, got {}",
                self.output_len,
                raw_data.len()
            )));
        }

        Ok(Embedding::new(raw_data.to_vec()))
    }
}

fn tensor_dims(value_type: &ValueType) -> Option<Vec<i64>> {
    match value_type {
        ValueType::Tensor { shape, .. } => Some(shape.iter().copied().collect()),
        _ => None,
    }
}

/// Interpret a rank-4 image input. Symbolic (negative) spatial dims fall
/// back to [`DEFAULT_INPUT_SIZE`]; non-square inputs are rejected.
fn parse_input_dims(dims: &[i64]) -> Result<(InputLayout, u32), ModelError> {
    if dims.len() != 4 {
        return Err(ModelError::ShapeMismatch(format!(
            "expected rank-4 image input, got {dims:?}"
        )));
    }

    let (layout, h, w) = if dims[1] == 3 {
        (InputLayout::Nchw, dims[2], dims[3])
    } else if dims[3] == 3 {
        (InputLayout::Nhwc, dims[1], dims[2])
    } else {
        return Err(ModelError::ShapeMismatch(format!(
            "input has no 3-channel axis: {dims:?}"
        )));
    };

    let size = match (h, w) {
        (h, w) if h <= 0 && w <= 0 => DEFAULT_INPUT_SIZE,
        (h, w) if h == w && h > 0 => h as u32,
        _ => {
            return Err(ModelError::ShapeMismatch(format!(
                "input must be square, got {h}x{w}"
            )))
        }
    };

    Ok((layout, size))
}

fn parse_output_dims(dims: &[i64]) -> Result<usize, ModelError> {
    match dims.last() {
        Some(&len) if len > 0 && dims[..dims.len() - 1].iter().all(|&d| d <= 1) => {
            Ok(len as usize)
        }
        _ => Err(ModelError::ShapeMismatch(format!(
            "expected [1, N] embedding output with fixed N, got {dims:?}"
        ))),
    }
}

/// Add the batch axis and permute to the model's layout.
fn to_batch(tensor: &FaceTensor, layout: InputLayout) -> Array4<f32> {
    let hwc = tensor.view().insert_axis(Axis(0));
    match layout {
        InputLayout::Nhwc => hwc.to_owned(),
        // (1, H, W, C) -> (1, C, H, W)
        InputLayout::Nchw => hwc.permuted_axes([0, 3, 1, 2]).as_standard_layout().into_owned(),
    }
}
