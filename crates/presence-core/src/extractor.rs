//! Face embedding extraction.
//!
//! Crops the accepted face with a little context, resizes it to the model's
//! square input, and L2-normalizes the model output. The bundled model is a
//! FaceNet-style ONNX network taking RGB pixels scaled to [0, 1].

use crate::frame::Frame;
use crate::types::{DetectionBox, Embedding};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

pub const DEFAULT_INPUT_SIZE: u32 = 160;
pub const DEFAULT_EMBEDDING_DIM: usize = 512;
/// Padding on every side, as a fraction of the box width.
const CROP_PADDING_FRACTION: f32 = 0.1;

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A face embedding model.
pub trait EmbeddingModel: Send + Sync {
    /// Side length of the square input, in pixels.
    fn input_size(&self) -> u32;

    /// Raw descriptor for a 1×3×S×S RGB tensor with values in [0, 1].
    fn infer(&self, input: &Array4<f32>) -> Result<Vec<f32>, ExtractorError>;
}

/// Extract a unit-length embedding for `face`.
///
/// The caller must already have validated single-face framing; detection is
/// not re-run. Returns `None` on an empty crop or any model failure.
pub fn embed(model: &dyn EmbeddingModel, frame: &Frame, face: &DetectionBox) -> Option<Embedding> {
    if frame.is_empty() {
        return None;
    }

    let Some((x, y, w, h)) = padded_crop(face, frame.width(), frame.height()) else {
        tracing::warn!(?face, "face crop is empty");
        return None;
    };

    let rgb = match frame.to_rgb_image() {
        Ok(rgb) => rgb,
        Err(e) => {
            tracing::error!(error = %e, "frame conversion failed");
            return None;
        }
    };

    let size = model.input_size();
    if size == 0 {
        tracing::error!("embedding model reports zero input size");
        return None;
    }
    let crop = imageops::crop_imm(&rgb, x, y, w, h).to_image();
    let resized = imageops::resize(&crop, size, size, FilterType::Triangle);
    let input = to_tensor(&resized);

    let raw = match model.infer(&input) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::error!(error = %e, crop_width = w, crop_height = h, "embedding extraction failed");
            return None;
        }
    };

    let embedding = Embedding::from_raw(raw);
    if embedding.is_none() {
        tracing::error!("embedding model produced a degenerate vector");
    }
    embedding
}

/// Pixel region `(x, y, width, height)` covering `face` plus symmetric padding,
/// clamped to the frame. Box corners are truncated to whole pixels first.
fn padded_crop(face: &DetectionBox, frame_width: u32, frame_height: u32) -> Option<(u32, u32, u32, u32)> {
    if !face.is_finite() {
        return None;
    }
    // Float-to-int casts saturate at the i64 bounds; the padding math must too.
    let (x1, y1, x2, y2) = (face.x1 as i64, face.y1 as i64, face.x2 as i64, face.y2 as i64);
    let pad = (x2.saturating_sub(x1) as f32 * CROP_PADDING_FRACTION) as i64;

    let x1 = x1.saturating_sub(pad).max(0);
    let y1 = y1.saturating_sub(pad).max(0);
    let x2 = x2.saturating_add(pad).min(frame_width as i64);
    let y2 = y2.saturating_add(pad).min(frame_height as i64);

    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some((x1 as u32, y1 as u32, (x2 - x1) as u32, (y2 - y1) as u32))
}

/// NCHW float tensor with RGB values scaled to [0, 1].
fn to_tensor(face: &RgbImage) -> Array4<f32> {
    let (w, h) = face.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 3, h as usize, w as usize));
    for (x, y, px) in face.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = px.0[c] as f32 / 255.0;
        }
    }
    tensor
}

/// ONNX face embedding network.
pub struct OnnxEmbedder {
    session: Mutex<Session>,
    input_size: u32,
    embedding_dim: usize,
}

impl OnnxEmbedder {
    /// Load an embedding model taking `input_size`² RGB crops and producing
    /// `embedding_dim` values.
    pub fn load(model_path: &Path, input_size: u32, embedding_dim: usize) -> Result<Self, ExtractorError> {
        let path_str = model_path.display().to_string();
        if !model_path.exists() {
            return Err(ExtractorError::ModelNotFound(path_str));
        }

        let session = Session::builder()?
            .with_intra_threads(2)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %path_str,
            input_size,
            embedding_dim,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded embedding model"
        );

        Ok(Self {
            session: Mutex::new(session),
            input_size,
            embedding_dim,
        })
    }
}

impl EmbeddingModel for OnnxEmbedder {
    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn infer(&self, input: &Array4<f32>) -> Result<Vec<f32>, ExtractorError> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| ExtractorError::InferenceFailed("embedding session lock poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractorError::InferenceFailed(format!("embedding output: {e}")))?;

        if raw.len() != self.embedding_dim {
            return Err(ExtractorError::InferenceFailed(format!(
                "expected {}-dim embedding, got {}",
                self.embedding_dim,
                raw.len()
            )));
        }
        Ok(raw.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ChannelOrder;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedModel {
        output: Result<Vec<f32>, ()>,
        calls: AtomicUsize,
    }

    impl FixedModel {
        fn new(output: Result<Vec<f32>, ()>) -> Self {
            Self { output, calls: AtomicUsize::new(0) }
        }
    }

    impl EmbeddingModel for FixedModel {
        fn input_size(&self) -> u32 {
            16
        }

        fn infer(&self, input: &Array4<f32>) -> Result<Vec<f32>, ExtractorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(input.shape(), &[1, 3, 16, 16]);
            self.output
                .clone()
                .map_err(|_| ExtractorError::InferenceFailed("fixed failure".into()))
        }
    }

    fn gray_frame(w: u32, h: u32) -> Frame {
        Frame::new(vec![51; (w * h * 3) as usize], w, h, ChannelOrder::Bgr).unwrap()
    }

    #[test]
    fn test_padded_crop_adds_ten_percent_of_width() {
        let face = DetectionBox::new(100.0, 100.0, 200.0, 220.0, 0.99);
        assert_eq!(padded_crop(&face, 640, 480), Some((90, 90, 120, 140)));
    }

    #[test]
    fn test_padded_crop_truncates_corners() {
        let face = DetectionBox::new(100.9, 100.9, 150.9, 150.9, 0.99);
        // int() → (100, 100, 150, 150), pad = 5
        assert_eq!(padded_crop(&face, 640, 480), Some((95, 95, 60, 60)));
    }

    #[test]
    fn test_padded_crop_clamps_to_frame() {
        let face = DetectionBox::new(-10.0, 5.0, 90.0, 100.0, 0.99);
        assert_eq!(padded_crop(&face, 95, 100), Some((0, 0, 95, 100)));
    }

    #[test]
    fn test_padded_crop_outside_frame_is_empty() {
        let face = DetectionBox::new(700.0, 500.0, 800.0, 600.0, 0.99);
        assert_eq!(padded_crop(&face, 640, 480), None);
        let inverted = DetectionBox::new(50.0, 50.0, 40.0, 40.0, 0.99);
        assert_eq!(padded_crop(&inverted, 640, 480), None);
    }

    #[test]
    fn test_padded_crop_extreme_coordinates() {
        let inf = DetectionBox::new(0.0, 0.0, f32::INFINITY, f32::INFINITY, 0.99);
        assert_eq!(padded_crop(&inf, 200, 100), None);
        let nan = DetectionBox::new(f32::NAN, 0.0, 50.0, 50.0, 0.99);
        assert_eq!(padded_crop(&nan, 200, 100), None);

        // Finite but far beyond i64: clamps to the whole frame.
        let huge = DetectionBox::new(-1e30, -1e30, 1e30, 1e30, 0.99);
        assert_eq!(padded_crop(&huge, 200, 100), Some((0, 0, 200, 100)));
    }

    #[test]
    fn test_embed_infinite_box_is_none() {
        let model = FixedModel::new(Ok(vec![1.0]));
        let face = DetectionBox::new(0.0, 0.0, f32::INFINITY, f32::INFINITY, 0.99);
        assert!(embed(&model, &gray_frame(64, 64), &face).is_none());
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_to_tensor_scales_and_keeps_rgb_order() {
        let img = RgbImage::from_pixel(2, 2, image::Rgb([255, 0, 51]));
        let t = to_tensor(&img);
        assert_eq!(t.shape(), &[1, 3, 2, 2]);
        assert!((t[[0, 0, 1, 1]] - 1.0).abs() < 1e-6);
        assert_eq!(t[[0, 1, 1, 1]], 0.0);
        assert!((t[[0, 2, 1, 1]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_embed_normalizes_output() {
        let model = FixedModel::new(Ok(vec![3.0, 4.0]));
        let face = DetectionBox::new(10.0, 10.0, 50.0, 50.0, 0.99);
        let e = embed(&model, &gray_frame(64, 64), &face).unwrap();
        assert!((e.values()[0] - 0.6).abs() < 1e-6);
        assert!((e.values()[1] - 0.8).abs() < 1e-6);
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_embed_model_failure_is_none() {
        let model = FixedModel::new(Err(()));
        let face = DetectionBox::new(10.0, 10.0, 50.0, 50.0, 0.99);
        assert!(embed(&model, &gray_frame(64, 64), &face).is_none());
    }

    #[test]
    fn test_embed_degenerate_output_is_none() {
        let model = FixedModel::new(Ok(vec![0.0, 0.0]));
        let face = DetectionBox::new(10.0, 10.0, 50.0, 50.0, 0.99);
        assert!(embed(&model, &gray_frame(64, 64), &face).is_none());
    }

    #[test]
    fn test_embed_empty_crop_skips_model() {
        let model = FixedModel::new(Ok(vec![1.0]));
        let face = DetectionBox::new(100.0, 100.0, 120.0, 120.0, 0.99);
        assert!(embed(&model, &gray_frame(64, 64), &face).is_none());
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }
}
