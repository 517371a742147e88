//! Face detection.
//!
//! [`FaceDetector`] is the model seam: it returns raw, fallible candidates.
//! [`detect`] is the contract the rest of the engine relies on. It applies
//! the confidence floor and turns every failure into an empty result.
//!
//! The bundled implementation is SCRFD run through ONNX Runtime, with
//! 3-stride anchor decoding and NMS post-processing.

use crate::frame::Frame;
use crate::types::DetectionBox;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
/// Candidate threshold inside the model; the engine's floor is applied later.
const SCRFD_CANDIDATE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
/// Score and bbox heads per stride; keypoint heads, if exported, are ignored.
const SCRFD_MIN_OUTPUTS: usize = 6;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("frame is empty")]
    EmptyFrame,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A face detection model.
pub trait FaceDetector: Send + Sync {
    /// Candidate faces in `frame`, most confident first, before the
    /// engine's confidence floor is applied.
    fn candidates(&self, frame: &Frame) -> Result<Vec<DetectionBox>, DetectorError>;
}

/// Detect faces, keeping only finite boxes whose confidence strictly exceeds
/// `confidence_floor`.
///
/// Never fails: an empty frame or a model error yields an empty list.
pub fn detect(detector: &dyn FaceDetector, frame: &Frame, confidence_floor: f32) -> Vec<DetectionBox> {
    if frame.is_empty() {
        tracing::error!(
            width = frame.width(),
            height = frame.height(),
            "empty frame received for detection"
        );
        return Vec::new();
    }

    match detector.candidates(frame) {
        Ok(boxes) => {
            let total = boxes.len();
            let kept: Vec<DetectionBox> = boxes
                .into_iter()
                .filter(|b| b.is_finite() && b.confidence > confidence_floor)
                .collect();
            tracing::debug!(total, kept = kept.len(), confidence_floor, "detection finished");
            kept
        }
        Err(e) => {
            tracing::error!(
                error = %e,
                width = frame.width(),
                height = frame.height(),
                "face detection failed"
            );
            Vec::new()
        }
    }
}

/// Metadata for mapping letterboxed coordinates back to the frame.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl LetterboxInfo {
    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputIndices = (usize, usize);

/// SCRFD face detector.
pub struct ScrfdDetector {
    session: Mutex<Session>,
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        let path_str = model_path.display().to_string();
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(path_str));
        }

        let session = Session::builder()?
            .with_intra_threads(2)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = %path_str,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < SCRFD_MIN_OUTPUTS {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires at least {SCRFD_MIN_OUTPUTS} outputs (3 strides × score/bbox), got {}",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session: Mutex::new(session),
            stride_indices,
        })
    }
}

impl FaceDetector for ScrfdDetector {
    fn candidates(&self, frame: &Frame) -> Result<Vec<DetectionBox>, DetectorError> {
        if frame.is_empty() {
            return Err(DetectorError::EmptyFrame);
        }

        let (input, letterbox) = letterbox_tensor(frame);

        let mut session = self
            .session
            .lock()
            .map_err(|_| DetectorError::InferenceFailed("detector session lock poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut all = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_indices[pos];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;

            all.extend(decode_stride(scores, bboxes, stride, &letterbox, SCRFD_CANDIDATE_THRESHOLD));
        }

        Ok(nms(all, SCRFD_NMS_THRESHOLD))
    }
}

/// Letterbox a color frame into a 1×3×640×640 RGB tensor normalized for SCRFD.
///
/// Bilinear sampling, padding filled with the mean (normalizes to 0.0).
fn letterbox_tensor(frame: &Frame) -> (Array4<f32>, LetterboxInfo) {
    let width = frame.width() as usize;
    let height = frame.height() as usize;
    let size = SCRFD_INPUT_SIZE;

    let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
    let new_w = ((width as f32 * scale).round() as usize).clamp(1, size);
    let new_h = ((height as f32 * scale).round() as usize).clamp(1, size);
    let pad_x = (size - new_w) as f32 / 2.0;
    let pad_y = (size - new_h) as f32 / 2.0;
    let x_start = pad_x.floor() as usize;
    let y_start = pad_y.floor() as usize;

    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    let inv_scale = 1.0 / scale;

    for y in 0..new_h {
        let src_y = (y as f32 + 0.5) * inv_scale - 0.5;
        let y0 = (src_y.floor() as i64).clamp(0, height as i64 - 1) as u32;
        let y1 = (y0 + 1).min(height as u32 - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..new_w {
            let src_x = (x as f32 + 0.5) * inv_scale - 0.5;
            let x0 = (src_x.floor() as i64).clamp(0, width as i64 - 1) as u32;
            let x1 = (x0 + 1).min(width as u32 - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let tl = frame.rgb_at(x0, y0);
            let tr = frame.rgb_at(x1, y0);
            let bl = frame.rgb_at(x0, y1);
            let br = frame.rgb_at(x1, y1);

            for c in 0..3 {
                let val = tl[c] as f32 * (1.0 - fx) * (1.0 - fy)
                    + tr[c] as f32 * fx * (1.0 - fy)
                    + bl[c] as f32 * (1.0 - fx) * fy
                    + br[c] as f32 * fx * fy;
                tensor[[0, c, y + y_start, x + x_start]] = (val - SCRFD_MEAN) / SCRFD_STD;
            }
        }
    }

    (tensor, LetterboxInfo { scale, pad_x, pad_y })
}

/// Map SCRFD output tensors to stride slots.
///
/// Exports either name their heads ("score_8", "bbox_16", ...) or use generic
/// numeric names, in which case the standard positional layout applies:
///   [0-2] = scores (strides 8, 16, 32)
///   [3-5] = bboxes (strides 8, 16, 32)
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let mut named = [(0usize, 0usize); 3];
    for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
        match (find("score", stride), find("bbox", stride)) {
            (Some(score), Some(bbox)) => named[slot] = (score, bbox),
            _ => {
                tracing::info!(
                    ?names,
                    "SCRFD: output names not recognized, using positional mapping [0-2]=scores, [3-5]=bboxes"
                );
                return [(0, 3), (1, 4), (2, 5)];
            }
        }
    }

    tracing::info!("SCRFD: using name-based output tensor mapping");
    named
}

/// Decode detections for a single stride level into frame coordinates.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<DetectionBox> {
    let grid = SCRFD_INPUT_SIZE / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    let mut detections = Vec::new();

    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let off = idx * 4;
        let Some(d) = bboxes.get(off..off + 4) else {
            continue;
        };

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_x = (cell % grid) as f32 * step;
        let anchor_y = (cell / grid) as f32 * step;

        // Offsets are distances from the anchor to each edge, in stride units.
        let (x1, y1) = letterbox.to_frame(anchor_x - d[0] * step, anchor_y - d[1] * step);
        let (x2, y2) = letterbox.to_frame(anchor_x + d[2] * step, anchor_y + d[3] * step);

        detections.push(DetectionBox::new(x1, y1, x2, y2, score.min(1.0)));
    }

    detections
}

/// Non-maximum suppression. Output is sorted by descending confidence.
fn nms(mut detections: Vec<DetectionBox>, iou_threshold: f32) -> Vec<DetectionBox> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<DetectionBox> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| k.iou(&det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}
