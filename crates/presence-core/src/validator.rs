//! Frame validation: face-count and framing policy on top of detection.

use crate::detector::{self, FaceDetector};
use crate::frame::{Frame, FrameError};
use crate::types::DetectionBox;
use serde::Serialize;
use std::fmt;

/// Why a frame was not accepted. The message is meant for the end user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    EmptyImage,
    /// Bytes that do not decode as an image.
    InvalidImage,
    NoFace,
    /// Also the anti-spoofing signal: a second face is never arbitrated.
    MultipleFaces,
    MoveCloser,
    CenterFace,
}

impl RejectReason {
    pub fn message(&self) -> &'static str {
        match self {
            RejectReason::EmptyImage => "Empty image received",
            RejectReason::InvalidImage => "Invalid image format",
            RejectReason::NoFace => "No face detected. Please ensure your face is visible and well-lit",
            RejectReason::MultipleFaces => {
                "Multiple faces detected. Please ensure only your face is in the frame"
            }
            RejectReason::MoveCloser => "Please move closer to the camera",
            RejectReason::CenterFace => "Please center your face in the frame",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Outcome of validating one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationVerdict {
    pub is_valid: bool,
    pub reason: Option<RejectReason>,
    pub face_location: Option<DetectionBox>,
    /// Boxes above the confidence floor.
    pub face_count: usize,
}

impl ValidationVerdict {
    fn reject(reason: RejectReason, face_count: usize) -> Self {
        Self {
            is_valid: false,
            reason: Some(reason),
            face_location: None,
            face_count,
        }
    }

    /// Verdict for input that never became a frame.
    pub fn undecodable(err: &FrameError) -> Self {
        let reason = match err {
            FrameError::Empty => RejectReason::EmptyImage,
            FrameError::InvalidLength { .. } | FrameError::Decode(_) => RejectReason::InvalidImage,
        };
        tracing::warn!(error = %err, "image could not be decoded");
        Self::reject(reason, 0)
    }

    fn accept(face: DetectionBox) -> Self {
        Self {
            is_valid: true,
            reason: None,
            face_location: Some(face),
            face_count: 1,
        }
    }

    /// The accepted face, if the frame passed.
    pub fn accepted_face(&self) -> Option<&DetectionBox> {
        if self.is_valid {
            self.face_location.as_ref()
        } else {
            None
        }
    }

    /// Boundary representation handed to callers.
    pub fn report(&self) -> VerdictReport {
        VerdictReport {
            is_valid: self.is_valid,
            error: self.reason.map(|r| r.message()),
            face_location: self.face_location.map(|b| b.corners()),
            face_count: self.face_count,
        }
    }
}

/// `{is_valid, error?, face_location?: [x1, y1, x2, y2], face_count}`
#[derive(Debug, Clone, Serialize)]
pub struct VerdictReport {
    pub is_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub face_location: Option<[f32; 4]>,
    pub face_count: usize,
}

/// Applies the single-face and framing policy.
#[derive(Debug, Clone, Copy)]
pub struct FrameValidator {
    confidence_floor: f32,
    min_face_fraction: f32,
}

impl FrameValidator {
    pub fn new(confidence_floor: f32, min_face_fraction: f32) -> Self {
        Self {
            confidence_floor,
            min_face_fraction,
        }
    }

    /// Detect and judge a frame. Checks run in order; the first failure wins.
    pub fn process(&self, detector: &dyn FaceDetector, frame: &Frame) -> ValidationVerdict {
        if frame.is_empty() {
            return ValidationVerdict::reject(RejectReason::EmptyImage, 0);
        }

        let boxes = detector::detect(detector, frame, self.confidence_floor);
        self.judge(&boxes, frame.width(), frame.height())
    }

    /// Judge already-detected boxes against a frame of the given size.
    pub fn judge(&self, boxes: &[DetectionBox], frame_width: u32, frame_height: u32) -> ValidationVerdict {
        let face = match boxes {
            [] => return ValidationVerdict::reject(RejectReason::NoFace, 0),
            [face] => *face,
            many => {
                tracing::warn!(face_count = many.len(), "multiple faces in frame");
                return ValidationVerdict::reject(RejectReason::MultipleFaces, many.len());
            }
        };

        if face.height() < frame_height as f32 * self.min_face_fraction {
            return ValidationVerdict::reject(RejectReason::MoveCloser, 1);
        }
        if face.width() < frame_width as f32 * self.min_face_fraction {
            return ValidationVerdict::reject(RejectReason::CenterFace, 1);
        }

        ValidationVerdict::accept(face)
    }
}
