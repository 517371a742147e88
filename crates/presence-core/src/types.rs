use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque identity of an enrolled user (the user-record store's primary key).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(UserId)
    }
}

/// Axis-aligned face box in frame pixel coordinates, with detector confidence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
}

impl DetectionBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> Self {
        Self { x1, y1, x2, y2, confidence }
    }

    /// All corners and the confidence are finite numbers.
    pub fn is_finite(&self) -> bool {
        [self.x1, self.y1, self.x2, self.y2, self.confidence]
            .iter()
            .all(|v| v.is_finite())
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// `[x1, y1, x2, y2]`, the layout callers receive as `face_location`.
    pub fn corners(&self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }

    /// Intersection-over-Union with another box.
    pub fn iou(&self, other: &DetectionBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;

        if union > 0.0 { inter / union } else { 0.0 }
    }
}

/// Unit-length face descriptor.
///
/// The only way to build one is [`Embedding::from_raw`], which L2-normalizes
/// the input, so the dot product of two embeddings is their cosine similarity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    /// Normalize a raw model output into an embedding.
    ///
    /// Returns `None` for empty vectors, non-finite components or a zero norm.
    pub fn from_raw(raw: Vec<f32>) -> Option<Self> {
        if raw.is_empty() || raw.iter().any(|v| !v.is_finite()) {
            return None;
        }
        let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
        if !norm.is_finite() || norm <= f32::EPSILON {
            return None;
        }
        Some(Self {
            values: raw.into_iter().map(|v| v / norm).collect(),
        })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in [-1, 1]: the dot product of two unit vectors.
    ///
    /// Embeddings of different dimension come from different models and are
    /// reported as maximally dissimilar (-1.0). Every component is visited.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return -1.0;
        }
        let dot: f32 = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum();
        dot.clamp(-1.0, 1.0)
    }
}
