//! presence-core: face identification engine for attendance check-in.
//!
//! Detects faces with SCRFD, validates framing, extracts embeddings with a
//! FaceNet-style network (both via ONNX Runtime), and matches them against
//! an in-memory enrollment index by cosine similarity.

pub mod codec;
pub mod detector;
pub mod extractor;
pub mod frame;
pub mod index;
pub mod matcher;
pub mod service;
pub mod settings;
pub mod types;
pub mod validator;

pub use detector::{FaceDetector, ScrfdDetector};
pub use extractor::{EmbeddingModel, OnnxEmbedder};
pub use frame::{ChannelOrder, Frame, FrameError};
pub use index::{EnrollmentIndex, EnrollmentSource, IndexSnapshot, RebuildSummary, StoredEnrollment};
pub use matcher::{CosineMatcher, MatchResult, Matcher};
pub use service::{Decision, EnrollError, FaceService};
pub use settings::EngineSettings;
pub use types::{DetectionBox, Embedding, UserId};
pub use validator::{FrameValidator, RejectReason, ValidationVerdict, VerdictReport};
