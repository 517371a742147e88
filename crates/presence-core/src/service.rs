//! Identification / verification facade.
//!
//! [`FaceService`] wires detector → validator → extractor → matcher. It keeps
//! no per-call state; the enrollment index is the only shared mutable part,
//! and it is replaced wholesale by [`FaceService::rebuild`].

use crate::detector::FaceDetector;
use crate::extractor::{self, EmbeddingModel};
use crate::frame::Frame;
use crate::index::{EnrollmentIndex, EnrollmentSource, IndexError, RebuildSummary};
use crate::matcher::{CosineMatcher, MatchResult, Matcher};
use crate::settings::{EngineSettings, SettingsError};
use crate::types::{DetectionBox, Embedding, UserId};
use crate::validator::{FrameValidator, RejectReason, ValidationVerdict};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnrollError {
    #[error("{0}")]
    Rejected(RejectReason),
    #[error("could not extract face features")]
    Extraction,
}

/// A decision plus what led to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub verdict: ValidationVerdict,
    /// `None` when the pipeline stopped before matching.
    pub result: Option<MatchResult>,
}

impl Decision {
    fn stopped(verdict: ValidationVerdict) -> Self {
        Self { verdict, result: None }
    }

    pub fn matched(&self) -> bool {
        self.result.as_ref().is_some_and(|r| r.matched)
    }

    pub fn identity(&self) -> Option<UserId> {
        self.result.as_ref().and_then(|r| r.identity)
    }
}

/// Face identification engine.
pub struct FaceService {
    detector: Box<dyn FaceDetector>,
    embedder: Box<dyn EmbeddingModel>,
    validator: FrameValidator,
    matcher: CosineMatcher,
    index: EnrollmentIndex,
    settings: EngineSettings,
}

impl FaceService {
    /// Build a service with an empty index. Call [`rebuild`](Self::rebuild) before matching.
    pub fn new(
        detector: Box<dyn FaceDetector>,
        embedder: Box<dyn EmbeddingModel>,
        settings: EngineSettings,
    ) -> Result<Self, SettingsError> {
        settings.validate()?;
        Ok(Self {
            detector,
            embedder,
            validator: FrameValidator::new(settings.confidence_floor, settings.min_face_fraction),
            matcher: CosineMatcher::new(settings.similarity_threshold),
            index: EnrollmentIndex::new(),
            settings,
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn index(&self) -> &EnrollmentIndex {
        &self.index
    }

    /// Reload the enrollment index. Call after any enrollment, removal or purge.
    pub fn rebuild(&self, source: &dyn EnrollmentSource) -> Result<RebuildSummary, IndexError> {
        self.index.rebuild(source)
    }

    /// Check that a frame holds exactly one well-framed face.
    pub fn validate(&self, frame: &Frame) -> ValidationVerdict {
        self.validator.process(self.detector.as_ref(), frame)
    }

    /// Decode and validate an encoded image; unreadable bytes become a verdict.
    pub fn validate_bytes(&self, bytes: &[u8]) -> ValidationVerdict {
        match Frame::decode(bytes) {
            Ok(frame) => self.validate(&frame),
            Err(e) => ValidationVerdict::undecodable(&e),
        }
    }

    /// Embedding for an already validated face.
    pub fn embed_face(&self, frame: &Frame, face: &DetectionBox) -> Option<Embedding> {
        extractor::embed(self.embedder.as_ref(), frame, face)
    }

    /// Produce the reference embedding for enrollment.
    ///
    /// The caller persists it and then calls [`rebuild`](Self::rebuild).
    pub fn enroll_from_image(&self, frame: &Frame) -> Result<Embedding, EnrollError> {
        let verdict = self.validate(frame);
        if let Some(reason) = verdict.reason {
            return Err(EnrollError::Rejected(reason));
        }
        if verdict.face_count > 1 {
            return Err(EnrollError::Rejected(RejectReason::MultipleFaces));
        }
        let face = verdict.accepted_face().ok_or(EnrollError::Rejected(RejectReason::NoFace))?;
        self.embed_face(frame, face).ok_or(EnrollError::Extraction)
    }

    /// 1-to-N identification with diagnostics.
    pub fn identify(&self, frame: &Frame) -> Decision {
        let verdict = self.validate(frame);
        let Some(face) = verdict.accepted_face().copied() else {
            return Decision::stopped(verdict);
        };

        let gallery = self.index.lookup_all();
        if gallery.is_empty() {
            tracing::debug!("identify: enrollment index is empty");
            return Decision::stopped(verdict);
        }

        let Some(probe) = self.embed_face(frame, &face) else {
            return Decision::stopped(verdict);
        };

        let result = self.matcher.identify(&probe, &gallery);
        tracing::info!(
            matched = result.matched,
            similarity = result.similarity,
            user = ?result.identity,
            gallery = gallery.len(),
            "identify finished"
        );
        Decision {
            verdict,
            result: Some(result),
        }
    }

    /// Who is this? `None` when the frame is rejected or nobody matches.
    pub fn identify_from_image(&self, frame: &Frame) -> Option<UserId> {
        self.identify(frame).identity()
    }

    /// 1-to-1 verification with diagnostics.
    pub fn verify(&self, frame: &Frame, claimed: UserId) -> Decision {
        let verdict = self.validate(frame);
        // Never verify against a frame holding more than one face.
        if verdict.face_count > 1 {
            tracing::warn!(user = %claimed, face_count = verdict.face_count, "multiple faces during verification");
            return Decision::stopped(verdict);
        }
        let Some(face) = verdict.accepted_face().copied() else {
            return Decision::stopped(verdict);
        };

        let gallery = self.index.lookup_all();
        if gallery.get(claimed).is_none() {
            tracing::info!(user = %claimed, "verify: no active enrollment for user");
            return Decision::stopped(verdict);
        }

        let Some(probe) = self.embed_face(frame, &face) else {
            return Decision::stopped(verdict);
        };

        let result = self.matcher.verify(&probe, claimed, &gallery);
        tracing::info!(
            user = %claimed,
            matched = result.matched,
            similarity = result.similarity,
            "verify finished"
        );
        Decision {
            verdict,
            result: Some(result),
        }
    }

    /// Is this the claimed user?
    pub fn verify_from_image(&self, frame: &Frame, claimed: UserId) -> bool {
        self.verify(frame, claimed).matched()
    }
}
