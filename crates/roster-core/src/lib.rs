//! roster-core: Face identity matching engine for attendance capture.
//!
//! Uses SCRFD for face localization and FaceNet for face embeddings, both
//! running via ONNX Runtime for CPU inference. Identities are matched by an
//! exhaustive cosine-similarity scan over a freshly loaded candidate set.

pub mod attendance;
pub mod decode;
pub mod detector;
pub mod engine;
pub mod enrollment;
pub mod error;
pub mod matcher;
pub mod pipeline;
pub mod recognizer;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

pub use attendance::{AttendanceRecord, AttendanceSession, AttendanceStatus, MarkOutcome};
pub use decode::ImagePayload;
pub use detector::{FaceLocalizer, ScrfdDetector};
pub use engine::AttendanceEngine;
pub use enrollment::{EnrollmentImages, EnrollmentResult, Rejection};
pub use error::RosterError;
pub use matcher::{CosineMatcher, MatchResult, Matcher, NotRecognized, DEFAULT_THRESHOLD};
pub use pipeline::FacePipeline;
pub use recognizer::{FaceEmbedder, FaceNetEmbedder};
pub use store::{AttendanceStore, EnrollmentStore, StoreError};
pub use types::{BoundingBox, Candidate, Embedding, Identity, Pose, PoseEmbeddings};

use std::path::PathBuf;

/// System-wide model directory used when no override is configured.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("/usr/share/roster/models")
}
