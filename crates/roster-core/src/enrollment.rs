//! Multi-pose enrollment.
//!
//! State machine:
//!
//! ```text
//! Pending → Validating(center) → Validating(left) → Validating(right) → Committing
//!                 ↘                    ↘                   ↘                  ↓
//!                                Rejected(reason)                          Committed
//! ```
//!
//! Rejection happens before any store write, so an identity is either fully
//! re-enrolled or left untouched.

use crate::decode::ImagePayload;
use crate::detector::FaceLocalizer;
use crate::error::RosterError;
use crate::pipeline::FacePipeline;
use crate::recognizer::FaceEmbedder;
use crate::store::EnrollmentStore;
use crate::types::{Embedding, Identity, Pose, PoseEmbeddings};
use serde::Serialize;
use std::fmt;

/// Images captured for one identity. Left and right fall back to center.
#[derive(Debug, Clone)]
pub struct EnrollmentImages {
    pub center: ImagePayload,
    pub left: Option<ImagePayload>,
    pub right: Option<ImagePayload>,
}

impl EnrollmentImages {
    pub fn center_only(center: impl Into<ImagePayload>) -> Self {
        Self {
            center: center.into(),
            left: None,
            right: None,
        }
    }

    /// The image supplied for `pose`, or `None` when it falls back to center.
    fn supplied(&self, pose: Pose) -> Option<&ImagePayload> {
        let image = match pose {
            Pose::Center => Some(&self.center),
            Pose::Left => self.left.as_ref(),
            Pose::Right => self.right.as_ref(),
        };
        image.filter(|p| !p.is_empty())
    }
}

/// Why an enrollment was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rejection {
    InvalidImage { pose: Pose, message: String },
    NoFaceDetected { pose: Pose },
    ExtractionFailed { pose: Pose, message: String },
}

impl Rejection {
    pub fn pose(&self) -> Pose {
        match self {
            Rejection::InvalidImage { pose, .. }
            | Rejection::NoFaceDetected { pose }
            | Rejection::ExtractionFailed { pose, .. } => *pose,
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::InvalidImage { pose, message } => {
                write!(f, "invalid {pose} image: {message}")
            }
            Rejection::NoFaceDetected { pose } => write!(f, "face not detected in {pose} photo"),
            Rejection::ExtractionFailed { pose, message } => {
                write!(f, "embedding extraction failed for {pose} photo: {message}")
            }
        }
    }
}

impl From<Rejection> for RosterError {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::NoFaceDetected { pose } => RosterError::NoFaceDetected { pose },
            other => RosterError::InvalidInput(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EnrollmentResult {
    Accepted { identity: Identity },
    Rejected { reason: Rejection },
}

impl EnrollmentResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, EnrollmentResult::Accepted { .. })
    }

    /// Turn a rejection into the matching [`RosterError`].
    pub fn into_result(self) -> Result<Identity, RosterError> {
        match self {
            EnrollmentResult::Accepted { identity } => Ok(identity),
            EnrollmentResult::Rejected { reason } => Err(reason.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnrollmentState {
    Pending,
    Validating(Pose),
    Rejected(Rejection),
    Committing,
    Committed,
}

impl EnrollmentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EnrollmentState::Rejected(_) | EnrollmentState::Committed)
    }
}

/// One enrollment attempt for one identity.
pub struct EnrollmentPipeline {
    identity: Identity,
    images: EnrollmentImages,
    state: EnrollmentState,
}

impl EnrollmentPipeline {
    /// Validate identity metadata and stage the attempt in `Pending`.
    pub fn new(identity: Identity, images: EnrollmentImages) -> Result<Self, RosterError> {
        let fields = [
            ("id", &identity.id),
            ("name", &identity.name),
            ("course", &identity.course),
        ];
        for (field, value) in fields {
            if value.trim().is_empty() {
                return Err(RosterError::invalid_input(format!("identity {field} is required")));
            }
        }
        Ok(Self {
            identity,
            images,
            state: EnrollmentState::Pending,
        })
    }

    pub fn state(&self) -> &EnrollmentState {
        &self.state
    }

    fn transition(&mut self, next: EnrollmentState) {
        tracing::debug!(
            identity = %self.identity.id,
            from = ?self.state,
            to = ?next,
            "enrollment transition"
        );
        self.state = next;
    }

    /// Drive the attempt to a terminal state.
    ///
    /// Per-pose failures end in `Rejected` and are returned as
    /// [`EnrollmentResult::Rejected`]. Only a store failure while committing is
    /// an `Err`, leaving the state at `Committing`.
    pub fn run<L, E, S>(
        &mut self,
        faces: &mut FacePipeline<L, E>,
        store: &S,
    ) -> Result<EnrollmentResult, RosterError>
    where
        L: FaceLocalizer,
        E: FaceEmbedder,
        S: EnrollmentStore + ?Sized,
    {
        if self.state != EnrollmentState::Pending {
            return Err(RosterError::invalid_input("enrollment attempt already run"));
        }

        let center = match self.validate(Pose::Center, faces, None) {
            Ok(embedding) => embedding,
            Err(reason) => return Ok(self.reject(reason)),
        };
        let left = match self.validate(Pose::Left, faces, Some(&center)) {
            Ok(embedding) => embedding,
            Err(reason) => return Ok(self.reject(reason)),
        };
        let right = match self.validate(Pose::Right, faces, Some(&center)) {
            Ok(embedding) => embedding,
            Err(reason) => return Ok(self.reject(reason)),
        };
        let embeddings = PoseEmbeddings { center, left, right };

        self.transition(EnrollmentState::Committing);
        store.save_embeddings(&self.identity, &embeddings)?;
        self.transition(EnrollmentState::Committed);

        tracing::info!(
            identity = %self.identity.id,
            name = %self.identity.name,
            "identity enrolled"
        );
        Ok(EnrollmentResult::Accepted {
            identity: self.identity.clone(),
        })
    }

    /// Embed the image for `pose`. A missing side pose reuses `fallback` verbatim.
    fn validate<L: FaceLocalizer, E: FaceEmbedder>(
        &mut self,
        pose: Pose,
        faces: &mut FacePipeline<L, E>,
        fallback: Option<&Embedding>,
    ) -> Result<Embedding, Rejection> {
        self.transition(EnrollmentState::Validating(pose));

        match (self.images.supplied(pose), fallback) {
            (Some(image), _) => embed_pose(faces, pose, image),
            (None, Some(center)) => Ok(center.clone()),
            (None, None) => Err(Rejection::InvalidImage {
                pose,
                message: "image is required".into(),
            }),
        }
    }

    fn reject(&mut self, reason: Rejection) -> EnrollmentResult {
        tracing::warn!(
            identity = %self.identity.id,
            pose = %reason.pose(),
            %reason,
            "enrollment rejected"
        );
        self.transition(EnrollmentState::Rejected(reason.clone()));
        EnrollmentResult::Rejected { reason }
    }
}

fn embed_pose<L: FaceLocalizer, E: FaceEmbedder>(
    faces: &mut FacePipeline<L, E>,
    pose: Pose,
    image: &ImagePayload,
) -> Result<Embedding, Rejection> {
    let raster = image.decode().map_err(|e| Rejection::InvalidImage {
        pose,
        message: e.to_string(),
    })?;

    match faces.extract(&raster) {
        Ok(Some(sample)) => Ok(sample.embedding),
        Ok(None) => Err(Rejection::NoFaceDetected { pose }),
        Err(e) => Err(Rejection::ExtractionFailed {
            pose,
            message: e.to_string(),
        }),
    }
}
