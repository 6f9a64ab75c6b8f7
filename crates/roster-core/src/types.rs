use serde::{Deserialize, Serialize};
use std::fmt;

/// Score reported for comparisons that can never match: dimension mismatch,
/// degenerate (zero) vectors, or an empty candidate set.
pub const MIN_SIMILARITY: f32 = -1.0;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Integer pixel rectangle inside an image, guaranteed non-empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    /// Clamp the box to a `width`×`height` image.
    ///
    /// Corners are truncated toward zero before clamping. Returns `None` when
    /// the clamped region has zero area, which callers treat as "no face".
    pub fn clamped_region(&self, width: u32, height: u32) -> Option<PixelRect> {
        let x1 = (self.x as i64).max(0);
        let y1 = (self.y as i64).max(0);
        let x2 = ((self.x + self.width) as i64).min(width as i64);
        let y2 = ((self.y + self.height) as i64).min(height as i64);

        if x2 <= x1 || y2 <= y1 {
            return None;
        }

        Some(PixelRect {
            x: x1 as u32,
            y: y1 as u32,
            width: (x2 - x1) as u32,
            height: (y2 - y1) as u32,
        })
    }
}

/// L2-normalize a vector. The zero vector is returned unchanged.
pub fn normalize(mut values: Vec<f32>) -> Vec<f32> {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.iter_mut().for_each(|v| *v /= norm);
    }
    values
}

/// Cosine similarity between two raw vectors, in [-1, 1].
///
/// Mismatched dimensions and zero vectors score [`MIN_SIMILARITY`].
pub fn cosine_sim(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return MIN_SIMILARITY;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 {
        (dot / denom).clamp(-1.0, 1.0)
    } else {
        MIN_SIMILARITY
    }
}

/// Unit-norm face embedding (512-dimensional for FaceNet).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawEmbedding")]
pub struct Embedding {
    values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "facenet512").
    model_version: Option<String>,
}

#[derive(Deserialize)]
struct RawEmbedding {
    values: Vec<f32>,
    model_version: Option<String>,
}

impl From<RawEmbedding> for Embedding {
    fn from(raw: RawEmbedding) -> Self {
        Self::new(raw.values).with_model_version(raw.model_version)
    }
}

impl Embedding {
    /// Build an embedding, normalizing `values` to unit length.
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values: normalize(values),
            model_version: None,
        }
    }

    pub fn with_model_version(mut self, version: Option<String>) -> Self {
        self.model_version = version;
        self
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn model_version(&self) -> Option<&str> {
        self.model_version.as_deref()
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn is_zero(&self) -> bool {
        self.values.iter().all(|&v| v == 0.0)
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        cosine_sim(&self.values, &other.values)
    }
}

/// Head orientation captured during enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pose {
    Center,
    Left,
    Right,
}

impl Pose {
    /// Enrollment order. Center comes first because the other poses may fall back to it.
    pub const ALL: [Pose; 3] = [Pose::Center, Pose::Left, Pose::Right];

    pub fn as_str(&self) -> &'static str {
        match self {
            Pose::Center => "center",
            Pose::Left => "left",
            Pose::Right => "right",
        }
    }
}

impl fmt::Display for Pose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An enrolled person: roll number, display name and course.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Roll number; the only identity key.
    pub id: String,
    pub name: String,
    pub course: String,
}

impl Identity {
    pub fn new(id: impl Into<String>, name: impl Into<String>, course: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            course: course.into(),
        }
    }
}

/// One embedding per enrollment pose. Always written as a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseEmbeddings {
    pub center: Embedding,
    pub left: Embedding,
    pub right: Embedding,
}

impl PoseEmbeddings {
    pub fn get(&self, pose: Pose) -> &Embedding {
        match pose {
            Pose::Center => &self.center,
            Pose::Left => &self.left,
            Pose::Right => &self.right,
        }
    }

    /// Embeddings in [`Pose::ALL`] order.
    pub fn into_vec(self) -> Vec<Embedding> {
        vec![self.center, self.left, self.right]
    }
}

/// An enrolled identity together with every stored embedding for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub identity: Identity,
    pub embeddings: Vec<Embedding>,
}

impl Candidate {
    pub fn new(identity: Identity, embeddings: Vec<Embedding>) -> Self {
        Self {
            identity,
            embeddings,
        }
    }

    pub fn from_poses(identity: Identity, poses: PoseEmbeddings) -> Self {
        Self::new(identity, poses.into_vec())
    }
}
