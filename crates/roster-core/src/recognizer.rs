//! Embedding extraction.
//!
//! [`FaceNetEmbedder`] runs an InceptionResnetV1 (FaceNet, VGGFace2 weights)
//! export on ONNX Runtime: 160×160 RGB crops in, 512-dim unit vectors out.

use crate::error::RosterError;
use crate::types::Embedding;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const CROP_EDGE: u32 = 160;
const EMBEDDING_DIM: usize = 512;
const MODEL_VERSION: &str = "facenet512-vggface2";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("embedder model missing: {0}")]
    ModelMissing(String),
    #[error("unexpected embedder output: {0}")]
    BadOutput(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Turns a face crop into a unit-norm embedding.
pub trait FaceEmbedder {
    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, RosterError>;
}

pub struct FaceNetEmbedder {
    session: Session,
}

impl FaceNetEmbedder {
    pub fn load(model_path: &str, intra_threads: usize) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).is_file() {
            return Err(RecognizerError::ModelMissing(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;
        tracing::info!(path = model_path, version = MODEL_VERSION, "FaceNet embedder ready");

        Ok(Self { session })
    }

    fn run(&mut self, face: &RgbImage) -> Result<Embedding, RecognizerError> {
        let input = preprocess(face);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::BadOutput(e.to_string()))?;
        if raw.len() != EMBEDDING_DIM {
            return Err(RecognizerError::BadOutput(format!(
                "{} values, want {EMBEDDING_DIM}",
                raw.len()
            )));
        }

        let embedding =
            Embedding::new(raw.to_vec()).with_model_version(Some(MODEL_VERSION.to_string()));
        if embedding.is_zero() {
            return Err(RecognizerError::BadOutput("all-zero embedding".into()));
        }
        Ok(embedding)
    }
}

impl FaceEmbedder for FaceNetEmbedder {
    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, RosterError> {
        if face.width() == 0 || face.height() == 0 {
            return Err(RosterError::invalid_input("empty face crop"));
        }
        Ok(self.run(face)?)
    }
}

/// Resize to 160×160 and lay out as a [0, 1]-scaled NCHW tensor.
fn preprocess(face: &RgbImage) -> Array4<f32> {
    let resized = imageops::resize(face, CROP_EDGE, CROP_EDGE, FilterType::Triangle);
    let edge = CROP_EDGE as usize;
    Array4::from_shape_fn((1, 3, edge, edge), |(_, c, y, x)| {
        resized.get_pixel(x as u32, y as u32).0[c] as f32 / 255.0
    })
}
