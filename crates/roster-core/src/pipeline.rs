use crate::detector::FaceLocalizer;
use crate::error::RosterError;
use crate::recognizer::FaceEmbedder;
use crate::types::{BoundingBox, Embedding};
use image::imageops;
use image::RgbImage;

/// A localized face and its embedding.
#[derive(Debug, Clone)]
pub struct FaceSample {
    pub face: BoundingBox,
    pub embedding: Embedding,
}

/// Localize → clamp and crop → embed.
///
/// Owns both models; every call blocks on inference, one frame at a time.
pub struct FacePipeline<L, E> {
    localizer: L,
    embedder: E,
}

impl<L: FaceLocalizer, E: FaceEmbedder> FacePipeline<L, E> {
    pub fn new(localizer: L, embedder: E) -> Self {
        Self {
            localizer,
            embedder,
        }
    }

    /// Embed the face in `image`, or `None` when no usable face is found.
    pub fn extract(&mut self, image: &RgbImage) -> Result<Option<FaceSample>, RosterError> {
        let Some(face) = self.localizer.locate(image)? else {
            tracing::debug!(width = image.width(), height = image.height(), "no face detected");
            return Ok(None);
        };

        let Some(region) = face.clamped_region(image.width(), image.height()) else {
            tracing::debug!(?face, "face box empty after clamping");
            return Ok(None);
        };

        let crop =
            imageops::crop_imm(image, region.x, region.y, region.width, region.height).to_image();
        let embedding = self.embedder.embed(&crop)?;

        tracing::debug!(
            confidence = face.confidence,
            x = region.x,
            y = region.y,
            width = region.width,
            height = region.height,
            "face embedded"
        );

        Ok(Some(FaceSample { face, embedding }))
    }

    pub fn embedder(&self) -> &E {
        &self.embedder
    }
}
