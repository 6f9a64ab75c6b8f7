//! Stand-in models and fixtures for the binary's unit tests.

use crate::worker::{self, EngineHandle};
use image::{ImageFormat, Rgb, RgbImage};
use roster_core::{
    AttendanceEngine, BoundingBox, Embedding, FaceEmbedder, FaceLocalizer, FacePipeline,
    ImagePayload, RosterError,
};
use roster_store::SqliteStore;
use std::io::Cursor;
use std::sync::Arc;

/// Treats the whole frame as the face.
pub struct WholeFrame;

impl FaceLocalizer for WholeFrame {
    fn locate(&mut self, image: &RgbImage) -> Result<Option<BoundingBox>, RosterError> {
        Ok(Some(BoundingBox {
            x: 0.0,
            y: 0.0,
            width: image.width() as f32,
            height: image.height() as f32,
            confidence: 0.99,
            landmarks: None,
        }))
    }
}

/// Embeds a crop as its summed RGB colour.
pub struct MeanColor;

impl FaceEmbedder for MeanColor {
    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, RosterError> {
        let mut sum = [0.0f32; 3];
        for Rgb(px) in face.pixels() {
            for (s, v) in sum.iter_mut().zip(px) {
                *s += *v as f32;
            }
        }
        Ok(Embedding::new(sum.to_vec()))
    }
}

pub fn png_bytes(color: [u8; 3]) -> Vec<u8> {
    let img = RgbImage::from_pixel(8, 8, Rgb(color));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

pub fn png(color: [u8; 3]) -> ImagePayload {
    ImagePayload::Encoded(png_bytes(color))
}

/// Engine thread over the stand-in models and an in-memory database.
pub fn stub_engine() -> (EngineHandle, Arc<SqliteStore>) {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let engine = AttendanceEngine::new(
        FacePipeline::new(WholeFrame, MeanColor),
        store.clone(),
        store.clone(),
    );
    (worker::spawn_worker(engine).unwrap(), store)
}
