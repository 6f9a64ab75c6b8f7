//! Test doubles shared by the unit tests of this crate.

use crate::attendance::{AttendanceRecord, AttendanceSession};
use crate::detector::FaceLocalizer;
use crate::error::RosterError;
use crate::recognizer::FaceEmbedder;
use crate::store::{AttendanceStore, EnrollmentStore, StoreError};
use crate::types::{BoundingBox, Candidate, Embedding, Identity, PoseEmbeddings};
use base64::Engine as _;
use image::{ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::sync::Mutex;

/// In-memory store implementing both adapters, with call counters.
#[derive(Default)]
pub struct MemoryStore {
    candidates: Mutex<Vec<Candidate>>,
    records: Mutex<Vec<AttendanceRecord>>,
    sessions: Mutex<Vec<uuid::Uuid>>,
    saves: Mutex<usize>,
    fail_append: Mutex<bool>,
    unavailable: Mutex<bool>,
}

impl MemoryStore {
    pub fn with_candidates(candidates: Vec<Candidate>) -> Self {
        Self {
            candidates: Mutex::new(candidates),
            ..Self::default()
        }
    }

    pub fn candidates(&self) -> Vec<Candidate> {
        self.candidates.lock().unwrap().clone()
    }

    pub fn records(&self) -> Vec<AttendanceRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn sessions(&self) -> Vec<uuid::Uuid> {
        self.sessions.lock().unwrap().clone()
    }

    pub fn save_calls(&self) -> usize {
        *self.saves.lock().unwrap()
    }

    pub fn fail_next_append(&self) {
        *self.fail_append.lock().unwrap() = true;
    }

    pub fn set_unavailable(&self) {
        *self.unavailable.lock().unwrap() = true;
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if *self.unavailable.lock().unwrap() {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        Ok(())
    }
}

impl EnrollmentStore for MemoryStore {
    fn load_candidates(&self) -> Result<Vec<Candidate>, StoreError> {
        self.check_available()?;
        Ok(self.candidates())
    }

    fn save_embeddings(
        &self,
        identity: &Identity,
        embeddings: &PoseEmbeddings,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        *self.saves.lock().unwrap() += 1;
        let mut candidates = self.candidates.lock().unwrap();
        candidates.retain(|c| c.identity.id != identity.id);
        candidates.push(Candidate::from_poses(identity.clone(), embeddings.clone()));
        Ok(())
    }
}

impl AttendanceStore for MemoryStore {
    fn append(&self, record: &AttendanceRecord) -> Result<(), StoreError> {
        self.check_available()?;
        let mut fail = self.fail_append.lock().unwrap();
        if *fail {
            *fail = false;
            return Err(StoreError::Unavailable("append rejected".into()));
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }

    fn delete_most_recent(&self) -> Result<Option<AttendanceRecord>, StoreError> {
        self.check_available()?;
        Ok(self.records.lock().unwrap().pop())
    }

    fn log_session(&self, session: &AttendanceSession) -> Result<(), StoreError> {
        self.sessions.lock().unwrap().push(session.id());
        Ok(())
    }
}

/// Reports the whole frame as a face unless every pixel is black.
pub struct StubLocalizer;

impl FaceLocalizer for StubLocalizer {
    fn locate(&mut self, image: &RgbImage) -> Result<Option<BoundingBox>, RosterError> {
        if image.pixels().all(|p| p.0 == [0, 0, 0]) {
            return Ok(None);
        }
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

/// Embeds a crop as its normalized mean RGB colour.
#[derive(Default)]
pub struct StubEmbedder {
    pub calls: usize,
    pub fail: bool,
}

impl FaceEmbedder for StubEmbedder {
    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, RosterError> {
        self.calls += 1;
        if self.fail {
            return Err(RosterError::invalid_input("stub embedder failure"));
        }
        let n = (face.width() * face.height()) as f32;
        let mut sum = [0.0f32; 3];
        for p in face.pixels() {
            for (acc, &c) in sum.iter_mut().zip(p.0.iter()) {
                *acc += c as f32;
            }
        }
        Ok(Embedding::new(sum.iter().map(|s| s / n).collect()))
    }
}

pub fn solid_image(color: [u8; 3]) -> RgbImage {
    RgbImage::from_pixel(8, 8, Rgb(color))
}

pub fn png_bytes(image: &RgbImage) -> Vec<u8> {
    let mut buf = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

pub fn png_base64(color: [u8; 3]) -> String {
    base64::engine::general_purpose::STANDARD.encode(png_bytes(&solid_image(color)))
}

pub fn identity(id: &str) -> Identity {
    Identity::new(id, format!("Student {id}"), "CS101")
}
