//! Face localization.
//!
//! [`FaceLocalizer`] is the seam the engine depends on. [`ScrfdDetector`]
//! implements it with the SCRFD anchor-free detector (3 strides, NMS) running
//! on ONNX Runtime, fed letterboxed RGB frames.

use crate::error::RosterError;
use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

/// Square model input edge, in pixels.
const INPUT_EDGE: u32 = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_SCALE: f32 = 1.0 / 128.0;
const SCORE_THRESHOLD: f32 = 0.5;
const IOU_THRESHOLD: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detector model missing: {0}")]
    ModelMissing(String),
    #[error("unexpected detector output: {0}")]
    BadOutput(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Finds the face to use in a full frame.
pub trait FaceLocalizer {
    /// Return the detector's first face, or `None` when the frame has no face.
    fn locate(&mut self, image: &RgbImage) -> Result<Option<BoundingBox>, RosterError>;
}

/// Scale and padding applied when fitting a frame into the square model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    resized_w: u32,
    resized_h: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, target: u32) -> Self {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let resized_w = ((width as f32 * scale).round() as u32).clamp(1, target);
        let resized_h = ((height as f32 * scale).round() as u32).clamp(1, target);
        Self {
            scale,
            pad_x: (target - resized_w) as f32 / 2.0,
            pad_y: (target - resized_h) as f32 / 2.0,
            resized_w,
            resized_h,
        }
    }

    /// Map a point from model-input space back to the source frame.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Positions of the score, box and keypoint tensors of one stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideOutputs {
    score: usize,
    bbox: usize,
    kps: usize,
}

impl StrideOutputs {
    const fn at(score: usize, bbox: usize, kps: usize) -> Self {
        Self { score, bbox, kps }
    }
}

/// Tensor layout shipped by the insightface exports: all scores, then all
/// boxes, then all keypoints, each ordered by stride.
const POSITIONAL_LAYOUT: [StrideOutputs; 3] = [
    StrideOutputs::at(0, 3, 6),
    StrideOutputs::at(1, 4, 7),
    StrideOutputs::at(2, 5, 8),
];

/// Resolve the per-stride outputs, preferring `score_8`-style tensor names.
fn output_layout(names: &[String]) -> [StrideOutputs; 3] {
    let position = |kind: &str, stride: usize| {
        let wanted = format!("{kind}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let mut layout = POSITIONAL_LAYOUT;
    for (slot, &stride) in STRIDES.iter().enumerate() {
        let (Some(score), Some(bbox), Some(kps)) =
            (position("score", stride), position("bbox", stride), position("kps", stride))
        else {
            tracing::debug!(?names, "unnamed SCRFD outputs; assuming positional layout");
            return POSITIONAL_LAYOUT;
        };
        layout[slot] = StrideOutputs { score, bbox, kps };
    }
    layout
}

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Session,
    layout: [StrideOutputs; 3],
}

impl ScrfdDetector {
    /// Load an SCRFD export (e.g. `det_10g.onnx`).
    pub fn load(model_path: &str, intra_threads: usize) -> Result<Self, DetectorError> {
        if !Path::new(model_path).is_file() {
            return Err(DetectorError::ModelMissing(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(DetectorError::BadOutput(format!(
                "expected score/bbox/kps tensors for 3 strides, model has {} outputs",
                names.len()
            )));
        }

        let layout = output_layout(&names);
        tracing::info!(path = model_path, outputs = ?names, ?layout, "SCRFD detector ready");

        Ok(Self { session, layout })
    }

    /// Detect faces in an RGB frame, highest confidence first.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) = preprocess(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut raw = Vec::new();
        for (&stride, slots) in STRIDES.iter().zip(self.layout) {
            let (_, scores) = outputs[slots.score]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::BadOutput(format!("score_{stride}: {e}")))?;
            let (_, bboxes) = outputs[slots.bbox]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::BadOutput(format!("bbox_{stride}: {e}")))?;
            let (_, kps) = outputs[slots.kps]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::BadOutput(format!("kps_{stride}: {e}")))?;

            let level = StrideLevel { stride, scores, bboxes, kps };
            raw.extend(level.decode(&letterbox, SCORE_THRESHOLD));
        }

        let faces = nms(raw, IOU_THRESHOLD);
        tracing::debug!(
            faces = faces.len(),
            width = image.width(),
            height = image.height(),
            "SCRFD pass"
        );
        Ok(faces)
    }
}

impl FaceLocalizer for ScrfdDetector {
    fn locate(&mut self, image: &RgbImage) -> Result<Option<BoundingBox>, RosterError> {
        Ok(self.detect(image)?.into_iter().next())
    }
}

/// Letterbox an RGB frame into a normalized 1×3×640×640 tensor.
///
/// Padding stays at 0.0, which is where the mean normalizes to.
fn preprocess(image: &RgbImage) -> (Array4<f32>, Letterbox) {
    let letterbox = Letterbox::fit(image.width(), image.height(), INPUT_EDGE);
    let (w, h) = (letterbox.resized_w, letterbox.resized_h);
    let resized = imageops::resize(image, w, h, FilterType::Triangle);

    let edge = INPUT_EDGE as usize;
    let left = letterbox.pad_x.floor() as usize;
    let top = letterbox.pad_y.floor() as usize;

    let mut tensor = Array4::<f32>::zeros((1, 3, edge, edge));
    for (x, y, px) in resized.enumerate_pixels() {
        for (c, &v) in px.0.iter().enumerate() {
            let (row, col) = (top + y as usize, left + x as usize);
            tensor[[0, c, row, col]] = (v as f32 - PIXEL_MEAN) * PIXEL_SCALE;
        }
    }

    (tensor, letterbox)
}

/// Raw outputs for one stride level of the feature pyramid.
struct StrideLevel<'a> {
    stride: usize,
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

impl StrideLevel<'_> {
    /// Boxes scoring above `threshold`, in source-frame coordinates.
    fn decode(&self, letterbox: &Letterbox, threshold: f32) -> Vec<BoundingBox> {
        let cols = INPUT_EDGE as usize / self.stride;
        let step = self.stride as f32;

        self.scores
            .iter()
            .take(cols * cols * ANCHORS_PER_CELL)
            .enumerate()
            .filter(|&(_, &score)| score > threshold)
            .filter_map(|(anchor, &score)| {
                let d = self.bboxes.get(anchor * 4..anchor * 4 + 4)?;
                let cell = anchor / ANCHORS_PER_CELL;
                let cx = (cell % cols) as f32 * step;
                let cy = (cell / cols) as f32 * step;

                let (left, top) = letterbox.unmap(cx - d[0] * step, cy - d[1] * step);
                let (right, bottom) = letterbox.unmap(cx + d[2] * step, cy + d[3] * step);
                let landmarks = self.kps.get(anchor * 10..anchor * 10 + 10).map(|k| {
                    std::array::from_fn(|i| {
                        letterbox.unmap(cx + k[2 * i] * step, cy + k[2 * i + 1] * step)
                    })
                });

                Some(BoundingBox {
                    x: left,
                    y: top,
                    width: right - left,
                    height: bottom - top,
                    confidence: score,
                    landmarks,
                })
            })
            .collect()
    }
}

/// Greedy non-maximum suppression; survivors come out most confident first.
fn nms(mut boxes: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        if !kept.iter().any(|k| overlap(k, &candidate) > iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

/// Intersection over union.
fn overlap(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let shared = w * h;
    let total = a.width * a.height + b.width * b.height - shared;
    if total > 0.0 {
        shared / total
    } else {
        0.0
    }
}
