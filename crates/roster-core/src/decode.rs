//! Image payload decoding: base64 (optionally data-URL prefixed) or raw bytes.

use crate::error::RosterError;
use base64::Engine as _;
use image::RgbImage;

/// Compressed image as it arrives from a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImagePayload {
    /// Base64 text, with or without a `data:image/...;base64,` prefix.
    Base64(String),
    /// Encoded file bytes (JPEG, PNG, ...).
    Encoded(Vec<u8>),
}

impl ImagePayload {
    pub fn is_empty(&self) -> bool {
        match self {
            ImagePayload::Base64(s) => s.trim().is_empty(),
            ImagePayload::Encoded(b) => b.is_empty(),
        }
    }

    /// Decode into an RGB raster.
    pub fn decode(&self) -> Result<RgbImage, RosterError> {
        match self {
            ImagePayload::Base64(s) => decode_base64_image(s),
            ImagePayload::Encoded(b) => decode_image_bytes(b),
        }
    }
}

impl From<String> for ImagePayload {
    fn from(s: String) -> Self {
        ImagePayload::Base64(s)
    }
}

impl From<&str> for ImagePayload {
    fn from(s: &str) -> Self {
        ImagePayload::Base64(s.to_string())
    }
}

impl From<Vec<u8>> for ImagePayload {
    fn from(bytes: Vec<u8>) -> Self {
        ImagePayload::Encoded(bytes)
    }
}

/// Drop everything up to and including the first comma (data-URL header).
fn strip_data_url(payload: &str) -> &str {
    let payload = payload.trim();
    match payload.split_once(',') {
        Some((_, body)) => body.trim(),
        None => payload,
    }
}

pub fn decode_base64_image(payload: &str) -> Result<RgbImage, RosterError> {
    // Wrapped output (e.g. `base64` at 76 columns) carries newlines.
    let body: String = strip_data_url(payload)
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    if body.is_empty() {
        return Err(RosterError::invalid_input("empty image payload"));
    }

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&body)
        .map_err(|e| RosterError::invalid_input(format!("base64: {e}")))?;

    decode_image_bytes(&bytes)
}

pub fn decode_image_bytes(bytes: &[u8]) -> Result<RgbImage, RosterError> {
    if bytes.is_empty() {
        return Err(RosterError::invalid_input("empty image payload"));
    }

    let image = image::load_from_memory(bytes)
        .map_err(|e| RosterError::invalid_input(format!("undecodable image: {e}")))?
        .to_rgb8();

    if image.width() == 0 || image.height() == 0 {
        return Err(RosterError::invalid_input("image has zero size"));
    }

    Ok(image)
}
