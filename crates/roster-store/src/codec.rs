//! Embedding blobs: packed little-endian `f32`.

use roster_core::{Embedding, StoreError};

pub(crate) fn encode_embedding(embedding: &Embedding) -> Vec<u8> {
    embedding
        .values()
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect()
}

pub(crate) fn decode_embedding(
    blob: &[u8],
    model_version: Option<String>,
) -> Result<Embedding, StoreError> {
    if blob.is_empty() || blob.len() % 4 != 0 {
        return Err(StoreError::Corrupt(format!(
            "embedding blob of {} bytes is not a non-empty f32 array",
            blob.len()
        )));
    }

    let values = blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    Ok(Embedding::new(values).with_model_version(model_version))
}
