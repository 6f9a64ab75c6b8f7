//! Storage adapters consumed by the engine.
//!
//! The engine never caches what these return: candidates are reloaded on
//! every identification, and failures are surfaced to the caller as-is.

use crate::attendance::{AttendanceRecord, AttendanceSession};
use crate::types::{Candidate, Identity, PoseEmbeddings};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store backend: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("corrupt stored record: {0}")]
    Corrupt(String),
}

/// Source of enrolled identities and sink for their embeddings.
pub trait EnrollmentStore {
    /// Every enrolled identity with its embeddings, in a stable order.
    fn load_candidates(&self) -> Result<Vec<Candidate>, StoreError>;

    /// Replace all pose embeddings of `identity`, creating it if needed.
    fn save_embeddings(
        &self,
        identity: &Identity,
        embeddings: &PoseEmbeddings,
    ) -> Result<(), StoreError>;

    /// The enrolled identity keyed by `id`, if any.
    fn find_identity(&self, id: &str) -> Result<Option<Identity>, StoreError> {
        Ok(self
            .load_candidates()?
            .into_iter()
            .map(|c| c.identity)
            .find(|identity| identity.id == id))
    }
}

/// Append-only log of attendance records.
pub trait AttendanceStore {
    fn append(&self, record: &AttendanceRecord) -> Result<(), StoreError>;

    /// Remove and return the newest record, if any.
    fn delete_most_recent(&self) -> Result<Option<AttendanceRecord>, StoreError>;

    /// Note the start of an attendance session.
    fn log_session(&self, _session: &AttendanceSession) -> Result<(), StoreError> {
        Ok(())
    }
}

impl<T: EnrollmentStore + ?Sized> EnrollmentStore for Arc<T> {
    fn load_candidates(&self) -> Result<Vec<Candidate>, StoreError> {
        (**self).load_candidates()
    }

    fn save_embeddings(
        &self,
        identity: &Identity,
        embeddings: &PoseEmbeddings,
    ) -> Result<(), StoreError> {
        (**self).save_embeddings(identity, embeddings)
    }

    fn find_identity(&self, id: &str) -> Result<Option<Identity>, StoreError> {
        (**self).find_identity(id)
    }
}

impl<T: AttendanceStore + ?Sized> AttendanceStore for Arc<T> {
    fn append(&self, record: &AttendanceRecord) -> Result<(), StoreError> {
        (**self).append(record)
    }

    fn delete_most_recent(&self) -> Result<Option<AttendanceRecord>, StoreError> {
        (**self).delete_most_recent()
    }

    fn log_session(&self, session: &AttendanceSession) -> Result<(), StoreError> {
        (**self).log_session(session)
    }
}
