//! Session-scoped attendance marking.
//!
//! An [`AttendanceSession`] is one continuous capture window. Each identity
//! is recorded at most once per session; the marked set lives only as long
//! as the session value and is never persisted.

use crate::error::RosterError;
use crate::matcher::MatchResult;
use crate::store::AttendanceStore;
use crate::types::Identity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "present" => Some(AttendanceStatus::Present),
            _ => None,
        }
    }
}

/// Immutable presence record for one identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    pub identity: Identity,
    pub timestamp: DateTime<Utc>,
    /// Similarity score of the match that produced this record.
    pub confidence: f32,
    pub status: AttendanceStatus,
}

/// Live attendance window.
#[derive(Debug)]
pub struct AttendanceSession {
    id: Uuid,
    course: Option<String>,
    started_at: DateTime<Utc>,
    marked: HashSet<String>,
}

impl AttendanceSession {
    pub fn new(course: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            course,
            started_at: Utc::now(),
            marked: HashSet::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn course(&self) -> Option<&str> {
        self.course.as_deref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn is_marked(&self, identity_id: &str) -> bool {
        self.marked.contains(identity_id)
    }

    pub fn marked_count(&self) -> usize {
        self.marked.len()
    }

    /// Start a fresh window: new id, new start time, nobody marked.
    pub fn reset(&mut self) {
        self.id = Uuid::new_v4();
        self.started_at = Utc::now();
        self.marked.clear();
    }
}

/// Outcome of a single marking attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MarkOutcome {
    Recorded(AttendanceRecord),
    AlreadyMarked { identity_id: String },
    NotRecognized,
}

/// Record `identity` as present in `session`, unless it already is.
///
/// The identity joins the marked set only once the store accepted the
/// record, so a failed append can be retried within the same session.
pub fn mark<A: AttendanceStore + ?Sized>(
    store: &A,
    session: &mut AttendanceSession,
    identity: &Identity,
    confidence: f32,
) -> Result<MarkOutcome, RosterError> {
    if session.is_marked(&identity.id) {
        tracing::debug!(identity = %identity.id, session = %session.id, "already marked; skipping");
        return Ok(MarkOutcome::AlreadyMarked {
            identity_id: identity.id.clone(),
        });
    }

    let record = AttendanceRecord {
        id: Uuid::new_v4(),
        session_id: session.id,
        identity: identity.clone(),
        timestamp: Utc::now(),
        confidence,
        status: AttendanceStatus::Present,
    };

    store.append(&record)?;
    session.marked.insert(identity.id.clone());

    tracing::info!(
        identity = %identity.id,
        name = %identity.name,
        confidence,
        session = %session.id,
        "attendance recorded"
    );

    Ok(MarkOutcome::Recorded(record))
}

/// Mark the identity of an accepted match; anything else is `NotRecognized`.
pub fn mark_match<A: AttendanceStore + ?Sized>(
    store: &A,
    session: &mut AttendanceSession,
    result: &MatchResult,
) -> Result<MarkOutcome, RosterError> {
    match (&result.identity, result.accepted) {
        (Some(identity), true) => mark(store, session, identity, result.score),
        _ => Ok(MarkOutcome::NotRecognized),
    }
}
