//! The operations exposed to service layers: enroll, identify, mark attendance.

use crate::attendance::{self, AttendanceRecord, AttendanceSession, MarkOutcome};
use crate::decode::ImagePayload;
use crate::detector::FaceLocalizer;
use crate::enrollment::{EnrollmentImages, EnrollmentPipeline, EnrollmentResult};
use crate::error::RosterError;
use crate::matcher::{CosineMatcher, MatchResult, Matcher, NotRecognized, DEFAULT_THRESHOLD};
use crate::pipeline::FacePipeline;
use crate::recognizer::FaceEmbedder;
use crate::store::{AttendanceStore, EnrollmentStore};
use crate::types::{Identity, MIN_SIMILARITY};

const MANUAL_CONFIDENCE: f32 = 1.0;

/// Face-identity attendance engine.
///
/// Holds the loaded models and the two store adapters; no identity data is
/// cached between calls.
pub struct AttendanceEngine<L, E, S, A> {
    faces: FacePipeline<L, E>,
    enrollments: S,
    attendance: A,
    threshold: f32,
}

impl<L, E, S, A> AttendanceEngine<L, E, S, A>
where
    L: FaceLocalizer,
    E: FaceEmbedder,
    S: EnrollmentStore,
    A: AttendanceStore,
{
    pub fn new(faces: FacePipeline<L, E>, enrollments: S, attendance: A) -> Self {
        Self {
            faces,
            enrollments,
            attendance,
            threshold: DEFAULT_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Enroll (or re-enroll) an identity from up to three pose images.
    pub fn enroll(
        &mut self,
        identity: Identity,
        images: EnrollmentImages,
    ) -> Result<EnrollmentResult, RosterError> {
        let mut attempt = EnrollmentPipeline::new(identity, images)?;
        attempt.run(&mut self.faces, &self.enrollments)
    }

    /// Identify the face in `image` against every enrolled identity.
    ///
    /// Undecodable payloads are `InvalidInput`. Localization and extraction
    /// failures degrade to a not-recognized result; store failures surface.
    pub fn identify(&mut self, image: &ImagePayload) -> Result<MatchResult, RosterError> {
        let raster = image.decode()?;

        let query = match self.faces.extract(&raster) {
            Ok(Some(sample)) => sample.embedding,
            Ok(None) => {
                return Ok(MatchResult::not_recognized(NotRecognized::NoFace, MIN_SIMILARITY));
            }
            Err(e) => {
                tracing::warn!(error = %e, "face extraction failed; reporting not recognized");
                return Ok(MatchResult::not_recognized(
                    NotRecognized::ExtractionFailed,
                    MIN_SIMILARITY,
                ));
            }
        };

        let candidates = self.enrollments.load_candidates()?;
        let result = CosineMatcher.compare(&query, &candidates, self.threshold);

        match &result.identity {
            Some(identity) => {
                tracing::info!(identity = %identity.id, score = result.score, "identified")
            }
            None => tracing::info!(score = result.score, reason = ?result.reason, "not recognized"),
        }

        Ok(result)
    }

    /// Start an attendance window and log it with the attendance store.
    pub fn begin_session(&self, course: Option<String>) -> Result<AttendanceSession, RosterError> {
        let session = AttendanceSession::new(course);
        self.attendance.log_session(&session)?;
        tracing::info!(
            session = %session.id(),
            course = ?session.course(),
            "attendance session started"
        );
        Ok(session)
    }

    /// Record the identity of an accepted match, at most once per session.
    pub fn mark_attendance(
        &self,
        session: &mut AttendanceSession,
        result: &MatchResult,
    ) -> Result<MarkOutcome, RosterError> {
        attendance::mark_match(&self.attendance, session, result)
    }

    /// Mark an enrolled identity present by id, without a face.
    ///
    /// Manual marks carry confidence 1.0 and obey the once-per-session rule.
    pub fn mark_identity(
        &self,
        session: &mut AttendanceSession,
        id: &str,
    ) -> Result<MarkOutcome, RosterError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(RosterError::invalid_input("identity id is empty"));
        }

        let identity = self
            .enrollments
            .find_identity(id)?
            .ok_or_else(|| RosterError::UnknownIdentity(id.to_string()))?;
        attendance::mark(&self.attendance, session, &identity, MANUAL_CONFIDENCE)
    }

    /// Identify the face in `image` and mark it present in `session`.
    pub fn attend(
        &mut self,
        session: &mut AttendanceSession,
        image: &ImagePayload,
    ) -> Result<(MatchResult, MarkOutcome), RosterError> {
        let result = self.identify(image)?;
        let outcome = self.mark_attendance(session, &result)?;
        Ok((result, outcome))
    }

    /// Remove the newest attendance record.
    pub fn delete_last_attendance(&self) -> Result<Option<AttendanceRecord>, RosterError> {
        let deleted = self.attendance.delete_most_recent()?;
        match &deleted {
            Some(record) => tracing::info!(
                identity = %record.identity.id,
                time = %record.timestamp,
                "deleted last attendance record"
            ),
            None => tracing::info!("no attendance record to delete"),
        }
        Ok(deleted)
    }
}
