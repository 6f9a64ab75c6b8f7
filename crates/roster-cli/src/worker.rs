use crate::config::Config;
use chrono::{DateTime, Utc};
use image::RgbImage;
use roster_core::{
    AttendanceEngine, AttendanceRecord, AttendanceSession, AttendanceStore, BoundingBox,
    Embedding, EnrollmentImages, EnrollmentResult, EnrollmentStore, FaceEmbedder, FaceLocalizer,
    FaceNetEmbedder, FacePipeline, Identity, ImagePayload, MarkOutcome, MatchResult, RosterError,
    ScrfdDetector,
};
use roster_store::SqliteStore;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Roster(#[from] RosterError),
    #[error("no attendance session is open")]
    NoActiveSession,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

impl WorkerError {
    /// Whether the failure concerns only the request's own input, so later
    /// requests can still succeed.
    pub fn is_per_request(&self) -> bool {
        matches!(
            self,
            Self::Roster(
                RosterError::InvalidInput(_)
                    | RosterError::NoFaceDetected { .. }
                    | RosterError::UnknownIdentity(_)
            )
        )
    }
}

/// Summary of the live attendance session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub course: Option<String>,
    pub started_at: DateTime<Utc>,
    pub marked: usize,
}

impl From<&AttendanceSession> for SessionInfo {
    fn from(session: &AttendanceSession) -> Self {
        Self {
            id: session.id(),
            course: session.course().map(str::to_string),
            started_at: session.started_at(),
            marked: session.marked_count(),
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, WorkerError>>;

/// Messages sent from the command layer to the engine thread.
enum EngineRequest {
    Enroll {
        identity: Identity,
        images: EnrollmentImages,
        reply: Reply<EnrollmentResult>,
    },
    Identify {
        image: ImagePayload,
        reply: Reply<MatchResult>,
    },
    BeginSession {
        course: Option<String>,
        reply: Reply<SessionInfo>,
    },
    Attend {
        image: ImagePayload,
        reply: Reply<(MatchResult, MarkOutcome)>,
    },
    Mark {
        id: String,
        reply: Reply<MarkOutcome>,
    },
    Undo {
        reply: Reply<Option<AttendanceRecord>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> EngineRequest,
    ) -> Result<T, WorkerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| WorkerError::ChannelClosed)?;
        reply_rx.await.map_err(|_| WorkerError::ChannelClosed)?
    }

    pub async fn enroll(
        &self,
        identity: Identity,
        images: EnrollmentImages,
    ) -> Result<EnrollmentResult, WorkerError> {
        self.request(|reply| EngineRequest::Enroll {
            identity,
            images,
            reply,
        })
        .await
    }

    pub async fn identify(&self, image: ImagePayload) -> Result<MatchResult, WorkerError> {
        self.request(|reply| EngineRequest::Identify { image, reply })
            .await
    }

    /// Open a new attendance session, replacing any live one.
    pub async fn begin_session(&self, course: Option<String>) -> Result<SessionInfo, WorkerError> {
        self.request(|reply| EngineRequest::BeginSession { course, reply })
            .await
    }

    /// Identify and mark present in the live session.
    pub async fn attend(
        &self,
        image: ImagePayload,
    ) -> Result<(MatchResult, MarkOutcome), WorkerError> {
        self.request(|reply| EngineRequest::Attend { image, reply })
            .await
    }

    /// Mark an enrolled identity present in the live session by id.
    pub async fn mark(&self, id: impl Into<String>) -> Result<MarkOutcome, WorkerError> {
        let id = id.into();
        self.request(|reply| EngineRequest::Mark { id, reply }).await
    }

    /// Delete the newest attendance record.
    pub async fn undo(&self) -> Result<Option<AttendanceRecord>, WorkerError> {
        self.request(|reply| EngineRequest::Undo { reply }).await
    }
}

/// Load both ONNX models and spawn the engine thread over `store`.
///
/// Fails fast if either model cannot be loaded.
pub fn spawn_engine(config: &Config, store: Arc<SqliteStore>) -> Result<EngineHandle, WorkerError> {
    let detector_path = config.detector_model_path();
    let detector = ScrfdDetector::load(&detector_path.to_string_lossy(), config.intra_threads)
        .map_err(RosterError::from)?;
    tracing::info!(path = %detector_path.display(), "SCRFD detector loaded");

    let embedder_path = config.embedder_model_path();
    let embedder = FaceNetEmbedder::load(&embedder_path.to_string_lossy(), config.intra_threads)
        .map_err(RosterError::from)?;
    tracing::info!(path = %embedder_path.display(), "FaceNet embedder loaded");

    let faces = FacePipeline::new(detector, embedder);
    let engine = AttendanceEngine::new(faces, store.clone(), store)
        .with_threshold(config.similarity_threshold);

    spawn_worker(engine)
}

/// Stands in for both models when a command never looks at a face.
pub struct Unloaded;

impl FaceLocalizer for Unloaded {
    fn locate(&mut self, _image: &RgbImage) -> Result<Option<BoundingBox>, RosterError> {
        Err(RosterError::invalid_input("face models are not loaded"))
    }
}

impl FaceEmbedder for Unloaded {
    fn embed(&mut self, _face: &RgbImage) -> Result<Embedding, RosterError> {
        Err(RosterError::invalid_input("face models are not loaded"))
    }
}

/// Spawn the engine thread without loading models, for record keeping only.
pub fn spawn_records_engine(
    config: &Config,
    store: Arc<SqliteStore>,
) -> Result<EngineHandle, WorkerError> {
    let faces = FacePipeline::new(Unloaded, Unloaded);
    let engine = AttendanceEngine::new(faces, store.clone(), store)
        .with_threshold(config.similarity_threshold);
    spawn_worker(engine)
}

/// Run `engine` on a dedicated OS thread that serializes every request.
pub fn spawn_worker<L, E, S, A>(
    mut engine: AttendanceEngine<L, E, S, A>,
) -> Result<EngineHandle, WorkerError>
where
    L: FaceLocalizer + Send + 'static,
    E: FaceEmbedder + Send + 'static,
    S: EnrollmentStore + Send + 'static,
    A: AttendanceStore + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("roster-engine".into())
        .spawn(move || {
            tracing::info!(threshold = engine.threshold(), "engine thread started");
            let mut session: Option<AttendanceSession> = None;

            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Enroll {
                        identity,
                        images,
                        reply,
                    } => {
                        let _ = reply.send(engine.enroll(identity, images).map_err(Into::into));
                    }
                    EngineRequest::Identify { image, reply } => {
                        let _ = reply.send(engine.identify(&image).map_err(Into::into));
                    }
                    EngineRequest::BeginSession { course, reply } => {
                        let result = engine.begin_session(course).map(|s| {
                            let info = SessionInfo::from(&s);
                            session = Some(s);
                            info
                        });
                        let _ = reply.send(result.map_err(Into::into));
                    }
                    EngineRequest::Attend { image, reply } => {
                        let result = match session.as_mut() {
                            Some(live) => engine.attend(live, &image).map_err(Into::into),
                            None => Err(WorkerError::NoActiveSession),
                        };
                        let _ = reply.send(result);
                    }
                    EngineRequest::Mark { id, reply } => {
                        let result = match session.as_mut() {
                            Some(live) => engine.mark_identity(live, &id).map_err(Into::into),
                            None => Err(WorkerError::NoActiveSession),
                        };
                        let _ = reply.send(result);
                    }
                    EngineRequest::Undo { reply } => {
                        let _ = reply.send(engine.delete_last_attendance().map_err(Into::into));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(WorkerError::Spawn)?;

    Ok(EngineHandle { tx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{png, stub_engine};
    use roster_core::NotRecognized;

    async fn enroll_asha(engine: &EngineHandle) -> Identity {
        let student = Identity::new("S1", "Asha", "CS101");
        let enrolled = engine
            .enroll(student.clone(), EnrollmentImages::center_only(png([200, 40, 40])))
            .await
            .unwrap();
        assert!(enrolled.is_accepted());
        student
    }

    #[tokio::test]
    async fn test_enroll_then_identify() {
        let (engine, _store) = stub_engine();
        let student = enroll_asha(&engine).await;

        let result = engine.identify(png([200, 40, 40])).await.unwrap();
        assert!(result.accepted);
        assert_eq!(result.identity, Some(student));
    }

    #[tokio::test]
    async fn test_identify_empty_store() {
        let (engine, _store) = stub_engine();
        let result = engine.identify(png([10, 200, 10])).await.unwrap();
        assert!(!result.accepted);
        assert_eq!(result.reason, Some(NotRecognized::NoCandidates));
    }

    #[tokio::test]
    async fn test_attend_requires_session() {
        let (engine, _store) = stub_engine();
        let err = engine.attend(png([10, 200, 10])).await.unwrap_err();
        assert!(matches!(err, WorkerError::NoActiveSession));
        assert!(!err.is_per_request());
    }

    #[tokio::test]
    async fn test_attend_marks_once_per_session() {
        let (engine, store) = stub_engine();
        enroll_asha(&engine).await;

        let info = engine.begin_session(Some("CS101".into())).await.unwrap();
        assert_eq!(info.marked, 0);

        let (_, first) = engine.attend(png([200, 40, 40])).await.unwrap();
        let (_, second) = engine.attend(png([200, 40, 40])).await.unwrap();
        assert!(matches!(first, MarkOutcome::Recorded(_)));
        assert!(matches!(second, MarkOutcome::AlreadyMarked { .. }));
        assert_eq!(store.list_attendance(None).unwrap().len(), 1);

        engine.begin_session(Some("CS101".into())).await.unwrap();
        let (_, third) = engine.attend(png([200, 40, 40])).await.unwrap();
        assert!(matches!(third, MarkOutcome::Recorded(_)));
        assert_eq!(store.list_attendance(None).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_payload_surfaces() {
        let (engine, _store) = stub_engine();
        let err = engine
            .identify(ImagePayload::Encoded(vec![1, 2, 3]))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Roster(RosterError::InvalidInput(_))));
        assert!(err.is_per_request());
    }

    #[tokio::test]
    async fn test_mark_by_roll_in_session() {
        let (engine, store) = stub_engine();
        enroll_asha(&engine).await;

        assert!(matches!(
            engine.mark("S1").await.unwrap_err(),
            WorkerError::NoActiveSession
        ));

        engine.begin_session(None).await.unwrap();
        assert!(matches!(engine.mark("S1").await.unwrap(), MarkOutcome::Recorded(_)));
        assert!(matches!(
            engine.mark("S1").await.unwrap(),
            MarkOutcome::AlreadyMarked { .. }
        ));

        let unknown = engine.mark("S404").await.unwrap_err();
        assert!(matches!(
            unknown,
            WorkerError::Roster(RosterError::UnknownIdentity(_))
        ));
        assert!(unknown.is_per_request());
        assert_eq!(store.list_attendance(None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_undo_deletes_newest_record() {
        let (engine, store) = stub_engine();
        enroll_asha(&engine).await;
        engine.begin_session(None).await.unwrap();
        engine.mark("S1").await.unwrap();

        let deleted = engine.undo().await.unwrap().unwrap();
        assert_eq!(deleted.identity.id, "S1");
        assert!(store.list_attendance(None).unwrap().is_empty());
        assert!(engine.undo().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_records_engine_marks_without_models() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let asha = Identity::new("S1", "Asha", "CS101");
        let pose = Embedding::new(vec![1.0, 0.0]);
        store
            .save_embeddings(
                &asha,
                &roster_core::PoseEmbeddings {
                    center: pose.clone(),
                    left: pose.clone(),
                    right: pose,
                },
            )
            .unwrap();

        let engine = spawn_records_engine(&Config::default(), store.clone()).unwrap();
        engine.begin_session(None).await.unwrap();
        assert!(matches!(engine.mark("S1").await.unwrap(), MarkOutcome::Recorded(_)));

        let result = engine.identify(png([1, 2, 3])).await.unwrap();
        assert_eq!(result.reason, Some(NotRecognized::ExtractionFailed));
        assert_eq!(engine.undo().await.unwrap().map(|r| r.identity), Some(asha));
    }
}
