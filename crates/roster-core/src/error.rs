use crate::detector::DetectorError;
use crate::recognizer::RecognizerError;
use crate::store::StoreError;
use crate::types::Pose;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RosterError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("no face detected in {pose} image")]
    NoFaceDetected { pose: Pose },
    #[error("no enrolled identity with id {0:?}")]
    UnknownIdentity(String),
    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
}

impl RosterError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}
