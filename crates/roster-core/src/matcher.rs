//! Nearest-neighbour identity matching over a candidate set.

use crate::types::{Candidate, Embedding, Identity, MIN_SIMILARITY};
use serde::{Deserialize, Serialize};

/// Similarity a query must exceed to be accepted.
pub const DEFAULT_THRESHOLD: f32 = 0.6;

/// Why an identification did not produce an accepted match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotRecognized {
    NoFace,
    NoCandidates,
    BelowThreshold,
    ExtractionFailed,
}

/// Result of matching a query embedding against the candidate set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub accepted: bool,
    /// Cosine similarity of the best candidate embedding [-1, 1].
    pub score: f32,
    /// Matched identity; only set when `accepted`.
    pub identity: Option<Identity>,
    pub reason: Option<NotRecognized>,
}

impl MatchResult {
    pub fn not_recognized(reason: NotRecognized, score: f32) -> Self {
        Self {
            accepted: false,
            score,
            identity: None,
            reason: Some(reason),
        }
    }
}

/// Strategy for comparing a query embedding against enrolled candidates.
pub trait Matcher {
    fn compare(&self, query: &Embedding, candidates: &[Candidate], threshold: f32) -> MatchResult;
}

/// Exhaustive cosine-similarity scan.
///
/// Candidates are visited in ascending identity order regardless of how the
/// store enumerated them; the first strictly-best score wins ties.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(&self, query: &Embedding, candidates: &[Candidate], threshold: f32) -> MatchResult {
        let mut ordered: Vec<&Candidate> = candidates.iter().collect();
        ordered.sort_by(|a, b| a.identity.id.cmp(&b.identity.id));

        let mut best_sim = MIN_SIMILARITY;
        let mut best: Option<&Candidate> = None;
        let mut compared = 0usize;

        for candidate in ordered {
            for stored in &candidate.embeddings {
                compared += 1;
                let sim = query.similarity(stored);
                if sim > best_sim {
                    best_sim = sim;
                    best = Some(candidate);
                }
            }
        }

        tracing::debug!(
            candidates = candidates.len(),
            compared,
            best_score = best_sim,
            best_id = best.map(|c| c.identity.id.as_str()),
            "similarity scan complete"
        );

        if compared == 0 {
            return MatchResult::not_recognized(NotRecognized::NoCandidates, MIN_SIMILARITY);
        }

        match best {
            Some(candidate) if best_sim > threshold => MatchResult {
                accepted: true,
                score: best_sim,
                identity: Some(candidate.identity.clone()),
                reason: None,
            },
            _ => MatchResult::not_recognized(NotRecognized::BelowThreshold, best_sim),
        }
    }
}
